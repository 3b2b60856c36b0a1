//! Application Services
//!
//! Streaming readers and writers built on the [`StorageTransport`] port.
//!
//! - [`RangeReader`]: one byte range over a bidi read stream
//! - [`MultiRangeDownloader`]: many ranges multiplexed on one stream
//! - [`ObjectWriter`]: resumable, one-shot and appendable uploads
//! - [`StorageClient`]: entry point that builds the above
//!
//! [`StorageTransport`]: crate::application::ports::StorageTransport

mod client;
mod multi_range;
mod read_stream;
mod reader;
mod writer;

pub use client::{ObjectHandle, StorageClient};
pub use multi_range::{MultiRangeDownloader, PendingRange, RangeOutcome};
pub use read_stream::MAX_RANGES_PER_REQUEST;
pub use reader::{RangeReader, ReaderAttrs};
pub use writer::{
    DEFAULT_CHUNK_SIZE, MAX_WRITE_CHUNK_BYTES, ObjectWriter, ProgressFn, WRITE_CHUNK_ALIGNMENT,
    WriterOptions,
};

use tokio_util::sync::CancellationToken;

use crate::application::ports::RequestParams;
use crate::domain::object::EncryptionKey;
use crate::infrastructure::grpc::proto::CommonObjectRequestParams;
use crate::infrastructure::retry::{BackoffConfig, Retrier};

/// Settings applied to every call made by a client.
#[derive(Debug, Clone, Default)]
pub struct CallSettings {
    /// Project billed for requests.
    pub user_project: Option<String>,
    /// Retry backoff.
    pub backoff: BackoffConfig,
    /// Cancels retry waits and pending stream receives.
    pub cancel: CancellationToken,
}

impl CallSettings {
    pub(crate) fn retrier(&self) -> Retrier {
        Retrier::new(self.backoff.clone(), self.cancel.clone())
    }

    pub(crate) fn request_params(
        &self,
        bucket_resource: String,
        routing_token: Option<String>,
    ) -> RequestParams {
        RequestParams::for_bucket(bucket_resource)
            .with_routing_token(routing_token)
            .with_user_project(self.user_project.clone())
    }
}

pub(crate) fn common_params(key: Option<&EncryptionKey>) -> Option<CommonObjectRequestParams> {
    key.map(|key| CommonObjectRequestParams {
        encryption_algorithm: EncryptionKey::ALGORITHM.to_string(),
        encryption_key_bytes: bytes::Bytes::copy_from_slice(key.as_bytes()),
        encryption_key_sha256_bytes: bytes::Bytes::copy_from_slice(&key.sha256()),
    })
}
