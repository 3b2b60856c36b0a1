//! Port Interfaces
//!
//! The contract the streaming services need from a storage backend. The
//! tonic adapter talks to the real service; the in-memory adapter emulates
//! it in-process.
//!
//! ## Driven Ports (Outbound)
//!
//! - `StorageTransport`: the four RPCs used by the streaming paths

use async_trait::async_trait;
use futures::stream::BoxStream;
use tonic::Status;

use crate::infrastructure::grpc::proto::{
    BidiReadObjectRequest, BidiWriteObjectRequest, BidiWriteObjectResponse,
    QueryWriteStatusRequest, QueryWriteStatusResponse, StartResumableWriteRequest,
    StartResumableWriteResponse,
};
use crate::infrastructure::wire::BufferSlice;

/// Undecoded `BidiReadObjectResponse` messages.
pub type RawResponseStream = BoxStream<'static, Result<BufferSlice, Status>>;

/// Decoded `BidiWriteObjectResponse` messages.
pub type WriteResponseStream = BoxStream<'static, Result<BidiWriteObjectResponse, Status>>;

/// Outbound messages of a bidi stream. The stream ending half-closes the
/// call.
pub type RequestStream<T> = BoxStream<'static, T>;

/// Routing metadata sent with every call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestParams {
    /// Bucket resource name (`projects/_/buckets/{bucket}`).
    pub bucket: String,
    /// Routing token from a redirect.
    pub routing_token: Option<String>,
    /// Project billed for the request.
    pub user_project: Option<String>,
}

impl RequestParams {
    /// Params for a bucket resource name.
    #[must_use]
    pub fn for_bucket(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            routing_token: None,
            user_project: None,
        }
    }

    /// Set the routing token.
    #[must_use]
    pub fn with_routing_token(mut self, routing_token: Option<String>) -> Self {
        self.routing_token = routing_token;
        self
    }

    /// Set the billed project.
    #[must_use]
    pub fn with_user_project(mut self, user_project: Option<String>) -> Self {
        self.user_project = user_project;
        self
    }

    /// Value of the `x-goog-request-params` header.
    #[must_use]
    pub fn header_value(&self) -> String {
        match &self.routing_token {
            Some(token) => format!("bucket={}&routing_token={token}", self.bucket),
            None => format!("bucket={}", self.bucket),
        }
    }
}

/// Storage backend used by readers and writers.
#[async_trait]
pub trait StorageTransport: Send + Sync + 'static {
    /// Open a `BidiReadObject` stream. Responses are returned undecoded.
    async fn bidi_read_object(
        &self,
        params: RequestParams,
        requests: RequestStream<BidiReadObjectRequest>,
    ) -> Result<RawResponseStream, Status>;

    /// Open a `BidiWriteObject` stream.
    async fn bidi_write_object(
        &self,
        params: RequestParams,
        requests: RequestStream<BidiWriteObjectRequest>,
    ) -> Result<WriteResponseStream, Status>;

    /// Start a resumable upload session.
    async fn start_resumable_write(
        &self,
        params: RequestParams,
        request: StartResumableWriteRequest,
    ) -> Result<StartResumableWriteResponse, Status>;

    /// Query how much of a resumable upload is persisted.
    async fn query_write_status(
        &self,
        params: RequestParams,
        request: QueryWriteStatusRequest,
    ) -> Result<QueryWriteStatusResponse, Status>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_without_routing_token() {
        let params = RequestParams::for_bucket("projects/_/buckets/b");
        assert_eq!(params.header_value(), "bucket=projects/_/buckets/b");
    }

    #[test]
    fn header_with_routing_token() {
        let params = RequestParams::for_bucket("projects/_/buckets/b")
            .with_routing_token(Some("tok".into()))
            .with_user_project(Some("billing".into()));
        assert_eq!(
            params.header_value(),
            "bucket=projects/_/buckets/b&routing_token=tok"
        );
        assert_eq!(params.user_project.as_deref(), Some("billing"));
    }
}
