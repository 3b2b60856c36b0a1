//! Storage Errors
//!
//! The error type shared by readers, writers and the transport port.
//! Cloneable so one failure can complete many pending ranges.

use std::sync::Arc;

use tonic::{Code, Status};

use crate::domain::object::ValidationError;
use crate::infrastructure::retry;
use crate::infrastructure::wire::WireError;

/// Errors returned by streaming operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StorageError {
    /// The server returned a gRPC status.
    #[error("rpc failed: {0}")]
    Rpc(#[from] Status),

    /// The object does not exist.
    #[error("object not found: {bucket}/{object}")]
    ObjectNotFound {
        /// Bucket name.
        bucket: String,
        /// Object name.
        object: String,
    },

    /// A response could not be decoded.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// Received data does not match its CRC32C.
    #[error("checksum mismatch: got {got:#010x}, want {want:#010x}")]
    ChecksumMismatch {
        /// Computed checksum.
        got: u32,
        /// Server checksum.
        want: u32,
    },

    /// The reader was closed.
    #[error("reader is closed")]
    ReaderClosed,

    /// The stream was closed before the operation finished.
    #[error("stream closed early")]
    StreamClosed,

    /// Caller input was rejected before any request was sent.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The server reports a persisted size outside the resendable window.
    #[error(
        "persisted offset {persisted} is outside the resendable window [{buffer_start}, {sent}]"
    )]
    PersistedOffsetMismatch {
        /// Offset the server reported.
        persisted: i64,
        /// Offset of the first byte still buffered.
        buffer_start: i64,
        /// Offset one past the last byte sent.
        sent: i64,
    },

    /// The stream ended before all expected bytes arrived.
    #[error("stream ended with {remaining} bytes still expected")]
    UnexpectedEof {
        /// Bytes still expected.
        remaining: i64,
    },

    /// Retries ran out.
    #[error("gave up after {attempts} retries: {last}")]
    RetriesExhausted {
        /// Retries taken.
        attempts: u32,
        /// The last failure.
        last: Box<Self>,
    },

    /// The call was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// The server broke the streaming protocol.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The channel could not be established.
    #[error("transport error: {0}")]
    Transport(String),

    /// A multi-range sink rejected a write.
    #[error("sink write failed: {0}")]
    Sink(Arc<std::io::Error>),
}

impl StorageError {
    /// Whether the failed operation may be attempted again.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Rpc(status) => retry::is_retryable_status(status),
            Self::UnexpectedEof { .. } | Self::Transport(_) => true,
            _ => false,
        }
    }

    /// The gRPC status, if this error carries one.
    #[must_use]
    pub const fn status(&self) -> Option<&Status> {
        match self {
            Self::Rpc(status) => Some(status),
            _ => None,
        }
    }

    /// Map a `NotFound` status to [`StorageError::ObjectNotFound`].
    #[must_use]
    pub fn for_object(self, bucket: &str, object: &str) -> Self {
        match self {
            Self::Rpc(status) if status.code() == Code::NotFound => Self::ObjectNotFound {
                bucket: bucket.to_string(),
                object: object.to_string(),
            },
            other => other,
        }
    }
}

impl From<ValidationError> for StorageError {
    fn from(err: ValidationError) -> Self {
        Self::InvalidArgument(err.to_string())
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        Self::Sink(Arc::new(err))
    }
}

impl From<StorageError> for std::io::Error {
    fn from(err: StorageError) -> Self {
        let kind = match &err {
            StorageError::ObjectNotFound { .. } => std::io::ErrorKind::NotFound,
            StorageError::UnexpectedEof { .. } => std::io::ErrorKind::UnexpectedEof,
            StorageError::ChecksumMismatch { .. } | StorageError::Wire(_) => {
                std::io::ErrorKind::InvalidData
            }
            StorageError::InvalidArgument(_) => std::io::ErrorKind::InvalidInput,
            _ => std::io::ErrorKind::Other,
        };
        Self::new(kind, err)
    }
}
