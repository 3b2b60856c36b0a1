//! Protobuf Messages
//!
//! Messages of the Cloud Storage v2 service used by the streaming paths,
//! plus `google.rpc.Status` for decoding error details. Kept in-tree so
//! the crate builds without `protoc` or `buf`.

/// `google.*` packages.
pub mod google {
    /// `google.storage.*` packages.
    pub mod storage {
        /// `google.storage.v2`.
        #[allow(clippy::all, clippy::pedantic, clippy::nursery)]
        pub mod v2 {
            include!("google.storage.v2.rs");
        }
    }

    /// `google.rpc`.
    pub mod rpc {
        /// Rich error model carried in `grpc-status-details-bin`.
        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct Status {
            /// Status code.
            #[prost(int32, tag = "1")]
            pub code: i32,
            /// Developer-facing message.
            #[prost(string, tag = "2")]
            pub message: ::prost::alloc::string::String,
            /// Typed detail messages.
            #[prost(message, repeated, tag = "3")]
            pub details: ::prost::alloc::vec::Vec<::prost_types::Any>,
        }
    }
}

pub use google::storage::v2::*;

/// Fully qualified service name.
pub const STORAGE_SERVICE: &str = "google.storage.v2.Storage";

/// `BidiReadObject` method path.
pub const BIDI_READ_OBJECT_PATH: &str = "/google.storage.v2.Storage/BidiReadObject";

/// `BidiWriteObject` method path.
pub const BIDI_WRITE_OBJECT_PATH: &str = "/google.storage.v2.Storage/BidiWriteObject";

/// `StartResumableWrite` method path.
pub const START_RESUMABLE_WRITE_PATH: &str = "/google.storage.v2.Storage/StartResumableWrite";

/// `QueryWriteStatus` method path.
pub const QUERY_WRITE_STATUS_PATH: &str = "/google.storage.v2.Storage/QueryWriteStatus";

/// Type URL of [`BidiReadObjectRedirectedError`] inside status details.
pub const READ_REDIRECT_TYPE_URL: &str =
    "type.googleapis.com/google.storage.v2.BidiReadObjectRedirectedError";

/// Type URL of [`BidiWriteObjectRedirectedError`] inside status details.
pub const WRITE_REDIRECT_TYPE_URL: &str =
    "type.googleapis.com/google.storage.v2.BidiWriteObjectRedirectedError";

/// Type URL of [`BidiReadObjectError`] inside status details.
pub const READ_OBJECT_ERROR_TYPE_URL: &str =
    "type.googleapis.com/google.storage.v2.BidiReadObjectError";
