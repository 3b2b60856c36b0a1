// Message definitions for the streaming subset of `google/storage/v2/storage.proto`.
// Field numbers match the upstream service definition.

/// Parameters that can be passed to any object request.
#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct CommonObjectRequestParams {
    /// Encryption algorithm used with the customer-supplied key. Only `AES256`.
    #[prost(string, tag = "1")]
    pub encryption_algorithm: ::prost::alloc::string::String,
    /// Raw customer-supplied encryption key.
    #[prost(bytes = "bytes", tag = "4")]
    pub encryption_key_bytes: ::prost::bytes::Bytes,
    /// SHA-256 of the customer-supplied encryption key.
    #[prost(bytes = "bytes", tag = "5")]
    pub encryption_key_sha256_bytes: ::prost::bytes::Bytes,
}

/// Checksums of a complete object.
#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct ObjectChecksums {
    /// CRC32C of the object data.
    #[prost(fixed32, optional, tag = "1")]
    pub crc32c: ::core::option::Option<u32>,
    /// MD5 of the object data (16 bytes when present).
    #[prost(bytes = "bytes", tag = "2")]
    pub md5_hash: ::prost::bytes::Bytes,
}

/// Object content with an optional checksum over exactly this content.
#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct ChecksummedData {
    /// Object data.
    #[prost(bytes = "bytes", tag = "1")]
    pub content: ::prost::bytes::Bytes,
    /// CRC32C of `content`.
    #[prost(fixed32, optional, tag = "2")]
    pub crc32c: ::core::option::Option<u32>,
}

/// Object metadata.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Object {
    /// Object name.
    #[prost(string, tag = "1")]
    pub name: ::prost::alloc::string::String,
    /// Bucket resource name.
    #[prost(string, tag = "2")]
    pub bucket: ::prost::alloc::string::String,
    /// Generation of this object version.
    #[prost(int64, tag = "3")]
    pub generation: i64,
    /// Metadata generation of this object version.
    #[prost(int64, tag = "4")]
    pub metageneration: i64,
    /// Storage class.
    #[prost(string, tag = "5")]
    pub storage_class: ::prost::alloc::string::String,
    /// Content length in bytes.
    #[prost(int64, tag = "6")]
    pub size: i64,
    /// Content-Encoding.
    #[prost(string, tag = "7")]
    pub content_encoding: ::prost::alloc::string::String,
    /// Content-Disposition.
    #[prost(string, tag = "8")]
    pub content_disposition: ::prost::alloc::string::String,
    /// Cache-Control.
    #[prost(string, tag = "9")]
    pub cache_control: ::prost::alloc::string::String,
    /// Content-Language.
    #[prost(string, tag = "11")]
    pub content_language: ::prost::alloc::string::String,
    /// Content-Type.
    #[prost(string, tag = "13")]
    pub content_type: ::prost::alloc::string::String,
    /// Creation time.
    #[prost(message, optional, tag = "14")]
    pub create_time: ::core::option::Option<::prost_types::Timestamp>,
    /// Checksums of the object data.
    #[prost(message, optional, tag = "16")]
    pub checksums: ::core::option::Option<ObjectChecksums>,
    /// Last metadata or data modification time.
    #[prost(message, optional, tag = "17")]
    pub update_time: ::core::option::Option<::prost_types::Timestamp>,
    /// User-provided metadata.
    #[prost(map = "string, string", tag = "22")]
    pub metadata: ::std::collections::HashMap<
        ::prost::alloc::string::String,
        ::prost::alloc::string::String,
    >,
    /// Entity tag.
    #[prost(string, tag = "27")]
    pub etag: ::prost::alloc::string::String,
    /// Finalization time; unset for unfinalized appendable objects.
    #[prost(message, optional, tag = "36")]
    pub finalize_time: ::core::option::Option<::prost_types::Timestamp>,
}

/// A byte range to read.
#[derive(Clone, Copy, PartialEq, Eq, Hash, ::prost::Message)]
pub struct ReadRange {
    /// Offset of the first byte; negative values count from the end.
    #[prost(int64, tag = "1")]
    pub read_offset: i64,
    /// Number of bytes; zero reads to the end of the object.
    #[prost(int64, tag = "2")]
    pub read_length: i64,
    /// Caller-chosen identifier echoed back in responses.
    #[prost(int64, tag = "3")]
    pub read_id: i64,
}

/// Opaque handle that speeds up reopening a read stream.
#[derive(Clone, PartialEq, Eq, Hash, ::prost::Message)]
pub struct BidiReadHandle {
    /// Handle bytes.
    #[prost(bytes = "bytes", tag = "1")]
    pub handle: ::prost::bytes::Bytes,
}

/// Describes the object a bidi read stream targets.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BidiReadObjectSpec {
    /// Bucket resource name.
    #[prost(string, tag = "1")]
    pub bucket: ::prost::alloc::string::String,
    /// Object name.
    #[prost(string, tag = "2")]
    pub object: ::prost::alloc::string::String,
    /// Generation; zero means the latest.
    #[prost(int64, tag = "3")]
    pub generation: i64,
    /// Precondition on the live generation.
    #[prost(int64, optional, tag = "4")]
    pub if_generation_match: ::core::option::Option<i64>,
    /// Precondition on the live generation.
    #[prost(int64, optional, tag = "5")]
    pub if_generation_not_match: ::core::option::Option<i64>,
    /// Precondition on the live metageneration.
    #[prost(int64, optional, tag = "6")]
    pub if_metageneration_match: ::core::option::Option<i64>,
    /// Precondition on the live metageneration.
    #[prost(int64, optional, tag = "7")]
    pub if_metageneration_not_match: ::core::option::Option<i64>,
    /// Encryption parameters.
    #[prost(message, optional, tag = "8")]
    pub common_object_request_params: ::core::option::Option<CommonObjectRequestParams>,
    /// Handle from a previous stream.
    #[prost(message, optional, tag = "13")]
    pub read_handle: ::core::option::Option<BidiReadHandle>,
    /// Routing token from a redirect.
    #[prost(string, optional, tag = "14")]
    pub routing_token: ::core::option::Option<::prost::alloc::string::String>,
}

/// Request message on a bidi read stream.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BidiReadObjectRequest {
    /// Object spec; required on the first message only.
    #[prost(message, optional, tag = "1")]
    pub read_object_spec: ::core::option::Option<BidiReadObjectSpec>,
    /// Ranges to read.
    #[prost(message, repeated, tag = "8")]
    pub read_ranges: ::prost::alloc::vec::Vec<ReadRange>,
}

/// Data for one requested range.
#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct ObjectRangeData {
    /// Range content.
    #[prost(message, optional, tag = "1")]
    pub checksummed_data: ::core::option::Option<ChecksummedData>,
    /// The range this data belongs to, with the offset of this chunk.
    #[prost(message, optional, tag = "2")]
    pub read_range: ::core::option::Option<ReadRange>,
    /// Set on the last chunk of a range.
    #[prost(bool, tag = "3")]
    pub range_end: bool,
}

/// Response message on a bidi read stream.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BidiReadObjectResponse {
    /// Range data.
    #[prost(message, repeated, tag = "6")]
    pub object_data_ranges: ::prost::alloc::vec::Vec<ObjectRangeData>,
    /// Object metadata; present on the first response.
    #[prost(message, optional, tag = "4")]
    pub metadata: ::core::option::Option<Object>,
    /// Latest read handle.
    #[prost(message, optional, tag = "7")]
    pub read_handle: ::core::option::Option<BidiReadHandle>,
}

/// Status detail attached when a bidi read must be redirected.
#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct BidiReadObjectRedirectedError {
    /// Handle to use when reopening.
    #[prost(message, optional, tag = "1")]
    pub read_handle: ::core::option::Option<BidiReadHandle>,
    /// Routing token to use when reopening.
    #[prost(string, optional, tag = "2")]
    pub routing_token: ::core::option::Option<::prost::alloc::string::String>,
}

/// Failure of a single range on a bidi read stream.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReadRangeError {
    /// Failed read id.
    #[prost(int64, tag = "1")]
    pub read_id: i64,
    /// Failure status.
    #[prost(message, optional, tag = "2")]
    pub status: ::core::option::Option<super::super::rpc::Status>,
}

/// Status detail listing per-range failures.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BidiReadObjectError {
    /// Failed ranges.
    #[prost(message, repeated, tag = "1")]
    pub read_range_errors: ::prost::alloc::vec::Vec<ReadRangeError>,
}

/// Describes an object to be written.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WriteObjectSpec {
    /// Destination object metadata; `name` and `bucket` are required.
    #[prost(message, optional, tag = "1")]
    pub resource: ::core::option::Option<Object>,
    /// Precondition on the live generation; zero means "must not exist".
    #[prost(int64, optional, tag = "3")]
    pub if_generation_match: ::core::option::Option<i64>,
    /// Precondition on the live generation.
    #[prost(int64, optional, tag = "4")]
    pub if_generation_not_match: ::core::option::Option<i64>,
    /// Precondition on the live metageneration.
    #[prost(int64, optional, tag = "5")]
    pub if_metageneration_match: ::core::option::Option<i64>,
    /// Precondition on the live metageneration.
    #[prost(int64, optional, tag = "6")]
    pub if_metageneration_not_match: ::core::option::Option<i64>,
    /// Predefined ACL.
    #[prost(string, tag = "7")]
    pub predefined_acl: ::prost::alloc::string::String,
    /// Expected final size, when known.
    #[prost(int64, optional, tag = "8")]
    pub object_size: ::core::option::Option<i64>,
    /// Create an appendable object.
    #[prost(bool, optional, tag = "9")]
    pub appendable: ::core::option::Option<bool>,
}

/// Describes an existing appendable object to continue writing.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AppendObjectSpec {
    /// Bucket resource name.
    #[prost(string, tag = "1")]
    pub bucket: ::prost::alloc::string::String,
    /// Object name.
    #[prost(string, tag = "2")]
    pub object: ::prost::alloc::string::String,
    /// Generation of the appendable object.
    #[prost(int64, tag = "3")]
    pub generation: i64,
    /// Precondition on the live metageneration.
    #[prost(int64, optional, tag = "4")]
    pub if_metageneration_match: ::core::option::Option<i64>,
    /// Precondition on the live metageneration.
    #[prost(int64, optional, tag = "5")]
    pub if_metageneration_not_match: ::core::option::Option<i64>,
    /// Routing token from a redirect.
    #[prost(string, optional, tag = "6")]
    pub routing_token: ::core::option::Option<::prost::alloc::string::String>,
    /// Handle from a previous write stream.
    #[prost(message, optional, tag = "7")]
    pub write_handle: ::core::option::Option<BidiWriteHandle>,
}

/// Opaque handle that speeds up reopening a write stream.
#[derive(Clone, PartialEq, Eq, Hash, ::prost::Message)]
pub struct BidiWriteHandle {
    /// Handle bytes.
    #[prost(bytes = "bytes", tag = "1")]
    pub handle: ::prost::bytes::Bytes,
}

/// Request message on a bidi write stream.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BidiWriteObjectRequest {
    /// Offset of the data in this message within the object.
    #[prost(int64, tag = "3")]
    pub write_offset: i64,
    /// Checksums of the full object; only with `finish_write`.
    #[prost(message, optional, tag = "6")]
    pub object_checksums: ::core::option::Option<ObjectChecksums>,
    /// Ask the server to report the persisted size.
    #[prost(bool, tag = "7")]
    pub state_lookup: bool,
    /// Ask the server to persist everything received so far.
    #[prost(bool, tag = "8")]
    pub flush: bool,
    /// Finalize the object after this message.
    #[prost(bool, tag = "9")]
    pub finish_write: bool,
    /// Encryption parameters.
    #[prost(message, optional, tag = "10")]
    pub common_object_request_params: ::core::option::Option<CommonObjectRequestParams>,
    /// First-message selector; required on the first message only.
    #[prost(oneof = "bidi_write_object_request::FirstMessage", tags = "1, 2, 11")]
    pub first_message: ::core::option::Option<bidi_write_object_request::FirstMessage>,
    /// Message payload.
    #[prost(oneof = "bidi_write_object_request::Data", tags = "4")]
    pub data: ::core::option::Option<bidi_write_object_request::Data>,
}

/// Nested types of [`BidiWriteObjectRequest`].
pub mod bidi_write_object_request {
    /// First-message selector.
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum FirstMessage {
        /// Resumable upload session id.
        #[prost(string, tag = "1")]
        UploadId(::prost::alloc::string::String),
        /// New object.
        #[prost(message, tag = "2")]
        WriteObjectSpec(super::WriteObjectSpec),
        /// Existing appendable object.
        #[prost(message, tag = "11")]
        AppendObjectSpec(super::AppendObjectSpec),
    }

    /// Message payload.
    #[derive(Clone, PartialEq, Eq, ::prost::Oneof)]
    pub enum Data {
        /// Object data with checksum.
        #[prost(message, tag = "4")]
        ChecksummedData(super::ChecksummedData),
    }
}

/// Response message on a bidi write stream.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BidiWriteObjectResponse {
    /// Latest write handle.
    #[prost(message, optional, tag = "3")]
    pub write_handle: ::core::option::Option<BidiWriteHandle>,
    /// Upload state.
    #[prost(oneof = "bidi_write_object_response::WriteStatus", tags = "1, 2")]
    pub write_status: ::core::option::Option<bidi_write_object_response::WriteStatus>,
}

/// Nested types of [`BidiWriteObjectResponse`].
pub mod bidi_write_object_response {
    /// Upload state.
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum WriteStatus {
        /// Bytes persisted so far.
        #[prost(int64, tag = "1")]
        PersistedSize(i64),
        /// The finalized object.
        #[prost(message, tag = "2")]
        Resource(super::Object),
    }
}

/// Status detail attached when a bidi write must be redirected.
#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct BidiWriteObjectRedirectedError {
    /// Routing token to use when reopening.
    #[prost(string, optional, tag = "1")]
    pub routing_token: ::core::option::Option<::prost::alloc::string::String>,
    /// Handle to use when reopening.
    #[prost(message, optional, tag = "3")]
    pub write_handle: ::core::option::Option<BidiWriteHandle>,
    /// Generation of the object being written.
    #[prost(int64, optional, tag = "4")]
    pub generation: ::core::option::Option<i64>,
}

/// Starts a resumable upload session.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StartResumableWriteRequest {
    /// Object to create.
    #[prost(message, optional, tag = "1")]
    pub write_object_spec: ::core::option::Option<WriteObjectSpec>,
    /// Encryption parameters.
    #[prost(message, optional, tag = "3")]
    pub common_object_request_params: ::core::option::Option<CommonObjectRequestParams>,
    /// Checksums known up front.
    #[prost(message, optional, tag = "5")]
    pub object_checksums: ::core::option::Option<ObjectChecksums>,
}

/// Resumable upload session.
#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct StartResumableWriteResponse {
    /// Session id.
    #[prost(string, tag = "1")]
    pub upload_id: ::prost::alloc::string::String,
}

/// Queries the persisted size of a resumable upload.
#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct QueryWriteStatusRequest {
    /// Session id.
    #[prost(string, tag = "1")]
    pub upload_id: ::prost::alloc::string::String,
    /// Encryption parameters.
    #[prost(message, optional, tag = "2")]
    pub common_object_request_params: ::core::option::Option<CommonObjectRequestParams>,
}

/// Persisted state of a resumable upload.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct QueryWriteStatusResponse {
    /// Upload state.
    #[prost(oneof = "query_write_status_response::WriteStatus", tags = "1, 2")]
    pub write_status: ::core::option::Option<query_write_status_response::WriteStatus>,
}

/// Nested types of [`QueryWriteStatusResponse`].
pub mod query_write_status_response {
    /// Upload state.
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum WriteStatus {
        /// Bytes persisted so far.
        #[prost(int64, tag = "1")]
        PersistedSize(i64),
        /// The finalized object.
        #[prost(message, tag = "2")]
        Resource(super::Object),
    }
}
