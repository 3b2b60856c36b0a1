//! In-Memory Storage
//!
//! An in-process [`StorageTransport`] over an object table. Streams are
//! served by spawned tasks the same way the real service interleaves
//! responses with requests, and faults can be injected to exercise
//! retries, redirects and checksum handling.
//!
//! # Example
//!
//! ```ignore
//! let transport = Arc::new(InMemoryTransport::new().with_max_read_chunk(1024));
//! transport.insert_object("bucket", "object", Bytes::from_static(b"hello"));
//! transport.fail_read_after(2, Fault::Unavailable);
//!
//! let client = StorageClient::new(transport, CallSettings::default());
//! ```

mod read;
mod store;
mod write;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tonic::Status;

use self::store::{Store, Upload, bucket_name, check_conditions};
use crate::application::ports::{
    RawResponseStream, RequestParams, RequestStream, StorageTransport, WriteResponseStream,
};
use crate::domain::object::bucket_resource_name;
use crate::infrastructure::grpc::proto::{
    BidiReadObjectRequest, BidiReadObjectSpec, BidiWriteObjectRequest, Object,
    QueryWriteStatusRequest, QueryWriteStatusResponse, StartResumableWriteRequest,
    StartResumableWriteResponse, bidi_write_object_request::FirstMessage,
    query_write_status_response::WriteStatus,
};

/// A failure injected into the next stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// End the stream with `UNAVAILABLE`.
    Unavailable,
    /// End the stream with `ABORTED` plus a redirect detail.
    Redirect {
        /// Token the client must send when reopening.
        routing_token: String,
    },
}

/// One call received by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRecord {
    /// RPC method name.
    pub method: &'static str,
    /// Routing metadata the call carried.
    pub params: RequestParams,
}

/// In-process emulation of the storage streaming RPCs.
#[derive(Debug, Clone, Default)]
pub struct InMemoryTransport {
    store: Arc<Mutex<Store>>,
}

impl InMemoryTransport {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Limit object content per read response message.
    #[must_use]
    pub fn with_max_read_chunk(self, bytes: usize) -> Self {
        self.store.lock().max_read_chunk = bytes.max(1);
        self
    }

    /// Split each encoded read response into buffers of `bytes` bytes.
    #[must_use]
    pub fn with_response_split(self, bytes: usize) -> Self {
        self.store.lock().response_split = Some(bytes.max(1));
        self
    }

    /// Store `data` as a new finalized generation of `bucket/name`.
    pub fn insert_object(&self, bucket: &str, name: &str, data: impl Into<Bytes>) -> Object {
        let resource = Object {
            name: name.to_string(),
            bucket: bucket_resource_name(bucket),
            content_type: "application/octet-stream".to_string(),
            ..Object::default()
        };
        self.store.lock().create(&resource, data.into())
    }

    /// Metadata of the live generation.
    #[must_use]
    pub fn object(&self, bucket: &str, name: &str) -> Option<Object> {
        self.store
            .lock()
            .get(bucket, name)
            .map(|object| object.meta.clone())
    }

    /// Content of the live generation.
    #[must_use]
    pub fn object_data(&self, bucket: &str, name: &str) -> Option<Bytes> {
        self.store
            .lock()
            .get(bucket, name)
            .map(|object| object.data.clone())
    }

    /// Flip the byte at `offset` of the live generation, leaving the stored
    /// checksums untouched, as if the data were damaged at rest.
    pub fn corrupt_object_byte(&self, bucket: &str, name: &str, offset: usize) {
        let mut store = self.store.lock();
        if let Some(object) = store.get_mut(bucket, name)
            && offset < object.data.len()
        {
            let mut data = object.data.to_vec();
            data[offset] ^= 0xff;
            object.data = Bytes::from(data);
        }
    }

    /// Fail the next read stream after it sent `messages` responses.
    pub fn fail_read_after(&self, messages: usize, fault: Fault) {
        self.store.lock().read_faults.push_back((messages, fault));
    }

    /// Fail the next write stream after it handled `requests` requests.
    /// Data it staged but did not persist is lost.
    pub fn fail_write_after(&self, requests: usize, fault: Fault) {
        self.store.lock().write_faults.push_back((requests, fault));
    }

    /// Fail the next `count` unary calls with `UNAVAILABLE`.
    pub fn fail_next_unary_calls(&self, count: usize) {
        self.store.lock().unary_failures += count;
    }

    /// Send a wrong CRC32C with the next `count` content chunks.
    pub fn corrupt_next_read_chunks(&self, count: usize) {
        self.store.lock().corrupt_reads += count;
    }

    /// Calls received so far.
    #[must_use]
    pub fn calls(&self) -> Vec<CallRecord> {
        self.store.lock().calls.clone()
    }

    /// Number of calls to `method`.
    #[must_use]
    pub fn call_count(&self, method: &str) -> usize {
        self.store
            .lock()
            .calls
            .iter()
            .filter(|call| call.method == method)
            .count()
    }

    /// Read specs of every read stream opened so far.
    #[must_use]
    pub fn read_specs(&self) -> Vec<BidiReadObjectSpec> {
        self.store.lock().read_specs.clone()
    }

    /// First messages of every write stream opened so far.
    #[must_use]
    pub fn write_first_messages(&self) -> Vec<FirstMessage> {
        self.store.lock().write_first_messages.clone()
    }

    fn record(&self, method: &'static str, params: RequestParams) {
        self.store.lock().calls.push(CallRecord { method, params });
    }
}

#[async_trait]
impl StorageTransport for InMemoryTransport {
    async fn bidi_read_object(
        &self,
        params: RequestParams,
        requests: RequestStream<BidiReadObjectRequest>,
    ) -> Result<RawResponseStream, Status> {
        self.record("BidiReadObject", params);
        let fault = self.store.lock().read_faults.pop_front();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(read::serve(Arc::clone(&self.store), requests, tx, fault));
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn bidi_write_object(
        &self,
        params: RequestParams,
        requests: RequestStream<BidiWriteObjectRequest>,
    ) -> Result<WriteResponseStream, Status> {
        self.record("BidiWriteObject", params);
        let fault = self.store.lock().write_faults.pop_front();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(write::serve(Arc::clone(&self.store), requests, tx, fault));
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn start_resumable_write(
        &self,
        params: RequestParams,
        request: StartResumableWriteRequest,
    ) -> Result<StartResumableWriteResponse, Status> {
        self.record("StartResumableWrite", params);
        let mut store = self.store.lock();
        store.take_unary_failure()?;

        let spec = request
            .write_object_spec
            .ok_or_else(|| Status::invalid_argument("write_object_spec is required"))?;
        let resource = spec
            .resource
            .as_ref()
            .ok_or_else(|| Status::invalid_argument("write_object_spec needs a resource"))?;
        if resource.name.is_empty() || bucket_name(&resource.bucket).is_empty() {
            return Err(Status::invalid_argument("bucket and object name are required"));
        }
        let live = store
            .get(&resource.bucket, &resource.name)
            .map(|object| object.meta.clone());
        check_conditions(
            live.as_ref(),
            spec.if_generation_match,
            spec.if_generation_not_match,
            spec.if_metageneration_match,
            spec.if_metageneration_not_match,
        )?;

        let upload_id = uuid::Uuid::new_v4().to_string();
        store.uploads.insert(upload_id.clone(), Upload {
            spec,
            data: Vec::new(),
            finished: None,
        });
        Ok(StartResumableWriteResponse { upload_id })
    }

    async fn query_write_status(
        &self,
        params: RequestParams,
        request: QueryWriteStatusRequest,
    ) -> Result<QueryWriteStatusResponse, Status> {
        self.record("QueryWriteStatus", params);
        let mut store = self.store.lock();
        store.take_unary_failure()?;

        let upload = store
            .uploads
            .get(&request.upload_id)
            .ok_or_else(|| Status::not_found(format!("upload {} not found", request.upload_id)))?;
        let write_status = match &upload.finished {
            Some(object) => WriteStatus::Resource(object.clone()),
            None => {
                WriteStatus::PersistedSize(i64::try_from(upload.data.len()).unwrap_or(i64::MAX))
            }
        };
        Ok(QueryWriteStatusResponse {
            write_status: Some(write_status),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::grpc::proto::{
        BidiWriteObjectResponse, ChecksummedData, ReadRange, WriteObjectSpec,
        bidi_write_object_request::Data, bidi_write_object_response,
    };
    use crate::infrastructure::retry;
    use crate::infrastructure::wire::decode_read_response;

    fn params() -> RequestParams {
        RequestParams::for_bucket(bucket_resource_name("b"))
    }

    fn read_request(ranges: Vec<ReadRange>) -> BidiReadObjectRequest {
        BidiReadObjectRequest {
            read_object_spec: Some(BidiReadObjectSpec {
                bucket: bucket_resource_name("b"),
                object: "o".into(),
                ..BidiReadObjectSpec::default()
            }),
            read_ranges: ranges,
        }
    }

    fn range(read_offset: i64, read_length: i64, read_id: i64) -> ReadRange {
        ReadRange {
            read_offset,
            read_length,
            read_id,
        }
    }

    async fn collect_read(
        transport: &InMemoryTransport,
        request: BidiReadObjectRequest,
    ) -> Vec<Result<crate::infrastructure::wire::DecodedResponse, Status>> {
        let requests = futures::stream::iter(vec![request]).boxed();
        let responses = transport.bidi_read_object(params(), requests).await.unwrap();
        responses
            .map(|message| message.map(|m| decode_read_response(&m).unwrap()))
            .collect()
            .await
    }

    #[tokio::test]
    async fn read_serves_metadata_then_chunked_content() {
        let transport = InMemoryTransport::new().with_max_read_chunk(4);
        transport.insert_object("b", "o", Bytes::from_static(b"0123456789"));

        let responses = collect_read(&transport, read_request(vec![range(2, 0, 1)])).await;
        let decoded: Vec<_> = responses.into_iter().map(Result::unwrap).collect();

        assert!(decoded[0].metadata.is_some());
        assert!(decoded[0].read_handle.is_some());
        let content: Vec<u8> = decoded
            .iter()
            .flat_map(|r| r.ranges.iter())
            .flat_map(|d| d.content.to_bytes().to_vec())
            .collect();
        assert_eq!(content, b"23456789");
        let last = decoded.last().unwrap();
        assert!(last.ranges[0].range_end);
        assert!(decoded.iter().flat_map(|r| &r.ranges).all(|d| d.checksum_matches()));
    }

    #[tokio::test]
    async fn read_of_missing_object_is_not_found() {
        let transport = InMemoryTransport::new();
        let responses = collect_read(&transport, read_request(vec![range(0, 0, 1)])).await;
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].as_ref().unwrap_err().code(), tonic::Code::NotFound);
    }

    #[tokio::test]
    async fn offset_past_end_fails_range_with_detail() {
        let transport = InMemoryTransport::new();
        transport.insert_object("b", "o", Bytes::from_static(b"abc"));

        let responses = collect_read(&transport, read_request(vec![range(10, 1, 7)])).await;
        let status = responses.last().unwrap().as_ref().unwrap_err();
        let detail = retry::read_object_error(status).unwrap();
        assert_eq!(detail.read_range_errors[0].read_id, 7);
    }

    #[tokio::test]
    async fn injected_redirect_carries_routing_token() {
        let transport = InMemoryTransport::new();
        transport.insert_object("b", "o", Bytes::from_static(b"abc"));
        transport.fail_read_after(0, Fault::Redirect {
            routing_token: "rt-1".into(),
        });

        let responses = collect_read(&transport, read_request(vec![range(0, 0, 1)])).await;
        let status = responses[0].as_ref().unwrap_err();
        assert!(retry::is_retryable_status(status));
        let redirect = retry::read_redirect(status).unwrap();
        assert_eq!(redirect.routing_token.as_deref(), Some("rt-1"));
    }

    #[tokio::test]
    async fn one_shot_write_creates_object() {
        let transport = InMemoryTransport::new();
        let content = Bytes::from_static(b"payload");
        let request = BidiWriteObjectRequest {
            first_message: Some(FirstMessage::WriteObjectSpec(WriteObjectSpec {
                resource: Some(Object {
                    name: "o".into(),
                    bucket: bucket_resource_name("b"),
                    ..Object::default()
                }),
                ..WriteObjectSpec::default()
            })),
            data: Some(Data::ChecksummedData(ChecksummedData {
                crc32c: Some(crc32c::crc32c(&content)),
                content,
            })),
            finish_write: true,
            ..BidiWriteObjectRequest::default()
        };

        let requests = futures::stream::iter(vec![request]).boxed();
        let responses: Vec<Result<BidiWriteObjectResponse, Status>> = transport
            .bidi_write_object(params(), requests)
            .await
            .unwrap()
            .collect()
            .await;

        let response = responses[0].as_ref().unwrap();
        assert!(matches!(
            &response.write_status,
            Some(bidi_write_object_response::WriteStatus::Resource(object)) if object.size == 7
        ));
        assert_eq!(transport.object_data("b", "o").unwrap(), &b"payload"[..]);
    }

    #[tokio::test]
    async fn unary_failures_are_consumed_in_order() {
        let transport = InMemoryTransport::new();
        transport.fail_next_unary_calls(1);
        let request = QueryWriteStatusRequest {
            upload_id: "missing".into(),
            ..QueryWriteStatusRequest::default()
        };

        let first = transport.query_write_status(params(), request.clone()).await;
        let second = transport.query_write_status(params(), request).await;

        assert_eq!(first.unwrap_err().code(), tonic::Code::Unavailable);
        assert_eq!(second.unwrap_err().code(), tonic::Code::NotFound);
        assert_eq!(transport.call_count("QueryWriteStatus"), 2);
    }
}
