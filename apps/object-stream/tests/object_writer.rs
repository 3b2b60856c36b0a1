//! Object Writer Integration Tests
//!
//! Resumable, one-shot and appendable uploads against the in-memory
//! transport, including recovery from broken streams and redirects.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::cast_possible_truncation)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::time::timeout;
use tokio_test::{assert_err, assert_ok};
use tonic::Status;

use object_stream::application::ports::{
    RawResponseStream, RequestStream, WriteResponseStream,
};
use object_stream::infrastructure::grpc::proto::{
    BidiReadObjectRequest, BidiWriteObjectRequest, BidiWriteObjectResponse, ObjectChecksums,
    QueryWriteStatusRequest, QueryWriteStatusResponse, StartResumableWriteRequest,
    StartResumableWriteResponse, bidi_write_object_request::Data,
    bidi_write_object_request::FirstMessage, bidi_write_object_response::WriteStatus,
    query_write_status_response,
};
use object_stream::{
    BackoffConfig, CallSettings, Conditions, Fault, InMemoryTransport, RequestParams,
    StorageClient, StorageError, StorageTransport, WriterOptions,
};

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

const CHUNK: usize = 256 * 1024;

fn client(transport: &Arc<InMemoryTransport>) -> StorageClient {
    let transport: Arc<dyn StorageTransport> = transport.clone();
    client_over(transport)
}

fn client_over(transport: Arc<dyn StorageTransport>) -> StorageClient {
    let settings = CallSettings {
        user_project: Some("billing-project".into()),
        backoff: BackoffConfig {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            multiplier: 2.0,
            jitter_factor: 0.0,
            max_attempts: 5,
        },
        ..CallSettings::default()
    };
    StorageClient::new(transport, settings)
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 239) as u8).collect()
}

fn resumable() -> WriterOptions {
    WriterOptions::default().with_chunk_size(CHUNK)
}

type ResponseHook =
    dyn Fn(usize, BidiWriteObjectResponse) -> Result<BidiWriteObjectResponse, Status> + Send + Sync;
type QueryHook = dyn Fn(QueryWriteStatusResponse) -> QueryWriteStatusResponse + Send + Sync;

/// Wraps the in-memory transport to rewrite write replies as they come back.
/// The server state underneath is left as it is, so a rewritten reply looks
/// like one that was lost or misreported on the way to the client.
struct Rewriting {
    inner: Arc<InMemoryTransport>,
    responses: Arc<AtomicUsize>,
    on_response: Option<Arc<ResponseHook>>,
    on_query: Option<Box<QueryHook>>,
    /// `(write_offset, content length)` of every write request sent.
    sent: Arc<Mutex<Vec<(i64, usize)>>>,
}

impl Rewriting {
    fn new(inner: Arc<InMemoryTransport>) -> Self {
        Self {
            inner,
            responses: Arc::new(AtomicUsize::new(0)),
            on_response: None,
            on_query: None,
            sent: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Rewrite write replies. The hook sees the index of each reply across
    /// all write streams.
    fn on_response(
        mut self,
        hook: impl Fn(usize, BidiWriteObjectResponse) -> Result<BidiWriteObjectResponse, Status>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        self.on_response = Some(Arc::new(hook));
        self
    }

    fn on_query(
        mut self,
        hook: impl Fn(QueryWriteStatusResponse) -> QueryWriteStatusResponse + Send + Sync + 'static,
    ) -> Self {
        self.on_query = Some(Box::new(hook));
        self
    }

    fn sent(&self) -> Vec<(i64, usize)> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl StorageTransport for Rewriting {
    async fn bidi_read_object(
        &self,
        params: RequestParams,
        requests: RequestStream<BidiReadObjectRequest>,
    ) -> Result<RawResponseStream, Status> {
        self.inner.bidi_read_object(params, requests).await
    }

    async fn bidi_write_object(
        &self,
        params: RequestParams,
        requests: RequestStream<BidiWriteObjectRequest>,
    ) -> Result<WriteResponseStream, Status> {
        let sent = Arc::clone(&self.sent);
        let requests = requests
            .inspect(move |request| {
                let len = match &request.data {
                    Some(Data::ChecksummedData(data)) => data.content.len(),
                    None => 0,
                };
                if len > 0 {
                    sent.lock().push((request.write_offset, len));
                }
            })
            .boxed();
        let responses = self.inner.bidi_write_object(params, requests).await?;
        let counter = Arc::clone(&self.responses);
        let hook = self.on_response.clone();
        Ok(responses
            .map(move |response| {
                let response = response?;
                let n = counter.fetch_add(1, Ordering::SeqCst);
                match &hook {
                    Some(hook) => hook(n, response),
                    None => Ok(response),
                }
            })
            .boxed())
    }

    async fn start_resumable_write(
        &self,
        params: RequestParams,
        request: StartResumableWriteRequest,
    ) -> Result<StartResumableWriteResponse, Status> {
        self.inner.start_resumable_write(params, request).await
    }

    async fn query_write_status(
        &self,
        params: RequestParams,
        request: QueryWriteStatusRequest,
    ) -> Result<QueryWriteStatusResponse, Status> {
        let response = self.inner.query_write_status(params, request).await?;
        Ok(match &self.on_query {
            Some(hook) => hook(response),
            None => response,
        })
    }
}

fn persisted(mut response: BidiWriteObjectResponse, size: i64) -> BidiWriteObjectResponse {
    response.write_status = Some(WriteStatus::PersistedSize(size));
    response
}

fn queried(size: i64) -> QueryWriteStatusResponse {
    QueryWriteStatusResponse {
        write_status: Some(query_write_status_response::WriteStatus::PersistedSize(size)),
    }
}

#[tokio::test]
async fn resumable_upload_in_chunks() {
    let transport = Arc::new(InMemoryTransport::new());
    let data = pattern(700 * 1024);
    let progress = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&progress);
    let options = resumable()
        .with_content_type("text/plain")
        .with_progress(move |persisted| seen.lock().push(persisted));

    let mut writer = client(&transport)
        .object("bucket", "upload")
        .new_writer(options)
        .unwrap();
    timeout(TEST_TIMEOUT, writer.write(&data)).await.unwrap().unwrap();
    assert_eq!(writer.persisted_size(), 2 * CHUNK as i64);
    let object = timeout(TEST_TIMEOUT, writer.close()).await.unwrap().unwrap();

    assert_eq!(object.size, data.len() as i64);
    assert_eq!(object.content_type, "text/plain");
    assert_eq!(
        object.checksums.unwrap().crc32c,
        Some(crc32c::crc32c(&data))
    );
    assert_eq!(transport.object_data("bucket", "upload").unwrap(), data);
    assert_eq!(
        *progress.lock(),
        vec![CHUNK as i64, 2 * CHUNK as i64, data.len() as i64]
    );

    assert_eq!(transport.call_count("StartResumableWrite"), 1);
    assert_eq!(transport.call_count("BidiWriteObject"), 1);
    let calls = transport.calls();
    assert!(
        calls
            .iter()
            .all(|call| call.params.user_project.as_deref() == Some("billing-project"))
    );
}

#[tokio::test]
async fn large_chunks_span_several_messages() {
    let transport = Arc::new(InMemoryTransport::new());
    let data = pattern(5 * 1024 * 1024 + 17);

    let mut writer = client(&transport)
        .object("bucket", "big")
        .new_writer(WriterOptions::default().with_chunk_size(4 * 1024 * 1024))
        .unwrap();
    writer.write(&data).await.unwrap();
    let object = timeout(TEST_TIMEOUT, writer.close()).await.unwrap().unwrap();

    assert_eq!(object.size, data.len() as i64);
    assert_eq!(transport.object_data("bucket", "big").unwrap(), data);
}

#[tokio::test]
async fn resumes_from_persisted_size_after_stream_failure() {
    let transport = Arc::new(InMemoryTransport::new());
    transport.fail_write_after(1, Fault::Unavailable);
    let data = pattern(3 * CHUNK + 100);

    let mut writer = client(&transport)
        .object("bucket", "resumed")
        .new_writer(resumable())
        .unwrap();
    timeout(TEST_TIMEOUT, writer.write(&data)).await.unwrap().unwrap();
    let object = timeout(TEST_TIMEOUT, writer.close()).await.unwrap().unwrap();

    assert_eq!(object.size, data.len() as i64);
    assert_eq!(transport.object_data("bucket", "resumed").unwrap(), data);
    assert_eq!(transport.call_count("QueryWriteStatus"), 1);
    assert_eq!(transport.call_count("BidiWriteObject"), 2);

    let firsts = transport.write_first_messages();
    assert_eq!(firsts.len(), 2);
    assert!(matches!(
        (&firsts[0], &firsts[1]),
        (FirstMessage::UploadId(a), FirstMessage::UploadId(b)) if a == b
    ));
}

#[tokio::test]
async fn retries_transient_unary_failures() {
    let transport = Arc::new(InMemoryTransport::new());
    transport.fail_next_unary_calls(2);
    let data = pattern(CHUNK + 1);

    let mut writer = client(&transport)
        .object("bucket", "unary")
        .new_writer(resumable())
        .unwrap();
    assert_ok!(writer.write(&data).await);
    assert_ok!(writer.close().await);

    assert_eq!(transport.call_count("StartResumableWrite"), 3);
    assert_eq!(transport.object_data("bucket", "unary").unwrap(), data);
}

#[tokio::test]
async fn one_shot_upload() {
    let transport = Arc::new(InMemoryTransport::new());
    let mut writer = client(&transport)
        .object("bucket", "small")
        .new_writer(WriterOptions::default().with_chunk_size(0))
        .unwrap();

    writer.write(b"hello ").await.unwrap();
    writer.write(b"world").await.unwrap();
    assert!(matches!(
        writer.flush().await,
        Err(StorageError::InvalidArgument(_))
    ));
    let object = writer.close().await.unwrap();

    assert_eq!(object.size, 11);
    assert_eq!(transport.object_data("bucket", "small").unwrap(), &b"hello world"[..]);
    assert_eq!(transport.call_count("StartResumableWrite"), 0);
    assert!(matches!(
        transport.write_first_messages()[0],
        FirstMessage::WriteObjectSpec(_)
    ));
}

#[tokio::test]
async fn one_shot_is_not_retried_after_data_was_sent() {
    let transport = Arc::new(InMemoryTransport::new());
    transport.fail_write_after(0, Fault::Unavailable);

    let mut writer = client(&transport)
        .object("bucket", "lost")
        .new_writer(WriterOptions::default().with_chunk_size(0))
        .unwrap();
    writer.write(b"payload").await.unwrap();

    assert_err!(timeout(TEST_TIMEOUT, writer.close()).await.unwrap());
    assert!(transport.object("bucket", "lost").is_none());
    assert_eq!(transport.call_count("BidiWriteObject"), 1);
}

#[tokio::test]
async fn appendable_flush_then_finalize() {
    let transport = Arc::new(InMemoryTransport::new());
    let mut writer = client(&transport)
        .object("bucket", "log")
        .new_writer(resumable().appendable(true))
        .unwrap();

    writer.write(b"first line\n").await.unwrap();
    assert_eq!(writer.flush().await.unwrap(), 11);
    let generation = writer.generation().unwrap();

    let live = transport.object("bucket", "log").unwrap();
    assert_eq!(live.generation, generation);
    assert_eq!(live.size, 11);
    assert!(live.finalize_time.is_none());

    writer.write(b"second line\n").await.unwrap();
    let object = writer.close().await.unwrap();
    assert_eq!(object.size, 23);
    assert!(object.finalize_time.is_some());
    assert_eq!(
        transport.object_data("bucket", "log").unwrap(),
        &b"first line\nsecond line\n"[..]
    );
}

#[tokio::test]
async fn appendable_close_without_finalize_then_takeover() {
    let transport = Arc::new(InMemoryTransport::new());
    let client = client(&transport);

    let mut writer = client
        .object("bucket", "journal")
        .new_writer(resumable().appendable(false))
        .unwrap();
    writer.write(b"0123456789").await.unwrap();
    let object = writer.close().await.unwrap();
    assert_eq!(object.size, 10);
    let generation = object.generation;
    assert!(transport.object("bucket", "journal").unwrap().finalize_time.is_none());

    let mut writer = timeout(
        TEST_TIMEOUT,
        client
            .object("bucket", "journal")
            .generation(generation)
            .takeover_appendable_writer(resumable().appendable(true)),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(writer.offset(), 10);
    assert_eq!(writer.persisted_size(), 10);

    writer.write(b"abcdef").await.unwrap();
    let object = writer.close().await.unwrap();
    assert_eq!(object.size, 16);
    assert!(object.finalize_time.is_some());
    assert_eq!(
        transport.object_data("bucket", "journal").unwrap(),
        &b"0123456789abcdef"[..]
    );

    let firsts = transport.write_first_messages();
    assert!(matches!(
        firsts.last(),
        Some(FirstMessage::AppendObjectSpec(spec)) if spec.generation == generation
    ));
}

#[tokio::test]
async fn takeover_needs_a_generation() {
    let transport = Arc::new(InMemoryTransport::new());
    let err = client(&transport)
        .object("bucket", "journal")
        .takeover_appendable_writer(resumable())
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::InvalidArgument(_)));
    assert!(transport.calls().is_empty());
}

#[tokio::test]
async fn takeover_of_finalized_object_fails() {
    let transport = Arc::new(InMemoryTransport::new());
    let object = transport.insert_object("bucket", "done", b"final".to_vec());

    let err = client(&transport)
        .object("bucket", "done")
        .generation(object.generation)
        .takeover_appendable_writer(resumable())
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::InvalidArgument(_)), "{err:?}");
}

#[tokio::test]
async fn appendable_follows_write_redirect() {
    let transport = Arc::new(InMemoryTransport::new());
    transport.fail_write_after(1, Fault::Redirect {
        routing_token: "append-route".into(),
    });

    let mut writer = client(&transport)
        .object("bucket", "redirected")
        .new_writer(resumable().appendable(true))
        .unwrap();
    writer.write(b"aaaa").await.unwrap();
    writer.flush().await.unwrap();
    let generation = writer.generation().unwrap();

    writer.write(b"bbbb").await.unwrap();
    assert_eq!(timeout(TEST_TIMEOUT, writer.flush()).await.unwrap().unwrap(), 8);
    writer.close().await.unwrap();

    assert_eq!(
        transport.object_data("bucket", "redirected").unwrap(),
        &b"aaaabbbb"[..]
    );
    let calls = transport.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].params.routing_token.as_deref(), Some("append-route"));

    let firsts = transport.write_first_messages();
    let Some(FirstMessage::AppendObjectSpec(spec)) = firsts.get(1) else {
        panic!("expected an append spec, got {firsts:?}");
    };
    assert_eq!(spec.generation, generation);
    assert_eq!(spec.routing_token.as_deref(), Some("append-route"));
    assert_eq!(
        spec.write_handle.as_ref().unwrap().handle,
        format!("write-handle-{generation}").as_bytes()
    );
}

#[tokio::test]
async fn precondition_failure_is_not_retried() {
    let transport = Arc::new(InMemoryTransport::new());
    transport.insert_object("bucket", "exists", b"old".to_vec());

    let mut writer = client(&transport)
        .object("bucket", "exists")
        .if_conditions(Conditions {
            does_not_exist: true,
            ..Conditions::default()
        })
        .new_writer(resumable())
        .unwrap();
    writer.write(b"new").await.unwrap();
    let err = assert_err!(writer.close().await);

    assert_eq!(err.status().unwrap().code(), tonic::Code::FailedPrecondition);
    assert_eq!(transport.call_count("StartResumableWrite"), 1);
    assert_eq!(transport.object_data("bucket", "exists").unwrap(), &b"old"[..]);
}

#[tokio::test]
async fn mismatched_object_checksum_is_rejected() {
    let transport = Arc::new(InMemoryTransport::new());
    let options = WriterOptions {
        checksums: Some(ObjectChecksums {
            crc32c: Some(0xDEAD_BEEF),
            ..ObjectChecksums::default()
        }),
        ..resumable()
    };

    let mut writer = client(&transport)
        .object("bucket", "checked")
        .new_writer(options)
        .unwrap();
    writer.write(b"some content").await.unwrap();
    let err = writer.close().await.unwrap_err();

    assert_eq!(err.status().unwrap().code(), tonic::Code::InvalidArgument);
    assert!(transport.object("bucket", "checked").is_none());
}

#[tokio::test]
async fn md5_is_sent_when_enabled() {
    let transport = Arc::new(InMemoryTransport::new());
    let options = WriterOptions {
        send_md5: true,
        ..resumable()
    };
    let data = pattern(CHUNK * 2 + 5);

    let mut writer = client(&transport)
        .object("bucket", "hashed")
        .new_writer(options)
        .unwrap();
    writer.write(&data).await.unwrap();
    let object = writer.close().await.unwrap();

    let checksums = object.checksums.unwrap();
    assert_eq!(checksums.md5_hash[..], md5::compute(&data).0[..]);
}

#[tokio::test]
async fn writing_after_close_fails() {
    let transport = Arc::new(InMemoryTransport::new());
    let mut writer = client(&transport)
        .object("bucket", "closed")
        .new_writer(resumable())
        .unwrap();
    writer.write(b"x").await.unwrap();
    writer.close().await.unwrap();

    assert!(matches!(
        writer.write(b"y").await,
        Err(StorageError::StreamClosed)
    ));
    assert!(matches!(writer.close().await, Err(StorageError::StreamClosed)));
}

#[tokio::test]
async fn appendable_needs_a_chunk_size() {
    let transport = Arc::new(InMemoryTransport::new());
    let err = client(&transport)
        .object("bucket", "log")
        .new_writer(WriterOptions::default().with_chunk_size(0).appendable(true))
        .unwrap_err();
    assert!(matches!(err, StorageError::InvalidArgument(_)));
}

#[tokio::test]
async fn partial_persist_keeps_the_tail_and_resends_it() {
    let store = Arc::new(InMemoryTransport::new());
    let short = CHUNK as i64 - 1000;
    let rewriting = Arc::new(
        Rewriting::new(Arc::clone(&store))
            .on_response(move |n, response| match n {
                0 => Ok(persisted(response, short)),
                1 => Err(Status::unavailable("reply lost")),
                _ => Ok(response),
            })
            .on_query(move |_| queried(short)),
    );
    let data = pattern(2 * CHUNK + 500);
    let progress = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&progress);

    let transport: Arc<dyn StorageTransport> = rewriting.clone();
    let mut writer = client_over(transport)
        .object("bucket", "partial")
        .new_writer(resumable().with_progress(move |persisted| seen.lock().push(persisted)))
        .unwrap();
    timeout(TEST_TIMEOUT, writer.write(&data)).await.unwrap().unwrap();
    assert_eq!(writer.persisted_size(), 2 * CHUNK as i64);
    let object = timeout(TEST_TIMEOUT, writer.close()).await.unwrap().unwrap();

    assert_eq!(object.size, data.len() as i64);
    assert_eq!(store.object_data("bucket", "partial").unwrap(), data);
    assert_eq!(progress.lock()[0], short);

    // The second stream starts with the 1000 bytes the first reply left
    // unpersisted.
    let sent = rewriting.sent();
    assert_eq!(sent[..3], [(0, CHUNK), (CHUNK as i64, CHUNK), (short, 1000)]);
    assert_eq!(store.call_count("BidiWriteObject"), 2);
}

#[tokio::test]
async fn persisted_size_behind_the_buffer_is_a_mismatch() {
    let store = Arc::new(InMemoryTransport::new());
    let rewriting = Rewriting::new(Arc::clone(&store))
        .on_response(|n, response| match n {
            1 => Err(Status::unavailable("reply lost")),
            _ => Ok(response),
        })
        .on_query(|_| queried(100));

    let mut writer = client_over(Arc::new(rewriting))
        .object("bucket", "behind")
        .new_writer(resumable())
        .unwrap();
    let err = timeout(TEST_TIMEOUT, writer.write(&pattern(2 * CHUNK)))
        .await
        .unwrap()
        .unwrap_err();

    assert!(
        matches!(
            err,
            StorageError::PersistedOffsetMismatch { persisted: 100, buffer_start, sent }
                if buffer_start == CHUNK as i64 && sent == 2 * CHUNK as i64
        ),
        "{err:?}"
    );
}

#[tokio::test]
async fn persisted_size_past_what_was_sent_is_a_mismatch() {
    let store = Arc::new(InMemoryTransport::new());
    let ahead = CHUNK as i64 + 10;
    let rewriting = Rewriting::new(Arc::clone(&store)).on_response(move |n, response| match n {
        0 => Ok(persisted(response, ahead)),
        _ => Ok(response),
    });

    let mut writer = client_over(Arc::new(rewriting))
        .object("bucket", "ahead")
        .new_writer(resumable())
        .unwrap();
    let err = timeout(TEST_TIMEOUT, writer.write(&pattern(CHUNK)))
        .await
        .unwrap()
        .unwrap_err();

    assert!(
        matches!(
            err,
            StorageError::PersistedOffsetMismatch { persisted, buffer_start: 0, sent }
                if persisted == ahead && sent == CHUNK as i64
        ),
        "{err:?}"
    );
    assert!(!err.is_retryable());
    assert_eq!(store.call_count("BidiWriteObject"), 1);
}

#[tokio::test]
async fn appendable_close_completes_when_the_finalize_reply_is_lost() {
    let store = Arc::new(InMemoryTransport::new());
    let rewriting = Rewriting::new(Arc::clone(&store)).on_response(|n, response| match n {
        1 => Err(Status::unavailable("reply lost")),
        _ => Ok(response),
    });

    let mut writer = client_over(Arc::new(rewriting))
        .object("bucket", "lost-ack")
        .new_writer(resumable().appendable(true))
        .unwrap();
    writer.write(b"hello").await.unwrap();
    assert_eq!(writer.flush().await.unwrap(), 5);
    writer.write(b"world").await.unwrap();
    let object = timeout(TEST_TIMEOUT, writer.close()).await.unwrap().unwrap();

    assert_eq!(object.size, 10);
    assert!(object.finalize_time.is_some());
    assert_eq!(writer.persisted_size(), 10);
    assert_eq!(
        store.object_data("bucket", "lost-ack").unwrap(),
        &b"helloworld"[..]
    );
    assert_eq!(store.call_count("BidiWriteObject"), 2);
}
