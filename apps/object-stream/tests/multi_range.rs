//! Multi-Range Downloader Integration Tests
//!
//! Many ranges over one stream against the in-memory transport: routing
//! by read id, per-range failures, and reopening with what each range
//! still needs.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::cast_possible_truncation)]

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::AsyncWrite;
use tokio::time::timeout;

use object_stream::{
    BackoffConfig, CallSettings, Fault, InMemoryTransport, MultiRangeDownloader, StorageClient,
    StorageError, StorageTransport,
};

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

fn settings() -> CallSettings {
    CallSettings {
        backoff: BackoffConfig {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            multiplier: 2.0,
            jitter_factor: 0.0,
            max_attempts: 5,
        },
        ..CallSettings::default()
    }
}

fn client(transport: &Arc<InMemoryTransport>) -> StorageClient {
    let transport: Arc<dyn StorageTransport> = transport.clone();
    StorageClient::new(transport, settings())
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 253) as u8).collect()
}

async fn open(
    size: usize,
    max_chunk: usize,
) -> (Arc<InMemoryTransport>, Vec<u8>, MultiRangeDownloader) {
    let transport = Arc::new(InMemoryTransport::new().with_max_read_chunk(max_chunk));
    let data = pattern(size);
    transport.insert_object("bucket", "object", data.clone());
    let downloader = client(&transport)
        .object("bucket", "object")
        .new_multi_range_downloader()
        .await
        .unwrap();
    (transport, data, downloader)
}

struct FailingSink;

impl AsyncWrite for FailingSink {
    fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, _: &[u8]) -> Poll<io::Result<usize>> {
        Poll::Ready(Err(io::Error::other("disk full")))
    }

    fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[tokio::test]
async fn downloads_many_interleaved_ranges() {
    let (transport, data, mut downloader) = open(64 * 1024, 100).await;
    assert_eq!(downloader.attrs().size, 64 * 1024);

    // More ranges than fit in one request message.
    let ranges: Vec<(i64, i64)> = (0..150).map(|i| (i * 400, 250 + i % 7)).collect();
    let pending: Vec<_> = ranges
        .iter()
        .map(|&(offset, length)| downloader.add(Vec::new(), offset, length))
        .collect();

    let mut read_ids: Vec<i64> = pending.iter().map(|p| p.read_id()).collect();
    read_ids.dedup();
    assert_eq!(read_ids.len(), 150);

    for ((offset, length), pending) in ranges.into_iter().zip(pending) {
        let outcome = timeout(TEST_TIMEOUT, pending.wait()).await.unwrap().unwrap();
        outcome.result.unwrap();
        let (start, end) = (offset as usize, (offset + length) as usize);
        assert_eq!(outcome.offset, offset);
        assert_eq!(outcome.bytes_written, length);
        assert_eq!(outcome.sink, data[start..end]);
    }

    assert_eq!(transport.call_count("BidiReadObject"), 1);
    downloader.close().await.unwrap();
}

#[tokio::test]
async fn resolves_open_ended_and_suffix_ranges() {
    let (_transport, data, mut downloader) = open(5000, 512).await;

    let to_end = downloader.add(Vec::new(), 4000, 0);
    let suffix = downloader.add(Vec::new(), -100, 0);
    let clipped = downloader.add(Vec::new(), 4990, 50);

    let to_end = to_end.wait().await.unwrap();
    let suffix = suffix.wait().await.unwrap();
    let clipped = clipped.wait().await.unwrap();
    assert_eq!(to_end.sink, data[4000..]);
    assert_eq!(suffix.sink, data[4900..]);
    assert_eq!(clipped.sink, data[4990..]);
    assert_eq!(clipped.bytes_written, 10);

    downloader.close().await.unwrap();
}

#[tokio::test]
async fn wait_returns_once_all_ranges_finish() {
    let (_transport, _data, mut downloader) = open(20_000, 256).await;

    let pending: Vec<_> = (0..10)
        .map(|i| downloader.add(Vec::new(), i * 1000, 1000))
        .collect();
    timeout(TEST_TIMEOUT, downloader.wait()).await.unwrap();

    for pending in pending {
        let outcome = pending.wait().await.unwrap();
        assert_eq!(outcome.sink.len(), 1000);
    }
    downloader.close().await.unwrap();
}

#[tokio::test]
async fn offset_past_end_fails_only_that_range() {
    let (_transport, data, mut downloader) = open(5000, 512).await;

    let good = downloader.add(Vec::new(), 0, 3000);
    let bad = downloader.add(Vec::new(), 10_000, 10);

    let bad = timeout(TEST_TIMEOUT, bad.wait()).await.unwrap().unwrap();
    let err = bad.result.unwrap_err();
    assert_eq!(err.status().unwrap().code(), tonic::Code::OutOfRange);

    let good = timeout(TEST_TIMEOUT, good.wait()).await.unwrap().unwrap();
    good.result.unwrap();
    assert_eq!(good.sink, data[..3000]);

    assert!(downloader.error().is_none());
    downloader.close().await.unwrap();
}

#[tokio::test]
async fn stream_reopens_on_add_after_every_range_failed() {
    let (transport, data, mut downloader) = open(5000, 512).await;

    let bad = downloader.add(Vec::new(), 10_000, 10);
    let bad = timeout(TEST_TIMEOUT, bad.wait()).await.unwrap().unwrap();
    assert_eq!(
        bad.result.unwrap_err().status().unwrap().code(),
        tonic::Code::OutOfRange
    );
    // Nothing is left to read, so the failed stream is not reopened yet.
    assert_eq!(transport.call_count("BidiReadObject"), 1);

    let good = downloader.add(Vec::new(), 100, 200);
    let good = timeout(TEST_TIMEOUT, good.wait()).await.unwrap().unwrap();
    good.result.unwrap();
    assert_eq!(good.sink, data[100..300]);
    assert_eq!(transport.call_count("BidiReadObject"), 2);

    assert!(downloader.error().is_none());
    downloader.close().await.unwrap();
}

#[tokio::test]
async fn suffix_longer_than_object_survives_reopen() {
    let transport = Arc::new(InMemoryTransport::new().with_max_read_chunk(100));
    let data = pattern(3000);
    transport.insert_object("bucket", "object", data.clone());
    transport.fail_read_after(5, Fault::Unavailable);

    let mut downloader = client(&transport)
        .object("bucket", "object")
        .new_multi_range_downloader()
        .await
        .unwrap();
    let pending = downloader.add(Vec::new(), -20_000, 0);
    let outcome = timeout(TEST_TIMEOUT, pending.wait()).await.unwrap().unwrap();

    outcome.result.unwrap();
    assert_eq!(outcome.sink, data);
    assert_eq!(outcome.bytes_written, 3000);
    assert_eq!(transport.call_count("BidiReadObject"), 2);
    downloader.close().await.unwrap();
}

#[tokio::test]
async fn cancel_fails_pending_ranges_and_the_stream() {
    let transport = Arc::new(InMemoryTransport::new().with_max_read_chunk(100));
    transport.insert_object("bucket", "object", pattern(3000));
    let settings = settings();
    let cancel = settings.cancel.clone();
    let storage: Arc<dyn StorageTransport> = transport.clone();

    let mut downloader = StorageClient::new(storage, settings)
        .object("bucket", "object")
        .new_multi_range_downloader()
        .await
        .unwrap();
    cancel.cancel();

    let pending = downloader.add(Vec::new(), 0, 2000);
    let outcome = timeout(TEST_TIMEOUT, pending.wait()).await.unwrap().unwrap();
    assert!(matches!(outcome.result, Err(StorageError::Cancelled)));
    assert!(matches!(
        timeout(TEST_TIMEOUT, downloader.close()).await.unwrap(),
        Err(StorageError::Cancelled)
    ));
}

#[tokio::test]
async fn reopens_with_remaining_bytes_after_unavailable() {
    let transport = Arc::new(InMemoryTransport::new().with_max_read_chunk(100));
    let data = pattern(8000);
    transport.insert_object("bucket", "object", data.clone());
    transport.fail_read_after(6, Fault::Unavailable);

    let mut downloader = client(&transport)
        .object("bucket", "object")
        .new_multi_range_downloader()
        .await
        .unwrap();
    let pending: Vec<_> = [(0, 2000), (3000, 1500), (6000, 0)]
        .iter()
        .map(|&(offset, length)| (offset, length, downloader.add(Vec::new(), offset, length)))
        .collect();

    for (offset, length, pending) in pending {
        let outcome = timeout(TEST_TIMEOUT, pending.wait()).await.unwrap().unwrap();
        outcome.result.unwrap();
        let start = offset as usize;
        let end = if length == 0 { data.len() } else { start + length as usize };
        assert_eq!(outcome.sink, data[start..end]);
    }

    assert_eq!(transport.call_count("BidiReadObject"), 2);
    let generation = transport.object("bucket", "object").unwrap().generation;
    let specs = transport.read_specs();
    assert_eq!(specs[1].generation, generation);
    assert!(specs[1].read_handle.is_some());
    downloader.close().await.unwrap();
}

#[tokio::test]
async fn follows_redirect_on_reopen() {
    let transport = Arc::new(InMemoryTransport::new().with_max_read_chunk(100));
    let data = pattern(3000);
    transport.insert_object("bucket", "object", data.clone());
    transport.fail_read_after(2, Fault::Redirect {
        routing_token: "mrd-route".into(),
    });

    let mut downloader = client(&transport)
        .object("bucket", "object")
        .new_multi_range_downloader()
        .await
        .unwrap();
    let outcome = timeout(TEST_TIMEOUT, downloader.add(Vec::new(), 0, 0).wait())
        .await
        .unwrap()
        .unwrap();
    outcome.result.unwrap();
    assert_eq!(outcome.sink, data);

    let calls = transport.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].params.routing_token.as_deref(), Some("mrd-route"));
    downloader.close().await.unwrap();
}

#[tokio::test]
async fn checksum_mismatch_fails_one_range() {
    let (transport, data, mut downloader) = open(4000, 1000).await;
    transport.corrupt_next_read_chunks(1);

    let first = downloader.add(Vec::new(), 0, 500).wait().await.unwrap();
    assert!(matches!(
        first.result,
        Err(StorageError::ChecksumMismatch { .. })
    ));

    let second = downloader.add(Vec::new(), 500, 500).wait().await.unwrap();
    second.result.unwrap();
    assert_eq!(second.sink, data[500..1000]);
    downloader.close().await.unwrap();
}

#[tokio::test]
async fn sink_failure_fails_one_range() {
    let (_transport, data, mut downloader) = open(4000, 1000).await;

    let failing = downloader.add(FailingSink, 0, 100).wait().await.unwrap();
    assert!(matches!(failing.result, Err(StorageError::Sink(_))));

    let ok = downloader.add(Vec::new(), 100, 100).wait().await.unwrap();
    assert_eq!(ok.sink, data[100..200]);
    downloader.close().await.unwrap();
}

#[tokio::test]
async fn negative_length_is_rejected_immediately() {
    let (transport, _data, mut downloader) = open(1000, 100).await;

    let pending = downloader.add(Vec::new(), 0, -5);
    assert_eq!(pending.read_id(), 0);
    let outcome = pending.wait().await.unwrap();
    assert!(matches!(outcome.result, Err(StorageError::InvalidArgument(_))));
    assert_eq!(transport.call_count("BidiReadObject"), 1);
    downloader.close().await.unwrap();
}

#[tokio::test]
async fn adds_after_close_fail() {
    let (_transport, _data, mut downloader) = open(1000, 100).await;
    downloader.close().await.unwrap();

    let outcome = downloader.add(Vec::new(), 0, 10).wait().await.unwrap();
    assert!(matches!(outcome.result, Err(StorageError::StreamClosed)));
}

#[tokio::test]
async fn opening_missing_object_fails() {
    let transport = Arc::new(InMemoryTransport::new());
    let err = client(&transport)
        .object("bucket", "nope")
        .new_multi_range_downloader()
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::ObjectNotFound { .. }));
}
