//! Multi-Range Downloader
//!
//! Many byte ranges multiplexed over one bidi read stream. A single driver
//! task owns the stream: it sends range requests as they are added, routes
//! response data by read id into each range's sink, and reopens the stream
//! after transient failures, re-requesting whatever each range still needs.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::CallSettings;
use super::read_stream::{MAX_RANGES_PER_REQUEST, ReadSession};
use super::reader::ReaderAttrs;
use crate::application::error::StorageError;
use crate::application::ports::{RawResponseStream, StorageTransport};
use crate::domain::object::{ObjectSpec, ReadHandle};
use crate::domain::range::{RangeRequest, ReadIdGenerator, resolve_range};
use crate::infrastructure::grpc::proto::{BidiReadObjectRequest, ReadRange};
use crate::infrastructure::metrics::{self, Operation, RangeResult};
use crate::infrastructure::retry::{self, Retrier};
use crate::infrastructure::wire::{DecodedResponse, decode_read_response};

// =============================================================================
// Public Types
// =============================================================================

/// Result of one range download.
#[derive(Debug)]
pub struct RangeOutcome<W> {
    /// The sink the range was written to.
    pub sink: W,
    /// Requested offset.
    pub offset: i64,
    /// Bytes written to the sink.
    pub bytes_written: i64,
    /// Whether the range completed.
    pub result: Result<(), StorageError>,
}

/// A range added to a [`MultiRangeDownloader`].
#[derive(Debug)]
pub struct PendingRange<W> {
    read_id: i64,
    rx: oneshot::Receiver<RangeOutcome<W>>,
}

impl<W> PendingRange<W> {
    /// Read id assigned to this range; zero if it was rejected on add.
    #[must_use]
    pub const fn read_id(&self) -> i64 {
        self.read_id
    }

    /// Wait for the range to finish.
    ///
    /// # Errors
    ///
    /// [`StorageError::StreamClosed`] if the downloader went away without
    /// reporting the range.
    pub async fn wait(self) -> Result<RangeOutcome<W>, StorageError> {
        self.rx.await.map_err(|_| StorageError::StreamClosed)
    }
}

/// Downloads many ranges of one object over a single stream.
pub struct MultiRangeDownloader {
    commands: mpsc::UnboundedSender<Command>,
    pending: Arc<watch::Sender<usize>>,
    shared: Arc<Mutex<Shared>>,
    read_ids: Mutex<ReadIdGenerator>,
    attrs: ReaderAttrs,
    task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for MultiRangeDownloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiRangeDownloader")
            .field("pending", &*self.pending.borrow())
            .field("attrs", &self.attrs)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct Shared {
    read_handle: Option<ReadHandle>,
    error: Option<StorageError>,
    done: bool,
}

enum Command {
    Add(ActiveRange),
    Close,
}

impl MultiRangeDownloader {
    pub(crate) async fn open(
        transport: Arc<dyn StorageTransport>,
        spec: ObjectSpec,
        settings: CallSettings,
    ) -> Result<Self, StorageError> {
        spec.validate()?;
        let mut session = ReadSession::new(transport, spec, settings);
        let mut retrier = session.retrier();
        let opened = session
            .open(&mut retrier, Operation::MultiRangeRead, &[], true)
            .await?;
        let attrs = ReaderAttrs::from_object(&opened.metadata, 0);

        let shared = Arc::new(Mutex::new(Shared {
            read_handle: session.read_handle().cloned(),
            ..Shared::default()
        }));
        let (pending, _) = watch::channel(0usize);
        let pending = Arc::new(pending);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        let driver = Driver {
            session,
            retrier,
            commands: commands_rx,
            requests: opened.requests,
            responses: opened.responses,
            idle: false,
            active: HashMap::new(),
            pending: Arc::clone(&pending),
            shared: Arc::clone(&shared),
        };
        let first = opened.first;
        let task = tokio::spawn(driver.run(first));

        tracing::debug!(size = attrs.size, "Opened multi-range downloader");

        Ok(Self {
            commands: commands_tx,
            pending,
            shared,
            read_ids: Mutex::new(ReadIdGenerator::new()),
            attrs,
            task: Some(task),
        })
    }

    /// Object attributes reported when the stream opened.
    #[must_use]
    pub const fn attrs(&self) -> &ReaderAttrs {
        &self.attrs
    }

    /// Download `length` bytes at `offset` into `sink`. A length of zero
    /// reads to the end of the object; a negative offset counts from the
    /// end. The sink is handed back unflushed in the [`RangeOutcome`].
    pub fn add<W>(&self, sink: W, offset: i64, length: i64) -> PendingRange<W>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        if length < 0 {
            let _ = tx.send(RangeOutcome {
                sink,
                offset,
                bytes_written: 0,
                result: Err(StorageError::InvalidArgument(format!(
                    "range length cannot be negative, got {length}"
                ))),
            });
            return PendingRange { read_id: 0, rx };
        }
        {
            let shared = self.shared.lock();
            if shared.done {
                let err = shared.error.clone().unwrap_or(StorageError::StreamClosed);
                drop(shared);
                let _ = tx.send(RangeOutcome {
                    sink,
                    offset,
                    bytes_written: 0,
                    result: Err(err),
                });
                return PendingRange { read_id: 0, rx };
            }
        }

        let read_id = self.read_ids.lock().next_id();
        let start = resolve_range(RangeRequest::new(offset, length), self.attrs.size).start;
        let range = ActiveRange {
            read_id,
            offset,
            start,
            length,
            written: 0,
            sink: Box::new(SinkJob { sink, done: tx }),
        };
        self.pending.send_modify(|n| *n += 1);
        metrics::add_active_ranges(1.0);
        if let Err(mpsc::error::SendError(Command::Add(range))) =
            self.commands.send(Command::Add(range))
        {
            // Driver already exited.
            let err = self
                .shared
                .lock()
                .error
                .clone()
                .unwrap_or(StorageError::StreamClosed);
            complete(range, Err(err), &self.pending);
        }
        PendingRange { read_id, rx }
    }

    /// Wait until no ranges are pending.
    pub async fn wait(&self) {
        let mut rx = self.pending.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    /// Close the stream. Ranges still pending fail with
    /// [`StorageError::StreamClosed`].
    ///
    /// # Errors
    ///
    /// Returns the error that permanently failed the stream, if any.
    pub async fn close(&mut self) -> Result<(), StorageError> {
        let _ = self.commands.send(Command::Close);
        if let Some(task) = self.task.take()
            && let Err(err) = task.await
        {
            tracing::warn!(error = %err, "Multi-range driver task failed");
        }
        match self.error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Latest read handle from the server.
    #[must_use]
    pub fn read_handle(&self) -> Option<ReadHandle> {
        self.shared.lock().read_handle.clone()
    }

    /// The error that permanently failed the stream, if any.
    #[must_use]
    pub fn error(&self) -> Option<StorageError> {
        self.shared.lock().error.clone()
    }
}

// =============================================================================
// Range Bookkeeping
// =============================================================================

type WriteFuture<'a> = Pin<Box<dyn Future<Output = std::io::Result<()>> + Send + 'a>>;

/// A sink with its completion channel, erased over the sink type.
trait RangeSink: Send {
    fn write<'a>(&'a mut self, chunk: &'a Bytes) -> WriteFuture<'a>;
    fn complete(
        self: Box<Self>,
        offset: i64,
        bytes_written: i64,
        result: Result<(), StorageError>,
    );
}

struct SinkJob<W> {
    sink: W,
    done: oneshot::Sender<RangeOutcome<W>>,
}

impl<W> RangeSink for SinkJob<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    fn write<'a>(&'a mut self, chunk: &'a Bytes) -> WriteFuture<'a> {
        Box::pin(self.sink.write_all(chunk))
    }

    fn complete(
        self: Box<Self>,
        offset: i64,
        bytes_written: i64,
        result: Result<(), StorageError>,
    ) {
        let Self { sink, done } = *self;
        let _ = done.send(RangeOutcome {
            sink,
            offset,
            bytes_written,
            result,
        });
    }
}

struct ActiveRange {
    read_id: i64,
    /// Offset as requested; negative counts from the end.
    offset: i64,
    /// Absolute offset of the first byte.
    start: i64,
    length: i64,
    written: i64,
    sink: Box<dyn RangeSink>,
}

impl ActiveRange {
    /// Wire range covering what this range still needs.
    const fn wire_range(&self) -> ReadRange {
        let read_length = if self.length == 0 {
            0
        } else {
            self.length - self.written
        };
        ReadRange {
            read_offset: self.start + self.written,
            read_length,
            read_id: self.read_id,
        }
    }
}

fn complete(range: ActiveRange, result: Result<(), StorageError>, pending: &watch::Sender<usize>) {
    let label = match &result {
        Ok(()) => RangeResult::Ok,
        Err(StorageError::Sink(_)) => RangeResult::SinkError,
        Err(StorageError::StreamClosed) => RangeResult::Closed,
        Err(_) => RangeResult::Failed,
    };
    metrics::record_range_completed(label);
    metrics::add_active_ranges(-1.0);
    range.sink.complete(range.offset, range.written, result);
    pending.send_modify(|n| *n = n.saturating_sub(1));
}

// =============================================================================
// Driver
// =============================================================================

struct Driver {
    session: ReadSession,
    retrier: Retrier,
    commands: mpsc::UnboundedReceiver<Command>,
    requests: Option<mpsc::UnboundedSender<BidiReadObjectRequest>>,
    responses: RawResponseStream,
    /// No stream is open; the next add reopens one.
    idle: bool,
    active: HashMap<i64, ActiveRange>,
    pending: Arc<watch::Sender<usize>>,
    shared: Arc<Mutex<Shared>>,
}

impl Driver {
    async fn run(mut self, first: DecodedResponse) {
        self.handle_response(first).await;
        let cancel = self.retrier.cancel_token().clone();
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    self.shutdown(StorageError::Cancelled, true);
                    break;
                }
                command = self.commands.recv() => match command {
                    Some(Command::Add(range)) => match self.add_ranges(range).await {
                        Ok(true) => {}
                        Ok(false) => {
                            self.shutdown(StorageError::StreamClosed, false);
                            break;
                        }
                        Err(err) => {
                            self.shutdown(err, true);
                            break;
                        }
                    },
                    Some(Command::Close) | None => {
                        self.shutdown(StorageError::StreamClosed, false);
                        break;
                    }
                },
                message = self.responses.next() => {
                    let err = match message {
                        Some(Ok(message)) => match decode_read_response(&message) {
                            Ok(decoded) => {
                                self.retrier.reset();
                                self.handle_response(decoded).await;
                                continue;
                            }
                            Err(err) => StorageError::from(err),
                        },
                        Some(Err(status)) => self.session.object_error(status),
                        None => StorageError::UnexpectedEof { remaining: 0 },
                    };
                    if let Err(err) = self.recover(err).await {
                        self.shutdown(err, true);
                        break;
                    }
                }
            }
        }
    }

    /// Take `first` plus any other queued adds and request them. Returns
    /// `false` if a close was queued behind them.
    async fn add_ranges(&mut self, first: ActiveRange) -> Result<bool, StorageError> {
        let mut wire = vec![first.wire_range()];
        self.active.insert(first.read_id, first);
        let mut keep_running = true;
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Add(range) => {
                    wire.push(range.wire_range());
                    self.active.insert(range.read_id, range);
                }
                Command::Close => {
                    keep_running = false;
                    break;
                }
            }
        }
        if !keep_running {
            return Ok(false);
        }
        if self.idle {
            self.reopen().await?;
        } else {
            self.send_ranges(&wire);
        }
        Ok(true)
    }

    fn send_ranges(&self, ranges: &[ReadRange]) {
        let Some(requests) = &self.requests else {
            return;
        };
        for batch in ranges.chunks(MAX_RANGES_PER_REQUEST) {
            // A send failure surfaces as a stream error and the ranges are
            // re-requested on reopen.
            let _ = requests.send(BidiReadObjectRequest {
                read_object_spec: None,
                read_ranges: batch.to_vec(),
            });
        }
    }

    async fn handle_response(&mut self, response: DecodedResponse) {
        self.session.observe(&response);
        if let Some(handle) = self.session.read_handle() {
            self.shared.lock().read_handle = Some(handle.clone());
        }
        for data in response.ranges {
            let read_id = data.read_range.read_id;
            let Some(range) = self.active.get_mut(&read_id) else {
                tracing::debug!(read_id, "Ignoring data for unknown range");
                continue;
            };
            if !data.checksum_matches() {
                metrics::record_checksum_mismatch(Operation::MultiRangeRead);
                let err = StorageError::ChecksumMismatch {
                    got: data.content.crc32c(),
                    want: data.crc32c.unwrap_or_default(),
                };
                self.finish(read_id, Err(err));
                continue;
            }
            let mut sink_error = None;
            for chunk in data.content.buffers() {
                if let Err(err) = range.sink.write(chunk).await {
                    sink_error = Some(err);
                    break;
                }
                let n = i64::try_from(chunk.len()).unwrap_or(i64::MAX);
                range.written += n;
                metrics::record_bytes_read(Operation::MultiRangeRead, n.unsigned_abs());
            }
            if let Some(err) = sink_error {
                self.finish(read_id, Err(StorageError::from(err)));
            } else if data.range_end {
                self.finish(read_id, Ok(()));
            }
        }
    }

    fn finish(&mut self, read_id: i64, result: Result<(), StorageError>) {
        if let Some(range) = self.active.remove(&read_id) {
            tracing::debug!(
                read_id,
                written = range.written,
                ok = result.is_ok(),
                "Range finished"
            );
            complete(range, result, &self.pending);
        }
    }

    /// Reopen after a stream failure. Ranges named in a per-range error
    /// detail fail on their own; the rest are re-requested. With no ranges
    /// left the stream stays closed until the next add.
    async fn recover(&mut self, err: StorageError) -> Result<(), StorageError> {
        self.requests = None;
        self.responses = futures::stream::pending().boxed();
        let range_errors = err
            .status()
            .and_then(retry::read_object_error)
            .map(|detail| detail.read_range_errors)
            .unwrap_or_default();

        if range_errors.is_empty() {
            self.session.observe_error(&err);
            self.retrier.pause(err, Operation::MultiRangeRead).await?;
        } else {
            for range_err in range_errors {
                let status = range_err.status.map_or_else(
                    || tonic::Status::unknown("range failed"),
                    |s| tonic::Status::new(tonic::Code::from_i32(s.code), s.message),
                );
                self.finish(range_err.read_id, Err(StorageError::Rpc(status)));
            }
            if self.active.is_empty() {
                self.idle = true;
                tracing::debug!("Multi-range stream idle after range errors");
                return Ok(());
            }
            self.retrier.wait_after(err, Operation::MultiRangeRead).await?;
        }
        self.reopen().await
    }

    /// Open a new stream requesting what every active range still needs.
    async fn reopen(&mut self) -> Result<(), StorageError> {
        let ranges: Vec<ReadRange> = self.active.values().map(ActiveRange::wire_range).collect();
        let opened = self
            .session
            .open(&mut self.retrier, Operation::MultiRangeRead, &ranges, true)
            .await?;
        metrics::record_reopen(Operation::MultiRangeRead);
        tracing::info!(active = ranges.len(), "Reopened multi-range stream");
        self.requests = opened.requests;
        self.responses = opened.responses;
        self.idle = false;
        self.handle_response(opened.first).await;
        Ok(())
    }

    /// Fail every active and queued range and stop accepting new ones.
    fn shutdown(&mut self, err: StorageError, permanent: bool) {
        {
            let mut shared = self.shared.lock();
            shared.done = true;
            if permanent {
                tracing::warn!(error = %err, "Multi-range stream failed permanently");
                shared.error = Some(err.clone());
            }
        }
        self.requests = None;
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            if let Command::Add(range) = command {
                self.active.insert(range.read_id, range);
            }
        }
        for (_, range) in self.active.drain() {
            complete(range, Err(err.clone()), &self.pending);
        }
    }
}
