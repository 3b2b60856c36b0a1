//! Object Writer
//!
//! Uploads object data over `BidiWriteObject`. Data is buffered until a
//! chunk boundary, sent in messages of at most [`MAX_WRITE_CHUNK_BYTES`],
//! and the last message of each chunk asks the server to persist and report
//! its persisted size. Bytes stay buffered until the server has persisted
//! them so a failed stream can be resumed from the persisted offset.
//!
//! # Modes
//!
//! - **Resumable**: `StartResumableWrite` session; recovery queries
//!   `QueryWriteStatus`.
//! - **One-shot**: chunk size zero; data goes out as written and is not
//!   retained, so nothing is retried once data was sent.
//! - **Appendable**: creates an unfinalized object that can be flushed,
//!   reopened with `AppendObjectSpec`, taken over, and optionally left
//!   unfinalized on close.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use bytes::{Buf, Bytes, BytesMut};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::CallSettings;
use crate::application::error::StorageError;
use crate::application::ports::{RequestParams, StorageTransport, WriteResponseStream};
use crate::domain::object::{ObjectSpec, WriteHandle};
use crate::infrastructure::grpc::proto::{
    AppendObjectSpec, BidiWriteHandle, BidiWriteObjectRequest, ChecksummedData, Object,
    ObjectChecksums, QueryWriteStatusRequest, StartResumableWriteRequest, WriteObjectSpec,
    bidi_write_object_request::{Data, FirstMessage},
    bidi_write_object_response::WriteStatus,
    query_write_status_response,
};
use crate::infrastructure::metrics::{self, Operation};
use crate::infrastructure::retry::{self, Retrier};

/// Default chunk size for resumable and appendable uploads (16 MiB).
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024 * 1024;

/// Chunk sizes are rounded up to a multiple of this (256 KiB).
pub const WRITE_CHUNK_ALIGNMENT: usize = 256 * 1024;

/// Largest payload carried by one request message (2 MiB).
pub const MAX_WRITE_CHUNK_BYTES: usize = 2 * 1024 * 1024;

/// Callback receiving the persisted byte count.
pub type ProgressFn = Arc<dyn Fn(i64) + Send + Sync>;

// =============================================================================
// Options
// =============================================================================

/// Options for a new upload.
#[derive(Clone)]
pub struct WriterOptions {
    /// Bytes buffered before a flush; zero selects a one-shot upload.
    pub chunk_size: usize,
    /// Send per-message CRC32C and the object CRC32C on finish.
    pub send_crc32c: bool,
    /// Compute and send the object MD5 on finish.
    pub send_md5: bool,
    /// Object checksums supplied by the caller; override computed ones.
    pub checksums: Option<ObjectChecksums>,
    /// Create an appendable object.
    pub appendable: bool,
    /// Finalize an appendable object on close.
    pub finalize_on_close: bool,
    /// Content-Type.
    pub content_type: Option<String>,
    /// Content-Encoding.
    pub content_encoding: Option<String>,
    /// Cache-Control.
    pub cache_control: Option<String>,
    /// Content-Disposition.
    pub content_disposition: Option<String>,
    /// Content-Language.
    pub content_language: Option<String>,
    /// User metadata.
    pub metadata: HashMap<String, String>,
    /// Predefined ACL name.
    pub predefined_acl: Option<String>,
    /// Expected final size.
    pub object_size: Option<i64>,
    /// Persisted-size callback.
    pub progress: Option<ProgressFn>,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            send_crc32c: true,
            send_md5: false,
            checksums: None,
            appendable: false,
            finalize_on_close: true,
            content_type: None,
            content_encoding: None,
            cache_control: None,
            content_disposition: None,
            content_language: None,
            metadata: HashMap::new(),
            predefined_acl: None,
            object_size: None,
            progress: None,
        }
    }
}

impl fmt::Debug for WriterOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriterOptions")
            .field("chunk_size", &self.chunk_size)
            .field("send_crc32c", &self.send_crc32c)
            .field("send_md5", &self.send_md5)
            .field("appendable", &self.appendable)
            .field("finalize_on_close", &self.finalize_on_close)
            .field("content_type", &self.content_type)
            .field("progress", &self.progress.is_some())
            .finish_non_exhaustive()
    }
}

impl WriterOptions {
    /// Set the chunk size.
    #[must_use]
    pub const fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Create an appendable object.
    #[must_use]
    pub const fn appendable(mut self, finalize_on_close: bool) -> Self {
        self.appendable = true;
        self.finalize_on_close = finalize_on_close;
        self
    }

    /// Set the Content-Type.
    #[must_use]
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Set the progress callback.
    #[must_use]
    pub fn with_progress(mut self, progress: impl Fn(i64) + Send + Sync + 'static) -> Self {
        self.progress = Some(Arc::new(progress));
        self
    }

    /// Chunk size rounded up to [`WRITE_CHUNK_ALIGNMENT`].
    #[must_use]
    pub const fn effective_chunk_size(&self) -> usize {
        if self.chunk_size == 0 {
            return 0;
        }
        self.chunk_size.div_ceil(WRITE_CHUNK_ALIGNMENT) * WRITE_CHUNK_ALIGNMENT
    }
}

// =============================================================================
// Send Buffer
// =============================================================================

/// Unpersisted upload data. Bytes are frozen the first time they are sent,
/// so resends hand out views of the same allocation.
#[derive(Debug, Default)]
struct SendBuffer {
    frozen: VecDeque<Bytes>,
    frozen_len: usize,
    tail: BytesMut,
}

impl SendBuffer {
    fn len(&self) -> usize {
        self.frozen_len + self.tail.len()
    }

    fn extend_from_slice(&mut self, data: &[u8]) {
        self.tail.extend_from_slice(data);
    }

    /// Views of `[start, end)`, each at most `max_piece` bytes.
    fn pieces(&mut self, start: usize, end: usize, max_piece: usize) -> Vec<Bytes> {
        let end = end.min(self.len());
        if end > self.frozen_len {
            let frozen = self.tail.split_to(end - self.frozen_len).freeze();
            self.frozen_len += frozen.len();
            self.frozen.push_back(frozen);
        }

        let mut pieces = Vec::new();
        let mut base = 0;
        for buf in &self.frozen {
            let buf_end = base + buf.len();
            let mut from = start.max(base);
            let to = end.min(buf_end);
            while from < to {
                let next = (from + max_piece).min(to);
                pieces.push(buf.slice(from - base..next - base));
                from = next;
            }
            if buf_end >= end {
                break;
            }
            base = buf_end;
        }
        pieces
    }

    /// Drop the first `n` bytes.
    fn advance(&mut self, mut n: usize) {
        while n > 0 {
            let Some(front) = self.frozen.front_mut() else {
                let take = n.min(self.tail.len());
                self.tail.advance(take);
                return;
            };
            if front.len() > n {
                front.advance(n);
                self.frozen_len -= n;
                return;
            }
            n -= front.len();
            self.frozen_len -= front.len();
            self.frozen.pop_front();
        }
    }

    fn clear(&mut self) {
        self.frozen.clear();
        self.frozen_len = 0;
        self.tail.clear();
    }
}

// =============================================================================
// Writer
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum Mode {
    Resumable { upload_id: Option<String> },
    OneShot,
    Appendable {
        generation: Option<i64>,
        write_handle: Option<WriteHandle>,
        routing_token: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Finish {
    Flush,
    Finalize,
}

struct WriteStream {
    requests: mpsc::UnboundedSender<BidiWriteObjectRequest>,
    responses: WriteResponseStream,
    first_message: Option<FirstMessage>,
}

/// Streams object data to storage.
pub struct ObjectWriter {
    transport: Arc<dyn StorageTransport>,
    spec: ObjectSpec,
    settings: CallSettings,
    options: WriterOptions,
    chunk_size: usize,
    mode: Mode,
    retrier: Retrier,
    stream: Option<WriteStream>,
    /// Bytes from `buffer_start` not yet persisted.
    buffer: SendBuffer,
    buffer_start: i64,
    /// One past the last byte sent on the current stream.
    sent: i64,
    persisted: i64,
    crc: Option<u32>,
    md5: Option<md5::Context>,
    resource: Option<Object>,
    finalized: bool,
    closed: bool,
}

impl fmt::Debug for ObjectWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectWriter")
            .field("bucket", &self.spec.bucket)
            .field("object", &self.spec.object)
            .field("mode", &self.mode)
            .field("buffer_start", &self.buffer_start)
            .field("sent", &self.sent)
            .field("persisted", &self.persisted)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl ObjectWriter {
    pub(crate) fn new(
        transport: Arc<dyn StorageTransport>,
        spec: ObjectSpec,
        settings: CallSettings,
        options: WriterOptions,
    ) -> Result<Self, StorageError> {
        spec.validate()?;
        let chunk_size = options.effective_chunk_size();
        let mode = if options.appendable {
            if chunk_size == 0 {
                return Err(StorageError::InvalidArgument(
                    "appendable uploads need a non-zero chunk size".into(),
                ));
            }
            Mode::Appendable {
                generation: None,
                write_handle: None,
                routing_token: None,
            }
        } else if chunk_size == 0 {
            Mode::OneShot
        } else {
            Mode::Resumable { upload_id: None }
        };
        let retrier = settings.retrier();
        let crc = options.send_crc32c.then_some(0);
        let md5 = options.send_md5.then(md5::Context::new);
        Ok(Self {
            transport,
            spec,
            settings,
            options,
            chunk_size,
            mode,
            retrier,
            stream: None,
            buffer: SendBuffer::default(),
            buffer_start: 0,
            sent: 0,
            persisted: 0,
            crc,
            md5,
            resource: None,
            finalized: false,
            closed: false,
        })
    }

    /// Continue writing an unfinalized appendable object. Writing resumes
    /// at the size the server reports as persisted.
    pub(crate) async fn takeover(
        transport: Arc<dyn StorageTransport>,
        spec: ObjectSpec,
        settings: CallSettings,
        options: WriterOptions,
    ) -> Result<Self, StorageError> {
        let Some(generation) = spec.generation else {
            return Err(StorageError::InvalidArgument(
                "takeover needs the generation of the appendable object".into(),
            ));
        };
        let options = WriterOptions {
            appendable: true,
            ..options
        };
        let mut writer = Self::new(transport, spec, settings, options)?;
        writer.mode = Mode::Appendable {
            generation: Some(generation),
            write_handle: None,
            routing_token: None,
        };
        // The existing prefix was not hashed here.
        writer.crc = None;
        writer.md5 = None;

        loop {
            match writer.resume_appendable(true).await {
                Ok(()) => break,
                Err(err) => {
                    writer.stream = None;
                    writer.observe_error(&err);
                    writer.retrier.pause(err, Operation::Write).await?;
                }
            }
        }
        writer.retrier.reset();
        tracing::info!(
            object = %writer.spec.object,
            generation,
            persisted = writer.persisted,
            "Took over appendable object"
        );
        Ok(writer)
    }

    /// Bytes the server has acknowledged as persisted.
    #[must_use]
    pub const fn persisted_size(&self) -> i64 {
        self.persisted
    }

    /// Offset at which the next written byte lands.
    #[must_use]
    pub fn offset(&self) -> i64 {
        self.buffer_end()
    }

    /// Generation of an appendable object, once known.
    #[must_use]
    pub const fn generation(&self) -> Option<i64> {
        match &self.mode {
            Mode::Appendable { generation, .. } => *generation,
            _ => None,
        }
    }

    /// Buffer `data`, sending full chunks.
    ///
    /// # Errors
    ///
    /// Fails if the writer is closed or the upload fails permanently.
    pub async fn write(&mut self, data: &[u8]) -> Result<usize, StorageError> {
        self.check_open()?;
        if let Some(crc) = self.crc.as_mut() {
            *crc = crc32c::crc32c_append(*crc, data);
        }
        if let Some(md5) = self.md5.as_mut() {
            md5.consume(data);
        }
        self.buffer.extend_from_slice(data);

        if self.mode == Mode::OneShot {
            self.send_one_shot().await?;
            return Ok(data.len());
        }

        let chunk = i64::try_from(self.chunk_size).unwrap_or(i64::MAX);
        while self.buffer_end() - self.sent >= chunk {
            let upto = self.sent + chunk;
            self.sync(upto, Finish::Flush).await?;
        }
        Ok(data.len())
    }

    /// Send all buffered data and wait until the server reports it
    /// persisted. Returns the persisted size.
    ///
    /// # Errors
    ///
    /// [`StorageError::InvalidArgument`] for one-shot uploads, otherwise as
    /// [`Self::write`].
    pub async fn flush(&mut self) -> Result<i64, StorageError> {
        self.check_open()?;
        if self.mode == Mode::OneShot {
            return Err(StorageError::InvalidArgument(
                "flush needs a resumable or appendable upload".into(),
            ));
        }
        self.sync(self.buffer_end(), Finish::Flush).await?;
        Ok(self.persisted)
    }

    /// Send the remaining data and finish the upload. Appendable uploads
    /// opened with `finalize_on_close = false` are flushed and left
    /// unfinalized.
    ///
    /// # Errors
    ///
    /// As [`Self::write`].
    pub async fn close(&mut self) -> Result<Object, StorageError> {
        self.check_open()?;
        let leave_open =
            matches!(self.mode, Mode::Appendable { .. }) && !self.options.finalize_on_close;
        if leave_open {
            self.sync(self.buffer_end(), Finish::Flush).await?;
        } else if self.mode == Mode::OneShot {
            self.finish_one_shot().await?;
        } else if !self.finalized {
            self.sync(self.buffer_end(), Finish::Finalize).await?;
        }
        self.closed = true;
        self.stream = None;

        let mut object = self.resource.clone().unwrap_or_else(|| Object {
            name: self.spec.object.clone(),
            bucket: self.spec.bucket_resource(),
            generation: self.generation().unwrap_or_default(),
            ..Object::default()
        });
        if leave_open {
            object.size = self.persisted;
        }
        tracing::info!(
            object = %self.spec.object,
            size = object.size,
            finalized = !leave_open,
            "Closed writer"
        );
        Ok(object)
    }

    // -------------------------------------------------------------------------
    // Chunk cycle
    // -------------------------------------------------------------------------

    /// Send bytes up to `upto` and wait for the acknowledgement, recovering
    /// from transient failures.
    async fn sync(&mut self, upto: i64, finish: Finish) -> Result<(), StorageError> {
        loop {
            match self.sync_once(upto, finish).await {
                Ok(()) => {
                    self.retrier.reset();
                    return Ok(());
                }
                Err(err) => {
                    self.stream = None;
                    self.observe_error(&err);
                    self.retrier.pause(err, Operation::Write).await?;
                    metrics::record_reopen(Operation::Write);
                    self.recover().await?;
                    if self.finalized {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn sync_once(&mut self, upto: i64, finish: Finish) -> Result<(), StorageError> {
        self.ensure_stream().await?;
        let started = Instant::now();
        self.send_range(upto, Some(finish))?;
        self.await_ack(finish).await?;
        if finish == Finish::Flush {
            metrics::record_flush_duration(started.elapsed());
        }
        Ok(())
    }

    /// Send buffered bytes in `[sent, upto)`. The last message carries the
    /// flags for `finish`; with nothing to send the flags go out alone.
    fn send_range(&mut self, upto: i64, finish: Option<Finish>) -> Result<(), StorageError> {
        let start = usize::try_from(self.sent - self.buffer_start).unwrap_or(0);
        let end = usize::try_from(upto - self.buffer_start).unwrap_or(0);
        let mut pieces = self.buffer.pieces(start, end, MAX_WRITE_CHUNK_BYTES);
        if pieces.is_empty() && finish.is_some() {
            pieces.push(Bytes::new());
        }

        let count = pieces.len();
        for (i, piece) in pieces.into_iter().enumerate() {
            let mut request = self.data_request(piece);
            if i + 1 == count {
                match finish {
                    Some(Finish::Flush) => {
                        request.flush = true;
                        request.state_lookup = true;
                    }
                    Some(Finish::Finalize) => {
                        request.finish_write = true;
                        request.object_checksums = self.object_checksums();
                    }
                    None => {}
                }
            }
            self.send_request(request)?;
        }
        Ok(())
    }

    fn data_request(&mut self, content: Bytes) -> BidiWriteObjectRequest {
        let len = i64::try_from(content.len()).unwrap_or(i64::MAX);
        let write_offset = self.sent;
        self.sent += len;
        let data = (!content.is_empty()).then(|| {
            let crc32c = self.options.send_crc32c.then(|| crc32c::crc32c(&content));
            Data::ChecksummedData(ChecksummedData { content, crc32c })
        });
        BidiWriteObjectRequest {
            write_offset,
            data,
            ..BidiWriteObjectRequest::default()
        }
    }

    fn send_request(&mut self, mut request: BidiWriteObjectRequest) -> Result<(), StorageError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| StorageError::Protocol("write stream is not open".into()))?;
        if let Some(first) = stream.first_message.take() {
            request.first_message = Some(first);
            request.common_object_request_params =
                super::common_params(self.spec.encryption_key.as_ref());
        }
        stream
            .requests
            .send(request)
            .map_err(|_| StorageError::StreamClosed)
    }

    /// Read responses until the server acknowledges `finish`.
    async fn await_ack(&mut self, finish: Finish) -> Result<(), StorageError> {
        loop {
            match self.next_status().await? {
                WriteStatus::PersistedSize(size) => {
                    self.apply_persisted(size)?;
                    if finish == Finish::Flush {
                        return Ok(());
                    }
                }
                WriteStatus::Resource(object) => {
                    let done = self.apply_resource(object)?;
                    if done || finish == Finish::Flush {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Next response that reports upload state.
    async fn next_status(&mut self) -> Result<WriteStatus, StorageError> {
        loop {
            let stream = self
                .stream
                .as_mut()
                .ok_or_else(|| StorageError::Protocol("write stream is not open".into()))?;
            let Some(response) = stream.responses.next().await else {
                return Err(StorageError::UnexpectedEof {
                    remaining: self.sent - self.persisted,
                });
            };
            let response = response?;
            if let Some(handle) = response.write_handle
                && let Mode::Appendable { write_handle, .. } = &mut self.mode
            {
                *write_handle = Some(WriteHandle::new(handle.handle));
            }
            if let Some(status) = response.write_status {
                return Ok(status);
            }
        }
    }

    /// Record a returned resource. Returns whether it is finalized.
    fn apply_resource(&mut self, object: Object) -> Result<bool, StorageError> {
        let unfinalized =
            matches!(self.mode, Mode::Appendable { .. }) && object.finalize_time.is_none();
        if let Mode::Appendable { generation, .. } = &mut self.mode
            && object.generation != 0
        {
            *generation = Some(object.generation);
        }
        self.apply_persisted(object.size)?;
        self.resource = Some(object);
        if !unfinalized {
            self.finalized = true;
        }
        Ok(!unfinalized)
    }

    /// Drop persisted bytes from the buffer.
    fn apply_persisted(&mut self, persisted: i64) -> Result<(), StorageError> {
        if persisted < self.buffer_start || persisted > self.sent {
            return Err(StorageError::PersistedOffsetMismatch {
                persisted,
                buffer_start: self.buffer_start,
                sent: self.sent,
            });
        }
        let consumed = usize::try_from(persisted - self.buffer_start).unwrap_or(0);
        self.buffer.advance(consumed);
        self.buffer_start = persisted;
        if persisted > self.persisted {
            metrics::record_bytes_written((persisted - self.persisted).unsigned_abs());
            self.persisted = persisted;
            if let Some(progress) = &self.options.progress {
                progress(persisted);
            }
        }
        tracing::debug!(persisted, sent = self.sent, "Write acknowledged");
        Ok(())
    }

    fn object_checksums(&self) -> Option<ObjectChecksums> {
        if let Some(checksums) = &self.options.checksums {
            return Some(checksums.clone());
        }
        if self.crc.is_none() && self.md5.is_none() {
            return None;
        }
        Some(ObjectChecksums {
            crc32c: self.crc,
            md5_hash: self
                .md5
                .clone()
                .map(|md5| Bytes::copy_from_slice(&md5.compute().0))
                .unwrap_or_default(),
        })
    }

    // -------------------------------------------------------------------------
    // One-shot
    // -------------------------------------------------------------------------

    async fn send_one_shot(&mut self) -> Result<(), StorageError> {
        while let Err(err) = self.ensure_stream().await {
            self.retrier.pause(err, Operation::Write).await?;
        }
        let end = self.buffer_end();
        self.send_range(end, None)?;
        // Nothing is retained; a failure after this point is final.
        self.buffer.clear();
        self.buffer_start = self.sent;
        Ok(())
    }

    async fn finish_one_shot(&mut self) -> Result<(), StorageError> {
        loop {
            let result = self.finish_one_shot_once().await;
            match result {
                Ok(()) => return Ok(()),
                Err(err) if self.buffer_start > 0 => return Err(err),
                Err(err) => {
                    self.stream = None;
                    self.retrier.pause(err, Operation::Write).await?;
                    self.sent = self.buffer_start;
                }
            }
        }
    }

    async fn finish_one_shot_once(&mut self) -> Result<(), StorageError> {
        self.ensure_stream().await?;
        let end = self.buffer_end();
        self.send_range(end, Some(Finish::Finalize))?;
        self.await_ack(Finish::Finalize).await
    }

    // -------------------------------------------------------------------------
    // Streams and recovery
    // -------------------------------------------------------------------------

    async fn ensure_stream(&mut self) -> Result<(), StorageError> {
        if self.stream.is_some() {
            return Ok(());
        }
        let first_message = match self.mode.clone() {
            Mode::Resumable { upload_id } => {
                let upload_id = match upload_id {
                    Some(id) => id,
                    None => self.start_resumable_write().await?,
                };
                FirstMessage::UploadId(upload_id)
            }
            Mode::OneShot
            | Mode::Appendable {
                generation: None, ..
            } => FirstMessage::WriteObjectSpec(self.write_object_spec()),
            Mode::Appendable {
                generation: Some(generation),
                write_handle,
                routing_token,
            } => {
                let conditions = self.spec.conditions.unwrap_or_default();
                FirstMessage::AppendObjectSpec(AppendObjectSpec {
                    bucket: self.spec.bucket_resource(),
                    object: self.spec.object.clone(),
                    generation,
                    if_metageneration_match: conditions.metageneration_match,
                    if_metageneration_not_match: conditions.metageneration_not_match,
                    routing_token,
                    write_handle: write_handle.map(|handle| BidiWriteHandle {
                        handle: handle.as_bytes().clone(),
                    }),
                })
            }
        };

        let routing_token = match &self.mode {
            Mode::Appendable { routing_token, .. } => routing_token.clone(),
            _ => None,
        };
        let params = self.params(routing_token);
        let (tx, rx) = mpsc::unbounded_channel();
        let responses = self
            .transport
            .bidi_write_object(params, UnboundedReceiverStream::new(rx).boxed())
            .await?;
        self.stream = Some(WriteStream {
            requests: tx,
            responses,
            first_message: Some(first_message),
        });
        Ok(())
    }

    async fn start_resumable_write(&mut self) -> Result<String, StorageError> {
        let request = StartResumableWriteRequest {
            write_object_spec: Some(self.write_object_spec()),
            common_object_request_params: super::common_params(self.spec.encryption_key.as_ref()),
            object_checksums: self.options.checksums.clone(),
        };
        let params = self.params(None);
        let transport = Arc::clone(&self.transport);
        let response = self
            .retrier
            .run(Operation::StartResumableWrite, || {
                let transport = Arc::clone(&transport);
                let params = params.clone();
                let request = request.clone();
                async move {
                    transport
                        .start_resumable_write(params, request)
                        .await
                        .map_err(StorageError::from)
                }
            })
            .await?;
        tracing::debug!(upload_id = %response.upload_id, "Started resumable upload");
        self.mode = Mode::Resumable {
            upload_id: Some(response.upload_id.clone()),
        };
        Ok(response.upload_id)
    }

    /// Re-establish how much the server holds after a failed stream.
    async fn recover(&mut self) -> Result<(), StorageError> {
        match self.mode.clone() {
            Mode::Resumable { upload_id: None } | Mode::OneShot => {
                self.sent = self.buffer_start;
                Ok(())
            }
            Mode::Resumable {
                upload_id: Some(upload_id),
            } => self.recover_resumable(upload_id).await,
            Mode::Appendable {
                generation: None, ..
            } => {
                // The object was never created; start over.
                self.sent = self.buffer_start;
                Ok(())
            }
            Mode::Appendable { .. } => loop {
                match self.resume_appendable(false).await {
                    Ok(()) => return Ok(()),
                    Err(err) => {
                        self.stream = None;
                        self.observe_error(&err);
                        self.retrier.pause(err, Operation::Write).await?;
                    }
                }
            },
        }
    }

    async fn recover_resumable(&mut self, upload_id: String) -> Result<(), StorageError> {
        let request = QueryWriteStatusRequest {
            upload_id,
            common_object_request_params: super::common_params(self.spec.encryption_key.as_ref()),
        };
        let params = self.params(None);
        let transport = Arc::clone(&self.transport);
        let response = self
            .retrier
            .run(Operation::QueryWriteStatus, || {
                let transport = Arc::clone(&transport);
                let params = params.clone();
                let request = request.clone();
                async move {
                    transport
                        .query_write_status(params, request)
                        .await
                        .map_err(StorageError::from)
                }
            })
            .await?;
        match response.write_status {
            Some(query_write_status_response::WriteStatus::PersistedSize(size)) => {
                self.apply_persisted(size)?;
                self.sent = size;
            }
            Some(query_write_status_response::WriteStatus::Resource(object)) => {
                self.sent = self.sent.max(object.size);
                self.apply_resource(object)?;
            }
            None => {
                return Err(StorageError::Protocol(
                    "write status response carried no state".into(),
                ));
            }
        }
        tracing::info!(persisted = self.persisted, "Resuming upload");
        Ok(())
    }

    /// Reopen an appendable object and resume at its persisted size. On
    /// takeover nothing is buffered and writing starts at that size.
    async fn resume_appendable(&mut self, takeover: bool) -> Result<(), StorageError> {
        self.ensure_stream().await?;
        self.send_request(BidiWriteObjectRequest {
            write_offset: self.buffer_start,
            state_lookup: true,
            ..BidiWriteObjectRequest::default()
        })?;
        let size = match self.next_status().await? {
            WriteStatus::PersistedSize(size) => size,
            WriteStatus::Resource(object) if object.finalize_time.is_some() => {
                if takeover {
                    return Err(StorageError::InvalidArgument(format!(
                        "object {} is already finalized",
                        self.spec.object
                    )));
                }
                // The finalizing request landed but its reply was lost.
                self.sent = self.sent.max(object.size);
                self.apply_resource(object)?;
                return Ok(());
            }
            WriteStatus::Resource(object) => {
                let size = object.size;
                self.resource = Some(object);
                size
            }
        };
        if takeover {
            self.buffer_start = size;
            self.persisted = size;
        } else {
            self.apply_persisted(size)?;
        }
        self.sent = size;
        Ok(())
    }

    fn observe_error(&mut self, err: &StorageError) {
        let Some(redirect) = err.status().and_then(retry::write_redirect) else {
            return;
        };
        if let Mode::Appendable {
            generation,
            write_handle,
            routing_token,
        } = &mut self.mode
        {
            tracing::debug!(object = %self.spec.object, "Write stream redirected");
            if redirect.routing_token.is_some() {
                *routing_token = redirect.routing_token;
            }
            if let Some(handle) = redirect.write_handle {
                *write_handle = Some(WriteHandle::new(handle.handle));
            }
            if redirect.generation.is_some() {
                *generation = redirect.generation;
            }
        }
    }

    fn write_object_spec(&self) -> WriteObjectSpec {
        let conditions = self.spec.conditions.unwrap_or_default();
        WriteObjectSpec {
            resource: Some(Object {
                name: self.spec.object.clone(),
                bucket: self.spec.bucket_resource(),
                content_type: self.options.content_type.clone().unwrap_or_default(),
                content_encoding: self.options.content_encoding.clone().unwrap_or_default(),
                cache_control: self.options.cache_control.clone().unwrap_or_default(),
                content_disposition: self.options.content_disposition.clone().unwrap_or_default(),
                content_language: self.options.content_language.clone().unwrap_or_default(),
                metadata: self.options.metadata.clone(),
                ..Object::default()
            }),
            if_generation_match: conditions.if_generation_match(),
            if_generation_not_match: conditions.generation_not_match,
            if_metageneration_match: conditions.metageneration_match,
            if_metageneration_not_match: conditions.metageneration_not_match,
            predefined_acl: self.options.predefined_acl.clone().unwrap_or_default(),
            object_size: self.options.object_size,
            appendable: matches!(self.mode, Mode::Appendable { .. }).then_some(true),
        }
    }

    fn params(&self, routing_token: Option<String>) -> RequestParams {
        self.settings
            .request_params(self.spec.bucket_resource(), routing_token)
    }

    fn buffer_end(&self) -> i64 {
        self.buffer_start + i64::try_from(self.buffer.len()).unwrap_or(i64::MAX)
    }

    const fn check_open(&self) -> Result<(), StorageError> {
        if self.closed {
            return Err(StorageError::StreamClosed);
        }
        Ok(())
    }
}
