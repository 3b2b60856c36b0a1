//! Range Reader
//!
//! Reads one byte range of an object over a bidi read stream. Content is
//! handed out as views into the received buffers. A stream that fails
//! mid-read is reopened at the first byte not yet received.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use bytes::{Buf, Bytes};
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::CallSettings;
use super::read_stream::ReadSession;
use crate::application::error::StorageError;
use crate::application::ports::{RawResponseStream, StorageTransport};
use crate::domain::object::{ObjectSpec, ReadHandle};
use crate::domain::range::{RangeRequest, resolve_range};
use crate::infrastructure::grpc::proto::{Object, ReadRange};
use crate::infrastructure::metrics::{self, Operation};
use crate::infrastructure::retry::Retrier;
use crate::infrastructure::wire::{DecodedResponse, decode_read_response};

const READ_ID: i64 = 1;

/// Object attributes reported when a read stream opens.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReaderAttrs {
    /// Size of the whole object.
    pub size: i64,
    /// Absolute offset of the first byte read.
    pub start_offset: i64,
    /// Content-Type.
    pub content_type: String,
    /// Content-Encoding.
    pub content_encoding: String,
    /// Cache-Control.
    pub cache_control: String,
    /// Last modification time.
    pub last_modified: Option<DateTime<Utc>>,
    /// Object generation.
    pub generation: i64,
    /// Metadata generation.
    pub metageneration: i64,
    /// CRC32C of the whole object, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crc32c: Option<u32>,
    /// User metadata.
    pub metadata: HashMap<String, String>,
}

impl ReaderAttrs {
    pub(crate) fn from_object(object: &Object, start_offset: i64) -> Self {
        Self {
            size: object.size,
            start_offset,
            content_type: object.content_type.clone(),
            content_encoding: object.content_encoding.clone(),
            cache_control: object.cache_control.clone(),
            last_modified: object
                .update_time
                .as_ref()
                .and_then(|ts| {
                    DateTime::from_timestamp(ts.seconds, u32::try_from(ts.nanos).unwrap_or(0))
                }),
            generation: object.generation,
            metageneration: object.metageneration,
            crc32c: object.checksums.as_ref().and_then(|c| c.crc32c),
            metadata: object.metadata.clone(),
        }
    }
}

/// Reader for one byte range of an object.
pub struct RangeReader {
    session: ReadSession,
    retrier: Retrier,
    request: RangeRequest,
    attrs: ReaderAttrs,
    responses: Option<RawResponseStream>,
    pending: VecDeque<Bytes>,
    /// Bytes this read will deliver in total.
    expected: i64,
    /// Bytes received so far, delivered or buffered.
    seen: i64,
    /// Bytes not yet delivered.
    remaining: i64,
    check_crc: bool,
    crc: u32,
    closed: bool,
}

impl std::fmt::Debug for RangeReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RangeReader")
            .field("bucket", &self.session.spec().bucket)
            .field("object", &self.session.spec().object)
            .field("request", &self.request)
            .field("seen", &self.seen)
            .field("remaining", &self.remaining)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl RangeReader {
    pub(crate) async fn open(
        transport: Arc<dyn StorageTransport>,
        spec: ObjectSpec,
        settings: CallSettings,
        request: RangeRequest,
    ) -> Result<Self, StorageError> {
        spec.validate()?;
        let mut session = ReadSession::new(transport, spec, settings);
        let mut retrier = session.retrier();
        let range = ReadRange {
            read_offset: request.offset,
            read_length: request.length.max(0),
            read_id: READ_ID,
        };
        let opened = session
            .open(&mut retrier, Operation::Read, &[range], false)
            .await?;

        let resolved = resolve_range(request, opened.metadata.size);
        let attrs = ReaderAttrs::from_object(&opened.metadata, resolved.start);
        let check_crc = request.is_full_object() && attrs.crc32c.is_some();

        tracing::debug!(
            bucket = %session.spec().bucket,
            object = %session.spec().object,
            offset = resolved.start,
            length = resolved.remaining,
            size = attrs.size,
            "Opened range reader"
        );

        let mut reader = Self {
            session,
            retrier,
            request,
            attrs,
            responses: Some(opened.responses),
            pending: VecDeque::new(),
            expected: resolved.remaining,
            seen: 0,
            remaining: resolved.remaining,
            check_crc,
            crc: 0,
            closed: false,
        };

        if request.length == 0 {
            reader.responses = None;
            return Ok(reader);
        }
        reader.absorb(opened.first)?;
        Ok(reader)
    }

    /// Attributes reported when the stream opened.
    #[must_use]
    pub const fn attrs(&self) -> &ReaderAttrs {
        &self.attrs
    }

    /// Bytes not yet returned to the caller.
    #[must_use]
    pub const fn remaining(&self) -> i64 {
        self.remaining
    }

    /// Latest read handle from the server.
    #[must_use]
    pub fn read_handle(&self) -> Option<ReadHandle> {
        self.session.read_handle().cloned()
    }

    /// Next chunk of content, or `None` at the end of the range.
    ///
    /// # Errors
    ///
    /// Fails if the reader is closed, a checksum does not match, or the
    /// stream fails permanently.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, StorageError> {
        if !self.fill().await? {
            return Ok(None);
        }
        let chunk = self.pending.pop_front().unwrap_or_default();
        self.consume(chunk.len());
        Ok(Some(chunk))
    }

    /// Copy content into `buf`, returning the number of bytes copied. Zero
    /// means the range is exhausted.
    ///
    /// # Errors
    ///
    /// As [`Self::next_chunk`].
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, StorageError> {
        if !self.fill().await? || buf.is_empty() {
            return Ok(0);
        }
        let mut copied = 0;
        while copied < buf.len() {
            let Some(front) = self.pending.front_mut() else {
                break;
            };
            let take = front.len().min(buf.len() - copied);
            buf[copied..copied + take].copy_from_slice(&front[..take]);
            front.advance(take);
            if front.is_empty() {
                self.pending.pop_front();
            }
            copied += take;
        }
        self.consume(copied);
        Ok(copied)
    }

    /// Copy the rest of the range into `writer`.
    ///
    /// # Errors
    ///
    /// As [`Self::next_chunk`], plus [`StorageError::Sink`] when the writer
    /// fails.
    pub async fn write_to<W>(&mut self, writer: &mut W) -> Result<u64, StorageError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut written = 0u64;
        while let Some(chunk) = self.next_chunk().await? {
            writer.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        writer.flush().await?;
        Ok(written)
    }

    /// Turn the reader into a stream of chunks.
    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes, StorageError>> + Send {
        futures::stream::try_unfold(self, |mut reader| async move {
            Ok(reader.next_chunk().await?.map(|chunk| (chunk, reader)))
        })
    }

    /// Close the stream. Later reads fail with [`StorageError::ReaderClosed`].
    pub fn close(&mut self) {
        self.closed = true;
        self.responses = None;
        self.pending.clear();
    }

    /// Ensure content is buffered. `false` means the range is exhausted.
    async fn fill(&mut self) -> Result<bool, StorageError> {
        loop {
            if self.closed {
                return Err(StorageError::ReaderClosed);
            }
            if !self.pending.is_empty() {
                return Ok(true);
            }
            if self.remaining <= 0 {
                self.finish()?;
                return Ok(false);
            }
            self.receive().await?;
        }
    }

    fn consume(&mut self, n: usize) {
        let n = i64::try_from(n).unwrap_or(i64::MAX);
        self.remaining -= n;
        metrics::record_bytes_read(Operation::Read, n.unsigned_abs());
    }

    /// Receive one message, reopening the stream on retryable failures.
    async fn receive(&mut self) -> Result<(), StorageError> {
        loop {
            let cancel = self.retrier.cancel_token();
            let next = match self.responses.as_mut() {
                Some(responses) => tokio::select! {
                    biased;
                    () = cancel.cancelled() => return Err(StorageError::Cancelled),
                    next = responses.next() => next,
                },
                None => None,
            };
            let err = match next {
                Some(Ok(message)) => {
                    let decoded = decode_read_response(&message)?;
                    self.session.observe(&decoded);
                    self.absorb(decoded)?;
                    self.retrier.reset();
                    return Ok(());
                }
                Some(Err(status)) => self.session.object_error(status),
                None => StorageError::UnexpectedEof {
                    remaining: self.remaining,
                },
            };
            self.responses = None;
            self.session.observe_error(&err);
            self.retrier.pause(err, Operation::Read).await?;
            self.reopen().await?;
        }
    }

    async fn reopen(&mut self) -> Result<(), StorageError> {
        let (offset, length) = self.request.resume_from(self.attrs.start_offset, self.seen);
        let range = ReadRange {
            read_offset: offset,
            read_length: length,
            read_id: READ_ID,
        };
        let opened = self
            .session
            .open(&mut self.retrier, Operation::Read, &[range], false)
            .await?;
        metrics::record_reopen(Operation::Read);
        tracing::info!(
            object = %self.session.spec().object,
            offset,
            seen = self.seen,
            "Reopened read stream"
        );
        self.responses = Some(opened.responses);
        self.absorb(opened.first)
    }

    /// Verify and buffer the content of a decoded message.
    fn absorb(&mut self, response: DecodedResponse) -> Result<(), StorageError> {
        for data in response.ranges {
            if data.read_range.read_id != READ_ID {
                continue;
            }
            if !data.checksum_matches() {
                metrics::record_checksum_mismatch(Operation::Read);
                return Err(StorageError::ChecksumMismatch {
                    got: data.content.crc32c(),
                    want: data.crc32c.unwrap_or_default(),
                });
            }
            let mut room = usize::try_from(self.expected - self.seen).unwrap_or(0);
            for mut chunk in data.content {
                if room == 0 {
                    break;
                }
                chunk.truncate(room);
                room -= chunk.len();
                self.seen += i64::try_from(chunk.len()).unwrap_or(i64::MAX);
                if self.check_crc {
                    self.crc = crc32c::crc32c_append(self.crc, &chunk);
                }
                self.pending.push_back(chunk);
            }
        }
        Ok(())
    }

    /// Check the whole-object checksum once all bytes are delivered.
    fn finish(&mut self) -> Result<(), StorageError> {
        self.responses = None;
        if !self.check_crc {
            return Ok(());
        }
        self.check_crc = false;
        let want = self.attrs.crc32c.unwrap_or_default();
        if self.crc != want {
            metrics::record_checksum_mismatch(Operation::Read);
            return Err(StorageError::ChecksumMismatch {
                got: self.crc,
                want,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::grpc::proto::ObjectChecksums;

    #[test]
    fn attrs_from_object_metadata() {
        let object = Object {
            size: 1024,
            generation: 7,
            metageneration: 2,
            content_type: "text/plain".into(),
            checksums: Some(ObjectChecksums {
                crc32c: Some(42),
                ..ObjectChecksums::default()
            }),
            update_time: Some(prost_types::Timestamp {
                seconds: 1_700_000_000,
                nanos: 0,
            }),
            ..Object::default()
        };

        let attrs = ReaderAttrs::from_object(&object, 100);
        assert_eq!(attrs.size, 1024);
        assert_eq!(attrs.start_offset, 100);
        assert_eq!(attrs.crc32c, Some(42));
        assert_eq!(attrs.last_modified.unwrap().timestamp(), 1_700_000_000);
    }

    #[test]
    fn attrs_serialize_without_unknown_checksum() {
        let attrs = ReaderAttrs {
            size: 5,
            generation: 3,
            ..ReaderAttrs::default()
        };
        let json = serde_json::to_value(&attrs).unwrap();
        assert_eq!(json["size"], 5);
        assert_eq!(json["generation"], 3);
        assert!(json.get("crc32c").is_none());
    }
}
