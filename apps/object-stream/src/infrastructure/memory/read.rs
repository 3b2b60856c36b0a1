//! `BidiReadObject` emulation.
//!
//! Serves requested ranges round-robin, one chunk per message, so ranges
//! of a multi-range stream interleave. Ranges added while the stream is
//! open are picked up between messages.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;
use prost::Message;
use tokio::sync::mpsc::UnboundedSender;
use tonic::{Code, Status};

use super::Fault;
use super::store::{Store, check_conditions};
use crate::application::ports::RequestStream;
use crate::infrastructure::grpc::proto::{
    BidiReadHandle, BidiReadObjectError, BidiReadObjectRedirectedError, BidiReadObjectRequest,
    BidiReadObjectResponse, BidiReadObjectSpec, ChecksummedData, Object, ObjectRangeData,
    READ_OBJECT_ERROR_TYPE_URL, READ_REDIRECT_TYPE_URL, ReadRange, ReadRangeError,
    google::rpc,
};
use crate::infrastructure::retry::status_with_detail;
use crate::infrastructure::wire::BufferSlice;

type Responses = UnboundedSender<Result<BufferSlice, Status>>;

struct Cursor {
    read_id: i64,
    position: usize,
    end: usize,
}

struct ReadStream {
    store: Arc<Mutex<Store>>,
    tx: Responses,
    meta: Object,
    data: Bytes,
    queue: VecDeque<Cursor>,
    sent: usize,
    fault: Option<(usize, Fault)>,
    max_chunk: usize,
    split: Option<usize>,
}

pub(super) async fn serve(
    store: Arc<Mutex<Store>>,
    mut requests: RequestStream<BidiReadObjectRequest>,
    tx: Responses,
    fault: Option<(usize, Fault)>,
) {
    let Some(first) = requests.next().await else {
        return;
    };
    let Some(spec) = first.read_object_spec else {
        let _ = tx.send(Err(Status::invalid_argument(
            "first request must carry read_object_spec",
        )));
        return;
    };

    let opened = open(&store, &spec);
    let (meta, data) = match opened {
        Ok(found) => found,
        Err(status) => {
            let _ = tx.send(Err(status));
            return;
        }
    };
    let (max_chunk, split) = {
        let store = store.lock();
        (store.max_read_chunk.max(1), store.response_split)
    };

    let mut stream = ReadStream {
        store,
        tx,
        meta,
        data,
        queue: VecDeque::new(),
        sent: 0,
        fault,
        max_chunk,
        split,
    };
    if stream.fail_if_due() {
        return;
    }
    if let Err(status) = stream.add_ranges(&first.read_ranges) {
        let _ = stream.tx.send(Err(status));
        return;
    }

    let metadata = Some(stream.meta.clone());
    if !stream.send_next(metadata) {
        return;
    }

    let mut half_closed = false;
    loop {
        while !half_closed {
            match requests.next().now_or_never() {
                Some(Some(request)) => {
                    if let Err(status) = stream.add_ranges(&request.read_ranges) {
                        let _ = stream.tx.send(Err(status));
                        return;
                    }
                }
                Some(None) => half_closed = true,
                None => break,
            }
        }

        if stream.queue.is_empty() {
            if half_closed {
                return;
            }
            tokio::select! {
                () = stream.tx.closed() => return,
                request = requests.next() => match request {
                    Some(request) => {
                        if let Err(status) = stream.add_ranges(&request.read_ranges) {
                            let _ = stream.tx.send(Err(status));
                            return;
                        }
                    }
                    None => return,
                },
            }
            continue;
        }

        if stream.fail_if_due() || !stream.send_next(None) {
            return;
        }
        tokio::task::yield_now().await;
    }
}

/// Look up the object named by `spec` and check it may be read.
fn open(store: &Mutex<Store>, spec: &BidiReadObjectSpec) -> Result<(Object, Bytes), Status> {
    let mut store = store.lock();
    store.read_specs.push(spec.clone());
    let found = store.get(&spec.bucket, &spec.object).cloned();
    let live = found.as_ref().map(|object| &object.meta);
    check_conditions(
        live,
        spec.if_generation_match,
        spec.if_generation_not_match,
        spec.if_metageneration_match,
        spec.if_metageneration_not_match,
    )?;
    match found {
        Some(object) if spec.generation == 0 || spec.generation == object.meta.generation => {
            Ok((object.meta, object.data))
        }
        _ => Err(Status::not_found(format!(
            "object {}/{} not found",
            spec.bucket, spec.object
        ))),
    }
}

impl ReadStream {
    fn size(&self) -> usize {
        self.data.len()
    }

    /// Queue `ranges`; offsets past the end fail their ranges through a
    /// `BidiReadObjectError` that ends the stream.
    fn add_ranges(&mut self, ranges: &[ReadRange]) -> Result<(), Status> {
        let size = i64::try_from(self.size()).unwrap_or(i64::MAX);
        let mut errors = Vec::new();
        for range in ranges {
            if range.read_length < 0 {
                return Err(Status::invalid_argument(format!(
                    "read_length must not be negative, got {}",
                    range.read_length
                )));
            }
            let start = if range.read_offset < 0 {
                (size + range.read_offset).max(0)
            } else {
                range.read_offset
            };
            if start > size {
                errors.push(ReadRangeError {
                    read_id: range.read_id,
                    status: Some(rpc::Status {
                        code: Code::OutOfRange as i32,
                        message: format!("offset {start} is beyond object size {size}"),
                        details: Vec::new(),
                    }),
                });
                continue;
            }
            let end = if range.read_length == 0 {
                size
            } else {
                start.saturating_add(range.read_length).min(size)
            };
            self.queue.push_back(Cursor {
                read_id: range.read_id,
                position: usize::try_from(start).unwrap_or(0),
                end: usize::try_from(end).unwrap_or(0),
            });
        }
        if errors.is_empty() {
            return Ok(());
        }
        Err(status_with_detail(
            Code::OutOfRange,
            "read ranges failed",
            READ_OBJECT_ERROR_TYPE_URL,
            &BidiReadObjectError {
                read_range_errors: errors,
            },
        ))
    }

    /// Send the next chunk, plus `metadata` on the first message. Returns
    /// false once the client is gone.
    fn send_next(&mut self, metadata: Option<Object>) -> bool {
        let mut response = BidiReadObjectResponse {
            object_data_ranges: Vec::new(),
            read_handle: metadata.as_ref().map(|meta| read_handle(meta.generation)),
            metadata,
        };

        if let Some(mut cursor) = self.queue.pop_front() {
            let len = (cursor.end - cursor.position).min(self.max_chunk);
            let content = self.data.slice(cursor.position..cursor.position + len);
            let mut crc = crc32c::crc32c(&content);
            if self.store.lock().take_corruption() {
                crc ^= 0xFFFF_FFFF;
            }
            let read_offset = i64::try_from(cursor.position).unwrap_or(i64::MAX);
            cursor.position += len;
            let range_end = cursor.position >= cursor.end;
            response.object_data_ranges.push(ObjectRangeData {
                checksummed_data: Some(ChecksummedData {
                    content,
                    crc32c: Some(crc),
                }),
                read_range: Some(ReadRange {
                    read_offset,
                    read_length: i64::try_from(len).unwrap_or(i64::MAX),
                    read_id: cursor.read_id,
                }),
                range_end,
            });
            if !range_end {
                self.queue.push_back(cursor);
            }
        }

        let encoded = Bytes::from(response.encode_to_vec());
        let message = match self.split {
            Some(split) => BufferSlice::chunked(&encoded, split),
            None => BufferSlice::from(encoded),
        };
        self.sent += 1;
        self.tx.send(Ok(message)).is_ok()
    }

    /// Inject the pending fault once enough messages went out.
    fn fail_if_due(&mut self) -> bool {
        let due = matches!(&self.fault, Some((after, _)) if *after <= self.sent);
        if !due {
            return false;
        }
        let Some((_, fault)) = self.fault.take() else {
            return false;
        };
        let status = match fault {
            Fault::Unavailable => Status::unavailable("injected read failure"),
            Fault::Redirect { routing_token } => status_with_detail(
                Code::Aborted,
                "read stream redirected",
                READ_REDIRECT_TYPE_URL,
                &BidiReadObjectRedirectedError {
                    read_handle: Some(read_handle(self.meta.generation)),
                    routing_token: Some(routing_token),
                },
            ),
        };
        let _ = self.tx.send(Err(status));
        true
    }
}

fn read_handle(generation: i64) -> BidiReadHandle {
    BidiReadHandle {
        handle: Bytes::from(format!("read-handle-{generation}")),
    }
}
