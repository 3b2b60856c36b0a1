//! `BidiWriteObject` emulation.
//!
//! Data is staged per stream and becomes persisted only on `flush` or
//! `finish_write`; a stream that fails loses whatever it staged.

use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedSender;
use tonic::{Code, Status};

use super::Fault;
use super::store::{
    self, ObjectKey, Store, Upload, bucket_name, check_conditions, check_object_checksums,
};
use crate::application::ports::RequestStream;
use crate::infrastructure::grpc::proto::{
    AppendObjectSpec, BidiWriteHandle, BidiWriteObjectRedirectedError, BidiWriteObjectRequest,
    BidiWriteObjectResponse, Object, ObjectChecksums, WRITE_REDIRECT_TYPE_URL, WriteObjectSpec,
    bidi_write_object_request::{Data, FirstMessage},
    bidi_write_object_response::WriteStatus,
};
use crate::infrastructure::retry::status_with_detail;

type Responses = UnboundedSender<Result<BidiWriteObjectResponse, Status>>;

enum Target {
    Upload(String),
    OneShot { spec: WriteObjectSpec, data: Vec<u8> },
    Appendable { key: ObjectKey, generation: i64 },
}

struct WriteStream {
    store: Arc<Mutex<Store>>,
    target: Target,
    /// Received on this stream and not yet persisted.
    staged: Vec<u8>,
    reported_resource: bool,
    finished: bool,
}

pub(super) async fn serve(
    store: Arc<Mutex<Store>>,
    mut requests: RequestStream<BidiWriteObjectRequest>,
    tx: Responses,
    mut fault: Option<(usize, Fault)>,
) {
    let Some(mut first) = requests.next().await else {
        return;
    };
    let Some(first_message) = first.first_message.take() else {
        let _ = tx.send(Err(Status::invalid_argument(
            "first request must carry a first message",
        )));
        return;
    };
    let target = match open(&store, first_message) {
        Ok(target) => target,
        Err(status) => {
            let _ = tx.send(Err(status));
            return;
        }
    };

    let mut stream = WriteStream {
        store,
        target,
        staged: Vec::new(),
        reported_resource: false,
        finished: false,
    };
    let mut processed = 0;
    let mut next = Some(first);
    loop {
        let request = match next.take() {
            Some(request) => request,
            None => match requests.next().await {
                Some(request) => request,
                None => return,
            },
        };

        if matches!(&fault, Some((after, _)) if *after <= processed)
            && let Some((_, fault)) = fault.take()
        {
            let _ = tx.send(Err(stream.fault_status(fault)));
            return;
        }
        processed += 1;

        match stream.handle(request) {
            Ok(Some(response)) => {
                if tx.send(Ok(response)).is_err() {
                    return;
                }
            }
            Ok(None) => {}
            Err(status) => {
                let _ = tx.send(Err(status));
                return;
            }
        }
        if stream.finished {
            return;
        }
    }
}

fn open(store: &Mutex<Store>, first_message: FirstMessage) -> Result<Target, Status> {
    let mut store = store.lock();
    store.write_first_messages.push(first_message.clone());
    match first_message {
        FirstMessage::UploadId(upload_id) => {
            if !store.uploads.contains_key(&upload_id) {
                return Err(Status::not_found(format!("upload {upload_id} not found")));
            }
            Ok(Target::Upload(upload_id))
        }
        FirstMessage::WriteObjectSpec(spec) => {
            let resource = spec
                .resource
                .clone()
                .ok_or_else(|| Status::invalid_argument("write_object_spec needs a resource"))?;
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
            if spec.appendable == Some(true) {
                let meta = store.create_appendable(&resource);
                return Ok(Target::Appendable {
                    key: (bucket_name(&meta.bucket), meta.name),
                    generation: meta.generation,
                });
            }
            Ok(Target::OneShot {
                spec,
                data: Vec::new(),
            })
        }
        FirstMessage::AppendObjectSpec(spec) => open_append(&store, &spec),
    }
}

fn open_append(store: &Store, spec: &AppendObjectSpec) -> Result<Target, Status> {
    let object = store
        .get(&spec.bucket, &spec.object)
        .filter(|object| object.meta.generation == spec.generation)
        .ok_or_else(|| {
            Status::not_found(format!(
                "object {}/{}#{} not found",
                spec.bucket, spec.object, spec.generation
            ))
        })?;
    check_conditions(
        Some(&object.meta),
        None,
        None,
        spec.if_metageneration_match,
        spec.if_metageneration_not_match,
    )?;
    Ok(Target::Appendable {
        key: (bucket_name(&spec.bucket), spec.object.clone()),
        generation: spec.generation,
    })
}

impl WriteStream {
    fn handle(
        &mut self,
        request: BidiWriteObjectRequest,
    ) -> Result<Option<BidiWriteObjectResponse>, Status> {
        let shared = Arc::clone(&self.store);
        let mut store = shared.lock();
        if let Some(Data::ChecksummedData(data)) = &request.data {
            if let Some(crc) = data.crc32c
                && crc != crc32c::crc32c(&data.content)
            {
                return Err(Status::invalid_argument("message CRC32C does not match"));
            }
            self.stage(&store, request.write_offset, &data.content)?;
        }

        if request.finish_write {
            let object = self.finish(&mut store, request.object_checksums.as_ref())?;
            self.finished = true;
            return Ok(Some(self.response(WriteStatus::Resource(object))));
        }
        if request.flush {
            self.persist(&mut store)?;
        }
        if !request.state_lookup {
            return Ok(None);
        }

        let status = match &self.target {
            Target::Upload(upload_id) => {
                let upload = upload(&store, upload_id)?;
                match &upload.finished {
                    Some(object) => WriteStatus::Resource(object.clone()),
                    None => WriteStatus::PersistedSize(to_i64(upload.data.len())),
                }
            }
            Target::OneShot { .. } => WriteStatus::PersistedSize(0),
            Target::Appendable { key, .. } => {
                let object = appendable(&store, key)?;
                if self.reported_resource && object.meta.finalize_time.is_none() {
                    WriteStatus::PersistedSize(object.meta.size)
                } else {
                    self.reported_resource = true;
                    WriteStatus::Resource(object.meta.clone())
                }
            }
        };
        Ok(Some(self.response(status)))
    }

    fn persisted(&self, store: &Store) -> Result<usize, Status> {
        match &self.target {
            Target::Upload(upload_id) => Ok(upload(store, upload_id)?.data.len()),
            Target::OneShot { data, .. } => Ok(data.len()),
            Target::Appendable { key, .. } => Ok(appendable(store, key)?.data.len()),
        }
    }

    /// Stage `content` written at `offset`, skipping bytes already held.
    fn stage(&mut self, store: &Store, offset: i64, content: &Bytes) -> Result<(), Status> {
        let end = self.persisted(store)? + self.staged.len();
        let offset = usize::try_from(offset)
            .map_err(|_| Status::invalid_argument("write_offset must not be negative"))?;
        if offset > end {
            return Err(Status::invalid_argument(format!(
                "write_offset {offset} is past the received size {end}"
            )));
        }
        let overlap = end - offset;
        if overlap < content.len() {
            self.staged.extend_from_slice(&content[overlap..]);
        }
        Ok(())
    }

    fn persist(&mut self, store: &mut Store) -> Result<(), Status> {
        let staged = std::mem::take(&mut self.staged);
        match &mut self.target {
            Target::Upload(upload_id) => {
                upload_mut(store, upload_id)?.data.extend_from_slice(&staged);
            }
            Target::OneShot { data, .. } => data.extend_from_slice(&staged),
            Target::Appendable { key, .. } => {
                let object = store
                    .get_mut(&key.0, &key.1)
                    .ok_or_else(|| Status::not_found("appendable object was deleted"))?;
                if object.meta.finalize_time.is_some() {
                    return Err(Status::failed_precondition("object is already finalized"));
                }
                store::append(object, &staged);
            }
        }
        Ok(())
    }

    fn finish(
        &mut self,
        store: &mut Store,
        checksums: Option<&ObjectChecksums>,
    ) -> Result<Object, Status> {
        self.persist(store)?;
        match &self.target {
            Target::Upload(upload_id) => {
                let upload = upload(store, upload_id)?;
                if let Some(object) = &upload.finished {
                    return Ok(object.clone());
                }
                check_object_checksums(checksums, &upload.data)?;
                let resource = upload.spec.resource.clone().unwrap_or_default();
                let data = Bytes::from(upload.data.clone());
                let object = store.create(&resource, data);
                upload_mut(store, upload_id)?.finished = Some(object.clone());
                Ok(object)
            }
            Target::OneShot { spec, data } => {
                check_object_checksums(checksums, data)?;
                let resource = spec.resource.clone().unwrap_or_default();
                Ok(store.create(&resource, Bytes::from(data.clone())))
            }
            Target::Appendable { key, .. } => {
                let object = store
                    .get_mut(&key.0, &key.1)
                    .ok_or_else(|| Status::not_found("appendable object was deleted"))?;
                check_object_checksums(checksums, &object.data)?;
                store::finalize(object);
                Ok(object.meta.clone())
            }
        }
    }

    fn response(&self, status: WriteStatus) -> BidiWriteObjectResponse {
        BidiWriteObjectResponse {
            write_handle: self.write_handle(),
            write_status: Some(status),
        }
    }

    fn write_handle(&self) -> Option<BidiWriteHandle> {
        match &self.target {
            Target::Appendable { generation, .. } => Some(BidiWriteHandle {
                handle: Bytes::from(format!("write-handle-{generation}")),
            }),
            _ => None,
        }
    }

    fn fault_status(&self, fault: Fault) -> Status {
        match fault {
            Fault::Unavailable => Status::unavailable("injected write failure"),
            Fault::Redirect { routing_token } => {
                let generation = match &self.target {
                    Target::Appendable { generation, .. } => Some(*generation),
                    _ => None,
                };
                status_with_detail(
                    Code::Aborted,
                    "write stream redirected",
                    WRITE_REDIRECT_TYPE_URL,
                    &BidiWriteObjectRedirectedError {
                        routing_token: Some(routing_token),
                        write_handle: self.write_handle(),
                        generation,
                    },
                )
            }
        }
    }
}

fn upload<'a>(store: &'a Store, upload_id: &str) -> Result<&'a Upload, Status> {
    store
        .uploads
        .get(upload_id)
        .ok_or_else(|| Status::not_found(format!("upload {upload_id} not found")))
}

fn upload_mut<'a>(store: &'a mut Store, upload_id: &str) -> Result<&'a mut Upload, Status> {
    store
        .uploads
        .get_mut(upload_id)
        .ok_or_else(|| Status::not_found(format!("upload {upload_id} not found")))
}

fn appendable<'a>(store: &'a Store, key: &ObjectKey) -> Result<&'a store::StoredObject, Status> {
    store
        .objects
        .get(key)
        .ok_or_else(|| Status::not_found("appendable object was deleted"))
}

fn to_i64(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}
