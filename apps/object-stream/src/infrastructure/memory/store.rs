//! Object table and upload sessions behind [`InMemoryTransport`].
//!
//! [`InMemoryTransport`]: super::InMemoryTransport

use std::collections::{HashMap, VecDeque};

use bytes::Bytes;
use chrono::Utc;
use tonic::Status;

use super::{CallRecord, Fault};
use crate::domain::object::bucket_resource_name;
use crate::infrastructure::grpc::proto::{
    BidiReadObjectSpec, Object, ObjectChecksums, WriteObjectSpec,
    bidi_write_object_request::FirstMessage,
};

pub(super) const DEFAULT_MAX_READ_CHUNK: usize = 64 * 1024;

pub(super) type ObjectKey = (String, String);

#[derive(Debug, Clone)]
pub(super) struct StoredObject {
    pub meta: Object,
    pub data: Bytes,
}

#[derive(Debug)]
pub(super) struct Upload {
    pub spec: WriteObjectSpec,
    pub data: Vec<u8>,
    pub finished: Option<Object>,
}

#[derive(Debug)]
pub(super) struct Store {
    pub objects: HashMap<ObjectKey, StoredObject>,
    pub uploads: HashMap<String, Upload>,
    next_generation: i64,
    pub read_faults: VecDeque<(usize, Fault)>,
    pub write_faults: VecDeque<(usize, Fault)>,
    pub unary_failures: usize,
    pub corrupt_reads: usize,
    pub max_read_chunk: usize,
    pub response_split: Option<usize>,
    pub calls: Vec<CallRecord>,
    pub read_specs: Vec<BidiReadObjectSpec>,
    pub write_first_messages: Vec<FirstMessage>,
}

impl Default for Store {
    fn default() -> Self {
        Self {
            objects: HashMap::new(),
            uploads: HashMap::new(),
            next_generation: 1,
            read_faults: VecDeque::new(),
            write_faults: VecDeque::new(),
            unary_failures: 0,
            corrupt_reads: 0,
            max_read_chunk: DEFAULT_MAX_READ_CHUNK,
            response_split: None,
            calls: Vec::new(),
            read_specs: Vec::new(),
            write_first_messages: Vec::new(),
        }
    }
}

impl Store {
    pub fn next_generation(&mut self) -> i64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        generation
    }

    /// Consume one injected unary failure, if any.
    pub fn take_unary_failure(&mut self) -> Result<(), Status> {
        if self.unary_failures > 0 {
            self.unary_failures -= 1;
            return Err(Status::unavailable("injected unary failure"));
        }
        Ok(())
    }

    pub fn take_corruption(&mut self) -> bool {
        if self.corrupt_reads > 0 {
            self.corrupt_reads -= 1;
            return true;
        }
        false
    }

    /// Store a new finalized generation built from `resource`.
    pub fn create(&mut self, resource: &Object, data: Bytes) -> Object {
        let generation = self.next_generation();
        let mut meta = resource.clone();
        meta.generation = generation;
        meta.metageneration = 1;
        meta.storage_class = "STANDARD".to_string();
        stamp(&mut meta, &data);
        meta.finalize_time = Some(now());
        let key = (bucket_name(&meta.bucket), meta.name.clone());
        self.objects.insert(key, StoredObject {
            meta: meta.clone(),
            data,
        });
        meta
    }

    /// Store an empty unfinalized appendable object.
    pub fn create_appendable(&mut self, resource: &Object) -> Object {
        let generation = self.next_generation();
        let mut meta = resource.clone();
        meta.generation = generation;
        meta.metageneration = 1;
        meta.storage_class = "STANDARD".to_string();
        meta.create_time = Some(now());
        stamp(&mut meta, &Bytes::new());
        let key = (bucket_name(&meta.bucket), meta.name.clone());
        self.objects.insert(key, StoredObject {
            meta: meta.clone(),
            data: Bytes::new(),
        });
        meta
    }

    pub fn get(&self, bucket: &str, name: &str) -> Option<&StoredObject> {
        self.objects.get(&(bucket_name(bucket), name.to_string()))
    }

    pub fn get_mut(&mut self, bucket: &str, name: &str) -> Option<&mut StoredObject> {
        self.objects.get_mut(&(bucket_name(bucket), name.to_string()))
    }
}

/// Append to an unfinalized appendable object.
pub(super) fn append(object: &mut StoredObject, tail: &[u8]) {
    if tail.is_empty() {
        return;
    }
    let mut data = Vec::with_capacity(object.data.len() + tail.len());
    data.extend_from_slice(&object.data);
    data.extend_from_slice(tail);
    object.data = Bytes::from(data);
    stamp(&mut object.meta, &object.data);
}

pub(super) fn finalize(object: &mut StoredObject) {
    object.meta.finalize_time = Some(now());
}

/// Size, checksums and update time for `data`.
fn stamp(meta: &mut Object, data: &Bytes) {
    meta.size = i64::try_from(data.len()).unwrap_or(i64::MAX);
    meta.checksums = Some(ObjectChecksums {
        crc32c: Some(crc32c::crc32c(data)),
        md5_hash: Bytes::copy_from_slice(&md5::compute(data).0),
    });
    let now = now();
    if meta.create_time.is_none() {
        meta.create_time = Some(now.clone());
    }
    meta.update_time = Some(now);
}

/// Check preconditions against the live object.
pub(super) fn check_conditions(
    live: Option<&Object>,
    if_generation_match: Option<i64>,
    if_generation_not_match: Option<i64>,
    if_metageneration_match: Option<i64>,
    if_metageneration_not_match: Option<i64>,
) -> Result<(), Status> {
    let generation = live.map_or(0, |object| object.generation);
    let metageneration = live.map(|object| object.metageneration);
    let failed = if_generation_match.is_some_and(|g| g != generation)
        || if_generation_not_match.is_some_and(|g| g == generation)
        || if_metageneration_match.is_some_and(|m| Some(m) != metageneration)
        || if_metageneration_not_match.is_some_and(|m| Some(m) == metageneration);
    if failed {
        return Err(Status::failed_precondition("precondition failed"));
    }
    Ok(())
}

/// Verify the checksums a client sent with `finish_write`.
pub(super) fn check_object_checksums(
    sent: Option<&ObjectChecksums>,
    data: &[u8],
) -> Result<(), Status> {
    let Some(sent) = sent else {
        return Ok(());
    };
    if let Some(crc) = sent.crc32c
        && crc != crc32c::crc32c(data)
    {
        return Err(Status::invalid_argument("object CRC32C does not match"));
    }
    if !sent.md5_hash.is_empty() && sent.md5_hash[..] != md5::compute(data).0[..] {
        return Err(Status::invalid_argument("object MD5 does not match"));
    }
    Ok(())
}

/// Bucket name from a bucket or a bucket resource name.
pub(super) fn bucket_name(bucket: &str) -> String {
    let prefix = bucket_resource_name("");
    bucket.strip_prefix(&prefix).unwrap_or(bucket).to_string()
}

fn now() -> prost_types::Timestamp {
    let now = Utc::now();
    prost_types::Timestamp {
        seconds: now.timestamp(),
        nanos: i32::try_from(now.timestamp_subsec_nanos()).unwrap_or(0),
    }
}
