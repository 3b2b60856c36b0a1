//! Storage Client
//!
//! Entry point for streaming reads and writes. A client wraps a transport
//! and call settings; [`ObjectHandle`] selects the object and builds
//! readers and writers for it.

use std::sync::Arc;

use super::{CallSettings, MultiRangeDownloader, ObjectWriter, RangeReader, WriterOptions};
use crate::application::error::StorageError;
use crate::application::ports::StorageTransport;
use crate::domain::object::{Conditions, EncryptionKey, ObjectSpec, ReadHandle};
use crate::domain::range::RangeRequest;

/// Streaming storage client.
#[derive(Clone)]
pub struct StorageClient {
    transport: Arc<dyn StorageTransport>,
    settings: CallSettings,
}

impl std::fmt::Debug for StorageClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageClient")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl StorageClient {
    /// Create a client over `transport`.
    #[must_use]
    pub fn new(transport: Arc<dyn StorageTransport>, settings: CallSettings) -> Self {
        Self {
            transport,
            settings,
        }
    }

    /// Settings applied to every call.
    #[must_use]
    pub const fn settings(&self) -> &CallSettings {
        &self.settings
    }

    /// Select an object.
    #[must_use]
    pub fn object(&self, bucket: impl Into<String>, name: impl Into<String>) -> ObjectHandle {
        ObjectHandle {
            transport: Arc::clone(&self.transport),
            settings: self.settings.clone(),
            spec: ObjectSpec::new(bucket, name),
        }
    }
}

/// An object plus the options used to access it.
#[derive(Clone)]
pub struct ObjectHandle {
    transport: Arc<dyn StorageTransport>,
    settings: CallSettings,
    spec: ObjectSpec,
}

impl std::fmt::Debug for ObjectHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectHandle")
            .field("spec", &self.spec)
            .finish_non_exhaustive()
    }
}

impl ObjectHandle {
    /// Target a specific generation.
    #[must_use]
    pub const fn generation(mut self, generation: i64) -> Self {
        self.spec.generation = Some(generation);
        self
    }

    /// Apply preconditions.
    #[must_use]
    pub const fn if_conditions(mut self, conditions: Conditions) -> Self {
        self.spec.conditions = Some(conditions);
        self
    }

    /// Use a customer-supplied encryption key.
    #[must_use]
    pub fn encryption_key(mut self, key: EncryptionKey) -> Self {
        self.spec.encryption_key = Some(key);
        self
    }

    /// Reuse a read handle from an earlier read.
    #[must_use]
    pub fn read_handle(mut self, handle: ReadHandle) -> Self {
        self.spec.read_handle = Some(handle);
        self
    }

    /// The object this handle targets.
    #[must_use]
    pub const fn spec(&self) -> &ObjectSpec {
        &self.spec
    }

    /// Read `length` bytes at `offset`. A negative offset counts from the
    /// end; a negative length reads to the end.
    ///
    /// # Errors
    ///
    /// Fails if the object does not exist or the stream cannot be opened.
    pub async fn new_range_reader(
        &self,
        offset: i64,
        length: i64,
    ) -> Result<RangeReader, StorageError> {
        RangeReader::open(
            Arc::clone(&self.transport),
            self.spec.clone(),
            self.settings.clone(),
            RangeRequest::new(offset, length),
        )
        .await
    }

    /// Read the whole object.
    ///
    /// # Errors
    ///
    /// As [`Self::new_range_reader`].
    pub async fn new_reader(&self) -> Result<RangeReader, StorageError> {
        let full = RangeRequest::FULL;
        self.new_range_reader(full.offset, full.length).await
    }

    /// Open a stream for concurrent range downloads.
    ///
    /// # Errors
    ///
    /// As [`Self::new_range_reader`].
    pub async fn new_multi_range_downloader(&self) -> Result<MultiRangeDownloader, StorageError> {
        MultiRangeDownloader::open(
            Arc::clone(&self.transport),
            self.spec.clone(),
            self.settings.clone(),
        )
        .await
    }

    /// Create a writer for a new object version.
    ///
    /// # Errors
    ///
    /// [`StorageError::InvalidArgument`] for invalid names, conditions or
    /// options.
    pub fn new_writer(&self, options: WriterOptions) -> Result<ObjectWriter, StorageError> {
        ObjectWriter::new(
            Arc::clone(&self.transport),
            self.spec.clone(),
            self.settings.clone(),
            options,
        )
    }

    /// Continue writing an unfinalized appendable object. The handle must
    /// name the object's generation.
    ///
    /// # Errors
    ///
    /// Fails if no generation is set or the object cannot be reopened.
    pub async fn takeover_appendable_writer(
        &self,
        options: WriterOptions,
    ) -> Result<ObjectWriter, StorageError> {
        ObjectWriter::takeover(
            Arc::clone(&self.transport),
            self.spec.clone(),
            self.settings.clone(),
            options,
        )
        .await
    }
}
