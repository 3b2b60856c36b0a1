//! Read stream opening shared by the range reader and the multi-range
//! downloader. Tracks the routing token and read handle across reopens.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::CallSettings;
use crate::application::error::StorageError;
use crate::application::ports::{RawResponseStream, StorageTransport};
use crate::domain::object::{ObjectSpec, ReadHandle};
use crate::infrastructure::grpc::proto::{
    BidiReadHandle, BidiReadObjectRequest, BidiReadObjectSpec, Object, ReadRange,
};
use crate::infrastructure::metrics::Operation;
use crate::infrastructure::retry::{self, Retrier};
use crate::infrastructure::wire::{DecodedResponse, decode_read_response};

/// Most ranges carried by one request message.
pub const MAX_RANGES_PER_REQUEST: usize = 100;

/// An open read stream whose first response has been received.
pub(crate) struct OpenedStream {
    /// Request side; `None` once half-closed.
    pub requests: Option<mpsc::UnboundedSender<BidiReadObjectRequest>>,
    pub responses: RawResponseStream,
    pub first: DecodedResponse,
    pub metadata: Object,
}

/// Per-object read state that survives reopening.
pub(crate) struct ReadSession {
    transport: Arc<dyn StorageTransport>,
    spec: ObjectSpec,
    settings: CallSettings,
    generation: Option<i64>,
    read_handle: Option<ReadHandle>,
    routing_token: Option<String>,
}

impl ReadSession {
    pub fn new(
        transport: Arc<dyn StorageTransport>,
        spec: ObjectSpec,
        settings: CallSettings,
    ) -> Self {
        let read_handle = spec.read_handle.clone();
        let generation = spec.generation;
        Self {
            transport,
            spec,
            settings,
            generation,
            read_handle,
            routing_token: None,
        }
    }

    pub const fn spec(&self) -> &ObjectSpec {
        &self.spec
    }

    pub const fn read_handle(&self) -> Option<&ReadHandle> {
        self.read_handle.as_ref()
    }

    pub fn retrier(&self) -> Retrier {
        self.settings.retrier()
    }

    /// Open a stream, retrying transient failures and following redirects.
    pub async fn open(
        &mut self,
        retrier: &mut Retrier,
        operation: Operation,
        ranges: &[ReadRange],
        keep_open: bool,
    ) -> Result<OpenedStream, StorageError> {
        loop {
            match self.open_once(ranges, keep_open).await {
                Ok(opened) => {
                    self.observe(&opened.first);
                    // Reopens must see the same object version.
                    if self.generation.is_none() {
                        self.generation = Some(opened.metadata.generation);
                    }
                    return Ok(opened);
                }
                Err(err) => {
                    self.observe_error(&err);
                    retrier.pause(err, operation).await?;
                }
            }
        }
    }

    /// Record the read handle carried by a response.
    pub fn observe(&mut self, response: &DecodedResponse) {
        if let Some(handle) = &response.read_handle
            && !handle.handle.is_empty()
        {
            self.read_handle = Some(ReadHandle::new(handle.handle.clone()));
        }
    }

    /// Record redirect state carried by a failure.
    pub fn observe_error(&mut self, err: &StorageError) {
        let Some(redirect) = err.status().and_then(retry::read_redirect) else {
            return;
        };
        if let Some(handle) = redirect.read_handle {
            self.read_handle = Some(ReadHandle::new(handle.handle));
        }
        if redirect.routing_token.is_some() {
            tracing::debug!(
                bucket = %self.spec.bucket,
                object = %self.spec.object,
                "Read stream redirected"
            );
            self.routing_token = redirect.routing_token;
        }
    }

    fn object_spec(&self) -> BidiReadObjectSpec {
        let conditions = self.spec.conditions.unwrap_or_default();
        BidiReadObjectSpec {
            bucket: self.spec.bucket_resource(),
            object: self.spec.object.clone(),
            generation: self.generation.unwrap_or(0),
            if_generation_match: conditions.if_generation_match(),
            if_generation_not_match: conditions.generation_not_match,
            if_metageneration_match: conditions.metageneration_match,
            if_metageneration_not_match: conditions.metageneration_not_match,
            common_object_request_params: super::common_params(self.spec.encryption_key.as_ref()),
            read_handle: self.read_handle.as_ref().map(|handle| BidiReadHandle {
                handle: handle.as_bytes().clone(),
            }),
            routing_token: self.routing_token.clone(),
        }
    }

    async fn open_once(
        &self,
        ranges: &[ReadRange],
        keep_open: bool,
    ) -> Result<OpenedStream, StorageError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut batches = ranges.chunks(MAX_RANGES_PER_REQUEST);
        let first = BidiReadObjectRequest {
            read_object_spec: Some(self.object_spec()),
            read_ranges: batches.next().map(<[ReadRange]>::to_vec).unwrap_or_default(),
        };
        // The receiver is alive, so these sends cannot fail.
        let _ = tx.send(first);
        for batch in batches {
            let _ = tx.send(BidiReadObjectRequest {
                read_object_spec: None,
                read_ranges: batch.to_vec(),
            });
        }
        let requests = keep_open.then_some(tx);

        let params = self
            .settings
            .request_params(self.spec.bucket_resource(), self.routing_token.clone());
        let mut responses = self
            .transport
            .bidi_read_object(params, UnboundedReceiverStream::new(rx).boxed())
            .await
            .map_err(|status| self.object_error(status))?;

        let message = match responses.next().await {
            Some(Ok(message)) => message,
            Some(Err(status)) => return Err(self.object_error(status)),
            None => {
                return Err(StorageError::Protocol(
                    "read stream closed before the first response".into(),
                ));
            }
        };
        let first = decode_read_response(&message)?;
        let metadata = first.metadata.clone().ok_or_else(|| {
            StorageError::Protocol("first read response carried no object metadata".into())
        })?;

        Ok(OpenedStream {
            requests,
            responses,
            first,
            metadata,
        })
    }

    pub fn object_error(&self, status: tonic::Status) -> StorageError {
        StorageError::from(status).for_object(&self.spec.bucket, &self.spec.object)
    }
}
