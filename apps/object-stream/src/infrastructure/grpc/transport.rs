//! Tonic Transport
//!
//! [`StorageTransport`] over a tonic [`Channel`]. Calls are issued through
//! the generic [`Grpc`] client so read responses can use
//! [`RawResponseCodec`] while everything else uses prost.
//!
//! Every request carries `x-goog-request-params` for routing, plus the
//! bearer token and `x-goog-user-project` when configured.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tonic::client::Grpc;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::metadata::{Ascii, MetadataValue};
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};
use tonic::{GrpcMethod, Request, Status};
use tonic_prost::ProstCodec;

use super::codec::RawResponseCodec;
use super::proto::{
    BIDI_READ_OBJECT_PATH, BIDI_WRITE_OBJECT_PATH, BidiReadObjectRequest, BidiWriteObjectRequest,
    BidiWriteObjectResponse, QUERY_WRITE_STATUS_PATH, QueryWriteStatusRequest,
    QueryWriteStatusResponse, START_RESUMABLE_WRITE_PATH, STORAGE_SERVICE,
    StartResumableWriteRequest, StartResumableWriteResponse,
};
use crate::application::ports::{
    RawResponseStream, RequestParams, RequestStream, StorageTransport, WriteResponseStream,
};
use crate::infrastructure::config::ClientConfig;

const REQUEST_PARAMS_HEADER: &str = "x-goog-request-params";
const USER_PROJECT_HEADER: &str = "x-goog-user-project";
const AUTHORIZATION_HEADER: &str = "authorization";

/// Errors building a transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The endpoint URI is malformed.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// The access token is not a valid header value.
    #[error("access token is not a valid header value")]
    InvalidToken,

    /// Connecting or configuring TLS failed.
    #[error("transport error: {0}")]
    Connect(#[from] tonic::transport::Error),
}

/// gRPC transport to the Cloud Storage service or an emulator.
#[derive(Clone)]
pub struct TonicTransport {
    channel: Channel,
    authorization: Option<MetadataValue<Ascii>>,
}

impl std::fmt::Debug for TonicTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TonicTransport")
            .field("authorized", &self.authorization.is_some())
            .finish_non_exhaustive()
    }
}

impl TonicTransport {
    /// Connect to the configured endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint is invalid or unreachable.
    pub async fn connect(config: &ClientConfig) -> Result<Self, TransportError> {
        let endpoint = Self::create_endpoint(config)?;
        let channel = endpoint.connect().await?;
        tracing::info!(endpoint = %config.endpoint, "Connected to storage service");
        Self::with_channel(channel, config)
    }

    /// Connect on first use.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint is invalid.
    pub fn connect_lazy(config: &ClientConfig) -> Result<Self, TransportError> {
        let endpoint = Self::create_endpoint(config)?;
        let channel = endpoint.connect_lazy();
        tracing::debug!(endpoint = %config.endpoint, "Created lazy storage channel");
        Self::with_channel(channel, config)
    }

    fn with_channel(channel: Channel, config: &ClientConfig) -> Result<Self, TransportError> {
        let authorization = match &config.access_token {
            Some(token) if !config.emulator => Some(
                MetadataValue::try_from(format!("Bearer {}", token.secret()))
                    .map_err(|_| TransportError::InvalidToken)?,
            ),
            _ => None,
        };
        Ok(Self {
            channel,
            authorization,
        })
    }

    fn create_endpoint(config: &ClientConfig) -> Result<Endpoint, TransportError> {
        let mut endpoint = Channel::from_shared(config.endpoint.clone())
            .map_err(|e| TransportError::InvalidEndpoint(e.to_string()))?
            .connect_timeout(config.connect_timeout)
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .http2_keep_alive_interval(Duration::from_secs(30))
            .keep_alive_while_idle(true)
            .tcp_nodelay(true);

        if config.endpoint.starts_with("https://") {
            endpoint = endpoint.tls_config(ClientTlsConfig::new().with_native_roots())?;
        }
        Ok(endpoint)
    }

    async fn ready(&self) -> Result<Grpc<Channel>, Status> {
        let mut grpc = Grpc::new(self.channel.clone());
        grpc.ready()
            .await
            .map_err(|e| Status::unavailable(format!("storage channel not ready: {e}")))?;
        Ok(grpc)
    }

    fn request<T>(
        &self,
        message: T,
        params: &RequestParams,
        method: &'static str,
    ) -> Result<Request<T>, Status> {
        let mut request = Request::new(message);
        request
            .extensions_mut()
            .insert(GrpcMethod::new(STORAGE_SERVICE, method));

        let metadata = request.metadata_mut();
        metadata.insert(REQUEST_PARAMS_HEADER, ascii(params.header_value())?);
        if let Some(project) = &params.user_project {
            metadata.insert(USER_PROJECT_HEADER, ascii(project.clone())?);
        }
        if let Some(token) = &self.authorization {
            metadata.insert(AUTHORIZATION_HEADER, token.clone());
        }
        Ok(request)
    }
}

fn ascii(value: String) -> Result<MetadataValue<Ascii>, Status> {
    MetadataValue::try_from(value)
        .map_err(|e| Status::invalid_argument(format!("invalid request metadata: {e}")))
}

#[async_trait]
impl StorageTransport for TonicTransport {
    async fn bidi_read_object(
        &self,
        params: RequestParams,
        requests: RequestStream<BidiReadObjectRequest>,
    ) -> Result<RawResponseStream, Status> {
        let mut grpc = self.ready().await?;
        let request = self.request(requests, &params, "BidiReadObject")?;
        let response = grpc
            .streaming(
                request,
                PathAndQuery::from_static(BIDI_READ_OBJECT_PATH),
                RawResponseCodec::<BidiReadObjectRequest>::default(),
            )
            .await?;
        Ok(response.into_inner().boxed())
    }

    async fn bidi_write_object(
        &self,
        params: RequestParams,
        requests: RequestStream<BidiWriteObjectRequest>,
    ) -> Result<WriteResponseStream, Status> {
        let mut grpc = self.ready().await?;
        let request = self.request(requests, &params, "BidiWriteObject")?;

        // Response headers arrive only after the first request message, which
        // the writer sends after this call returns; drive the call elsewhere.
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let call = grpc.streaming(
                request,
                PathAndQuery::from_static(BIDI_WRITE_OBJECT_PATH),
                ProstCodec::<BidiWriteObjectRequest, BidiWriteObjectResponse>::default(),
            );
            let mut responses = match call.await {
                Ok(response) => response.into_inner(),
                Err(status) => {
                    let _ = tx.send(Err(status));
                    return;
                }
            };
            loop {
                tokio::select! {
                    () = tx.closed() => break,
                    item = responses.next() => {
                        let Some(item) = item else { break };
                        if tx.send(item).is_err() {
                            break;
                        }
                    }
                }
            }
        });
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn start_resumable_write(
        &self,
        params: RequestParams,
        request: StartResumableWriteRequest,
    ) -> Result<StartResumableWriteResponse, Status> {
        let mut grpc = self.ready().await?;
        let request = self.request(request, &params, "StartResumableWrite")?;
        let response = grpc
            .unary(
                request,
                PathAndQuery::from_static(START_RESUMABLE_WRITE_PATH),
                ProstCodec::<StartResumableWriteRequest, StartResumableWriteResponse>::default(),
            )
            .await?;
        Ok(response.into_inner())
    }

    async fn query_write_status(
        &self,
        params: RequestParams,
        request: QueryWriteStatusRequest,
    ) -> Result<QueryWriteStatusResponse, Status> {
        let mut grpc = self.ready().await?;
        let request = self.request(request, &params, "QueryWriteStatus")?;
        let response = grpc
            .unary(
                request,
                PathAndQuery::from_static(QUERY_WRITE_STATUS_PATH),
                ProstCodec::<QueryWriteStatusRequest, QueryWriteStatusResponse>::default(),
            )
            .await?;
        Ok(response.into_inner())
    }
}
