//! Transport abstraction for opening chat streams

use async_trait::async_trait;
use statline_stream::{ChatClient, ChatRequest, ClientConfig, TransportEventStream};
use tokio_util::sync::CancellationToken;

/// Opens one event stream per user message.
///
/// Implementations must deliver events in arrival order, end every stream
/// with exactly one `TransportEvent::Closed`, and stop producing anything
/// but `Closed(Closure::Aborted)` once `cancel` fires.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(
        &self,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> statline_stream::Result<TransportEventStream>;
}

/// HTTP transport - streams from the `/chat` endpoint
pub struct HttpTransport {
    client: ChatClient,
}

impl HttpTransport {
    /// Create a new HTTP transport
    pub fn new(client: ChatClient) -> Self {
        Self { client }
    }

    /// Create from a client configuration
    pub fn from_config(config: ClientConfig) -> statline_stream::Result<Self> {
        Ok(Self::new(ChatClient::new(config)?))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn open(
        &self,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> statline_stream::Result<TransportEventStream> {
        self.client.stream(&request, cancel)
    }
}
