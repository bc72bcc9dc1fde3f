//! HTTP client for the `/chat` event stream

use async_stream::stream;
use futures::StreamExt;
use reqwest::header::{ACCEPT, HeaderMap, HeaderName, HeaderValue};
use reqwest_eventsource::{Event, EventSource, retry::Never};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{Error, Result},
    protocol::{ChatRequest, decode_frame},
    ratelimit::RateLimitInfo,
    transport::{Closure, TransportEvent, TransportEventStream, TransportFailure},
};

/// Default header carrying the human-verification token
pub const DEFAULT_VERIFICATION_HEADER: &str = "X-Verification-Token";

/// Connection settings for [`ChatClient`]
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the analytics API, e.g. `https://stats.example.com/api`
    pub base_url: String,
    /// Path of the streaming chat endpoint
    pub chat_path: String,
    /// Header used to forward the verification token
    pub verification_header: String,
    /// Verification token; `None` runs in bypass mode and sends no header
    pub verification_token: Option<String>,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            chat_path: "/chat".to_string(),
            verification_header: DEFAULT_VERIFICATION_HEADER.to_string(),
            verification_token: None,
        }
    }

    /// Set the verification token
    pub fn with_verification_token(mut self, token: impl Into<String>) -> Self {
        self.verification_token = Some(token.into());
        self
    }

    /// Full URL of the chat endpoint
    pub fn chat_url(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        if self.chat_path.starts_with('/') {
            format!("{}{}", base, self.chat_path)
        } else {
            format!("{}/{}", base, self.chat_path)
        }
    }
}

/// Streaming chat client
pub struct ChatClient {
    client: reqwest::Client,
    config: ClientConfig,
}

impl ChatClient {
    /// Create a new client, validating the configuration
    pub fn new(config: ClientConfig) -> Result<Self> {
        if config.base_url.trim().is_empty() {
            return Err(Error::InvalidConfig("base_url must not be empty".into()));
        }
        HeaderName::from_bytes(config.verification_header.as_bytes())
            .map_err(|e| Error::InvalidHeader(format!("{}: {}", config.verification_header, e)))?;

        let client = reqwest::Client::builder()
            .user_agent(concat!("statline/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn build_headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));

        if let Some(ref token) = self.config.verification_token {
            let name = HeaderName::from_bytes(self.config.verification_header.as_bytes())
                .map_err(|e| Error::InvalidHeader(e.to_string()))?;
            let value =
                HeaderValue::from_str(token).map_err(|e| Error::InvalidHeader(e.to_string()))?;
            headers.insert(name, value);
        }

        Ok(headers)
    }

    /// Open one streaming request.
    ///
    /// The returned stream yields decoded events in arrival order and always
    /// ends with exactly one [`TransportEvent::Closed`]. Once `cancel` fires,
    /// the only remaining item is `Closed(Closure::Aborted)`.
    pub fn stream(
        &self,
        request: &ChatRequest,
        cancel: CancellationToken,
    ) -> Result<TransportEventStream> {
        let url = self.config.chat_url();
        let request_builder = self
            .client
            .post(&url)
            .headers(self.build_headers()?)
            .json(request);

        let mut event_source = EventSource::new(request_builder)
            .map_err(|e| Error::Sse(format!("Failed to create event source: {}", e)))?;
        event_source.set_retry_policy(Box::new(Never));

        tracing::debug!(url = %url, conversation_id = ?request.conversation_id, "opening chat stream");

        Ok(Box::pin(create_stream(event_source, cancel)))
    }
}

fn create_stream(
    mut event_source: EventSource,
    cancel: CancellationToken,
) -> impl futures::Stream<Item = TransportEvent> {
    stream! {
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                event = event_source.next() => Some(event),
            };

            let Some(event) = next else {
                event_source.close();
                tracing::debug!("chat stream aborted");
                yield TransportEvent::Closed(Closure::Aborted);
                return;
            };

            match event {
                Some(Ok(Event::Open)) => {
                    yield TransportEvent::Opened;
                }
                Some(Ok(Event::Message(msg))) => match decode_frame(&msg.event, &msg.data) {
                    Ok(event) => {
                        yield TransportEvent::Protocol(event);
                    }
                    Err(e) => {
                        tracing::warn!(data = %msg.data, "dropping malformed frame: {}", e);
                        yield TransportEvent::FrameDropped { reason: e.to_string() };
                    }
                },
                Some(Err(reqwest_eventsource::Error::StreamEnded)) | None => {
                    event_source.close();
                    yield TransportEvent::Closed(Closure::Normal);
                    return;
                }
                Some(Err(e)) => {
                    event_source.close();
                    let failure = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => None,
                        failure = classify_failure(e) => Some(failure),
                    };
                    match failure {
                        Some(failure) => {
                            tracing::debug!("chat stream failed: {}", failure);
                            yield TransportEvent::Closed(Closure::Failed(failure));
                        }
                        None => {
                            tracing::debug!("chat stream aborted while reading error body");
                            yield TransportEvent::Closed(Closure::Aborted);
                        }
                    }
                    return;
                }
            }
        }
    }
}

/// JSON error bodies the API returns alongside non-success statuses
#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: Option<String>,
    detail: Option<String>,
}

/// Upper bound on how much of an error response body is read
const MAX_ERROR_BODY: usize = 4 * 1024;

async fn read_error_body(mut response: reqwest::Response) -> String {
    let mut body = Vec::new();
    while body.len() < MAX_ERROR_BODY {
        match response.chunk().await {
            Ok(Some(chunk)) => body.extend_from_slice(&chunk),
            _ => break,
        }
    }
    body.truncate(MAX_ERROR_BODY);
    String::from_utf8_lossy(&body).into_owned()
}

async fn classify_failure(error: reqwest_eventsource::Error) -> TransportFailure {
    match error {
        reqwest_eventsource::Error::InvalidStatusCode(status, response) => {
            let rate_limit = RateLimitInfo::from_headers(response.headers());
            let body = read_error_body(response).await;
            let message = serde_json::from_str::<ErrorBody>(&body)
                .ok()
                .and_then(|b| b.error.or(b.detail))
                .unwrap_or_else(|| {
                    status
                        .canonical_reason()
                        .unwrap_or("request failed")
                        .to_string()
                });
            TransportFailure::Status {
                status: status.as_u16(),
                message,
                rate_limit,
            }
        }
        reqwest_eventsource::Error::InvalidContentType(content_type, _) => {
            TransportFailure::ContentType(
                content_type.to_str().unwrap_or("<non-ascii>").to_string(),
            )
        }
        reqwest_eventsource::Error::Transport(e) => TransportFailure::Connection(e.to_string()),
        other => TransportFailure::Connection(other.to_string()),
    }
}
