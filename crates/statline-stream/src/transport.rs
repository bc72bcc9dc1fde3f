//! Transport lifecycle events

use std::pin::Pin;

use thiserror::Error;
use tokio_stream::Stream;

use crate::{error::ErrorCode, protocol::StreamEvent, ratelimit::RateLimitInfo};

/// Everything a transport delivers, in arrival order.
///
/// A well-behaved transport emits any number of non-terminal items followed
/// by exactly one [`TransportEvent::Closed`].
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The connection was established and the response accepted
    Opened,
    /// A decoded protocol event
    Protocol(StreamEvent),
    /// A frame could not be decoded and was discarded
    FrameDropped { reason: String },
    /// Terminal lifecycle signal
    Closed(Closure),
}

impl TransportEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransportEvent::Closed(_))
    }
}

impl From<StreamEvent> for TransportEvent {
    fn from(event: StreamEvent) -> Self {
        TransportEvent::Protocol(event)
    }
}

/// How a connection ended
#[derive(Debug, Clone, PartialEq)]
pub enum Closure {
    /// The server closed the stream
    Normal,
    /// The connection failed
    Failed(TransportFailure),
    /// Closed locally through cancellation
    Aborted,
}

/// Categorised transport failure
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportFailure {
    /// Non-success HTTP status
    #[error("{message} (HTTP {status})")]
    Status {
        status: u16,
        message: String,
        rate_limit: Option<RateLimitInfo>,
    },

    /// Connection could not be established or broke mid-stream
    #[error("connection failed: {0}")]
    Connection(String),

    /// The server answered with something other than an event stream
    #[error("unexpected content type: {0}")]
    ContentType(String),

    /// The request could not be built
    #[error("request failed: {0}")]
    Request(String),
}

impl TransportFailure {
    /// Nearest error code for this failure
    pub fn error_code(&self) -> ErrorCode {
        match self {
            TransportFailure::Status { status, .. } => ErrorCode::from_status(*status),
            _ => ErrorCode::InternalError,
        }
    }

    /// Human-readable description.
    ///
    /// Rate-limit state is included for 429s and for any status sent once the
    /// window is exhausted.
    pub fn describe(&self) -> String {
        match self {
            TransportFailure::Status {
                status,
                rate_limit: Some(info),
                ..
            } if *status == 429 || info.is_exhausted() => {
                let mut text = self.to_string();
                if let (Some(remaining), Some(limit)) = (info.remaining, info.limit) {
                    text.push_str(&format!(", {}/{} requests remaining", remaining, limit));
                }
                if let Some(reset) = info.reset {
                    text.push_str(&format!(", window resets at {}", reset));
                }
                text
            }
            _ => self.to_string(),
        }
    }
}

/// A stream of transport events
pub type TransportEventStream = Pin<Box<dyn Stream<Item = TransportEvent> + Send>>;
