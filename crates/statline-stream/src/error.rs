//! Error types for statline-stream

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type alias using statline-stream Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while building or opening a chat stream
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP client failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Server-sent events error
    #[error("SSE error: {0}")]
    Sse(String),

    /// A header name or value could not be encoded
    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Error categories shared by server-reported errors and transport failures.
///
/// Unknown codes sent by the server are preserved verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ErrorCode {
    AuthFailed,
    ValidationError,
    AgentError,
    RedisError,
    #[default]
    InternalError,
    Unknown(String),
}

impl ErrorCode {
    /// Wire representation of this code
    pub fn as_str(&self) -> &str {
        match self {
            ErrorCode::AuthFailed => "AUTH_FAILED",
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::AgentError => "AGENT_ERROR",
            ErrorCode::RedisError => "REDIS_ERROR",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::Unknown(code) => code,
        }
    }

    /// Whether resending the same message may plausibly succeed.
    ///
    /// This is the taxonomy-level answer used for transport failures.
    /// Server-reported errors use the narrower
    /// [`ErrorCode::is_retryable_when_reported`].
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::AgentError | ErrorCode::RedisError | ErrorCode::InternalError
        )
    }

    /// Retryability of a code carried by a protocol `error` event.
    pub fn is_retryable_when_reported(&self) -> bool {
        matches!(self, ErrorCode::AgentError | ErrorCode::RedisError)
    }

    /// Map an HTTP status to the nearest code
    pub fn from_status(status: u16) -> Self {
        match status {
            401 => ErrorCode::AuthFailed,
            400 => ErrorCode::ValidationError,
            s if s >= 500 => ErrorCode::AgentError,
            _ => ErrorCode::InternalError,
        }
    }
}

impl From<String> for ErrorCode {
    fn from(code: String) -> Self {
        match code.as_str() {
            "AUTH_FAILED" => ErrorCode::AuthFailed,
            "VALIDATION_ERROR" => ErrorCode::ValidationError,
            "AGENT_ERROR" => ErrorCode::AgentError,
            "REDIS_ERROR" => ErrorCode::RedisError,
            "INTERNAL_ERROR" => ErrorCode::InternalError,
            _ => ErrorCode::Unknown(code),
        }
    }
}

impl From<ErrorCode> for String {
    fn from(code: ErrorCode) -> Self {
        match code {
            ErrorCode::Unknown(code) => code,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
