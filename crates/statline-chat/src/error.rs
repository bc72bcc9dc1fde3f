//! Errors surfaced through the conversation state

use serde::{Deserialize, Serialize};
use statline_stream::{ErrorCode, TransportFailure};
use thiserror::Error;

/// The last unrecovered error of a conversation.
///
/// Nothing escapes the engine as a Rust error; every failure ends up here.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{message} ({code})")]
pub struct ChatError {
    /// Human-readable description
    pub message: String,
    pub code: ErrorCode,
    /// Whether resending the last message may succeed
    pub is_retryable: bool,
}

impl ChatError {
    /// Error reported by the server through an `error` event
    pub fn from_protocol(message: impl Into<String>, code: ErrorCode) -> Self {
        let is_retryable = code.is_retryable_when_reported();
        Self {
            message: message.into(),
            code,
            is_retryable,
        }
    }

    /// Error synthesized from a transport failure
    pub fn from_transport(failure: &TransportFailure) -> Self {
        let code = failure.error_code();
        Self {
            message: failure.describe(),
            is_retryable: code.is_retryable(),
            code,
        }
    }

    /// The server broke the event ordering contract
    pub fn protocol_violation(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: ErrorCode::InternalError,
            is_retryable: ErrorCode::InternalError.is_retryable(),
        }
    }

    /// Whether the caller should offer re-verification instead of a retry
    pub fn needs_reverification(&self) -> bool {
        self.code == ErrorCode::AuthFailed
    }
}
