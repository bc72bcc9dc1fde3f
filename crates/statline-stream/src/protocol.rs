//! Wire protocol of the `/chat` endpoint

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::ErrorCode;

/// Request body sent to open a chat stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRequest {
    /// The user's message text
    pub message: String,
    /// Server-assigned conversation id, `null` for a new conversation
    pub conversation_id: Option<String>,
}

impl ChatRequest {
    pub fn new(message: impl Into<String>, conversation_id: Option<String>) -> Self {
        Self {
            message: message.into(),
            conversation_id,
        }
    }
}

/// Events pushed by the server, one JSON object per frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// First event of every turn
    Start { conversation_id: String },
    /// Fragment of assistant text
    Delta { content: String },
    /// A backend tool started running
    ToolStart {
        tool_name: String,
        #[serde(default, deserialize_with = "null_as_default")]
        arguments: Map<String, Value>,
    },
    /// A backend tool finished
    ToolEnd {
        tool_name: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result_summary: Option<String>,
    },
    /// The turn completed
    End,
    /// The server gave up on the turn
    Error {
        error: String,
        #[serde(default, deserialize_with = "null_as_default")]
        code: ErrorCode,
    },
}

impl StreamEvent {
    /// Wire name of the event type
    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::Start { .. } => "start",
            StreamEvent::Delta { .. } => "delta",
            StreamEvent::ToolStart { .. } => "tool_start",
            StreamEvent::ToolEnd { .. } => "tool_end",
            StreamEvent::End => "end",
            StreamEvent::Error { .. } => "error",
        }
    }

    /// Check if this event ends the turn (End or Error)
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::End | StreamEvent::Error { .. })
    }
}

/// Treat an explicit `null` like a missing field
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Default SSE event name when the server sends no `event:` line
const DEFAULT_SSE_EVENT: &str = "message";

/// Decode one SSE frame.
///
/// The event type normally travels in the JSON `type` field. Frames without
/// one fall back to the SSE `event:` name when the server set it.
pub fn decode_frame(sse_event: &str, data: &str) -> serde_json::Result<StreamEvent> {
    let mut value: Value = serde_json::from_str(data)?;

    if let Value::Object(ref mut obj) = value {
        if !obj.contains_key("type") && !sse_event.is_empty() && sse_event != DEFAULT_SSE_EVENT {
            obj.insert("type".to_string(), Value::String(sse_event.to_string()));
        }
    }

    serde_json::from_value(value)
}
