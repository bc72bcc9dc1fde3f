//! Externally observed conversation state

use serde::{Deserialize, Serialize};

use crate::{error::ChatError, message::Message, tools::ToolExecution};

/// Which part of a turn the session is in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseKind {
    /// No turn in flight
    #[default]
    Idle,
    /// Request sent, no `start` received yet
    AwaitingFirstEvent,
    /// `start` received, reply accumulating
    Streaming,
}

/// Snapshot of a conversation, consistent as of the last applied event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationState {
    /// Server-assigned id, `None` until the first `start`
    pub conversation_id: Option<String>,
    /// Finalized messages, oldest first
    pub messages: Vec<Message>,
    pub is_streaming: bool,
    /// Accumulated text of the in-progress reply
    pub current_streaming_message: String,
    /// Tools of the in-progress turn only
    pub active_tools: Vec<ToolExecution>,
    pub error: Option<ChatError>,
    pub phase: PhaseKind,
}

impl ConversationState {
    /// True while a request is outstanding, including before `start` arrives
    pub fn is_busy(&self) -> bool {
        self.phase != PhaseKind::Idle
    }

    /// Most recent finalized message
    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }
}
