//! Session event types

use serde::{Deserialize, Serialize};

use crate::{error::ChatError, message::Message, tools::ToolExecution};

/// Events broadcast while a session processes turns
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// A user message was sent and a stream opened
    TurnRequested { message: Message },

    /// The server acknowledged the turn
    TurnStarted { conversation_id: String },

    /// Reply text grew
    Delta { content: String },

    /// A backend tool started
    ToolStarted { tool: ToolExecution },

    /// A backend tool finished
    ToolFinished { tool: ToolExecution },

    /// The reply was finalized into the history
    TurnFinalized { message: Message },

    /// The turn ended with an error
    TurnFailed { error: ChatError },

    /// The turn was cancelled; `message` is set when partial text was kept
    TurnCancelled { message: Option<Message> },

    /// The conversation was reset
    Cleared,
}
