//! Conversation messages and the append-only message store

use serde::{Deserialize, Serialize};

use crate::tools::ToolExecution;

/// Generate a fresh opaque identifier for messages and tool invocations
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Author of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// A finalized or in-progress conversation turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    /// Creation time, unix milliseconds
    pub timestamp: i64,
    /// True only for the single in-progress assistant message
    pub is_streaming: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolExecution>>,
}

impl Message {
    /// Create a user message
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            role: Role::User,
            content: content.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            is_streaming: false,
            tools: None,
        }
    }

    /// Create the in-progress assistant message of a new turn
    pub fn streaming_reply() -> Self {
        Self {
            id: new_id(),
            role: Role::Assistant,
            content: String::new(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            is_streaming: true,
            tools: None,
        }
    }

    /// Tools attached to this message, empty if none
    pub fn tools(&self) -> &[ToolExecution] {
        self.tools.as_deref().unwrap_or_default()
    }
}

/// Append-only list of finalized messages.
///
/// The in-progress reply lives outside the store until it is finalized; it
/// keeps its id when it is appended.
#[derive(Debug, Clone, Default)]
pub struct MessageStore {
    messages: Vec<Message>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All finalized messages, oldest first
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Append a user message
    pub fn push_user(&mut self, content: impl Into<String>) -> &Message {
        self.append(Message::user(content))
    }

    /// Finalize an in-progress reply and append it.
    ///
    /// `tools` is attached only when non-empty.
    pub fn finalize(&mut self, mut draft: Message, tools: Vec<ToolExecution>) -> &Message {
        draft.is_streaming = false;
        draft.tools = if tools.is_empty() { None } else { Some(tools) };
        self.append(draft)
    }

    /// Most recent user message, if any
    pub fn last_user_message(&self) -> Option<&Message> {
        self.messages.iter().rev().find(|m| m.role == Role::User)
    }

    /// Remove all messages
    pub fn clear(&mut self) {
        self.messages.clear();
    }

    fn append(&mut self, message: Message) -> &Message {
        debug_assert!(!message.is_streaming, "only finalized messages are stored");
        self.messages.push(message);
        &self.messages[self.messages.len() - 1]
    }
}
