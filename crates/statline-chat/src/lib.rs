//! statline-chat: streaming conversation engine
//!
//! Drives one conversation against the `/chat` event stream: a single
//! [`ChatSession`] owns the active transport, applies transport events in
//! arrival order and exposes a consistent [`ConversationState`] snapshot
//! between events.

pub mod conversation;
pub mod error;
pub mod events;
pub mod handle;
pub mod message;
pub mod session;
pub mod tools;
pub mod transport;

pub use conversation::{ConversationState, PhaseKind};
pub use error::ChatError;
pub use events::SessionEvent;
pub use handle::ChatHandle;
pub use message::{Message, MessageStore, Role};
pub use session::{ChatSession, SessionConfig};
pub use tools::{MatchPolicy, ToolExecution, ToolStatus, ToolTracker};
pub use transport::{HttpTransport, Transport};

pub use statline_stream::ErrorCode;
