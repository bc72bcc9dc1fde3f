//! statline-stream: wire protocol and event transport for the chat stream
//!
//! This crate knows how to talk to the `/chat` endpoint: it encodes the
//! request, decodes server-sent frames into [`StreamEvent`]s and reports the
//! connection lifecycle as [`TransportEvent`]s. It holds no conversation state.

pub mod client;
pub mod error;
pub mod protocol;
pub mod ratelimit;
pub mod transport;

pub use client::{ChatClient, ClientConfig};
pub use error::{Error, ErrorCode, Result};
pub use protocol::{ChatRequest, StreamEvent};
pub use ratelimit::RateLimitInfo;
pub use transport::{Closure, TransportEvent, TransportEventStream, TransportFailure};
