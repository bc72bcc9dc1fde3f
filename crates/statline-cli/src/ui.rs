//! Plain-terminal rendering of session events

use std::io::{self, Write};

use statline_chat::{ChatError, SessionEvent, ToolStatus};
use tokio::sync::broadcast::{self, error::TryRecvError};

use crate::utils::{format_arguments, truncate_chars};

/// Render every event queued on `events` without waiting for more.
pub fn render_pending(events: &mut broadcast::Receiver<SessionEvent>, interactive: bool) {
    loop {
        match events.try_recv() {
            Ok(event) => render(&event, interactive),
            Err(TryRecvError::Lagged(skipped)) => {
                tracing::warn!("skipped {} session events", skipped);
            }
            Err(_) => break,
        }
    }
}

pub fn render(event: &SessionEvent, interactive: bool) {
    match event {
        SessionEvent::Delta { content } => {
            print!("{}", content);
            let _ = io::stdout().flush();
        }
        SessionEvent::ToolStarted { tool } => {
            let args = format_arguments(&tool.arguments);
            if args.is_empty() {
                println!("\n[Running {}...]", tool.tool_name);
            } else {
                println!("\n[Running {} ({})...]", tool.tool_name, truncate_chars(&args, 80));
            }
        }
        SessionEvent::ToolFinished { tool } => {
            let summary = tool.result_summary.as_deref().unwrap_or("done");
            let summary = truncate_chars(summary, 200);
            if tool.status == ToolStatus::Failed {
                println!("[{} failed: {}]", tool.tool_name, summary);
            } else {
                println!("[{}: {}]", tool.tool_name, summary);
            }
        }
        SessionEvent::TurnFinalized { .. } => println!(),
        SessionEvent::TurnCancelled { .. } => println!("\n[stopped]"),
        SessionEvent::TurnFailed { error } => {
            eprintln!("\nError: {}", error);
            if let Some(hint) = error_hint(error, interactive) {
                eprintln!("{}", hint);
            }
        }
        SessionEvent::Cleared => println!("Cleared conversation."),
        SessionEvent::TurnRequested { .. } | SessionEvent::TurnStarted { .. } => {}
    }
}

/// What the user can do about `error`, if anything
pub fn error_hint(error: &ChatError, interactive: bool) -> Option<&'static str> {
    if error.needs_reverification() {
        return Some(
            "Verification failed. Provide a fresh token with --token or STATLINE_VERIFICATION_TOKEN.",
        );
    }
    match (error.is_retryable, interactive) {
        (true, true) => Some("Type /retry to send the message again."),
        (true, false) => Some("The request may succeed if you try again."),
        (false, _) => None,
    }
}
