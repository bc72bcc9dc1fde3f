//! Slash commands for interactive mode

/// Result of executing a slash command
#[derive(Debug, PartialEq, Eq)]
pub enum CommandResult {
    /// Clear the conversation
    Clear,
    /// Resend the last message after a retryable error
    Retry,
    /// Print the conversation state as JSON
    State,
    /// Show a message to the user (not sent to the server)
    Message(String),
    /// Exit the application
    Exit,
    /// Unknown command
    Unknown(String),
}

/// Parse and execute a slash command
pub fn execute_command(input: &str) -> Option<CommandResult> {
    let input = input.trim();
    let command = input.strip_prefix('/')?;
    let command = command
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_lowercase();

    Some(match command.as_str() {
        "help" | "h" | "?" => CommandResult::Message(help_message()),
        "clear" | "c" => CommandResult::Clear,
        "retry" | "r" => CommandResult::Retry,
        "state" | "s" => CommandResult::State,
        "quit" | "exit" | "q" => CommandResult::Exit,
        _ => CommandResult::Unknown(command),
    })
}

fn help_message() -> String {
    r#"Available commands:
  /help, /h, /?        Show this help message
  /retry, /r           Resend the last message after a retryable error
  /state, /s           Print the conversation state as JSON
  /clear, /c           Start a fresh conversation
  /quit, /exit, /q     Exit statline

Press Ctrl-C while a reply is streaming to stop it."#
        .to_string()
}
