//! statline - terminal client for the sports statistics assistant

mod commands;
mod config;
mod ui;
mod utils;

use clap::Parser;
use std::io::Write;
use std::sync::Arc;

use statline_chat::{ChatSession, HttpTransport, MatchPolicy, SessionConfig, SessionEvent};
use statline_stream::ClientConfig;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

/// statline - ask questions about sports statistics
#[derive(Parser, Debug)]
#[command(name = "statline")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Base URL of the chat backend (default: http://localhost:8000)
    #[arg(long)]
    base_url: Option<String>,

    /// Human-verification token
    #[arg(long)]
    token: Option<String>,

    /// Send requests without a verification token
    #[arg(long)]
    bypass_verification: bool,

    /// Ignore ambiguous completions of concurrently running tools
    #[arg(long)]
    strict_tools: bool,

    /// Run in non-interactive mode with a single message
    #[arg(short = 'c', long)]
    command: Option<String>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Initialize config file
    #[arg(long)]
    init_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize config and exit
    if args.init_config {
        match config::Config::init() {
            Ok(path) => {
                println!("Config file created at: {}", path.display());
                println!("\nExample config:\n{}", config::example_config());
            }
            Err(e) => {
                eprintln!("Error creating config: {}", e);
                std::process::exit(1);
            }
        }
        return Ok(());
    }

    let cfg = config::Config::load();
    init_tracing(args.verbose, &cfg);

    let client_config = client_config(&args, &cfg);
    let session_config = SessionConfig {
        tool_matching: if args.strict_tools || cfg.strict_tool_matching.unwrap_or(false) {
            MatchPolicy::Strict
        } else {
            MatchPolicy::OldestByName
        },
        ..Default::default()
    };

    let base_url = client_config.base_url.clone();
    let transport = Arc::new(HttpTransport::from_config(client_config)?);
    let mut session = ChatSession::new(transport, session_config);

    if let Some(message) = args.command {
        let ok = run_command(&mut session, &message).await;
        if !ok {
            std::process::exit(1);
        }
        return Ok(());
    }

    run_interactive(&mut session, &base_url).await
}

fn init_tracing(verbose: bool, cfg: &config::Config) {
    let filter = if verbose {
        EnvFilter::new("statline=debug")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(cfg.log_filter.as_deref().unwrap_or("warn")))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Merge config with CLI args (CLI takes precedence)
fn client_config(args: &Args, cfg: &config::Config) -> ClientConfig {
    let base_url = args
        .base_url
        .clone()
        .unwrap_or_else(|| cfg.base_url().to_string());
    let bypass = args.bypass_verification || cfg.bypass_verification.unwrap_or(false);

    let mut client_config = ClientConfig::new(base_url);
    if bypass {
        tracing::debug!("verification bypassed");
        return client_config;
    }

    match args.token.clone().or_else(|| cfg.verification_token()) {
        Some(token) => client_config = client_config.with_verification_token(token),
        None => tracing::warn!(
            "no verification token configured; set {} or pass --bypass-verification",
            config::TOKEN_ENV
        ),
    }
    client_config
}

/// Send one message and stream the reply; returns false if the turn failed.
async fn run_command(session: &mut ChatSession, message: &str) -> bool {
    let mut events = session.subscribe();
    session.send_message(message).await;
    drive_turn(session, &mut events, false).await;
    session.error().is_none()
}

/// Process the turn in flight, rendering events as they are applied.
///
/// Ctrl-C stops the turn through the session handle.
async fn drive_turn(
    session: &mut ChatSession,
    events: &mut broadcast::Receiver<SessionEvent>,
    interactive: bool,
) {
    let handle = session.handle();
    loop {
        tokio::select! {
            more = session.step() => {
                ui::render_pending(events, interactive);
                if !more {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => handle.stop(),
        }
    }
}

async fn run_interactive(session: &mut ChatSession, base_url: &str) -> anyhow::Result<()> {
    let mut events = session.subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    // Show minimal startup info (only if TTY)
    if std::io::IsTerminal::is_terminal(&std::io::stderr()) {
        eprintln!("statline ({})", base_url);
        eprintln!("Type /help for commands.");
        eprintln!();
    }

    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(input) = line else {
            // EOF or Ctrl-C at the prompt
            println!();
            break;
        };

        let input = input.trim();
        if input.is_empty() {
            continue;
        }

        if let Some(result) = commands::execute_command(input) {
            match result {
                commands::CommandResult::Clear => {
                    session.clear_conversation();
                    ui::render_pending(&mut events, true);
                }
                commands::CommandResult::Retry => {
                    if session.retry_last().await {
                        drive_turn(session, &mut events, true).await;
                    } else {
                        println!("Nothing to retry.");
                    }
                }
                commands::CommandResult::State => {
                    println!("{}", serde_json::to_string_pretty(&session.state())?);
                }
                commands::CommandResult::Message(msg) => {
                    println!("{}", msg);
                }
                commands::CommandResult::Exit => {
                    break;
                }
                commands::CommandResult::Unknown(cmd) => {
                    println!("Unknown command: /{}", cmd);
                    println!("Type /help for available commands.");
                }
            }
            continue;
        }

        session.send_message(input).await;
        drive_turn(session, &mut events, true).await;
    }

    Ok(())
}
