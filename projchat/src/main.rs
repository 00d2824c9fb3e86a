//! `ProjChat` line-oriented chat client.
//!
//! Connects to a relay server and keeps one conversation in sync. Type a
//! message and press enter to send it; the timeline is reprinted whenever
//! it changes. Configuration via CLI flags, environment variables, or
//! config file (`~/.config/projchat/config.toml`).
//!
//! ```bash
//! cargo run --bin projchat -- --relay-url ws://127.0.0.1:9000/ws \
//!     --user-id alice --counterpart-id bob --project-id apollo
//! ```
//!
//! Commands: `/retry N`, `/dismiss N`, `/refresh`, `/quit`.

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_appender::non_blocking::WorkerGuard;

use projchat::backend::relay::RelayBackend;
use projchat::config::{CliArgs, ClientConfig, ConfigError};
use projchat::sync::engine::{ConversationEngine, ViewSession};
use projchat::sync::{ConversationSnapshot, DeliveryState, Identity};

/// A parsed line of user input.
#[derive(Debug, PartialEq, Eq)]
enum Command {
    Send(String),
    Retry(usize),
    Dismiss(usize),
    Refresh,
    Quit,
    Unknown(String),
}

fn parse_command(line: &str) -> Option<Command> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Some(Command::Send(line.to_string()));
    };
    let mut parts = rest.split_whitespace();
    let command = match (parts.next(), parts.next().map(str::parse::<usize>)) {
        (Some("quit" | "q"), None) => Command::Quit,
        (Some("refresh"), None) => Command::Refresh,
        (Some("retry"), Some(Ok(n))) => Command::Retry(n),
        (Some("dismiss"), Some(Ok(n))) => Command::Dismiss(n),
        _ => Command::Unknown(line.to_string()),
    };
    Some(command)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = CliArgs::parse();

    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e @ (ConfigError::ReadFile { .. } | ConfigError::ParseToml(_))) => {
            eprintln!("Warning: failed to load config file: {e}");
            match ClientConfig::from_cli(&cli) {
                Ok(c) => c,
                Err(e) => {
                    eprintln!("error: {e}");
                    return ExitCode::FAILURE;
                }
            }
        }
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Logs go to a file; stdout is the chat surface.
    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());
    tracing::info!("projchat starting");

    let (me, key) = match config.conversation() {
        Ok(ids) => ids,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let backend = match RelayBackend::connect(&config.relay, me.clone()).await {
        Ok(backend) => Arc::new(backend),
        Err(e) => {
            eprintln!("error: could not connect to {}: {e}", config.relay.url);
            return ExitCode::FAILURE;
        }
    };

    let engine = ConversationEngine::new(backend, me, key, config.sync.clone());
    let session = engine.start().await;
    println!(
        "chatting with {} in {} (/quit to exit)",
        engine.key().counterpart_id,
        engine.key().project_id
    );

    run(&engine, &session, &config.timestamp_format).await;

    session.stop();
    tracing::info!("projchat exiting");
    ExitCode::SUCCESS
}

/// Initialize file-based logging.
///
/// Returns a [`WorkerGuard`] that must be held until shutdown to ensure all
/// buffered log entries are flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("projchat.log");
    let log_path = file_path.unwrap_or(&default_path);

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

async fn run(engine: &ConversationEngine<RelayBackend>, session: &ViewSession<RelayBackend>, time_format: &str) {
    let mut updates = engine.watch();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = updates.borrow_and_update().clone();
                render(&snapshot, time_format);
            }
            line = lines.next_line() => {
                let Ok(Some(line)) = line else { break };
                let Some(command) = parse_command(&line) else { continue };
                if !execute(engine, session, command) {
                    break;
                }
            }
        }
    }
}

/// Runs one command. Returns `false` when the client should exit.
fn execute(engine: &ConversationEngine<RelayBackend>, session: &ViewSession<RelayBackend>, command: Command) -> bool {
    let snapshot = engine.snapshot();
    let nth = |n: usize| -> Option<Identity> {
        n.checked_sub(1)
            .and_then(|i| snapshot.messages.get(i))
            .map(|m| m.identity.clone())
    };

    match command {
        Command::Quit => return false,
        Command::Refresh => session.trigger_refresh(),
        Command::Send(text) => {
            if let Err(e) = engine.send(&text) {
                println!("! {e}");
            }
        }
        Command::Retry(n) => match nth(n) {
            Some(identity) => {
                if let Err(e) = engine.retry(&identity) {
                    println!("! {e}");
                }
            }
            None => println!("! no message #{n}"),
        },
        Command::Dismiss(n) => match nth(n) {
            Some(identity) => {
                if let Err(e) = engine.dismiss(&identity) {
                    println!("! {e}");
                }
            }
            None => println!("! no message #{n}"),
        },
        Command::Unknown(text) => println!("! unknown command {text} (try /retry N, /dismiss N, /refresh, /quit)"),
    }
    true
}

fn render(snapshot: &ConversationSnapshot, time_format: &str) {
    println!();
    println!("[{}]", snapshot.connection);
    if snapshot.stalled {
        println!("!! cannot reach the server, messages may be out of date");
    }
    for (i, message) in snapshot.messages.iter().enumerate() {
        let marker = match message.delivery {
            DeliveryState::Pending => " (sending)",
            DeliveryState::Confirmed => "",
            DeliveryState::Failed => " (failed: /retry or /dismiss)",
        };
        println!(
            "{:>3} {} {}: {}{marker}",
            i + 1,
            message.sent_at.label(time_format),
            message.sender_id,
            message.content
        );
    }
}
