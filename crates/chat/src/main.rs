use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use lull::terminal::{Command, HELP, TerminalBell, TerminalSink, parse_command};
use lull::{DeliveryOutcome, DeliveryRejection, Messenger, MessengerBuilder, SettingsStore};
use lull_channel::{ChannelResult, HttpChannel, SessionId};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "lull=info,lull_channel=info";

/// Terminal chat client with streamed replies and afterthoughts.
#[derive(Parser, Debug)]
#[command(version)]
struct Cli {
    /// Session to talk in; a new one is created when omitted.
    #[arg(long, value_name = "UUID")]
    session: Option<SessionId>,

    /// Settings file to use instead of the default location.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Logs go to stderr so they never interleave with the transcript.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .with_writer(std::io::stderr)
        .try_init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(error = %error, "lull failed to start");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> ChannelResult<()> {
    let store = Arc::new(match cli.config {
        Some(path) => SettingsStore::new(path),
        None => SettingsStore::load(),
    });
    let settings = store.settings();
    if !settings.has_api_key() {
        tracing::warn!("no api key configured, requests are sent without credentials");
    }

    let channel = Arc::new(HttpChannel::new(settings.http_config())?);
    let session_id = cli.session.unwrap_or_else(SessionId::new_v7);
    let sink = Arc::new(TerminalSink::new(
        settings.assistant_display_name.clone(),
        store.config_path(),
    ));
    let messenger = MessengerBuilder::new(session_id, channel.clone(), channel, sink)
        .settings(&settings)
        .notifier(Arc::new(TerminalBell))
        .toggle(store.clone())
        .build();

    println!("session {session_id}. type /help for commands.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(error) => {
                tracing::warn!(error = %error, "failed to read stdin");
                break;
            }
        };

        let Some(command) = parse_command(&line) else {
            continue;
        };
        if command == Command::Quit {
            break;
        }
        handle(command, &messenger, &store);
    }

    messenger.shutdown();
    Ok(())
}

fn handle(command: Command, messenger: &Messenger, store: &SettingsStore) {
    match command {
        Command::Send(text) => {
            let messenger = messenger.clone();
            tokio::spawn(async move {
                match messenger.send(text).await {
                    DeliveryOutcome::Rejected(DeliveryRejection::ReplyInFlight) => {
                        println!("  still replying, use /cancel to stop it");
                    }
                    DeliveryOutcome::Rejected(DeliveryRejection::AfterthoughtInFlight) => {
                        println!("  a follow-up is arriving, try again in a moment");
                    }
                    DeliveryOutcome::Rejected(DeliveryRejection::EmptyMessage)
                    | DeliveryOutcome::Delivered(_)
                    | DeliveryOutcome::Failed(_) => {}
                }
            });
        }
        Command::Afterthoughts(enabled) => {
            if let Err(error) = store.set_afterthoughts_enabled(enabled) {
                tracing::warn!(error = %error, "failed to save afterthought setting");
            }
            if !enabled {
                messenger.disarm_afterthoughts();
            }
            println!("  afterthoughts {}", if enabled { "on" } else { "off" });
        }
        Command::Cancel => {
            if !messenger.cancel_delivery() {
                println!("  nothing to cancel");
            }
        }
        Command::Session(session_id) => {
            messenger.switch_session(session_id);
            println!("  switched to session {session_id}");
        }
        Command::Help => println!("{HELP}"),
        Command::Invalid(message) => println!("  {message}"),
        Command::Quit => {}
    }
}
