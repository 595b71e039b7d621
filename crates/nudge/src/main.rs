//! Nudge: deadline reminder bot for Telegram
//!
//! Main binary with subcommands:
//! - `daemon`: scheduler loop and bot poller
//! - `add`, `list`, `complete`, `delete`: manage tasks in the store directly

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use nudge_scheduler::{OwnerId, TaskId};

mod bot;
mod commands;
mod config;
mod daemon;
mod file_store;
mod telegram;

use commands::Command;
use config::EngineArgs;
use file_store::JsonFileStore;

#[derive(Parser)]
#[command(name = "nudge")]
#[command(about = "Deadline reminder bot for Telegram", long_about = None)]
struct Cli {
    /// Task file (defaults to the user data directory)
    #[arg(long, env = "NUDGE_STORE_PATH", global = true)]
    store_path: Option<PathBuf>,

    /// Offset from UTC, in minutes, that deadlines are written in
    #[arg(
        long,
        env = "NUDGE_UTC_OFFSET_MINUTES",
        default_value = "0",
        allow_negative_numbers = true,
        global = true
    )]
    utc_offset_minutes: i32,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the reminder daemon
    Daemon {
        /// Bot token
        #[arg(long, env = "NUDGE_TELEGRAM_TOKEN", hide_env_values = true)]
        token: String,

        /// Bot API base URL
        #[arg(long, env = "NUDGE_TELEGRAM_API_URL", default_value = telegram::DEFAULT_API_URL)]
        api_url: String,

        /// Long-poll timeout for incoming messages, in seconds
        #[arg(long, env = "NUDGE_POLL_TIMEOUT", default_value = "30")]
        poll_timeout: u64,

        #[command(flatten)]
        engine: EngineArgs,
    },

    /// Add a task: description followed by DD-MM-YYYY-HH-MM
    Add {
        /// Owner (Telegram user id)
        #[arg(long, env = "NUDGE_OWNER")]
        owner: OwnerId,

        /// Description and deadline
        #[arg(required = true, num_args = 1..)]
        text: Vec<String>,
    },

    /// List open tasks
    List {
        #[arg(long, env = "NUDGE_OWNER")]
        owner: OwnerId,
    },

    /// Mark a task as completed
    Complete {
        #[arg(long, env = "NUDGE_OWNER")]
        owner: OwnerId,

        id: TaskId,
    },

    /// Delete a task
    Delete {
        #[arg(long, env = "NUDGE_OWNER")]
        owner: OwnerId,

        id: TaskId,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "nudge=info,nudge_scheduler=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let utc_offset = config::utc_offset(cli.utc_offset_minutes)?;
    let store_path = cli.store_path.unwrap_or_else(JsonFileStore::default_path);

    let (owner, command) = match cli.command {
        Commands::Daemon {
            token,
            api_url,
            poll_timeout,
            engine,
        } => {
            return daemon::run(daemon::DaemonConfig {
                token,
                api_url,
                store_path,
                engine: engine.to_config()?,
                utc_offset,
                poll_timeout_secs: poll_timeout,
            })
            .await;
        }
        Commands::Add { owner, text } => {
            let command = commands::parse(&format!("/add {}", text.join(" ")), &utc_offset)
                .map_err(|e| miette::miette!("{}", e))?;
            (owner, command)
        }
        Commands::List { owner } => (owner, Command::List),
        Commands::Complete { owner, id } => (owner, Command::Complete(id)),
        Commands::Delete { owner, id } => (owner, Command::Delete(id)),
    };

    let store = JsonFileStore::new(store_path);
    let reply = commands::execute(&store, owner, command, &utc_offset)
        .await
        .map_err(|e| miette::miette!("{}", e))?;
    println!("{}", reply.text);
    Ok(())
}
