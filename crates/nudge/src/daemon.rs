//! Daemon command: the scheduler loop and the bot poller side by side.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::FixedOffset;
use miette::Result;
use tokio::sync::watch;
use tracing::info;

use nudge_scheduler::{EngineConfig, Scheduler, TaskStore};

use crate::bot::Bot;
use crate::file_store::JsonFileStore;
use crate::telegram::TelegramClient;

/// Configuration for the daemon.
pub struct DaemonConfig {
    pub token: String,
    pub api_url: String,
    pub store_path: PathBuf,
    pub engine: EngineConfig,
    /// Offset deadlines are entered and shown in.
    pub utc_offset: FixedOffset,
    /// Long-poll timeout for `getUpdates`, in seconds.
    pub poll_timeout_secs: u64,
}

/// Run until Ctrl-C.
pub async fn run(config: DaemonConfig) -> Result<()> {
    info!(
        store = %config.store_path.display(),
        poll_interval_secs = config.engine.poll_interval.as_secs(),
        "starting nudge daemon"
    );

    let store: Arc<dyn TaskStore> = Arc::new(JsonFileStore::new(&config.store_path));
    let telegram = Arc::new(TelegramClient::with_base_url(config.api_url, config.token));

    // Refuse to start on an unreadable store
    let pending = store
        .list_incomplete()
        .await
        .map_err(|e| miette::miette!("failed to load tasks: {}", e))?;
    info!(pending = pending.len(), "loaded tasks");

    let scheduler = Arc::new(
        Scheduler::new(Arc::clone(&store), telegram.clone(), config.engine)
            .map_err(|e| miette::miette!("{}", e))?,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("received shutdown signal");
        let _ = shutdown_tx.send(true);
    });

    let scheduler_handle = {
        let scheduler = Arc::clone(&scheduler);
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move { scheduler.run(shutdown_rx).await })
    };

    let bot = Bot::new(
        telegram,
        store,
        scheduler,
        config.utc_offset,
        config.poll_timeout_secs,
    );
    let bot_handle = tokio::spawn(async move { bot.run(shutdown_rx).await });

    let _ = scheduler_handle.await;
    let _ = bot_handle.await;

    info!("daemon shut down gracefully");
    Ok(())
}
