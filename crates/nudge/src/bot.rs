//! Telegram update poller.
//!
//! Long-polls `getUpdates`, runs each message as a command and replies in
//! the same chat. New tasks go through the scheduler's fast path so an
//! immediately due reminder does not wait for the next poll.

use std::sync::Arc;
use std::time::Duration;

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use chrono::FixedOffset;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use nudge_scheduler::{OwnerId, Scheduler, TaskStore};

use crate::commands;
use crate::telegram::{TelegramClient, Update};

/// Longest wait between failed polls.
const MAX_POLL_BACKOFF: Duration = Duration::from_secs(60);

const INTERNAL_ERROR_REPLY: &str = "Something went wrong, please try again later.";

/// Answers bot commands.
pub struct Bot {
    client: Arc<TelegramClient>,
    store: Arc<dyn TaskStore>,
    scheduler: Arc<Scheduler>,
    utc_offset: FixedOffset,
    poll_timeout_secs: u64,
}

impl Bot {
    pub fn new(
        client: Arc<TelegramClient>,
        store: Arc<dyn TaskStore>,
        scheduler: Arc<Scheduler>,
        utc_offset: FixedOffset,
        poll_timeout_secs: u64,
    ) -> Self {
        Self {
            client,
            store,
            scheduler,
            utc_offset,
            poll_timeout_secs,
        }
    }

    /// Poll for updates until shutdown is signalled.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(poll_timeout_secs = self.poll_timeout_secs, "bot poller started");

        let mut offset: Option<i64> = None;
        let mut backoff = ExponentialBackoff {
            current_interval: Duration::from_secs(1),
            initial_interval: Duration::from_secs(1),
            max_interval: MAX_POLL_BACKOFF,
            max_elapsed_time: None,
            ..Default::default()
        };

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let result = tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                    continue;
                }
                result = self.client.get_updates(offset, self.poll_timeout_secs) => result,
            };

            match result {
                Ok(updates) => {
                    backoff.reset();
                    if !updates.is_empty() {
                        debug!(count = updates.len(), "received updates");
                    }
                    for update in updates {
                        offset = Some(update.update_id + 1);
                        self.handle_update(update).await;
                    }
                }
                Err(e) => {
                    let wait = backoff.next_backoff().unwrap_or(MAX_POLL_BACKOFF);
                    warn!(
                        error = %e,
                        retry_in_ms = wait.as_millis() as u64,
                        "failed to poll updates"
                    );
                    tokio::select! {
                        changed = shutdown_rx.changed() => {
                            if changed.is_err() || *shutdown_rx.borrow() {
                                break;
                            }
                        }
                        _ = sleep(wait) => {}
                    }
                }
            }
        }

        info!("bot poller stopped");
    }

    async fn handle_update(&self, update: Update) {
        let Some(message) = update.message else {
            return;
        };
        let (Some(text), Some(from)) = (message.text.as_deref(), message.from.as_ref()) else {
            return;
        };

        debug!(
            update_id = update.update_id,
            message_id = message.message_id,
            owner_id = from.id,
            "handling message"
        );

        let reply = self.respond(from.id, text).await;
        if let Err(e) = self.client.send_message(message.chat.id, &reply).await {
            warn!(chat_id = message.chat.id, error = %e, "failed to send reply");
        }
    }

    /// Reply text for `text` sent by `owner_id`.
    pub async fn respond(&self, owner_id: OwnerId, text: &str) -> String {
        let command = match commands::parse(text, &self.utc_offset) {
            Ok(command) => command,
            Err(e) => return e.to_string(),
        };

        match commands::execute(self.store.as_ref(), owner_id, command, &self.utc_offset).await {
            Ok(reply) => {
                if let Some(task) = &reply.created {
                    self.scheduler.task_created(task).await;
                }
                reply.text
            }
            Err(e) => {
                error!(owner_id, error = %e, "command failed");
                INTERNAL_ERROR_REPLY.to_string()
            }
        }
    }
}
