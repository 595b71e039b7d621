//! Reminder delivery.
//!
//! The dispatcher sends one reminder event with bounded retry and then
//! commits the event to the task store. The commit happens only after the
//! transport confirmed delivery, so a failure leaves the event due.

use std::sync::Arc;
use std::time::Duration;

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::{
    EngineConfig, NotificationSender, Phase, ReminderEvent, SendError, StateUpdate, Task,
    TaskStore,
};

/// Upper bound for a single backoff wait.
const MAX_BACKOFF: Duration = Duration::from_secs(10 * 60);

/// What happened to one reminder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Delivered and recorded.
    Sent,
    /// Nothing to send, or the task changed underneath us and the
    /// completed/deleted state wins.
    Skipped,
    /// Not delivered or not recorded. The event stays due.
    Failed,
}

/// Sends reminder events and records them in the task store.
pub struct Dispatcher {
    store: Arc<dyn TaskStore>,
    sender: Arc<dyn NotificationSender>,
    config: EngineConfig,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn TaskStore>,
        sender: Arc<dyn NotificationSender>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            sender,
            config,
        }
    }

    /// Deliver `due` for `task` if there is anything to deliver.
    ///
    /// `task` must be the snapshot `due` was classified from; its reminder
    /// state is the expected prior state of the commit.
    #[tracing::instrument(skip(self, task), fields(task_id = task.id, owner_id = task.owner_id))]
    pub async fn maybe_send(&self, task: &Task, due: Option<ReminderEvent>) -> SendOutcome {
        let Some(event) = due else {
            return SendOutcome::Skipped;
        };

        let text = compose_message(task, event, &self.config);
        if let Err(e) = self.deliver(task, &text).await {
            error!(
                phase = ?event.phase,
                bucket = event.bucket,
                error = %e,
                "reminder not delivered, will retry next tick"
            );
            return SendOutcome::Failed;
        }

        let new_state = task.reminder_state.record(event);
        match self
            .store
            .update_reminder_state(task.id, &task.reminder_state, new_state)
            .await
        {
            Ok(StateUpdate::Updated) => {
                info!(phase = ?event.phase, bucket = event.bucket, "reminder sent");
                SendOutcome::Sent
            }
            Ok(StateUpdate::Conflict) => {
                warn!(
                    phase = ?event.phase,
                    bucket = event.bucket,
                    "task changed while sending, discarding reminder state"
                );
                SendOutcome::Skipped
            }
            Err(e) => {
                error!(
                    phase = ?event.phase,
                    bucket = event.bucket,
                    error = %e,
                    "reminder sent but not recorded, it will be sent again"
                );
                SendOutcome::Failed
            }
        }
    }

    /// Send with exponential backoff, up to `max_attempts` attempts.
    async fn deliver(&self, task: &Task, text: &str) -> Result<(), SendError> {
        let mut backoff = ExponentialBackoff {
            current_interval: self.config.backoff_base,
            initial_interval: self.config.backoff_base,
            randomization_factor: 0.0,
            multiplier: 2.0,
            max_interval: MAX_BACKOFF,
            max_elapsed_time: None,
            ..Default::default()
        };

        let mut attempt = 1;
        loop {
            match self.sender.send(task.owner_id, text).await {
                Ok(()) => return Ok(()),
                Err(e) if !e.is_retryable() || attempt >= self.config.max_attempts => {
                    return Err(e);
                }
                Err(e) => {
                    let mut wait = backoff.next_backoff().unwrap_or(MAX_BACKOFF);
                    if let Some(hint) = e.retry_after() {
                        if hint > MAX_BACKOFF {
                            return Err(e);
                        }
                        wait = wait.max(hint);
                    }
                    warn!(
                        attempt,
                        max_attempts = self.config.max_attempts,
                        retry_in_ms = wait.as_millis() as u64,
                        error = %e,
                        "send attempt failed"
                    );
                    sleep(wait).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Message text for a reminder event. One template per phase.
pub fn compose_message(task: &Task, event: ReminderEvent, config: &EngineConfig) -> String {
    match event.phase {
        Phase::Advance => format!(
            "🔔 Task #{} is due within {}:\n{}",
            task.id,
            human_duration(config.advance_window),
            task.description
        ),
        Phase::AtDeadline => format!("⏰ Task #{} is due now:\n{}", task.id, task.description),
        Phase::Overdue => format!(
            "⚠️ Task #{} is overdue, reminding every {}:\n{}",
            task.id,
            human_duration(config.overdue_interval),
            task.description
        ),
    }
}

fn human_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs >= 3600 && secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs >= 60 && secs % 60 == 0 {
        format!("{} min", secs / 60)
    } else {
        format!("{}s", secs)
    }
}
