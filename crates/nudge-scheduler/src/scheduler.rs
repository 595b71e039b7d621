//! Scheduler loop.
//!
//! On every tick the scheduler takes a snapshot of incomplete tasks,
//! classifies each one and hands due events to the dispatcher. Between
//! ticks it sleeps until the earliest upcoming due instant, capped by the
//! poll interval, and wakes early when a new task needs attention.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashSet;
use futures_util::{StreamExt, stream};
use tokio::sync::{Mutex, Notify, watch};
use tokio::time::sleep;
use tracing::{debug, error, info};

use crate::{
    Dispatcher, EngineConfig, NotificationSender, SchedulerError, SendOutcome, Task, TaskId,
    TaskStore, classify, next_due_after,
};

/// Minimum sleep between ticks.
const MIN_SLEEP: Duration = Duration::from_secs(1);

/// Counts of what one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Incomplete tasks in the snapshot.
    pub tasks: usize,
    /// Reminders delivered and recorded.
    pub sent: usize,
    /// Tasks with nothing due, or whose reminder was discarded.
    pub skipped: usize,
    /// Reminders that stay due for a later tick.
    pub failed: usize,
}

impl TickReport {
    fn record(&mut self, outcome: SendOutcome) {
        match outcome {
            SendOutcome::Sent => self.sent += 1,
            SendOutcome::Skipped => self.skipped += 1,
            SendOutcome::Failed => self.failed += 1,
        }
    }
}

/// The reminder scheduler.
pub struct Scheduler {
    store: Arc<dyn TaskStore>,
    dispatcher: Dispatcher,
    config: EngineConfig,
    /// Task ids currently being processed.
    in_flight: DashSet<TaskId>,
    /// Earliest instant a known task becomes due.
    next_wakeup: Mutex<Option<DateTime<Utc>>>,
    wake: Notify,
}

impl Scheduler {
    /// Create a scheduler. Fails if `config` is invalid.
    pub fn new(
        store: Arc<dyn TaskStore>,
        sender: Arc<dyn NotificationSender>,
        config: EngineConfig,
    ) -> Result<Self, SchedulerError> {
        config.validate()?;
        Ok(Self {
            dispatcher: Dispatcher::new(Arc::clone(&store), sender, config.clone()),
            store,
            config,
            in_flight: DashSet::new(),
            next_wakeup: Mutex::new(None),
            wake: Notify::new(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Earliest known instant at which a task becomes due.
    pub async fn next_wakeup(&self) -> Option<DateTime<Utc>> {
        *self.next_wakeup.lock().await
    }

    /// Run one tick as of `now`.
    ///
    /// Fails only if the store cannot list tasks; failures of individual
    /// tasks are counted in the report and never stop the others.
    #[tracing::instrument(skip(self))]
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport, SchedulerError> {
        let tasks = match self.store.list_incomplete().await {
            Ok(tasks) => tasks,
            Err(e) => {
                self.retain_future_wakeup(now, None).await;
                return Err(e.into());
            }
        };

        let count = tasks.len();
        debug!(count, "evaluating tasks");

        let results: Vec<(SendOutcome, Option<DateTime<Utc>>)> = stream::iter(tasks)
            .map(|task| async move { self.process_task(&task, now).await })
            .buffer_unordered(self.config.max_concurrency)
            .collect()
            .await;

        let mut report = TickReport {
            tasks: count,
            ..Default::default()
        };
        let mut next = None;
        for (outcome, next_due) in results {
            report.record(outcome);
            next = earliest(next, next_due);
        }

        self.retain_future_wakeup(now, next).await;
        Ok(report)
    }

    /// Classify and dispatch one task.
    ///
    /// Returns the outcome and the task's next due instant after `now`.
    async fn process_task(
        &self,
        task: &Task,
        now: DateTime<Utc>,
    ) -> (SendOutcome, Option<DateTime<Utc>>) {
        let Some(_guard) = InFlight::acquire(&self.in_flight, task.id) else {
            debug!(task_id = task.id, "task already in flight, skipping");
            return (SendOutcome::Skipped, None);
        };

        let due = classify(task, now, &self.config);
        let outcome = self.dispatcher.maybe_send(task, due).await;

        let next_due = match (outcome, due) {
            (SendOutcome::Sent, Some(event)) => {
                let updated = Task {
                    reminder_state: task.reminder_state.record(event),
                    ..task.clone()
                };
                next_due_after(&updated, now, &self.config)
            }
            _ => next_due_after(task, now, &self.config),
        };

        (outcome, next_due)
    }

    /// Fast path for a freshly created task.
    ///
    /// Wakes the loop right away if the task is already due, otherwise pulls
    /// the next wake-up forward to the task's first due instant.
    #[tracing::instrument(skip(self, task), fields(task_id = task.id))]
    pub async fn task_created(&self, task: &Task) {
        self.schedule_task(task, Utc::now()).await;
    }

    async fn schedule_task(&self, task: &Task, now: DateTime<Utc>) {
        let due_at = if classify(task, now, &self.config).is_some() {
            Some(now)
        } else {
            next_due_after(task, now, &self.config)
        };

        let Some(due_at) = due_at else {
            return;
        };

        let mut next = self.next_wakeup.lock().await;
        if next.is_none_or(|current| due_at < current) {
            *next = Some(due_at);
            drop(next);
            debug!(due_at = %due_at, "pulled next wake-up forward");
            self.wake.notify_one();
        }
    }

    /// Store `candidate` as the next wake-up, keeping an existing wake-up that
    /// is still in the future and earlier.
    async fn retain_future_wakeup(&self, now: DateTime<Utc>, candidate: Option<DateTime<Utc>>) {
        let mut next = self.next_wakeup.lock().await;
        let existing = next.filter(|at| *at > now);
        *next = earliest(existing, candidate);
    }

    /// How long to sleep before the next tick.
    pub async fn calculate_sleep_duration(&self, now: DateTime<Utc>) -> Duration {
        let poll = self.config.poll_interval;
        match *self.next_wakeup.lock().await {
            Some(at) => (at - now)
                .to_std()
                .unwrap_or(Duration::ZERO)
                .clamp(MIN_SLEEP, poll.max(MIN_SLEEP)),
            None => poll,
        }
    }

    /// Run the scheduler loop until shutdown is signalled.
    ///
    /// A tick that has started always runs to completion, so in-flight sends
    /// finish (or fail and stay due) before the loop exits.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "scheduler starting"
        );

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            match self.tick(Utc::now()).await {
                Ok(report) if report.sent > 0 || report.failed > 0 => {
                    info!(
                        tasks = report.tasks,
                        sent = report.sent,
                        failed = report.failed,
                        "tick finished"
                    );
                }
                Ok(report) => debug!(tasks = report.tasks, "tick finished, nothing sent"),
                Err(e) => error!(error = %e, "tick abandoned, retrying next interval"),
            }

            let sleep_duration = self.calculate_sleep_duration(Utc::now()).await;
            debug!(sleep_ms = sleep_duration.as_millis() as u64, "sleeping until next tick");

            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("scheduler received shutdown signal");
                        break;
                    }
                }
                _ = self.wake.notified() => {
                    debug!("woken early for a new task");
                }
                _ = sleep(sleep_duration) => {}
            }
        }

        info!("scheduler shut down gracefully");
    }
}

fn earliest(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// Marks a task id as in flight until dropped.
struct InFlight<'a> {
    set: &'a DashSet<TaskId>,
    id: TaskId,
}

impl<'a> InFlight<'a> {
    fn acquire(set: &'a DashSet<TaskId>, id: TaskId) -> Option<Self> {
        set.insert(id).then_some(Self { set, id })
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set.remove(&self.id);
    }
}
