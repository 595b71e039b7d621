//! End-to-end tests for the reminder engine: store, scheduler and a
//! recording sender wired together.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use pretty_assertions::assert_eq;
use tokio::sync::{Notify, watch};

use nudge_scheduler::{
    EngineConfig, InMemoryTaskStore, NewTask, NotificationSender, OwnerId, Phase, ReminderEvent,
    ReminderState, Scheduler, SendError, StateUpdate, StoreError, Task, TaskId, TaskStore,
    TickReport, classify,
};

/// Records every delivered message.
#[derive(Default)]
struct RecordingSender {
    sent: Mutex<Vec<(OwnerId, String)>>,
}

impl RecordingSender {
    fn sent(&self) -> Vec<(OwnerId, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationSender for RecordingSender {
    async fn send(&self, recipient: OwnerId, text: &str) -> Result<(), SendError> {
        self.sent
            .lock()
            .unwrap()
            .push((recipient, text.to_string()));
        Ok(())
    }
}

fn deadline() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 6, 1, 9, 0, 0).unwrap()
}

fn task(id: TaskId, description: &str, state: ReminderState) -> Task {
    Task {
        id,
        description: description.to_string(),
        deadline: deadline(),
        owner_id: 1000 + id as i64,
        is_completed: false,
        reminder_state: state,
        created_at: deadline() - ChronoDuration::days(2),
    }
}

async fn setup(tasks: Vec<Task>) -> (Arc<InMemoryTaskStore>, Arc<RecordingSender>, Scheduler) {
    let store = Arc::new(InMemoryTaskStore::new());
    for task in tasks {
        store.insert(task).await;
    }
    let sender = Arc::new(RecordingSender::default());
    let scheduler = Scheduler::new(store.clone(), sender.clone(), EngineConfig::default()).unwrap();
    (store, sender, scheduler)
}

async fn state_of(store: &InMemoryTaskStore, id: TaskId) -> ReminderState {
    store.get(id).await.unwrap().unwrap().reminder_state
}

#[tokio::test]
async fn advance_reminder_two_hours_before() {
    let (store, sender, scheduler) = setup(vec![task(1, "send invoice", ReminderState::default())]).await;

    let report = scheduler.tick(deadline() - ChronoDuration::hours(2)).await.unwrap();

    assert_eq!(report.sent, 1);
    let sent = sender.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, 1001);
    assert!(sent[0].1.contains("send invoice"));
    assert_eq!(
        state_of(&store, 1).await.last_event(),
        Some(ReminderEvent::advance())
    );
}

#[tokio::test]
async fn at_deadline_reminder_within_grace() {
    let state = ReminderState::default().record(ReminderEvent::advance());
    let (store, sender, scheduler) = setup(vec![task(1, "send invoice", state)]).await;

    scheduler.tick(deadline() + ChronoDuration::seconds(1)).await.unwrap();

    assert_eq!(sender.sent().len(), 1);
    assert_eq!(
        state_of(&store, 1).await.last_fired_phase,
        Some(Phase::AtDeadline)
    );
}

#[tokio::test]
async fn overdue_bucket_two_after_twenty_five_minutes() {
    let (store, _, scheduler) = setup(vec![task(1, "send invoice", ReminderState::default())]).await;

    scheduler.tick(deadline() + ChronoDuration::minutes(25)).await.unwrap();

    let state = state_of(&store, 1).await;
    assert_eq!(state.last_fired_phase, Some(Phase::Overdue));
    assert_eq!(state.last_fired_bucket_index, Some(2));
}

#[tokio::test]
async fn spent_overdue_bucket_waits_for_next_one() {
    let state = ReminderState::default().record(ReminderEvent::overdue(2));
    let (store, sender, scheduler) = setup(vec![task(1, "send invoice", state)]).await;

    let report = scheduler.tick(deadline() + ChronoDuration::minutes(25)).await.unwrap();
    assert_eq!(report.sent, 0);
    assert!(sender.sent().is_empty());

    scheduler.tick(deadline() + ChronoDuration::minutes(31)).await.unwrap();
    assert_eq!(sender.sent().len(), 1);
    assert_eq!(state_of(&store, 1).await.last_fired_bucket_index, Some(3));
}

#[tokio::test]
async fn completed_tasks_are_never_reminded() {
    let mut done = task(1, "done already", ReminderState::default());
    done.is_completed = true;
    let (_, sender, scheduler) = setup(vec![done]).await;

    for minutes in [-120, 0, 25, 600] {
        let report = scheduler
            .tick(deadline() + ChronoDuration::minutes(minutes))
            .await
            .unwrap();
        assert_eq!(report.tasks, 0);
    }
    assert!(sender.sent().is_empty());
}

#[tokio::test]
async fn same_instant_twice_sends_once() {
    let (_, sender, scheduler) = setup(vec![task(1, "send invoice", ReminderState::default())]).await;
    let now = deadline() - ChronoDuration::hours(2);

    let first = scheduler.tick(now).await.unwrap();
    let second = scheduler.tick(now).await.unwrap();

    assert_eq!(first.sent, 1);
    assert_eq!(
        second,
        TickReport {
            tasks: 1,
            sent: 0,
            skipped: 1,
            failed: 0
        }
    );
    assert_eq!(sender.sent().len(), 1);
}

#[tokio::test]
async fn frequent_ticks_walk_every_phase_in_order() {
    let (store, sender, scheduler) = setup(vec![task(1, "send invoice", ReminderState::default())]).await;

    let mut now = deadline() - ChronoDuration::minutes(1);
    let end = deadline() + ChronoDuration::minutes(45);
    let mut fired = Vec::new();
    while now < end {
        let before = state_of(&store, 1).await;
        scheduler.tick(now).await.unwrap();
        let after = state_of(&store, 1).await;
        if after != before {
            fired.push(after.last_event().unwrap());
        }
        now += ChronoDuration::seconds(2);
    }

    assert_eq!(
        fired,
        vec![
            ReminderEvent::advance(),
            ReminderEvent::at_deadline(),
            ReminderEvent::overdue(0),
            ReminderEvent::overdue(1),
            ReminderEvent::overdue(2),
            ReminderEvent::overdue(3),
            ReminderEvent::overdue(4),
        ]
    );
    assert_eq!(sender.sent().len(), fired.len());
}

#[tokio::test]
async fn restart_after_downtime_fires_only_current_bucket() {
    // Process was down from before the deadline until 55 minutes after
    let state = ReminderState::default().record(ReminderEvent::advance());
    let (store, sender, scheduler) = setup(vec![task(1, "send invoice", state)]).await;

    scheduler.tick(deadline() + ChronoDuration::minutes(55)).await.unwrap();

    assert_eq!(sender.sent().len(), 1);
    assert_eq!(
        state_of(&store, 1).await.last_event(),
        Some(ReminderEvent::overdue(5))
    );
}

#[tokio::test]
async fn tasks_are_processed_independently() {
    let tasks = vec![
        task(1, "first", ReminderState::default()),
        task(2, "second", ReminderState::default().record(ReminderEvent::advance())),
        task(3, "third", ReminderState::default()),
    ];
    let (store, sender, scheduler) = setup(tasks).await;

    let report = scheduler.tick(deadline() + ChronoDuration::seconds(2)).await.unwrap();

    assert_eq!(report.sent, 3);
    assert_eq!(sender.sent().len(), 3);
    for id in 1..=3 {
        assert_eq!(
            state_of(&store, id).await.last_event(),
            Some(ReminderEvent::at_deadline())
        );
    }
}

/// Sends to one recipient always fail, everything else succeeds.
struct BlockedRecipient {
    blocked: OwnerId,
    inner: RecordingSender,
}

#[async_trait]
impl NotificationSender for BlockedRecipient {
    async fn send(&self, recipient: OwnerId, text: &str) -> Result<(), SendError> {
        if recipient == self.blocked {
            return Err(SendError::Rejected("bot was blocked by the user".to_string()));
        }
        self.inner.send(recipient, text).await
    }
}

#[tokio::test]
async fn one_failing_task_does_not_block_others() {
    let store = Arc::new(InMemoryTaskStore::new());
    store.insert(task(1, "blocked", ReminderState::default())).await;
    store.insert(task(2, "fine", ReminderState::default())).await;
    let sender = Arc::new(BlockedRecipient {
        blocked: 1001,
        inner: RecordingSender::default(),
    });
    let scheduler = Scheduler::new(store.clone(), sender.clone(), EngineConfig::default()).unwrap();

    let report = scheduler.tick(deadline() - ChronoDuration::hours(1)).await.unwrap();

    assert_eq!(report.sent, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(state_of(&store, 1).await, ReminderState::default());
    assert_eq!(
        state_of(&store, 2).await.last_event(),
        Some(ReminderEvent::advance())
    );

    // Still due on the next tick
    let task = store.get(1).await.unwrap().unwrap();
    let later = deadline() - ChronoDuration::minutes(59);
    assert_eq!(
        classify(&task, later, scheduler.config()),
        Some(ReminderEvent::advance())
    );
}

/// Wraps the in-memory store and fails reminder state commits on demand.
struct FlakyCommitStore {
    inner: InMemoryTaskStore,
    fail_commits: Mutex<u32>,
    fail_listing: Mutex<bool>,
}

impl FlakyCommitStore {
    fn new() -> Self {
        Self {
            inner: InMemoryTaskStore::new(),
            fail_commits: Mutex::new(0),
            fail_listing: Mutex::new(false),
        }
    }
}

#[async_trait]
impl TaskStore for FlakyCommitStore {
    async fn list_incomplete(&self) -> Result<Vec<Task>, StoreError> {
        if *self.fail_listing.lock().unwrap() {
            return Err(StoreError::Unavailable("connection refused".to_string()));
        }
        self.inner.list_incomplete().await
    }

    async fn update_reminder_state(
        &self,
        id: TaskId,
        expected: &ReminderState,
        new: ReminderState,
    ) -> Result<StateUpdate, StoreError> {
        {
            let mut failures = self.fail_commits.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(StoreError::Unavailable("connection reset".to_string()));
            }
        }
        self.inner.update_reminder_state(id, expected, new).await
    }

    async fn create(&self, task: NewTask) -> Result<Task, StoreError> {
        self.inner.create(task).await
    }

    async fn get(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        self.inner.get(id).await
    }

    async fn list_for_owner(&self, owner_id: OwnerId) -> Result<Vec<Task>, StoreError> {
        self.inner.list_for_owner(owner_id).await
    }

    async fn mark_completed(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        self.inner.mark_completed(id).await
    }

    async fn delete(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        self.inner.delete(id).await
    }
}

#[tokio::test]
async fn lost_commit_resends_rather_than_drops() {
    let store = Arc::new(FlakyCommitStore::new());
    store.inner.insert(task(1, "send invoice", ReminderState::default())).await;
    *store.fail_commits.lock().unwrap() = 1;
    let sender = Arc::new(RecordingSender::default());
    let scheduler = Scheduler::new(store.clone(), sender.clone(), EngineConfig::default()).unwrap();
    let now = deadline() - ChronoDuration::hours(2);

    let first = scheduler.tick(now).await.unwrap();
    assert_eq!(first.failed, 1);
    assert_eq!(sender.sent().len(), 1);

    let second = scheduler.tick(now + ChronoDuration::minutes(1)).await.unwrap();
    assert_eq!(second.sent, 1);
    // Delivered twice, recorded once
    assert_eq!(sender.sent().len(), 2);
    let state = store.get(1).await.unwrap().unwrap().reminder_state;
    assert_eq!(state.last_event(), Some(ReminderEvent::advance()));
}

#[tokio::test]
async fn unavailable_store_abandons_tick() {
    let store = Arc::new(FlakyCommitStore::new());
    store.inner.insert(task(1, "send invoice", ReminderState::default())).await;
    *store.fail_listing.lock().unwrap() = true;
    let sender = Arc::new(RecordingSender::default());
    let scheduler = Scheduler::new(store.clone(), sender.clone(), EngineConfig::default()).unwrap();
    let now = deadline() - ChronoDuration::hours(2);

    assert!(scheduler.tick(now).await.is_err());
    assert!(sender.sent().is_empty());

    *store.fail_listing.lock().unwrap() = false;
    assert_eq!(scheduler.tick(now).await.unwrap().sent, 1);
}

/// Blocks every send until released.
struct GatedSender {
    release: Notify,
    started: Notify,
    inner: RecordingSender,
}

#[async_trait]
impl NotificationSender for GatedSender {
    async fn send(&self, recipient: OwnerId, text: &str) -> Result<(), SendError> {
        self.started.notify_one();
        self.release.notified().await;
        self.inner.send(recipient, text).await
    }
}

#[tokio::test]
async fn concurrent_ticks_send_once() {
    let store = Arc::new(InMemoryTaskStore::new());
    store.insert(task(1, "send invoice", ReminderState::default())).await;
    let sender = Arc::new(GatedSender {
        release: Notify::new(),
        started: Notify::new(),
        inner: RecordingSender::default(),
    });
    let scheduler = Arc::new(
        Scheduler::new(store.clone(), sender.clone(), EngineConfig::default()).unwrap(),
    );
    let now = deadline() - ChronoDuration::hours(2);

    let first = {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move { scheduler.tick(now).await })
    };
    sender.started.notified().await;

    // The first tick holds the task while its send is in flight
    let second = scheduler.tick(now).await.unwrap();
    assert_eq!(second.sent, 0);
    assert_eq!(second.skipped, 1);

    sender.release.notify_one();
    let first = first.await.unwrap().unwrap();
    assert_eq!(first.sent, 1);
    assert_eq!(sender.inner.sent().len(), 1);
}

#[tokio::test]
async fn run_loop_sends_and_shuts_down() {
    let store = Arc::new(InMemoryTaskStore::new());
    let created = store
        .create(NewTask::new("water plants", Utc::now() + ChronoDuration::hours(1), 77).unwrap())
        .await
        .unwrap();
    let sender = Arc::new(RecordingSender::default());
    let scheduler = Arc::new(
        Scheduler::new(store.clone(), sender.clone(), EngineConfig::default()).unwrap(),
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let handle = {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move { scheduler.run(shutdown_rx).await })
    };

    for _ in 0..100 {
        if !sender.sent().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(sender.sent().len(), 1);
    assert_eq!(sender.sent()[0].0, 77);

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();

    let stored = store.get(created.id).await.unwrap().unwrap();
    assert_eq!(stored.reminder_state.last_event(), Some(ReminderEvent::advance()));
}

#[tokio::test]
async fn task_created_wakes_sleeping_loop() {
    let store = Arc::new(InMemoryTaskStore::new());
    let sender = Arc::new(RecordingSender::default());
    let config = EngineConfig {
        poll_interval: Duration::from_secs(3600),
        ..Default::default()
    };
    let scheduler = Arc::new(Scheduler::new(store.clone(), sender.clone(), config).unwrap());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let handle = {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move { scheduler.run(shutdown_rx).await })
    };
    // Let the first, empty tick finish so the loop is asleep
    tokio::time::sleep(Duration::from_millis(50)).await;

    let task = store
        .create(NewTask::new("call back", Utc::now() + ChronoDuration::hours(3), 5).unwrap())
        .await
        .unwrap();
    scheduler.task_created(&task).await;

    for _ in 0..100 {
        if !sender.sent().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(sender.sent().len(), 1);

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
}
