//! Task and reminder state types.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ValidationError;

/// Store-assigned task identifier.
pub type TaskId = u64;

/// Identifier of the user who receives a task's reminders.
pub type OwnerId = i64;

/// A task with a deadline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Store-assigned id, never reused.
    pub id: TaskId,
    /// What needs doing. Never empty.
    pub description: String,
    /// When it is due. Never changes after creation.
    pub deadline: DateTime<Utc>,
    /// Who gets notified.
    pub owner_id: OwnerId,
    /// Completed tasks never produce reminders again.
    #[serde(default)]
    pub is_completed: bool,
    /// Which reminder events have already been delivered.
    #[serde(default)]
    pub reminder_state: ReminderState,
    /// When this task was created.
    pub created_at: DateTime<Utc>,
}

/// Validated input for creating a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTask {
    description: String,
    deadline: DateTime<Utc>,
    owner_id: OwnerId,
}

impl NewTask {
    /// Validate task input. The description is trimmed.
    pub fn new(
        description: impl AsRef<str>,
        deadline: DateTime<Utc>,
        owner_id: OwnerId,
    ) -> Result<Self, ValidationError> {
        let description = description.as_ref().trim();
        if description.is_empty() {
            return Err(ValidationError::EmptyDescription);
        }
        if owner_id < 1 {
            return Err(ValidationError::InvalidOwner(owner_id));
        }
        Ok(Self {
            description: description.to_string(),
            deadline,
            owner_id,
        })
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn deadline(&self) -> DateTime<Utc> {
        self.deadline
    }

    pub fn owner_id(&self) -> OwnerId {
        self.owner_id
    }

    /// Build the stored task with an empty reminder state.
    pub fn into_task(self, id: TaskId, created_at: DateTime<Utc>) -> Task {
        Task {
            id,
            description: self.description,
            deadline: self.deadline,
            owner_id: self.owner_id,
            is_completed: false,
            reminder_state: ReminderState::default(),
            created_at,
        }
    }
}

/// Category of reminder, in the order a task passes through them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Deadline is coming up.
    Advance,
    /// Deadline is now.
    AtDeadline,
    /// Deadline has passed; repeats every overdue interval.
    Overdue,
}

/// One deliverable reminder: a phase and its idempotency bucket.
///
/// `Advance` and `AtDeadline` only have bucket 0. `Overdue` buckets count
/// the whole overdue intervals elapsed since the deadline. Events order by
/// phase first, then bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReminderEvent {
    pub phase: Phase,
    pub bucket: u64,
}

impl ReminderEvent {
    pub fn advance() -> Self {
        Self {
            phase: Phase::Advance,
            bucket: 0,
        }
    }

    pub fn at_deadline() -> Self {
        Self {
            phase: Phase::AtDeadline,
            bucket: 0,
        }
    }

    pub fn overdue(bucket: u64) -> Self {
        Self {
            phase: Phase::Overdue,
            bucket,
        }
    }
}

impl Ord for ReminderEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        self.phase
            .cmp(&other.phase)
            .then(self.bucket.cmp(&other.bucket))
    }
}

impl PartialOrd for ReminderEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Record of the latest reminder delivered for a task.
///
/// Every event up to and including the recorded one counts as spent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReminderState {
    /// Phase of the last delivered reminder, if any.
    #[serde(default)]
    pub last_fired_phase: Option<Phase>,
    /// Overdue bucket of the last delivered reminder. Only set for `Overdue`.
    #[serde(default)]
    pub last_fired_bucket_index: Option<u64>,
}

impl ReminderState {
    /// The last delivered event, if any.
    pub fn last_event(&self) -> Option<ReminderEvent> {
        self.last_fired_phase.map(|phase| match phase {
            Phase::Overdue => ReminderEvent::overdue(self.last_fired_bucket_index.unwrap_or(0)),
            phase => ReminderEvent { phase, bucket: 0 },
        })
    }

    /// Whether `event` has already been delivered (or superseded).
    pub fn has_spent(&self, event: ReminderEvent) -> bool {
        self.last_event().is_some_and(|last| event <= last)
    }

    /// State after delivering `event`. Never moves backwards.
    pub fn record(&self, event: ReminderEvent) -> Self {
        if self.has_spent(event) {
            return *self;
        }
        Self {
            last_fired_phase: Some(event.phase),
            last_fired_bucket_index: (event.phase == Phase::Overdue).then_some(event.bucket),
        }
    }
}
