//! Reminder classification.
//!
//! Maps a task and an instant to the reminder event that is due at that
//! instant, if any. Classification works on buckets rather than on exact
//! wall-clock matches, so a late or restarted tick still finds the event
//! that became due while nobody was looking.

use chrono::{DateTime, TimeDelta, Utc};

use crate::{EngineConfig, ReminderEvent, Task};

/// Event due for `task` at `now`, or `None` if nothing needs sending.
///
/// Phases are checked in order: completed tasks never fire, then advance
/// (`0 < Δ <= advance_window`), then at-deadline (`-grace <= Δ <= 0`), then
/// overdue (`Δ < -grace`, bucket `floor(|Δ| / overdue_interval)`), where
/// `Δ = deadline - now`. An event the task has already spent is not due.
pub fn classify(task: &Task, now: DateTime<Utc>, config: &EngineConfig) -> Option<ReminderEvent> {
    if task.is_completed {
        return None;
    }

    let event = event_for_offset(task.deadline - now, config)?;
    if task.reminder_state.has_spent(event) {
        return None;
    }
    Some(event)
}

/// Next instant strictly after `after` at which a new event becomes due for
/// `task`, assuming its reminder state does not change.
///
/// Only phase openings and overdue bucket boundaries count. If an event is
/// already due at `after`, the result is the boundary after that one, so a
/// failing send is retried on the next boundary or poll, not immediately.
/// Returns `None` for completed tasks.
pub fn next_due_after(
    task: &Task,
    after: DateTime<Utc>,
    config: &EngineConfig,
) -> Option<DateTime<Utc>> {
    if task.is_completed {
        return None;
    }

    let deadline = task.deadline;
    let interval_ms = config.overdue_interval_chrono().num_milliseconds().max(1);
    let mut candidates = Vec::with_capacity(5);

    // Advance window opens
    candidates.push(deadline.checked_sub_signed(config.advance_window_chrono()));
    // At-deadline window opens
    candidates.push(Some(deadline));
    // First overdue instant
    candidates.push(
        config
            .grace_chrono()
            .checked_add(&TimeDelta::milliseconds(1))
            .and_then(|offset| deadline.checked_add_signed(offset)),
    );
    // Next bucket boundary after `after`
    if after >= deadline {
        let elapsed_ms = (after - deadline).num_milliseconds();
        let next_bucket = (elapsed_ms / interval_ms).saturating_add(1);
        candidates.push(bucket_start(deadline, next_bucket, interval_ms));
    }
    // Bucket following the last delivered one
    if let Some(last) = task.reminder_state.last_event() {
        let next_bucket = i64::try_from(last.bucket)
            .unwrap_or(i64::MAX)
            .saturating_add(1);
        candidates.push(bucket_start(deadline, next_bucket, interval_ms));
    }

    candidates
        .into_iter()
        .flatten()
        .filter(|candidate| *candidate > after)
        .filter(|candidate| classify(task, *candidate, config).is_some())
        .min()
}

/// Event for a deadline offset, ignoring what has already fired.
fn event_for_offset(delta: TimeDelta, config: &EngineConfig) -> Option<ReminderEvent> {
    if delta > TimeDelta::zero() {
        return (delta <= config.advance_window_chrono()).then(ReminderEvent::advance);
    }

    if delta >= -config.grace_chrono() {
        return Some(ReminderEvent::at_deadline());
    }

    let overdue_ms = delta.num_milliseconds().saturating_neg();
    let interval_ms = config.overdue_interval_chrono().num_milliseconds().max(1);
    let bucket = u64::try_from(overdue_ms / interval_ms).unwrap_or(0);
    Some(ReminderEvent::overdue(bucket))
}

fn bucket_start(deadline: DateTime<Utc>, bucket: i64, interval_ms: i64) -> Option<DateTime<Utc>> {
    TimeDelta::try_milliseconds(interval_ms.checked_mul(bucket)?)
        .and_then(|offset| deadline.checked_add_signed(offset))
}
