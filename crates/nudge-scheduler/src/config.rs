//! Engine configuration.

use std::time::Duration;

use crate::SchedulerError;

/// Timing and retry knobs for the reminder engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// How long before the deadline the advance reminder becomes due.
    pub advance_window: Duration,
    /// How long after the deadline the at-deadline reminder is still sent.
    pub grace: Duration,
    /// Spacing of overdue reminders.
    pub overdue_interval: Duration,
    /// Longest sleep between ticks.
    pub poll_interval: Duration,
    /// Send attempts per reminder per tick.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles after each failure.
    pub backoff_base: Duration,
    /// Tasks processed in parallel within one tick.
    pub max_concurrency: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            advance_window: Duration::from_secs(24 * 60 * 60),
            grace: Duration::from_secs(5),
            overdue_interval: Duration::from_secs(10 * 60),
            poll_interval: Duration::from_secs(60),
            max_attempts: 3,
            backoff_base: Duration::from_secs(2),
            max_concurrency: 8,
        }
    }
}

impl EngineConfig {
    /// Check that the configuration can drive the engine.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.overdue_interval.is_zero() {
            return Err(SchedulerError::InvalidConfig(
                "overdue interval must be positive".to_string(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(SchedulerError::InvalidConfig(
                "poll interval must be positive".to_string(),
            ));
        }
        if self.grace >= self.overdue_interval {
            return Err(SchedulerError::InvalidConfig(format!(
                "grace ({}s) must be shorter than the overdue interval ({}s)",
                self.grace.as_secs(),
                self.overdue_interval.as_secs()
            )));
        }
        if self.max_attempts == 0 {
            return Err(SchedulerError::InvalidConfig(
                "max attempts must be at least 1".to_string(),
            ));
        }
        if self.max_concurrency == 0 {
            return Err(SchedulerError::InvalidConfig(
                "max concurrency must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn advance_window_chrono(&self) -> chrono::Duration {
        to_chrono(self.advance_window)
    }

    pub(crate) fn grace_chrono(&self) -> chrono::Duration {
        to_chrono(self.grace)
    }

    pub(crate) fn overdue_interval_chrono(&self) -> chrono::Duration {
        to_chrono(self.overdue_interval)
    }
}

/// Durations beyond chrono's range saturate.
fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}
