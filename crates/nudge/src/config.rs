//! Command-line and environment configuration.

use std::time::Duration;

use chrono::FixedOffset;
use clap::Args;
use miette::Result;

use nudge_scheduler::EngineConfig;

/// Reminder timing flags. Durations are in seconds.
#[derive(Debug, Clone, Args)]
pub struct EngineArgs {
    /// How long before the deadline the advance reminder is sent
    #[arg(long, env = "NUDGE_ADVANCE_WINDOW", default_value = "86400")]
    pub advance_window: u64,

    /// How long after the deadline the at-deadline reminder is still sent
    #[arg(long, env = "NUDGE_GRACE", default_value = "5")]
    pub grace: u64,

    /// Interval between overdue reminders
    #[arg(long, env = "NUDGE_OVERDUE_INTERVAL", default_value = "600")]
    pub overdue_interval: u64,

    /// Longest sleep between scheduler ticks
    #[arg(long, env = "NUDGE_POLL_INTERVAL", default_value = "60")]
    pub poll_interval: u64,

    /// Send attempts per reminder per tick
    #[arg(long, env = "NUDGE_MAX_ATTEMPTS", default_value = "3")]
    pub max_attempts: u32,

    /// Initial retry delay, doubled after each failed attempt
    #[arg(long, env = "NUDGE_BACKOFF_BASE", default_value = "2")]
    pub backoff_base: u64,

    /// Tasks processed in parallel within one tick
    #[arg(long, env = "NUDGE_MAX_CONCURRENCY", default_value = "8")]
    pub max_concurrency: usize,
}

impl EngineArgs {
    /// Build and validate the engine configuration.
    pub fn to_config(&self) -> Result<EngineConfig> {
        let config = EngineConfig {
            advance_window: Duration::from_secs(self.advance_window),
            grace: Duration::from_secs(self.grace),
            overdue_interval: Duration::from_secs(self.overdue_interval),
            poll_interval: Duration::from_secs(self.poll_interval),
            max_attempts: self.max_attempts,
            backoff_base: Duration::from_secs(self.backoff_base),
            max_concurrency: self.max_concurrency,
        };
        config.validate().map_err(|e| miette::miette!("{}", e))?;
        Ok(config)
    }
}

/// Offset deadlines are written in, from minutes east of UTC.
pub fn utc_offset(minutes: i32) -> Result<FixedOffset> {
    minutes
        .checked_mul(60)
        .and_then(FixedOffset::east_opt)
        .ok_or_else(|| miette::miette!("UTC offset out of range: {} minutes", minutes))
}
