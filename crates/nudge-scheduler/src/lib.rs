//! Deadline reminder engine for nudge.
//!
//! This crate decides which tasks need a notification right now and sends
//! at most one notification per reminder event:
//! - One advance reminder inside the advance window before the deadline
//! - One reminder at the deadline (within a small grace period)
//! - A recurring overdue reminder per elapsed interval until completion
//!
//! Reminder state is committed to the task store only after a confirmed
//! send, so a failed delivery is retried on a later tick instead of lost.

mod classifier;
mod config;
mod dispatcher;
mod error;
mod scheduler;
mod sender;
mod store;
mod types;

pub use classifier::{classify, next_due_after};
pub use config::EngineConfig;
pub use dispatcher::{Dispatcher, SendOutcome, compose_message};
pub use error::{SchedulerError, SendError, StoreError, ValidationError};
pub use scheduler::{Scheduler, TickReport};
pub use sender::NotificationSender;
pub use store::{InMemoryTaskStore, StateUpdate, TaskStore};
pub use types::{NewTask, OwnerId, Phase, ReminderEvent, ReminderState, Task, TaskId};
