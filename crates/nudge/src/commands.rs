//! Bot command parsing and execution.
//!
//! The same commands back the Telegram bot and the CLI subcommands.

use std::sync::OnceLock;

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use thiserror::Error;
use tracing::info;

use nudge_scheduler::{NewTask, OwnerId, StoreError, Task, TaskId, TaskStore, ValidationError};

/// Deadline format accepted by `/add`.
pub const DEADLINE_FORMAT: &str = "%d-%m-%Y-%H-%M";

/// Deadline format used in replies.
const DISPLAY_FORMAT: &str = "%d-%m-%Y %H:%M";

pub const HELP_TEXT: &str = "Commands:\n\
/add <description> DD-MM-YYYY-HH-MM - add a task\n\
/list - show your open tasks\n\
/complete <id> - mark a task as done\n\
/delete <id> - remove a task";

const NOT_FOUND: &str = "Task not found.";

fn deadline_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d{2}-\d{2}-\d{4}-\d{2}-\d{2}").unwrap())
}

/// A parsed bot command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Help,
    Add {
        description: String,
        deadline: DateTime<Utc>,
    },
    List,
    Complete(TaskId),
    Delete(TaskId),
    /// Anything we do not understand. Answered with the help text.
    Unknown,
}

/// Why a command could not be parsed. The message is shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("Usage: {0}")]
    Usage(&'static str),

    #[error("{0}")]
    Invalid(#[from] ValidationError),
}

/// Parse a message. Deadlines are read in `offset`.
pub fn parse(text: &str, offset: &FixedOffset) -> Result<Command, CommandError> {
    let text = text.trim();
    let (head, args) = match text.split_once(char::is_whitespace) {
        Some((head, args)) => (head, args.trim()),
        None => (text, ""),
    };

    let Some(name) = head.strip_prefix('/') else {
        return Ok(Command::Unknown);
    };
    // "/add@my_bot" addresses a specific bot in group chats
    let name = name.split('@').next().unwrap_or_default().to_lowercase();

    match name.as_str() {
        "start" => Ok(Command::Start),
        "help" => Ok(Command::Help),
        "list" => Ok(Command::List),
        "add" => parse_add(args, offset),
        "complete" => parse_id(args, "/complete <id>").map(Command::Complete),
        "delete" => parse_id(args, "/delete <id>").map(Command::Delete),
        _ => Ok(Command::Unknown),
    }
}

fn parse_add(args: &str, offset: &FixedOffset) -> Result<Command, CommandError> {
    const USAGE: &str = "/add <description> DD-MM-YYYY-HH-MM";

    let Some(found) = deadline_regex().find(args) else {
        return Err(CommandError::Usage(USAGE));
    };

    let deadline = parse_deadline(found.as_str(), offset)?;
    let rest = format!("{} {}", &args[..found.start()], &args[found.end()..]);
    let description = rest.split_whitespace().collect::<Vec<_>>().join(" ");
    if description.is_empty() {
        return Err(CommandError::Usage(USAGE));
    }

    Ok(Command::Add {
        description,
        deadline,
    })
}

fn parse_id(args: &str, usage: &'static str) -> Result<TaskId, CommandError> {
    let mut parts = args.split_whitespace();
    match (parts.next().map(str::parse::<TaskId>), parts.next()) {
        (Some(Ok(id)), None) => Ok(id),
        _ => Err(CommandError::Usage(usage)),
    }
}

/// Parse `DD-MM-YYYY-HH-MM` as local time in `offset`.
pub fn parse_deadline(text: &str, offset: &FixedOffset) -> Result<DateTime<Utc>, ValidationError> {
    let naive = NaiveDateTime::parse_from_str(text, DEADLINE_FORMAT)
        .map_err(|e| ValidationError::InvalidDeadline(format!("{}: {}", text, e)))?;
    offset
        .from_local_datetime(&naive)
        .single()
        .map(|local| local.with_timezone(&Utc))
        .ok_or_else(|| ValidationError::InvalidDeadline(text.to_string()))
}

/// Reply to a command, plus the task it created, if any.
#[derive(Debug, Clone)]
pub struct Reply {
    pub text: String,
    pub created: Option<Task>,
}

impl Reply {
    fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            created: None,
        }
    }
}

/// Run a command on behalf of `owner_id`.
///
/// Complete and delete only touch tasks the caller owns; anything else is
/// reported as not found.
#[tracing::instrument(skip(store, offset))]
pub async fn execute(
    store: &dyn TaskStore,
    owner_id: OwnerId,
    command: Command,
    offset: &FixedOffset,
) -> Result<Reply, StoreError> {
    match command {
        Command::Start => Ok(Reply::text(format!(
            "Hi! I will remind you about your deadlines.\n\n{}",
            HELP_TEXT
        ))),
        Command::Help | Command::Unknown => Ok(Reply::text(HELP_TEXT)),
        Command::Add {
            description,
            deadline,
        } => {
            let task = store
                .create(NewTask::new(description, deadline, owner_id)?)
                .await?;
            info!(task_id = task.id, deadline = %task.deadline, "task created");
            Ok(Reply {
                text: format!(
                    "Task #{} created:\n{}\nDue: {}",
                    task.id,
                    task.description,
                    format_deadline(&task, offset)
                ),
                created: Some(task),
            })
        }
        Command::List => {
            let tasks = store.list_for_owner(owner_id).await?;
            if tasks.is_empty() {
                return Ok(Reply::text("You have no open tasks."));
            }
            let lines: Vec<String> = tasks
                .iter()
                .map(|t| format!("{}. {} - {}", t.id, t.description, format_deadline(t, offset)))
                .collect();
            Ok(Reply::text(format!("Your tasks:\n{}", lines.join("\n"))))
        }
        Command::Complete(id) => {
            if !owns(store, id, owner_id).await? {
                return Ok(Reply::text(NOT_FOUND));
            }
            match store.mark_completed(id).await? {
                Some(task) => {
                    info!(task_id = id, "task completed");
                    Ok(Reply::text(format!(
                        "Task '{}' marked as completed.",
                        task.description
                    )))
                }
                None => Ok(Reply::text(NOT_FOUND)),
            }
        }
        Command::Delete(id) => {
            if !owns(store, id, owner_id).await? {
                return Ok(Reply::text(NOT_FOUND));
            }
            match store.delete(id).await? {
                Some(task) => {
                    info!(task_id = id, "task deleted");
                    Ok(Reply::text(format!("Task '{}' deleted.", task.description)))
                }
                None => Ok(Reply::text(NOT_FOUND)),
            }
        }
    }
}

async fn owns(store: &dyn TaskStore, id: TaskId, owner_id: OwnerId) -> Result<bool, StoreError> {
    Ok(store
        .get(id)
        .await?
        .is_some_and(|task| task.owner_id == owner_id))
}

fn format_deadline(task: &Task, offset: &FixedOffset) -> String {
    task.deadline
        .with_timezone(offset)
        .format(DISPLAY_FORMAT)
        .to_string()
}
