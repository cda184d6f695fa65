//! Background task queue for the Valet assistant.
//!
//! Tool handlers enqueue work here and return to the conversation
//! immediately; the processor loop (see [`run_task_processor`]) drains the
//! queue, executes registered handlers, and reports outcomes through the
//! announcement channel.
//!
//! # Task lifecycle
//!
//! Status moves one way and never revisits an earlier state:
//!
//! ```text
//! pending ──(processor claims)──> running ──> completed
//!    │                               │
//!    └──(no handler registered)──────┴─────> failed
//! ```
//!
//! Every failure is terminal. `retry_count` and `max_retries` are persisted
//! on the row so a retry policy can be layered on later without a schema
//! change, but nothing consults them today. Tasks are never deleted by this
//! crate; retention is an operator concern.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

mod processor;
mod registry;

pub use processor::{process_pending_once, run_task_processor, ProcessorSettings};
pub use registry::{HandlerError, HandlerRegistry, TaskHandler};


/// Errors that can occur during task queue operations.
#[derive(Debug, Error)]
pub enum TaskError {
    /// A database operation failed.
    #[error("task database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// JSON serialization or deserialization failed.
    #[error("task serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Failed to check out a pooled connection.
    #[error("task pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// A blocking database task panicked or was cancelled.
    #[error("task blocking operation failed: {0}")]
    Join(String),

    /// No task exists with the given ID.
    #[error("task not found: {0}")]
    NotFound(String),

    /// The requested status change is not a legal transition.
    #[error("illegal task transition for {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    /// Writing the outcome announcement failed.
    #[error(transparent)]
    Announce(#[from] valet_announce::AnnounceError),
}

/// Where a task is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Created, waiting for the processor to claim it.
    Pending,
    /// Claimed; its handler is executing.
    Running,
    /// The handler returned a result. Terminal.
    Completed,
    /// The handler errored or timed out, or no handler exists. Terminal.
    Failed,
}

impl TaskStatus {
    /// Returns the canonical string label for this status.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Whether a task in this status can never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = ParseTaskStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(ParseTaskStatusError(s.to_string())),
        }
    }
}

/// Error returned when parsing an unknown task status string.
#[derive(Debug, Clone)]
pub struct ParseTaskStatusError(pub String);

impl std::fmt::Display for ParseTaskStatusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown task status: {}", self.0)
    }
}

impl std::error::Error for ParseTaskStatusError {}

/// One background work item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier (UUID v4), generated at creation.
    pub task_id: String,
    /// Selects the handler that will execute this task.
    pub task_type: String,
    /// Current lifecycle position.
    pub status: TaskStatus,
    /// Handler input, opaque to the queue.
    pub params: Value,
    /// Handler output; present only once `completed`.
    pub result: Option<Value>,
    /// Failure description; present only once `failed`.
    pub error: Option<String>,
    /// Unix seconds of creation.
    pub created_at: f64,
    /// Unix seconds of the `running` transition, absent until claimed.
    pub started_at: Option<f64>,
    /// Unix seconds of the terminal transition, absent until finished.
    pub completed_at: Option<f64>,
    /// Attempts so far. Persisted, never consulted.
    pub retry_count: i64,
    /// Attempt ceiling. Persisted, never consulted.
    pub max_retries: i64,
}

fn now_unix() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Persists a new `pending` task and returns its generated ID.
///
/// The caller gets the ID back immediately and does not wait for execution;
/// the processor picks the task up on its next sweep.
pub fn create_task(
    conn: &Connection,
    task_type: &str,
    task_params: Option<&Value>,
) -> Result<String, TaskError> {
    let task_id = uuid::Uuid::new_v4().to_string();
    let params_json = match task_params {
        Some(p) => serde_json::to_string(p)?,
        None => "{}".to_string(),
    };

    conn.execute(
        "INSERT INTO tasks (task_id, task_type, status, params_json, created_at)
         VALUES (?1, ?2, 'pending', ?3, ?4)",
        params![task_id, task_type, params_json, now_unix()],
    )?;

    tracing::debug!(task_id, task_type, "created task");
    Ok(task_id)
}

/// Applies one status transition, stamping the matching timestamp.
///
/// `Running` stamps `started_at`; the terminal states stamp `completed_at`
/// and persist `result` (completed) or `error` (failed). Transitions that
/// the state machine does not allow are rejected with
/// [`TaskError::InvalidTransition`]; in particular nothing ever moves back
/// to `pending` and terminal tasks never change again.
pub fn update_task_status(
    conn: &Connection,
    task_id: &str,
    status: TaskStatus,
    result: Option<&Value>,
    error: Option<&str>,
) -> Result<(), TaskError> {
    let current = get_task(conn, task_id)?.ok_or_else(|| TaskError::NotFound(task_id.to_string()))?;

    if !transition_allowed(current.status, status) {
        return Err(TaskError::InvalidTransition {
            task_id: task_id.to_string(),
            from: current.status,
            to: status,
        });
    }

    match status {
        TaskStatus::Running => {
            conn.execute(
                "UPDATE tasks SET status = 'running', started_at = ?2 WHERE task_id = ?1",
                params![task_id, now_unix()],
            )?;
        }
        TaskStatus::Completed => {
            let result_json = result.map(serde_json::to_string).transpose()?;
            conn.execute(
                "UPDATE tasks
                 SET status = 'completed', result_json = ?2, completed_at = ?3
                 WHERE task_id = ?1",
                params![task_id, result_json, now_unix()],
            )?;
        }
        TaskStatus::Failed => {
            conn.execute(
                "UPDATE tasks
                 SET status = 'failed', error = ?2, completed_at = ?3
                 WHERE task_id = ?1",
                params![task_id, error, now_unix()],
            )?;
        }
        // transition_allowed has no edge into pending
        TaskStatus::Pending => unreachable!("no transition re-enters pending"),
    }

    tracing::debug!(task_id, status = %status, "task status updated");
    Ok(())
}

/// Retrieves the full current row for a task, or `None` if unknown.
pub fn get_task(conn: &Connection, task_id: &str) -> Result<Option<Task>, TaskError> {
    let row = conn
        .query_row(
            "SELECT task_id, task_type, status, params_json, result_json, error,
                    created_at, started_at, completed_at, retry_count, max_retries
             FROM tasks
             WHERE task_id = ?1",
            [task_id],
            map_row_to_task,
        )
        .optional()?;
    Ok(row)
}

/// Lists every `pending` task, oldest first.
///
/// Creation order is the claim order, so a sweep starts the longest-waiting
/// work first even though execution across the batch is concurrent.
pub fn list_pending_tasks(conn: &Connection) -> Result<Vec<Task>, TaskError> {
    let mut stmt = conn.prepare(
        "SELECT task_id, task_type, status, params_json, result_json, error,
                created_at, started_at, completed_at, retry_count, max_retries
         FROM tasks
         WHERE status = 'pending'
         ORDER BY created_at ASC",
    )?;

    let rows = stmt.query_map([], map_row_to_task)?;
    let mut tasks = Vec::new();
    for row in rows {
        tasks.push(row?);
    }
    Ok(tasks)
}

fn transition_allowed(from: TaskStatus, to: TaskStatus) -> bool {
    matches!(
        (from, to),
        (TaskStatus::Pending, TaskStatus::Running)
            | (TaskStatus::Pending, TaskStatus::Failed)
            | (TaskStatus::Running, TaskStatus::Completed)
            | (TaskStatus::Running, TaskStatus::Failed)
    )
}

fn map_row_to_task(row: &Row) -> rusqlite::Result<Task> {
    let status_str: String = row.get(2)?;
    let status: TaskStatus = status_str.parse().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
    })?;

    let params_str: String = row.get(3)?;
    let task_params: Value = serde_json::from_str(&params_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
    })?;

    let result_str: Option<String> = row.get(4)?;
    let result = match result_str {
        Some(s) => Some(serde_json::from_str(&s).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
        })?),
        None => None,
    };

    Ok(Task {
        task_id: row.get(0)?,
        task_type: row.get(1)?,
        status,
        params: task_params,
        result,
        error: row.get(5)?,
        created_at: row.get(6)?,
        started_at: row.get(7)?,
        completed_at: row.get(8)?,
        retry_count: row.get(9)?,
        max_retries: row.get(10)?,
    })
}
