//! The processor loop: drains pending tasks, runs their handlers under a
//! timeout, and reports every outcome through the announcement channel.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::sleep;
use valet_announce::create_announcement;
use valet_db::DbPool;

use crate::registry::HandlerRegistry;
use crate::{list_pending_tasks, update_task_status, Task, TaskError, TaskStatus};

/// Timing knobs for the processor loop.
#[derive(Debug, Clone, Copy)]
pub struct ProcessorSettings {
    /// Pause between sweeps of the pending queue.
    pub poll_interval: Duration,

    /// Ceiling on a single handler invocation. Exceeding it fails the task
    /// exactly as a handler error would. Sized for the slowest built-in
    /// work (remote feed preloads).
    pub handler_timeout: Duration,

    /// Pause after a failed sweep (e.g. the store was unavailable) before
    /// polling again.
    pub error_backoff: Duration,
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            handler_timeout: Duration::from_secs(240),
            error_backoff: Duration::from_secs(5),
        }
    }
}

/// Runs the task processor until shutdown is signalled.
///
/// Each cycle sweeps every pending task (see [`process_pending_once`]) and
/// then sleeps for the poll interval. Per-task failures never stop the
/// loop; a failure of the sweep itself (store unavailable) is logged and
/// followed by the error backoff. Shutdown is observed between cycles, so
/// an in-flight sweep drains to its terminal states before the loop exits
/// and no task is left `running` by a cooperative stop.
pub async fn run_task_processor(
    pool: DbPool,
    registry: Arc<HandlerRegistry>,
    settings: ProcessorSettings,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::info!(
        handlers = registry.len(),
        poll_interval_ms = settings.poll_interval.as_millis() as u64,
        "task processor started"
    );

    loop {
        if *shutdown.borrow() {
            break;
        }

        let pause = match process_pending_once(&pool, &registry, settings.handler_timeout).await {
            Ok(0) => settings.poll_interval,
            Ok(count) => {
                tracing::debug!(count, "sweep finished");
                settings.poll_interval
            }
            Err(e) => {
                tracing::error!(error = %e, "task processor sweep failed, backing off");
                settings.error_backoff
            }
        };

        if wait_or_shutdown(pause, &mut shutdown).await {
            break;
        }
    }

    tracing::info!("task processor stopped");
}

/// Sweeps the pending queue once: claims and executes every pending task
/// concurrently, waiting until the whole batch has reached a terminal
/// state. Returns the number of tasks the sweep picked up.
///
/// Tasks in a batch are independent: one task's handler error, timeout, or
/// panic neither cancels nor delays its siblings beyond sharing the store.
///
/// # Errors
///
/// Returns an error only when the pending list itself cannot be read;
/// per-task outcomes are recorded on the task rows instead.
pub async fn process_pending_once(
    pool: &DbPool,
    registry: &Arc<HandlerRegistry>,
    handler_timeout: Duration,
) -> Result<usize, TaskError> {
    let pending = with_conn(pool, list_pending_tasks).await?;
    if pending.is_empty() {
        return Ok(0);
    }

    let count = pending.len();
    tracing::info!(count, "processing pending tasks");

    let mut batch = JoinSet::new();
    for task in pending {
        let pool = pool.clone();
        let registry = Arc::clone(registry);
        batch.spawn(async move {
            process_task(&pool, &registry, task, handler_timeout).await;
        });
    }

    // Join-all: every outcome was already persisted by process_task, so
    // the only thing left to surface here is a panicked handler task.
    while let Some(joined) = batch.join_next().await {
        if let Err(e) = joined {
            tracing::error!(error = %e, "task execution panicked");
        }
    }

    Ok(count)
}

/// Executes one task from claim to terminal state. Absorbs every failure:
/// outcomes are data on the task row, never errors propagated to the sweep.
async fn process_task(
    pool: &DbPool,
    registry: &HandlerRegistry,
    task: Task,
    handler_timeout: Duration,
) {
    tracing::info!(
        task_id = %task.task_id,
        task_type = %task.task_type,
        "processing task"
    );

    // Unknown type: fail directly from pending, nothing to execute.
    let Some(handler) = registry.get(&task.task_type) else {
        tracing::error!(
            task_id = %task.task_id,
            task_type = %task.task_type,
            registered = ?registry.registered_types(),
            "no handler for task type"
        );
        record_failure(
            pool,
            &task,
            &format!("Unknown task type: {}", task.task_type),
        )
        .await;
        return;
    };

    let claimed = {
        let task_id = task.task_id.clone();
        with_conn(pool, move |conn| {
            update_task_status(conn, &task_id, TaskStatus::Running, None, None)
        })
        .await
    };
    if let Err(e) = claimed {
        // The row is still pending; the next sweep claims it again.
        tracing::error!(task_id = %task.task_id, error = %e, "failed to mark task running");
        return;
    }

    match tokio::time::timeout(handler_timeout, handler.run(task.params.clone())).await {
        Ok(Ok(result)) => {
            let message = completion_message(&task.task_type, &result, &task.params);
            let title = format!("{} complete", task.task_type);
            let recorded = {
                let task_id = task.task_id.clone();
                with_conn(pool, move |conn| {
                    update_task_status(conn, &task_id, TaskStatus::Completed, Some(&result), None)?;
                    create_announcement(conn, Some(&task_id), &message, Some(&title), 1)?;
                    Ok(())
                })
                .await
            };
            match recorded {
                Ok(()) => tracing::info!(task_id = %task.task_id, "task completed"),
                Err(e) => tracing::error!(
                    task_id = %task.task_id,
                    error = %e,
                    "failed to record task completion"
                ),
            }
        }
        Ok(Err(e)) => {
            tracing::error!(task_id = %task.task_id, error = %e, "task handler failed");
            record_failure(pool, &task, &e.to_string()).await;
        }
        Err(_elapsed) => {
            tracing::error!(
                task_id = %task.task_id,
                timeout_s = handler_timeout.as_secs(),
                "task handler timed out"
            );
            record_failure(
                pool,
                &task,
                &format!(
                    "Task execution timed out after {} seconds",
                    handler_timeout.as_secs()
                ),
            )
            .await;
        }
    }
}

/// Moves a task to `failed` and queues the matching failure announcement.
/// The user is always told something happened, success or failure.
async fn record_failure(pool: &DbPool, task: &Task, error: &str) {
    let message = format!("Task failed: {}", truncate(error, 100));
    let recorded = {
        let task_id = task.task_id.clone();
        let error = error.to_string();
        with_conn(pool, move |conn| {
            update_task_status(conn, &task_id, TaskStatus::Failed, None, Some(&error))?;
            create_announcement(conn, Some(&task_id), &message, Some("Task failed"), 1)?;
            Ok(())
        })
        .await
    };

    if let Err(e) = recorded {
        tracing::error!(
            task_id = %task.task_id,
            error = %e,
            "failed to record task failure"
        );
    }
}

/// Renders the spoken message for a completed task.
///
/// Known types get a tailored sentence built from the handler's result;
/// anything else falls back to a generic completion line. `_params` is part
/// of the template contract for future types that need their input echoed
/// back; none of the current templates do.
fn completion_message(task_type: &str, result: &Value, _params: &Value) -> String {
    match task_type {
        "feed_preload" => {
            let success = result.get("success_count").and_then(Value::as_i64).unwrap_or(0);
            let total = result.get("total_count").and_then(Value::as_i64).unwrap_or(0);
            let elapsed = result.get("elapsed").and_then(Value::as_f64).unwrap_or(0.0);
            format!(
                "All feeds are loaded! Pre-loaded {success} of {total} profiles in \
                 {elapsed:.1} seconds. You can now ask about trending topics."
            )
        }
        "email_check" => {
            let count = result.get("count").and_then(Value::as_i64).unwrap_or(0);
            if count > 0 {
                format!("You have {count} new emails. Say 'check my emails' to see them.")
            } else {
                "No new emails.".to_string()
            }
        }
        "calendar_reminder" => {
            let title = result.get("title").and_then(Value::as_str).unwrap_or("event");
            let minutes = result
                .get("minutes_until")
                .and_then(Value::as_i64)
                .unwrap_or(10);
            format!("Reminder: {title} starts in {minutes} minutes.")
        }
        _ => format!("Task {task_type} completed successfully."),
    }
}

/// Cuts `text` at a character boundary after at most `max` characters.
fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Runs a store operation on a pooled connection off the async runtime.
async fn with_conn<T, F>(pool: &DbPool, op: F) -> Result<T, TaskError>
where
    F: FnOnce(&rusqlite::Connection) -> Result<T, TaskError> + Send + 'static,
    T: Send + 'static,
{
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || {
        let conn = pool.get()?;
        op(&conn)
    })
    .await
    .map_err(|e| TaskError::Join(e.to_string()))?
}

/// Sleeps for `duration` unless shutdown arrives first. Returns `true` when
/// the loop should exit.
async fn wait_or_shutdown(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = sleep(duration) => false,
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn email_template_reports_count() {
        let message = completion_message("email_check", &json!({"count": 3}), &json!({}));
        assert!(message.contains('3'));
        assert!(message.contains("new emails"));
    }

    #[test]
    fn email_template_handles_empty_inbox() {
        let message = completion_message("email_check", &json!({"count": 0}), &json!({}));
        assert_eq!(message, "No new emails.");
    }

    #[test]
    fn feed_template_reports_ratio_and_elapsed() {
        let result = json!({"success_count": 2, "total_count": 2, "elapsed": 12.34});
        let message = completion_message("feed_preload", &result, &json!({}));
        assert!(message.contains("2 of 2"));
        assert!(message.contains("12.3 seconds"));
    }

    #[test]
    fn reminder_template_names_the_event() {
        let result = json!({"title": "standup", "minutes_until": 5});
        let message = completion_message("calendar_reminder", &result, &json!({}));
        assert_eq!(message, "Reminder: standup starts in 5 minutes.");
    }

    #[test]
    fn unknown_type_gets_generic_completion() {
        let message = completion_message("laundry", &json!({}), &json!({}));
        assert_eq!(message, "Task laundry completed successfully.");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("abcdef", 4), "abcd");
        assert_eq!(truncate("ab", 4), "ab");
        // Multi-byte characters must not be split.
        assert_eq!(truncate("héllo wörld", 6), "héllo ");
    }
}
