//! Announcement queue for the Valet assistant.
//!
//! When background work finishes, the outcome is queued here and an
//! independent polling loop speaks it into the live session. Creation and
//! delivery are decoupled on purpose: the session may not be listening at
//! the moment a task completes, and the producer must never block on it.
//!
//! Delivery is at-least-once. Speaking the message and marking the row
//! delivered are two separate steps; a crash between them re-delivers the
//! message on the next run, so the consuming sink has to tolerate a
//! duplicate utterance. [`mark_announced`] is idempotent and never
//! overwrites the original delivery timestamp.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use thiserror::Error;

mod channel;

pub use channel::{
    deliver_pending_once, run_announcer, AnnouncementSink, AnnouncerSettings, SinkError,
};

/// Errors that can occur during announcement operations.
#[derive(Debug, Error)]
pub enum AnnounceError {
    /// A database operation failed.
    #[error("announcement database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Failed to check out a pooled connection.
    #[error("announcement pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// A blocking database task panicked or was cancelled.
    #[error("announcement blocking task failed: {0}")]
    Join(String),

    /// No announcement exists with the given ID.
    #[error("announcement not found: {0}")]
    NotFound(String),
}

/// A queued notification for the live session.
#[derive(Debug, Clone, PartialEq)]
pub struct Announcement {
    /// Unique identifier (UUID v4).
    pub announcement_id: String,
    /// The task that produced this announcement, if any.
    pub task_id: Option<String>,
    /// The text to speak.
    pub message: String,
    /// Short display title.
    pub title: Option<String>,
    /// Relative importance. Persisted for future use; delivery order stays
    /// strictly by creation time.
    pub priority: i64,
    /// Whether the message has been delivered to the session.
    pub announced: bool,
    /// Unix seconds of first delivery, absent until delivered.
    pub announced_at: Option<f64>,
    /// Unix seconds of creation.
    pub created_at: f64,
}

fn now_unix() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Queues a new announcement and returns its generated ID.
///
/// `task_id` links the announcement to the task whose outcome it reports;
/// pass `None` for announcements that do not originate from a task.
pub fn create_announcement(
    conn: &Connection,
    task_id: Option<&str>,
    message: &str,
    title: Option<&str>,
    priority: i64,
) -> Result<String, AnnounceError> {
    let announcement_id = uuid::Uuid::new_v4().to_string();

    conn.execute(
        "INSERT INTO announcements
            (announcement_id, task_id, message, title, priority, announced, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)",
        params![announcement_id, task_id, message, title, priority, now_unix()],
    )?;

    tracing::debug!(announcement_id, task_id, "queued announcement");
    Ok(announcement_id)
}

/// Retrieves one announcement by ID, or `None` if unknown.
pub fn get_announcement(
    conn: &Connection,
    announcement_id: &str,
) -> Result<Option<Announcement>, AnnounceError> {
    let row = conn
        .query_row(
            "SELECT announcement_id, task_id, message, title, priority,
                    announced, announced_at, created_at
             FROM announcements
             WHERE announcement_id = ?1",
            [announcement_id],
            map_row_to_announcement,
        )
        .optional()?;
    Ok(row)
}

/// Lists every undelivered announcement, oldest first.
///
/// Creation order is the delivery order: within one poll the session hears
/// outcomes in the order they were produced.
pub fn list_unannounced(conn: &Connection) -> Result<Vec<Announcement>, AnnounceError> {
    let mut stmt = conn.prepare(
        "SELECT announcement_id, task_id, message, title, priority,
                announced, announced_at, created_at
         FROM announcements
         WHERE announced = 0
         ORDER BY created_at ASC",
    )?;

    let rows = stmt.query_map([], map_row_to_announcement)?;
    let mut announcements = Vec::new();
    for row in rows {
        announcements.push(row?);
    }
    Ok(announcements)
}

/// Marks an announcement as delivered.
///
/// Idempotent: marking twice leaves `announced = true` and keeps the
/// `announced_at` of the first delivery, so duplicate polling cycles (the
/// at-least-once case) do not distort the record.
pub fn mark_announced(conn: &Connection, announcement_id: &str) -> Result<(), AnnounceError> {
    let changed = conn.execute(
        "UPDATE announcements
         SET announced = 1,
             announced_at = COALESCE(announced_at, ?2)
         WHERE announcement_id = ?1",
        params![announcement_id, now_unix()],
    )?;

    if changed == 0 {
        return Err(AnnounceError::NotFound(announcement_id.to_string()));
    }
    Ok(())
}

fn map_row_to_announcement(row: &Row) -> rusqlite::Result<Announcement> {
    Ok(Announcement {
        announcement_id: row.get(0)?,
        task_id: row.get(1)?,
        message: row.get(2)?,
        title: row.get(3)?,
        priority: row.get(4)?,
        announced: row.get::<_, i64>(5)? != 0,
        announced_at: row.get(6)?,
        created_at: row.get(7)?,
    })
}

#[cfg(test)]
mod tests;
