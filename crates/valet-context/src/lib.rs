//! Conversational memory for the Valet assistant.
//!
//! Stores arbitrary JSON values under string keys (`"emails"`,
//! `"calendar"`, ...) together with caller-supplied metadata, and enforces a
//! single process-wide freshness bound. Expiry is lazy: the read that
//! observes an entry older than the TTL deletes it and reports absence.
//! There is no background sweep; conversational follow-ups re-read a key
//! shortly after it was fetched, so staleness is bounded by the time since
//! that key was last read.
//!
//! Writes replace the whole row atomically. Keys are chosen freely by the
//! tool handlers that produce the data; this crate imposes no key schema.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use thiserror::Error;


/// Default freshness bound for stored entries, in seconds.
///
/// One hour suits the data this cache holds (mail, calendar, feeds): stale
/// enough to survive a conversation, fresh enough that a follow-up never
/// answers from yesterday's inbox.
pub const DEFAULT_TTL_SECONDS: f64 = 3600.0;

/// Errors that can occur during context operations.
#[derive(Debug, Error)]
pub enum ContextError {
    /// A database operation failed.
    #[error("context database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// JSON serialization or deserialization failed.
    #[error("context serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A live context entry, as returned by [`get_with_metadata`].
#[derive(Debug, Clone, PartialEq)]
pub struct ContextEntry {
    /// The stored value, decoded.
    pub value: Value,
    /// Caller-supplied metadata (source query, filter params, ...).
    pub metadata: Value,
    /// Seconds elapsed since the entry was last written.
    pub age_seconds: f64,
}

fn now_unix() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Stores or replaces the entry for `key` with the current timestamp.
///
/// Replacement is a single `INSERT OR REPLACE`, so a concurrent reader sees
/// either the old row or the new one, never a mix.
///
/// # Errors
///
/// Returns `ContextError::Database` on SQL failure or `ContextError::Json`
/// if the value or metadata cannot be serialised.
pub fn save(
    conn: &Connection,
    key: &str,
    value: &Value,
    metadata: Option<&Value>,
) -> Result<(), ContextError> {
    let value_json = serde_json::to_string(value)?;
    let metadata_json = match metadata {
        Some(m) => serde_json::to_string(m)?,
        None => "{}".to_string(),
    };

    conn.execute(
        "INSERT OR REPLACE INTO context_entries (context_key, value_json, metadata_json, updated_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![key, value_json, metadata_json, now_unix()],
    )?;

    tracing::debug!(key, "saved context entry");
    Ok(())
}

/// Retrieves the value for `key`, or `None` if absent or expired.
///
/// Delegates to [`get_with_metadata`], including its delete-on-expiry side
/// effect.
pub fn get(conn: &Connection, key: &str, ttl_seconds: f64) -> Result<Option<Value>, ContextError> {
    Ok(get_with_metadata(conn, key, ttl_seconds)?.map(|entry| entry.value))
}

/// Retrieves value, metadata, and age for `key`.
///
/// If the stored entry's age exceeds `ttl_seconds` it is deleted as a side
/// effect of this read and `None` is returned: an expired entry is gone
/// after the first read that notices it.
pub fn get_with_metadata(
    conn: &Connection,
    key: &str,
    ttl_seconds: f64,
) -> Result<Option<ContextEntry>, ContextError> {
    let row = conn
        .query_row(
            "SELECT value_json, metadata_json, updated_at
             FROM context_entries
             WHERE context_key = ?1",
            [key],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, f64>(2)?,
                ))
            },
        )
        .optional()?;

    let Some((value_json, metadata_json, updated_at)) = row else {
        return Ok(None);
    };

    let age_seconds = now_unix() - updated_at;
    if age_seconds > ttl_seconds {
        clear(conn, Some(key))?;
        tracing::debug!(key, age_seconds, "context entry expired, deleted on read");
        return Ok(None);
    }

    let metadata = match metadata_json {
        Some(m) => serde_json::from_str(&m)?,
        None => Value::Object(serde_json::Map::new()),
    };

    Ok(Some(ContextEntry {
        value: serde_json::from_str(&value_json)?,
        metadata,
        age_seconds,
    }))
}

/// Deletes the entry for `key`, or every entry if `key` is `None`.
///
/// Returns the number of rows deleted.
pub fn clear(conn: &Connection, key: Option<&str>) -> Result<usize, ContextError> {
    let deleted = match key {
        Some(k) => conn.execute("DELETE FROM context_entries WHERE context_key = ?1", [k])?,
        None => conn.execute("DELETE FROM context_entries", [])?,
    };
    Ok(deleted)
}
