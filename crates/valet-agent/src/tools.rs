//! Tool functions callable from the conversation.
//!
//! Each tool proxies a remote workflow, feeds the context store so
//! follow-up questions can be answered from memory, and returns the
//! sentence the session should speak. Tools never raise into the language
//! model: a transport or store failure comes back as an apologetic
//! sentence, with the detail in the logs.

use serde_json::{json, Value};
use thiserror::Error;
use valet_db::DbPool;

use crate::workflows::{WorkflowClient, WorkflowError};

/// Everything a tool call needs: the shared store, the workflow client,
/// and the memory freshness bound.
pub struct ToolContext {
    pub pool: DbPool,
    pub workflows: WorkflowClient,
    pub ttl_seconds: f64,
    pub calendar_webhook_id: String,
}

#[derive(Debug, Error)]
enum StoreError {
    #[error("{0}")]
    Pool(#[from] r2d2::Error),
    #[error("{0}")]
    Context(#[from] valet_context::ContextError),
    #[error("blocking task failed: {0}")]
    Join(String),
}

impl ToolContext {
    /// Fetches the user's mail through the `read-emails` workflow, caches
    /// the structured artifact under `"emails"`, and returns the speech.
    pub async fn read_emails(&self, count: u32, filter: &str) -> String {
        let payload = json!({ "count": count.min(20), "filter": filter });

        let reply = match self.workflows.call("read-emails", &payload).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::error!(error = %e, "read-emails workflow failed");
                return format!("I had trouble connecting to that service: {e}");
            }
        };

        if let Some(data) = reply.pointer("/artifact/data") {
            let item_count = data.as_array().map(Vec::len).unwrap_or(1);
            let metadata = json!({ "count": count, "filter": filter });
            if let Err(e) = self.save_context("emails", data.clone(), metadata).await {
                tracing::error!(error = %e, "failed to store emails in context");
                return format!("I fetched your emails but couldn't store them in memory: {e}");
            }
            tracing::info!(count = item_count, "stored emails in context");
        } else {
            tracing::warn!("read-emails reply carried no artifact");
        }

        reply
            .get("speech")
            .and_then(Value::as_str)
            .unwrap_or("I couldn't retrieve your emails right now.")
            .to_string()
    }

    /// Fetches upcoming events through the calendar workflow, caches them
    /// under `"calendar"`, and returns the summary sentence.
    pub async fn read_calendar(&self, days: u32) -> String {
        // The calendar workflow expects "numberOfDays".
        let payload = json!({ "numberOfDays": days.min(30) });

        let reply = match self
            .workflows
            .call(&self.calendar_webhook_id, &payload)
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                tracing::error!(error = %e, "calendar workflow failed");
                return format!("I had trouble connecting to that service: {e}");
            }
        };

        let summary = reply
            .get("summary")
            .and_then(Value::as_str)
            .unwrap_or("No events found.")
            .to_string();

        if let Some(events) = reply.get("events").and_then(Value::as_array) {
            if !events.is_empty() {
                let metadata = json!({ "days": days });
                if let Err(e) = self
                    .save_context("calendar", Value::Array(events.clone()), metadata)
                    .await
                {
                    tracing::error!(error = %e, "failed to store calendar in context");
                    return format!("I fetched your calendar but couldn't store it in memory: {e}");
                }
                tracing::info!(count = events.len(), "stored calendar events in context");
            }
        }

        summary
    }

    /// Answers a follow-up question from memory.
    ///
    /// Returns a JSON string for the language model to pick apart when data
    /// is present ("what was email 2 about?"), or a plain sentence telling
    /// it to fetch fresh data when the entry is missing or expired.
    pub async fn recall_context(&self, key: &str) -> String {
        let lookup = {
            let pool = self.pool.clone();
            let key = key.to_string();
            let ttl_seconds = self.ttl_seconds;
            tokio::task::spawn_blocking(move || -> Result<_, StoreError> {
                let conn = pool.get()?;
                Ok(valet_context::get_with_metadata(&conn, &key, ttl_seconds)?)
            })
            .await
            .map_err(|e| StoreError::Join(e.to_string()))
            .and_then(|result| result)
        };

        let entry = match lookup {
            Ok(entry) => entry,
            Err(e) => {
                tracing::error!(key, error = %e, "context recall failed");
                return format!("I couldn't check my memory just now: {e}");
            }
        };

        let Some(entry) = entry else {
            return format!("No {key} data in memory. Fetch fresh data first.");
        };

        let count = match &entry.value {
            Value::Array(items) => items.len(),
            _ => 1,
        };
        tracing::info!(
            key,
            count,
            age_seconds = entry.age_seconds as i64,
            "recalled context"
        );

        json!({
            "context_type": key,
            "data": entry.value,
            "age_seconds": entry.age_seconds as i64,
            "count": count,
        })
        .to_string()
    }

    /// Preloads the remote feeds and returns the workflow's prose summary.
    ///
    /// Unlike the conversational tools this propagates failure: the caller
    /// is the background handler, which records the error on its task.
    pub async fn preload_feeds(&self, profiles: &[String]) -> Result<String, WorkflowError> {
        let payload = json!({ "profiles": profiles });
        let reply = self.workflows.call("preload-feeds", &payload).await?;

        Ok(reply
            .get("speech")
            .and_then(Value::as_str)
            .unwrap_or("Feeds loaded.")
            .to_string())
    }

    async fn save_context(
        &self,
        key: &'static str,
        value: Value,
        metadata: Value,
    ) -> Result<(), StoreError> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let conn = pool.get()?;
            valet_context::save(&conn, key, &value, Some(&metadata))?;
            Ok(())
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }
}
