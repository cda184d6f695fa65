//! Built-in background task handlers.
//!
//! Handlers are registered explicitly by [`register_builtin_handlers`]
//! during startup, before the processor loop is spawned. Nothing registers
//! itself as an import side effect; what the registry holds is exactly
//! what this routine put there.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::{json, Value};
use valet_tasks::{HandlerError, HandlerRegistry, TaskHandler};

use crate::tools::ToolContext;

/// Registers every built-in handler on `registry`.
pub fn register_builtin_handlers(registry: &mut HandlerRegistry, tools: Arc<ToolContext>) {
    registry.register(
        "email_check",
        Arc::new(EmailCheckHandler {
            tools: Arc::clone(&tools),
        }),
    );
    registry.register("feed_preload", Arc::new(FeedPreloadHandler { tools }));
}

/// Checks the mailbox in the background.
///
/// Runs the same fetch the conversational tool uses, which also refreshes
/// the `"emails"` context entry for follow-ups.
struct EmailCheckHandler {
    tools: Arc<ToolContext>,
}

#[async_trait]
impl TaskHandler for EmailCheckHandler {
    async fn run(&self, params: Value) -> Result<Value, HandlerError> {
        let filter = params
            .get("filter")
            .and_then(Value::as_str)
            .unwrap_or("unread")
            .to_string();
        let count = params.get("count").and_then(Value::as_u64).unwrap_or(5) as u32;

        let _speech = self.tools.read_emails(count, &filter).await;

        // TODO: parse the actual unread total out of the workflow reply
        // instead of echoing the requested count back.
        Ok(json!({ "count": count, "filter": filter }))
    }
}

/// Preloads the remote feeds so trend questions answer instantly.
struct FeedPreloadHandler {
    tools: Arc<ToolContext>,
}

#[async_trait]
impl TaskHandler for FeedPreloadHandler {
    async fn run(&self, params: Value) -> Result<Value, HandlerError> {
        let profiles: Vec<String> = params
            .get("profile_names")
            .and_then(Value::as_array)
            .map(|names| {
                names
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let started = Instant::now();
        let speech = self
            .tools
            .preload_feeds(&profiles)
            .await
            .map_err(|e| HandlerError::new(e.to_string()))?;
        let elapsed = started.elapsed().as_secs_f64();

        // Two standing profiles are preloaded when none are named.
        let requested = if profiles.is_empty() {
            2
        } else {
            profiles.len() as i64
        };

        // The workflow reports outcomes in prose; a "N of M" fragment in a
        // failure summary is the only structured signal available.
        let (success_count, total_count) = if speech.to_lowercase().contains("failed") {
            parse_success_ratio(&speech).unwrap_or((requested - 1, requested))
        } else {
            (requested, requested)
        };

        Ok(json!({
            "success_count": success_count,
            "total_count": total_count,
            "elapsed": elapsed,
            "speech": speech,
        }))
    }
}

/// Finds an "N of M" fragment in a workflow's prose reply.
fn parse_success_ratio(speech: &str) -> Option<(i64, i64)> {
    let words: Vec<&str> = speech.split_whitespace().collect();
    for window in words.windows(3) {
        if window[1] != "of" {
            continue;
        }
        let successes = window[0].trim_matches(|c: char| !c.is_ascii_digit()).parse();
        let total = window[2].trim_matches(|c: char| !c.is_ascii_digit()).parse();
        if let (Ok(successes), Ok(total)) = (successes, total) {
            return Some((successes, total));
        }
    }
    None
}
