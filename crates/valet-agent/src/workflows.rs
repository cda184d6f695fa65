//! Client for the remote automation workflows that do the actual fetching
//! (mail, calendar, feeds).
//!
//! Each workflow is a webhook that accepts a JSON payload and replies with
//! JSON, typically `{"speech": ..., "artifact": ...}`. The agent never
//! talks to the upstream providers itself; the workflows own credentials
//! and data shaping, and this client owns nothing but the POST.

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use crate::config::WorkflowConfig;

/// Error from a workflow webhook call (transport, timeout, or a non-2xx
/// reply).
#[derive(Debug, Error)]
#[error("workflow request failed: {0}")]
pub struct WorkflowError(#[from] reqwest::Error);

/// Posts JSON to workflow webhooks and parses their JSON replies.
#[derive(Debug, Clone)]
pub struct WorkflowClient {
    http: reqwest::Client,
    base_url: String,
    hosted_base_url: String,
    api_key: String,
}

impl WorkflowClient {
    pub fn new(config: &WorkflowConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .user_agent("valet-agent/0.1")
            .build()
            .unwrap_or_default();

        Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            hosted_base_url: config.hosted_base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        }
    }

    /// POSTs `payload` to the workflow named or identified by `endpoint`
    /// and returns the parsed JSON reply.
    ///
    /// # Errors
    ///
    /// Returns `WorkflowError` on transport failure, timeout, a non-2xx
    /// status, or an unparseable reply body.
    pub async fn call(&self, endpoint: &str, payload: &Value) -> Result<Value, WorkflowError> {
        let url = self.resolve_url(endpoint);
        tracing::info!(%url, "calling workflow webhook");

        let response = self
            .http
            .post(&url)
            .header("X-Valet-Api-Key", &self.api_key)
            .json(payload)
            .send()
            .await?
            .error_for_status()?;

        let reply = response.json().await?;
        tracing::debug!(%url, "workflow webhook replied");
        Ok(reply)
    }

    /// Short endpoint names resolve against the self-hosted base URL; full
    /// webhook IDs (UUID form) address the hosted workflow service when
    /// one is configured.
    fn resolve_url(&self, endpoint: &str) -> String {
        if is_webhook_id(endpoint) && !self.hosted_base_url.is_empty() {
            format!("{}/{}", self.hosted_base_url, endpoint)
        } else {
            format!("{}/{}", self.base_url, endpoint)
        }
    }
}

/// Whether `endpoint` is a full webhook ID rather than a short name.
fn is_webhook_id(endpoint: &str) -> bool {
    endpoint.len() == 36 && endpoint.contains('-')
}
