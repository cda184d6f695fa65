//! Agent configuration loading from file and environment variables.

use serde::Deserialize;
use thiserror::Error;

/// Top-level agent configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Database settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Conversational memory settings.
    #[serde(default)]
    pub context: ContextConfig,

    /// Task processor settings.
    #[serde(default)]
    pub tasks: TasksConfig,

    /// Announcement channel settings.
    #[serde(default)]
    pub announcer: AnnouncerConfig,

    /// Remote workflow webhook settings.
    #[serde(default)]
    pub workflow: WorkflowConfig,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,

    /// Busy timeout for SQLite connections, in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Maximum number of pooled SQLite connections.
    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: u32,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "valet_agent=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

/// Conversational memory configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ContextConfig {
    /// Freshness bound for cached entries, in seconds. Entries older than
    /// this read as absent and are deleted on that read.
    #[serde(default = "default_ttl_seconds")]
    pub ttl_seconds: f64,
}

/// Task processor configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TasksConfig {
    /// Pause between sweeps of the pending task queue, in seconds.
    #[serde(default = "default_task_poll_seconds")]
    pub poll_interval_seconds: u64,

    /// Ceiling on a single handler invocation, in seconds.
    #[serde(default = "default_handler_timeout_seconds")]
    pub handler_timeout_seconds: u64,

    /// Pause after a failed sweep before polling again, in seconds.
    #[serde(default = "default_task_backoff_seconds")]
    pub error_backoff_seconds: u64,
}

/// Announcement channel configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AnnouncerConfig {
    /// Pause between polls for undelivered announcements, in seconds.
    #[serde(default = "default_announce_poll_seconds")]
    pub poll_interval_seconds: u64,

    /// Pause after a failed poll before trying again, in seconds.
    #[serde(default = "default_announce_backoff_seconds")]
    pub error_backoff_seconds: u64,
}

/// Remote workflow webhook configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowConfig {
    /// Base URL of the self-hosted workflow instance; short endpoint names
    /// resolve against it.
    #[serde(default)]
    pub base_url: String,

    /// Base URL of the hosted workflow service; full webhook IDs resolve
    /// against it when set.
    #[serde(default)]
    pub hosted_base_url: String,

    /// API key sent with every webhook request.
    #[serde(default)]
    pub api_key: String,

    /// Per-request timeout, in seconds.
    #[serde(default = "default_workflow_timeout_seconds")]
    pub timeout_seconds: u64,

    /// Webhook ID of the calendar workflow.
    #[serde(default)]
    pub calendar_webhook_id: String,
}

fn default_db_path() -> String {
    "valet.db".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_pool_max_size() -> u32 {
    4
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_ttl_seconds() -> f64 {
    3600.0
}

fn default_task_poll_seconds() -> u64 {
    2
}

fn default_handler_timeout_seconds() -> u64 {
    240
}

fn default_task_backoff_seconds() -> u64 {
    5
}

fn default_announce_poll_seconds() -> u64 {
    5
}

fn default_announce_backoff_seconds() -> u64 {
    10
}

fn default_workflow_timeout_seconds() -> u64 {
    30
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            pool_max_size: default_pool_max_size(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: default_ttl_seconds(),
        }
    }
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: default_task_poll_seconds(),
            handler_timeout_seconds: default_handler_timeout_seconds(),
            error_backoff_seconds: default_task_backoff_seconds(),
        }
    }
}

impl Default for AnnouncerConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: default_announce_poll_seconds(),
            error_backoff_seconds: default_announce_backoff_seconds(),
        }
    }
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            hosted_base_url: String::new(),
            api_key: String::new(),
            timeout_seconds: default_workflow_timeout_seconds(),
            calendar_webhook_id: String::new(),
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `VALET_DB_PATH` overrides `database.path`
/// - `VALET_LOG_LEVEL` overrides `logging.level`
/// - `VALET_LOG_JSON` overrides `logging.json` (set to "true" to enable)
/// - `VALET_WORKFLOW_BASE_URL` overrides `workflow.base_url`
/// - `VALET_WORKFLOW_API_KEY` overrides `workflow.api_key`
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    // Environment variable overrides
    if let Ok(db_path) = std::env::var("VALET_DB_PATH") {
        config.database.path = db_path;
    }
    if let Ok(level) = std::env::var("VALET_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Ok(json) = std::env::var("VALET_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
    if let Ok(base_url) = std::env::var("VALET_WORKFLOW_BASE_URL") {
        config.workflow.base_url = base_url;
    }
    if let Ok(api_key) = std::env::var("VALET_WORKFLOW_API_KEY") {
        config.workflow.api_key = api_key;
    }

    Ok(config)
}
