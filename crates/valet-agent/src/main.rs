//! Valet agent binary — the process that carries the assistant's memory
//! and background work.
//!
//! Starts the shared SQLite store, registers the built-in task handlers,
//! and runs the two polling loops (task processor, announcement channel)
//! until SIGINT/SIGTERM, with structured logging throughout.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use valet_agent::session::SessionSink;
use valet_agent::tools::ToolContext;
use valet_agent::workflows::WorkflowClient;
use valet_agent::{config, handlers};

fn resolve_config_path() -> (Option<String>, &'static str) {
    if let Some(path) = std::env::args()
        .nth(1)
        .filter(|value| !value.trim().is_empty())
    {
        return (Some(path), "cli-arg");
    }

    if let Ok(path) = std::env::var("VALET_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return (Some(path), "env-var");
        }
    }

    (None, "default")
}

#[tokio::main]
async fn main() {
    let (resolved_config_path, config_source) = resolve_config_path();
    let selected_config_path = resolved_config_path.as_deref().or(Some("config.toml"));

    // Load configuration
    let config = config::load_config(selected_config_path)
        .expect("failed to load configuration; the agent cannot start without valid config");

    // Initialize tracing
    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!(
        source = config_source,
        path = selected_config_path.unwrap_or("<none>"),
        "resolved startup configuration path"
    );

    // Initialize the shared store
    let pool = valet_db::create_pool(
        &config.database.path,
        valet_db::DbSettings {
            busy_timeout_ms: config.database.busy_timeout_ms,
            pool_max_size: config.database.pool_max_size,
        },
    )
    .expect("failed to create database pool; check database.path in config");

    {
        let conn = pool
            .get()
            .expect("failed to get database connection for migrations");
        let applied = valet_db::run_migrations(&conn).expect("failed to run database migrations");
        if applied > 0 {
            tracing::info!(count = applied, "applied database migrations");
        }
    }

    // Shared tool context: store + workflow client + freshness bound
    let tools = Arc::new(ToolContext {
        pool: pool.clone(),
        workflows: WorkflowClient::new(&config.workflow),
        ttl_seconds: config.context.ttl_seconds,
        calendar_webhook_id: config.workflow.calendar_webhook_id.clone(),
    });

    // Explicit handler registration, before the processor starts
    let mut registry = valet_tasks::HandlerRegistry::new();
    handlers::register_builtin_handlers(&mut registry, Arc::clone(&tools));
    let registry = Arc::new(registry);
    tracing::info!(
        handlers = registry.len(),
        types = ?registry.registered_types(),
        "task handlers registered"
    );

    // Session speech outlet. Until a real session transport attaches, log
    // every utterance so headless runs still show what would be spoken.
    let sink = Arc::new(SessionSink::new());
    let mut utterances = sink.subscribe();
    tokio::spawn(async move {
        loop {
            match utterances.recv().await {
                Ok(text) => tracing::info!(%text, "session utterance"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "utterance log fell behind");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // Spawn the polling loops with a shared cooperative shutdown flag
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let processor = tokio::spawn(valet_tasks::run_task_processor(
        pool.clone(),
        Arc::clone(&registry),
        valet_tasks::ProcessorSettings {
            poll_interval: Duration::from_secs(config.tasks.poll_interval_seconds),
            handler_timeout: Duration::from_secs(config.tasks.handler_timeout_seconds),
            error_backoff: Duration::from_secs(config.tasks.error_backoff_seconds),
        },
        shutdown_rx.clone(),
    ));

    let announcer = tokio::spawn(valet_announce::run_announcer(
        pool.clone(),
        Arc::clone(&sink) as Arc<dyn valet_announce::AnnouncementSink>,
        valet_announce::AnnouncerSettings {
            poll_interval: Duration::from_secs(config.announcer.poll_interval_seconds),
            error_backoff: Duration::from_secs(config.announcer.error_backoff_seconds),
        },
        shutdown_rx,
    ));

    tracing::info!("valet agent running");

    shutdown_signal().await;

    // Cooperative stop: both loops observe the flag at their next
    // suspension point and drain any in-flight cycle before exiting.
    let _ = shutdown_tx.send(true);
    let _ = processor.await;
    let _ = announcer.await;

    tracing::info!("valet agent shut down");
}

/// Waits for a SIGINT (Ctrl+C) or SIGTERM signal for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { tracing::info!("received SIGINT, initiating graceful shutdown"); }
        () = terminate => { tracing::info!("received SIGTERM, initiating graceful shutdown"); }
    }
}
