//! The delivery loop: polls for undelivered announcements and speaks them
//! into the live session through an injected sink.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::sleep;
use valet_db::DbPool;

use crate::{list_unannounced, mark_announced, AnnounceError};

/// Error reported by an [`AnnouncementSink`] when delivery fails.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct SinkError(pub String);

impl SinkError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// The live session's speech output, as seen from the delivery loop.
///
/// Implementations are supplied by whatever session/transport layer is
/// active; this crate only needs "speak this text". A returned error leaves
/// the announcement undelivered, so it is retried on the next poll.
#[async_trait]
pub trait AnnouncementSink: Send + Sync {
    async fn deliver(&self, text: &str) -> Result<(), SinkError>;
}

/// Timing knobs for the delivery loop.
#[derive(Debug, Clone, Copy)]
pub struct AnnouncerSettings {
    /// Pause between polls for undelivered announcements.
    pub poll_interval: Duration,

    /// Pause after a failed poll (e.g. the store was unavailable) before
    /// trying again. Longer than the poll interval: if listing fails, the
    /// store needs breathing room, not a tighter loop.
    pub error_backoff: Duration,
}

impl Default for AnnouncerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            error_backoff: Duration::from_secs(10),
        }
    }
}

/// Runs the announcement delivery loop until shutdown is signalled.
///
/// Each cycle delivers every pending announcement in creation order, then
/// sleeps for the poll interval. Per-announcement failures are logged and
/// skipped; only a failure to list pending announcements backs the loop off.
/// Shutdown is observed between cycles, so an in-flight cycle drains before
/// the loop exits.
pub async fn run_announcer(
    pool: DbPool,
    sink: Arc<dyn AnnouncementSink>,
    settings: AnnouncerSettings,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::info!(
        poll_interval_ms = settings.poll_interval.as_millis() as u64,
        "announcement channel started"
    );

    loop {
        if *shutdown.borrow() {
            break;
        }

        let pause = match deliver_pending_once(&pool, sink.as_ref()).await {
            Ok(delivered) => {
                if delivered > 0 {
                    tracing::info!(delivered, "delivered announcements");
                }
                settings.poll_interval
            }
            Err(e) => {
                tracing::error!(error = %e, "announcement poll failed, backing off");
                settings.error_backoff
            }
        };

        if wait_or_shutdown(pause, &mut shutdown).await {
            break;
        }
    }

    tracing::info!("announcement channel stopped");
}

/// Delivers every currently pending announcement once, in creation order.
///
/// Returns the number of announcements that were both delivered and marked.
/// A sink failure for one announcement does not block the ones after it in
/// the same cycle; the failed item simply stays pending. A failure to mark
/// a delivered announcement is logged and tolerated: the row stays pending
/// and the message will be spoken again (the at-least-once contract).
///
/// # Errors
///
/// Returns an error only when the pending list itself cannot be read.
pub async fn deliver_pending_once(
    pool: &DbPool,
    sink: &dyn AnnouncementSink,
) -> Result<usize, AnnounceError> {
    let pending = {
        let pool = pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            list_unannounced(&conn)
        })
        .await
        .map_err(|e| AnnounceError::Join(e.to_string()))??
    };

    let mut delivered = 0;
    for announcement in pending {
        tracing::debug!(
            announcement_id = %announcement.announcement_id,
            title = announcement.title.as_deref().unwrap_or(""),
            "delivering announcement"
        );

        if let Err(e) = sink.deliver(&announcement.message).await {
            tracing::warn!(
                announcement_id = %announcement.announcement_id,
                error = %e,
                "announcement delivery failed, will retry next poll"
            );
            continue;
        }

        let mark = {
            let pool = pool.clone();
            let id = announcement.announcement_id.clone();
            tokio::task::spawn_blocking(move || {
                let conn = pool.get()?;
                mark_announced(&conn, &id)
            })
            .await
            .map_err(|e| AnnounceError::Join(e.to_string()))
            .and_then(|r| r)
        };

        match mark {
            Ok(()) => delivered += 1,
            Err(e) => {
                // Delivered but not recorded: the next poll repeats the
                // message. That is the at-least-once side of the contract.
                tracing::error!(
                    announcement_id = %announcement.announcement_id,
                    error = %e,
                    "failed to mark announcement delivered"
                );
            }
        }
    }

    Ok(delivered)
}

/// Sleeps for `duration` unless shutdown arrives first. Returns `true` when
/// the loop should exit.
async fn wait_or_shutdown(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = sleep(duration) => false,
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}
