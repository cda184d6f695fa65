//! Unit tests for the announcement queue and delivery loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use rusqlite::Connection;

use crate::{
    create_announcement, deliver_pending_once, get_announcement, list_unannounced, mark_announced,
    AnnounceError, AnnouncementSink, SinkError,
};

/// Creates an in-memory SQLite database with migrations applied.
fn test_db() -> Connection {
    let conn = Connection::open_in_memory().expect("should open in-memory db");
    valet_db::run_migrations(&conn).expect("migrations should succeed");
    conn
}

/// Creates a tempfile-backed pool for the async delivery tests.
fn test_pool() -> (tempfile::TempDir, valet_db::DbPool) {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let path = dir.path().join("announce.db");
    let pool = valet_db::create_pool(
        path.to_str().expect("utf-8 path"),
        valet_db::DbSettings::default(),
    )
    .expect("pool creation should succeed");
    {
        let conn = pool.get().expect("should get connection");
        valet_db::run_migrations(&conn).expect("migrations should succeed");
    }
    (dir, pool)
}

/// Inserts a minimal task row so announcements can reference it.
fn seed_task(conn: &Connection, task_id: &str) {
    conn.execute(
        "INSERT INTO tasks (task_id, task_type, status, params_json, created_at)
         VALUES (?1, 'email_check', 'completed', '{}', 0.0)",
        [task_id],
    )
    .expect("should insert task");
}

/// A sink that records every utterance it is handed.
#[derive(Default)]
struct RecordingSink {
    spoken: Mutex<Vec<String>>,
}

#[async_trait]
impl AnnouncementSink for RecordingSink {
    async fn deliver(&self, text: &str) -> Result<(), SinkError> {
        self.spoken
            .lock()
            .expect("sink lock should not be poisoned")
            .push(text.to_string());
        Ok(())
    }
}

/// A sink that rejects any utterance containing a marker substring.
struct RejectingSink {
    marker: &'static str,
    inner: RecordingSink,
}

#[async_trait]
impl AnnouncementSink for RejectingSink {
    async fn deliver(&self, text: &str) -> Result<(), SinkError> {
        if text.contains(self.marker) {
            return Err(SinkError::new("session refused the utterance"));
        }
        self.inner.deliver(text).await
    }
}

/// A sink that fails its first delivery and then accepts everything.
struct FlakySink {
    failed_once: AtomicBool,
    inner: RecordingSink,
}

#[async_trait]
impl AnnouncementSink for FlakySink {
    async fn deliver(&self, text: &str) -> Result<(), SinkError> {
        if !self.failed_once.swap(true, Ordering::SeqCst) {
            return Err(SinkError::new("session not ready yet"));
        }
        self.inner.deliver(text).await
    }
}

// ── queue operations ─────────────────────────────────────────────────

#[test]
fn create_then_get_round_trips() {
    let conn = test_db();
    seed_task(&conn, "task-1");

    let id = create_announcement(
        &conn,
        Some("task-1"),
        "You have 3 new emails.",
        Some("email_check complete"),
        1,
    )
    .expect("create should succeed");

    let announcement = get_announcement(&conn, &id)
        .expect("get should succeed")
        .expect("announcement should exist");

    assert_eq!(announcement.announcement_id, id);
    assert_eq!(announcement.task_id.as_deref(), Some("task-1"));
    assert_eq!(announcement.message, "You have 3 new emails.");
    assert_eq!(announcement.title.as_deref(), Some("email_check complete"));
    assert_eq!(announcement.priority, 1);
    assert!(!announcement.announced);
    assert!(announcement.announced_at.is_none());
    assert!(announcement.created_at > 0.0);
}

#[test]
fn announcements_can_stand_alone_without_a_task() {
    let conn = test_db();
    let id = create_announcement(&conn, None, "Good morning.", None, 1)
        .expect("create should succeed");

    let announcement = get_announcement(&conn, &id)
        .expect("get should succeed")
        .expect("announcement should exist");
    assert!(announcement.task_id.is_none());
    assert!(announcement.title.is_none());
}

#[test]
fn get_unknown_announcement_is_absent() {
    let conn = test_db();
    let found = get_announcement(&conn, "no-such-id").expect("get should succeed");
    assert!(found.is_none());
}

#[test]
fn list_unannounced_is_oldest_first_and_skips_delivered() {
    let conn = test_db();

    let first = create_announcement(&conn, None, "first", None, 1).expect("create");
    let second = create_announcement(&conn, None, "second", None, 1).expect("create");
    let third = create_announcement(&conn, None, "third", None, 1).expect("create");

    // Force distinct, ordered creation times; sub-microsecond writes can
    // otherwise collide.
    for (i, id) in [&first, &second, &third].iter().enumerate() {
        conn.execute(
            "UPDATE announcements SET created_at = ?1 WHERE announcement_id = ?2",
            rusqlite::params![100.0 + i as f64, id],
        )
        .expect("should set created_at");
    }

    mark_announced(&conn, &second).expect("mark should succeed");

    let pending = list_unannounced(&conn).expect("list should succeed");
    let ids: Vec<&str> = pending
        .iter()
        .map(|a| a.announcement_id.as_str())
        .collect();
    assert_eq!(ids, vec![first.as_str(), third.as_str()]);
}

#[test]
fn priority_does_not_reorder_delivery() {
    let conn = test_db();
    let low = create_announcement(&conn, None, "low priority, created first", None, 1)
        .expect("create");
    let high = create_announcement(&conn, None, "high priority, created later", None, 9)
        .expect("create");
    conn.execute(
        "UPDATE announcements SET created_at = 1.0 WHERE announcement_id = ?1",
        [&low],
    )
    .expect("set created_at");
    conn.execute(
        "UPDATE announcements SET created_at = 2.0 WHERE announcement_id = ?1",
        [&high],
    )
    .expect("set created_at");

    let pending = list_unannounced(&conn).expect("list should succeed");
    assert_eq!(pending[0].announcement_id, low, "creation order wins");
}

// ── mark_announced ───────────────────────────────────────────────────

#[test]
fn mark_announced_is_idempotent() {
    let conn = test_db();
    let id = create_announcement(&conn, None, "hello", None, 1).expect("create");

    mark_announced(&conn, &id).expect("first mark should succeed");
    let after_first = get_announcement(&conn, &id)
        .expect("get")
        .expect("announcement should exist");
    assert!(after_first.announced);
    let first_stamp = after_first
        .announced_at
        .expect("announced_at should be set");

    mark_announced(&conn, &id).expect("second mark should also succeed");
    let after_second = get_announcement(&conn, &id)
        .expect("get")
        .expect("announcement should exist");
    assert!(after_second.announced);
    assert_eq!(
        after_second.announced_at,
        Some(first_stamp),
        "the original delivery timestamp must survive a duplicate mark"
    );
}

#[test]
fn mark_unknown_announcement_is_an_error() {
    let conn = test_db();
    let err = mark_announced(&conn, "no-such-id").expect_err("mark should fail");
    assert!(matches!(err, AnnounceError::NotFound(_)));
}

// ── delivery loop ────────────────────────────────────────────────────

#[tokio::test]
async fn delivers_pending_in_order_and_marks_them() {
    let (_dir, pool) = test_pool();
    {
        let conn = pool.get().expect("conn");
        let a = create_announcement(&conn, None, "first message", None, 1).expect("create");
        let b = create_announcement(&conn, None, "second message", None, 1).expect("create");
        conn.execute(
            "UPDATE announcements SET created_at = 1.0 WHERE announcement_id = ?1",
            [&a],
        )
        .expect("set created_at");
        conn.execute(
            "UPDATE announcements SET created_at = 2.0 WHERE announcement_id = ?1",
            [&b],
        )
        .expect("set created_at");
    }

    let sink = RecordingSink::default();
    let delivered = deliver_pending_once(&pool, &sink)
        .await
        .expect("delivery should succeed");
    assert_eq!(delivered, 2);

    let spoken = sink.spoken.lock().expect("lock");
    assert_eq!(*spoken, vec!["first message", "second message"]);

    let conn = pool.get().expect("conn");
    let remaining = list_unannounced(&conn).expect("list");
    assert!(remaining.is_empty(), "both rows should be marked delivered");
}

#[tokio::test]
async fn one_failing_delivery_does_not_block_the_rest() {
    let (_dir, pool) = test_pool();
    {
        let conn = pool.get().expect("conn");
        let bad = create_announcement(&conn, None, "POISON message", None, 1).expect("create");
        let good = create_announcement(&conn, None, "healthy message", None, 1).expect("create");
        conn.execute(
            "UPDATE announcements SET created_at = 1.0 WHERE announcement_id = ?1",
            [&bad],
        )
        .expect("set created_at");
        conn.execute(
            "UPDATE announcements SET created_at = 2.0 WHERE announcement_id = ?1",
            [&good],
        )
        .expect("set created_at");
    }

    let sink = RejectingSink {
        marker: "POISON",
        inner: RecordingSink::default(),
    };
    let delivered = deliver_pending_once(&pool, &sink)
        .await
        .expect("delivery should succeed");
    assert_eq!(delivered, 1, "the healthy message still goes out");

    let spoken = sink.inner.spoken.lock().expect("lock");
    assert_eq!(*spoken, vec!["healthy message"]);

    let conn = pool.get().expect("conn");
    let remaining = list_unannounced(&conn).expect("list");
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].message, "POISON message");
}

#[tokio::test]
async fn failed_delivery_is_retried_on_a_later_poll() {
    let (_dir, pool) = test_pool();
    {
        let conn = pool.get().expect("conn");
        create_announcement(&conn, None, "eventually spoken", None, 1).expect("create");
    }

    let sink = FlakySink {
        failed_once: AtomicBool::new(false),
        inner: RecordingSink::default(),
    };

    let first = deliver_pending_once(&pool, &sink)
        .await
        .expect("poll should succeed even when the sink refuses");
    assert_eq!(first, 0);

    let second = deliver_pending_once(&pool, &sink)
        .await
        .expect("second poll should succeed");
    assert_eq!(second, 1);

    let spoken = sink.inner.spoken.lock().expect("lock");
    assert_eq!(*spoken, vec!["eventually spoken"]);
}

#[tokio::test]
async fn delivered_announcements_are_not_repeated() {
    let (_dir, pool) = test_pool();
    {
        let conn = pool.get().expect("conn");
        create_announcement(&conn, None, "once only", None, 1).expect("create");
    }

    let sink = RecordingSink::default();
    deliver_pending_once(&pool, &sink).await.expect("first poll");
    deliver_pending_once(&pool, &sink)
        .await
        .expect("second poll");

    let spoken = sink.spoken.lock().expect("lock");
    assert_eq!(
        *spoken,
        vec!["once only"],
        "a marked announcement must not be delivered again"
    );
}
