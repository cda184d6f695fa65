//! Database layer for the Valet assistant.
//!
//! Provides SQLite connection pooling (via `r2d2`), WAL-mode initialization,
//! embedded SQL migrations, and the single durable store shared by the
//! context cache, the task queue, and the announcement channel. Every table
//! is created through versioned migrations managed by this crate, so schema
//! initialization is idempotent and safe to run on every process start.
//!
//! # Design decisions
//!
//! - **SQLite with WAL mode**: the assistant is a single process with a
//!   handful of long-lived polling loops; an embedded file store with
//!   concurrent readers and one writer covers that access pattern without
//!   an external database.
//! - **`r2d2` connection pool**: bounded connection reuse for the loops and
//!   tool handlers that all share the one store.
//! - **Embedded migrations**: SQL files are compiled into the binary via
//!   `include_str!`, so the schema ships with the code that depends on it.

mod migrations;
mod pool;

pub use migrations::{run_migrations, MigrationError};
pub use pool::{create_pool, DbPool, DbSettings, PoolError};
