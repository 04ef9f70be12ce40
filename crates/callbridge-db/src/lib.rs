//! Database layer for callbridge.
//!
//! Provides SQLite connection pooling (via `r2d2`), WAL-mode initialization,
//! and embedded SQL migrations for the local conversation-context index.
//!
//! - **SQLite with WAL mode**: concurrent readers with a single writer, which
//!   matches many live calls reading context while one turn is written.
//! - **Versioned schema**: SQL steps are compiled in via `include_str!` and
//!   tracked in SQLite's `user_version`, so the schema ships with the server.

mod migrations;
mod pool;

pub use migrations::{run_migrations, MigrationError};
pub use pool::{create_pool, DbPool, DbRuntimeSettings, PoolError};
