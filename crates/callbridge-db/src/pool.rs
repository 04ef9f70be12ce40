//! Pooled SQLite connections for the context index.

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OpenFlags};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbRuntimeSettings {
    pub busy_timeout_ms: u64,
    pub pool_max_size: u32,
}

impl Default for DbRuntimeSettings {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5_000,
            pool_max_size: 8,
        }
    }
}

pub type DbPool = Pool<SqliteConnectionManager>;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("failed to create database connection pool: {0}")]
    PoolInit(#[from] r2d2::Error),

    /// Every pooled `:memory:` connection would see its own empty database,
    /// so sessions could never read each other's writes.
    #[error("context index needs a database file, got {0:?}")]
    InMemory(String),
}

/// Opens a pool over the database file at `db_path`.
///
/// Each connection runs in WAL mode so call sessions can read context while
/// another session commits a turn.
///
/// # Errors
///
/// `PoolError::InMemory` for `:memory:` or an empty path,
/// `PoolError::PoolInit` if no connection can be established.
pub fn create_pool(db_path: &str, settings: DbRuntimeSettings) -> Result<DbPool, PoolError> {
    let trimmed = db_path.trim();
    if trimmed.is_empty() || trimmed == ":memory:" {
        return Err(PoolError::InMemory(db_path.to_string()));
    }

    let manager = SqliteConnectionManager::file(trimmed)
        .with_flags(
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        )
        .with_init(move |conn| configure_connection(conn, settings));

    let pool = Pool::builder()
        .max_size(settings.pool_max_size)
        .build(manager)?;
    tracing::debug!(path = trimmed, max_size = settings.pool_max_size, "context database pool ready");
    Ok(pool)
}

fn configure_connection(conn: &mut Connection, settings: DbRuntimeSettings) -> rusqlite::Result<()> {
    let mode: String = conn.query_row("PRAGMA journal_mode = WAL;", [], |row| row.get(0))?;
    if !mode.eq_ignore_ascii_case("wal") {
        return Err(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_ERROR),
            Some(format!("journal_mode stayed {mode}")),
        ));
    }
    // Losing the last turn on power failure is acceptable; WAL keeps the
    // file consistent either way.
    conn.execute_batch(&format!(
        "PRAGMA synchronous = NORMAL;
         PRAGMA busy_timeout = {};",
        settings.busy_timeout_ms
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pragma<T: rusqlite::types::FromSql>(conn: &Connection, name: &str) -> T {
        conn.query_row(&format!("PRAGMA {name};"), [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn connections_run_in_wal_with_configured_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("context.db");
        let pool = create_pool(
            path.to_str().unwrap(),
            DbRuntimeSettings {
                busy_timeout_ms: 2_500,
                pool_max_size: 3,
            },
        )
        .unwrap();

        let conn = pool.get().unwrap();
        assert_eq!(pragma::<String>(&conn, "journal_mode"), "wal");
        assert_eq!(pragma::<i64>(&conn, "busy_timeout"), 2_500);
        // NORMAL
        assert_eq!(pragma::<i64>(&conn, "synchronous"), 1);
        assert_eq!(pool.max_size(), 3);
    }

    #[test]
    fn in_memory_paths_are_rejected() {
        for path in [":memory:", "", "  "] {
            assert!(matches!(
                create_pool(path, DbRuntimeSettings::default()),
                Err(PoolError::InMemory(_))
            ));
        }
    }
}
