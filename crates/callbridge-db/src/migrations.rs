//! Schema versioning for the context database.
//!
//! The schema version lives in SQLite's `user_version` header field: version
//! `n` means the first `n` entries of [`SCHEMA`] have been applied. Each step
//! and its version bump commit together.

use rusqlite::Connection;
use thiserror::Error;

struct SchemaStep {
    name: &'static str,
    sql: &'static str,
}

const SCHEMA: &[SchemaStep] = &[SchemaStep {
    name: "000_context_records",
    sql: include_str!("migrations/000_context_records.sql"),
}];

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("schema step '{name}' failed: {source}")]
    ExecutionFailed {
        name: &'static str,
        source: rusqlite::Error,
    },

    #[error("failed to read schema version: {0}")]
    StateQuery(rusqlite::Error),

    /// The file was written by a newer build.
    #[error("database schema version {found} is newer than this build ({supported})")]
    UnknownVersion { found: usize, supported: usize },
}

/// Brings the schema up to date and returns how many steps were applied.
///
/// # Errors
///
/// Returns `MigrationError` if a step fails (that step is rolled back) or if
/// the database is at a version this build does not know.
pub fn run_migrations(conn: &Connection) -> Result<usize, MigrationError> {
    apply_steps(conn, SCHEMA)
}

fn apply_steps(conn: &Connection, steps: &[SchemaStep]) -> Result<usize, MigrationError> {
    let current: usize = conn
        .query_row("PRAGMA user_version;", [], |row| row.get::<_, i64>(0))
        .map_err(MigrationError::StateQuery)?
        .try_into()
        .unwrap_or(0);

    if current > steps.len() {
        return Err(MigrationError::UnknownVersion {
            found: current,
            supported: steps.len(),
        });
    }

    for (index, step) in steps.iter().enumerate().skip(current) {
        let failed = |source| MigrationError::ExecutionFailed {
            name: step.name,
            source,
        };
        tracing::info!(step = step.name, "applying schema step");

        let tx = conn.unchecked_transaction().map_err(failed)?;
        tx.execute_batch(step.sql).map_err(failed)?;
        tx.execute_batch(&format!("PRAGMA user_version = {};", index + 1))
            .map_err(failed)?;
        tx.commit().map_err(failed)?;
    }

    Ok(steps.len() - current)
}
