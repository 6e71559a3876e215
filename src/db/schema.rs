//! Database schema definitions

use rusqlite::{Connection, OptionalExtension};
use tracing::info;

use crate::error::DepositError;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<(), DepositError> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        info!("Creating new database schema v{}", SCHEMA_VERSION);
        create_tables(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version > SCHEMA_VERSION {
        return Err(DepositError::Database(format!(
            "database schema v{} is newer than supported v{}",
            current_version, SCHEMA_VERSION
        )));
    } else {
        info!("Database schema is up to date (v{})", current_version);
    }

    Ok(())
}

/// Get current schema version (0 if not initialized)
fn get_schema_version(conn: &Connection) -> Result<i32, DepositError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    )
    .map_err(|e| DepositError::Database(format!("Failed to create schema_version table: {}", e)))?;

    let version: Option<i32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
        .optional()
        .map_err(|e| DepositError::Database(format!("Failed to read schema_version: {}", e)))?;

    Ok(version.unwrap_or(0))
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<(), DepositError> {
    conn.execute("DELETE FROM schema_version", [])
        .map_err(|e| DepositError::Database(format!("Failed to clear schema_version: {}", e)))?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?)", [version])
        .map_err(|e| DepositError::Database(format!("Failed to set schema_version: {}", e)))?;
    Ok(())
}

fn create_tables(conn: &Connection) -> Result<(), DepositError> {
    conn.execute_batch(DEPOSITS_SCHEMA)
        .map_err(|e| DepositError::Database(format!("Failed to create deposits table: {}", e)))?;

    conn.execute_batch(INDEXES_SCHEMA)
        .map_err(|e| DepositError::Database(format!("Failed to create indexes: {}", e)))?;

    Ok(())
}

/// Deposits table.
///
/// `owner_ref` is unique: one deposit per archived object.
/// Timestamps are Unix milliseconds.
const DEPOSITS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS deposits (
    id TEXT PRIMARY KEY NOT NULL,
    owner_ref TEXT NOT NULL UNIQUE,
    remote_id TEXT,
    swhid TEXT,
    status CHAR(1) NOT NULL DEFAULT 'N',
    version INTEGER NOT NULL DEFAULT 1,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
"#;

const INDEXES_SCHEMA: &str = r#"
CREATE INDEX IF NOT EXISTS idx_deposits_status ON deposits(status);
CREATE INDEX IF NOT EXISTS idx_deposits_status_updated ON deposits(status, updated_at);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap();

        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);

        let count: i32 = conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type='table' AND name='deposits'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_unreadable_version_is_an_error() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE schema_version (version TEXT NOT NULL); INSERT INTO schema_version VALUES ('two');")
            .unwrap();

        assert!(matches!(get_schema_version(&conn), Err(DepositError::Database(_))));
        assert!(init_schema(&conn).is_err());
    }

    #[test]
    fn test_newer_schema_is_refused() {
        let conn = Connection::open_in_memory().unwrap();
        get_schema_version(&conn).unwrap();
        set_schema_version(&conn, SCHEMA_VERSION + 1).unwrap();

        assert!(matches!(init_schema(&conn), Err(DepositError::Database(_))));
    }
}
