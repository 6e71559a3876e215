//! Deposit row operations
//!
//! Plain functions over a `Connection`, so they work the same on a bare
//! connection and inside a transaction.

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use tracing::debug;
use uuid::Uuid;

use crate::error::DepositError;
use crate::models::{Deposit, DepositStatus};

const COLUMNS: &str = "id, owner_ref, remote_id, swhid, status, version, created_at, updated_at";

fn from_row(row: &Row) -> Result<Deposit, rusqlite::Error> {
    let code: String = row.get("status")?;
    let status = DepositStatus::from_code(&code).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            4,
            Type::Text,
            format!("unknown deposit status code '{}'", code).into(),
        )
    })?;

    Ok(Deposit {
        id: row.get("id")?,
        owner_ref: row.get("owner_ref")?,
        remote_id: row.get("remote_id")?,
        swhid: row.get("swhid")?,
        status,
        version: row.get("version")?,
        created_at: millis_to_datetime(row.get("created_at")?, 6)?,
        updated_at: millis_to_datetime(row.get("updated_at")?, 7)?,
    })
}

fn millis_to_datetime(ms: i64, column: usize) -> Result<DateTime<Utc>, rusqlite::Error> {
    DateTime::<Utc>::from_timestamp_millis(ms).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            column,
            Type::Integer,
            format!("timestamp out of range: {}", ms).into(),
        )
    })
}

/// Timestamps are stored as milliseconds; keep in-memory copies equal to stored ones
fn store_precision(now: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

/// Insert a NEW deposit for `owner_ref`.
///
/// Fails with `Conflict` if the owner already has a deposit.
pub fn insert_deposit(
    conn: &Connection,
    owner_ref: &str,
    now: DateTime<Utc>,
) -> Result<Deposit, DepositError> {
    let now = store_precision(now);
    let deposit = Deposit {
        id: Uuid::new_v4().to_string(),
        owner_ref: owner_ref.to_string(),
        remote_id: None,
        swhid: None,
        status: DepositStatus::New,
        version: 1,
        created_at: now,
        updated_at: now,
    };

    let result = conn.execute(
        "INSERT INTO deposits (id, owner_ref, remote_id, swhid, status, version, created_at, updated_at)
         VALUES (?1, ?2, NULL, NULL, ?3, ?4, ?5, ?5)",
        params![
            deposit.id,
            deposit.owner_ref,
            deposit.status.code(),
            deposit.version,
            now.timestamp_millis(),
        ],
    );

    match result {
        Ok(_) => {
            debug!(id = %deposit.id, owner = %owner_ref, "Inserted deposit");
            Ok(deposit)
        }
        Err(rusqlite::Error::SqliteFailure(err, _)) if err.code == ErrorCode::ConstraintViolation => {
            Err(DepositError::Conflict(format!(
                "owner {} already has a deposit",
                owner_ref
            )))
        }
        Err(e) => Err(e.into()),
    }
}

pub fn get_deposit(conn: &Connection, id: &str) -> Result<Option<Deposit>, DepositError> {
    let sql = format!("SELECT {} FROM deposits WHERE id = ?", COLUMNS);
    Ok(conn.query_row(&sql, params![id], from_row).optional()?)
}

pub fn get_deposit_by_owner(conn: &Connection, owner_ref: &str) -> Result<Option<Deposit>, DepositError> {
    let sql = format!("SELECT {} FROM deposits WHERE owner_ref = ?", COLUMNS);
    Ok(conn.query_row(&sql, params![owner_ref], from_row).optional()?)
}

pub fn list_deposits_by_status(
    conn: &Connection,
    status: DepositStatus,
) -> Result<Vec<Deposit>, DepositError> {
    let sql = format!(
        "SELECT {} FROM deposits WHERE status = ? ORDER BY created_at, id",
        COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![status.code()], from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Deposits in `status` whose last update is at or before `cutoff`
pub fn list_stale_deposits(
    conn: &Connection,
    status: DepositStatus,
    cutoff: DateTime<Utc>,
) -> Result<Vec<Deposit>, DepositError> {
    let sql = format!(
        "SELECT {} FROM deposits WHERE status = ?1 AND updated_at <= ?2 ORDER BY updated_at, id",
        COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![status.code(), cutoff.timestamp_millis()], from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Write `deposit` back if nobody else has since.
///
/// Compare-and-swap on `version`. On success the in-memory deposit carries
/// the new version and `updated_at`. The stored swhid is never overwritten
/// once set.
pub fn commit_deposit(
    conn: &Connection,
    deposit: &mut Deposit,
    now: DateTime<Utc>,
) -> Result<(), DepositError> {
    let now = store_precision(now);
    let updated = conn.execute(
        "UPDATE deposits
         SET remote_id = ?1,
             swhid = COALESCE(swhid, ?2),
             status = ?3,
             version = version + 1,
             updated_at = ?4
         WHERE id = ?5 AND version = ?6",
        params![
            deposit.remote_id,
            deposit.swhid,
            deposit.status.code(),
            now.timestamp_millis(),
            deposit.id,
            deposit.version,
        ],
    )?;

    if updated == 0 {
        return match get_deposit(conn, &deposit.id)? {
            Some(current) => Err(DepositError::Conflict(format!(
                "deposit {} was modified concurrently (expected version {}, found {})",
                deposit.id, deposit.version, current.version
            ))),
            None => Err(DepositError::NotFound(format!("deposit {}", deposit.id))),
        };
    }

    deposit.version += 1;
    deposit.updated_at = now;
    debug!(
        id = %deposit.id,
        status = %deposit.status,
        version = deposit.version,
        "Committed deposit"
    );
    Ok(())
}

pub fn count_by_status(conn: &Connection) -> Result<Vec<(DepositStatus, u64)>, DepositError> {
    let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM deposits GROUP BY status")?;
    let rows = stmt.query_map([], |row| {
        let code: String = row.get(0)?;
        let count: i64 = row.get(1)?;
        Ok((code, count))
    })?;

    let mut counts = Vec::new();
    for row in rows {
        let (code, count) = row?;
        if let Some(status) = DepositStatus::from_code(&code) {
            counts.push((status, count as u64));
        }
    }
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema;
    use chrono::Duration;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        schema::init_schema(&conn).unwrap();
        conn
    }

    #[test]
    fn test_insert_and_get() {
        let conn = conn();
        let now = Utc::now();
        let inserted = insert_deposit(&conn, "rec-1", now).unwrap();

        let loaded = get_deposit(&conn, &inserted.id).unwrap().unwrap();
        assert_eq!(loaded.owner_ref, "rec-1");
        assert_eq!(loaded.status, DepositStatus::New);
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.created_at.timestamp_millis(), now.timestamp_millis());

        let by_owner = get_deposit_by_owner(&conn, "rec-1").unwrap().unwrap();
        assert_eq!(by_owner.id, inserted.id);
        assert!(get_deposit(&conn, "missing").unwrap().is_none());
    }

    #[test]
    fn test_owner_is_unique() {
        let conn = conn();
        insert_deposit(&conn, "rec-1", Utc::now()).unwrap();
        let err = insert_deposit(&conn, "rec-1", Utc::now()).unwrap_err();
        assert!(matches!(err, DepositError::Conflict(_)));
    }

    #[test]
    fn test_commit_detects_stale_version() {
        let conn = conn();
        let mut first = insert_deposit(&conn, "rec-1", Utc::now()).unwrap();
        let mut second = first.clone();

        first.remote_id = Some("7".into());
        first.status = DepositStatus::Created;
        commit_deposit(&conn, &mut first, Utc::now()).unwrap();
        assert_eq!(first.version, 2);

        second.status = DepositStatus::Failed;
        let err = commit_deposit(&conn, &mut second, Utc::now()).unwrap_err();
        assert!(matches!(err, DepositError::Conflict(_)));
        assert_eq!(second.version, 1);

        let stored = get_deposit(&conn, &first.id).unwrap().unwrap();
        assert_eq!(stored.status, DepositStatus::Created);
    }

    #[test]
    fn test_commit_never_clears_swhid() {
        let conn = conn();
        let mut d = insert_deposit(&conn, "rec-1", Utc::now()).unwrap();
        d.swhid = Some("swh:1:dir:abcd".into());
        commit_deposit(&conn, &mut d, Utc::now()).unwrap();

        d.swhid = None;
        commit_deposit(&conn, &mut d, Utc::now()).unwrap();

        let stored = get_deposit(&conn, &d.id).unwrap().unwrap();
        assert_eq!(stored.swhid.as_deref(), Some("swh:1:dir:abcd"));
    }

    #[test]
    fn test_list_stale_uses_updated_at() {
        let conn = conn();
        let old = Utc::now() - Duration::hours(48);
        let mut stale = insert_deposit(&conn, "rec-old", old).unwrap();
        stale.remote_id = Some("1".into());
        stale.status = DepositStatus::Waiting;
        commit_deposit(&conn, &mut stale, old).unwrap();

        let mut fresh = insert_deposit(&conn, "rec-new", Utc::now()).unwrap();
        fresh.remote_id = Some("2".into());
        fresh.status = DepositStatus::Waiting;
        commit_deposit(&conn, &mut fresh, Utc::now()).unwrap();

        let cutoff = Utc::now() - Duration::hours(24);
        let found = list_stale_deposits(&conn, DepositStatus::Waiting, cutoff).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].owner_ref, "rec-old");

        let waiting = list_deposits_by_status(&conn, DepositStatus::Waiting).unwrap();
        assert_eq!(waiting.len(), 2);
    }
}
