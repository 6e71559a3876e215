//! SQLite store for deposit state
//!
//! One row per deposit, unique on the owner reference and indexed on status
//! for the cleanup sweep.
//!
//! ## Concurrency
//!
//! Writers never lock a row. Each write is a compare-and-swap on the
//! deposit's `version`; a writer that lost the race gets
//! `DepositError::Conflict` and must re-read. Callers must not hold a
//! [`UnitOfWork`] across a network call: read, release, call the archive,
//! then open a new unit of work to commit the result.

pub mod deposits;
pub mod schema;

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, Transaction};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::DepositError;
use crate::models::{Deposit, DepositStatus};

/// SQLite database holding deposits
pub struct DepositDb {
    conn: Mutex<Connection>,
}

impl DepositDb {
    /// Open or create the deposit database in `storage_dir`
    pub fn open(storage_dir: &Path) -> Result<Self, DepositError> {
        std::fs::create_dir_all(storage_dir)?;
        let db_path = storage_dir.join("deposits.db");
        info!("Opening SQLite database at {:?}", db_path);

        let conn = Connection::open(&db_path)
            .map_err(|e| DepositError::Database(format!("Failed to open SQLite: {}", e)))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| DepositError::Database(format!("Failed to set PRAGMA: {}", e)))?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;

        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self, DepositError> {
        debug!("Opening in-memory SQLite database");

        let conn = Connection::open_in_memory().map_err(|e| {
            DepositError::Database(format!("Failed to open in-memory SQLite: {}", e))
        })?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;

        Ok(db)
    }

    fn init_schema(&self) -> Result<(), DepositError> {
        let conn = self.lock()?;
        schema::init_schema(&conn)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, DepositError> {
        self.conn
            .lock()
            .map_err(|e| DepositError::Internal(format!("Lock poisoned: {}", e)))
    }

    /// Run a read-only closure against the connection
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, DepositError>
    where
        F: FnOnce(&Connection) -> Result<T, DepositError>,
    {
        let conn = self.lock()?;
        f(&conn)
    }

    /// Run `work` inside a transaction.
    ///
    /// Commits when `work` returns `Ok`. Any error, panic or early return
    /// drops the transaction, which rolls it back.
    pub fn unit_of_work<F, T>(&self, work: F) -> Result<T, DepositError>
    where
        F: FnOnce(&mut UnitOfWork<'_>) -> Result<T, DepositError>,
    {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut uow = UnitOfWork { tx };

        let out = work(&mut uow)?;

        uow.tx.commit()?;
        Ok(out)
    }

    // =========================================================================
    // Single-operation shortcuts
    // =========================================================================

    /// Insert a NEW deposit for `owner_ref`
    pub fn create(&self, owner_ref: &str) -> Result<Deposit, DepositError> {
        self.unit_of_work(|uow| uow.create(owner_ref))
    }

    /// Get a deposit by local id, `NotFound` if absent
    pub fn get(&self, id: &str) -> Result<Deposit, DepositError> {
        self.with_conn(|conn| deposits::get_deposit(conn, id))?
            .ok_or_else(|| DepositError::NotFound(format!("deposit {}", id)))
    }

    pub fn get_by_owner(&self, owner_ref: &str) -> Result<Option<Deposit>, DepositError> {
        self.with_conn(|conn| deposits::get_deposit_by_owner(conn, owner_ref))
    }

    pub fn list_by_status(&self, status: DepositStatus) -> Result<Vec<Deposit>, DepositError> {
        self.with_conn(|conn| deposits::list_deposits_by_status(conn, status))
    }

    /// Deposits in `status` not updated since `cutoff`
    pub fn list_stale(
        &self,
        status: DepositStatus,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Deposit>, DepositError> {
        self.with_conn(|conn| deposits::list_stale_deposits(conn, status, cutoff))
    }

    /// Compare-and-swap `deposit` into the store
    pub fn commit(&self, deposit: &mut Deposit) -> Result<(), DepositError> {
        self.unit_of_work(|uow| uow.commit(deposit))
    }

    /// Get database statistics
    pub fn stats(&self) -> Result<DbStats, DepositError> {
        let counts = self.with_conn(deposits::count_by_status)?;

        let mut stats = DbStats::default();
        for (status, count) in counts {
            stats.total += count;
            match status {
                DepositStatus::New => stats.new = count,
                DepositStatus::Created => stats.created = count,
                DepositStatus::Waiting => stats.waiting = count,
                DepositStatus::Success => stats.success = count,
                DepositStatus::Failed => stats.failed = count,
            }
        }
        Ok(stats)
    }
}

/// A transaction scoped to one group of deposit writes
pub struct UnitOfWork<'conn> {
    tx: Transaction<'conn>,
}

impl UnitOfWork<'_> {
    pub fn create(&mut self, owner_ref: &str) -> Result<Deposit, DepositError> {
        deposits::insert_deposit(&self.tx, owner_ref, Utc::now())
    }

    pub fn commit(&mut self, deposit: &mut Deposit) -> Result<(), DepositError> {
        deposits::commit_deposit(&self.tx, deposit, Utc::now())
    }
}

/// Deposit counts per status
#[derive(Debug, Clone, Default, Serialize)]
pub struct DbStats {
    pub total: u64,
    pub new: u64,
    pub created: u64,
    pub waiting: u64,
    pub success: u64,
    pub failed: u64,
}
