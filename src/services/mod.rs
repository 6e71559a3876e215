//! Service layer for swh-deposit
//!
//! Services sit between the entry points (CLI, task runner) and the store.
//! They own:
//! - Eligibility checks
//! - The deposit state machine
//! - Event emission for audit and re-indexing
//!
//! ## Architecture
//!
//! ```text
//! CLI / TaskRunner
//!     ↓
//! DepositService (lifecycle)  →  DepositController  →  ArchiveClient
//!     ↓
//! Repository Layer (db/*.rs)
//!     ↓
//! SQLite Database
//! ```

pub mod events;
pub mod lifecycle;
pub mod status;

pub use events::{spawn_logging_listener, DepositEvent, EventBus, LoggingIndexer, RecordIndexer};
pub use lifecycle::{CleanupReport, DepositService, PollOutcome};
pub use status::{resolve_status, StatusUpdate};

use std::sync::Arc;

use crate::client::ArchiveClient;
use crate::config::Config;
use crate::db::DepositDb;

/// Service container for dependency injection
pub struct Services {
    pub deposits: Arc<DepositService>,
    pub events: Arc<EventBus>,
}

impl Services {
    /// Wire the deposit service to a store and an archive client
    pub fn new(db: Arc<DepositDb>, client: Arc<dyn ArchiveClient>, config: &Config) -> Self {
        let events = Arc::new(EventBus::new());
        let deposits = Arc::new(DepositService::from_config(db, client, config, events.clone()));
        Self { deposits, events }
    }
}
