//! swh-deposit - Software Heritage archival of published records
//!
//! Tracks one deposit per published record and drives it through the
//! SWORD deposit API until the archive assigns a SWHID.
//!
//! ## Lifecycle
//!
//! ```text
//! NEW ──create──► CREATED ──upload + complete──► WAITING ──poll──► SUCCESS
//!  │                 │                              │
//!  └─────────────────┴──────────────────────────────┴─────────────► FAILED
//! ```
//!
//! | Step | Remote call | Local commit |
//! |------|-------------|--------------|
//! | create | POST entry to the collection | NEW + CREATED in one unit of work |
//! | upload | PUT file to the Edit-Media IRI | FAILED only on error |
//! | complete | POST `In-Progress: false` to the SE-IRI | WAITING or FAILED |
//! | sync | GET status IRI | mapped status, swhid |
//!
//! ## Storage Layout
//!
//! ```text
//! ~/.local/share/swh-deposit/
//! ├── deposits.db            # SQLite, one row per deposit
//! └── config.toml            # Configuration
//! ```

pub mod client;
pub mod config;
pub mod controller;
pub mod db;
pub mod error;
pub mod metadata;
pub mod models;
pub mod record;
pub mod services;
pub mod tasks;

// Re-exports
pub use client::{ArchiveClient, FileUpload, RawResponse, SwordClient};
pub use config::Config;
pub use controller::{DepositController, NormalizedResponse};
pub use db::{DbStats, DepositDb, UnitOfWork};
pub use error::DepositError;
pub use metadata::{DepositMetadata, License, Person};
pub use models::{Deposit, DepositStatus};
pub use record::{AccessPolicy, ArchivableRecord, FileHandle, PublishedRecord, RecordFiles, StoredFile};
pub use services::{
    resolve_status, CleanupReport, DepositEvent, DepositService, EventBus, PollOutcome,
    RecordIndexer, Services, StatusUpdate,
};
pub use tasks::{RetryPolicy, TaskRunner};
