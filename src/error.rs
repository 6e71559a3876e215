//! Error types for swh-deposit

use thiserror::Error;

use crate::models::DepositStatus;

#[derive(Error, Debug)]
pub enum DepositError {
    /// Record can never be archived as it is (type, files, access, metadata)
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Archive returned HTTP {status}: {message}")]
    Client { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Failed to deserialize archive response: {0}")]
    Deserialize(String),

    #[error("Deposit already failed: {0}")]
    DepositFailed(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unrecognized deposit status: {0}")]
    InvalidStatus(String),

    #[error("Invalid status transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: DepositStatus,
        to: DepositStatus,
    },

    #[error("Database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DepositError {
    /// Whether a scheduler should try the failed operation again.
    ///
    /// Remote 5xx, timeouts and throttling are transient, as are transport
    /// failures and unparseable replies. Everything that describes the record
    /// or the local deposit state is permanent.
    pub fn is_retryable(&self) -> bool {
        match self {
            DepositError::Client { status, .. } => {
                *status >= 500 || *status == 408 || *status == 429
            }
            DepositError::Network(_) | DepositError::Deserialize(_) => true,
            DepositError::Database(_) | DepositError::Io(_) => true,
            _ => false,
        }
    }
}

impl From<rusqlite::Error> for DepositError {
    fn from(e: rusqlite::Error) -> Self {
        DepositError::Database(e.to_string())
    }
}

impl From<reqwest::Error> for DepositError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => DepositError::Client {
                status: status.as_u16(),
                message: e.to_string(),
            },
            None => DepositError::Network(e.to_string()),
        }
    }
}
