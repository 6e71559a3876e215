//! Deposit entity and its status machine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DepositError;

/// Local status of a deposit.
///
/// ```text
/// NEW -> CREATED -> WAITING -> SUCCESS
///   \________\_________\-----> FAILED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DepositStatus {
    /// Created locally, not yet known to the archive
    New,
    /// Created in the archive, files not yet completed
    Created,
    /// Completed and waiting for the archive to load it
    Waiting,
    /// Loaded by the archive, swhid assigned
    Success,
    /// Rejected, expired or abandoned
    Failed,
}

impl DepositStatus {
    pub const ALL: [DepositStatus; 5] = [
        DepositStatus::New,
        DepositStatus::Created,
        DepositStatus::Waiting,
        DepositStatus::Success,
        DepositStatus::Failed,
    ];

    /// Single character code used in the database
    pub fn code(&self) -> &'static str {
        match self {
            DepositStatus::New => "N",
            DepositStatus::Created => "C",
            DepositStatus::Waiting => "W",
            DepositStatus::Success => "S",
            DepositStatus::Failed => "F",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.code() == code)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DepositStatus::New => "NEW",
            DepositStatus::Created => "CREATED",
            DepositStatus::Waiting => "WAITING",
            DepositStatus::Success => "SUCCESS",
            DepositStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DepositStatus::Success | DepositStatus::Failed)
    }

    fn rank(&self) -> u8 {
        match self {
            DepositStatus::New => 0,
            DepositStatus::Created => 1,
            DepositStatus::Waiting => 2,
            DepositStatus::Success => 3,
            DepositStatus::Failed => 3,
        }
    }

    /// Whether `self -> next` is an edge of the lifecycle graph.
    /// Staying in place is not a transition.
    pub fn can_transition_to(&self, next: DepositStatus) -> bool {
        if self.is_terminal() || *self == next {
            return false;
        }
        next == DepositStatus::Failed || next.rank() > self.rank()
    }
}

impl std::fmt::Display for DepositStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Local record of one archival submission for one owned object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deposit {
    pub id: String,
    pub owner_ref: String,
    pub remote_id: Option<String>,
    pub swhid: Option<String>,
    pub status: DepositStatus,
    /// Optimistic concurrency counter, bumped by every commit
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Deposit {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move to `next`, enforcing the lifecycle graph.
    ///
    /// Returns `false` when already in `next`.
    pub fn transition_to(&mut self, next: DepositStatus) -> Result<bool, DepositError> {
        if self.status == next {
            return Ok(false);
        }
        if !self.status.can_transition_to(next) {
            return Err(DepositError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        if next != DepositStatus::Failed && next != DepositStatus::New && self.remote_id.is_none() {
            return Err(DepositError::Internal(format!(
                "deposit {} has no remote id, cannot move to {}",
                self.id, next
            )));
        }
        self.status = next;
        Ok(true)
    }

    /// Attach the archive's identifier and move NEW -> CREATED
    pub fn mark_created(&mut self, remote_id: impl Into<String>) -> Result<(), DepositError> {
        if self.status != DepositStatus::New {
            return Err(DepositError::InvalidTransition {
                from: self.status,
                to: DepositStatus::Created,
            });
        }
        self.remote_id = Some(remote_id.into());
        self.transition_to(DepositStatus::Created)?;
        Ok(())
    }

    /// Record the permanent identifier and force SUCCESS.
    ///
    /// The swhid is set once; a different value for an already archived
    /// deposit is refused.
    pub fn record_swhid(&mut self, swhid: &str) -> Result<bool, DepositError> {
        match &self.swhid {
            Some(existing) if existing == swhid => Ok(false),
            Some(existing) => Err(DepositError::Conflict(format!(
                "deposit {} already has swhid {}",
                self.id, existing
            ))),
            None => {
                self.transition_to(DepositStatus::Success)?;
                self.swhid = Some(swhid.to_string());
                Ok(true)
            }
        }
    }

    /// The archive id, required by every remote operation
    pub fn require_remote_id(&self) -> Result<&str, DepositError> {
        self.remote_id.as_deref().ok_or_else(|| {
            DepositError::Internal(format!("deposit {} has no remote id", self.id))
        })
    }
}
