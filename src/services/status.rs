//! Remote status vocabulary and its mapping onto local statuses

use std::str::FromStr;

use crate::error::DepositError;
use crate::models::DepositStatus;

/// Local status for a remote deposit status, `None` when the value means
/// nothing to us and no transition should happen.
///
/// Case-sensitive: the archive sends lowercase values.
pub fn resolve_status(remote: &str) -> Option<DepositStatus> {
    match remote {
        "deposited" | "verified" | "partial" | "loading" => Some(DepositStatus::Waiting),
        "rejected" | "expired" | "failed" => Some(DepositStatus::Failed),
        "done" => Some(DepositStatus::Success),
        _ => None,
    }
}

/// Input accepted by `DepositService::update_status`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusUpdate {
    /// A raw status string as reported by the archive
    Remote(String),
    /// An already resolved local status
    Local(DepositStatus),
}

impl StatusUpdate {
    /// The local status this update asks for, if any
    pub fn resolve(&self) -> Option<DepositStatus> {
        match self {
            StatusUpdate::Remote(value) => resolve_status(value),
            StatusUpdate::Local(status) => Some(*status),
        }
    }
}

impl From<DepositStatus> for StatusUpdate {
    fn from(status: DepositStatus) -> Self {
        StatusUpdate::Local(status)
    }
}

impl From<&str> for StatusUpdate {
    fn from(value: &str) -> Self {
        StatusUpdate::Remote(value.to_string())
    }
}

impl From<String> for StatusUpdate {
    fn from(value: String) -> Self {
        StatusUpdate::Remote(value)
    }
}

/// Parses operator input: a local name (`WAITING`), a local code (`W`) or a
/// remote value from the mapping table (`done`).
impl FromStr for StatusUpdate {
    type Err = DepositError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(status) = DepositStatus::ALL
            .into_iter()
            .find(|st| st.as_str().eq_ignore_ascii_case(s) || st.code() == s)
        {
            return Ok(StatusUpdate::Local(status));
        }
        if resolve_status(s).is_some() {
            return Ok(StatusUpdate::Remote(s.to_string()));
        }
        Err(DepositError::InvalidStatus(s.to_string()))
    }
}

impl FromStr for DepositStatus {
    type Err = DepositError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.parse::<StatusUpdate>()? {
            StatusUpdate::Local(status) => Ok(status),
            StatusUpdate::Remote(value) => Err(DepositError::InvalidStatus(value)),
        }
    }
}
