//! Configuration for swh-deposit

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::DepositError;

/// Default storage directory
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("swh-deposit")
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub policy: DepositPolicy,
    #[serde(default)]
    pub creation: CreationConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub cleanup: CleanupConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding deposits.db
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

/// Where deposits are sent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// SWORD collection IRI, e.g. https://deposit.softwareheritage.org/1/<client>/
    #[serde(default)]
    pub collection_iri: String,

    #[serde(default)]
    pub username: String,

    /// Usually supplied through SWH_DEPOSIT_PASSWORD rather than the file
    #[serde(default, skip_serializing)]
    pub password: Option<String>,

    /// Per-request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Origin URL for deposited records; `{owner}` is replaced by the owner reference
    #[serde(default)]
    pub origin_url_template: Option<String>,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            collection_iri: String::new(),
            username: String::new(),
            password: None,
            timeout_secs: default_timeout(),
            origin_url_template: None,
        }
    }
}

/// Substitute `{owner}` in an origin URL template
pub fn expand_origin_url(template: &str, owner_ref: &str) -> String {
    template.replace("{owner}", owner_ref)
}

/// Which records may be archived
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepositPolicy {
    /// Accepted file extensions, lowercase, without the dot
    #[serde(default = "default_extensions")]
    pub accepted_extensions: BTreeSet<String>,

    /// Accepted declared record types
    #[serde(default = "default_types")]
    pub accepted_types: BTreeSet<String>,

    /// Maximum size of the archived file in bytes
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
}

impl Default for DepositPolicy {
    fn default() -> Self {
        Self {
            accepted_extensions: default_extensions(),
            accepted_types: default_types(),
            max_file_size: default_max_file_size(),
        }
    }
}

/// Retries of the create step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreationConfig {
    #[serde(default = "default_creation_retries")]
    pub max_retries: u32,

    #[serde(default = "default_creation_backoff")]
    pub backoff_base_secs: u64,
}

impl Default for CreationConfig {
    fn default() -> Self {
        Self {
            max_retries: default_creation_retries(),
            backoff_base_secs: default_creation_backoff(),
        }
    }
}

/// Status polling after completion
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    /// First retry delay; doubles every attempt
    #[serde(default = "default_poll_backoff")]
    pub backoff_base_secs: u64,

    /// Upper bound for a single delay
    #[serde(default = "default_poll_backoff_max")]
    pub backoff_max_secs: u64,

    /// Polls before the deposit is given up and marked FAILED
    #[serde(default = "default_poll_attempts")]
    pub max_attempts: u32,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            backoff_base_secs: default_poll_backoff(),
            backoff_max_secs: default_poll_backoff_max(),
            max_attempts: default_poll_attempts(),
        }
    }
}

/// Sweep of deposits stuck in WAITING
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupConfig {
    /// A WAITING deposit not updated for this long is stale
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,

    #[serde(default = "default_cleanup_interval")]
    pub interval_secs: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: default_stale_after(),
            interval_secs: default_cleanup_interval(),
        }
    }
}

impl CleanupConfig {
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

// Defaults
fn default_timeout() -> u64 { 30 }
fn default_extensions() -> BTreeSet<String> {
    ["zip", "tar"].into_iter().map(String::from).collect()
}
fn default_types() -> BTreeSet<String> {
    ["software"].into_iter().map(String::from).collect()
}
fn default_max_file_size() -> u64 { 100 * 1000 * 1000 } // 100MB
fn default_creation_retries() -> u32 { 3 }
fn default_creation_backoff() -> u64 { 10 }
fn default_poll_backoff() -> u64 { 60 }
fn default_poll_backoff_max() -> u64 { 600 }
fn default_poll_attempts() -> u32 { 5 }
fn default_stale_after() -> u64 { 24 * 60 * 60 }
fn default_cleanup_interval() -> u64 { 60 * 60 }

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, DepositError> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| DepositError::Config(e.to_string()))
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), DepositError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| DepositError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject settings that would make every deposit fail
    pub fn validate(&self) -> Result<(), DepositError> {
        if self.policy.accepted_extensions.is_empty() {
            return Err(DepositError::Config("policy.accepted_extensions is empty".into()));
        }
        if self.policy.accepted_types.is_empty() {
            return Err(DepositError::Config("policy.accepted_types is empty".into()));
        }
        if self.policy.max_file_size == 0 {
            return Err(DepositError::Config("policy.max_file_size must be > 0".into()));
        }
        if self.polling.max_attempts == 0 {
            return Err(DepositError::Config("polling.max_attempts must be > 0".into()));
        }
        if !self.archive.collection_iri.is_empty() {
            url::Url::parse(&self.archive.collection_iri).map_err(|e| {
                DepositError::Config(format!(
                    "archive.collection_iri '{}' is not an absolute URL: {}",
                    self.archive.collection_iri, e
                ))
            })?;
        }
        Ok(())
    }
}
