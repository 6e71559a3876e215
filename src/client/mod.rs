//! Archive client - protocol-facing side of a deposit
//!
//! [`ArchiveClient`] is the seam between the lifecycle and the archive.
//! [`SwordClient`] talks SWORD v2 to a Software Heritage deposit endpoint;
//! tests substitute their own implementation.

pub mod atom;
pub mod sword;

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::DepositError;
use crate::metadata::DepositMetadata;

pub use sword::SwordClient;

/// Flattened archive response: element names to text, `link:{rel}` to hrefs.
/// Empty when the archive sent no body.
pub type RawResponse = BTreeMap<String, String>;

/// One file to attach to a remote deposit
#[derive(Debug, Clone)]
pub struct FileUpload {
    pub filename: String,
    pub content_type: String,
    pub size: u64,
    /// Algorithm-prefixed digest, e.g. `md5:<hex>`
    pub checksum: String,
    pub body: Bytes,
}

impl FileUpload {
    /// Hex MD5 for the `Content-MD5` header, if the checksum is MD5
    pub fn md5_hex(&self) -> Option<&str> {
        self.checksum.strip_prefix("md5:")
    }
}

#[async_trait]
pub trait ArchiveClient: Send + Sync {
    /// Create an in-progress deposit in the collection
    async fn create_deposit(&self, metadata: &DepositMetadata) -> Result<RawResponse, DepositError>;

    /// Attach the archive file to an in-progress deposit
    async fn update_files(&self, remote_id: &str, upload: FileUpload) -> Result<RawResponse, DepositError>;

    /// Mark the upload finished so the archive starts loading
    async fn complete_deposit(&self, remote_id: &str) -> Result<RawResponse, DepositError>;

    async fn get_deposit_status(&self, remote_id: &str) -> Result<RawResponse, DepositError>;
}
