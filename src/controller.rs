//! Deposit controller - normalizes archive responses
//!
//! Every archive call goes through here so the lifecycle only ever sees
//! [`NormalizedResponse`]s or a `Deserialize` error.

use std::sync::Arc;

use serde::Serialize;

use crate::client::{ArchiveClient, FileUpload, RawResponse};
use crate::error::DepositError;
use crate::metadata::DepositMetadata;

/// What the lifecycle needs from an archive reply
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedResponse {
    pub deposit_id: String,
    pub deposit_status: Option<String>,
    pub deposit_swhid: Option<String>,
    pub raw: RawResponse,
}

impl NormalizedResponse {
    /// Free-text explanation the archive attaches to a status
    pub fn status_detail(&self) -> Option<&str> {
        self.raw.get("deposit_status_detail").map(String::as_str)
    }
}

pub struct DepositController {
    client: Arc<dyn ArchiveClient>,
}

impl DepositController {
    pub fn new(client: Arc<dyn ArchiveClient>) -> Self {
        Self { client }
    }

    /// `None` for an empty reply ("nothing to report yet"), otherwise the
    /// normalized fields. A non-empty reply without a deposit id is an error.
    pub fn normalize(raw: RawResponse) -> Result<Option<NormalizedResponse>, DepositError> {
        if raw.is_empty() {
            return Ok(None);
        }

        let deposit_id = raw
            .get("deposit_id")
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| DepositError::Deserialize("Failed to deserialize deposit".into()))?
            .to_string();

        let field = |key: &str| {
            raw.get(key)
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        let deposit_status = field("deposit_status");
        let deposit_swhid = field("deposit_swh_id");

        Ok(Some(NormalizedResponse {
            deposit_id,
            deposit_status,
            deposit_swhid,
            raw,
        }))
    }

    pub async fn create_deposit(
        &self,
        metadata: &DepositMetadata,
    ) -> Result<Option<NormalizedResponse>, DepositError> {
        Self::normalize(self.client.create_deposit(metadata).await?)
    }

    pub async fn update_deposit_files(
        &self,
        remote_id: &str,
        upload: FileUpload,
    ) -> Result<Option<NormalizedResponse>, DepositError> {
        Self::normalize(self.client.update_files(remote_id, upload).await?)
    }

    pub async fn complete_deposit(
        &self,
        remote_id: &str,
    ) -> Result<Option<NormalizedResponse>, DepositError> {
        Self::normalize(self.client.complete_deposit(remote_id).await?)
    }

    pub async fn fetch_deposit_status(
        &self,
        remote_id: &str,
    ) -> Result<Option<NormalizedResponse>, DepositError> {
        Self::normalize(self.client.get_deposit_status(remote_id).await?)
    }
}
