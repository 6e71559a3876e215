//! Deposit service - the deposit lifecycle
//!
//! Drives a deposit through `NEW -> CREATED -> WAITING -> SUCCESS`, or to
//! `FAILED` from any non-terminal state.
//!
//! ## Rules every operation follows
//!
//! - The store is never locked across an archive call. Each operation reads
//!   the deposit, calls the archive, then commits the outcome in a fresh
//!   unit of work.
//! - A `Conflict` from the store means another writer moved the deposit.
//!   The operation stops and returns it; nothing is overwritten.
//! - Failures after creation (upload, complete) are recorded as `FAILED`
//!   before the error is returned.

use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::client::{ArchiveClient, FileUpload};
use crate::config::{expand_origin_url, Config, DepositPolicy};
use crate::controller::{DepositController, NormalizedResponse};
use crate::db::{DbStats, DepositDb};
use crate::error::DepositError;
use crate::models::{Deposit, DepositStatus};
use crate::record::{ArchivableRecord, FileHandle, RecordFiles};

use super::events::{DepositEvent, EventBus};
use super::status::StatusUpdate;

/// Result of one status poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// Not terminal yet; poll again later
    Waiting,
    Succeeded { swhid: Option<String> },
    Failed { reason: String },
}

/// What a cleanup sweep did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    /// Stale WAITING deposits found
    pub examined: usize,
    /// Reached SUCCESS or FAILED through their sync
    pub resolved: usize,
    /// Synced but the archive still reports them in progress
    pub still_waiting: usize,
    /// Marked FAILED because their sync raised
    pub failed: Vec<String>,
    /// Could not even be marked FAILED (e.g. lost a commit race)
    pub errors: usize,
}

/// Lifecycle orchestration over the store and the archive
pub struct DepositService {
    db: Arc<DepositDb>,
    controller: DepositController,
    policy: DepositPolicy,
    stale_after: chrono::Duration,
    origin_url_template: Option<String>,
    events: Arc<EventBus>,
}

impl DepositService {
    pub fn new(
        db: Arc<DepositDb>,
        client: Arc<dyn ArchiveClient>,
        policy: DepositPolicy,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            db,
            controller: DepositController::new(client),
            policy,
            stale_after: chrono::Duration::hours(24),
            origin_url_template: None,
            events,
        }
    }

    pub fn from_config(
        db: Arc<DepositDb>,
        client: Arc<dyn ArchiveClient>,
        config: &Config,
        events: Arc<EventBus>,
    ) -> Self {
        Self::new(db, client, config.policy.clone(), events)
            .with_stale_after(config.cleanup.stale_after())
            .with_origin_url_template(config.archive.origin_url_template.clone())
    }

    /// Age (since last update) at which a WAITING deposit is swept
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = chrono::Duration::seconds(stale_after.as_secs() as i64);
        self
    }

    pub fn with_origin_url_template(mut self, template: Option<String>) -> Self {
        self.origin_url_template = template;
        self
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    // =========================================================================
    // Read Operations
    // =========================================================================

    pub fn read(&self, id: &str) -> Result<Deposit, DepositError> {
        self.db.get(id)
    }

    /// The deposit of an owned object, if it was ever submitted
    pub fn get_record_deposit(&self, owner_ref: &str) -> Result<Option<Deposit>, DepositError> {
        self.db.get_by_owner(owner_ref)
    }

    pub fn list_by_status(&self, status: DepositStatus) -> Result<Vec<Deposit>, DepositError> {
        self.db.list_by_status(status)
    }

    pub fn stats(&self) -> Result<DbStats, DepositError> {
        self.db.stats()
    }

    // =========================================================================
    // Eligibility
    // =========================================================================

    /// Check that `record` can be archived.
    ///
    /// Checks run in order (type, file count, file extension and size,
    /// access) and the first failure is returned.
    pub fn validate_record(&self, record: &dyn ArchivableRecord) -> Result<(), DepositError> {
        match record.declared_type() {
            Some(t) if self.policy.accepted_types.contains(t) => {}
            Some(t) => {
                return Err(DepositError::InvalidRecord(format!(
                    "Record type '{}' is not accepted for archival",
                    t
                )));
            }
            None => {
                return Err(DepositError::InvalidRecord(
                    "Record has no declared type".into(),
                ));
            }
        }

        let file = self.single_file(record.files())?;
        self.check_file(file)?;

        let access = record.access();
        if !access.record_public {
            return Err(DepositError::InvalidRecord("Record metadata is not public".into()));
        }
        if !access.files_public {
            return Err(DepositError::InvalidRecord("Record files are not public".into()));
        }

        Ok(())
    }

    fn single_file<'a>(&self, files: &'a dyn RecordFiles) -> Result<&'a dyn FileHandle, DepositError> {
        let count = files.count();
        if count != 1 {
            return Err(DepositError::InvalidRecord(format!(
                "Record must have exactly one file, found {}",
                count
            )));
        }
        files.single().ok_or_else(|| {
            DepositError::InvalidRecord("Record must have exactly one file".into())
        })
    }

    fn check_file(&self, file: &dyn FileHandle) -> Result<(), DepositError> {
        match file.extension() {
            Some(ext) if self.policy.accepted_extensions.contains(&ext) => {}
            _ => {
                return Err(DepositError::InvalidRecord(format!(
                    "File '{}' does not have an accepted extension ({})",
                    file.filename(),
                    self.policy
                        .accepted_extensions
                        .iter()
                        .cloned()
                        .collect::<Vec<_>>()
                        .join(", ")
                )));
            }
        }

        if file.size() > self.policy.max_file_size {
            return Err(DepositError::InvalidRecord(format!(
                "File '{}' is {} bytes, above the {} byte limit",
                file.filename(),
                file.size(),
                self.policy.max_file_size
            )));
        }

        Ok(())
    }

    // =========================================================================
    // Lifecycle Operations
    // =========================================================================

    /// Create the remote deposit and persist it as CREATED.
    ///
    /// Nothing is stored unless the archive accepted the deposit.
    pub async fn create(&self, record: &dyn ArchivableRecord) -> Result<Deposit, DepositError> {
        let owner_ref = record.owner_ref();
        self.validate_record(record)?;

        if let Some(existing) = self.db.get_by_owner(owner_ref)? {
            return Err(DepositError::Conflict(format!(
                "record {} already has deposit {} ({})",
                owner_ref, existing.id, existing.status
            )));
        }

        let mut metadata = record.metadata()?;
        if metadata.origin_url.is_none() {
            metadata.origin_url = self
                .origin_url_template
                .as_deref()
                .map(|t| expand_origin_url(t, owner_ref));
        }

        debug!(owner = %owner_ref, "Creating remote deposit");
        let response = self
            .controller
            .create_deposit(&metadata)
            .await?
            .ok_or_else(|| {
                DepositError::Deserialize("archive returned an empty deposit receipt".into())
            })?;
        let remote_id = response.deposit_id;

        let deposit = self
            .db
            .unit_of_work(|uow| {
                let mut deposit = uow.create(owner_ref)?;
                deposit.mark_created(remote_id.clone())?;
                uow.commit(&mut deposit)?;
                Ok(deposit)
            })
            .map_err(|e| {
                error!(
                    owner = %owner_ref,
                    remote_id = %remote_id,
                    error = %e,
                    "Remote deposit created but not recorded locally"
                );
                e
            })?;

        self.events.emit(DepositEvent::Created {
            id: deposit.id.clone(),
            owner_ref: deposit.owner_ref.clone(),
            remote_id,
        });

        Ok(deposit)
    }

    /// Send the record's single file to the remote deposit.
    ///
    /// The deposit stays CREATED on success. Any failure marks it FAILED.
    pub async fn upload_files(
        &self,
        id: &str,
        files: &dyn RecordFiles,
    ) -> Result<Deposit, DepositError> {
        let deposit = self.db.get(id)?;
        match deposit.status {
            DepositStatus::Failed => {
                return Err(DepositError::DepositFailed(format!("deposit {}", id)));
            }
            DepositStatus::Created => {}
            other => {
                return Err(DepositError::InvalidTransition {
                    from: other,
                    to: DepositStatus::Waiting,
                });
            }
        }
        let remote_id = deposit.require_remote_id()?.to_string();

        match self.send_file(&remote_id, files).await {
            Ok(()) => {
                info!(deposit_id = %id, remote_id = %remote_id, "Deposit files uploaded");
                Ok(deposit)
            }
            Err(e) => {
                warn!(deposit_id = %id, error = %e, "Deposit file upload failed");
                self.mark_failed(deposit, &format!("file upload failed: {}", e))?;
                Err(e)
            }
        }
    }

    async fn send_file(&self, remote_id: &str, files: &dyn RecordFiles) -> Result<(), DepositError> {
        let file = self.single_file(files)?;
        self.check_file(file)?;

        let mut reader = file.open()?;
        let data = tokio::task::spawn_blocking(move || -> std::io::Result<Vec<u8>> {
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf)?;
            Ok(buf)
        })
        .await
        .map_err(|e| DepositError::Internal(format!("file read task failed: {}", e)))??;

        if data.len() as u64 != file.size() {
            return Err(DepositError::InvalidRecord(format!(
                "File '{}' declared {} bytes but {} were read",
                file.filename(),
                file.size(),
                data.len()
            )));
        }

        let upload = FileUpload {
            filename: file.filename().to_string(),
            content_type: file.content_type().to_string(),
            size: file.size(),
            checksum: file.checksum().to_string(),
            body: Bytes::from(data),
        };
        self.controller.update_deposit_files(remote_id, upload).await?;
        Ok(())
    }

    /// Tell the archive the upload is finished and move to WAITING.
    ///
    /// Commits exactly once: WAITING on success, FAILED on error. Calling it
    /// on a WAITING or SUCCESS deposit does nothing.
    pub async fn complete(&self, id: &str) -> Result<Deposit, DepositError> {
        let mut deposit = self.db.get(id)?;
        match deposit.status {
            DepositStatus::Failed => {
                return Err(DepositError::DepositFailed(format!("deposit {}", id)));
            }
            DepositStatus::Waiting | DepositStatus::Success => {
                debug!(deposit_id = %id, status = %deposit.status, "Deposit already completed");
                return Ok(deposit);
            }
            DepositStatus::New => {
                return Err(DepositError::InvalidTransition {
                    from: DepositStatus::New,
                    to: DepositStatus::Waiting,
                });
            }
            DepositStatus::Created => {}
        }
        let remote_id = deposit.require_remote_id()?.to_string();

        match self.controller.complete_deposit(&remote_id).await {
            Ok(_) => {
                let from = deposit.status;
                deposit.transition_to(DepositStatus::Waiting)?;
                self.db.commit(&mut deposit)?;
                info!(deposit_id = %id, remote_id = %remote_id, "Deposit completed, waiting for archive");
                self.emit_transition(&deposit, from, None);
                Ok(deposit)
            }
            Err(e) => {
                warn!(deposit_id = %id, error = %e, "Deposit completion failed");
                self.mark_failed(deposit, &format!("completion failed: {}", e))?;
                Err(e)
            }
        }
    }

    /// Pull the remote status and apply it.
    ///
    /// `Ok(None)` when the deposit does not exist. Terminal deposits are
    /// returned as they are, without asking the archive.
    pub async fn sync_status(&self, id: &str) -> Result<Option<Deposit>, DepositError> {
        let deposit = match self.db.get(id) {
            Ok(d) => d,
            Err(DepositError::NotFound(_)) => {
                debug!(deposit_id = %id, "No deposit to sync");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        if deposit.is_terminal() {
            return Ok(Some(deposit));
        }
        let Some(remote_id) = deposit.remote_id.clone() else {
            debug!(deposit_id = %id, "Deposit not created remotely yet");
            return Ok(Some(deposit));
        };

        match self.controller.fetch_deposit_status(&remote_id).await? {
            Some(response) => self.apply_status(deposit, &response).map(Some),
            None => {
                debug!(deposit_id = %id, "Archive has no status for deposit yet");
                Ok(Some(deposit))
            }
        }
    }

    /// Apply a normalized archive response to `deposit`.
    ///
    /// A swhid in the response wins over the reported status.
    pub fn apply_status(
        &self,
        mut deposit: Deposit,
        response: &NormalizedResponse,
    ) -> Result<Deposit, DepositError> {
        if let Some(swhid) = response.deposit_swhid.as_deref() {
            match deposit.swhid.as_deref() {
                None => return self.commit_swhid(deposit, swhid),
                Some(existing) if existing != swhid => {
                    warn!(
                        deposit_id = %deposit.id,
                        recorded = %existing,
                        reported = %swhid,
                        "Archive reports a different swhid, keeping the recorded one"
                    );
                }
                Some(_) => {}
            }
        }

        match response.deposit_status.as_deref() {
            Some(remote) => {
                if self.update_status(&mut deposit, remote)? && deposit.status == DepositStatus::Failed {
                    warn!(
                        deposit_id = %deposit.id,
                        remote_status = %remote,
                        detail = response.status_detail().unwrap_or("none given"),
                        "Archive rejected deposit"
                    );
                }
            }
            None => {
                warn!(deposit_id = %deposit.id, "Archive response carries no deposit status");
            }
        }
        Ok(deposit)
    }

    /// Set the status of `deposit`, committing only if it changes.
    ///
    /// Accepts a raw archive status (resolved through the mapping table) or
    /// a local status. Returns whether a commit happened. Unknown archive
    /// statuses are logged and ignored.
    pub fn update_status(
        &self,
        deposit: &mut Deposit,
        update: impl Into<StatusUpdate>,
    ) -> Result<bool, DepositError> {
        let update = update.into();
        let Some(next) = update.resolve() else {
            warn!(deposit_id = %deposit.id, update = ?update, "Ignoring unknown deposit status");
            return Ok(false);
        };
        if deposit.status == next {
            return Ok(false);
        }

        let from = deposit.status;
        let mut updated = deposit.clone();
        updated.transition_to(next)?;
        self.db.commit(&mut updated)?;
        *deposit = updated;

        info!(deposit_id = %deposit.id, from = %from, to = %next, "Deposit status updated");
        let reason = match &update {
            StatusUpdate::Remote(value) => format!("archive reported '{}'", value),
            StatusUpdate::Local(_) => "status set locally".to_string(),
        };
        self.emit_transition(deposit, from, Some(&reason));
        Ok(true)
    }

    /// Record the archive identifier and force SUCCESS
    pub fn update_swhid(&self, id: &str, swhid: &str) -> Result<Deposit, DepositError> {
        let deposit = self.db.get(id)?;
        self.commit_swhid(deposit, swhid)
    }

    fn commit_swhid(&self, deposit: Deposit, swhid: &str) -> Result<Deposit, DepositError> {
        let from = deposit.status;
        let mut updated = deposit.clone();
        if !updated.record_swhid(swhid)? {
            return Ok(deposit);
        }
        self.db.commit(&mut updated)?;

        info!(deposit_id = %updated.id, swhid = %swhid, "Deposit archived");
        self.emit_transition(&updated, from, None);
        Ok(updated)
    }

    /// One status poll, classified for the scheduler
    pub async fn poll(&self, id: &str) -> Result<PollOutcome, DepositError> {
        let deposit = self
            .sync_status(id)
            .await?
            .ok_or_else(|| DepositError::NotFound(format!("deposit {}", id)))?;

        Ok(match deposit.status {
            DepositStatus::Success => PollOutcome::Succeeded {
                swhid: deposit.swhid,
            },
            DepositStatus::Failed => PollOutcome::Failed {
                reason: format!("deposit {} was marked FAILED", deposit.id),
            },
            _ => PollOutcome::Waiting,
        })
    }

    /// Force a deposit to FAILED. Already FAILED is a no-op.
    pub fn fail(&self, id: &str, reason: &str) -> Result<Deposit, DepositError> {
        let deposit = self.db.get(id)?;
        self.mark_failed(deposit, reason)
    }

    fn mark_failed(&self, deposit: Deposit, reason: &str) -> Result<Deposit, DepositError> {
        let from = deposit.status;
        let mut updated = deposit.clone();
        if !updated.transition_to(DepositStatus::Failed)? {
            return Ok(deposit);
        }
        self.db.commit(&mut updated)?;
        self.emit_transition(&updated, from, Some(reason));
        Ok(updated)
    }

    /// Sweep stale WAITING deposits, see [`Self::cleanup_at`]
    pub async fn cleanup(&self) -> Result<CleanupReport, DepositError> {
        self.cleanup_at(Utc::now()).await
    }

    /// Re-sync every WAITING deposit not updated since `now - stale_after`.
    ///
    /// A deposit whose sync raises is marked FAILED. One deposit's failure
    /// never stops the sweep.
    pub async fn cleanup_at(&self, now: DateTime<Utc>) -> Result<CleanupReport, DepositError> {
        let cutoff = now - self.stale_after;
        let stale = self.db.list_stale(DepositStatus::Waiting, cutoff)?;

        let mut report = CleanupReport {
            examined: stale.len(),
            ..Default::default()
        };
        if stale.is_empty() {
            return Ok(report);
        }
        info!(count = stale.len(), cutoff = %cutoff, "Sweeping stale deposits");

        for deposit in stale {
            match self.sync_status(&deposit.id).await {
                Ok(Some(synced)) if synced.is_terminal() => report.resolved += 1,
                Ok(Some(_)) => report.still_waiting += 1,
                Ok(None) => {}
                Err(e) => {
                    error!(deposit_id = %deposit.id, error = %e, "Stale deposit sync failed");
                    match self.fail(&deposit.id, &format!("sync failed during cleanup: {}", e)) {
                        Ok(_) => report.failed.push(deposit.id),
                        Err(fail_err) => {
                            error!(deposit_id = %deposit.id, error = %fail_err, "Could not mark stale deposit failed");
                            report.errors += 1;
                        }
                    }
                }
            }
        }

        info!(
            examined = report.examined,
            resolved = report.resolved,
            failed = report.failed.len(),
            "Cleanup sweep finished"
        );
        Ok(report)
    }

    fn emit_transition(&self, deposit: &Deposit, from: DepositStatus, reason: Option<&str>) {
        self.events.emit(DepositEvent::StatusChanged {
            id: deposit.id.clone(),
            from,
            to: deposit.status,
        });
        match deposit.status {
            DepositStatus::Success => self.events.emit(DepositEvent::Succeeded {
                id: deposit.id.clone(),
                owner_ref: deposit.owner_ref.clone(),
                swhid: deposit.swhid.clone(),
            }),
            DepositStatus::Failed => self.events.emit(DepositEvent::Failed {
                id: deposit.id.clone(),
                owner_ref: deposit.owner_ref.clone(),
                reason: reason.unwrap_or("unknown").to_string(),
            }),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::RawResponse;
    use crate::metadata::{DepositMetadata, Person};
    use crate::record::{AccessPolicy, PublishedRecord, StoredFile};
    use async_trait::async_trait;

    /// Client for tests that must never reach the archive
    struct Offline;

    #[async_trait]
    impl ArchiveClient for Offline {
        async fn create_deposit(&self, _: &DepositMetadata) -> Result<RawResponse, DepositError> {
            Err(DepositError::Network("offline".into()))
        }
        async fn update_files(&self, _: &str, _: FileUpload) -> Result<RawResponse, DepositError> {
            Err(DepositError::Network("offline".into()))
        }
        async fn complete_deposit(&self, _: &str) -> Result<RawResponse, DepositError> {
            Err(DepositError::Network("offline".into()))
        }
        async fn get_deposit_status(&self, _: &str) -> Result<RawResponse, DepositError> {
            Err(DepositError::Network("offline".into()))
        }
    }

    fn service() -> DepositService {
        let db = Arc::new(DepositDb::open_in_memory().unwrap());
        let mut policy = DepositPolicy::default();
        policy.max_file_size = 16;
        DepositService::new(db, Arc::new(Offline), policy, Arc::new(EventBus::new()))
    }

    fn record() -> PublishedRecord {
        PublishedRecord::new(
            "rec-1",
            "software",
            DepositMetadata::new("Tool", vec![Person::new("Ada")]),
        )
        .with_file(StoredFile::from_bytes("code.zip", "application/zip", &b"0123"[..]))
    }

    fn reason(result: Result<(), DepositError>) -> String {
        match result {
            Err(DepositError::InvalidRecord(reason)) => reason,
            other => panic!("expected InvalidRecord, got {:?}", other),
        }
    }

    #[test]
    fn test_eligible_record_passes() {
        assert!(service().validate_record(&record()).is_ok());
    }

    #[test]
    fn test_each_check_names_its_failure() {
        let svc = service();

        let mut wrong_type = record();
        wrong_type.resource_type = Some("dataset".into());
        assert!(reason(svc.validate_record(&wrong_type)).contains("dataset"));

        let two_files = record().with_file(StoredFile::from_bytes("b.zip", "application/zip", &b"x"[..]));
        assert!(reason(svc.validate_record(&two_files)).contains("exactly one file"));

        let mut bad_ext = record();
        bad_ext.files.entries = vec![StoredFile::from_bytes("code.rar", "application/x-rar", &b"x"[..])];
        assert!(reason(svc.validate_record(&bad_ext)).contains("extension"));

        let mut too_big = record();
        too_big.files.entries = vec![StoredFile::from_bytes("code.tar", "application/x-tar", vec![0u8; 17])];
        assert!(reason(svc.validate_record(&too_big)).contains("limit"));

        let private = record().with_access(AccessPolicy {
            record_public: true,
            files_public: false,
        });
        assert!(reason(svc.validate_record(&private)).contains("files are not public"));
    }

    #[test]
    fn test_first_failing_check_wins() {
        let mut record = record()
            .without_files()
            .with_access(AccessPolicy { record_public: false, files_public: false });
        record.resource_type = Some("dataset".into());
        assert!(reason(service().validate_record(&record)).contains("type"));
    }

    #[tokio::test]
    async fn test_create_failure_leaves_no_row() {
        let svc = service();
        let err = svc.create(&record()).await.unwrap_err();
        assert!(matches!(err, DepositError::Network(_)));
        assert!(svc.get_record_deposit("rec-1").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sync_missing_deposit_is_none() {
        assert!(service().sync_status("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cleanup_with_nothing_stale() {
        let report = service().cleanup().await.unwrap();
        assert_eq!(report, CleanupReport::default());
    }
}
