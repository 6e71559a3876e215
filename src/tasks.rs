//! Background deposit tasks
//!
//! The published-record pipeline, status polling and the periodic cleanup
//! sweep, each run as an independent tokio task. Retry decisions come from
//! [`DepositError::is_retryable`] and the two [`RetryPolicy`]s.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{Config, CreationConfig, PollingConfig};
use crate::error::DepositError;
use crate::models::{Deposit, DepositStatus};
use crate::record::ArchivableRecord;
use crate::services::{DepositService, PollOutcome, RecordIndexer};

/// Exponential backoff with a cap and a bounded number of attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(base: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max_delay,
            max_attempts,
        }
    }

    /// Initial try plus `max_retries` retries, delays doubling from the base
    pub fn creation(config: &CreationConfig) -> Self {
        let base = Duration::from_secs(config.backoff_base_secs);
        let factor = 1u32.checked_shl(config.max_retries).unwrap_or(u32::MAX);
        Self::new(base, base.saturating_mul(factor), config.max_retries + 1)
    }

    pub fn polling(config: &PollingConfig) -> Self {
        Self::new(
            Duration::from_secs(config.backoff_base_secs),
            Duration::from_secs(config.backoff_max_secs),
            config.max_attempts,
        )
    }

    /// `base * 2^attempt`, capped at `max_delay`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max_delay)
    }
}

/// Schedules lifecycle operations for published records
pub struct TaskRunner {
    service: Arc<DepositService>,
    indexer: Arc<dyn RecordIndexer>,
    creation: RetryPolicy,
    polling: RetryPolicy,
    cleanup_interval: Duration,
}

impl TaskRunner {
    pub fn new(service: Arc<DepositService>, indexer: Arc<dyn RecordIndexer>, config: &Config) -> Self {
        Self {
            service,
            indexer,
            creation: RetryPolicy::creation(&config.creation),
            polling: RetryPolicy::polling(&config.polling),
            cleanup_interval: Duration::from_secs(config.cleanup.interval_secs),
        }
    }

    pub fn with_policies(mut self, creation: RetryPolicy, polling: RetryPolicy) -> Self {
        self.creation = creation;
        self.polling = polling;
        self
    }

    pub fn service(&self) -> &Arc<DepositService> {
        &self.service
    }

    /// Archive a newly published record in the background.
    ///
    /// Returns immediately; the handle resolves to the deposit's final state.
    pub fn on_published(
        self: &Arc<Self>,
        record: Arc<dyn ArchivableRecord>,
    ) -> JoinHandle<Result<Deposit, DepositError>> {
        let runner = Arc::clone(self);
        tokio::spawn(async move {
            let owner = record.owner_ref().to_string();
            let result = runner.process_published_record(record.as_ref()).await;
            if let Err(e) = &result {
                error!(owner = %owner, error = %e, "Archiving published record failed");
            }
            result
        })
    }

    /// Create, upload, complete, then poll until the deposit is terminal
    pub async fn process_published_record(
        &self,
        record: &dyn ArchivableRecord,
    ) -> Result<Deposit, DepositError> {
        let deposit = self.create_with_retry(record).await?;

        self.service.upload_files(&deposit.id, record.files()).await?;
        self.service.complete(&deposit.id).await?;

        self.poll_deposit(&deposit.id).await
    }

    async fn create_with_retry(&self, record: &dyn ArchivableRecord) -> Result<Deposit, DepositError> {
        let owner = record.owner_ref();
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.service.create(record).await {
                Ok(deposit) => return Ok(deposit),
                Err(e) if !e.is_retryable() => {
                    warn!(owner = %owner, error = %e, "Deposit creation failed permanently");
                    return Err(e);
                }
                Err(e) if attempt >= self.creation.max_attempts => {
                    error!(owner = %owner, attempts = attempt, error = %e, "Deposit creation retries exhausted");
                    return Err(e);
                }
                Err(e) => {
                    let delay = self.creation.delay_for(attempt - 1);
                    warn!(
                        owner = %owner,
                        attempt = attempt,
                        max_attempts = self.creation.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Deposit creation failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Poll a deposit until it is terminal.
    ///
    /// Transient errors use up an attempt. A permanent error, or running
    /// out of attempts, marks the deposit FAILED.
    pub async fn poll_deposit(&self, id: &str) -> Result<Deposit, DepositError> {
        for attempt in 0..self.polling.max_attempts {
            tokio::time::sleep(self.polling.delay_for(attempt)).await;

            match self.service.poll(id).await {
                Ok(PollOutcome::Succeeded { swhid }) => {
                    info!(deposit_id = %id, swhid = ?swhid, "Deposit succeeded");
                    let deposit = self.service.read(id)?;
                    if swhid.is_some() {
                        self.reindex(&deposit).await;
                    }
                    return Ok(deposit);
                }
                Ok(PollOutcome::Failed { reason }) => {
                    warn!(deposit_id = %id, reason = %reason, "Deposit failed in archive");
                    return self.service.read(id);
                }
                Ok(PollOutcome::Waiting) => {
                    debug!(deposit_id = %id, attempt = attempt + 1, "Deposit still waiting");
                }
                Err(e) if e.is_retryable() => {
                    warn!(deposit_id = %id, attempt = attempt + 1, error = %e, "Status poll failed");
                }
                Err(e) => {
                    error!(deposit_id = %id, error = %e, "Status poll failed permanently, marking deposit failed");
                    self.give_up(id, &format!("status poll failed: {}", e))?;
                    return Err(e);
                }
            }
        }

        warn!(
            deposit_id = %id,
            attempts = self.polling.max_attempts,
            "Status polling exhausted, marking deposit failed"
        );
        self.give_up(
            id,
            &format!("no final status after {} polls", self.polling.max_attempts),
        )
    }

    /// Mark a deposit FAILED unless something else already finished it
    fn give_up(&self, id: &str, reason: &str) -> Result<Deposit, DepositError> {
        let deposit = self.service.read(id)?;
        if deposit.is_terminal() {
            debug!(deposit_id = %id, status = %deposit.status, "Deposit already final");
            return Ok(deposit);
        }
        match self.service.fail(id, reason) {
            Err(DepositError::Conflict(_)) => {
                let current = self.service.read(id)?;
                if current.is_terminal() {
                    Ok(current)
                } else {
                    self.service.fail(id, reason)
                }
            }
            other => other,
        }
    }

    async fn reindex(&self, deposit: &Deposit) {
        if let Err(e) = self.indexer.reindex(&deposit.owner_ref).await {
            error!(owner = %deposit.owner_ref, error = %e, "Record reindex failed");
        }
    }

    /// Restart polling for every WAITING deposit (worker start-up)
    pub fn resume_waiting(
        self: &Arc<Self>,
    ) -> Result<Vec<JoinHandle<Result<Deposit, DepositError>>>, DepositError> {
        let waiting = self.service.list_by_status(DepositStatus::Waiting)?;
        info!(count = waiting.len(), "Resuming status polling");

        Ok(waiting
            .into_iter()
            .map(|deposit| {
                let runner = Arc::clone(self);
                tokio::spawn(async move { runner.poll_deposit(&deposit.id).await })
            })
            .collect())
    }

    /// Run the cleanup sweep every `cleanup.interval_secs`
    pub fn spawn_cleanup_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let runner = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(runner.cleanup_interval);
            loop {
                ticker.tick().await;
                match runner.service.cleanup().await {
                    Ok(report) => debug!(report = ?report, "Cleanup tick"),
                    Err(e) => error!(error = %e, "Cleanup sweep failed"),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ArchiveClient, FileUpload, RawResponse};
    use crate::config::DepositPolicy;
    use crate::db::DepositDb;
    use crate::metadata::{DepositMetadata, Person};
    use crate::record::{PublishedRecord, StoredFile};
    use crate::services::EventBus;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Reports the same status document on every poll
    struct FixedStatus(RawResponse);

    #[async_trait]
    impl ArchiveClient for FixedStatus {
        async fn create_deposit(&self, _: &DepositMetadata) -> Result<RawResponse, DepositError> {
            unreachable!()
        }
        async fn update_files(&self, _: &str, _: FileUpload) -> Result<RawResponse, DepositError> {
            unreachable!()
        }
        async fn complete_deposit(&self, _: &str) -> Result<RawResponse, DepositError> {
            unreachable!()
        }
        async fn get_deposit_status(&self, _: &str) -> Result<RawResponse, DepositError> {
            Ok(self.0.clone())
        }
    }

    /// Fails create a set number of times, then runs a normal deposit
    struct ScriptedArchive {
        create_failures: AtomicUsize,
        create_calls: AtomicUsize,
        status: Result<RawResponse, u16>,
    }

    impl ScriptedArchive {
        fn new(create_failures: usize, status: Result<RawResponse, u16>) -> Self {
            Self {
                create_failures: AtomicUsize::new(create_failures),
                create_calls: AtomicUsize::new(0),
                status,
            }
        }
    }

    #[async_trait]
    impl ArchiveClient for ScriptedArchive {
        async fn create_deposit(&self, _: &DepositMetadata) -> Result<RawResponse, DepositError> {
            self.create_calls.fetch_add(1, Ordering::SeqCst);
            let remaining = self.create_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.create_failures.store(remaining - 1, Ordering::SeqCst);
                return Err(DepositError::Client {
                    status: 500,
                    message: "archive unavailable".into(),
                });
            }
            Ok(status(&[("deposit_id", "42"), ("deposit_status", "partial")]))
        }
        async fn update_files(&self, remote_id: &str, _: FileUpload) -> Result<RawResponse, DepositError> {
            Ok(status(&[("deposit_id", remote_id), ("deposit_status", "partial")]))
        }
        async fn complete_deposit(&self, remote_id: &str) -> Result<RawResponse, DepositError> {
            Ok(status(&[("deposit_id", remote_id), ("deposit_status", "deposited")]))
        }
        async fn get_deposit_status(&self, _: &str) -> Result<RawResponse, DepositError> {
            match &self.status {
                Ok(doc) => Ok(doc.clone()),
                Err(code) => Err(DepositError::Client {
                    status: *code,
                    message: "gone".into(),
                }),
            }
        }
    }

    #[derive(Default)]
    struct CountingIndexer {
        calls: AtomicUsize,
        owners: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RecordIndexer for CountingIndexer {
        async fn reindex(&self, owner_ref: &str) -> Result<(), DepositError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.owners.lock().unwrap().push(owner_ref.to_string());
            Ok(())
        }
    }

    fn status(pairs: &[(&str, &str)]) -> RawResponse {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn waiting_deposit(db: &DepositDb) -> Deposit {
        db.unit_of_work(|uow| {
            let mut d = uow.create("rec-1")?;
            d.mark_created("42")?;
            d.transition_to(DepositStatus::Waiting)?;
            uow.commit(&mut d)?;
            Ok(d)
        })
        .unwrap()
    }

    fn runner(client: RawResponse, indexer: Arc<CountingIndexer>) -> (Arc<TaskRunner>, Arc<DepositDb>) {
        runner_with(Arc::new(FixedStatus(client)), indexer)
    }

    fn runner_with(
        client: Arc<dyn ArchiveClient>,
        indexer: Arc<CountingIndexer>,
    ) -> (Arc<TaskRunner>, Arc<DepositDb>) {
        let db = Arc::new(DepositDb::open_in_memory().unwrap());
        let service = Arc::new(DepositService::new(
            db.clone(),
            client,
            DepositPolicy::default(),
            Arc::new(EventBus::new()),
        ));
        let fast = RetryPolicy::new(Duration::ZERO, Duration::ZERO, 3);
        let runner = TaskRunner::new(service, indexer, &Config::default()).with_policies(fast, fast);
        (Arc::new(runner), db)
    }

    fn published(id: &str) -> PublishedRecord {
        PublishedRecord::new(
            id,
            "software",
            DepositMetadata::new("Tool", vec![Person::new("Ada")]),
        )
        .with_file(StoredFile::from_bytes("code.zip", "application/zip", &b"0123"[..]))
    }

    fn archived() -> RawResponse {
        status(&[
            ("deposit_id", "42"),
            ("deposit_status", "done"),
            ("deposit_swh_id", "swh:1:dir:abcd"),
        ])
    }

    #[test]
    fn test_delay_doubles_until_cap() {
        let policy = RetryPolicy::new(Duration::from_secs(60), Duration::from_secs(600), 5);
        assert_eq!(policy.delay_for(0), Duration::from_secs(60));
        assert_eq!(policy.delay_for(1), Duration::from_secs(120));
        assert_eq!(policy.delay_for(3), Duration::from_secs(480));
        assert_eq!(policy.delay_for(4), Duration::from_secs(600));
        assert_eq!(policy.delay_for(40), Duration::from_secs(600));
    }

    #[test]
    fn test_policies_from_config() {
        let config = Config::default();
        let creation = RetryPolicy::creation(&config.creation);
        assert_eq!(creation.max_attempts, 4);
        assert_eq!(creation.delay_for(2), Duration::from_secs(40));

        let polling = RetryPolicy::polling(&config.polling);
        assert_eq!(polling.max_attempts, 5);
        assert_eq!(polling.max_delay, Duration::from_secs(600));
    }

    #[tokio::test]
    async fn test_poll_exhaustion_marks_failed() {
        let indexer = Arc::new(CountingIndexer::default());
        let (runner, db) = runner(
            status(&[("deposit_id", "42"), ("deposit_status", "loading")]),
            indexer.clone(),
        );
        let deposit = waiting_deposit(&db);

        let finished = runner.poll_deposit(&deposit.id).await.unwrap();
        assert_eq!(finished.status, DepositStatus::Failed);
        assert_eq!(db.get(&deposit.id).unwrap().status, DepositStatus::Failed);
        assert_eq!(indexer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_success_triggers_reindex() {
        let indexer = Arc::new(CountingIndexer::default());
        let (runner, db) = runner(
            status(&[
                ("deposit_id", "42"),
                ("deposit_status", "done"),
                ("deposit_swh_id", "swh:1:dir:abcd"),
            ]),
            indexer.clone(),
        );
        let deposit = waiting_deposit(&db);

        let finished = runner.poll_deposit(&deposit.id).await.unwrap();
        assert_eq!(finished.status, DepositStatus::Success);
        assert_eq!(finished.swhid.as_deref(), Some("swh:1:dir:abcd"));
        assert_eq!(indexer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(*indexer.owners.lock().unwrap(), vec!["rec-1".to_string()]);

        // Polling a finished deposit again reindexes again without changing it
        let again = runner.poll_deposit(&deposit.id).await.unwrap();
        assert_eq!(again.version, finished.version);
        assert_eq!(indexer.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_done_without_swhid_skips_reindex() {
        let indexer = Arc::new(CountingIndexer::default());
        let (runner, db) = runner(
            status(&[("deposit_id", "42"), ("deposit_status", "done")]),
            indexer.clone(),
        );
        let deposit = waiting_deposit(&db);

        let finished = runner.poll_deposit(&deposit.id).await.unwrap();
        assert_eq!(finished.status, DepositStatus::Success);
        assert_eq!(finished.swhid, None);
        assert_eq!(indexer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_permanent_poll_error_marks_failed() {
        let indexer = Arc::new(CountingIndexer::default());
        let archive = Arc::new(ScriptedArchive::new(0, Err(404)));
        let (runner, db) = runner_with(archive, indexer.clone());
        let deposit = waiting_deposit(&db);

        let err = runner.poll_deposit(&deposit.id).await.unwrap_err();
        assert!(matches!(err, DepositError::Client { status: 404, .. }));
        assert_eq!(db.get(&deposit.id).unwrap().status, DepositStatus::Failed);
        assert_eq!(indexer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_give_up_keeps_success_reached_elsewhere() {
        let indexer = Arc::new(CountingIndexer::default());
        let (runner, db) = runner(
            status(&[("deposit_id", "42"), ("deposit_status", "loading")]),
            indexer,
        );
        let mut deposit = waiting_deposit(&db);
        deposit.record_swhid("swh:1:dir:abcd").unwrap();
        db.commit(&mut deposit).unwrap();

        let finished = runner.give_up(&deposit.id, "no final status").unwrap();
        assert_eq!(finished.status, DepositStatus::Success);
        assert_eq!(finished.swhid.as_deref(), Some("swh:1:dir:abcd"));
        assert_eq!(db.get(&deposit.id).unwrap().version, deposit.version);
    }

    #[tokio::test]
    async fn test_create_retries_transient_failures() {
        let indexer = Arc::new(CountingIndexer::default());
        let archive = Arc::new(ScriptedArchive::new(2, Ok(archived())));
        let (runner, db) = runner_with(archive.clone(), indexer.clone());

        let finished = runner.process_published_record(&published("rec-9")).await.unwrap();
        assert_eq!(archive.create_calls.load(Ordering::SeqCst), 3);
        assert_eq!(finished.status, DepositStatus::Success);
        assert_eq!(finished.swhid.as_deref(), Some("swh:1:dir:abcd"));
        assert_eq!(db.stats().unwrap().total, 1);
        assert_eq!(indexer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_create_gives_up_after_max_attempts() {
        let indexer = Arc::new(CountingIndexer::default());
        let archive = Arc::new(ScriptedArchive::new(10, Ok(archived())));
        let (runner, db) = runner_with(archive.clone(), indexer);

        let err = runner.process_published_record(&published("rec-9")).await.unwrap_err();
        assert!(matches!(err, DepositError::Client { status: 500, .. }));
        assert_eq!(archive.create_calls.load(Ordering::SeqCst), 3);
        assert_eq!(db.stats().unwrap().total, 0);
    }

    #[tokio::test]
    async fn test_ineligible_record_is_never_retried() {
        let indexer = Arc::new(CountingIndexer::default());
        let archive = Arc::new(ScriptedArchive::new(0, Ok(archived())));
        let (runner, db) = runner_with(archive.clone(), indexer);

        let err = runner
            .process_published_record(&published("rec-9").without_files())
            .await
            .unwrap_err();
        assert!(matches!(err, DepositError::InvalidRecord(_)));
        assert_eq!(archive.create_calls.load(Ordering::SeqCst), 0);
        assert_eq!(db.stats().unwrap().total, 0);
    }

    #[tokio::test]
    async fn test_existing_deposit_conflict_is_never_retried() {
        let indexer = Arc::new(CountingIndexer::default());
        let archive = Arc::new(ScriptedArchive::new(0, Ok(archived())));
        let (runner, db) = runner_with(archive.clone(), indexer);
        db.create("rec-9").unwrap();

        let err = runner.process_published_record(&published("rec-9")).await.unwrap_err();
        assert!(matches!(err, DepositError::Conflict(_)));
        assert_eq!(archive.create_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_on_published_resolves_to_final_deposit() {
        let indexer = Arc::new(CountingIndexer::default());
        let archive = Arc::new(ScriptedArchive::new(0, Ok(archived())));
        let (runner, db) = runner_with(archive, indexer.clone());

        let handle = runner.on_published(Arc::new(published("rec-9")));
        let finished = handle.await.unwrap().unwrap();

        assert_eq!(finished.owner_ref, "rec-9");
        assert_eq!(finished.status, DepositStatus::Success);
        assert_eq!(db.get_by_owner("rec-9").unwrap().unwrap(), finished);
        assert_eq!(*indexer.owners.lock().unwrap(), vec!["rec-9".to_string()]);
    }

    #[tokio::test]
    async fn test_remote_rejection_stops_polling() {
        let indexer = Arc::new(CountingIndexer::default());
        let (runner, db) = runner(
            status(&[("deposit_id", "42"), ("deposit_status", "rejected")]),
            indexer,
        );
        let deposit = waiting_deposit(&db);

        let finished = runner.poll_deposit(&deposit.id).await.unwrap();
        assert_eq!(finished.status, DepositStatus::Failed);
    }

    #[tokio::test]
    async fn test_resume_waiting_spawns_pollers() {
        let indexer = Arc::new(CountingIndexer::default());
        let (runner, db) = runner(
            status(&[("deposit_id", "42"), ("deposit_status", "done"), ("deposit_swh_id", "swh:1:dir:ab")]),
            indexer.clone(),
        );
        waiting_deposit(&db);

        let handles = runner.resume_waiting().unwrap();
        assert_eq!(handles.len(), 1);
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap().status, DepositStatus::Success);
        }
        assert_eq!(db.stats().unwrap().success, 1);
    }
}
