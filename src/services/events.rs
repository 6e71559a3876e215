//! Event system for deposit lifecycle operations
//!
//! The lifecycle emits a [`DepositEvent`] after every committed change.
//! Listeners use them for:
//! - Audit logging
//! - Re-indexing archived records

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

use crate::error::DepositError;
use crate::models::DepositStatus;

/// Events emitted by the deposit service
#[derive(Debug, Clone)]
pub enum DepositEvent {
    Created {
        id: String,
        owner_ref: String,
        remote_id: String,
    },
    StatusChanged {
        id: String,
        from: DepositStatus,
        to: DepositStatus,
    },
    Succeeded {
        id: String,
        owner_ref: String,
        swhid: Option<String>,
    },
    Failed {
        id: String,
        owner_ref: String,
        reason: String,
    },
}

/// Event bus for broadcasting deposit events
pub struct EventBus {
    sender: broadcast::Sender<DepositEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all subscribers
    pub fn emit(&self, event: DepositEvent) {
        trace!(event = ?event, "Emitting deposit event");
        // No subscribers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DepositEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

fn log_event(event: &DepositEvent) {
    match event {
        DepositEvent::Created { id, owner_ref, remote_id } => {
            info!(deposit_id = %id, owner = %owner_ref, remote_id = %remote_id, "Deposit created");
        }
        DepositEvent::StatusChanged { id, from, to } => {
            debug!(deposit_id = %id, from = %from, to = %to, "Deposit status changed");
        }
        DepositEvent::Succeeded { id, owner_ref, swhid } => {
            info!(deposit_id = %id, owner = %owner_ref, swhid = ?swhid, "Deposit archived");
        }
        DepositEvent::Failed { id, owner_ref, reason } => {
            warn!(deposit_id = %id, owner = %owner_ref, reason = %reason, "Deposit failed");
        }
    }
}

/// Spawn a background task that logs all events
pub fn spawn_logging_listener(event_bus: Arc<EventBus>) -> tokio::task::JoinHandle<()> {
    let mut receiver = event_bus.subscribe();

    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => log_event(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(skipped = n, "Event listener lagged, skipped events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Event bus closed, stopping listener");
                    break;
                }
            }
        }
    })
}

/// Downstream search index that must learn about new swhids.
///
/// Called once a deposit succeeds; may be called again for the same owner
/// and must tolerate it.
#[async_trait]
pub trait RecordIndexer: Send + Sync {
    async fn reindex(&self, owner_ref: &str) -> Result<(), DepositError>;
}

/// Indexer for deployments without a search index
pub struct LoggingIndexer;

#[async_trait]
impl RecordIndexer for LoggingIndexer {
    async fn reindex(&self, owner_ref: &str) -> Result<(), DepositError> {
        info!(owner = %owner_ref, "Record reindex requested");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn test_event_bus_emit_receive() {
        let bus = EventBus::new();
        let mut receiver = bus.subscribe();

        bus.emit(DepositEvent::StatusChanged {
            id: "d-1".into(),
            from: DepositStatus::Created,
            to: DepositStatus::Waiting,
        });

        let event = timeout(Duration::from_millis(100), receiver.recv())
            .await
            .expect("timeout")
            .expect("receive error");

        match event {
            DepositEvent::StatusChanged { id, to, .. } => {
                assert_eq!(id, "d-1");
                assert_eq!(to, DepositStatus::Waiting);
            }
            _ => panic!("Wrong event type"),
        }
    }

    #[test]
    fn test_event_bus_no_subscribers() {
        let bus = EventBus::new();
        assert_eq!(bus.subscriber_count(), 0);
        bus.emit(DepositEvent::Failed {
            id: "d-1".into(),
            owner_ref: "rec-1".into(),
            reason: "rejected".into(),
        });
    }

    #[tokio::test]
    async fn test_logging_indexer_is_idempotent() {
        let indexer = LoggingIndexer;
        assert!(indexer.reindex("rec-1").await.is_ok());
        assert!(indexer.reindex("rec-1").await.is_ok());
    }
}
