//! Store change observer
//!
//! Watches the lease store's change stream and publishes
//! [`PoolEvent::WorkerLeased`] for every RUNNING -> ASSIGNED edge. Launch
//! completions, failures, inserts and deletes are ignored.

use std::sync::Arc;

use futures::stream::{BoxStream, StreamExt};
use tracing::{debug, info, warn};

use super::bus::{EventBus, PoolEvent};
use crate::persistence::{RecordChange, StoreError};
use crate::record::{WorkerId, WorkerStatus};

pub struct ChangeObserver {
    bus: Arc<dyn EventBus>,
}

impl ChangeObserver {
    pub fn new(bus: Arc<dyn EventBus>) -> Self {
        Self { bus }
    }

    /// The leased worker, if `change` is a RUNNING -> ASSIGNED edge
    pub fn leased_worker(change: &RecordChange) -> Option<WorkerId> {
        match change.status_edge()? {
            (WorkerStatus::Running, WorkerStatus::Assigned) => {
                change.new_image.as_ref().map(|r| r.worker_id.clone())
            }
            _ => None,
        }
    }

    /// Publish an event for `change` if it qualifies
    ///
    /// Returns whether an event was published. A failed publish is logged,
    /// not returned.
    pub async fn observe(&self, change: &RecordChange) -> bool {
        let Some(worker_id) = Self::leased_worker(change) else {
            return false;
        };

        match self.bus.publish(PoolEvent::worker_leased(worker_id.clone())).await {
            Ok(()) => {
                debug!(%worker_id, "published worker_leased");
                true
            }
            Err(e) => {
                warn!(%worker_id, error = %e, "failed_event_publish");
                false
            }
        }
    }

    /// Observe `changes` until the stream ends; returns the number of events
    /// published
    pub async fn run(
        &self,
        mut changes: BoxStream<'static, Result<RecordChange, StoreError>>,
    ) -> usize {
        let mut published = 0;
        while let Some(item) = changes.next().await {
            match item {
                Ok(change) => {
                    if self.observe(&change).await {
                        published += 1;
                    }
                }
                Err(e) => warn!(error = %e, "change stream error"),
            }
        }
        info!(published, "change stream ended");
        published
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::InMemoryEventBus;
    use crate::record::{FieldUpdates, WorkerRecord, DEFAULT_PARTITION};
    use chrono::Utc;

    fn record(status: WorkerStatus) -> WorkerRecord {
        let mut record = WorkerRecord::launching(DEFAULT_PARTITION, WorkerId::new("task_1"));
        let updates = match status {
            WorkerStatus::Launching => FieldUpdates::new(),
            WorkerStatus::Running => FieldUpdates::running("1.2.3.4"),
            WorkerStatus::Assigned => {
                FieldUpdates::running("1.2.3.4").with_assigned_to("userA").with_status(status)
            }
            WorkerStatus::Error => FieldUpdates::error("boom"),
        };
        record.apply(&updates, Utc::now());
        record
    }

    #[test]
    fn test_only_running_to_assigned_qualifies() {
        use WorkerStatus::*;

        let lease = RecordChange::modified(record(Running), record(Assigned));
        assert_eq!(
            ChangeObserver::leased_worker(&lease),
            Some(WorkerId::new("task_1"))
        );

        for change in [
            RecordChange::modified(record(Launching), record(Running)),
            RecordChange::modified(record(Launching), record(Error)),
            RecordChange::modified(record(Running), record(Running)),
            RecordChange::inserted(record(Assigned)),
            RecordChange::removed(record(Assigned)),
        ] {
            assert_eq!(ChangeObserver::leased_worker(&change), None, "{change:?}");
        }
    }

    #[tokio::test]
    async fn test_publish_failure_is_not_fatal() {
        // No subscriber: every publish fails
        let observer = ChangeObserver::new(Arc::new(InMemoryEventBus::new()));
        let changes = futures::stream::iter(vec![
            Ok(RecordChange::modified(
                record(WorkerStatus::Running),
                record(WorkerStatus::Assigned),
            )),
            Err(StoreError::Database("feed hiccup".into())),
            Ok(RecordChange::modified(
                record(WorkerStatus::Running),
                record(WorkerStatus::Assigned),
            )),
        ])
        .boxed();

        assert_eq!(observer.run(changes).await, 0);
    }

    #[tokio::test]
    async fn test_run_publishes_each_delivery() {
        let bus = Arc::new(InMemoryEventBus::new());
        let mut events = bus.subscribe();
        let observer = ChangeObserver::new(bus.clone());

        let lease = RecordChange::modified(record(WorkerStatus::Running), record(WorkerStatus::Assigned));
        let changes = futures::stream::iter(vec![
            Ok(lease.clone()),
            Ok(RecordChange::modified(
                record(WorkerStatus::Launching),
                record(WorkerStatus::Running),
            )),
            Ok(lease),
        ])
        .boxed();

        assert_eq!(observer.run(changes).await, 2);
        for _ in 0..2 {
            assert!(matches!(
                events.next().await,
                Some(PoolEvent::WorkerLeased { .. })
            ));
        }
    }
}
