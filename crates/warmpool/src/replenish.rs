//! Replenishment trigger
//!
//! Launches one worker per delivered [`PoolEvent`]. Duplicate deliveries
//! launch duplicate workers: the pool tracks assignment volume, not
//! logical assignments.

use std::sync::Arc;

use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, instrument};

use crate::events::PoolEvent;
use crate::launcher::{LaunchError, WorkerLauncher};
use crate::record::WorkerRecord;

/// Default cap on launches running at the same time
pub const DEFAULT_MAX_IN_FLIGHT: usize = 32;

/// Outcome counters for [`ReplenishmentTrigger::run`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplenishStats {
    /// Events consumed
    pub received: usize,
    /// Launches that produced a RUNNING worker
    pub launched: usize,
    /// Launches that failed (recorded as ERROR) or panicked
    pub failed: usize,
}

impl ReplenishStats {
    fn record(&mut self, outcome: Result<Result<WorkerRecord, LaunchError>, JoinError>) {
        match outcome {
            Ok(Ok(_)) => self.launched += 1,
            Ok(Err(_)) => self.failed += 1,
            Err(e) => {
                error!(error = %e, "replenishment launch aborted");
                self.failed += 1;
            }
        }
    }
}

/// Turns pool events into worker launches
pub struct ReplenishmentTrigger {
    launcher: Arc<WorkerLauncher>,
    max_in_flight: usize,
}

impl ReplenishmentTrigger {
    pub fn new(launcher: Arc<WorkerLauncher>) -> Self {
        Self {
            launcher,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
        }
    }

    pub fn with_max_in_flight(mut self, max: usize) -> Self {
        self.max_in_flight = max.max(1);
        self
    }

    /// Launch exactly one worker for `event`
    #[instrument(skip(self), fields(event = event.name()))]
    pub async fn handle(&self, event: &PoolEvent) -> Result<WorkerRecord, LaunchError> {
        let PoolEvent::WorkerLeased { worker_id, .. } = event;
        debug!(%worker_id, "replacing leased worker");
        self.launcher.launch().await
    }

    /// Consume `events` until the stream ends, launching one worker per
    /// event in the background
    ///
    /// At most `max_in_flight` launches run at once; further events wait
    /// for a slot. Returns once every started launch has finished.
    pub async fn run(&self, mut events: BoxStream<'static, PoolEvent>) -> ReplenishStats {
        let slots = Arc::new(Semaphore::new(self.max_in_flight));
        let mut launches = JoinSet::new();
        let mut stats = ReplenishStats::default();

        loop {
            tokio::select! {
                Some(outcome) = launches.join_next(), if !launches.is_empty() => {
                    stats.record(outcome);
                }
                next = events.next() => {
                    let Some(event) = next else { break };
                    stats.received += 1;

                    let Ok(permit) = slots.clone().acquire_owned().await else {
                        break;
                    };
                    let launcher = Arc::clone(&self.launcher);
                    launches.spawn(async move {
                        let _permit = permit;
                        debug!(event = event.name(), "replenishing");
                        launcher.launch().await
                    });
                }
            }
        }

        while let Some(outcome) = launches.join_next().await {
            stats.record(outcome);
        }

        info!(
            received = stats.received,
            launched = stats.launched,
            failed = stats.failed,
            "replenishment stopped"
        );
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{InMemoryExecutionService, LaunchSpec};
    use crate::launcher::{LauncherConfig, ReadinessPolicy};
    use crate::persistence::{InMemoryLeaseStore, LeaseStore};
    use crate::record::{WorkerId, WorkerStatus};
    use std::time::Duration;

    fn trigger(
        store: &Arc<InMemoryLeaseStore>,
        execution: InMemoryExecutionService,
    ) -> ReplenishmentTrigger {
        let config = LauncherConfig::new(LaunchSpec::new("pool-cluster", "worker:1"))
            .with_readiness(ReadinessPolicy::fixed(
                Duration::from_millis(100),
                Duration::from_secs(5),
            ));
        let launcher = WorkerLauncher::new(store.clone(), Arc::new(execution), config);
        ReplenishmentTrigger::new(Arc::new(launcher)).with_max_in_flight(2)
    }

    #[tokio::test(start_paused = true)]
    async fn test_handle_launches_exactly_one_worker() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let trigger = trigger(&store, InMemoryExecutionService::new());

        let record = trigger
            .handle(&PoolEvent::worker_leased(WorkerId::new("task_old")))
            .await
            .unwrap();

        assert_eq!(record.status, WorkerStatus::Running);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_launches_one_worker_per_delivery() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let trigger = trigger(&store, InMemoryExecutionService::new());

        // Same lease delivered twice: two launches
        let leased = PoolEvent::worker_leased(WorkerId::new("task_old"));
        let events = futures::stream::iter(vec![
            leased.clone(),
            leased,
            PoolEvent::worker_leased(WorkerId::new("task_a")),
            PoolEvent::worker_leased(WorkerId::new("task_b")),
            PoolEvent::worker_leased(WorkerId::new("task_c")),
        ])
        .boxed();

        let stats = trigger.run(events).await;

        assert_eq!(
            stats,
            ReplenishStats {
                received: 5,
                launched: 5,
                failed: 0
            }
        );
        let running = store
            .query_by_status(WorkerStatus::Running, None)
            .await
            .unwrap();
        assert_eq!(running.len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_counts_failed_launches() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let trigger = trigger(
            &store,
            InMemoryExecutionService::new().rejecting_starts("capacity unavailable"),
        );

        let events = futures::stream::iter(vec![PoolEvent::worker_leased(WorkerId::new("task_old")); 3]).boxed();
        let stats = trigger.run(events).await;

        assert_eq!(stats.failed, 3);
        assert_eq!(
            store
                .query_by_status(WorkerStatus::Error, None)
                .await
                .unwrap()
                .len(),
            3
        );
    }
}
