//! Lease service: hand out RUNNING workers and report pool counts

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::persistence::{LeaseStore, StoreError};
use crate::record::{FieldUpdates, WorkerId, WorkerStatus};

/// Lease errors
///
/// "No worker available" and "lost the race" are not errors: [`LeaseService::grab`]
/// returns `Ok(None)` for both.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LeaseError {
    /// Malformed request
    #[error("validation error: {0}")]
    Validation(String),

    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// A worker handed to a requester
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    pub worker_id: WorkerId,
    pub network_address: String,
}

/// Point-in-time record counts per status
///
/// The per-status queries run independently, so the counts are not
/// consistent with each other. A status whose query failed counts as 0 and
/// is listed in `unavailable`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolCounts {
    pub launching: usize,
    pub running: usize,
    pub assigned: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unavailable: Vec<WorkerStatus>,
}

impl PoolCounts {
    /// Live records not in `ERROR`
    pub fn total(&self) -> usize {
        self.launching + self.running + self.assigned
    }

    /// Every status query succeeded
    pub fn is_complete(&self) -> bool {
        self.unavailable.is_empty()
    }
}

/// Grab and monitor operations over a [`LeaseStore`]
pub struct LeaseService {
    store: Arc<dyn LeaseStore>,
}

impl LeaseService {
    pub fn new(store: Arc<dyn LeaseStore>) -> Self {
        Self { store }
    }

    /// Lease one RUNNING worker to `requester`
    ///
    /// Returns `Ok(None)` when no worker is available or another caller won
    /// the conditional write; the caller may retry at its own pace.
    #[instrument(skip(self))]
    pub async fn grab(&self, requester: &str) -> Result<Option<Lease>, LeaseError> {
        let requester = requester.trim();
        if requester.is_empty() {
            return Err(LeaseError::Validation("requester id is required".into()));
        }

        let Some(candidate) = self
            .store
            .query_by_status(WorkerStatus::Running, Some(1))
            .await?
            .into_iter()
            .next()
        else {
            debug!("no available worker");
            return Ok(None);
        };

        match self
            .store
            .conditional_transition(
                &candidate.key,
                WorkerStatus::Running,
                FieldUpdates::assigned(requester),
            )
            .await
        {
            Ok(assigned) => {
                let Some(network_address) = assigned.network_address else {
                    return Err(LeaseError::Store(StoreError::Serialization(format!(
                        "assigned record {} has no network address",
                        assigned.key
                    ))));
                };
                info!(worker_id = %assigned.worker_id, %requester, "worker leased");
                Ok(Some(Lease {
                    worker_id: assigned.worker_id,
                    network_address,
                }))
            }
            Err(e) if e.is_condition_failed() => {
                debug!(worker_id = %candidate.worker_id, "lost lease race");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Count LAUNCHING, RUNNING and ASSIGNED records
    ///
    /// Never fails: a status whose query errors is reported in
    /// [`PoolCounts::unavailable`].
    #[instrument(skip(self))]
    pub async fn monitor(&self) -> PoolCounts {
        let (launching, running, assigned) = futures::join!(
            self.count(WorkerStatus::Launching),
            self.count(WorkerStatus::Running),
            self.count(WorkerStatus::Assigned),
        );

        let mut counts = PoolCounts::default();
        for (status, result) in [
            (WorkerStatus::Launching, launching),
            (WorkerStatus::Running, running),
            (WorkerStatus::Assigned, assigned),
        ] {
            let count = match result {
                Ok(count) => count,
                Err(e) => {
                    warn!(%status, error = %e, "status count unavailable");
                    counts.unavailable.push(status);
                    0
                }
            };
            match status {
                WorkerStatus::Launching => counts.launching = count,
                WorkerStatus::Running => counts.running = count,
                WorkerStatus::Assigned => counts.assigned = count,
                WorkerStatus::Error => {}
            }
        }
        counts
    }

    async fn count(&self, status: WorkerStatus) -> Result<usize, StoreError> {
        Ok(self.store.query_by_status(status, None).await?.len())
    }
}
