//! Drain controller
//!
//! Administrative teardown. [`DrainController::drain`] stops every worker
//! that has an external handle and deletes every record;
//! [`DrainController::reap_assigned`] does the same for leased workers only.
//! Neither is atomic with respect to concurrent launches or leases.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::execution::{ExecutionService, ExternalHandle};
use crate::persistence::{LeaseStore, StoreError};
use crate::record::{WorkerRecord, WorkerStatus};

/// Stop reason sent for drained workers
pub const DRAIN_STOP_REASON: &str = "Pool drained";

/// Stop reason sent for reaped workers
pub const REAP_STOP_REASON: &str = "Task deletion by cleanup function";

/// What a drain did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainReport {
    /// Records found by the scan
    pub scanned: usize,
    /// Successful stop calls
    pub stopped: usize,
    /// Stop calls that failed (logged, not fatal)
    pub stop_failures: usize,
    /// Records removed
    pub deleted: usize,
}

/// Bulk teardown of pool workers and their records
pub struct DrainController {
    store: Arc<dyn LeaseStore>,
    execution: Arc<dyn ExecutionService>,
}

impl DrainController {
    pub fn new(store: Arc<dyn LeaseStore>, execution: Arc<dyn ExecutionService>) -> Self {
        Self { store, execution }
    }

    /// Stop every launched worker (best effort) and delete every record
    ///
    /// Each distinct handle is stopped once. A store failure aborts the
    /// drain; stop failures do not.
    #[instrument(skip(self))]
    pub async fn drain(&self) -> Result<DrainReport, StoreError> {
        let records = self.store.scan_all().await?;
        let mut report = DrainReport {
            scanned: records.len(),
            ..Default::default()
        };

        {
            let mut seen = HashSet::new();
            for record in &records {
                let Some(handle) = stop_handle(record) else {
                    continue;
                };
                if !seen.insert(handle) {
                    continue;
                }
                if self.stop(record, DRAIN_STOP_REASON).await {
                    report.stopped += 1;
                } else {
                    report.stop_failures += 1;
                }
            }
        }

        let keys: Vec<_> = records.into_iter().map(|r| r.key).collect();
        report.deleted = self.store.delete_batch(&keys).await?;

        info!(
            scanned = report.scanned,
            stopped = report.stopped,
            stop_failures = report.stop_failures,
            deleted = report.deleted,
            "pool drained"
        );
        Ok(report)
    }

    /// Stop and delete up to `max` ASSIGNED workers, one at a time
    ///
    /// Concurrent reapers may pick the same record; the exists-conditional
    /// delete lets exactly one of them count it. Returns how many records
    /// this call deleted.
    #[instrument(skip(self))]
    pub async fn reap_assigned(&self, max: usize) -> Result<usize, StoreError> {
        let mut reaped = 0;
        let mut attempts = 0;

        while attempts < max {
            attempts += 1;
            let Some(record) = self
                .store
                .query_by_status(WorkerStatus::Assigned, Some(1))
                .await?
                .into_iter()
                .next()
            else {
                break;
            };

            self.stop(&record, REAP_STOP_REASON).await;

            match self.store.delete(&record.key).await {
                Ok(_) => {
                    debug!(worker_id = %record.worker_id, "reaped assigned worker");
                    reaped += 1;
                }
                Err(StoreError::NotFound(_)) => {
                    debug!(worker_id = %record.worker_id, "already reaped");
                }
                Err(e) => return Err(e),
            }
        }

        info!(reaped, "assigned workers reaped");
        Ok(reaped)
    }

    /// Best-effort stop; true when the service accepted it or there was
    /// nothing to stop
    async fn stop(&self, record: &WorkerRecord, reason: &str) -> bool {
        let Some(handle) = stop_handle(record) else {
            return true;
        };
        match self.execution.stop(&ExternalHandle::new(handle), reason).await {
            Ok(()) => true,
            Err(e) => {
                warn!(worker_id = %record.worker_id, %handle, error = %e, "failed to stop worker");
                false
            }
        }
    }
}

/// The record's handle, if it names a task to stop
fn stop_handle(record: &WorkerRecord) -> Option<&str> {
    record
        .external_handle
        .as_deref()
        .map(str::trim)
        .filter(|handle| !handle.is_empty())
}
