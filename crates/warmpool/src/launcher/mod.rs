//! Worker launcher
//!
//! Creates a `LAUNCHING` record, asks the execution service for a worker,
//! waits for it to come up and records the outcome:
//!
//! ```text
//!  create LAUNCHING ──► start ──► save handle ──► wait ready ──► resolve address
//!                         │                          │                │
//!                         └──────── any failure ─────┴────────────────┴──► ERROR
//!                                                                     │
//!                                                                     └──► RUNNING
//! ```
//!
//! A launch never leaves its record in `LAUNCHING`: failures (including a
//! panic in the execution client) are written as `ERROR` before they are
//! returned or resumed.

mod readiness;

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::{FutureExt, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};

use crate::execution::{ExecutionError, ExecutionService, LaunchSpec};
use crate::persistence::{LeaseStore, StoreError};
use crate::record::{FieldUpdates, RecordKey, WorkerId, WorkerRecord, WorkerStatus, DEFAULT_PARTITION};

pub use readiness::{wait_until_ready, ReadinessError, ReadinessPolicy, MIN_POLL_INTERVAL};

/// Default number of launches in flight for [`WorkerLauncher::launch_many`]
pub const DEFAULT_LAUNCH_CONCURRENCY: usize = 10;

/// Launcher configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LauncherConfig {
    /// Partition the records are written to
    pub partition: String,

    /// What to start on the execution service
    pub spec: LaunchSpec,

    /// How long and how often to poll for readiness
    pub readiness: ReadinessPolicy,
}

impl LauncherConfig {
    pub fn new(spec: LaunchSpec) -> Self {
        Self {
            partition: DEFAULT_PARTITION.to_string(),
            spec,
            readiness: ReadinessPolicy::default(),
        }
    }

    pub fn with_partition(mut self, partition: impl Into<String>) -> Self {
        self.partition = partition.into();
        self
    }

    pub fn with_readiness(mut self, readiness: ReadinessPolicy) -> Self {
        self.readiness = readiness;
        self
    }
}

/// Launch failures
///
/// Everything except [`LaunchError::Store`] on the initial create has
/// already been recorded as `ERROR` on the worker record when it is
/// returned.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LaunchError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The execution service refused the start
    #[error("start rejected: {0}")]
    StartRejected(String),

    /// The worker did not become ready
    #[error("worker not ready: {0}")]
    NotReady(#[from] ReadinessError),

    /// Execution service call failed
    #[error("execution service error: {0}")]
    Execution(ExecutionError),
}

impl From<ExecutionError> for LaunchError {
    fn from(err: ExecutionError) -> Self {
        match err {
            ExecutionError::StartRejected(reason) => Self::StartRejected(reason),
            other => Self::Execution(other),
        }
    }
}

impl LaunchError {
    /// Text stored as the record's `error_detail`
    pub fn detail(&self) -> String {
        match self {
            Self::StartRejected(reason) => reason.clone(),
            Self::NotReady(ReadinessError::Stopped(description)) => description.failure_detail(),
            other => other.to_string(),
        }
    }
}

/// Starts workers and records their lifecycle
///
/// Holds no mutable state; one launcher can serve any number of concurrent
/// launches.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use std::time::Duration;
/// use warmpool::execution::{InMemoryExecutionService, LaunchSpec};
/// use warmpool::{InMemoryLeaseStore, LauncherConfig, ReadinessPolicy, WorkerLauncher, WorkerStatus};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let config = LauncherConfig::new(LaunchSpec::new("pool", "worker:1"))
///     .with_readiness(ReadinessPolicy::fixed(Duration::from_millis(10), Duration::from_secs(5)));
/// let launcher = WorkerLauncher::new(
///     Arc::new(InMemoryLeaseStore::new()),
///     Arc::new(InMemoryExecutionService::new()),
///     config,
/// );
///
/// let record = launcher.launch().await.unwrap();
/// assert_eq!(record.status, WorkerStatus::Running);
/// assert_eq!(record.network_address.as_deref(), Some("1.2.3.4"));
/// # }
/// ```
pub struct WorkerLauncher {
    store: Arc<dyn LeaseStore>,
    execution: Arc<dyn ExecutionService>,
    config: LauncherConfig,
}

impl WorkerLauncher {
    pub fn new(
        store: Arc<dyn LeaseStore>,
        execution: Arc<dyn ExecutionService>,
        config: LauncherConfig,
    ) -> Self {
        Self {
            store,
            execution,
            config,
        }
    }

    pub fn config(&self) -> &LauncherConfig {
        &self.config
    }

    /// Launch one worker under a freshly generated id
    pub async fn launch(&self) -> Result<WorkerRecord, LaunchError> {
        self.launch_as(WorkerId::generate()).await
    }

    /// Launch one worker under `worker_id`
    ///
    /// Returns the `RUNNING` record. On failure the record has been moved to
    /// `ERROR` (unless it could not be created in the first place).
    #[instrument(skip_all, fields(worker_id = %worker_id))]
    pub async fn launch_as(&self, worker_id: WorkerId) -> Result<WorkerRecord, LaunchError> {
        let record = WorkerRecord::launching(&self.config.partition, worker_id);
        self.store.create(&record).await?;
        info!(key = %record.key, "worker record created");

        let started = Instant::now();
        let outcome = AssertUnwindSafe(self.provision(&record.key))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(running)) => {
                info!(
                    address = running.network_address.as_deref().unwrap_or_default(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "task_launched"
                );
                Ok(running)
            }
            Ok(Err(err)) => {
                self.record_failure(&record.key, &err.detail()).await;
                error!(
                    error = %err,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "task_launch_error"
                );
                Err(err)
            }
            Err(panic) => {
                let detail = format!("launcher panicked: {}", panic_message(panic.as_ref()));
                self.record_failure(&record.key, &detail).await;
                error!(%detail, "task_launch_error");
                std::panic::resume_unwind(panic)
            }
        }
    }

    /// Launch `count` workers with at most `concurrency` in flight
    ///
    /// Each launch is independent; the results come back in completion
    /// order.
    pub async fn launch_many(
        &self,
        count: usize,
        concurrency: usize,
    ) -> Vec<Result<WorkerRecord, LaunchError>> {
        futures::stream::iter(0..count)
            .map(|_| self.launch())
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await
    }

    /// Steps after the record exists; any error here ends in `ERROR`
    async fn provision(&self, key: &RecordKey) -> Result<WorkerRecord, LaunchError> {
        let handle = self.execution.start(&self.config.spec).await?;
        info!(handle = %handle, "execution service accepted start");

        self.store
            .update(key, FieldUpdates::new().with_external_handle(handle.as_str()))
            .await?;

        let ready =
            wait_until_ready(self.execution.as_ref(), &handle, &self.config.readiness).await?;

        let interface = ready.network_interface.as_deref().unwrap_or_default();
        let address = self.execution.resolve_network_address(interface).await?;

        let running = self
            .store
            .conditional_transition(key, WorkerStatus::Launching, FieldUpdates::running(address))
            .await?;
        Ok(running)
    }

    async fn record_failure(&self, key: &RecordKey, detail: &str) {
        match self
            .store
            .conditional_transition(key, WorkerStatus::Launching, FieldUpdates::error(detail))
            .await
        {
            Ok(_) => {}
            Err(e) if e.is_condition_failed() => {
                warn!(%key, "record left LAUNCHING before the failure was recorded");
            }
            Err(e) => {
                error!(%key, error = %e, "failed to record launch failure");
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return (*message).to_string();
    }
    if let Some(message) = payload.downcast_ref::<String>() {
        return message.clone();
    }
    "unknown panic".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{ExternalHandle, InMemoryExecutionService, TaskDescription, TaskState};
    use crate::persistence::InMemoryLeaseStore;
    use async_trait::async_trait;
    use std::time::Duration;

    fn config() -> LauncherConfig {
        LauncherConfig::new(LaunchSpec::new("pool-cluster", "worker:1")).with_readiness(
            ReadinessPolicy::fixed(Duration::from_secs(1), Duration::from_secs(30)),
        )
    }

    fn launcher(
        store: &Arc<InMemoryLeaseStore>,
        execution: InMemoryExecutionService,
    ) -> WorkerLauncher {
        WorkerLauncher::new(store.clone(), Arc::new(execution), config())
    }

    #[tokio::test(start_paused = true)]
    async fn test_launch_records_running_worker() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let launcher = launcher(&store, InMemoryExecutionService::new());

        let record = launcher.launch_as(WorkerId::new("task_T1")).await.unwrap();

        assert_eq!(record.status, WorkerStatus::Running);
        assert_eq!(record.network_address.as_deref(), Some("1.2.3.4"));
        assert_eq!(
            record.external_handle.as_deref(),
            Some("arn:warmpool:task/pool-cluster/1")
        );
        assert!(record.is_consistent());
        assert_eq!(store.get(&record.key).await.unwrap(), Some(record));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_start_records_error() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let launcher = launcher(
            &store,
            InMemoryExecutionService::new().rejecting_starts("RESOURCE:ENI"),
        );

        let err = launcher.launch_as(WorkerId::new("task_R")).await.unwrap_err();
        assert_eq!(err, LaunchError::StartRejected("RESOURCE:ENI".into()));

        let key = RecordKey::new(DEFAULT_PARTITION, &WorkerId::new("task_R"));
        let record = store.get(&key).await.unwrap().unwrap();
        assert_eq!(record.status, WorkerStatus::Error);
        assert_eq!(record.error_detail.as_deref(), Some("RESOURCE:ENI"));
        assert_eq!(record.external_handle, None);
        assert!(record.is_consistent());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_task_records_stop_reason() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let launcher = launcher(
            &store,
            InMemoryExecutionService::new().with_describe_script(vec![
                TaskDescription::new(TaskState::Pending),
                TaskDescription::new(TaskState::Stopped)
                    .with_stop_reason("Essential container in task exited"),
            ]),
        );

        let err = launcher.launch_as(WorkerId::new("task_S")).await.unwrap_err();
        assert!(matches!(err, LaunchError::NotReady(ReadinessError::Stopped(_))));

        let key = RecordKey::new(DEFAULT_PARTITION, &WorkerId::new("task_S"));
        let record = store.get(&key).await.unwrap().unwrap();
        assert_eq!(record.status, WorkerStatus::Error);
        assert_eq!(
            record.error_detail.as_deref(),
            Some("Essential container in task exited")
        );
        assert!(record.external_handle.is_some());
        assert_eq!(record.network_address, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresolvable_interface_records_error() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let launcher = launcher(
            &store,
            InMemoryExecutionService::new().with_describe_script(vec![
                TaskDescription::new(TaskState::Running).with_network_interface("eni-404"),
            ]),
        );

        let err = launcher.launch().await.unwrap_err();
        assert!(matches!(
            err,
            LaunchError::Execution(ExecutionError::NotFound(_))
        ));

        let records = store.scan_all().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, WorkerStatus::Error);
        assert!(records[0].is_consistent());
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_id_fails_without_touching_existing_record() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let launcher = launcher(&store, InMemoryExecutionService::new());

        let first = launcher.launch_as(WorkerId::new("task_D")).await.unwrap();
        let err = launcher.launch_as(WorkerId::new("task_D")).await.unwrap_err();

        assert!(matches!(err, LaunchError::Store(StoreError::AlreadyExists(_))));
        assert_eq!(store.get(&first.key).await.unwrap(), Some(first));
    }

    #[tokio::test(start_paused = true)]
    async fn test_launch_many_launches_every_worker() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let launcher = launcher(&store, InMemoryExecutionService::new());

        let results = launcher.launch_many(7, 3).await;

        assert_eq!(results.len(), 7);
        assert!(results.iter().all(|r| r.is_ok()));
        let running = store
            .query_by_status(WorkerStatus::Running, None)
            .await
            .unwrap();
        assert_eq!(running.len(), 7);
    }

    struct PanickingExecution;

    #[async_trait]
    impl ExecutionService for PanickingExecution {
        async fn start(&self, _spec: &LaunchSpec) -> Result<ExternalHandle, ExecutionError> {
            panic!("client blew up");
        }

        async fn stop(&self, _: &ExternalHandle, _: &str) -> Result<(), ExecutionError> {
            Ok(())
        }

        async fn describe(&self, _: &ExternalHandle) -> Result<TaskDescription, ExecutionError> {
            Ok(TaskDescription::new(TaskState::Pending))
        }

        async fn resolve_network_address(&self, _: &str) -> Result<String, ExecutionError> {
            Ok("0.0.0.0".into())
        }
    }

    #[tokio::test]
    async fn test_panic_is_recorded_then_resumed() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let launcher = Arc::new(WorkerLauncher::new(
            store.clone(),
            Arc::new(PanickingExecution),
            config(),
        ));

        let task = {
            let launcher = launcher.clone();
            tokio::spawn(async move { launcher.launch_as(WorkerId::new("task_P")).await })
        };
        let joined = task.await;
        assert!(joined.unwrap_err().is_panic());

        let key = RecordKey::new(DEFAULT_PARTITION, &WorkerId::new("task_P"));
        let record = store.get(&key).await.unwrap().unwrap();
        assert_eq!(record.status, WorkerStatus::Error);
        assert_eq!(
            record.error_detail.as_deref(),
            Some("launcher panicked: client blew up")
        );
    }
}
