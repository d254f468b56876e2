//! End-to-end pool behaviour over the in-memory store and execution service
//!
//! Run with: cargo test -p warmpool --test pool_lifecycle_test

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use test_log::test;

use warmpool::execution::{InMemoryExecutionService, LaunchSpec, TaskDescription, TaskState};
use warmpool::{
    ChangeObserver, ChangeStream, DrainController, EventBus, FieldUpdates, InMemoryEventBus,
    InMemoryLeaseStore, LaunchError, LauncherConfig, Lease, LeaseService, LeaseStore,
    ReadinessError, ReadinessPolicy, RecordKey, ReplenishmentTrigger, WorkerId, WorkerLauncher,
    WorkerRecord, WorkerStatus,
};

fn launcher_config() -> LauncherConfig {
    LauncherConfig::new(LaunchSpec::new("pool-cluster", "worker:1")).with_readiness(
        ReadinessPolicy::fixed(Duration::from_secs(1), Duration::from_secs(30))
            .with_initial_delay(Duration::from_secs(2)),
    )
}

fn launcher(
    store: &Arc<InMemoryLeaseStore>,
    execution: &Arc<InMemoryExecutionService>,
) -> Arc<WorkerLauncher> {
    Arc::new(WorkerLauncher::new(
        store.clone(),
        execution.clone(),
        launcher_config(),
    ))
}

fn running(id: &str) -> WorkerRecord {
    let mut record = WorkerRecord::launching("pool", WorkerId::new(id));
    record.apply(&FieldUpdates::running("10.0.0.1"), chrono::Utc::now());
    record
}

// ============================================
// Lease Tests
// ============================================

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_concurrent_grabs_assign_single_worker_once() {
    let store = Arc::new(InMemoryLeaseStore::new());
    store.put(running("task_only"));
    let service = Arc::new(LeaseService::new(store.clone()));

    let grabs = (0..32).map(|i| {
        let service = service.clone();
        tokio::spawn(async move { service.grab(&format!("user_{i}")).await })
    });
    let results: Vec<Option<Lease>> = futures::future::join_all(grabs)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    let winners: Vec<_> = results.iter().flatten().collect();
    assert_eq!(winners.len(), 1);
    assert_eq!(winners[0].worker_id, WorkerId::new("task_only"));

    let record = store
        .get(&RecordKey::new("pool", &WorkerId::new("task_only")))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, WorkerStatus::Assigned);
    assert!(record.is_consistent());
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_concurrent_grabs_never_share_a_worker() {
    let store = Arc::new(InMemoryLeaseStore::new());
    for i in 0..5 {
        store.put(running(&format!("task_{i}")));
    }
    let service = Arc::new(LeaseService::new(store.clone()));

    // Keep grabbing until the pool is empty; losers retry
    let grabbers = (0..8).map(|i| {
        let service = service.clone();
        tokio::spawn(async move {
            let mut won = vec![];
            for _ in 0..50 {
                if let Some(lease) = service.grab(&format!("user_{i}")).await.unwrap() {
                    won.push(lease.worker_id);
                }
            }
            won
        })
    });
    let mut won: Vec<WorkerId> = futures::future::join_all(grabbers)
        .await
        .into_iter()
        .flat_map(|joined| joined.unwrap())
        .collect();
    won.sort();

    let total = won.len();
    won.dedup();
    assert_eq!(total, 5);
    assert_eq!(won.len(), 5);
}

#[test(tokio::test)]
async fn test_monitor_counts_add_up_to_live_non_error_records() {
    let store = Arc::new(InMemoryLeaseStore::new());
    store.put(WorkerRecord::launching("pool", WorkerId::new("l1")));
    store.put(WorkerRecord::launching("pool", WorkerId::new("l2")));
    store.put(running("r1"));
    store.put(running("r2"));
    store.put(running("r3"));
    let mut failed = WorkerRecord::launching("pool", WorkerId::new("e1"));
    failed.apply(&FieldUpdates::error("boom"), chrono::Utc::now());
    store.put(failed);

    let service = LeaseService::new(store.clone());
    service.grab("userA").await.unwrap();
    let counts = service.monitor().await;

    let live_not_error = store
        .scan_all()
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.status != WorkerStatus::Error)
        .count();
    assert_eq!(counts.total(), live_not_error);
    assert_eq!((counts.launching, counts.running, counts.assigned), (2, 2, 1));
}

// ============================================
// Launch Tests
// ============================================

#[test(tokio::test(start_paused = true))]
async fn test_launch_resolves_eni_to_address() {
    let store = Arc::new(InMemoryLeaseStore::new());
    let execution = Arc::new(
        InMemoryExecutionService::new()
            .with_describe_script(vec![
                TaskDescription::new(TaskState::Provisioning),
                TaskDescription::new(TaskState::Running).with_network_interface("eni-1"),
            ])
            .with_interface("eni-1", "1.2.3.4"),
    );

    let record = launcher(&store, &execution).launch().await.unwrap();

    assert_eq!(record.status, WorkerStatus::Running);
    assert_eq!(record.network_address.as_deref(), Some("1.2.3.4"));
    assert!(record.is_consistent());
}

#[test(tokio::test(start_paused = true))]
async fn test_launch_timeout_records_error_without_address() {
    let store = Arc::new(InMemoryLeaseStore::new());
    let execution = Arc::new(
        InMemoryExecutionService::new()
            .with_describe_script(vec![TaskDescription::new(TaskState::Pending)]),
    );

    let err = launcher(&store, &execution).launch().await.unwrap_err();
    assert!(matches!(
        err,
        LaunchError::NotReady(ReadinessError::DeadlineExceeded { .. })
    ));

    let records = store.scan_all().await.unwrap();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.status, WorkerStatus::Error);
    assert!(!record.error_detail.as_deref().unwrap_or_default().is_empty());
    assert_eq!(record.network_address, None);
    assert!(record.is_consistent());

    // The task is left running on the execution service
    assert_eq!(execution.stop_calls().len(), 0);
}

#[test(tokio::test(start_paused = true))]
async fn test_no_launch_leaves_record_launching() {
    let store = Arc::new(InMemoryLeaseStore::new());
    let outcomes = [
        InMemoryExecutionService::new(),
        InMemoryExecutionService::new().rejecting_starts("no capacity"),
        InMemoryExecutionService::new()
            .with_describe_script(vec![TaskDescription::new(TaskState::Stopped)]),
        InMemoryExecutionService::new()
            .with_describe_script(vec![TaskDescription::new(TaskState::Pending)]),
    ];

    for execution in outcomes {
        let _ = launcher(&store, &Arc::new(execution)).launch().await;
    }

    let records = store.scan_all().await.unwrap();
    assert_eq!(records.len(), 4);
    assert!(records.iter().all(|r| r.status != WorkerStatus::Launching));
    assert!(records.iter().all(WorkerRecord::is_consistent));
}

// ============================================
// Replenishment Tests
// ============================================

#[test(tokio::test(start_paused = true))]
async fn test_replenishment_fires_only_on_assignment() {
    let store = Arc::new(InMemoryLeaseStore::new());
    let execution = Arc::new(InMemoryExecutionService::new());
    let launcher = launcher(&store, &execution);
    let bus = Arc::new(InMemoryEventBus::new());

    // store changes -> observer -> bus
    let observer = ChangeObserver::new(bus.clone());
    let changes = store.changes();
    let observing = tokio::spawn(async move { observer.run(changes).await });

    // bus -> trigger
    let trigger = ReplenishmentTrigger::new(launcher.clone());
    let events = bus.subscribe();
    let replenishing = tokio::spawn(async move { trigger.run(events.take(1).boxed()).await });

    // LAUNCHING -> RUNNING must not trigger anything
    let first = launcher.launch().await.unwrap();
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(execution.started(), 1);

    // RUNNING -> ASSIGNED triggers exactly one launch
    let lease = LeaseService::new(store.clone())
        .grab("userA")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(lease.worker_id, first.worker_id);

    let stats = replenishing.await.unwrap();
    assert_eq!(stats.received, 1);
    assert_eq!(stats.launched, 1);
    assert_eq!(execution.started(), 2);

    let running = store
        .query_by_status(WorkerStatus::Running, None)
        .await
        .unwrap();
    assert_eq!(running.len(), 1);
    assert_ne!(running[0].worker_id, first.worker_id);

    observing.abort();
}

// ============================================
// Scenario Tests
// ============================================

#[test(tokio::test(start_paused = true))]
async fn test_end_to_end_lease_scenario() {
    let store = Arc::new(InMemoryLeaseStore::new());
    let execution = Arc::new(InMemoryExecutionService::new());
    let service = LeaseService::new(store.clone());

    assert_eq!(service.grab("userA").await.unwrap(), None);

    let launched = launcher(&store, &execution)
        .launch_as(WorkerId::new("task_T1"))
        .await
        .unwrap();
    assert_eq!(launched.worker_id, WorkerId::new("task_T1"));
    assert_eq!(launched.status, WorkerStatus::Running);
    assert_eq!(launched.network_address.as_deref(), Some("1.2.3.4"));

    let lease = service.grab("userA").await.unwrap();
    assert_eq!(
        lease,
        Some(Lease {
            worker_id: WorkerId::new("task_T1"),
            network_address: "1.2.3.4".to_string(),
        })
    );

    let record = store.get(&launched.key).await.unwrap().unwrap();
    assert_eq!(record.status, WorkerStatus::Assigned);
    assert_eq!(record.assigned_to.as_deref(), Some("userA"));

    assert_eq!(service.grab("userB").await.unwrap(), None);
}

#[test(tokio::test(start_paused = true))]
async fn test_drain_stops_each_handle_once_and_empties_store() {
    let store = Arc::new(InMemoryLeaseStore::new());
    let execution = Arc::new(InMemoryExecutionService::new().failing_stop("arn:warmpool:task/pool-cluster/2"));
    let launcher = launcher(&store, &execution);

    launcher.launch_many(4, 2).await;
    LeaseService::new(store.clone()).grab("userA").await.unwrap();
    store.put(WorkerRecord::launching("pool", WorkerId::new("task_no_handle")));

    let report = DrainController::new(store.clone(), execution.clone())
        .drain()
        .await
        .unwrap();

    assert_eq!(report.scanned, 5);
    assert_eq!(report.deleted, 5);
    assert_eq!(report.stop_failures, 1);
    assert!(store.scan_all().await.unwrap().is_empty());

    for n in 1..=4 {
        assert_eq!(
            execution.stop_count(&format!("arn:warmpool:task/pool-cluster/{n}")),
            1
        );
    }
    assert_eq!(execution.stop_calls().len(), 4);
}
