//! # Warm Pool Lease Manager
//!
//! Keeps a pool of pre-warmed container workers and leases them to
//! requesters on demand, replacing each leased worker and supporting bulk
//! teardown.
//!
//! ## Features
//!
//! - **At-most-one assignment**: leases are status-conditional writes; no in-process locks
//! - **Bounded launches**: readiness polling with initial delay, backoff and a hard deadline
//! - **No stuck records**: every failed launch (panics included) ends in `ERROR` with a detail
//! - **Self-replenishing**: store change stream -> event bus -> one launch per lease
//! - **Pluggable backends**: in-memory and PostgreSQL stores, in-memory and HTTP execution services
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  grab / monitor   ┌────────────────────────────┐
//! │ LeaseService │──────────────────►│         LeaseStore         │
//! └──────────────┘                   │ (records, conditional CAS) │
//!                                    └────────────────────────────┘
//! ┌──────────────┐  create / CAS            ▲        │ change stream
//! │WorkerLauncher│──────────────────────────┘        ▼
//! └──────────────┘                         ┌────────────────┐
//!        ▲   │ start / describe / stop     │ ChangeObserver │
//!        │   ▼                             └────────────────┘
//!        │ ┌──────────────────┐                    │ WorkerLeased
//!        │ │ ExecutionService │                    ▼
//!        │ └──────────────────┘            ┌────────────────┐
//!        └──────── launch ─────────────────│ Replenishment  │◄── EventBus
//!                                          │    Trigger     │
//!                                          └────────────────┘
//! ```
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use warmpool::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let store = Arc::new(InMemoryLeaseStore::new());
//! let execution = Arc::new(InMemoryExecutionService::new());
//! let launcher = WorkerLauncher::new(
//!     store.clone(),
//!     execution.clone(),
//!     LauncherConfig::new(LaunchSpec::new("pool", "worker:1"))
//!         .with_readiness(ReadinessPolicy::fixed(Duration::from_millis(10), Duration::from_secs(5))),
//! );
//! launcher.launch().await.unwrap();
//!
//! let leases = LeaseService::new(store.clone());
//! let lease = leases.grab("userA").await.unwrap().unwrap();
//! assert_eq!(lease.network_address, "1.2.3.4");
//! assert_eq!(leases.grab("userB").await.unwrap(), None);
//! # }
//! ```

pub mod config;
pub mod drain;
pub mod events;
pub mod execution;
pub mod launcher;
pub mod lease;
pub mod persistence;
pub mod record;
pub mod replenish;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::{ConfigError, PoolConfig};
    pub use crate::drain::{DrainController, DrainReport};
    pub use crate::events::{ChangeObserver, EventBus, InMemoryEventBus, PoolEvent};
    pub use crate::execution::{
        ExecutionError, ExecutionService, InMemoryExecutionService, LaunchSpec,
    };
    pub use crate::launcher::{LaunchError, LauncherConfig, ReadinessPolicy, WorkerLauncher};
    pub use crate::lease::{Lease, LeaseError, LeaseService, PoolCounts};
    pub use crate::persistence::{
        ChangeStream, InMemoryLeaseStore, LeaseStore, PostgresLeaseStore, RecordChange,
        StoreError,
    };
    pub use crate::record::{RecordKey, WorkerId, WorkerRecord, WorkerStatus};
    pub use crate::replenish::ReplenishmentTrigger;
}

// Re-export key types at crate root
pub use config::{ConfigError, PoolConfig};
pub use drain::{DrainController, DrainReport};
pub use events::{ChangeObserver, EventBus, EventBusError, InMemoryEventBus, PoolEvent};
pub use launcher::{
    LaunchError, LauncherConfig, ReadinessError, ReadinessPolicy, WorkerLauncher,
};
pub use lease::{Lease, LeaseError, LeaseService, PoolCounts};
pub use persistence::{
    ChangeStream, InMemoryLeaseStore, LeaseStore, PostgresChangeFeedConfig, PostgresLeaseStore,
    RecordChange, StoreError,
};
pub use record::{FieldUpdates, RecordKey, WorkerId, WorkerRecord, WorkerStatus};
pub use replenish::{ReplenishStats, ReplenishmentTrigger};
