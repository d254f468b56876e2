//! Worker record model
//!
//! A [`WorkerRecord`] is the only persisted entity. Its status moves forward
//! along a fixed set of edges and the optional fields are tied to the status:
//!
//! ```text
//!                ┌──────────► ERROR
//!                │
//!   LAUNCHING ───┴──► RUNNING ───► ASSIGNED
//! ```
//!
//! - `network_address` is present iff status is `RUNNING` or `ASSIGNED`
//! - `assigned_to` is present iff status is `ASSIGNED`
//! - `error_detail` is present iff status is `ERROR`

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default partition holding every record of a pool
pub const DEFAULT_PARTITION: &str = "pool";

const SORT_KEY_PREFIX: &str = "TASK#";

/// Unique worker identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    /// Generate a fresh id: `task_` followed by a UUID v7 (millisecond
    /// timestamp plus random bits).
    pub fn generate() -> Self {
        Self(format!("task_{}", Uuid::now_v7().simple()))
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Worker lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerStatus {
    /// Record created, execution service asked to start the worker
    Launching,
    /// Worker is reachable and free to lease
    Running,
    /// Worker leased to a requester
    Assigned,
    /// Launch failed; `error_detail` says why
    Error,
}

impl WorkerStatus {
    pub const ALL: [WorkerStatus; 4] = [
        WorkerStatus::Launching,
        WorkerStatus::Running,
        WorkerStatus::Assigned,
        WorkerStatus::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Launching => "LAUNCHING",
            Self::Running => "RUNNING",
            Self::Assigned => "ASSIGNED",
            Self::Error => "ERROR",
        }
    }

    /// Whether `self -> next` is an edge of the lifecycle state machine
    pub fn can_transition_to(&self, next: WorkerStatus) -> bool {
        matches!(
            (self, next),
            (Self::Launching, Self::Running)
                | (Self::Launching, Self::Error)
                | (Self::Running, Self::Assigned)
        )
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown status string
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown worker status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for WorkerStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LAUNCHING" => Ok(Self::Launching),
            "RUNNING" => Ok(Self::Running),
            "ASSIGNED" => Ok(Self::Assigned),
            "ERROR" => Ok(Self::Error),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// Composite store key: pool partition + per-record sort key
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    pub partition: String,
    pub sort: String,
}

impl RecordKey {
    pub fn new(partition: impl Into<String>, worker_id: &WorkerId) -> Self {
        Self {
            partition: partition.into(),
            sort: format!("{SORT_KEY_PREFIX}{worker_id}"),
        }
    }

    /// Worker id encoded in the sort key, if it carries the expected prefix
    pub fn worker_id(&self) -> Option<WorkerId> {
        self.sort.strip_prefix(SORT_KEY_PREFIX).map(WorkerId::new)
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.partition, self.sort)
    }
}

/// Persisted state of one pool worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerRecord {
    pub key: RecordKey,
    pub worker_id: WorkerId,
    pub status: WorkerStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_handle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkerRecord {
    /// New record in `LAUNCHING`
    pub fn launching(partition: impl Into<String>, worker_id: WorkerId) -> Self {
        let now = Utc::now();
        Self {
            key: RecordKey::new(partition, &worker_id),
            worker_id,
            status: WorkerStatus::Launching,
            external_handle: None,
            network_address: None,
            assigned_to: None,
            error_detail: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply field updates in place, stamping `updated_at` so it never goes
    /// backwards.
    pub fn apply(&mut self, updates: &FieldUpdates, now: DateTime<Utc>) {
        if let Some(status) = updates.status {
            self.status = status;
        }
        if let Some(handle) = &updates.external_handle {
            self.external_handle = Some(handle.clone());
        }
        if let Some(address) = &updates.network_address {
            self.network_address = Some(address.clone());
        }
        if let Some(requester) = &updates.assigned_to {
            self.assigned_to = Some(requester.clone());
        }
        if let Some(detail) = &updates.error_detail {
            self.error_detail = Some(detail.clone());
        }
        self.updated_at = self.updated_at.max(now);
    }

    /// Check the status/field presence invariants
    pub fn is_consistent(&self) -> bool {
        let addressed = matches!(self.status, WorkerStatus::Running | WorkerStatus::Assigned);
        self.network_address.is_some() == addressed
            && self.assigned_to.is_some() == (self.status == WorkerStatus::Assigned)
            && self.error_detail.is_some() == (self.status == WorkerStatus::Error)
            && self.updated_at >= self.created_at
    }
}

/// Set-only field updates applied by a store write
///
/// Fields left as `None` are untouched; no update ever clears a field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldUpdates {
    pub status: Option<WorkerStatus>,
    pub external_handle: Option<String>,
    pub network_address: Option<String>,
    pub assigned_to: Option<String>,
    pub error_detail: Option<String>,
}

impl FieldUpdates {
    pub fn new() -> Self {
        Self::default()
    }

    /// `LAUNCHING -> RUNNING` with the resolved address
    pub fn running(network_address: impl Into<String>) -> Self {
        Self::new()
            .with_status(WorkerStatus::Running)
            .with_network_address(network_address)
    }

    /// `RUNNING -> ASSIGNED` to a requester
    pub fn assigned(requester: impl Into<String>) -> Self {
        Self::new()
            .with_status(WorkerStatus::Assigned)
            .with_assigned_to(requester)
    }

    /// `LAUNCHING -> ERROR` with a failure description
    pub fn error(detail: impl Into<String>) -> Self {
        Self::new()
            .with_status(WorkerStatus::Error)
            .with_error_detail(detail)
    }

    pub fn with_status(mut self, status: WorkerStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_external_handle(mut self, handle: impl Into<String>) -> Self {
        self.external_handle = Some(handle.into());
        self
    }

    pub fn with_network_address(mut self, address: impl Into<String>) -> Self {
        self.network_address = Some(address.into());
        self
    }

    pub fn with_assigned_to(mut self, requester: impl Into<String>) -> Self {
        self.assigned_to = Some(requester.into());
        self
    }

    pub fn with_error_detail(mut self, detail: impl Into<String>) -> Self {
        self.error_detail = Some(detail.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_unique() {
        let ids: std::collections::HashSet<_> = (0..1000).map(|_| WorkerId::generate()).collect();
        assert_eq!(ids.len(), 1000);
        assert!(ids.iter().all(|id| id.as_str().starts_with("task_")));
    }

    #[test]
    fn test_transition_edges() {
        use WorkerStatus::*;

        assert!(Launching.can_transition_to(Running));
        assert!(Launching.can_transition_to(Error));
        assert!(Running.can_transition_to(Assigned));

        assert!(!Launching.can_transition_to(Assigned));
        assert!(!Running.can_transition_to(Launching));
        assert!(!Running.can_transition_to(Error));
        assert!(!Assigned.can_transition_to(Running));
        assert!(!Error.can_transition_to(Running));
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in WorkerStatus::ALL {
            assert_eq!(status.as_str().parse::<WorkerStatus>(), Ok(status));
        }
        assert!("STOPPED".parse::<WorkerStatus>().is_err());
    }

    #[test]
    fn test_record_key_carries_worker_id() {
        let id = WorkerId::new("task_T1");
        let key = RecordKey::new(DEFAULT_PARTITION, &id);
        assert_eq!(key.sort, "TASK#task_T1");
        assert_eq!(key.worker_id(), Some(id));
        assert_eq!(key.to_string(), "pool/TASK#task_T1");
    }

    #[test]
    fn test_apply_keeps_invariants_along_the_happy_path() {
        let mut record = WorkerRecord::launching(DEFAULT_PARTITION, WorkerId::new("task_1"));
        assert!(record.is_consistent());

        record.apply(&FieldUpdates::new().with_external_handle("arn/1"), Utc::now());
        assert!(record.is_consistent());

        record.apply(&FieldUpdates::running("1.2.3.4"), Utc::now());
        assert_eq!(record.status, WorkerStatus::Running);
        assert!(record.is_consistent());

        record.apply(&FieldUpdates::assigned("userA"), Utc::now());
        assert_eq!(record.assigned_to.as_deref(), Some("userA"));
        assert!(record.is_consistent());
    }

    #[test]
    fn test_updated_at_never_goes_backwards() {
        let mut record = WorkerRecord::launching(DEFAULT_PARTITION, WorkerId::new("task_1"));
        let before = record.updated_at;
        record.apply(
            &FieldUpdates::error("boom"),
            before - chrono::Duration::seconds(30),
        );
        assert_eq!(record.updated_at, before);
        assert!(record.is_consistent());
    }

    #[test]
    fn test_record_json_shape() {
        let record = WorkerRecord::launching(DEFAULT_PARTITION, WorkerId::new("task_1"));
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["status"], "LAUNCHING");
        assert_eq!(value["workerId"], "task_1");
        assert!(value.get("networkAddress").is_none());

        let parsed: WorkerRecord = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, record);
    }
}
