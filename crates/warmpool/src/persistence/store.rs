//! LeaseStore trait definition

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::record::{FieldUpdates, RecordKey, WorkerRecord, WorkerStatus};

/// Error type for store operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Record does not exist
    #[error("record not found: {0}")]
    NotFound(RecordKey),

    /// A record with the same key already exists
    #[error("record already exists: {0}")]
    AlreadyExists(RecordKey),

    /// Conditional write lost: the record is not in the expected status
    /// (or no longer exists)
    #[error("condition failed for {key}: expected status {expected}")]
    ConditionFailed {
        key: RecordKey,
        expected: WorkerStatus,
    },

    /// The updates name no status, or one that is not a lifecycle edge
    /// from the expected status
    #[error(
        "invalid status transition from {from} to {}",
        .to.map(|s| s.as_str()).unwrap_or("nothing")
    )]
    InvalidTransition {
        from: WorkerStatus,
        to: Option<WorkerStatus>,
    },

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Whether the error is the expected outcome of a lost race
    pub fn is_condition_failed(&self) -> bool {
        matches!(self, Self::ConditionFailed { .. })
    }
}

/// Reject a conditional write whose target status is not an edge out of
/// `expected`; checked before anything is written
pub(crate) fn check_transition(
    expected: WorkerStatus,
    updates: &FieldUpdates,
) -> Result<(), StoreError> {
    match updates.status {
        Some(to) if expected.can_transition_to(to) => Ok(()),
        to => Err(StoreError::InvalidTransition { from: expected, to }),
    }
}

/// Store for worker records
///
/// Every operation is atomic for a single record; there are no
/// multi-record transactions. Implementations must be safe to call from
/// many concurrent invocations: the status-conditional write is the only
/// coordination primitive the rest of the crate relies on.
#[async_trait]
pub trait LeaseStore: Send + Sync + 'static {
    /// Insert a new record
    ///
    /// Fails with [`StoreError::AlreadyExists`] on key collision.
    async fn create(&self, record: &WorkerRecord) -> Result<(), StoreError>;

    /// Point read by key
    async fn get(&self, key: &RecordKey) -> Result<Option<WorkerRecord>, StoreError>;

    /// Apply `updates` only if the record's current status is `expected`
    ///
    /// Either all updates apply or none do. A missing record fails the
    /// condition. `updates` must move the record along a lifecycle edge out
    /// of `expected`; anything else is [`StoreError::InvalidTransition`] and
    /// nothing is written. Returns the record as written.
    async fn conditional_transition(
        &self,
        key: &RecordKey,
        expected: WorkerStatus,
        updates: FieldUpdates,
    ) -> Result<WorkerRecord, StoreError>;

    /// Apply `updates` without a status condition
    ///
    /// Only for audit fields no concurrent writer targets. Does not upsert:
    /// a missing record is [`StoreError::NotFound`].
    async fn update(
        &self,
        key: &RecordKey,
        updates: FieldUpdates,
    ) -> Result<WorkerRecord, StoreError>;

    /// Up to `limit` records currently in `status` (`None` = all), in no
    /// particular order
    async fn query_by_status(
        &self,
        status: WorkerStatus,
        limit: Option<usize>,
    ) -> Result<Vec<WorkerRecord>, StoreError>;

    /// Every live record
    async fn scan_all(&self) -> Result<Vec<WorkerRecord>, StoreError>;

    /// Delete a record only if it still exists
    ///
    /// Returns the deleted record, or [`StoreError::NotFound`] if someone
    /// else removed it first.
    async fn delete(&self, key: &RecordKey) -> Result<WorkerRecord, StoreError>;

    /// Delete every listed record that still exists; returns how many were
    /// removed
    async fn delete_batch(&self, keys: &[RecordKey]) -> Result<usize, StoreError>;
}

/// One record mutation as seen by the change stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordChange {
    /// Record before the mutation (`None` for inserts)
    pub old_image: Option<WorkerRecord>,
    /// Record after the mutation (`None` for deletes)
    pub new_image: Option<WorkerRecord>,
}

impl RecordChange {
    pub fn inserted(record: WorkerRecord) -> Self {
        Self {
            old_image: None,
            new_image: Some(record),
        }
    }

    pub fn modified(old: WorkerRecord, new: WorkerRecord) -> Self {
        Self {
            old_image: Some(old),
            new_image: Some(new),
        }
    }

    pub fn removed(record: WorkerRecord) -> Self {
        Self {
            old_image: Some(record),
            new_image: None,
        }
    }

    /// `(old status, new status)` for a modification of an existing record
    pub fn status_edge(&self) -> Option<(WorkerStatus, WorkerStatus)> {
        match (&self.old_image, &self.new_image) {
            (Some(old), Some(new)) => Some((old.status, new.status)),
            _ => None,
        }
    }
}

/// Feed of record mutations
///
/// Delivery is at-least-once and not necessarily ordered across records.
pub trait ChangeStream: Send + Sync + 'static {
    /// Subscribe to mutations
    ///
    /// Every mutation committed after this call returns is delivered.
    /// Durable implementations may also deliver earlier mutations nobody
    /// has consumed yet.
    fn changes(&self) -> BoxStream<'static, Result<RecordChange, StoreError>>;
}
