//! In-memory implementation of LeaseStore for testing

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{BoxStream, StreamExt};
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

use super::store::*;
use crate::record::{FieldUpdates, RecordKey, WorkerRecord, WorkerStatus};

const CHANGE_CHANNEL_CAPACITY: usize = 1024;

/// In-memory implementation of LeaseStore
///
/// Stores all records in a map behind a single lock, which makes every
/// operation trivially single-record atomic. Mutations are also published
/// on a broadcast channel so it can stand in for the store's change stream.
///
/// # Example
///
/// ```
/// use warmpool::InMemoryLeaseStore;
///
/// let store = InMemoryLeaseStore::new();
/// assert_eq!(store.len(), 0);
/// ```
pub struct InMemoryLeaseStore {
    records: RwLock<HashMap<RecordKey, WorkerRecord>>,
    changes: broadcast::Sender<RecordChange>,
}

impl InMemoryLeaseStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            records: RwLock::new(HashMap::new()),
            changes,
        }
    }

    /// Number of live records
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Insert or replace a record without any checks (test seeding)
    pub fn put(&self, record: WorkerRecord) {
        let mut records = self.records.write();
        let change = match records.insert(record.key.clone(), record.clone()) {
            Some(old) => RecordChange::modified(old, record),
            None => RecordChange::inserted(record),
        };
        self.publish(change);
    }

    fn publish(&self, change: RecordChange) {
        // No subscribers is fine; nobody is watching the stream.
        let _ = self.changes.send(change);
    }
}

impl Default for InMemoryLeaseStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn create(&self, record: &WorkerRecord) -> Result<(), StoreError> {
        let mut records = self.records.write();
        if records.contains_key(&record.key) {
            return Err(StoreError::AlreadyExists(record.key.clone()));
        }
        records.insert(record.key.clone(), record.clone());
        self.publish(RecordChange::inserted(record.clone()));
        Ok(())
    }

    async fn get(&self, key: &RecordKey) -> Result<Option<WorkerRecord>, StoreError> {
        Ok(self.records.read().get(key).cloned())
    }

    async fn conditional_transition(
        &self,
        key: &RecordKey,
        expected: WorkerStatus,
        updates: FieldUpdates,
    ) -> Result<WorkerRecord, StoreError> {
        check_transition(expected, &updates)?;

        let mut records = self.records.write();
        let record = records
            .get_mut(key)
            .filter(|r| r.status == expected)
            .ok_or_else(|| StoreError::ConditionFailed {
                key: key.clone(),
                expected,
            })?;

        let old = record.clone();
        record.apply(&updates, Utc::now());
        let new = record.clone();
        self.publish(RecordChange::modified(old, new.clone()));
        Ok(new)
    }

    async fn update(
        &self,
        key: &RecordKey,
        updates: FieldUpdates,
    ) -> Result<WorkerRecord, StoreError> {
        let mut records = self.records.write();
        let record = records
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;

        let old = record.clone();
        record.apply(&updates, Utc::now());
        let new = record.clone();
        self.publish(RecordChange::modified(old, new.clone()));
        Ok(new)
    }

    async fn query_by_status(
        &self,
        status: WorkerStatus,
        limit: Option<usize>,
    ) -> Result<Vec<WorkerRecord>, StoreError> {
        let records = self.records.read();
        Ok(records
            .values()
            .filter(|r| r.status == status)
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn scan_all(&self) -> Result<Vec<WorkerRecord>, StoreError> {
        Ok(self.records.read().values().cloned().collect())
    }

    async fn delete(&self, key: &RecordKey) -> Result<WorkerRecord, StoreError> {
        let mut records = self.records.write();
        let removed = records
            .remove(key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        self.publish(RecordChange::removed(removed.clone()));
        Ok(removed)
    }

    async fn delete_batch(&self, keys: &[RecordKey]) -> Result<usize, StoreError> {
        let mut records = self.records.write();
        let mut deleted = 0;
        for key in keys {
            if let Some(removed) = records.remove(key) {
                self.publish(RecordChange::removed(removed));
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}

impl ChangeStream for InMemoryLeaseStore {
    fn changes(&self) -> BoxStream<'static, Result<RecordChange, StoreError>> {
        BroadcastStream::new(self.changes.subscribe())
            .map(|item| {
                item.map_err(|err: BroadcastStreamRecvError| {
                    StoreError::Database(format!("change stream interrupted: {err}"))
                })
            })
            .boxed()
    }
}
