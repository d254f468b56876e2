//! PostgreSQL implementation of LeaseStore
//!
//! Production persistence using PostgreSQL with:
//! - Status-conditional writes as a single `UPDATE ... WHERE status = $expected`
//! - A (partition, status) index for lease candidate lookup
//! - A trigger-maintained change table consumed as a work queue by the
//!   change stream (claimed with `SKIP LOCKED`, deleted once consumed)

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument, trace, warn};

use super::store::*;
use crate::record::{
    FieldUpdates, RecordKey, WorkerId, WorkerRecord, WorkerStatus, DEFAULT_PARTITION,
};

const RECORD_COLUMNS: &str = "partition_key, sort_key, worker_id, status, external_handle, \
     network_address, assigned_to, error_detail, created_at, updated_at";

/// PostgreSQL implementation of LeaseStore
///
/// Point operations address records by their full key. Queries, scans and
/// the change stream only see the store's partition.
///
/// # Example
///
/// ```ignore
/// use warmpool::PostgresLeaseStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/warmpool").await?;
/// let store = PostgresLeaseStore::new(pool);
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresLeaseStore {
    pool: PgPool,
    partition: String,
    feed: PostgresChangeFeedConfig,
}

impl PostgresLeaseStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            partition: DEFAULT_PARTITION.to_string(),
            feed: PostgresChangeFeedConfig::default(),
        }
    }

    /// Connect to `database_url` and build a store
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url).await.map_err(|e| {
            error!("Failed to connect to database: {}", e);
            StoreError::Database(e.to_string())
        })?;
        Ok(Self::new(pool))
    }

    /// Scope queries, scans and the change stream to `partition`
    pub fn with_partition(mut self, partition: impl Into<String>) -> Self {
        self.partition = partition.into();
        self
    }

    pub fn partition(&self) -> &str {
        &self.partition
    }

    /// Set the change feed polling configuration
    pub fn with_change_feed(mut self, config: PostgresChangeFeedConfig) -> Self {
        self.feed = config;
        self
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled schema migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    /// Drop changes of this partition recorded more than `older_than` ago,
    /// consumed or not; returns how many were removed
    #[instrument(skip(self))]
    pub async fn prune_changes(&self, older_than: Duration) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM worker_pool_changes
            WHERE partition_key = $1
              AND recorded_at <= NOW() - make_interval(secs => $2::float8)
            "#,
        )
        .bind(&self.partition)
        .bind(older_than.as_secs_f64())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to prune changes: {}", e);
            StoreError::Database(e.to_string())
        })?;

        debug!(pruned = result.rows_affected(), "Pruned change feed");
        Ok(result.rows_affected())
    }

    /// Shared body of the conditional and unconditional update paths
    async fn write_fields(
        &self,
        key: &RecordKey,
        expected: Option<WorkerStatus>,
        updates: &FieldUpdates,
    ) -> Result<Option<WorkerRecord>, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE worker_pool_records SET
                status          = COALESCE($3, status),
                external_handle = COALESCE($4, external_handle),
                network_address = COALESCE($5, network_address),
                assigned_to     = COALESCE($6, assigned_to),
                error_detail    = COALESCE($7, error_detail),
                updated_at      = GREATEST(updated_at, now())
            WHERE partition_key = $1 AND sort_key = $2
              AND ($8::text IS NULL OR status = $8)
            RETURNING {RECORD_COLUMNS}
            "#
        ))
        .bind(&key.partition)
        .bind(&key.sort)
        .bind(updates.status.map(|s| s.as_str()))
        .bind(&updates.external_handle)
        .bind(&updates.network_address)
        .bind(&updates.assigned_to)
        .bind(&updates.error_detail)
        .bind(expected.map(|s| s.as_str()))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to update worker record: {}", e);
            StoreError::Database(e.to_string())
        })?;

        row.as_ref().map(record_from_row).transpose()
    }
}

#[async_trait]
impl LeaseStore for PostgresLeaseStore {
    #[instrument(skip(self, record), fields(key = %record.key))]
    async fn create(&self, record: &WorkerRecord) -> Result<(), StoreError> {
        let result = sqlx::query(&format!(
            r#"
            INSERT INTO worker_pool_records ({RECORD_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (partition_key, sort_key) DO NOTHING
            "#
        ))
        .bind(&record.key.partition)
        .bind(&record.key.sort)
        .bind(record.worker_id.as_str())
        .bind(record.status.as_str())
        .bind(&record.external_handle)
        .bind(&record.network_address)
        .bind(&record.assigned_to)
        .bind(&record.error_detail)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to create worker record: {}", e);
            StoreError::Database(e.to_string())
        })?;

        if result.rows_affected() == 0 {
            return Err(StoreError::AlreadyExists(record.key.clone()));
        }

        debug!(worker_id = %record.worker_id, "created worker record");
        Ok(())
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn get(&self, key: &RecordKey) -> Result<Option<WorkerRecord>, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {RECORD_COLUMNS}
            FROM worker_pool_records
            WHERE partition_key = $1 AND sort_key = $2
            "#
        ))
        .bind(&key.partition)
        .bind(&key.sort)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        row.as_ref().map(record_from_row).transpose()
    }

    #[instrument(skip(self, updates), fields(key = %key))]
    async fn conditional_transition(
        &self,
        key: &RecordKey,
        expected: WorkerStatus,
        updates: FieldUpdates,
    ) -> Result<WorkerRecord, StoreError> {
        check_transition(expected, &updates)?;

        let record = self
            .write_fields(key, Some(expected), &updates)
            .await?
            .ok_or_else(|| StoreError::ConditionFailed {
                key: key.clone(),
                expected,
            })?;

        debug!(status = %record.status, "transitioned worker record");
        Ok(record)
    }

    #[instrument(skip(self, updates), fields(key = %key))]
    async fn update(
        &self,
        key: &RecordKey,
        updates: FieldUpdates,
    ) -> Result<WorkerRecord, StoreError> {
        self.write_fields(key, None, &updates)
            .await?
            .ok_or_else(|| StoreError::NotFound(key.clone()))
    }

    #[instrument(skip(self))]
    async fn query_by_status(
        &self,
        status: WorkerStatus,
        limit: Option<usize>,
    ) -> Result<Vec<WorkerRecord>, StoreError> {
        // LIMIT NULL means no limit
        let limit = limit.map(|l| l as i64);
        let rows = sqlx::query(&format!(
            r#"
            SELECT {RECORD_COLUMNS}
            FROM worker_pool_records
            WHERE partition_key = $1 AND status = $2
            LIMIT $3
            "#
        ))
        .bind(&self.partition)
        .bind(status.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to query worker records by status: {}", e);
            StoreError::Database(e.to_string())
        })?;

        rows.iter().map(record_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn scan_all(&self) -> Result<Vec<WorkerRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM worker_pool_records WHERE partition_key = $1"
        ))
        .bind(&self.partition)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        rows.iter().map(record_from_row).collect()
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn delete(&self, key: &RecordKey) -> Result<WorkerRecord, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            DELETE FROM worker_pool_records
            WHERE partition_key = $1 AND sort_key = $2
            RETURNING {RECORD_COLUMNS}
            "#
        ))
        .bind(&key.partition)
        .bind(&key.sort)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?
        .ok_or_else(|| StoreError::NotFound(key.clone()))?;

        record_from_row(&row)
    }

    #[instrument(skip(self, keys), fields(count = keys.len()))]
    async fn delete_batch(&self, keys: &[RecordKey]) -> Result<usize, StoreError> {
        if keys.is_empty() {
            return Ok(0);
        }

        let partitions: Vec<String> = keys.iter().map(|k| k.partition.clone()).collect();
        let sorts: Vec<String> = keys.iter().map(|k| k.sort.clone()).collect();

        let result = sqlx::query(
            r#"
            DELETE FROM worker_pool_records
            WHERE (partition_key, sort_key) IN (
                SELECT * FROM UNNEST($1::text[], $2::text[])
            )
            "#,
        )
        .bind(partitions)
        .bind(sorts)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to batch delete worker records: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(result.rows_affected() as usize)
    }
}

impl ChangeStream for PostgresLeaseStore {
    /// Consume the partition's change queue
    ///
    /// Rows are claimed in `seq` order with `FOR UPDATE SKIP LOCKED`, so
    /// concurrent subscribers split the queue between them, and a change
    /// whose transaction commits late is still delivered once it is visible.
    /// A change is deleted when the consumer asks for the next one; claimed
    /// rows that are never acknowledged become claimable again after
    /// `claim_timeout`.
    fn changes(&self) -> BoxStream<'static, Result<RecordChange, StoreError>> {
        let feed = ChangeFeed {
            pool: self.pool.clone(),
            partition: self.partition.clone(),
            interval: self.feed.min_interval,
            config: self.feed.clone(),
            pending: VecDeque::new(),
            delivered: Vec::new(),
        };

        stream::unfold(feed, |mut feed| async move {
            loop {
                // Asking for the next item acknowledges the previous one
                if let Err(e) = feed.acknowledge().await {
                    warn!(error = %e, "Failed to acknowledge consumed changes");
                }

                if let Some((seq, item)) = feed.pending.pop_front() {
                    feed.delivered.push(seq);
                    return Some((item, feed));
                }

                match feed.claim().await {
                    Ok(0) => {
                        tokio::time::sleep(feed.interval).await;
                        feed.back_off();
                    }
                    Ok(_) => feed.interval = feed.config.min_interval,
                    Err(e) => {
                        warn!(error = %e, "Change feed poll failed");
                        tokio::time::sleep(feed.interval).await;
                        feed.back_off();
                        return Some((Err(e), feed));
                    }
                }
            }
        })
        .boxed()
    }
}

/// Change feed polling configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PostgresChangeFeedConfig {
    /// Poll interval while changes keep arriving
    #[serde(with = "duration_millis")]
    pub min_interval: Duration,

    /// Poll interval ceiling when idle
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Backoff multiplier when a poll finds nothing
    pub backoff_multiplier: f64,

    /// Maximum change rows claimed per poll
    pub batch_size: usize,

    /// How long a claimed, unacknowledged change stays invisible to
    /// other readers
    #[serde(with = "duration_millis")]
    pub claim_timeout: Duration,

    /// Age after which [`PostgresLeaseStore::prune_changes`] drops
    /// unconsumed changes
    #[serde(with = "duration_millis")]
    pub retention: Duration,
}

impl Default for PostgresChangeFeedConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(2),
            backoff_multiplier: 1.5,
            batch_size: 100,
            claim_timeout: Duration::from_secs(60),
            retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl PostgresChangeFeedConfig {
    /// Set minimum poll interval
    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    /// Set maximum poll interval
    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    /// Set batch size
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    pub fn with_claim_timeout(mut self, timeout: Duration) -> Self {
        self.claim_timeout = timeout;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }
}

struct ChangeFeed {
    pool: PgPool,
    partition: String,
    config: PostgresChangeFeedConfig,
    interval: Duration,
    /// Claimed but not yet handed out
    pending: VecDeque<(i64, Result<RecordChange, StoreError>)>,
    /// Handed out, deleted on the next pull
    delivered: Vec<i64>,
}

impl ChangeFeed {
    /// Claim the next batch into `pending`; returns how many rows were claimed
    async fn claim(&mut self) -> Result<usize, StoreError> {
        let rows = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT seq
                FROM worker_pool_changes
                WHERE partition_key = $1
                  AND (claimed_at IS NULL
                       OR claimed_at < NOW() - make_interval(secs => $3::float8))
                ORDER BY seq
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE worker_pool_changes c
            SET claimed_at = NOW()
            FROM claimable
            WHERE c.seq = claimable.seq
            RETURNING c.seq, c.old_image, c.new_image
            "#,
        )
        .bind(&self.partition)
        .bind(self.config.batch_size as i64)
        .bind(self.config.claim_timeout.as_secs_f64())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to claim changes: {}", e);
            StoreError::Database(e.to_string())
        })?;

        let mut claimed: Vec<(i64, Result<RecordChange, StoreError>)> = rows
            .iter()
            .map(|row| {
                let seq: i64 = row.get("seq");
                let old_image: Option<serde_json::Value> = row.get("old_image");
                let new_image: Option<serde_json::Value> = row.get("new_image");
                (seq, change_from_images(old_image, new_image))
            })
            .collect();
        // RETURNING order is unspecified
        claimed.sort_by_key(|(seq, _)| *seq);

        trace!(count = claimed.len(), "Claimed changes");
        let count = claimed.len();
        self.pending.extend(claimed);
        Ok(count)
    }

    /// Delete every change handed out so far
    async fn acknowledge(&mut self) -> Result<(), StoreError> {
        if self.delivered.is_empty() {
            return Ok(());
        }

        sqlx::query("DELETE FROM worker_pool_changes WHERE seq = ANY($1)")
            .bind(self.delivered.clone())
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        self.delivered.clear();
        Ok(())
    }

    fn back_off(&mut self) {
        let next = self.interval.as_secs_f64() * self.config.backoff_multiplier;
        self.interval = Duration::from_secs_f64(next).min(self.config.max_interval);
    }
}

/// Row image as produced by `to_jsonb(row)` in the change trigger
#[derive(Debug, Deserialize)]
struct RecordImage {
    partition_key: String,
    sort_key: String,
    worker_id: String,
    status: String,
    external_handle: Option<String>,
    network_address: Option<String>,
    assigned_to: Option<String>,
    error_detail: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<RecordImage> for WorkerRecord {
    type Error = StoreError;

    fn try_from(image: RecordImage) -> Result<Self, Self::Error> {
        Ok(WorkerRecord {
            key: RecordKey {
                partition: image.partition_key,
                sort: image.sort_key,
            },
            worker_id: WorkerId::new(image.worker_id),
            status: parse_status(&image.status)?,
            external_handle: image.external_handle,
            network_address: image.network_address,
            assigned_to: image.assigned_to,
            error_detail: image.error_detail,
            created_at: image.created_at,
            updated_at: image.updated_at,
        })
    }
}

fn change_from_images(
    old_image: Option<serde_json::Value>,
    new_image: Option<serde_json::Value>,
) -> Result<RecordChange, StoreError> {
    let decode = |image: Option<serde_json::Value>| -> Result<Option<WorkerRecord>, StoreError> {
        image
            .map(|value| {
                serde_json::from_value::<RecordImage>(value)
                    .map_err(|e| StoreError::Serialization(e.to_string()))
                    .and_then(WorkerRecord::try_from)
            })
            .transpose()
    };

    Ok(RecordChange {
        old_image: decode(old_image)?,
        new_image: decode(new_image)?,
    })
}

fn record_from_row(row: &PgRow) -> Result<WorkerRecord, StoreError> {
    let status: String = row.get("status");
    let worker_id: String = row.get("worker_id");

    Ok(WorkerRecord {
        key: RecordKey {
            partition: row.get("partition_key"),
            sort: row.get("sort_key"),
        },
        worker_id: WorkerId::new(worker_id),
        status: parse_status(&status)?,
        external_handle: row.get("external_handle"),
        network_address: row.get("network_address"),
        assigned_to: row.get("assigned_to"),
        error_detail: row.get("error_detail"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn parse_status(s: &str) -> Result<WorkerStatus, StoreError> {
    s.parse()
        .map_err(|e: crate::record::UnknownStatus| StoreError::Serialization(e.to_string()))
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
