// Event bus
//
// Carries "launch a worker" requests from whoever notices the pool shrank
// to the replenishment trigger. Delivery is at-least-once from the
// subscriber's point of view; nothing here deduplicates.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::warn;

use crate::record::WorkerId;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

// ============================================================================
// PoolEvent
// ============================================================================

/// Something that should make the pool launch one worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PoolEvent {
    /// A worker moved RUNNING -> ASSIGNED
    WorkerLeased { worker_id: WorkerId, at: DateTime<Utc> },
}

impl PoolEvent {
    pub fn worker_leased(worker_id: WorkerId) -> Self {
        Self::WorkerLeased {
            worker_id,
            at: Utc::now(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::WorkerLeased { .. } => "worker_leased",
        }
    }
}

// ============================================================================
// EventBus Trait
// ============================================================================

/// Event bus errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EventBusError {
    /// Nobody is subscribed; the event was dropped
    #[error("no subscribers for {0}")]
    NoSubscribers(&'static str),
}

/// Publish/subscribe channel for [`PoolEvent`]s
#[async_trait]
pub trait EventBus: Send + Sync + 'static {
    /// Publish one event to every current subscriber
    async fn publish(&self, event: PoolEvent) -> Result<(), EventBusError>;

    /// Stream of events published from now on
    fn subscribe(&self) -> BoxStream<'static, PoolEvent>;
}

// ============================================================================
// InMemoryEventBus
// ============================================================================

/// Single-process [`EventBus`] over a tokio broadcast channel
///
/// A subscriber that falls more than the channel capacity behind loses the
/// oldest events; the loss is logged.
pub struct InMemoryEventBus {
    sender: broadcast::Sender<PoolEvent>,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::with_capacity(EVENT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, event: PoolEvent) -> Result<(), EventBusError> {
        let name = event.name();
        self.sender
            .send(event)
            .map(|_| ())
            .map_err(|_| EventBusError::NoSubscribers(name))
    }

    fn subscribe(&self) -> BoxStream<'static, PoolEvent> {
        BroadcastStream::new(self.sender.subscribe())
            .filter_map(|item| async move {
                match item {
                    Ok(event) => Some(event),
                    Err(err) => {
                        warn!(error = %err, "event subscriber lagged, events dropped");
                        None
                    }
                }
            })
            .boxed()
    }
}
