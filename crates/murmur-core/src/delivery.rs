//! At-least-once delivery of published messages.
//!
//! Messages are published to a [`MessageBus`] with a time-to-live and
//! consumed by a [`ConsumerPool`] that runs a [`DeliveryHandler`] per
//! message. Success acks the message; failure nacks it with requeue, so
//! the bus redelivers. Handlers must tolerate redelivery; [`Deduplicator`]
//! helps with that. A message whose TTL passes before delivery is dropped.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use murmur_protocol::{kind, RoomId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::StoreError;
use crate::store::StoredMessage;

/// Bus errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    /// The bus was closed.
    #[error("Message bus closed")]
    Closed,

    /// Ack or nack for a tag that is not in flight.
    #[error("Unknown delivery tag: {0}")]
    UnknownTag(u64),

    /// The broker could not be reached.
    #[error("Message bus unavailable: {0}")]
    Unavailable(String),
}

/// A handler failed to process a delivery.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Handler failed: {0}")]
    Handler(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Bus(#[from] BusError),
}

/// A message on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusMessage {
    /// Stable id; redeliveries carry the same id.
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub room_id: RoomId,
    pub sender_id: UserId,
    pub content: Value,
    pub timestamp: DateTime<Utc>,
}

impl BusMessage {
    /// Create a message with a fresh random id.
    #[must_use]
    pub fn new(
        kind: impl Into<String>,
        room_id: RoomId,
        sender_id: UserId,
        content: impl Into<Value>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind: kind.into(),
            room_id,
            sender_id,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    /// The bus form of a persisted chat message. The id derives from the
    /// persisted id, so publishing it twice yields duplicates a
    /// [`Deduplicator`] can drop.
    #[must_use]
    pub fn from_stored(message: &StoredMessage) -> Self {
        Self {
            id: format!("message-{}", message.id),
            kind: kind::NEW_MESSAGE.to_string(),
            room_id: message.room_id,
            sender_id: message.sender_id,
            content: Value::String(message.content.clone()),
            timestamp: message.created_at,
        }
    }
}

/// Opaque handle for acking one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeliveryTag(pub u64);

/// A message handed to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub message: BusMessage,
    /// 1 on first delivery.
    pub attempt: u32,
}

impl Delivery {
    /// Whether an earlier attempt was nacked.
    #[must_use]
    pub fn is_redelivery(&self) -> bool {
        self.attempt > 1
    }
}

/// A durable topic with explicit acknowledgement.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish a message that expires after `ttl` if undelivered.
    async fn publish(&self, message: BusMessage, ttl: Duration) -> Result<(), BusError>;

    /// Wait for the next message. `None` once the bus is closed.
    async fn next_delivery(&self) -> Result<Option<Delivery>, BusError>;

    /// Acknowledge a delivery, removing the message for good.
    async fn ack(&self, tag: DeliveryTag) -> Result<(), BusError>;

    /// Reject a delivery, optionally requeueing it.
    async fn nack(&self, tag: DeliveryTag, requeue: bool) -> Result<(), BusError>;
}

/// Processes one delivered message.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    /// Returning an error causes redelivery.
    async fn handle(&self, message: &BusMessage) -> Result<(), DeliveryError>;
}

/// Bus configuration.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// TTL of published messages.
    pub message_ttl: Duration,
    /// Consumer worker count.
    pub workers: usize,
    /// Pause after a bus error before polling again.
    pub error_backoff: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            message_ttl: Duration::from_secs(30),
            workers: 4,
            error_backoff: Duration::from_secs(1),
        }
    }
}

#[derive(Debug)]
struct Queued {
    message: BusMessage,
    expires_at: Instant,
    attempts: u32,
}

#[derive(Debug, Default)]
struct BusState {
    ready: VecDeque<Queued>,
    in_flight: HashMap<u64, Queued>,
    next_tag: u64,
    closed: bool,
}

/// Bus counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusStats {
    pub pending: usize,
    pub in_flight: usize,
    pub published: u64,
    pub acked: u64,
    pub requeued: u64,
    pub expired: u64,
}

/// In-process [`MessageBus`]: a FIFO with per-message expiry and
/// requeue-to-tail on nack.
#[derive(Debug, Default)]
pub struct MemoryBus {
    state: Mutex<BusState>,
    notify: Notify,
    published: AtomicU64,
    acked: AtomicU64,
    requeued: AtomicU64,
    expired: AtomicU64,
}

impl MemoryBus {
    /// An empty, open bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop handing out deliveries. Waiting consumers get `None`.
    pub async fn close(&self) {
        self.state.lock().await.closed = true;
        self.notify.notify_waiters();
    }

    /// Queue sizes and lifetime counters.
    pub async fn stats(&self) -> BusStats {
        let state = self.state.lock().await;
        BusStats {
            pending: state.ready.len(),
            in_flight: state.in_flight.len(),
            published: self.published.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
        }
    }

    fn take_ready(&self, state: &mut BusState) -> Option<Delivery> {
        let now = Instant::now();
        while let Some(mut queued) = state.ready.pop_front() {
            if queued.expires_at <= now {
                self.expired.fetch_add(1, Ordering::Relaxed);
                debug!(id = %queued.message.id, "Dropping expired message");
                continue;
            }
            queued.attempts += 1;
            state.next_tag += 1;
            let tag = state.next_tag;
            let delivery = Delivery {
                tag: DeliveryTag(tag),
                message: queued.message.clone(),
                attempt: queued.attempts,
            };
            state.in_flight.insert(tag, queued);
            return Some(delivery);
        }
        None
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, message: BusMessage, ttl: Duration) -> Result<(), BusError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(BusError::Closed);
        }
        trace!(id = %message.id, "Publishing");
        state.ready.push_back(Queued {
            message,
            expires_at: Instant::now() + ttl,
            attempts: 0,
        });
        drop(state);
        self.published.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_one();
        Ok(())
    }

    async fn next_delivery(&self) -> Result<Option<Delivery>, BusError> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock().await;
                if state.closed {
                    return Ok(None);
                }
                if let Some(delivery) = self.take_ready(&mut state) {
                    return Ok(Some(delivery));
                }
            }

            notified.await;
        }
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<(), BusError> {
        let mut state = self.state.lock().await;
        state
            .in_flight
            .remove(&tag.0)
            .ok_or(BusError::UnknownTag(tag.0))?;
        self.acked.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn nack(&self, tag: DeliveryTag, requeue: bool) -> Result<(), BusError> {
        let mut state = self.state.lock().await;
        let queued = state
            .in_flight
            .remove(&tag.0)
            .ok_or(BusError::UnknownTag(tag.0))?;

        if requeue && queued.expires_at > Instant::now() {
            state.ready.push_back(queued);
            drop(state);
            self.requeued.fetch_add(1, Ordering::Relaxed);
            self.notify.notify_one();
        }
        Ok(())
    }
}

/// Worker tasks consuming a bus.
pub struct ConsumerPool {
    workers: Vec<JoinHandle<()>>,
}

impl ConsumerPool {
    /// Spawn `config.workers` consumers. They stop when `shutdown` is
    /// cancelled or the bus closes.
    #[must_use]
    pub fn spawn(
        bus: Arc<dyn MessageBus>,
        handler: Arc<dyn DeliveryHandler>,
        config: &BusConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let count = config.workers.max(1);
        let workers = (0..count)
            .map(|worker| {
                tokio::spawn(consume(
                    worker,
                    Arc::clone(&bus),
                    Arc::clone(&handler),
                    config.error_backoff,
                    shutdown.clone(),
                ))
            })
            .collect();
        info!(workers = count, "Consumer pool started");
        Self { workers }
    }

    /// Wait for every worker to exit.
    pub async fn join(self) {
        for worker in self.workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "Consumer worker ended abnormally");
            }
        }
    }
}

async fn consume(
    worker: usize,
    bus: Arc<dyn MessageBus>,
    handler: Arc<dyn DeliveryHandler>,
    backoff: Duration,
    shutdown: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            next = bus.next_delivery() => next,
        };

        let delivery = match next {
            Ok(Some(delivery)) => delivery,
            Ok(None) => break,
            Err(e) => {
                warn!(worker, error = %e, "Bus receive failed");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = time::sleep(backoff) => continue,
                }
            }
        };

        match run_handler(&handler, &delivery.message).await {
            Ok(()) => {
                if let Err(e) = bus.ack(delivery.tag).await {
                    warn!(worker, id = %delivery.message.id, error = %e, "Ack failed");
                }
            }
            Err(e) => {
                warn!(
                    worker,
                    id = %delivery.message.id,
                    attempt = delivery.attempt,
                    error = %e,
                    "Delivery failed, requeueing"
                );
                if let Err(e) = bus.nack(delivery.tag, true).await {
                    warn!(worker, id = %delivery.message.id, error = %e, "Nack failed");
                }
            }
        }
    }
    debug!(worker, "Consumer stopped");
}

/// Run the handler on its own task so a panic becomes a failed delivery
/// instead of killing the worker with the message still in flight.
async fn run_handler(
    handler: &Arc<dyn DeliveryHandler>,
    message: &BusMessage,
) -> Result<(), DeliveryError> {
    let handler = Arc::clone(handler);
    let message = message.clone();
    match tokio::spawn(async move { handler.handle(&message).await }).await {
        Ok(result) => result,
        Err(e) => Err(DeliveryError::Handler(format!("handler panicked: {e}"))),
    }
}

/// Remembers recently processed message ids, up to a fixed capacity.
#[derive(Debug)]
pub struct Deduplicator {
    inner: Mutex<(HashSet<String>, VecDeque<String>)>,
    capacity: usize,
}

impl Deduplicator {
    /// Remember at most `capacity` ids.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new((HashSet::new(), VecDeque::new())),
            capacity: capacity.max(1),
        }
    }

    /// Whether `id` was already marked processed.
    pub async fn is_processed(&self, id: &str) -> bool {
        self.inner.lock().await.0.contains(id)
    }

    /// Mark `id` processed, forgetting the oldest id when full.
    /// Returns `false` if it was already marked.
    pub async fn mark_processed(&self, id: &str) -> bool {
        let mut guard = self.inner.lock().await;
        let (seen, order) = &mut *guard;
        if !seen.insert(id.to_string()) {
            return false;
        }
        order.push_back(id.to_string());
        while order.len() > self.capacity {
            if let Some(oldest) = order.pop_front() {
                seen.remove(&oldest);
            }
        }
        true
    }
}
