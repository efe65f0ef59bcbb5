//! Store-and-forward message queues
//!
//! One bounded FIFO per `(identity, endpoint)` pair. Entries receive strictly
//! increasing sequence numbers and stay queued until acknowledged, so a drain
//! that fails halfway can rewind and redeliver in order.

pub mod log;
pub mod queue;

pub use log::{MemoryLog, MessageLog};
pub use queue::EndpointQueue;

use crate::error::HubResult;
use crate::identity::Identity;
use crate::message::Message;
use crate::observability::metrics;
use crate::routing::EndpointId;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What to do when a queue reaches its depth limit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest entry to make room
    #[default]
    DropOldest,
    /// Refuse the new entry
    RejectNew,
}

/// Limits applied to every endpoint queue
#[derive(Debug, Clone, PartialEq)]
pub struct StoreConfig {
    pub max_depth: usize,
    /// None = entries never expire
    pub time_to_live: Option<Duration>,
    pub overflow: OverflowPolicy,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_depth: 10_000,
            time_to_live: Some(Duration::from_secs(7200)),
            overflow: OverflowPolicy::DropOldest,
        }
    }
}

/// Queue address: the sending identity and the destination endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueueKey {
    pub identity: Identity,
    pub endpoint: EndpointId,
}

impl QueueKey {
    pub fn new(identity: Identity, endpoint: EndpointId) -> Self {
        Self { identity, endpoint }
    }
}

impl fmt::Display for QueueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.identity, self.endpoint)
    }
}

/// A message held by the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub sequence: u64,
    /// Number of times the entry has been handed out by `dequeue`
    pub attempts: u32,
    pub stored_at: DateTime<Utc>,
    pub message: Message,
}

/// Point-in-time view of one queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub depth: usize,
    pub dropped: u64,
    pub expired: u64,
    pub next_sequence: u64,
    pub low_water_mark: u64,
}

struct QueueSlot {
    queue: Mutex<EndpointQueue>,
    notify: Arc<Notify>,
}

/// Bounded per-endpoint queues with optional write-through persistence
pub struct MessageStore {
    queues: DashMap<QueueKey, Arc<QueueSlot>>,
    config: StoreConfig,
    log: Option<Arc<dyn MessageLog>>,
}

impl MessageStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            queues: DashMap::new(),
            config,
            log: None,
        }
    }

    pub fn with_log(config: StoreConfig, log: Arc<dyn MessageLog>) -> Self {
        Self {
            queues: DashMap::new(),
            config,
            log: Some(log),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    fn slot(&self, key: &QueueKey) -> Arc<QueueSlot> {
        if let Some(slot) = self.queues.get(key) {
            return Arc::clone(slot.value());
        }
        let slot = self.queues.entry(key.clone()).or_insert_with(|| {
            Arc::new(QueueSlot {
                queue: Mutex::new(EndpointQueue::new(key.to_string(), self.config.clone())),
                notify: Arc::new(Notify::new()),
            })
        });
        Arc::clone(slot.value())
    }

    fn existing(&self, key: &QueueKey) -> Option<Arc<QueueSlot>> {
        self.queues.get(key).map(|slot| Arc::clone(slot.value()))
    }

    /// Append a message to the queue for `key`
    ///
    /// Fails with `QueueFull` only under [`OverflowPolicy::RejectNew`].
    pub async fn enqueue(&self, key: &QueueKey, message: Message) -> HubResult<StoredMessage> {
        let slot = self.slot(key);
        let (enqueued, depth) = {
            let mut queue = slot.queue.lock().await;
            let enqueued = match queue.enqueue(message, Utc::now()) {
                Ok(enqueued) => enqueued,
                Err(e) => {
                    metrics().store_dropped(1);
                    warn!(queue = %key, error = %e, "Rejected message, queue is full");
                    return Err(e);
                }
            };
            (enqueued, queue.len())
        };

        if !enqueued.evicted.is_empty() {
            metrics().store_dropped(enqueued.evicted.len() as u64);
            warn!(
                queue = %key,
                evicted = enqueued.evicted.len(),
                "Queue full, dropped oldest messages"
            );
            self.log_remove(key, &enqueued.evicted).await;
        }

        if let Some(log) = &self.log {
            if let Err(e) = log.append(key, &enqueued.stored).await {
                warn!(queue = %key, error = %e, "Failed to persist stored message");
            }
        }

        metrics().set_queue_depth(&key.to_string(), depth);
        debug!(queue = %key, sequence = enqueued.stored.sequence, depth, "Message stored");
        slot.notify.notify_one();
        Ok(enqueued.stored)
    }

    /// Hand out the next undelivered entry without removing it
    pub async fn dequeue(&self, key: &QueueKey) -> Option<StoredMessage> {
        let slot = self.existing(key)?;
        let (entry, expired) = {
            let mut queue = slot.queue.lock().await;
            let now = Utc::now();
            let expired = queue.purge_expired(now);
            (queue.dequeue(now), expired)
        };
        self.record_expired(key, &expired).await;
        entry
    }

    /// Hand out up to `max` undelivered entries in sequence order
    pub async fn dequeue_batch(&self, key: &QueueKey, max: usize) -> Vec<StoredMessage> {
        let Some(slot) = self.existing(key) else {
            return Vec::new();
        };
        let (batch, expired) = {
            let mut queue = slot.queue.lock().await;
            let now = Utc::now();
            let expired = queue.purge_expired(now);
            let mut batch = Vec::new();
            while batch.len() < max {
                match queue.dequeue(now) {
                    Some(entry) => batch.push(entry),
                    None => break,
                }
            }
            (batch, expired)
        };
        self.record_expired(key, &expired).await;
        batch
    }

    /// Remove every entry of `key` up to and including `sequence`
    pub async fn ack(&self, key: &QueueKey, sequence: u64) -> usize {
        let Some(slot) = self.existing(key) else {
            return 0;
        };
        let (removed, depth) = {
            let mut queue = slot.queue.lock().await;
            let removed = queue.ack(sequence);
            (removed, queue.len())
        };

        if !removed.is_empty() {
            metrics().store_acked(removed.len() as u64);
            if let Some(log) = &self.log {
                if let Err(e) = log.remove_through(key, sequence).await {
                    warn!(queue = %key, error = %e, "Failed to remove acknowledged messages from log");
                }
            }
        }
        metrics().set_queue_depth(&key.to_string(), depth);
        removed.len()
    }

    /// Make every unacknowledged entry of `key` eligible for redelivery
    pub async fn rewind(&self, key: &QueueKey) {
        if let Some(slot) = self.existing(key) {
            slot.queue.lock().await.rewind();
        }
    }

    pub async fn len(&self, key: &QueueKey) -> usize {
        match self.existing(key) {
            Some(slot) => slot.queue.lock().await.len(),
            None => 0,
        }
    }

    pub async fn is_empty(&self, key: &QueueKey) -> bool {
        self.len(key).await == 0
    }

    pub async fn stats(&self, key: &QueueKey) -> Option<QueueStats> {
        let slot = self.existing(key)?;
        let stats = slot.queue.lock().await.stats();
        Some(stats)
    }

    /// Messages currently held for `key`, oldest first
    pub async fn snapshot(&self, key: &QueueKey) -> Vec<StoredMessage> {
        match self.existing(key) {
            Some(slot) => slot.queue.lock().await.entries().cloned().collect(),
            None => Vec::new(),
        }
    }

    pub fn keys(&self) -> Vec<QueueKey> {
        self.queues.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Handle that is notified whenever a message is stored for `key`
    pub fn notifier(&self, key: &QueueKey) -> Arc<Notify> {
        Arc::clone(&self.slot(key).notify)
    }

    /// Drop expired entries from every queue
    pub async fn purge_expired(&self) -> usize {
        let mut total = 0;
        for key in self.keys() {
            let Some(slot) = self.existing(&key) else {
                continue;
            };
            let expired = slot.queue.lock().await.purge_expired(Utc::now());
            total += expired.len();
            self.record_expired(&key, &expired).await;
        }
        total
    }

    async fn record_expired(&self, key: &QueueKey, expired: &[u64]) {
        if expired.is_empty() {
            return;
        }
        metrics().store_expired(expired.len() as u64);
        info!(queue = %key, expired = expired.len(), "Expired stored messages");
        self.log_remove(key, expired).await;
        metrics().set_queue_depth(&key.to_string(), self.len(key).await);
    }

    async fn log_remove(&self, key: &QueueKey, sequences: &[u64]) {
        if let Some(log) = &self.log {
            if let Err(e) = log.remove(key, sequences).await {
                warn!(queue = %key, error = %e, "Failed to remove messages from log");
            }
        }
    }

    /// Rebuild queues from the configured log
    ///
    /// Returns the number of entries restored. Without a log this is a no-op.
    pub async fn recover(&self) -> HubResult<usize> {
        let Some(log) = &self.log else {
            return Ok(0);
        };

        let entries = log.load().await?;
        let count = entries.len();
        for (key, entry) in entries {
            let slot = self.slot(&key);
            let depth = {
                let mut queue = slot.queue.lock().await;
                queue.restore(entry);
                queue.len()
            };
            metrics().set_queue_depth(&key.to_string(), depth);
        }

        if count > 0 {
            info!(entries = count, queues = self.queues.len(), "Recovered stored messages");
        }
        Ok(count)
    }

    /// Periodically purge expired entries until cancelled
    pub fn spawn_cleanup(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let purged = store.purge_expired().await;
                        if purged > 0 {
                            debug!(purged, "Store cleanup pass");
                        }
                    }
                }
            }
        })
    }
}
