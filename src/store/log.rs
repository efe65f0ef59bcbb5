//! Persistence seam for the message store
//!
//! The store keeps its authoritative state in memory. A [`MessageLog`] mirrors
//! every append and removal so that queues can be rebuilt after a restart via
//! [`super::MessageStore::recover`].

use super::{QueueKey, StoredMessage};
use crate::error::HubResult;
use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::Mutex;

/// Durable record of stored messages
#[async_trait]
pub trait MessageLog: Send + Sync {
    /// Record a newly stored entry
    async fn append(&self, key: &QueueKey, entry: &StoredMessage) -> HubResult<()>;

    /// Forget every entry of `key` up to and including `sequence`
    async fn remove_through(&self, key: &QueueKey, sequence: u64) -> HubResult<()>;

    /// Forget individual entries (evicted or expired)
    async fn remove(&self, key: &QueueKey, sequences: &[u64]) -> HubResult<()>;

    /// Every recorded entry, in any order
    async fn load(&self) -> HubResult<Vec<(QueueKey, StoredMessage)>>;
}

/// In-process log, used by tests and as the default when nothing durable is configured
#[derive(Debug, Default)]
pub struct MemoryLog {
    entries: Mutex<BTreeMap<(QueueKey, u64), StoredMessage>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

#[async_trait]
impl MessageLog for MemoryLog {
    async fn append(&self, key: &QueueKey, entry: &StoredMessage) -> HubResult<()> {
        self.entries
            .lock()
            .await
            .insert((key.clone(), entry.sequence), entry.clone());
        Ok(())
    }

    async fn remove_through(&self, key: &QueueKey, sequence: u64) -> HubResult<()> {
        self.entries
            .lock()
            .await
            .retain(|(k, seq), _| k != key || *seq > sequence);
        Ok(())
    }

    async fn remove(&self, key: &QueueKey, sequences: &[u64]) -> HubResult<()> {
        let mut entries = self.entries.lock().await;
        for sequence in sequences {
            entries.remove(&(key.clone(), *sequence));
        }
        Ok(())
    }

    async fn load(&self) -> HubResult<Vec<(QueueKey, StoredMessage)>> {
        Ok(self
            .entries
            .lock()
            .await
            .iter()
            .map(|((key, _), entry)| (key.clone(), entry.clone()))
            .collect())
    }
}
