//! Single endpoint queue
//!
//! Pure data structure, no locking and no I/O. [`super::MessageStore`] wraps
//! one of these per `(identity, endpoint)` key.

use super::{OverflowPolicy, QueueStats, StoreConfig, StoredMessage};
use crate::error::{HubError, HubResult};
use crate::message::Message;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;

/// Result of a successful enqueue
#[derive(Debug)]
pub struct Enqueued {
    pub stored: StoredMessage,
    /// Entries dropped oldest-first to make room
    pub evicted: Vec<u64>,
}

/// Bounded FIFO with strictly increasing sequence numbers
#[derive(Debug)]
pub struct EndpointQueue {
    name: String,
    entries: VecDeque<StoredMessage>,
    next_sequence: u64,
    /// Lowest sequence number that has not been handed out by `dequeue`
    cursor: u64,
    /// Highest acknowledged sequence number, 0 when nothing was acked
    low_water_mark: u64,
    dropped: u64,
    expired: u64,
    config: StoreConfig,
}

impl EndpointQueue {
    pub fn new<S: Into<String>>(name: S, config: StoreConfig) -> Self {
        Self {
            name: name.into(),
            entries: VecDeque::new(),
            next_sequence: 1,
            cursor: 1,
            low_water_mark: 0,
            dropped: 0,
            expired: 0,
            config,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append a message, evicting the oldest entries if the queue is full
    pub fn enqueue(&mut self, message: Message, now: DateTime<Utc>) -> HubResult<Enqueued> {
        let mut evicted = Vec::new();

        if self.entries.len() >= self.config.max_depth {
            match self.config.overflow {
                OverflowPolicy::RejectNew => {
                    self.dropped += 1;
                    return Err(HubError::QueueFull {
                        queue: self.name.clone(),
                        depth: self.entries.len(),
                    });
                }
                OverflowPolicy::DropOldest => {
                    while self.entries.len() >= self.config.max_depth.max(1) {
                        match self.entries.pop_front() {
                            Some(oldest) => {
                                self.dropped += 1;
                                evicted.push(oldest.sequence);
                            }
                            None => break,
                        }
                    }
                }
            }
        }

        let stored = StoredMessage {
            sequence: self.next_sequence,
            attempts: 0,
            stored_at: now,
            message,
        };
        self.next_sequence += 1;
        self.entries.push_back(stored.clone());

        Ok(Enqueued { stored, evicted })
    }

    /// Re-insert an entry recovered from a persistence log
    pub fn restore(&mut self, entry: StoredMessage) {
        if entry.sequence <= self.low_water_mark {
            return;
        }
        self.next_sequence = self.next_sequence.max(entry.sequence + 1);
        let position = self
            .entries
            .iter()
            .position(|e| e.sequence > entry.sequence)
            .unwrap_or(self.entries.len());
        if position > 0 && self.entries[position - 1].sequence == entry.sequence {
            return;
        }
        self.entries.insert(position, entry);
        self.cursor = self.entries.front().map_or(self.next_sequence, |e| e.sequence);
    }

    /// Hand out the next entry not yet dequeued, in sequence order
    ///
    /// The entry stays in the queue until acknowledged.
    pub fn dequeue(&mut self, now: DateTime<Utc>) -> Option<StoredMessage> {
        self.purge_expired(now);

        let cursor = self.cursor;
        let entry = self.entries.iter_mut().find(|e| e.sequence >= cursor)?;
        entry.attempts += 1;
        self.cursor = entry.sequence + 1;
        Some(entry.clone())
    }

    /// Remove every entry up to and including `sequence`
    pub fn ack(&mut self, sequence: u64) -> Vec<u64> {
        let mut removed = Vec::new();
        while let Some(front) = self.entries.front() {
            if front.sequence > sequence {
                break;
            }
            if let Some(entry) = self.entries.pop_front() {
                removed.push(entry.sequence);
            }
        }

        self.low_water_mark = self.low_water_mark.max(sequence.min(self.next_sequence - 1));
        if self.cursor <= sequence {
            self.cursor = sequence + 1;
        }
        removed
    }

    /// Make every unacknowledged entry eligible for dequeue again
    pub fn rewind(&mut self) {
        self.cursor = self
            .entries
            .front()
            .map_or(self.next_sequence, |e| e.sequence);
    }

    /// Drop entries older than the configured time-to-live
    pub fn purge_expired(&mut self, now: DateTime<Utc>) -> Vec<u64> {
        let mut purged = Vec::new();
        let Some(ttl) = self.config.time_to_live else {
            return purged;
        };
        let Ok(ttl) = chrono::Duration::from_std(ttl) else {
            return purged;
        };

        while let Some(front) = self.entries.front() {
            if front.stored_at + ttl > now {
                break;
            }
            if let Some(entry) = self.entries.pop_front() {
                self.expired += 1;
                purged.push(entry.sequence);
            }
        }
        purged
    }

    pub fn entries(&self) -> impl Iterator<Item = &StoredMessage> {
        self.entries.iter()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            depth: self.entries.len(),
            dropped: self.dropped,
            expired: self.expired,
            next_sequence: self.next_sequence,
            low_water_mark: self.low_water_mark,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use std::time::Duration;

    fn msg(id: &str) -> Message {
        Message::builder(Identity::device("leaf-1"), id.as_bytes().to_vec())
            .message_id(id)
            .build()
    }

    fn config(max_depth: usize) -> StoreConfig {
        StoreConfig {
            max_depth,
            time_to_live: None,
            overflow: OverflowPolicy::DropOldest,
        }
    }

    #[test]
    fn test_sequences_strictly_increase() {
        let mut queue = EndpointQueue::new("q", config(10));
        let now = Utc::now();
        let a = queue.enqueue(msg("a"), now).unwrap().stored.sequence;
        let b = queue.enqueue(msg("b"), now).unwrap().stored.sequence;
        queue.ack(b);
        let c = queue.enqueue(msg("c"), now).unwrap().stored.sequence;
        assert!(a < b && b < c);
    }

    #[test]
    fn test_drop_oldest_on_overflow() {
        let mut queue = EndpointQueue::new("q", config(3));
        let now = Utc::now();
        for id in ["m1", "m2", "m3", "m4", "m5"] {
            queue.enqueue(msg(id), now).unwrap();
        }

        let ids: Vec<_> = queue
            .entries()
            .map(|e| e.message.message_id().unwrap().to_string())
            .collect();
        assert_eq!(ids, vec!["m3", "m4", "m5"]);
        assert_eq!(queue.stats().dropped, 2);
    }

    #[test]
    fn test_reject_new_on_overflow() {
        let mut queue = EndpointQueue::new(
            "q",
            StoreConfig {
                overflow: OverflowPolicy::RejectNew,
                ..config(1)
            },
        );
        let now = Utc::now();
        queue.enqueue(msg("m1"), now).unwrap();
        let result = queue.enqueue(msg("m2"), now);
        assert!(matches!(result, Err(HubError::QueueFull { depth: 1, .. })));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.stats().dropped, 1);
    }

    #[test]
    fn test_dequeue_does_not_remove_until_ack() {
        let mut queue = EndpointQueue::new("q", config(10));
        let now = Utc::now();
        queue.enqueue(msg("m1"), now).unwrap();
        queue.enqueue(msg("m2"), now).unwrap();

        let first = queue.dequeue(now).unwrap();
        assert_eq!(first.message.message_id(), Some("m1"));
        assert_eq!(first.attempts, 1);
        assert_eq!(queue.len(), 2);

        let second = queue.dequeue(now).unwrap();
        assert_eq!(second.message.message_id(), Some("m2"));
        assert!(queue.dequeue(now).is_none());

        assert_eq!(queue.ack(first.sequence), vec![first.sequence]);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.stats().low_water_mark, first.sequence);
    }

    #[test]
    fn test_ack_removes_through_sequence() {
        let mut queue = EndpointQueue::new("q", config(10));
        let now = Utc::now();
        for id in ["m1", "m2", "m3"] {
            queue.enqueue(msg(id), now).unwrap();
        }
        let removed = queue.ack(2);
        assert_eq!(removed, vec![1, 2]);
        assert_eq!(queue.dequeue(now).unwrap().message.message_id(), Some("m3"));
    }

    #[test]
    fn test_rewind_redelivers_in_order() {
        let mut queue = EndpointQueue::new("q", config(10));
        let now = Utc::now();
        queue.enqueue(msg("m1"), now).unwrap();
        queue.enqueue(msg("m2"), now).unwrap();

        queue.dequeue(now);
        queue.dequeue(now);
        queue.rewind();

        let again = queue.dequeue(now).unwrap();
        assert_eq!(again.message.message_id(), Some("m1"));
        assert_eq!(again.attempts, 2);
    }

    #[test]
    fn test_expired_entries_are_purged() {
        let mut queue = EndpointQueue::new(
            "q",
            StoreConfig {
                time_to_live: Some(Duration::from_secs(60)),
                ..config(10)
            },
        );
        let now = Utc::now();
        queue
            .enqueue(msg("old"), now - chrono::Duration::seconds(120))
            .unwrap();
        queue.enqueue(msg("fresh"), now).unwrap();

        let next = queue.dequeue(now).unwrap();
        assert_eq!(next.message.message_id(), Some("fresh"));
        assert_eq!(queue.stats().expired, 1);
    }

    #[test]
    fn test_restore_keeps_order_and_sequence() {
        let mut original = EndpointQueue::new("q", config(10));
        let now = Utc::now();
        let entries: Vec<_> = ["m1", "m2", "m3"]
            .iter()
            .map(|id| original.enqueue(msg(id), now).unwrap().stored)
            .collect();

        let mut recovered = EndpointQueue::new("q", config(10));
        recovered.restore(entries[2].clone());
        recovered.restore(entries[0].clone());
        recovered.restore(entries[1].clone());
        recovered.restore(entries[1].clone());

        assert_eq!(recovered.len(), 3);
        assert_eq!(recovered.dequeue(now).unwrap().sequence, 1);
        let next = recovered.enqueue(msg("m4"), now).unwrap();
        assert_eq!(next.stored.sequence, 4);
    }
}
