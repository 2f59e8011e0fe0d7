//! Partitioned at-least-once event log
//!
//! Each topic is split into a fixed number of append-only partitions. A
//! message's key (the document id) picks its partition, so every event about
//! one document is ordered. Consumer groups track a committed offset per
//! partition; a message is redelivered until its offset is committed, which is
//! what a consumer restarting after a crash observes.
//!
//! Partitions keep at most `retention` messages. Older ones are dropped and a
//! group whose offset falls behind resumes at the oldest retained message.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Notify;

use crate::error::{Error, Result};
use crate::types::event::{dead_letter_topic, DeadLetter};

/// A message as stored in a partition
#[derive(Debug, Clone)]
pub struct Message {
    pub topic: String,
    pub partition: usize,
    pub offset: usize,
    pub key: String,
    pub payload: Vec<u8>,
    pub published_at: DateTime<Utc>,
}

/// Where a published message landed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Receipt {
    pub partition: usize,
    pub offset: usize,
}

/// Publishing side of the event channel
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<Receipt>;
}

/// Serialize `event` as JSON and publish it
pub async fn publish_json<T: Serialize + Sync>(
    publisher: &dyn EventPublisher,
    topic: &str,
    key: &str,
    event: &T,
) -> Result<Receipt> {
    let payload = serde_json::to_vec(event)?;
    publisher.publish(topic, key, payload).await
}

/// Retained messages per partition unless configured otherwise
pub const DEFAULT_RETENTION: usize = 10_000;

/// Retained tail of a partition; `base` is the offset of the first message
#[derive(Default)]
struct Segment {
    base: usize,
    messages: VecDeque<Message>,
}

impl Segment {
    /// Offset the next message will get
    fn end(&self) -> usize {
        self.base + self.messages.len()
    }

    /// Message at `offset`, or the oldest retained one if `offset` was dropped
    fn at_or_after(&self, offset: usize) -> Option<&Message> {
        self.messages.get(offset.saturating_sub(self.base))
    }
}

struct Partition {
    segment: Mutex<Segment>,
    notify: Notify,
}

struct TopicLog {
    partitions: Vec<Partition>,
}

impl TopicLog {
    fn new(count: usize) -> Self {
        Self {
            partitions: (0..count)
                .map(|_| Partition {
                    segment: Mutex::new(Segment::default()),
                    notify: Notify::new(),
                })
                .collect(),
        }
    }
}

struct BusInner {
    partitions: usize,
    retention: usize,
    topics: DashMap<String, Arc<TopicLog>>,
    /// (group, topic, partition) -> next offset to deliver
    offsets: DashMap<(String, String, usize), usize>,
}

/// In-process event bus
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

const REPLAY_GROUP: &str = "dead-letter-replay";

impl EventBus {
    /// Create a bus with `partitions` partitions per topic
    pub fn new(partitions: usize) -> Self {
        Self::with_retention(partitions, DEFAULT_RETENTION)
    }

    /// Like `new`, keeping at most `retention` messages per partition
    pub fn with_retention(partitions: usize, retention: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                partitions: partitions.max(1),
                retention: retention.max(1),
                topics: DashMap::new(),
                offsets: DashMap::new(),
            }),
        }
    }

    pub fn partitions(&self) -> usize {
        self.inner.partitions
    }

    fn topic(&self, name: &str) -> Arc<TopicLog> {
        let entry = self
            .inner
            .topics
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(TopicLog::new(self.inner.partitions)));
        Arc::clone(entry.value())
    }

    /// Stable partition for a key
    pub fn partition_for(&self, key: &str) -> usize {
        let digest = Sha256::digest(key.as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        (u64::from_be_bytes(prefix) % self.inner.partitions as u64) as usize
    }

    /// Join `group` on one partition of `topic`
    pub fn subscribe(&self, group: &str, topic: &str, partition: usize) -> Result<Consumer> {
        if partition >= self.inner.partitions {
            return Err(Error::validation(format!(
                "Partition {} out of range for {} partitions",
                partition, self.inner.partitions
            )));
        }
        Ok(Consumer {
            bus: self.clone(),
            log: self.topic(topic),
            group: group.to_string(),
            topic: topic.to_string(),
            partition,
        })
    }

    /// Move a group's committed offset, forcing redelivery from `offset`
    pub fn rewind(&self, group: &str, topic: &str, partition: usize, offset: usize) {
        self.inner
            .offsets
            .insert((group.to_string(), topic.to_string(), partition), offset);
    }

    /// Total messages ever published to `topic`, retained or not
    pub fn message_count(&self, topic: &str) -> usize {
        self.inner
            .topics
            .get(topic)
            .map(|log| log.partitions.iter().map(|p| p.segment.lock().end()).sum())
            .unwrap_or(0)
    }

    /// Messages currently held for `topic`
    pub fn retained_count(&self, topic: &str) -> usize {
        self.inner
            .topics
            .get(topic)
            .map(|log| log.partitions.iter().map(|p| p.segment.lock().messages.len()).sum())
            .unwrap_or(0)
    }

    /// Messages not yet committed by `group` on `topic`
    pub fn lag(&self, group: &str, topic: &str) -> usize {
        let Some(log) = self.inner.topics.get(topic).map(|l| Arc::clone(l.value())) else {
            return 0;
        };
        log.partitions
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let committed = self.committed(group, topic, i);
                let segment = p.segment.lock();
                segment.end().saturating_sub(committed.max(segment.base))
            })
            .sum()
    }

    fn committed(&self, group: &str, topic: &str, partition: usize) -> usize {
        self.inner
            .offsets
            .get(&(group.to_string(), topic.to_string(), partition))
            .map(|o| *o)
            .unwrap_or(0)
    }

    /// All dead-letter envelopes recorded for a primary topic
    pub fn dead_letters(&self, topic: &str) -> Result<Vec<DeadLetter>> {
        let Some(log) = self.inner.topics.get(&dead_letter_topic(topic)).map(|l| Arc::clone(l.value())) else {
            return Ok(Vec::new());
        };

        let mut envelopes = Vec::new();
        for partition in &log.partitions {
            for message in partition.segment.lock().messages.iter() {
                envelopes.push(serde_json::from_slice::<DeadLetter>(&message.payload)?);
            }
        }
        envelopes.sort_by_key(|e| e.failed_at);
        Ok(envelopes)
    }

    /// Republish dead-lettered payloads that have not been replayed yet
    ///
    /// Returns the number of messages sent back to the primary topic.
    pub async fn replay_dead_letters(&self, topic: &str) -> Result<usize> {
        let dlq = dead_letter_topic(topic);
        let mut replayed = 0;

        for partition in 0..self.inner.partitions {
            let consumer = self.subscribe(REPLAY_GROUP, &dlq, partition)?;
            while let Some(message) = consumer.try_next() {
                let envelope: DeadLetter = serde_json::from_slice(&message.payload)?;
                let payload = serde_json::to_vec(&envelope.payload)?;
                self.publish(&envelope.topic, &envelope.key, payload).await?;
                consumer.commit(&message);
                replayed += 1;
            }
        }

        if replayed > 0 {
            tracing::info!(topic, replayed, "Replayed dead-lettered events");
        }
        Ok(replayed)
    }
}

#[async_trait]
impl EventPublisher for EventBus {
    async fn publish(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<Receipt> {
        let partition = self.partition_for(key);
        let log = self.topic(topic);
        let slot = &log.partitions[partition];

        let (offset, dropped) = {
            let mut segment = slot.segment.lock();
            let offset = segment.end();
            segment.messages.push_back(Message {
                topic: topic.to_string(),
                partition,
                offset,
                key: key.to_string(),
                payload,
                published_at: Utc::now(),
            });
            let mut dropped = 0;
            while segment.messages.len() > self.inner.retention {
                segment.messages.pop_front();
                segment.base += 1;
                dropped += 1;
            }
            (offset, dropped)
        };
        if dropped > 0 {
            tracing::debug!(topic, partition, dropped, "Dropped messages past retention");
        }
        slot.notify.notify_waiters();

        tracing::debug!(topic, key, partition, offset, "Published event");
        Ok(Receipt { partition, offset })
    }
}

/// A consumer-group member bound to one partition
pub struct Consumer {
    bus: EventBus,
    log: Arc<TopicLog>,
    group: String,
    topic: String,
    partition: usize,
}

impl Consumer {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> usize {
        self.partition
    }

    /// The message at the committed offset, if one has been published
    pub fn try_next(&self) -> Option<Message> {
        let offset = self.bus.committed(&self.group, &self.topic, self.partition);
        self.log.partitions[self.partition]
            .segment
            .lock()
            .at_or_after(offset)
            .cloned()
    }

    /// Wait for the message at the committed offset
    pub async fn next(&self) -> Message {
        let slot = &self.log.partitions[self.partition];
        loop {
            let notified = slot.notify.notified();
            tokio::pin!(notified);
            // register before checking so a publish in between is not missed
            notified.as_mut().enable();

            if let Some(message) = self.try_next() {
                return message;
            }
            notified.await;
        }
    }

    /// Acknowledge `message`; it will not be delivered to this group again
    pub fn commit(&self, message: &Message) {
        let key = (self.group.clone(), self.topic.clone(), self.partition);
        let mut entry = self.bus.inner.offsets.entry(key).or_insert(0);
        if *entry <= message.offset {
            *entry = message.offset + 1;
        }
    }
}
