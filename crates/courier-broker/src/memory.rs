//! In-memory partitioned log
//!
//! Mirrors the semantics Courier relies on from a log-structured broker:
//! - Each topic is split into partitions; a message key always maps to the
//!   same partition, and order inside a partition is preserved
//! - Members of a consumer group own disjoint sets of partitions
//! - A group remembers a committed offset per partition; when membership
//!   changes every partition resumes from its committed offset, so anything
//!   a departed member consumed but never committed is delivered again

use crate::traits::{Broker, BrokerError, BrokerResult, Consumer, ConsumerConfig, StartFrom};
use async_trait::async_trait;
use bytes::Bytes;
use courier_core::Delivery;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

/// In-memory broker shared by clones
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    published: Notify,
    partitions: usize,
    fail_publish: AtomicBool,
}

#[derive(Default)]
struct State {
    topics: HashMap<String, Topic>,
    next_member: u64,
}

struct Topic {
    partitions: Vec<Vec<Bytes>>,
    groups: HashMap<String, Group>,
}

struct Group {
    members: Vec<u64>,
    committed: Vec<u64>,
    position: Vec<u64>,
    /// Highest offset ever handed out per partition, to flag redeliveries
    delivered: Vec<u64>,
}

impl Topic {
    fn new(partitions: usize) -> Self {
        Self {
            partitions: vec![Vec::new(); partitions],
            groups: HashMap::new(),
        }
    }
}

impl Group {
    fn owner_of(&self, partition: usize) -> Option<u64> {
        if self.members.is_empty() {
            None
        } else {
            Some(self.members[partition % self.members.len()])
        }
    }

    fn rebalance(&mut self) {
        self.position.clone_from(&self.committed);
    }
}

impl MemoryBroker {
    /// Broker with a single partition per topic
    pub fn new() -> Self {
        Self::with_partitions(1)
    }

    /// Broker with `partitions` partitions per topic
    pub fn with_partitions(partitions: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                published: Notify::new(),
                partitions: partitions.max(1),
                fail_publish: AtomicBool::new(false),
            }),
        }
    }

    /// Make every subsequent publish fail (or succeed again)
    pub fn fail_publishes(&self, fail: bool) {
        self.inner.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// All messages ever published to a topic, partition by partition
    pub fn messages(&self, topic: &str) -> Vec<Bytes> {
        let state = self.lock();
        state
            .topics
            .get(topic)
            .map(|t| t.partitions.iter().flatten().cloned().collect())
            .unwrap_or_default()
    }

    /// Committed offset of a group on one partition
    pub fn committed_offset(&self, topic: &str, group: &str, partition: usize) -> u64 {
        let state = self.lock();
        state
            .topics
            .get(topic)
            .and_then(|t| t.groups.get(group))
            .and_then(|g| g.committed.get(partition).copied())
            .unwrap_or(0)
    }

    /// Names of the consumer groups on a topic
    pub fn groups(&self, topic: &str) -> Vec<String> {
        let state = self.lock();
        let mut groups: Vec<String> = state
            .topics
            .get(topic)
            .map(|t| t.groups.keys().cloned().collect())
            .unwrap_or_default();
        groups.sort();
        groups
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // No invariant spans a panic inside the critical sections below
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn partition_for(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.inner.partitions as u64) as usize
    }

    fn join(&self, config: &ConsumerConfig) -> u64 {
        let partitions = self.inner.partitions;
        let mut state = self.lock();
        let member = state.next_member;
        state.next_member += 1;

        let topic = state
            .topics
            .entry(config.topic.clone())
            .or_insert_with(|| Topic::new(partitions));
        let lengths: Vec<u64> = topic.partitions.iter().map(|p| p.len() as u64).collect();

        let group = topic.groups.entry(config.group.clone()).or_insert_with(|| {
            let start = match config.start {
                StartFrom::Earliest => vec![0; lengths.len()],
                StartFrom::Latest => lengths.clone(),
            };
            Group {
                members: Vec::new(),
                committed: start.clone(),
                position: start.clone(),
                delivered: start,
            }
        });
        group.members.push(member);
        group.rebalance();

        debug!(
            "Member {} joined group {} on {} ({} members)",
            member,
            config.group,
            config.topic,
            group.members.len()
        );
        member
    }

    fn leave(&self, topic: &str, group: &str, member: u64) {
        let mut state = self.lock();
        if let Some(g) = state
            .topics
            .get_mut(topic)
            .and_then(|t| t.groups.get_mut(group))
        {
            g.members.retain(|m| *m != member);
            g.rebalance();
            debug!("Member {} left group {} on {}", member, group, topic);
        }
    }

    /// Hand out the next message owned by `member`, if any
    fn poll(&self, topic: &str, group: &str, member: u64) -> Option<Delivery> {
        let mut state = self.lock();
        let t = state.topics.get_mut(topic)?;
        let g = t.groups.get_mut(group)?;

        for (partition, log) in t.partitions.iter().enumerate() {
            if g.owner_of(partition) != Some(member) {
                continue;
            }
            let offset = g.position[partition];
            if let Some(payload) = log.get(offset as usize) {
                g.position[partition] = offset + 1;
                let redelivered = offset < g.delivered[partition];
                g.delivered[partition] = g.delivered[partition].max(offset + 1);

                let delivery = Delivery::new(
                    topic,
                    payload.clone(),
                    format!("{}:{}", partition, offset),
                );
                return Some(if redelivered {
                    delivery.redelivered()
                } else {
                    delivery
                });
            }
        }
        None
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    type Consumer = MemoryConsumer;

    async fn is_connected(&self) -> bool {
        !self.inner.fail_publish.load(Ordering::SeqCst)
    }

    async fn publish(&self, topic: &str, key: &str, payload: Bytes) -> BrokerResult<()> {
        if self.inner.fail_publish.load(Ordering::SeqCst) {
            return Err(BrokerError::Publish(format!(
                "broker unavailable, dropped message for {}",
                topic
            )));
        }

        let partition = self.partition_for(key);
        {
            let partitions = self.inner.partitions;
            let mut state = self.lock();
            let t = state
                .topics
                .entry(topic.to_string())
                .or_insert_with(|| Topic::new(partitions));
            t.partitions[partition].push(payload);
        }
        self.inner.published.notify_waiters();

        debug!("Published message with key {} to {}[{}]", key, topic, partition);
        Ok(())
    }

    async fn subscribe(&self, config: ConsumerConfig) -> BrokerResult<Self::Consumer> {
        let member = self.join(&config);
        Ok(MemoryConsumer {
            broker: self.clone(),
            topic: config.topic,
            group: config.group,
            member,
            block_timeout: config.block_timeout,
        })
    }

    async fn remove_group(&self, topic: &str, group: &str) -> BrokerResult<()> {
        let mut state = self.lock();
        if let Some(t) = state.topics.get_mut(topic) {
            if t.groups.remove(group).is_some() {
                debug!("Removed group {} on {}", group, topic);
            }
        }
        Ok(())
    }
}

/// Member of a consumer group on a [`MemoryBroker`]. Dropping it leaves the group.
pub struct MemoryConsumer {
    broker: MemoryBroker,
    topic: String,
    group: String,
    member: u64,
    block_timeout: Duration,
}

fn parse_tag(tag: &str) -> BrokerResult<(usize, u64)> {
    let (partition, offset) = tag
        .split_once(':')
        .ok_or_else(|| BrokerError::Commit(format!("malformed delivery tag {}", tag)))?;
    let partition = partition
        .parse()
        .map_err(|_| BrokerError::Commit(format!("malformed delivery tag {}", tag)))?;
    let offset = offset
        .parse()
        .map_err(|_| BrokerError::Commit(format!("malformed delivery tag {}", tag)))?;
    Ok((partition, offset))
}

#[async_trait]
impl Consumer for MemoryConsumer {
    async fn next(&mut self) -> Option<BrokerResult<Delivery>> {
        let deadline = tokio::time::Instant::now() + self.block_timeout;
        let inner = Arc::clone(&self.broker.inner);

        loop {
            // Register interest before polling so a publish in between is not missed
            let published = inner.published.notified();

            if let Some(delivery) = self.broker.poll(&self.topic, &self.group, self.member) {
                return Some(Ok(delivery));
            }

            if tokio::time::timeout_at(deadline, published).await.is_err() {
                return None;
            }
        }
    }

    async fn commit(&self, delivery: &Delivery) -> BrokerResult<()> {
        let (partition, offset) = parse_tag(&delivery.delivery_tag)?;
        let mut state = self.broker.lock();
        let group = state
            .topics
            .get_mut(&self.topic)
            .and_then(|t| t.groups.get_mut(&self.group))
            .ok_or_else(|| BrokerError::Commit(format!("unknown group {}", self.group)))?;

        let committed = group
            .committed
            .get_mut(partition)
            .ok_or_else(|| BrokerError::Commit(format!("unknown partition {}", partition)))?;
        *committed = (*committed).max(offset + 1);

        debug!("Committed {}[{}] up to {}", self.topic, partition, offset + 1);
        Ok(())
    }
}

impl Drop for MemoryConsumer {
    fn drop(&mut self) {
        self.broker.leave(&self.topic, &self.group, self.member);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(group: &str) -> ConsumerConfig {
        ConsumerConfig::new("tasks", group).block_timeout(Duration::from_millis(50))
    }

    async fn next_body(consumer: &mut MemoryConsumer) -> Option<String> {
        consumer
            .next()
            .await
            .map(|d| String::from_utf8(d.unwrap().payload.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_order_preserved_within_partition() {
        let broker = MemoryBroker::new();
        let mut consumer = broker.subscribe(config("g")).await.unwrap();

        for body in ["a", "b", "c"] {
            broker.publish("tasks", body, Bytes::from(body)).await.unwrap();
        }

        assert_eq!(next_body(&mut consumer).await.as_deref(), Some("a"));
        assert_eq!(next_body(&mut consumer).await.as_deref(), Some("b"));
        assert_eq!(next_body(&mut consumer).await.as_deref(), Some("c"));
        assert_eq!(next_body(&mut consumer).await, None);
    }

    #[tokio::test]
    async fn test_latest_skips_existing_messages() {
        let broker = MemoryBroker::new();
        broker.publish("tasks", "k", Bytes::from("old")).await.unwrap();

        let mut consumer = broker
            .subscribe(config("g").start(StartFrom::Latest))
            .await
            .unwrap();
        broker.publish("tasks", "k", Bytes::from("new")).await.unwrap();

        assert_eq!(next_body(&mut consumer).await.as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn test_each_group_sees_every_message() {
        let broker = MemoryBroker::new();
        let mut first = broker.subscribe(config("one")).await.unwrap();
        let mut second = broker.subscribe(config("two")).await.unwrap();

        broker.publish("tasks", "k", Bytes::from("m")).await.unwrap();

        assert_eq!(next_body(&mut first).await.as_deref(), Some("m"));
        assert_eq!(next_body(&mut second).await.as_deref(), Some("m"));
    }

    #[tokio::test]
    async fn test_uncommitted_message_is_redelivered_after_member_leaves() {
        let broker = MemoryBroker::new();
        let mut first = broker.subscribe(config("g")).await.unwrap();
        broker.publish("tasks", "k", Bytes::from("m1")).await.unwrap();
        broker.publish("tasks", "k", Bytes::from("m2")).await.unwrap();

        let d1 = first.next().await.unwrap().unwrap();
        first.commit(&d1).await.unwrap();
        let d2 = first.next().await.unwrap().unwrap();
        assert_eq!(&d2.payload[..], b"m2");
        drop(first);

        let mut second = broker.subscribe(config("g")).await.unwrap();
        let again = second.next().await.unwrap().unwrap();
        assert_eq!(&again.payload[..], b"m2");
        assert!(again.redelivered);
        assert_eq!(broker.committed_offset("tasks", "g", 0), 1);
    }

    #[tokio::test]
    async fn test_removed_group_forgets_its_offsets() {
        let broker = MemoryBroker::new();
        let consumer = broker
            .subscribe(config("g").start(StartFrom::Latest))
            .await
            .unwrap();
        drop(consumer);
        broker.publish("tasks", "k", Bytes::from("backlog")).await.unwrap();

        broker.remove_group("tasks", "g").await.unwrap();
        assert!(broker.groups("tasks").is_empty());
        broker.remove_group("tasks", "g").await.unwrap();
        broker.remove_group("missing", "g").await.unwrap();

        let mut fresh = broker
            .subscribe(config("g").start(StartFrom::Latest))
            .await
            .unwrap();
        broker.publish("tasks", "k", Bytes::from("new")).await.unwrap();
        assert_eq!(next_body(&mut fresh).await.as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn test_partitions_split_between_members() {
        let broker = MemoryBroker::with_partitions(2);
        let mut a = broker.subscribe(config("g")).await.unwrap();
        let mut b = broker.subscribe(config("g")).await.unwrap();

        for i in 0..20 {
            let key = format!("key-{}", i);
            broker.publish("tasks", &key, Bytes::from(key.clone())).await.unwrap();
        }

        let mut seen = Vec::new();
        while let Some(body) = next_body(&mut a).await {
            seen.push(body);
        }
        let from_a = seen.len();
        while let Some(body) = next_body(&mut b).await {
            seen.push(body);
        }

        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 20);
        assert!(from_a < 20);
    }

    #[tokio::test]
    async fn test_next_wakes_on_publish() {
        let broker = MemoryBroker::new();
        let mut consumer = broker
            .subscribe(ConsumerConfig::new("tasks", "g").block_timeout(Duration::from_secs(5)))
            .await
            .unwrap();

        let publisher = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.publish("tasks", "k", Bytes::from("late")).await.unwrap();
        });

        assert_eq!(next_body(&mut consumer).await.as_deref(), Some("late"));
    }

    #[tokio::test]
    async fn test_failing_publish() {
        let broker = MemoryBroker::new();
        broker.fail_publishes(true);

        let err = broker.publish("tasks", "k", Bytes::from("x")).await.unwrap_err();
        assert!(matches!(err, BrokerError::Publish(_)));
        assert!(broker.messages("tasks").is_empty());
    }

    #[tokio::test]
    async fn test_commit_rejects_malformed_tag() {
        let broker = MemoryBroker::new();
        let consumer = broker.subscribe(config("g")).await.unwrap();
        let bogus = Delivery::new("tasks", Bytes::new(), "nope");

        assert!(matches!(
            consumer.commit(&bogus).await,
            Err(BrokerError::Commit(_))
        ));
    }
}
