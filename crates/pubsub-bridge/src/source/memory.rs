//! In-process source consumer.
//!
//! Holds partition logs in memory and plays back scripted rebalances. It
//! honours seeks, pause/resume and `max_poll_records` the way a broker-backed
//! consumer does, which makes it suitable for dry runs and for driving the
//! engine in tests.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Notify;
use tracing::debug;

use super::{ConsumerEvent, PartitionBatch, SourceConsumer};
use crate::error::{BridgeError, Result};
use crate::record::{SourceRecord, TopicPartition};

#[derive(Debug, Default)]
struct PartitionLog {
    records: Vec<SourceRecord>,
    /// Earliest retained offset.
    low: u64,
    /// Next offset to hand out from `poll`.
    position: Option<u64>,
    paused: bool,
    pause_count: usize,
}

impl PartitionLog {
    fn high(&self) -> u64 {
        self.records.last().map(|r| r.offset + 1).unwrap_or(self.low)
    }
}

#[derive(Debug, Default)]
struct State {
    logs: BTreeMap<TopicPartition, PartitionLog>,
    subscribed: Option<String>,
    assigned: BTreeSet<TopicPartition>,
    scripted: VecDeque<ConsumerEvent>,
    poll_errors: VecDeque<BridgeError>,
    group_offsets: HashMap<TopicPartition, u64>,
    commits: Vec<(TopicPartition, u64)>,
    closed: bool,
}

/// Scriptable in-memory [`SourceConsumer`].
///
/// ```ignore
/// let consumer = InMemorySourceConsumer::new(500);
/// consumer.create_topic("orders", 2);
/// consumer.produce("orders", 0, "hello");
/// ```
///
/// On `subscribe` every partition of the topic is assigned, unless
/// auto-assignment was disabled with [`InMemorySourceConsumer::with_manual_assignment`].
#[derive(Clone)]
pub struct InMemorySourceConsumer {
    state: Arc<Mutex<State>>,
    data_ready: Arc<Notify>,
    max_poll_records: usize,
    auto_assign: bool,
}

impl InMemorySourceConsumer {
    pub fn new(max_poll_records: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            data_ready: Arc::new(Notify::new()),
            max_poll_records: max_poll_records.max(1),
            auto_assign: true,
        }
    }

    /// Do not assign anything on subscribe; use [`assign`](Self::assign) instead.
    pub fn with_manual_assignment(mut self) -> Self {
        self.auto_assign = false;
        self
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ---------------------------------------------------------------
    // Scripting
    // ---------------------------------------------------------------

    /// Create `partitions` empty partitions for `topic`.
    pub fn create_topic(&self, topic: &str, partitions: u32) {
        let mut state = self.state();
        for p in 0..partitions {
            state
                .logs
                .entry(TopicPartition::new(topic, p))
                .or_default();
        }
    }

    /// Append a value at the next offset of the partition and return that offset.
    pub fn produce(&self, topic: &str, partition: u32, value: impl Into<Bytes>) -> u64 {
        let tp = TopicPartition::new(topic, partition);
        let offset = {
            let state = self.state();
            state.logs.get(&tp).map(|l| l.high()).unwrap_or(0)
        };
        self.produce_record(SourceRecord::new(topic, partition, offset, value));
        offset
    }

    /// Append a fully built record. Offsets must increase within a partition,
    /// but may skip values (as compaction or transaction markers do).
    pub fn produce_record(&self, record: SourceRecord) {
        {
            let mut state = self.state();
            let log = state.logs.entry(record.topic_partition()).or_default();
            if log.records.is_empty() && log.low == 0 {
                log.low = record.offset;
            }
            debug_assert!(record.offset >= log.high(), "offsets must increase");
            log.records.push(record);
        }
        self.data_ready.notify_one();
    }

    /// Drop records below `low`, as retention would.
    pub fn truncate_before(&self, tp: &TopicPartition, low: u64) {
        let mut state = self.state();
        if let Some(log) = state.logs.get_mut(tp) {
            log.records.retain(|r| r.offset >= low);
            log.low = low;
        }
    }

    /// Queue an assignment, delivered on the next poll.
    pub fn assign(&self, partitions: Vec<TopicPartition>) {
        self.state()
            .scripted
            .push_back(ConsumerEvent::Assigned(partitions));
        self.data_ready.notify_one();
    }

    /// Queue a revocation, delivered on the next poll.
    pub fn revoke(&self, partitions: Vec<TopicPartition>) {
        self.state()
            .scripted
            .push_back(ConsumerEvent::Revoked(partitions));
        self.data_ready.notify_one();
    }

    /// Make the next poll fail with `err`.
    pub fn fail_next_poll(&self, err: BridgeError) {
        self.state().poll_errors.push_back(err);
    }

    /// Pretend the group already committed `offset` for `tp` on the broker.
    pub fn set_group_offset(&self, tp: &TopicPartition, offset: u64) {
        self.state().group_offsets.insert(tp.clone(), offset);
    }

    // ---------------------------------------------------------------
    // Inspection
    // ---------------------------------------------------------------

    /// Last committed group offset for `tp`.
    pub fn group_offset(&self, tp: &TopicPartition) -> Option<u64> {
        self.state().group_offsets.get(tp).copied()
    }

    /// Every commit in the order it was made.
    pub fn commits(&self) -> Vec<(TopicPartition, u64)> {
        self.state().commits.clone()
    }

    pub fn is_paused(&self, tp: &TopicPartition) -> bool {
        self.state().logs.get(tp).map(|l| l.paused).unwrap_or(false)
    }

    /// How many times `tp` went from running to paused.
    pub fn pause_count(&self, tp: &TopicPartition) -> usize {
        self.state().logs.get(tp).map(|l| l.pause_count).unwrap_or(0)
    }

    /// Current read position of `tp`.
    pub fn position(&self, tp: &TopicPartition) -> Option<u64> {
        self.state().logs.get(tp).and_then(|l| l.position)
    }

    pub fn assigned(&self) -> Vec<TopicPartition> {
        self.state().assigned.iter().cloned().collect()
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    fn take_ready(&self) -> Result<Vec<ConsumerEvent>> {
        let mut state = self.state();
        if state.closed {
            return Err(BridgeError::Source("consumer is closed".to_string()));
        }
        if let Some(err) = state.poll_errors.pop_front() {
            return Err(err);
        }

        if !state.scripted.is_empty() {
            let events: Vec<ConsumerEvent> = state.scripted.drain(..).collect();
            for event in &events {
                match event {
                    ConsumerEvent::Assigned(tps) => {
                        for tp in tps {
                            state.assigned.insert(tp.clone());
                            let log = state.logs.entry(tp.clone()).or_default();
                            log.position = None;
                            log.paused = false;
                        }
                    }
                    ConsumerEvent::Revoked(tps) => {
                        for tp in tps {
                            state.assigned.remove(tp);
                        }
                    }
                    ConsumerEvent::Records(_) => {}
                }
            }
            return Ok(events);
        }

        let mut budget = self.max_poll_records;
        let mut events = Vec::new();
        let assigned: Vec<TopicPartition> = state.assigned.iter().cloned().collect();
        for tp in assigned {
            if budget == 0 {
                break;
            }
            let group_offset = state.group_offsets.get(&tp).copied();
            let Some(log) = state.logs.get_mut(&tp) else {
                continue;
            };
            if log.paused {
                continue;
            }
            let position = log
                .position
                .or(group_offset)
                .unwrap_or(log.low)
                .max(log.low);
            let records: Vec<SourceRecord> = log
                .records
                .iter()
                .filter(|r| r.offset >= position)
                .take(budget)
                .cloned()
                .collect();
            let Some(last) = records.last().map(|r| r.offset) else {
                log.position = Some(position);
                continue;
            };
            log.position = Some(last + 1);
            budget -= records.len();
            events.push(ConsumerEvent::Records(PartitionBatch::new(tp, records)));
        }
        Ok(events)
    }
}

#[async_trait]
impl SourceConsumer for InMemorySourceConsumer {
    async fn subscribe(&self, topic: &str) -> Result<()> {
        let mut state = self.state();
        state.subscribed = Some(topic.to_string());
        if self.auto_assign {
            let partitions: Vec<TopicPartition> = state
                .logs
                .keys()
                .filter(|tp| tp.topic == topic)
                .cloned()
                .collect();
            state.scripted.push_back(ConsumerEvent::Assigned(partitions));
        }
        debug!(topic, "In-memory consumer subscribed");
        Ok(())
    }

    async fn poll(&self, max_wait: Duration) -> Result<Vec<ConsumerEvent>> {
        let events = self.take_ready()?;
        if !events.is_empty() {
            return Ok(events);
        }
        let _ = tokio::time::timeout(max_wait, self.data_ready.notified()).await;
        self.take_ready()
    }

    fn pause(&self, tp: &TopicPartition) -> Result<()> {
        let mut state = self.state();
        let log = state.logs.entry(tp.clone()).or_default();
        if !log.paused {
            log.paused = true;
            log.pause_count += 1;
        }
        Ok(())
    }

    fn resume(&self, tp: &TopicPartition) -> Result<()> {
        if let Some(log) = self.state().logs.get_mut(tp) {
            log.paused = false;
        }
        self.data_ready.notify_one();
        Ok(())
    }

    async fn commit(&self, tp: &TopicPartition, offset: u64) -> Result<()> {
        let mut state = self.state();
        state.group_offsets.insert(tp.clone(), offset);
        state.commits.push((tp.clone(), offset));
        Ok(())
    }

    async fn seek(&self, tp: &TopicPartition, offset: u64) -> Result<()> {
        self.state().logs.entry(tp.clone()).or_default().position = Some(offset);
        Ok(())
    }

    async fn committed(&self, tp: &TopicPartition) -> Result<Option<u64>> {
        Ok(self.state().group_offsets.get(tp).copied())
    }

    async fn offset_bounds(&self, tp: &TopicPartition) -> Result<(u64, u64)> {
        let state = self.state();
        Ok(state
            .logs
            .get(tp)
            .map(|l| (l.low, l.high()))
            .unwrap_or((0, 0)))
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state();
        state.closed = true;
        state.assigned.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tp(partition: u32) -> TopicPartition {
        TopicPartition::new("orders", partition)
    }

    fn records_of(events: &[ConsumerEvent]) -> Vec<(u32, u64)> {
        events
            .iter()
            .filter_map(|e| match e {
                ConsumerEvent::Records(b) => Some(b),
                _ => None,
            })
            .flat_map(|b| b.records.iter().map(|r| (r.partition, r.offset)))
            .collect()
    }

    // ---------------------------------------------------------------
    // Subscription and assignment
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn test_subscribe_assigns_all_partitions() {
        let consumer = InMemorySourceConsumer::new(100);
        consumer.create_topic("orders", 2);
        consumer.subscribe("orders").await.unwrap();

        let events = consumer.poll(Duration::from_millis(10)).await.unwrap();
        assert_eq!(events, vec![ConsumerEvent::Assigned(vec![tp(0), tp(1)])]);
        assert_eq!(consumer.assigned(), vec![tp(0), tp(1)]);
    }

    #[tokio::test]
    async fn test_manual_assignment_and_revocation() {
        let consumer = InMemorySourceConsumer::new(100).with_manual_assignment();
        consumer.create_topic("orders", 2);
        consumer.subscribe("orders").await.unwrap();
        assert!(consumer.poll(Duration::from_millis(1)).await.unwrap().is_empty());

        consumer.assign(vec![tp(1)]);
        consumer.poll(Duration::from_millis(1)).await.unwrap();
        assert_eq!(consumer.assigned(), vec![tp(1)]);

        consumer.revoke(vec![tp(1)]);
        let events = consumer.poll(Duration::from_millis(1)).await.unwrap();
        assert_eq!(events, vec![ConsumerEvent::Revoked(vec![tp(1)])]);
        assert!(consumer.assigned().is_empty());
    }

    // ---------------------------------------------------------------
    // Fetching
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn test_poll_respects_seek_and_max_records() {
        let consumer = InMemorySourceConsumer::new(3);
        consumer.create_topic("orders", 1);
        for i in 0..10 {
            consumer.produce("orders", 0, format!("v{}", i));
        }
        consumer.subscribe("orders").await.unwrap();
        consumer.poll(Duration::from_millis(1)).await.unwrap();
        consumer.seek(&tp(0), 4).await.unwrap();

        let first = consumer.poll(Duration::from_millis(1)).await.unwrap();
        assert_eq!(records_of(&first), vec![(0, 4), (0, 5), (0, 6)]);
        let second = consumer.poll(Duration::from_millis(1)).await.unwrap();
        assert_eq!(records_of(&second), vec![(0, 7), (0, 8), (0, 9)]);
        assert!(consumer.poll(Duration::from_millis(1)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_paused_partition_yields_nothing() {
        let consumer = InMemorySourceConsumer::new(100);
        consumer.create_topic("orders", 1);
        consumer.produce("orders", 0, "a");
        consumer.subscribe("orders").await.unwrap();
        consumer.poll(Duration::from_millis(1)).await.unwrap();

        consumer.pause(&tp(0)).unwrap();
        consumer.pause(&tp(0)).unwrap();
        assert!(consumer.is_paused(&tp(0)));
        assert_eq!(consumer.pause_count(&tp(0)), 1);
        assert!(consumer.poll(Duration::from_millis(1)).await.unwrap().is_empty());

        consumer.resume(&tp(0)).unwrap();
        let events = consumer.poll(Duration::from_millis(1)).await.unwrap();
        assert_eq!(records_of(&events), vec![(0, 0)]);
    }

    #[tokio::test]
    async fn test_poll_wakes_on_produce() {
        let consumer = InMemorySourceConsumer::new(100);
        consumer.create_topic("orders", 1);
        consumer.subscribe("orders").await.unwrap();
        consumer.poll(Duration::from_millis(1)).await.unwrap();

        let producer = consumer.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.produce("orders", 0, "late");
        });

        let events = consumer.poll(Duration::from_secs(5)).await.unwrap();
        assert_eq!(records_of(&events), vec![(0, 0)]);
    }

    #[tokio::test]
    async fn test_offset_gaps_and_bounds() {
        let consumer = InMemorySourceConsumer::new(100);
        consumer.produce_record(SourceRecord::new("orders", 0, 10, "a"));
        consumer.produce_record(SourceRecord::new("orders", 0, 13, "b"));
        assert_eq!(consumer.offset_bounds(&tp(0)).await.unwrap(), (10, 14));

        consumer.truncate_before(&tp(0), 12);
        assert_eq!(consumer.offset_bounds(&tp(0)).await.unwrap(), (12, 14));
        assert_eq!(consumer.offset_bounds(&tp(5)).await.unwrap(), (0, 0));
    }

    // ---------------------------------------------------------------
    // Commits and failures
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn test_commit_records_group_offset() {
        let consumer = InMemorySourceConsumer::new(100);
        assert_eq!(consumer.committed(&tp(0)).await.unwrap(), None);
        consumer.commit(&tp(0), 5).await.unwrap();
        consumer.commit(&tp(0), 9).await.unwrap();
        assert_eq!(consumer.committed(&tp(0)).await.unwrap(), Some(9));
        assert_eq!(consumer.commits(), vec![(tp(0), 5), (tp(0), 9)]);
    }

    #[tokio::test]
    async fn test_injected_poll_failure() {
        let consumer = InMemorySourceConsumer::new(100);
        consumer.fail_next_poll(BridgeError::TransientTransport("broker down".into()));
        assert!(consumer.poll(Duration::from_millis(1)).await.is_err());
        assert!(consumer.poll(Duration::from_millis(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_closed_consumer_rejects_poll() {
        let consumer = InMemorySourceConsumer::new(100);
        consumer.close().await.unwrap();
        assert!(consumer.is_closed());
        assert!(consumer.poll(Duration::from_millis(1)).await.is_err());
    }
}
