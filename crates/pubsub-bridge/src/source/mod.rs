//! Source side of the bridge: the consumer-group client.
//!
//! The engine talks to Kafka only through [`SourceConsumer`]. Rebalance
//! notifications are delivered in-band from [`SourceConsumer::poll`], in the
//! order they happened relative to record batches, so the coordinator can
//! apply them between polls without callbacks into its own state.
//!
//! Clients whose revocation callback must not return before the partitions
//! are drained also hand revocations over through
//! [`SourceConsumer::next_revocation`] (see [`revocation`]).

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::record::{SourceRecord, TopicPartition};

pub mod memory;
pub mod revocation;

#[cfg(feature = "kafka")]
pub mod kafka;

pub use memory::InMemorySourceConsumer;
pub use revocation::{PendingRevocation, RevocationGate};

#[cfg(feature = "kafka")]
pub use kafka::KafkaSourceConsumer;

/// Records from a single partition, in strictly increasing offset order.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionBatch {
    pub tp: TopicPartition,
    pub records: Vec<SourceRecord>,
}

impl PartitionBatch {
    pub fn new(tp: TopicPartition, records: Vec<SourceRecord>) -> Self {
        Self { tp, records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Offset of the last record, if any.
    pub fn last_offset(&self) -> Option<u64> {
        self.records.last().map(|r| r.offset)
    }
}

/// Something that happened on the consumer since the previous poll.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsumerEvent {
    /// The group handed us these partitions.
    Assigned(Vec<TopicPartition>),
    /// These partitions are being taken away.
    Revoked(Vec<TopicPartition>),
    /// New records for one partition.
    Records(PartitionBatch),
}

/// Consumer-group client for the source topic.
///
/// All methods take `&self`: the coordinator polls while pipelines pause,
/// resume and commit concurrently.
#[async_trait]
pub trait SourceConsumer: Send + Sync {
    /// Join the consumer group and subscribe to `topic`.
    async fn subscribe(&self, topic: &str) -> Result<()>;

    /// Wait up to `max_wait` for records or rebalance events.
    async fn poll(&self, max_wait: Duration) -> Result<Vec<ConsumerEvent>>;

    /// Stop fetching `tp` without giving up the assignment.
    fn pause(&self, tp: &TopicPartition) -> Result<()>;

    /// Resume fetching a paused partition.
    fn resume(&self, tp: &TopicPartition) -> Result<()>;

    /// Record consumer-group progress: every offset below `offset` is processed.
    async fn commit(&self, tp: &TopicPartition, offset: u64) -> Result<()>;

    /// Position the read cursor of `tp` at `offset`.
    async fn seek(&self, tp: &TopicPartition, offset: u64) -> Result<()>;

    /// The broker-side committed position for `tp`, if the group has one.
    async fn committed(&self, tp: &TopicPartition) -> Result<Option<u64>>;

    /// Earliest available offset and the next offset to be written.
    async fn offset_bounds(&self, tp: &TopicPartition) -> Result<(u64, u64)>;

    /// Leave the group and release client resources.
    async fn close(&self) -> Result<()>;

    /// Wait for a revocation the client holds until its partitions are drained.
    ///
    /// Complete it once the partitions' pipelines have stopped. Clients that
    /// only report revocations in-band never resolve this.
    async fn next_revocation(&self) -> PendingRevocation {
        std::future::pending().await
    }
}
