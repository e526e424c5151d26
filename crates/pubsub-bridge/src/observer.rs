//! Structured events emitted by the engine.
//!
//! The engine never logs metrics directly; it reports [`BridgeEvent`]s to an
//! [`Observer`]. [`TracingObserver`] writes them as structured log lines,
//! [`MetricsObserver`] feeds the Prometheus registry of the observability
//! crate, and [`MultiObserver`] fans out to several.

use std::sync::Arc;
use std::time::Duration;

use pubsub_bridge_observability::metrics;
use tracing::{debug, error, info, trace, warn};

use crate::coordinator::CoordinatorState;
use crate::error::BridgeError;
use crate::record::TopicPartition;

/// Why a record was not delivered to the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The mapper returned `drop`.
    Mapper,
    /// Permanently rejected and skipped by the gap policy.
    Skipped,
    /// Permanently rejected and handed to the dead-letter hook.
    DeadLettered,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::Mapper => "mapper",
            DropReason::Skipped => "skipped",
            DropReason::DeadLettered => "dead_letter",
        }
    }
}

/// Something observable happened inside the bridge.
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    StateChanged {
        state: CoordinatorState,
    },
    PartitionsAssigned {
        partitions: Vec<TopicPartition>,
    },
    PartitionsRevoked {
        partitions: Vec<TopicPartition>,
    },
    /// No assignment arrived within `assignment_wait`.
    AssignmentWaitElapsed {
        waited: Duration,
    },
    PipelineStarted {
        tp: TopicPartition,
        start_offset: u64,
    },
    PipelineStopped {
        tp: TopicPartition,
        watermark: u64,
        committed: u64,
        unresolved: usize,
    },
    RecordsReceived {
        tp: TopicPartition,
        count: usize,
    },
    RecordAcked {
        tp: TopicPartition,
        offset: u64,
        latency: Duration,
    },
    RecordDropped {
        tp: TopicPartition,
        offset: u64,
        reason: DropReason,
    },
    PartitionPaused {
        tp: TopicPartition,
        in_flight: usize,
    },
    PartitionResumed {
        tp: TopicPartition,
    },
    /// Periodic snapshot of a partition's progress.
    PartitionProgress {
        tp: TopicPartition,
        in_flight: usize,
        watermark: u64,
        committed: u64,
    },
    CheckpointSaved {
        tp: TopicPartition,
        offset: u64,
        latency: Duration,
    },
    CheckpointFailed {
        tp: TopicPartition,
        offset: u64,
        error: String,
        conflict: bool,
    },
    BatchPublished {
        messages: usize,
        bytes: usize,
        latency: Duration,
    },
    BatchFailed {
        messages: usize,
        /// Short failure class, such as `unavailable` or `rejected`.
        reason: &'static str,
        error: String,
    },
    Fatal {
        error: BridgeError,
    },
}

/// Receives engine events. Implementations must be cheap and non-blocking.
pub trait Observer: Send + Sync {
    fn on_event(&self, event: &BridgeEvent);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl Observer for NoopObserver {
    fn on_event(&self, _event: &BridgeEvent) {}
}

/// Writes events as `tracing` records.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn on_event(&self, event: &BridgeEvent) {
        match event {
            BridgeEvent::StateChanged { state } => info!(state = ?state, "Coordinator state changed"),
            BridgeEvent::PartitionsAssigned { partitions } => {
                info!(partitions = ?partitions, "Partitions assigned")
            }
            BridgeEvent::PartitionsRevoked { partitions } => {
                info!(partitions = ?partitions, "Partitions revoked")
            }
            BridgeEvent::AssignmentWaitElapsed { waited } => warn!(
                waited_ms = waited.as_millis() as u64,
                "No partitions assigned yet, running without assignment"
            ),
            BridgeEvent::PipelineStarted { tp, start_offset } => info!(
                topic = %tp.topic,
                partition = tp.partition,
                start_offset,
                "Pipeline started"
            ),
            BridgeEvent::PipelineStopped {
                tp,
                watermark,
                committed,
                unresolved,
            } => info!(
                topic = %tp.topic,
                partition = tp.partition,
                watermark,
                committed,
                unresolved,
                "Pipeline stopped"
            ),
            BridgeEvent::RecordsReceived { tp, count } => trace!(
                topic = %tp.topic,
                partition = tp.partition,
                count,
                "Records received"
            ),
            BridgeEvent::RecordAcked { tp, offset, .. } => trace!(
                topic = %tp.topic,
                partition = tp.partition,
                offset,
                "Record acknowledged"
            ),
            BridgeEvent::RecordDropped { tp, offset, reason } => debug!(
                topic = %tp.topic,
                partition = tp.partition,
                offset,
                reason = reason.as_str(),
                "Record dropped"
            ),
            BridgeEvent::PartitionPaused { tp, in_flight } => debug!(
                topic = %tp.topic,
                partition = tp.partition,
                in_flight,
                "Partition paused"
            ),
            BridgeEvent::PartitionResumed { tp } => debug!(
                topic = %tp.topic,
                partition = tp.partition,
                "Partition resumed"
            ),
            BridgeEvent::PartitionProgress {
                tp,
                in_flight,
                watermark,
                committed,
            } => trace!(
                topic = %tp.topic,
                partition = tp.partition,
                in_flight,
                watermark,
                committed,
                "Partition progress"
            ),
            BridgeEvent::CheckpointSaved { tp, offset, latency } => debug!(
                topic = %tp.topic,
                partition = tp.partition,
                offset,
                latency_ms = latency.as_millis() as u64,
                "Checkpoint saved"
            ),
            BridgeEvent::CheckpointFailed {
                tp,
                offset,
                error,
                conflict,
            } => warn!(
                topic = %tp.topic,
                partition = tp.partition,
                offset,
                conflict,
                error = %error,
                "Checkpoint write failed"
            ),
            BridgeEvent::BatchPublished {
                messages,
                bytes,
                latency,
            } => debug!(
                messages,
                bytes,
                latency_ms = latency.as_millis() as u64,
                "Batch published"
            ),
            BridgeEvent::BatchFailed {
                messages,
                reason,
                error,
            } => warn!(messages, reason, error = %error, "Batch publish failed"),
            BridgeEvent::Fatal { error } => {
                error!(kind = error.kind(), error = %error, "Fatal error")
            }
        }
    }
}

/// Feeds the Prometheus metrics of `pubsub-bridge-observability`.
#[derive(Debug, Clone, Copy)]
pub struct MetricsObserver;

impl MetricsObserver {
    /// Registers the metrics with the global registry on first use.
    pub fn new() -> Self {
        metrics::init();
        Self
    }
}

impl Default for MetricsObserver {
    fn default() -> Self {
        Self::new()
    }
}

fn labels(tp: &TopicPartition) -> [String; 2] {
    [tp.topic.clone(), tp.partition.to_string()]
}

impl Observer for MetricsObserver {
    fn on_event(&self, event: &BridgeEvent) {
        match event {
            BridgeEvent::StateChanged { state } => {
                metrics::COORDINATOR_STATE.set(state.as_gauge());
            }
            BridgeEvent::PartitionsAssigned { .. } => {
                metrics::REBALANCES_TOTAL.with_label_values(&["assigned"]).inc();
            }
            BridgeEvent::PartitionsRevoked { .. } => {
                metrics::REBALANCES_TOTAL.with_label_values(&["revoked"]).inc();
            }
            BridgeEvent::PipelineStarted { .. } => metrics::PIPELINES_ACTIVE.inc(),
            BridgeEvent::PipelineStopped { tp, .. } => {
                metrics::PIPELINES_ACTIVE.dec();
                let [topic, partition] = labels(tp);
                metrics::PIPELINE_IN_FLIGHT
                    .with_label_values(&[topic.as_str(), partition.as_str()])
                    .set(0);
            }
            BridgeEvent::RecordsReceived { tp, count } => {
                let [topic, partition] = labels(tp);
                metrics::SOURCE_RECORDS_TOTAL
                    .with_label_values(&[topic.as_str(), partition.as_str()])
                    .inc_by(*count as u64);
            }
            BridgeEvent::RecordAcked { tp, latency, .. } => {
                let [topic, partition] = labels(tp);
                metrics::SINK_MESSAGES_TOTAL
                    .with_label_values(&[topic.as_str(), partition.as_str()])
                    .inc();
                metrics::SINK_PUBLISH_LATENCY.observe(latency.as_secs_f64());
            }
            BridgeEvent::RecordDropped { reason, .. } => {
                metrics::RECORDS_DROPPED_TOTAL
                    .with_label_values(&[reason.as_str()])
                    .inc();
            }
            BridgeEvent::PartitionPaused { tp, .. } => {
                let [topic, partition] = labels(tp);
                metrics::SOURCE_PAUSES_TOTAL
                    .with_label_values(&[topic.as_str(), partition.as_str()])
                    .inc();
            }
            BridgeEvent::PartitionProgress {
                tp,
                in_flight,
                watermark,
                committed,
            } => {
                let [topic, partition] = labels(tp);
                let l = [topic.as_str(), partition.as_str()];
                metrics::PIPELINE_IN_FLIGHT
                    .with_label_values(&l)
                    .set(*in_flight as i64);
                metrics::PIPELINE_WATERMARK
                    .with_label_values(&l)
                    .set(*watermark as i64);
                metrics::PIPELINE_COMMITTED
                    .with_label_values(&l)
                    .set(*committed as i64);
            }
            BridgeEvent::CheckpointSaved { tp, latency, .. } => {
                metrics::CHECKPOINT_WRITES_TOTAL.with_label_values(&["ok"]).inc();
                metrics::CHECKPOINT_LATENCY
                    .with_label_values(&[tp.topic.as_str()])
                    .observe(latency.as_secs_f64());
            }
            BridgeEvent::CheckpointFailed { conflict, .. } => {
                let outcome = if *conflict { "conflict" } else { "unavailable" };
                metrics::CHECKPOINT_WRITES_TOTAL
                    .with_label_values(&[outcome])
                    .inc();
            }
            BridgeEvent::BatchPublished {
                messages, bytes, ..
            } => {
                metrics::SINK_BATCH_SIZE.observe(*messages as f64);
                metrics::SINK_BYTES_TOTAL.inc_by(*bytes as u64);
            }
            BridgeEvent::BatchFailed { reason, .. } => {
                metrics::SINK_ERRORS_TOTAL.with_label_values(&[*reason]).inc();
            }
            BridgeEvent::Fatal { error } => {
                metrics::FATAL_ERRORS_TOTAL
                    .with_label_values(&[error.kind()])
                    .inc();
            }
            BridgeEvent::AssignmentWaitElapsed { .. } | BridgeEvent::PartitionResumed { .. } => {}
        }
    }
}

/// Forwards every event to each inner observer, in order.
#[derive(Clone, Default)]
pub struct MultiObserver {
    observers: Vec<Arc<dyn Observer>>,
}

impl MultiObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observers.push(observer);
        self
    }
}

impl Observer for MultiObserver {
    fn on_event(&self, event: &BridgeEvent) {
        for observer in &self.observers {
            observer.on_event(event);
        }
    }
}

/// Keeps every event in memory. Useful for assertions in tests.
#[derive(Default)]
pub struct RecordingObserver {
    events: std::sync::Mutex<Vec<BridgeEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<BridgeEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl Observer for RecordingObserver {
    fn on_event(&self, event: &BridgeEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
    }
}
