//! Kafka → Cloud Pub/Sub Streaming Bridge
//!
//! Continuously transfers records from a Kafka topic into a Google Cloud
//! Pub/Sub topic, in order per partition, with checkpointed progress so a
//! restart resumes without loss. Delivery is at-least-once.
//!
//! ## Architecture
//!
//! - **Coordinator**: `Coordinator` owns the poll loop, reacts to rebalances
//!   and runs the `Starting → Running → Stopping → Stopped` state machine.
//! - **Pipelines**: one `PartitionPipeline` per assigned partition maps,
//!   publishes, tracks acks and checkpoints the watermark.
//! - **Source**: `SourceConsumer`, with `KafkaSourceConsumer` (rdkafka) and the
//!   scriptable `InMemorySourceConsumer`.
//! - **Sink**: the batching `Publisher` over a `PublishTransport`
//!   (`RestTransport` or `InMemoryTransport`).
//! - **Checkpoints**: `CheckpointStore`, with `ObjectStoreCheckpointStore`
//!   over local files, memory or `gs://` buckets.
//! - **Observer**: engine events for logs (`TracingObserver`) and Prometheus
//!   (`MetricsObserver`).
//!
//! ## Feature Flags
//!
//! - `kafka` - Enables the rdkafka-backed source consumer.
//! - `cli` - Builds the `kafka-pubsub-bridge` binary.

pub mod checkpoint;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod mapper;
pub mod observer;
pub mod pipeline;
pub mod record;
pub mod retry;
pub mod shutdown;
pub mod sink;
pub mod source;
pub mod watermark;

// Re-export key types at crate root for convenience.
pub use checkpoint::{CheckpointError, CheckpointStore, ObjectStoreCheckpointStore};
pub use config::{
    AwaitTermination, BatchSettings, BridgeConfig, DestinationTopic, GapPolicy, OrderingKeyMode,
    StartingOffsetPolicy,
};
pub use coordinator::{BridgeOutcome, Coordinator, CoordinatorState, StopReason};
pub use error::{BridgeError, Result};
pub use mapper::{is_valid_attribute_name, DefaultRecordMapper, RecordMapper};
pub use observer::{
    BridgeEvent, DropReason, MetricsObserver, MultiObserver, NoopObserver, Observer,
    RecordingObserver, TracingObserver,
};
pub use pipeline::{
    DeadLetterHook, PartitionPipeline, PartitionReport, PipelineHandle, PipelineState,
};
pub use record::{PublishRequest, SourceRecord, TopicPartition};
pub use retry::{retry_with_backoff, RetryPolicy, Retryable};
pub use shutdown::{shutdown_signal, ShutdownHandle, ShutdownSignal};
pub use sink::{
    AckFuture, InMemoryTransport, PublishFailure, PublishTransport, Publisher, RestTransport,
    SinkStatus, StaticTokenProvider, TokenProvider, TransportError,
};
pub use source::{
    ConsumerEvent, InMemorySourceConsumer, PartitionBatch, PendingRevocation, RevocationGate,
    SourceConsumer,
};
pub use watermark::{Resolution, WatermarkTracker};

#[cfg(feature = "kafka")]
pub use source::KafkaSourceConsumer;
