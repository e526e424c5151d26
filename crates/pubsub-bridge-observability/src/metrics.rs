use lazy_static::lazy_static;
use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
    Opts, Registry,
};
use std::sync::Once;

static INIT: Once = Once::new();

lazy_static! {
    /// Global Prometheus metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    // ============================================================================
    // Source Metrics
    // ============================================================================

    /// Total records received from Kafka
    pub static ref SOURCE_RECORDS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("bridge_source_records_total", "Total records polled from the source topic"),
        &["topic", "partition"]
    ).expect("metric can be created");

    /// Partition pauses requested by pipelines (backpressure)
    pub static ref SOURCE_PAUSES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("bridge_source_pauses_total", "Total partition pauses due to backpressure"),
        &["topic", "partition"]
    ).expect("metric can be created");

    /// Consumer group rebalances
    pub static ref REBALANCES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("bridge_rebalances_total", "Total partition assignment changes"),
        &["kind"] // assigned, revoked
    ).expect("metric can be created");

    // ============================================================================
    // Sink Metrics
    // ============================================================================

    /// Total messages acknowledged by Pub/Sub
    pub static ref SINK_MESSAGES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("bridge_sink_messages_total", "Total messages acknowledged by the sink"),
        &["topic", "partition"]
    ).expect("metric can be created");

    /// Total payload bytes acknowledged by Pub/Sub
    pub static ref SINK_BYTES_TOTAL: IntCounter = IntCounter::new(
        "bridge_sink_bytes_total",
        "Total payload bytes acknowledged by the sink"
    ).expect("metric can be created");

    /// Publish latency from publish() to ack
    pub static ref SINK_PUBLISH_LATENCY: Histogram = Histogram::with_opts(
        HistogramOpts::new("bridge_sink_publish_latency_seconds", "Publish-to-ack latency in seconds")
            .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0])
    ).expect("metric can be created");

    /// Publish batch size in messages
    pub static ref SINK_BATCH_SIZE: Histogram = Histogram::with_opts(
        HistogramOpts::new("bridge_sink_batch_size", "Publish batch size in messages")
            .buckets(vec![1.0, 10.0, 50.0, 100.0, 250.0, 500.0, 1000.0])
    ).expect("metric can be created");

    /// Publish failures by reason
    pub static ref SINK_ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("bridge_sink_errors_total", "Total publish failures"),
        &["reason"] // rejected, unavailable, auth, shutdown, ordering_paused
    ).expect("metric can be created");

    /// Records dropped by the mapper or skipped by the gap policy
    pub static ref RECORDS_DROPPED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("bridge_records_dropped_total", "Total records not delivered to the sink"),
        &["reason"] // mapper, skipped, dead_letter
    ).expect("metric can be created");

    // ============================================================================
    // Pipeline Metrics
    // ============================================================================

    /// Records currently in flight per partition
    pub static ref PIPELINE_IN_FLIGHT: IntGaugeVec = IntGaugeVec::new(
        Opts::new("bridge_pipeline_in_flight", "Records published but not yet acknowledged"),
        &["topic", "partition"]
    ).expect("metric can be created");

    /// Current watermark per partition
    pub static ref PIPELINE_WATERMARK: IntGaugeVec = IntGaugeVec::new(
        Opts::new("bridge_pipeline_watermark", "Lowest offset not yet contiguously acknowledged"),
        &["topic", "partition"]
    ).expect("metric can be created");

    /// Last durably checkpointed position per partition
    pub static ref PIPELINE_COMMITTED: IntGaugeVec = IntGaugeVec::new(
        Opts::new("bridge_pipeline_committed", "Last checkpointed position"),
        &["topic", "partition"]
    ).expect("metric can be created");

    /// Active partition pipelines
    pub static ref PIPELINES_ACTIVE: IntGauge = IntGauge::new(
        "bridge_pipelines_active",
        "Number of running partition pipelines"
    ).expect("metric can be created");

    // ============================================================================
    // Checkpoint Metrics
    // ============================================================================

    /// Checkpoint writes by outcome
    pub static ref CHECKPOINT_WRITES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("bridge_checkpoint_writes_total", "Total checkpoint writes"),
        &["outcome"] // ok, unavailable, conflict
    ).expect("metric can be created");

    /// Checkpoint write latency
    pub static ref CHECKPOINT_LATENCY: HistogramVec = HistogramVec::new(
        HistogramOpts::new("bridge_checkpoint_latency_seconds", "Checkpoint write latency in seconds")
            .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
        &["topic"]
    ).expect("metric can be created");

    // ============================================================================
    // Process Metrics
    // ============================================================================

    /// Fatal errors recorded by the coordinator
    pub static ref FATAL_ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("bridge_fatal_errors_total", "Total fatal errors"),
        &["kind"]
    ).expect("metric can be created");

    /// Coordinator state (0=starting, 1=running, 2=stopping, 3=stopped)
    pub static ref COORDINATOR_STATE: IntGauge = IntGauge::new(
        "bridge_coordinator_state",
        "Coordinator lifecycle state"
    ).expect("metric can be created");
}

/// Initialize metrics registry
/// Can be called multiple times safely (idempotent)
pub fn init() {
    INIT.call_once(|| {
        // Source metrics
        REGISTRY
            .register(Box::new(SOURCE_RECORDS_TOTAL.clone()))
            .expect("source_records_total can be registered");
        REGISTRY
            .register(Box::new(SOURCE_PAUSES_TOTAL.clone()))
            .expect("source_pauses_total can be registered");
        REGISTRY
            .register(Box::new(REBALANCES_TOTAL.clone()))
            .expect("rebalances_total can be registered");

        // Sink metrics
        REGISTRY
            .register(Box::new(SINK_MESSAGES_TOTAL.clone()))
            .expect("sink_messages_total can be registered");
        REGISTRY
            .register(Box::new(SINK_BYTES_TOTAL.clone()))
            .expect("sink_bytes_total can be registered");
        REGISTRY
            .register(Box::new(SINK_PUBLISH_LATENCY.clone()))
            .expect("sink_publish_latency can be registered");
        REGISTRY
            .register(Box::new(SINK_BATCH_SIZE.clone()))
            .expect("sink_batch_size can be registered");
        REGISTRY
            .register(Box::new(SINK_ERRORS_TOTAL.clone()))
            .expect("sink_errors_total can be registered");
        REGISTRY
            .register(Box::new(RECORDS_DROPPED_TOTAL.clone()))
            .expect("records_dropped_total can be registered");

        // Pipeline metrics
        REGISTRY
            .register(Box::new(PIPELINE_IN_FLIGHT.clone()))
            .expect("pipeline_in_flight can be registered");
        REGISTRY
            .register(Box::new(PIPELINE_WATERMARK.clone()))
            .expect("pipeline_watermark can be registered");
        REGISTRY
            .register(Box::new(PIPELINE_COMMITTED.clone()))
            .expect("pipeline_committed can be registered");
        REGISTRY
            .register(Box::new(PIPELINES_ACTIVE.clone()))
            .expect("pipelines_active can be registered");

        // Checkpoint metrics
        REGISTRY
            .register(Box::new(CHECKPOINT_WRITES_TOTAL.clone()))
            .expect("checkpoint_writes_total can be registered");
        REGISTRY
            .register(Box::new(CHECKPOINT_LATENCY.clone()))
            .expect("checkpoint_latency can be registered");

        // Process metrics
        REGISTRY
            .register(Box::new(FATAL_ERRORS_TOTAL.clone()))
            .expect("fatal_errors_total can be registered");
        REGISTRY
            .register(Box::new(COORDINATOR_STATE.clone()))
            .expect("coordinator_state can be registered");
    });
}
