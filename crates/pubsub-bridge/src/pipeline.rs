//! Per-partition pipeline: map → publish → track → checkpoint.
//!
//! Each assigned partition gets one [`PartitionPipeline`] running as its own
//! task. The coordinator feeds it record batches through a [`PipelineHandle`]
//! and tells it to drain on revocation or shutdown; the pipeline owns all of
//! the partition's state.
//!
//! ```text
//!  coordinator ──deliver(batch)──▶ inbox ─▶ backlog ─▶ mapper ─▶ Publisher
//!                                                                   │
//!  CheckpointStore ◀── save(watermark-1) ◀── WatermarkTracker ◀── acks
//! ```
//!
//! ## Lifecycle
//!
//! `Running → Draining → Stopped`. While draining the pipeline publishes
//! nothing new, waits for outstanding acks up to `drain_timeout` and writes a
//! final checkpoint of the watermark it reached.
//!
//! ## Flow control
//!
//! The partition is paused at the consumer whenever the number of unresolved
//! records reaches `max_in_flight_per_partition` and resumed once it drops
//! below again.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{BoxFuture, OptionFuture};
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::checkpoint::{CheckpointError, CheckpointStore};
use crate::config::{BridgeConfig, GapPolicy};
use crate::error::{BridgeError, Result};
use crate::mapper::RecordMapper;
use crate::observer::{BridgeEvent, DropReason, Observer};
use crate::record::{PublishRequest, SourceRecord, TopicPartition};
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::sink::{AckResult, PublishFailure, Publisher};
use crate::source::SourceConsumer;
use crate::watermark::{Resolution, WatermarkTracker};

/// Batches the coordinator may queue ahead of the pipeline.
const INBOX_DEPTH: usize = 8;

/// Lifecycle of a partition pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Running,
    Draining,
    Stopped,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineState::Running => write!(f, "running"),
            PipelineState::Draining => write!(f, "draining"),
            PipelineState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Receives records that the sink rejected permanently under
/// `gap_policy = dead-letter`.
#[async_trait]
pub trait DeadLetterHook: Send + Sync {
    /// Accept `record`. An error is fatal for the bridge.
    async fn dead_letter(
        &self,
        record: &SourceRecord,
        reason: &str,
    ) -> std::result::Result<(), String>;
}

/// Final state of a pipeline after it stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionReport {
    pub tp: TopicPartition,
    pub start_offset: u64,
    pub watermark: u64,
    pub committed: u64,
    pub acked: u64,
    pub dropped: u64,
    /// Records still unresolved when the pipeline stopped.
    pub unresolved: usize,
}

impl PartitionReport {
    /// Last offset persisted by this pipeline, if it persisted any.
    pub fn checkpointed(&self) -> Option<u64> {
        (self.committed > self.start_offset).then(|| self.committed - 1)
    }
}

/// Tuning for partition pipelines, taken from [`BridgeConfig`].
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub max_in_flight: usize,
    pub commit_interval_records: u64,
    pub commit_interval: Duration,
    pub checkpoint_retry: RetryPolicy,
    pub gap_policy: GapPolicy,
    pub drain_timeout: Duration,
}

impl PipelineSettings {
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            max_in_flight: config.max_in_flight_per_partition.max(1),
            commit_interval_records: config.commit_interval_records.max(1),
            commit_interval: config.commit_interval,
            checkpoint_retry: config.checkpoint_retry.clone(),
            gap_policy: config.gap_policy,
            drain_timeout: config.drain_timeout,
        }
    }
}

/// Shared collaborators every pipeline needs.
#[derive(Clone)]
pub struct PipelineContext {
    pub consumer: Arc<dyn SourceConsumer>,
    pub publisher: Publisher,
    pub mapper: Arc<dyn RecordMapper>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub observer: Arc<dyn Observer>,
    pub dead_letter: Option<Arc<dyn DeadLetterHook>>,
    /// Unrecoverable errors go to the coordinator.
    pub fatal_tx: mpsc::UnboundedSender<BridgeError>,
}

/// Coordinator-side handle to a running pipeline.
pub struct PipelineHandle {
    tp: TopicPartition,
    inbox: mpsc::Sender<Vec<SourceRecord>>,
    stop: watch::Sender<bool>,
    state: watch::Receiver<PipelineState>,
    task: JoinHandle<PartitionReport>,
}

impl PipelineHandle {
    pub fn tp(&self) -> &TopicPartition {
        &self.tp
    }

    pub fn state(&self) -> PipelineState {
        *self.state.borrow()
    }

    /// Hand records to the pipeline. Returns `false` if it no longer accepts them.
    pub async fn deliver(&self, records: Vec<SourceRecord>) -> bool {
        self.inbox.send(records).await.is_ok()
    }

    /// Ask the pipeline to drain. Returns immediately.
    pub fn drain(&self) {
        let _ = self.stop.send(true);
    }

    /// Drain and wait for the final report.
    ///
    /// Gives up after `timeout`, aborting the task.
    pub async fn stop(self, timeout: Duration) -> Result<PartitionReport> {
        self.drain();
        let mut task = self.task;
        match tokio::time::timeout(timeout, &mut task).await {
            Ok(Ok(report)) => Ok(report),
            Ok(Err(e)) => Err(BridgeError::Runtime(format!(
                "pipeline for {} failed: {}",
                self.tp, e
            ))),
            Err(_) => {
                task.abort();
                Err(BridgeError::Runtime(format!(
                    "pipeline for {} did not stop within {:?}",
                    self.tp, timeout
                )))
            }
        }
    }
}

type InFlight = BoxFuture<'static, (u64, Instant, AckResult)>;
type PendingSave = BoxFuture<'static, (u64, std::result::Result<(), CheckpointError>, Duration)>;

/// The state and loop of one partition.
pub struct PartitionPipeline {
    tp: TopicPartition,
    /// Publisher stream; keeps this partition's records in offset order.
    stream: String,
    start_offset: u64,
    settings: PipelineSettings,
    ctx: PipelineContext,
    tracker: WatermarkTracker,
    inbox: mpsc::Receiver<Vec<SourceRecord>>,
    stop: watch::Receiver<bool>,
    state: watch::Sender<PipelineState>,
    /// Received, not yet published.
    backlog: VecDeque<SourceRecord>,
    /// Published, awaiting outcome; kept for republish and dead-lettering.
    records: BTreeMap<u64, SourceRecord>,
    in_flight: FuturesUnordered<InFlight>,
    /// Offsets failed with `OrderingKeyPaused`, to be published again.
    to_republish: BTreeSet<u64>,
    saving: Option<PendingSave>,
    paused: bool,
    /// Set after a fatal error; nothing new is published.
    halted: bool,
}

impl PartitionPipeline {
    /// Spawn a pipeline for `tp` starting at position `start_offset`.
    pub fn spawn(
        tp: TopicPartition,
        start_offset: u64,
        settings: PipelineSettings,
        ctx: PipelineContext,
    ) -> PipelineHandle {
        let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_DEPTH);
        let (stop_tx, stop_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(PipelineState::Running);

        let pipeline = Self {
            stream: tp.to_string(),
            tp: tp.clone(),
            start_offset,
            settings,
            ctx,
            tracker: WatermarkTracker::new(start_offset),
            inbox: inbox_rx,
            stop: stop_rx,
            state: state_tx,
            backlog: VecDeque::new(),
            records: BTreeMap::new(),
            in_flight: FuturesUnordered::new(),
            to_republish: BTreeSet::new(),
            saving: None,
            paused: false,
            halted: false,
        };
        let task = tokio::spawn(pipeline.run());

        PipelineHandle {
            tp,
            inbox: inbox_tx,
            stop: stop_tx,
            state: state_rx,
            task,
        }
    }

    async fn run(mut self) -> PartitionReport {
        info!(tp = %self.tp, start_offset = self.start_offset, "Pipeline started");
        self.ctx.observer.on_event(&BridgeEvent::PipelineStarted {
            tp: self.tp.clone(),
            start_offset: self.start_offset,
        });

        let mut commit_timer = interval(self.settings.commit_interval.max(Duration::from_millis(1)));
        commit_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        commit_timer.reset();

        loop {
            if self.stop_requested() {
                break;
            }
            if !self.to_republish.is_empty() && self.in_flight.is_empty() && !self.halted {
                self.republish().await;
            }
            self.update_flow_control();

            let can_publish = self.can_publish();
            tokio::select! {
                changed = self.stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                Some((offset, started, result)) = self.in_flight.next(), if !self.in_flight.is_empty() => {
                    self.on_ack(offset, started, result).await;
                }
                Some((value, result, latency)) = OptionFuture::from(self.saving.as_mut()), if self.saving.is_some() => {
                    self.saving = None;
                    self.on_saved(value, result, latency).await;
                }
                batch = self.inbox.recv() => match batch {
                    Some(records) => self.accept(records),
                    None => break,
                },
                _ = commit_timer.tick() => {
                    self.emit_progress();
                    self.maybe_checkpoint(true);
                }
                _ = std::future::ready(()), if can_publish => {
                    self.publish_next().await;
                }
            }
        }

        self.drain().await
    }

    fn stop_requested(&self) -> bool {
        *self.stop.borrow()
    }

    fn can_publish(&self) -> bool {
        !self.halted
            && !self.backlog.is_empty()
            && self.to_republish.is_empty()
            && self.tracker.in_flight() < self.settings.max_in_flight
    }

    fn accept(&mut self, records: Vec<SourceRecord>) {
        if self.halted || records.is_empty() {
            return;
        }
        self.ctx.observer.on_event(&BridgeEvent::RecordsReceived {
            tp: self.tp.clone(),
            count: records.len(),
        });
        self.backlog.extend(records);
    }

    fn update_flow_control(&mut self) {
        let max = self.settings.max_in_flight;
        let saturated = self.tracker.in_flight() >= max || self.backlog.len() >= max;

        if saturated && !self.paused {
            if let Err(e) = self.ctx.consumer.pause(&self.tp) {
                warn!(tp = %self.tp, error = %e, "Failed to pause partition");
                return;
            }
            self.paused = true;
            debug!(tp = %self.tp, in_flight = self.tracker.in_flight(), "Partition paused");
            self.ctx.observer.on_event(&BridgeEvent::PartitionPaused {
                tp: self.tp.clone(),
                in_flight: self.tracker.in_flight(),
            });
        } else if !saturated && self.paused {
            if let Err(e) = self.ctx.consumer.resume(&self.tp) {
                warn!(tp = %self.tp, error = %e, "Failed to resume partition");
                return;
            }
            self.paused = false;
            debug!(tp = %self.tp, "Partition resumed");
            self.ctx
                .observer
                .on_event(&BridgeEvent::PartitionResumed { tp: self.tp.clone() });
        }
    }

    // -----------------------------------------------------------------------
    // Publishing
    // -----------------------------------------------------------------------

    async fn publish_next(&mut self) {
        let Some(record) = self.backlog.pop_front() else {
            return;
        };
        let offset = record.offset;
        if !self.tracker.accepts(offset) {
            trace!(tp = %self.tp, offset, "Skipping already tracked offset");
            return;
        }

        let Some(request) = self.ctx.mapper.map(&record) else {
            self.tracker.track(offset);
            self.resolve_dropped(offset, DropReason::Mapper);
            return;
        };

        // Publishing blocks at the publisher's high-water mark; a stop
        // request puts the record back untouched.
        let publisher = self.ctx.publisher.clone();
        let ack = tokio::select! {
            ack = publisher.publish_in(&self.stream, request) => ack,
            _ = self.stop.changed() => {
                self.backlog.push_front(record);
                return;
            }
        };

        self.tracker.track(offset);
        self.records.insert(offset, record);
        let started = Instant::now();
        self.in_flight
            .push(async move { (offset, started, ack.await) }.boxed());
    }

    /// Publish records that failed behind a paused ordering key, in offset order.
    async fn republish(&mut self) {
        let offsets = std::mem::take(&mut self.to_republish);
        let mut requests: Vec<(u64, PublishRequest)> = Vec::with_capacity(offsets.len());
        let mut keys = BTreeSet::new();

        for offset in offsets {
            let Some(record) = self.records.get(&offset) else {
                continue;
            };
            match self.ctx.mapper.map(record) {
                Some(request) => {
                    if let Some(key) = &request.ordering_key {
                        keys.insert(key.clone());
                    }
                    requests.push((offset, request));
                }
                None => self.resolve_dropped(offset, DropReason::Mapper),
            }
        }

        for key in &keys {
            debug!(tp = %self.tp, ordering_key = %key, "Resuming ordering key");
            self.ctx.publisher.resume_publish(key);
        }
        info!(tp = %self.tp, records = requests.len(), "Republishing records after ordering key pause");
        let publisher = self.ctx.publisher.clone();
        let mut pending = requests.into_iter();
        while let Some((offset, request)) = pending.next() {
            let ack = tokio::select! {
                ack = publisher.publish_in(&self.stream, request) => ack,
                _ = self.stop.changed() => {
                    self.to_republish.insert(offset);
                    self.to_republish.extend(pending.map(|(offset, _)| offset));
                    return;
                }
            };
            let started = Instant::now();
            self.in_flight
                .push(async move { (offset, started, ack.await) }.boxed());
        }
    }

    // -----------------------------------------------------------------------
    // Acks
    // -----------------------------------------------------------------------

    async fn on_ack(&mut self, offset: u64, started: Instant, result: AckResult) {
        match result {
            Ok(_message_id) => {
                self.records.remove(&offset);
                self.ctx.observer.on_event(&BridgeEvent::RecordAcked {
                    tp: self.tp.clone(),
                    offset,
                    latency: started.elapsed(),
                });
                if self.tracker.resolve(offset, Resolution::Acked).is_some() {
                    self.maybe_checkpoint(false);
                }
            }
            Err(PublishFailure::OrderingKeyPaused(key)) => {
                if self.running() {
                    trace!(tp = %self.tp, offset, ordering_key = %key, "Record queued for republish");
                    self.to_republish.insert(offset);
                }
            }
            Err(PublishFailure::Rejected { status, reason }) => {
                let reason = format!("{status}: {reason}");
                self.apply_gap_policy(offset, reason).await;
            }
            Err(PublishFailure::Unavailable(reason)) => {
                self.fail(BridgeError::PublishUnavailable {
                    tp: self.tp.clone(),
                    offset,
                    reason,
                });
            }
            Err(PublishFailure::Auth(message)) => {
                self.fail(BridgeError::AuthFailure {
                    system: "pubsub",
                    message,
                });
            }
            Err(PublishFailure::Shutdown) => {
                warn!(tp = %self.tp, offset, "Publisher shut down before the record was acknowledged");
                self.halted = true;
            }
        }
    }

    async fn apply_gap_policy(&mut self, offset: u64, reason: String) {
        match self.settings.gap_policy {
            GapPolicy::Halt => {
                self.fail(BridgeError::PublishRejected {
                    tp: self.tp.clone(),
                    offset,
                    reason,
                });
            }
            GapPolicy::SkipAndLog => {
                warn!(tp = %self.tp, offset, reason = %reason, "Skipping permanently rejected record");
                self.resolve_dropped(offset, DropReason::Skipped);
            }
            GapPolicy::DeadLetter => {
                let outcome = match (&self.ctx.dead_letter, self.records.get(&offset)) {
                    (Some(hook), Some(record)) => hook.dead_letter(record, &reason).await,
                    (None, _) => Err("no dead-letter hook configured".to_string()),
                    (_, None) => Err("record no longer available".to_string()),
                };
                match outcome {
                    Ok(()) => {
                        info!(tp = %self.tp, offset, reason = %reason, "Record dead-lettered");
                        self.resolve_dropped(offset, DropReason::DeadLettered);
                    }
                    Err(e) => self.fail(BridgeError::DeadLetter {
                        tp: self.tp.clone(),
                        offset,
                        reason: e,
                    }),
                }
            }
        }
    }

    fn resolve_dropped(&mut self, offset: u64, reason: DropReason) {
        self.records.remove(&offset);
        self.ctx.observer.on_event(&BridgeEvent::RecordDropped {
            tp: self.tp.clone(),
            offset,
            reason,
        });
        if self.tracker.resolve(offset, Resolution::Dropped).is_some() {
            self.maybe_checkpoint(false);
        }
    }

    /// Report a fatal error and stop publishing. The failed offset stays
    /// unresolved, so the watermark never passes it.
    fn fail(&mut self, error: BridgeError) {
        warn!(tp = %self.tp, error = %error, "Pipeline halted");
        self.halted = true;
        self.backlog.clear();
        self.to_republish.clear();
        let _ = self.ctx.fatal_tx.send(error);
    }

    fn running(&self) -> bool {
        *self.state.borrow() == PipelineState::Running
    }

    // -----------------------------------------------------------------------
    // Checkpoints
    // -----------------------------------------------------------------------

    /// Start a checkpoint write if one is due and none is outstanding.
    fn maybe_checkpoint(&mut self, force: bool) {
        if self.saving.is_some() {
            return;
        }
        let Some(value) = self.tracker.pending_checkpoint() else {
            return;
        };
        if !force && self.tracker.uncommitted() < self.settings.commit_interval_records {
            return;
        }
        self.saving = Some(self.save_future(value));
    }

    fn save_future(&self, value: u64) -> PendingSave {
        let store = self.ctx.checkpoints.clone();
        let tp = self.tp.clone();
        let policy = self.settings.checkpoint_retry.clone();
        async move {
            let started = std::time::Instant::now();
            let result = retry_with_backoff(&policy, || store.save(&tp, value)).await;
            (value, result, started.elapsed())
        }
        .boxed()
    }

    async fn on_saved(
        &mut self,
        value: u64,
        result: std::result::Result<(), CheckpointError>,
        latency: Duration,
    ) {
        match result {
            Ok(()) => {
                self.tracker.mark_committed(value + 1);
                debug!(tp = %self.tp, offset = value, "Checkpoint saved");
                self.ctx.observer.on_event(&BridgeEvent::CheckpointSaved {
                    tp: self.tp.clone(),
                    offset: value,
                    latency,
                });
                if let Err(e) = self.ctx.consumer.commit(&self.tp, value + 1).await {
                    debug!(tp = %self.tp, error = %e, "Consumer group commit failed");
                }
            }
            Err(err) => {
                let conflict = matches!(err, CheckpointError::Conflict(_));
                self.ctx.observer.on_event(&BridgeEvent::CheckpointFailed {
                    tp: self.tp.clone(),
                    offset: value,
                    error: err.to_string(),
                    conflict,
                });
                if conflict && !self.running() {
                    warn!(tp = %self.tp, error = %err, "Checkpoint conflict while draining");
                } else {
                    self.fail(BridgeError::from_checkpoint(&self.tp, err));
                }
            }
        }
    }

    fn emit_progress(&self) {
        self.ctx.observer.on_event(&BridgeEvent::PartitionProgress {
            tp: self.tp.clone(),
            in_flight: self.tracker.in_flight(),
            watermark: self.tracker.watermark(),
            committed: self.tracker.committed(),
        });
    }

    // -----------------------------------------------------------------------
    // Drain
    // -----------------------------------------------------------------------

    async fn drain(mut self) -> PartitionReport {
        self.state.send_replace(PipelineState::Draining);
        debug!(
            tp = %self.tp,
            in_flight = self.tracker.in_flight(),
            discarded = self.backlog.len(),
            "Pipeline draining"
        );
        self.backlog.clear();
        self.to_republish.clear();
        self.inbox.close();

        let deadline = Instant::now() + self.settings.drain_timeout;
        while !self.in_flight.is_empty() || self.saving.is_some() {
            tokio::select! {
                Some((offset, started, result)) = self.in_flight.next(), if !self.in_flight.is_empty() => {
                    self.on_ack(offset, started, result).await;
                }
                Some((value, result, latency)) = OptionFuture::from(self.saving.as_mut()), if self.saving.is_some() => {
                    self.saving = None;
                    self.on_saved(value, result, latency).await;
                }
                _ = sleep_until(deadline) => {
                    warn!(
                        tp = %self.tp,
                        unresolved = self.tracker.in_flight(),
                        "Drain deadline reached with records unresolved"
                    );
                    break;
                }
            }
        }
        self.saving = None;
        self.in_flight.clear();

        if let Some(value) = self.tracker.pending_checkpoint() {
            let save = self.save_future(value);
            match tokio::time::timeout(self.settings.drain_timeout, save).await {
                Ok((value, result, latency)) => self.on_saved(value, result, latency).await,
                Err(_) => warn!(tp = %self.tp, offset = value, "Final checkpoint timed out"),
            }
        }

        self.state.send_replace(PipelineState::Stopped);
        let report = PartitionReport {
            tp: self.tp.clone(),
            start_offset: self.start_offset,
            watermark: self.tracker.watermark(),
            committed: self.tracker.committed(),
            acked: self.tracker.acked(),
            dropped: self.tracker.dropped(),
            unresolved: self.tracker.in_flight(),
        };
        info!(
            tp = %self.tp,
            watermark = report.watermark,
            committed = report.committed,
            unresolved = report.unresolved,
            "Pipeline stopped"
        );
        self.ctx.observer.on_event(&BridgeEvent::PipelineStopped {
            tp: self.tp.clone(),
            watermark: report.watermark,
            committed: report.committed,
            unresolved: report.unresolved,
        });
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::ObjectStoreCheckpointStore;
    use crate::config::{BatchSettings, OrderingKeyMode};
    use crate::mapper::DefaultRecordMapper;
    use crate::observer::{NoopObserver, RecordingObserver};
    use crate::sink::{InMemoryTransport, PublishTransport, SinkStatus, TransportError};
    use crate::source::InMemorySourceConsumer;
    use object_store::memory::InMemory;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    struct Harness {
        transport: Arc<InMemoryTransport>,
        consumer: InMemorySourceConsumer,
        checkpoints: Arc<ObjectStoreCheckpointStore>,
        observer: Arc<RecordingObserver>,
        fatal_rx: mpsc::UnboundedReceiver<BridgeError>,
        ctx: PipelineContext,
    }

    fn tp() -> TopicPartition {
        TopicPartition::new("orders", 0)
    }

    fn settings(gap_policy: GapPolicy) -> PipelineSettings {
        PipelineSettings {
            max_in_flight: 100,
            commit_interval_records: 1,
            commit_interval: Duration::from_millis(20),
            checkpoint_retry: RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(2), 2.0),
            gap_policy,
            drain_timeout: Duration::from_secs(5),
        }
    }

    fn harness(transport: InMemoryTransport, mapper: Arc<dyn RecordMapper>) -> Harness {
        let transport = Arc::new(transport);
        harness_over(transport.clone(), transport, mapper, 1000)
    }

    /// Harness publishing through `sink`, with `transport` as the record of
    /// what was accepted.
    fn harness_over(
        sink: Arc<dyn PublishTransport>,
        transport: Arc<InMemoryTransport>,
        mapper: Arc<dyn RecordMapper>,
        capacity: usize,
    ) -> Harness {
        let consumer = InMemorySourceConsumer::new(100);
        let checkpoints = Arc::new(ObjectStoreCheckpointStore::new(Arc::new(InMemory::new()), "cp"));
        let observer = Arc::new(RecordingObserver::new());
        let publisher = Publisher::new(
            sink,
            "projects/p/topics/t",
            BatchSettings {
                max_bytes: 1_000_000,
                max_count: 10,
                max_latency: Duration::from_millis(1),
            },
            RetryPolicy::new(1, Duration::from_millis(1), Duration::from_millis(2), 2.0),
            capacity,
            Arc::new(NoopObserver),
        );
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        let ctx = PipelineContext {
            consumer: Arc::new(consumer.clone()),
            publisher,
            mapper,
            checkpoints: checkpoints.clone(),
            observer: observer.clone(),
            dead_letter: None,
            fatal_tx,
        };
        Harness {
            transport,
            consumer,
            checkpoints,
            observer,
            fatal_rx,
            ctx,
        }
    }

    fn records(range: std::ops::Range<u64>) -> Vec<SourceRecord> {
        range
            .map(|o| SourceRecord::new("orders", 0, o, format!("v{o}")))
            .collect()
    }

    fn default_mapper() -> Arc<dyn RecordMapper> {
        Arc::new(DefaultRecordMapper::new(OrderingKeyMode::None))
    }

    async fn wait_for_offsets(transport: &InMemoryTransport, count: usize) {
        for _ in 0..500 {
            if transport.offsets_for(0).len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {count} published records");
    }

    // ---------------------------------------------------------------
    // Happy path
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn test_publishes_in_order_and_checkpoints() {
        let h = harness(InMemoryTransport::new(), default_mapper());
        let handle = PartitionPipeline::spawn(tp(), 0, settings(GapPolicy::Halt), h.ctx.clone());

        assert!(handle.deliver(records(0..20)).await);
        wait_for_offsets(&h.transport, 20).await;

        let report = handle.stop(Duration::from_secs(10)).await.unwrap();
        assert_eq!(report.watermark, 20);
        assert_eq!(report.committed, 20);
        assert_eq!(report.checkpointed(), Some(19));
        assert_eq!(report.unresolved, 0);
        assert_eq!(h.transport.offsets_for(0), (0..20).collect::<Vec<_>>());
        assert_eq!(h.checkpoints.load(&tp()).await.unwrap(), Some(19));
        assert_eq!(h.consumer.group_offset(&tp()), Some(20));
    }

    #[tokio::test]
    async fn test_empty_partition_writes_no_checkpoint() {
        let h = harness(InMemoryTransport::new(), default_mapper());
        let handle = PartitionPipeline::spawn(tp(), 7, settings(GapPolicy::Halt), h.ctx.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;

        let report = handle.stop(Duration::from_secs(5)).await.unwrap();
        assert_eq!(report.watermark, 7);
        assert_eq!(report.committed, 7);
        assert_eq!(report.checkpointed(), None);
        assert_eq!(h.checkpoints.load(&tp()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_redelivered_records_are_ignored() {
        let h = harness(InMemoryTransport::new(), default_mapper());
        let handle = PartitionPipeline::spawn(tp(), 5, settings(GapPolicy::Halt), h.ctx.clone());

        handle.deliver(records(0..10)).await;
        handle.deliver(records(8..12)).await;
        wait_for_offsets(&h.transport, 7).await;
        let report = handle.stop(Duration::from_secs(5)).await.unwrap();

        assert_eq!(h.transport.offsets_for(0), (5..12).collect::<Vec<_>>());
        assert_eq!(report.watermark, 12);
    }

    // ---------------------------------------------------------------
    // Mapper drops
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn test_mapper_drop_is_terminal() {
        let inner = DefaultRecordMapper::new(OrderingKeyMode::None);
        let mapper: Arc<dyn RecordMapper> = Arc::new(move |r: &SourceRecord| {
            if r.offset % 2 == 0 {
                None
            } else {
                inner.map(r)
            }
        });
        let h = harness(InMemoryTransport::new(), mapper);
        let handle = PartitionPipeline::spawn(tp(), 0, settings(GapPolicy::Halt), h.ctx.clone());

        handle.deliver(records(0..10)).await;
        wait_for_offsets(&h.transport, 5).await;
        let report = handle.stop(Duration::from_secs(5)).await.unwrap();

        assert_eq!(h.transport.offsets_for(0), vec![1, 3, 5, 7, 9]);
        assert_eq!(report.watermark, 10);
        assert_eq!(report.dropped, 5);
        assert_eq!(report.acked, 5);
    }

    // ---------------------------------------------------------------
    // Gap policy
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn test_halt_stops_before_rejected_offset() {
        let transport = InMemoryTransport::new();
        transport.reject_when(|r| r.payload.as_ref() == b"v4");
        let mut h = harness(transport, default_mapper());
        let handle = PartitionPipeline::spawn(tp(), 0, settings(GapPolicy::Halt), h.ctx.clone());

        handle.deliver(records(0..10)).await;
        let fatal = tokio::time::timeout(Duration::from_secs(5), h.fatal_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(fatal, BridgeError::PublishRejected { offset: 4, .. }));

        let report = handle.stop(Duration::from_secs(5)).await.unwrap();
        assert_eq!(report.watermark, 4);
        assert_eq!(report.checkpointed(), Some(3));
        assert_eq!(h.checkpoints.load(&tp()).await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_skip_and_log_advances_past_rejection() {
        let transport = InMemoryTransport::new();
        transport.reject_when(|r| r.payload.as_ref() == b"v4");
        let mut h = harness(transport, default_mapper());
        let handle =
            PartitionPipeline::spawn(tp(), 0, settings(GapPolicy::SkipAndLog), h.ctx.clone());

        handle.deliver(records(0..10)).await;
        wait_for_offsets(&h.transport, 9).await;
        let report = handle.stop(Duration::from_secs(5)).await.unwrap();

        assert_eq!(report.watermark, 10);
        assert_eq!(report.dropped, 1);
        assert!(h.fatal_rx.try_recv().is_err());
        assert!(h.observer.events().iter().any(|e| matches!(
            e,
            BridgeEvent::RecordDropped {
                offset: 4,
                reason: DropReason::Skipped,
                ..
            }
        )));
    }

    struct CollectingHook {
        offsets: Mutex<Vec<u64>>,
        fail: bool,
    }

    #[async_trait]
    impl DeadLetterHook for CollectingHook {
        async fn dead_letter(
            &self,
            record: &SourceRecord,
            _reason: &str,
        ) -> std::result::Result<(), String> {
            if self.fail {
                return Err("dead-letter topic unreachable".to_string());
            }
            self.offsets.lock().unwrap().push(record.offset);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_dead_letter_hook_receives_rejected_record() {
        let transport = InMemoryTransport::new();
        transport.reject_when(|r| r.payload.as_ref() == b"v2");
        let mut h = harness(transport, default_mapper());
        let hook = Arc::new(CollectingHook {
            offsets: Mutex::new(Vec::new()),
            fail: false,
        });
        h.ctx.dead_letter = Some(hook.clone());
        let handle =
            PartitionPipeline::spawn(tp(), 0, settings(GapPolicy::DeadLetter), h.ctx.clone());

        handle.deliver(records(0..5)).await;
        wait_for_offsets(&h.transport, 4).await;
        let report = handle.stop(Duration::from_secs(5)).await.unwrap();

        assert_eq!(*hook.offsets.lock().unwrap(), vec![2]);
        assert_eq!(report.watermark, 5);
        assert!(h.fatal_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dead_letter_hook_failure_is_fatal() {
        let transport = InMemoryTransport::new();
        transport.reject_when(|r| r.payload.as_ref() == b"v2");
        let mut h = harness(transport, default_mapper());
        h.ctx.dead_letter = Some(Arc::new(CollectingHook {
            offsets: Mutex::new(Vec::new()),
            fail: true,
        }));
        let handle =
            PartitionPipeline::spawn(tp(), 0, settings(GapPolicy::DeadLetter), h.ctx.clone());

        handle.deliver(records(0..5)).await;
        let fatal = tokio::time::timeout(Duration::from_secs(5), h.fatal_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(fatal, BridgeError::DeadLetter { offset: 2, .. }));

        let report = handle.stop(Duration::from_secs(5)).await.unwrap();
        assert_eq!(report.watermark, 2);
    }

    // ---------------------------------------------------------------
    // Sink failures
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn test_unavailable_sink_is_fatal_and_holds_checkpoint() {
        let transport = InMemoryTransport::new();
        transport.set_outage(Some(SinkStatus::Unavailable));
        let mut h = harness(transport, default_mapper());
        let handle = PartitionPipeline::spawn(tp(), 0, settings(GapPolicy::Halt), h.ctx.clone());

        handle.deliver(records(0..3)).await;
        let fatal = tokio::time::timeout(Duration::from_secs(5), h.fatal_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(fatal, BridgeError::PublishUnavailable { .. }));

        let report = handle.stop(Duration::from_secs(5)).await.unwrap();
        assert_eq!(report.watermark, 0);
        assert_eq!(h.checkpoints.load(&tp()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_auth_failure_is_fatal() {
        let transport = InMemoryTransport::new();
        transport.set_outage(Some(SinkStatus::Unauthenticated));
        let mut h = harness(transport, default_mapper());
        let handle = PartitionPipeline::spawn(tp(), 0, settings(GapPolicy::Halt), h.ctx.clone());

        handle.deliver(records(0..1)).await;
        let fatal = tokio::time::timeout(Duration::from_secs(5), h.fatal_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(fatal, BridgeError::AuthFailure { system: "pubsub", .. }));
        handle.stop(Duration::from_secs(5)).await.unwrap();
    }

    // ---------------------------------------------------------------
    // Ordering keys
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn test_paused_ordering_key_records_are_republished() {
        let transport = InMemoryTransport::new();
        transport.reject_when(|r| r.payload.as_ref() == b"v1");
        let mut h = harness(transport, Arc::new(DefaultRecordMapper::new(OrderingKeyMode::Partition)));
        let handle =
            PartitionPipeline::spawn(tp(), 0, settings(GapPolicy::SkipAndLog), h.ctx.clone());

        handle.deliver(records(0..6)).await;
        wait_for_offsets(&h.transport, 5).await;
        let report = handle.stop(Duration::from_secs(5)).await.unwrap();

        assert_eq!(h.transport.offsets_for(0), vec![0, 2, 3, 4, 5]);
        assert_eq!(report.watermark, 6);
        assert!(h.fatal_rx.try_recv().is_err());
    }

    /// Rejects `v1`, then never answers another publish call.
    struct StallAfterRejection {
        inner: Arc<InMemoryTransport>,
        stalled: AtomicBool,
    }

    #[async_trait]
    impl PublishTransport for StallAfterRejection {
        async fn publish(
            &self,
            topic: &str,
            messages: &[PublishRequest],
        ) -> std::result::Result<Vec<String>, TransportError> {
            if self.stalled.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            if messages.iter().any(|m| m.payload.as_ref() == b"v1") {
                self.stalled.store(true, Ordering::SeqCst);
            }
            self.inner.publish(topic, messages).await
        }
    }

    #[tokio::test]
    async fn test_stop_interrupts_republish_blocked_on_capacity() {
        let transport = Arc::new(InMemoryTransport::new());
        transport.reject_when(|r| r.payload.as_ref() == b"v1");
        let sink = Arc::new(StallAfterRejection {
            inner: transport.clone(),
            stalled: AtomicBool::new(false),
        });
        let h = harness_over(
            sink,
            transport,
            Arc::new(DefaultRecordMapper::new(OrderingKeyMode::Partition)),
            1,
        );
        let mut s = settings(GapPolicy::SkipAndLog);
        s.drain_timeout = Duration::from_millis(100);
        let handle = PartitionPipeline::spawn(tp(), 0, s, h.ctx.clone());

        handle.deliver(records(0..4)).await;
        wait_for_offsets(&h.transport, 1).await;
        // Let the rejection pause the key and the republish stall.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let report = handle.stop(Duration::from_secs(2)).await.unwrap();
        assert_eq!(h.transport.offsets_for(0), vec![0]);
        assert_eq!(report.watermark, 2);
        assert!(report.unresolved > 0);
    }

    // ---------------------------------------------------------------
    // Flow control
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn test_pauses_at_max_in_flight() {
        let h = harness(
            InMemoryTransport::new().with_latency(Duration::from_millis(50)),
            default_mapper(),
        );
        let mut s = settings(GapPolicy::Halt);
        s.max_in_flight = 3;
        let handle = PartitionPipeline::spawn(tp(), 0, s, h.ctx.clone());

        handle.deliver(records(0..12)).await;
        wait_for_offsets(&h.transport, 12).await;
        let report = handle.stop(Duration::from_secs(5)).await.unwrap();
        assert_eq!(report.watermark, 12);

        let events = h.observer.events();
        let max_in_flight = events
            .iter()
            .filter_map(|e| match e {
                BridgeEvent::PartitionPaused { in_flight, .. } => Some(*in_flight),
                _ => None,
            })
            .max();
        assert!(max_in_flight.is_some(), "partition should have been paused");
        assert!(max_in_flight.unwrap() <= 3);
        assert!(h.consumer.pause_count(&tp()) > 0);
    }
}
