//! Bridge coordinator: consumer-group lifecycle and the shutdown state machine.
//!
//! The coordinator owns the poll loop. Rebalance events arrive in-band from
//! [`SourceConsumer::poll`] and are applied between polls: assignment
//! resolves a starting offset, seeks and spawns a [`PartitionPipeline`];
//! revocation drains the partition's pipeline before the next poll. A
//! revocation the client holds (see [`SourceConsumer::next_revocation`]) is
//! drained while the client waits and released afterwards.
//!
//! A poll that has started is always awaited to completion, even across
//! loop iterations, so no events taken from the client are lost.
//!
//! ```text
//! Starting ──first assignment / assignment_wait──▶ Running
//! Running  ──signal / await-termination / fatal──▶ Stopping
//! Stopping ──pipelines drained, publisher shut──▶ Stopped
//! ```
//!
//! The first fatal error reported by any pipeline is recorded and stops the
//! bridge; later ones are only logged.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, OptionFuture};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::checkpoint::CheckpointStore;
use crate::config::{AwaitTermination, BridgeConfig, StartingOffsetPolicy};
use crate::error::{BridgeError, Result};
use crate::mapper::{DefaultRecordMapper, RecordMapper};
use crate::observer::{BridgeEvent, Observer, TracingObserver};
use crate::pipeline::{
    DeadLetterHook, PartitionPipeline, PartitionReport, PipelineContext, PipelineHandle,
    PipelineSettings,
};
use crate::record::{SourceRecord, TopicPartition};
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::shutdown::{ShutdownHandle, ShutdownSignal};
use crate::sink::{PublishTransport, Publisher};
use crate::source::{ConsumerEvent, SourceConsumer};

/// Extra time granted to a draining pipeline beyond twice the drain timeout
/// (drain plus final checkpoint).
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Lifecycle of the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl CoordinatorState {
    /// Numeric value exported on the state gauge.
    pub fn as_gauge(&self) -> i64 {
        match self {
            CoordinatorState::Starting => 0,
            CoordinatorState::Running => 1,
            CoordinatorState::Stopping => 2,
            CoordinatorState::Stopped => 3,
        }
    }
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoordinatorState::Starting => write!(f, "starting"),
            CoordinatorState::Running => write!(f, "running"),
            CoordinatorState::Stopping => write!(f, "stopping"),
            CoordinatorState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Why the bridge left `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// A shutdown was requested.
    Signal(ShutdownSignal),
    /// The await-termination timeout expired.
    AwaitTermination,
    /// A fatal error was recorded.
    Fatal,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Signal(signal) => write!(f, "shutdown requested ({signal})"),
            StopReason::AwaitTermination => write!(f, "await-termination timeout elapsed"),
            StopReason::Fatal => write!(f, "fatal error"),
        }
    }
}

/// Result of a bridge run.
#[derive(Debug, Clone)]
pub struct BridgeOutcome {
    pub reason: StopReason,
    /// The first fatal error, if any.
    pub fatal: Option<BridgeError>,
    /// Final state of every pipeline that ran, in stop order.
    pub partitions: Vec<PartitionReport>,
}

impl BridgeOutcome {
    /// Process exit code: `0` clean, `1` fatal, `2` configuration invalid.
    pub fn exit_code(&self) -> i32 {
        match &self.fatal {
            None => 0,
            Some(BridgeError::ConfigInvalid(_)) => 2,
            Some(_) => 1,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.fatal.is_none()
    }

    /// Last report for `tp`.
    pub fn partition(&self, tp: &TopicPartition) -> Option<&PartitionReport> {
        self.partitions.iter().rev().find(|r| &r.tp == tp)
    }
}

/// Runs the bridge until it stops.
///
/// # Example
///
/// ```ignore
/// let outcome = Coordinator::new(config, consumer, transport, checkpoints)
///     .with_observer(Arc::new(TracingObserver))
///     .with_shutdown(shutdown.clone())
///     .run()
///     .await;
/// std::process::exit(outcome.exit_code());
/// ```
pub struct Coordinator {
    config: BridgeConfig,
    consumer: Arc<dyn SourceConsumer>,
    transport: Arc<dyn PublishTransport>,
    checkpoints: Arc<dyn CheckpointStore>,
    mapper: Arc<dyn RecordMapper>,
    observer: Arc<dyn Observer>,
    dead_letter: Option<Arc<dyn DeadLetterHook>>,
    shutdown: ShutdownHandle,
    source_retry: RetryPolicy,
}

impl Coordinator {
    pub fn new(
        config: BridgeConfig,
        consumer: Arc<dyn SourceConsumer>,
        transport: Arc<dyn PublishTransport>,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Self {
        let mapper = Arc::new(DefaultRecordMapper::new(config.ordering_key));
        Self {
            config,
            consumer,
            transport,
            checkpoints,
            mapper,
            observer: Arc::new(TracingObserver),
            dead_letter: None,
            shutdown: ShutdownHandle::new(),
            source_retry: RetryPolicy::new(
                10,
                Duration::from_millis(100),
                Duration::from_secs(10),
                2.0,
            ),
        }
    }

    pub fn with_mapper(mut self, mapper: Arc<dyn RecordMapper>) -> Self {
        self.mapper = mapper;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_dead_letter_hook(mut self, hook: Arc<dyn DeadLetterHook>) -> Self {
        self.dead_letter = Some(hook);
        self
    }

    pub fn with_shutdown(mut self, shutdown: ShutdownHandle) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Retry policy for transient consumer poll errors.
    pub fn with_source_retry(mut self, policy: RetryPolicy) -> Self {
        self.source_retry = policy;
        self
    }

    /// A handle that stops this coordinator when triggered.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Run until a stop condition, then drain and return the outcome.
    pub async fn run(self) -> BridgeOutcome {
        let publisher = Publisher::new(
            self.transport.clone(),
            self.config.destination_topic.to_string(),
            self.config.batch.clone(),
            self.config.publish_retry.clone(),
            self.config.publisher_buffer_capacity,
            self.observer.clone(),
        );
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        let ctx = PipelineContext {
            consumer: self.consumer.clone(),
            publisher: publisher.clone(),
            mapper: self.mapper.clone(),
            checkpoints: self.checkpoints.clone(),
            observer: self.observer.clone(),
            dead_letter: self.dead_letter.clone(),
            fatal_tx,
        };

        let mut supervisor = Supervisor {
            settings: PipelineSettings::from_config(&self.config),
            config: self.config,
            consumer: self.consumer,
            checkpoints: self.checkpoints,
            observer: self.observer,
            shutdown: self.shutdown,
            source_retry: self.source_retry,
            publisher,
            ctx,
            fatal_rx,
            pipelines: HashMap::new(),
            reports: Vec::new(),
            fatal: None,
            state: CoordinatorState::Starting,
            termination_at: None,
        };
        supervisor.run().await
    }
}

/// Mutable state of one run.
struct Supervisor {
    config: BridgeConfig,
    settings: PipelineSettings,
    consumer: Arc<dyn SourceConsumer>,
    checkpoints: Arc<dyn CheckpointStore>,
    observer: Arc<dyn Observer>,
    shutdown: ShutdownHandle,
    source_retry: RetryPolicy,
    publisher: Publisher,
    ctx: PipelineContext,
    fatal_rx: mpsc::UnboundedReceiver<BridgeError>,
    pipelines: HashMap<TopicPartition, PipelineHandle>,
    reports: Vec<PartitionReport>,
    fatal: Option<BridgeError>,
    state: CoordinatorState,
    termination_at: Option<Instant>,
}

impl Supervisor {
    async fn run(&mut self) -> BridgeOutcome {
        self.set_state(CoordinatorState::Starting);
        info!(
            topic = %self.config.source_topic,
            group = %self.config.consumer_group,
            destination = %self.config.destination_topic,
            "Starting bridge"
        );

        let reason = match self.consumer.subscribe(&self.config.source_topic).await {
            Ok(()) => self.supervise().await,
            Err(e) => {
                self.record_fatal(e);
                StopReason::Fatal
            }
        };

        info!(%reason, "Stopping bridge");
        self.stop().await;

        BridgeOutcome {
            reason,
            fatal: self.fatal.clone(),
            partitions: std::mem::take(&mut self.reports),
        }
    }

    /// The Starting/Running loop. Returns once a stop condition is met.
    async fn supervise(&mut self) -> StopReason {
        let assignment_deadline = Instant::now() + self.config.assignment_wait;
        let far = Instant::now() + Duration::from_secs(86_400 * 365);
        let mut polling: Option<BoxFuture<'static, Result<Vec<ConsumerEvent>>>> = None;

        loop {
            let starting = self.state == CoordinatorState::Starting;
            let termination_at = self.termination_at;
            if polling.is_none() {
                polling = Some(self.poll_with_retry());
            }

            tokio::select! {
                biased;

                signal = self.shutdown.wait() => {
                    return StopReason::Signal(signal);
                }
                Some(err) = self.fatal_rx.recv() => {
                    self.record_fatal(err);
                    return StopReason::Fatal;
                }
                _ = sleep_until(termination_at.unwrap_or(far)), if termination_at.is_some() => {
                    info!("Await-termination timeout elapsed");
                    return StopReason::AwaitTermination;
                }
                _ = sleep_until(assignment_deadline), if starting => {
                    warn!(
                        waited = ?self.config.assignment_wait,
                        "No partitions assigned yet, continuing to wait"
                    );
                    self.observer.on_event(&BridgeEvent::AssignmentWaitElapsed {
                        waited: self.config.assignment_wait,
                    });
                    self.enter_running();
                }
                revocation = self.consumer.next_revocation() => {
                    self.on_revoked(revocation.partitions.clone()).await;
                    revocation.complete();
                }
                Some(polled) = OptionFuture::from(polling.as_mut()) => {
                    polling = None;
                    let result = match polled {
                        Ok(events) => self.handle_events(events).await,
                        Err(e) => Err(e),
                    };
                    if let Err(e) = result {
                        self.record_fatal(e);
                        return StopReason::Fatal;
                    }
                }
            }
        }
    }

    /// One poll with source retries, independent of `self`.
    fn poll_with_retry(&self) -> BoxFuture<'static, Result<Vec<ConsumerEvent>>> {
        let consumer = self.consumer.clone();
        let policy = self.source_retry.clone();
        let timeout = self.config.poll_timeout;
        async move { retry_with_backoff(&policy, || consumer.poll(timeout)).await }.boxed()
    }

    fn enter_running(&mut self) {
        if self.state != CoordinatorState::Starting {
            return;
        }
        self.set_state(CoordinatorState::Running);
        self.termination_at = match self.config.await_termination {
            AwaitTermination::Unbounded => None,
            AwaitTermination::After(timeout) => Some(Instant::now() + timeout),
        };
    }

    async fn handle_events(&mut self, events: Vec<ConsumerEvent>) -> Result<()> {
        // Records polled alongside an assignment may predate the seek.
        let mut fresh: HashSet<TopicPartition> = HashSet::new();

        for event in events {
            match event {
                ConsumerEvent::Assigned(partitions) => {
                    fresh.extend(partitions.iter().cloned());
                    self.on_assigned(partitions).await?;
                }
                ConsumerEvent::Revoked(partitions) => {
                    self.on_revoked(partitions).await;
                }
                ConsumerEvent::Records(batch) => {
                    if fresh.contains(&batch.tp) {
                        debug!(tp = %batch.tp, count = batch.len(), "Dropping records polled before seek");
                        continue;
                    }
                    self.deliver(batch.tp, batch.records).await;
                }
            }
            if self.shutdown.is_shutdown() {
                break;
            }
        }
        Ok(())
    }

    async fn on_assigned(&mut self, partitions: Vec<TopicPartition>) -> Result<()> {
        let partitions: Vec<TopicPartition> = partitions
            .into_iter()
            .filter(|tp| tp.topic == self.config.source_topic && !self.pipelines.contains_key(tp))
            .collect();

        info!(count = partitions.len(), "Partitions assigned");
        self.observer.on_event(&BridgeEvent::PartitionsAssigned {
            partitions: partitions.clone(),
        });

        for tp in partitions {
            let start = self.resolve_start(&tp).await?;
            self.consumer.seek(&tp, start).await?;
            let handle = PartitionPipeline::spawn(
                tp.clone(),
                start,
                self.settings.clone(),
                self.ctx.clone(),
            );
            self.pipelines.insert(tp, handle);
        }
        self.enter_running();
        Ok(())
    }

    /// Checkpoint + 1, else the broker committed offset, else the policy.
    async fn resolve_start(&self, tp: &TopicPartition) -> Result<u64> {
        let checkpoint = retry_with_backoff(&self.settings.checkpoint_retry, || {
            self.checkpoints.load(tp)
        })
        .await
        .map_err(|e| BridgeError::from_checkpoint(tp, e))?;

        let (low, high) = self.consumer.offset_bounds(tp).await?;
        let resumed = match checkpoint {
            Some(offset) => Some((offset + 1, "checkpoint")),
            None => self
                .consumer
                .committed(tp)
                .await?
                .map(|offset| (offset, "consumer group")),
        };

        let start = match resumed {
            Some((offset, from)) if offset < low => {
                warn!(%tp, offset, low, from, "Resume position is below the log start, records were lost to retention");
                low
            }
            Some((offset, from)) => {
                debug!(%tp, offset, from, "Resuming partition");
                offset
            }
            None => match self.config.starting_offset {
                StartingOffsetPolicy::Earliest => low,
                StartingOffsetPolicy::Latest => high,
                StartingOffsetPolicy::Committed => {
                    return Err(BridgeError::NoStartingOffset(tp.clone()));
                }
            },
        };
        info!(%tp, start, "Resolved starting offset");
        Ok(start)
    }

    async fn on_revoked(&mut self, partitions: Vec<TopicPartition>) {
        info!(count = partitions.len(), "Partitions revoked");
        self.observer.on_event(&BridgeEvent::PartitionsRevoked {
            partitions: partitions.clone(),
        });

        let handles: Vec<PipelineHandle> = partitions
            .iter()
            .filter_map(|tp| self.pipelines.remove(tp))
            .collect();
        self.stop_pipelines(handles).await;
    }

    async fn deliver(&mut self, tp: TopicPartition, records: Vec<SourceRecord>) {
        let Some(handle) = self.pipelines.get(&tp) else {
            debug!(%tp, count = records.len(), "Dropping records for unassigned partition");
            return;
        };
        tokio::select! {
            delivered = handle.deliver(records) => {
                if !delivered {
                    warn!(%tp, "Pipeline no longer accepts records");
                }
            }
            _ = self.shutdown.wait() => {}
        }
    }

    /// Drain all pipelines in parallel and collect their reports.
    async fn stop_pipelines(&mut self, handles: Vec<PipelineHandle>) {
        for handle in &handles {
            handle.drain();
        }
        let timeout = self.settings.drain_timeout * 2 + STOP_GRACE;
        let results = futures::future::join_all(handles.into_iter().map(|h| h.stop(timeout))).await;
        for result in results {
            match result {
                Ok(report) => self.reports.push(report),
                Err(e) => {
                    error!(error = %e, "Pipeline did not stop cleanly");
                    self.record_fatal(e);
                }
            }
        }
    }

    async fn stop(&mut self) {
        self.set_state(CoordinatorState::Stopping);

        let handles: Vec<PipelineHandle> = self.pipelines.drain().map(|(_, h)| h).collect();
        self.stop_pipelines(handles).await;

        // Every pipeline is stopped, so held revocations can go.
        while let Ok(revocation) =
            tokio::time::timeout(Duration::ZERO, self.consumer.next_revocation()).await
        {
            revocation.complete();
        }

        // Fatals raised while draining still count.
        while let Ok(err) = self.fatal_rx.try_recv() {
            self.record_fatal(err);
        }

        self.publisher.shutdown(self.config.drain_timeout).await;
        if let Err(e) = self.consumer.close().await {
            warn!(error = %e, "Failed to close consumer");
        }
        self.set_state(CoordinatorState::Stopped);
    }

    fn record_fatal(&mut self, err: BridgeError) {
        if self.fatal.is_some() {
            warn!(error = %err, kind = err.kind(), "Additional fatal error after the first");
            return;
        }
        error!(error = %err, kind = err.kind(), "Fatal error");
        self.observer
            .on_event(&BridgeEvent::Fatal { error: err.clone() });
        self.fatal = Some(err);
    }

    fn set_state(&mut self, state: CoordinatorState) {
        self.state = state;
        debug!(%state, "Coordinator state changed");
        self.observer.on_event(&BridgeEvent::StateChanged { state });
    }
}
