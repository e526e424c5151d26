//! Batching Pub/Sub publisher.
//!
//! [`Publisher`] is a cheap, cloneable handle. Every call is turned into a
//! command on one FIFO channel that a single worker task consumes:
//!
//! ```text
//! publish_in()──┐                      ┌─ stream "orders/0"  (one batch in flight)
//! publish()   ──┼─▶ mpsc ─▶ worker ────┼─ key "k1"           (one batch in flight)
//! flush()     ──┤                      ├─ unordered          (concurrent batches)
//! shutdown()  ──┘                      └─ ...
//!                                           │
//!                                           ▼
//!                              tokio::spawn(send_batch) ─▶ PublishTransport
//! ```
//!
//! ## Lanes
//!
//! Messages published into a stream ([`Publisher::publish_in`]) share one lane
//! per stream whatever their ordering keys, so a stream reaches Pub/Sub in
//! submission order even when a batch is retried. Without a stream, keyed
//! messages get one lane per ordering key and unkeyed ones a single lane
//! whose batches go out concurrently.
//!
//! ## Backpressure
//!
//! `publish` first acquires a permit from a semaphore sized to
//! `publisher_buffer_capacity`. The permit travels with the message and is
//! released only once its ack resolves, so at most that many messages are
//! buffered or in flight at any time.
//!
//! ## Failures
//!
//! Retryable statuses are retried with exponential backoff inside the send
//! task. When a multi-message batch is rejected permanently, its messages are
//! re-sent one by one so only the offending message fails. A failed keyed
//! message pauses its ordering key in every lane: everything queued or
//! published later for that key fails with
//! [`PublishFailure::OrderingKeyPaused`] until [`Publisher::resume_publish`]
//! is called.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use super::batch::BatchBuffer;
use super::{PublishTransport, SinkStatus, TransportError};
use crate::config::BatchSettings;
use crate::observer::{BridgeEvent, Observer};
use crate::record::PublishRequest;
use crate::retry::{retry_with_backoff, RetryPolicy};

/// Grace period used when every handle is dropped without an explicit shutdown.
const CLOSE_GRACE: Duration = Duration::from_secs(30);

/// Why a message was not acknowledged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishFailure {
    /// Permanently rejected (invalid argument, not found, ...).
    #[error("rejected by Pub/Sub ({status}): {reason}")]
    Rejected { status: SinkStatus, reason: String },

    /// Retryable failures persisted past the retry cap.
    #[error("Pub/Sub unavailable after retries: {0}")]
    Unavailable(String),

    /// The sink refused our credentials.
    #[error("Pub/Sub authorization failed: {0}")]
    Auth(String),

    /// An earlier message with this ordering key failed; nothing was attempted.
    #[error("ordering key '{0}' is paused after an earlier failure")]
    OrderingKeyPaused(String),

    /// The publisher shut down before the message was acknowledged.
    #[error("publisher shut down before the message was acknowledged")]
    Shutdown,
}

impl PublishFailure {
    fn from_transport(err: TransportError) -> Self {
        if err.status.is_auth() {
            PublishFailure::Auth(err.to_string())
        } else if err.status.is_retryable() {
            PublishFailure::Unavailable(err.to_string())
        } else {
            PublishFailure::Rejected {
                status: err.status,
                reason: err.message,
            }
        }
    }

    /// Short label used for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            PublishFailure::Rejected { .. } => "rejected",
            PublishFailure::Unavailable(_) => "unavailable",
            PublishFailure::Auth(_) => "auth",
            PublishFailure::OrderingKeyPaused(_) => "ordering_paused",
            PublishFailure::Shutdown => "shutdown",
        }
    }
}

/// Outcome of one published message.
pub type AckResult = Result<String, PublishFailure>;

/// Resolves to the server-assigned message id, or the reason the message failed.
#[derive(Debug)]
pub struct AckFuture {
    rx: oneshot::Receiver<AckResult>,
}

impl AckFuture {
    fn failed(failure: PublishFailure) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Err(failure));
        Self { rx }
    }
}

impl Future for AckFuture {
    type Output = AckResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(PublishFailure::Shutdown)))
    }
}

struct PendingMessage {
    request: PublishRequest,
    stream: Option<String>,
    ack: oneshot::Sender<AckResult>,
    seq: u64,
    _permit: OwnedSemaphorePermit,
}

impl PendingMessage {
    fn resolve(self, result: AckResult) {
        let _ = self.ack.send(result);
    }
}

enum Command {
    Publish(PendingMessage),
    Flush(oneshot::Sender<()>),
    ResumeKey(String),
    Shutdown(Instant),
}

struct Inner {
    tx: mpsc::UnboundedSender<Command>,
    permits: Arc<Semaphore>,
    closed: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to the publisher worker.
#[derive(Clone)]
pub struct Publisher {
    inner: Arc<Inner>,
}

impl Publisher {
    /// Spawn the worker. Must be called from within a tokio runtime.
    pub fn new(
        transport: Arc<dyn PublishTransport>,
        topic: impl Into<String>,
        settings: BatchSettings,
        retry: RetryPolicy,
        buffer_capacity: usize,
        observer: Arc<dyn Observer>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = Worker {
            transport,
            topic: Arc::from(topic.into()),
            settings,
            retry,
            observer,
            lanes: HashMap::new(),
            paused_keys: HashSet::new(),
            sends: FuturesUnordered::new(),
            aborts: HashMap::new(),
            next_send_id: 0,
            unresolved: BTreeSet::new(),
            flush_waiters: Vec::new(),
            next_seq: 0,
            shutdown_at: None,
        };
        let handle = tokio::spawn(worker.run(rx));

        Self {
            inner: Arc::new(Inner {
                tx,
                permits: Arc::new(Semaphore::new(buffer_capacity.max(1))),
                closed: AtomicBool::new(false),
                worker: Mutex::new(Some(handle)),
            }),
        }
    }

    /// Queue a message for publishing.
    ///
    /// Waits while the buffer is at its high-water mark. The returned future
    /// resolves once the message is acknowledged or has definitively failed.
    /// Unkeyed messages published this way carry no ordering guarantee.
    pub async fn publish(&self, request: PublishRequest) -> AckFuture {
        self.submit(None, request).await
    }

    /// Queue a message as part of `stream`.
    ///
    /// Messages of one stream are sent in submission order, one batch at a
    /// time, regardless of their ordering keys.
    pub async fn publish_in(&self, stream: &str, request: PublishRequest) -> AckFuture {
        self.submit(Some(stream.to_string()), request).await
    }

    async fn submit(&self, stream: Option<String>, request: PublishRequest) -> AckFuture {
        if self.is_closed() {
            return AckFuture::failed(PublishFailure::Shutdown);
        }
        let permit = match self.inner.permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return AckFuture::failed(PublishFailure::Shutdown),
        };

        let (ack, rx) = oneshot::channel();
        let message = PendingMessage {
            request,
            stream,
            ack,
            seq: 0,
            _permit: permit,
        };
        // A send error drops the sender, which resolves the future as Shutdown.
        let _ = self.inner.tx.send(Command::Publish(message));
        AckFuture { rx }
    }

    /// Send everything buffered now and wait until every ack returned so far resolved.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.inner.tx.send(Command::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Clear the error state of an ordering key.
    pub fn resume_publish(&self, ordering_key: &str) {
        let _ = self
            .inner
            .tx
            .send(Command::ResumeKey(ordering_key.to_string()));
    }

    /// Stop accepting messages, send what is buffered and wait for acks.
    ///
    /// Messages still unresolved after `deadline` fail with
    /// [`PublishFailure::Shutdown`].
    pub async fn shutdown(&self, deadline: Duration) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.permits.close();
        let _ = self
            .inner
            .tx
            .send(Command::Shutdown(Instant::now() + deadline));

        let handle = self
            .inner
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Publisher worker ended abnormally");
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Free buffer slots below the high-water mark.
    pub fn available_capacity(&self) -> usize {
        self.inner.permits.available_permits()
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// Where a message queues up before it is batched.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum LaneId {
    Unordered,
    Key(String),
    Stream(String),
}

impl LaneId {
    fn of(stream: Option<&str>, ordering_key: Option<&str>) -> Self {
        match (stream, ordering_key) {
            (Some(stream), _) => LaneId::Stream(stream.to_string()),
            (None, Some(key)) => LaneId::Key(key.to_string()),
            (None, None) => LaneId::Unordered,
        }
    }

    /// Sequential lanes keep at most one batch in flight.
    fn is_sequential(&self) -> bool {
        !matches!(self, LaneId::Unordered)
    }
}

struct Lane {
    buffer: BatchBuffer<PendingMessage>,
    ready: VecDeque<Vec<PendingMessage>>,
    busy: bool,
}

impl Lane {
    fn new(settings: &BatchSettings) -> Self {
        Self {
            buffer: BatchBuffer::from_settings(settings),
            ready: VecDeque::new(),
            busy: false,
        }
    }

    /// Move the open batch, if any, to the ready queue.
    fn cut(&mut self) {
        if !self.buffer.is_empty() {
            self.ready.push_back(self.buffer.drain());
        }
    }

    fn is_idle(&self) -> bool {
        self.buffer.is_empty() && self.ready.is_empty() && !self.busy
    }

    fn take_all(&mut self) -> Vec<PendingMessage> {
        let mut all: Vec<PendingMessage> = self.ready.drain(..).flatten().collect();
        all.extend(self.buffer.drain());
        all
    }

    /// Remove queued messages matching `pred`; the rest keep their order.
    fn take_where<F>(&mut self, pred: F) -> Vec<PendingMessage>
    where
        F: Fn(&PendingMessage) -> bool,
    {
        let mut taken = Vec::new();
        for batch in self.ready.iter_mut() {
            let (matched, kept): (Vec<_>, Vec<_>) =
                std::mem::take(batch).into_iter().partition(|m| pred(m));
            taken.extend(matched);
            *batch = kept;
        }
        self.ready.retain(|batch| !batch.is_empty());

        let (matched, kept): (Vec<_>, Vec<_>) =
            self.buffer.drain().into_iter().partition(|m| pred(m));
        taken.extend(matched);
        for message in kept {
            let size = message.request.size_bytes();
            self.buffer.append(message, size);
        }
        taken
    }
}

struct BatchOutcome {
    send_id: u64,
    lane: LaneId,
    seqs: Vec<u64>,
    /// Ordering keys of messages that were not acknowledged.
    failed_keys: BTreeSet<String>,
}

struct Worker {
    transport: Arc<dyn PublishTransport>,
    topic: Arc<str>,
    settings: BatchSettings,
    retry: RetryPolicy,
    observer: Arc<dyn Observer>,
    lanes: HashMap<LaneId, Lane>,
    /// Ordering keys failing fast until resumed.
    paused_keys: HashSet<String>,
    sends: FuturesUnordered<BoxFuture<'static, BatchOutcome>>,
    aborts: HashMap<u64, AbortHandle>,
    next_send_id: u64,
    /// Sequence numbers of messages whose ack has not resolved.
    unresolved: BTreeSet<u64>,
    /// Flush callers waiting for every seq below the barrier.
    flush_waiters: Vec<(u64, oneshot::Sender<()>)>,
    next_seq: u64,
    shutdown_at: Option<Instant>,
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        let mut accepting = true;
        loop {
            let linger = self.next_linger_deadline();
            let far = Instant::now() + Duration::from_secs(86_400);

            tokio::select! {
                cmd = rx.recv(), if accepting => match cmd {
                    Some(cmd) => self.handle(cmd),
                    None => {
                        accepting = false;
                        self.begin_shutdown(Instant::now() + CLOSE_GRACE);
                    }
                },
                Some(outcome) = self.sends.next(), if !self.sends.is_empty() => {
                    self.on_outcome(outcome);
                }
                _ = sleep_until(linger.unwrap_or(far)), if linger.is_some() => {
                    self.flush_expired();
                }
                _ = sleep_until(self.shutdown_at.unwrap_or(far)), if self.shutdown_at.is_some() => {
                    warn!(
                        unresolved = self.unresolved.len(),
                        "Publisher shutdown deadline reached, failing pending messages"
                    );
                    break;
                }
            }

            self.release_flush_waiters();
            if self.shutdown_at.is_some() && self.is_idle() {
                break;
            }
        }

        for (_, abort) in self.aborts.drain() {
            abort.abort();
        }
        for lane in self.lanes.values_mut() {
            for message in lane.take_all() {
                message.resolve(Err(PublishFailure::Shutdown));
            }
        }
        info!(topic = %self.topic, "Publisher stopped");
    }

    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Publish(message) => self.enqueue(message),
            Command::Flush(tx) => {
                self.cut_all();
                self.flush_waiters.push((self.next_seq, tx));
            }
            Command::ResumeKey(key) => {
                if self.paused_keys.remove(&key) {
                    debug!(ordering_key = %key, "Ordering key resumed");
                }
            }
            Command::Shutdown(at) => self.begin_shutdown(at),
        }
    }

    fn begin_shutdown(&mut self, at: Instant) {
        self.shutdown_at = Some(self.shutdown_at.map_or(at, |current| current.min(at)));
        self.cut_all();
    }

    /// Close every open batch and dispatch what the lanes allow.
    fn cut_all(&mut self) {
        let ids: Vec<LaneId> = self.lanes.keys().cloned().collect();
        for id in ids {
            if let Some(lane) = self.lanes.get_mut(&id) {
                lane.cut();
            }
            self.dispatch(&id);
        }
    }

    fn enqueue(&mut self, mut message: PendingMessage) {
        if self.shutdown_at.is_some() {
            message.resolve(Err(PublishFailure::Shutdown));
            return;
        }

        let paused = message
            .request
            .ordering_key
            .clone()
            .filter(|key| self.paused_keys.contains(key));
        if let Some(key) = paused {
            message.resolve(Err(PublishFailure::OrderingKeyPaused(key)));
            return;
        }

        let id = LaneId::of(
            message.stream.as_deref(),
            message.request.ordering_key.as_deref(),
        );
        let lane = self
            .lanes
            .entry(id.clone())
            .or_insert_with(|| Lane::new(&self.settings));

        message.seq = self.next_seq;
        self.next_seq += 1;
        self.unresolved.insert(message.seq);

        let size = message.request.size_bytes();
        if lane.buffer.would_overflow(size) {
            lane.cut();
        }
        lane.buffer.append(message, size);
        if lane.buffer.is_full() {
            lane.cut();
        }
        self.dispatch(&id);
    }

    /// Start sends for ready batches the lane is allowed to have in flight.
    fn dispatch(&mut self, id: &LaneId) {
        let Some(lane) = self.lanes.get_mut(id) else {
            return;
        };
        let mut batches = Vec::new();
        if !id.is_sequential() {
            batches.extend(lane.ready.drain(..));
        } else if !lane.busy {
            if let Some(batch) = lane.ready.pop_front() {
                lane.busy = true;
                batches.push(batch);
            }
        }
        for batch in batches {
            self.spawn_send(id.clone(), batch);
        }
    }

    fn spawn_send(&mut self, lane: LaneId, batch: Vec<PendingMessage>) {
        let seqs: Vec<u64> = batch.iter().map(|m| m.seq).collect();
        let keys: BTreeSet<String> = batch
            .iter()
            .filter_map(|m| m.request.ordering_key.clone())
            .collect();
        let handle = tokio::spawn(send_batch(
            self.transport.clone(),
            self.topic.clone(),
            self.retry.clone(),
            self.observer.clone(),
            batch,
        ));
        let send_id = self.next_send_id;
        self.next_send_id += 1;
        self.aborts.insert(send_id, handle.abort_handle());
        self.sends.push(
            async move {
                let failed_keys = match handle.await {
                    Ok(failed_keys) => failed_keys,
                    Err(e) => {
                        warn!(error = %e, "Publish task failed");
                        keys
                    }
                };
                BatchOutcome {
                    send_id,
                    lane,
                    seqs,
                    failed_keys,
                }
            }
            .boxed(),
        );
    }

    fn on_outcome(&mut self, outcome: BatchOutcome) {
        self.aborts.remove(&outcome.send_id);
        for seq in &outcome.seqs {
            self.unresolved.remove(seq);
        }
        if let Some(lane) = self.lanes.get_mut(&outcome.lane) {
            lane.busy = false;
        }
        if !outcome.failed_keys.is_empty() {
            self.pause_keys(outcome.failed_keys);
        }

        self.dispatch(&outcome.lane);
        if self.lanes.get(&outcome.lane).map_or(false, Lane::is_idle) {
            self.lanes.remove(&outcome.lane);
        }
    }

    /// Pause `keys` and fail every queued message that carries one of them.
    fn pause_keys(&mut self, keys: BTreeSet<String>) {
        let mut queued = Vec::new();
        for lane in self.lanes.values_mut() {
            queued.extend(lane.take_where(|m| {
                m.request
                    .ordering_key
                    .as_ref()
                    .map_or(false, |key| keys.contains(key))
            }));
        }
        if !queued.is_empty() {
            warn!(
                ordering_keys = ?keys,
                messages = queued.len(),
                "Ordering keys paused, failing queued messages"
            );
        }
        for message in queued {
            self.unresolved.remove(&message.seq);
            let key = message.request.ordering_key.clone().unwrap_or_default();
            message.resolve(Err(PublishFailure::OrderingKeyPaused(key)));
        }
        self.paused_keys.extend(keys);
    }

    fn next_linger_deadline(&self) -> Option<Instant> {
        self.lanes
            .values()
            .filter_map(|lane| lane.buffer.deadline())
            .min()
            .map(Instant::from_std)
    }

    fn flush_expired(&mut self) {
        let expired: Vec<LaneId> = self
            .lanes
            .iter()
            .filter(|(_, lane)| lane.buffer.should_flush())
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            if let Some(lane) = self.lanes.get_mut(&id) {
                lane.cut();
            }
            self.dispatch(&id);
        }
    }

    fn release_flush_waiters(&mut self) {
        if self.flush_waiters.is_empty() {
            return;
        }
        for (barrier, tx) in std::mem::take(&mut self.flush_waiters) {
            if self.unresolved.range(..barrier).next().is_none() {
                let _ = tx.send(());
            } else {
                self.flush_waiters.push((barrier, tx));
            }
        }
    }

    fn is_idle(&self) -> bool {
        self.sends.is_empty() && self.lanes.values().all(|lane| lane.is_idle())
    }
}

/// Send one batch, resolving every ack in it.
///
/// Returns the ordering keys of messages that were not acknowledged. Once a
/// keyed message fails, later messages with the same key in this batch are
/// not attempted.
async fn send_batch(
    transport: Arc<dyn PublishTransport>,
    topic: Arc<str>,
    retry: RetryPolicy,
    observer: Arc<dyn Observer>,
    batch: Vec<PendingMessage>,
) -> BTreeSet<String> {
    let mut failed_keys = BTreeSet::new();
    let requests: Vec<PublishRequest> = batch.iter().map(|m| m.request.clone()).collect();
    match publish_with_retry(&*transport, &topic, &retry, &*observer, &requests).await {
        Ok(ids) => {
            for (message, id) in batch.into_iter().zip(ids) {
                message.resolve(Ok(id));
            }
        }
        Err(PublishFailure::Rejected { .. }) if batch.len() > 1 => {
            debug!(
                messages = batch.len(),
                "Batch rejected, re-sending messages individually"
            );
            for message in batch {
                let paused = message
                    .request
                    .ordering_key
                    .clone()
                    .filter(|key| failed_keys.contains(key));
                if let Some(key) = paused {
                    message.resolve(Err(PublishFailure::OrderingKeyPaused(key)));
                    continue;
                }
                let single = [message.request.clone()];
                match publish_with_retry(&*transport, &topic, &retry, &*observer, &single).await {
                    Ok(mut ids) => message.resolve(Ok(ids.remove(0))),
                    Err(failure) => {
                        if let Some(key) = &message.request.ordering_key {
                            failed_keys.insert(key.clone());
                        }
                        message.resolve(Err(failure));
                    }
                }
            }
        }
        Err(failure) => {
            for message in batch {
                if let Some(key) = &message.request.ordering_key {
                    failed_keys.insert(key.clone());
                }
                message.resolve(Err(failure.clone()));
            }
        }
    }
    failed_keys
}

async fn publish_with_retry(
    transport: &dyn PublishTransport,
    topic: &str,
    retry: &RetryPolicy,
    observer: &dyn Observer,
    requests: &[PublishRequest],
) -> Result<Vec<String>, PublishFailure> {
    let started = std::time::Instant::now();
    let bytes: usize = requests.iter().map(|r| r.size_bytes()).sum();

    let result = retry_with_backoff(retry, || transport.publish(topic, requests))
        .await
        .map_err(PublishFailure::from_transport)
        .and_then(|ids| {
            if ids.len() == requests.len() {
                Ok(ids)
            } else {
                Err(PublishFailure::Unavailable(format!(
                    "expected {} message ids, got {}",
                    requests.len(),
                    ids.len()
                )))
            }
        });

    match &result {
        Ok(_) => observer.on_event(&BridgeEvent::BatchPublished {
            messages: requests.len(),
            bytes,
            latency: started.elapsed(),
        }),
        Err(failure) => observer.on_event(&BridgeEvent::BatchFailed {
            messages: requests.len(),
            reason: failure.label(),
            error: failure.to_string(),
        }),
    }
    result
}
