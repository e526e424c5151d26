//! Kafka source consumer backed by `rdkafka`.
//!
//! Uses a `BaseConsumer` so that rebalance callbacks fire inside `poll`.
//! Assignments are queued as [`ConsumerEvent`]s and returned with the records
//! that preceded them. A revocation parks the callback in a
//! [`RevocationGate`] until the coordinator has drained the partitions, so the
//! group does not reassign them before their checkpoints are written. Once the
//! consumer is closing, revocations are queued in-band instead.
//!
//! ## Client properties
//!
//! | Property             | Value                                           |
//! |----------------------|-------------------------------------------------|
//! | `bootstrap.servers`  | `bootstrap_servers`                             |
//! | `group.id`           | `consumer_group`                                |
//! | `enable.auto.commit` | `false` (progress is committed by pipelines)    |
//! | `auto.offset.reset`  | from `starting_offset_policy` (`error` for `committed`) |
//! | `kafka.*`            | passed through, overriding the above            |

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{BorrowedMessage, Headers, Message};
use rdkafka::{ClientContext, Offset, TopicPartitionList};
use tracing::{debug, info, warn};

use super::{ConsumerEvent, PartitionBatch, PendingRevocation, RevocationGate, SourceConsumer};
use crate::config::{BridgeConfig, StartingOffsetPolicy};
use crate::error::{BridgeError, Result};
use crate::record::{SourceRecord, TopicPartition};

const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

/// Time a revocation may be held beyond twice the drain timeout.
const REVOCATION_GRACE: Duration = Duration::from_secs(5);

/// Context that queues assignments and holds revocations.
struct RebalanceContext {
    events: Arc<Mutex<VecDeque<ConsumerEvent>>>,
    gate: Arc<RevocationGate>,
}

impl RebalanceContext {
    fn push(&self, event: ConsumerEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(event);
    }

    /// Drop queued assignments of partitions that are already being revoked.
    fn forget_assigned(&self, revoked: &[TopicPartition]) {
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        for event in events.iter_mut() {
            if let ConsumerEvent::Assigned(tps) = event {
                tps.retain(|tp| !revoked.contains(tp));
            }
        }
        events.retain(|event| !matches!(event, ConsumerEvent::Assigned(tps) if tps.is_empty()));
    }
}

impl ClientContext for RebalanceContext {}

impl ConsumerContext for RebalanceContext {
    fn pre_rebalance(&self, _consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Revoke(tpl) => {
                let tps = partitions_of(tpl);
                info!(partitions = ?tps, "Partitions revoked");
                self.forget_assigned(&tps);
                if !self.gate.hold(tps.clone()) {
                    self.push(ConsumerEvent::Revoked(tps));
                }
            }
            Rebalance::Error(e) => warn!(error = %e, "Rebalance error"),
            Rebalance::Assign(_) => {}
        }
    }

    fn post_rebalance(&self, _consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        if let Rebalance::Assign(tpl) = rebalance {
            let tps = partitions_of(tpl);
            info!(partitions = ?tps, "Partitions assigned");
            self.push(ConsumerEvent::Assigned(tps));
        }
    }
}

fn partitions_of(tpl: &TopicPartitionList) -> Vec<TopicPartition> {
    tpl.elements()
        .iter()
        .map(|e| TopicPartition::new(e.topic(), e.partition().max(0) as u32))
        .collect()
}

fn single(tp: &TopicPartition, offset: Option<u64>) -> Result<TopicPartitionList> {
    let mut tpl = TopicPartitionList::new();
    match offset {
        Some(o) => tpl
            .add_partition_offset(&tp.topic, tp.partition as i32, Offset::Offset(o as i64))
            .map_err(map_kafka_error)?,
        None => {
            tpl.add_partition(&tp.topic, tp.partition as i32);
        }
    }
    Ok(tpl)
}

/// Classify an rdkafka error into the bridge taxonomy.
fn map_kafka_error(err: KafkaError) -> BridgeError {
    match err.rdkafka_error_code() {
        Some(
            RDKafkaErrorCode::SaslAuthenticationFailed
            | RDKafkaErrorCode::Authentication
            | RDKafkaErrorCode::TopicAuthorizationFailed
            | RDKafkaErrorCode::GroupAuthorizationFailed
            | RDKafkaErrorCode::ClusterAuthorizationFailed,
        ) => BridgeError::AuthFailure {
            system: "kafka",
            message: err.to_string(),
        },
        Some(
            RDKafkaErrorCode::BrokerTransportFailure
            | RDKafkaErrorCode::AllBrokersDown
            | RDKafkaErrorCode::OperationTimedOut
            | RDKafkaErrorCode::RequestTimedOut
            | RDKafkaErrorCode::NetworkException
            | RDKafkaErrorCode::LeaderNotAvailable
            | RDKafkaErrorCode::NotLeaderForPartition
            | RDKafkaErrorCode::CoordinatorNotAvailable
            | RDKafkaErrorCode::NotCoordinator
            | RDKafkaErrorCode::CoordinatorLoadInProgress,
        ) => BridgeError::TransientTransport(err.to_string()),
        _ => BridgeError::Source(err.to_string()),
    }
}

fn to_source_record(msg: &BorrowedMessage<'_>) -> SourceRecord {
    let mut record = SourceRecord {
        topic: msg.topic().to_string(),
        partition: msg.partition().max(0) as u32,
        offset: msg.offset().max(0) as u64,
        key: msg.key().map(Bytes::copy_from_slice),
        value: msg.payload().map(Bytes::copy_from_slice),
        headers: Default::default(),
        timestamp: msg.timestamp().to_millis().unwrap_or(0),
    };
    if let Some(headers) = msg.headers() {
        for header in headers.iter() {
            if let Some(value) = header.value {
                record
                    .headers
                    .insert(header.key.to_string(), Bytes::copy_from_slice(value));
            }
        }
    }
    record
}

/// [`SourceConsumer`] over a librdkafka consumer-group member.
pub struct KafkaSourceConsumer {
    consumer: Arc<BaseConsumer<RebalanceContext>>,
    events: Arc<Mutex<VecDeque<ConsumerEvent>>>,
    gate: Arc<RevocationGate>,
    max_poll_records: usize,
}

impl KafkaSourceConsumer {
    /// Build the client from a validated bridge configuration.
    pub fn new(config: &BridgeConfig) -> Result<Self> {
        let mut client = ClientConfig::new();
        client
            .set("bootstrap.servers", config.bootstrap_servers.join(","))
            .set("group.id", &config.consumer_group)
            .set("enable.auto.commit", "false")
            .set("enable.partition.eof", "false")
            .set(
                "auto.offset.reset",
                match config.starting_offset {
                    StartingOffsetPolicy::Earliest => "earliest",
                    StartingOffsetPolicy::Latest => "latest",
                    StartingOffsetPolicy::Committed => "error",
                },
            );
        for (key, value) in &config.kafka_properties {
            client.set(key, value);
        }

        let events = Arc::new(Mutex::new(VecDeque::new()));
        let gate = Arc::new(RevocationGate::new(
            config.drain_timeout * 2 + REVOCATION_GRACE,
        ));
        let context = RebalanceContext {
            events: events.clone(),
            gate: gate.clone(),
        };
        let consumer: BaseConsumer<RebalanceContext> = client
            .create_with_context(context)
            .map_err(|e| BridgeError::ConfigInvalid(format!("kafka client: {}", e)))?;

        debug!(
            bootstrap = %config.bootstrap_servers.join(","),
            group = %config.consumer_group,
            "Kafka consumer created"
        );

        Ok(Self {
            consumer: Arc::new(consumer),
            events,
            gate,
            max_poll_records: config.max_poll_records,
        })
    }

    fn take_events(events: &Mutex<VecDeque<ConsumerEvent>>) -> Vec<ConsumerEvent> {
        events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect()
    }

    /// Run a blocking librdkafka call off the async runtime.
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&BaseConsumer<RebalanceContext>) -> Result<T> + Send + 'static,
    {
        let consumer = self.consumer.clone();
        tokio::task::spawn_blocking(move || f(&consumer))
            .await
            .map_err(|e| BridgeError::Runtime(format!("kafka task failed: {}", e)))?
    }
}

/// Append a record to the per-partition batch list, keeping arrival order.
fn push_record(events: &mut Vec<ConsumerEvent>, record: SourceRecord) {
    if let Some(ConsumerEvent::Records(batch)) = events.last_mut() {
        if batch.tp.topic == record.topic && batch.tp.partition == record.partition {
            batch.records.push(record);
            return;
        }
    }
    let tp = record.topic_partition();
    events.push(ConsumerEvent::Records(PartitionBatch::new(tp, vec![record])));
}

#[async_trait]
impl SourceConsumer for KafkaSourceConsumer {
    async fn subscribe(&self, topic: &str) -> Result<()> {
        self.consumer
            .subscribe(&[topic])
            .map_err(map_kafka_error)?;
        info!(topic, "Subscribed to Kafka topic");
        Ok(())
    }

    async fn poll(&self, max_wait: Duration) -> Result<Vec<ConsumerEvent>> {
        let events = self.events.clone();
        let max_records = self.max_poll_records;
        self.blocking(move |consumer| {
            let mut out = Vec::new();
            let mut count = 0;
            let mut wait = max_wait;
            while count < max_records {
                let polled = consumer.poll(wait);
                wait = Duration::ZERO;

                let rebalances = Self::take_events(&events);
                let rebalanced = !rebalances.is_empty();

                match polled {
                    Some(Ok(msg)) => {
                        push_record(&mut out, to_source_record(&msg));
                        count += 1;
                    }
                    Some(Err(e)) => {
                        out.extend(rebalances);
                        let err = map_kafka_error(e);
                        if out.is_empty() {
                            return Err(err);
                        }
                        warn!(error = %err, "Kafka poll error after partial batch");
                        return Ok(out);
                    }
                    None => {
                        out.extend(rebalances);
                        break;
                    }
                }

                if rebalanced {
                    out.extend(rebalances);
                    break;
                }
            }
            Ok(out)
        })
        .await
    }

    fn pause(&self, tp: &TopicPartition) -> Result<()> {
        self.consumer
            .pause(&single(tp, None)?)
            .map_err(map_kafka_error)
    }

    fn resume(&self, tp: &TopicPartition) -> Result<()> {
        self.consumer
            .resume(&single(tp, None)?)
            .map_err(map_kafka_error)
    }

    async fn commit(&self, tp: &TopicPartition, offset: u64) -> Result<()> {
        let tpl = single(tp, Some(offset))?;
        self.consumer
            .commit(&tpl, CommitMode::Async)
            .map_err(map_kafka_error)
    }

    async fn seek(&self, tp: &TopicPartition, offset: u64) -> Result<()> {
        let tp = tp.clone();
        self.blocking(move |consumer| {
            consumer
                .seek(
                    &tp.topic,
                    tp.partition as i32,
                    Offset::Offset(offset as i64),
                    METADATA_TIMEOUT,
                )
                .map_err(map_kafka_error)
        })
        .await
    }

    async fn committed(&self, tp: &TopicPartition) -> Result<Option<u64>> {
        let tpl = single(tp, None)?;
        self.blocking(move |consumer| {
            let committed = consumer
                .committed_offsets(tpl, METADATA_TIMEOUT)
                .map_err(map_kafka_error)?;
            Ok(committed.elements().first().and_then(|e| match e.offset() {
                Offset::Offset(o) if o >= 0 => Some(o as u64),
                _ => None,
            }))
        })
        .await
    }

    async fn offset_bounds(&self, tp: &TopicPartition) -> Result<(u64, u64)> {
        let tp = tp.clone();
        self.blocking(move |consumer| {
            let (low, high) = consumer
                .fetch_watermarks(&tp.topic, tp.partition as i32, METADATA_TIMEOUT)
                .map_err(map_kafka_error)?;
            Ok((low.max(0) as u64, high.max(0) as u64))
        })
        .await
    }

    async fn next_revocation(&self) -> PendingRevocation {
        self.gate.next().await
    }

    async fn close(&self) -> Result<()> {
        self.gate.close();
        self.consumer.unsubscribe();
        info!("Kafka consumer closed");
        Ok(())
    }
}
