//! Bridge configuration.
//!
//! The engine only ever sees a validated [`BridgeConfig`]. Loading goes through
//! a flat string key/value map, so the same validation runs for TOML files,
//! `--set key=value` overrides and programmatic construction.
//!
//! | Key                            | Description                                   | Default                         |
//! |--------------------------------|-----------------------------------------------|---------------------------------|
//! | `bootstrap_servers`            | Comma-separated `host:port` list              | required                        |
//! | `source_topic`                 | Kafka topic to consume                        | required                        |
//! | `consumer_group`               | Consumer group id                             | required                        |
//! | `destination_topic`            | `projects/<project>/topics/<topic>`           | required                        |
//! | `checkpoint_location`          | Checkpoint store URI                          | required                        |
//! | `starting_offset_policy`       | `earliest` / `latest` / `committed`           | `earliest`                      |
//! | `await_termination_timeout`    | Duration, `0` = immediate, `infinite`         | `infinite`                      |
//! | `drain_timeout`                | Drain deadline on stop or revocation          | `30s`                           |
//! | `assignment_wait`              | Max wait for the first assignment             | `30s`                           |
//! | `poll_timeout`                 | Max time a poll blocks                        | `1s`                            |
//! | `max_poll_records`             | Records returned per poll                     | `500`                           |
//! | `max_in_flight_per_partition`  | Unacknowledged records per partition          | `1000`                          |
//! | `commit_interval_records`      | Records between checkpoint writes             | `1000`                          |
//! | `commit_interval`              | Time between checkpoint writes                | `5s`                            |
//! | `publish_batch_max_bytes`      | Batch byte bound                              | `1048576`                       |
//! | `publish_batch_max_count`      | Batch message bound                           | `100`                           |
//! | `publish_batch_max_latency`    | Batch latency bound                           | `10ms`                          |
//! | `publisher_buffer_capacity`    | Publisher high-water mark (messages)          | `10000`                         |
//! | `retry_*`                      | Publisher retry (`initial_backoff`, `max_backoff`, `max_attempts`) | `100ms`/`60s`/`10` |
//! | `checkpoint_retry_*`           | Checkpoint retry                              | `100ms`/`10s`/`20`              |
//! | `gap_policy`                   | `halt` / `skip-and-log` / `dead-letter`       | `halt`                          |
//! | `ordering_key`                 | `none` / `record-key` / `partition`           | `none`                          |
//! | `pubsub_endpoint`              | Pub/Sub REST endpoint                         | `https://pubsub.googleapis.com` |
//! | `metrics_addr`                 | Address for the `/metrics` endpoint           | (disabled)                      |
//! | `kafka.*`                      | Passed verbatim to the Kafka client           | (none)                          |

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};
use crate::retry::RetryPolicy;

/// Pub/Sub limit on messages per publish request.
pub const MAX_BATCH_COUNT: usize = 1000;
/// Pub/Sub limit on bytes per publish request.
pub const MAX_BATCH_BYTES: usize = 10 * 1000 * 1000;
/// Default Pub/Sub REST endpoint.
pub const DEFAULT_PUBSUB_ENDPOINT: &str = "https://pubsub.googleapis.com";

const KAFKA_PREFIX: &str = "kafka.";

/// Where to start reading a partition that has no checkpoint and no
/// consumer-group offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartingOffsetPolicy {
    Earliest,
    Latest,
    /// Refuse to guess: a partition without a stored position is a fatal error.
    Committed,
}

impl FromStr for StartingOffsetPolicy {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "earliest" => Ok(Self::Earliest),
            "latest" => Ok(Self::Latest),
            "committed" => Ok(Self::Committed),
            other => Err(BridgeError::ConfigInvalid(format!(
                "invalid starting_offset_policy '{}': must be 'earliest', 'latest' or 'committed'",
                other
            ))),
        }
    }
}

impl fmt::Display for StartingOffsetPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Earliest => write!(f, "earliest"),
            Self::Latest => write!(f, "latest"),
            Self::Committed => write!(f, "committed"),
        }
    }
}

/// How long the bridge runs once it is up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AwaitTermination {
    /// Run until an external stop signal.
    Unbounded,
    /// Stop after this much wall-clock time in Running. Zero stops immediately.
    After(Duration),
}

impl AwaitTermination {
    /// Parse the option value: `infinite` (and synonyms), a humantime duration,
    /// or an integer number of seconds where `0` or negative means immediate.
    pub fn parse(value: &str) -> Result<Self> {
        let v = value.trim();
        match v.to_ascii_lowercase().as_str() {
            "infinite" | "unbounded" | "inf" | "none" | "never" => return Ok(Self::Unbounded),
            _ => {}
        }
        if let Ok(secs) = v.parse::<i64>() {
            return Ok(Self::After(Duration::from_secs(secs.max(0) as u64)));
        }
        humantime::parse_duration(v).map(Self::After).map_err(|e| {
            BridgeError::ConfigInvalid(format!(
                "invalid await_termination_timeout '{}': {}",
                value, e
            ))
        })
    }

    /// The timeout, or `None` when unbounded.
    pub fn duration(&self) -> Option<Duration> {
        match self {
            Self::Unbounded => None,
            Self::After(d) => Some(*d),
        }
    }
}

/// What to do with a record the sink permanently rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GapPolicy {
    /// Stop the bridge. The checkpoint stays below the rejected offset.
    Halt,
    /// Log the rejection and treat the record as dropped.
    SkipAndLog,
    /// Hand the record to the dead-letter hook, then treat it as dropped.
    DeadLetter,
}

impl FromStr for GapPolicy {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "halt" => Ok(Self::Halt),
            "skip-and-log" | "skip" => Ok(Self::SkipAndLog),
            "dead-letter" => Ok(Self::DeadLetter),
            other => Err(BridgeError::ConfigInvalid(format!(
                "invalid gap_policy '{}': must be 'halt', 'skip-and-log' or 'dead-letter'",
                other
            ))),
        }
    }
}

/// Which ordering key the default mapper attaches to published messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OrderingKeyMode {
    /// No ordering key; Pub/Sub may reorder messages.
    None,
    /// The Kafka record key, decoded as UTF-8 (lossy). Keyless records are unordered.
    RecordKey,
    /// `<topic>:<partition>`, which preserves per-partition order at the sink.
    Partition,
}

impl FromStr for OrderingKeyMode {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "none" | "off" | "" => Ok(Self::None),
            "record-key" | "key" => Ok(Self::RecordKey),
            "partition" => Ok(Self::Partition),
            other => Err(BridgeError::ConfigInvalid(format!(
                "invalid ordering_key '{}': must be 'none', 'record-key' or 'partition'",
                other
            ))),
        }
    }
}

/// A fully-qualified Pub/Sub topic name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DestinationTopic {
    pub project: String,
    pub topic: String,
}

impl FromStr for DestinationTopic {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.trim().split('/').collect();
        match parts.as_slice() {
            ["projects", project, "topics", topic] if !project.is_empty() && !topic.is_empty() => {
                Ok(Self {
                    project: project.to_string(),
                    topic: topic.to_string(),
                })
            }
            _ => Err(BridgeError::ConfigInvalid(format!(
                "invalid destination_topic '{}': expected 'projects/<project>/topics/<topic>'",
                s
            ))),
        }
    }
}

impl fmt::Display for DestinationTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "projects/{}/topics/{}", self.project, self.topic)
    }
}

/// Publisher batch bounds. A batch is sent when any bound is reached.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchSettings {
    pub max_bytes: usize,
    pub max_count: usize,
    pub max_latency: Duration,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            max_bytes: 1024 * 1024,
            max_count: 100,
            max_latency: Duration::from_millis(10),
        }
    }
}

/// Validated, immutable bridge configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub bootstrap_servers: Vec<String>,
    pub source_topic: String,
    pub consumer_group: String,
    pub starting_offset: StartingOffsetPolicy,
    pub destination_topic: DestinationTopic,
    pub checkpoint_location: String,
    pub await_termination: AwaitTermination,
    pub drain_timeout: Duration,
    pub assignment_wait: Duration,
    pub poll_timeout: Duration,
    pub max_poll_records: usize,
    pub max_in_flight_per_partition: usize,
    pub commit_interval_records: u64,
    pub commit_interval: Duration,
    pub batch: BatchSettings,
    pub publisher_buffer_capacity: usize,
    pub publish_retry: RetryPolicy,
    pub checkpoint_retry: RetryPolicy,
    pub gap_policy: GapPolicy,
    pub ordering_key: OrderingKeyMode,
    pub pubsub_endpoint: String,
    pub metrics_addr: Option<SocketAddr>,
    /// Extra client properties for Kafka, without the `kafka.` prefix.
    pub kafka_properties: BTreeMap<String, String>,
}

impl BridgeConfig {
    /// Parse and validate a `BridgeConfig` from a string key-value map.
    ///
    /// Required keys: `bootstrap_servers`, `source_topic`, `consumer_group`,
    /// `destination_topic`, `checkpoint_location`.
    pub fn from_config_map(config: &HashMap<String, String>) -> Result<Self> {
        let bootstrap_raw = required(config, "bootstrap_servers")?;
        let bootstrap_servers: Vec<String> = bootstrap_raw
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if bootstrap_servers.is_empty() {
            return Err(BridgeError::ConfigInvalid(
                "'bootstrap_servers' must contain at least one host:port".to_string(),
            ));
        }
        for server in &bootstrap_servers {
            validate_host_port(server)?;
        }

        let source_topic = required(config, "source_topic")?;
        let consumer_group = required(config, "consumer_group")?;
        let destination_topic: DestinationTopic = required(config, "destination_topic")?.parse()?;
        let checkpoint_location = required(config, "checkpoint_location")?;

        let starting_offset = optional(config, "starting_offset_policy")
            .map(|s| s.parse())
            .transpose()?
            .unwrap_or(StartingOffsetPolicy::Earliest);

        let await_termination = optional(config, "await_termination_timeout")
            .map(AwaitTermination::parse)
            .transpose()?
            .unwrap_or(AwaitTermination::Unbounded);

        let drain_timeout = duration_or(config, "drain_timeout", Duration::from_secs(30))?;
        let assignment_wait = duration_or(config, "assignment_wait", Duration::from_secs(30))?;
        let poll_timeout = duration_or(config, "poll_timeout", Duration::from_secs(1))?;
        let max_poll_records = positive_or(config, "max_poll_records", 500)?;
        let max_in_flight_per_partition = positive_or(config, "max_in_flight_per_partition", 1000)?;
        let commit_interval_records = positive_or(config, "commit_interval_records", 1000)? as u64;
        let commit_interval = duration_or(config, "commit_interval", Duration::from_secs(5))?;

        let defaults = BatchSettings::default();
        let batch = BatchSettings {
            max_bytes: positive_or(config, "publish_batch_max_bytes", defaults.max_bytes)?,
            max_count: positive_or(config, "publish_batch_max_count", defaults.max_count)?,
            max_latency: duration_or(config, "publish_batch_max_latency", defaults.max_latency)?,
        };
        if batch.max_count > MAX_BATCH_COUNT {
            return Err(BridgeError::ConfigInvalid(format!(
                "'publish_batch_max_count' must be at most {}",
                MAX_BATCH_COUNT
            )));
        }
        if batch.max_bytes > MAX_BATCH_BYTES {
            return Err(BridgeError::ConfigInvalid(format!(
                "'publish_batch_max_bytes' must be at most {}",
                MAX_BATCH_BYTES
            )));
        }

        let publisher_buffer_capacity = positive_or(config, "publisher_buffer_capacity", 10_000)?;
        if publisher_buffer_capacity < batch.max_count {
            return Err(BridgeError::ConfigInvalid(
                "'publisher_buffer_capacity' must be at least 'publish_batch_max_count'".to_string(),
            ));
        }

        let publish_retry = retry_policy(
            config,
            "retry_",
            RetryPolicy::new(10, Duration::from_millis(100), Duration::from_secs(60), 2.0),
        )?;
        let checkpoint_retry = retry_policy(
            config,
            "checkpoint_retry_",
            RetryPolicy::new(20, Duration::from_millis(100), Duration::from_secs(10), 2.0),
        )?;

        let gap_policy = optional(config, "gap_policy")
            .map(|s| s.parse())
            .transpose()?
            .unwrap_or(GapPolicy::Halt);
        let ordering_key = optional(config, "ordering_key")
            .map(|s| s.parse())
            .transpose()?
            .unwrap_or(OrderingKeyMode::None);

        let pubsub_endpoint = optional(config, "pubsub_endpoint")
            .map(|s| s.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_PUBSUB_ENDPOINT.to_string());

        let metrics_addr = optional(config, "metrics_addr")
            .map(|s| {
                s.parse::<SocketAddr>().map_err(|e| {
                    BridgeError::ConfigInvalid(format!("invalid metrics_addr '{}': {}", s, e))
                })
            })
            .transpose()?;

        let kafka_properties = config
            .iter()
            .filter_map(|(k, v)| {
                k.strip_prefix(KAFKA_PREFIX)
                    .filter(|rest| !rest.is_empty())
                    .map(|rest| (rest.to_string(), v.clone()))
            })
            .collect();

        Ok(BridgeConfig {
            bootstrap_servers,
            source_topic,
            consumer_group,
            starting_offset,
            destination_topic,
            checkpoint_location,
            await_termination,
            drain_timeout,
            assignment_wait,
            poll_timeout,
            max_poll_records,
            max_in_flight_per_partition,
            commit_interval_records,
            commit_interval,
            batch,
            publisher_buffer_capacity,
            publish_retry,
            checkpoint_retry,
            gap_policy,
            ordering_key,
            pubsub_endpoint,
            metrics_addr,
            kafka_properties,
        })
    }

    /// Parse a TOML document into the flat key/value map and validate it.
    ///
    /// Nested tables become dotted keys, so `[kafka]` with
    /// `"security.protocol" = "SASL_SSL"` yields `kafka.security.protocol`.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        Self::from_config_map(&toml_to_config_map(contents)?)
    }
}

/// Flatten a TOML document into string key/value pairs.
pub fn toml_to_config_map(contents: &str) -> Result<HashMap<String, String>> {
    let table: toml::Table = contents
        .parse()
        .map_err(|e| BridgeError::ConfigInvalid(format!("invalid TOML: {}", e)))?;
    let mut out = HashMap::new();
    flatten_toml("", &toml::Value::Table(table), &mut out)?;
    Ok(out)
}

fn flatten_toml(prefix: &str, value: &toml::Value, out: &mut HashMap<String, String>) -> Result<()> {
    match value {
        toml::Value::Table(table) => {
            for (k, v) in table {
                let key = if prefix.is_empty() {
                    k.clone()
                } else {
                    format!("{}.{}", prefix, k)
                };
                flatten_toml(&key, v, out)?;
            }
        }
        toml::Value::String(s) => {
            out.insert(prefix.to_string(), s.clone());
        }
        toml::Value::Integer(i) => {
            out.insert(prefix.to_string(), i.to_string());
        }
        toml::Value::Float(f) => {
            out.insert(prefix.to_string(), f.to_string());
        }
        toml::Value::Boolean(b) => {
            out.insert(prefix.to_string(), b.to_string());
        }
        toml::Value::Array(items) => {
            let mut parts = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    toml::Value::String(s) => parts.push(s.clone()),
                    toml::Value::Integer(i) => parts.push(i.to_string()),
                    other => {
                        return Err(BridgeError::ConfigInvalid(format!(
                            "unsupported array element for '{}': {}",
                            prefix, other
                        )))
                    }
                }
            }
            out.insert(prefix.to_string(), parts.join(","));
        }
        toml::Value::Datetime(d) => {
            out.insert(prefix.to_string(), d.to_string());
        }
    }
    Ok(())
}

fn optional<'a>(config: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    config
        .get(key)
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
}

fn required(config: &HashMap<String, String>, key: &str) -> Result<String> {
    match config.get(key) {
        None => Err(BridgeError::ConfigInvalid(format!(
            "missing required '{}'",
            key
        ))),
        Some(v) if v.trim().is_empty() => Err(BridgeError::ConfigInvalid(format!(
            "'{}' must not be blank",
            key
        ))),
        Some(v) => Ok(v.trim().to_string()),
    }
}

fn validate_host_port(server: &str) -> Result<()> {
    let valid = server
        .rsplit_once(':')
        .map(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok())
        .unwrap_or(false);
    if valid {
        Ok(())
    } else {
        Err(BridgeError::ConfigInvalid(format!(
            "invalid bootstrap server '{}': expected host:port",
            server
        )))
    }
}

/// Parse a duration: a humantime string (`250ms`, `30s`, `5m`) or an integer
/// number of seconds.
pub fn parse_duration(key: &str, value: &str) -> Result<Duration> {
    let v = value.trim();
    if let Ok(secs) = v.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    humantime::parse_duration(v)
        .map_err(|e| BridgeError::ConfigInvalid(format!("invalid {} '{}': {}", key, value, e)))
}

fn duration_or(config: &HashMap<String, String>, key: &str, default: Duration) -> Result<Duration> {
    optional(config, key)
        .map(|v| parse_duration(key, v))
        .transpose()
        .map(|d| d.unwrap_or(default))
}

fn positive_or(config: &HashMap<String, String>, key: &str, default: usize) -> Result<usize> {
    let value = optional(config, key)
        .map(|s| {
            s.parse::<usize>()
                .map_err(|e| BridgeError::ConfigInvalid(format!("invalid {}: {}", key, e)))
        })
        .transpose()?
        .unwrap_or(default);
    if value == 0 {
        return Err(BridgeError::ConfigInvalid(format!(
            "'{}' must be greater than zero",
            key
        )));
    }
    Ok(value)
}

fn retry_policy(
    config: &HashMap<String, String>,
    prefix: &str,
    defaults: RetryPolicy,
) -> Result<RetryPolicy> {
    let initial_key = format!("{}initial_backoff", prefix);
    let max_key = format!("{}max_backoff", prefix);
    let attempts_key = format!("{}max_attempts", prefix);

    let initial_backoff = duration_or(config, &initial_key, defaults.initial_backoff)?;
    let max_backoff = duration_or(config, &max_key, defaults.max_backoff)?;
    let max_retries = optional(config, &attempts_key)
        .map(|s| {
            s.parse::<usize>()
                .map_err(|e| BridgeError::ConfigInvalid(format!("invalid {}: {}", attempts_key, e)))
        })
        .transpose()?
        .unwrap_or(defaults.max_retries);

    if max_backoff < initial_backoff {
        return Err(BridgeError::ConfigInvalid(format!(
            "'{}' must not be smaller than '{}'",
            max_key, initial_key
        )));
    }

    Ok(RetryPolicy::new(
        max_retries,
        initial_backoff,
        max_backoff,
        defaults.backoff_multiplier,
    ))
}
