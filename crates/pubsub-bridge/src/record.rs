//! Record types exchanged between the source, the mapper and the sink.

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A Kafka topic partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopicPartition {
    /// Topic name.
    pub topic: String,
    /// Partition within the topic.
    pub partition: u32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: u32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.topic, self.partition)
    }
}

/// A record consumed from the source topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRecord {
    /// Topic the record was consumed from.
    pub topic: String,
    /// Partition within the topic.
    pub partition: u32,
    /// Offset within the partition.
    pub offset: u64,
    /// Optional record key.
    pub key: Option<Bytes>,
    /// Optional record value (absent for tombstones).
    pub value: Option<Bytes>,
    /// Record headers. Later duplicates of a header name win.
    pub headers: BTreeMap<String, Bytes>,
    /// Timestamp in milliseconds since epoch.
    pub timestamp: i64,
}

impl SourceRecord {
    /// Build a record with no key and no headers.
    pub fn new(topic: impl Into<String>, partition: u32, offset: u64, value: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            key: None,
            value: Some(value.into()),
            headers: BTreeMap::new(),
            timestamp: 0,
        }
    }

    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Bytes>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// The partition this record belongs to.
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }
}

/// A message ready to be published to Pub/Sub.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PublishRequest {
    /// Message payload.
    pub payload: Bytes,
    /// Message attributes.
    pub attributes: BTreeMap<String, String>,
    /// Ordering key; messages sharing a key are delivered in submission order.
    pub ordering_key: Option<String>,
}

impl PublishRequest {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            ..Default::default()
        }
    }

    /// Approximate encoded size, used for batch byte limits.
    ///
    /// Pub/Sub counts payload, attribute keys and values, and the ordering key.
    pub fn size_bytes(&self) -> usize {
        let attrs: usize = self
            .attributes
            .iter()
            .map(|(k, v)| k.len() + v.len())
            .sum();
        let key = self.ordering_key.as_ref().map_or(0, |k| k.len());
        self.payload.len() + attrs + key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_partition_display() {
        let tp = TopicPartition::new("events", 3);
        assert_eq!(tp.to_string(), "events/3");
    }

    #[test]
    fn test_topic_partition_ordering() {
        let mut tps = vec![
            TopicPartition::new("b", 0),
            TopicPartition::new("a", 2),
            TopicPartition::new("a", 1),
        ];
        tps.sort();
        assert_eq!(tps[0], TopicPartition::new("a", 1));
        assert_eq!(tps[2], TopicPartition::new("b", 0));
    }

    #[test]
    fn test_source_record_builders() {
        let rec = SourceRecord::new("events", 1, 7, "payload")
            .with_key("user-1")
            .with_header("trace-id", "abc")
            .with_timestamp(1_700_000_000_000);
        assert_eq!(rec.key, Some(Bytes::from("user-1")));
        assert_eq!(rec.value, Some(Bytes::from("payload")));
        assert_eq!(rec.headers.get("trace-id"), Some(&Bytes::from("abc")));
        assert_eq!(rec.timestamp, 1_700_000_000_000);
        assert_eq!(rec.topic_partition(), TopicPartition::new("events", 1));
    }

    #[test]
    fn test_publish_request_size_counts_attributes_and_key() {
        let mut req = PublishRequest::new("12345");
        assert_eq!(req.size_bytes(), 5);
        req.attributes.insert("ab".into(), "cde".into());
        req.ordering_key = Some("k".into());
        assert_eq!(req.size_bytes(), 5 + 5 + 1);
    }
}
