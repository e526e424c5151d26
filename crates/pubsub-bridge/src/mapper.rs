//! Record mapping: `SourceRecord → PublishRequest | drop`.
//!
//! Mappers are pure and stateless. Returning `None` drops the record, which
//! the pipeline treats as immediately acknowledged.

use crate::config::OrderingKeyMode;
use crate::record::{PublishRequest, SourceRecord};

/// Attribute carrying the source topic.
pub const ATTR_SOURCE_TOPIC: &str = "source_topic";
/// Attribute carrying the source partition.
pub const ATTR_SOURCE_PARTITION: &str = "source_partition";
/// Attribute carrying the source offset.
pub const ATTR_SOURCE_OFFSET: &str = "source_offset";
/// Attribute carrying the record timestamp in milliseconds.
pub const ATTR_SOURCE_TIMESTAMP: &str = "source_timestamp";

const MAX_ATTRIBUTE_NAME_BYTES: usize = 256;

/// Turns source records into publish requests.
pub trait RecordMapper: Send + Sync {
    /// Map one record. `None` drops it.
    fn map(&self, record: &SourceRecord) -> Option<PublishRequest>;
}

impl<F> RecordMapper for F
where
    F: Fn(&SourceRecord) -> Option<PublishRequest> + Send + Sync,
{
    fn map(&self, record: &SourceRecord) -> Option<PublishRequest> {
        self(record)
    }
}

/// Whether `name` can be used as a Pub/Sub attribute key.
///
/// Names must be non-empty, at most 256 bytes and must not start with the
/// reserved `goog` prefix.
pub fn is_valid_attribute_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_ATTRIBUTE_NAME_BYTES
        && !name.to_ascii_lowercase().starts_with("goog")
}

/// Copies the value verbatim and describes the source position in attributes.
///
/// Headers become attributes when their name is valid and their value is
/// UTF-8. Headers never override the `source_*` attributes.
#[derive(Debug, Clone, Copy)]
pub struct DefaultRecordMapper {
    ordering: OrderingKeyMode,
}

impl DefaultRecordMapper {
    pub fn new(ordering: OrderingKeyMode) -> Self {
        Self { ordering }
    }

    fn ordering_key(&self, record: &SourceRecord) -> Option<String> {
        match self.ordering {
            OrderingKeyMode::None => None,
            OrderingKeyMode::RecordKey => record
                .key
                .as_ref()
                .filter(|k| !k.is_empty())
                .map(|k| String::from_utf8_lossy(k).into_owned()),
            OrderingKeyMode::Partition => Some(format!("{}:{}", record.topic, record.partition)),
        }
    }
}

impl Default for DefaultRecordMapper {
    fn default() -> Self {
        Self::new(OrderingKeyMode::None)
    }
}

impl RecordMapper for DefaultRecordMapper {
    fn map(&self, record: &SourceRecord) -> Option<PublishRequest> {
        let mut request = PublishRequest::new(record.value.clone().unwrap_or_default());

        for (name, value) in &record.headers {
            if !is_valid_attribute_name(name) {
                continue;
            }
            if let Ok(value) = std::str::from_utf8(value) {
                request.attributes.insert(name.clone(), value.to_string());
            }
        }

        request
            .attributes
            .insert(ATTR_SOURCE_TOPIC.to_string(), record.topic.clone());
        request
            .attributes
            .insert(ATTR_SOURCE_PARTITION.to_string(), record.partition.to_string());
        request
            .attributes
            .insert(ATTR_SOURCE_OFFSET.to_string(), record.offset.to_string());
        request
            .attributes
            .insert(ATTR_SOURCE_TIMESTAMP.to_string(), record.timestamp.to_string());

        request.ordering_key = self.ordering_key(record);
        Some(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn record() -> SourceRecord {
        SourceRecord::new("orders", 2, 17, "payload").with_timestamp(1_700_000_000_123)
    }

    // ---------------------------------------------------------------
    // Default mapping
    // ---------------------------------------------------------------

    #[test]
    fn test_default_mapping_copies_value_and_position() {
        let req = DefaultRecordMapper::default().map(&record()).unwrap();
        assert_eq!(req.payload, Bytes::from("payload"));
        assert_eq!(req.attributes[ATTR_SOURCE_TOPIC], "orders");
        assert_eq!(req.attributes[ATTR_SOURCE_PARTITION], "2");
        assert_eq!(req.attributes[ATTR_SOURCE_OFFSET], "17");
        assert_eq!(req.attributes[ATTR_SOURCE_TIMESTAMP], "1700000000123");
        assert!(req.ordering_key.is_none());
    }

    #[test]
    fn test_tombstone_maps_to_empty_payload() {
        let mut rec = record();
        rec.value = None;
        let req = DefaultRecordMapper::default().map(&rec).unwrap();
        assert!(req.payload.is_empty());
    }

    #[test]
    fn test_headers_filtered() {
        let rec = record()
            .with_header("trace-id", "abc")
            .with_header("googclient_x", "reserved")
            .with_header("", "empty")
            .with_header("binary", Bytes::from_static(&[0xff, 0xfe]))
            .with_header("x".repeat(257), "long")
            .with_header(ATTR_SOURCE_OFFSET, "spoofed");

        let req = DefaultRecordMapper::default().map(&rec).unwrap();
        assert_eq!(req.attributes.get("trace-id"), Some(&"abc".to_string()));
        assert!(!req.attributes.contains_key("googclient_x"));
        assert!(!req.attributes.contains_key(""));
        assert!(!req.attributes.contains_key("binary"));
        assert_eq!(req.attributes.len(), 5);
        assert_eq!(req.attributes[ATTR_SOURCE_OFFSET], "17");
    }

    // ---------------------------------------------------------------
    // Ordering keys
    // ---------------------------------------------------------------

    #[test]
    fn test_ordering_key_modes() {
        let rec = record().with_key("user-1");

        let req = DefaultRecordMapper::new(OrderingKeyMode::RecordKey).map(&rec).unwrap();
        assert_eq!(req.ordering_key.as_deref(), Some("user-1"));

        let req = DefaultRecordMapper::new(OrderingKeyMode::Partition).map(&rec).unwrap();
        assert_eq!(req.ordering_key.as_deref(), Some("orders:2"));

        let keyless = DefaultRecordMapper::new(OrderingKeyMode::RecordKey)
            .map(&record())
            .unwrap();
        assert!(keyless.ordering_key.is_none());
    }

    #[test]
    fn test_attribute_name_rules() {
        assert!(is_valid_attribute_name("a"));
        assert!(is_valid_attribute_name(&"a".repeat(256)));
        assert!(!is_valid_attribute_name(&"a".repeat(257)));
        assert!(!is_valid_attribute_name("goog-foo"));
        assert!(!is_valid_attribute_name("GOOGfoo"));
        assert!(!is_valid_attribute_name(""));
    }

    #[test]
    fn test_closure_mapper_can_drop() {
        let drop_odd = |r: &SourceRecord| {
            if r.offset % 2 == 1 {
                None
            } else {
                Some(PublishRequest::new(r.value.clone().unwrap_or_default()))
            }
        };
        assert!(drop_odd.map(&record()).is_none());
        assert!(drop_odd
            .map(&SourceRecord::new("orders", 0, 4, "x"))
            .is_some());
    }
}
