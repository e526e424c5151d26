//! Batching for the Pub/Sub publisher.
//!
//! Messages are accumulated per ordering-key lane until a count, byte or
//! latency bound is met, then handed to the transport as one publish request.
//!
//! ```text
//! ┌──────────────┐
//! │ publish(...) │ Publisher API
//! └──────┬───────┘
//!        │
//!        ▼
//! ┌──────────────────────────────┐
//! │  BatchBuffer                 │ One per lane
//! │  - items: Vec<T>             │
//! │  - size_bytes: usize         │
//! │  - opened_at: Instant        │
//! └──────┬───────────────────────┘
//!        │
//!        ├─→ Flush on count (publish_batch_max_count)
//!        ├─→ Flush on bytes (publish_batch_max_bytes)
//!        ├─→ Flush on latency (publish_batch_max_latency)
//!        └─→ Flush on flush()/shutdown
//! ```
//!
//! A message that would push the batch past the byte bound closes the current
//! batch first, so a request never exceeds `max_bytes` unless a single
//! message does.
//!
//! BatchBuffer is NOT thread-safe; the publisher worker owns every buffer.

use std::time::{Duration, Instant};

use tracing::trace;

use crate::config::BatchSettings;

/// Buffer for one lane of outgoing messages.
#[derive(Debug)]
pub struct BatchBuffer<T> {
    items: Vec<T>,
    size_bytes: usize,
    /// When the first item of the current batch arrived.
    opened_at: Option<Instant>,
    max_count: usize,
    max_bytes: usize,
    max_latency: Duration,
}

impl<T> BatchBuffer<T> {
    pub fn new(max_count: usize, max_bytes: usize, max_latency: Duration) -> Self {
        Self {
            items: Vec::with_capacity(max_count.min(1024)),
            size_bytes: 0,
            opened_at: None,
            max_count: max_count.max(1),
            max_bytes: max_bytes.max(1),
            max_latency,
        }
    }

    pub fn from_settings(settings: &BatchSettings) -> Self {
        Self::new(settings.max_count, settings.max_bytes, settings.max_latency)
    }

    /// Whether adding `size` more bytes would exceed the byte bound.
    pub fn would_overflow(&self, size: usize) -> bool {
        !self.items.is_empty() && self.size_bytes + size > self.max_bytes
    }

    /// Append an item of `size` bytes.
    pub fn append(&mut self, item: T, size: usize) {
        if self.items.is_empty() {
            self.opened_at = Some(Instant::now());
        }
        self.size_bytes += size;
        self.items.push(item);
        trace!(
            count = self.items.len(),
            size_bytes = self.size_bytes,
            "Appended message to batch"
        );
    }

    /// Count or byte bound reached.
    pub fn is_full(&self) -> bool {
        !self.items.is_empty()
            && (self.items.len() >= self.max_count || self.size_bytes >= self.max_bytes)
    }

    /// Any bound reached, including latency.
    pub fn should_flush(&self) -> bool {
        self.is_full() || self.age().map_or(false, |age| age >= self.max_latency)
    }

    /// When the latency bound of the current batch expires.
    pub fn deadline(&self) -> Option<Instant> {
        self.opened_at.map(|t| t + self.max_latency)
    }

    /// Take the buffered items and reset.
    pub fn drain(&mut self) -> Vec<T> {
        self.size_bytes = 0;
        self.opened_at = None;
        std::mem::take(&mut self.items)
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    /// Time since the first item of the current batch, if any.
    pub fn age(&self) -> Option<Duration> {
        self.opened_at.map(|t| t.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ---------------------------------------------------------------
    // Flush triggers
    // ---------------------------------------------------------------

    #[test]
    fn test_flush_on_count() {
        let mut buffer = BatchBuffer::new(3, 1_000_000, Duration::from_secs(60));
        buffer.append("a", 1);
        buffer.append("b", 1);
        assert!(!buffer.should_flush());
        buffer.append("c", 1);
        assert!(buffer.is_full());
        assert!(buffer.should_flush());
    }

    #[test]
    fn test_flush_on_bytes() {
        let mut buffer = BatchBuffer::new(100, 10, Duration::from_secs(60));
        buffer.append(1, 6);
        assert!(!buffer.should_flush());
        buffer.append(2, 4);
        assert!(buffer.should_flush());
        assert_eq!(buffer.size_bytes(), 10);
    }

    #[test]
    fn test_would_overflow() {
        let mut buffer = BatchBuffer::new(100, 10, Duration::from_secs(60));
        // An oversized message still gets a batch of its own.
        assert!(!buffer.would_overflow(50));
        buffer.append(1, 8);
        assert!(buffer.would_overflow(3));
        assert!(!buffer.would_overflow(2));
    }

    #[test]
    fn test_flush_on_latency() {
        let mut buffer = BatchBuffer::new(100, 1_000_000, Duration::from_millis(5));
        assert!(buffer.deadline().is_none());
        buffer.append((), 1);
        assert!(buffer.deadline().is_some());
        std::thread::sleep(Duration::from_millis(10));
        assert!(buffer.should_flush());
    }

    #[test]
    fn test_empty_never_flushes() {
        let buffer: BatchBuffer<()> = BatchBuffer::new(1, 1, Duration::ZERO);
        assert!(!buffer.should_flush());
    }

    // ---------------------------------------------------------------
    // Drain
    // ---------------------------------------------------------------

    #[test]
    fn test_drain_resets() {
        let mut buffer = BatchBuffer::from_settings(&BatchSettings::default());
        buffer.append("x", 10);
        buffer.append("y", 10);
        let items = buffer.drain();
        assert_eq!(items, vec!["x", "y"]);
        assert!(buffer.is_empty());
        assert_eq!(buffer.size_bytes(), 0);
        assert!(buffer.age().is_none());
    }
}
