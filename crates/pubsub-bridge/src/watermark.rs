//! Per-partition progress tracking.
//!
//! Offsets are tracked in the order the pipeline receives them. Both the
//! watermark and the committed value are *positions*: the next offset that
//! has not been acknowledged. The watermark only moves over a prefix of
//! resolved offsets, so one slow or failed record holds back everything
//! received after it.
//!
//! ```text
//!  received:   40  41  43  44  45        (42 compacted away)
//!  resolved:    ✓   ✓   ✗   ✓   ✓
//!                       ▲
//!                   watermark = 43
//! ```

use std::collections::BTreeMap;

/// How an in-flight offset reached a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The sink acknowledged the message.
    Acked,
    /// Nothing was published (mapper drop, skip or dead letter).
    Dropped,
}

/// Ordered in-flight set plus watermark/committed positions for one partition.
#[derive(Debug, Clone)]
pub struct WatermarkTracker {
    /// Received but not yet passed by the watermark; `true` once resolved.
    pending: BTreeMap<u64, bool>,
    watermark: u64,
    committed: u64,
    /// Highest offset ever tracked.
    last_tracked: Option<u64>,
    unresolved: usize,
    acked: u64,
    dropped: u64,
}

impl WatermarkTracker {
    /// Start at `position`, which is treated as already committed.
    pub fn new(position: u64) -> Self {
        Self {
            pending: BTreeMap::new(),
            watermark: position,
            committed: position,
            last_tracked: None,
            unresolved: 0,
            acked: 0,
            dropped: 0,
        }
    }

    /// Add a received offset to the in-flight set.
    ///
    /// Returns `false`, and tracks nothing, for offsets below the watermark or
    /// not above the last tracked offset (redelivery).
    pub fn track(&mut self, offset: u64) -> bool {
        if !self.accepts(offset) {
            return false;
        }
        self.pending.insert(offset, false);
        self.last_tracked = Some(offset);
        self.unresolved += 1;
        true
    }

    /// Whether `offset` is new: at or above the watermark and past every tracked offset.
    pub fn accepts(&self, offset: u64) -> bool {
        offset >= self.watermark && self.last_tracked.map_or(true, |last| offset > last)
    }

    /// Mark `offset` terminal. Returns the new watermark if it advanced.
    pub fn resolve(&mut self, offset: u64, resolution: Resolution) -> Option<u64> {
        match self.pending.get_mut(&offset) {
            Some(done) if !*done => *done = true,
            _ => return None,
        }
        self.unresolved -= 1;
        match resolution {
            Resolution::Acked => self.acked += 1,
            Resolution::Dropped => self.dropped += 1,
        }

        let before = self.watermark;
        while let Some(entry) = self.pending.first_entry() {
            if !*entry.get() {
                break;
            }
            let (resolved, _) = entry.remove_entry();
            self.watermark = resolved + 1;
        }
        (self.watermark > before).then_some(self.watermark)
    }

    /// Next offset not contiguously acknowledged.
    pub fn watermark(&self) -> u64 {
        self.watermark
    }

    /// Last durably checkpointed position.
    pub fn committed(&self) -> u64 {
        self.committed
    }

    /// Record that `position` was persisted. Never moves backwards or past the watermark.
    pub fn mark_committed(&mut self, position: u64) {
        self.committed = self.committed.max(position.min(self.watermark));
    }

    /// Checkpoint value to persist ("offsets ≤ value acknowledged") if the
    /// watermark moved past the committed position.
    pub fn pending_checkpoint(&self) -> Option<u64> {
        (self.watermark > self.committed).then(|| self.watermark - 1)
    }

    /// Positions gained since the last commit.
    pub fn uncommitted(&self) -> u64 {
        self.watermark - self.committed
    }

    /// Offsets handed to the sink whose outcome is still unknown.
    pub fn in_flight(&self) -> usize {
        self.unresolved
    }

    pub fn last_tracked(&self) -> Option<u64> {
        self.last_tracked
    }

    /// Oldest offset still waiting for its outcome.
    pub fn oldest_unresolved(&self) -> Option<u64> {
        self.pending
            .iter()
            .find(|(_, done)| !**done)
            .map(|(offset, _)| *offset)
    }

    pub fn acked(&self) -> u64 {
        self.acked
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
