//! Unacknowledged message tracker.
//!
//! Delivered-but-unacked ids sit in time buckets of width
//! `ack_timeout_tick`. Each tick rotates the buckets; ids falling out of
//! the oldest bucket have been outstanding for at least `ack_timeout`
//! and are handed back for redelivery.
//!
//! Batched entries are tracked at entry granularity: one id covers the
//! whole batch and is removed once every sub-message is acked.

use std::collections::{HashSet, VecDeque};

use rill_core::MessageId;

/// Time-bucketed tracker of delivered-but-unacked ids.
#[derive(Debug)]
pub struct UnackedTracker {
    enabled: bool,
    buckets: VecDeque<HashSet<MessageId>>,
    closed: bool,
}

impl UnackedTracker {
    /// Creates a tracker for the given timeout and tick width. A zero
    /// timeout disables tracking entirely; a zero tick falls back to one
    /// bucket of the full timeout.
    #[must_use]
    pub fn new(ack_timeout_ms: u64, tick_ms: u64) -> Self {
        let enabled = ack_timeout_ms > 0;
        let tick = if tick_ms == 0 { ack_timeout_ms } else { tick_ms };

        // An id must survive every bucket before it expires, so the
        // rotation covers at least the full timeout.
        let bucket_count = if enabled {
            usize::try_from(ack_timeout_ms.div_ceil(tick)).unwrap_or(1) + 1
        } else {
            0
        };

        Self {
            enabled,
            buckets: (0..bucket_count).map(|_| HashSet::new()).collect(),
            closed: false,
        }
    }

    /// Returns true when ack-timeout tracking is on.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Starts tracking an id. Re-adding a tracked id keeps its original
    /// bucket (the first delivery starts the clock).
    pub fn add(&mut self, id: MessageId) {
        if !self.enabled || self.closed {
            return;
        }
        if self.buckets.iter().any(|bucket| bucket.contains(&id)) {
            return;
        }
        if let Some(tail) = self.buckets.back_mut() {
            tail.insert(id);
        }
    }

    /// Stops tracking an id. Idempotent.
    pub fn remove(&mut self, id: MessageId) {
        for bucket in &mut self.buckets {
            bucket.remove(&id);
        }
    }

    /// Stops tracking every id up to and including `id`. Used by
    /// cumulative acks. Idempotent.
    pub fn remove_until(&mut self, id: MessageId) {
        for bucket in &mut self.buckets {
            bucket.retain(|tracked| *tracked > id);
        }
    }

    /// Rotates the buckets, returning the ids that timed out.
    pub fn tick(&mut self) -> Vec<MessageId> {
        if !self.enabled || self.closed {
            return Vec::new();
        }
        let expired = self.buckets.pop_front().unwrap_or_default();
        self.buckets.push_back(HashSet::new());
        expired.into_iter().collect()
    }

    /// Drops every tracked id. Idempotent.
    pub fn clear(&mut self) {
        for bucket in &mut self.buckets {
            bucket.clear();
        }
    }

    /// Clears and disables the tracker. Idempotent.
    pub fn close(&mut self) {
        self.clear();
        self.closed = true;
    }

    /// Number of tracked ids.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buckets.iter().map(HashSet::len).sum()
    }

    /// Returns true when nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
