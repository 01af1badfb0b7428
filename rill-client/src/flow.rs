//! Flow permit accounting.
//!
//! The broker consumes one permit per pushed message; the consumer
//! periodically replenishes them with a `Flow` command. This counter
//! tracks permits consumed by the application and reports when enough
//! have accumulated to be worth sending back: at half the receive queue,
//! so the broker never drains completely while the consumer is keeping
//! up.

/// Permit counter with invariant `0 <= available <= receiver_queue_size`.
#[derive(Debug)]
pub struct FlowPermits {
    available: u32,
    receiver_queue_size: u32,
}

impl FlowPermits {
    /// Creates a counter for the given receive queue size.
    #[must_use]
    pub const fn new(receiver_queue_size: u32) -> Self {
        Self {
            available: 0,
            receiver_queue_size,
        }
    }

    /// Adds consumed permits. Returns `Some(n)` when the accumulated
    /// count crossed the half-queue threshold: the caller must send
    /// `Flow{n}` and the counter resets to zero.
    ///
    /// A zero-sized receive queue never emits; flow is managed manually
    /// in that mode.
    pub fn increase(&mut self, delta: u32) -> Option<u32> {
        if self.receiver_queue_size == 0 {
            return None;
        }

        self.available = self
            .available
            .saturating_add(delta)
            .min(self.receiver_queue_size);

        if self.available >= self.receiver_queue_size.div_ceil(2) {
            let permits = self.available;
            self.available = 0;
            Some(permits)
        } else {
            None
        }
    }

    /// Permits accumulated but not yet granted back to the broker.
    #[must_use]
    pub const fn available(&self) -> u32 {
        self.available
    }

    /// Resets the counter, used when a fresh connection gets a full
    /// `Flow(receiver_queue_size)` grant.
    pub fn reset(&mut self) {
        self.available = 0;
    }
}
