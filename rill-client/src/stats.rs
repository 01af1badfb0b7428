//! Consumer statistics.
//!
//! Totals accumulate for the consumer's lifetime and are returned by
//! `get_stats`; a window of the same counters resets on every stat tick
//! and feeds the periodic rate log line.

use tracing::info;

/// Snapshot of consumer counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    /// Messages received from the broker.
    pub num_msgs_received: u64,
    /// Payload bytes received from the broker.
    pub num_bytes_received: u64,
    /// Entries discarded for corruption or decode failure.
    pub num_receive_failed: u64,
    /// Ack frames sent to the broker.
    pub num_acks_sent: u64,
    /// Ack frames that failed to send.
    pub num_acks_failed: u64,
    /// Messages requested for redelivery.
    pub num_msgs_redelivered: u64,
}

/// Accumulates totals and a per-window view of the same counters.
#[derive(Debug, Default)]
pub struct StatsRecorder {
    totals: ConsumerStats,
    window: ConsumerStats,
}

impl StatsRecorder {
    /// Creates a zeroed recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one received message of `bytes` payload bytes.
    pub fn record_received(&mut self, bytes: usize) {
        self.totals.num_msgs_received += 1;
        self.window.num_msgs_received += 1;
        self.totals.num_bytes_received += bytes as u64;
        self.window.num_bytes_received += bytes as u64;
    }

    /// Records a discarded entry.
    pub fn record_receive_failed(&mut self) {
        self.totals.num_receive_failed += 1;
        self.window.num_receive_failed += 1;
    }

    /// Records a sent ack frame.
    pub fn record_ack_sent(&mut self) {
        self.totals.num_acks_sent += 1;
        self.window.num_acks_sent += 1;
    }

    /// Records an ack frame that failed to send.
    pub fn record_ack_failed(&mut self) {
        self.totals.num_acks_failed += 1;
        self.window.num_acks_failed += 1;
    }

    /// Records messages requested for redelivery.
    pub fn record_redelivered(&mut self, count: u64) {
        self.totals.num_msgs_redelivered += count;
        self.window.num_msgs_redelivered += count;
    }

    /// Lifetime totals.
    #[must_use]
    pub const fn snapshot(&self) -> ConsumerStats {
        self.totals
    }

    /// Logs the window counters and resets them.
    pub fn tick(&mut self, topic: &str, subscription: &str) {
        let window = self.window;
        self.window = ConsumerStats::default();

        info!(
            topic,
            subscription,
            msgs_received = window.num_msgs_received,
            bytes_received = window.num_bytes_received,
            receive_failed = window.num_receive_failed,
            acks_sent = window.num_acks_sent,
            acks_failed = window.num_acks_failed,
            msgs_redelivered = window.num_msgs_redelivered,
            "consumer stats"
        );
    }
}
