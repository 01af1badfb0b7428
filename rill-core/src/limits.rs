//! System limits and configuration bounds.
//!
//! Following `TigerStyle`: put limits on everything.
//! Every queue, buffer, and request has an explicit maximum size.

/// System-wide limits for the Rill client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Maximum message ids carried by one redelivery request.
    /// Larger sets are split into chunks of this size.
    pub max_redeliver_ids_per_request: u32,

    /// Maximum individual acks carried by one grouped ack frame.
    pub max_acks_per_frame: u32,

    /// Maximum sub-messages the client accepts in a single batched entry.
    pub max_messages_per_batch: u32,

    /// Maximum decompressed entry payload size in bytes.
    pub max_entry_bytes: u32,

    /// Maximum properties on a single message.
    pub max_properties_per_message: u32,
}

impl Limits {
    /// Creates limits with safe defaults.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_redeliver_ids_per_request: 1000,
            max_acks_per_frame: 1000,
            max_messages_per_batch: 10_000,
            max_entry_bytes: 16 * 1024 * 1024,
            max_properties_per_message: 1024,
        }
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_bounded() {
        let limits = Limits::new();
        assert!(limits.max_redeliver_ids_per_request > 0);
        assert!(limits.max_acks_per_frame > 0);
        assert!(limits.max_messages_per_batch > 0);
        assert!(limits.max_entry_bytes > 0);
    }
}
