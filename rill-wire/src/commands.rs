//! Typed broker commands and broker-pushed events.
//!
//! One struct per wire command used by the consumer core, mirroring the
//! framed protocol field-for-field. Request/response commands carry a
//! [`RequestId`] generated by the connection; fire-and-forget commands
//! (`Flow`, `Ack`, `Redeliver`) do not.

use std::time::Duration;

use rill_core::{AckType, ConsumerId, MessageId, RawMessage, RequestId};

/// How a subscription distributes messages across its consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubscriptionType {
    /// Single consumer; others are rejected.
    #[default]
    Exclusive,
    /// Messages are distributed round-robin across consumers.
    Shared,
    /// Single active consumer with automatic failover.
    Failover,
    /// Distribution by key hash ranges.
    KeyShared,
}

impl SubscriptionType {
    /// Returns true if individual redelivery requests are meaningful for
    /// this type. Exclusive and failover subscriptions can only
    /// redeliver everything.
    #[must_use]
    pub const fn supports_individual_redelivery(self) -> bool {
        matches!(self, Self::Shared | Self::KeyShared)
    }
}

/// Whether the broker persists the subscription cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubscriptionMode {
    /// Cursor persisted by the broker; reconnects resume server-side.
    #[default]
    Durable,
    /// Cursor kept by the client; communicated on every subscribe.
    NonDurable,
}

impl SubscriptionMode {
    /// Returns true for a durable subscription.
    #[must_use]
    pub const fn is_durable(self) -> bool {
        matches!(self, Self::Durable)
    }
}

/// Where a brand-new subscription starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InitialPosition {
    /// Start at the newest message.
    #[default]
    Latest,
    /// Start at the oldest retained message.
    Earliest,
}

/// Key-shared distribution mode.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum KeySharedMode {
    /// Broker splits hash ranges automatically.
    #[default]
    AutoSplit,
    /// Consumer pins explicit hash ranges `(start, end)` inclusive.
    Sticky(Vec<(u16, u16)>),
}

/// Key-shared subscription policy.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KeySharedPolicy {
    /// Distribution mode.
    pub mode: KeySharedMode,
    /// Allow delivery out of order while earlier keys are pending.
    pub allow_out_of_order_delivery: bool,
}

/// Declared schema kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchemaKind {
    /// Raw bytes.
    #[default]
    Bytes,
    /// UTF-8 string.
    String,
    /// JSON document.
    Json,
    /// Avro record.
    Avro,
}

/// Schema registration info sent with a subscribe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaInfo {
    /// Schema name.
    pub name: String,
    /// Schema kind.
    pub kind: SchemaKind,
    /// Serialized schema definition.
    pub data: bytes::Bytes,
}

/// Wire-level reason attached to an error ack, letting the broker
/// account for client-side entry corruption before redelivering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationError {
    /// Entry checksum did not match.
    ChecksumMismatch,
    /// Payload failed to decompress.
    DecompressionError,
    /// Decompressed size disagreed with metadata.
    UncompressedSizeCorruption,
    /// Batch envelope failed to parse.
    BatchDeserializeError,
}

/// Subscribe to one topic partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    /// Topic (partition) to subscribe to.
    pub topic: String,
    /// Subscription name.
    pub subscription: String,
    /// Consumer id on this connection.
    pub consumer_id: ConsumerId,
    /// Correlation id.
    pub request_id: RequestId,
    /// Consumer name, for broker-side bookkeeping.
    pub consumer_name: String,
    /// Distribution type.
    pub sub_type: SubscriptionType,
    /// Starting position for a brand-new subscription.
    pub initial_position: InitialPosition,
    /// Read from the compacted view of the topic.
    pub read_compacted: bool,
    /// Whether the broker owns the cursor.
    pub durable: bool,
    /// Resume position; `None` for durable subscriptions.
    pub start_message_id: Option<MessageId>,
    /// Rewind the cursor this far behind the start position.
    pub start_rollback: Option<Duration>,
    /// Create the topic if it does not exist.
    pub create_topic_if_missing: bool,
    /// Key-shared policy, when `sub_type` is key-shared.
    pub key_shared_policy: Option<KeySharedPolicy>,
    /// Schema info for registry validation.
    pub schema: Option<SchemaInfo>,
}

/// Grant the broker permits to push messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flow {
    /// Consumer id on this connection.
    pub consumer_id: ConsumerId,
    /// Number of messages the broker may push.
    pub permits: u32,
}

/// Acknowledge one or more messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    /// Consumer id on this connection.
    pub consumer_id: ConsumerId,
    /// Individual or cumulative.
    pub ack_type: AckType,
    /// Acknowledged ids. Cumulative acks carry exactly one.
    pub ids: Vec<MessageId>,
    /// Set on error acks for corrupted entries.
    pub validation_error: Option<ValidationError>,
}

/// Request redelivery of unacknowledged messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redeliver {
    /// Consumer id on this connection.
    pub consumer_id: ConsumerId,
    /// Ids to redeliver; `None` redelivers everything outstanding.
    pub ids: Option<Vec<MessageId>>,
}

/// Target of a seek.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekTarget {
    /// Reposition to a message id.
    MessageId(MessageId),
    /// Reposition to the first message published at or after this time
    /// (milliseconds since the Unix epoch).
    Timestamp(u64),
}

/// Reposition the subscription cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Seek {
    /// Consumer id on this connection.
    pub consumer_id: ConsumerId,
    /// Correlation id.
    pub request_id: RequestId,
    /// Where to seek.
    pub target: SeekTarget,
}

/// Ask the broker for the last message id in the partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetLastMessageId {
    /// Consumer id on this connection.
    pub consumer_id: ConsumerId,
    /// Correlation id.
    pub request_id: RequestId,
}

/// Gracefully close the consumer on the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseConsumer {
    /// Consumer id on this connection.
    pub consumer_id: ConsumerId,
    /// Correlation id.
    pub request_id: RequestId,
}

/// Delete the subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unsubscribe {
    /// Consumer id on this connection.
    pub consumer_id: ConsumerId,
    /// Correlation id.
    pub request_id: RequestId,
}

/// Events a connection pushes up to a registered consumer.
#[derive(Debug, Clone)]
pub enum ConsumerEvent {
    /// An entry arrived for this consumer.
    Message(RawMessage),
    /// This consumer became (or stopped being) the active one of a
    /// failover subscription.
    ActiveConsumerChanged(bool),
    /// The topic was terminated; no more messages will ever arrive.
    ReachedEndOfTopic,
    /// The underlying connection dropped.
    Disconnected,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_individual_redelivery_support() {
        assert!(SubscriptionType::Shared.supports_individual_redelivery());
        assert!(SubscriptionType::KeyShared.supports_individual_redelivery());
        assert!(!SubscriptionType::Exclusive.supports_individual_redelivery());
        assert!(!SubscriptionType::Failover.supports_individual_redelivery());
    }

    #[test]
    fn test_subscription_mode() {
        assert!(SubscriptionMode::Durable.is_durable());
        assert!(!SubscriptionMode::NonDurable.is_durable());
    }
}
