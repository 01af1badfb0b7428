//! Consumer configuration.

use std::time::Duration;

use rill_core::{ConsumerError, MessageId, Result};
use rill_wire::{InitialPosition, KeySharedPolicy, SchemaInfo, SubscriptionMode, SubscriptionType};

/// Bounds for a batch receive call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchReceivePolicy {
    /// Maximum messages per bundle (0 = unbounded).
    pub max_num_messages: u32,
    /// Maximum payload bytes per bundle (0 = unbounded).
    pub max_num_bytes: usize,
    /// How long a batch receive waits before returning whatever is
    /// buffered.
    pub timeout: Duration,
}

impl Default for BatchReceivePolicy {
    fn default() -> Self {
        Self {
            max_num_messages: 100,
            max_num_bytes: 10 * 1024 * 1024,
            timeout: Duration::from_millis(100),
        }
    }
}

impl BatchReceivePolicy {
    /// Returns true when a queue of `len` messages / `bytes` bytes
    /// already satisfies this policy.
    #[must_use]
    pub fn is_met(&self, len: usize, bytes: usize) -> bool {
        (self.max_num_messages > 0 && len >= self.max_num_messages as usize)
            || (self.max_num_bytes > 0 && bytes >= self.max_num_bytes)
    }
}

/// Dead-letter routing policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterPolicy {
    /// Redelivery count at which a message is routed to the DLQ.
    pub max_redelivery_count: u32,
    /// DLQ topic; derived as `{topic}-{subscription}-DLQ` when empty.
    pub dead_letter_topic: Option<String>,
}

/// Configuration for one consumer session.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Topic partition to subscribe to.
    pub topic: String,
    /// Partition index of the topic, -1 when not partitioned.
    pub partition: i32,
    /// Subscription name.
    pub subscription: String,
    /// Consumer name for broker-side bookkeeping.
    pub consumer_name: String,
    /// Distribution type.
    pub subscription_type: SubscriptionType,
    /// Cursor ownership.
    pub subscription_mode: SubscriptionMode,
    /// Starting position for a brand-new subscription.
    pub initial_position: InitialPosition,
    /// Explicit start position for non-durable subscriptions.
    pub start_message_id: Option<MessageId>,
    /// Rewind the cursor this far behind the start position on first
    /// subscribe.
    pub start_rollback: Option<Duration>,
    /// In-memory buffer bound; flow permits refill at half of it.
    pub receiver_queue_size: u32,
    /// Redeliver messages unacked for this long (zero disables).
    pub ack_timeout: Duration,
    /// Granularity of ack-timeout tracking.
    pub ack_timeout_tick: Duration,
    /// Period for coalescing acks into grouped frames (zero disables
    /// grouping; acks are sent immediately).
    pub ack_group_interval: Duration,
    /// Delay before a negatively acknowledged message is redelivered.
    pub negative_ack_redelivery_delay: Duration,
    /// Read from the compacted view of the topic.
    pub read_compacted: bool,
    /// Whether position bounds include the position itself.
    pub reset_include_head: bool,
    /// Deadline for individual broker operations.
    pub operation_timeout: Duration,
    /// Create the topic if it does not exist.
    pub create_topic_if_missing: bool,
    /// Key-shared policy, for key-shared subscriptions.
    pub key_shared_policy: Option<KeySharedPolicy>,
    /// Dead-letter routing (disabled when `None`).
    pub dead_letter: Option<DeadLetterPolicy>,
    /// Batch receive bounds.
    pub batch_receive: BatchReceivePolicy,
    /// Track partition count changes (acted on by the topic façade).
    pub auto_update_partitions: bool,
    /// Period between stats log lines (zero disables).
    pub stat_interval: Duration,
    /// Schema info advertised on subscribe, filled in by the façade when
    /// the application attached a named schema.
    pub schema_info: Option<SchemaInfo>,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            topic: String::new(),
            partition: -1,
            subscription: String::new(),
            consumer_name: String::new(),
            subscription_type: SubscriptionType::Exclusive,
            subscription_mode: SubscriptionMode::Durable,
            initial_position: InitialPosition::Latest,
            start_message_id: None,
            start_rollback: None,
            receiver_queue_size: 1000,
            ack_timeout: Duration::ZERO,
            ack_timeout_tick: Duration::from_secs(1),
            ack_group_interval: Duration::from_millis(100),
            negative_ack_redelivery_delay: Duration::from_secs(60),
            read_compacted: false,
            reset_include_head: false,
            operation_timeout: Duration::from_secs(30),
            create_topic_if_missing: true,
            key_shared_policy: None,
            dead_letter: None,
            batch_receive: BatchReceivePolicy::default(),
            auto_update_partitions: false,
            stat_interval: Duration::from_secs(60),
            schema_info: None,
        }
    }
}

impl ConsumerConfig {
    /// Creates a configuration for the given topic and subscription.
    #[must_use]
    pub fn new(topic: impl Into<String>, subscription: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            subscription: subscription.into(),
            ..Default::default()
        }
    }

    /// The topic dead-lettered messages are published to.
    #[must_use]
    pub fn dead_letter_topic(&self) -> Option<String> {
        self.dead_letter.as_ref().map(|policy| {
            policy.dead_letter_topic.clone().unwrap_or_else(|| {
                format!("{}-{}-DLQ", self.topic, self.subscription)
            })
        })
    }

    /// Validates the configuration.
    ///
    /// # Errors
    /// Returns [`ConsumerError::InvalidConfig`] for empty names, a zero
    /// operation timeout, an ack timeout shorter than its tick, or a
    /// non-durable subscription with no start position at all (the
    /// broker-side meaning of a null start id is undefined, so it is
    /// rejected here).
    pub fn validate(&self) -> Result<()> {
        if self.topic.is_empty() {
            return Err(invalid("topic must not be empty"));
        }
        if self.subscription.is_empty() {
            return Err(invalid("subscription must not be empty"));
        }
        if self.operation_timeout.is_zero() {
            return Err(invalid("operation_timeout must be positive"));
        }
        if !self.ack_timeout.is_zero() && self.ack_timeout < self.ack_timeout_tick {
            return Err(invalid("ack_timeout must be >= ack_timeout_tick"));
        }
        if self.subscription_type != SubscriptionType::KeyShared
            && self.key_shared_policy.is_some()
        {
            return Err(invalid(
                "key_shared_policy requires a key-shared subscription",
            ));
        }
        if !self.subscription_mode.is_durable() && self.start_message_id.is_none() {
            // Without an explicit id the initial position still defines
            // the start, but only on the very first subscribe; after a
            // reconnect a client-held cursor with no id would subscribe
            // with a null start. Require the id up front.
            return Err(invalid(
                "non-durable subscriptions require start_message_id",
            ));
        }
        if let Some(policy) = &self.dead_letter {
            if policy.max_redelivery_count == 0 {
                return Err(invalid("max_redelivery_count must be positive"));
            }
        }
        Ok(())
    }
}

fn invalid(message: &str) -> ConsumerError {
    ConsumerError::InvalidConfig {
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> ConsumerConfig {
        ConsumerConfig::new("events-0", "analytics")
    }

    #[test]
    fn test_default_config_validates() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn test_empty_names_rejected() {
        assert!(ConsumerConfig::new("", "s").validate().is_err());
        assert!(ConsumerConfig::new("t", "").validate().is_err());
    }

    #[test]
    fn test_non_durable_requires_start_id() {
        let mut config = valid();
        config.subscription_mode = SubscriptionMode::NonDurable;
        assert!(config.validate().is_err());

        config.start_message_id = Some(MessageId::earliest());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_ack_timeout_bounds() {
        let mut config = valid();
        config.ack_timeout = Duration::from_millis(100);
        config.ack_timeout_tick = Duration::from_secs(1);
        assert!(config.validate().is_err());

        config.ack_timeout = Duration::from_secs(10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_key_shared_policy_requires_key_shared() {
        let mut config = valid();
        config.key_shared_policy = Some(KeySharedPolicy::default());
        assert!(config.validate().is_err());

        config.subscription_type = SubscriptionType::KeyShared;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_dead_letter_topic_derivation() {
        let mut config = valid();
        assert!(config.dead_letter_topic().is_none());

        config.dead_letter = Some(DeadLetterPolicy {
            max_redelivery_count: 3,
            dead_letter_topic: None,
        });
        assert_eq!(
            config.dead_letter_topic().as_deref(),
            Some("events-0-analytics-DLQ")
        );

        config.dead_letter = Some(DeadLetterPolicy {
            max_redelivery_count: 3,
            dead_letter_topic: Some("custom-dlq".into()),
        });
        assert_eq!(config.dead_letter_topic().as_deref(), Some("custom-dlq"));
    }
}
