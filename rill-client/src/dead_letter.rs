//! Dead-letter processor.
//!
//! Messages the broker has redelivered past the configured bound are
//! buffered here as they arrive. When a redelivery request is about to
//! go out, each buffered id is published to the dead-letter topic
//! instead and the original is individually acked, taking it out of
//! circulation.
//!
//! The DLQ producer itself is external: the session only drives the
//! [`DeadLetterSink`] seam.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use rill_core::{ConsumerError, MessageId};
use tracing::warn;

/// A message bound for the dead-letter topic.
#[derive(Debug, Clone)]
pub struct DeadLetterMessage {
    /// Original id of the message.
    pub id: MessageId,
    /// Decompressed payload.
    pub payload: Bytes,
    /// Partition key, if any.
    pub key: Option<String>,
    /// Whether the key is base64-encoded binary.
    pub key_is_b64: bool,
    /// Application properties.
    pub properties: Vec<(String, String)>,
}

/// Publishes dead-lettered messages. Implemented over a producer owned
/// by the client façade.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Publishes one message to the dead-letter topic.
    ///
    /// # Errors
    /// Returns the producer's error; the message then stays in
    /// circulation and is redelivered normally.
    async fn publish(
        &self,
        topic: &str,
        message: DeadLetterMessage,
    ) -> Result<(), ConsumerError>;
}

/// Buffers over-redelivered messages and forwards them to the sink.
pub struct DeadLetterProcessor {
    policy: Option<Policy>,
    buffered: HashMap<MessageId, Vec<DeadLetterMessage>>,
}

struct Policy {
    max_redelivery_count: u32,
    topic: String,
    sink: Arc<dyn DeadLetterSink>,
}

impl DeadLetterProcessor {
    /// Creates an enabled processor.
    #[must_use]
    pub fn new(max_redelivery_count: u32, topic: String, sink: Arc<dyn DeadLetterSink>) -> Self {
        Self {
            policy: Some(Policy {
                max_redelivery_count,
                topic,
                sink,
            }),
            buffered: HashMap::new(),
        }
    }

    /// Creates a disabled processor: buffers nothing, processes nothing.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            policy: None,
            buffered: HashMap::new(),
        }
    }

    /// Returns true when a dead-letter policy is configured.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.policy.is_some()
    }

    /// Returns true when a message with this redelivery count must be
    /// buffered for dead-lettering.
    #[must_use]
    pub fn exceeds_redelivery_limit(&self, redelivery_count: u32) -> bool {
        self.policy
            .as_ref()
            .is_some_and(|p| redelivery_count >= p.max_redelivery_count)
    }

    /// Buffers a message under its entry id. Sub-messages of one batched
    /// entry accumulate under the same key.
    pub fn buffer(&mut self, entry_key: MessageId, message: DeadLetterMessage) {
        if self.is_enabled() {
            self.buffered.entry(entry_key).or_default().push(message);
        }
    }

    /// Drops a buffered entry, e.g. when the application acks it the
    /// normal way.
    pub fn remove(&mut self, entry_key: MessageId) {
        self.buffered.remove(&entry_key);
    }

    /// Publishes the messages buffered under `entry_key`, if any.
    ///
    /// Returns true when the id was buffered and every publish
    /// succeeded; the caller must then individually ack the original.
    /// On a publish failure the remaining messages are re-buffered and
    /// false is returned, leaving the id to be redelivered.
    pub async fn process(&mut self, entry_key: MessageId) -> bool {
        let Some(policy) = &self.policy else {
            return false;
        };
        let Some(messages) = self.buffered.remove(&entry_key) else {
            return false;
        };

        let mut remaining = messages.into_iter();
        while let Some(message) = remaining.next() {
            let id = message.id;
            if let Err(error) = policy.sink.publish(&policy.topic, message).await {
                warn!(
                    topic = %policy.topic,
                    %id,
                    %error,
                    "dead-letter publish failed, message stays in circulation"
                );
                // The failed message is re-buffered on its next
                // redelivery; keep only the not-yet-attempted rest.
                let rest: Vec<DeadLetterMessage> = remaining.collect();
                if !rest.is_empty() {
                    self.buffered.insert(entry_key, rest);
                }
                return false;
            }
        }
        true
    }

    /// Drops every buffered message.
    pub fn clear(&mut self) {
        self.buffered.clear();
    }

    /// Number of entries with buffered messages.
    #[must_use]
    pub fn buffered_entries(&self) -> usize {
        self.buffered.len()
    }
}
