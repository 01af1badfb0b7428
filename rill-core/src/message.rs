//! Consumer-facing message types.
//!
//! Three records cross the seam between the wire codec and the session
//! engine:
//!
//! - [`RawMessage`]: an entry as delivered by the codec — framing
//!   stripped, checksum verified, payload possibly still compressed
//! - [`Message`]: a single deliverable message with a deferred,
//!   memoized decode of its value
//! - [`Messages`]: an ordered bundle produced by batch receive
//!
//! # Deferred decoding
//!
//! `Message::value` decodes on first access and caches the result, so a
//! batched entry's decode cost is paid per sub-message and only for the
//! sub-messages the application actually reads. The decoder owns its
//! payload slice, letting a batch's shared buffer be released per
//! sub-message independently.

use std::fmt;
use std::sync::{Arc, OnceLock};

use bytes::Bytes;

use crate::error::Result;
use crate::message_id::MessageId;
use crate::schema::Schema;
use crate::types::SequenceId;

/// Compression codec applied to an entry payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Compression {
    /// No compression.
    #[default]
    None = 0,
    /// LZ4 compression.
    Lz4 = 1,
    /// Zstd compression.
    Zstd = 2,
    /// Zlib compression.
    Zlib = 3,
}

/// Entry metadata attached to a [`RawMessage`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryMetadata {
    /// Number of messages in the entry (> 1 for a batched entry).
    pub num_messages: u32,
    /// Whether the entry carries a batch envelope.
    pub has_batch: bool,
    /// Compression applied to the payload.
    pub compression: Compression,
    /// Declared decompressed payload size.
    pub uncompressed_size: u32,
    /// Schema version assigned by the registry, if any.
    pub schema_version: Option<Bytes>,
    /// Partition key, if any.
    pub key: Option<String>,
    /// Whether the key is base64-encoded binary.
    pub key_is_b64: bool,
    /// Application properties.
    pub properties: Vec<(String, String)>,
    /// Producer-assigned sequence id.
    pub sequence_id: SequenceId,
}

impl Default for EntryMetadata {
    fn default() -> Self {
        Self {
            num_messages: 1,
            has_batch: false,
            compression: Compression::None,
            uncompressed_size: 0,
            schema_version: None,
            key: None,
            key_is_b64: false,
            properties: Vec::new(),
            sequence_id: SequenceId::new(0),
        }
    }
}

/// An entry delivered by the wire codec: framing stripped, checksum
/// verified against the payload, compression not yet undone.
#[derive(Debug, Clone)]
pub struct RawMessage {
    /// Address of the entry.
    pub id: MessageId,
    /// Entry payload (compressed per `metadata.compression`).
    pub payload: Bytes,
    /// Entry metadata.
    pub metadata: EntryMetadata,
    /// Whether the checksum verification passed.
    pub checksum_ok: bool,
    /// How many times the broker has redelivered this entry.
    pub redelivery_count: u32,
}

impl RawMessage {
    /// Creates a raw message with default metadata and a valid checksum.
    #[must_use]
    pub fn new(id: MessageId, payload: impl Into<Bytes>) -> Self {
        Self {
            id,
            payload: payload.into(),
            metadata: EntryMetadata::default(),
            checksum_ok: true,
            redelivery_count: 0,
        }
    }

    /// Returns true if the entry holds more than one message.
    #[must_use]
    pub const fn is_batched(&self) -> bool {
        self.metadata.num_messages > 1 || self.metadata.has_batch
    }
}

/// A single message delivered to the application.
pub struct Message<T> {
    /// Address of the message.
    pub id: MessageId,
    /// Decompressed payload bytes.
    pub payload: Bytes,
    /// Partition key, if any.
    pub key: Option<String>,
    /// Whether the key is base64-encoded binary.
    pub key_is_b64: bool,
    /// Application properties.
    pub properties: Vec<(String, String)>,
    /// Schema version the payload was written with, if any.
    pub schema_version: Option<Bytes>,
    /// Producer-assigned sequence id.
    pub sequence_id: SequenceId,
    /// How many times the broker has redelivered this message.
    pub redelivery_count: u32,
    /// Topic the message came from.
    pub topic: Arc<str>,
    schema: Arc<dyn Schema<T>>,
    value: OnceLock<T>,
}

impl<T> Message<T> {
    /// Creates a message bound to a decoder.
    #[must_use]
    pub fn new(id: MessageId, payload: impl Into<Bytes>, schema: Arc<dyn Schema<T>>) -> Self {
        Self {
            id,
            payload: payload.into(),
            key: None,
            key_is_b64: false,
            properties: Vec::new(),
            schema_version: None,
            sequence_id: SequenceId::new(0),
            redelivery_count: 0,
            topic: Arc::from(""),
            schema,
            value: OnceLock::new(),
        }
    }

    /// Sets the partition key.
    #[must_use]
    pub fn with_key(mut self, key: impl Into<String>, is_b64: bool) -> Self {
        self.key = Some(key.into());
        self.key_is_b64 = is_b64;
        self
    }

    /// Sets the application properties.
    #[must_use]
    pub fn with_properties(mut self, properties: Vec<(String, String)>) -> Self {
        self.properties = properties;
        self
    }

    /// Sets the schema version.
    #[must_use]
    pub fn with_schema_version(mut self, version: Option<Bytes>) -> Self {
        self.schema_version = version;
        self
    }

    /// Sets the producer sequence id.
    #[must_use]
    pub fn with_sequence_id(mut self, sequence_id: SequenceId) -> Self {
        self.sequence_id = sequence_id;
        self
    }

    /// Sets the redelivery count.
    #[must_use]
    pub const fn with_redelivery_count(mut self, count: u32) -> Self {
        self.redelivery_count = count;
        self
    }

    /// Sets the topic name.
    #[must_use]
    pub fn with_topic(mut self, topic: Arc<str>) -> Self {
        self.topic = topic;
        self
    }

    /// Decodes and returns the message value.
    ///
    /// The first call pays the decode cost; later calls return the
    /// memoized value.
    ///
    /// # Errors
    /// Returns [`crate::ConsumerError::Schema`] when decoding fails.
    /// A failed decode is not memoized, so a later call retries.
    pub fn value(&self) -> Result<&T> {
        if let Some(value) = self.value.get() {
            return Ok(value);
        }
        let decoded = self.schema.decode(&self.payload)?;
        Ok(self.value.get_or_init(|| decoded))
    }

    /// Payload size in bytes, used for queue byte accounting.
    #[must_use]
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

impl<T> fmt::Debug for Message<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("payload_len", &self.payload.len())
            .field("redelivery_count", &self.redelivery_count)
            .finish_non_exhaustive()
    }
}

/// An ordered bundle of messages returned by batch receive.
#[derive(Debug, Default)]
pub struct Messages<T> {
    messages: Vec<Message<T>>,
    bytes: usize,
}

impl<T> Messages<T> {
    /// Creates an empty bundle.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            messages: Vec::new(),
            bytes: 0,
        }
    }

    /// Appends a message, keeping the byte count current.
    pub fn push(&mut self, message: Message<T>) {
        self.bytes += message.size();
        self.messages.push(message);
    }

    /// Number of messages in the bundle.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Returns true if the bundle is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Total payload bytes across the bundle.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.bytes
    }

    /// Iterates the messages in delivery order.
    pub fn iter(&self) -> std::slice::Iter<'_, Message<T>> {
        self.messages.iter()
    }
}

impl<T> IntoIterator for Messages<T> {
    type Item = Message<T>;
    type IntoIter = std::vec::IntoIter<Message<T>>;

    fn into_iter(self) -> Self::IntoIter {
        self.messages.into_iter()
    }
}

impl<'a, T> IntoIterator for &'a Messages<T> {
    type Item = &'a Message<T>;
    type IntoIter = std::slice::Iter<'a, Message<T>>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
