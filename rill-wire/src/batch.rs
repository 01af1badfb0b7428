//! Batch envelope encoding and decoding.
//!
//! A batched entry's decompressed payload is a sequence of sub-messages,
//! each a [`SingleMessageMeta`] header followed by that sub-message's
//! payload bytes. All integers are little-endian and length-prefixed.
//!
//! Layout per sub-message:
//!
//! ```text
//! [key_len: i32][key bytes]        key_len = -1 for no key
//! [flags: u8]                      bit 0: key is base64, bit 1: compacted out
//! [prop_count: u32]
//!   [k_len: u32][k][v_len: u32][v] per property
//! [payload_len: u32][payload bytes]
//! ```
//!
//! Any malformed sub-message poisons the whole entry: decoding stops and
//! the caller discards the entry.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

const FLAG_KEY_B64: u8 = 0b0000_0001;
const FLAG_COMPACTED_OUT: u8 = 0b0000_0010;

/// A batch envelope that could not be parsed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("batch envelope: {message}")]
pub struct BatchDecodeError {
    /// What went wrong.
    pub message: String,
}

impl BatchDecodeError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Per-sub-message header inside a batch envelope.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SingleMessageMeta {
    /// Partition key, if any.
    pub key: Option<String>,
    /// Whether the key is base64-encoded binary.
    pub key_is_b64: bool,
    /// Application properties.
    pub properties: Vec<(String, String)>,
    /// Whether compaction removed this sub-message's payload.
    pub compacted_out: bool,
}

/// A decoded sub-message: its header plus payload slice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubMessage {
    /// Sub-message header.
    pub meta: SingleMessageMeta,
    /// Payload slice (shares the entry buffer).
    pub payload: Bytes,
}

fn put_string(buf: &mut BytesMut, s: &str) {
    #[allow(clippy::cast_possible_truncation)] // String sizes bounded by limits.
    buf.put_u32_le(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn get_string(buf: &mut Bytes, what: &str) -> Result<String, BatchDecodeError> {
    if buf.remaining() < 4 {
        return Err(BatchDecodeError::new(format!("truncated {what} length")));
    }
    let len = buf.get_u32_le() as usize;
    if buf.remaining() < len {
        return Err(BatchDecodeError::new(format!("truncated {what} bytes")));
    }
    let raw = buf.copy_to_bytes(len);
    String::from_utf8(raw.to_vec())
        .map_err(|_| BatchDecodeError::new(format!("{what} is not utf-8")))
}

/// Encodes sub-messages into one batch envelope payload.
///
/// Used by producers and by tests constructing batched entries.
#[must_use]
#[allow(clippy::cast_possible_truncation)] // Sizes bounded by limits.
pub fn encode_batch(messages: &[SubMessage]) -> Bytes {
    let mut buf = BytesMut::new();
    for msg in messages {
        match &msg.meta.key {
            Some(key) => {
                buf.put_i32_le(key.len() as i32);
                buf.put_slice(key.as_bytes());
            }
            None => buf.put_i32_le(-1),
        }

        let mut flags = 0u8;
        if msg.meta.key_is_b64 {
            flags |= FLAG_KEY_B64;
        }
        if msg.meta.compacted_out {
            flags |= FLAG_COMPACTED_OUT;
        }
        buf.put_u8(flags);

        buf.put_u32_le(msg.meta.properties.len() as u32);
        for (k, v) in &msg.meta.properties {
            put_string(&mut buf, k);
            put_string(&mut buf, v);
        }

        buf.put_u32_le(msg.payload.len() as u32);
        buf.put_slice(&msg.payload);
    }
    buf.freeze()
}

/// Decodes a batch envelope into its sub-messages.
///
/// # Errors
/// Returns [`BatchDecodeError`] when the payload is truncated, carries a
/// different number of sub-messages than `expected`, or contains invalid
/// strings. On error the whole entry must be discarded.
pub fn decode_batch(payload: &Bytes, expected: u32) -> Result<Vec<SubMessage>, BatchDecodeError> {
    let mut buf = payload.clone();
    let mut messages = Vec::with_capacity(expected as usize);

    for index in 0..expected {
        if buf.remaining() < 4 {
            return Err(BatchDecodeError::new(format!(
                "truncated key length at sub-message {index}"
            )));
        }
        let key_len = buf.get_i32_le();
        let key = if key_len < 0 {
            None
        } else {
            #[allow(clippy::cast_sign_loss)] // Checked non-negative above.
            let len = key_len as usize;
            if buf.remaining() < len {
                return Err(BatchDecodeError::new(format!(
                    "truncated key at sub-message {index}"
                )));
            }
            let raw = buf.copy_to_bytes(len);
            Some(String::from_utf8(raw.to_vec()).map_err(|_| {
                BatchDecodeError::new(format!("key is not utf-8 at sub-message {index}"))
            })?)
        };

        if buf.remaining() < 1 {
            return Err(BatchDecodeError::new(format!(
                "truncated flags at sub-message {index}"
            )));
        }
        let flags = buf.get_u8();

        if buf.remaining() < 4 {
            return Err(BatchDecodeError::new(format!(
                "truncated property count at sub-message {index}"
            )));
        }
        let prop_count = buf.get_u32_le() as usize;
        let mut properties = Vec::with_capacity(prop_count.min(64));
        for _ in 0..prop_count {
            let k = get_string(&mut buf, "property key")?;
            let v = get_string(&mut buf, "property value")?;
            properties.push((k, v));
        }

        if buf.remaining() < 4 {
            return Err(BatchDecodeError::new(format!(
                "truncated payload length at sub-message {index}"
            )));
        }
        let payload_len = buf.get_u32_le() as usize;
        if buf.remaining() < payload_len {
            return Err(BatchDecodeError::new(format!(
                "truncated payload at sub-message {index}"
            )));
        }
        let sub_payload = buf.copy_to_bytes(payload_len);

        messages.push(SubMessage {
            meta: SingleMessageMeta {
                key,
                key_is_b64: flags & FLAG_KEY_B64 != 0,
                properties,
                compacted_out: flags & FLAG_COMPACTED_OUT != 0,
            },
            payload: sub_payload,
        });
    }

    if buf.has_remaining() {
        return Err(BatchDecodeError::new(format!(
            "{} trailing bytes after {expected} sub-messages",
            buf.remaining()
        )));
    }

    Ok(messages)
}
