//! Payload decoding seam.
//!
//! The session engine treats payload decoding as opaque: a [`Schema`]
//! turns payload bytes into the application type `T`, and a
//! [`SchemaProvider`] resolves the decoder for a specific schema version
//! when messages carry one. Decoding is deferred until the application
//! reads the message value, so batch decoding cost is paid only on
//! consumption.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{ConsumerError, Result};

/// Decodes payload bytes into the application type.
pub trait Schema<T>: Send + Sync {
    /// Decodes a payload.
    ///
    /// # Errors
    /// Returns [`ConsumerError::Schema`] when the bytes do not form a
    /// valid `T`.
    fn decode(&self, payload: &Bytes) -> Result<T>;
}

/// Resolves version-specific decoders.
///
/// Messages may carry a schema version assigned by the broker's schema
/// registry. When a provider is configured, the session engine fetches
/// the decoder for that version and falls back to the base schema on a
/// miss.
#[async_trait]
pub trait SchemaProvider<T>: Send + Sync {
    /// Returns the decoder for the given version, or `None` when the
    /// version is unknown.
    async fn schema_for_version(&self, version: &Bytes) -> Option<Arc<dyn Schema<T>>>;
}

/// Identity schema: the payload bytes themselves.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesSchema;

impl Schema<Bytes> for BytesSchema {
    fn decode(&self, payload: &Bytes) -> Result<Bytes> {
        Ok(payload.clone())
    }
}

/// UTF-8 string schema.
#[derive(Debug, Clone, Copy, Default)]
pub struct Utf8Schema;

impl Schema<String> for Utf8Schema {
    fn decode(&self, payload: &Bytes) -> Result<String> {
        std::str::from_utf8(payload)
            .map(str::to_owned)
            .map_err(|e| ConsumerError::Schema {
                message: format!("invalid utf-8 payload: {e}"),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_schema_is_identity() {
        let payload = Bytes::from_static(b"abc");
        let decoded = BytesSchema.decode(&payload).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_utf8_schema() {
        let decoded = Utf8Schema.decode(&Bytes::from_static(b"hello")).unwrap();
        assert_eq!(decoded, "hello");

        let err = Utf8Schema.decode(&Bytes::from_static(&[0xff, 0xfe])).unwrap_err();
        assert!(matches!(err, ConsumerError::Schema { .. }));
    }
}
