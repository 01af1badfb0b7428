//! Rill Core - Strongly-typed identifiers and the message model for the
//! Rill client.
//!
//! This crate provides the types shared by the wire layer and the consumer
//! session engine. It does NOT talk to the network: connections, framing
//! and the session state machine live in `rill-wire` and `rill-client`.
//!
//! # Design Principles (TigerStyle)
//!
//! - **Strongly-typed IDs**: Prevent mixing up ConsumerId with RequestId
//! - **Explicit limits**: Every buffer and request has a bounded maximum
//! - **Explicit types**: Use i64/u32 where the protocol does
//! - **No unsafe code**: Safety > Performance

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;
mod limits;
mod message;
mod message_id;
mod schema;
mod types;

pub use error::{BrokerErrorCode, ConsumerError, Result};
pub use limits::Limits;
pub use message::{Compression, EntryMetadata, Message, Messages, RawMessage};
pub use message_id::{AckType, MessageId};
pub use schema::{BytesSchema, Schema, SchemaProvider, Utf8Schema};
pub use types::{ConsumerId, ProducerId, RequestId, SequenceId};
