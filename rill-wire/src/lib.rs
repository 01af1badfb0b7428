//! Rill Wire - Broker command structs and the connection seam.
//!
//! This crate defines the commands the session engine sends to a broker,
//! the events a broker pushes back, and the [`BrokerConnection`] trait
//! that abstracts over the multiplexed framed connection. Framing,
//! checksum verification and request multiplexing live in the connection
//! implementation behind the trait; the session engine only sees typed
//! commands and [`rill_core::RawMessage`] deliveries.
//!
//! Two implementations matter here:
//! - Production connections come from the connection pool (out of this
//!   workspace's scope) and implement [`BrokerConnection`].
//! - [`SimulatedConnection`] is the scriptable in-memory implementation
//!   used by the session engine's tests.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod batch;
mod commands;
mod compress;
mod connection;
mod sim;

pub use batch::{decode_batch, encode_batch, BatchDecodeError, SingleMessageMeta, SubMessage};
pub use commands::{
    Ack, CloseConsumer, ConsumerEvent, Flow, GetLastMessageId, InitialPosition, KeySharedMode,
    KeySharedPolicy, Redeliver, SchemaInfo, SchemaKind, Seek, SeekTarget, Subscribe,
    SubscriptionMode, SubscriptionType, Unsubscribe, ValidationError,
};
pub use compress::{decompress, DecompressError};
pub use connection::{
    BrokerConnection, ConnectionProvider, EventSink, WireError, WireResult,
};
pub use sim::{SentCommand, SimulatedConnection, SimulatedProvider};
