//! The connection seam between the session engine and the broker.
//!
//! A [`BrokerConnection`] is a multiplexed framed connection shared by
//! every producer and consumer talking to one broker address. The only
//! mutation a consumer performs on it is registering and removing its
//! event sink; command sends are request/response keyed by
//! monotonically-generated request ids inside the implementation.
//!
//! # Upcalls
//!
//! Broker-pushed events reach the session through an [`EventSink`]: a
//! plain enqueue callback registered per consumer id. The sink holds no
//! strong reference to the session, so the session can own the
//! connection handle without creating a reference cycle.

use std::sync::Arc;

use async_trait::async_trait;
use rill_core::{BrokerErrorCode, ConsumerError, ConsumerId, MessageId, RequestId};
use thiserror::Error;

use crate::commands::{
    Ack, CloseConsumer, ConsumerEvent, Flow, GetLastMessageId, Redeliver, Seek, Subscribe,
    Unsubscribe,
};

/// Result type for wire operations.
pub type WireResult<T> = Result<T, WireError>;

/// Errors from connection operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WireError {
    /// The connection is no longer usable.
    #[error("connection inactive")]
    Inactive,

    /// A frame could not be written to the socket.
    #[error("send failed: {message}")]
    SendFailed {
        /// Description of the failure.
        message: String,
    },

    /// The broker replied with an error.
    #[error("broker error {code:?}: {message}")]
    Broker {
        /// Classified error code.
        code: BrokerErrorCode,
        /// Broker-provided detail.
        message: String,
    },

    /// No reply arrived within the operation deadline.
    #[error("timeout waiting for {operation}")]
    Timeout {
        /// The operation that timed out.
        operation: &'static str,
    },
}

impl From<WireError> for ConsumerError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::Inactive => Self::NotConnected,
            WireError::SendFailed { message } => Self::ConnectionFailedOnSend { message },
            WireError::Broker { code, message } => Self::Broker { code, message },
            WireError::Timeout { operation } => Self::Timeout { operation },
        }
    }
}

/// Enqueue callback for broker-pushed events.
///
/// Must not block: implementations post onto the session's command queue
/// and return.
pub type EventSink = Arc<dyn Fn(ConsumerEvent) + Send + Sync>;

/// A multiplexed framed connection to one broker.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Generates the next request id for this connection.
    fn next_request_id(&self) -> RequestId;

    /// Returns true while the connection can carry commands.
    fn is_active(&self) -> bool;

    /// Registers the event sink for a consumer id.
    ///
    /// Events for that id are delivered through the sink until
    /// [`Self::remove_consumer`] is called or the connection drops.
    fn register_consumer(&self, id: ConsumerId, sink: EventSink);

    /// Removes a consumer registration.
    fn remove_consumer(&self, id: ConsumerId);

    /// Sends a subscribe and awaits the broker's reply.
    async fn subscribe(&self, cmd: Subscribe) -> WireResult<()>;

    /// Sends a flow permit grant (fire-and-forget).
    async fn send_flow(&self, cmd: Flow) -> WireResult<()>;

    /// Sends an ack frame (fire-and-forget).
    async fn send_ack(&self, cmd: Ack) -> WireResult<()>;

    /// Sends a redelivery request (fire-and-forget).
    async fn redeliver(&self, cmd: Redeliver) -> WireResult<()>;

    /// Sends a seek and awaits the broker's reply.
    async fn seek(&self, cmd: Seek) -> WireResult<()>;

    /// Fetches the last message id in the partition.
    async fn get_last_message_id(&self, cmd: GetLastMessageId) -> WireResult<MessageId>;

    /// Closes the consumer on the broker and awaits the reply.
    async fn close_consumer(&self, cmd: CloseConsumer) -> WireResult<()>;

    /// Deletes the subscription and awaits the reply.
    async fn unsubscribe(&self, cmd: Unsubscribe) -> WireResult<()>;
}

/// Yields connections to the broker owning a topic.
///
/// Backed by the lookup service and connection pool, which cache and
/// share connections across sessions.
#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    /// Resolves the topic's owner broker and returns a connection to it.
    async fn connect(&self, topic: &str) -> WireResult<Arc<dyn BrokerConnection>>;
}
