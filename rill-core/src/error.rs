//! Error types for Rill consumer operations.
//!
//! Following `TigerStyle`: all errors must be handled explicitly.
//! No silent failures, no ignored errors.

use std::fmt;

/// The result type for Rill consumer operations.
pub type Result<T> = std::result::Result<T, ConsumerError>;

/// Broker-reported error codes, split into retriable and fatal classes.
///
/// Retriable codes put the session back into the reconnect loop; fatal
/// codes terminate it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerErrorCode {
    /// Unclassified broker failure.
    UnknownError,
    /// Broker-side persistence failure.
    PersistenceError,
    /// Broker is shedding load or shutting down.
    ServiceNotReady,
    /// Too many concurrent lookup/subscribe requests.
    TooManyRequests,
    /// Topic ownership moved to another broker.
    TopicNotOwned,
    /// Authentication failed.
    AuthenticationError,
    /// Caller lacks permission on the topic or subscription.
    AuthorizationError,
    /// The subscription is held exclusively by another consumer.
    ConsumerBusy,
    /// Topic does not exist and auto-creation is disabled.
    TopicNotFound,
    /// Subscription does not exist.
    SubscriptionNotFound,
    /// Topic was terminated; no further messages will be produced.
    TopicTerminated,
    /// A protocol-level field was rejected.
    InvalidRequest,
}

impl BrokerErrorCode {
    /// Returns true if an operation failing with this code may succeed
    /// on a later attempt against the same or another broker.
    #[must_use]
    pub const fn is_retriable(self) -> bool {
        match self {
            Self::UnknownError
            | Self::PersistenceError
            | Self::ServiceNotReady
            | Self::TooManyRequests
            | Self::TopicNotOwned
            | Self::ConsumerBusy => true,
            Self::AuthenticationError
            | Self::AuthorizationError
            | Self::TopicNotFound
            | Self::SubscriptionNotFound
            | Self::TopicTerminated
            | Self::InvalidRequest => false,
        }
    }
}

/// Errors surfaced by the consumer session engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerError {
    /// The consumer has been closed; no further operations are accepted.
    AlreadyClosed,

    /// No broker connection is currently established.
    NotConnected,

    /// An operation exceeded its deadline.
    Timeout {
        /// What operation timed out.
        operation: &'static str,
    },

    /// Payload decompression failed.
    Decompression {
        /// Why decompression failed.
        message: String,
    },

    /// A batched entry's envelope could not be deserialized.
    BatchDeserialize {
        /// Why parsing failed.
        message: String,
    },

    /// The entry checksum did not match its payload.
    ChecksumMismatch,

    /// Decompressed payload size disagreed with the entry metadata.
    UncompressedSizeCorruption {
        /// Size declared in the metadata.
        expected: u32,
        /// Size actually produced.
        actual: u32,
    },

    /// The connection dropped while a command was in flight.
    ConnectionFailedOnSend {
        /// Description of the send failure.
        message: String,
    },

    /// The broker rejected a request.
    Broker {
        /// Classified error code.
        code: BrokerErrorCode,
        /// Broker-provided detail.
        message: String,
    },

    /// Payload bytes could not be decoded into the application type.
    Schema {
        /// Why decoding failed.
        message: String,
    },

    /// The consumer configuration is invalid.
    InvalidConfig {
        /// What is wrong with the configuration.
        message: String,
    },

    /// The session actor has shut down and cannot accept commands.
    Shutdown,
}

impl ConsumerError {
    /// Returns true if the error may clear up on reconnect.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::NotConnected
            | Self::Timeout { .. }
            | Self::ConnectionFailedOnSend { .. } => true,
            Self::Broker { code, .. } => code.is_retriable(),
            Self::AlreadyClosed
            | Self::Decompression { .. }
            | Self::BatchDeserialize { .. }
            | Self::ChecksumMismatch
            | Self::UncompressedSizeCorruption { .. }
            | Self::Schema { .. }
            | Self::InvalidConfig { .. }
            | Self::Shutdown => false,
        }
    }
}

impl fmt::Display for ConsumerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyClosed => write!(f, "consumer already closed"),
            Self::NotConnected => write!(f, "not connected to a broker"),
            Self::Timeout { operation } => write!(f, "timeout: {operation}"),
            Self::Decompression { message } => write!(f, "decompression failed: {message}"),
            Self::BatchDeserialize { message } => {
                write!(f, "batch envelope deserialization failed: {message}")
            }
            Self::ChecksumMismatch => write!(f, "entry checksum mismatch"),
            Self::UncompressedSizeCorruption { expected, actual } => {
                write!(
                    f,
                    "uncompressed size corruption: expected {expected} bytes, got {actual}"
                )
            }
            Self::ConnectionFailedOnSend { message } => {
                write!(f, "connection failed on send: {message}")
            }
            Self::Broker { code, message } => write!(f, "broker error {code:?}: {message}"),
            Self::Schema { message } => write!(f, "schema decode failed: {message}"),
            Self::InvalidConfig { message } => write!(f, "invalid configuration: {message}"),
            Self::Shutdown => write!(f, "consumer session has shut down"),
        }
    }
}

impl std::error::Error for ConsumerError {}
