//! Identifier newtypes shared across the client.
//!
//! Every wire-level identifier gets its own type, so a consumer id can
//! never be handed to a parameter expecting a request id. The wrappers
//! are `#[repr(transparent)]` over the raw u64 the protocol carries and
//! cost nothing at runtime.
//!
//! None of these are generated sequentially by this crate: consumer and
//! producer ids are assigned by the client façade, request ids by the
//! connection's own counter, and sequence ids by producers.

use std::fmt;

/// Declares a u64 identifier wrapper.
///
/// `$label` names the id in `Debug`/`Display` output, e.g.
/// `consumer(7)` and `consumer/7`.
macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident, $label:literal) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        #[repr(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Wraps a raw protocol value.
            #[inline]
            #[must_use]
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            /// Unwraps to the raw protocol value.
            #[inline]
            #[must_use]
            pub const fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($label, "({})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($label, "/{}"), self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }

        impl From<$name> for u64 {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

id_type!(
    /// Identifies one consumer session on a connection.
    ///
    /// Assigned by the client façade; the connection multiplexes
    /// deliveries and commands by it.
    ConsumerId,
    "consumer"
);

id_type!(
    /// Identifies one producer session on a connection.
    ProducerId,
    "producer"
);

id_type!(
    /// Correlates a request with its reply on a connection.
    ///
    /// Minted by the connection itself; callers only carry it.
    RequestId,
    "request"
);

id_type!(
    /// Producer-assigned sequence number carried on each message.
    SequenceId,
    "sequence"
);
