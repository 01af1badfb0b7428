//! Rill Client - the per-consumer session engine.
//!
//! A consumer session maintains a subscription to one topic partition
//! over a shared broker connection: it regulates flow with permits,
//! delivers messages to the application in broker order, reconciles
//! acknowledgements with redelivery, and survives transparent
//! reconnection across broker outages.
//!
//! # Architecture
//!
//! ```text
//!  application                       broker connection
//!      │ receive/ack/seek                 │ events
//!      ▼                                  ▼
//! ┌──────────┐  commands   ┌─────────────────────────────┐
//! │ Consumer │────────────▶│        session actor        │
//! │  handle  │◀────────────│  queue · flow · trackers ·  │
//! └──────────┘   replies   │  dead-letter · reconnect    │
//!                          └─────────────────────────────┘
//! ```
//!
//! All mutable state lives behind one serialized command queue; every
//! input — broker events, application calls, timer ticks — is a command
//! on that queue. The public [`Consumer`] handle posts commands and
//! awaits reply channels, so no locks guard queue, waiter or tracker
//! state.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod ack_grouping;
mod actor;
mod backoff;
mod batch_ack;
mod config;
mod consumer;
mod dead_letter;
mod flow;
mod interceptor;
mod negative_ack;
mod queue;
mod stats;
mod unacked;

pub use backoff::{Backoff, BackoffConfig};
pub use batch_ack::{BatchAcker, SharedBatchAcker};
pub use config::{BatchReceivePolicy, ConsumerConfig, DeadLetterPolicy};
pub use consumer::{Consumer, ConsumerHooks};
pub use dead_letter::{DeadLetterMessage, DeadLetterSink};
pub use interceptor::ConsumerInterceptor;
pub use stats::ConsumerStats;
