//! Consumer interceptor hooks.
//!
//! Interceptors observe the session at fixed points. All methods default
//! to no-ops, so implementations override only what they watch.

use rill_core::{Message, MessageId};

/// Hooks invoked by the session at fixed points.
pub trait ConsumerInterceptor<T>: Send + Sync {
    /// Called on each message just before it is handed to the
    /// application; may mutate it in place.
    fn before_consume(&self, _message: &mut Message<T>) {}

    /// Called when the application acknowledges a message.
    fn on_acknowledge(&self, _id: MessageId) {}

    /// Called when the application acknowledges cumulatively.
    fn on_acknowledge_cumulative(&self, _id: MessageId) {}

    /// Called with the ids of messages whose ack timeout expired, just
    /// before the redelivery request goes out.
    fn on_ack_timeout_send(&self, _ids: &[MessageId]) {}

    /// Called with the ids of negatively acknowledged messages, just
    /// before the redelivery request goes out.
    fn on_negative_acks_send(&self, _ids: &[MessageId]) {}

    /// Called once when the consumer shuts down.
    fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use rill_core::BytesSchema;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct Counting {
        consumed: AtomicU32,
        acked: AtomicU32,
    }

    impl ConsumerInterceptor<Bytes> for Counting {
        fn before_consume(&self, _message: &mut Message<Bytes>) {
            self.consumed.fetch_add(1, Ordering::Relaxed);
        }

        fn on_acknowledge(&self, _id: MessageId) {
            self.acked.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_default_methods_are_noops() {
        struct Silent;
        impl ConsumerInterceptor<Bytes> for Silent {}

        let interceptor = Silent;
        interceptor.on_acknowledge(MessageId::earliest());
        interceptor.on_ack_timeout_send(&[]);
        interceptor.close();
    }

    #[test]
    fn test_overridden_hooks_fire() {
        let interceptor = Counting::default();
        let mut message = Message::new(
            MessageId::new(1, 0, 0, -1),
            Bytes::from_static(b"x"),
            Arc::new(BytesSchema),
        );

        interceptor.before_consume(&mut message);
        interceptor.on_acknowledge(message.id);
        interceptor.on_acknowledge_cumulative(message.id);

        assert_eq!(interceptor.consumed.load(Ordering::Relaxed), 1);
        assert_eq!(interceptor.acked.load(Ordering::Relaxed), 1);
    }
}
