//! Incoming message queue and application waiter queues.
//!
//! The incoming queue is an insertion-ordered FIFO with a running byte
//! count; the invariant `bytes == sum of payload lengths` holds at every
//! point and is what `batch_receive`'s byte bound is checked against.
//!
//! Waiters are pending application calls: plain reply channels for
//! single receives, reply channel + timeout handle for batch receives.

use std::collections::{HashSet, VecDeque};

use rill_core::{Message, MessageId, Messages, Result};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::config::BatchReceivePolicy;

/// Insertion-ordered FIFO of deliverable messages with byte accounting.
#[derive(Debug)]
pub struct IncomingQueue<T> {
    messages: VecDeque<Message<T>>,
    bytes: usize,
}

impl<T> Default for IncomingQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> IncomingQueue<T> {
    /// Creates an empty queue.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            messages: VecDeque::new(),
            bytes: 0,
        }
    }

    /// Appends a message.
    pub fn push(&mut self, message: Message<T>) {
        self.bytes += message.size();
        self.messages.push_back(message);
    }

    /// Removes and returns the head.
    pub fn pop(&mut self) -> Option<Message<T>> {
        let message = self.messages.pop_front()?;
        self.bytes -= message.size();
        Some(message)
    }

    /// Peeks at the head.
    #[must_use]
    pub fn peek(&self) -> Option<&Message<T>> {
        self.messages.front()
    }

    /// Number of queued messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Returns true when the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Total queued payload bytes.
    #[must_use]
    pub const fn bytes(&self) -> usize {
        self.bytes
    }

    /// Empties the queue, returning how many messages were dropped.
    pub fn clear(&mut self) -> usize {
        let dropped = self.messages.len();
        self.messages.clear();
        self.bytes = 0;
        dropped
    }

    /// Removes the contiguous head prefix whose ids are in `ids`,
    /// returning how many messages were removed.
    pub fn purge_head_prefix(&mut self, ids: &HashSet<MessageId>) -> u32 {
        let mut removed = 0;
        while let Some(head) = self.messages.front() {
            if !ids.contains(&head.id) {
                break;
            }
            let message = self.messages.pop_front().expect("head just peeked");
            self.bytes -= message.size();
            removed += 1;
        }
        removed
    }

    /// Drains messages into a batch-receive bundle, stopping when the
    /// next message would push the bundle past the policy bounds. The
    /// first message is always taken, so an oversized head cannot stall
    /// the call.
    pub fn drain_batch(&mut self, policy: &BatchReceivePolicy) -> Messages<T> {
        let mut bundle = Messages::new();
        while let Some(next) = self.peek() {
            let over_count = policy.max_num_messages > 0
                && bundle.len() + 1 > policy.max_num_messages as usize;
            let over_bytes =
                policy.max_num_bytes > 0 && bundle.size() + next.size() > policy.max_num_bytes;
            if !bundle.is_empty() && (over_count || over_bytes) {
                break;
            }
            let message = self.pop().expect("peeked message present");
            bundle.push(message);
        }
        bundle
    }
}

/// A pending batch receive: the reply channel plus the handle of its
/// timeout task, aborted when the waiter is satisfied early.
#[derive(Debug)]
pub struct BatchWaiter<T> {
    /// Reply channel back to the application call.
    pub reply: oneshot::Sender<Result<Messages<T>>>,
    /// Timeout task handle, if a timeout was scheduled.
    pub timeout: Option<JoinHandle<()>>,
}

impl<T> BatchWaiter<T> {
    /// Cancels the pending timeout, if any.
    pub fn cancel_timeout(&mut self) {
        if let Some(handle) = self.timeout.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use rill_core::BytesSchema;
    use std::sync::Arc;

    fn message(entry: i64, payload: &'static [u8]) -> Message<Bytes> {
        Message::new(
            MessageId::new(1, entry, 0, -1),
            Bytes::from_static(payload),
            Arc::new(BytesSchema),
        )
    }

    #[test]
    fn test_byte_accounting_invariant() {
        let mut queue = IncomingQueue::new();
        queue.push(message(1, b"aaa"));
        queue.push(message(2, b"bb"));
        assert_eq!(queue.bytes(), 5);
        assert_eq!(queue.len(), 2);

        queue.pop();
        assert_eq!(queue.bytes(), 2);

        queue.clear();
        assert_eq!(queue.bytes(), 0);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_fifo_order() {
        let mut queue = IncomingQueue::new();
        queue.push(message(1, b"a"));
        queue.push(message(2, b"b"));

        assert_eq!(queue.pop().unwrap().id.entry_id, 1);
        assert_eq!(queue.pop().unwrap().id.entry_id, 2);
    }

    #[test]
    fn test_purge_head_prefix_stops_at_first_miss() {
        let mut queue = IncomingQueue::new();
        for entry in 1..=4 {
            queue.push(message(entry, b"x"));
        }

        // 1 and 2 are in the set; 3 is not, so 4 survives even though
        // it is in the set.
        let ids: HashSet<MessageId> = [1, 2, 4]
            .into_iter()
            .map(|entry| MessageId::new(1, entry, 0, -1))
            .collect();

        assert_eq!(queue.purge_head_prefix(&ids), 2);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.peek().unwrap().id.entry_id, 3);
        assert_eq!(queue.bytes(), 2);
    }

    #[test]
    fn test_drain_batch_respects_count() {
        let mut queue = IncomingQueue::new();
        for entry in 1..=5 {
            queue.push(message(entry, b"x"));
        }

        let policy = BatchReceivePolicy {
            max_num_messages: 3,
            max_num_bytes: 0,
            timeout: std::time::Duration::from_millis(100),
        };

        let bundle = queue.drain_batch(&policy);
        assert_eq!(bundle.len(), 3);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_drain_batch_respects_bytes() {
        let mut queue = IncomingQueue::new();
        queue.push(message(1, b"aaaa"));
        queue.push(message(2, b"bbbb"));
        queue.push(message(3, b"cccc"));

        let policy = BatchReceivePolicy {
            max_num_messages: 0,
            max_num_bytes: 8,
            timeout: std::time::Duration::from_millis(100),
        };

        let bundle = queue.drain_batch(&policy);
        assert_eq!(bundle.len(), 2);
        assert_eq!(bundle.size(), 8);
    }

    #[test]
    fn test_drain_batch_takes_oversized_head() {
        let mut queue = IncomingQueue::new();
        queue.push(message(1, b"oversized-payload"));

        let policy = BatchReceivePolicy {
            max_num_messages: 10,
            max_num_bytes: 4,
            timeout: std::time::Duration::from_millis(100),
        };

        let bundle = queue.drain_batch(&policy);
        assert_eq!(bundle.len(), 1);
    }

    #[test]
    fn test_drain_batch_empty_queue() {
        let mut queue: IncomingQueue<Bytes> = IncomingQueue::new();
        let bundle = queue.drain_batch(&BatchReceivePolicy::default());
        assert!(bundle.is_empty());
    }
}
