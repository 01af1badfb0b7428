//! Negative acknowledgement tracker.
//!
//! A negative ack schedules redelivery after a configured delay rather
//! than immediately: the id maps to a due time, and a periodic tick
//! drains everything due into one redelivery request. Nacking an
//! already-tracked id keeps the earlier due time.

use std::collections::HashMap;

use rill_core::MessageId;

/// Maps nacked ids to their redelivery due times.
#[derive(Debug)]
pub struct NegativeAckTracker {
    delay_ms: u64,
    due: HashMap<MessageId, u64>,
}

impl NegativeAckTracker {
    /// Creates a tracker with the given redelivery delay.
    #[must_use]
    pub fn new(delay_ms: u64) -> Self {
        Self {
            delay_ms,
            due: HashMap::new(),
        }
    }

    /// Schedules redelivery of `id` at `now_ms + delay`. An earlier
    /// existing due time is kept.
    pub fn add(&mut self, id: MessageId, now_ms: u64) {
        let due_at = now_ms.saturating_add(self.delay_ms);
        self.due
            .entry(id)
            .and_modify(|existing| *existing = (*existing).min(due_at))
            .or_insert(due_at);
    }

    /// Removes an id, e.g. when it gets acked before redelivery fires.
    pub fn remove(&mut self, id: MessageId) {
        self.due.remove(&id);
    }

    /// Drains and returns every id due at `now_ms`.
    pub fn drain_due(&mut self, now_ms: u64) -> Vec<MessageId> {
        let due: Vec<MessageId> = self
            .due
            .iter()
            .filter(|(_, &at)| at <= now_ms)
            .map(|(&id, _)| id)
            .collect();
        for id in &due {
            self.due.remove(id);
        }
        due
    }

    /// Drops every tracked id.
    pub fn clear(&mut self) {
        self.due.clear();
    }

    /// Number of tracked ids.
    #[must_use]
    pub fn len(&self) -> usize {
        self.due.len()
    }

    /// Returns true when nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.due.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(entry: i64) -> MessageId {
        MessageId::new(1, entry, 0, -1)
    }

    #[test]
    fn test_nothing_due_before_delay() {
        let mut tracker = NegativeAckTracker::new(100);
        tracker.add(id(1), 1000);

        assert!(tracker.drain_due(1050).is_empty());
        assert_eq!(tracker.drain_due(1100), vec![id(1)]);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_drain_is_exactly_once() {
        let mut tracker = NegativeAckTracker::new(100);
        tracker.add(id(1), 0);

        assert_eq!(tracker.drain_due(200).len(), 1);
        assert!(tracker.drain_due(300).is_empty());
    }

    #[test]
    fn test_earlier_due_time_wins() {
        let mut tracker = NegativeAckTracker::new(100);
        tracker.add(id(1), 0);
        // Nacked again later; the original schedule holds.
        tracker.add(id(1), 90);

        assert_eq!(tracker.drain_due(100), vec![id(1)]);
    }

    #[test]
    fn test_remove_cancels_redelivery() {
        let mut tracker = NegativeAckTracker::new(100);
        tracker.add(id(1), 0);
        tracker.remove(id(1));

        assert!(tracker.drain_due(1000).is_empty());
    }

    #[test]
    fn test_drains_only_due_ids() {
        let mut tracker = NegativeAckTracker::new(100);
        tracker.add(id(1), 0);
        tracker.add(id(2), 50);

        let due = tracker.drain_due(100);
        assert_eq!(due, vec![id(1)]);
        assert_eq!(tracker.len(), 1);
    }
}
