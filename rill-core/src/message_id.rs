//! The `MessageId` ordering key.
//!
//! A message is addressed by the broker storage entry that holds it plus
//! its position inside that entry:
//!
//! - **`ledger_id` / `entry_id`**: the append-only storage unit
//! - **partition**: which partition log the entry belongs to (-1 when the
//!   topic is not partitioned)
//! - **`batch_index`**: position inside a batched entry, -1 for a
//!   non-batched entry
//!
//! The total order used everywhere in the client is lexicographic on
//! `(ledger_id, entry_id, batch_index)`. The partition is deliberately
//! excluded: a consumer session owns exactly one partition, and ids are
//! never compared across partitions.

use std::cmp::Ordering;
use std::fmt;

/// How an acknowledgement applies to the subscription cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AckType {
    /// Acknowledge exactly this message.
    Individual,
    /// Acknowledge this message and every message before it.
    Cumulative,
}

/// Totally ordered address of a message within a partition log.
///
/// Equality, ordering and hashing all cover `(ledger_id, entry_id,
/// batch_index)`; the partition is carried for wire round-trips but
/// excluded, since a session never mixes ids across partitions.
#[derive(Debug, Clone, Copy)]
pub struct MessageId {
    /// Ledger holding the entry.
    pub ledger_id: i64,
    /// Entry within the ledger.
    pub entry_id: i64,
    /// Partition index, -1 for non-partitioned topics.
    pub partition: i32,
    /// Index within a batched entry, -1 for non-batched entries.
    pub batch_index: i32,
}

impl MessageId {
    /// Creates a message id.
    #[must_use]
    pub const fn new(ledger_id: i64, entry_id: i64, partition: i32, batch_index: i32) -> Self {
        Self {
            ledger_id,
            entry_id,
            partition,
            batch_index,
        }
    }

    /// The earliest possible position (all components minimal).
    #[must_use]
    pub const fn earliest() -> Self {
        Self::new(-1, -1, -1, -1)
    }

    /// The latest possible position.
    #[must_use]
    pub const fn latest() -> Self {
        Self::new(i64::MAX, i64::MAX, -1, -1)
    }

    /// Returns true if this is the earliest sentinel.
    #[must_use]
    pub fn is_earliest(&self) -> bool {
        *self == Self::earliest()
    }

    /// Returns true if this is the latest sentinel.
    #[must_use]
    pub fn is_latest(&self) -> bool {
        self.ledger_id == i64::MAX && self.entry_id == i64::MAX
    }

    /// Returns true if both ids address the same broker entry.
    #[must_use]
    pub const fn same_entry(&self, other: &Self) -> bool {
        self.ledger_id == other.ledger_id && self.entry_id == other.entry_id
    }

    /// The id of this message's entry with the batch index cleared.
    ///
    /// All sub-messages of one batch share this key; trackers that work
    /// at entry granularity (unacked, dead-letter) use it.
    #[must_use]
    pub const fn entry_key(&self) -> Self {
        Self::new(self.ledger_id, self.entry_id, self.partition, -1)
    }

    /// The non-batched id of the previous entry.
    #[must_use]
    pub const fn prev_entry(&self) -> Self {
        Self::new(self.ledger_id, self.entry_id - 1, self.partition, -1)
    }

    /// The resume-point predecessor of this id.
    ///
    /// Resubscribing at the predecessor makes the broker redeliver from
    /// this message onward. A batch head at index 0 has no in-entry
    /// predecessor; its predecessor is the previous entry (last
    /// sub-message position), same as the non-batched case.
    #[must_use]
    pub const fn predecessor(&self) -> Self {
        if self.batch_index > 0 {
            Self::new(
                self.ledger_id,
                self.entry_id,
                self.partition,
                self.batch_index - 1,
            )
        } else {
            self.prev_entry()
        }
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::earliest()
    }
}

impl PartialEq for MessageId {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for MessageId {}

impl std::hash::Hash for MessageId {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.ledger_id.hash(state);
        self.entry_id.hash(state);
        self.batch_index.hash(state);
    }
}

impl PartialOrd for MessageId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MessageId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ledger_id
            .cmp(&other.ledger_id)
            .then(self.entry_id.cmp(&other.entry_id))
            .then(self.batch_index.cmp(&other.batch_index))
    }
}

impl fmt::Display for MessageId {
    /// Renders as `ledger:entry:partition:batch`, the conventional
    /// textual form of a message id.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.ledger_id, self.entry_id, self.partition, self.batch_index
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering_is_lexicographic() {
        let a = MessageId::new(1, 5, 0, -1);
        let b = MessageId::new(1, 6, 0, -1);
        let c = MessageId::new(2, 0, 0, -1);

        assert!(a < b);
        assert!(b < c);
        assert!(a < c);
    }

    #[test]
    fn test_partition_excluded_from_ordering() {
        let a = MessageId::new(1, 5, 0, -1);
        let b = MessageId::new(1, 5, 7, -1);
        assert_eq!(a.cmp(&b), Ordering::Equal);
    }

    #[test]
    fn test_batch_index_breaks_ties() {
        let entry = MessageId::new(1, 5, 0, -1);
        let first = MessageId::new(1, 5, 0, 0);
        let second = MessageId::new(1, 5, 0, 1);

        assert!(entry < first);
        assert!(first < second);
    }

    #[test]
    fn test_sentinels() {
        assert!(MessageId::earliest().is_earliest());
        assert!(MessageId::latest().is_latest());
        assert!(MessageId::earliest() < MessageId::new(0, 0, 0, -1));
        assert!(MessageId::new(i64::MAX - 1, 0, 0, -1) < MessageId::latest());
    }

    #[test]
    fn test_predecessor_within_batch() {
        let id = MessageId::new(3, 7, 0, 2);
        assert_eq!(id.predecessor(), MessageId::new(3, 7, 0, 1));
    }

    #[test]
    fn test_predecessor_at_batch_start_falls_to_previous_entry() {
        // Index 0 has no in-entry predecessor; resume from the previous
        // entry rather than a negative batch index.
        let id = MessageId::new(3, 7, 0, 0);
        assert_eq!(id.predecessor(), MessageId::new(3, 6, 0, -1));
    }

    #[test]
    fn test_predecessor_non_batched() {
        let id = MessageId::new(3, 7, 0, -1);
        assert_eq!(id.predecessor(), MessageId::new(3, 6, 0, -1));
    }

    #[test]
    fn test_entry_key_strips_batch_index() {
        let id = MessageId::new(3, 7, 1, 4);
        assert_eq!(id.entry_key(), MessageId::new(3, 7, 1, -1));
        assert!(id.same_entry(&id.entry_key()));
    }

    #[test]
    fn test_display() {
        let id = MessageId::new(1, 2, 3, 4);
        assert_eq!(format!("{id}"), "1:2:3:4");
    }
}
