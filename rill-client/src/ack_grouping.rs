//! Ack grouping tracker.
//!
//! Individual acks are cheap to produce and expensive to ship one frame
//! at a time. This tracker coalesces them: acks accumulate between
//! periodic ticks and go out as one cumulative frame (latest position
//! wins) plus chunked individual frames. Seek and close force a flush.
//!
//! The tracker also answers the duplicate filter: a message id that is
//! pending here (or went out in the most recent flush) has already been
//! consumed, so a redelivery of it can be dropped on arrival.
//!
//! With grouping disabled the tracker is a passthrough: `add` returns
//! the frames to send immediately and `is_duplicate` is always false.

use std::collections::HashSet;

use rill_core::{AckType, MessageId};

/// A coalesced group of acks ready to send as one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupedAcks {
    /// Individual or cumulative.
    pub ack_type: AckType,
    /// Ids covered by the frame. Cumulative groups carry exactly one.
    pub ids: Vec<MessageId>,
}

/// Coalesces acks between flushes.
#[derive(Debug)]
pub struct AckGroupingTracker {
    enabled: bool,
    max_acks_per_frame: usize,
    pending_individual: HashSet<MessageId>,
    pending_cumulative: Option<MessageId>,
    flushed_individual: HashSet<MessageId>,
    flushed_cumulative: Option<MessageId>,
    closed: bool,
}

impl AckGroupingTracker {
    /// Creates a tracker. `enabled = false` selects passthrough mode,
    /// used when grouping is configured off or the topic is
    /// non-persistent.
    #[must_use]
    pub fn new(enabled: bool, max_acks_per_frame: u32) -> Self {
        Self {
            enabled,
            max_acks_per_frame: max_acks_per_frame.max(1) as usize,
            pending_individual: HashSet::new(),
            pending_cumulative: None,
            flushed_individual: HashSet::new(),
            flushed_cumulative: None,
            closed: false,
        }
    }

    /// Records an ack. Returns the frames that must go out right now:
    /// empty while grouping, the ack itself in passthrough mode.
    pub fn add(&mut self, id: MessageId, ack_type: AckType) -> Vec<GroupedAcks> {
        if self.closed {
            return Vec::new();
        }

        if !self.enabled {
            return vec![GroupedAcks {
                ack_type,
                ids: vec![id],
            }];
        }

        match ack_type {
            AckType::Individual => {
                self.pending_individual.insert(id);
            }
            AckType::Cumulative => {
                // Latest position wins.
                if self.pending_cumulative.map_or(true, |prev| id > prev) {
                    self.pending_cumulative = Some(id);
                }
            }
        }
        Vec::new()
    }

    /// Returns true iff the id is pending or went out in the most
    /// recent flush. Such a message has been consumed already and a
    /// redelivery of it can be discarded.
    #[must_use]
    pub fn is_duplicate(&self, id: MessageId) -> bool {
        if !self.enabled {
            return false;
        }
        if self.pending_individual.contains(&id) || self.flushed_individual.contains(&id) {
            return true;
        }
        let covered = |cumulative: Option<MessageId>| cumulative.is_some_and(|c| id <= c);
        covered(self.pending_cumulative) || covered(self.flushed_cumulative)
    }

    /// Drains pending acks into frames and rotates them into the
    /// flushed generation.
    pub fn flush(&mut self) -> Vec<GroupedAcks> {
        let mut frames = Vec::new();

        if let Some(cumulative) = self.pending_cumulative.take() {
            frames.push(GroupedAcks {
                ack_type: AckType::Cumulative,
                ids: vec![cumulative],
            });
            self.flushed_cumulative = Some(match self.flushed_cumulative {
                Some(prev) if prev > cumulative => prev,
                _ => cumulative,
            });
        }

        if !self.pending_individual.is_empty() {
            let ids: Vec<MessageId> = self.pending_individual.drain().collect();
            for chunk in ids.chunks(self.max_acks_per_frame) {
                frames.push(GroupedAcks {
                    ack_type: AckType::Individual,
                    ids: chunk.to_vec(),
                });
            }
            self.flushed_individual = ids.into_iter().collect();
        }

        frames
    }

    /// Drops all pending and flushed state. Used after a seek, when
    /// prior positions stop meaning anything.
    pub fn clear(&mut self) {
        self.pending_individual.clear();
        self.pending_cumulative = None;
        self.flushed_individual.clear();
        self.flushed_cumulative = None;
    }

    /// Flushes pending acks and closes the tracker. Later calls are
    /// no-ops.
    pub fn close(&mut self) -> Vec<GroupedAcks> {
        if self.closed {
            return Vec::new();
        }
        let frames = self.flush();
        self.closed = true;
        frames
    }

    /// Number of acks waiting for the next flush.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending_individual.len() + usize::from(self.pending_cumulative.is_some())
    }
}
