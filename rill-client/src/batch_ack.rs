//! Per-batch acknowledgement state.
//!
//! A batched entry is acknowledged to the broker as a unit, but the
//! application acks its sub-messages one by one. The `BatchAcker` keeps
//! a bitmap of outstanding sub-messages; the entry-level ack goes out
//! once the bitmap drains.
//!
//! One acker is shared by all sub-messages of an entry and dropped only
//! after every sub-message has been consumed or discarded.

use std::sync::{Arc, Mutex};

use roaring::RoaringBitmap;

/// Acker shared across the sub-messages of one entry.
pub type SharedBatchAcker = Arc<Mutex<BatchAcker>>;

/// Bitmap of outstanding sub-messages within one batched entry.
#[derive(Debug)]
pub struct BatchAcker {
    bitmap: RoaringBitmap,
    batch_size: u32,
    prev_batch_cumulatively_acked: bool,
}

impl BatchAcker {
    /// Creates an acker with all `batch_size` sub-messages outstanding.
    #[must_use]
    pub fn new(batch_size: u32) -> Self {
        let mut bitmap = RoaringBitmap::new();
        bitmap.insert_range(0..batch_size);
        Self {
            bitmap,
            batch_size,
            prev_batch_cumulatively_acked: false,
        }
    }

    /// Creates a shared acker.
    #[must_use]
    pub fn shared(batch_size: u32) -> SharedBatchAcker {
        Arc::new(Mutex::new(Self::new(batch_size)))
    }

    /// Number of sub-messages in the batch.
    #[must_use]
    pub const fn batch_size(&self) -> u32 {
        self.batch_size
    }

    /// Sub-messages not yet acknowledged.
    #[must_use]
    pub fn outstanding(&self) -> u32 {
        #[allow(clippy::cast_possible_truncation)] // Bounded by batch_size.
        {
            self.bitmap.len() as u32
        }
    }

    /// Acknowledges sub-message `index`. Returns true when the whole
    /// batch is now acknowledged. Idempotent.
    pub fn ack_individual(&mut self, index: u32) -> bool {
        debug_assert!(index < self.batch_size, "index out of batch");
        self.bitmap.remove(index);
        self.bitmap.is_empty()
    }

    /// Acknowledges sub-messages `0..=index`. Returns true when the
    /// whole batch is now acknowledged. Idempotent.
    pub fn ack_group(&mut self, index: u32) -> bool {
        debug_assert!(index < self.batch_size, "index out of batch");
        self.bitmap.remove_range(0..=index);
        self.bitmap.is_empty()
    }

    /// Whether a cumulative ack for the previous entry has already been
    /// sent on behalf of this partially-acked batch.
    #[must_use]
    pub const fn prev_batch_cumulatively_acked(&self) -> bool {
        self.prev_batch_cumulatively_acked
    }

    /// Records that the previous entry has been cumulatively acked.
    pub fn set_prev_batch_cumulatively_acked(&mut self) {
        self.prev_batch_cumulatively_acked = true;
    }
}
