//! Sample stream merging across storage tiers.
//!
//! A series' samples for one query (or one compaction) arrive from
//! several tiers: each overlapping block, oldest first, then the head.
//! [`SampleMerger`] fuses them under two rules:
//!
//! - **Within one tier**, equal timestamps are *distinct accepted
//!   samples* (the head admits strictly increasing, equal, and
//!   windowed out-of-order timestamps) and every one of them is kept,
//!   in arrival order.
//! - **Across tiers**, the same timestamp means the *same data
//!   persisted twice* — the overlap window left by a flush or a
//!   compaction whose sources were not yet deleted. The newest tier
//!   wins and the older tier's samples at that timestamp are dropped.
//!
//! Cross-tier duplication can only be redundancy: after a flush the
//! engine rejects inserts at or below the flushed horizon, so a
//! genuine new sample can never share a timestamp with a block.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

use crate::chunk::Sample;

/// Accumulates one series' samples from successive tiers.
///
/// Feed tiers in ascending `rank` order (oldest block first, head
/// last); within a tier, feed samples in chunk order.
#[derive(Debug, Default)]
pub struct SampleMerger {
    /// timestamp → (rank of the tier that owns this slot, its values).
    slots: BTreeMap<i64, (u32, Vec<f64>)>,
}

impl SampleMerger {
    /// An empty merger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one sample coming from the tier identified by `rank`.
    pub fn push(&mut self, rank: u32, sample: Sample) {
        match self.slots.entry(sample.timestamp) {
            Entry::Vacant(slot) => {
                slot.insert((rank, vec![sample.value]));
            }
            Entry::Occupied(mut slot) => {
                let (owner, values) = slot.get_mut();
                if *owner == rank {
                    // Same tier: a distinct accepted sample.
                    values.push(sample.value);
                } else if rank > *owner {
                    // Newer tier: this timestamp was persisted twice;
                    // the newer copy supersedes the older tier's.
                    *owner = rank;
                    values.clear();
                    values.push(sample.value);
                }
                // Older tier than the current owner: stale copy, drop.
            }
        }
    }

    /// True when no samples survived.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// All surviving samples, non-decreasing by timestamp; equal
    /// timestamps keep the order they were fed in.
    pub fn into_samples(self) -> Vec<Sample> {
        let mut out = Vec::with_capacity(self.slots.len());
        for (timestamp, (_, values)) in self.slots {
            for value in values {
                out.push(Sample::new(timestamp, value));
            }
        }
        out
    }
}
