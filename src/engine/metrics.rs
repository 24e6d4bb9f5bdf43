//! Engine event counters.
//!
//! An explicit [`Metrics`] handle is passed into the engine at
//! construction — there is no global registry, so every engine instance
//! (and every test) observes its own counters. The engine only
//! increments; exporting is the embedder's concern.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters describing engine activity.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Samples accepted by `insert`.
    pub samples_appended: AtomicU64,

    /// Series first seen by the head.
    pub series_created: AtomicU64,

    /// Blocks written by flushes.
    pub flushes: AtomicU64,

    /// Compactions completed.
    pub compactions: AtomicU64,

    /// Blocks deleted by retention.
    pub retention_deleted: AtomicU64,

    /// Chunks skipped due to checksum or decode failure.
    pub corrupt_chunks: AtomicU64,

    /// WAL segments whose replay stopped early.
    pub corrupt_wal_segments: AtomicU64,

    /// Blocks quarantined to `.trash/` because they failed to open.
    pub quarantined_blocks: AtomicU64,

    /// Background loop iterations that ended in an error.
    pub background_errors: AtomicU64,
}

impl Metrics {
    /// Relaxed increment helper.
    #[inline]
    pub(crate) fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Relaxed add helper.
    #[inline]
    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Relaxed read helper for assertions and stats.
    #[inline]
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}
