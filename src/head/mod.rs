//! Head — the mutable in-memory region where new samples live.
//!
//! Every accepted sample lands here first (after its WAL record) and
//! stays until a flush seals the whole head into an immutable block.
//! Per series the head keeps one **open** chunk appender plus the sealed
//! chunks that preceded it; across series it keeps a live posting index
//! so matcher queries can run against unflushed data.
//!
//! ## Sharding
//!
//! Series are spread over [`SHARD_COUNT`] shards by `fingerprint &
//! (SHARD_COUNT - 1)`, each shard its own `RwLock<HashMap<…>>`. Writers
//! to different series proceed in parallel; readers never block each
//! other. The engine serializes a flush against in-flight inserts with
//! its own head-swap lock, so the head itself never needs a global lock.
//!
//! ## Out-of-order policy
//!
//! Per series, a sample older than `max_ts − out_of_order_window` is
//! rejected with [`HeadError::OutOfOrder`]. The default window of 0
//! enforces strict per-series monotonicity (equal timestamps are
//! accepted); windows up to 10 minutes may be configured. Acceptance is
//! checked for the whole batch before anything is applied, keeping each
//! insert atomic.
//!
//! ## Lifecycle
//!
//! The head is created empty, filled by inserts (or WAL replay), frozen
//! by [`Head::snapshot_series`] once the engine has swapped in a fresh
//! head, and then dropped after its block is durable.

#[cfg(test)]
mod tests;

use std::{
    collections::HashMap,
    sync::{
        RwLock,
        atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering},
    },
};

use thiserror::Error;
use tracing::trace;

use crate::chunk::{ChunkAppender, ChunkError, Sample};
use crate::index::{MemPostings, PostingSource, resolve_matchers};
use crate::labels::{Labels, Matcher, matches_all};

/// Number of head shards. Power of two so the shard pick is a mask.
pub const SHARD_COUNT: usize = 16;

/// Upper bound on the configurable out-of-order window (10 minutes).
pub const MAX_OOO_WINDOW_MS: i64 = 10 * 60 * 1000;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by head operations.
#[derive(Debug, Error)]
pub enum HeadError {
    /// A sample is older than the series' acceptance window.
    #[error(
        "out-of-order sample for series {fingerprint:#018x}: ts {timestamp} < min accepted {min_accepted}"
    )]
    OutOfOrder {
        /// Affected series.
        fingerprint: u64,
        /// Rejected timestamp.
        timestamp: i64,
        /// Oldest timestamp the series currently accepts.
        min_accepted: i64,
    },

    /// Two distinct label sets hashed to the same fingerprint.
    #[error("fingerprint collision on {fingerprint:#018x}: {existing} vs {incoming}")]
    FingerprintCollision {
        /// Colliding fingerprint.
        fingerprint: u64,
        /// Label set already registered.
        existing: Labels,
        /// Label set that collided.
        incoming: Labels,
    },

    /// Chunk encoding failure.
    #[error("chunk error: {0}")]
    Chunk(#[from] ChunkError),

    /// Internal invariant violation or poisoned lock.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Per-series state
// ------------------------------------------------------------------------------------------------

/// An encoded, immutable chunk with its bounds.
#[derive(Debug, Clone)]
pub struct SealedChunk {
    /// Encoded chunk bytes (`chunk` module format).
    pub bytes: Vec<u8>,

    /// Smallest sample timestamp.
    pub min_ts: i64,

    /// Largest sample timestamp.
    pub max_ts: i64,

    /// Number of samples.
    pub samples: u32,
}

/// Mutable per-series state: the open chunk plus everything sealed before it.
#[derive(Debug)]
struct SeriesHead {
    labels: Labels,
    open: ChunkAppender,
    sealed: Vec<SealedChunk>,
    min_ts: i64,
    max_ts: i64,
}

impl SeriesHead {
    fn new(labels: Labels) -> Self {
        Self {
            labels,
            open: ChunkAppender::new(),
            sealed: Vec::new(),
            min_ts: i64::MAX,
            max_ts: i64::MIN,
        }
    }

    /// Seal the open chunk into `sealed`, leaving a fresh appender.
    fn seal_open(&mut self) {
        if self.open.is_empty() {
            return;
        }
        let appender = std::mem::take(&mut self.open);
        // Bounds come from the appender; out-of-order samples inside the
        // acceptance window mean first/last are not necessarily min/max,
        // so track the conservative envelope.
        let first = appender.first_timestamp().unwrap_or(0);
        let last = appender.last_timestamp().unwrap_or(0);
        let samples = appender.num_samples() as u32;
        self.sealed.push(SealedChunk {
            bytes: appender.finish(),
            min_ts: first.min(last),
            max_ts: first.max(last),
            samples,
        });
    }

    fn append(&mut self, sample: Sample) -> Result<(), HeadError> {
        if self.open.is_full() {
            self.seal_open();
        }
        if let Err(ChunkError::Full) = self.open.append(sample) {
            // Hard cap hit before the soft policy (clock skew). Seal and retry.
            self.seal_open();
            self.open.append(sample)?;
        }
        self.min_ts = self.min_ts.min(sample.timestamp);
        self.max_ts = self.max_ts.max(sample.timestamp);
        Ok(())
    }

    /// Encoded chunks (sealed + open snapshot) overlapping `[min_ts, max_ts]`.
    fn chunks_overlapping(&self, min_ts: i64, max_ts: i64) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        for chunk in &self.sealed {
            if chunk.min_ts <= max_ts && min_ts <= chunk.max_ts {
                out.push(chunk.bytes.clone());
            }
        }
        if !self.open.is_empty() {
            let first = self.open.first_timestamp().unwrap_or(0);
            let last = self.open.last_timestamp().unwrap_or(0);
            let (lo, hi) = (first.min(last), first.max(last));
            if lo <= max_ts && min_ts <= hi {
                out.push(self.open.encode());
            }
        }
        out
    }
}

/// One series extracted from a frozen head, ready for block building.
#[derive(Debug)]
pub struct FrozenSeries {
    /// Stable series fingerprint.
    pub fingerprint: u64,

    /// Full label set.
    pub labels: Labels,

    /// All chunks, in creation order.
    pub chunks: Vec<SealedChunk>,

    /// Smallest sample timestamp across the series.
    pub min_ts: i64,

    /// Largest sample timestamp across the series.
    pub max_ts: i64,
}

// ------------------------------------------------------------------------------------------------
// Head
// ------------------------------------------------------------------------------------------------

/// The sharded in-memory write buffer.
pub struct Head {
    shards: Vec<RwLock<HashMap<u64, SeriesHead>>>,
    postings: RwLock<MemPostings>,

    out_of_order_window_ms: i64,
    created_at_ms: i64,

    approx_bytes: AtomicUsize,
    num_samples: AtomicU64,
    min_time: AtomicI64,
    max_time: AtomicI64,
}

impl Head {
    /// Create an empty head.
    ///
    /// `out_of_order_window_ms` is clamped to `[0, MAX_OOO_WINDOW_MS]`;
    /// `created_at_ms` feeds the age-based flush trigger.
    pub fn new(out_of_order_window_ms: i64, created_at_ms: i64) -> Self {
        let shards = (0..SHARD_COUNT)
            .map(|_| RwLock::new(HashMap::new()))
            .collect();
        Self {
            shards,
            postings: RwLock::new(MemPostings::new()),
            out_of_order_window_ms: out_of_order_window_ms.clamp(0, MAX_OOO_WINDOW_MS),
            created_at_ms,
            approx_bytes: AtomicUsize::new(0),
            num_samples: AtomicU64::new(0),
            min_time: AtomicI64::new(i64::MAX),
            max_time: AtomicI64::new(i64::MIN),
        }
    }

    #[inline]
    fn shard(&self, fingerprint: u64) -> &RwLock<HashMap<u64, SeriesHead>> {
        &self.shards[fingerprint as usize & (SHARD_COUNT - 1)]
    }

    fn read_shard(
        &self,
        fingerprint: u64,
    ) -> Result<std::sync::RwLockReadGuard<'_, HashMap<u64, SeriesHead>>, HeadError> {
        self.shard(fingerprint)
            .read()
            .map_err(|_| HeadError::Internal("shard lock poisoned".into()))
    }

    fn write_shard(
        &self,
        fingerprint: u64,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<u64, SeriesHead>>, HeadError> {
        self.shard(fingerprint)
            .write()
            .map_err(|_| HeadError::Internal("shard lock poisoned".into()))
    }

    /// True when the series is already registered.
    pub fn contains(&self, fingerprint: u64) -> bool {
        self.read_shard(fingerprint)
            .map(|shard| shard.contains_key(&fingerprint))
            .unwrap_or(false)
    }

    /// Label set of a registered series.
    pub fn labels_of(&self, fingerprint: u64) -> Option<Labels> {
        self.read_shard(fingerprint)
            .ok()?
            .get(&fingerprint)
            .map(|s| s.labels.clone())
    }

    /// Verify that every sample in a batch is inside the series'
    /// acceptance window, **without** mutating anything.
    ///
    /// Called before the WAL record is written so a rejected insert
    /// leaves no trace. New series accept any timestamp.
    pub fn check_append(&self, fingerprint: u64, samples: &[Sample]) -> Result<(), HeadError> {
        let shard = self.read_shard(fingerprint)?;
        let Some(series) = shard.get(&fingerprint) else {
            return Ok(());
        };
        if series.max_ts == i64::MIN {
            return Ok(());
        }
        let min_accepted = series.max_ts - self.out_of_order_window_ms;
        for sample in samples {
            if sample.timestamp < min_accepted {
                return Err(HeadError::OutOfOrder {
                    fingerprint,
                    timestamp: sample.timestamp,
                    min_accepted,
                });
            }
        }
        Ok(())
    }

    /// Register the series if it is not yet present.
    ///
    /// Returns `true` when the series was created (the caller owes the
    /// WAL a series record in that case). A same-fingerprint,
    /// different-labels collision is rejected.
    pub fn get_or_create(&self, fingerprint: u64, labels: &Labels) -> Result<bool, HeadError> {
        {
            let shard = self.read_shard(fingerprint)?;
            if let Some(existing) = shard.get(&fingerprint) {
                if existing.labels != *labels {
                    return Err(HeadError::FingerprintCollision {
                        fingerprint,
                        existing: existing.labels.clone(),
                        incoming: labels.clone(),
                    });
                }
                return Ok(false);
            }
        }

        let mut shard = self.write_shard(fingerprint)?;
        if let Some(existing) = shard.get(&fingerprint) {
            if existing.labels != *labels {
                return Err(HeadError::FingerprintCollision {
                    fingerprint,
                    existing: existing.labels.clone(),
                    incoming: labels.clone(),
                });
            }
            return Ok(false);
        }

        shard.insert(fingerprint, SeriesHead::new(labels.clone()));
        drop(shard);

        self.postings
            .write()
            .map_err(|_| HeadError::Internal("postings lock poisoned".into()))?
            .add(fingerprint, labels);

        let label_bytes: usize = labels
            .iter()
            .map(|l| l.name.len() + l.value.len() + 16)
            .sum();
        self.approx_bytes.fetch_add(label_bytes + 128, Ordering::Relaxed);

        trace!(fingerprint = format_args!("{fingerprint:#018x}"), %labels, "series created in head");
        Ok(true)
    }

    /// Append a sorted batch of samples to a registered series.
    ///
    /// Re-validates the acceptance window under the shard write lock (a
    /// concurrent batch may have advanced `max_ts` since
    /// [`Head::check_append`]); rejection is all-or-nothing.
    pub fn append(&self, fingerprint: u64, samples: &[Sample]) -> Result<(), HeadError> {
        let mut shard = self.write_shard(fingerprint)?;
        let series = shard.get_mut(&fingerprint).ok_or_else(|| {
            HeadError::Internal(format!("append to unregistered series {fingerprint:#018x}"))
        })?;

        if series.max_ts != i64::MIN {
            let min_accepted = series.max_ts - self.out_of_order_window_ms;
            for sample in samples {
                if sample.timestamp < min_accepted {
                    return Err(HeadError::OutOfOrder {
                        fingerprint,
                        timestamp: sample.timestamp,
                        min_accepted,
                    });
                }
            }
        }

        for sample in samples {
            series.append(*sample)?;
        }

        let (series_min, series_max) = (series.min_ts, series.max_ts);
        drop(shard);

        self.num_samples.fetch_add(samples.len() as u64, Ordering::Relaxed);
        self.approx_bytes
            .fetch_add(samples.len() * std::mem::size_of::<Sample>(), Ordering::Relaxed);
        self.min_time.fetch_min(series_min, Ordering::Relaxed);
        self.max_time.fetch_max(series_max, Ordering::Relaxed);
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Read path
    // --------------------------------------------------------------------------------------------

    /// Candidate fingerprints for a matcher set, via the live postings.
    pub fn series_matching(&self, matchers: &[Matcher]) -> Result<Vec<u64>, HeadError> {
        let postings = self
            .postings
            .read()
            .map_err(|_| HeadError::Internal("postings lock poisoned".into()))?;
        Ok(resolve_matchers(&*postings, matchers))
    }

    /// Encoded chunks of one series overlapping `[min_ts, max_ts]`,
    /// including a snapshot of the open chunk.
    ///
    /// The caller re-checks the returned labels against its matchers;
    /// that re-check is what makes fingerprint collisions harmless.
    pub fn chunks_for(
        &self,
        fingerprint: u64,
        min_ts: i64,
        max_ts: i64,
    ) -> Result<Option<(Labels, Vec<Vec<u8>>)>, HeadError> {
        let shard = self.read_shard(fingerprint)?;
        let Some(series) = shard.get(&fingerprint) else {
            return Ok(None);
        };
        Ok(Some((
            series.labels.clone(),
            series.chunks_overlapping(min_ts, max_ts),
        )))
    }

    /// Label sets of all series matching `matchers`.
    pub fn series_labels(&self, matchers: &[Matcher]) -> Result<Vec<Labels>, HeadError> {
        let mut out = Vec::new();
        for fingerprint in self.series_matching(matchers)? {
            if let Some(labels) = self.labels_of(fingerprint) {
                if matches_all(&labels, matchers) {
                    out.push(labels);
                }
            }
        }
        Ok(out)
    }

    /// All label names present in the head.
    pub fn label_names(&self) -> Result<Vec<String>, HeadError> {
        let postings = self
            .postings
            .read()
            .map_err(|_| HeadError::Internal("postings lock poisoned".into()))?;
        Ok(postings.label_names())
    }

    /// All values of one label name present in the head.
    pub fn label_values(&self, name: &str) -> Result<Vec<String>, HeadError> {
        let postings = self
            .postings
            .read()
            .map_err(|_| HeadError::Internal("postings lock poisoned".into()))?;
        Ok(postings.label_values(name))
    }

    // --------------------------------------------------------------------------------------------
    // Stats & lifecycle
    // --------------------------------------------------------------------------------------------

    /// True when no samples have been accepted.
    pub fn is_empty(&self) -> bool {
        self.num_samples.load(Ordering::Relaxed) == 0
    }

    /// Total accepted samples.
    pub fn num_samples(&self) -> u64 {
        self.num_samples.load(Ordering::Relaxed)
    }

    /// Number of registered series.
    pub fn num_series(&self) -> usize {
        self.postings
            .read()
            .map(|p| p.num_series())
            .unwrap_or(0)
    }

    /// Approximate in-memory footprint in bytes.
    pub fn approx_bytes(&self) -> usize {
        self.approx_bytes.load(Ordering::Relaxed)
    }

    /// Smallest accepted timestamp, if any.
    pub fn min_time(&self) -> Option<i64> {
        let v = self.min_time.load(Ordering::Relaxed);
        (v != i64::MAX).then_some(v)
    }

    /// Largest accepted timestamp, if any.
    pub fn max_time(&self) -> Option<i64> {
        let v = self.max_time.load(Ordering::Relaxed);
        (v != i64::MIN).then_some(v)
    }

    /// Clock reading at creation; feeds the age-based flush trigger.
    pub fn created_at_ms(&self) -> i64 {
        self.created_at_ms
    }

    /// Snapshot every series, sealing a copy of each open chunk.
    ///
    /// Non-destructive: readers that still hold this head keep seeing its
    /// data until the flushed block becomes visible and the head is
    /// dropped (duplicate samples across that window deduplicate by
    /// timestamp on the query path). Intended for a head that has been
    /// swapped out and is write-quiescent. Series with zero samples are
    /// skipped.
    pub fn snapshot_series(&self) -> Result<Vec<FrozenSeries>, HeadError> {
        let mut out = Vec::new();
        for shard in &self.shards {
            let shard = shard
                .read()
                .map_err(|_| HeadError::Internal("shard lock poisoned".into()))?;
            for (fingerprint, series) in shard.iter() {
                let mut chunks = series.sealed.clone();
                if !series.open.is_empty() {
                    let first = series.open.first_timestamp().unwrap_or(0);
                    let last = series.open.last_timestamp().unwrap_or(0);
                    chunks.push(SealedChunk {
                        bytes: series.open.encode(),
                        min_ts: first.min(last),
                        max_ts: first.max(last),
                        samples: series.open.num_samples() as u32,
                    });
                }
                if chunks.is_empty() {
                    continue;
                }
                out.push(FrozenSeries {
                    fingerprint: *fingerprint,
                    labels: series.labels.clone(),
                    chunks,
                    min_ts: series.min_ts,
                    max_ts: series.max_ts,
                });
            }
        }
        out.sort_by_key(|s| s.fingerprint);
        Ok(out)
    }
}

impl std::fmt::Debug for Head {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Head")
            .field("num_series", &self.num_series())
            .field("num_samples", &self.num_samples())
            .field("approx_bytes", &self.approx_bytes())
            .finish_non_exhaustive()
    }
}
