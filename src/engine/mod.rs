//! # Time-Series Storage Engine
//!
//! This module implements the **crash-safe** engine that orchestrates the
//! head, WAL, blocks, compaction, and retention into one coherent store.
//!
//! ## Design Overview
//!
//! Data lives in two places, queried together:
//!
//! 1. **Head** — the sharded in-memory buffer holding everything since
//!    the last flush, backed by the WAL for durability.
//! 2. **Blocks** — immutable on-disk directories, each covering a
//!    contiguous time range.
//!
//! Inserts go WAL-first, then into the head. A flush atomically swaps in
//! a fresh head, seals the old one into a new level-0 block, and
//! truncates the WAL segments the block now covers. Background loops
//! flush by age/size, merge blocks (leveled compaction), and drop blocks
//! past the retention horizon.
//!
//! ## Concurrency Model
//!
//! - `insert` holds a **read** lock on the head slot across its WAL
//!   append and head append; `flush` takes the **write** lock only for
//!   the instant of the head swap and WAL roll. Insert-to-query
//!   visibility is therefore happens-before, and a flush can never tear
//!   an in-flight insert.
//! - Queries clone `Arc`s of the head and the block list and then run
//!   lock-free; retention deleting a block's files does not disturb
//!   readers that still hold the block (its chunks stay memory-mapped).
//! - The block list is read-mostly: flush/compaction/retention build a
//!   new `Arc<Vec<…>>` and swap it.
//! - Background loops are owned threads with a shutdown channel, joined
//!   by [`Tsdb::close`].
//!
//! ## Guarantees
//!
//! - **Durability:** with [`SyncPolicy::Always`] every acknowledged
//!   insert survives a crash; with interval syncing at most one sync
//!   interval of acknowledged inserts can be lost.
//! - **Recovery:** on open, blocks are discovered (damaged ones
//!   quarantined to `.trash/`) and the WAL is replayed into a fresh head,
//!   skipping samples already covered by blocks.
//! - **Atomic visibility:** blocks appear only via rename; at no point
//!   does a visible block lack its `meta.json`, `chunks`, or `index`.
//! - **Lossless reads:** queries return every accepted sample, including
//!   several at the same timestamp within one series; only a timestamp
//!   persisted twice across tiers (the overlap window of a flush or
//!   compaction) collapses to its newest copy — see [`merge`].
//! - **Degraded mode:** background failures log, count, and retry with
//!   exponential backoff; past
//!   [`MAX_CONSECUTIVE_BACKGROUND_FAILURES`] consecutive failures,
//!   `insert` rejects with an I/O error until a background tick
//!   succeeds again.

pub mod clock;
pub mod merge;
pub mod metrics;

pub use clock::{Clock, ManualClock, SystemClock};
pub use merge::SampleMerger;
pub use metrics::Metrics;

#[cfg(test)]
mod tests;

use std::{
    fs,
    io,
    path::PathBuf,
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering},
    },
    thread::JoinHandle,
    time::Duration,
};

use crossbeam::channel::{self, Receiver};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::block::{self, Block, BlockError, BlockWriter, Discovered};
use crate::chunk::{self, Sample};
use crate::compact::{self, CompactError};
use crate::head::{Head, HeadError};
use crate::labels::{Labels, Matcher, matches_all};
use crate::wal::{self, SyncPolicy, Wal, WalError, WalRecord};

/// WAL directory name under the data dir.
pub const WAL_DIR: &str = "wal";

/// Cadence of the flush trigger check.
const FLUSH_CHECK_INTERVAL: Duration = Duration::from_millis(500);

/// Consecutive background failures tolerated before writes start
/// rejecting with an I/O error.
pub const MAX_CONSECUTIVE_BACKGROUND_FAILURES: u32 = 5;

/// Ceiling for the background loops' exponential retry backoff.
const MAX_BACKGROUND_BACKOFF: Duration = Duration::from_secs(300);

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors surfaced by engine operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TsdbError {
    /// Malformed labels, matchers, or an inverted time range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A sample was older than the series' acceptance window.
    #[error(
        "out-of-order sample for series {fingerprint:#018x}: ts {timestamp} < min accepted {min_accepted}"
    )]
    OutOfOrder {
        /// Affected series.
        fingerprint: u64,
        /// Rejected timestamp.
        timestamp: i64,
        /// Oldest accepted timestamp at rejection time.
        min_accepted: i64,
    },

    /// Underlying disk or filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// WAL failure.
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),

    /// Block failure.
    #[error("block error: {0}")]
    Block(#[from] BlockError),

    /// Compaction failure.
    #[error("compaction error: {0}")]
    Compact(#[from] CompactError),

    /// Operation on a closed engine.
    #[error("engine is closed")]
    Closed,

    /// The caller's cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,

    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<HeadError> for TsdbError {
    fn from(e: HeadError) -> Self {
        match e {
            HeadError::OutOfOrder {
                fingerprint,
                timestamp,
                min_accepted,
            } => Self::OutOfOrder {
                fingerprint,
                timestamp,
                min_accepted,
            },
            HeadError::FingerprintCollision { .. } => Self::InvalidArgument(e.to_string()),
            other => Self::Internal(other.to_string()),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Options
// ------------------------------------------------------------------------------------------------

/// Configuration for a [`Tsdb`] instance.
#[derive(Debug, Clone)]
pub struct Options {
    /// Root directory for all engine state. Required.
    pub data_dir: PathBuf,

    /// Blocks whose `max_time` is older than this are deleted.
    /// `Duration::ZERO` disables retention regardless of
    /// [`Options::enable_retention`].
    pub retention_period: Duration,

    /// Run the background compaction loop.
    pub enable_compaction: bool,

    /// Run the background retention loop.
    pub enable_retention: bool,

    /// Head age that triggers a flush.
    pub flush_interval: Duration,

    /// Cadence of the compaction loop.
    pub compaction_interval: Duration,

    /// Cadence of the retention loop.
    pub retention_interval: Duration,

    /// Head size (approximate bytes) that triggers a flush.
    pub memtable_size: usize,

    /// WAL durability policy.
    pub wal_sync: SyncPolicy,

    /// Per-series acceptance window for out-of-order samples.
    pub out_of_order_window: Duration,

    /// Blocks at this compaction level are never merged further.
    pub max_compaction_level: u32,
}

impl Options {
    /// Defaults for everything except `data_dir`.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            retention_period: Duration::from_secs(15 * 24 * 60 * 60),
            enable_compaction: true,
            enable_retention: true,
            flush_interval: Duration::from_secs(30),
            compaction_interval: Duration::from_secs(10 * 60),
            retention_interval: Duration::from_secs(10 * 60),
            memtable_size: 256 * 1024 * 1024,
            wal_sync: SyncPolicy::default(),
            out_of_order_window: Duration::ZERO,
            max_compaction_level: 4,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Query types
// ------------------------------------------------------------------------------------------------

/// Cooperative cancellation flag; cheap to clone and share.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// A fresh, un-cancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Queries observe it between chunks.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    /// True once [`CancelToken::cancel`] has been called.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// Optional query parameters for [`Tsdb::query_with`].
#[derive(Debug, Clone, Default)]
pub struct QueryOpts {
    /// When positive, down-sample to the last sample in each
    /// `[k·step, (k+1)·step)` bucket (instant semantics).
    pub step_ms: i64,

    /// Cancellation token, checked between chunks.
    pub cancel: CancelToken,
}

/// One series in a query result.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesSamples {
    /// Full label set.
    pub labels: Labels,

    /// Samples in ascending timestamp order.
    pub samples: Vec<Sample>,
}

/// Snapshot of engine statistics returned by [`Tsdb::stats`].
#[derive(Debug, Clone, Default)]
pub struct Stats {
    /// Samples across head and blocks.
    pub total_samples: u64,

    /// Series across head and blocks (series spanning a flush boundary
    /// are counted in each place they appear).
    pub total_series: u64,

    /// Number of visible blocks.
    pub num_blocks: usize,

    /// Completed flushes.
    pub flush_count: u64,

    /// Clock reading of the last completed flush, 0 if none.
    pub last_flush_ms: i64,

    /// Total WAL segment bytes on disk.
    pub wal_size: u64,

    /// Approximate head memory footprint in bytes.
    pub head_size: u64,
}

// ------------------------------------------------------------------------------------------------
// Engine internals
// ------------------------------------------------------------------------------------------------

struct Inner {
    opts: Options,
    metrics: Arc<Metrics>,
    clock: Arc<dyn Clock>,

    wal: Wal,

    /// Current head; replaced wholesale by a flush.
    head: RwLock<Arc<Head>>,

    /// Visible blocks sorted by `(min_time, ulid)`; swapped as a unit.
    blocks: RwLock<Arc<Vec<Arc<Block>>>>,

    /// Serializes flushes.
    flush_mutex: Mutex<()>,

    /// Serializes compactions (at most one per data dir).
    compact_mutex: Mutex<()>,

    closed: AtomicBool,
    last_flush_ms: AtomicI64,

    /// Largest `max_time` across all blocks ever flushed. Samples at or
    /// below this are rejected on insert and dropped on replay — they are
    /// already durable in a block, and accepting them again would make
    /// WAL replay ambiguous.
    min_valid_time: AtomicI64,

    /// Consecutive background-tick failures; reset to zero by any
    /// successful tick. Past [`MAX_CONSECUTIVE_BACKGROUND_FAILURES`],
    /// `insert` rejects with an I/O error until a tick succeeds.
    background_failures: AtomicU32,

    blocks_dir: PathBuf,

    /// Background threads, joined on close.
    workers: Mutex<Vec<JoinHandle<()>>>,

    /// Dropping this sender stops every background loop.
    shutdown: Mutex<Option<channel::Sender<()>>>,
}

/// The engine handle.
///
/// Cheap to clone; all clones share one underlying engine. Call
/// [`Tsdb::close`] for a clean shutdown — dropping the last handle also
/// closes, best-effort.
pub struct Tsdb {
    inner: Arc<Inner>,
}

impl Clone for Tsdb {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Tsdb {
    // --------------------------------------------------------------------------------------------
    // Open / close
    // --------------------------------------------------------------------------------------------

    /// Open (or create) an engine with default metrics and the system
    /// clock.
    pub fn open(options: Options) -> Result<Self, TsdbError> {
        Self::open_with(options, Arc::new(Metrics::default()), Arc::new(SystemClock))
    }

    /// Open (or create) an engine with explicit metrics and clock.
    ///
    /// Recovery order: sweep `.trash/`, discover blocks (quarantining
    /// damaged ones), replay the WAL into a fresh head, then start the
    /// background loops.
    pub fn open_with(
        options: Options,
        metrics: Arc<Metrics>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, TsdbError> {
        let data_dir = options.data_dir.clone();
        let wal_dir = data_dir.join(WAL_DIR);
        let blocks_dir = data_dir.join(block::BLOCKS_DIR);
        fs::create_dir_all(&wal_dir)?;
        fs::create_dir_all(&blocks_dir)?;

        block::sweep_trash(&data_dir)?;

        // 1. Discover blocks; quarantine anything that fails to open.
        let mut blocks = Vec::new();
        for discovered in block::discover(&blocks_dir)? {
            match discovered {
                Discovered::Ok(b) => blocks.push(Arc::new(b)),
                Discovered::Damaged { dir, error } => {
                    warn!(dir = %dir.display(), error = %error, "quarantining damaged block");
                    Metrics::inc(&metrics.quarantined_blocks);
                    let trash = data_dir.join(block::TRASH_DIR);
                    fs::create_dir_all(&trash)?;
                    if let Some(name) = dir.file_name() {
                        if let Err(e) = fs::rename(&dir, trash.join(name)) {
                            error!(dir = %dir.display(), error = %e, "quarantine rename failed");
                        }
                    }
                }
            }
        }
        blocks.sort_by(|a, b| {
            (a.min_time(), a.ulid()).cmp(&(b.min_time(), b.ulid()))
        });

        // Samples at or below this are already durable in blocks and are
        // dropped during replay.
        let min_valid_time = blocks.iter().map(|b| b.max_time()).max().unwrap_or(i64::MIN);

        // 2. Replay the WAL into a fresh head, writes suppressed.
        let head = Head::new(
            options.out_of_order_window.as_millis() as i64,
            clock.now_ms(),
        );
        let mut replay = wal::replay(&wal_dir)?;
        let mut replayed_samples = 0u64;
        for record in replay.by_ref() {
            match record? {
                WalRecord::Series {
                    fingerprint,
                    labels,
                } => {
                    if let Err(e) = head.get_or_create(fingerprint, &labels) {
                        warn!(error = %e, "series record rejected during replay");
                    }
                }
                WalRecord::Samples {
                    fingerprint,
                    samples,
                } => {
                    let mut live: Vec<Sample> = samples
                        .into_iter()
                        .filter(|s| s.timestamp > min_valid_time)
                        .collect();
                    if live.is_empty() {
                        continue;
                    }
                    live.sort_by_key(|s| s.timestamp);
                    match head.append(fingerprint, &live) {
                        Ok(()) => replayed_samples += live.len() as u64,
                        Err(HeadError::OutOfOrder { .. }) => {
                            // Live inserts were validated before logging;
                            // hitting this now means replay ordering across
                            // batches, which is safe to drop.
                            debug!(fingerprint, "out-of-order batch dropped during replay");
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }
        Metrics::add(&metrics.corrupt_wal_segments, replay.corruptions());

        info!(
            data_dir = %data_dir.display(),
            blocks = blocks.len(),
            replayed_samples,
            corrupt_segments = replay.corruptions(),
            "engine opened"
        );

        // 3. Start the WAL writer on a fresh segment.
        let wal = Wal::open(&wal_dir, options.wal_sync)?;

        let inner = Arc::new(Inner {
            opts: options,
            metrics,
            clock,
            wal,
            head: RwLock::new(Arc::new(head)),
            blocks: RwLock::new(Arc::new(blocks)),
            flush_mutex: Mutex::new(()),
            compact_mutex: Mutex::new(()),
            closed: AtomicBool::new(false),
            last_flush_ms: AtomicI64::new(0),
            min_valid_time: AtomicI64::new(min_valid_time),
            background_failures: AtomicU32::new(0),
            blocks_dir,
            workers: Mutex::new(Vec::new()),
            shutdown: Mutex::new(None),
        });

        Inner::start_background(&inner)?;
        Ok(Self { inner })
    }

    /// Gracefully shut down: stop background loops, flush the head,
    /// sync the WAL, and fsync directories. Idempotent.
    pub fn close(&self) -> Result<(), TsdbError> {
        self.inner.close()
    }

    // --------------------------------------------------------------------------------------------
    // Write path
    // --------------------------------------------------------------------------------------------

    /// Insert samples for one series.
    ///
    /// Atomic per call: either the whole batch is WAL-durable and in the
    /// head, or nothing is. Samples are sorted by timestamp before
    /// acceptance; the out-of-order window is checked **before** the WAL
    /// write so a rejected batch leaves no trace.
    pub fn insert(&self, series: &Labels, samples: &[Sample]) -> Result<(), TsdbError> {
        let inner = &*self.inner;
        inner.ensure_open()?;

        // Degraded mode: sustained background failures mean the disk is
        // not reliably writable, so stop accepting data that could not
        // be flushed.
        let failures = inner.background_failures.load(Ordering::Acquire);
        if failures > MAX_CONSECUTIVE_BACKGROUND_FAILURES {
            return Err(TsdbError::Io(io::Error::other(format!(
                "rejecting writes after {failures} consecutive background failures"
            ))));
        }

        if series.is_empty() {
            return Err(TsdbError::InvalidArgument("empty label set".into()));
        }
        if samples.is_empty() {
            return Ok(());
        }

        let mut sorted = samples.to_vec();
        sorted.sort_by_key(|s| s.timestamp);
        let fingerprint = series.fingerprint();

        // Samples at or below the flushed horizon are already durable in
        // blocks; re-accepting them would duplicate data on replay.
        let min_valid = self.inner.min_valid_time.load(Ordering::Acquire);
        if min_valid != i64::MIN && sorted[0].timestamp <= min_valid {
            return Err(TsdbError::OutOfOrder {
                fingerprint,
                timestamp: sorted[0].timestamp,
                min_accepted: min_valid + 1,
            });
        }

        // Holding the head read guard across WAL + head append keeps a
        // concurrent flush from swapping the head between the two.
        let head_guard = inner
            .head
            .read()
            .map_err(|_| TsdbError::Internal("head lock poisoned".into()))?;
        let head = &**head_guard;

        head.check_append(fingerprint, &sorted)?;
        let created = !head.contains(fingerprint);

        let mut records = Vec::with_capacity(2);
        if created {
            records.push(WalRecord::Series {
                fingerprint,
                labels: series.clone(),
            });
        }
        records.push(WalRecord::Samples {
            fingerprint,
            samples: sorted.clone(),
        });
        inner.wal.append_batch(&records)?;

        if created && head.get_or_create(fingerprint, series)? {
            Metrics::inc(&inner.metrics.series_created);
        }
        head.append(fingerprint, &sorted)?;
        Metrics::add(&inner.metrics.samples_appended, sorted.len() as u64);
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Read path
    // --------------------------------------------------------------------------------------------

    /// Raw range query over `[min_ts, max_ts]` (both inclusive).
    pub fn query(
        &self,
        matchers: &[Matcher],
        min_ts: i64,
        max_ts: i64,
    ) -> Result<Vec<SeriesSamples>, TsdbError> {
        self.query_with(matchers, min_ts, max_ts, &QueryOpts::default())
    }

    /// Range query with step down-sampling and cancellation.
    pub fn query_with(
        &self,
        matchers: &[Matcher],
        min_ts: i64,
        max_ts: i64,
        opts: &QueryOpts,
    ) -> Result<Vec<SeriesSamples>, TsdbError> {
        let inner = &*self.inner;
        inner.ensure_open()?;
        if min_ts > max_ts {
            return Err(TsdbError::InvalidArgument(format!(
                "inverted time range: {min_ts} > {max_ts}"
            )));
        }

        let head = inner.head_arc()?;
        let blocks = inner.blocks_arc()?;

        // Per-fingerprint accumulation. Tiers are fed in creation (ULID)
        // order with the head last; the merger keeps equal timestamps
        // within one tier and collapses cross-tier overlap to the newest
        // copy.
        let mut acc: std::collections::HashMap<u64, (Labels, SampleMerger)> =
            std::collections::HashMap::new();

        let mut by_ulid: Vec<&Arc<Block>> = blocks.iter().collect();
        by_ulid.sort_by_key(|b| b.ulid().to_string());

        for (rank, blk) in by_ulid.iter().enumerate() {
            let rank = rank as u32;
            if !blk.overlaps(min_ts, max_ts) {
                continue;
            }
            for fingerprint in blk.series_matching(matchers) {
                if opts.cancel.is_cancelled() {
                    return Err(TsdbError::Cancelled);
                }
                let Some(labels) = blk.labels_of(fingerprint) else {
                    continue;
                };
                if !matches_all(labels, matchers) {
                    continue;
                }
                let fetch = blk.chunks_for(fingerprint, min_ts, max_ts);
                Metrics::add(&inner.metrics.corrupt_chunks, fetch.corrupt_chunks as u64);

                let entry = acc
                    .entry(fingerprint)
                    .or_insert_with(|| (labels.clone(), SampleMerger::new()));
                for sample in fetch.samples {
                    if sample.timestamp >= min_ts && sample.timestamp <= max_ts {
                        entry.1.push(rank, sample);
                    }
                }
            }
        }

        let head_rank = by_ulid.len() as u32;
        for fingerprint in head.series_matching(matchers)? {
            if opts.cancel.is_cancelled() {
                return Err(TsdbError::Cancelled);
            }
            let Some((labels, chunks)) = head.chunks_for(fingerprint, min_ts, max_ts)? else {
                continue;
            };
            if !matches_all(&labels, matchers) {
                continue;
            }
            let entry = acc
                .entry(fingerprint)
                .or_insert_with(|| (labels.clone(), SampleMerger::new()));
            for bytes in chunks {
                if opts.cancel.is_cancelled() {
                    return Err(TsdbError::Cancelled);
                }
                match chunk::decode(&bytes) {
                    Ok(samples) => {
                        for sample in samples {
                            if sample.timestamp >= min_ts && sample.timestamp <= max_ts {
                                entry.1.push(head_rank, sample);
                            }
                        }
                    }
                    Err(e) => {
                        warn!(fingerprint, error = %e, "corrupt head chunk skipped");
                        Metrics::inc(&inner.metrics.corrupt_chunks);
                    }
                }
            }
        }

        let mut results: Vec<SeriesSamples> = acc
            .into_values()
            .filter(|(_, merger)| !merger.is_empty())
            .map(|(labels, merger)| {
                let samples = merger.into_samples();
                let samples = if opts.step_ms > 0 {
                    downsample_last(samples, opts.step_ms)
                } else {
                    samples
                };
                SeriesSamples { labels, samples }
            })
            .collect();
        results.sort_by_key(|s| s.labels.to_string());
        Ok(results)
    }

    /// Union of label names across head and blocks, sorted.
    pub fn labels(&self) -> Result<Vec<String>, TsdbError> {
        let inner = &*self.inner;
        inner.ensure_open()?;
        let mut names = inner.head_arc()?.label_names()?;
        for blk in inner.blocks_arc()?.iter() {
            names.extend(blk.label_names());
        }
        names.sort();
        names.dedup();
        Ok(names)
    }

    /// Union of values for one label name across head and blocks, sorted.
    pub fn label_values(&self, name: &str) -> Result<Vec<String>, TsdbError> {
        let inner = &*self.inner;
        inner.ensure_open()?;
        if !crate::labels::is_valid_name(name) {
            return Err(TsdbError::InvalidArgument(format!(
                "invalid label name: {name:?}"
            )));
        }
        let mut values = inner.head_arc()?.label_values(name)?;
        for blk in inner.blocks_arc()?.iter() {
            values.extend(blk.label_values(name));
        }
        values.sort();
        values.dedup();
        Ok(values)
    }

    /// Label sets of every series matching `matchers`, deduplicated.
    pub fn series(&self, matchers: &[Matcher]) -> Result<Vec<Labels>, TsdbError> {
        let inner = &*self.inner;
        inner.ensure_open()?;

        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();

        for labels in inner.head_arc()?.series_labels(matchers)? {
            if seen.insert(labels.fingerprint()) {
                out.push(labels);
            }
        }
        for blk in inner.blocks_arc()?.iter() {
            for fingerprint in blk.series_matching(matchers) {
                if let Some(labels) = blk.labels_of(fingerprint) {
                    if matches_all(labels, matchers) && seen.insert(fingerprint) {
                        out.push(labels.clone());
                    }
                }
            }
        }
        out.sort_by_key(|l| l.to_string());
        Ok(out)
    }

    /// Engine statistics snapshot.
    pub fn stats(&self) -> Result<Stats, TsdbError> {
        let inner = &*self.inner;
        inner.ensure_open()?;
        let head = inner.head_arc()?;
        let blocks = inner.blocks_arc()?;

        let mut total_samples = head.num_samples();
        let mut total_series = head.num_series() as u64;
        for blk in blocks.iter() {
            total_samples += blk.meta().stats.num_samples;
            total_series += blk.meta().stats.num_series;
        }

        Ok(Stats {
            total_samples,
            total_series,
            num_blocks: blocks.len(),
            flush_count: Metrics::get(&inner.metrics.flushes),
            last_flush_ms: inner.last_flush_ms.load(Ordering::Relaxed),
            wal_size: inner.wal.size_bytes()?,
            head_size: head.approx_bytes() as u64,
        })
    }

    // --------------------------------------------------------------------------------------------
    // Maintenance entry points
    // --------------------------------------------------------------------------------------------

    /// Seal the current head into a new level-0 block.
    ///
    /// Returns `true` when a block was written, `false` when the head was
    /// empty. Runs compaction afterwards when enabled.
    pub fn flush(&self) -> Result<bool, TsdbError> {
        self.inner.ensure_open()?;
        let flushed = self.inner.flush()?;
        if flushed && self.inner.opts.enable_compaction {
            if let Err(e) = self.inner.compact_once() {
                warn!(error = %e, "post-flush compaction failed");
                Metrics::inc(&self.inner.metrics.background_errors);
            }
        }
        Ok(flushed)
    }

    /// Run one compaction round. Returns `true` if blocks were merged.
    pub fn compact(&self) -> Result<bool, TsdbError> {
        self.inner.ensure_open()?;
        self.inner.compact_once()
    }

    /// Run one retention round. Returns the number of deleted blocks.
    pub fn retain(&self) -> Result<usize, TsdbError> {
        self.inner.ensure_open()?;
        self.inner.retain_once()
    }
}

impl Drop for Tsdb {
    fn drop(&mut self) {
        // Last handle (plus the background threads' weak refs) going away:
        // close for durability. Errors are logged, not propagated.
        if Arc::strong_count(&self.inner) == 1 {
            if let Err(e) = self.inner.close() {
                error!(error = %e, "engine close failed on drop");
            }
        }
    }
}

impl std::fmt::Debug for Tsdb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tsdb")
            .field("data_dir", &self.inner.opts.data_dir)
            .finish_non_exhaustive()
    }
}

// ------------------------------------------------------------------------------------------------
// Inner implementation
// ------------------------------------------------------------------------------------------------

impl Inner {
    fn ensure_open(&self) -> Result<(), TsdbError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TsdbError::Closed);
        }
        Ok(())
    }

    fn head_arc(&self) -> Result<Arc<Head>, TsdbError> {
        let guard = self
            .head
            .read()
            .map_err(|_| TsdbError::Internal("head lock poisoned".into()))?;
        Ok(Arc::clone(&*guard))
    }

    fn blocks_arc(&self) -> Result<Arc<Vec<Arc<Block>>>, TsdbError> {
        let guard = self
            .blocks
            .read()
            .map_err(|_| TsdbError::Internal("blocks lock poisoned".into()))?;
        Ok(Arc::clone(&*guard))
    }

    /// Swap the visible block list.
    fn swap_blocks(&self, mut blocks: Vec<Arc<Block>>) -> Result<(), TsdbError> {
        blocks.sort_by(|a, b| (a.min_time(), a.ulid()).cmp(&(b.min_time(), b.ulid())));
        let mut slot = self
            .blocks
            .write()
            .map_err(|_| TsdbError::Internal("blocks lock poisoned".into()))?;
        *slot = Arc::new(blocks);
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Flush
    // --------------------------------------------------------------------------------------------

    fn flush(&self) -> Result<bool, TsdbError> {
        let _serialize = self
            .flush_mutex
            .lock()
            .map_err(|_| TsdbError::Internal("flush lock poisoned".into()))?;

        // Swap in a fresh head and roll the WAL while holding the write
        // lock: afterwards, every record of the old head sits in a
        // segment below `cutoff_seq` and new inserts land in the new head.
        let (old_head, cutoff_seq) = {
            let mut slot = self
                .head
                .write()
                .map_err(|_| TsdbError::Internal("head lock poisoned".into()))?;
            if slot.is_empty() {
                return Ok(false);
            }
            let fresh = Arc::new(Head::new(
                self.opts.out_of_order_window.as_millis() as i64,
                self.clock.now_ms(),
            ));
            let old = std::mem::replace(&mut *slot, fresh);
            let cutoff = self.wal.roll()?;
            (old, cutoff)
        };

        let frozen = old_head.snapshot_series()?;
        if frozen.is_empty() {
            self.wal.truncate_before(cutoff_seq)?;
            return Ok(false);
        }

        let mut writer = BlockWriter::new(&self.blocks_dir, 0, Vec::new())?;
        for series in &frozen {
            writer.add_series(series.fingerprint, series.labels.clone(), &series.chunks)?;
        }
        let meta = writer.commit()?;

        let new_block = Arc::new(Block::open(self.blocks_dir.join(&meta.ulid))?);
        let mut blocks = self.blocks_arc()?.as_ref().clone();
        blocks.push(new_block);
        self.swap_blocks(blocks)?;

        // Every sample in segments below the cutoff is now in a durable
        // block, so whole segments can go.
        self.min_valid_time.fetch_max(meta.max_time, Ordering::AcqRel);
        self.wal.truncate_before(cutoff_seq)?;

        Metrics::inc(&self.metrics.flushes);
        self.last_flush_ms
            .store(self.clock.now_ms(), Ordering::Relaxed);
        info!(ulid = %meta.ulid, series = meta.stats.num_series, samples = meta.stats.num_samples, "head flushed");
        Ok(true)
    }

    // --------------------------------------------------------------------------------------------
    // Compaction
    // --------------------------------------------------------------------------------------------

    fn compact_once(&self) -> Result<bool, TsdbError> {
        let Ok(_serialize) = self.compact_mutex.try_lock() else {
            return Ok(false);
        };

        let blocks = self.blocks_arc()?;
        let Some(plan) = compact::plan(&blocks, self.opts.max_compaction_level) else {
            return Ok(false);
        };

        // Resolve sources oldest-first by ULID so the merge's
        // newest-wins rule matches creation order.
        let mut sources: Vec<Arc<Block>> = blocks
            .iter()
            .filter(|b| plan.sources.contains(&b.ulid().to_string()))
            .cloned()
            .collect();
        sources.sort_by_key(|b| b.ulid().to_string());

        let result = compact::compact(&self.blocks_dir, &sources, plan.target_level)?;
        Metrics::add(&self.metrics.corrupt_chunks, result.corrupt_chunks as u64);

        let new_block = Arc::new(Block::open(self.blocks_dir.join(&result.meta.ulid))?);
        let remaining: Vec<Arc<Block>> = self
            .blocks_arc()?
            .iter()
            .filter(|b| !plan.sources.contains(&b.ulid().to_string()))
            .cloned()
            .chain(std::iter::once(new_block))
            .collect();
        self.swap_blocks(remaining)?;

        // Destination is visible and fsynced; sources can go.
        for source in &sources {
            if let Err(e) = block::delete_via_trash(&self.opts.data_dir, source.dir()) {
                warn!(ulid = %source.ulid(), error = %e, "failed to delete compacted source");
            }
        }

        Metrics::inc(&self.metrics.compactions);
        Ok(true)
    }

    // --------------------------------------------------------------------------------------------
    // Retention
    // --------------------------------------------------------------------------------------------

    fn retain_once(&self) -> Result<usize, TsdbError> {
        if self.opts.retention_period.is_zero() {
            return Ok(0);
        }
        let cutoff = self.clock.now_ms() - self.opts.retention_period.as_millis() as i64;

        let blocks = self.blocks_arc()?;
        let (keep, drop): (Vec<_>, Vec<_>) = blocks
            .iter()
            .cloned()
            .partition(|b| b.max_time() >= cutoff);
        if drop.is_empty() {
            return Ok(0);
        }

        self.swap_blocks(keep)?;
        let mut deleted = 0;
        for blk in &drop {
            match block::delete_via_trash(&self.opts.data_dir, blk.dir()) {
                Ok(()) => deleted += 1,
                Err(e) => warn!(ulid = %blk.ulid(), error = %e, "retention delete failed"),
            }
        }
        Metrics::add(&self.metrics.retention_deleted, deleted as u64);
        info!(deleted, cutoff, "retention pass removed expired blocks");
        Ok(deleted)
    }

    // --------------------------------------------------------------------------------------------
    // Background loops
    // --------------------------------------------------------------------------------------------

    fn start_background(inner: &Arc<Inner>) -> Result<(), TsdbError> {
        let (shutdown_tx, shutdown_rx) = channel::bounded::<()>(0);

        let mut workers = Vec::new();
        workers.push(spawn_loop(
            "tempusdb-flush",
            Arc::downgrade(inner),
            shutdown_rx.clone(),
            FLUSH_CHECK_INTERVAL,
            |inner| inner.flush_tick(),
        )?);
        if inner.opts.enable_compaction {
            workers.push(spawn_loop(
                "tempusdb-compact",
                Arc::downgrade(inner),
                shutdown_rx.clone(),
                inner.opts.compaction_interval,
                |inner| inner.compact_once().map(|_| ()),
            )?);
        }
        if inner.opts.enable_retention {
            workers.push(spawn_loop(
                "tempusdb-retention",
                Arc::downgrade(inner),
                shutdown_rx,
                inner.opts.retention_interval,
                |inner| inner.retain_once().map(|_| ()),
            )?);
        }

        *inner
            .workers
            .lock()
            .map_err(|_| TsdbError::Internal("workers lock poisoned".into()))? = workers;
        *inner
            .shutdown
            .lock()
            .map_err(|_| TsdbError::Internal("shutdown lock poisoned".into()))? =
            Some(shutdown_tx);
        Ok(())
    }

    /// Age/size flush trigger, evaluated every [`FLUSH_CHECK_INTERVAL`].
    fn flush_tick(&self) -> Result<(), TsdbError> {
        let head = self.head_arc()?;
        if head.is_empty() {
            return Ok(());
        }
        let age_ms = self.clock.now_ms() - head.created_at_ms();
        let age_due = age_ms >= self.opts.flush_interval.as_millis() as i64;
        let size_due = head.approx_bytes() >= self.opts.memtable_size;
        if !(age_due || size_due) {
            return Ok(());
        }
        drop(head);

        let flushed = self.flush()?;
        if flushed && self.opts.enable_compaction {
            self.compact_once()?;
        }
        Ok(())
    }

    fn close(&self) -> Result<(), TsdbError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!(data_dir = %self.opts.data_dir.display(), "engine closing");

        // 1. Stop background loops and join them.
        if let Ok(mut slot) = self.shutdown.lock() {
            slot.take();
        }
        if let Ok(mut workers) = self.workers.lock() {
            for handle in workers.drain(..) {
                let _ = handle.join();
            }
        }

        // 2. Final flush and WAL shutdown.
        self.flush()?;
        self.wal.sync()?;
        self.wal.close()?;

        // 3. Fsync directories so the final metadata is durable.
        for dir in [
            self.opts.data_dir.join(WAL_DIR),
            self.blocks_dir.clone(),
            self.opts.data_dir.clone(),
        ] {
            if dir.exists() {
                block::fsync_dir(&dir)?;
            }
        }
        Ok(())
    }
}

/// Spawn one background loop: tick at `interval`, exit on shutdown or
/// when the engine is gone.
///
/// A failed tick logs, bumps the engine-wide consecutive-failure
/// counter, and doubles this loop's retry delay (capped at
/// [`MAX_BACKGROUND_BACKOFF`]); a successful tick resets both. The
/// counter is what flips `insert` into write rejection.
fn spawn_loop(
    name: &str,
    inner: std::sync::Weak<Inner>,
    shutdown: Receiver<()>,
    interval: Duration,
    tick: impl Fn(&Inner) -> Result<(), TsdbError> + Send + 'static,
) -> Result<JoinHandle<()>, TsdbError> {
    let handle = std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let mut delay = interval;
            loop {
                match shutdown.recv_timeout(delay) {
                    Err(channel::RecvTimeoutError::Timeout) => {}
                    // Message or sender dropped: shutting down.
                    _ => return,
                }

                let Some(inner) = inner.upgrade() else { return };
                if inner.closed.load(Ordering::Acquire) {
                    return;
                }
                match tick(&inner) {
                    Ok(()) => {
                        inner.background_failures.store(0, Ordering::Release);
                        delay = interval;
                    }
                    Err(e) => {
                        let failures =
                            inner.background_failures.fetch_add(1, Ordering::AcqRel) + 1;
                        Metrics::inc(&inner.metrics.background_errors);
                        delay = delay.saturating_mul(2).min(MAX_BACKGROUND_BACKOFF);
                        warn!(
                            error = %e,
                            failures,
                            retry_in_ms = delay.as_millis() as u64,
                            "background task failed, backing off"
                        );
                    }
                }
            }
        })
        .map_err(TsdbError::Io)?;
    Ok(handle)
}

// ------------------------------------------------------------------------------------------------
// Down-sampling
// ------------------------------------------------------------------------------------------------

/// Keep the last sample in each `[k·step, (k+1)·step)` bucket (instant
/// semantics). Input must be ascending by timestamp.
fn downsample_last(samples: Vec<Sample>, step_ms: i64) -> Vec<Sample> {
    let mut out: Vec<Sample> = Vec::new();
    let mut current_bucket: Option<i64> = None;

    for sample in samples {
        let bucket = sample.timestamp.div_euclid(step_ms);
        if current_bucket == Some(bucket) {
            // Later sample in the same bucket wins.
            if let Some(last) = out.last_mut() {
                *last = sample;
            }
        } else {
            current_bucket = Some(bucket);
            out.push(sample);
        }
    }
    out
}
