//! Leveled compaction — merge adjacent blocks into larger ones.
//!
//! Flush outputs are **level-0** blocks spanning roughly one flush
//! interval each. Whenever three or more time-adjacent blocks of the
//! same level exist, they merge into a single block one level up, so a
//! level-L block covers on the order of `base_span · 3^L`. Compaction
//! stops at a configurable maximum level.
//!
//! # Mechanics
//!
//! 1. [`plan`] inspects the current block list and picks the first run of
//!    three adjacent same-level blocks below the level cap.
//! 2. [`compact`] opens the sources read-only and merges the union of
//!    their series in time order. A timestamp duplicated *across*
//!    sources is the same data persisted twice (a crash between the
//!    destination rename and the source deletion) and resolves to the
//!    newest source; equal timestamps *within* one source are distinct
//!    accepted samples and all survive. The result is re-chunked at the
//!    codec's target size and published atomically.
//! 3. The caller (the engine) swaps its block list and only then deletes
//!    the sources via the two-phase `.trash/` rename.
//!
//! A crash before the destination rename leaves the sources untouched; a
//! crash after it leaves redundant data that queries deduplicate and the
//! next compaction or retention pass removes.

#[cfg(test)]
mod tests;

use std::{path::Path, sync::Arc};

use thiserror::Error;
use tracing::{debug, info};

use crate::block::{Block, BlockError, BlockMeta, BlockWriter};
use crate::chunk::{ChunkAppender, ChunkError, Sample};
use crate::engine::merge::SampleMerger;
use crate::head::SealedChunk;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by compaction.
#[derive(Debug, Error)]
pub enum CompactError {
    /// Block read/write failure.
    #[error("block error: {0}")]
    Block(#[from] BlockError),

    /// Chunk re-encoding failure.
    #[error("chunk error: {0}")]
    Chunk(#[from] ChunkError),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ------------------------------------------------------------------------------------------------
// Planning
// ------------------------------------------------------------------------------------------------

/// Minimum run of adjacent same-level blocks that triggers a merge.
pub const MIN_MERGE_RUN: usize = 3;

/// A selected compaction: which blocks to merge and the output level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionPlan {
    /// ULIDs of the source blocks, in time order.
    pub sources: Vec<String>,

    /// Level of the block to produce (`source level + 1`).
    pub target_level: u32,
}

/// Pick the next compaction, if any.
///
/// Scans levels bottom-up; within a level, blocks are ordered by
/// `min_time` and the first [`MIN_MERGE_RUN`] consecutive blocks form
/// the plan. Blocks at `max_level` are never merged further.
pub fn plan(blocks: &[Arc<Block>], max_level: u32) -> Option<CompactionPlan> {
    for level in 0..max_level {
        let mut candidates: Vec<&Arc<Block>> =
            blocks.iter().filter(|b| b.level() == level).collect();
        if candidates.len() < MIN_MERGE_RUN {
            continue;
        }
        candidates.sort_by_key(|b| (b.min_time(), b.ulid().to_string()));

        let run = &candidates[..MIN_MERGE_RUN];
        let plan = CompactionPlan {
            sources: run.iter().map(|b| b.ulid().to_string()).collect(),
            target_level: level + 1,
        };
        debug!(level, sources = ?plan.sources, "compaction planned");
        return Some(plan);
    }
    None
}

// ------------------------------------------------------------------------------------------------
// Execution
// ------------------------------------------------------------------------------------------------

/// Outcome of a successful compaction.
#[derive(Debug)]
pub struct CompactResult {
    /// Metadata of the published destination block.
    pub meta: BlockMeta,

    /// Corrupt chunks skipped while reading the sources.
    pub corrupt_chunks: usize,
}

/// Merge `sources` into one block at `target_level`.
///
/// Sources must be given oldest-first (creation order); when two sources
/// carry a sample at the same `(series, timestamp)`, the later source
/// wins. The destination is published atomically; sources are left for
/// the caller to delete.
pub fn compact(
    blocks_dir: &Path,
    sources: &[Arc<Block>],
    target_level: u32,
) -> Result<CompactResult, CompactError> {
    let source_ulids: Vec<String> = sources.iter().map(|b| b.ulid().to_string()).collect();
    info!(sources = ?source_ulids, target_level, "compaction started");

    // Union of fingerprints across all sources, sorted for deterministic
    // output order.
    let mut fingerprints: Vec<u64> = sources
        .iter()
        .flat_map(|b| b.series_matching(&[]))
        .collect();
    fingerprints.sort_unstable();
    fingerprints.dedup();

    let mut writer = BlockWriter::new(blocks_dir, target_level, source_ulids)?;
    let mut corrupt_chunks = 0usize;

    for fingerprint in fingerprints {
        let mut labels = None;
        // Sources are fed oldest-first; the merger keeps same-source
        // equal timestamps and collapses cross-source overlap to the
        // newest copy.
        let mut merger = SampleMerger::new();

        for (rank, source) in sources.iter().enumerate() {
            if labels.is_none() {
                labels = source.labels_of(fingerprint).cloned();
            }
            let fetch = source.chunks_for(fingerprint, i64::MIN, i64::MAX);
            corrupt_chunks += fetch.corrupt_chunks;
            for sample in fetch.samples {
                merger.push(rank as u32, sample);
            }
        }

        let Some(labels) = labels else {
            continue;
        };
        if merger.is_empty() {
            continue;
        }

        let chunks = rechunk(merger.into_samples().into_iter())?;
        writer.add_series(fingerprint, labels, &chunks)?;
    }

    let meta = writer.commit()?;
    info!(ulid = %meta.ulid, level = meta.compaction.level, corrupt_chunks, "compaction finished");
    Ok(CompactResult {
        meta,
        corrupt_chunks,
    })
}

/// Re-encode an ordered sample stream into target-sized chunks.
pub fn rechunk(samples: impl Iterator<Item = Sample>) -> Result<Vec<SealedChunk>, ChunkError> {
    let mut chunks = Vec::new();
    let mut appender = ChunkAppender::new();

    for sample in samples {
        if appender.is_full() {
            chunks.push(seal(std::mem::take(&mut appender)));
        }
        appender.append(sample)?;
    }
    if !appender.is_empty() {
        chunks.push(seal(appender));
    }
    Ok(chunks)
}

fn seal(appender: ChunkAppender) -> SealedChunk {
    let first = appender.first_timestamp().unwrap_or(0);
    let last = appender.last_timestamp().unwrap_or(0);
    let samples = appender.num_samples() as u32;
    SealedChunk {
        bytes: appender.finish(),
        min_ts: first.min(last),
        max_ts: first.max(last),
        samples,
    }
}
