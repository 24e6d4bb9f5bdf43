//! Immutable on-disk blocks — the durable unit of storage.
//!
//! A block is a directory `blocks/<ULID>/` covering a contiguous time
//! range `[min_time, max_time]`:
//!
//! ```text
//! blocks/01J8…9ZQ/
//!   meta.json   — identity, bounds, stats, compaction lineage
//!   chunks      — concatenated chunk frames
//!   index       — label index + per-series chunk directory
//! ```
//!
//! Each frame in `chunks` is `| len: u32 LE | crc32c: u32 LE | bytes |`;
//! the CRC covers the encoded chunk bytes. `meta.json` is the JSON
//! document described by [`BlockMeta`]; the `index` format lives in
//! [`crate::index`].
//!
//! # Atomicity
//!
//! [`BlockWriter`] stages everything under `blocks/<ULID>.tmp/`, fsyncs
//! the files and the directory, and publishes with a single rename. A
//! block directory therefore either exists completely or not at all — a
//! crash mid-build leaves only a `.tmp` directory that the engine sweeps
//! on open.
//!
//! # Corruption handling
//!
//! A chunk frame that fails its bounds check or checksum is skipped with
//! a warning and counted; the rest of the block stays readable. A block
//! whose `meta.json` or `index` cannot be decoded is quarantined to
//! `.trash/` by the engine and dropped from the block list.


use std::{
    fs::{self, File, OpenOptions},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
};

use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::chunk::{self, Sample};
use crate::head::SealedChunk;
use crate::index::{
    ChunkMeta, IndexData, IndexError, IndexReader, PostingSource, SeriesEntry, resolve_matchers,
};
use crate::labels::{Labels, Matcher};

/// Block directory name under the data dir.
pub const BLOCKS_DIR: &str = "blocks";

/// Two-phase delete staging directory under the data dir.
pub const TRASH_DIR: &str = ".trash";

/// Suffix of in-progress block directories.
pub const TMP_SUFFIX: &str = ".tmp";

const META_FILENAME: &str = "meta.json";
const CHUNKS_FILENAME: &str = "chunks";
const INDEX_FILENAME: &str = "index";

/// Chunk frame overhead: length prefix + checksum.
const FRAME_OVERHEAD: u64 = 8;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by block reading and writing.
#[derive(Debug, Error)]
pub enum BlockError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// `meta.json` failed to parse or serialize.
    #[error("meta.json error: {0}")]
    Meta(#[from] serde_json::Error),

    /// Index file failure.
    #[error("index error: {0}")]
    Index(#[from] IndexError),

    /// Structurally invalid block.
    #[error("corrupt block: {0}")]
    Corrupt(String),
}

// ------------------------------------------------------------------------------------------------
// meta.json
// ------------------------------------------------------------------------------------------------

/// Aggregate counters stored in `meta.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockStats {
    /// Total samples across all chunks.
    pub num_samples: u64,

    /// Number of series.
    pub num_series: u64,

    /// Number of chunk frames.
    pub num_chunks: u64,
}

/// Compaction lineage stored in `meta.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockCompaction {
    /// Compaction level; flush outputs are level 0.
    pub level: u32,

    /// ULIDs of the source blocks this block was compacted from.
    pub sources: Vec<String>,
}

/// The `meta.json` document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMeta {
    /// Format version; currently 1.
    pub version: u32,

    /// Block identity — also the directory name.
    pub ulid: String,

    /// Smallest sample timestamp in the block (inclusive).
    pub min_time: i64,

    /// Largest sample timestamp in the block (inclusive).
    pub max_time: i64,

    /// Aggregate counters.
    pub stats: BlockStats,

    /// Compaction lineage.
    pub compaction: BlockCompaction,
}

impl BlockMeta {
    /// Basic internal-consistency check applied on open.
    fn validate(&self) -> Result<(), BlockError> {
        if self.version != 1 {
            return Err(BlockError::Corrupt(format!(
                "unsupported meta version {}",
                self.version
            )));
        }
        if self.max_time < self.min_time {
            return Err(BlockError::Corrupt("max_time < min_time".into()));
        }
        if self.stats.num_series == 0 || self.stats.num_samples < self.stats.num_series {
            return Err(BlockError::Corrupt("implausible stats counters".into()));
        }
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// BlockWriter
// ------------------------------------------------------------------------------------------------

/// Builds a new block in a temp directory and publishes it atomically.
///
/// Series must be added in any order but each at most once; `commit`
/// writes the index, the metadata, fsyncs everything, and renames the
/// temp directory into place.
pub struct BlockWriter {
    blocks_dir: PathBuf,
    tmp_dir: PathBuf,
    ulid: String,
    level: u32,
    sources: Vec<String>,

    chunks: BufWriter<File>,
    offset: u64,
    series: Vec<SeriesEntry>,

    min_time: i64,
    max_time: i64,
    num_samples: u64,
    num_chunks: u64,

    committed: bool,
}

impl BlockWriter {
    /// Start a new block under `blocks_dir` with a fresh ULID.
    pub fn new(
        blocks_dir: impl Into<PathBuf>,
        level: u32,
        sources: Vec<String>,
    ) -> Result<Self, BlockError> {
        let blocks_dir = blocks_dir.into();
        let ulid = Ulid::new().to_string();
        let tmp_dir = blocks_dir.join(format!("{ulid}{TMP_SUFFIX}"));
        fs::create_dir_all(&tmp_dir)?;

        let chunks_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(tmp_dir.join(CHUNKS_FILENAME))?;

        debug!(ulid, level, "block build started");

        Ok(Self {
            blocks_dir,
            tmp_dir,
            ulid,
            level,
            sources,
            chunks: BufWriter::new(chunks_file),
            offset: 0,
            series: Vec::new(),
            min_time: i64::MAX,
            max_time: i64::MIN,
            num_samples: 0,
            num_chunks: 0,
            committed: false,
        })
    }

    /// ULID of the block being built.
    pub fn ulid(&self) -> &str {
        &self.ulid
    }

    /// Append one series and all of its chunks.
    pub fn add_series(
        &mut self,
        fingerprint: u64,
        labels: Labels,
        chunks: &[SealedChunk],
    ) -> Result<(), BlockError> {
        let mut metas = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let len = u32::try_from(chunk.bytes.len())
                .map_err(|_| BlockError::Corrupt("chunk exceeds u32::MAX bytes".into()))?;
            let crc = crc32c::crc32c(&chunk.bytes);

            self.chunks.write_all(&len.to_le_bytes())?;
            self.chunks.write_all(&crc.to_le_bytes())?;
            self.chunks.write_all(&chunk.bytes)?;

            metas.push(ChunkMeta {
                min_ts: chunk.min_ts,
                max_ts: chunk.max_ts,
                offset: self.offset,
                len,
                samples: chunk.samples,
            });

            self.offset += FRAME_OVERHEAD + u64::from(len);
            self.num_chunks += 1;
            self.num_samples += u64::from(chunk.samples);
            self.min_time = self.min_time.min(chunk.min_ts);
            self.max_time = self.max_time.max(chunk.max_ts);
        }

        self.series.push(SeriesEntry {
            fingerprint,
            labels,
            chunks: metas,
        });
        Ok(())
    }

    /// Finish the block: write index + meta, fsync, rename into place.
    ///
    /// Fails if no series were added — empty blocks are never published.
    pub fn commit(mut self) -> Result<BlockMeta, BlockError> {
        if self.series.is_empty() {
            return Err(BlockError::Corrupt("refusing to commit empty block".into()));
        }

        self.chunks.flush()?;
        self.chunks.get_ref().sync_all()?;

        // Index file.
        let index_data = IndexData::from_series(std::mem::take(&mut self.series));
        let index_bytes = crate::index::encode_index_file(&index_data)?;
        write_file_durable(&self.tmp_dir.join(INDEX_FILENAME), &index_bytes)?;

        // meta.json.
        let meta = BlockMeta {
            version: 1,
            ulid: self.ulid.clone(),
            min_time: self.min_time,
            max_time: self.max_time,
            stats: BlockStats {
                num_samples: self.num_samples,
                num_series: index_data.series.len() as u64,
                num_chunks: self.num_chunks,
            },
            compaction: BlockCompaction {
                level: self.level,
                sources: std::mem::take(&mut self.sources),
            },
        };
        let meta_bytes = serde_json::to_vec_pretty(&meta)?;
        write_file_durable(&self.tmp_dir.join(META_FILENAME), &meta_bytes)?;

        // Make the directory entry set durable, then publish.
        fsync_dir(&self.tmp_dir)?;
        let final_dir = self.blocks_dir.join(&self.ulid);
        fs::rename(&self.tmp_dir, &final_dir)?;
        fsync_dir(&self.blocks_dir)?;
        self.committed = true;

        info!(
            ulid = %meta.ulid,
            min_time = meta.min_time,
            max_time = meta.max_time,
            series = meta.stats.num_series,
            samples = meta.stats.num_samples,
            level = meta.compaction.level,
            "block committed"
        );
        Ok(meta)
    }
}

impl Drop for BlockWriter {
    fn drop(&mut self) {
        if !self.committed {
            // Abandoned build: remove the staging directory.
            let _ = fs::remove_dir_all(&self.tmp_dir);
        }
    }
}

fn write_file_durable(path: &Path, bytes: &[u8]) -> Result<(), BlockError> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(())
}

/// Fsync a directory so its entries survive a crash.
pub fn fsync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

// ------------------------------------------------------------------------------------------------
// Block reader
// ------------------------------------------------------------------------------------------------

/// Result of fetching one series' samples from a block.
#[derive(Debug, Default)]
pub struct ChunkFetch {
    /// Decoded samples from every intact chunk that overlapped the range.
    pub samples: Vec<Sample>,

    /// Number of chunks skipped due to corruption.
    pub corrupt_chunks: usize,
}

/// An opened, validated, memory-mapped block.
pub struct Block {
    dir: PathBuf,
    meta: BlockMeta,
    index: IndexReader,
    chunks: Mmap,
}

impl Block {
    /// Open the block directory, validating `meta.json` and the index.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, BlockError> {
        let dir = dir.into();

        let meta_bytes = fs::read(dir.join(META_FILENAME))?;
        let meta: BlockMeta = serde_json::from_slice(&meta_bytes)?;
        meta.validate()?;

        let dir_name = dir.file_name().and_then(|n| n.to_str()).unwrap_or("");
        if dir_name != meta.ulid {
            return Err(BlockError::Corrupt(format!(
                "directory {dir_name:?} does not match meta ulid {:?}",
                meta.ulid
            )));
        }

        let index = IndexReader::open(&dir.join(INDEX_FILENAME))?;

        let chunks_file = File::open(dir.join(CHUNKS_FILENAME))?;
        // Read-only map over an immutable, committed file. Every access
        // below is bounds-checked against the map length first.
        let chunks = unsafe { Mmap::map(&chunks_file)? };

        debug!(ulid = %meta.ulid, dir = %dir.display(), "block opened");
        Ok(Self {
            dir,
            meta,
            index,
            chunks,
        })
    }

    /// Block identity.
    pub fn ulid(&self) -> &str {
        &self.meta.ulid
    }

    /// Parsed metadata.
    pub fn meta(&self) -> &BlockMeta {
        &self.meta
    }

    /// Directory this block lives in.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Smallest covered timestamp.
    pub fn min_time(&self) -> i64 {
        self.meta.min_time
    }

    /// Largest covered timestamp.
    pub fn max_time(&self) -> i64 {
        self.meta.max_time
    }

    /// Compaction level.
    pub fn level(&self) -> u32 {
        self.meta.compaction.level
    }

    /// True when the block's range intersects `[min_ts, max_ts]`.
    pub fn overlaps(&self, min_ts: i64, max_ts: i64) -> bool {
        self.meta.min_time <= max_ts && min_ts <= self.meta.max_time
    }

    /// Candidate fingerprints for a matcher set within this block.
    pub fn series_matching(&self, matchers: &[Matcher]) -> Vec<u64> {
        resolve_matchers(&self.index, matchers)
    }

    /// Label set of one series, if present.
    pub fn labels_of(&self, fingerprint: u64) -> Option<&Labels> {
        self.index.series(fingerprint).map(|s| &s.labels)
    }

    /// All label names in this block.
    pub fn label_names(&self) -> Vec<String> {
        self.index.label_names()
    }

    /// All values of `name` in this block.
    pub fn label_values(&self, name: &str) -> Vec<String> {
        self.index.label_values(name)
    }

    /// Fetch and decode every chunk of `fingerprint` that overlaps
    /// `[min_ts, max_ts]`.
    ///
    /// Corrupt frames are skipped and counted; samples outside the range
    /// are included (the caller trims while merging).
    pub fn chunks_for(&self, fingerprint: u64, min_ts: i64, max_ts: i64) -> ChunkFetch {
        let mut fetch = ChunkFetch::default();
        let Some(series) = self.index.series(fingerprint) else {
            return fetch;
        };

        for meta in &series.chunks {
            if !meta.overlaps(min_ts, max_ts) {
                continue;
            }
            match self.read_chunk(meta) {
                Ok(mut samples) => fetch.samples.append(&mut samples),
                Err(reason) => {
                    warn!(
                        ulid = %self.meta.ulid,
                        fingerprint = format_args!("{fingerprint:#018x}"),
                        offset = meta.offset,
                        reason,
                        "skipping corrupt chunk"
                    );
                    fetch.corrupt_chunks += 1;
                }
            }
        }
        fetch
    }

    /// Read, verify, and decode one chunk frame.
    fn read_chunk(&self, meta: &ChunkMeta) -> Result<Vec<Sample>, String> {
        let file_len = self.chunks.len() as u64;
        let frame_end = meta
            .offset
            .checked_add(FRAME_OVERHEAD + u64::from(meta.len))
            .ok_or("frame offset overflow")?;
        if frame_end > file_len {
            return Err(format!(
                "frame [{}, {frame_end}) exceeds chunks file length {file_len}",
                meta.offset
            ));
        }

        let start = meta.offset as usize;
        let stored_len = u32::from_le_bytes([
            self.chunks[start],
            self.chunks[start + 1],
            self.chunks[start + 2],
            self.chunks[start + 3],
        ]);
        if stored_len != meta.len {
            return Err(format!(
                "frame length mismatch (stored {stored_len}, index {})",
                meta.len
            ));
        }
        let stored_crc = u32::from_le_bytes([
            self.chunks[start + 4],
            self.chunks[start + 5],
            self.chunks[start + 6],
            self.chunks[start + 7],
        ]);

        let bytes = &self.chunks[start + 8..start + 8 + meta.len as usize];
        let computed = crc32c::crc32c(bytes);
        if computed != stored_crc {
            return Err(format!(
                "checksum mismatch (stored {stored_crc:08x}, computed {computed:08x})"
            ));
        }

        chunk::decode(bytes).map_err(|e| e.to_string())
    }
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("ulid", &self.meta.ulid)
            .field("min_time", &self.meta.min_time)
            .field("max_time", &self.meta.max_time)
            .field("level", &self.meta.compaction.level)
            .finish_non_exhaustive()
    }
}

// ------------------------------------------------------------------------------------------------
// Discovery and two-phase delete
// ------------------------------------------------------------------------------------------------

/// A block directory found during discovery.
#[derive(Debug)]
pub enum Discovered {
    /// Successfully opened.
    Ok(Block),

    /// Could not be opened; the caller should quarantine it.
    Damaged {
        /// Offending directory.
        dir: PathBuf,
        /// Why opening failed.
        error: BlockError,
    },
}

/// Scan `blocks/` for block directories.
///
/// Leftover `.tmp` staging directories from a crashed build are removed.
/// Directories whose name is not a valid ULID are ignored.
pub fn discover(blocks_dir: &Path) -> Result<Vec<Discovered>, BlockError> {
    let mut found = Vec::new();
    for entry in fs::read_dir(blocks_dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };

        if name.ends_with(TMP_SUFFIX) {
            info!(dir = %path.display(), "removing abandoned block staging directory");
            fs::remove_dir_all(&path)?;
            continue;
        }
        if Ulid::from_string(name).is_err() {
            continue;
        }

        match Block::open(&path) {
            Ok(block) => found.push(Discovered::Ok(block)),
            Err(error) => found.push(Discovered::Damaged { dir: path, error }),
        }
    }

    // ULIDs sort lexicographically by creation time.
    found.sort_by(|a, b| {
        let key = |d: &Discovered| match d {
            Discovered::Ok(block) => block.ulid().to_string(),
            Discovered::Damaged { dir, .. } => dir
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("")
                .to_string(),
        };
        key(a).cmp(&key(b))
    });
    Ok(found)
}

/// Two-phase delete: rename into `.trash/`, then unlink.
///
/// The rename is the commit point — once a block leaves `blocks/` it is
/// invisible to discovery even if the process dies before the unlink.
pub fn delete_via_trash(data_dir: &Path, block_dir: &Path) -> io::Result<()> {
    let trash = data_dir.join(TRASH_DIR);
    fs::create_dir_all(&trash)?;

    let name = block_dir
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "block dir has no name"))?;
    let staged = trash.join(name);

    fs::rename(block_dir, &staged)?;
    fs::remove_dir_all(&staged)?;
    debug!(dir = %block_dir.display(), "block deleted via trash");
    Ok(())
}

/// Remove anything left in `.trash/` by a previous crash.
pub fn sweep_trash(data_dir: &Path) -> io::Result<()> {
    let trash = data_dir.join(TRASH_DIR);
    if !trash.exists() {
        return Ok(());
    }
    for entry in fs::read_dir(&trash)? {
        let path = entry?.path();
        if path.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}
