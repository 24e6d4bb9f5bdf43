//! Inverted label index — posting lists and matcher resolution.
//!
//! For every `(label_name, label_value)` assignment the index keeps a
//! **posting list**: the sorted fingerprints of all series carrying that
//! assignment. Matchers resolve to candidate series by fetching, unioning
//! and intersecting posting lists; sorted order makes every set operation
//! a linear merge.
//!
//! Two realizations share the resolution logic through [`PostingSource`]:
//!
//! - [`MemPostings`] — the live index over head series, updated on series
//!   creation.
//! - [`IndexReader`] — the immutable per-block index file.
//!
//! # On-disk index file
//!
//! ```text
//! [magic "TSIX"][version u32 LE]
//! [section_len u32 LE][section bytes][crc32c u32 LE]
//! ```
//!
//! The single section holds the [`encoding`]-serialized [`IndexData`]:
//! the series table (fingerprint → labels + chunk directory) followed by
//! the posting lists sorted by `(name, value)`. The CRC covers the
//! section bytes; a mismatch or any out-of-bounds offset surfaces as
//! [`IndexError::Corrupt`], never a panic — the engine quarantines the
//! block and moves on.


use std::{
    collections::{BTreeMap, HashMap},
    fs::File,
    io,
    path::Path,
};

use memmap2::Mmap;
use thiserror::Error;
use tracing::debug;

use crate::encoding::{self, Decode, Encode, EncodingError};
use crate::labels::{Labels, MatchOp, Matcher};

const INDEX_MAGIC: [u8; 4] = *b"TSIX";
const INDEX_VERSION: u32 = 1;

/// Fixed bytes before the checksummed section: magic + version + length.
const INDEX_HEADER_LEN: usize = 4 + 4 + 4;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by index reading and writing.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding / decoding error.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Structurally invalid index file.
    #[error("corrupt index: {0}")]
    Corrupt(String),
}

// ------------------------------------------------------------------------------------------------
// Series table entries
// ------------------------------------------------------------------------------------------------

/// Location and bounds of one chunk inside a block's `chunks` file.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkMeta {
    /// Smallest sample timestamp in the chunk.
    pub min_ts: i64,

    /// Largest sample timestamp in the chunk.
    pub max_ts: i64,

    /// Byte offset of the chunk's frame in the `chunks` file.
    pub offset: u64,

    /// Length of the encoded chunk bytes (excluding frame overhead).
    pub len: u32,

    /// Number of samples in the chunk.
    pub samples: u32,
}

impl ChunkMeta {
    /// True when the chunk's time range intersects `[min_ts, max_ts]`.
    pub fn overlaps(&self, min_ts: i64, max_ts: i64) -> bool {
        self.min_ts <= max_ts && min_ts <= self.max_ts
    }
}

/// One series in the index: identity plus its chunk directory.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesEntry {
    /// Stable series fingerprint.
    pub fingerprint: u64,

    /// Full label set.
    pub labels: Labels,

    /// Chunk directory, ordered by `min_ts`.
    pub chunks: Vec<ChunkMeta>,
}

/// One posting list: the sorted fingerprints of all series carrying
/// `name=value`.
#[derive(Debug, Clone, PartialEq)]
pub struct PostingList {
    /// Label name.
    pub name: String,

    /// Label value.
    pub value: String,

    /// Sorted fingerprints.
    pub fingerprints: Vec<u64>,
}

/// The decoded content of an index file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexData {
    /// Series table, sorted by fingerprint.
    pub series: Vec<SeriesEntry>,

    /// Posting lists, sorted by `(name, value)`.
    pub postings: Vec<PostingList>,
}

impl IndexData {
    /// Build the full index content from a series table, deriving the
    /// posting lists.
    pub fn from_series(mut series: Vec<SeriesEntry>) -> Self {
        series.sort_by_key(|s| s.fingerprint);

        let mut postings: BTreeMap<(String, String), Vec<u64>> = BTreeMap::new();
        for entry in &series {
            for label in entry.labels.iter() {
                postings
                    .entry((label.name.clone(), label.value.clone()))
                    .or_default()
                    .push(entry.fingerprint);
            }
        }

        let postings = postings
            .into_iter()
            .map(|((name, value), mut fingerprints)| {
                fingerprints.sort_unstable();
                fingerprints.dedup();
                PostingList {
                    name,
                    value,
                    fingerprints,
                }
            })
            .collect();

        Self { series, postings }
    }
}

// ------------------------------------------------------------------------------------------------
// Encoding implementations
// ------------------------------------------------------------------------------------------------

impl Encode for ChunkMeta {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.min_ts.encode_to(buf)?;
        self.max_ts.encode_to(buf)?;
        self.offset.encode_to(buf)?;
        self.len.encode_to(buf)?;
        self.samples.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for ChunkMeta {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (min_ts, n) = i64::decode_from(&buf[off..])?;
        off += n;
        let (max_ts, n) = i64::decode_from(&buf[off..])?;
        off += n;
        let (offset, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (len, n) = u32::decode_from(&buf[off..])?;
        off += n;
        let (samples, n) = u32::decode_from(&buf[off..])?;
        off += n;
        Ok((
            Self {
                min_ts,
                max_ts,
                offset,
                len,
                samples,
            },
            off,
        ))
    }
}

impl Encode for SeriesEntry {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.fingerprint.encode_to(buf)?;
        self.labels.encode_to(buf)?;
        encoding::encode_vec(&self.chunks, buf)?;
        Ok(())
    }
}

impl Decode for SeriesEntry {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (fingerprint, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (labels, n) = Labels::decode_from(&buf[off..])?;
        off += n;
        let (chunks, n) = encoding::decode_vec::<ChunkMeta>(&buf[off..])?;
        off += n;
        Ok((
            Self {
                fingerprint,
                labels,
                chunks,
            },
            off,
        ))
    }
}

impl Encode for PostingList {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.name.encode_to(buf)?;
        self.value.encode_to(buf)?;
        encoding::encode_vec(&self.fingerprints, buf)?;
        Ok(())
    }
}

impl Decode for PostingList {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (name, n) = String::decode_from(&buf[off..])?;
        off += n;
        let (value, n) = String::decode_from(&buf[off..])?;
        off += n;
        let (fingerprints, n) = encoding::decode_vec::<u64>(&buf[off..])?;
        off += n;
        Ok((
            Self {
                name,
                value,
                fingerprints,
            },
            off,
        ))
    }
}

impl Encode for IndexData {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        encoding::encode_vec(&self.series, buf)?;
        encoding::encode_vec(&self.postings, buf)?;
        Ok(())
    }
}

impl Decode for IndexData {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (series, n) = encoding::decode_vec::<SeriesEntry>(&buf[off..])?;
        off += n;
        let (postings, n) = encoding::decode_vec::<PostingList>(&buf[off..])?;
        off += n;
        Ok((Self { series, postings }, off))
    }
}

// ------------------------------------------------------------------------------------------------
// On-disk index file I/O
// ------------------------------------------------------------------------------------------------

/// Serialize `data` into the on-disk index file format.
pub fn encode_index_file(data: &IndexData) -> Result<Vec<u8>, IndexError> {
    let section = encoding::encode_to_vec(data)?;
    let len = u32::try_from(section.len())
        .map_err(|_| IndexError::Corrupt("index section exceeds u32::MAX".into()))?;
    let crc = crc32c::crc32c(&section);

    let mut out = Vec::with_capacity(INDEX_HEADER_LEN + section.len() + 4);
    out.extend_from_slice(&INDEX_MAGIC);
    out.extend_from_slice(&INDEX_VERSION.to_le_bytes());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&section);
    out.extend_from_slice(&crc.to_le_bytes());
    Ok(out)
}

/// Decode and verify an index file image.
pub fn decode_index_file(bytes: &[u8]) -> Result<IndexData, IndexError> {
    if bytes.len() < INDEX_HEADER_LEN + 4 {
        return Err(IndexError::Corrupt("index file too small".into()));
    }
    if bytes[..4] != INDEX_MAGIC {
        return Err(IndexError::Corrupt("bad index magic".into()));
    }
    let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    if version != INDEX_VERSION {
        return Err(IndexError::Corrupt(format!(
            "unsupported index version {version}"
        )));
    }
    let len = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;

    let section_start = INDEX_HEADER_LEN;
    let section_end = section_start
        .checked_add(len)
        .ok_or_else(|| IndexError::Corrupt("index section length overflow".into()))?;
    if bytes.len() < section_end + 4 {
        return Err(IndexError::Corrupt("index section truncated".into()));
    }

    let section = &bytes[section_start..section_end];
    let stored_crc = u32::from_le_bytes([
        bytes[section_end],
        bytes[section_end + 1],
        bytes[section_end + 2],
        bytes[section_end + 3],
    ]);
    if crc32c::crc32c(section) != stored_crc {
        return Err(IndexError::Corrupt("index section checksum mismatch".into()));
    }

    let (data, _) = encoding::decode_from_slice::<IndexData>(section)?;
    Ok(data)
}

// ------------------------------------------------------------------------------------------------
// PostingSource and matcher resolution
// ------------------------------------------------------------------------------------------------

/// Posting-list access shared by the head index and block index readers.
pub trait PostingSource {
    /// All series fingerprints, sorted.
    fn all_series(&self) -> Vec<u64>;

    /// The posting list for `name=value` (empty when unknown), sorted.
    fn postings(&self, name: &str, value: &str) -> Vec<u64>;

    /// All distinct label names, sorted.
    fn label_names(&self) -> Vec<String>;

    /// All distinct values of `name`, sorted.
    fn label_values(&self, name: &str) -> Vec<String>;
}

/// Resolve a single matcher to a sorted fingerprint list.
///
/// Matchers that accept the empty string (`!=`, `!~`, and regexes that
/// match `""`) also select series *without* the label, so they resolve as
/// the complement of the non-matching values.
pub fn postings_for_matcher(src: &impl PostingSource, matcher: &Matcher) -> Vec<u64> {
    // Fast path: plain equality against a concrete value.
    if matcher.op == MatchOp::Eq && !matcher.matches_value("") {
        return src.postings(&matcher.name, &matcher.value);
    }

    if matcher.matches_value("") {
        // Complement: everything except series whose value fails the matcher.
        let mut excluded: Vec<Vec<u64>> = Vec::new();
        for value in src.label_values(&matcher.name) {
            if !matcher.matches_value(&value) {
                excluded.push(src.postings(&matcher.name, &value));
            }
        }
        difference_sorted(src.all_series(), &union_sorted(excluded))
    } else {
        // Union of postings over every accepted value.
        let mut selected: Vec<Vec<u64>> = Vec::new();
        for value in src.label_values(&matcher.name) {
            if matcher.matches_value(&value) {
                selected.push(src.postings(&matcher.name, &value));
            }
        }
        union_sorted(selected)
    }
}

/// Resolve a full matcher set (AND semantics) to candidate fingerprints.
///
/// The empty set selects every series. Lists are intersected smallest
/// first so a selective matcher prunes the work early.
pub fn resolve_matchers(src: &impl PostingSource, matchers: &[Matcher]) -> Vec<u64> {
    if matchers.is_empty() {
        return src.all_series();
    }

    let mut lists: Vec<Vec<u64>> = matchers
        .iter()
        .map(|m| postings_for_matcher(src, m))
        .collect();
    lists.sort_by_key(Vec::len);

    let mut result = lists.remove(0);
    for list in lists {
        if result.is_empty() {
            break;
        }
        result = intersect_sorted(&result, &list);
    }
    result
}

// ------------------------------------------------------------------------------------------------
// Sorted-list set operations
// ------------------------------------------------------------------------------------------------

/// Linear-merge intersection of two sorted lists.
pub fn intersect_sorted(a: &[u64], b: &[u64]) -> Vec<u64> {
    let mut out = Vec::with_capacity(a.len().min(b.len()));
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                out.push(a[i]);
                i += 1;
                j += 1;
            }
        }
    }
    out
}

/// Deduplicating union of many sorted lists.
pub fn union_sorted(lists: Vec<Vec<u64>>) -> Vec<u64> {
    let mut out: Vec<u64> = lists.into_iter().flatten().collect();
    out.sort_unstable();
    out.dedup();
    out
}

/// Elements of sorted `a` not present in sorted `b`.
pub fn difference_sorted(a: Vec<u64>, b: &[u64]) -> Vec<u64> {
    let mut out = Vec::with_capacity(a.len());
    let mut j = 0;
    for x in a {
        while j < b.len() && b[j] < x {
            j += 1;
        }
        if j < b.len() && b[j] == x {
            continue;
        }
        out.push(x);
    }
    out
}

// ------------------------------------------------------------------------------------------------
// MemPostings — live index over head series
// ------------------------------------------------------------------------------------------------

/// Mutable posting index for the head.
///
/// Series are only ever added (the head never forgets a series until the
/// whole head is swapped out by a flush), so postings grow monotonically.
#[derive(Debug, Default)]
pub struct MemPostings {
    /// `name → value → sorted fingerprints`.
    map: BTreeMap<String, BTreeMap<String, Vec<u64>>>,

    /// All known fingerprints, sorted.
    all: Vec<u64>,
}

impl MemPostings {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new series under every one of its label assignments.
    pub fn add(&mut self, fingerprint: u64, labels: &Labels) {
        if let Err(pos) = self.all.binary_search(&fingerprint) {
            self.all.insert(pos, fingerprint);
        }
        for label in labels.iter() {
            let list = self
                .map
                .entry(label.name.clone())
                .or_default()
                .entry(label.value.clone())
                .or_default();
            if let Err(pos) = list.binary_search(&fingerprint) {
                list.insert(pos, fingerprint);
            }
        }
    }

    /// Number of distinct series.
    pub fn num_series(&self) -> usize {
        self.all.len()
    }
}

impl PostingSource for MemPostings {
    fn all_series(&self) -> Vec<u64> {
        self.all.clone()
    }

    fn postings(&self, name: &str, value: &str) -> Vec<u64> {
        self.map
            .get(name)
            .and_then(|values| values.get(value))
            .cloned()
            .unwrap_or_default()
    }

    fn label_names(&self) -> Vec<String> {
        self.map.keys().cloned().collect()
    }

    fn label_values(&self, name: &str) -> Vec<String> {
        self.map
            .get(name)
            .map(|values| values.keys().cloned().collect())
            .unwrap_or_default()
    }
}

// ------------------------------------------------------------------------------------------------
// IndexReader — immutable per-block index
// ------------------------------------------------------------------------------------------------

/// Decoded, validated view of a block's index file.
///
/// The file is memory-mapped for the duration of the decode, then owned
/// structures serve all lookups — the block index is small relative to
/// its chunks.
#[derive(Debug)]
pub struct IndexReader {
    series: HashMap<u64, SeriesEntry>,
    postings: BTreeMap<String, BTreeMap<String, Vec<u64>>>,
    all: Vec<u64>,
}

impl IndexReader {
    /// Open and validate the index file at `path`.
    pub fn open(path: &Path) -> Result<Self, IndexError> {
        let file = File::open(path)?;
        // Read-only map over an immutable file; all offsets are
        // bounds-checked before slicing.
        let mmap = unsafe { Mmap::map(&file)? };
        let data = decode_index_file(&mmap)?;
        debug!(
            path = %path.display(),
            series = data.series.len(),
            postings = data.postings.len(),
            "block index loaded"
        );
        Ok(Self::from_data(data))
    }

    /// Build a reader directly from decoded index content.
    pub fn from_data(data: IndexData) -> Self {
        let mut all: Vec<u64> = data.series.iter().map(|s| s.fingerprint).collect();
        all.sort_unstable();

        let mut postings: BTreeMap<String, BTreeMap<String, Vec<u64>>> = BTreeMap::new();
        for list in data.postings {
            postings
                .entry(list.name)
                .or_default()
                .insert(list.value, list.fingerprints);
        }

        let series = data
            .series
            .into_iter()
            .map(|entry| (entry.fingerprint, entry))
            .collect();

        Self {
            series,
            postings,
            all,
        }
    }

    /// Full entry for one series, if present.
    pub fn series(&self, fingerprint: u64) -> Option<&SeriesEntry> {
        self.series.get(&fingerprint)
    }

    /// Number of series in this index.
    pub fn num_series(&self) -> usize {
        self.all.len()
    }
}

impl PostingSource for IndexReader {
    fn all_series(&self) -> Vec<u64> {
        self.all.clone()
    }

    fn postings(&self, name: &str, value: &str) -> Vec<u64> {
        self.postings
            .get(name)
            .and_then(|values| values.get(value))
            .cloned()
            .unwrap_or_default()
    }

    fn label_names(&self) -> Vec<String> {
        self.postings.keys().cloned().collect()
    }

    fn label_values(&self, name: &str) -> Vec<String> {
        self.postings
            .get(name)
            .map(|values| values.keys().cloned().collect())
            .unwrap_or_default()
    }
}
