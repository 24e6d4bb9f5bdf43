//! Write-Ahead Log — segmented, CRC32C-protected, crash-recoverable.
//!
//! Every accepted insert is appended here before it is applied to the
//! in-memory head, so a crash can never lose an acknowledged write. The
//! log is split into monotonically numbered segment files
//! (`wal/0000000001`, `wal/0000000002`, …) that roll at
//! [`SEGMENT_MAX_BYTES`] and are deleted wholesale once a flush has
//! persisted all of their samples into a block.
//!
//! # On-disk record framing
//!
//! ```text
//! | len: u32 LE | type: u8 | crc32c: u32 LE | payload: len bytes |
//! ```
//!
//! The checksum is CRC32C (Castagnoli) over `type || payload`. Record
//! types:
//!
//! - `0x01` **Series** — `fingerprint u64 | n_labels u16 |
//!   (name_len u16, name, value_len u16, value)*`. Declares a new
//!   fingerprint → label-set binding.
//! - `0x02` **Samples** — `fingerprint u64 | n_samples u32 |
//!   (ts i64, value f64)*`. References a previously declared fingerprint.
//! - `0x03` **Tombstone** — reserved for deletes; skipped on replay.
//!
//! # Ownership and durability
//!
//! The segment file is owned exclusively by a dedicated **writer thread**.
//! Producers submit pre-encoded batches over a bounded channel — a full
//! channel blocks the caller, which is the engine's backpressure. Under
//! [`SyncPolicy::Always`] each batch is fsynced before the producer is
//! acknowledged; under [`SyncPolicy::Interval`] the writer fsyncs on a
//! timer tick and on every segment roll, so at most one interval of
//! acknowledged writes can be lost in a crash.
//!
//! # Replay
//!
//! [`replay`] streams records from all segments in order, verifying
//! framing and checksums. A framing or CRC failure stops replay of **that
//! segment** at the bad offset — the tail may be a torn write, and
//! skipping forward could resurrect garbage — and continues with the next
//! segment. Corruption is counted, logged, and never fatal as long as
//! earlier records decoded.

#[cfg(test)]
mod tests;

use std::{
    collections::VecDeque,
    fs::{self, File, OpenOptions},
    io::{self, BufReader, Read, Write},
    path::{Path, PathBuf},
    sync::Mutex,
    thread::JoinHandle,
    time::Duration,
};

use crossbeam::channel::{self, Receiver, Sender};
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::chunk::Sample;
use crate::labels::{Label, Labels};

/// Segment roll threshold (128 MiB).
pub const SEGMENT_MAX_BYTES: u64 = 128 * 1024 * 1024;

/// Upper bound on a single record's payload; larger length prefixes are
/// treated as corruption during replay.
pub const MAX_RECORD_BYTES: u32 = 16 * 1024 * 1024;

/// Capacity of the writer thread's submission channel.
const SUBMIT_QUEUE_LEN: usize = 1024;

const REC_SERIES: u8 = 0x01;
const REC_SAMPLES: u8 = 0x02;
const REC_TOMBSTONE: u8 = 0x03;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by WAL operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WalError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Record exceeds [`MAX_RECORD_BYTES`].
    #[error("record size exceeds limit ({0} bytes)")]
    RecordTooLarge(usize),

    /// A record failed framing or checksum validation during replay.
    #[error("corrupt WAL record in segment {segment} at offset {offset}: {reason}")]
    Corrupt {
        /// Segment sequence number.
        segment: u64,
        /// Byte offset of the bad record.
        offset: u64,
        /// What failed.
        reason: String,
    },

    /// The writer thread has shut down.
    #[error("WAL is closed")]
    Closed,

    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Durability policy
// ------------------------------------------------------------------------------------------------

/// When the writer thread fsyncs the active segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPolicy {
    /// Fsync after every submitted batch, before acknowledging it.
    Always,

    /// Fsync on a timer and on segment roll; acknowledged writes inside
    /// the current interval may be lost on crash.
    Interval(Duration),
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self::Interval(Duration::from_millis(200))
    }
}

// ------------------------------------------------------------------------------------------------
// Records
// ------------------------------------------------------------------------------------------------

/// A logical WAL record.
#[derive(Debug, Clone, PartialEq)]
pub enum WalRecord {
    /// Declares a new series: binds `fingerprint` to its label set.
    Series {
        /// Stable series fingerprint.
        fingerprint: u64,
        /// Full label set (collision safety and index rebuild).
        labels: Labels,
    },

    /// Samples for a previously declared series.
    Samples {
        /// Fingerprint declared by an earlier [`WalRecord::Series`].
        fingerprint: u64,
        /// Appended samples, in submission order.
        samples: Vec<Sample>,
    },
}

impl WalRecord {
    fn record_type(&self) -> u8 {
        match self {
            Self::Series { .. } => REC_SERIES,
            Self::Samples { .. } => REC_SAMPLES,
        }
    }

    /// Payload encoding per the framing documented at module level.
    fn encode_payload(&self, buf: &mut Vec<u8>) {
        match self {
            Self::Series {
                fingerprint,
                labels,
            } => {
                buf.extend_from_slice(&fingerprint.to_le_bytes());
                buf.extend_from_slice(&(labels.len() as u16).to_le_bytes());
                for label in labels.iter() {
                    buf.extend_from_slice(&(label.name.len() as u16).to_le_bytes());
                    buf.extend_from_slice(label.name.as_bytes());
                    buf.extend_from_slice(&(label.value.len() as u16).to_le_bytes());
                    buf.extend_from_slice(label.value.as_bytes());
                }
            }
            Self::Samples {
                fingerprint,
                samples,
            } => {
                buf.extend_from_slice(&fingerprint.to_le_bytes());
                buf.extend_from_slice(&(samples.len() as u32).to_le_bytes());
                for sample in samples {
                    buf.extend_from_slice(&sample.timestamp.to_le_bytes());
                    buf.extend_from_slice(&sample.value.to_bits().to_le_bytes());
                }
            }
        }
    }

    /// Append the full on-disk frame for this record to `buf`.
    pub fn encode_frame(&self, buf: &mut Vec<u8>) -> Result<(), WalError> {
        let mut payload = Vec::new();
        self.encode_payload(&mut payload);

        let len = u32::try_from(payload.len())
            .map_err(|_| WalError::RecordTooLarge(payload.len()))?;
        if len > MAX_RECORD_BYTES {
            return Err(WalError::RecordTooLarge(payload.len()));
        }

        let rtype = self.record_type();
        let crc = crc32c::crc32c_append(crc32c::crc32c(&[rtype]), &payload);

        buf.extend_from_slice(&len.to_le_bytes());
        buf.push(rtype);
        buf.extend_from_slice(&crc.to_le_bytes());
        buf.extend_from_slice(&payload);
        Ok(())
    }

    /// Decode a record payload. Returns `Ok(None)` for recognised but
    /// unsupported types (tombstones).
    fn decode(rtype: u8, payload: &[u8]) -> Result<Option<Self>, String> {
        let mut cur = Cursor { buf: payload, pos: 0 };
        match rtype {
            REC_SERIES => {
                let fingerprint = cur.u64()?;
                let n_labels = cur.u16()? as usize;
                let mut labels = Vec::with_capacity(n_labels);
                for _ in 0..n_labels {
                    let name = cur.string()?;
                    let value = cur.string()?;
                    labels.push(Label { name, value });
                }
                cur.finish()?;
                let labels =
                    Labels::from_vec(labels).map_err(|e| format!("bad label set: {e}"))?;
                Ok(Some(Self::Series {
                    fingerprint,
                    labels,
                }))
            }
            REC_SAMPLES => {
                let fingerprint = cur.u64()?;
                let n_samples = cur.u32()? as usize;
                let mut samples = Vec::with_capacity(n_samples.min(4096));
                for _ in 0..n_samples {
                    let ts = cur.u64()? as i64;
                    let value = f64::from_bits(cur.u64()?);
                    samples.push(Sample::new(ts, value));
                }
                cur.finish()?;
                Ok(Some(Self::Samples {
                    fingerprint,
                    samples,
                }))
            }
            REC_TOMBSTONE => Ok(None),
            other => Err(format!("unknown record type 0x{other:02x}")),
        }
    }
}

/// Minimal bounds-checked payload cursor.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], String> {
        if self.buf.len() - self.pos < n {
            return Err(format!(
                "payload truncated (need {n} bytes at offset {})",
                self.pos
            ));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u16(&mut self) -> Result<u16, String> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, String> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, String> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn string(&mut self) -> Result<String, String> {
        let len = self.u16()? as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| "invalid UTF-8 in label".to_string())
    }

    fn finish(&self) -> Result<(), String> {
        if self.pos != self.buf.len() {
            return Err(format!(
                "{} trailing bytes after payload",
                self.buf.len() - self.pos
            ));
        }
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Segment file naming
// ------------------------------------------------------------------------------------------------

/// Path of segment `seq` inside `dir`: ten zero-padded digits, no extension.
pub fn segment_path(dir: &Path, seq: u64) -> PathBuf {
    dir.join(format!("{seq:010}"))
}

/// Enumerate segment files in `dir`, sorted by sequence number.
pub fn list_segments(dir: &Path) -> io::Result<Vec<(u64, PathBuf)>> {
    let mut segments = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.len() == 10 && name.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(seq) = name.parse::<u64>() {
                segments.push((seq, path));
            }
        }
    }
    segments.sort_by_key(|(seq, _)| *seq);
    Ok(segments)
}

// ------------------------------------------------------------------------------------------------
// Writer thread protocol
// ------------------------------------------------------------------------------------------------

enum Command {
    /// Pre-encoded frames to append.
    Append {
        frames: Vec<u8>,
        ack: Sender<Result<(), WalError>>,
    },
    /// Flush and fsync the active segment.
    Sync { ack: Sender<Result<(), WalError>> },
    /// Force a segment roll; replies with the **new** segment's sequence.
    /// Every record submitted before the roll lives in a lower-numbered
    /// segment — the flush checkpoint used for truncation.
    Roll { ack: Sender<Result<u64, WalError>> },
    /// Delete all segments with sequence `< seq`; replies with the count.
    TruncateBefore {
        seq: u64,
        ack: Sender<Result<usize, WalError>>,
    },
    /// Final sync, then exit the thread.
    Shutdown { ack: Sender<Result<(), WalError>> },
}

// ------------------------------------------------------------------------------------------------
// Wal public handle
// ------------------------------------------------------------------------------------------------

/// Handle to the segmented write-ahead log.
///
/// Cheap to share behind an `Arc`; all file I/O happens on the internal
/// writer thread.
pub struct Wal {
    dir: PathBuf,
    tx: Sender<Command>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Wal {
    /// Open the WAL in `dir`, starting a fresh segment after any existing
    /// ones.
    ///
    /// Existing segments are never appended to — a previous crash may have
    /// left a torn record at the tail, and appending past it would hide
    /// every later record from replay. They remain on disk for replay and
    /// truncation.
    pub fn open(dir: impl Into<PathBuf>, policy: SyncPolicy) -> Result<Self, WalError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let next_seq = list_segments(&dir)?
            .last()
            .map(|(seq, _)| seq + 1)
            .unwrap_or(1);

        let mut writer = SegmentWriter::create(&dir, next_seq, policy)?;
        let (tx, rx) = channel::bounded::<Command>(SUBMIT_QUEUE_LEN);

        let thread_dir = dir.clone();
        let handle = std::thread::Builder::new()
            .name("tempusdb-wal".into())
            .spawn(move || writer_loop(&thread_dir, &mut writer, &rx))
            .map_err(WalError::Io)?;

        info!(dir = %dir.display(), segment = next_seq, "WAL opened");

        Ok(Self {
            dir,
            tx,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Append a batch of records as one submission.
    ///
    /// Blocks while the submission queue is full (backpressure). Under
    /// [`SyncPolicy::Always`] the call returns only after the batch is
    /// fsynced; under [`SyncPolicy::Interval`] after it is written to the
    /// OS.
    pub fn append_batch(&self, records: &[WalRecord]) -> Result<(), WalError> {
        let mut frames = Vec::new();
        for record in records {
            record.encode_frame(&mut frames)?;
        }
        if frames.is_empty() {
            return Ok(());
        }

        let (ack_tx, ack_rx) = channel::bounded(1);
        self.tx
            .send(Command::Append {
                frames,
                ack: ack_tx,
            })
            .map_err(|_| WalError::Closed)?;
        ack_rx.recv().map_err(|_| WalError::Closed)?
    }

    /// Flush and fsync the active segment.
    pub fn sync(&self) -> Result<(), WalError> {
        let (ack_tx, ack_rx) = channel::bounded(1);
        self.tx
            .send(Command::Sync { ack: ack_tx })
            .map_err(|_| WalError::Closed)?;
        ack_rx.recv().map_err(|_| WalError::Closed)?
    }

    /// Force a segment roll.
    ///
    /// Returns the sequence number of the new active segment; every record
    /// appended before this call lives in a lower-numbered segment.
    pub fn roll(&self) -> Result<u64, WalError> {
        let (ack_tx, ack_rx) = channel::bounded(1);
        self.tx
            .send(Command::Roll { ack: ack_tx })
            .map_err(|_| WalError::Closed)?;
        ack_rx.recv().map_err(|_| WalError::Closed)?
    }

    /// Delete every segment with sequence `< seq`.
    ///
    /// Called after a successful flush with the sequence returned by the
    /// pre-flush [`Wal::roll`]. Returns the number of deleted segments.
    pub fn truncate_before(&self, seq: u64) -> Result<usize, WalError> {
        let (ack_tx, ack_rx) = channel::bounded(1);
        self.tx
            .send(Command::TruncateBefore { seq, ack: ack_tx })
            .map_err(|_| WalError::Closed)?;
        ack_rx.recv().map_err(|_| WalError::Closed)?
    }

    /// Total on-disk size of all segments, in bytes.
    pub fn size_bytes(&self) -> Result<u64, WalError> {
        let mut total = 0;
        for (_, path) in list_segments(&self.dir)? {
            total += fs::metadata(&path)?.len();
        }
        Ok(total)
    }

    /// Final sync, stop the writer thread, and join it. Idempotent.
    pub fn close(&self) -> Result<(), WalError> {
        let handle = {
            let mut guard = self
                .handle
                .lock()
                .map_err(|_| WalError::Internal("mutex poisoned".into()))?;
            guard.take()
        };
        let Some(handle) = handle else {
            return Ok(());
        };

        let (ack_tx, ack_rx) = channel::bounded(1);
        if self.tx.send(Command::Shutdown { ack: ack_tx }).is_ok() {
            let _ = ack_rx.recv();
        }
        handle
            .join()
            .map_err(|_| WalError::Internal("writer thread panicked".into()))?;
        Ok(())
    }
}

impl Drop for Wal {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!(error = %e, "WAL close failed on drop");
        }
    }
}

impl std::fmt::Debug for Wal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wal").field("dir", &self.dir).finish_non_exhaustive()
    }
}

// ------------------------------------------------------------------------------------------------
// Writer thread
// ------------------------------------------------------------------------------------------------

struct SegmentWriter {
    file: File,
    seq: u64,
    bytes: u64,
    policy: SyncPolicy,
    /// Written-but-not-fsynced data pending.
    dirty: bool,
}

impl SegmentWriter {
    fn create(dir: &Path, seq: u64, policy: SyncPolicy) -> Result<Self, WalError> {
        let path = segment_path(dir, seq);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        debug!(segment = seq, path = %path.display(), "WAL segment created");
        Ok(Self {
            file,
            seq,
            bytes: 0,
            policy,
            dirty: false,
        })
    }

    fn append(&mut self, frames: &[u8]) -> Result<(), WalError> {
        self.file.write_all(frames)?;
        self.bytes += frames.len() as u64;
        self.dirty = true;
        if self.policy == SyncPolicy::Always {
            self.sync()?;
        }
        Ok(())
    }

    fn sync(&mut self) -> Result<(), WalError> {
        if self.dirty {
            self.file.sync_data()?;
            self.dirty = false;
        }
        Ok(())
    }

    fn roll(&mut self, dir: &Path) -> Result<u64, WalError> {
        self.sync()?;
        *self = Self::create(dir, self.seq + 1, self.policy)?;
        info!(segment = self.seq, "WAL segment rolled");
        Ok(self.seq)
    }
}

fn writer_loop(dir: &Path, writer: &mut SegmentWriter, rx: &Receiver<Command>) {
    let ticker = match writer.policy {
        SyncPolicy::Interval(interval) => channel::tick(interval),
        SyncPolicy::Always => channel::never(),
    };

    loop {
        crossbeam::channel::select! {
            recv(rx) -> cmd => {
                let Ok(cmd) = cmd else {
                    // All handles dropped: final-sync and exit.
                    let _ = writer.sync();
                    return;
                };
                match cmd {
                    Command::Append { frames, ack } => {
                        let mut result = writer.append(&frames);
                        if result.is_ok() && writer.bytes >= SEGMENT_MAX_BYTES {
                            result = writer.roll(dir).map(|_| ());
                        }
                        let _ = ack.send(result);
                    }
                    Command::Sync { ack } => {
                        let _ = ack.send(writer.sync());
                    }
                    Command::Roll { ack } => {
                        let _ = ack.send(writer.roll(dir));
                    }
                    Command::TruncateBefore { seq, ack } => {
                        // Never touch the active segment.
                        let bound = seq.min(writer.seq);
                        let _ = ack.send(truncate_segments(dir, bound));
                    }
                    Command::Shutdown { ack } => {
                        let _ = ack.send(writer.sync());
                        return;
                    }
                }
            }
            recv(ticker) -> _ => {
                if let Err(e) = writer.sync() {
                    error!(error = %e, segment = writer.seq, "periodic WAL sync failed");
                }
            }
        }
    }
}

fn truncate_segments(dir: &Path, before_seq: u64) -> Result<usize, WalError> {
    let mut removed = 0;
    for (seq, path) in list_segments(dir)? {
        if seq < before_seq {
            fs::remove_file(&path)?;
            removed += 1;
            debug!(segment = seq, "WAL segment truncated");
        }
    }
    if removed > 0 {
        info!(removed, before_seq, "WAL truncated");
    }
    Ok(removed)
}

// ------------------------------------------------------------------------------------------------
// Replay
// ------------------------------------------------------------------------------------------------

/// Streaming replay over every segment in `dir`, oldest first.
///
/// Yields decoded records; framing or checksum failures stop the current
/// segment (the tail may be torn) and replay continues with the next one.
/// [`WalReplay::corruptions`] reports how many segments were cut short.
pub struct WalReplay {
    pending: VecDeque<(u64, PathBuf)>,
    current: Option<(u64, u64, BufReader<File>)>,
    corruptions: u64,
}

/// Open a replay stream over the WAL directory.
pub fn replay(dir: &Path) -> Result<WalReplay, WalError> {
    let segments = list_segments(dir)?;
    debug!(dir = %dir.display(), segments = segments.len(), "WAL replay started");
    Ok(WalReplay {
        pending: segments.into(),
        current: None,
        corruptions: 0,
    })
}

impl WalReplay {
    /// Number of segments whose replay stopped early due to corruption.
    pub fn corruptions(&self) -> u64 {
        self.corruptions
    }

    /// Read one frame from the current segment.
    ///
    /// `Ok(None)` means clean end-of-segment; `Err(reason)` means the
    /// segment is corrupt at the current offset.
    fn read_frame(
        reader: &mut BufReader<File>,
        offset: &mut u64,
    ) -> Result<Option<(u8, Vec<u8>)>, String> {
        let mut len_bytes = [0u8; 4];
        match reader.read_exact(&mut len_bytes) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(format!("read failed: {e}")),
        }
        let len = u32::from_le_bytes(len_bytes);
        if len > MAX_RECORD_BYTES {
            return Err(format!("record length {len} exceeds limit"));
        }

        let mut head = [0u8; 5];
        reader
            .read_exact(&mut head)
            .map_err(|_| "torn record header".to_string())?;
        let rtype = head[0];
        let stored_crc = u32::from_le_bytes([head[1], head[2], head[3], head[4]]);

        let mut payload = vec![0u8; len as usize];
        reader
            .read_exact(&mut payload)
            .map_err(|_| "torn record payload".to_string())?;

        let computed = crc32c::crc32c_append(crc32c::crc32c(&[rtype]), &payload);
        if computed != stored_crc {
            return Err(format!(
                "checksum mismatch (stored {stored_crc:08x}, computed {computed:08x})"
            ));
        }

        *offset += 4 + 5 + u64::from(len);
        Ok(Some((rtype, payload)))
    }
}

impl Iterator for WalReplay {
    type Item = Result<WalRecord, WalError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.current.is_none() {
                let (seq, path) = self.pending.pop_front()?;
                let file = match File::open(&path) {
                    Ok(f) => f,
                    Err(e) => return Some(Err(WalError::Io(e))),
                };
                trace!(segment = seq, "replaying WAL segment");
                self.current = Some((seq, 0, BufReader::new(file)));
            }

            let (seq, offset, reader) = self.current.as_mut()?;
            match Self::read_frame(reader, offset) {
                Ok(Some((rtype, payload))) => match WalRecord::decode(rtype, &payload) {
                    Ok(Some(record)) => return Some(Ok(record)),
                    Ok(None) => {
                        debug!(segment = *seq, "skipping reserved tombstone record");
                        continue;
                    }
                    Err(reason) => {
                        warn!(segment = *seq, offset = *offset, reason, "corrupt WAL record, stopping segment");
                        self.corruptions += 1;
                        self.current = None;
                        continue;
                    }
                },
                Ok(None) => {
                    self.current = None;
                    continue;
                }
                Err(reason) => {
                    warn!(segment = *seq, offset = *offset, reason, "corrupt WAL frame, stopping segment");
                    self.corruptions += 1;
                    self.current = None;
                    continue;
                }
            }
        }
    }
}
