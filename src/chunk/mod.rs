//! Gorilla chunk codec — compressed runs of samples for a single series.
//!
//! A chunk encodes a bounded run of `(timestamp_ms, value)` samples using
//! the Facebook Gorilla scheme: timestamps as **delta-of-delta** with
//! variable-width buckets, values as **XOR** against the previous value
//! with leading/trailing-zero window reuse. Monitoring data — near-regular
//! scrape intervals and slowly-moving gauges — typically compresses to
//! under two bytes per sample.
//!
//! # Encoded layout
//!
//! ```text
//! [num_samples: u16 LE][bit stream]
//! ```
//!
//! The bit stream stores the first sample raw (64-bit timestamp, 64-bit
//! value bits), then one delta-of-delta + XOR pair per following sample.
//! The sample count header makes the chunk **self-delimiting**: a decoder
//! reads exactly `num_samples` samples and ignores the padding bits of the
//! final byte. Framing (length prefix, CRC) belongs to the containing
//! file, not the codec.
//!
//! # Sizing policy
//!
//! A chunk is considered full at [`TARGET_SAMPLES`] samples or a
//! [`TARGET_SPAN_MS`] time span, whichever comes first. [`MAX_SAMPLES`]
//! is a hard cap enforced by [`ChunkAppender::append`].
//!
//! # Round trip
//!
//! Decoding is bit-exact: `f64` values round-trip including NaN payload
//! bits and signed zeros, timestamps as full-range `i64`.


use thiserror::Error;

/// Soft target: seal a chunk once it holds this many samples.
pub const TARGET_SAMPLES: usize = 120;

/// Soft target: seal a chunk once it spans this many milliseconds (30 min).
pub const TARGET_SPAN_MS: i64 = 30 * 60 * 1000;

/// Hard cap on samples per chunk.
pub const MAX_SAMPLES: usize = 240;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by chunk encoding and decoding.
#[derive(Debug, Error)]
pub enum ChunkError {
    /// Appending to a chunk that already holds [`MAX_SAMPLES`] samples.
    #[error("chunk is full ({MAX_SAMPLES} samples)")]
    Full,

    /// The bit stream ended before the declared sample count was decoded.
    #[error("chunk bit stream ended prematurely")]
    UnexpectedEnd,

    /// Structurally invalid chunk data.
    #[error("corrupt chunk: {0}")]
    Corrupt(String),
}

// ------------------------------------------------------------------------------------------------
// Sample
// ------------------------------------------------------------------------------------------------

/// A single datum: millisecond timestamp and float value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    /// Milliseconds since the UNIX epoch.
    pub timestamp: i64,

    /// Sample value.
    pub value: f64,
}

impl Sample {
    /// Construct a sample.
    pub fn new(timestamp: i64, value: f64) -> Self {
        Self { timestamp, value }
    }
}

// ------------------------------------------------------------------------------------------------
// Bit stream primitives
// ------------------------------------------------------------------------------------------------

/// Append-only bit buffer, most-significant bit first within each byte.
#[derive(Debug, Clone, Default)]
struct BitWriter {
    bytes: Vec<u8>,
    /// Unused bits remaining in the final byte (0 when byte-aligned).
    remaining: u8,
}

impl BitWriter {
    fn write_bit(&mut self, bit: bool) {
        if self.remaining == 0 {
            self.bytes.push(0);
            self.remaining = 8;
        }
        self.remaining -= 1;
        if bit {
            let last = self.bytes.len() - 1;
            self.bytes[last] |= 1 << self.remaining;
        }
    }

    /// Write the low `count` bits of `value`, most-significant first.
    fn write_bits(&mut self, value: u64, count: u8) {
        for i in (0..count).rev() {
            self.write_bit((value >> i) & 1 == 1);
        }
    }
}

/// Sequential reader over a [`BitWriter`]-produced stream.
struct BitReader<'a> {
    bytes: &'a [u8],
    /// Absolute bit cursor.
    pos: usize,
}

impl<'a> BitReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn read_bit(&mut self) -> Result<bool, ChunkError> {
        let byte = self
            .bytes
            .get(self.pos / 8)
            .copied()
            .ok_or(ChunkError::UnexpectedEnd)?;
        let bit = (byte >> (7 - (self.pos % 8) as u8)) & 1 == 1;
        self.pos += 1;
        Ok(bit)
    }

    fn read_bits(&mut self, count: u8) -> Result<u64, ChunkError> {
        let mut value = 0u64;
        for _ in 0..count {
            value = (value << 1) | u64::from(self.read_bit()?);
        }
        Ok(value)
    }
}

// ------------------------------------------------------------------------------------------------
// Variable-width signed integers (delta-of-delta buckets)
//
// Prefix codes:  '0' → zero, '10' → 14-bit, '110' → 17-bit,
// '1110' → 20-bit, '1111' → raw 64-bit two's complement.
// ------------------------------------------------------------------------------------------------

fn fits_signed(value: i64, bits: u8) -> bool {
    let half = 1i64 << (bits - 1);
    (-half..half).contains(&value)
}

fn write_varbit_int(w: &mut BitWriter, value: i64) {
    if value == 0 {
        w.write_bit(false);
    } else if fits_signed(value, 14) {
        w.write_bits(0b10, 2);
        w.write_bits(value as u64 & ((1 << 14) - 1), 14);
    } else if fits_signed(value, 17) {
        w.write_bits(0b110, 3);
        w.write_bits(value as u64 & ((1 << 17) - 1), 17);
    } else if fits_signed(value, 20) {
        w.write_bits(0b1110, 4);
        w.write_bits(value as u64 & ((1 << 20) - 1), 20);
    } else {
        w.write_bits(0b1111, 4);
        w.write_bits(value as u64, 64);
    }
}

fn read_varbit_int(r: &mut BitReader<'_>) -> Result<i64, ChunkError> {
    if !r.read_bit()? {
        return Ok(0);
    }
    let payload_bits = if !r.read_bit()? {
        14
    } else if !r.read_bit()? {
        17
    } else if !r.read_bit()? {
        20
    } else {
        return Ok(r.read_bits(64)? as i64);
    };

    let raw = r.read_bits(payload_bits)?;
    let half = 1u64 << (payload_bits - 1);
    if raw >= half {
        Ok(raw as i64 - (1i64 << payload_bits))
    } else {
        Ok(raw as i64)
    }
}

// ------------------------------------------------------------------------------------------------
// ChunkAppender
// ------------------------------------------------------------------------------------------------

/// Sentinel meaning "no XOR window established yet".
const NO_WINDOW: u8 = 0xFF;

/// Incremental Gorilla encoder for one chunk.
///
/// Accepts samples in arrival order; deltas are signed, so mildly
/// out-of-order timestamps (within the head's acceptance window) encode
/// correctly. Callers decide when to seal via [`ChunkAppender::is_full`].
#[derive(Debug, Clone)]
pub struct ChunkAppender {
    stream: BitWriter,
    num: u16,

    first_ts: i64,
    prev_ts: i64,
    prev_delta: i64,

    prev_value_bits: u64,
    /// Leading-zero count of the current XOR window; [`NO_WINDOW`] until
    /// the first non-zero XOR.
    leading: u8,
    trailing: u8,
}

impl ChunkAppender {
    /// Create an empty appender.
    pub fn new() -> Self {
        Self {
            stream: BitWriter::default(),
            num: 0,
            first_ts: 0,
            prev_ts: 0,
            prev_delta: 0,
            prev_value_bits: 0,
            leading: NO_WINDOW,
            trailing: 0,
        }
    }

    /// Number of samples appended so far.
    pub fn num_samples(&self) -> usize {
        self.num as usize
    }

    /// True when no samples have been appended.
    pub fn is_empty(&self) -> bool {
        self.num == 0
    }

    /// Timestamp of the first appended sample.
    pub fn first_timestamp(&self) -> Option<i64> {
        (self.num > 0).then_some(self.first_ts)
    }

    /// Timestamp of the most recently appended sample.
    pub fn last_timestamp(&self) -> Option<i64> {
        (self.num > 0).then_some(self.prev_ts)
    }

    /// True once the soft sizing policy says this chunk should be sealed:
    /// [`TARGET_SAMPLES`] samples or [`TARGET_SPAN_MS`] of covered time.
    pub fn is_full(&self) -> bool {
        if self.num as usize >= TARGET_SAMPLES {
            return true;
        }
        self.num > 0 && self.prev_ts.saturating_sub(self.first_ts) >= TARGET_SPAN_MS
    }

    /// Append one sample.
    ///
    /// Fails with [`ChunkError::Full`] at the [`MAX_SAMPLES`] hard cap.
    pub fn append(&mut self, sample: Sample) -> Result<(), ChunkError> {
        if self.num as usize >= MAX_SAMPLES {
            return Err(ChunkError::Full);
        }

        let ts = sample.timestamp;
        let bits = sample.value.to_bits();

        if self.num == 0 {
            self.stream.write_bits(ts as u64, 64);
            self.stream.write_bits(bits, 64);
            self.first_ts = ts;
            self.prev_ts = ts;
            self.prev_delta = 0;
            self.prev_value_bits = bits;
            self.num = 1;
            return Ok(());
        }

        // Timestamp: delta-of-delta against the previous delta. Wrapping
        // arithmetic keeps full-range i64 timestamps well-defined; the
        // decoder mirrors it, so round trips stay exact.
        let delta = ts.wrapping_sub(self.prev_ts);
        write_varbit_int(&mut self.stream, delta.wrapping_sub(self.prev_delta));
        self.prev_ts = ts;
        self.prev_delta = delta;

        // Value: XOR against the previous value bits.
        let xor = bits ^ self.prev_value_bits;
        self.prev_value_bits = bits;

        if xor == 0 {
            self.stream.write_bit(false);
        } else {
            self.stream.write_bit(true);

            let leading = (xor.leading_zeros() as u8).min(31);
            let trailing = xor.trailing_zeros() as u8;

            if self.leading != NO_WINDOW && leading >= self.leading && trailing >= self.trailing
            {
                // Reuse the previous window.
                self.stream.write_bit(false);
                let width = 64 - self.leading - self.trailing;
                self.stream.write_bits(xor >> self.trailing, width);
            } else {
                // Open a new window: 5 bits leading, 6 bits significant
                // width (64 is stored as 0), then the significant bits.
                self.leading = leading;
                self.trailing = trailing;
                let width = 64 - leading - trailing;

                self.stream.write_bit(true);
                self.stream.write_bits(u64::from(leading), 5);
                self.stream.write_bits(u64::from(width) & 0x3F, 6);
                self.stream.write_bits(xor >> trailing, width);
            }
        }

        self.num += 1;
        Ok(())
    }

    /// Encode the current contents without consuming the appender.
    ///
    /// Used to read the open head chunk during queries; the padding bits
    /// of a partially-filled final byte are ignored by the decoder.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + self.stream.bytes.len());
        out.extend_from_slice(&self.num.to_le_bytes());
        out.extend_from_slice(&self.stream.bytes);
        out
    }

    /// Seal the appender into its final encoded form.
    pub fn finish(self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + self.stream.bytes.len());
        out.extend_from_slice(&self.num.to_le_bytes());
        out.extend_from_slice(&self.stream.bytes);
        out
    }
}

impl Default for ChunkAppender {
    fn default() -> Self {
        Self::new()
    }
}

// ------------------------------------------------------------------------------------------------
// ChunkIter — streaming decoder
// ------------------------------------------------------------------------------------------------

/// Streaming decoder over an encoded chunk.
///
/// Yields exactly the number of samples declared in the header; a stream
/// that ends early surfaces [`ChunkError::UnexpectedEnd`].
pub struct ChunkIter<'a> {
    reader: BitReader<'a>,
    remaining: u16,
    total: u16,

    prev_ts: i64,
    prev_delta: i64,
    prev_value_bits: u64,
    leading: u8,
    trailing: u8,

    failed: bool,
}

impl<'a> ChunkIter<'a> {
    /// Open a decoder over `[num_samples u16 LE][bit stream]` bytes.
    pub fn new(encoded: &'a [u8]) -> Result<Self, ChunkError> {
        if encoded.len() < 2 {
            return Err(ChunkError::Corrupt("missing sample count header".into()));
        }
        let num = u16::from_le_bytes([encoded[0], encoded[1]]);
        Ok(Self {
            reader: BitReader::new(&encoded[2..]),
            remaining: num,
            total: num,
            prev_ts: 0,
            prev_delta: 0,
            prev_value_bits: 0,
            leading: NO_WINDOW,
            trailing: 0,
            failed: false,
        })
    }

    /// Total samples declared by the chunk header.
    pub fn num_samples(&self) -> usize {
        self.total as usize
    }

    fn next_sample(&mut self) -> Result<Sample, ChunkError> {
        if self.remaining == self.total {
            // First sample: raw 64-bit timestamp and value bits.
            self.prev_ts = self.reader.read_bits(64)? as i64;
            self.prev_value_bits = self.reader.read_bits(64)?;
            return Ok(Sample::new(self.prev_ts, f64::from_bits(self.prev_value_bits)));
        }

        let dod = read_varbit_int(&mut self.reader)?;
        self.prev_delta = self.prev_delta.wrapping_add(dod);
        self.prev_ts = self.prev_ts.wrapping_add(self.prev_delta);

        if self.reader.read_bit()? {
            if self.reader.read_bit()? {
                // New window.
                self.leading = self.reader.read_bits(5)? as u8;
                let mut width = self.reader.read_bits(6)? as u8;
                if width == 0 {
                    width = 64;
                }
                if u16::from(self.leading) + u16::from(width) > 64 {
                    return Err(ChunkError::Corrupt("XOR window exceeds 64 bits".into()));
                }
                self.trailing = 64 - self.leading - width;
            } else if self.leading == NO_WINDOW {
                return Err(ChunkError::Corrupt("window reuse before any window".into()));
            }
            let width = 64 - self.leading - self.trailing;
            let xor = self.reader.read_bits(width)? << self.trailing;
            self.prev_value_bits ^= xor;
        }

        Ok(Sample::new(self.prev_ts, f64::from_bits(self.prev_value_bits)))
    }
}

impl Iterator for ChunkIter<'_> {
    type Item = Result<Sample, ChunkError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.remaining == 0 {
            return None;
        }
        match self.next_sample() {
            Ok(sample) => {
                self.remaining -= 1;
                Some(Ok(sample))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// Decode a full chunk into a sample vector.
pub fn decode(encoded: &[u8]) -> Result<Vec<Sample>, ChunkError> {
    let iter = ChunkIter::new(encoded)?;
    let mut samples = Vec::with_capacity(iter.num_samples());
    for sample in iter {
        samples.push(sample?);
    }
    Ok(samples)
}
