//! Series identity — labels, fingerprints, and matchers.
//!
//! A series is identified by its set of `name=value` label pairs. One
//! distinguished label (`__name__`) conventionally carries the metric name.
//! Label names must match `[a-zA-Z_][a-zA-Z0-9_]*`; values are arbitrary
//! UTF-8. Within a set, names are unique and kept sorted so that identity
//! is order-independent.
//!
//! ## Fingerprints
//!
//! The primary series key is a 64-bit **fingerprint**: xxHash-64 over the
//! sorted labels formatted as `name\x00value\x00…`. The hash is stable
//! across runs and platforms. Collisions are resolved by storing the full
//! label set next to the fingerprint and re-checking on lookup.
//!
//! ## Matchers
//!
//! Queries select series with matchers: `=`, `!=`, `=~`, `!~`. Regex
//! matchers are implicitly anchored to the full value. A matcher set
//! evaluates with AND semantics; the empty set matches every series.
//! A matcher against an absent label behaves as if the value were the
//! empty string, so `host!="a"` also selects series without a `host`
//! label.
//!
//! ## Selector grammar
//!
//! [`parse_selector`] accepts the PromQL-style form
//! `metric{name="value", other=~"re.*"}` (metric prefix and braces both
//! optional). Values are double-quoted with `\"`, `\\`, `\n`, `\t`
//! escapes, so commas and braces inside values are unambiguous.


use std::fmt;

use regex::Regex;
use thiserror::Error;
use xxhash_rust::xxh64::Xxh64;

use crate::encoding::{self, EncodingError};

/// The label under which the metric name is stored by convention.
pub const METRIC_NAME: &str = "__name__";

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors for label construction, matcher construction, and selector parsing.
#[derive(Debug, Error)]
pub enum LabelError {
    /// A label or matcher name failed the `[a-zA-Z_][a-zA-Z0-9_]*` rule.
    #[error("invalid label name: {0:?}")]
    InvalidName(String),

    /// Two labels in one set share the same name.
    #[error("duplicate label name: {0:?}")]
    DuplicateName(String),

    /// A regex matcher value failed to compile.
    #[error("invalid regex {pattern:?}: {source}")]
    InvalidRegex {
        /// Pattern as written in the matcher.
        pattern: String,
        /// Underlying regex compile error.
        source: regex::Error,
    },

    /// A selector string failed to parse.
    #[error("selector parse error at byte {pos}: {msg}")]
    Selector {
        /// Byte offset of the failure in the input.
        pos: usize,
        /// Human-readable description.
        msg: String,
    },
}

// ------------------------------------------------------------------------------------------------
// Label / Labels
// ------------------------------------------------------------------------------------------------

/// A single `name=value` pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Label {
    /// Label name, matching `[a-zA-Z_][a-zA-Z0-9_]*`.
    pub name: String,

    /// Label value, arbitrary UTF-8.
    pub value: String,
}

/// An immutable, sorted, duplicate-free label set identifying one series.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Labels(Vec<Label>);

/// Returns true if `name` is a valid label name.
pub fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl Labels {
    /// Build a label set from `(name, value)` pairs.
    ///
    /// Pairs are sorted by name; invalid or duplicate names are rejected.
    pub fn from_pairs<N, V>(pairs: impl IntoIterator<Item = (N, V)>) -> Result<Self, LabelError>
    where
        N: Into<String>,
        V: Into<String>,
    {
        let labels = pairs
            .into_iter()
            .map(|(name, value)| Label {
                name: name.into(),
                value: value.into(),
            })
            .collect();
        Self::from_vec(labels)
    }

    /// Build a label set from already-constructed [`Label`] values.
    pub fn from_vec(mut labels: Vec<Label>) -> Result<Self, LabelError> {
        for label in &labels {
            if !is_valid_name(&label.name) {
                return Err(LabelError::InvalidName(label.name.clone()));
            }
        }
        labels.sort();
        for pair in labels.windows(2) {
            if pair[0].name == pair[1].name {
                return Err(LabelError::DuplicateName(pair[0].name.clone()));
            }
        }
        Ok(Self(labels))
    }

    /// Value of the label `name`, if present.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .binary_search_by(|l| l.name.as_str().cmp(name))
            .ok()
            .map(|i| self.0[i].value.as_str())
    }

    /// The metric name (`__name__` label), if present.
    pub fn metric_name(&self) -> Option<&str> {
        self.get(METRIC_NAME)
    }

    /// Iterate labels in name order.
    pub fn iter(&self) -> impl Iterator<Item = &Label> {
        self.0.iter()
    }

    /// Number of labels in the set.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when the set has no labels.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Stable 64-bit fingerprint of this label set.
    ///
    /// Computed with xxHash-64 (seed 0) over the sorted labels formatted
    /// as `name\x00value\x00…`. Deterministic across runs and platforms —
    /// fingerprints are persisted in the WAL and block indices.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = Xxh64::new(0);
        for label in &self.0 {
            hasher.update(label.name.as_bytes());
            hasher.update(&[0]);
            hasher.update(label.value.as_bytes());
            hasher.update(&[0]);
        }
        hasher.digest()
    }
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, label) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={:?}", label.name, label.value)?;
        }
        write!(f, "}}")
    }
}

impl encoding::Encode for Label {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        encoding::Encode::encode_to(&self.name, buf)?;
        encoding::Encode::encode_to(&self.value, buf)?;
        Ok(())
    }
}

impl encoding::Decode for Label {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (name, n) = String::decode_from(&buf[offset..])?;
        offset += n;
        let (value, n) = String::decode_from(&buf[offset..])?;
        offset += n;
        Ok((Self { name, value }, offset))
    }
}

impl encoding::Encode for Labels {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        encoding::encode_vec(&self.0, buf)
    }
}

impl encoding::Decode for Labels {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (labels, n) = encoding::decode_vec::<Label>(buf)?;
        // Stored sets were validated and sorted at construction; a decode
        // that violates that indicates corruption upstream.
        Labels::from_vec(labels)
            .map(|l| (l, n))
            .map_err(|e| EncodingError::Custom(e.to_string()))
    }
}

// ------------------------------------------------------------------------------------------------
// Matchers
// ------------------------------------------------------------------------------------------------

/// Comparison operator of a [`Matcher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOp {
    /// `name="value"` — exact equality.
    Eq,
    /// `name!="value"` — exact inequality.
    Neq,
    /// `name=~"re"` — full-string regex match.
    Re,
    /// `name!~"re"` — full-string regex non-match.
    NotRe,
}

impl fmt::Display for MatchOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Eq => "=",
            Self::Neq => "!=",
            Self::Re => "=~",
            Self::NotRe => "!~",
        };
        f.write_str(s)
    }
}

/// A single predicate on one label.
#[derive(Debug, Clone)]
pub struct Matcher {
    /// Label name the predicate applies to.
    pub name: String,

    /// Comparison operator.
    pub op: MatchOp,

    /// Right-hand value or regex pattern as written.
    pub value: String,

    /// Compiled regex for `Re`/`NotRe`, anchored to the full value.
    re: Option<Regex>,
}

impl Matcher {
    /// Construct a matcher, validating the name and compiling the regex
    /// for `=~`/`!~` operators.
    pub fn new(
        op: MatchOp,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<Self, LabelError> {
        let name = name.into();
        let value = value.into();

        if !is_valid_name(&name) {
            return Err(LabelError::InvalidName(name));
        }

        let re = match op {
            MatchOp::Re | MatchOp::NotRe => {
                // Implicit full-string anchoring, mirroring PromQL.
                let anchored = format!("^(?:{value})$");
                Some(
                    Regex::new(&anchored).map_err(|source| LabelError::InvalidRegex {
                        pattern: value.clone(),
                        source,
                    })?,
                )
            }
            MatchOp::Eq | MatchOp::Neq => None,
        };

        Ok(Self {
            name,
            op,
            value,
            re,
        })
    }

    /// Evaluate this matcher against a raw label value.
    ///
    /// Absent labels are represented by the empty string.
    pub fn matches_value(&self, value: &str) -> bool {
        match self.op {
            MatchOp::Eq => value == self.value,
            MatchOp::Neq => value != self.value,
            MatchOp::Re => self.re.as_ref().is_some_and(|re| re.is_match(value)),
            MatchOp::NotRe => !self.re.as_ref().is_some_and(|re| re.is_match(value)),
        }
    }

    /// Evaluate this matcher against a label set.
    pub fn matches(&self, labels: &Labels) -> bool {
        self.matches_value(labels.get(&self.name).unwrap_or(""))
    }

    /// True if the matcher can only select series that *have* the label
    /// with a concrete non-empty requirement (`=` to a non-empty value).
    ///
    /// Used by index resolution to pick cheap postings first.
    pub fn is_exact(&self) -> bool {
        self.op == MatchOp::Eq && !self.value.is_empty()
    }
}

impl fmt::Display for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{:?}", self.name, self.op, self.value)
    }
}

/// Evaluate a full matcher set (AND semantics) against a label set.
///
/// The empty set matches every series.
pub fn matches_all(labels: &Labels, matchers: &[Matcher]) -> bool {
    matchers.iter().all(|m| m.matches(labels))
}

// ------------------------------------------------------------------------------------------------
// Selector parser
// ------------------------------------------------------------------------------------------------

/// Parse a PromQL-style series selector into matchers.
///
/// Accepted forms:
///
/// ```text
/// cpu_usage
/// cpu_usage{host="s1"}
/// {__name__="cpu_usage", host=~"s[0-9]+"}
/// {job!="ingest", zone!~"eu-.*"}
/// ```
///
/// A bare metric prefix becomes an `__name__="…"` equality matcher.
/// Values are double-quoted; `\"`, `\\`, `\n` and `\t` escapes are
/// recognised, so commas and braces inside values never split pairs.
pub fn parse_selector(input: &str) -> Result<Vec<Matcher>, LabelError> {
    let mut p = Parser {
        bytes: input.as_bytes(),
        pos: 0,
    };
    let mut matchers = Vec::new();

    p.skip_ws();

    // Optional bare metric name before the brace.
    let name_start = p.pos;
    while p.peek().is_some_and(|c| c.is_ascii_alphanumeric() || c == b'_' || c == b':') {
        p.pos += 1;
    }
    if p.pos > name_start {
        let metric = &input[name_start..p.pos];
        matchers.push(Matcher::new(MatchOp::Eq, METRIC_NAME, metric)?);
    }

    p.skip_ws();
    match p.peek() {
        None => {
            if matchers.is_empty() {
                return Err(p.err("empty selector"));
            }
            return Ok(matchers);
        }
        Some(b'{') => p.pos += 1,
        Some(_) => return Err(p.err("expected '{' after metric name")),
    }

    loop {
        p.skip_ws();
        if p.peek() == Some(b'}') {
            p.pos += 1;
            break;
        }

        let name = p.ident()?;
        p.skip_ws();
        let op = p.op()?;
        p.skip_ws();
        let value = p.quoted()?;
        matchers.push(Matcher::new(op, name, value)?);

        p.skip_ws();
        match p.peek() {
            Some(b',') => p.pos += 1,
            Some(b'}') => {}
            _ => return Err(p.err("expected ',' or '}' after matcher")),
        }
    }

    p.skip_ws();
    if p.pos != input.len() {
        return Err(p.err("trailing characters after selector"));
    }
    Ok(matchers)
}

struct Parser<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(|c| c.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }

    fn err(&self, msg: &str) -> LabelError {
        LabelError::Selector {
            pos: self.pos,
            msg: msg.to_string(),
        }
    }

    fn ident(&mut self) -> Result<String, LabelError> {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == b'_')
        {
            self.pos += 1;
        }
        if self.pos == start {
            return Err(self.err("expected label name"));
        }
        // Safe: only ASCII identifier bytes were consumed.
        Ok(String::from_utf8_lossy(&self.bytes[start..self.pos]).into_owned())
    }

    fn op(&mut self) -> Result<MatchOp, LabelError> {
        let op = match (self.peek(), self.bytes.get(self.pos + 1).copied()) {
            (Some(b'='), Some(b'~')) => {
                self.pos += 2;
                MatchOp::Re
            }
            (Some(b'='), _) => {
                self.pos += 1;
                MatchOp::Eq
            }
            (Some(b'!'), Some(b'=')) => {
                self.pos += 2;
                MatchOp::Neq
            }
            (Some(b'!'), Some(b'~')) => {
                self.pos += 2;
                MatchOp::NotRe
            }
            _ => return Err(self.err("expected one of '=', '!=', '=~', '!~'")),
        };
        Ok(op)
    }

    fn quoted(&mut self) -> Result<String, LabelError> {
        if self.peek() != Some(b'"') {
            return Err(self.err("expected '\"'"));
        }
        self.pos += 1;

        let mut out = Vec::new();
        loop {
            match self.peek() {
                None => return Err(self.err("unterminated string")),
                Some(b'"') => {
                    self.pos += 1;
                    break;
                }
                Some(b'\\') => {
                    self.pos += 1;
                    match self.peek() {
                        Some(b'"') => out.push(b'"'),
                        Some(b'\\') => out.push(b'\\'),
                        Some(b'n') => out.push(b'\n'),
                        Some(b't') => out.push(b'\t'),
                        _ => return Err(self.err("invalid escape sequence")),
                    }
                    self.pos += 1;
                }
                Some(c) => {
                    out.push(c);
                    self.pos += 1;
                }
            }
        }

        String::from_utf8(out).map_err(|_| self.err("value is not valid UTF-8"))
    }
}
