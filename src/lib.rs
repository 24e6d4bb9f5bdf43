//! # TempusDB
//!
//! An embeddable, persistent **time-series storage engine** for labeled
//! numeric metrics. Designed for high-rate monitoring ingest (many small
//! appends per series), crash-safe operation, and range queries driven by
//! label matchers.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                          Tsdb                              │
//! │  ┌─────────────┐   ┌──────────────┐   ┌────────────────┐   │
//! │  │    Head     │   │     WAL      │   │    Blocks      │   │
//! │  │ (per-series │   │ (segmented,  │   │ (immutable,    │   │
//! │  │  chunk bufs)│   │  CRC32C)     │   │  on disk)      │   │
//! │  └──────┬──────┘   └──────┬───────┘   └───────┬────────┘   │
//! │         │    flush        │  truncate         │            │
//! │         └──────────►      └─────────►         │            │
//! │                                               │            │
//! │  ┌────────────────────────────────────────────┘            │
//! │  │  Compaction (leveled) · Retention (.trash two-phase)    │
//! │  └─────────────────────────────────────────────────────────┤
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`engine`] | Core engine — open, insert, query, flush, compact, close |
//! | [`head`] | Sharded in-memory write buffer with per-series chunk builders |
//! | [`wal`] | Segmented, CRC32C-protected write-ahead log for crash recovery |
//! | [`block`] | Immutable on-disk blocks — chunks file, label index, meta.json |
//! | [`chunk`] | Gorilla compression — delta-of-delta timestamps, XOR values |
//! | [`index`] | Inverted label index — posting lists and matcher resolution |
//! | [`labels`] | Series identity — label sets, fingerprints, matchers |
//! | [`compact`] | Leveled compaction — merge adjacent blocks into larger ones |
//! | [`encoding`] | Deterministic binary encoding for on-disk structures |
//!
//! ## Key Features
//!
//! - **Write-ahead logging** — every accepted append is persisted to a WAL
//!   before being acknowledged, guaranteeing durability and crash recovery.
//! - **Gorilla chunk compression** — timestamps stored as delta-of-delta,
//!   values XOR-encoded, typically under two bytes per sample.
//! - **Inverted label index** — matcher expressions (`=`, `!=`, `=~`, `!~`)
//!   resolve to series via sorted posting-list intersection.
//! - **Failure-atomic blocks** — flush and compaction build blocks in a
//!   temp directory and publish them with a single rename.
//! - **Leveled compaction** — adjacent small blocks merge into larger ones,
//!   bounding file counts and long-run disk growth.
//! - **Bounded retention** — blocks past the retention horizon are removed
//!   via a two-phase `.trash/` rename.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tempusdb::engine::{Options, Tsdb};
//! use tempusdb::labels::{Labels, MatchOp, Matcher};
//! use tempusdb::chunk::Sample;
//!
//! let db = Tsdb::open(Options::new("/tmp/my_tsdb")).unwrap();
//!
//! // Write
//! let series = Labels::from_pairs([("__name__", "cpu_usage"), ("host", "s1")]).unwrap();
//! db.insert(&series, &[Sample::new(1_700_000_000_000, 0.42)]).unwrap();
//!
//! // Read
//! let matchers = vec![Matcher::new(MatchOp::Eq, "__name__", "cpu_usage").unwrap()];
//! let results = db.query(&matchers, 0, i64::MAX).unwrap();
//! for series in &results {
//!     println!("{} -> {} samples", series.labels, series.samples.len());
//! }
//!
//! // Graceful shutdown
//! db.close().unwrap();
//! ```

#![allow(dead_code)]

pub mod block;
pub mod chunk;
pub mod compact;
pub mod encoding;
pub mod engine;
pub mod head;
pub mod index;
pub mod labels;
pub mod wal;
