use tracing_subscriber::EnvFilter;

use crate::chunk::Sample;
use crate::labels::Labels;
use crate::wal::{WalRecord, replay};
use std::path::Path;

/// Initialize a tracing subscriber controlled by `RUST_LOG`.
/// Safe to call multiple times — only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A small deterministic series identity for record tests.
pub fn labels(host: &str) -> Labels {
    Labels::from_pairs([("__name__", "cpu"), ("host", host)]).unwrap()
}

/// `n` samples starting at `start_ts`, 1 s apart.
pub fn samples(start_ts: i64, n: usize) -> Vec<Sample> {
    (0..n)
        .map(|i| Sample::new(start_ts + i as i64 * 1000, i as f64))
        .collect()
}

/// Replay every record from the WAL directory, asserting no corruption.
pub fn collect_clean(dir: &Path) -> Vec<WalRecord> {
    let mut replayer = replay(dir).unwrap();
    let records: Vec<WalRecord> = replayer.by_ref().map(|r| r.unwrap()).collect();
    assert_eq!(replayer.corruptions(), 0, "unexpected WAL corruption");
    records
}
