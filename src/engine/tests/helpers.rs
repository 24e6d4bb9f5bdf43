use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use crate::chunk::Sample;
use crate::engine::{ManualClock, Metrics, Options, Tsdb};
use crate::labels::{Labels, MatchOp, Matcher};
use crate::wal::SyncPolicy;

/// Initialize a tracing subscriber controlled by `RUST_LOG`.
/// Safe to call multiple times — only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Options tuned for tests: always-sync WAL, no background activity.
///
/// Background loops stay enabled only where a test opts in; tests drive
/// flush/compact/retain explicitly for determinism.
pub fn test_options(dir: &Path) -> Options {
    let mut opts = Options::new(dir);
    opts.wal_sync = SyncPolicy::Always;
    opts.enable_compaction = false;
    opts.enable_retention = false;
    opts.flush_interval = Duration::from_secs(3600);
    opts.retention_period = Duration::ZERO;
    opts
}

/// Open an engine with a manual clock and fresh metrics.
pub fn open_test_db(dir: &Path) -> (Tsdb, Arc<Metrics>, Arc<ManualClock>) {
    open_test_db_with(test_options(dir))
}

/// Same, but with caller-tweaked options.
pub fn open_test_db_with(opts: Options) -> (Tsdb, Arc<Metrics>, Arc<ManualClock>) {
    init_tracing();
    let metrics = Arc::new(Metrics::default());
    let clock = Arc::new(ManualClock::new(1_000_000));
    let clock_handle: Arc<dyn crate::engine::Clock> = clock.clone();
    let db = Tsdb::open_with(opts, Arc::clone(&metrics), clock_handle).unwrap();
    (db, metrics, clock)
}

/// `{__name__=<metric>, host=<host>}`.
pub fn series(metric: &str, host: &str) -> Labels {
    Labels::from_pairs([("__name__", metric), ("host", host)]).unwrap()
}

/// `n` samples starting at `start_ts`, `step_ms` apart, values 0,1,2,…
pub fn ramp(start_ts: i64, n: usize, step_ms: i64) -> Vec<Sample> {
    (0..n)
        .map(|i| Sample::new(start_ts + i as i64 * step_ms, i as f64))
        .collect()
}

/// Equality matcher.
pub fn eq(name: &str, value: &str) -> Matcher {
    Matcher::new(MatchOp::Eq, name, value).unwrap()
}

/// Collect `(timestamp, value)` pairs of the only series in a result.
pub fn only_series_samples(results: &[crate::engine::SeriesSamples]) -> Vec<(i64, f64)> {
    assert_eq!(results.len(), 1, "expected exactly one series");
    results[0]
        .samples
        .iter()
        .map(|s| (s.timestamp, s.value))
        .collect()
}
