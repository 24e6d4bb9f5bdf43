//! End-to-end scenarios exercising the full engine surface through the
//! public API only.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use tempusdb::block::BLOCKS_DIR;
use tempusdb::chunk::Sample;
use tempusdb::engine::{Metrics, Options, SystemClock, Tsdb, TsdbError};
use tempusdb::labels::{Labels, MatchOp, Matcher, parse_selector};
use tempusdb::wal::SyncPolicy;

fn options(dir: &std::path::Path) -> Options {
    let mut opts = Options::new(dir);
    opts.wal_sync = SyncPolicy::Always;
    opts.enable_compaction = false;
    opts.enable_retention = false;
    opts.flush_interval = Duration::from_secs(3600);
    opts.retention_period = Duration::ZERO;
    opts
}

fn open(dir: &std::path::Path) -> (Tsdb, Arc<Metrics>) {
    let metrics = Arc::new(Metrics::default());
    let db = Tsdb::open_with(options(dir), Arc::clone(&metrics), Arc::new(SystemClock)).unwrap();
    (db, metrics)
}

fn labels(pairs: &[(&str, &str)]) -> Labels {
    Labels::from_pairs(pairs.iter().copied()).unwrap()
}

/// Scenario: a single series round-trips exactly.
#[test]
fn scenario_single_series_round_trip() {
    let tmp = TempDir::new().unwrap();
    let (db, _) = open(tmp.path());

    let series = labels(&[("__name__", "cpu"), ("host", "s1")]);
    db.insert(
        &series,
        &[
            Sample::new(1000, 1.0),
            Sample::new(2000, 2.0),
            Sample::new(3000, 3.0),
        ],
    )
    .unwrap();

    let matchers = parse_selector(r#"cpu{host="s1"}"#).unwrap();
    let results = db.query(&matchers, 0, 5000).unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].labels, series);
    let got: Vec<(i64, f64)> = results[0]
        .samples
        .iter()
        .map(|s| (s.timestamp, s.value))
        .collect();
    assert_eq!(got, vec![(1000, 1.0), (2000, 2.0), (3000, 3.0)]);
    db.close().unwrap();
}

/// Scenario: a crash between WAL and flush loses nothing under
/// `sync=always`.
#[test]
fn scenario_crash_before_flush_preserves_all_samples() {
    let tmp = TempDir::new().unwrap();
    let (db, _) = open(tmp.path());

    let series = labels(&[("__name__", "cpu"), ("host", "s1")]);
    let samples: Vec<Sample> = (0..1000)
        .map(|i| Sample::new(1000 + i as i64 * 250, i as f64 * 0.5))
        .collect();
    db.insert(&series, &samples).unwrap();

    // Kill the process before any flush: no close, no drop.
    std::mem::forget(db);

    let (db, _) = open(tmp.path());
    let results = db
        .query(&[Matcher::new(MatchOp::Eq, "host", "s1").unwrap()], 0, i64::MAX)
        .unwrap();
    assert_eq!(results[0].samples.len(), 1000);
    for (got, want) in results[0].samples.iter().zip(&samples) {
        assert_eq!(got.timestamp, want.timestamp);
        assert_eq!(got.value.to_bits(), want.value.to_bits());
    }
    db.close().unwrap();
}

/// Scenario: out-of-order rejection leaves no WAL trace.
#[test]
fn scenario_out_of_order_rejection() {
    let tmp = TempDir::new().unwrap();
    let (db, _) = open(tmp.path());

    let series = labels(&[("__name__", "cpu")]);
    db.insert(&series, &[Sample::new(2000, 1.0)]).unwrap();

    let err = db.insert(&series, &[Sample::new(1500, 9.0)]).unwrap_err();
    assert!(matches!(err, TsdbError::OutOfOrder { timestamp: 1500, .. }));

    // Crash and replay: the rejected sample must not exist anywhere.
    std::mem::forget(db);
    let (db, _) = open(tmp.path());
    let results = db.query(&[], 0, i64::MAX).unwrap();
    let ts: Vec<i64> = results[0].samples.iter().map(|s| s.timestamp).collect();
    assert_eq!(ts, vec![2000]);
    db.close().unwrap();
}

/// Scenario: matcher intersection over A={m=x,h=1}, B={m=x,h=2},
/// C={m=y,h=1}.
#[test]
fn scenario_matcher_intersection() {
    let tmp = TempDir::new().unwrap();
    let (db, _) = open(tmp.path());

    let a = labels(&[("m", "x"), ("h", "1")]);
    let b = labels(&[("m", "x"), ("h", "2")]);
    let c = labels(&[("m", "y"), ("h", "1")]);
    for series in [&a, &b, &c] {
        db.insert(series, &[Sample::new(1000, 1.0)]).unwrap();
    }

    let query = |selector: &str| -> Vec<Labels> {
        db.query(&parse_selector(selector).unwrap(), 0, 10_000)
            .unwrap()
            .into_iter()
            .map(|r| r.labels)
            .collect()
    };

    let got = query(r#"{m="x"}"#);
    assert_eq!(got.len(), 2);
    assert!(got.contains(&a) && got.contains(&b));

    assert_eq!(query(r#"{m="x", h="1"}"#), vec![a.clone()]);
    assert_eq!(query(r#"{h!="1"}"#), vec![b.clone()]);

    let got = query(r#"{m=~"x|y", h="1"}"#);
    assert_eq!(got.len(), 2);
    assert!(got.contains(&a) && got.contains(&c));
    db.close().unwrap();
}

/// Scenario: compaction merges two disjoint blocks and removes the
/// sources.
#[test]
fn scenario_compaction_merges_blocks() {
    let tmp = TempDir::new().unwrap();
    let (db, _) = open(tmp.path());
    let series = labels(&[("__name__", "cpu"), ("host", "s1")]);

    // Three blocks so the leveled threshold fires; the first two carry
    // the contiguous [0,100) and [100,200) ranges under test.
    db.insert(
        &series,
        &(0..100).map(|i| Sample::new(i, i as f64)).collect::<Vec<_>>(),
    )
    .unwrap();
    db.flush().unwrap();
    db.insert(
        &series,
        &(100..200).map(|i| Sample::new(i, i as f64)).collect::<Vec<_>>(),
    )
    .unwrap();
    db.flush().unwrap();
    db.insert(
        &series,
        &(200..300).map(|i| Sample::new(i, i as f64)).collect::<Vec<_>>(),
    )
    .unwrap();
    db.flush().unwrap();

    let mut sources: Vec<String> = std::fs::read_dir(tmp.path().join(BLOCKS_DIR))
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    sources.sort();

    assert!(db.compact().unwrap());

    let results = db.query(&[], 0, 199).unwrap();
    assert_eq!(results[0].samples.len(), 200);
    for (i, sample) in results[0].samples.iter().enumerate() {
        assert_eq!(sample.timestamp, i as i64);
        assert_eq!(sample.value, i as f64);
    }

    // Source directories are gone; the merged block records its lineage.
    let remaining: Vec<String> = std::fs::read_dir(tmp.path().join(BLOCKS_DIR))
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    assert_eq!(remaining.len(), 1);
    for source in &sources {
        assert!(!remaining.contains(source));
    }
    let meta: tempusdb::block::BlockMeta = serde_json::from_slice(
        &std::fs::read(
            tmp.path()
                .join(BLOCKS_DIR)
                .join(&remaining[0])
                .join("meta.json"),
        )
        .unwrap(),
    )
    .unwrap();
    assert_eq!(meta.compaction.level, 1);
    let mut listed = meta.compaction.sources.clone();
    listed.sort();
    assert_eq!(listed, sources);
    db.close().unwrap();
}

/// Scenario: a corrupt chunk is tolerated — skipped, counted, block
/// kept.
#[test]
fn scenario_corrupt_chunk_tolerance() {
    let tmp = TempDir::new().unwrap();
    let (db, _) = open(tmp.path());
    let series = labels(&[("__name__", "cpu"), ("host", "s1")]);

    // Three full chunks.
    let samples: Vec<Sample> = (0..360).map(|i| Sample::new(i * 1000, i as f64)).collect();
    db.insert(&series, &samples).unwrap();
    db.flush().unwrap();
    db.close().unwrap();

    // Flip bytes in the middle of the chunks file.
    let block_dir = std::fs::read_dir(tmp.path().join(BLOCKS_DIR))
        .unwrap()
        .next()
        .unwrap()
        .unwrap()
        .path();
    let chunks_path = block_dir.join("chunks");
    let mut bytes = std::fs::read(&chunks_path).unwrap();
    let mid = bytes.len() / 2;
    bytes[mid] ^= 0xFF;
    bytes[mid + 1] ^= 0xFF;
    std::fs::write(&chunks_path, &bytes).unwrap();

    let (db, metrics) = open(tmp.path());
    let results = db.query(&[], 0, i64::MAX).unwrap();

    assert_eq!(results[0].samples.len(), 240, "two intact chunks answer");
    assert_eq!(Metrics::get(&metrics.corrupt_chunks), 1);
    assert!(block_dir.exists(), "block must not be deleted");
    db.close().unwrap();
}

/// Equal timestamps within one series are distinct accepted samples and
/// survive the head, flush, compaction, and crash recovery.
#[test]
fn scenario_equal_timestamp_samples_preserved() {
    let tmp = TempDir::new().unwrap();
    let (db, _) = open(tmp.path());
    let series = labels(&[("__name__", "cpu"), ("host", "s1")]);

    let expect = |db: &Tsdb, want: &[(i64, f64)]| {
        let results = db.query(&[], 0, i64::MAX).unwrap();
        let got: Vec<(i64, f64)> = results[0]
            .samples
            .iter()
            .map(|s| (s.timestamp, s.value))
            .collect();
        assert_eq!(got, want);
    };

    // Two samples at ts=100 in one batch, a third at the same instant
    // from a later batch.
    db.insert(
        &series,
        &[
            Sample::new(100, 1.0),
            Sample::new(100, 2.0),
            Sample::new(200, 3.0),
        ],
    )
    .unwrap();
    db.insert(&series, &[Sample::new(200, 4.0)]).unwrap();
    let want = [(100, 1.0), (100, 2.0), (200, 3.0), (200, 4.0)];
    expect(&db, &want);

    // Through a flush.
    db.flush().unwrap();
    expect(&db, &want);

    // Through compaction (two more blocks reach the merge threshold).
    db.insert(&series, &[Sample::new(300, 5.0)]).unwrap();
    db.flush().unwrap();
    db.insert(&series, &[Sample::new(400, 6.0)]).unwrap();
    db.flush().unwrap();
    assert!(db.compact().unwrap());
    let want_all = [
        (100, 1.0),
        (100, 2.0),
        (200, 3.0),
        (200, 4.0),
        (300, 5.0),
        (400, 6.0),
    ];
    expect(&db, &want_all);

    // Through a crash and replay.
    std::mem::forget(db);
    let (db, _) = open(tmp.path());
    expect(&db, &want_all);
    db.close().unwrap();
}

/// Durability + ordering invariant: everything inserted is returned in
/// strictly non-decreasing timestamp order after flushes and reopens.
#[test]
fn scenario_mixed_lifecycle_ordering() {
    let tmp = TempDir::new().unwrap();
    let (db, _) = open(tmp.path());
    let series = labels(&[("__name__", "req_total"), ("zone", "eu")]);

    db.insert(&series, &(0..500).map(|i| Sample::new(i * 10, 1.0)).collect::<Vec<_>>())
        .unwrap();
    db.flush().unwrap();
    db.insert(
        &series,
        &(500..900).map(|i| Sample::new(i * 10, 2.0)).collect::<Vec<_>>(),
    )
    .unwrap();
    db.close().unwrap();

    let (db, _) = open(tmp.path());
    let results = db.query(&[], 0, i64::MAX).unwrap();
    let samples = &results[0].samples;
    assert_eq!(samples.len(), 900);
    assert!(samples.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    db.close().unwrap();
}
