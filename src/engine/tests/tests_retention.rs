use std::time::Duration;

use tempfile::TempDir;

use super::helpers::{eq, open_test_db_with, ramp, series, test_options};
use crate::engine::Metrics;

#[test]
fn test_expired_blocks_are_deleted() {
    let tmp = TempDir::new().unwrap();
    let mut opts = test_options(tmp.path());
    opts.retention_period = Duration::from_secs(3600);
    let (db, metrics, clock) = open_test_db_with(opts);
    let s = series("cpu", "s1");

    // An old block and a recent block. The manual clock starts at
    // 1_000_000 ms; samples near 0 are ancient.
    db.insert(&s, &ramp(0, 10, 1000)).unwrap();
    db.flush().unwrap();
    clock.set(10_000_000);
    db.insert(&s, &ramp(9_990_000, 10, 1000)).unwrap();
    db.flush().unwrap();
    assert_eq!(db.stats().unwrap().num_blocks, 2);

    let deleted = db.retain().unwrap();
    assert_eq!(deleted, 1);
    assert_eq!(Metrics::get(&metrics.retention_deleted), 1);

    // Only the recent data remains.
    let results = db.query(&[eq("host", "s1")], 0, i64::MAX).unwrap();
    assert_eq!(results[0].samples.len(), 10);
    assert!(results[0].samples[0].timestamp >= 9_990_000);
    db.close().unwrap();
}

#[test]
fn test_blocks_inside_horizon_are_never_deleted() {
    let tmp = TempDir::new().unwrap();
    let mut opts = test_options(tmp.path());
    opts.retention_period = Duration::from_secs(3600);
    let (db, _, clock) = open_test_db_with(opts);
    let s = series("cpu", "s1");

    clock.set(5_000_000);
    // max_time = 4_509_000 ≥ cutoff (5_000_000 − 3_600_000).
    db.insert(&s, &ramp(4_500_000, 10, 1000)).unwrap();
    db.flush().unwrap();

    assert_eq!(db.retain().unwrap(), 0);
    assert_eq!(db.stats().unwrap().num_blocks, 1);
    db.close().unwrap();
}

#[test]
fn test_zero_retention_period_disables_deletion() {
    let tmp = TempDir::new().unwrap();
    let mut opts = test_options(tmp.path());
    opts.retention_period = Duration::ZERO;
    let (db, _, clock) = open_test_db_with(opts);

    db.insert(&series("cpu", "s1"), &ramp(0, 10, 1000)).unwrap();
    db.flush().unwrap();
    clock.set(i64::MAX / 2);

    assert_eq!(db.retain().unwrap(), 0);
    assert_eq!(db.stats().unwrap().num_blocks, 1);
    db.close().unwrap();
}

#[test]
fn test_boundary_block_at_exact_cutoff_survives() {
    let tmp = TempDir::new().unwrap();
    let mut opts = test_options(tmp.path());
    opts.retention_period = Duration::from_millis(1_000_000);
    let (db, _, clock) = open_test_db_with(opts);
    let s = series("cpu", "s1");

    // Block max_time lands exactly on the cutoff: now − retention.
    clock.set(2_000_000);
    db.insert(&s, &[crate::chunk::Sample::new(1_000_000, 1.0)]).unwrap();
    db.flush().unwrap();

    // max_time == cutoff → kept (only strictly-older blocks go).
    assert_eq!(db.retain().unwrap(), 0);
    assert_eq!(db.stats().unwrap().num_blocks, 1);
    db.close().unwrap();
}
