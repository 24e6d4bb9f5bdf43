use tempfile::TempDir;

use super::helpers::{eq, only_series_samples, open_test_db, ramp, series};
use crate::chunk::Sample;
use crate::engine::{CancelToken, QueryOpts, TsdbError};
use crate::labels::{Labels, MatchOp, Matcher};

#[test]
fn test_single_series_round_trip() {
    let tmp = TempDir::new().unwrap();
    let (db, ..) = open_test_db(tmp.path());

    let s = series("cpu", "s1");
    db.insert(
        &s,
        &[
            Sample::new(1000, 1.0),
            Sample::new(2000, 2.0),
            Sample::new(3000, 3.0),
        ],
    )
    .unwrap();

    let results = db
        .query(&[eq("__name__", "cpu"), eq("host", "s1")], 0, 5000)
        .unwrap();
    assert_eq!(
        only_series_samples(&results),
        vec![(1000, 1.0), (2000, 2.0), (3000, 3.0)]
    );
    assert_eq!(results[0].labels, s);
    db.close().unwrap();
}

#[test]
fn test_matcher_intersection_selects_expected_series() {
    let tmp = TempDir::new().unwrap();
    let (db, ..) = open_test_db(tmp.path());

    // A={m=x,h=1}, B={m=x,h=2}, C={m=y,h=1}.
    let a = Labels::from_pairs([("m", "x"), ("h", "1")]).unwrap();
    let b = Labels::from_pairs([("m", "x"), ("h", "2")]).unwrap();
    let c = Labels::from_pairs([("m", "y"), ("h", "1")]).unwrap();
    for labels in [&a, &b, &c] {
        db.insert(labels, &[Sample::new(1000, 1.0)]).unwrap();
    }

    let names = |results: Vec<crate::engine::SeriesSamples>| -> Vec<Labels> {
        results.into_iter().map(|r| r.labels).collect()
    };

    let got = names(db.query(&[eq("m", "x")], 0, 10_000).unwrap());
    assert_eq!(got.len(), 2);
    assert!(got.contains(&a) && got.contains(&b));

    let got = names(db.query(&[eq("m", "x"), eq("h", "1")], 0, 10_000).unwrap());
    assert_eq!(got, vec![a.clone()]);

    let neq = Matcher::new(MatchOp::Neq, "h", "1").unwrap();
    let got = names(db.query(&[neq], 0, 10_000).unwrap());
    assert_eq!(got, vec![b.clone()]);

    let re = Matcher::new(MatchOp::Re, "m", "x|y").unwrap();
    let got = names(db.query(&[re, eq("h", "1")], 0, 10_000).unwrap());
    assert_eq!(got.len(), 2);
    assert!(got.contains(&a) && got.contains(&c));

    db.close().unwrap();
}

#[test]
fn test_query_range_is_inclusive_and_filters() {
    let tmp = TempDir::new().unwrap();
    let (db, ..) = open_test_db(tmp.path());

    db.insert(&series("cpu", "s1"), &ramp(1000, 10, 1000)).unwrap();

    let results = db.query(&[eq("__name__", "cpu")], 3000, 5000).unwrap();
    assert_eq!(
        only_series_samples(&results),
        vec![(3000, 2.0), (4000, 3.0), (5000, 4.0)]
    );
    db.close().unwrap();
}

#[test]
fn test_unknown_series_returns_empty_not_error() {
    let tmp = TempDir::new().unwrap();
    let (db, ..) = open_test_db(tmp.path());

    let results = db.query(&[eq("__name__", "nothing")], 0, i64::MAX).unwrap();
    assert!(results.is_empty());
    db.close().unwrap();
}

#[test]
fn test_inverted_range_rejected() {
    let tmp = TempDir::new().unwrap();
    let (db, ..) = open_test_db(tmp.path());

    let err = db.query(&[], 5000, 1000).unwrap_err();
    assert!(matches!(err, TsdbError::InvalidArgument(_)));
    db.close().unwrap();
}

#[test]
fn test_empty_matcher_set_selects_all_series() {
    let tmp = TempDir::new().unwrap();
    let (db, ..) = open_test_db(tmp.path());

    db.insert(&series("cpu", "s1"), &[Sample::new(1000, 1.0)]).unwrap();
    db.insert(&series("mem", "s2"), &[Sample::new(1000, 2.0)]).unwrap();

    let results = db.query(&[], 0, 10_000).unwrap();
    assert_eq!(results.len(), 2);
    db.close().unwrap();
}

#[test]
fn test_insert_unsorted_batch_is_sorted() {
    let tmp = TempDir::new().unwrap();
    let (db, ..) = open_test_db(tmp.path());

    db.insert(
        &series("cpu", "s1"),
        &[
            Sample::new(3000, 3.0),
            Sample::new(1000, 1.0),
            Sample::new(2000, 2.0),
        ],
    )
    .unwrap();

    let results = db.query(&[eq("__name__", "cpu")], 0, 5000).unwrap();
    assert_eq!(
        only_series_samples(&results),
        vec![(1000, 1.0), (2000, 2.0), (3000, 3.0)]
    );
    db.close().unwrap();
}

#[test]
fn test_empty_labels_rejected() {
    let tmp = TempDir::new().unwrap();
    let (db, ..) = open_test_db(tmp.path());

    let empty = Labels::from_vec(Vec::new()).unwrap();
    let err = db.insert(&empty, &[Sample::new(1000, 1.0)]).unwrap_err();
    assert!(matches!(err, TsdbError::InvalidArgument(_)));
    db.close().unwrap();
}

#[test]
fn test_equal_timestamps_are_distinct_samples() {
    let tmp = TempDir::new().unwrap();
    let (db, ..) = open_test_db(tmp.path());
    let s = series("cpu", "s1");

    // Equal timestamps inside one batch and across batches are all
    // accepted (window 0 rejects only strictly older samples) and all
    // of them must read back.
    db.insert(
        &s,
        &[
            Sample::new(1000, 1.0),
            Sample::new(1000, 2.0),
            Sample::new(2000, 3.0),
        ],
    )
    .unwrap();
    db.insert(&s, &[Sample::new(2000, 4.0)]).unwrap();

    let results = db.query(&[eq("host", "s1")], 0, 5000).unwrap();
    assert_eq!(
        only_series_samples(&results),
        vec![(1000, 1.0), (1000, 2.0), (2000, 3.0), (2000, 4.0)]
    );
    db.close().unwrap();
}

#[test]
fn test_step_downsampling_keeps_last_per_bucket() {
    let tmp = TempDir::new().unwrap();
    let (db, ..) = open_test_db(tmp.path());

    // Samples every 250 ms; buckets of 1 s keep the last of each.
    db.insert(&series("cpu", "s1"), &ramp(0, 12, 250)).unwrap();

    let opts = QueryOpts {
        step_ms: 1000,
        ..Default::default()
    };
    let results = db
        .query_with(&[eq("__name__", "cpu")], 0, 10_000, &opts)
        .unwrap();
    assert_eq!(
        only_series_samples(&results),
        vec![(750, 3.0), (1750, 7.0), (2750, 11.0)]
    );
    db.close().unwrap();
}

#[test]
fn test_cancellation_aborts_query() {
    let tmp = TempDir::new().unwrap();
    let (db, ..) = open_test_db(tmp.path());

    db.insert(&series("cpu", "s1"), &ramp(0, 100, 1000)).unwrap();

    let cancel = CancelToken::new();
    cancel.cancel();
    let opts = QueryOpts {
        step_ms: 0,
        cancel,
    };
    let err = db
        .query_with(&[eq("__name__", "cpu")], 0, i64::MAX, &opts)
        .unwrap_err();
    assert!(matches!(err, TsdbError::Cancelled));
    db.close().unwrap();
}

#[test]
fn test_labels_and_values_and_series() {
    let tmp = TempDir::new().unwrap();
    let (db, ..) = open_test_db(tmp.path());

    db.insert(&series("cpu", "s1"), &[Sample::new(1000, 1.0)]).unwrap();
    db.insert(&series("cpu", "s2"), &[Sample::new(1000, 1.0)]).unwrap();

    assert_eq!(db.labels().unwrap(), vec!["__name__", "host"]);
    assert_eq!(db.label_values("host").unwrap(), vec!["s1", "s2"]);
    assert_eq!(db.series(&[eq("host", "s2")]).unwrap(), vec![series("cpu", "s2")]);

    let err = db.label_values("not-valid!").unwrap_err();
    assert!(matches!(err, TsdbError::InvalidArgument(_)));
    db.close().unwrap();
}

#[test]
fn test_stats_reflect_inserts() {
    let tmp = TempDir::new().unwrap();
    let (db, ..) = open_test_db(tmp.path());

    db.insert(&series("cpu", "s1"), &ramp(0, 42, 1000)).unwrap();

    let stats = db.stats().unwrap();
    assert_eq!(stats.total_samples, 42);
    assert_eq!(stats.total_series, 1);
    assert_eq!(stats.num_blocks, 0);
    assert_eq!(stats.flush_count, 0);
    assert!(stats.wal_size > 0);
    assert!(stats.head_size > 0);
    db.close().unwrap();
}
