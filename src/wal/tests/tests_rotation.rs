use tempfile::TempDir;

use super::helpers::{collect_clean, init_tracing, samples};
use crate::wal::{SyncPolicy, Wal, WalRecord, list_segments};

#[test]
fn test_roll_creates_next_segment() {
    init_tracing();
    let tmp = TempDir::new().unwrap();

    let wal = Wal::open(tmp.path(), SyncPolicy::Always).unwrap();
    let first_roll = wal.roll().unwrap();
    let second_roll = wal.roll().unwrap();
    wal.close().unwrap();

    assert_eq!(first_roll, 2);
    assert_eq!(second_roll, 3);

    let seqs: Vec<u64> = list_segments(tmp.path())
        .unwrap()
        .into_iter()
        .map(|(seq, _)| seq)
        .collect();
    assert_eq!(seqs, vec![1, 2, 3]);
}

#[test]
fn test_records_before_roll_live_in_older_segments() {
    init_tracing();
    let tmp = TempDir::new().unwrap();

    let wal = Wal::open(tmp.path(), SyncPolicy::Always).unwrap();
    let before = WalRecord::Samples {
        fingerprint: 1,
        samples: samples(0, 5),
    };
    wal.append_batch(std::slice::from_ref(&before)).unwrap();

    let cutoff = wal.roll().unwrap();

    let after = WalRecord::Samples {
        fingerprint: 2,
        samples: samples(100_000, 5),
    };
    wal.append_batch(std::slice::from_ref(&after)).unwrap();
    wal.close().unwrap();

    // Deleting everything below the cutoff must keep only `after`.
    let wal = Wal::open(tmp.path(), SyncPolicy::Always).unwrap();
    wal.truncate_before(cutoff).unwrap();
    wal.close().unwrap();

    assert_eq!(collect_clean(tmp.path()), vec![after]);
}

#[test]
fn test_replay_preserves_order_across_segments() {
    init_tracing();
    let tmp = TempDir::new().unwrap();

    let wal = Wal::open(tmp.path(), SyncPolicy::Always).unwrap();
    let mut expected = Vec::new();
    for round in 0u64..4 {
        let record = WalRecord::Samples {
            fingerprint: round,
            samples: samples(round as i64 * 1_000_000, 3),
        };
        wal.append_batch(std::slice::from_ref(&record)).unwrap();
        expected.push(record);
        wal.roll().unwrap();
    }
    wal.close().unwrap();

    assert_eq!(collect_clean(tmp.path()), expected);
}
