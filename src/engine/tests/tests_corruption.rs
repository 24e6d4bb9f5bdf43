use tempfile::TempDir;

use super::helpers::{eq, open_test_db, ramp, series};
use crate::block::BLOCKS_DIR;
use crate::chunk::TARGET_SAMPLES;
use crate::engine::Metrics;

fn only_block_dir(data_dir: &std::path::Path) -> std::path::PathBuf {
    let mut entries: Vec<_> = std::fs::read_dir(data_dir.join(BLOCKS_DIR))
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    assert_eq!(entries.len(), 1);
    entries.remove(0)
}

#[test]
fn test_corrupt_chunk_is_skipped_and_counted() {
    let tmp = TempDir::new().unwrap();
    let (db, ..) = open_test_db(tmp.path());
    let s = series("cpu", "s1");

    // Several chunks so one can die while the others survive.
    db.insert(&s, &ramp(0, TARGET_SAMPLES * 3, 1000)).unwrap();
    db.flush().unwrap();
    db.close().unwrap();

    // Flip a byte in the middle of the chunks file.
    let chunks_path = only_block_dir(tmp.path()).join("chunks");
    let mut bytes = std::fs::read(&chunks_path).unwrap();
    let mid = bytes.len() / 2;
    bytes[mid] ^= 0xFF;
    std::fs::write(&chunks_path, &bytes).unwrap();

    let (db, metrics, _) = open_test_db(tmp.path());
    let results = db.query(&[eq("host", "s1")], 0, i64::MAX).unwrap();

    // The two intact chunks still answer; exactly one chunk was lost.
    assert_eq!(results[0].samples.len(), TARGET_SAMPLES * 2);
    assert_eq!(Metrics::get(&metrics.corrupt_chunks), 1);

    // The block is not deleted.
    assert_eq!(db.stats().unwrap().num_blocks, 1);
    db.close().unwrap();
}

#[test]
fn test_damaged_block_is_quarantined_on_open() {
    let tmp = TempDir::new().unwrap();
    let (db, ..) = open_test_db(tmp.path());

    db.insert(&series("cpu", "s1"), &ramp(0, 10, 1000)).unwrap();
    db.flush().unwrap();
    db.insert(&series("cpu", "s2"), &ramp(0, 10, 1000)).unwrap();
    db.flush().unwrap();
    db.close().unwrap();

    // Destroy one block's meta.json entirely.
    let victim = {
        let mut dirs: Vec<_> = std::fs::read_dir(tmp.path().join(BLOCKS_DIR))
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        dirs.sort();
        dirs.remove(0)
    };
    std::fs::write(victim.join("meta.json"), b"garbage").unwrap();

    let (db, metrics, _) = open_test_db(tmp.path());
    assert_eq!(Metrics::get(&metrics.quarantined_blocks), 1);
    assert_eq!(db.stats().unwrap().num_blocks, 1);
    assert!(!victim.exists(), "damaged block must leave blocks/");

    // The surviving block still answers queries.
    let results = db.query(&[], 0, i64::MAX).unwrap();
    assert_eq!(results.len(), 1);
    db.close().unwrap();
}
