use std::sync::Arc;

use tempfile::TempDir;

use crate::block::{Block, BlockWriter};
use crate::chunk::{ChunkAppender, Sample, TARGET_SAMPLES};
use crate::compact::{compact, rechunk};
use crate::head::SealedChunk;
use crate::labels::Labels;

fn chunk_of(samples: &[Sample]) -> SealedChunk {
    let mut appender = ChunkAppender::new();
    for s in samples {
        appender.append(*s).unwrap();
    }
    SealedChunk {
        min_ts: samples.first().unwrap().timestamp,
        max_ts: samples.last().unwrap().timestamp,
        samples: samples.len() as u32,
        bytes: appender.finish(),
    }
}

fn build(blocks_dir: &std::path::Path, series: &[(Labels, Vec<Sample>)], level: u32) -> Arc<Block> {
    let mut writer = BlockWriter::new(blocks_dir, level, Vec::new()).unwrap();
    for (labels, samples) in series {
        writer
            .add_series(labels.fingerprint(), labels.clone(), &[chunk_of(samples)])
            .unwrap();
    }
    let meta = writer.commit().unwrap();
    Arc::new(Block::open(blocks_dir.join(&meta.ulid)).unwrap())
}

fn ramp(start_ts: i64, n: usize, base: f64) -> Vec<Sample> {
    (0..n)
        .map(|i| Sample::new(start_ts + i as i64, base + i as f64))
        .collect()
}

#[test]
fn test_merge_disjoint_ranges() {
    let tmp = TempDir::new().unwrap();
    let labels = Labels::from_pairs([("__name__", "cpu")]).unwrap();
    let fp = labels.fingerprint();

    let b1 = build(tmp.path(), &[(labels.clone(), ramp(0, 100, 0.0))], 0);
    let b2 = build(tmp.path(), &[(labels.clone(), ramp(100, 100, 100.0))], 0);

    let result = compact(tmp.path(), &[b1, b2], 1).unwrap();
    assert_eq!(result.corrupt_chunks, 0);
    assert_eq!(result.meta.compaction.level, 1);
    assert_eq!(result.meta.stats.num_samples, 200);
    assert_eq!(result.meta.min_time, 0);
    assert_eq!(result.meta.max_time, 199);

    let merged = Block::open(tmp.path().join(&result.meta.ulid)).unwrap();
    let fetch = merged.chunks_for(fp, i64::MIN, i64::MAX);
    assert_eq!(fetch.samples.len(), 200);
    // Strictly ascending timestamps across the old block boundary.
    for pair in fetch.samples.windows(2) {
        assert!(pair[0].timestamp < pair[1].timestamp);
    }
}

#[test]
fn test_duplicate_timestamps_newest_source_wins() {
    let tmp = TempDir::new().unwrap();
    let labels = Labels::from_pairs([("__name__", "cpu")]).unwrap();
    let fp = labels.fingerprint();

    // Same timestamps, different values; b2 is created later.
    let b1 = build(tmp.path(), &[(labels.clone(), ramp(0, 50, 1000.0))], 0);
    let b2 = build(tmp.path(), &[(labels.clone(), ramp(0, 50, 2000.0))], 0);

    let result = compact(tmp.path(), &[b1, b2], 1).unwrap();
    let merged = Block::open(tmp.path().join(&result.meta.ulid)).unwrap();
    let fetch = merged.chunks_for(fp, i64::MIN, i64::MAX);

    assert_eq!(fetch.samples.len(), 50);
    assert_eq!(fetch.samples[0].value, 2000.0);
}

#[test]
fn test_equal_timestamps_within_source_survive() {
    let tmp = TempDir::new().unwrap();
    let labels = Labels::from_pairs([("__name__", "cpu")]).unwrap();
    let fp = labels.fingerprint();

    // b1 carries two distinct samples at ts=100; b2 is disjoint.
    let dup = vec![
        Sample::new(100, 1.0),
        Sample::new(100, 2.0),
        Sample::new(200, 3.0),
    ];
    let b1 = build(tmp.path(), &[(labels.clone(), dup)], 0);
    let b2 = build(tmp.path(), &[(labels.clone(), ramp(1000, 10, 0.0))], 0);

    let result = compact(tmp.path(), &[b1, b2], 1).unwrap();
    assert_eq!(result.meta.stats.num_samples, 13);

    let merged = Block::open(tmp.path().join(&result.meta.ulid)).unwrap();
    let fetch = merged.chunks_for(fp, i64::MIN, i64::MAX);
    let head: Vec<(i64, f64)> = fetch.samples[..3]
        .iter()
        .map(|s| (s.timestamp, s.value))
        .collect();
    assert_eq!(head, vec![(100, 1.0), (100, 2.0), (200, 3.0)]);
}

#[test]
fn test_union_of_series() {
    let tmp = TempDir::new().unwrap();
    let s1 = Labels::from_pairs([("__name__", "cpu"), ("host", "a")]).unwrap();
    let s2 = Labels::from_pairs([("__name__", "cpu"), ("host", "b")]).unwrap();

    let b1 = build(tmp.path(), &[(s1.clone(), ramp(0, 10, 0.0))], 0);
    let b2 = build(tmp.path(), &[(s2.clone(), ramp(5, 10, 0.0))], 0);

    let result = compact(tmp.path(), &[b1, b2], 1).unwrap();
    assert_eq!(result.meta.stats.num_series, 2);

    let merged = Block::open(tmp.path().join(&result.meta.ulid)).unwrap();
    assert_eq!(merged.labels_of(s1.fingerprint()), Some(&s1));
    assert_eq!(merged.labels_of(s2.fingerprint()), Some(&s2));
}

#[test]
fn test_lineage_lists_source_ulids() {
    let tmp = TempDir::new().unwrap();
    let labels = Labels::from_pairs([("__name__", "cpu")]).unwrap();

    let b1 = build(tmp.path(), &[(labels.clone(), ramp(0, 10, 0.0))], 0);
    let b2 = build(tmp.path(), &[(labels.clone(), ramp(10, 10, 0.0))], 0);
    let ulids = vec![b1.ulid().to_string(), b2.ulid().to_string()];

    let result = compact(tmp.path(), &[b1, b2], 1).unwrap();
    assert_eq!(result.meta.compaction.sources, ulids);
}

#[test]
fn test_rechunk_respects_target_size() {
    let samples: Vec<Sample> = (0..(TARGET_SAMPLES as i64 * 2 + 10))
        .map(|i| Sample::new(i * 1000, i as f64))
        .collect();

    let chunks = rechunk(samples.iter().copied()).unwrap();
    assert_eq!(chunks.len(), 3);
    assert!(chunks.iter().all(|c| c.samples as usize <= TARGET_SAMPLES));

    let total: u32 = chunks.iter().map(|c| c.samples).sum();
    assert_eq!(total as usize, samples.len());
}

#[test]
fn test_corrupt_source_chunk_survives_merge() {
    let tmp = TempDir::new().unwrap();
    let labels = Labels::from_pairs([("__name__", "cpu")]).unwrap();
    let fp = labels.fingerprint();

    let b1 = build(tmp.path(), &[(labels.clone(), ramp(0, 50, 0.0))], 0);
    let b2 = build(tmp.path(), &[(labels.clone(), ramp(100, 50, 0.0))], 0);

    // Corrupt b1's only chunk on disk, then reopen it.
    let chunks_path = b1.dir().join("chunks");
    let mut bytes = std::fs::read(&chunks_path).unwrap();
    let mid = bytes.len() / 2;
    bytes[mid] ^= 0xFF;
    std::fs::write(&chunks_path, &bytes).unwrap();
    let b1 = Arc::new(Block::open(b1.dir()).unwrap());

    let result = compact(tmp.path(), &[b1, b2], 1).unwrap();
    assert_eq!(result.corrupt_chunks, 1);
    assert_eq!(result.meta.stats.num_samples, 50);

    let merged = Block::open(tmp.path().join(&result.meta.ulid)).unwrap();
    let fetch = merged.chunks_for(fp, i64::MIN, i64::MAX);
    assert_eq!(fetch.samples.len(), 50);
    assert_eq!(fetch.samples[0].timestamp, 100);
}
