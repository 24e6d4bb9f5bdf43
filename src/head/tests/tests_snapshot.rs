use crate::chunk::{self, Sample};
use crate::head::Head;
use crate::labels::Labels;

fn series(host: &str) -> Labels {
    Labels::from_pairs([("__name__", "cpu"), ("host", host)]).unwrap()
}

#[test]
fn test_snapshot_seals_open_chunks() {
    let head = Head::new(0, 0);
    let labels = series("s1");
    let fp = labels.fingerprint();
    head.get_or_create(fp, &labels).unwrap();
    head.append(
        fp,
        &[Sample::new(1000, 1.0), Sample::new(2000, 2.0), Sample::new(3000, 3.0)],
    )
    .unwrap();

    let frozen = head.snapshot_series().unwrap();
    assert_eq!(frozen.len(), 1);

    let s = &frozen[0];
    assert_eq!(s.fingerprint, fp);
    assert_eq!(s.labels, labels);
    assert_eq!(s.min_ts, 1000);
    assert_eq!(s.max_ts, 3000);

    let total: usize = s
        .chunks
        .iter()
        .map(|c| chunk::decode(&c.bytes).unwrap().len())
        .sum();
    assert_eq!(total, 3);
    assert!(s.chunks.iter().all(|c| c.samples > 0));
}

#[test]
fn test_snapshot_is_sorted_and_skips_empty_series() {
    let head = Head::new(0, 0);

    // Three series with data, one registered but never written.
    for host in ["a", "b", "c"] {
        let labels = series(host);
        let fp = labels.fingerprint();
        head.get_or_create(fp, &labels).unwrap();
        head.append(fp, &[Sample::new(1000, 1.0)]).unwrap();
    }
    let empty = series("empty");
    head.get_or_create(empty.fingerprint(), &empty).unwrap();

    let frozen = head.snapshot_series().unwrap();
    assert_eq!(frozen.len(), 3);
    let fps: Vec<u64> = frozen.iter().map(|s| s.fingerprint).collect();
    let mut sorted = fps.clone();
    sorted.sort_unstable();
    assert_eq!(fps, sorted);
}

#[test]
fn test_snapshot_leaves_head_readable() {
    let head = Head::new(0, 0);
    let labels = series("s1");
    let fp = labels.fingerprint();
    head.get_or_create(fp, &labels).unwrap();
    head.append(fp, &[Sample::new(1000, 1.0)]).unwrap();

    // Readers holding this head across a flush must keep seeing its data.
    head.snapshot_series().unwrap();
    let (_, chunks) = head.chunks_for(fp, i64::MIN, i64::MAX).unwrap().unwrap();
    assert_eq!(chunks.len(), 1);
}

#[test]
fn test_snapshot_of_empty_head() {
    let head = Head::new(0, 0);
    assert!(head.snapshot_series().unwrap().is_empty());
}
