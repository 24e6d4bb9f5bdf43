use crate::chunk::{self, Sample, TARGET_SAMPLES};
use crate::head::{Head, HeadError};
use crate::labels::{Labels, MatchOp, Matcher};

fn series(host: &str) -> Labels {
    Labels::from_pairs([("__name__", "cpu"), ("host", host)]).unwrap()
}

fn samples(start: i64, n: usize) -> Vec<Sample> {
    (0..n)
        .map(|i| Sample::new(start + i as i64 * 1000, i as f64))
        .collect()
}

#[test]
fn test_create_and_append() {
    let head = Head::new(0, 0);
    let labels = series("s1");
    let fp = labels.fingerprint();

    assert!(head.get_or_create(fp, &labels).unwrap());
    assert!(!head.get_or_create(fp, &labels).unwrap());
    assert!(head.contains(fp));

    head.append(fp, &samples(1000, 3)).unwrap();
    assert_eq!(head.num_samples(), 3);
    assert_eq!(head.num_series(), 1);
    assert_eq!(head.min_time(), Some(1000));
    assert_eq!(head.max_time(), Some(3000));
}

#[test]
fn test_chunks_for_decodes_back() {
    let head = Head::new(0, 0);
    let labels = series("s1");
    let fp = labels.fingerprint();
    head.get_or_create(fp, &labels).unwrap();
    head.append(fp, &samples(1000, 10)).unwrap();

    let (got_labels, chunks) = head.chunks_for(fp, 0, i64::MAX).unwrap().unwrap();
    assert_eq!(got_labels, labels);
    assert_eq!(chunks.len(), 1);

    let decoded = chunk::decode(&chunks[0]).unwrap();
    assert_eq!(decoded.len(), 10);
    assert_eq!(decoded[0].timestamp, 1000);
}

#[test]
fn test_chunks_for_filters_by_range() {
    let head = Head::new(0, 0);
    let labels = series("s1");
    let fp = labels.fingerprint();
    head.get_or_create(fp, &labels).unwrap();
    head.append(fp, &samples(1000, 10)).unwrap();

    let (_, chunks) = head.chunks_for(fp, 100_000, 200_000).unwrap().unwrap();
    assert!(chunks.is_empty());
    assert!(head.chunks_for(0xBAD, 0, i64::MAX).unwrap().is_none());
}

#[test]
fn test_open_chunk_rotation() {
    let head = Head::new(0, 0);
    let labels = series("s1");
    let fp = labels.fingerprint();
    head.get_or_create(fp, &labels).unwrap();

    // Enough to roll the open chunk several times.
    head.append(fp, &samples(0, TARGET_SAMPLES * 3)).unwrap();

    let (_, chunks) = head.chunks_for(fp, i64::MIN, i64::MAX).unwrap().unwrap();
    assert!(chunks.len() >= 3, "expected rotated chunks, got {}", chunks.len());

    let total: usize = chunks.iter().map(|c| chunk::decode(c).unwrap().len()).sum();
    assert_eq!(total, TARGET_SAMPLES * 3);
}

#[test]
fn test_fingerprint_collision_rejected() {
    let head = Head::new(0, 0);
    let a = series("s1");
    let b = series("s2");

    head.get_or_create(1234, &a).unwrap();
    let err = head.get_or_create(1234, &b).unwrap_err();
    assert!(matches!(err, HeadError::FingerprintCollision { .. }));
}

#[test]
fn test_append_to_unknown_series_is_internal_error() {
    let head = Head::new(0, 0);
    let err = head.append(999, &samples(0, 1)).unwrap_err();
    assert!(matches!(err, HeadError::Internal(_)));
}

#[test]
fn test_matcher_resolution_over_live_index() {
    let head = Head::new(0, 0);
    for host in ["s1", "s2", "s3"] {
        let labels = series(host);
        head.get_or_create(labels.fingerprint(), &labels).unwrap();
    }

    let m = Matcher::new(MatchOp::Re, "host", "s[12]").unwrap();
    assert_eq!(head.series_matching(&[m]).unwrap().len(), 2);

    let names = head.label_names().unwrap();
    assert_eq!(names, vec!["__name__".to_string(), "host".to_string()]);
    assert_eq!(head.label_values("host").unwrap().len(), 3);
}

#[test]
fn test_series_labels_rechecks_matchers() {
    let head = Head::new(0, 0);
    let labels = series("s1");
    head.get_or_create(labels.fingerprint(), &labels).unwrap();

    let m = Matcher::new(MatchOp::Eq, "host", "s1").unwrap();
    assert_eq!(head.series_labels(&[m]).unwrap(), vec![labels]);
}
