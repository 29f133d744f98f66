//! Integration tests for TSM files and the file store.

use alopex_burrow::tsm::store::{read_stream, FileId};
use alopex_burrow::tsm::{stream_key, Tombstone, TsmReader, TsmWriter};
use alopex_burrow::{FileStore, TimeRange, Timestamp, Value, ValueType};
use std::fs;
use std::sync::Arc;
use tempfile::TempDir;

/// Generates a float series with a smooth, non-trivial shape.
fn generate_points(start_ts: i64, interval: i64, count: usize, base: f64) -> Vec<(Timestamp, Value)> {
    (0..count)
        .map(|i| {
            let ts = start_ts + i as i64 * interval;
            let value = base + i as f64 * 0.1 + (i as f64 * 0.1).sin() * 5.0;
            (ts, Value::Float(value))
        })
        .collect()
}

fn publish_one(
    store: &FileStore,
    streams: &[(&str, &[(Timestamp, Value)])],
    max_sequence: u64,
) -> FileId {
    let id = FileId::new(store.next_generation(), 0);
    let mut pending = store.create_file(id, 0, max_sequence).unwrap();
    let mut sorted: Vec<_> = streams.to_vec();
    sorted.sort_by(|a, b| a.0.cmp(b.0));
    for (key, points) in sorted {
        let value_type = points[0].1.value_type();
        pending.write_stream(key, value_type, points, 1000).unwrap();
    }
    let file = pending.finish().unwrap();
    store.publish(&[file], &[], Vec::new).unwrap();
    id
}

// ============================================================================
// Writer / reader
// ============================================================================

#[test]
fn test_write_read_roundtrip() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("roundtrip.tsm");
    let key = stream_key("cpu,host=server1", "usage");
    let points = generate_points(1_000_000_000, 1_000_000_000, 3600, 50.0);

    {
        let mut writer = TsmWriter::create(&path, 0, 7).unwrap();
        writer
            .write_stream(&key, ValueType::Float, &points, 1000)
            .unwrap();
        let handle = writer.finish().unwrap();
        assert_eq!(handle.footer.key_count, 1);
        assert_eq!(handle.footer.total_point_count, 3600);
        assert_eq!(handle.header.max_sequence, 7);
    }

    let reader = TsmReader::open(&path).unwrap();
    let entry = reader.entry(&key).unwrap();
    assert_eq!(entry.blocks.len(), 4);
    assert_eq!(entry.point_count(), 3600);
    assert_eq!(reader.read_all(&key).unwrap(), points);
}

#[test]
fn test_range_read_decodes_overlapping_blocks_only() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("range.tsm");
    let key = stream_key("cpu", "usage");
    let points = generate_points(0, 10, 1000, 0.0);

    let mut writer = TsmWriter::create(&path, 0, 1).unwrap();
    writer.write_stream(&key, ValueType::Float, &points, 100).unwrap();
    writer.finish().unwrap();

    let reader = TsmReader::open(&path).unwrap();
    let range = TimeRange::new(2_005, 2_995);
    assert_eq!(reader.entry(&key).unwrap().blocks_in(range).len(), 1);

    let read = reader.read_range(&key, range).unwrap();
    assert_eq!(read.len(), 99);
    assert_eq!(read.first().unwrap().0, 2_010);
    assert_eq!(read.last().unwrap().0, 2_990);
}

#[test]
fn test_many_streams_sorted_keys() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("many.tsm");

    let mut keys: Vec<String> = (0..100)
        .map(|i| stream_key(&format!("cpu,host=h{i:03}"), "usage"))
        .collect();
    keys.sort();

    let mut writer = TsmWriter::create(&path, 1, 0).unwrap();
    for (i, key) in keys.iter().enumerate() {
        let points: Vec<(Timestamp, Value)> =
            (0..50).map(|t| (t, Value::Integer(i as i64 * t))).collect();
        writer
            .write_stream(key, ValueType::Integer, &points, 1000)
            .unwrap();
    }
    writer.finish().unwrap();

    let reader = TsmReader::open(&path).unwrap();
    assert_eq!(reader.header().level, 1);
    assert_eq!(reader.keys().collect::<Vec<_>>(), keys);
    assert!(!reader.contains(&stream_key("cpu,host=missing", "usage")));
    let read = reader.read_all(&keys[42]).unwrap();
    assert_eq!(read[10], (10, Value::Integer(420)));
}

#[test]
fn test_out_of_order_keys_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("order.tsm");
    let points = vec![(1, Value::Boolean(true))];

    let mut writer = TsmWriter::create(&path, 0, 0).unwrap();
    writer
        .write_stream(&stream_key("b", "f"), ValueType::Boolean, &points, 10)
        .unwrap();
    assert!(writer
        .write_stream(&stream_key("a", "f"), ValueType::Boolean, &points, 10)
        .is_err());
}

#[test]
fn test_corrupted_file_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("corrupt.tsm");
    let key = stream_key("cpu", "usage");

    let mut writer = TsmWriter::create(&path, 0, 0).unwrap();
    writer
        .write_stream(&key, ValueType::Float, &generate_points(0, 1, 100, 1.0), 1000)
        .unwrap();
    writer.finish().unwrap();

    let mut bytes = fs::read(&path).unwrap();
    bytes[40] ^= 0xFF;
    fs::write(&path, &bytes).unwrap();

    let err = TsmReader::open(&path).unwrap_err();
    assert!(err.is_corruption(), "{err}");

    fs::write(&path, &bytes[..20]).unwrap();
    assert!(TsmReader::open(&path).unwrap_err().is_corruption());
}

// ============================================================================
// File store
// ============================================================================

#[test]
fn test_store_newest_file_wins() {
    let temp_dir = TempDir::new().unwrap();
    let store = FileStore::open(temp_dir.path()).unwrap();
    let key = stream_key("cpu,host=a", "usage");

    let old = vec![(10, Value::Float(42.0)), (20, Value::Float(1.0))];
    let new = vec![(10, Value::Float(99.0))];
    publish_one(&store, &[(&key, &old)], 1);
    publish_one(&store, &[(&key, &new)], 2);

    let read = store.read(&key, TimeRange::all()).unwrap();
    assert!(!read.degraded);
    assert_eq!(read.points, vec![(10, Value::Float(99.0)), (20, Value::Float(1.0))]);
    assert_eq!(store.field_type(&key), Some(ValueType::Float));
    assert_eq!(store.locations(&key).len(), 2);
}

#[test]
fn test_store_reopen_and_tmp_cleanup() {
    let temp_dir = TempDir::new().unwrap();
    let key = stream_key("mem", "free");
    let points = vec![(5, Value::Integer(1024))];
    {
        let store = FileStore::open(temp_dir.path()).unwrap();
        publish_one(&store, &[(&key, &points)], 3);

        // An unfinished write left behind by a crash.
        let pending = store
            .create_file(FileId::new(store.next_generation(), 0), 0, 4)
            .unwrap();
        drop(pending);
    }
    let leftovers = fs::read_dir(temp_dir.path())
        .unwrap()
        .filter(|e| e.as_ref().unwrap().path().extension().is_some_and(|x| x == "tmp"))
        .count();
    assert_eq!(leftovers, 1);

    let store = FileStore::open(temp_dir.path()).unwrap();
    assert_eq!(store.len(), 1);
    assert_eq!(store.read(&key, TimeRange::all()).unwrap().points, points);
    assert!(store.series_keys().contains("mem"));
    assert!(fs::read_dir(temp_dir.path())
        .unwrap()
        .all(|e| e.unwrap().path().extension().map_or(true, |x| x != "tmp")));
}

#[test]
fn test_store_publish_replaces_inputs() {
    let temp_dir = TempDir::new().unwrap();
    let store = FileStore::open(temp_dir.path()).unwrap();
    let key = stream_key("cpu", "usage");
    let points = generate_points(0, 1, 10, 0.0);
    let first = publish_one(&store, &[(&key, &points)], 1);
    let first_path = temp_dir.path().join(first.file_name());
    assert!(first_path.exists());

    let merged_id = FileId::new(first.generation, 1);
    let mut pending = store.create_file(merged_id, 1, 1).unwrap();
    pending.write_stream(&key, ValueType::Float, &points, 1000).unwrap();
    let merged = pending.finish().unwrap();
    store.publish(&[merged], &[first], Vec::new).unwrap();

    let files = store.files();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].id(), merged_id);
    assert_eq!(files[0].level(), 1);
    drop(files);
    assert!(!first_path.exists());
    assert_eq!(store.read(&key, TimeRange::all()).unwrap().points, points);
}

// ============================================================================
// Tombstones
// ============================================================================

#[test]
fn test_tombstones_persist_across_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let usage = stream_key("cpu,host=a", "usage");
    let idle = stream_key("cpu,host=a", "idle");
    let other = stream_key("cpu,host=b", "usage");
    let points = generate_points(0, 10, 10, 0.0);
    {
        let store = FileStore::open(temp_dir.path()).unwrap();
        publish_one(&store, &[(&usage, &points), (&idle, &points), (&other, &points)], 1);

        let touched = store
            .add_tombstone(&Tombstone::range("cpu,host=a", TimeRange::new(20, 50)), |_| true)
            .unwrap();
        assert_eq!(touched, 1);
        let untouched = store
            .add_tombstone(&Tombstone::series("mem"), |_| true)
            .unwrap();
        assert_eq!(untouched, 0);
    }

    let store = FileStore::open(temp_dir.path()).unwrap();
    let files = store.files();
    assert_eq!(files[0].tombstone_count(), 1);
    assert!(files[0].tombstone_ratio() > 0.0);

    for key in [&usage, &idle] {
        let read = store.read(key, TimeRange::all()).unwrap().points;
        assert_eq!(read.len(), 6);
        assert!(read.iter().all(|(ts, _)| *ts < 20 || *ts > 50));
    }
    assert_eq!(store.read(&other, TimeRange::all()).unwrap().points.len(), 10);
}

#[test]
fn test_publish_carries_racing_tombstones() {
    let temp_dir = TempDir::new().unwrap();
    let store = FileStore::open(temp_dir.path()).unwrap();
    let key = stream_key("cpu", "usage");

    let mut pending = store
        .create_file(FileId::new(store.next_generation(), 0), 0, 1)
        .unwrap();
    pending
        .write_stream(&key, ValueType::Float, &generate_points(0, 1, 5, 0.0), 1000)
        .unwrap();
    let file = pending.finish().unwrap();
    store
        .publish(&[Arc::clone(&file)], &[], || vec![Tombstone::series("cpu")])
        .unwrap();

    assert_eq!(file.tombstone_count(), 1);
    assert!(store.read(&key, TimeRange::all()).unwrap().points.is_empty());
}

// ============================================================================
// Quarantine
// ============================================================================

#[test]
fn test_corrupt_file_quarantined_on_open() {
    let temp_dir = TempDir::new().unwrap();
    let key = stream_key("cpu", "usage");
    let points = generate_points(0, 1, 100, 0.0);
    let bad = {
        let store = FileStore::open(temp_dir.path()).unwrap();
        publish_one(&store, &[(&key, &points)], 1);
        publish_one(&store, &[(&key, &points[..10])], 2)
    };

    let bad_path = temp_dir.path().join(bad.file_name());
    let mut bytes = fs::read(&bad_path).unwrap();
    bytes[40] ^= 0xFF;
    fs::write(&bad_path, &bytes).unwrap();

    let store = FileStore::open(temp_dir.path()).unwrap();
    assert_eq!(store.len(), 1);
    assert!(store.is_degraded());
    assert!(store.quarantined_at_open());
    assert!(!bad_path.exists());
    assert!(temp_dir
        .path()
        .join(format!("{}.quarantine", bad.file_name()))
        .exists());

    // Surviving data stays readable and the bad generation is never reused.
    assert_eq!(store.read(&key, TimeRange::all()).unwrap().points, points);
    assert!(store.next_generation() > bad.generation);
}

#[test]
fn test_runtime_corruption_degrades_read() {
    let temp_dir = TempDir::new().unwrap();
    let store = FileStore::open(temp_dir.path()).unwrap();
    let key = stream_key("cpu", "usage");
    let points = generate_points(0, 1, 100, 0.0);
    let id = publish_one(&store, &[(&key, &points)], 1);

    // Damage a block after the file passed validation at open.
    let path = temp_dir.path().join(id.file_name());
    let mut bytes = fs::read(&path).unwrap();
    bytes[40] ^= 0xFF;
    fs::write(&path, &bytes).unwrap();

    let files = store.files();
    let read = read_stream(&files, &key, TimeRange::all()).unwrap();
    assert!(read.degraded);
    assert!(read.points.is_empty());
    assert!(files[0].is_quarantined());
    assert!(store.is_degraded());
}
