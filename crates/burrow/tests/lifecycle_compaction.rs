//! Integration tests for the compaction workflow driven through a shard.

use alopex_burrow::{
    CompactionConfig, CompactorState, LevelConfig, Point, Shard, ShardConfig, SyncMode,
    TimeRange, Timestamp, Value, WalConfig,
};
use tempfile::TempDir;

fn small_levels() -> CompactionConfig {
    CompactionConfig::default().with_levels(vec![
        LevelConfig {
            max_files: 2,
            target_file_size: 64 * 1024,
        },
        LevelConfig {
            max_files: 2,
            target_file_size: 256 * 1024,
        },
        LevelConfig {
            max_files: 100,
            target_file_size: 1024 * 1024,
        },
    ])
}

fn open(dir: &TempDir, compaction: CompactionConfig) -> Shard {
    let config = ShardConfig::default()
        .with_wal(WalConfig::default().with_sync_mode(SyncMode::None))
        .with_compaction(compaction)
        .with_background_compaction(false);
    Shard::open(dir.path(), config).unwrap()
}

fn read(shard: &Shard, series_key: &str, field: &str) -> Vec<(Timestamp, Value)> {
    shard
        .read(series_key, field, TimeRange::all())
        .unwrap()
        .map(|row| {
            let row = row.unwrap();
            (row.timestamp, row.value)
        })
        .collect()
}

#[test]
fn test_compaction_end_to_end() {
    let temp_dir = TempDir::new().unwrap();
    let shard = open(&temp_dir, small_levels());

    for i in 0..5i64 {
        shard
            .write("metric", "v", Point::new(100, 100.0 + i as f64))
            .unwrap();
        shard
            .write("metric", "v", Point::new(200 + i, 200.0 + i as f64))
            .unwrap();
        shard.flush().unwrap();
    }
    assert_eq!(shard.stats().files_per_level.get(&0), Some(&5));

    let cycles = shard.compact().unwrap();
    assert!(cycles >= 1);

    let stats = shard.stats();
    assert!(stats.files < 5);
    assert!(stats.files_per_level.get(&0).copied().unwrap_or(0) <= 2);
    assert!(stats.files_per_level.get(&1).copied().unwrap_or(0) >= 1);
    assert_eq!(stats.compaction.failures, 0);
    assert_eq!(stats.compaction.snapshots_flushed, 5);
    assert!(stats.compaction.files_removed >= 2);
    assert_eq!(shard.compactor_state(), CompactorState::Idle);

    // The newest write of the shared timestamp survives every merge.
    let points = read(&shard, "metric", "v");
    assert_eq!(points.len(), 6);
    assert_eq!(points[0], (100, Value::Float(104.0)));
    assert_eq!(points[5], (204, Value::Float(204.0)));
}

#[test]
fn test_compaction_is_idempotent() {
    let temp_dir = TempDir::new().unwrap();
    let shard = open(&temp_dir, small_levels());

    for i in 0..4i64 {
        shard.write("cpu,host=a", "usage", Point::new(i, i)).unwrap();
        shard.flush().unwrap();
    }
    shard.compact().unwrap();
    let before = shard.stats();
    let data = read(&shard, "cpu,host=a", "usage");

    assert_eq!(shard.compact().unwrap(), 0);
    let after = shard.stats();
    assert_eq!(after.files, before.files);
    assert_eq!(after.compaction.cycles, before.compaction.cycles);
    assert_eq!(read(&shard, "cpu,host=a", "usage"), data);
}

#[test]
fn test_compacted_files_survive_reopen() {
    let temp_dir = TempDir::new().unwrap();
    {
        let shard = open(&temp_dir, small_levels());
        for i in 0..6i64 {
            shard
                .write(&format!("cpu,host=h{}", i % 3), "usage", Point::new(i, i as f64))
                .unwrap();
            shard.flush().unwrap();
        }
        shard.compact().unwrap();
        shard.close().unwrap();
    }

    let shard = open(&temp_dir, small_levels());
    assert_eq!(shard.stats().series, 3);
    assert_eq!(read(&shard, "cpu,host=h0", "usage"), vec![
        (0, Value::Float(0.0)),
        (3, Value::Float(3.0)),
    ]);
    assert_eq!(shard.compact().unwrap(), 0);
}

#[test]
fn test_tombstone_heavy_file_is_rewritten() {
    let temp_dir = TempDir::new().unwrap();
    let shard = open(&temp_dir, CompactionConfig::default().with_tombstone_ratio(0.25));

    let points: Vec<_> = (0..100)
        .map(|ts| alopex_burrow::WritePoint::new("cpu", "v", Point::new(ts, ts)))
        .collect();
    shard.write_points(&points).unwrap();
    shard.flush().unwrap();
    let file_bytes = shard.stats().file_bytes;

    shard.delete_range(&["cpu"], TimeRange::new(0, 79)).unwrap();
    assert_eq!(shard.compact().unwrap(), 1);

    let stats = shard.stats();
    assert_eq!(stats.files, 1);
    assert_eq!(stats.compaction.files_removed, 1);
    assert!(stats.file_bytes < file_bytes);

    let remaining: Vec<Timestamp> = read(&shard, "cpu", "v").into_iter().map(|p| p.0).collect();
    assert_eq!(remaining, (80..100).collect::<Vec<_>>());
    assert_eq!(shard.compact().unwrap(), 0);
}

#[test]
fn test_fully_deleted_series_leaves_no_file() {
    let temp_dir = TempDir::new().unwrap();
    let shard = open(&temp_dir, CompactionConfig::default());

    shard.write("cpu,host=a", "v", Point::new(1, 1.0)).unwrap();
    shard.flush().unwrap();
    shard.delete_series(&["cpu,host=a"]).unwrap();
    shard.compact().unwrap();

    let stats = shard.stats();
    assert_eq!(stats.files, 0);
    assert_eq!(stats.series, 0);
    assert!(shard.index().canonical_key(1).is_none());
}

#[test]
fn test_small_deleted_series_is_removed_next_cycle() {
    let temp_dir = TempDir::new().unwrap();
    let shard = open(&temp_dir, CompactionConfig::default());

    shard.write("cpu,host=a", "v", Point::new(1, 1.0)).unwrap();
    for ts in 0..10 {
        shard.write("cpu,host=b", "v", Point::new(ts, 2.0)).unwrap();
    }
    shard.flush().unwrap();
    shard.delete_series(&["cpu,host=a"]).unwrap();

    assert_eq!(shard.compact().unwrap(), 1);
    let stats = shard.stats();
    assert_eq!(stats.files, 1);
    assert_eq!(stats.series, 1);
    assert_eq!(stats.compaction.files_removed, 1);
    assert!(shard.index().get("cpu,host=a").is_none());
    assert!(shard.index().canonical_key(1).is_none());
    assert!(read(&shard, "cpu,host=a", "v").is_empty());
    assert_eq!(read(&shard, "cpu,host=b", "v").len(), 10);

    assert_eq!(shard.compact().unwrap(), 0);
    drop(shard);

    let shard = open(&temp_dir, CompactionConfig::default());
    assert_eq!(shard.stats().series, 1);
    assert!(shard.index().get("cpu,host=a").is_none());
}
