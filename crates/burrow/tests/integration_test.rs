//! Integration tests for the complete shard contract.
//!
//! These tests verify the full data lifecycle:
//! - write → WAL → cache → TSM file (full write path)
//! - predicate queries over cache and files
//! - deletes across every layer
//! - crash recovery from the WAL
//! - background compaction and cache backpressure

use alopex_burrow::{
    BurrowError, CacheConfig, CompactionConfig, ErrorKind, Operator, Point, Predicate, Row,
    Shard, ShardConfig, SyncMode, Tag, TagRule, TimeRange, Value, WalConfig, WritePoint,
};
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn config() -> ShardConfig {
    ShardConfig::default()
        .with_wal(WalConfig::default().with_sync_mode(SyncMode::None))
        .with_background_compaction(false)
}

fn rows(shard: &Shard, predicate: &Predicate, range: TimeRange) -> Vec<Row> {
    shard
        .query(predicate, range)
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap()
}

fn series_of(rows: &[Row]) -> Vec<String> {
    let mut keys: Vec<String> = rows.iter().map(|r| r.series_key.to_string()).collect();
    keys.dedup();
    keys
}

// ============================================================================
// Full write path
// ============================================================================

/// Writes land in the WAL and cache, survive a flush into a TSM file, and
/// read back identically from either place.
#[test]
fn test_full_write_path() {
    init_tracing();
    let temp_dir = TempDir::new().unwrap();
    let shard = Shard::open(temp_dir.path(), config()).unwrap();

    let points: Vec<WritePoint> = (0..1000)
        .map(|i| {
            WritePoint::new(
                "cpu,host=server1,env=prod",
                "usage",
                Point::new(i * 1_000_000, 50.0 + (i as f64 * 0.1).sin() * 10.0),
            )
        })
        .collect();
    let sequence = shard.write_points(&points).unwrap();
    assert_eq!(sequence, 1);

    let predicate = Predicate::measurement("cpu");
    let from_cache = rows(&shard, &predicate, TimeRange::all());
    assert_eq!(from_cache.len(), 1000);
    assert_eq!(&*from_cache[0].series_key, "cpu,env=prod,host=server1");

    shard.flush().unwrap();
    let stats = shard.stats();
    assert_eq!(stats.files, 1);
    assert_eq!(stats.cache.point_count, 0);
    assert_eq!(rows(&shard, &predicate, TimeRange::all()), from_cache);

    let window = rows(&shard, &predicate, TimeRange::new(10_000_000, 19_000_000));
    assert_eq!(window.len(), 10);
    assert_eq!(window[0].timestamp, 10_000_000);
}

#[test]
fn test_overwrite_across_flush() {
    let temp_dir = TempDir::new().unwrap();
    let shard = Shard::open(temp_dir.path(), config()).unwrap();

    shard.write("cpu,host=a", "usage", Point::new(1000, 42.0)).unwrap();
    shard.flush().unwrap();
    shard.write("cpu,host=a", "usage", Point::new(1000, 99.0)).unwrap();

    let read: Vec<Row> = shard
        .read("cpu,host=a", "usage", TimeRange::new(0, 2000))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(read.len(), 1);
    assert_eq!(read[0].value, Value::Float(99.0));

    shard.flush().unwrap();
    shard.compact().unwrap();
    let read: Vec<Row> = shard
        .read("cpu,host=a", "usage", TimeRange::new(0, 2000))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(read[0].value, Value::Float(99.0));
}

#[test]
fn test_all_value_types() {
    let temp_dir = TempDir::new().unwrap();
    let shard = Shard::open(temp_dir.path(), config()).unwrap();
    let batch = [
        WritePoint::new("dev,id=1", "temp", Point::new(1, 21.5)),
        WritePoint::new("dev,id=1", "count", Point::new(1, 7i64)),
        WritePoint::new("dev,id=1", "on", Point::new(1, true)),
        WritePoint::new("dev,id=1", "state", Point::new(1, "ok")),
    ];
    shard.write_points(&batch).unwrap();
    shard.flush().unwrap();

    let read = rows(&shard, &Predicate::measurement("dev"), TimeRange::all());
    let fields: Vec<(&str, &Value)> = read.iter().map(|r| (&*r.field, &r.value)).collect();
    assert_eq!(
        fields,
        vec![
            ("count", &Value::Integer(7)),
            ("on", &Value::Boolean(true)),
            ("state", &Value::String("ok".into())),
            ("temp", &Value::Float(21.5)),
        ]
    );
}

// ============================================================================
// Predicates
// ============================================================================

#[test]
fn test_predicate_queries() {
    let temp_dir = TempDir::new().unwrap();
    let shard = Shard::open(temp_dir.path(), config()).unwrap();
    for key in ["cpu,host=a", "cpu,host=b", "cpu,host=apple", "cpu,region=eu", "mem,host=a"] {
        shard.write(key, "v", Point::new(1, 1.0)).unwrap();
    }
    // Half the data in files, half in the cache.
    shard.flush().unwrap();
    shard.write("cpu,host=b", "v", Point::new(2, 2.0)).unwrap();

    let equal = Predicate::measurement("cpu").with_rule(TagRule::parse("host:a", "equal").unwrap());
    assert_eq!(series_of(&rows(&shard, &equal, TimeRange::all())), vec!["cpu,host=a"]);

    let not_regex = Predicate::measurement("cpu").with_rule(TagRule::not_regex("host", "^a.*").unwrap());
    let matched = rows(&shard, &not_regex, TimeRange::all());
    assert_eq!(series_of(&matched), vec!["cpu,host=b", "cpu,region=eu"]);
    assert_eq!(matched.iter().filter(|r| &*r.series_key == "cpu,host=b").count(), 2);

    let regex = Predicate::default().with_rule(TagRule::new(
        Tag::new("host", "^a").unwrap(),
        Operator::RegexEqual,
    ));
    assert_eq!(
        series_of(&rows(&shard, &regex, TimeRange::all())),
        vec!["cpu,host=a", "cpu,host=apple", "mem,host=a"]
    );

    assert!(shard.query(&Predicate::measurement("disk"), TimeRange::all()).unwrap().next().is_none());
}

#[test]
fn test_invalid_rule_rejected_before_reading() {
    let temp_dir = TempDir::new().unwrap();
    let shard = Shard::open(temp_dir.path(), config()).unwrap();
    shard.write("cpu,host=a", "v", Point::new(1, 1.0)).unwrap();

    let bad = Predicate::default().with_rule(TagRule::regex("host", "a(").unwrap());
    let err = shard.query(&bad, TimeRange::all()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(matches!(err, BurrowError::InvalidPattern { .. }));
}

// ============================================================================
// Deletes
// ============================================================================

#[test]
fn test_deleted_series_is_gone_everywhere() {
    let temp_dir = TempDir::new().unwrap();
    let shard = Shard::open(temp_dir.path(), config()).unwrap();
    shard.write("cpu,host=a", "v", Point::new(1, 1.0)).unwrap();
    shard.write("cpu,host=b", "v", Point::new(1, 1.0)).unwrap();
    shard.flush().unwrap();
    shard.write("cpu,host=a", "v", Point::new(2, 2.0)).unwrap();

    shard.delete_series(&["cpu,host=a"]).unwrap();

    let all = Predicate::measurement("cpu");
    assert_eq!(series_of(&rows(&shard, &all, TimeRange::all())), vec!["cpu,host=b"]);
    let ids = shard
        .match_series(Some("cpu"), &[TagRule::equal("host", "a").unwrap()])
        .unwrap();
    assert!(ids.is_empty());

    shard.flush().unwrap();
    shard.compact().unwrap();
    assert_eq!(series_of(&rows(&shard, &all, TimeRange::all())), vec!["cpu,host=b"]);
    drop(shard);

    let shard = Shard::open(temp_dir.path(), config()).unwrap();
    assert_eq!(series_of(&rows(&shard, &all, TimeRange::all())), vec!["cpu,host=b"]);

    // Writing again revives the series with only the new data.
    shard.write("cpu,host=a", "v", Point::new(3, 3.0)).unwrap();
    let revived = rows(&shard, &all, TimeRange::all());
    let a: Vec<_> = revived.iter().filter(|r| &*r.series_key == "cpu,host=a").collect();
    assert_eq!(a.len(), 1);
    assert_eq!(a[0].timestamp, 3);
}

#[test]
fn test_delete_range_across_layers() {
    let temp_dir = TempDir::new().unwrap();
    let shard = Shard::open(temp_dir.path(), config()).unwrap();
    for ts in 0..5 {
        shard.write("cpu", "v", Point::new(ts, ts)).unwrap();
    }
    shard.flush().unwrap();
    for ts in 5..10 {
        shard.write("cpu", "v", Point::new(ts, ts)).unwrap();
    }
    shard.snapshot().unwrap();
    for ts in 10..15 {
        shard.write("cpu", "v", Point::new(ts, ts)).unwrap();
    }

    shard.delete_range(&["cpu"], TimeRange::new(3, 11)).unwrap();
    let expected = vec![0, 1, 2, 12, 13, 14];
    let timestamps = |shard: &Shard| -> Vec<i64> {
        rows(shard, &Predicate::measurement("cpu"), TimeRange::all())
            .into_iter()
            .map(|r| r.timestamp)
            .collect()
    };
    assert_eq!(timestamps(&shard), expected);

    shard.flush().unwrap();
    shard.compact().unwrap();
    assert_eq!(timestamps(&shard), expected);

    let empty = shard.delete_range(&["cpu"], TimeRange::new(10, 0)).unwrap_err();
    assert_eq!(empty.kind(), ErrorKind::Validation);
}

// ============================================================================
// Crash recovery
// ============================================================================

/// An acknowledged write survives a process that dies without closing.
#[test]
fn test_crash_recovery_from_wal() {
    let temp_dir = TempDir::new().unwrap();
    {
        let shard = Shard::open(temp_dir.path(), config()).unwrap();
        shard.write("cpu,host=a", "v", Point::new(1, 1.0)).unwrap();
        shard.flush().unwrap();
        shard.write("cpu,host=a", "v", Point::new(2, 2.0)).unwrap();
        shard.delete_range(&["cpu,host=a"], TimeRange::new(1, 1)).unwrap();
        shard.write("cpu,host=b", "v", Point::new(3, 3.0)).unwrap();
        // No close, no flush: the shard is abandoned as in a crash.
        std::mem::forget(shard);
    }

    let shard = Shard::open(temp_dir.path(), config()).unwrap();
    let read = rows(&shard, &Predicate::measurement("cpu"), TimeRange::all());
    let got: Vec<(String, i64)> = read
        .iter()
        .map(|r| (r.series_key.to_string(), r.timestamp))
        .collect();
    assert_eq!(got, vec![("cpu,host=a".into(), 2), ("cpu,host=b".into(), 3)]);
    assert!(!shard.is_degraded());
}

/// A crash mid-append leaves half a tombstone record; later deletes must
/// still land on their own lines and the file must stay healthy.
#[test]
fn test_torn_tombstone_sidecar_is_repaired() {
    init_tracing();
    let temp_dir = TempDir::new().unwrap();
    {
        let shard = Shard::open(temp_dir.path(), config()).unwrap();
        shard.write("cpu,host=a", "v", Point::new(1, 1.0)).unwrap();
        shard.write("cpu,host=b", "v", Point::new(1, 2.0)).unwrap();
        shard.flush().unwrap();
        shard.close().unwrap();
    }

    let tsm_dir = temp_dir.path().join("tsm");
    let tsm_file = std::fs::read_dir(&tsm_dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .find(|p| p.extension().is_some_and(|ext| ext == "tsm"))
        .unwrap();
    let mut sidecar_name = tsm_file.clone().into_os_string();
    sidecar_name.push(".tombstone");
    let sidecar = std::path::PathBuf::from(sidecar_name);
    std::fs::write(&sidecar, b"{\"key\":\"cpu,ho").unwrap();

    let all = Predicate::measurement("cpu");
    {
        let shard = Shard::open(temp_dir.path(), config()).unwrap();
        assert!(!shard.is_degraded());
        shard.delete_series(&["cpu,host=a"]).unwrap();
        shard.close().unwrap();
    }
    let text = std::fs::read_to_string(&sidecar).unwrap();
    assert!(text.ends_with('\n'));
    assert!(text.lines().all(|l| l.starts_with("{\"key\":\"cpu,host=a\"")));

    {
        let shard = Shard::open(temp_dir.path(), config()).unwrap();
        assert!(!shard.is_degraded());
        assert_eq!(series_of(&rows(&shard, &all, TimeRange::all())), vec!["cpu,host=b"]);
        shard.delete_series(&["cpu,host=b"]).unwrap();
        shard.close().unwrap();
    }

    let shard = Shard::open(temp_dir.path(), config()).unwrap();
    assert!(!shard.is_degraded());
    assert_eq!(shard.stats().files, 1);
    assert!(rows(&shard, &all, TimeRange::all()).is_empty());
    let quarantined = std::fs::read_dir(&tsm_dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .any(|p| p.extension().is_some_and(|ext| ext == "quarantine"));
    assert!(!quarantined);
    assert_eq!(std::fs::read_to_string(&sidecar).unwrap().lines().count(), 2);
}

#[test]
fn test_reopen_is_idempotent() {
    let temp_dir = TempDir::new().unwrap();
    let sequence = {
        let shard = Shard::open(temp_dir.path(), config()).unwrap();
        shard.write("cpu", "v", Point::new(1, 1.0)).unwrap()
    };
    for _ in 0..3 {
        let shard = Shard::open(temp_dir.path(), config()).unwrap();
        assert_eq!(shard.stats().last_sequence, sequence);
        assert_eq!(
            rows(&shard, &Predicate::measurement("cpu"), TimeRange::all()).len(),
            1
        );
    }
}

// ============================================================================
// Background compaction and backpressure
// ============================================================================

#[test]
fn test_background_worker_flushes() {
    init_tracing();
    let temp_dir = TempDir::new().unwrap();
    let config = ShardConfig::default()
        .with_wal(WalConfig::default().with_sync_mode(SyncMode::None))
        .with_cache(CacheConfig::default().with_snapshot_size(4 * 1024))
        .with_compaction(CompactionConfig::default().with_interval(Duration::from_millis(20)));
    let shard = Shard::open(temp_dir.path(), config).unwrap();

    for ts in 0..1000 {
        shard.write("cpu,host=a", "v", Point::new(ts, ts as f64)).unwrap();
    }

    let deadline = Instant::now() + Duration::from_secs(10);
    while shard.stats().files == 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(shard.stats().files > 0, "worker never flushed");
    assert_eq!(
        rows(&shard, &Predicate::measurement("cpu"), TimeRange::all()).len(),
        1000
    );
    shard.close().unwrap();
}

#[test]
fn test_backpressure() {
    let temp_dir = TempDir::new().unwrap();
    let cache = CacheConfig::default()
        .with_snapshot_size(256)
        .with_max_size(512);
    let shard = Shard::open(temp_dir.path(), config().with_cache(cache)).unwrap();

    // Single writes keep going: a full cache is flushed in the writer's thread.
    for ts in 0..100 {
        shard.write("cpu", "v", Point::new(ts, ts as f64)).unwrap();
    }
    assert!(shard.stats().files > 0);

    // A batch that cannot fit even in an empty cache is refused untouched.
    let before = shard.stats().last_sequence;
    let batch: Vec<WritePoint> = (1000..1100)
        .map(|ts| WritePoint::new("cpu", "v", Point::new(ts, 0.0)))
        .collect();
    let err = shard.write_points(&batch).unwrap_err();
    assert!(matches!(err, BurrowError::CacheFull { .. }));
    assert_eq!(err.kind(), ErrorKind::ResourceExhaustion);
    assert_eq!(shard.stats().last_sequence, before);
    assert_eq!(
        rows(&shard, &Predicate::measurement("cpu"), TimeRange::all()).len(),
        100
    );
}

#[test]
fn test_drop_shard_removes_everything() {
    let temp_dir = TempDir::new().unwrap();
    let dir = temp_dir.path().join("shard-0001");
    let shard = Shard::open(&dir, config()).unwrap();
    shard.write("cpu", "v", Point::new(1, 1.0)).unwrap();
    shard.flush().unwrap();
    shard.drop_shard().unwrap();
    assert!(!dir.exists());
}
