//! Write cache: the in-memory, per-series sorted buffer of recent points.
//!
//! The cache is a stack of generations. Writes land in the live memtable;
//! [`WriteCache::snapshot`] freezes it into an immutable [`CacheSnapshot`] and
//! starts a fresh one. Snapshots stay readable until the compactor has
//! published the file written from them and calls
//! [`WriteCache::remove_snapshot`].
//!
//! ```text
//! Client → WAL append → cache write → Ack
//!                          │
//!               snapshot() │ (size bound or explicit flush)
//!                          ▼
//!                 frozen snapshot → compactor → TSM file
//! ```

use crate::error::{BurrowError, Result};
use crate::tsm::tombstone::{self, Tombstone};
use crate::tsm::{stream_key, Point, SeriesId, TimeRange, Timestamp, Value, ValueType};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// Default size at which a snapshot is scheduled (25 MiB).
pub const DEFAULT_SNAPSHOT_SIZE: usize = 25 * 1024 * 1024;

/// Default hard bound on cache size (1 GiB).
pub const DEFAULT_MAX_SIZE: usize = 1024 * 1024 * 1024;

/// Per-point bookkeeping overhead used in the size estimate.
const POINT_OVERHEAD: usize = 16;

/// Write cache sizing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Live size (estimated bytes) at which a snapshot is scheduled.
    pub snapshot_size: usize,
    /// Total size (live plus unflushed snapshots) that writes may not exceed.
    pub max_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            snapshot_size: DEFAULT_SNAPSHOT_SIZE,
            max_size: DEFAULT_MAX_SIZE,
        }
    }
}

impl CacheConfig {
    /// Sets the snapshot threshold.
    pub fn with_snapshot_size(mut self, bytes: usize) -> Self {
        self.snapshot_size = bytes;
        self
    }

    /// Sets the hard size bound.
    pub fn with_max_size(mut self, bytes: usize) -> Self {
        self.max_size = bytes;
        self
    }
}

/// Point-in-time cache statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    /// Points in the live memtable.
    pub point_count: u64,
    /// Estimated bytes in the live memtable.
    pub live_bytes: usize,
    /// Estimated bytes held by frozen snapshots.
    pub snapshot_bytes: usize,
    /// Number of frozen snapshots awaiting flush.
    pub snapshot_count: usize,
    /// Smallest timestamp written to the live memtable.
    pub min_timestamp: i64,
    /// Largest timestamp written to the live memtable.
    pub max_timestamp: i64,
}

#[derive(Debug)]
struct LiveCounters {
    point_count: AtomicU64,
    bytes: AtomicUsize,
    min_timestamp: AtomicI64,
    max_timestamp: AtomicI64,
}

impl Default for LiveCounters {
    fn default() -> Self {
        Self {
            point_count: AtomicU64::new(0),
            bytes: AtomicUsize::new(0),
            min_timestamp: AtomicI64::new(i64::MAX),
            max_timestamp: AtomicI64::new(i64::MIN),
        }
    }
}

impl LiveCounters {
    fn update_timestamp(&self, ts: i64) {
        let mut current = self.min_timestamp.load(Ordering::Relaxed);
        while ts < current {
            match self.min_timestamp.compare_exchange_weak(
                current,
                ts,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(c) => current = c,
            }
        }

        let mut current = self.max_timestamp.load(Ordering::Relaxed);
        while ts > current {
            match self.max_timestamp.compare_exchange_weak(
                current,
                ts,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(c) => current = c,
            }
        }
    }

    fn reset(&self) {
        self.point_count.store(0, Ordering::Relaxed);
        self.bytes.store(0, Ordering::Relaxed);
        self.min_timestamp.store(i64::MAX, Ordering::Relaxed);
        self.max_timestamp.store(i64::MIN, Ordering::Relaxed);
    }
}

#[derive(Debug)]
struct CachedStream {
    value_type: ValueType,
    points: BTreeMap<Timestamp, Value>,
}

#[derive(Debug)]
struct CachedSeries {
    key: Arc<str>,
    fields: HashMap<String, CachedStream>,
}

/// One generation of cached points.
#[derive(Debug)]
struct Memtable {
    series: HashMap<SeriesId, CachedSeries>,
    bytes: usize,
    min_sequence: u64,
    max_sequence: u64,
}

impl Default for Memtable {
    fn default() -> Self {
        Self {
            series: HashMap::new(),
            bytes: 0,
            min_sequence: u64::MAX,
            max_sequence: 0,
        }
    }
}

impl Memtable {
    fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    fn field_type(&self, id: SeriesId, field: &str) -> Option<ValueType> {
        self.series
            .get(&id)?
            .fields
            .get(field)
            .map(|s| s.value_type)
    }

    /// Inserts a point and returns `(bytes added, bytes removed, was_new)`.
    fn insert(&mut self, id: SeriesId, key: &Arc<str>, field: &str, point: Point) -> (usize, usize, bool) {
        let series = self.series.entry(id).or_insert_with(|| CachedSeries {
            key: Arc::clone(key),
            fields: HashMap::new(),
        });
        let stream = series
            .fields
            .entry(field.to_string())
            .or_insert_with(|| CachedStream {
                value_type: point.value.value_type(),
                points: BTreeMap::new(),
            });
        let added = POINT_OVERHEAD + point.value.size_hint();
        match stream.points.insert(point.timestamp, point.value) {
            Some(old) => {
                let removed = POINT_OVERHEAD + old.size_hint();
                self.bytes = self.bytes + added - removed;
                (added, removed, false)
            }
            None => {
                self.bytes += added;
                (added, 0, true)
            }
        }
    }

    fn read_into(
        &self,
        id: SeriesId,
        field: &str,
        range: TimeRange,
        out: &mut BTreeMap<Timestamp, Value>,
    ) {
        let Some(stream) = self.series.get(&id).and_then(|s| s.fields.get(field)) else {
            return;
        };
        for (ts, value) in stream.points.range(range.min..=range.max) {
            out.insert(*ts, value.clone());
        }
    }

    /// Removes points in `range`; returns `(points removed, bytes removed)`.
    fn remove_range(&mut self, id: SeriesId, field: Option<&str>, range: TimeRange) -> (u64, usize) {
        let Some(series) = self.series.get_mut(&id) else {
            return (0, 0);
        };
        let mut points_removed = 0u64;
        let mut bytes_removed = 0usize;
        for (name, stream) in series.fields.iter_mut() {
            if field.is_some_and(|f| f != name) {
                continue;
            }
            let doomed: Vec<Timestamp> = stream
                .points
                .range(range.min..=range.max)
                .map(|(ts, _)| *ts)
                .collect();
            for ts in doomed {
                if let Some(old) = stream.points.remove(&ts) {
                    points_removed += 1;
                    bytes_removed += POINT_OVERHEAD + old.size_hint();
                }
            }
        }
        series.fields.retain(|_, s| !s.points.is_empty());
        if series.fields.is_empty() {
            self.series.remove(&id);
        }
        self.bytes -= bytes_removed;
        (points_removed, bytes_removed)
    }
}

/// A frozen cache generation awaiting conversion into a TSM file.
#[derive(Debug)]
pub struct CacheSnapshot {
    generation: u64,
    memtable: Memtable,
    tombstones: Mutex<Vec<Tombstone>>,
}

/// One stream of a snapshot, ready to be written to a file.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotStream {
    /// Stream key (`series#!~#field`).
    pub key: String,
    /// Value type of the stream.
    pub value_type: ValueType,
    /// Sorted points.
    pub points: Vec<(Timestamp, Value)>,
}

impl CacheSnapshot {
    /// Generation the snapshot was frozen with; its file inherits it.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Lowest WAL sequence whose data is in the snapshot.
    pub fn min_sequence(&self) -> u64 {
        self.memtable.min_sequence
    }

    /// Highest WAL sequence whose data is in the snapshot.
    pub fn max_sequence(&self) -> u64 {
        self.memtable.max_sequence
    }

    /// Estimated bytes held.
    pub fn size(&self) -> usize {
        self.memtable.bytes
    }

    /// Returns true if the snapshot holds the series.
    pub fn contains_series(&self, id: SeriesId) -> bool {
        self.memtable.series.contains_key(&id)
    }

    /// Records a delete that arrived after the snapshot was frozen.
    pub fn add_tombstone(&self, tombstone: Tombstone) {
        let mut guard = self.tombstones.lock().unwrap_or_else(|err| err.into_inner());
        guard.push(tombstone);
    }

    /// Returns a copy of the pending tombstones.
    pub fn tombstones(&self) -> Vec<Tombstone> {
        self.tombstones
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .clone()
    }

    fn read_into(
        &self,
        id: SeriesId,
        field: &str,
        range: TimeRange,
        out: &mut BTreeMap<Timestamp, Value>,
    ) {
        let mut points = BTreeMap::new();
        self.memtable.read_into(id, field, range, &mut points);
        if points.is_empty() {
            return;
        }
        let tombstones = self.tombstones.lock().unwrap_or_else(|err| err.into_inner());
        if let Some(series) = self.memtable.series.get(&id) {
            let key = stream_key(&series.key, field);
            points.retain(|ts, _| !tombstones.iter().any(|t| t.covers(&key, *ts)));
        }
        out.extend(points);
    }

    /// Returns every stream sorted by key with tombstoned points removed.
    pub fn streams(&self) -> Vec<SnapshotStream> {
        let tombstones = self.tombstones();
        let mut streams = Vec::new();
        for series in self.memtable.series.values() {
            for (field, stream) in &series.fields {
                let key = stream_key(&series.key, field);
                let mut points: Vec<(Timestamp, Value)> = stream
                    .points
                    .iter()
                    .map(|(ts, v)| (*ts, v.clone()))
                    .collect();
                tombstone::filter_points(&tombstones, &key, &mut points);
                if !points.is_empty() {
                    streams.push(SnapshotStream {
                        key,
                        value_type: stream.value_type,
                        points,
                    });
                }
            }
        }
        streams.sort_by(|a, b| a.key.cmp(&b.key));
        streams
    }
}

#[derive(Debug, Default)]
struct CacheInner {
    live: Memtable,
    /// Oldest first.
    snapshots: Vec<Arc<CacheSnapshot>>,
}

/// The shard's write cache.
#[derive(Debug)]
pub struct WriteCache {
    config: CacheConfig,
    inner: RwLock<CacheInner>,
    live: LiveCounters,
    snapshot_bytes: AtomicUsize,
}

/// One point addressed to the cache.
#[derive(Debug, Clone)]
pub struct CacheWrite {
    /// Resolved series id.
    pub series_id: SeriesId,
    /// Canonical series key.
    pub series_key: Arc<str>,
    /// Field name.
    pub field: String,
    /// The point.
    pub point: Point,
}

impl WriteCache {
    /// Creates an empty cache.
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            inner: RwLock::new(CacheInner::default()),
            live: LiveCounters::default(),
            snapshot_bytes: AtomicUsize::new(0),
        }
    }

    /// The sizing configuration.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Writes one point at WAL sequence `sequence`.
    ///
    /// A point whose timestamp already exists in the live memtable replaces it.
    ///
    /// # Errors
    ///
    /// Returns `FieldTypeConflict` if the stream already holds another type;
    /// nothing is written in that case.
    pub fn write(
        &self,
        series_id: SeriesId,
        series_key: &Arc<str>,
        field: &str,
        point: Point,
        sequence: u64,
    ) -> Result<()> {
        self.write_batch(
            &[CacheWrite {
                series_id,
                series_key: Arc::clone(series_key),
                field: field.to_string(),
                point,
            }],
            sequence,
        )
    }

    /// Writes a batch atomically: either every point is applied or, on a
    /// type conflict, none is.
    pub fn write_batch(&self, writes: &[CacheWrite], sequence: u64) -> Result<()> {
        let mut inner = self.inner.write().unwrap_or_else(|err| err.into_inner());

        let mut batch_types: HashMap<(SeriesId, &str), ValueType> = HashMap::new();
        for w in writes {
            let got = w.point.value.value_type();
            let stored = batch_types
                .get(&(w.series_id, w.field.as_str()))
                .copied()
                .or_else(|| Self::field_type_locked(&inner, w.series_id, &w.field));
            if let Some(stored) = stored {
                if stored != got {
                    return Err(BurrowError::FieldTypeConflict {
                        key: stream_key(&w.series_key, &w.field),
                        stored,
                        got,
                    });
                }
            }
            batch_types.insert((w.series_id, w.field.as_str()), got);
        }

        for w in writes {
            let ts = w.point.timestamp;
            let (added, removed, was_new) =
                inner
                    .live
                    .insert(w.series_id, &w.series_key, &w.field, w.point.clone());
            self.live.bytes.fetch_add(added, Ordering::Relaxed);
            self.live.bytes.fetch_sub(removed, Ordering::Relaxed);
            if was_new {
                self.live.point_count.fetch_add(1, Ordering::Relaxed);
            }
            self.live.update_timestamp(ts);
        }
        if !writes.is_empty() {
            inner.live.min_sequence = inner.live.min_sequence.min(sequence);
            inner.live.max_sequence = inner.live.max_sequence.max(sequence);
        }
        Ok(())
    }

    fn field_type_locked(inner: &CacheInner, id: SeriesId, field: &str) -> Option<ValueType> {
        inner
            .live
            .field_type(id, field)
            .or_else(|| {
                inner
                    .snapshots
                    .iter()
                    .rev()
                    .find_map(|s| s.memtable.field_type(id, field))
            })
    }

    /// Type of a cached stream, if any generation holds it.
    pub fn field_type(&self, series_id: SeriesId, field: &str) -> Option<ValueType> {
        let inner = self.inner.read().unwrap_or_else(|err| err.into_inner());
        Self::field_type_locked(&inner, series_id, field)
    }

    /// Reads the cached points of a stream in `range`, newest generation
    /// winning on equal timestamps.
    pub fn read(&self, series_id: SeriesId, field: &str, range: TimeRange) -> Vec<(Timestamp, Value)> {
        if range.is_empty() {
            return Vec::new();
        }
        let inner = self.inner.read().unwrap_or_else(|err| err.into_inner());
        let mut merged = BTreeMap::new();
        for snapshot in &inner.snapshots {
            snapshot.read_into(series_id, field, range, &mut merged);
        }
        inner.live.read_into(series_id, field, range, &mut merged);
        merged.into_iter().collect()
    }

    /// Field names cached for a series across all generations.
    pub fn fields(&self, series_id: SeriesId) -> Vec<String> {
        let inner = self.inner.read().unwrap_or_else(|err| err.into_inner());
        let mut names: Vec<String> = inner
            .snapshots
            .iter()
            .map(|s| &s.memtable)
            .chain(std::iter::once(&inner.live))
            .filter_map(|m| m.series.get(&series_id))
            .flat_map(|s| s.fields.keys().cloned())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Deletes `range` of a series (or one field of it).
    ///
    /// Points are dropped from the live memtable at once; every frozen
    /// snapshot holding the series records a tombstone instead.
    pub fn delete_range(
        &self,
        series_id: SeriesId,
        series_key: &str,
        field: Option<&str>,
        range: TimeRange,
    ) {
        if range.is_empty() {
            return;
        }
        let mut inner = self.inner.write().unwrap_or_else(|err| err.into_inner());
        let (points, bytes) = inner.live.remove_range(series_id, field, range);
        self.live.point_count.fetch_sub(points, Ordering::Relaxed);
        self.live.bytes.fetch_sub(bytes, Ordering::Relaxed);

        let key = match field {
            Some(f) => stream_key(series_key, f),
            None => series_key.to_string(),
        };
        for snapshot in &inner.snapshots {
            if snapshot.contains_series(series_id) {
                snapshot.add_tombstone(Tombstone::range(key.clone(), range));
            }
        }
    }

    /// Freezes the live memtable as `generation`.
    ///
    /// Returns `None` if the live memtable is empty.
    pub fn snapshot(&self, generation: u64) -> Option<Arc<CacheSnapshot>> {
        let mut inner = self.inner.write().unwrap_or_else(|err| err.into_inner());
        if inner.live.is_empty() {
            // Deletes may have emptied it; forget its sequence range.
            inner.live = Memtable::default();
            self.live.reset();
            return None;
        }
        let memtable = std::mem::take(&mut inner.live);
        self.snapshot_bytes.fetch_add(memtable.bytes, Ordering::Relaxed);
        self.live.reset();
        let snapshot = Arc::new(CacheSnapshot {
            generation,
            memtable,
            tombstones: Mutex::new(Vec::new()),
        });
        inner.snapshots.push(Arc::clone(&snapshot));
        Some(snapshot)
    }

    /// Frozen snapshots, oldest first.
    pub fn snapshots(&self) -> Vec<Arc<CacheSnapshot>> {
        let inner = self.inner.read().unwrap_or_else(|err| err.into_inner());
        inner.snapshots.clone()
    }

    /// Drops a snapshot after its file has been published.
    pub fn remove_snapshot(&self, generation: u64) {
        let mut inner = self.inner.write().unwrap_or_else(|err| err.into_inner());
        if let Some(pos) = inner
            .snapshots
            .iter()
            .position(|s| s.generation == generation)
        {
            let removed = inner.snapshots.remove(pos);
            self.snapshot_bytes
                .fetch_sub(removed.memtable.bytes, Ordering::Relaxed);
        }
    }

    /// Lowest WAL sequence with data in the live memtable.
    pub fn live_min_sequence(&self) -> Option<u64> {
        let inner = self.inner.read().unwrap_or_else(|err| err.into_inner());
        (inner.live.min_sequence != u64::MAX).then_some(inner.live.min_sequence)
    }

    /// Ids of every series held by any generation.
    pub fn series_ids(&self) -> HashSet<SeriesId> {
        let inner = self.inner.read().unwrap_or_else(|err| err.into_inner());
        inner
            .snapshots
            .iter()
            .map(|s| &s.memtable)
            .chain(std::iter::once(&inner.live))
            .flat_map(|m| m.series.keys().copied())
            .collect()
    }

    /// Estimated bytes in the live memtable.
    pub fn live_size(&self) -> usize {
        self.live.bytes.load(Ordering::Relaxed)
    }

    /// Estimated bytes across live memtable and snapshots.
    pub fn total_size(&self) -> usize {
        self.live_size() + self.snapshot_bytes.load(Ordering::Relaxed)
    }

    /// Returns true if the live memtable has outgrown the snapshot threshold.
    pub fn should_snapshot(&self) -> bool {
        self.live_size() >= self.config.snapshot_size
    }

    /// Returns true if adding `incoming` bytes would exceed the hard bound.
    pub fn would_exceed(&self, incoming: usize) -> bool {
        self.total_size() + incoming > self.config.max_size
    }

    /// Current statistics.
    pub fn stats(&self) -> CacheStats {
        let snapshot_count = self
            .inner
            .read()
            .unwrap_or_else(|err| err.into_inner())
            .snapshots
            .len();
        CacheStats {
            point_count: self.live.point_count.load(Ordering::Relaxed),
            live_bytes: self.live_size(),
            snapshot_bytes: self.snapshot_bytes.load(Ordering::Relaxed),
            snapshot_count,
            min_timestamp: self.live.min_timestamp.load(Ordering::Relaxed),
            max_timestamp: self.live.max_timestamp.load(Ordering::Relaxed),
        }
    }
}

/// Estimated cache bytes for one incoming point.
pub fn estimate_size(point: &Point) -> usize {
    POINT_OVERHEAD + point.value.size_hint()
}
