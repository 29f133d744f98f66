//! The shard: one WAL, one write cache, one file store, one series index and
//! one compactor behind a single public contract.
//!
//! # Write path
//!
//! ```text
//! validate → backpressure → [WAL lock: type check → append → cache] → ack
//! ```
//!
//! Sequence assignment and cache application happen under the same lock, so
//! the cache always reflects a prefix of the log.
//!
//! # Read path
//!
//! A query resolves series through the index, copies the cached points of
//! every matching stream, then captures the file list. Cached data wins over
//! file data. Snapshots are published to the file store before they leave
//! the cache, so no point can fall between the two captures.

use crate::error::{BurrowError, Result};
use crate::index::{Predicate, SeriesIndex, SeriesKey, TagRule};
use crate::lifecycle::{
    CompactionConfig, CompactionOutcome, CompactionStats, CompactionWorker, Compactor,
    CompactorState, SafeSequenceTracker, Trigger, TriggerHandle,
};
use crate::tsm::cache::{estimate_size, CacheConfig, CacheStats, CacheWrite, WriteCache};
use crate::tsm::store::{read_stream, FileStore, TsmFile};
use crate::tsm::{
    stream_key, Point, SeriesId, TimeRange, Timestamp, Tombstone, Value, ValueType,
    FIELD_SEPARATOR,
};
use crate::wal::{Wal, WalConfig, WalEntry, WalPoint};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// WAL directory inside a shard.
pub const WAL_DIR: &str = "wal";

/// TSM directory inside a shard.
pub const TSM_DIR: &str = "tsm";

/// Upper bound on cycles run for one worker wake-up.
const MAX_CYCLES_PER_WAKEUP: usize = 16;

/// Shard configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardConfig {
    /// Write-ahead log settings.
    pub wal: WalConfig,
    /// Write cache sizing.
    pub cache: CacheConfig,
    /// Compaction levels and thresholds.
    pub compaction: CompactionConfig,
    /// Run compaction on a background thread.
    pub background_compaction: bool,
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            wal: WalConfig::default(),
            cache: CacheConfig::default(),
            compaction: CompactionConfig::default(),
            background_compaction: true,
        }
    }
}

impl ShardConfig {
    /// Sets the WAL config.
    pub fn with_wal(mut self, wal: WalConfig) -> Self {
        self.wal = wal;
        self
    }

    /// Sets the cache config.
    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    /// Sets the compaction config.
    pub fn with_compaction(mut self, compaction: CompactionConfig) -> Self {
        self.compaction = compaction;
        self
    }

    /// Enables or disables the background worker.
    pub fn with_background_compaction(mut self, enabled: bool) -> Self {
        self.background_compaction = enabled;
        self
    }

    /// Checks the config before anything is opened.
    pub fn validate(&self) -> Result<()> {
        self.compaction.validate()?;
        if self.wal.segment_size == 0 {
            return Err(BurrowError::Validation(
                "WAL segment size must be positive".into(),
            ));
        }
        if self.cache.snapshot_size == 0 || self.cache.max_size < self.cache.snapshot_size {
            return Err(BurrowError::Validation(format!(
                "cache sizes invalid: snapshot_size {} max_size {}",
                self.cache.snapshot_size, self.cache.max_size
            )));
        }
        Ok(())
    }
}

/// One point addressed by series key and field.
#[derive(Debug, Clone, PartialEq)]
pub struct WritePoint {
    /// Series key text; tags may be unsorted.
    pub series_key: String,
    /// Field name.
    pub field: String,
    /// Timestamp and value.
    pub point: Point,
}

impl WritePoint {
    /// Creates a write.
    pub fn new(series_key: impl Into<String>, field: impl Into<String>, point: Point) -> Self {
        Self {
            series_key: series_key.into(),
            field: field.into(),
            point,
        }
    }
}

/// One result row.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    /// Canonical series key.
    pub series_key: Arc<str>,
    /// Field name.
    pub field: Arc<str>,
    /// Point timestamp.
    pub timestamp: Timestamp,
    /// Point value.
    pub value: Value,
}

struct PendingStream {
    series_key: Arc<str>,
    field: Arc<str>,
    cached: Vec<(Timestamp, Value)>,
}

/// Lazy query result.
///
/// Streams are decoded one at a time as the iterator advances. The file set
/// captured at query start stays alive until the result is dropped; dropping
/// it early cancels the rest of the read.
pub struct QueryResult {
    files: Arc<Vec<Arc<TsmFile>>>,
    range: TimeRange,
    pending: VecDeque<PendingStream>,
    current: std::vec::IntoIter<Row>,
    degraded: bool,
}

impl QueryResult {
    fn new(
        files: Arc<Vec<Arc<TsmFile>>>,
        range: TimeRange,
        streams: Vec<PendingStream>,
        degraded: bool,
    ) -> Self {
        Self {
            files,
            range,
            pending: streams.into(),
            current: Vec::new().into_iter(),
            degraded,
        }
    }

    /// Returns true if some data could not be read. Becomes final once the
    /// iterator is exhausted.
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Streams not yet decoded.
    pub fn remaining_streams(&self) -> usize {
        self.pending.len()
    }

    fn load(&mut self, stream: PendingStream) -> Result<()> {
        let key = stream_key(&stream.series_key, &stream.field);
        let read = read_stream(&self.files, &key, self.range)?;
        self.degraded |= read.degraded;

        let mut merged: BTreeMap<Timestamp, Value> = read.points.into_iter().collect();
        merged.extend(stream.cached);
        let rows: Vec<Row> = merged
            .into_iter()
            .map(|(timestamp, value)| Row {
                series_key: Arc::clone(&stream.series_key),
                field: Arc::clone(&stream.field),
                timestamp,
                value,
            })
            .collect();
        self.current = rows.into_iter();
        Ok(())
    }
}

impl Iterator for QueryResult {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(row) = self.current.next() {
                return Some(Ok(row));
            }
            let stream = self.pending.pop_front()?;
            if let Err(err) = self.load(stream) {
                return Some(Err(err));
            }
        }
    }
}

impl std::fmt::Debug for QueryResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryResult")
            .field("files", &self.files.len())
            .field("range", &self.range)
            .field("remaining_streams", &self.pending.len())
            .field("degraded", &self.degraded)
            .finish()
    }
}

/// Point-in-time shard statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardStats {
    /// Live series in the index.
    pub series: u64,
    /// Visible TSM files.
    pub files: usize,
    /// Bytes of visible TSM files.
    pub file_bytes: u64,
    /// Files per level.
    pub files_per_level: BTreeMap<u16, usize>,
    /// Write cache counters.
    pub cache: CacheStats,
    /// Compactor counters.
    pub compaction: CompactionStats,
    /// WAL segments on disk.
    pub wal_segments: usize,
    /// Last assigned WAL sequence.
    pub last_sequence: u64,
    /// Highest retired WAL sequence.
    pub retired_sequence: u64,
    /// Frozen snapshots whose file is not yet published.
    pub pending_snapshots: usize,
    /// True if some stored data is unavailable.
    pub degraded: bool,
}

struct ShardInner {
    dir: PathBuf,
    wal: Mutex<Wal>,
    cache: Arc<WriteCache>,
    store: Arc<FileStore>,
    index: SeriesIndex,
    compactor: Compactor,
    tracker: SafeSequenceTracker,
    trigger: Option<TriggerHandle>,
    closed: AtomicBool,
}

/// One shard: a directory holding a WAL and a TSM file store, plus the
/// write cache and series index built over them.
pub struct Shard {
    inner: Arc<ShardInner>,
    worker: Mutex<Option<CompactionWorker>>,
}

impl std::fmt::Debug for Shard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shard")
            .field("dir", &self.inner.dir)
            .field("closed", &self.inner.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl Shard {
    /// Opens a shard directory, recovering whatever it holds.
    ///
    /// The index is rebuilt from the keys of the TSM files, then the WAL is
    /// replayed into the cache and index. Replayed deletes are re-applied to
    /// files written before them.
    ///
    /// # Errors
    ///
    /// Fails on an invalid config, on a WAL segment damaged before its tail,
    /// and on I/O errors. Unreadable TSM files are quarantined instead.
    pub fn open(dir: impl AsRef<Path>, config: ShardConfig) -> Result<Self> {
        config.validate()?;
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let store = Arc::new(FileStore::open(dir.join(TSM_DIR))?);
        let cache = Arc::new(WriteCache::new(config.cache.clone()));
        let index = SeriesIndex::new();
        rebuild_index(&index, &store);

        let mut wal = Wal::open(dir.join(WAL_DIR), config.wal.clone())?;
        let flushed_sequence = store
            .files()
            .iter()
            .map(|f| f.max_sequence())
            .max()
            .unwrap_or(0);
        wal.advance_sequence(flushed_sequence);
        let entries = wal.recover();

        let (trigger, receiver) = if config.background_compaction {
            let (handle, receiver) = TriggerHandle::channel();
            (Some(handle), Some(receiver))
        } else {
            (None, None)
        };

        let inner = Arc::new(ShardInner {
            dir: dir.clone(),
            wal: Mutex::new(wal),
            compactor: Compactor::new(
                config.compaction.clone(),
                Arc::clone(&store),
                Arc::clone(&cache),
            ),
            cache,
            store,
            index,
            tracker: SafeSequenceTracker::new(),
            trigger,
            closed: AtomicBool::new(false),
        });

        let replayed = entries.len();
        for entry in entries {
            inner.replay(entry)?;
        }

        let worker = match (inner.trigger.clone(), receiver) {
            (Some(handle), Some(receiver)) => {
                let cycle_inner = Arc::clone(&inner);
                let name = format!(
                    "burrow-compact-{}",
                    dir.file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default()
                );
                Some(CompactionWorker::spawn(
                    name,
                    config.compaction.interval,
                    handle,
                    receiver,
                    move |trigger| cycle_inner.background_cycle(trigger),
                )?)
            }
            _ => None,
        };

        info!(
            dir = %dir.display(),
            files = inner.store.len(),
            series = inner.index.series_count(),
            replayed,
            degraded = inner.store.is_degraded(),
            "Opened shard"
        );

        Ok(Self {
            inner,
            worker: Mutex::new(worker),
        })
    }

    /// Shard directory.
    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    /// Writes one point. Returns its WAL sequence.
    pub fn write(&self, series_key: &str, field: &str, point: Point) -> Result<u64> {
        self.write_points(&[WritePoint::new(series_key, field, point)])
    }

    /// Writes a batch atomically under one WAL sequence.
    ///
    /// # Errors
    ///
    /// - `Validation` class: malformed key or field, type conflict. Nothing
    ///   was logged.
    /// - `Durability` class: the WAL sync failed; the write is not stored.
    /// - `ResourceExhaustion`: the cache is full even after a forced flush.
    pub fn write_points(&self, points: &[WritePoint]) -> Result<u64> {
        self.inner.ensure_open()?;
        if points.is_empty() {
            return Err(BurrowError::Validation("empty write batch".into()));
        }

        let mut parsed = Vec::with_capacity(points.len());
        for p in points {
            let key = SeriesKey::parse(&p.series_key)?;
            validate_field(&p.field)?;
            let canonical = key.to_string();
            parsed.push((key, canonical, p));
        }

        let incoming: usize = points.iter().map(|p| estimate_size(&p.point)).sum();
        self.inner.reserve(incoming)?;

        let mut wal = self.inner.lock_wal();
        self.inner.check_types(&parsed)?;
        let entry = WalEntry::write_points(
            parsed
                .iter()
                .map(|(_, canonical, p)| WalPoint {
                    series_key: canonical.clone(),
                    field: p.field.clone(),
                    timestamp: p.point.timestamp,
                    value: p.point.value.clone(),
                })
                .collect(),
        );
        let sequence = wal.append(entry)?;

        let writes: Vec<CacheWrite> = parsed
            .iter()
            .map(|(key, _, p)| {
                let (series_id, series_key) = self.inner.index.resolve(key);
                CacheWrite {
                    series_id,
                    series_key,
                    field: p.field.clone(),
                    point: p.point.clone(),
                }
            })
            .collect();
        self.inner.cache.write_batch(&writes, sequence)?;
        drop(wal);

        if self.inner.cache.should_snapshot() {
            self.inner.notify(Trigger::Snapshot);
        }
        Ok(sequence)
    }

    /// Reads one stream.
    pub fn read(&self, series_key: &str, field: &str, range: TimeRange) -> Result<QueryResult> {
        self.inner.ensure_open()?;
        let key = SeriesKey::parse(series_key)?;
        let canonical = key.to_string();
        let streams = match self.inner.index.get(&canonical) {
            Some(id) => vec![(id, Arc::<str>::from(canonical), vec![field.to_string()])],
            None => Vec::new(),
        };
        Ok(self.inner.capture(streams, range))
    }

    /// Reads every stream of every series matching `predicate`, series in
    /// id order and fields by name.
    ///
    /// # Errors
    ///
    /// Rejects invalid rules before reading anything.
    pub fn query(&self, predicate: &Predicate, range: TimeRange) -> Result<QueryResult> {
        self.inner.ensure_open()?;
        let series = self
            .inner
            .index
            .match_keys(predicate.measurement.as_deref(), &predicate.rules)?;
        let mut streams = Vec::with_capacity(series.len());
        for (id, key) in series {
            let fields: Vec<String> = match &predicate.field {
                Some(field) => vec![field.clone()],
                None => {
                    let mut fields: BTreeSet<String> = self.inner.store.fields(&key);
                    fields.extend(self.inner.cache.fields(id));
                    fields.into_iter().collect()
                }
            };
            streams.push((id, key, fields));
        }
        Ok(self.inner.capture(streams, range))
    }

    /// Ids of live series of `measurement` matching every rule.
    pub fn match_series(
        &self,
        measurement: Option<&str>,
        rules: &[TagRule],
    ) -> Result<Vec<SeriesId>> {
        self.inner.ensure_open()?;
        self.inner.index.match_rules(measurement, rules)
    }

    /// The series index.
    pub fn index(&self) -> &SeriesIndex {
        &self.inner.index
    }

    /// Deletes every point of the given series. Returns the WAL sequence.
    pub fn delete_series(&self, series_keys: &[&str]) -> Result<u64> {
        self.inner.ensure_open()?;
        let keys = canonical_keys(series_keys)?;
        let mut wal = self.inner.lock_wal();
        let sequence = wal.append(WalEntry::delete_series(keys.clone()))?;
        self.inner.apply_delete(&keys, TimeRange::all(), true, |_| true)?;
        drop(wal);
        info!(series = keys.len(), sequence, "Deleted series");
        Ok(sequence)
    }

    /// Deletes `range` of the given series. Returns the WAL sequence.
    pub fn delete_range(&self, series_keys: &[&str], range: TimeRange) -> Result<u64> {
        self.inner.ensure_open()?;
        if range.is_empty() {
            return Err(BurrowError::Validation(format!(
                "empty time range [{}, {}]",
                range.min, range.max
            )));
        }
        let keys = canonical_keys(series_keys)?;
        let mut wal = self.inner.lock_wal();
        let sequence = wal.append(WalEntry::delete_range(keys.clone(), range))?;
        self.inner.apply_delete(&keys, range, false, |_| true)?;
        drop(wal);
        debug!(
            series = keys.len(),
            min = range.min,
            max = range.max,
            sequence,
            "Deleted range"
        );
        Ok(sequence)
    }

    /// Freezes the live cache into a snapshot. Returns its generation, or
    /// `None` if the cache was empty.
    pub fn snapshot(&self) -> Result<Option<u64>> {
        self.inner.ensure_open()?;
        Ok(self.inner.snapshot())
    }

    /// Snapshots the cache and writes every pending snapshot to disk before
    /// returning.
    pub fn flush(&self) -> Result<()> {
        self.inner.ensure_open()?;
        self.inner.flush()
    }

    /// Runs compaction cycles until the planner finds nothing to do.
    /// Returns the number of cycles published.
    pub fn compact(&self) -> Result<usize> {
        self.inner.ensure_open()?;
        let mut cycles = 0;
        while self.inner.compact_once()?.is_some() {
            cycles += 1;
        }
        Ok(cycles)
    }

    /// Current compactor state.
    pub fn compactor_state(&self) -> CompactorState {
        self.inner.compactor.state()
    }

    /// Returns true if some stored data is unavailable.
    pub fn is_degraded(&self) -> bool {
        self.inner.store.is_degraded()
    }

    /// Current statistics.
    pub fn stats(&self) -> ShardStats {
        let files = self.inner.store.files();
        let mut files_per_level = BTreeMap::new();
        for file in files.iter() {
            *files_per_level.entry(file.level()).or_insert(0) += 1;
        }
        let (wal_segments, last_sequence) = {
            let wal = self.inner.lock_wal();
            (wal.segment_count(), wal.last_sequence())
        };
        ShardStats {
            series: self.inner.index.series_count(),
            files: files.len(),
            file_bytes: files.iter().map(|f| f.size()).sum(),
            files_per_level,
            cache: self.inner.cache.stats(),
            compaction: self.inner.compactor.stats(),
            wal_segments,
            last_sequence,
            retired_sequence: self.inner.tracker.retired_sequence(),
            pending_snapshots: self.inner.tracker.pending_count(),
            degraded: self.inner.store.is_degraded(),
        }
    }

    /// Stops the background worker and syncs the WAL. Further operations
    /// fail with [`BurrowError::Closed`]. Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .take();
        if let Some(worker) = worker {
            worker.stop();
        }
        let mut wal = self.inner.lock_wal();
        if !wal.is_poisoned() {
            wal.sync()?;
        }
        info!(dir = %self.inner.dir.display(), "Closed shard");
        Ok(())
    }

    /// Closes the shard and deletes its directory.
    pub fn drop_shard(self) -> Result<()> {
        self.close()?;
        let dir = self.inner.dir.clone();
        drop(self);
        fs::remove_dir_all(&dir)?;
        info!(dir = %dir.display(), "Dropped shard");
        Ok(())
    }
}

impl Drop for Shard {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(dir = %self.inner.dir.display(), error = %err, "Failed to close shard cleanly");
        }
    }
}

impl ShardInner {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BurrowError::Closed);
        }
        Ok(())
    }

    fn lock_wal(&self) -> std::sync::MutexGuard<'_, Wal> {
        self.wal.lock().unwrap_or_else(|err| err.into_inner())
    }

    fn notify(&self, trigger: Trigger) {
        if let Some(handle) = &self.trigger {
            handle.notify(trigger);
        }
    }

    /// Makes room for `incoming` bytes, flushing in the caller's thread if
    /// the cache is at its hard bound.
    fn reserve(&self, incoming: usize) -> Result<()> {
        if !self.cache.would_exceed(incoming) {
            return Ok(());
        }
        debug!(incoming, size = self.cache.total_size(), "Cache full, flushing synchronously");
        self.flush()?;
        if self.cache.would_exceed(incoming) {
            return Err(BurrowError::CacheFull {
                size: self.cache.total_size() + incoming,
                limit: self.cache.config().max_size,
            });
        }
        Ok(())
    }

    /// Rejects writes whose type differs from the stream's stored type.
    /// Called under the WAL lock so no other write can change the answer.
    fn check_types(&self, parsed: &[(SeriesKey, String, &WritePoint)]) -> Result<()> {
        let mut batch: HashMap<(&str, &str), ValueType> = HashMap::new();
        for (_, canonical, p) in parsed {
            let got = p.point.value.value_type();
            let slot = (canonical.as_str(), p.field.as_str());
            let stored = batch.get(&slot).copied().or_else(|| {
                self.index
                    .get(canonical)
                    .and_then(|id| self.cache.field_type(id, &p.field))
                    .or_else(|| self.store.field_type(&stream_key(canonical, &p.field)))
            });
            if let Some(stored) = stored {
                if stored != got {
                    return Err(BurrowError::FieldTypeConflict {
                        key: stream_key(canonical, &p.field),
                        stored,
                        got,
                    });
                }
            }
            batch.insert(slot, got);
        }
        Ok(())
    }

    /// Applies a delete to the cache, the files passing `filter`, and (for
    /// whole-series deletes) the index.
    fn apply_delete<F>(
        &self,
        keys: &[String],
        range: TimeRange,
        whole_series: bool,
        filter: F,
    ) -> Result<()>
    where
        F: Fn(&TsmFile) -> bool,
    {
        for key in keys {
            if let Some(id) = self.index.get(key) {
                self.cache.delete_range(id, key, None, range);
            }
            let tombstone = if whole_series {
                Tombstone::series(key.as_str())
            } else {
                Tombstone::range(key.as_str(), range)
            };
            self.store.add_tombstone(&tombstone, &filter)?;
            if whole_series {
                self.index.delete_series(key);
            }
        }
        Ok(())
    }

    fn replay(&self, entry: WalEntry) -> Result<()> {
        match entry {
            WalEntry::WritePoints { sequence, points } => {
                let mut writes = Vec::with_capacity(points.len());
                for p in points {
                    let (series_id, series_key) = match self.index.resolve_str(&p.series_key) {
                        Ok(resolved) => resolved,
                        Err(err) => {
                            warn!(sequence, error = %err, "Skipping replayed point");
                            continue;
                        }
                    };
                    writes.push(CacheWrite {
                        series_id,
                        series_key,
                        field: p.field,
                        point: Point::new(p.timestamp, p.value),
                    });
                }
                if let Err(err) = self.cache.write_batch(&writes, sequence) {
                    warn!(sequence, error = %err, "Skipping replayed write batch");
                }
            }
            WalEntry::DeleteSeries { sequence, series_keys } => {
                self.apply_delete(&series_keys, TimeRange::all(), true, |f| {
                    f.max_sequence() < sequence
                })?;
            }
            WalEntry::DeleteRange {
                sequence,
                series_keys,
                range,
            } => {
                self.apply_delete(&series_keys, range, false, |f| f.max_sequence() < sequence)?;
            }
        }
        Ok(())
    }

    fn capture(
        &self,
        streams: Vec<(SeriesId, Arc<str>, Vec<String>)>,
        range: TimeRange,
    ) -> QueryResult {
        let mut pending = Vec::new();
        for (id, series_key, fields) in streams {
            for field in fields {
                let cached = self.cache.read(id, &field, range);
                pending.push(PendingStream {
                    series_key: Arc::clone(&series_key),
                    field: Arc::from(field),
                    cached,
                });
            }
        }
        // Files after cache: a snapshot leaving the cache is already published.
        let files = self.store.files();
        QueryResult::new(files, range, pending, self.store.quarantined_at_open())
    }

    fn snapshot(&self) -> Option<u64> {
        let _wal = self.lock_wal();
        let generation = self.store.next_generation();
        // Registered before the compactor can see the snapshot, so its flush
        // can never be reported first.
        if let Some(min_sequence) = self.cache.live_min_sequence() {
            self.tracker.notify_snapshot(generation, min_sequence);
        }
        let Some(snapshot) = self.cache.snapshot(generation) else {
            self.tracker.notify_flush(generation);
            return None;
        };
        debug!(
            generation,
            bytes = snapshot.size(),
            min_sequence = snapshot.min_sequence(),
            max_sequence = snapshot.max_sequence(),
            "Froze cache snapshot"
        );
        Some(generation)
    }

    fn flush(&self) -> Result<()> {
        self.snapshot();
        // Snapshots always outrank merges, so each cycle flushes one.
        while !self.cache.snapshots().is_empty() {
            if self.compact_once()?.is_none() {
                break;
            }
        }
        Ok(())
    }

    fn compact_once(&self) -> Result<Option<CompactionOutcome>> {
        let outcome = self.compactor.run_once()?;
        if let Some(outcome) = &outcome {
            self.after_publish(outcome)?;
        }
        Ok(outcome)
    }

    fn after_publish(&self, outcome: &CompactionOutcome) -> Result<()> {
        if let Some(generation) = outcome.flushed_generation {
            self.tracker.notify_flush(generation);
            self.retire_wal()?;
        }
        self.purge_deleted();
        Ok(())
    }

    fn retire_wal(&self) -> Result<()> {
        let mut wal = self.lock_wal();
        let safe = self
            .tracker
            .calculate_safe_sequence(self.cache.live_min_sequence(), wal.last_sequence());
        if !self.tracker.notify_retired(safe) {
            return Ok(());
        }
        let removed = wal.retire(safe)?;
        if removed > 0 {
            debug!(up_to = safe, segments = removed, "Retired WAL segments");
        }
        Ok(())
    }

    /// Forgets deleted series that no file or cache generation still holds.
    fn purge_deleted(&self) {
        let deleted = self.index.deleted_series();
        if deleted.is_empty() {
            return;
        }
        let cached = self.cache.series_ids();
        let mut purged = 0usize;
        for (id, key) in deleted {
            if cached.contains(&id) || self.store.contains_series(&key) {
                continue;
            }
            if self.index.purge(id) {
                purged += 1;
            }
        }
        if purged > 0 {
            info!(purged, "Purged deleted series from index");
        }
    }

    fn background_cycle(&self, trigger: Trigger) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if trigger == Trigger::Snapshot && self.cache.should_snapshot() {
            self.snapshot();
        }
        for _ in 0..MAX_CYCLES_PER_WAKEUP {
            match self.compact_once() {
                Ok(Some(_)) => continue,
                Ok(None) => break,
                // Already logged by the compactor; retried on the next wake-up.
                Err(_) => break,
            }
        }
    }
}

fn validate_field(field: &str) -> Result<()> {
    if field.is_empty() {
        return Err(BurrowError::Validation("field name must not be empty".into()));
    }
    if field.contains(FIELD_SEPARATOR) {
        return Err(BurrowError::Validation(format!(
            "field name {field:?} contains reserved {FIELD_SEPARATOR:?}"
        )));
    }
    Ok(())
}

fn canonical_keys(series_keys: &[&str]) -> Result<Vec<String>> {
    if series_keys.is_empty() {
        return Err(BurrowError::Validation("no series keys given".into()));
    }
    series_keys
        .iter()
        .map(|key| SeriesKey::parse(key).map(|k| k.to_string()))
        .collect()
}

/// Registers every series stored in files. A series whose every file carries
/// a whole-series tombstone is registered as deleted.
fn rebuild_index(index: &SeriesIndex, store: &FileStore) {
    let files = store.files();
    for key in store.series_keys() {
        let parsed = match SeriesKey::parse(&key) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(series_key = %key, error = %err, "Ignoring stored series");
                continue;
            }
        };
        index.resolve(&parsed);

        let prefix = format!("{key}{FIELD_SEPARATOR}");
        let fully_deleted = files
            .iter()
            .filter(|f| f.reader().entries_with_prefix(&prefix).next().is_some())
            .all(|f| {
                f.tombstones()
                    .iter()
                    .any(|t| t.key == key && t.time_range() == TimeRange::all())
            });
        if fully_deleted {
            index.delete_series(&key);
        }
    }
}
