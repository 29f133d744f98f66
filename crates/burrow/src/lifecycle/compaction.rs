//! Compaction planning and execution for TSM files.
//!
//! One cycle picks a single unit of work, in priority order:
//!
//! 1. flush the oldest frozen cache snapshot into a level-0 file;
//! 2. rewrite a file whose tombstones cover too much of it;
//! 3. merge the oldest contiguous run of an over-full level into the next one.
//!
//! New files are written beside the live set and published with one atomic
//! swap, so a failed cycle leaves the previous file set untouched.

use crate::error::{BurrowError, Result};
use crate::tsm::cache::CacheSnapshot;
use crate::tsm::store::{FileId, FileStore, PendingFile, TsmFile};
use crate::tsm::tombstone::Tombstone;
use crate::tsm::{TimeRange, Timestamp, Value, ValueType, WriteCache};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default fraction of tombstoned points that triggers a rewrite.
pub const DEFAULT_TOMBSTONE_RATIO: f64 = 0.25;

/// Default number of points per encoded block.
pub const DEFAULT_MAX_POINTS_PER_BLOCK: usize = 1000;

/// Default background wake-up interval.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

/// Compaction level configuration.
///
/// # Examples
/// ```rust,ignore
/// use alopex_burrow::lifecycle::compaction::LevelConfig;
///
/// let level = LevelConfig {
///     max_files: 4,
///     target_file_size: 4 * 1024 * 1024,
/// };
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelConfig {
    /// Max number of files before compaction triggers.
    pub max_files: usize,
    /// Target output file size in bytes.
    pub target_file_size: u64,
}

/// Compaction configuration for all levels.
///
/// Level `n` is `levels[n]`; files at a level past the end count as the
/// last level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    /// Level configurations, level 0 first.
    pub levels: Vec<LevelConfig>,
    /// Tombstone-covered fraction above which a file is rewritten alone.
    pub tombstone_ratio: f64,
    /// Points per encoded block in written files.
    pub max_points_per_block: usize,
    /// How often the background worker looks for work.
    pub interval: Duration,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            levels: vec![
                LevelConfig {
                    max_files: 4,
                    target_file_size: 4 * 1024 * 1024,
                },
                LevelConfig {
                    max_files: 10,
                    target_file_size: 40 * 1024 * 1024,
                },
                LevelConfig {
                    max_files: 100,
                    target_file_size: 400 * 1024 * 1024,
                },
            ],
            tombstone_ratio: DEFAULT_TOMBSTONE_RATIO,
            max_points_per_block: DEFAULT_MAX_POINTS_PER_BLOCK,
            interval: DEFAULT_INTERVAL,
        }
    }
}

impl CompactionConfig {
    /// Replaces the level table.
    pub fn with_levels(mut self, levels: Vec<LevelConfig>) -> Self {
        self.levels = levels;
        self
    }

    /// Sets the rewrite threshold.
    pub fn with_tombstone_ratio(mut self, ratio: f64) -> Self {
        self.tombstone_ratio = ratio;
        self
    }

    /// Sets the block size in points.
    pub fn with_max_points_per_block(mut self, points: usize) -> Self {
        self.max_points_per_block = points;
        self
    }

    /// Sets the background interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Checks the configuration before use.
    ///
    /// # Errors
    ///
    /// Returns a validation error for an empty level table, a zero block
    /// size, or a ratio outside `(0, 1]`.
    pub fn validate(&self) -> Result<()> {
        if self.levels.is_empty() {
            return Err(BurrowError::Validation(
                "compaction needs at least one level".into(),
            ));
        }
        if self.max_points_per_block == 0 {
            return Err(BurrowError::Validation(
                "max_points_per_block must be positive".into(),
            ));
        }
        if !(self.tombstone_ratio > 0.0 && self.tombstone_ratio <= 1.0) {
            return Err(BurrowError::Validation(format!(
                "tombstone_ratio {} is outside (0, 1]",
                self.tombstone_ratio
            )));
        }
        Ok(())
    }

    /// Highest configured level.
    pub fn last_level(&self) -> u16 {
        self.levels.len().saturating_sub(1) as u16
    }

    /// Returns the level configuration, clamped to the last level.
    pub fn level_config(&self, level: u16) -> &LevelConfig {
        let index = usize::from(level.min(self.last_level()));
        &self.levels[index]
    }
}

/// A unit of compaction work.
#[derive(Debug, Clone)]
pub enum CompactionPlan {
    /// Write a frozen cache snapshot into a new level-0 file.
    Flush {
        /// The snapshot to flush.
        snapshot: Arc<CacheSnapshot>,
    },
    /// Rewrite one file to drop its tombstoned points.
    Rewrite {
        /// The tombstone-heavy file.
        file: Arc<TsmFile>,
    },
    /// Merge a contiguous run of files into the next level.
    Merge {
        /// Level of the inputs.
        source_level: u16,
        /// Level of the outputs.
        target_level: u16,
        /// Inputs in file-id order.
        inputs: Vec<Arc<TsmFile>>,
    },
}

impl fmt::Display for CompactionPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Flush { snapshot } => write!(f, "flush snapshot {}", snapshot.generation()),
            Self::Rewrite { file } => write!(f, "rewrite {}", file.id()),
            Self::Merge {
                source_level,
                target_level,
                inputs,
            } => write!(
                f,
                "merge {} files L{source_level} -> L{target_level}",
                inputs.len()
            ),
        }
    }
}

/// Chooses the next unit of work from the current cache and file set.
#[derive(Debug, Clone)]
pub struct CompactionPlanner {
    config: CompactionConfig,
}

impl CompactionPlanner {
    /// Creates a planner.
    pub fn new(config: CompactionConfig) -> Self {
        Self { config }
    }

    /// Returns the compaction config.
    pub fn config(&self) -> &CompactionConfig {
        &self.config
    }

    /// Returns the most urgent plan, or `None` if there is nothing to do.
    ///
    /// `snapshots` are oldest first and `files` in file-id order.
    pub fn plan(
        &self,
        snapshots: &[Arc<CacheSnapshot>],
        files: &[Arc<TsmFile>],
    ) -> Option<CompactionPlan> {
        if let Some(snapshot) = snapshots.first() {
            return Some(CompactionPlan::Flush {
                snapshot: Arc::clone(snapshot),
            });
        }

        // Deleted series go at the next cycle; range deletes wait for the ratio.
        if let Some(file) = files.iter().find(|f| {
            !f.is_quarantined()
                && f.tombstone_count() > 0
                && (f.has_series_delete() || f.tombstone_ratio() > self.config.tombstone_ratio)
        }) {
            return Some(CompactionPlan::Rewrite {
                file: Arc::clone(file),
            });
        }

        (0..=self.config.last_level()).find_map(|level| self.plan_level(level, files))
    }

    fn level_of(&self, file: &TsmFile) -> u16 {
        file.level().min(self.config.last_level())
    }

    fn plan_level(&self, level: u16, files: &[Arc<TsmFile>]) -> Option<CompactionPlan> {
        let level_config = self.config.level_config(level);
        let eligible = |f: &Arc<TsmFile>| !f.is_quarantined() && self.level_of(f) == level;

        if files.iter().filter(|f| eligible(f)).count() <= level_config.max_files {
            return None;
        }

        let last_level = self.config.last_level();
        let mut start = 0;
        while start < files.len() {
            if !eligible(&files[start]) {
                start += 1;
                continue;
            }
            let mut end = start;
            while end < files.len() && eligible(&files[end]) {
                end += 1;
            }
            let segment = &files[start..end];
            start = end;
            if segment.len() < 2 {
                continue;
            }

            let mut take = segment.len().min(level_config.max_files.max(2));
            // Never split a generation: its files are siblings of one output.
            let generation = segment[take - 1].id().generation;
            while take < segment.len() && segment[take].id().generation == generation {
                take += 1;
            }
            let inputs = segment[..take].to_vec();

            if level == last_level && !reduces_file_count(&inputs, level_config.target_file_size) {
                continue;
            }
            return Some(CompactionPlan::Merge {
                source_level: level,
                target_level: (level + 1).min(last_level),
                inputs,
            });
        }
        None
    }
}

fn reduces_file_count(inputs: &[Arc<TsmFile>], target_file_size: u64) -> bool {
    let total: u64 = inputs.iter().map(|f| f.size()).sum();
    let expected = total.div_ceil(target_file_size.max(1)).max(1);
    inputs.len() as u64 > expected
}

/// Observable compactor state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CompactorState {
    /// Waiting for work.
    Idle = 0,
    /// Choosing a plan.
    Planning = 1,
    /// Writing output files.
    Running = 2,
    /// The last cycle failed; the file set is unchanged.
    Failed = 3,
}

impl CompactorState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Planning,
            2 => Self::Running,
            3 => Self::Failed,
            _ => Self::Idle,
        }
    }

    /// Lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Planning => "planning",
            Self::Running => "running",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for CompactorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cumulative compactor counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CompactionStats {
    /// Cycles that published a result.
    pub cycles: u64,
    /// Cycles that failed.
    pub failures: u64,
    /// Snapshots written to files.
    pub snapshots_flushed: u64,
    /// Files created.
    pub files_written: u64,
    /// Files replaced.
    pub files_removed: u64,
    /// Bytes written to new files.
    pub bytes_written: u64,
    /// Points written to new files.
    pub points_written: u64,
}

#[derive(Debug, Default)]
struct Counters {
    cycles: AtomicU64,
    failures: AtomicU64,
    snapshots_flushed: AtomicU64,
    files_written: AtomicU64,
    files_removed: AtomicU64,
    bytes_written: AtomicU64,
    points_written: AtomicU64,
}

/// What a published cycle changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionOutcome {
    /// Snapshot generation flushed, for flush cycles.
    pub flushed_generation: Option<u64>,
    /// Files added to the set.
    pub written: Vec<FileId>,
    /// Files removed from the set.
    pub removed: Vec<FileId>,
    /// Points in the new files.
    pub points_written: u64,
}

/// Files written by a cycle that are not yet published.
#[derive(Default)]
struct OutputSet {
    pending: Option<PendingFile>,
    finished: Vec<Arc<TsmFile>>,
}

impl OutputSet {
    fn seal(&mut self) -> Result<()> {
        if let Some(pending) = self.pending.take() {
            if pending.key_count() == 0 {
                pending.abort();
            } else {
                self.finished.push(pending.finish()?);
            }
        }
        Ok(())
    }

    /// Removes everything written; nothing has been published.
    fn discard(mut self) {
        if let Some(pending) = self.pending.take() {
            pending.abort();
        }
        for file in self.finished.drain(..) {
            file.mark_obsolete();
        }
    }
}

/// Runs compaction cycles for one shard.
#[derive(Debug)]
pub struct Compactor {
    planner: CompactionPlanner,
    store: Arc<FileStore>,
    cache: Arc<WriteCache>,
    state: AtomicU8,
    counters: Counters,
    /// One cycle at a time per shard.
    run_lock: Mutex<()>,
}

impl Compactor {
    /// Creates a compactor over a shard's cache and file store.
    pub fn new(config: CompactionConfig, store: Arc<FileStore>, cache: Arc<WriteCache>) -> Self {
        Self {
            planner: CompactionPlanner::new(config),
            store,
            cache,
            state: AtomicU8::new(CompactorState::Idle as u8),
            counters: Counters::default(),
            run_lock: Mutex::new(()),
        }
    }

    /// Returns the compaction config.
    pub fn config(&self) -> &CompactionConfig {
        self.planner.config()
    }

    /// Current state.
    pub fn state(&self) -> CompactorState {
        CompactorState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: CompactorState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Cumulative counters.
    pub fn stats(&self) -> CompactionStats {
        CompactionStats {
            cycles: self.counters.cycles.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            snapshots_flushed: self.counters.snapshots_flushed.load(Ordering::Relaxed),
            files_written: self.counters.files_written.load(Ordering::Relaxed),
            files_removed: self.counters.files_removed.load(Ordering::Relaxed),
            bytes_written: self.counters.bytes_written.load(Ordering::Relaxed),
            points_written: self.counters.points_written.load(Ordering::Relaxed),
        }
    }

    /// Plans and runs one cycle. Returns `None` when there was nothing to do.
    ///
    /// # Errors
    ///
    /// Returns the cycle's failure; the file set is left as it was.
    pub fn run_once(&self) -> Result<Option<CompactionOutcome>> {
        let _running = self.run_lock.lock().unwrap_or_else(|err| err.into_inner());
        self.set_state(CompactorState::Planning);
        let plan = self
            .planner
            .plan(&self.cache.snapshots(), &self.store.files());
        let Some(plan) = plan else {
            self.set_state(CompactorState::Idle);
            return Ok(None);
        };
        self.execute_locked(plan).map(Some)
    }

    fn execute_locked(&self, plan: CompactionPlan) -> Result<CompactionOutcome> {
        self.set_state(CompactorState::Running);
        debug!(plan = %plan, "Running compaction");
        let result = match &plan {
            CompactionPlan::Flush { snapshot } => self.flush(snapshot),
            CompactionPlan::Rewrite { file } => {
                self.merge(std::slice::from_ref(file), file.level())
            }
            CompactionPlan::Merge {
                inputs,
                target_level,
                ..
            } => self.merge(inputs, *target_level),
        };

        match result {
            Ok(outcome) => {
                self.counters.cycles.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .files_written
                    .fetch_add(outcome.written.len() as u64, Ordering::Relaxed);
                self.counters
                    .files_removed
                    .fetch_add(outcome.removed.len() as u64, Ordering::Relaxed);
                self.counters
                    .points_written
                    .fetch_add(outcome.points_written, Ordering::Relaxed);
                if outcome.flushed_generation.is_some() {
                    self.counters
                        .snapshots_flushed
                        .fetch_add(1, Ordering::Relaxed);
                }
                info!(
                    plan = %plan,
                    written = outcome.written.len(),
                    removed = outcome.removed.len(),
                    points = outcome.points_written,
                    "Compaction published"
                );
                self.set_state(CompactorState::Idle);
                Ok(outcome)
            }
            Err(err) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                self.set_state(CompactorState::Failed);
                warn!(plan = %plan, error = %err, "Compaction cycle failed");
                Err(match err {
                    BurrowError::Compaction(_) => err,
                    other => BurrowError::Compaction(format!("{plan}: {other}")),
                })
            }
        }
    }

    fn flush(&self, snapshot: &Arc<CacheSnapshot>) -> Result<CompactionOutcome> {
        let generation = snapshot.generation();
        let seen = snapshot.tombstones().len();
        let streams = snapshot.streams();

        let mut outputs = OutputSet::default();
        let mut points_written = 0u64;
        let written = (|| -> Result<()> {
            if streams.is_empty() {
                return Ok(());
            }
            let id = FileId::new(generation, 0);
            outputs.pending = Some(self.store.create_file(id, 0, snapshot.max_sequence())?);
            if let Some(pending) = outputs.pending.as_mut() {
                for stream in &streams {
                    pending.write_stream(
                        &stream.key,
                        stream.value_type,
                        &stream.points,
                        self.config().max_points_per_block,
                    )?;
                    points_written += stream.points.len() as u64;
                }
            }
            outputs.seal()
        })();
        if let Err(err) = written {
            outputs.discard();
            return Err(err);
        }

        let files = std::mem::take(&mut outputs.finished);
        let published = self.store.publish(&files, &[], || {
            snapshot.tombstones().into_iter().skip(seen).collect()
        });
        if let Err(err) = published {
            outputs.finished = files;
            outputs.discard();
            return Err(err);
        }
        self.cache.remove_snapshot(generation);
        self.record_bytes(&files);

        Ok(CompactionOutcome {
            flushed_generation: Some(generation),
            written: files.iter().map(|f| f.id()).collect(),
            removed: Vec::new(),
            points_written,
        })
    }

    fn merge(&self, inputs: &[Arc<TsmFile>], target_level: u16) -> Result<CompactionOutcome> {
        // Tombstones that arrive during the run must follow the data.
        let seen: Vec<usize> = inputs.iter().map(|f| f.tombstone_count()).collect();

        let mut outputs = OutputSet::default();
        let points_written = match self.write_merged(inputs, target_level, &mut outputs) {
            Ok(points) => points,
            Err(err) => {
                outputs.discard();
                return Err(err);
            }
        };

        let files = std::mem::take(&mut outputs.finished);
        let removed: Vec<FileId> = inputs.iter().map(|f| f.id()).collect();
        let published = self.store.publish(&files, &removed, || {
            inputs
                .iter()
                .zip(&seen)
                .flat_map(|(file, seen)| file.tombstones().into_iter().skip(*seen))
                .collect::<Vec<Tombstone>>()
        });
        if let Err(err) = published {
            outputs.finished = files;
            outputs.discard();
            return Err(err);
        }
        self.record_bytes(&files);

        Ok(CompactionOutcome {
            flushed_generation: None,
            written: files.iter().map(|f| f.id()).collect(),
            removed,
            points_written,
        })
    }

    fn record_bytes(&self, files: &[Arc<TsmFile>]) {
        let bytes: u64 = files.iter().map(|f| f.size()).sum();
        self.counters
            .bytes_written
            .fetch_add(bytes, Ordering::Relaxed);
    }

    fn write_merged(
        &self,
        inputs: &[Arc<TsmFile>],
        target_level: u16,
        outputs: &mut OutputSet,
    ) -> Result<u64> {
        let generation = inputs
            .iter()
            .map(|f| f.id().generation)
            .max()
            .ok_or_else(|| BurrowError::Compaction("merge without inputs".into()))?;
        let mut sequence = self
            .store
            .files()
            .iter()
            .filter(|f| f.id().generation == generation)
            .map(|f| f.id().sequence)
            .max()
            .unwrap_or(0);
        let max_sequence = inputs.iter().map(|f| f.max_sequence()).max().unwrap_or(0);
        let target_size = self.config().level_config(target_level).target_file_size;

        let keys: BTreeSet<&str> = inputs.iter().flat_map(|f| f.reader().keys()).collect();
        let mut points_written = 0u64;

        for key in keys {
            let Some((value_type, points)) = merge_stream(inputs, key)? else {
                continue;
            };
            if outputs.pending.is_none() {
                sequence = sequence.checked_add(1).ok_or_else(|| {
                    BurrowError::Compaction(format!(
                        "generation {generation} has no file sequence left"
                    ))
                })?;
                let id = FileId::new(generation, sequence);
                outputs.pending = Some(self.store.create_file(id, target_level, max_sequence)?);
            }
            let mut full = false;
            if let Some(pending) = outputs.pending.as_mut() {
                pending.write_stream(key, value_type, &points, self.config().max_points_per_block)?;
                points_written += points.len() as u64;
                full = pending.size() >= target_size;
            }
            if full {
                outputs.seal()?;
            }
        }
        outputs.seal()?;
        Ok(points_written)
    }
}

/// Merges one stream across `inputs` (file-id order), later files winning on
/// equal timestamps. Returns `None` if nothing survives the tombstones.
fn merge_stream(
    inputs: &[Arc<TsmFile>],
    key: &str,
) -> Result<Option<(ValueType, Vec<(Timestamp, Value)>)>> {
    let mut merged: BTreeMap<Timestamp, Value> = BTreeMap::new();
    let mut value_type: Option<ValueType> = None;

    for file in inputs {
        let Some(entry) = file.reader().entry(key) else {
            continue;
        };
        if let Some(previous) = value_type {
            if previous != entry.value_type {
                warn!(
                    key,
                    older = %previous,
                    newer = %entry.value_type,
                    "Dropping older points of a retyped stream"
                );
                merged.clear();
            }
        }
        value_type = Some(entry.value_type);

        let points = file.read_range(key, TimeRange::all()).map_err(|err| {
            if err.is_corruption() {
                file.quarantine(&err);
            }
            err
        })?;
        merged.extend(points);
    }

    match value_type {
        Some(value_type) if !merged.is_empty() => {
            Ok(Some((value_type, merged.into_iter().collect())))
        }
        _ => Ok(None),
    }
}
