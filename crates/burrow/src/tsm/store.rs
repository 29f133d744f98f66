//! File store: the shard's set of sealed TSM files.
//!
//! The visible file list is copy-on-write. Readers clone an
//! `Arc<Vec<Arc<TsmFile>>>` at query start and keep every file in it alive
//! for as long as they hold it; [`FileStore::publish`] swaps in a new list
//! under a short write lock. A replaced file is only marked obsolete and is
//! unlinked when its last handle drops.
//!
//! Files are named `{generation:016x}-{sequence:04x}.tsm` and ordered by
//! [`FileId`]. On equal timestamps the higher id wins.

use crate::error::{BurrowError, Result};
use crate::tsm::file::{KeyEntry, TsmReader, TsmWriter};
use crate::tsm::tombstone::{self, Tombstone};
use crate::tsm::{split_stream_key, TimeRange, Timestamp, Value, ValueType, FIELD_SEPARATOR};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, error, info, warn};

/// Extension of sealed files.
pub const TSM_EXTENSION: &str = "tsm";
/// Extension of files being written.
pub const TMP_EXTENSION: &str = "tmp";
/// Extension given to files that failed validation.
pub const QUARANTINE_EXTENSION: &str = "quarantine";

/// Total order over files: generation first, then sequence within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId {
    /// Generation; snapshot files get a fresh one, compaction outputs inherit
    /// the highest generation among their inputs.
    pub generation: u64,
    /// Sequence within the generation.
    pub sequence: u16,
}

impl FileId {
    /// Creates an id.
    pub fn new(generation: u64, sequence: u16) -> Self {
        Self {
            generation,
            sequence,
        }
    }

    /// File name for this id.
    pub fn file_name(&self) -> String {
        format!(
            "{:016x}-{:04x}.{TSM_EXTENSION}",
            self.generation, self.sequence
        )
    }

    /// Parses a file name produced by [`FileId::file_name`].
    pub fn parse_file_name(name: &str) -> Option<Self> {
        let stem = name.strip_suffix(&format!(".{TSM_EXTENSION}"))?;
        let (generation, sequence) = stem.split_once('-')?;
        if generation.len() != 16 || sequence.len() != 4 {
            return None;
        }
        Some(Self {
            generation: u64::from_str_radix(generation, 16).ok()?,
            sequence: u16::from_str_radix(sequence, 16).ok()?,
        })
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.generation, self.sequence)
    }
}

/// A sealed file plus its runtime state.
pub struct TsmFile {
    id: FileId,
    reader: TsmReader,
    size: u64,
    tombstones: RwLock<Vec<Tombstone>>,
    quarantined: AtomicBool,
    obsolete: AtomicBool,
}

impl fmt::Debug for TsmFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TsmFile")
            .field("id", &self.id)
            .field("level", &self.level())
            .field("size", &self.size)
            .field("quarantined", &self.is_quarantined())
            .finish()
    }
}

impl TsmFile {
    /// Opens a sealed file and its tombstone sidecar.
    pub fn open(id: FileId, path: &Path) -> Result<Self> {
        let reader = TsmReader::open(path)?;
        let size = fs::metadata(path)?.len();
        let tombstones = tombstone::read_sidecar(&tombstone::sidecar_path(path))?;
        Ok(Self {
            id,
            reader,
            size,
            tombstones: RwLock::new(tombstones),
            quarantined: AtomicBool::new(false),
            obsolete: AtomicBool::new(false),
        })
    }

    /// The file's id.
    pub fn id(&self) -> FileId {
        self.id
    }

    /// Compaction level.
    pub fn level(&self) -> u16 {
        self.reader.header().level
    }

    /// Size on disk in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Highest WAL sequence whose data may be in the file.
    pub fn max_sequence(&self) -> u64 {
        self.reader.header().max_sequence
    }

    /// Path on disk.
    pub fn path(&self) -> &Path {
        self.reader.path()
    }

    /// Underlying reader.
    pub fn reader(&self) -> &TsmReader {
        &self.reader
    }

    /// Total points in the file.
    pub fn point_count(&self) -> u64 {
        self.reader.footer().total_point_count
    }

    /// Copy of the current tombstones.
    pub fn tombstones(&self) -> Vec<Tombstone> {
        self.tombstones
            .read()
            .unwrap_or_else(|err| err.into_inner())
            .clone()
    }

    /// Number of tombstones recorded so far.
    pub fn tombstone_count(&self) -> usize {
        self.tombstones
            .read()
            .unwrap_or_else(|err| err.into_inner())
            .len()
    }

    /// Persists and records new tombstones. Duplicates are skipped.
    pub fn add_tombstones(&self, new: &[Tombstone]) -> Result<()> {
        let mut guard = self.tombstones.write().unwrap_or_else(|err| err.into_inner());
        let fresh: Vec<Tombstone> = new
            .iter()
            .filter(|t| !guard.contains(t))
            .cloned()
            .collect();
        if fresh.is_empty() {
            return Ok(());
        }
        tombstone::append_sidecar(&tombstone::sidecar_path(self.path()), &fresh)?;
        guard.extend(fresh);
        Ok(())
    }

    /// Returns true if any stream of the file is addressed by the tombstone.
    pub fn affected_by(&self, tombstone: &Tombstone) -> bool {
        let range = tombstone.time_range();
        let touches = |(key, entry): (&str, &KeyEntry)| {
            tombstone.applies_to(key) && range.overlaps(entry.min_ts(), entry.max_ts())
        };
        if tombstone.key.contains(FIELD_SEPARATOR) {
            return self.reader.entry(&tombstone.key).is_some_and(|entry| {
                range.overlaps(entry.min_ts(), entry.max_ts())
            });
        }
        let prefix = format!("{}{FIELD_SEPARATOR}", tombstone.key);
        let hit = self.reader.entries_with_prefix(&prefix).any(touches);
        hit
    }

    /// Returns true if a whole-series delete still covers data in the file.
    pub fn has_series_delete(&self) -> bool {
        let tombstones = self.tombstones.read().unwrap_or_else(|err| err.into_inner());
        let pending = tombstones.iter().any(|t| {
            !t.key.contains(FIELD_SEPARATOR)
                && t.time_range() == TimeRange::all()
                && self.affected_by(t)
        });
        pending
    }

    /// Fraction of points (by block) covered by tombstones.
    pub fn tombstone_ratio(&self) -> f64 {
        let total = self.point_count();
        let tombstones = self.tombstones.read().unwrap_or_else(|err| err.into_inner());
        if total == 0 || tombstones.is_empty() {
            return 0.0;
        }
        let covered: u64 = self
            .reader
            .entries()
            .map(|(key, entry)| tombstone::covered_points(&tombstones, key, entry))
            .sum();
        (covered as f64 / total as f64).min(1.0)
    }

    /// Reads a stream's points in `range` with tombstones applied.
    pub fn read_range(&self, key: &str, range: TimeRange) -> Result<Vec<(Timestamp, Value)>> {
        let mut points = self.reader.read_range(key, range)?;
        let tombstones = self.tombstones.read().unwrap_or_else(|err| err.into_inner());
        tombstone::filter_points(&tombstones, key, &mut points);
        Ok(points)
    }

    /// Returns true once the file has been taken out of service.
    pub fn is_quarantined(&self) -> bool {
        self.quarantined.load(Ordering::Acquire)
    }

    /// Takes the file out of service after a runtime corruption.
    pub fn quarantine(&self, reason: &BurrowError) {
        if !self.quarantined.swap(true, Ordering::AcqRel) {
            error!(file = %self.path().display(), error = %reason, "Quarantining corrupt TSM file");
        }
    }

    pub(crate) fn mark_obsolete(&self) {
        self.obsolete.store(true, Ordering::Release);
    }
}

impl Drop for TsmFile {
    fn drop(&mut self) {
        if !self.obsolete.load(Ordering::Acquire) {
            return;
        }
        let path = self.path().to_path_buf();
        match fs::remove_file(&path) {
            Ok(()) => debug!(file = %path.display(), "Removed obsolete TSM file"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(file = %path.display(), error = %err, "Failed to remove obsolete TSM file"),
        }
        let sidecar = tombstone::sidecar_path(&path);
        if let Err(err) = fs::remove_file(&sidecar) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(file = %sidecar.display(), error = %err, "Failed to remove tombstone sidecar");
            }
        }
    }
}

/// Result of reading one stream across files.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamRead {
    /// Merged points in timestamp order.
    pub points: Vec<(Timestamp, Value)>,
    /// True if a quarantined file claimed the stream.
    pub degraded: bool,
}

/// Reads one stream across a captured file list, newest file winning.
///
/// Files that fail with a corruption-class error are quarantined and the
/// result is marked degraded instead of failing the read.
pub fn read_stream(files: &[Arc<TsmFile>], key: &str, range: TimeRange) -> Result<StreamRead> {
    let mut merged: BTreeMap<Timestamp, Value> = BTreeMap::new();
    let mut degraded = false;
    if range.is_empty() {
        return Ok(StreamRead::default());
    }

    for file in files {
        let Some(entry) = file.reader().entry(key) else {
            continue;
        };
        if !range.overlaps(entry.min_ts(), entry.max_ts()) {
            continue;
        }
        if file.is_quarantined() {
            degraded = true;
            continue;
        }
        match file.read_range(key, range) {
            Ok(points) => merged.extend(points),
            Err(err) if err.is_corruption() => {
                file.quarantine(&err);
                degraded = true;
            }
            Err(err) => return Err(err),
        }
    }

    Ok(StreamRead {
        points: merged.into_iter().collect(),
        degraded,
    })
}

/// Deletes sidecars left behind by files removed before a crash.
fn remove_orphan_sidecars(dir: &Path) -> Result<()> {
    let suffix = format!(".{TSM_EXTENSION}.{}", tombstone::TOMBSTONE_EXTENSION);
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(stem) = name.strip_suffix(&suffix) else {
            continue;
        };
        let tsm = dir.join(format!("{stem}.{TSM_EXTENSION}"));
        let quarantined = dir.join(format!("{stem}.{TSM_EXTENSION}.{QUARANTINE_EXTENSION}"));
        if !tsm.exists() && !quarantined.exists() {
            debug!(file = %path.display(), "Removing orphaned tombstone sidecar");
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

/// A file being written that is not yet visible.
pub struct PendingFile {
    id: FileId,
    writer: TsmWriter,
    tmp_path: PathBuf,
    final_path: PathBuf,
    dir: PathBuf,
}

impl PendingFile {
    /// Id the file will be published under.
    pub fn id(&self) -> FileId {
        self.id
    }

    /// Bytes written so far.
    pub fn size(&self) -> u64 {
        self.writer.size()
    }

    /// Number of streams written so far.
    pub fn key_count(&self) -> usize {
        self.writer.key_count()
    }

    /// Writes one stream; keys must be ascending.
    pub fn write_stream(
        &mut self,
        key: &str,
        value_type: ValueType,
        points: &[(Timestamp, Value)],
        max_points_per_block: usize,
    ) -> Result<()> {
        self.writer
            .write_stream(key, value_type, points, max_points_per_block)
    }

    /// Seals the file: fsync, rename into place, fsync the directory, reopen.
    pub fn finish(self) -> Result<Arc<TsmFile>> {
        let tmp_path = self.tmp_path.clone();
        let result = (|| {
            self.writer.finish()?;
            fs::rename(&self.tmp_path, &self.final_path)?;
            sync_dir(&self.dir)?;
            TsmFile::open(self.id, &self.final_path)
        })();
        if result.is_err() {
            let _ = fs::remove_file(&tmp_path);
        }
        result.map(Arc::new)
    }

    /// Discards the partial file.
    pub fn abort(self) {
        drop(self.writer);
        if let Err(err) = fs::remove_file(&self.tmp_path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(file = %self.tmp_path.display(), error = %err, "Failed to remove aborted file");
            }
        }
    }
}

/// Fsyncs a directory so renames and unlinks inside it are durable.
pub fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)?
        .sync_all()
        .map_err(|e| BurrowError::durability(format!("sync dir {}", dir.display()), e))
}

/// The set of sealed files of one shard.
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
    files: RwLock<Arc<Vec<Arc<TsmFile>>>>,
    /// Serializes publishes against tombstone registration.
    publish_lock: Mutex<()>,
    next_generation: AtomicU64,
    quarantined_at_open: AtomicBool,
}

impl FileStore {
    /// Opens (or creates) the store directory and loads every sealed file.
    ///
    /// Leftover `*.tmp` files from an interrupted write are deleted. Files
    /// that fail validation are renamed to `*.quarantine` and the store
    /// reports itself degraded.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut files = Vec::new();
        let mut degraded = false;
        let mut max_generation = 0u64;

        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.ends_with(&format!(".{TMP_EXTENSION}")) {
                debug!(file = %path.display(), "Removing leftover temporary file");
                fs::remove_file(&path)?;
                continue;
            }
            if let Some(original) = name.strip_suffix(&format!(".{QUARANTINE_EXTENSION}")) {
                // Keep its generation reserved so its sidecar is never inherited.
                if let Some(id) = FileId::parse_file_name(original) {
                    max_generation = max_generation.max(id.generation);
                }
                degraded = true;
                continue;
            }
            let Some(id) = FileId::parse_file_name(name) else {
                continue;
            };
            max_generation = max_generation.max(id.generation);
            match TsmFile::open(id, &path) {
                Ok(file) => files.push(Arc::new(file)),
                Err(err) if err.is_corruption() => {
                    let target = path.with_extension(format!("{TSM_EXTENSION}.{QUARANTINE_EXTENSION}"));
                    error!(file = %path.display(), error = %err, "Quarantining unreadable TSM file");
                    fs::rename(&path, &target)?;
                    degraded = true;
                }
                Err(err) => return Err(err),
            }
        }

        files.sort_by_key(|f| f.id());
        remove_orphan_sidecars(&dir)?;
        info!(dir = %dir.display(), files = files.len(), degraded, "Opened file store");

        Ok(Self {
            dir,
            files: RwLock::new(Arc::new(files)),
            publish_lock: Mutex::new(()),
            next_generation: AtomicU64::new(max_generation + 1),
            quarantined_at_open: AtomicBool::new(degraded),
        })
    }

    /// Directory of the store.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Allocates a fresh, strictly increasing generation.
    pub fn next_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::SeqCst)
    }

    /// Captures the current file list.
    pub fn files(&self) -> Arc<Vec<Arc<TsmFile>>> {
        Arc::clone(&self.files.read().unwrap_or_else(|err| err.into_inner()))
    }

    /// Number of visible files.
    pub fn len(&self) -> usize {
        self.files().len()
    }

    /// Returns true if there are no visible files.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if a file had to be quarantined while opening the store.
    /// Its keys are unknown, so every read is potentially incomplete.
    pub fn quarantined_at_open(&self) -> bool {
        self.quarantined_at_open.load(Ordering::Relaxed)
    }

    /// Returns true if any data of this store is unavailable.
    pub fn is_degraded(&self) -> bool {
        self.quarantined_at_open.load(Ordering::Relaxed)
            || self.files().iter().any(|f| f.is_quarantined())
    }

    /// Starts writing a file that becomes visible only through [`publish`].
    ///
    /// [`publish`]: FileStore::publish
    pub fn create_file(&self, id: FileId, level: u16, max_sequence: u64) -> Result<PendingFile> {
        let final_path = self.dir.join(id.file_name());
        let tmp_path = self.dir.join(format!("{}.{TMP_EXTENSION}", id.file_name()));
        let writer = TsmWriter::create(&tmp_path, level, max_sequence)?;
        Ok(PendingFile {
            id,
            writer,
            tmp_path,
            final_path,
            dir: self.dir.clone(),
        })
    }

    /// Atomically replaces `removed` with `added` in the visible set.
    ///
    /// `carried` runs under the publish lock and returns tombstones that
    /// must also apply to the new files (deletes that raced with the write).
    pub fn publish<F>(&self, added: &[Arc<TsmFile>], removed: &[FileId], carried: F) -> Result<()>
    where
        F: FnOnce() -> Vec<Tombstone>,
    {
        let _publish = self.publish_lock.lock().unwrap_or_else(|err| err.into_inner());

        let extra = carried();
        if !extra.is_empty() {
            for file in added {
                let relevant: Vec<Tombstone> = extra
                    .iter()
                    .filter(|t| file.affected_by(t))
                    .cloned()
                    .collect();
                file.add_tombstones(&relevant)?;
            }
        }

        let mut guard = self.files.write().unwrap_or_else(|err| err.into_inner());
        let mut next: Vec<Arc<TsmFile>> = guard
            .iter()
            .filter(|f| !removed.contains(&f.id()))
            .cloned()
            .collect();
        for file in guard.iter().filter(|f| removed.contains(&f.id())) {
            file.mark_obsolete();
        }
        next.extend(added.iter().cloned());
        next.sort_by_key(|f| f.id());
        *guard = Arc::new(next);
        drop(guard);

        debug!(
            added = added.len(),
            removed = removed.len(),
            "Published file set"
        );
        Ok(())
    }

    /// Records a tombstone on every visible file it affects and that passes
    /// `filter`. Returns the number of files touched.
    pub fn add_tombstone<F>(&self, tombstone: &Tombstone, filter: F) -> Result<usize>
    where
        F: Fn(&TsmFile) -> bool,
    {
        let _publish = self.publish_lock.lock().unwrap_or_else(|err| err.into_inner());
        let mut touched = 0;
        for file in self.files().iter() {
            if filter(file) && file.affected_by(tombstone) {
                file.add_tombstones(std::slice::from_ref(tombstone))?;
                touched += 1;
            }
        }
        Ok(touched)
    }

    /// Ids of files whose index holds the stream.
    pub fn locations(&self, key: &str) -> Vec<FileId> {
        self.files()
            .iter()
            .filter(|f| f.reader().contains(key))
            .map(|f| f.id())
            .collect()
    }

    /// Type of a stream in the newest file that holds it.
    pub fn field_type(&self, key: &str) -> Option<ValueType> {
        self.files()
            .iter()
            .rev()
            .find_map(|f| f.reader().entry(key).map(|e| e.value_type))
    }

    /// Distinct series keys with at least one stream in any file.
    pub fn series_keys(&self) -> BTreeSet<String> {
        let mut keys = BTreeSet::new();
        for file in self.files().iter() {
            for key in file.reader().keys() {
                if let Some((series, _)) = split_stream_key(key) {
                    keys.insert(series.to_string());
                }
            }
        }
        keys
    }

    /// Field names stored for a series across all files.
    pub fn fields(&self, series_key: &str) -> BTreeSet<String> {
        let prefix = format!("{series_key}{FIELD_SEPARATOR}");
        let mut fields = BTreeSet::new();
        for file in self.files().iter() {
            for (key, _) in file.reader().entries_with_prefix(&prefix) {
                fields.insert(key[prefix.len()..].to_string());
            }
        }
        fields
    }

    /// Returns true if any file still stores a stream of the series.
    pub fn contains_series(&self, series_key: &str) -> bool {
        let prefix = format!("{series_key}{FIELD_SEPARATOR}");
        self.files()
            .iter()
            .any(|f| f.reader().entries_with_prefix(&prefix).next().is_some())
    }

    /// Reads one stream across the current file set.
    pub fn read(&self, key: &str, range: TimeRange) -> Result<StreamRead> {
        read_stream(&self.files(), key, range)
    }

    /// Total bytes of visible files.
    pub fn total_size(&self) -> u64 {
        self.files().iter().map(|f| f.size()).sum()
    }
}
