//! Write-Ahead Log (WAL) for Burrow shards.
//!
//! Every mutation is appended here, and synced, before it becomes visible in
//! the write cache. After a crash the shard replays the log to rebuild the
//! cache and re-apply deletes.
//!
//! # Architecture
//!
//! ```text
//! Client → WAL append → sync → Cache insert → Ack
//! ```
//!
//! # Features
//!
//! - **Framed entries**: each entry is `[len u32][crc32 u32][payload]`
//! - **Segment rotation**: segments roll over at a size threshold
//! - **Torn-tail repair**: a partial last frame is discarded on open
//! - **Retirement**: segments fully covered by flushed files are deleted
//! - **Poisoning**: after a failed sync no further append is accepted
//!
//! # Example
//!
//! ```rust,ignore
//! use alopex_burrow::wal::{Wal, WalConfig, WalEntry};
//!
//! let mut wal = Wal::open("/path/to/wal", WalConfig::default())?;
//! for entry in wal.recover() {
//!     // replay into the cache
//! }
//! let seq = wal.append(WalEntry::delete_series(vec!["cpu,host=a".into()]))?;
//!
//! // Once every entry up to `seq` lives in a TSM file:
//! wal.retire(seq)?;
//! ```

use crate::error::{BurrowError, Result};
use crate::tsm::encoding::{get_value, put_str, put_uvarint, put_value, ByteReader};
use crate::tsm::store::sync_dir;
use crate::tsm::{TimeRange, Timestamp, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Default maximum segment size (64 MB).
pub const DEFAULT_SEGMENT_SIZE: u64 = 64 * 1024 * 1024;

/// WAL segment file extension.
const SEGMENT_EXTENSION: &str = "wal";

/// WAL file magic bytes.
const WAL_MAGIC: [u8; 4] = *b"SWAL";

/// WAL format version.
const WAL_VERSION: u16 = 4;

/// Frame prefix: length + crc32.
const FRAME_HEADER_SIZE: usize = 8;

/// Sync mode for WAL durability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Fsync after each append (default, highest durability).
    #[default]
    Fsync,
    /// Use fdatasync (skip metadata update, faster).
    Fdatasync,
    /// No sync (fastest, no durability - for tests and benchmarks only).
    None,
}

/// Configuration for WAL behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalConfig {
    /// Size at which the active segment is rotated.
    pub segment_size: u64,
    /// Sync mode for durability guarantees.
    pub sync_mode: SyncMode,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            segment_size: DEFAULT_SEGMENT_SIZE,
            sync_mode: SyncMode::default(),
        }
    }
}

impl WalConfig {
    /// Sets the segment rotation size.
    pub fn with_segment_size(mut self, segment_size: u64) -> Self {
        self.segment_size = segment_size;
        self
    }

    /// Sets the sync mode.
    pub fn with_sync_mode(mut self, sync_mode: SyncMode) -> Self {
        self.sync_mode = sync_mode;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum WalEntryKind {
    WritePoints = 1,
    DeleteSeries = 2,
    DeleteRange = 3,
}

/// One logged point. Carries the series key rather than an id so the log can
/// be replayed into a freshly built index.
#[derive(Debug, Clone, PartialEq)]
pub struct WalPoint {
    /// Canonical series key.
    pub series_key: String,
    /// Field name.
    pub field: String,
    /// Point timestamp.
    pub timestamp: Timestamp,
    /// Point value.
    pub value: Value,
}

/// A single entry in the Write-Ahead Log.
#[derive(Debug, Clone, PartialEq)]
pub enum WalEntry {
    /// A batch of points committed atomically.
    WritePoints {
        /// Sequence number, assigned by the WAL.
        sequence: u64,
        /// The points.
        points: Vec<WalPoint>,
    },
    /// Every point of the listed series is deleted.
    DeleteSeries {
        /// Sequence number, assigned by the WAL.
        sequence: u64,
        /// Canonical series keys.
        series_keys: Vec<String>,
    },
    /// Points of the listed series inside `range` are deleted.
    DeleteRange {
        /// Sequence number, assigned by the WAL.
        sequence: u64,
        /// Canonical series keys.
        series_keys: Vec<String>,
        /// Deleted time range (inclusive).
        range: TimeRange,
    },
}

impl WalEntry {
    /// Creates a write entry. The sequence number is set when appending.
    pub fn write_points(points: Vec<WalPoint>) -> Self {
        Self::WritePoints {
            sequence: 0,
            points,
        }
    }

    /// Creates a series delete entry.
    pub fn delete_series(series_keys: Vec<String>) -> Self {
        Self::DeleteSeries {
            sequence: 0,
            series_keys,
        }
    }

    /// Creates a range delete entry.
    pub fn delete_range(series_keys: Vec<String>, range: TimeRange) -> Self {
        Self::DeleteRange {
            sequence: 0,
            series_keys,
            range,
        }
    }

    /// Returns the sequence number of the entry.
    pub fn sequence(&self) -> u64 {
        match self {
            Self::WritePoints { sequence, .. }
            | Self::DeleteSeries { sequence, .. }
            | Self::DeleteRange { sequence, .. } => *sequence,
        }
    }

    fn set_sequence(&mut self, seq: u64) {
        match self {
            Self::WritePoints { sequence, .. }
            | Self::DeleteSeries { sequence, .. }
            | Self::DeleteRange { sequence, .. } => *sequence = seq,
        }
    }

    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        match self {
            Self::WritePoints { sequence, points } => {
                buf.push(WalEntryKind::WritePoints as u8);
                buf.extend_from_slice(&sequence.to_le_bytes());
                put_uvarint(&mut buf, points.len() as u64);
                for point in points {
                    put_str(&mut buf, &point.series_key);
                    put_str(&mut buf, &point.field);
                    buf.extend_from_slice(&point.timestamp.to_le_bytes());
                    put_value(&mut buf, &point.value);
                }
            }
            Self::DeleteSeries {
                sequence,
                series_keys,
            } => {
                buf.push(WalEntryKind::DeleteSeries as u8);
                buf.extend_from_slice(&sequence.to_le_bytes());
                put_keys(&mut buf, series_keys);
            }
            Self::DeleteRange {
                sequence,
                series_keys,
                range,
            } => {
                buf.push(WalEntryKind::DeleteRange as u8);
                buf.extend_from_slice(&sequence.to_le_bytes());
                buf.extend_from_slice(&range.min.to_le_bytes());
                buf.extend_from_slice(&range.max.to_le_bytes());
                put_keys(&mut buf, series_keys);
            }
        }
        buf
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(bytes);
        let kind = reader.read_u8()?;
        let sequence = reader.read_u64()?;
        let entry = match kind {
            k if k == WalEntryKind::WritePoints as u8 => {
                let count = reader.read_uvarint()? as usize;
                let mut points = Vec::with_capacity(count.min(reader.remaining()));
                for _ in 0..count {
                    let series_key = reader.read_str()?;
                    let field = reader.read_str()?;
                    let timestamp = reader.read_i64()?;
                    let value = get_value(&mut reader)?;
                    points.push(WalPoint {
                        series_key,
                        field,
                        timestamp,
                        value,
                    });
                }
                Self::WritePoints { sequence, points }
            }
            k if k == WalEntryKind::DeleteSeries as u8 => Self::DeleteSeries {
                sequence,
                series_keys: get_keys(&mut reader)?,
            },
            k if k == WalEntryKind::DeleteRange as u8 => {
                let min = reader.read_i64()?;
                let max = reader.read_i64()?;
                Self::DeleteRange {
                    sequence,
                    range: TimeRange::new(min, max),
                    series_keys: get_keys(&mut reader)?,
                }
            }
            other => return Err(BurrowError::Decode(format!("unknown WAL entry kind {other}"))),
        };
        if reader.remaining() != 0 {
            return Err(BurrowError::Decode(format!(
                "{} trailing bytes after WAL entry",
                reader.remaining()
            )));
        }
        Ok(entry)
    }
}

fn put_keys(buf: &mut Vec<u8>, keys: &[String]) {
    put_uvarint(buf, keys.len() as u64);
    for key in keys {
        put_str(buf, key);
    }
}

fn get_keys(reader: &mut ByteReader<'_>) -> Result<Vec<String>> {
    let count = reader.read_uvarint()? as usize;
    let mut keys = Vec::with_capacity(count.min(reader.remaining()));
    for _ in 0..count {
        keys.push(reader.read_str()?);
    }
    Ok(keys)
}

/// WAL segment header.
#[derive(Debug, Clone)]
struct SegmentHeader {
    version: u16,
    segment_id: u64,
    created_at: u64,
    /// Highest sequence assigned before this segment was created.
    base_sequence: u64,
}

impl SegmentHeader {
    const SIZE: usize = 32; // 4 + 2 + 2 + 8 + 8 + 8

    fn new(segment_id: u64, base_sequence: u64) -> Self {
        Self {
            version: WAL_VERSION,
            segment_id,
            base_sequence,
            created_at: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(0),
        }
    }

    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&WAL_MAGIC)?;
        writer.write_all(&self.version.to_le_bytes())?;
        writer.write_all(&0u16.to_le_bytes())?;
        writer.write_all(&self.segment_id.to_le_bytes())?;
        writer.write_all(&self.created_at.to_le_bytes())?;
        writer.write_all(&self.base_sequence.to_le_bytes())?;
        Ok(())
    }

    fn read_from(bytes: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(bytes);
        let raw = reader.read_bytes(4)?;
        let magic = [raw[0], raw[1], raw[2], raw[3]];
        if magic != WAL_MAGIC {
            return Err(BurrowError::InvalidMagic(magic));
        }
        let raw = reader.read_bytes(2)?;
        let version = u16::from_le_bytes([raw[0], raw[1]]);
        if version != WAL_VERSION {
            return Err(BurrowError::UnsupportedVersion(version));
        }
        reader.read_bytes(2)?;
        let segment_id = reader.read_u64()?;
        let created_at = reader.read_u64()?;
        let base_sequence = reader.read_u64()?;
        Ok(Self {
            version,
            segment_id,
            created_at,
            base_sequence,
        })
    }
}

/// What recovery learned about one segment.
struct SegmentScan {
    entries: Vec<WalEntry>,
    /// Sequence floor recorded in the header.
    base_sequence: u64,
    /// Offset just past the last good frame.
    valid_len: u64,
    /// The file was longer than `valid_len`.
    torn: bool,
}

/// Parses a segment file, distinguishing a torn last frame from corruption
/// with data after it.
fn scan_segment(path: &Path) -> Result<SegmentScan> {
    let bytes = fs::read(path)?;
    if bytes.len() < SegmentHeader::SIZE {
        // Crash while the header itself was being written.
        return Ok(SegmentScan {
            entries: Vec::new(),
            base_sequence: 0,
            valid_len: 0,
            torn: true,
        });
    }
    let header = SegmentHeader::read_from(&bytes[..SegmentHeader::SIZE])
        .map_err(|e| BurrowError::corruption(path, format!("segment header: {e}")))?;
    debug!(
        segment = header.segment_id,
        version = header.version,
        created_at = header.created_at,
        base_sequence = header.base_sequence,
        "Scanning WAL segment"
    );
    let base_sequence = header.base_sequence;

    let mut entries = Vec::new();
    let mut offset = SegmentHeader::SIZE;
    while offset < bytes.len() {
        let rest = &bytes[offset..];
        if rest.len() < FRAME_HEADER_SIZE {
            return Ok(torn_at(entries, base_sequence, offset));
        }
        let len = u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
        let expected = u32::from_le_bytes([rest[4], rest[5], rest[6], rest[7]]);
        if len == 0 {
            // No entry encodes to nothing; zeroed pages past the last sync.
            if rest.iter().all(|b| *b == 0) {
                return Ok(torn_at(entries, base_sequence, offset));
            }
            return Err(BurrowError::corruption(
                path,
                format!("empty frame at offset {offset}"),
            ));
        }
        let end = FRAME_HEADER_SIZE.saturating_add(len);
        if rest.len() < end {
            return Ok(torn_at(entries, base_sequence, offset));
        }
        let payload = &rest[FRAME_HEADER_SIZE..end];
        let actual = crc32fast::hash(payload);
        if actual != expected {
            if rest.len() == end {
                return Ok(torn_at(entries, base_sequence, offset));
            }
            return Err(BurrowError::corruption(
                path,
                format!("frame checksum mismatch at offset {offset}"),
            ));
        }
        let entry = match WalEntry::decode(payload) {
            Ok(entry) => entry,
            Err(_) if rest.len() == end => return Ok(torn_at(entries, base_sequence, offset)),
            Err(e) => {
                return Err(BurrowError::corruption(
                    path,
                    format!("undecodable frame at offset {offset}: {e}"),
                ))
            }
        };
        entries.push(entry);
        offset += end;
    }

    Ok(SegmentScan {
        entries,
        base_sequence,
        valid_len: offset as u64,
        torn: false,
    })
}

fn torn_at(entries: Vec<WalEntry>, base_sequence: u64, offset: usize) -> SegmentScan {
    SegmentScan {
        entries,
        base_sequence,
        valid_len: offset as u64,
        torn: true,
    }
}

/// Write-Ahead Log for one shard.
///
/// Not internally synchronized; the shard serializes access.
#[derive(Debug)]
pub struct Wal {
    /// Directory containing WAL segments.
    log_dir: PathBuf,
    /// Current segment file being written to.
    current_segment: BufWriter<File>,
    /// Current segment ID.
    current_segment_id: u64,
    /// Current segment size in bytes.
    current_segment_size: u64,
    /// Highest sequence stored in each segment, `None` for empty ones.
    segments: BTreeMap<u64, Option<u64>>,
    /// Next sequence number to assign.
    next_sequence: u64,
    /// Entries found on open, handed out once by [`Wal::recover`].
    recovered: Vec<WalEntry>,
    /// Set after a failed write or sync.
    poisoned: bool,
    /// WAL configuration.
    config: WalConfig,
}

impl Wal {
    /// Opens (or creates) the WAL in `log_dir`.
    ///
    /// Existing segments are scanned in id order. A torn last frame is
    /// discarded and its segment truncated to the last good frame; any other
    /// damage is reported as corruption. Writing continues in a fresh segment.
    ///
    /// Every segment header records the highest sequence assigned before it
    /// was created, so sequences stay monotonic even after every entry has
    /// been retired.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be accessed or a segment is
    /// corrupt beyond its tail.
    pub fn open(log_dir: impl AsRef<Path>, config: WalConfig) -> Result<Self> {
        let log_dir = log_dir.as_ref().to_path_buf();
        fs::create_dir_all(&log_dir)?;

        let mut segments = BTreeMap::new();
        let mut recovered = Vec::new();
        let mut max_sequence = 0u64;

        for (segment_id, path) in list_segments(&log_dir)? {
            let scan = scan_segment(&path)?;
            max_sequence = max_sequence.max(scan.base_sequence);
            if scan.torn {
                warn!(
                    segment = %path.display(),
                    valid_len = scan.valid_len,
                    "Discarding torn WAL tail"
                );
                if scan.valid_len == 0 {
                    fs::remove_file(&path)?;
                    continue;
                }
                let file = OpenOptions::new().write(true).open(&path)?;
                file.set_len(scan.valid_len)?;
                file.sync_all()
                    .map_err(|e| BurrowError::durability(format!("truncate {}", path.display()), e))?;
            }
            let segment_max = scan.entries.iter().map(WalEntry::sequence).max();
            if let Some(seq) = segment_max {
                max_sequence = max_sequence.max(seq);
            }
            debug!(
                segment = segment_id,
                entries = scan.entries.len(),
                "Recovered WAL segment"
            );
            segments.insert(segment_id, segment_max);
            recovered.extend(scan.entries);
        }
        recovered.sort_by_key(WalEntry::sequence);

        let next_segment_id = segments.keys().next_back().map_or(0, |id| id + 1);
        let current_segment = create_segment(&log_dir, next_segment_id, max_sequence)?;
        segments.insert(next_segment_id, None);
        sync_dir(&log_dir)?;

        info!(
            dir = %log_dir.display(),
            entries = recovered.len(),
            next_sequence = max_sequence + 1,
            "Opened WAL"
        );

        Ok(Self {
            log_dir,
            current_segment,
            current_segment_id: next_segment_id,
            current_segment_size: SegmentHeader::SIZE as u64,
            segments,
            next_sequence: max_sequence + 1,
            recovered,
            poisoned: false,
            config,
        })
    }

    /// Takes the entries recovered on open, in sequence order.
    ///
    /// Subsequent calls return an empty vector.
    pub fn recover(&mut self) -> Vec<WalEntry> {
        std::mem::take(&mut self.recovered)
    }

    /// Appends a single entry and syncs it. Returns its sequence number.
    ///
    /// # Errors
    ///
    /// Returns `Durability` if the write or sync fails (the WAL is then
    /// poisoned), or `WalPoisoned` if an earlier one did.
    pub fn append(&mut self, entry: WalEntry) -> Result<u64> {
        let sequences = self.append_batch(vec![entry])?;
        Ok(sequences[0])
    }

    /// Appends several entries with a single sync.
    ///
    /// # Errors
    ///
    /// Same as [`Wal::append`].
    pub fn append_batch(&mut self, entries: Vec<WalEntry>) -> Result<Vec<u64>> {
        if self.poisoned {
            return Err(BurrowError::WalPoisoned);
        }
        if entries.is_empty() {
            return Ok(Vec::new());
        }
        let mut frames = Vec::with_capacity(entries.len());
        for (i, mut entry) in entries.into_iter().enumerate() {
            entry.set_sequence(self.next_sequence + i as u64);
            let payload = entry.encode();
            let len = u32::try_from(payload.len()).map_err(|_| {
                BurrowError::Validation(format!("WAL entry of {} bytes is too large", payload.len()))
            })?;
            frames.push((entry.sequence(), len, payload));
        }
        match self.write_frames(&frames) {
            Ok(()) => Ok(frames.iter().map(|(seq, _, _)| *seq).collect()),
            Err(err) => {
                self.poisoned = true;
                warn!(
                    segment = self.current_segment_id,
                    error = %err,
                    "WAL append failed, refusing further writes"
                );
                Err(match err {
                    BurrowError::IoError(source) => BurrowError::durability("WAL append", source),
                    other => other,
                })
            }
        }
    }

    fn write_frames(&mut self, frames: &[(u64, u32, Vec<u8>)]) -> Result<()> {
        for (sequence, len, payload) in frames {
            let frame_len = (FRAME_HEADER_SIZE + payload.len()) as u64;
            let has_frames = self.current_segment_size > SegmentHeader::SIZE as u64;
            if has_frames && self.current_segment_size + frame_len > self.config.segment_size {
                self.rotate()?;
            }

            self.current_segment.write_all(&len.to_le_bytes())?;
            self.current_segment
                .write_all(&crc32fast::hash(payload).to_le_bytes())?;
            self.current_segment.write_all(payload)?;
            self.current_segment_size += frame_len;

            self.next_sequence = sequence + 1;
            self.segments.insert(self.current_segment_id, Some(*sequence));
        }
        self.sync()
    }

    /// Ensures the next assigned sequence is greater than `floor`.
    ///
    /// Used on open to keep new sequences above those already recorded in
    /// TSM files.
    pub fn advance_sequence(&mut self, floor: u64) {
        if self.next_sequence <= floor {
            self.next_sequence = floor + 1;
        }
    }

    /// Flushes buffered bytes and syncs per the configured mode.
    ///
    /// # Errors
    ///
    /// Returns `Durability` if the sync fails.
    pub fn sync(&mut self) -> Result<()> {
        self.current_segment
            .flush()
            .map_err(|e| BurrowError::durability("WAL flush", e))?;
        let file = self.current_segment.get_ref();
        let synced = match self.config.sync_mode {
            SyncMode::Fsync => file.sync_all(),
            SyncMode::Fdatasync => file.sync_data(),
            SyncMode::None => Ok(()),
        };
        synced.map_err(|e| BurrowError::durability("WAL sync", e))
    }

    /// Seals the active segment and starts a new one.
    ///
    /// # Errors
    ///
    /// Returns an error if the old segment cannot be synced or the new one
    /// cannot be created.
    pub fn rotate(&mut self) -> Result<()> {
        self.current_segment
            .flush()
            .map_err(|e| BurrowError::durability("WAL flush", e))?;
        if self.config.sync_mode != SyncMode::None {
            self.current_segment
                .get_ref()
                .sync_all()
                .map_err(|e| BurrowError::durability("WAL rotate", e))?;
        }

        let segment_id = self.current_segment_id + 1;
        self.current_segment = create_segment(&self.log_dir, segment_id, self.last_sequence())?;
        self.current_segment_id = segment_id;
        self.current_segment_size = SegmentHeader::SIZE as u64;
        self.segments.insert(segment_id, None);
        sync_dir(&self.log_dir)?;

        debug!(segment = segment_id, "Rotated to new WAL segment");
        Ok(())
    }

    /// Deletes segments whose entries all have a sequence `<= up_to_sequence`.
    ///
    /// The active segment is never deleted; if it is fully covered it is
    /// rotated first. Returns the number of segments removed.
    ///
    /// # Errors
    ///
    /// Returns an error if a segment cannot be deleted.
    pub fn retire(&mut self, up_to_sequence: u64) -> Result<usize> {
        if self.poisoned {
            return Err(BurrowError::WalPoisoned);
        }
        if matches!(self.segments.get(&self.current_segment_id), Some(Some(max)) if *max <= up_to_sequence)
        {
            self.rotate()?;
        }

        let retired: Vec<u64> = self
            .segments
            .iter()
            .filter(|(id, max)| {
                **id != self.current_segment_id && max.map_or(true, |m| m <= up_to_sequence)
            })
            .map(|(id, _)| *id)
            .collect();

        for segment_id in &retired {
            let path = segment_path(&self.log_dir, *segment_id);
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
            self.segments.remove(segment_id);
            debug!(segment = segment_id, "Retired WAL segment");
        }
        if !retired.is_empty() {
            sync_dir(&self.log_dir)?;
        }
        Ok(retired.len())
    }

    /// Returns the highest sequence number assigned so far (0 if none).
    pub fn last_sequence(&self) -> u64 {
        self.next_sequence - 1
    }

    /// Returns true once a write or sync failure has poisoned the log.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Returns the current segment ID.
    pub fn current_segment_id(&self) -> u64 {
        self.current_segment_id
    }

    /// Returns the number of segment files, including the active one.
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Returns the log directory path.
    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Returns the configuration.
    pub fn config(&self) -> &WalConfig {
        &self.config
    }
}

impl Drop for Wal {
    fn drop(&mut self) {
        if self.poisoned {
            return;
        }
        if let Err(e) = self.current_segment.flush() {
            warn!("Failed to flush WAL on drop: {:?}", e);
        }
    }
}

fn segment_path(log_dir: &Path, segment_id: u64) -> PathBuf {
    log_dir.join(format!("{segment_id:016x}.{SEGMENT_EXTENSION}"))
}

fn parse_segment_id(path: &Path) -> Option<u64> {
    if path.extension()? != SEGMENT_EXTENSION {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    if stem.len() != 16 {
        return None;
    }
    u64::from_str_radix(stem, 16).ok()
}

/// Lists segment files sorted by id.
fn list_segments(log_dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let mut segments = Vec::new();
    for entry in fs::read_dir(log_dir)? {
        let path = entry?.path();
        if let Some(id) = parse_segment_id(&path) {
            segments.push((id, path));
        }
    }
    segments.sort_by_key(|(id, _)| *id);
    Ok(segments)
}

fn create_segment(log_dir: &Path, segment_id: u64, base_sequence: u64) -> Result<BufWriter<File>> {
    let path = segment_path(log_dir, segment_id);
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&path)?;
    let mut writer = BufWriter::new(file);
    SegmentHeader::new(segment_id, base_sequence).write_to(&mut writer)?;
    writer.flush()?;
    writer
        .get_ref()
        .sync_all()
        .map_err(|e| BurrowError::durability(format!("create {}", path.display()), e))?;
    Ok(writer)
}
