//! Tombstones: logical deletes recorded next to the files they affect.
//!
//! A tombstone names either one stream (`series#!~#field`) or a whole series
//! (`series`, covering every field) plus an inclusive time range. Tombstones
//! for a TSM file live in a `<file>.tombstone` sidecar as JSON lines so a
//! delete never rewrites the immutable file itself.

use crate::error::{BurrowError, Result};
use crate::tsm::file::KeyEntry;
use crate::tsm::{TimeRange, Timestamp, Value, FIELD_SEPARATOR};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Extension appended to a TSM file path to name its sidecar.
pub const TOMBSTONE_EXTENSION: &str = "tombstone";

/// A logical delete of `key` over `[min, max]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tombstone {
    /// Stream key, or series key to cover every field.
    pub key: String,
    /// First deleted timestamp (inclusive).
    pub min: Timestamp,
    /// Last deleted timestamp (inclusive).
    pub max: Timestamp,
}

impl Tombstone {
    /// Deletes every point of a series.
    pub fn series(series_key: impl Into<String>) -> Self {
        Self::range(series_key, TimeRange::all())
    }

    /// Deletes a time range of a series or stream.
    pub fn range(key: impl Into<String>, range: TimeRange) -> Self {
        Self {
            key: key.into(),
            min: range.min,
            max: range.max,
        }
    }

    /// The deleted time range.
    pub fn time_range(&self) -> TimeRange {
        TimeRange::new(self.min, self.max)
    }

    /// Returns true if this tombstone addresses `stream_key`.
    pub fn applies_to(&self, stream_key: &str) -> bool {
        if self.key.contains(FIELD_SEPARATOR) {
            return self.key == stream_key;
        }
        stream_key.len() > self.key.len()
            && stream_key.starts_with(&self.key)
            && stream_key[self.key.len()..].starts_with(FIELD_SEPARATOR)
    }

    /// Returns true if the point `(stream_key, ts)` is deleted.
    #[inline]
    pub fn covers(&self, stream_key: &str, ts: Timestamp) -> bool {
        ts >= self.min && ts <= self.max && self.applies_to(stream_key)
    }
}

/// Removes every point of `stream_key` covered by any tombstone.
pub fn filter_points(
    tombstones: &[Tombstone],
    stream_key: &str,
    points: &mut Vec<(Timestamp, Value)>,
) {
    let relevant: Vec<&Tombstone> = tombstones
        .iter()
        .filter(|t| t.applies_to(stream_key))
        .collect();
    if relevant.is_empty() {
        return;
    }
    points.retain(|(ts, _)| !relevant.iter().any(|t| *ts >= t.min && *ts <= t.max));
}

/// Upper-bound estimate of how many points of a stream the tombstones cover,
/// counted per block without decoding anything.
pub fn covered_points(tombstones: &[Tombstone], stream_key: &str, entry: &KeyEntry) -> u64 {
    let relevant: Vec<&Tombstone> = tombstones
        .iter()
        .filter(|t| t.applies_to(stream_key))
        .collect();
    if relevant.is_empty() {
        return 0;
    }
    entry
        .blocks
        .iter()
        .filter(|b| relevant.iter().any(|t| t.time_range().overlaps(b.min_ts, b.max_ts)))
        .map(|b| u64::from(b.count))
        .sum()
}

/// Path of the sidecar for a TSM file.
pub fn sidecar_path(tsm_path: &Path) -> PathBuf {
    let mut name = tsm_path.as_os_str().to_owned();
    name.push(".");
    name.push(TOMBSTONE_EXTENSION);
    PathBuf::from(name)
}

/// Appends tombstones to a sidecar and syncs it.
///
/// # Errors
///
/// Returns a durability error if the sync fails.
pub fn append_sidecar(path: &Path, tombstones: &[Tombstone]) -> Result<()> {
    if tombstones.is_empty() {
        return Ok(());
    }
    let mut buf = Vec::new();
    for tombstone in tombstones {
        serde_json::to_writer(&mut buf, tombstone)
            .map_err(|e| BurrowError::Validation(format!("encode tombstone: {e}")))?;
        buf.push(b'\n');
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(&buf)?;
    file.sync_all()
        .map_err(|e| BurrowError::durability(format!("sync {}", path.display()), e))?;
    Ok(())
}

/// Loads a sidecar. A missing sidecar means no tombstones.
///
/// An unparsable final line is a torn append: it is dropped with a warning
/// and the file is truncated back to the last complete record, so the next
/// append starts on a fresh line. A complete final record missing its
/// newline gets one. An unparsable line followed by valid ones is
/// corruption.
pub fn read_sidecar(path: &Path) -> Result<Vec<Tombstone>> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };

    let mut tombstones = Vec::new();
    let mut offset = 0;
    let mut line_no = 0;
    let mut torn_at = None;
    let mut missing_newline = false;
    while offset < data.len() {
        line_no += 1;
        let newline = data[offset..].iter().position(|b| *b == b'\n');
        let line_end = newline.map_or(data.len(), |p| offset + p);
        let next = newline.map_or(data.len(), |_| line_end + 1);
        let line = &data[offset..line_end];

        if !line.iter().all(u8::is_ascii_whitespace) {
            match serde_json::from_slice::<Tombstone>(line) {
                Ok(t) => {
                    tombstones.push(t);
                    missing_newline = newline.is_none();
                }
                Err(e) if next >= data.len() => {
                    warn!(path = %path.display(), error = %e, "Dropping torn tombstone record");
                    torn_at = Some(offset as u64);
                }
                Err(e) => {
                    return Err(BurrowError::corruption(
                        path,
                        format!("tombstone line {line_no}: {e}"),
                    ))
                }
            }
        }
        offset = next;
    }

    if let Some(len) = torn_at {
        let file = OpenOptions::new().write(true).open(path)?;
        file.set_len(len)?;
        file.sync_all()
            .map_err(|e| BurrowError::durability(format!("sync {}", path.display()), e))?;
    } else if missing_newline {
        let mut file = OpenOptions::new().append(true).open(path)?;
        file.write_all(b"\n")?;
        file.sync_all()
            .map_err(|e| BurrowError::durability(format!("sync {}", path.display()), e))?;
    }
    Ok(tombstones)
}
