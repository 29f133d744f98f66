//! Time-structured merge storage: shared data model, block codecs, sealed
//! files, the write cache and the file store.

pub mod cache;
pub mod encoding;
pub mod file;
pub mod gorilla;
pub mod store;
pub mod tombstone;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use cache::{CacheConfig, CacheSnapshot, CacheStats, WriteCache};
pub use encoding::{decode_block, encode_block};
pub use file::{TsmReader, TsmWriter};
pub use store::{FileId, FileStore, TsmFile};
pub use tombstone::Tombstone;

/// Nanosecond timestamp.
pub type Timestamp = i64;

/// Shard-local series identifier assigned by the series index.
pub type SeriesId = u64;

/// Separator between the series key and the field name in a stream key.
pub const FIELD_SEPARATOR: &str = "#!~#";

/// Builds the on-disk stream key for one field of a series.
pub fn stream_key(series_key: &str, field: &str) -> String {
    let mut key = String::with_capacity(series_key.len() + FIELD_SEPARATOR.len() + field.len());
    key.push_str(series_key);
    key.push_str(FIELD_SEPARATOR);
    key.push_str(field);
    key
}

/// Splits a stream key into `(series_key, field)`.
pub fn split_stream_key(key: &str) -> Option<(&str, &str)> {
    key.rsplit_once(FIELD_SEPARATOR)
}

/// Inclusive time range `[min, max]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    /// Lower bound (inclusive).
    pub min: Timestamp,
    /// Upper bound (inclusive).
    pub max: Timestamp,
}

impl TimeRange {
    /// Creates a range covering `min..=max`.
    pub fn new(min: Timestamp, max: Timestamp) -> Self {
        Self { min, max }
    }

    /// A range covering every representable timestamp.
    pub fn all() -> Self {
        Self {
            min: Timestamp::MIN,
            max: Timestamp::MAX,
        }
    }

    /// Returns true if the timestamp lies within the range.
    #[inline]
    pub fn contains(&self, ts: Timestamp) -> bool {
        ts >= self.min && ts <= self.max
    }

    /// Returns true if `[min, max]` shares at least one timestamp with this range.
    #[inline]
    pub fn overlaps(&self, min: Timestamp, max: Timestamp) -> bool {
        min <= self.max && max >= self.min
    }

    /// Returns true if `[min, max]` lies entirely within this range.
    #[inline]
    pub fn covers(&self, min: Timestamp, max: Timestamp) -> bool {
        min >= self.min && max <= self.max
    }

    /// Returns true if the range matches nothing.
    pub fn is_empty(&self) -> bool {
        self.min > self.max
    }
}

/// Type tag of a stored value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ValueType {
    /// Signed 64-bit integer.
    Integer = 1,
    /// IEEE-754 double.
    Float = 2,
    /// Boolean.
    Boolean = 3,
    /// UTF-8 string.
    String = 4,
}

impl ValueType {
    /// Converts a stored tag byte back into a type.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(ValueType::Integer),
            2 => Some(ValueType::Float),
            3 => Some(ValueType::Boolean),
            4 => Some(ValueType::String),
            _ => None,
        }
    }

    /// Returns the lowercase type name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueType::Integer => "integer",
            ValueType::Float => "float",
            ValueType::Boolean => "boolean",
            ValueType::String => "string",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A scalar field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// Signed 64-bit integer.
    Integer(i64),
    /// IEEE-754 double.
    Float(f64),
    /// Boolean.
    Boolean(bool),
    /// UTF-8 string.
    String(String),
}

impl Value {
    /// Returns the type tag of this value.
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Integer(_) => ValueType::Integer,
            Value::Float(_) => ValueType::Float,
            Value::Boolean(_) => ValueType::Boolean,
            Value::String(_) => ValueType::String,
        }
    }

    /// Estimated in-memory footprint, used for cache sizing.
    pub fn size_hint(&self) -> usize {
        match self {
            Value::String(s) => std::mem::size_of::<Value>() + s.len(),
            _ => std::mem::size_of::<Value>(),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

/// A single timestamped value of one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    /// Timestamp in nanoseconds.
    pub timestamp: Timestamp,
    /// Field value.
    pub value: Value,
}

impl Point {
    /// Creates a new point.
    pub fn new(timestamp: Timestamp, value: impl Into<Value>) -> Self {
        Self {
            timestamp,
            value: value.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_key_roundtrip() {
        let key = stream_key("cpu,host=a", "usage");
        assert_eq!(key, "cpu,host=a#!~#usage");
        assert_eq!(split_stream_key(&key), Some(("cpu,host=a", "usage")));
        assert_eq!(split_stream_key("cpu"), None);
    }

    #[test]
    fn test_time_range_inclusive() {
        let range = TimeRange::new(0, 2000);
        assert!(range.contains(0));
        assert!(range.contains(2000));
        assert!(!range.contains(2001));
        assert!(range.overlaps(2000, 3000));
        assert!(!range.overlaps(2001, 3000));
        assert!(range.covers(10, 20));
        assert!(!range.covers(-1, 20));
        assert!(TimeRange::new(5, 4).is_empty());
        assert!(TimeRange::all().contains(Timestamp::MAX));
    }

    #[test]
    fn test_value_type_tags() {
        for ty in [
            ValueType::Integer,
            ValueType::Float,
            ValueType::Boolean,
            ValueType::String,
        ] {
            assert_eq!(ValueType::from_u8(ty as u8), Some(ty));
        }
        assert_eq!(ValueType::from_u8(0), None);
        assert_eq!(Value::from("x").value_type(), ValueType::String);
        assert_eq!(Value::from(1.5).value_type(), ValueType::Float);
    }
}
