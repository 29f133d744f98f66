//! Burrow - Alopex Per-Shard Time Series Storage Engine
//!
//! This crate provides one shard of a time series database: durable
//! ingestion through a write-ahead log, an in-memory write cache, immutable
//! TSM files, background compaction and a tag index with predicate matching.
//!
//! # Components
//!
//! - [`Shard`]: the public contract tying everything together
//! - [`Wal`]: framed, checksummed write-ahead log with torn-tail repair
//! - [`WriteCache`]: live memtable plus frozen snapshots
//! - [`FileStore`]: the visible set of sealed TSM files and their tombstones
//! - [`Compactor`]: snapshot flushes, tombstone rewrites and level merges
//! - [`SeriesIndex`]: series keys, ids and tag posting lists
//!
//! # Example
//!
//! ```rust,ignore
//! use alopex_burrow::{Point, Predicate, Shard, ShardConfig, TagRule, TimeRange};
//!
//! let shard = Shard::open("/var/lib/burrow/shard-0001", ShardConfig::default())?;
//! shard.write("cpu,host=a,region=eu", "usage", Point::new(1_000, 0.75))?;
//!
//! let predicate = Predicate::measurement("cpu")
//!     .with_rule(TagRule::parse("host:a", "equal")?);
//! for row in shard.query(&predicate, TimeRange::new(0, 2_000))? {
//!     let row = row?;
//!     println!("{} {} {} {:?}", row.series_key, row.field, row.timestamp, row.value);
//! }
//!
//! shard.flush()?;
//! shard.close()?;
//! ```

#![deny(missing_docs)]

pub mod error;
pub mod index;
pub mod lifecycle;
pub mod shard;
pub mod tsm;
pub mod wal;

pub use error::{BurrowError, ErrorKind, Result};
pub use index::{Operator, Predicate, SeriesIndex, SeriesKey, Tag, TagRule};
pub use lifecycle::{CompactionConfig, Compactor, CompactorState, LevelConfig};
pub use shard::{QueryResult, Row, Shard, ShardConfig, ShardStats, WritePoint};
pub use tsm::{
    CacheConfig, FileStore, Point, SeriesId, TimeRange, Timestamp, Value, ValueType, WriteCache,
};
pub use wal::{SyncMode, Wal, WalConfig, WalEntry};
