//! Error and Result types for Burrow storage operations.

use crate::tsm::ValueType;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// A convenience `Result` type for Burrow operations.
pub type Result<T> = std::result::Result<T, BurrowError>;

/// Coarse classification of a [`BurrowError`].
///
/// Callers branch on the kind rather than on individual variants: a
/// `Validation` failure had no side effects, a `Durability` failure means the
/// write must not be assumed stored, and so on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed input rejected before any durable effect.
    Validation,
    /// WAL or file sync failed; the write was not acknowledged.
    Durability,
    /// Stored data failed a checksum or could not be decoded.
    Corruption,
    /// A memory or handle bound was hit and could not be relieved.
    ResourceExhaustion,
    /// A compaction cycle was abandoned.
    CompactionFailure,
    /// Any other I/O failure.
    Io,
}

/// The error type for storage engine operations.
#[derive(Debug, Error)]
pub enum BurrowError {
    /// A `key:value` tag string or tag field was malformed.
    #[error("Invalid tag: {0}")]
    InvalidTag(String),

    /// An operator name or numeric value is outside the closed set.
    #[error("Invalid operator: {0}")]
    InvalidOperator(String),

    /// A regex rule value does not compile.
    #[error("Invalid pattern {pattern:?}: {reason}")]
    InvalidPattern {
        /// The offending pattern.
        pattern: String,
        /// Compiler message.
        reason: String,
    },

    /// A series key could not be parsed.
    #[error("Invalid series key {key:?}: {reason}")]
    InvalidSeriesKey {
        /// The rejected key text.
        key: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A write used a different value type than the stream already holds.
    #[error("Field type conflict on {key}: stored {stored}, got {got}")]
    FieldTypeConflict {
        /// Stream key (`series#!~#field`).
        key: String,
        /// Type already stored for the stream.
        stored: ValueType,
        /// Type of the rejected write.
        got: ValueType,
    },

    /// Generic input validation failure.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The shard has been closed and no longer accepts operations.
    #[error("Shard is closed")]
    Closed,

    /// A sync to stable storage failed.
    #[error("Durability failure ({context}): {source}")]
    Durability {
        /// What was being synced.
        context: String,
        /// Underlying I/O failure.
        #[source]
        source: io::Error,
    },

    /// The WAL refused an append because a previous sync failed.
    #[error("WAL is poisoned by an earlier sync failure; reopen the shard")]
    WalPoisoned,

    /// Invalid magic bytes in a file or segment header.
    #[error("Invalid magic bytes: {0:?}")]
    InvalidMagic([u8; 4]),

    /// Unsupported on-disk format version.
    #[error("Unsupported version: {0}")]
    UnsupportedVersion(u16),

    /// Checksum does not match the stored value.
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Expected CRC32 checksum.
        expected: u32,
        /// Actual computed CRC32 checksum.
        actual: u32,
    },

    /// A block's stored type tag differs from the type the reader asked for.
    #[error("Type mismatch: expected {expected}, block holds tag {actual}")]
    TypeMismatch {
        /// Type requested by the caller.
        expected: ValueType,
        /// Raw tag byte found in the block.
        actual: u8,
    },

    /// A block or entry could not be decoded.
    #[error("Decode error: {0}")]
    Decode(String),

    /// Structural corruption in a named file.
    #[error("Corruption in {}: {reason}", path.display())]
    Corruption {
        /// Affected file or segment.
        path: PathBuf,
        /// What was wrong.
        reason: String,
    },

    /// The write cache cannot absorb a write even after flushing.
    #[error("Write cache full: {size} bytes would exceed limit of {limit}")]
    CacheFull {
        /// Cache size the write would have produced.
        size: usize,
        /// Configured hard limit.
        limit: usize,
    },

    /// A compaction cycle failed and its output was discarded.
    #[error("Compaction failed: {0}")]
    Compaction(String),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl BurrowError {
    /// Returns the taxonomy class of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            BurrowError::InvalidTag(_)
            | BurrowError::InvalidOperator(_)
            | BurrowError::InvalidPattern { .. }
            | BurrowError::InvalidSeriesKey { .. }
            | BurrowError::FieldTypeConflict { .. }
            | BurrowError::Validation(_)
            | BurrowError::Closed => ErrorKind::Validation,
            BurrowError::Durability { .. } | BurrowError::WalPoisoned => ErrorKind::Durability,
            BurrowError::InvalidMagic(_)
            | BurrowError::UnsupportedVersion(_)
            | BurrowError::ChecksumMismatch { .. }
            | BurrowError::TypeMismatch { .. }
            | BurrowError::Decode(_)
            | BurrowError::Corruption { .. } => ErrorKind::Corruption,
            BurrowError::CacheFull { .. } => ErrorKind::ResourceExhaustion,
            BurrowError::Compaction(_) => ErrorKind::CompactionFailure,
            BurrowError::IoError(_) => ErrorKind::Io,
        }
    }

    /// Returns true if the error indicates damaged stored data.
    pub fn is_corruption(&self) -> bool {
        self.kind() == ErrorKind::Corruption
    }

    pub(crate) fn durability(context: impl Into<String>, source: io::Error) -> Self {
        BurrowError::Durability {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn corruption(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        BurrowError::Corruption {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
