//! Safe sequence tracking for WAL retirement.
//!
//! A WAL entry may be retired once everything it wrote is in a published
//! TSM file. Data of unflushed cache snapshots, and of the live memtable,
//! still depends on the log, so the watermark stays below the lowest
//! sequence they hold.

use std::collections::BTreeMap;
use std::sync::RwLock;

/// Cache snapshot generation.
pub type Generation = u64;

#[derive(Debug, Default)]
struct SafeSequenceState {
    /// Unflushed snapshots and the lowest sequence each holds.
    pending_snapshots: BTreeMap<Generation, u64>,
    /// Highest sequence already handed to the WAL for retirement.
    retired: u64,
}

/// Tracks which WAL sequences are covered by published files.
///
/// # Examples
/// ```rust,ignore
/// use alopex_burrow::lifecycle::safe_seq::SafeSequenceTracker;
///
/// let tracker = SafeSequenceTracker::new();
/// tracker.notify_snapshot(7, 100);
/// assert_eq!(tracker.calculate_safe_sequence(None, 150), 99);
/// tracker.notify_flush(7);
/// assert_eq!(tracker.calculate_safe_sequence(None, 150), 150);
/// ```
#[derive(Debug, Default)]
pub struct SafeSequenceTracker {
    inner: RwLock<SafeSequenceState>,
}

impl SafeSequenceTracker {
    /// Creates a new tracker with empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a frozen snapshot whose data starts at `min_sequence`.
    pub fn notify_snapshot(&self, generation: Generation, min_sequence: u64) {
        let mut state = self.inner.write().unwrap_or_else(|err| err.into_inner());
        state.pending_snapshots.insert(generation, min_sequence);
    }

    /// Records that a snapshot's file has been published.
    pub fn notify_flush(&self, generation: Generation) {
        let mut state = self.inner.write().unwrap_or_else(|err| err.into_inner());
        state.pending_snapshots.remove(&generation);
    }

    /// Number of snapshots not yet flushed.
    pub fn pending_count(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(|err| err.into_inner())
            .pending_snapshots
            .len()
    }

    /// Calculates the highest sequence that may be retired.
    ///
    /// Formula: min(min(pending snapshot sequences) - 1, live_min - 1, last).
    /// Must be called while appends are excluded so `live_min` and
    /// `last_sequence` describe the same instant.
    pub fn calculate_safe_sequence(&self, live_min: Option<u64>, last_sequence: u64) -> u64 {
        let state = self.inner.read().unwrap_or_else(|err| err.into_inner());
        state
            .pending_snapshots
            .values()
            .copied()
            .chain(live_min)
            .map(|seq| seq.saturating_sub(1))
            .fold(last_sequence, u64::min)
    }

    /// Records a retirement; returns false if `sequence` is not past the
    /// previous one, in which case there is nothing new to retire.
    pub fn notify_retired(&self, sequence: u64) -> bool {
        let mut state = self.inner.write().unwrap_or_else(|err| err.into_inner());
        if sequence <= state.retired {
            return false;
        }
        state.retired = sequence;
        true
    }

    /// Highest sequence retired so far.
    pub fn retired_sequence(&self) -> u64 {
        self.inner
            .read()
            .unwrap_or_else(|err| err.into_inner())
            .retired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nothing_pending_retires_everything() {
        let tracker = SafeSequenceTracker::new();
        assert_eq!(tracker.calculate_safe_sequence(None, 120), 120);
    }

    #[test]
    fn test_pending_snapshot_holds_back() {
        let tracker = SafeSequenceTracker::new();
        tracker.notify_snapshot(1, 100);
        tracker.notify_snapshot(2, 150);
        assert_eq!(tracker.calculate_safe_sequence(None, 200), 99);
        tracker.notify_flush(1);
        assert_eq!(tracker.calculate_safe_sequence(None, 200), 149);
        tracker.notify_flush(2);
        assert_eq!(tracker.pending_count(), 0);
    }

    #[test]
    fn test_live_memtable_holds_back() {
        let tracker = SafeSequenceTracker::new();
        tracker.notify_snapshot(1, 100);
        assert_eq!(tracker.calculate_safe_sequence(Some(90), 200), 89);
        assert_eq!(tracker.calculate_safe_sequence(Some(1), 200), 0);
    }

    #[test]
    fn test_retired_is_monotonic() {
        let tracker = SafeSequenceTracker::new();
        assert!(tracker.notify_retired(10));
        assert!(!tracker.notify_retired(10));
        assert!(!tracker.notify_retired(5));
        assert_eq!(tracker.retired_sequence(), 10);
    }
}
