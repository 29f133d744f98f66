//! Lifecycle management: compaction, WAL retirement and the background worker.

pub mod compaction;
pub mod safe_seq;
pub mod worker;

pub use compaction::{
    CompactionConfig, CompactionOutcome, CompactionPlan, CompactionPlanner, CompactionStats,
    Compactor, CompactorState, LevelConfig,
};
pub use safe_seq::SafeSequenceTracker;
pub use worker::{CompactionWorker, Trigger, TriggerHandle};
