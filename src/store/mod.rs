//! Storage collaborator
//!
//! The queue applies commands through the [`Store`] trait and hands a
//! [`TaskDrain`] to reclamation so queued work keeps moving during a pass.
//! [`LogStore`] is the log-structured implementation shipped with the crate.

pub mod log_store;
pub mod record;
pub mod snapshot;

use std::path::Path;

use crate::error::StoreError;
use crate::queue::ReclaimThresholds;

pub use log_store::{LogStats, LogStore};
pub use record::Record;
pub use snapshot::{read_snapshot, SnapshotWriter};

/// Mutations the consumer loop applies
///
/// Implementations are called from exactly one thread at a time in
/// asynchronous mode, but `reclaim` re-enters the other methods on the same
/// thread through the drain callback, so no internal lock may be held across
/// a `drain` call.
pub trait Store: Send + Sync {
    fn insert(&self, key: &[u8], value: &[u8], overwrite: bool) -> Result<(), StoreError>;

    fn delete(&self, key: &[u8]) -> Result<(), StoreError>;

    fn clear(&self) -> Result<(), StoreError>;

    /// Write a consistent copy of the live data into `target_dir`
    fn snapshot_export(&self, target_dir: &Path) -> Result<(), StoreError>;

    /// Compact toward `thresholds`, calling `drain` between batches
    fn reclaim(
        &self,
        thresholds: &ReclaimThresholds,
        drain: &mut dyn TaskDrain,
    ) -> Result<ReclaimOutcome, StoreError>;

    /// Whether `delete` may run from a drain while `reclaim` is in progress.
    /// When `false` the queue holds a Remove until the pass ends.
    fn supports_remove_during_reclaim(&self) -> bool {
        false
    }
}

/// Callback into the queue from inside a reclamation pass
pub trait TaskDrain {
    /// Apply up to `max_tasks` queued commands, returning how many ran.
    /// `Err(Closed)` means shutdown was requested and the pass should stop
    /// draining.
    fn drain(&mut self, max_tasks: usize) -> crate::Result<usize>;
}

/// A drain that never runs anything, for synchronous callers
#[derive(Debug, Default)]
pub struct NoDrain;

impl TaskDrain for NoDrain {
    fn drain(&mut self, _max_tasks: usize) -> crate::Result<usize> {
        Ok(0)
    }
}

/// How a reclamation pass ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimOutcome {
    Completed(ReclaimStats),

    /// Nothing worth reclaiming under the given thresholds
    Skipped,
}

/// Work done by one reclamation pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReclaimStats {
    /// Live entries removed to honour size or count limits
    pub entries_evicted: u64,

    /// Records carried into the compacted log
    pub records_copied: u64,

    /// Commands applied through the drain during the pass
    pub tasks_drained: u64,

    pub bytes_before: u64,
    pub bytes_after: u64,
}
