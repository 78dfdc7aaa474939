//! In-line reclamation
//!
//! A Reclaim command runs the store's reclamation pass on the consumer
//! thread. The pass calls back through [`QueueDrain`] so queued commands keep
//! flowing; while it runs, a second Reclaim is skipped, a Backup is deferred
//! until the pass ends and a Clear is acknowledged without effect.

use std::path::{Path, PathBuf};

use crate::error::{QueueError, Result, StoreError};
use crate::store::{ReclaimOutcome, Store, TaskDrain};

use super::command::ReclaimThresholds;
use super::ring::SlotRing;
use super::stats::QueueStats;
use super::writer::Queue;

/// State the consumer loop carries between commands
#[derive(Debug, Default)]
pub(crate) struct ConsumerState {
    /// Backup requested while a pass was running
    pending_backup: Option<PathBuf>,

    /// Thresholds of the most recent pass
    thresholds: ReclaimThresholds,
}

impl ConsumerState {
    pub(crate) fn defer_backup(&mut self, dir: PathBuf, stats: &QueueStats) {
        if let Some(previous) = self.pending_backup.replace(dir) {
            tracing::warn!(
                "Deferred backup to {} superseded by a newer request",
                previous.display()
            );
        }
        stats.record_backup_deferred();
        tracing::info!("Backup deferred until reclamation completes");
    }
}

/// The queue's drain entry point, handed to the store for one pass
struct QueueDrain<'a, R: SlotRing> {
    queue: &'a Queue<R>,
    store: &'a dyn Store,
    state: &'a mut ConsumerState,
    /// Lock failure seen while draining; ends the consumer after the pass
    fatal: Option<String>,
}

impl<R: SlotRing> TaskDrain for QueueDrain<'_, R> {
    fn drain(&mut self, max_tasks: usize) -> Result<usize> {
        if let Some(reason) = &self.fatal {
            return Err(QueueError::Lock(reason.clone()));
        }
        match self.queue.drain(self.store, self.state, max_tasks) {
            Err(QueueError::Lock(reason)) => {
                self.fatal = Some(reason.clone());
                Err(QueueError::Lock(reason))
            }
            other => other,
        }
    }
}

impl<R: SlotRing> Queue<R> {
    /// Run one pass, then any backup deferred during it
    pub(crate) fn run_reclamation(
        &self,
        store: &dyn Store,
        state: &mut ConsumerState,
        thresholds: ReclaimThresholds,
    ) -> Result<()> {
        state.thresholds = thresholds;
        tracing::info!("Reclamation started: {:?}", state.thresholds);

        let (outcome, fatal) = {
            let mut drain = QueueDrain {
                queue: self,
                store,
                state: &mut *state,
                fatal: None,
            };
            let outcome = store.reclaim(&thresholds, &mut drain);
            (outcome, drain.fatal)
        };

        self.ring().header().set_reclaim_active(false);
        self.queue_stats().record_reclaim_pass();

        match outcome {
            Ok(ReclaimOutcome::Completed(stats)) => tracing::info!(
                "Reclamation completed: evicted {}, copied {}, drained {}, {} -> {} bytes",
                stats.entries_evicted,
                stats.records_copied,
                stats.tasks_drained,
                stats.bytes_before,
                stats.bytes_after
            ),
            Ok(ReclaimOutcome::Skipped) => {
                tracing::info!("Reclamation skipped: nothing above thresholds")
            }
            Err(StoreError::Aborted(reason)) => {
                tracing::info!("Reclamation aborted: {}", reason)
            }
            Err(e) => tracing::warn!("Reclamation failed: {}", e),
        }

        if let Some(dir) = state.pending_backup.take() {
            export_backup(store, &dir);
        }

        match fatal {
            Some(reason) => Err(QueueError::Lock(reason)),
            None => Ok(()),
        }
    }
}

fn export_backup(store: &dyn Store, dir: &Path) {
    match store.snapshot_export(dir) {
        Ok(()) => tracing::info!("Deferred backup written to {}", dir.display()),
        Err(e) => tracing::warn!("Deferred backup to {} failed: {}", dir.display(), e),
    }
}
