//! Queue counters

use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters updated by producers and the consumer
#[derive(Debug, Default)]
pub struct QueueStats {
    enqueued: AtomicU64,
    applied: AtomicU64,
    failed: AtomicU64,
    reclaim_passes: AtomicU64,
    reclaims_skipped: AtomicU64,
    backups_deferred: AtomicU64,
    lock_resets: AtomicU64,
    tickets_recovered: AtomicU64,
}

/// Point-in-time copy of [`QueueStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStatsSnapshot {
    /// Commands published by producers in this process
    pub enqueued: u64,
    /// Commands the store accepted
    pub applied: u64,
    /// Commands the store rejected
    pub failed: u64,
    pub reclaim_passes: u64,
    /// Reclaim commands that arrived while a pass was running
    pub reclaims_skipped: u64,
    pub backups_deferred: u64,
    /// Slot locks reinitialized after a holder timed out
    pub lock_resets: u64,
    /// Tickets skipped because their producer never published
    pub tickets_recovered: u64,
}

impl QueueStats {
    pub(crate) fn record_enqueued(&self) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_applied(&self) {
        self.applied.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reclaim_pass(&self) {
        self.reclaim_passes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reclaim_skipped(&self) {
        self.reclaims_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_backup_deferred(&self) {
        self.backups_deferred.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_lock_reset(&self) {
        self.lock_resets.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_recovered(&self, tickets: u64) {
        self.tickets_recovered.fetch_add(tickets, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> QueueStatsSnapshot {
        QueueStatsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            reclaim_passes: self.reclaim_passes.load(Ordering::Relaxed),
            reclaims_skipped: self.reclaims_skipped.load(Ordering::Relaxed),
            backups_deferred: self.backups_deferred.load(Ordering::Relaxed),
            lock_resets: self.lock_resets.load(Ordering::Relaxed),
            tickets_recovered: self.tickets_recovered.load(Ordering::Relaxed),
        }
    }
}
