//! Leasing, dispatch and the consumer loop
//!
//! ## Slot lifecycle
//! ```text
//!  producer                               consumer
//!  ────────                               ────────
//!  ticket = produced++                    lock slot[consumed % N]
//!  lock slot[ticket % N]                  wait until in_use (or stop)
//!  wait while in_use                      take command
//!  fill payload, in_use = true, signal    apply to store
//!  unlock                                 clear, in_use = false, consumed++
//!                                         signal, unlock
//! ```
//!
//! Producers only ever block on their own slot, so `produced - consumed`
//! never exceeds the ring capacity.
//!
//! ## Stopping
//! A producer checks for a stop after taking its ticket, with the slot
//! locked, and publishes in the same critical section. Once the consumer
//! has seen the stop, an unpublished slot therefore never receives a real
//! command: the consumer skips it and exits when `consumed == produced`, so
//! every enqueue that returned `Ok` is applied.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::QueueMode;
use crate::error::{QueueError, Result};
use crate::store::Store;

use super::command::{Command, CommandKind, ReclaimThresholds};
use super::reclaim::ConsumerState;
use super::ring::{RingHeader, SlotAccess, SlotRing, Wake};
use super::stats::{QueueStats, QueueStatsSnapshot};
use super::{CommandQueue, RingPosition, WriterQueue};

/// The leasing and dispatch algorithm over either ring variant
pub(crate) struct Queue<R: SlotRing> {
    ring: R,
    stopping: AtomicBool,
    stats: QueueStats,
    pid: u32,
}

/// A leased, locked slot. Dropped unresolved, it publishes `None` so the
/// ticket still gets consumed.
struct Lease<S: SlotAccess> {
    slot: S,
    /// Published, or given up because the queue closed; a stopping consumer
    /// skips unpublished tickets itself
    resolved: bool,
}

impl<S: SlotAccess> Lease<S> {
    fn publish(&mut self, command: Command) -> Result<()> {
        self.slot.fill(command)?;
        self.slot.publish();
        self.resolved = true;
        Ok(())
    }

    fn close(mut self) -> QueueError {
        self.resolved = true;
        QueueError::Closed
    }
}

impl<S: SlotAccess> Drop for Lease<S> {
    fn drop(&mut self) {
        // A slot still holding an older ticket's command is not ours to touch
        if !self.resolved && !self.slot.in_use() && self.slot.fill(Command::None).is_ok() {
            self.slot.publish();
        }
    }
}

/// A dequeued slot; dropping it releases the slot and advances the consumer
struct Consumed<'q, S: SlotAccess> {
    slot: S,
    header: &'q RingHeader,
    ticket: u64,
}

impl<S: SlotAccess> Drop for Consumed<'_, S> {
    fn drop(&mut self) {
        self.slot.release();
        self.header.set_consumed(self.ticket + 1);
    }
}

/// What the consumer loop does after applying a command
pub(crate) enum Step {
    Continue,
    Reclaim(ReclaimThresholds),
}

impl<R: SlotRing> Queue<R> {
    pub fn new(ring: R) -> Self {
        Self {
            ring,
            stopping: AtomicBool::new(false),
            stats: QueueStats::default(),
            pid: std::process::id(),
        }
    }

    pub fn ring(&self) -> &R {
        &self.ring
    }

    pub(crate) fn queue_stats(&self) -> &QueueStats {
        &self.stats
    }

    fn header(&self) -> &RingHeader {
        self.ring.header()
    }

    pub fn stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Producers see the queue closed once this handle stopped or, for a
    /// shared ring, once no writer is attached
    pub fn is_closed(&self) -> bool {
        self.stopping() || !self.header().writer_active()
    }

    // =========================================================================
    // Producer Side
    // =========================================================================

    /// Take a ticket and wait for its slot to come free
    fn lease(&self) -> Result<Lease<R::Slot<'_>>> {
        if self.is_closed() {
            return Err(QueueError::Closed);
        }

        let ticket = self.header().next_ticket();
        let slot = self.lock_or_reset(ticket)?;
        let mut lease = Lease {
            slot,
            resolved: false,
        };

        while lease.slot.in_use() {
            if self.is_closed() {
                return Err(lease.close());
            }
            self.wait_on(&mut lease.slot);
        }

        // Checked with the slot locked; publishing happens under the same lock
        if self.is_closed() {
            return Err(lease.close());
        }
        Ok(lease)
    }

    fn publish(&self, command: Command) -> Result<()> {
        self.ring.check_fits(&command)?;
        let kind = command.kind();
        let mut lease = self.lease()?;
        lease.publish(command)?;
        self.stats.record_enqueued();
        tracing::trace!("Enqueued {:?}", kind);
        Ok(())
    }

    // =========================================================================
    // Consumer Side
    // =========================================================================

    /// Lock a slot, reinitializing a lock whose holder timed out
    fn lock_or_reset(&self, ticket: u64) -> Result<R::Slot<'_>> {
        if let Some(slot) = self.ring.lock(ticket) {
            return Ok(slot);
        }
        self.reset_slot_lock(ticket);
        self.ring.lock(ticket).ok_or_else(|| {
            QueueError::Lock(format!(
                "slot for ticket {} could not be locked after reset",
                ticket
            ))
        })
    }

    fn reset_slot_lock(&self, ticket: u64) {
        let holder = self.ring.reset_lock(ticket);
        self.stats.record_lock_reset();
        tracing::warn!(
            "Slot lock for ticket {} timed out (holder pid {}), reinitialized",
            ticket,
            holder
        );
    }

    /// Wait on a locked slot, counting a lock taken over on the way back
    fn wait_on(&self, slot: &mut R::Slot<'_>) -> Wake {
        let wake = slot.wait(self.ring.wait_timeout());
        if let Some(holder) = wake.took_over {
            self.stats.record_lock_reset();
            tracing::warn!(
                "Slot lock held by pid {} past timeout while waiting, taken over",
                holder
            );
        }
        wake
    }

    /// Move `consumed` past tickets whose producers never published
    ///
    /// Stops at the first published slot; after a full lap without one the
    /// index realigns with `produced`.
    fn recover_abandoned(&self, from: u64) {
        let header = self.header();
        let produced = header.produced();
        let capacity = self.ring.capacity();

        let mut next = from;
        let mut scanned = 0u64;
        while next < produced {
            if self.ring.peek_in_use(next) {
                break;
            }
            scanned += 1;
            if scanned > capacity {
                next = produced;
                break;
            }
            next += 1;
        }

        if next != from {
            header.set_consumed(next);
            self.stats.record_recovered(next - from);
            tracing::warn!(
                "Skipped {} abandoned ticket(s): consumed {} -> {} (produced {})",
                next - from,
                from,
                next,
                produced
            );
        }
    }

    /// Body of the consumer thread
    fn consumer_main(&self, store: &dyn Store) -> Result<()> {
        let header = self.header();
        header.set_reclaim_active(false);
        let _close = CloseOnExit(self);

        tracing::info!(
            "Async writer started ({:?}, capacity={}, produced={}, consumed={})",
            self.ring.mode(),
            self.ring.capacity(),
            header.produced(),
            header.consumed()
        );

        let mut state = ConsumerState::default();
        let result = self.consume(store, &mut state);

        match &result {
            Ok(()) => tracing::info!("Async writer exiting"),
            Err(e) => tracing::error!("Async writer exiting on fatal error: {}", e),
        }
        result
    }

    fn consume(&self, store: &dyn Store, state: &mut ConsumerState) -> Result<()> {
        let header = self.header();
        loop {
            let ticket = header.consumed();

            let mut lock_timed_out = false;
            let mut slot = match self.ring.lock(ticket) {
                Some(slot) => slot,
                None => {
                    self.reset_slot_lock(ticket);
                    lock_timed_out = true;
                    self.ring.lock(ticket).ok_or_else(|| {
                        QueueError::Lock(format!(
                            "consumer could not lock slot for ticket {} after reset",
                            ticket
                        ))
                    })?
                }
            };

            if !slot.in_use() {
                // The holder that timed out was this ticket's producer
                if lock_timed_out && header.produced() > ticket {
                    drop(slot);
                    self.recover_abandoned(ticket);
                    continue;
                }
                if self.stopping() {
                    if header.produced() == ticket {
                        return Ok(());
                    }
                    // Its producer fails with Closed once it gets the lock
                    tracing::debug!("Skipping ticket {} left unpublished at stop", ticket);
                    header.set_consumed(ticket + 1);
                    continue;
                }

                let wake = self.wait_on(&mut slot);
                if !slot.in_use() {
                    drop(slot);
                    if !wake.signalled && !self.stopping() && header.produced() > ticket {
                        self.recover_abandoned(ticket);
                    }
                    continue;
                }
            }

            let command = slot.take();
            let consumed = Consumed {
                slot,
                header,
                ticket,
            };
            match self.apply(store, state, command, false) {
                Step::Continue => drop(consumed),
                Step::Reclaim(thresholds) => {
                    header.set_reclaim_active(true);
                    drop(consumed);
                    self.run_reclamation(store, state, thresholds)?;
                }
            }
        }
    }

    /// Apply up to `max` queued commands from inside a reclamation pass
    ///
    /// Returns early at the first ticket not yet published, and at a Remove
    /// when the store cannot delete while a pass runs.
    pub(crate) fn drain(
        &self,
        store: &dyn Store,
        state: &mut ConsumerState,
        max: usize,
    ) -> Result<usize> {
        let header = self.header();
        let mut applied = 0;

        while applied < max {
            if self.stopping() {
                return Err(QueueError::Closed);
            }

            let ticket = header.consumed();
            let slot = self.lock_or_reset(ticket)?;
            if !slot.in_use() {
                break;
            }
            if slot.kind() == CommandKind::Remove && !store.supports_remove_during_reclaim() {
                tracing::debug!("Holding remove at ticket {} until reclamation ends", ticket);
                break;
            }

            let mut consumed = Consumed {
                slot,
                header,
                ticket,
            };
            let command = consumed.slot.take();
            self.apply(store, state, command, true);
            drop(consumed);
            applied += 1;
        }
        Ok(applied)
    }

    /// Dispatch one command to the store
    pub(crate) fn apply(
        &self,
        store: &dyn Store,
        state: &mut ConsumerState,
        command: Command,
        reclaiming: bool,
    ) -> Step {
        let kind = command.kind();
        let result = match command {
            Command::None => Ok(()),
            Command::Add {
                key,
                value,
                overwrite,
            } => store.insert(&key, &value, overwrite).map_err(QueueError::from),
            Command::Remove { key } => store.delete(&key).map_err(QueueError::from),
            Command::RemoveAll if reclaiming => {
                tracing::debug!("Clear acknowledged without effect during reclamation");
                Ok(())
            }
            Command::RemoveAll => store.clear().map_err(QueueError::from),
            Command::Reclaim(_) if reclaiming => Err(QueueError::ReclaimSkipped),
            Command::Reclaim(thresholds) => return Step::Reclaim(thresholds),
            Command::Backup { dir } if reclaiming => {
                state.defer_backup(dir, &self.stats);
                Ok(())
            }
            Command::Backup { dir } => store.snapshot_export(&dir).map_err(QueueError::from),
        };
        self.record_outcome(kind, result);
        Step::Continue
    }

    fn record_outcome(&self, kind: CommandKind, result: Result<()>) {
        match result {
            Ok(()) => self.stats.record_applied(),
            Err(QueueError::ReclaimSkipped) => {
                self.stats.record_reclaim_skipped();
                tracing::info!("Reclaim request skipped: a pass is already running");
            }
            Err(QueueError::Store(e)) if e.is_expected() => {
                self.stats.record_failed();
                tracing::debug!("{:?} not applied: {}", kind, e);
            }
            Err(e) => {
                self.stats.record_failed();
                tracing::warn!("{:?} failed: {}", kind, e);
            }
        }
    }
}

/// Closes the queue when the consumer returns or unwinds
struct CloseOnExit<'q, R: SlotRing>(&'q Queue<R>);

impl<R: SlotRing> Drop for CloseOnExit<'_, R> {
    fn drop(&mut self) {
        self.0.request_stop();
    }
}

impl<R: SlotRing> CommandQueue for Queue<R> {
    fn enqueue(&self, command: Command) -> Result<()> {
        self.publish(command)
    }

    fn is_busy(&self) -> bool {
        self.header().is_busy()
    }

    fn mode(&self) -> QueueMode {
        self.ring.mode()
    }

    fn stats(&self) -> QueueStatsSnapshot {
        self.stats.snapshot()
    }

    fn position(&self) -> RingPosition {
        let header = self.header();
        RingPosition {
            produced: header.produced(),
            consumed: header.consumed(),
        }
    }
}

impl<R: SlotRing> WriterQueue for Queue<R> {
    fn activate(&self) {
        self.stopping.store(false, Ordering::SeqCst);
        self.header().set_writer_active(true, self.pid);
    }

    fn run_consumer(&self, store: &dyn Store) -> Result<()> {
        self.consumer_main(store)
    }

    fn request_stop(&self) {
        // Cleared before `stopping` so a consumer that sees the stop also
        // has producers in other processes seeing it
        self.header().set_writer_active(false, self.pid);
        self.stopping.store(true, Ordering::SeqCst);
        self.ring.wake_all();
    }
}
