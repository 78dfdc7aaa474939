//! In-process slot ring
//!
//! Slots live on the heap; each owns a `parking_lot` mutex guarding its
//! payload and a condition variable. Waits are unbounded since no other
//! process can abandon one of these locks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::config::QueueMode;
use crate::error::Result;

use super::command::{Command, CommandKind};
use super::ring::{slot_index, RingHeader, SlotAccess, SlotRing, Wake};

struct HeapSlot {
    in_use: AtomicBool,
    command: Mutex<Option<Command>>,
    cond: Condvar,
}

impl HeapSlot {
    fn new() -> Self {
        Self {
            in_use: AtomicBool::new(false),
            command: Mutex::new(None),
            cond: Condvar::new(),
        }
    }
}

/// Heap-allocated ring private to one process
pub(crate) struct HeapRing {
    header: RingHeader,
    slots: Box<[HeapSlot]>,
}

impl HeapRing {
    pub fn new(capacity: u32) -> Self {
        let slots = (0..capacity).map(|_| HeapSlot::new()).collect();
        Self {
            header: RingHeader::new(capacity, 0, 0),
            slots,
        }
    }

    fn slot(&self, ticket: u64) -> &HeapSlot {
        &self.slots[slot_index(ticket, self.capacity())]
    }
}

impl SlotRing for HeapRing {
    type Slot<'a> = HeapSlotGuard<'a>;

    fn header(&self) -> &RingHeader {
        &self.header
    }

    fn capacity(&self) -> u64 {
        self.slots.len() as u64
    }

    fn mode(&self) -> QueueMode {
        QueueMode::InProcess
    }

    fn lock(&self, ticket: u64) -> Option<HeapSlotGuard<'_>> {
        let slot = self.slot(ticket);
        Some(HeapSlotGuard {
            slot,
            command: slot.command.lock(),
        })
    }

    fn reset_lock(&self, _ticket: u64) -> u32 {
        0
    }

    fn peek_in_use(&self, ticket: u64) -> bool {
        self.slot(ticket).in_use.load(Ordering::Acquire)
    }

    fn wait_timeout(&self) -> Option<Duration> {
        None
    }

    fn check_fits(&self, _command: &Command) -> Result<()> {
        Ok(())
    }

    fn wake_all(&self) {
        for slot in self.slots.iter() {
            // Taking the mutex orders the wakeup after any waiter's predicate check
            let _guard = slot.command.lock();
            slot.cond.notify_all();
        }
    }
}

/// A locked heap slot
pub(crate) struct HeapSlotGuard<'a> {
    slot: &'a HeapSlot,
    command: MutexGuard<'a, Option<Command>>,
}

impl SlotAccess for HeapSlotGuard<'_> {
    fn in_use(&self) -> bool {
        self.slot.in_use.load(Ordering::Acquire)
    }

    fn kind(&self) -> CommandKind {
        self.command
            .as_ref()
            .map(Command::kind)
            .unwrap_or(CommandKind::None)
    }

    fn wait(&mut self, timeout: Option<Duration>) -> Wake {
        match timeout {
            Some(timeout) => Wake::signalled(
                !self.slot.cond.wait_for(&mut self.command, timeout).timed_out(),
            ),
            None => {
                self.slot.cond.wait(&mut self.command);
                Wake::signalled(true)
            }
        }
    }

    fn fill(&mut self, command: Command) -> Result<()> {
        *self.command = Some(command);
        Ok(())
    }

    fn publish(&mut self) {
        self.slot.in_use.store(true, Ordering::Release);
        // Both the consumer and a producer N tickets ahead may be parked here
        self.slot.cond.notify_all();
    }

    fn take(&mut self) -> Command {
        self.command.take().unwrap_or(Command::None)
    }

    fn release(&mut self) {
        *self.command = None;
        self.slot.in_use.store(false, Ordering::Release);
        self.slot.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticket_maps_modulo_capacity() {
        let ring = HeapRing::new(4);
        {
            let mut slot = ring.lock(1).unwrap();
            slot.fill(Command::RemoveAll).unwrap();
            slot.publish();
        }
        assert!(ring.peek_in_use(1));
        assert!(ring.peek_in_use(5));
        assert!(!ring.peek_in_use(2));
    }

    #[test]
    fn test_release_clears_payload() {
        let ring = HeapRing::new(2);
        let mut slot = ring.lock(0).unwrap();
        slot.fill(Command::add(b"k", b"v", true).unwrap()).unwrap();
        slot.publish();
        assert_eq!(slot.kind(), CommandKind::Add);

        let command = slot.take();
        assert_eq!(command.kind(), CommandKind::Add);
        slot.release();

        assert!(!slot.in_use());
        assert_eq!(slot.kind(), CommandKind::None);
    }

    #[test]
    fn test_timed_wait_expires() {
        let ring = HeapRing::new(1);
        let mut slot = ring.lock(0).unwrap();
        assert!(!slot.wait(Some(Duration::from_millis(10))).signalled);
    }
}
