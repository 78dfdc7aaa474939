//! Slot ring abstraction
//!
//! The leasing and dispatch algorithm in `writer.rs` is written once against
//! [`SlotRing`] / [`SlotAccess`]. The in-process ring keeps its slots on the
//! heap behind `parking_lot` primitives; the shared-memory ring keeps them in a
//! mapped file behind timed spin locks. Both keep their indices and flags in a
//! [`RingHeader`].

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::Duration;

use crate::config::QueueMode;
use crate::error::Result;

use super::command::{Command, CommandKind};

/// "SLOTRING" little-endian
pub(crate) const RING_MAGIC: u64 = u64::from_le_bytes(*b"SLOTRING");

/// Bumped whenever the shared layout changes
pub(crate) const RING_VERSION: u32 = 1;

/// Indices and flags shared by every party using a ring
///
/// In shared-memory mode this struct is the first bytes of the mapped file,
/// so every field is an atomic and the layout is fixed.
#[repr(C)]
#[derive(Debug)]
pub(crate) struct RingHeader {
    pub magic: AtomicU64,
    pub version: AtomicU32,
    pub capacity: AtomicU32,
    pub key_capacity: AtomicU32,
    pub value_capacity: AtomicU32,
    /// Next ticket handed to a producer
    pub produced: AtomicU64,
    /// Next ticket the consumer processes
    pub consumed: AtomicU64,
    pub writer_pid: AtomicU32,
    /// Single-byte reclamation flag
    pub reclaim_active: AtomicU8,
    pub writer_active: AtomicU8,
    _reserved: [u8; 2],
}

impl RingHeader {
    /// A header for a process-private ring
    pub fn new(capacity: u32, key_capacity: u32, value_capacity: u32) -> Self {
        Self {
            magic: AtomicU64::new(RING_MAGIC),
            version: AtomicU32::new(RING_VERSION),
            capacity: AtomicU32::new(capacity),
            key_capacity: AtomicU32::new(key_capacity),
            value_capacity: AtomicU32::new(value_capacity),
            produced: AtomicU64::new(0),
            consumed: AtomicU64::new(0),
            writer_pid: AtomicU32::new(0),
            reclaim_active: AtomicU8::new(0),
            writer_active: AtomicU8::new(0),
            _reserved: [0; 2],
        }
    }

    /// Hand out the next ticket
    ///
    /// `produced` and `writer_active` are SeqCst: a producer that takes a
    /// ticket and then finds the writer active is always seen by a consumer
    /// that reads `produced` after the stop was requested.
    pub fn next_ticket(&self) -> u64 {
        self.produced.fetch_add(1, Ordering::SeqCst)
    }

    pub fn produced(&self) -> u64 {
        self.produced.load(Ordering::SeqCst)
    }

    pub fn consumed(&self) -> u64 {
        self.consumed.load(Ordering::Acquire)
    }

    /// Only the consumer moves this index
    pub fn set_consumed(&self, ticket: u64) {
        self.consumed.store(ticket, Ordering::Release);
    }

    pub fn reclaim_active(&self) -> bool {
        self.reclaim_active.load(Ordering::Acquire) != 0
    }

    pub fn set_reclaim_active(&self, active: bool) {
        self.reclaim_active.store(active as u8, Ordering::Release);
    }

    pub fn writer_active(&self) -> bool {
        self.writer_active.load(Ordering::SeqCst) != 0
    }

    pub fn set_writer_active(&self, active: bool, pid: u32) {
        if active {
            self.writer_pid.store(pid, Ordering::Release);
        }
        self.writer_active.store(active as u8, Ordering::SeqCst);
    }

    /// Outstanding tickets or a running reclamation pass
    pub fn is_busy(&self) -> bool {
        self.produced() != self.consumed() || self.reclaim_active()
    }
}

/// Storage for a fixed number of slots plus their header
pub(crate) trait SlotRing: Send + Sync + 'static {
    /// A locked slot; dropping it unlocks
    type Slot<'a>: SlotAccess
    where
        Self: 'a;

    fn header(&self) -> &RingHeader;

    fn capacity(&self) -> u64;

    fn mode(&self) -> QueueMode;

    /// Lock the slot backing `ticket`. `None` means the lock could not be
    /// taken before the recovery deadline (shared-memory mode only).
    fn lock(&self, ticket: u64) -> Option<Self::Slot<'_>>;

    /// Forcibly reinitialize the slot lock for `ticket`, returning the
    /// previous holder's pid when known
    fn reset_lock(&self, ticket: u64) -> u32;

    /// Read the slot's in-use flag without taking its lock
    fn peek_in_use(&self, ticket: u64) -> bool;

    /// Bound on a single condition wait; `None` waits until signalled
    fn wait_timeout(&self) -> Option<Duration>;

    /// Reject commands whose payload cannot be stored in a slot
    fn check_fits(&self, command: &Command) -> Result<()>;

    /// Signal every slot so all blocked parties re-check their state
    fn wake_all(&self);
}

/// Operations on a locked slot
pub(crate) trait SlotAccess {
    fn in_use(&self) -> bool;

    fn kind(&self) -> CommandKind;

    /// Release the lock, wait for a signal, reacquire
    fn wait(&mut self, timeout: Option<Duration>) -> Wake;

    /// Store a command's payload; the slot stays invisible until `publish`
    fn fill(&mut self, command: Command) -> Result<()>;

    /// Mark in use and signal
    fn publish(&mut self);

    /// Move the command out for dispatch
    fn take(&mut self) -> Command;

    /// Clear the payload, mark free and signal
    fn release(&mut self);
}

/// How a slot wait ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Wake {
    /// `false` when the timeout elapsed without a signal
    pub signalled: bool,
    /// Pid of a holder whose lock had to be taken over to reacquire
    pub took_over: Option<u32>,
}

impl Wake {
    pub fn signalled(signalled: bool) -> Self {
        Self {
            signalled,
            took_over: None,
        }
    }
}

/// Physical slot index for a ticket
#[inline]
pub(crate) fn slot_index(ticket: u64, capacity: u64) -> usize {
    (ticket % capacity) as usize
}
