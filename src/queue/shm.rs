//! Shared-memory slot ring
//!
//! The ring lives in a memory-mapped file so producer processes and the
//! writer process see the same header and slots.
//!
//! ## File Layout
//! ```text
//! ┌──────────────────────────────┐ 0
//! │ RingHeader (48 bytes)        │
//! │ ... padding ...              │
//! ├──────────────────────────────┤ 4096 (page aligned)
//! │ Slot 0                       │
//! │ ┌──────────────┬─────┬─────┐ │
//! │ │ SlotHeader   │ key │value│ │
//! │ │ (32 bytes)   │     │     │ │
//! │ └──────────────┴─────┴─────┘ │
//! │ Slot 1 ... Slot N-1          │
//! └──────────────────────────────┘
//! ```
//!
//! Slot locks are 64-bit words in the mapping: 0 when free, otherwise a
//! token unique to one acquisition (holder pid in the high half, a
//! per-process counter in the low half). They are taken with a bounded spin
//! so a holder that died can be detected by timeout and its lock
//! reinitialized. Condition signalling is a per-slot sequence counter that
//! waiters poll.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::io::Read;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::utils::Backoff;
use memmap2::MmapMut;

use crate::config::{Config, QueueMode};
use crate::error::{QueueError, Result};

use super::command::{Command, CommandKind, ReclaimThresholds};
use super::ring::{
    slot_index, RingHeader, SlotAccess, SlotRing, Wake, RING_MAGIC, RING_VERSION,
};

/// Size of the header region; the ring starts on the next page
const HEADER_REGION: usize = 4096;

/// Sleep between polls once spinning gives up
const POLL_INTERVAL: Duration = Duration::from_micros(200);

/// Low half of the lock tokens handed out by this process
static NEXT_ACQUISITION: AtomicU32 = AtomicU32::new(0);

#[repr(C)]
struct ShmSlotHeader {
    lock: AtomicU64,
    in_use: AtomicU32,
    signal: AtomicU32,
    kind: AtomicU32,
    overwrite: AtomicU32,
    key_len: AtomicU32,
    value_len: AtomicU32,
}

fn lock_token(pid: u32) -> u64 {
    let acquisition = NEXT_ACQUISITION.fetch_add(1, Ordering::Relaxed);
    (u64::from(pid) << 32) | u64::from(acquisition)
}

fn token_pid(token: u64) -> u32 {
    (token >> 32) as u32
}

/// Ring dimensions fixed when the file is created
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RingGeometry {
    pub capacity: u32,
    pub key_capacity: u32,
    pub value_capacity: u32,
}

impl RingGeometry {
    pub fn from_config(config: &Config) -> Self {
        Self {
            capacity: config.queue_capacity,
            key_capacity: config.shm_key_capacity,
            value_capacity: config.shm_value_capacity,
        }
    }

    fn stride(&self) -> usize {
        let raw = std::mem::size_of::<ShmSlotHeader>()
            + self.key_capacity as usize
            + self.value_capacity as usize;
        (raw + 7) & !7
    }

    fn file_len(&self) -> usize {
        HEADER_REGION + self.capacity as usize * self.stride()
    }

    fn read(header: &RingHeader) -> Self {
        Self {
            capacity: header.capacity.load(Ordering::Acquire),
            key_capacity: header.key_capacity.load(Ordering::Acquire),
            value_capacity: header.value_capacity.load(Ordering::Acquire),
        }
    }
}

/// Slot ring inside a memory-mapped file
pub(crate) struct ShmRing {
    path: PathBuf,
    /// Keeps the mapping alive; `base` points into it
    _map: MmapMut,
    _file: File,
    base: *mut u8,
    geometry: RingGeometry,
    stride: usize,
    lock_timeout: Duration,
    pid: u32,
}

// SAFETY: the mapped region holds only atomics and byte buffers that are
// touched while the owning slot lock is held.
unsafe impl Send for ShmRing {}
unsafe impl Sync for ShmRing {}

impl ShmRing {
    /// Create the ring file, or reopen it if it already holds a ring of the
    /// same geometry. Used by the writer process.
    pub fn open(path: &Path, geometry: RingGeometry, lock_timeout: Duration) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)?;

        // A file without magic never finished initializing and is resized
        // to the configured geometry
        let fresh = !has_magic(&file)?;
        if fresh {
            file.set_len(geometry.file_len() as u64)?;
        }

        let ring = Self::map(path, file, geometry, lock_timeout)?;
        let header = ring.header();

        if fresh {
            ring.initialize();
            tracing::info!(
                "Initialized shared slot ring at {} (capacity={}, key={}B, value={}B)",
                path.display(),
                geometry.capacity,
                geometry.key_capacity,
                geometry.value_capacity
            );
        } else {
            ring.validate()?;
            let existing = RingGeometry::read(header);
            if existing != geometry {
                return Err(QueueError::Layout(format!(
                    "ring at {} has geometry {:?}, configured {:?}",
                    path.display(),
                    existing,
                    geometry
                )));
            }
            tracing::info!(
                "Reattached shared slot ring at {} (produced={}, consumed={})",
                path.display(),
                header.produced(),
                header.consumed()
            );
        }

        Ok(ring)
    }

    /// Attach to a ring some writer already created. Used by producers.
    pub fn attach(path: &Path, lock_timeout: Duration) -> Result<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;

        let mut raw = [0u8; std::mem::size_of::<RingHeader>()];
        file.read_exact(&mut raw).map_err(|e| {
            QueueError::Layout(format!("{}: cannot read ring header: {}", path.display(), e))
        })?;
        let field = |at: usize| {
            let mut word = [0u8; 4];
            word.copy_from_slice(&raw[at..at + 4]);
            u32::from_le_bytes(word)
        };
        let geometry = RingGeometry {
            capacity: field(12),
            key_capacity: field(16),
            value_capacity: field(20),
        };

        let ring = Self::map(path, file, geometry, lock_timeout)?;
        ring.validate()?;
        Ok(ring)
    }

    fn map(path: &Path, file: File, geometry: RingGeometry, lock_timeout: Duration) -> Result<Self> {
        if geometry.capacity == 0 {
            return Err(QueueError::Layout(format!(
                "{}: ring capacity is zero",
                path.display()
            )));
        }
        let actual = file.metadata()?.len() as usize;
        if actual < geometry.file_len() {
            return Err(QueueError::Layout(format!(
                "{}: file is {} bytes, ring needs {}",
                path.display(),
                actual,
                geometry.file_len()
            )));
        }

        // SAFETY: the file stays open for the lifetime of the mapping, and
        // concurrent mappings by other processes are the intended use.
        let mut map = unsafe { MmapMut::map_mut(&file)? };
        let base = map.as_mut_ptr();

        Ok(Self {
            path: path.to_path_buf(),
            _map: map,
            _file: file,
            base,
            geometry,
            stride: geometry.stride(),
            lock_timeout,
            pid: std::process::id(),
        })
    }

    /// Write a fresh header and zero every slot; magic is stored last
    fn initialize(&self) {
        // SAFETY: the mapping spans `file_len` bytes and nobody else uses a
        // ring whose magic is not yet set.
        unsafe {
            std::ptr::write_bytes(self.base, 0, self.geometry.file_len());
        }
        let header = self.header();
        header.version.store(RING_VERSION, Ordering::Relaxed);
        header.capacity.store(self.geometry.capacity, Ordering::Relaxed);
        header.key_capacity.store(self.geometry.key_capacity, Ordering::Relaxed);
        header.value_capacity.store(self.geometry.value_capacity, Ordering::Relaxed);
        header.magic.store(RING_MAGIC, Ordering::Release);
    }

    fn validate(&self) -> Result<()> {
        let header = self.header();
        if header.magic.load(Ordering::Acquire) != RING_MAGIC {
            return Err(QueueError::Layout(format!(
                "{}: not an initialized slot ring",
                self.path.display()
            )));
        }
        let version = header.version.load(Ordering::Acquire);
        if version != RING_VERSION {
            return Err(QueueError::Layout(format!(
                "{}: unsupported ring version {} (expected {})",
                self.path.display(),
                version,
                RING_VERSION
            )));
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn slot_base(&self, ticket: u64) -> *mut u8 {
        let index = slot_index(ticket, self.capacity());
        // SAFETY: index < capacity and the mapping covers every slot
        unsafe { self.base.add(HEADER_REGION + index * self.stride) }
    }

    fn slot_header(&self, ticket: u64) -> &ShmSlotHeader {
        // SAFETY: slots are 8-byte aligned within a page-aligned mapping
        unsafe { &*(self.slot_base(ticket) as *const ShmSlotHeader) }
    }

    /// Spin, then sleep, until the lock word holds `token` or the timeout passes
    fn acquire(&self, slot: &ShmSlotHeader, token: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let backoff = Backoff::new();
        loop {
            if slot
                .lock
                .compare_exchange_weak(0, token, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
            if backoff.is_completed() {
                if Instant::now() >= deadline {
                    return false;
                }
                thread::sleep(POLL_INTERVAL);
            } else {
                backoff.snooze();
            }
        }
    }
}

impl SlotRing for ShmRing {
    type Slot<'a> = ShmSlotGuard<'a>;

    fn header(&self) -> &RingHeader {
        // SAFETY: the header occupies the first bytes of the mapping
        unsafe { &*(self.base as *const RingHeader) }
    }

    fn capacity(&self) -> u64 {
        self.geometry.capacity as u64
    }

    fn mode(&self) -> QueueMode {
        QueueMode::SharedMemory
    }

    fn lock(&self, ticket: u64) -> Option<ShmSlotGuard<'_>> {
        let slot = self.slot_header(ticket);
        let token = lock_token(self.pid);
        if !self.acquire(slot, token, self.lock_timeout) {
            return None;
        }
        Some(ShmSlotGuard {
            ring: self,
            slot,
            base: self.slot_base(ticket),
            token,
        })
    }

    fn reset_lock(&self, ticket: u64) -> u32 {
        token_pid(self.slot_header(ticket).lock.swap(0, Ordering::AcqRel))
    }

    fn peek_in_use(&self, ticket: u64) -> bool {
        self.slot_header(ticket).in_use.load(Ordering::Acquire) != 0
    }

    fn wait_timeout(&self) -> Option<Duration> {
        Some(self.lock_timeout)
    }

    fn check_fits(&self, command: &Command) -> Result<()> {
        let (key_len, value_len) = command.payload_len();
        if key_len > self.geometry.key_capacity as usize {
            return Err(QueueError::Capacity(format!(
                "key of {} bytes exceeds slot key capacity {}",
                key_len, self.geometry.key_capacity
            )));
        }
        if value_len > self.geometry.value_capacity as usize {
            return Err(QueueError::Capacity(format!(
                "value of {} bytes exceeds slot value capacity {}",
                value_len, self.geometry.value_capacity
            )));
        }
        Ok(())
    }

    fn wake_all(&self) {
        for ticket in 0..self.capacity() {
            self.slot_header(ticket).signal.fetch_add(1, Ordering::Release);
        }
    }
}

/// A locked shared-memory slot
pub(crate) struct ShmSlotGuard<'a> {
    ring: &'a ShmRing,
    slot: &'a ShmSlotHeader,
    base: *mut u8,
    /// Lock word value while this guard holds the slot
    token: u64,
}

impl ShmSlotGuard<'_> {
    /// Clear the lock word if it still holds this guard's token
    fn unlock(&self) {
        let _ = self
            .slot
            .lock
            .compare_exchange(self.token, 0, Ordering::Release, Ordering::Relaxed);
    }

    fn key_ptr(&self) -> *mut u8 {
        // SAFETY: the key buffer follows the slot header
        unsafe { self.base.add(std::mem::size_of::<ShmSlotHeader>()) }
    }

    fn value_ptr(&self) -> *mut u8 {
        // SAFETY: the value buffer follows the key buffer
        unsafe { self.key_ptr().add(self.ring.geometry.key_capacity as usize) }
    }

    fn write_key(&mut self, bytes: &[u8]) {
        let len = bytes.len().min(self.ring.geometry.key_capacity as usize);
        // SAFETY: len fits the key buffer and we hold the slot lock
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.key_ptr(), len) };
        self.slot.key_len.store(len as u32, Ordering::Relaxed);
    }

    fn write_value(&mut self, bytes: &[u8]) {
        let len = bytes.len().min(self.ring.geometry.value_capacity as usize);
        // SAFETY: len fits the value buffer and we hold the slot lock
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.value_ptr(), len) };
        self.slot.value_len.store(len as u32, Ordering::Relaxed);
    }

    fn read_key(&self) -> Vec<u8> {
        let len = (self.slot.key_len.load(Ordering::Relaxed) as usize)
            .min(self.ring.geometry.key_capacity as usize);
        // SAFETY: len is clamped to the buffer and we hold the slot lock
        unsafe { std::slice::from_raw_parts(self.key_ptr(), len).to_vec() }
    }

    fn read_value(&self) -> Vec<u8> {
        let len = (self.slot.value_len.load(Ordering::Relaxed) as usize)
            .min(self.ring.geometry.value_capacity as usize);
        // SAFETY: len is clamped to the buffer and we hold the slot lock
        unsafe { std::slice::from_raw_parts(self.value_ptr(), len).to_vec() }
    }

    fn notify(&self) {
        self.slot.signal.fetch_add(1, Ordering::Release);
    }
}

impl SlotAccess for ShmSlotGuard<'_> {
    fn in_use(&self) -> bool {
        self.slot.in_use.load(Ordering::Acquire) != 0
    }

    fn kind(&self) -> CommandKind {
        CommandKind::from_raw(self.slot.kind.load(Ordering::Acquire))
    }

    fn wait(&mut self, timeout: Option<Duration>) -> Wake {
        let seen = self.slot.signal.load(Ordering::Acquire);
        self.unlock();

        let deadline = timeout.map(|t| Instant::now() + t);
        let backoff = Backoff::new();
        let signalled = loop {
            if self.slot.signal.load(Ordering::Acquire) != seen {
                break true;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                break false;
            }
            if backoff.is_completed() {
                thread::sleep(POLL_INTERVAL);
            } else {
                backoff.snooze();
            }
        };

        let took_over = if self.ring.acquire(self.slot, self.token, self.ring.lock_timeout) {
            None
        } else {
            Some(token_pid(self.slot.lock.swap(self.token, Ordering::AcqRel)))
        };
        Wake {
            signalled,
            took_over,
        }
    }

    fn fill(&mut self, command: Command) -> Result<()> {
        self.ring.check_fits(&command)?;
        let kind = command.kind();
        self.slot.key_len.store(0, Ordering::Relaxed);
        self.slot.value_len.store(0, Ordering::Relaxed);
        self.slot.overwrite.store(0, Ordering::Relaxed);

        match command {
            Command::None | Command::RemoveAll => {}
            Command::Add {
                key,
                value,
                overwrite,
            } => {
                self.write_key(&key);
                self.write_value(&value);
                self.slot.overwrite.store(overwrite as u32, Ordering::Relaxed);
            }
            Command::Remove { key } => self.write_key(&key),
            Command::Reclaim(thresholds) => self.write_value(&thresholds.encode()),
            Command::Backup { dir } => {
                let dir = dir.to_string_lossy().into_owned();
                self.write_value(dir.as_bytes());
            }
        }

        self.slot.kind.store(kind as u32, Ordering::Release);
        Ok(())
    }

    fn publish(&mut self) {
        self.slot.in_use.store(1, Ordering::Release);
        self.notify();
    }

    fn take(&mut self) -> Command {
        match self.kind() {
            CommandKind::None => Command::None,
            CommandKind::Add => Command::Add {
                key: self.read_key().into(),
                value: self.read_value().into(),
                overwrite: self.slot.overwrite.load(Ordering::Relaxed) != 0,
            },
            CommandKind::Remove => Command::Remove {
                key: self.read_key().into(),
            },
            CommandKind::RemoveAll => Command::RemoveAll,
            CommandKind::Reclaim => match ReclaimThresholds::decode(&self.read_value()) {
                Some(thresholds) => Command::Reclaim(thresholds),
                None => Command::None,
            },
            CommandKind::Backup => Command::Backup {
                dir: PathBuf::from(String::from_utf8_lossy(&self.read_value()).into_owned()),
            },
        }
    }

    fn release(&mut self) {
        self.slot.kind.store(CommandKind::None as u32, Ordering::Relaxed);
        self.slot.key_len.store(0, Ordering::Relaxed);
        self.slot.value_len.store(0, Ordering::Relaxed);
        self.slot.overwrite.store(0, Ordering::Relaxed);
        self.slot.in_use.store(0, Ordering::Release);
        self.notify();
    }
}

impl Drop for ShmSlotGuard<'_> {
    fn drop(&mut self) {
        // A holder whose lock was reset and taken over must not free the new owner's lock
        self.unlock();
    }
}

/// Whether the file starts with an initialized ring header
fn has_magic(mut file: &File) -> Result<bool> {
    let mut magic = [0u8; 8];
    match file.read_exact(&mut magic) {
        Ok(()) => Ok(u64::from_le_bytes(magic) == RING_MAGIC),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn geometry() -> RingGeometry {
        RingGeometry {
            capacity: 4,
            key_capacity: 16,
            value_capacity: 64,
        }
    }

    #[test]
    fn test_open_then_attach_share_header() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ring");
        let writer = ShmRing::open(&path, geometry(), Duration::from_millis(50)).unwrap();
        let producer = ShmRing::attach(&path, Duration::from_millis(50)).unwrap();

        assert_eq!(producer.capacity(), 4);
        producer.header().next_ticket();
        assert_eq!(writer.header().produced(), 1);
    }

    #[test]
    fn test_reopen_with_other_geometry_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ring");
        drop(ShmRing::open(&path, geometry(), Duration::from_millis(50)).unwrap());

        let mut other = geometry();
        other.capacity = 8;
        let result = ShmRing::open(&path, other, Duration::from_millis(50));
        assert!(matches!(result, Err(QueueError::Layout(_))));
    }

    #[test]
    fn test_attach_missing_ring_fails() {
        let dir = TempDir::new().unwrap();
        assert!(ShmRing::attach(&dir.path().join("absent"), Duration::from_millis(50)).is_err());
    }

    #[test]
    fn test_payload_survives_across_mappings() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ring");
        let writer = ShmRing::open(&path, geometry(), Duration::from_millis(50)).unwrap();
        let producer = ShmRing::attach(&path, Duration::from_millis(50)).unwrap();

        let command = Command::add(b"key", b"value", false).unwrap();
        {
            let mut slot = producer.lock(2).unwrap();
            slot.fill(command.clone()).unwrap();
            slot.publish();
        }

        let mut slot = writer.lock(2).unwrap();
        assert!(slot.in_use());
        assert_eq!(slot.take(), command);
        slot.release();
        assert!(!writer.peek_in_use(2));
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let dir = TempDir::new().unwrap();
        let ring = ShmRing::open(&dir.path().join("ring"), geometry(), Duration::from_millis(50))
            .unwrap();
        let command = Command::add(b"key", &[0u8; 65], true).unwrap();
        assert!(matches!(ring.check_fits(&command), Err(QueueError::Capacity(_))));
    }

    #[test]
    fn test_abandoned_lock_times_out_and_resets() {
        let dir = TempDir::new().unwrap();
        let ring = ShmRing::open(&dir.path().join("ring"), geometry(), Duration::from_millis(30))
            .unwrap();

        // A holder that never unlocks, as if its process died
        std::mem::forget(ring.lock(0).unwrap());
        assert!(ring.lock(0).is_none());

        assert_eq!(ring.reset_lock(0), std::process::id());
        assert!(ring.lock(0).is_some());
    }

    #[test]
    fn test_stale_guard_cannot_free_new_owners_lock() {
        let dir = TempDir::new().unwrap();
        let ring = ShmRing::open(&dir.path().join("ring"), geometry(), Duration::from_millis(30))
            .unwrap();

        let stale = ring.lock(0).unwrap();
        assert!(ring.lock(0).is_none());
        ring.reset_lock(0);
        let owner = ring.lock(0).unwrap();

        // Same pid, different acquisition
        drop(stale);
        assert!(ring.lock(0).is_none());

        drop(owner);
        assert!(ring.lock(0).is_some());
    }

    #[test]
    fn test_wait_takes_over_lock_of_dead_holder() {
        let dir = TempDir::new().unwrap();
        let ring = ShmRing::open(&dir.path().join("ring"), geometry(), Duration::from_millis(30))
            .unwrap();

        let mut waiter = ring.lock(1).unwrap();
        let wake = thread::scope(|scope| {
            // Publish and die without unlocking
            scope.spawn(|| {
                let mut holder = loop {
                    if let Some(slot) = ring.lock(1) {
                        break slot;
                    }
                };
                holder.fill(Command::RemoveAll).unwrap();
                holder.publish();
                std::mem::forget(holder);
            });
            waiter.wait(Some(Duration::from_secs(2)))
        });

        assert!(wake.signalled);
        assert_eq!(wake.took_over, Some(std::process::id()));
        assert!(waiter.in_use());
        drop(waiter);
        assert!(ring.lock(1).is_some());
    }

    #[test]
    fn test_uninitialized_file_is_resized_on_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ring");
        // Crash after sizing the file but before the header was written
        File::create(&path)
            .unwrap()
            .set_len(geometry().file_len() as u64)
            .unwrap();

        let mut larger = geometry();
        larger.capacity = 16;
        let ring = ShmRing::open(&path, larger, Duration::from_millis(50)).unwrap();

        assert_eq!(ring.capacity(), 16);
        assert_eq!(
            std::fs::metadata(&path).unwrap().len(),
            larger.file_len() as u64
        );
    }
}
