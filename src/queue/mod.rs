//! Asynchronous command queue
//!
//! Producers publish [`Command`]s into a fixed ring of slots; one consumer
//! thread applies them to the [`Store`] in publish order and runs
//! reclamation passes in line.
//!
//! ## Variants
//! - [`QueueMode::InProcess`]: slots on the heap, `parking_lot` locks
//! - [`QueueMode::SharedMemory`]: slots in a mapped file so other processes
//!   can attach as producers through [`ShmProducer`]; locks recover from
//!   holders that died

mod command;
mod heap;
mod reclaim;
mod ring;
mod shm;
mod stats;
mod writer;

pub use command::{Command, CommandKind, ReclaimThresholds, RECLAIM_PAYLOAD_LEN};
pub use stats::{QueueStats, QueueStatsSnapshot};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::config::{Config, QueueMode};
use crate::error::{QueueError, Result};
use crate::store::Store;

use heap::HeapRing;
use ring::SlotRing;
use shm::{RingGeometry, ShmRing};
use writer::Queue;

/// Ticket counters of a ring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingPosition {
    /// Tickets handed out
    pub produced: u64,
    /// Tickets processed
    pub consumed: u64,
}

impl RingPosition {
    /// Tickets taken but not yet processed
    pub fn pending(&self) -> u64 {
        self.produced.saturating_sub(self.consumed)
    }
}

/// Producer-facing side of a queue
pub trait CommandQueue: Send + Sync {
    /// Publish a command, blocking while its slot is still occupied
    fn enqueue(&self, command: Command) -> Result<()>;

    /// Commands are outstanding or a reclamation pass is running
    fn is_busy(&self) -> bool;

    fn mode(&self) -> QueueMode;

    fn stats(&self) -> QueueStatsSnapshot;

    fn position(&self) -> RingPosition;

    fn enqueue_add(&self, key: &[u8], value: &[u8], overwrite: bool) -> Result<()> {
        self.enqueue(Command::add(key, value, overwrite)?)
    }

    fn enqueue_remove(&self, key: &[u8]) -> Result<()> {
        self.enqueue(Command::remove(key)?)
    }

    fn enqueue_clear(&self) -> Result<()> {
        self.enqueue(Command::RemoveAll)
    }

    fn enqueue_backup(&self, target_dir: &Path) -> Result<()> {
        self.enqueue(Command::backup(target_dir)?)
    }

    fn enqueue_reclaim(&self, thresholds: ReclaimThresholds) -> Result<()> {
        self.enqueue(Command::Reclaim(thresholds))
    }
}

/// Writer-side controls, object safe so the ring variant is picked at runtime
pub(crate) trait WriterQueue: CommandQueue {
    /// Mark the ring as served by this process
    fn activate(&self);

    fn run_consumer(&self, store: &dyn Store) -> Result<()>;

    /// Stop the consumer between commands and fail pending enqueues
    fn request_stop(&self);
}

// =============================================================================
// AsyncWriter
// =============================================================================

/// Owns a ring and the consumer thread applying it to a store
pub struct AsyncWriter {
    mode: QueueMode,

    /// `None` once stopped
    queue: RwLock<Option<Arc<dyn WriterQueue>>>,

    consumer: Mutex<Option<JoinHandle<Result<()>>>>,

    /// Counters captured at stop
    final_stats: Mutex<QueueStatsSnapshot>,
}

impl AsyncWriter {
    const THREAD_NAME: &'static str = "slotkv-async-writer";

    /// Build the ring described by `config` and start consuming into `store`
    pub fn start(store: Arc<dyn Store>, config: &Config) -> Result<Self> {
        config.validate()?;

        let queue: Arc<dyn WriterQueue> = match config.queue_mode {
            QueueMode::InProcess => Arc::new(Queue::new(HeapRing::new(config.queue_capacity))),
            QueueMode::SharedMemory => Arc::new(Queue::new(ShmRing::open(
                &config.queue_path(),
                RingGeometry::from_config(config),
                config.lock_timeout,
            )?)),
        };
        queue.activate();

        let spawned = {
            let queue = Arc::clone(&queue);
            thread::Builder::new()
                .name(Self::THREAD_NAME.to_string())
                .spawn(move || queue.run_consumer(store.as_ref()))
        };
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                queue.request_stop();
                return Err(e.into());
            }
        };

        Ok(Self {
            mode: config.queue_mode,
            queue: RwLock::new(Some(queue)),
            consumer: Mutex::new(Some(handle)),
            final_stats: Mutex::new(QueueStatsSnapshot::default()),
        })
    }

    fn current(&self) -> Option<Arc<dyn WriterQueue>> {
        self.queue.read().clone()
    }

    /// Stop the consumer, join it and release the ring
    ///
    /// Returns the consumer's fatal error, if it had one. Calling it again
    /// is a no-op.
    pub fn stop(&self) -> Result<()> {
        let mut consumer = self.consumer.lock();
        let Some(queue) = self.current() else {
            return Ok(());
        };

        queue.request_stop();
        let result = match consumer.take() {
            Some(handle) => handle.join().unwrap_or_else(|_| {
                Err(QueueError::Lock("async writer thread panicked".to_string()))
            }),
            None => Ok(()),
        };

        *self.final_stats.lock() = queue.stats();
        self.queue.write().take();
        tracing::info!("Async writer stopped");
        result
    }

    /// Whether `stop` has completed
    pub fn is_stopped(&self) -> bool {
        self.queue.read().is_none()
    }
}

impl CommandQueue for AsyncWriter {
    fn enqueue(&self, command: Command) -> Result<()> {
        // No lock is held while the enqueue blocks on its slot
        let queue = self.current().ok_or(QueueError::Closed)?;
        queue.enqueue(command)
    }

    fn is_busy(&self) -> bool {
        self.current().is_some_and(|q| q.is_busy())
    }

    fn mode(&self) -> QueueMode {
        self.mode
    }

    fn stats(&self) -> QueueStatsSnapshot {
        match self.current() {
            Some(queue) => queue.stats(),
            None => *self.final_stats.lock(),
        }
    }

    fn position(&self) -> RingPosition {
        match self.current() {
            Some(queue) => queue.position(),
            None => RingPosition {
                produced: 0,
                consumed: 0,
            },
        }
    }
}

impl Drop for AsyncWriter {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::warn!("Async writer stopped with error: {}", e);
        }
    }
}

// =============================================================================
// ShmProducer
// =============================================================================

/// A producer attached to another process's shared-memory ring
pub struct ShmProducer {
    path: PathBuf,
    queue: Queue<ShmRing>,
}

impl ShmProducer {
    /// Attach to the ring file at `path`. Fails with `Closed` when no writer
    /// is serving it.
    pub fn attach(path: &Path, lock_timeout: Duration) -> Result<Self> {
        let queue = Queue::new(ShmRing::attach(path, lock_timeout)?);
        if queue.is_closed() {
            return Err(QueueError::Closed);
        }
        tracing::debug!(
            "Attached to slot ring at {} (capacity {})",
            queue.ring().path().display(),
            queue.ring().capacity()
        );
        Ok(Self {
            path: path.to_path_buf(),
            queue,
        })
    }

    /// Attach to the ring of the data directory in `config`
    pub fn attach_config(config: &Config) -> Result<Self> {
        Self::attach(&config.queue_path(), config.lock_timeout)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the writer serving this ring is still active
    pub fn writer_active(&self) -> bool {
        !self.queue.is_closed()
    }
}

impl CommandQueue for ShmProducer {
    fn enqueue(&self, command: Command) -> Result<()> {
        self.queue.enqueue(command)
    }

    fn is_busy(&self) -> bool {
        self.queue.is_busy()
    }

    fn mode(&self) -> QueueMode {
        QueueMode::SharedMemory
    }

    fn stats(&self) -> QueueStatsSnapshot {
        self.queue.stats()
    }

    fn position(&self) -> RingPosition {
        self.queue.position()
    }
}
