//! Engine Module
//!
//! The facade applications open: one writer per data directory, the
//! log-structured store, and optionally the asynchronous writer in front of it.
//!
//! ## Responsibilities
//! - Hold the exclusive writer lock on the data directory
//! - Route mutations through the command queue or straight to the store
//! - Serve reads from the store
//! - Stop the consumer and sync the log on close

use std::fs::{self, File, OpenOptions};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use fs2::FileExt;
use parking_lot::Mutex;

use crate::config::Config;
use crate::error::{Result, StoreError};
use crate::queue::{AsyncWriter, CommandQueue, QueueStatsSnapshot, ReclaimThresholds, RingPosition};
use crate::store::{LogStats, LogStore, NoDrain, ReclaimOutcome, Store};

/// The main storage engine
///
/// ## Concurrency Model: Single Writer
///
/// - **Asynchronous mode**: every mutation becomes a command; the consumer
///   thread is the only code that mutates the store
/// - **Direct mode**: mutations run on the caller's thread, serialized by
///   `write_lock`
/// - **Reads** go to the store in both modes and see applied commands only
pub struct Engine {
    /// Engine configuration
    config: Config,

    /// Log-structured store (internal mutex)
    store: Arc<LogStore>,

    /// Consumer thread and ring, when `config.async_writer` is set
    writer: Option<AsyncWriter>,

    /// Serializes direct-mode writes
    write_lock: Mutex<()>,

    /// Held exclusively for the engine's lifetime
    _lock_file: File,
}

impl Engine {
    // =========================================================================
    // Internal Path Constants
    // =========================================================================
    const LOCK_FILENAME: &'static str = "_writer.lock";

    /// Open or create an engine with the given config
    ///
    /// On startup:
    /// 1. Create the data directory
    /// 2. Take the writer lock (fails if another writer holds it)
    /// 3. Open the store (replays the log)
    /// 4. Start the asynchronous writer if configured
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;

        // Step 1: Create data directory if it doesn't exist
        fs::create_dir_all(&config.data_dir)?;

        // Step 2: One writer per directory
        let lock_path = config.data_dir.join(Self::LOCK_FILENAME);
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(StoreError::WriterExists(lock_path.display().to_string()).into());
        }

        // Step 3: Open the store
        let store = Arc::new(LogStore::open(&config.data_dir)?);

        // Step 4: Start the consumer
        let writer = if config.async_writer {
            let writer = AsyncWriter::start(store.clone(), &config)?;
            tracing::info!(
                "Async writer running ({:?}, {} slots)",
                config.queue_mode,
                config.queue_capacity
            );
            Some(writer)
        } else {
            None
        };

        Ok(Self {
            config,
            store,
            writer,
            write_lock: Mutex::new(()),
            _lock_file: lock_file,
        })
    }

    /// Open with a path (convenience method)
    ///
    /// Uses default config with the specified data directory
    pub fn open_path(path: &Path) -> Result<Self> {
        Self::open(Config::builder().data_dir(path).build())
    }

    /// Get a value by key
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.store.get(key)?)
    }

    /// Put a key-value pair, replacing any existing value
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.put_with(key, value, true)
    }

    /// Put a key-value pair
    ///
    /// Without `overwrite` an existing key is kept. In asynchronous mode that
    /// outcome is only logged by the consumer.
    pub fn put_with(&self, key: &[u8], value: &[u8], overwrite: bool) -> Result<()> {
        match &self.writer {
            Some(writer) => writer.enqueue_add(key, value, overwrite),
            None => {
                let _write_guard = self.write_lock.lock();
                Ok(self.store.insert(key, value, overwrite)?)
            }
        }
    }

    /// Delete a key
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        match &self.writer {
            Some(writer) => writer.enqueue_remove(key),
            None => {
                let _write_guard = self.write_lock.lock();
                Ok(self.store.delete(key)?)
            }
        }
    }

    /// Delete every key
    pub fn clear(&self) -> Result<()> {
        match &self.writer {
            Some(writer) => writer.enqueue_clear(),
            None => {
                let _write_guard = self.write_lock.lock();
                Ok(self.store.clear()?)
            }
        }
    }

    /// Export a snapshot into `dir`
    pub fn backup(&self, dir: &Path) -> Result<()> {
        match &self.writer {
            Some(writer) => writer.enqueue_backup(dir),
            None => {
                let _write_guard = self.write_lock.lock();
                Ok(self.store.snapshot_export(dir)?)
            }
        }
    }

    /// Run a reclamation pass
    pub fn collect_resource(&self, thresholds: ReclaimThresholds) -> Result<()> {
        let Some(writer) = &self.writer else {
            let _write_guard = self.write_lock.lock();
            match self.store.reclaim(&thresholds, &mut NoDrain)? {
                ReclaimOutcome::Completed(stats) => tracing::info!(
                    "Reclamation completed: evicted {}, copied {}, {} -> {} bytes",
                    stats.entries_evicted,
                    stats.records_copied,
                    stats.bytes_before,
                    stats.bytes_after
                ),
                ReclaimOutcome::Skipped => tracing::info!("Reclamation skipped"),
            }
            return Ok(());
        };
        writer.enqueue_reclaim(thresholds)
    }

    /// Commands are queued or a reclamation pass is running
    pub fn is_busy(&self) -> bool {
        self.writer.as_ref().is_some_and(|w| w.is_busy())
    }

    /// Wait until the queue drains; `false` if `timeout` passed first
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.is_busy() {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
        true
    }

    /// Close the engine gracefully
    ///
    /// Stops the consumer (reporting its fatal error, if any) and syncs the log
    pub fn close(self) -> Result<()> {
        if let Some(writer) = &self.writer {
            writer.stop()?;
        }
        self.store.sync()?;
        Ok(())
    }

    // =========================================================================
    // Accessors (for testing and debugging)
    // =========================================================================

    /// Get the data directory path
    pub fn data_dir(&self) -> &Path {
        &self.config.data_dir
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get the number of live keys
    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Space accounting of the store
    pub fn store_stats(&self) -> LogStats {
        self.store.stats()
    }

    /// Queue counters, in asynchronous mode
    pub fn queue_stats(&self) -> Option<QueueStatsSnapshot> {
        self.writer.as_ref().map(|w| w.stats())
    }

    /// Ring counters, in asynchronous mode
    pub fn queue_position(&self) -> Option<RingPosition> {
        self.writer.as_ref().map(|w| w.position())
    }

    /// The asynchronous writer, if running
    pub fn writer(&self) -> Option<&AsyncWriter> {
        self.writer.as_ref()
    }
}
