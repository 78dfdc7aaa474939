//! Configuration for slotkv
//!
//! Centralized configuration with sensible defaults.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{QueueError, Result};
use crate::queue::RECLAIM_PAYLOAD_LEN;

/// Main configuration for a slotkv instance
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Root directory for all data files
    /// Internal structure:
    ///   {data_dir}/
    ///     ├── data.log         (record log)
    ///     ├── _writer.lock     (single-writer lock file)
    ///     └── _async_queue     (shared-memory slot ring)
    pub data_dir: PathBuf,

    // -------------------------------------------------------------------------
    // Writer Configuration
    // -------------------------------------------------------------------------
    /// Route mutations through the background consumer
    pub async_writer: bool,

    /// Where the slot ring lives
    pub queue_mode: QueueMode,

    /// Number of slots in the ring
    pub queue_capacity: u32,

    /// Inline key buffer per slot (shared-memory mode only)
    pub shm_key_capacity: u32,

    /// Inline value buffer per slot (shared-memory mode only)
    pub shm_value_capacity: u32,

    /// How long a slot lock or idle wait may stall before the holder is
    /// presumed dead (shared-memory mode only)
    pub lock_timeout: Duration,
}

/// Slot ring placement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueMode {
    /// Heap-allocated ring private to this process
    InProcess,

    /// Ring embedded in a memory-mapped file shared by producer processes
    SharedMemory,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./slotkv_data"),
            async_writer: false,
            queue_mode: QueueMode::InProcess,
            queue_capacity: 256,
            shm_key_capacity: 256,
            shm_value_capacity: 1024,
            lock_timeout: Duration::from_secs(5),
        }
    }
}

impl Config {
    const QUEUE_FILENAME: &'static str = "_async_queue";

    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Path of the shared-memory ring file
    pub fn queue_path(&self) -> PathBuf {
        self.data_dir.join(Self::QUEUE_FILENAME)
    }

    /// Check the queue settings before anything is allocated
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(QueueError::Config(
                "queue capacity must be positive".to_string(),
            ));
        }
        if self.queue_mode == QueueMode::SharedMemory {
            if self.shm_key_capacity == 0 {
                return Err(QueueError::Config(
                    "shared-memory key capacity must be positive".to_string(),
                ));
            }
            if (self.shm_value_capacity as usize) < RECLAIM_PAYLOAD_LEN {
                return Err(QueueError::Config(format!(
                    "shared-memory value capacity must be at least {} bytes",
                    RECLAIM_PAYLOAD_LEN
                )));
            }
        }
        if self.lock_timeout.is_zero() {
            return Err(QueueError::Config(
                "lock timeout must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the data directory (root for all storage)
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_dir = path.into();
        self
    }

    /// Enable or disable the asynchronous writer
    pub fn async_writer(mut self, enabled: bool) -> Self {
        self.config.async_writer = enabled;
        self
    }

    /// Set where the slot ring lives
    pub fn queue_mode(mut self, mode: QueueMode) -> Self {
        self.config.queue_mode = mode;
        self
    }

    /// Set the number of ring slots
    pub fn queue_capacity(mut self, capacity: u32) -> Self {
        self.config.queue_capacity = capacity;
        self
    }

    /// Set the inline key capacity (shared-memory mode)
    pub fn shm_key_capacity(mut self, bytes: u32) -> Self {
        self.config.shm_key_capacity = bytes;
        self
    }

    /// Set the inline value capacity (shared-memory mode)
    pub fn shm_value_capacity(mut self, bytes: u32) -> Self {
        self.config.shm_value_capacity = bytes;
        self
    }

    /// Set the lock-recovery timeout
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.config.lock_timeout = timeout;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
