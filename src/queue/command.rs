//! Command definitions
//!
//! One pending mutation per slot.

use std::path::{Path, PathBuf};

use bytes::Bytes;

use crate::error::{QueueError, Result};

/// Encoded size of [`ReclaimThresholds`] inside a slot's value buffer
pub const RECLAIM_PAYLOAD_LEN: usize = 32;

/// Slot discriminant, as stored in shared memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CommandKind {
    None = 0,
    Add = 1,
    Remove = 2,
    RemoveAll = 3,
    Reclaim = 4,
    Backup = 5,
}

impl CommandKind {
    /// Decode a raw discriminant; unknown values are treated as `None`
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            1 => CommandKind::Add,
            2 => CommandKind::Remove,
            3 => CommandKind::RemoveAll,
            4 => CommandKind::Reclaim,
            5 => CommandKind::Backup,
            _ => CommandKind::None,
        }
    }
}

/// Thresholds handed to a reclamation pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReclaimThresholds {
    /// Minimum reclaimable index bytes (dead keys) before compacting
    pub min_index_reclaim: u64,

    /// Minimum reclaimable data bytes (dead records) before compacting
    pub min_data_reclaim: u64,

    /// Prune oldest entries while live data exceeds this many bytes
    pub max_db_size: u64,

    /// Prune oldest entries while the live count exceeds this
    pub max_entries: u64,
}

impl Default for ReclaimThresholds {
    fn default() -> Self {
        Self {
            min_index_reclaim: 0,
            min_data_reclaim: 0,
            max_db_size: u64::MAX,
            max_entries: u64::MAX,
        }
    }
}

impl ReclaimThresholds {
    pub fn encode(&self) -> [u8; RECLAIM_PAYLOAD_LEN] {
        let mut buf = [0u8; RECLAIM_PAYLOAD_LEN];
        buf[0..8].copy_from_slice(&self.min_index_reclaim.to_le_bytes());
        buf[8..16].copy_from_slice(&self.min_data_reclaim.to_le_bytes());
        buf[16..24].copy_from_slice(&self.max_db_size.to_le_bytes());
        buf[24..32].copy_from_slice(&self.max_entries.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < RECLAIM_PAYLOAD_LEN {
            return None;
        }
        let field = |at: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buf[at..at + 8]);
            u64::from_le_bytes(raw)
        };
        Some(Self {
            min_index_reclaim: field(0),
            min_data_reclaim: field(8),
            max_db_size: field(16),
            max_entries: field(24),
        })
    }
}

/// A queued mutation
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Placeholder published when a lease is abandoned after its ticket was taken
    None,

    /// Insert a key-value pair
    Add {
        key: Bytes,
        value: Bytes,
        overwrite: bool,
    },

    /// Delete a key
    Remove { key: Bytes },

    /// Delete every key
    RemoveAll,

    /// Start a reclamation pass
    Reclaim(ReclaimThresholds),

    /// Export a snapshot into a directory
    Backup { dir: PathBuf },
}

impl Command {
    /// Build an Add, copying the caller's buffers into slot-owned storage
    pub fn add(key: &[u8], value: &[u8], overwrite: bool) -> Result<Self> {
        check_key(key)?;
        Ok(Command::Add {
            key: owned_copy(key)?,
            value: owned_copy(value)?,
            overwrite,
        })
    }

    /// Build a Remove
    pub fn remove(key: &[u8]) -> Result<Self> {
        check_key(key)?;
        Ok(Command::Remove {
            key: owned_copy(key)?,
        })
    }

    /// Build a Backup; the directory must be valid UTF-8 so it survives the
    /// shared-memory round trip
    pub fn backup(dir: &Path) -> Result<Self> {
        match dir.to_str() {
            Some(s) if !s.is_empty() => Ok(Command::Backup {
                dir: dir.to_path_buf(),
            }),
            Some(_) => Err(QueueError::InvalidArgument(
                "backup directory is empty".to_string(),
            )),
            None => Err(QueueError::InvalidArgument(format!(
                "backup directory is not valid UTF-8: {}",
                dir.display()
            ))),
        }
    }

    /// Get the command kind
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::None => CommandKind::None,
            Command::Add { .. } => CommandKind::Add,
            Command::Remove { .. } => CommandKind::Remove,
            Command::RemoveAll => CommandKind::RemoveAll,
            Command::Reclaim(_) => CommandKind::Reclaim,
            Command::Backup { .. } => CommandKind::Backup,
        }
    }

    /// Bytes this command needs in a slot's (key, value) buffers
    pub fn payload_len(&self) -> (usize, usize) {
        match self {
            Command::None | Command::RemoveAll => (0, 0),
            Command::Add { key, value, .. } => (key.len(), value.len()),
            Command::Remove { key } => (key.len(), 0),
            Command::Reclaim(_) => (0, RECLAIM_PAYLOAD_LEN),
            Command::Backup { dir } => (0, dir.as_os_str().len()),
        }
    }
}

fn check_key(key: &[u8]) -> Result<()> {
    if key.is_empty() {
        return Err(QueueError::InvalidArgument("key is empty".to_string()));
    }
    Ok(())
}

/// Copy into a fresh buffer, reporting allocation failure instead of aborting
fn owned_copy(src: &[u8]) -> Result<Bytes> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(src.len()).map_err(|e| {
        QueueError::Capacity(format!("cannot allocate {} bytes: {}", src.len(), e))
    })?;
    buf.extend_from_slice(src);
    Ok(Bytes::from(buf))
}
