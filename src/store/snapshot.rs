//! Snapshot files
//!
//! A backup writes the live key space into `{dir}/snapshot.bin`:
//!
//! ```text
//! ┌────────────────────────────────────────────┐
//! │ Header: magic (8) │ version (4) │ count (8)│
//! ├────────────────────────────────────────────┤
//! │ Entry frames in key order                  │
//! │   [len (4)][crc (4)][bincode(entry)]       │
//! └────────────────────────────────────────────┘
//! ```
//!
//! The file is written beside its final name and renamed into place, so a
//! reader never sees a half-written snapshot.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Magic bytes identifying a snapshot
pub const SNAPSHOT_MAGIC: &[u8; 8] = b"SLOTSNAP";

/// Snapshot format version
pub const SNAPSHOT_VERSION: u32 = 1;

/// File name inside the backup directory
pub const SNAPSHOT_FILENAME: &str = "snapshot.bin";

const HEADER_SIZE: usize = 8 + 4 + 8;

#[derive(Serialize, Deserialize)]
struct SnapshotEntry {
    key: Vec<u8>,
    value: Vec<u8>,
}

/// Path of the snapshot file inside `dir`
pub fn snapshot_path(dir: &Path) -> PathBuf {
    dir.join(SNAPSHOT_FILENAME)
}

/// Streams entries into a new snapshot
pub struct SnapshotWriter {
    final_path: PathBuf,
    tmp_path: PathBuf,
    writer: BufWriter<File>,
    count: u64,
}

impl SnapshotWriter {
    /// Create the backup directory if needed and start a snapshot in it
    pub fn create(dir: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(dir)?;
        let final_path = snapshot_path(dir);
        let tmp_path = final_path.with_extension("bin.tmp");

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        let mut writer = BufWriter::new(file);

        // Count is patched in `finish`
        writer.write_all(SNAPSHOT_MAGIC)?;
        writer.write_all(&SNAPSHOT_VERSION.to_le_bytes())?;
        writer.write_all(&0u64.to_le_bytes())?;

        Ok(Self {
            final_path,
            tmp_path,
            writer,
            count: 0,
        })
    }

    /// Append one entry (callers supply keys in order)
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let payload = bincode::serialize(&SnapshotEntry {
            key: key.to_vec(),
            value: value.to_vec(),
        })?;
        self.writer.write_all(&(payload.len() as u32).to_le_bytes())?;
        self.writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
        self.writer.write_all(&payload)?;
        self.count += 1;
        Ok(())
    }

    /// Patch the header, sync and move the file into place
    pub fn finish(self) -> Result<u64, StoreError> {
        use std::io::{Seek, SeekFrom};

        let mut file = self
            .writer
            .into_inner()
            .map_err(|e| StoreError::Io(e.into_error()))?;
        file.seek(SeekFrom::Start(12))?;
        file.write_all(&self.count.to_le_bytes())?;
        file.sync_all()?;
        drop(file);

        fs::rename(&self.tmp_path, &self.final_path)?;
        Ok(self.count)
    }
}

/// Read a snapshot back, verifying every entry
pub fn read_snapshot(dir: &Path) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
    let path = snapshot_path(dir);
    let mut reader = BufReader::new(File::open(&path)?);

    let mut header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header)?;
    if &header[0..8] != SNAPSHOT_MAGIC {
        return Err(StoreError::Corruption(format!(
            "{}: bad snapshot magic",
            path.display()
        )));
    }
    let version = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
    if version != SNAPSHOT_VERSION {
        return Err(StoreError::Corruption(format!(
            "{}: unsupported snapshot version {}",
            path.display(),
            version
        )));
    }
    let mut count_raw = [0u8; 8];
    count_raw.copy_from_slice(&header[12..20]);
    let count = u64::from_le_bytes(count_raw);

    let mut entries = Vec::new();
    for index in 0..count {
        let mut frame = [0u8; 8];
        reader.read_exact(&mut frame)?;
        let len = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]);
        let crc = u32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]);

        let mut payload = vec![0u8; len as usize];
        reader.read_exact(&mut payload)?;
        if crc32fast::hash(&payload) != crc {
            return Err(StoreError::Corruption(format!(
                "{}: checksum mismatch in entry {}",
                path.display(),
                index
            )));
        }
        let entry: SnapshotEntry = bincode::deserialize(&payload)?;
        entries.push((entry.key, entry.value));
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_then_read() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("backup");

        let mut writer = SnapshotWriter::create(&target).unwrap();
        writer.add(b"a", b"1").unwrap();
        writer.add(b"b", b"").unwrap();
        assert_eq!(writer.finish().unwrap(), 2);

        let entries = read_snapshot(&target).unwrap();
        assert_eq!(
            entries,
            vec![(b"a".to_vec(), b"1".to_vec()), (b"b".to_vec(), Vec::new())]
        );
        assert!(!target.join("snapshot.bin.tmp").exists());
    }

    #[test]
    fn test_corrupted_entry_rejected() {
        let dir = TempDir::new().unwrap();
        let mut writer = SnapshotWriter::create(dir.path()).unwrap();
        writer.add(b"key", b"value").unwrap();
        writer.finish().unwrap();

        let path = snapshot_path(dir.path());
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x55;
        fs::write(&path, bytes).unwrap();

        assert!(matches!(
            read_snapshot(dir.path()),
            Err(StoreError::Corruption(_))
        ));
    }
}
