//! Log-structured store
//!
//! All mutations append a [`Record`] frame to `data.log`; an ordered
//! in-memory index maps each live key to the frame holding its value.
//!
//! ## Files
//! ```text
//! {dir}/
//!   ├── data.log           (active log)
//!   └── data.log.compact   (only while a reclamation pass runs)
//! ```
//!
//! ## Reclamation
//! 1. Evict the oldest entries while the store is over its count or size limit
//! 2. Skip if the dead space is below both minimums
//! 3. Copy live records into `data.log.compact` in batches, draining the
//!    command queue between batches; writes made meanwhile land in the new file
//! 4. Sync and rename the new file over `data.log`
//!
//! Replay resolves every key to its highest sequence number, so a crash at
//! any point of a pass leaves two logs that merge back into one on open.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

use parking_lot::Mutex;

use crate::error::StoreError;
use crate::queue::ReclaimThresholds;

use super::record::{scan_log, Record};
use super::snapshot::SnapshotWriter;
use super::{ReclaimOutcome, ReclaimStats, Store, TaskDrain};

/// Live records copied per batch, and commands drained between batches
pub const COMPACTION_BATCH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Segment {
    Main,
    Compact,
}

/// Where a key's current frame lives
#[derive(Debug, Clone, Copy)]
struct Location {
    segment: Segment,
    offset: u64,
    frame_len: u64,
    seq: u64,
}

/// Space accounting for a [`LogStore`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogStats {
    pub live_entries: u64,
    /// Frame bytes of the live records
    pub live_bytes: u64,
    /// Bytes on disk across the active log and any compaction file
    pub file_bytes: u64,
    /// `file_bytes - live_bytes`
    pub dead_bytes: u64,
    /// Key bytes of superseded or deleted entries
    pub dead_key_bytes: u64,
}

/// An in-progress compaction
struct Compaction {
    file: File,
    len: u64,
    /// Keys deleted during the pass, still holding a Put in the old log
    removed: Vec<Vec<u8>>,
}

struct Inner {
    main: File,
    main_len: u64,
    compaction: Option<Compaction>,
    index: BTreeMap<Vec<u8>, Location>,
    next_seq: u64,
    live_bytes: u64,
    dead_key_bytes: u64,
}

/// Append-only key-value store with in-line compaction
pub struct LogStore {
    dir: PathBuf,
    inner: Mutex<Inner>,
}

impl LogStore {
    // =========================================================================
    // Internal Path Constants
    // =========================================================================
    const DATA_FILENAME: &'static str = "data.log";
    const COMPACT_FILENAME: &'static str = "data.log.compact";

    /// Open or create a store in `dir`
    ///
    /// On startup:
    /// 1. Truncate a torn tail off `data.log`
    /// 2. Merge a leftover compaction file back into `data.log`
    /// 3. Rebuild the index
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        // Step 1: Create the directory and the log if missing
        fs::create_dir_all(dir)?;
        let data_path = dir.join(Self::DATA_FILENAME);
        let compact_path = dir.join(Self::COMPACT_FILENAME);
        open_append(&data_path)?;

        // Step 2: Finish whatever a crash interrupted
        truncate_torn_tail(&data_path)?;
        if compact_path.exists() {
            merge_interrupted_compaction(&data_path, &compact_path)?;
        }

        // Step 3: Replay into the index
        let scan = scan_log(&data_path)?;
        let mut replay = Replay::default();
        for logged in scan.records {
            let location = Location {
                segment: Segment::Main,
                offset: logged.offset,
                frame_len: logged.frame_len,
                seq: logged.record.seq(),
            };
            match logged.record {
                Record::Put { seq, key, .. } => replay.apply(seq, key, Some(location)),
                Record::Delete { seq, key } => replay.apply(seq, key, None),
            }
        }

        let next_seq = replay.max_seq + 1;
        let dead_key_bytes = replay.dead_key_bytes;
        let index: BTreeMap<Vec<u8>, Location> = replay.into_live().collect();
        let live_bytes = index.values().map(|l| l.frame_len).sum();

        tracing::info!(
            "Opened log store at {} ({} live entries, {} bytes)",
            dir.display(),
            index.len(),
            scan.valid_len
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            inner: Mutex::new(Inner {
                main: open_append(&data_path)?,
                main_len: scan.valid_len,
                compaction: None,
                index,
                next_seq,
                live_bytes,
                dead_key_bytes,
            }),
        })
    }

    /// Directory holding the log
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Look up a key
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let mut inner = self.inner.lock();
        let Some(location) = inner.index.get(key).copied() else {
            return Ok(None);
        };
        inner.read_value(location).map(Some)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> LogStats {
        let inner = self.inner.lock();
        LogStats {
            live_entries: inner.index.len() as u64,
            live_bytes: inner.live_bytes,
            file_bytes: inner.file_bytes(),
            dead_bytes: inner.dead_bytes(),
            dead_key_bytes: inner.dead_key_bytes,
        }
    }

    /// Force buffered appends to disk
    pub fn sync(&self) -> Result<(), StoreError> {
        let inner = self.inner.lock();
        inner.main.sync_data()?;
        if let Some(compaction) = &inner.compaction {
            compaction.file.sync_data()?;
        }
        Ok(())
    }

    fn compact_path(&self) -> PathBuf {
        self.dir.join(Self::COMPACT_FILENAME)
    }

    fn data_path(&self) -> PathBuf {
        self.dir.join(Self::DATA_FILENAME)
    }

    /// Undo a failed pass: move records that only exist in the new segment
    /// back onto the old log
    fn rollback(&self, inner: &mut Inner, cause: &StoreError) {
        tracing::warn!("Reclamation failed, rolling back: {}", cause);
        match inner.rollback() {
            Ok(()) => {
                if let Err(e) = fs::remove_file(self.compact_path()) {
                    tracing::warn!("Could not remove partial compaction file: {}", e);
                }
            }
            // The compaction file stays; the next open merges it
            Err(e) => tracing::error!("Rollback of reclamation failed: {}", e),
        }
    }
}

impl Store for LogStore {
    fn insert(&self, key: &[u8], value: &[u8], overwrite: bool) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let existing = inner.index.get(key).copied();
        if existing.is_some() && !overwrite {
            return Err(StoreError::KeyExists);
        }

        let record = Record::Put {
            seq: inner.take_seq(),
            key: key.to_vec(),
            value: value.to_vec(),
        };
        let location = inner.append(&record)?;
        if let Some(old) = existing {
            inner.retire(key, old);
        }
        inner.live_bytes += location.frame_len;
        inner.index.insert(key.to_vec(), location);
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        self.inner.lock().remove_key(key)
    }

    fn clear(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if inner.compaction.take().is_some() {
            fs::remove_file(self.compact_path())?;
        }
        inner.main.set_len(0)?;
        inner.main.sync_data()?;
        inner.main_len = 0;
        inner.index.clear();
        inner.live_bytes = 0;
        inner.dead_key_bytes = 0;
        tracing::debug!("Cleared log store at {}", self.dir.display());
        Ok(())
    }

    fn snapshot_export(&self, target_dir: &Path) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let mut writer = SnapshotWriter::create(target_dir)?;

        let locations: Vec<(Vec<u8>, Location)> =
            inner.index.iter().map(|(k, l)| (k.clone(), *l)).collect();
        for (key, location) in locations {
            let value = inner.read_value(location)?;
            writer.add(&key, &value)?;
        }
        let count = writer.finish()?;

        tracing::info!(
            "Exported snapshot of {} entries to {}",
            count,
            target_dir.display()
        );
        Ok(())
    }

    fn reclaim(
        &self,
        thresholds: &ReclaimThresholds,
        drain: &mut dyn TaskDrain,
    ) -> Result<ReclaimOutcome, StoreError> {
        let started = Instant::now();
        let mut stats = ReclaimStats::default();

        // Phase 1: prune, decide, open the new segment
        let keys: Vec<Vec<u8>> = {
            let mut inner = self.inner.lock();
            if inner.compaction.is_some() {
                return Err(StoreError::Aborted(
                    "a compaction is already in progress".to_string(),
                ));
            }
            stats.bytes_before = inner.main_len;
            stats.entries_evicted = inner.prune(thresholds)?;

            let dead_bytes = inner.dead_bytes();
            let worth_compacting = dead_bytes > 0
                && (dead_bytes >= thresholds.min_data_reclaim
                    || inner.dead_key_bytes >= thresholds.min_index_reclaim);
            if !worth_compacting {
                tracing::debug!(
                    "Compaction not needed ({} dead bytes, {} dead key bytes)",
                    dead_bytes,
                    inner.dead_key_bytes
                );
                if stats.entries_evicted == 0 {
                    return Ok(ReclaimOutcome::Skipped);
                }
                stats.bytes_after = inner.main_len;
                return Ok(ReclaimOutcome::Completed(stats));
            }

            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(true)
                .open(self.compact_path())?;
            drop(file);
            inner.compaction = Some(Compaction {
                file: open_append(&self.compact_path())?,
                len: 0,
                removed: Vec::new(),
            });
            inner.index.keys().cloned().collect()
        };

        tracing::info!(
            "Compacting {} live entries ({} bytes on disk)",
            keys.len(),
            stats.bytes_before
        );

        // Phase 2: copy in batches, letting queued commands through in between
        let mut draining = true;
        for batch in keys.chunks(COMPACTION_BATCH) {
            {
                let mut inner = self.inner.lock();
                if let Err(e) = inner.copy_live(batch, &mut stats) {
                    self.rollback(&mut inner, &e);
                    return Err(e);
                }
            }
            if draining {
                match drain.drain(COMPACTION_BATCH) {
                    Ok(applied) => stats.tasks_drained += applied as u64,
                    Err(e) => {
                        tracing::debug!("Stopped draining during compaction: {}", e);
                        draining = false;
                    }
                }
            }
        }

        // Phase 3: swap the new segment in
        let mut inner = self.inner.lock();
        let data_path = self.data_path();
        let compact_path = self.compact_path();
        if let Err(e) = inner.finish_compaction(&compact_path, &data_path, &mut stats) {
            self.rollback(&mut inner, &e);
            return Err(e);
        }
        stats.bytes_after = inner.main_len;

        tracing::info!(
            "Reclamation finished in {:?}: evicted {}, copied {}, drained {}, {} -> {} bytes",
            started.elapsed(),
            stats.entries_evicted,
            stats.records_copied,
            stats.tasks_drained,
            stats.bytes_before,
            stats.bytes_after
        );
        Ok(ReclaimOutcome::Completed(stats))
    }

    /// Tombstones written mid-pass go to the new segment, and a rollback
    /// replays them into the old log
    fn supports_remove_during_reclaim(&self) -> bool {
        true
    }
}

impl Inner {
    fn take_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn file_bytes(&self) -> u64 {
        self.main_len + self.compaction.as_ref().map_or(0, |c| c.len)
    }

    fn dead_bytes(&self) -> u64 {
        self.file_bytes().saturating_sub(self.live_bytes)
    }

    /// Append to the new segment while compacting, else to the active log
    fn append(&mut self, record: &Record) -> Result<Location, StoreError> {
        let frame = record.encode()?;
        let (file, len, segment) = match self.compaction.as_mut() {
            Some(c) => (&mut c.file, &mut c.len, Segment::Compact),
            None => (&mut self.main, &mut self.main_len, Segment::Main),
        };

        if let Err(e) = file.write_all(&frame) {
            // Drop a partial frame so the next append starts at a boundary
            let _ = file.set_len(*len);
            return Err(e.into());
        }

        let location = Location {
            segment,
            offset: *len,
            frame_len: frame.len() as u64,
            seq: record.seq(),
        };
        *len += location.frame_len;
        Ok(location)
    }

    fn read_value(&mut self, location: Location) -> Result<Vec<u8>, StoreError> {
        let file = match (location.segment, self.compaction.as_mut()) {
            (Segment::Main, _) => &mut self.main,
            (Segment::Compact, Some(c)) => &mut c.file,
            (Segment::Compact, None) => {
                return Err(StoreError::Corruption(
                    "index points into a finished compaction".to_string(),
                ))
            }
        };
        match Record::read_at(file, location.offset)? {
            Record::Put { value, .. } => Ok(value),
            Record::Delete { .. } => Err(StoreError::Corruption(format!(
                "index points at a tombstone (offset {})",
                location.offset
            ))),
        }
    }

    /// Account for a key's previous frame becoming dead
    fn retire(&mut self, key: &[u8], old: Location) {
        self.live_bytes -= old.frame_len;
        self.dead_key_bytes += key.len() as u64;
    }

    fn remove_key(&mut self, key: &[u8]) -> Result<(), StoreError> {
        let Some(old) = self.index.get(key).copied() else {
            return Err(StoreError::KeyNotFound);
        };
        let record = Record::Delete {
            seq: self.take_seq(),
            key: key.to_vec(),
        };
        self.append(&record)?;
        self.retire(key, old);
        self.index.remove(key);
        if let Some(compaction) = self.compaction.as_mut() {
            compaction.removed.push(key.to_vec());
        }
        Ok(())
    }

    /// Evict oldest entries until both limits hold
    fn prune(&mut self, thresholds: &ReclaimThresholds) -> Result<u64, StoreError> {
        let within_limits = |inner: &Inner| {
            inner.index.len() as u64 <= thresholds.max_entries
                && inner.live_bytes <= thresholds.max_db_size
        };
        if within_limits(self) {
            return Ok(0);
        }

        let mut by_age: Vec<(u64, Vec<u8>)> = self
            .index
            .iter()
            .map(|(key, location)| (location.seq, key.clone()))
            .collect();
        by_age.sort_unstable();

        let mut evicted = 0;
        for (_, key) in by_age {
            if within_limits(self) {
                break;
            }
            self.remove_key(&key)?;
            evicted += 1;
        }

        tracing::info!("Evicted {} entries to honour size limits", evicted);
        Ok(evicted)
    }

    /// Copy records still living in the old log into the new segment
    fn copy_live(&mut self, keys: &[Vec<u8>], stats: &mut ReclaimStats) -> Result<(), StoreError> {
        if self.compaction.is_none() {
            return Err(StoreError::Aborted(
                "store was cleared during compaction".to_string(),
            ));
        }
        for key in keys {
            let Some(old) = self.index.get(key).copied() else {
                continue;
            };
            if old.segment != Segment::Main {
                continue;
            }
            let record = Record::read_at(&mut self.main, old.offset)?;
            let location = self.append(&record)?;
            self.live_bytes = self.live_bytes - old.frame_len + location.frame_len;
            self.index.insert(key.clone(), location);
            stats.records_copied += 1;
        }
        Ok(())
    }

    fn finish_compaction(
        &mut self,
        compact_path: &Path,
        data_path: &Path,
        stats: &mut ReclaimStats,
    ) -> Result<(), StoreError> {
        // Keys inserted into the old log after the key list was taken
        let stragglers: Vec<Vec<u8>> = self
            .index
            .iter()
            .filter(|(_, l)| l.segment == Segment::Main)
            .map(|(k, _)| k.clone())
            .collect();
        self.copy_live(&stragglers, stats)?;

        let Some(compaction) = self.compaction.as_ref() else {
            return Err(StoreError::Aborted(
                "compaction state disappeared".to_string(),
            ));
        };
        compaction.file.sync_all()?;
        fs::rename(compact_path, data_path)?;

        if let Some(compaction) = self.compaction.take() {
            self.main = compaction.file;
            self.main_len = compaction.len;
        }
        for location in self.index.values_mut() {
            location.segment = Segment::Main;
        }
        self.dead_key_bytes = 0;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), StoreError> {
        let Some(mut compaction) = self.compaction.take() else {
            return Ok(());
        };

        let moved: Vec<(Vec<u8>, Location)> = self
            .index
            .iter()
            .filter(|(_, l)| l.segment == Segment::Compact)
            .map(|(k, l)| (k.clone(), *l))
            .collect();
        for (key, location) in moved {
            let record = Record::read_at(&mut compaction.file, location.offset)?;
            let restored = self.append(&record)?;
            self.live_bytes = self.live_bytes - location.frame_len + restored.frame_len;
            self.index.insert(key, restored);
        }

        for key in compaction.removed {
            if !self.index.contains_key(&key) {
                let record = Record::Delete {
                    seq: self.take_seq(),
                    key,
                };
                self.append(&record)?;
            }
        }
        self.main.sync_data()?;
        Ok(())
    }
}

// =============================================================================
// Recovery Helpers
// =============================================================================

fn open_append(path: &Path) -> Result<File, StoreError> {
    Ok(OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(path)?)
}

fn truncate_torn_tail(path: &Path) -> Result<(), StoreError> {
    let scan = scan_log(path)?;
    if let Some(reason) = scan.torn {
        let file_len = fs::metadata(path)?.len();
        tracing::warn!(
            "Truncating {} from {} to {} bytes: {}",
            path.display(),
            file_len,
            scan.valid_len,
            reason
        );
        let file = OpenOptions::new().write(true).open(path)?;
        file.set_len(scan.valid_len)?;
        file.sync_all()?;
    }
    Ok(())
}

/// Rewrite the union of both logs into a fresh `data.log`
fn merge_interrupted_compaction(data_path: &Path, compact_path: &Path) -> Result<(), StoreError> {
    let mut replay = Replay::default();
    let mut records = scan_log(data_path)?.records;
    records.extend(scan_log(compact_path)?.records);
    for logged in records {
        match logged.record {
            Record::Put { seq, key, value } => replay.apply(seq, key, Some(value)),
            Record::Delete { seq, key } => replay.apply(seq, key, None),
        }
    }

    let merged_path = data_path.with_extension("log.merge");
    let mut merged = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&merged_path)?;
    let mut count = 0u64;
    for (key, seq, value) in replay.into_live_with_seq() {
        merged.write_all(&Record::Put { seq, key, value }.encode()?)?;
        count += 1;
    }
    merged.sync_all()?;
    drop(merged);

    fs::rename(&merged_path, data_path)?;
    fs::remove_file(compact_path)?;
    tracing::warn!(
        "Recovered interrupted compaction: merged {} live entries into {}",
        count,
        data_path.display()
    );
    Ok(())
}

/// Newest-wins view of one or more logs
struct Replay<T> {
    latest: BTreeMap<Vec<u8>, (u64, Option<T>)>,
    max_seq: u64,
    dead_key_bytes: u64,
}

impl<T> Default for Replay<T> {
    fn default() -> Self {
        Self {
            latest: BTreeMap::new(),
            max_seq: 0,
            dead_key_bytes: 0,
        }
    }
}

impl<T> Replay<T> {
    /// `None` is a tombstone
    fn apply(&mut self, seq: u64, key: Vec<u8>, value: Option<T>) {
        self.max_seq = self.max_seq.max(seq);
        match self.latest.entry(key) {
            Entry::Occupied(mut slot) => {
                let key_len = slot.key().len() as u64;
                if slot.get().0 > seq {
                    self.dead_key_bytes += key_len;
                } else {
                    if slot.get().1.is_some() {
                        self.dead_key_bytes += key_len;
                    }
                    slot.insert((seq, value));
                }
            }
            Entry::Vacant(slot) => {
                slot.insert((seq, value));
            }
        }
    }

    fn into_live_with_seq(self) -> impl Iterator<Item = (Vec<u8>, u64, T)> {
        self.latest
            .into_iter()
            .filter_map(|(key, (seq, value))| value.map(|v| (key, seq, v)))
    }

    fn into_live(self) -> impl Iterator<Item = (Vec<u8>, T)> {
        self.into_live_with_seq().map(|(key, _, value)| (key, value))
    }
}
