//! Shared helpers for integration tests

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender, TryRecvError};
use parking_lot::Mutex;
use slotkv::{ReclaimOutcome, ReclaimStats, ReclaimThresholds, Store, StoreError, TaskDrain};

// =============================================================================
// Recording Store
// =============================================================================

/// In-memory store that records every call in order
#[derive(Default)]
pub struct RecordingStore {
    data: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
    events: Mutex<Vec<String>>,
    snapshots: Mutex<Vec<(PathBuf, BTreeMap<Vec<u8>, Vec<u8>>)>>,
    gate: Mutex<Option<ReclaimGate>>,
    remove_during_reclaim: AtomicBool,
}

/// Holds the next reclamation pass open until released
struct ReclaimGate {
    started: Sender<()>,
    release: Receiver<()>,
    drain_while_held: bool,
}

/// Test-side handles of a gate
pub struct GateHandle {
    pub started: Receiver<()>,
    pub release: Sender<()>,
}

impl GateHandle {
    /// Block until the pass is running
    pub fn wait_started(&self) {
        self.started
            .recv_timeout(Duration::from_secs(5))
            .expect("reclamation pass did not start");
    }

    pub fn open(&self) {
        let _ = self.release.send(());
    }
}

impl RecordingStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the next `reclaim` block until released. With `drain_while_held`
    /// the pass keeps draining queued commands while it waits.
    pub fn gate_next_reclaim(&self, drain_while_held: bool) -> GateHandle {
        let (started_tx, started_rx) = channel::bounded(1);
        let (release_tx, release_rx) = channel::bounded(1);
        *self.gate.lock() = Some(ReclaimGate {
            started: started_tx,
            release: release_rx,
            drain_while_held,
        });
        GateHandle {
            started: started_rx,
            release: release_tx,
        }
    }

    /// Let the queue apply removes while a pass runs
    pub fn allow_remove_during_reclaim(&self) {
        self.remove_during_reclaim.store(true, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    pub fn has_event(&self, event: &str) -> bool {
        self.events.lock().iter().any(|e| e == event)
    }

    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.data.lock().get(key).cloned()
    }

    pub fn contents(&self) -> BTreeMap<Vec<u8>, Vec<u8>> {
        self.data.lock().clone()
    }

    pub fn snapshots(&self) -> Vec<(PathBuf, BTreeMap<Vec<u8>, Vec<u8>>)> {
        self.snapshots.lock().clone()
    }

    fn record(&self, event: String) {
        self.events.lock().push(event);
    }
}

impl Store for RecordingStore {
    fn insert(&self, key: &[u8], value: &[u8], overwrite: bool) -> Result<(), StoreError> {
        let mut data = self.data.lock();
        if !overwrite && data.contains_key(key) {
            return Err(StoreError::KeyExists);
        }
        data.insert(key.to_vec(), value.to_vec());
        drop(data);
        self.record(format!(
            "add {}={}",
            String::from_utf8_lossy(key),
            String::from_utf8_lossy(value)
        ));
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        if self.data.lock().remove(key).is_none() {
            return Err(StoreError::KeyNotFound);
        }
        self.record(format!("remove {}", String::from_utf8_lossy(key)));
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.data.lock().clear();
        self.record("clear".to_string());
        Ok(())
    }

    fn snapshot_export(&self, target_dir: &Path) -> Result<(), StoreError> {
        let contents = self.contents();
        self.snapshots.lock().push((target_dir.to_path_buf(), contents));
        self.record(format!("backup {}", target_dir.display()));
        Ok(())
    }

    fn reclaim(
        &self,
        _thresholds: &ReclaimThresholds,
        drain: &mut dyn TaskDrain,
    ) -> Result<ReclaimOutcome, StoreError> {
        self.record("reclaim start".to_string());
        let mut stats = ReclaimStats::default();

        let gate = self.gate.lock().take();
        if let Some(gate) = gate {
            let _ = gate.started.send(());
            loop {
                match gate.release.try_recv() {
                    Ok(()) | Err(TryRecvError::Disconnected) => break,
                    Err(TryRecvError::Empty) => {}
                }
                if gate.drain_while_held {
                    if let Ok(applied) = drain.drain(64) {
                        stats.tasks_drained += applied as u64;
                    }
                }
                thread::sleep(Duration::from_millis(1));
            }
        }

        if let Ok(applied) = drain.drain(64) {
            stats.tasks_drained += applied as u64;
        }
        self.record("reclaim end".to_string());
        Ok(ReclaimOutcome::Completed(stats))
    }

    fn supports_remove_during_reclaim(&self) -> bool {
        self.remove_during_reclaim.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Polling
// =============================================================================

/// Poll `condition` until it holds or `timeout` passes
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(1));
    }
}

/// Position of `event` in `events`
pub fn position_of(events: &[String], event: &str) -> usize {
    events
        .iter()
        .position(|e| e == event)
        .unwrap_or_else(|| panic!("event {:?} not found in {:?}", event, events))
}
