//! Tests for Engine
//!
//! These tests verify:
//! - Direct-mode operations and the single-writer lock
//! - Asynchronous routing end to end against the log store
//! - Backup and reclamation through the queue
//! - Engine lifecycle (open/close/reopen)

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use slotkv::store::read_snapshot;
use slotkv::{Config, Engine, QueueError, QueueMode, ReclaimThresholds, StoreError};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

const WAIT: Duration = Duration::from_secs(5);

fn async_config(temp_dir: &TempDir, mode: QueueMode, capacity: u32) -> Config {
    Config::builder()
        .data_dir(temp_dir.path())
        .async_writer(true)
        .queue_mode(mode)
        .queue_capacity(capacity)
        .build()
}

fn setup_async_engine(mode: QueueMode, capacity: u32) -> (TempDir, Engine) {
    let temp_dir = TempDir::new().unwrap();
    let engine = Engine::open(async_config(&temp_dir, mode, capacity)).unwrap();
    (temp_dir, engine)
}

// =============================================================================
// Direct Mode Tests
// =============================================================================

#[test]
fn test_engine_open_creates_files() {
    let temp_dir = TempDir::new().unwrap();
    let data_dir = temp_dir.path().join("mydb");

    let _engine = Engine::open_path(&data_dir).unwrap();

    assert!(data_dir.join("data.log").exists());
    assert!(data_dir.join("_writer.lock").exists());
}

#[test]
fn test_direct_put_get_delete() {
    let temp_dir = TempDir::new().unwrap();
    let engine = Engine::open_path(temp_dir.path()).unwrap();

    engine.put(b"hello", b"world").unwrap();
    assert_eq!(engine.get(b"hello").unwrap(), Some(b"world".to_vec()));

    engine.delete(b"hello").unwrap();
    assert_eq!(engine.get(b"hello").unwrap(), None);
    assert!(!engine.is_busy());
}

#[test]
fn test_direct_errors_are_returned() {
    let temp_dir = TempDir::new().unwrap();
    let engine = Engine::open_path(temp_dir.path()).unwrap();
    engine.put(b"key", b"v1").unwrap();

    assert!(matches!(
        engine.put_with(b"key", b"v2", false),
        Err(QueueError::Store(StoreError::KeyExists))
    ));
    assert!(matches!(
        engine.delete(b"missing"),
        Err(QueueError::Store(StoreError::KeyNotFound))
    ));
}

#[test]
fn test_second_writer_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let _first = Engine::open_path(temp_dir.path()).unwrap();

    let second = Engine::open_path(temp_dir.path());

    assert!(matches!(
        second,
        Err(QueueError::Store(StoreError::WriterExists(_)))
    ));
}

#[test]
fn test_writer_lock_released_on_close() {
    let temp_dir = TempDir::new().unwrap();
    let engine = Engine::open_path(temp_dir.path()).unwrap();
    engine.put(b"k", b"v").unwrap();
    engine.close().unwrap();

    let engine = Engine::open_path(temp_dir.path()).unwrap();
    assert_eq!(engine.get(b"k").unwrap(), Some(b"v".to_vec()));
}

#[test]
fn test_direct_collect_resource_prunes() {
    let temp_dir = TempDir::new().unwrap();
    let engine = Engine::open_path(temp_dir.path()).unwrap();
    for i in 0..10 {
        engine.put(format!("k{}", i).as_bytes(), b"v").unwrap();
    }

    engine
        .collect_resource(ReclaimThresholds {
            max_entries: 3,
            ..ReclaimThresholds::default()
        })
        .unwrap();

    assert_eq!(engine.len(), 3);
    assert_eq!(engine.store_stats().dead_bytes, 0);
}

// =============================================================================
// Asynchronous Mode Tests
// =============================================================================

#[test]
fn test_async_scenario_remove_then_add() {
    let (_temp, engine) = setup_async_engine(QueueMode::InProcess, 4);

    engine.put(b"a", b"1").unwrap();
    engine.put(b"a", b"2").unwrap();
    engine.delete(b"a").unwrap();
    engine.put(b"b", b"3").unwrap();
    assert!(engine.wait_idle(WAIT));

    assert_eq!(engine.get(b"a").unwrap(), None);
    assert_eq!(engine.get(b"b").unwrap(), Some(b"3".to_vec()));
    assert_eq!(engine.len(), 1);
}

#[test]
fn test_async_failures_are_counted_not_returned() {
    let (_temp, engine) = setup_async_engine(QueueMode::InProcess, 4);

    engine.put(b"key", b"v1").unwrap();
    engine.put_with(b"key", b"v2", false).unwrap();
    engine.delete(b"missing").unwrap();
    assert!(engine.wait_idle(WAIT));

    assert_eq!(engine.get(b"key").unwrap(), Some(b"v1".to_vec()));
    let stats = engine.queue_stats().unwrap();
    assert_eq!(stats.failed, 2);
    assert_eq!(stats.applied, 1);
}

#[test]
fn test_async_backup_then_reclaim() {
    let (temp, engine) = setup_async_engine(QueueMode::InProcess, 8);
    for i in 0..100 {
        engine.put(format!("key_{:03}", i).as_bytes(), b"value").unwrap();
    }
    for i in 0..100 {
        if i % 2 == 0 {
            engine.delete(format!("key_{:03}", i).as_bytes()).unwrap();
        }
    }

    let backup_dir = temp.path().join("backup");
    engine.backup(&backup_dir).unwrap();
    engine
        .collect_resource(ReclaimThresholds::default())
        .unwrap();
    assert!(engine.wait_idle(WAIT));

    let entries = read_snapshot(&backup_dir).unwrap();
    assert_eq!(entries.len(), 50);
    assert!(entries.iter().all(|(key, _)| engine.get(key).unwrap().is_some()));
    assert_eq!(engine.store_stats().dead_bytes, 0);
    assert_eq!(engine.queue_stats().unwrap().reclaim_passes, 1);
}

#[test]
fn test_async_concurrent_producers() {
    let (_temp, engine) = setup_async_engine(QueueMode::InProcess, 16);
    let engine = Arc::new(engine);

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                for i in 0..100 {
                    engine
                        .put(format!("t{}_k{}", t, i).as_bytes(), b"value")
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert!(engine.wait_idle(WAIT));
    assert_eq!(engine.len(), 400);
}

#[test]
fn test_async_close_applies_published_commands() {
    let temp_dir = TempDir::new().unwrap();
    {
        let engine = Engine::open(async_config(&temp_dir, QueueMode::InProcess, 8)).unwrap();
        for i in 0..50 {
            engine.put(format!("k{}", i).as_bytes(), b"v").unwrap();
        }
        assert!(engine.wait_idle(WAIT));
        engine.close().unwrap();
    }

    let engine = Engine::open_path(temp_dir.path()).unwrap();
    assert_eq!(engine.len(), 50);
}

#[test]
fn test_shared_memory_engine_round_trip() {
    let (temp, engine) = setup_async_engine(QueueMode::SharedMemory, 8);
    assert!(temp.path().join("_async_queue").exists());

    engine.put(b"a", b"1").unwrap();
    engine.put(b"b", b"2").unwrap();
    engine.delete(b"a").unwrap();
    assert!(engine.wait_idle(WAIT));

    assert_eq!(engine.get(b"a").unwrap(), None);
    assert_eq!(engine.get(b"b").unwrap(), Some(b"2".to_vec()));
    assert_eq!(engine.queue_position().unwrap().pending(), 0);
}

#[test]
fn test_invalid_config_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .data_dir(temp_dir.path())
        .async_writer(true)
        .queue_capacity(0)
        .build();

    assert!(matches!(Engine::open(config), Err(QueueError::Config(_))));
}
