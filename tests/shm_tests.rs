//! Tests for the shared-memory ring
//!
//! These tests verify:
//! - Producers attaching to a writer's ring file
//! - Closed and missing rings reported to producers
//! - Inline capacity limits
//! - Ring indices surviving a writer restart

mod common;

use std::thread;
use std::time::Duration;

use slotkv::{AsyncWriter, CommandQueue, Config, QueueError, QueueMode, ShmProducer};
use tempfile::TempDir;

use common::{wait_until, RecordingStore};

// =============================================================================
// Helper Functions
// =============================================================================

const WAIT: Duration = Duration::from_secs(5);

fn shm_config(temp_dir: &TempDir) -> Config {
    Config::builder()
        .data_dir(temp_dir.path())
        .async_writer(true)
        .queue_mode(QueueMode::SharedMemory)
        .queue_capacity(8)
        .shm_key_capacity(32)
        .shm_value_capacity(128)
        .lock_timeout(Duration::from_millis(200))
        .build()
}

// =============================================================================
// Attach Tests
// =============================================================================

#[test]
fn test_producer_publishes_into_writer_ring() {
    let temp_dir = TempDir::new().unwrap();
    let config = shm_config(&temp_dir);
    let store = RecordingStore::new();
    let writer = AsyncWriter::start(store.clone(), &config).unwrap();

    let producer = ShmProducer::attach_config(&config).unwrap();
    assert!(producer.writer_active());
    assert_eq!(producer.mode(), QueueMode::SharedMemory);

    producer.enqueue_add(b"from", b"producer", true).unwrap();
    writer.enqueue_add(b"from", b"writer", true).unwrap();
    producer.enqueue_remove(b"missing").unwrap();
    assert!(wait_until(WAIT, || !producer.is_busy()));

    assert_eq!(store.get(b"from"), Some(b"writer".to_vec()));
    assert_eq!(producer.stats().enqueued, 2);
    assert_eq!(writer.stats().failed, 1);
}

#[test]
fn test_many_producers_share_ring() {
    let temp_dir = TempDir::new().unwrap();
    let config = shm_config(&temp_dir);
    let store = RecordingStore::new();
    let _writer = AsyncWriter::start(store.clone(), &config).unwrap();

    let handles: Vec<_> = (0..4)
        .map(|p| {
            let config = config.clone();
            thread::spawn(move || {
                let producer = ShmProducer::attach_config(&config).unwrap();
                for i in 0..50 {
                    producer
                        .enqueue_add(format!("p{}_{}", p, i).as_bytes(), b"v", true)
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let producer = ShmProducer::attach_config(&config).unwrap();
    assert!(wait_until(WAIT, || !producer.is_busy()));
    assert_eq!(store.contents().len(), 200);
}

#[test]
fn test_attach_after_stop_is_closed() {
    let temp_dir = TempDir::new().unwrap();
    let config = shm_config(&temp_dir);
    let writer = AsyncWriter::start(RecordingStore::new(), &config).unwrap();
    let producer = ShmProducer::attach_config(&config).unwrap();

    writer.stop().unwrap();

    assert!(!producer.writer_active());
    assert!(matches!(
        producer.enqueue_add(b"k", b"v", true),
        Err(QueueError::Closed)
    ));
    assert!(matches!(
        ShmProducer::attach_config(&config),
        Err(QueueError::Closed)
    ));
}

#[test]
fn test_attach_without_ring_fails() {
    let temp_dir = TempDir::new().unwrap();
    let config = shm_config(&temp_dir);

    assert!(ShmProducer::attach_config(&config).is_err());
}

// =============================================================================
// Capacity Tests
// =============================================================================

#[test]
fn test_oversized_payload_rejected_without_ticket() {
    let temp_dir = TempDir::new().unwrap();
    let config = shm_config(&temp_dir);
    let writer = AsyncWriter::start(RecordingStore::new(), &config).unwrap();

    let long_key = vec![b'k'; 33];
    let long_value = vec![b'v'; 129];
    assert!(matches!(
        writer.enqueue_add(&long_key, b"v", true),
        Err(QueueError::Capacity(_))
    ));
    assert!(matches!(
        writer.enqueue_add(b"k", &long_value, true),
        Err(QueueError::Capacity(_))
    ));

    assert_eq!(writer.position().produced, 0);
    writer.enqueue_add(&long_key[..32], &long_value[..128], true).unwrap();
}

#[test]
fn test_ring_geometry_must_match_on_restart() {
    let temp_dir = TempDir::new().unwrap();
    let config = shm_config(&temp_dir);
    AsyncWriter::start(RecordingStore::new(), &config)
        .unwrap()
        .stop()
        .unwrap();

    let mut resized = config.clone();
    resized.queue_capacity = 16;
    assert!(matches!(
        AsyncWriter::start(RecordingStore::new(), &resized),
        Err(QueueError::Layout(_))
    ));
}

// =============================================================================
// Restart Tests
// =============================================================================

#[test]
fn test_indices_persist_across_writer_restart() {
    let temp_dir = TempDir::new().unwrap();
    let config = shm_config(&temp_dir);

    {
        let store = RecordingStore::new();
        let writer = AsyncWriter::start(store.clone(), &config).unwrap();
        for i in 0..10 {
            writer
                .enqueue_add(format!("k{}", i).as_bytes(), b"v", true)
                .unwrap();
        }
        assert!(wait_until(WAIT, || !writer.is_busy()));
        writer.stop().unwrap();
    }

    let store = RecordingStore::new();
    let writer = AsyncWriter::start(store.clone(), &config).unwrap();
    let position = writer.position();
    assert_eq!(position.produced, 10);
    assert_eq!(position.consumed, 10);

    writer.enqueue_add(b"after", b"restart", true).unwrap();
    assert!(wait_until(WAIT, || !writer.is_busy()));
    assert_eq!(store.get(b"after"), Some(b"restart".to_vec()));
    assert_eq!(writer.position().consumed, 11);
}
