//! # slotkv
//!
//! An embedded key-value store with a single background writer:
//! - Fixed ring of command slots, multi-producer / single-consumer
//! - In-process or shared-memory rings, with lock recovery for producers
//!   that die holding a slot
//! - Reclamation that runs on the writer thread while queued commands keep
//!   flowing
//! - Log-structured storage with crash recovery and snapshots
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────┐   ┌──────────────────────┐
//! │  Producer threads    │   │  Producer processes  │
//! │  (Engine / writer)   │   │  (ShmProducer)       │
//! └──────────┬───────────┘   └──────────┬───────────┘
//!            │  ticket = produced++     │
//!            ▼                          ▼
//! ┌─────────────────────────────────────────────────┐
//! │            Slot Ring (capacity N)               │
//! │   heap slots  |  mmap'd slots + timed locks     │
//! └──────────────────────┬──────────────────────────┘
//!                        │ consumed++
//!                        ▼
//! ┌─────────────────────────────────────────────────┐
//! │       Consumer Loop  ──►  Reclamation Pass      │
//! │             ▲                    │ drain(64)    │
//! │             └────────────────────┘              │
//! └──────────────────────┬──────────────────────────┘
//!                        ▼
//!                ┌───────────────┐
//!                │   LogStore    │
//!                │  (data.log)   │
//!                └───────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod queue;
pub mod store;
pub mod engine;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{QueueError, Result, StoreError};
pub use config::{Config, QueueMode};
pub use engine::Engine;
pub use queue::{
    AsyncWriter, Command, CommandQueue, QueueStatsSnapshot, ReclaimThresholds, RingPosition,
    ShmProducer,
};
pub use store::{LogStore, ReclaimOutcome, ReclaimStats, Store, TaskDrain};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of slotkv
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
