//! Error types for slotkv
//!
//! Two layers: `StoreError` for failures inside the storage collaborator and
//! `QueueError` for everything a producer or the writer handle can observe.

use thiserror::Error;

/// Result type alias using QueueError
pub type Result<T> = std::result::Result<T, QueueError>;

/// Errors raised by a [`Store`](crate::store::Store) implementation
#[derive(Debug, Error)]
pub enum StoreError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Data Errors
    // -------------------------------------------------------------------------
    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Key already exists")]
    KeyExists,

    #[error("Key not found")]
    KeyNotFound,

    // -------------------------------------------------------------------------
    // Lifecycle Errors
    // -------------------------------------------------------------------------
    #[error("Operation aborted: {0}")]
    Aborted(String),

    #[error("Another writer holds {0}")]
    WriterExists(String),
}

impl StoreError {
    /// Outcomes a caller expects in normal operation (duplicate insert,
    /// deleting an absent key) rather than genuine failures.
    pub fn is_expected(&self) -> bool {
        matches!(self, StoreError::KeyExists | StoreError::KeyNotFound)
    }
}

impl From<bincode::Error> for StoreError {
    fn from(err: bincode::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Errors surfaced by the command queue
#[derive(Debug, Error)]
pub enum QueueError {
    // -------------------------------------------------------------------------
    // Producer-side Errors (returned synchronously from enqueue)
    // -------------------------------------------------------------------------
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Capacity error: {0}")]
    Capacity(String),

    #[error("Queue is closed")]
    Closed,

    // -------------------------------------------------------------------------
    // Consumer-side Errors
    // -------------------------------------------------------------------------
    /// Unrecoverable lock failure; the consumer loop stops on this.
    #[error("Lock failure: {0}")]
    Lock(String),

    /// A reclamation pass was already running (informational).
    #[error("Reclamation skipped: a pass is already running")]
    ReclaimSkipped,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    // -------------------------------------------------------------------------
    // Setup Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Shared ring layout error: {0}")]
    Layout(String),
}
