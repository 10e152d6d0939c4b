//! Conversation thread modules.
//!
//! - `storage`: injected key-value storage port and backends.
//! - `store`: multi-thread conversation state, persistence record, and
//!   debounced flushing.

use thiserror::Error;

/// Injected storage port and the bundled backends.
pub mod storage;
/// Thread store and persisted record types.
pub mod store;

/// Errors produced by thread persistence and store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Storage backend I/O failure.
    #[error("storage io: {0}")]
    Io(#[from] std::io::Error),

    /// Persisted record could not be encoded or decoded.
    #[error("thread record serialization: {0}")]
    Serde(#[from] serde_json::Error),

    /// Persisted record carries a schema version this build cannot read.
    #[error("unsupported thread schema version {0}")]
    UnsupportedVersion(u32),

    /// Operation referenced a thread id that is not registered.
    #[error("unknown thread id: {0}")]
    UnknownThread(String),
}
