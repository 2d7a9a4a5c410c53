//! Error types for the telemetry core.
//!
//! Only identity and configuration errors propagate synchronously to
//! Control API callers; connection and persistence failures are contained
//! and retried where they occur.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("machine already exists: {0}")]
    DuplicateMachine(String),

    #[error("machine not found: {0}")]
    UnknownMachine(String),

    #[error("invalid machine config for '{name}': {reason}")]
    InvalidConfig { name: String, reason: String },

    /// Transient network or protocol failure; always retried via backoff.
    #[error("connection error: {0}")]
    Connection(String),

    #[error("persistence error at {path}: {source}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
