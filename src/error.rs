//! Error types for cfshard
//!
//! Provides a unified error type for all shard operations.
//!
//! The error is `Clone` so that a single flush outcome can be handed to every
//! caller folded into a coalesced flush request.

use std::sync::Arc;

use thiserror::Error;
use uuid::Uuid;

use crate::commitlog::ReplayPosition;

/// Result type alias using ShardError
pub type Result<T> = std::result::Result<T, ShardError>;

/// Unified error type for shard operations
#[derive(Debug, Clone, Error)]
pub enum ShardError {
    // -------------------------------------------------------------------------
    // Not Found
    // -------------------------------------------------------------------------
    #[error("Can't find a keyspace {0}")]
    NoSuchKeyspace(String),

    #[error("Can't find a table with id {0}")]
    NoSuchTableId(Uuid),

    #[error("Can't find a table {table} in keyspace {keyspace}")]
    NoSuchTable { keyspace: String, table: String },

    // -------------------------------------------------------------------------
    // Registry Errors
    // -------------------------------------------------------------------------
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("attempted to mutate using not synced schema of {keyspace}.{table}, version={version}")]
    SchemaNotSynced {
        keyspace: String,
        table: String,
        version: Uuid,
    },

    // -------------------------------------------------------------------------
    // Admission Errors
    // -------------------------------------------------------------------------
    #[error("Operation timed out while waiting for {0}")]
    Timeout(&'static str),

    #[error("Overloaded: {0}")]
    Overloaded(String),

    #[error("Shard is shutting down")]
    ShuttingDown,

    // -------------------------------------------------------------------------
    // Write Path Errors
    // -------------------------------------------------------------------------
    #[error("Mutation at {position} for {table} reordered with truncate (low mark {low_mark})")]
    ReorderedWithTruncate {
        table: String,
        position: ReplayPosition,
        low_mark: ReplayPosition,
    },

    #[error("Failed to flush memtable of {table}: {reason}")]
    FlushFailed { table: String, reason: String },

    // -------------------------------------------------------------------------
    // I/O and Format Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Commitlog corruption detected: {0}")]
    LogCorruption(String),

    #[error("Storage error: {0}")]
    Storage(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}

impl ShardError {
    /// True when a deadline expired, counted apart from other failures.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ShardError::Timeout(_))
    }

    /// True for the two "unknown name/id" errors.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ShardError::NoSuchKeyspace(_) | ShardError::NoSuchTableId(_) | ShardError::NoSuchTable { .. }
        )
    }
}

impl From<std::io::Error> for ShardError {
    fn from(err: std::io::Error) -> Self {
        ShardError::Io(Arc::new(err))
    }
}

impl From<bincode::Error> for ShardError {
    fn from(err: bincode::Error) -> Self {
        ShardError::Serialization(err.to_string())
    }
}
