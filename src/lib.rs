//! # cfshard
//!
//! The per-shard write/read admission and durability core of a
//! column-family storage engine:
//! - Keyspace and table registry with schema sync checks
//! - Commitlog-backed write path with materialized views and counters
//! - Dirty memory accounting that throttles writers and drives flushes
//! - A feedback controller tuning flush I/O shares to memory pressure
//! - Read admission by count and memory, with a cache of paused queries
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Database                             │
//! │        (registry, apply / query / truncate, counters)        │
//! └──────┬──────────────────────┬───────────────────────┬───────┘
//!        │ writes               │ writes                │ reads
//!        ▼                      ▼                       ▼
//!   ┌───────────┐      ┌─────────────────┐     ┌─────────────────┐
//!   │ Commitlog │      │  Dirty Memory   │     │ Read Semaphores │
//!   │ (append)  │      │  (gate, flush   │     │ + Querier Cache │
//!   └───────────┘      │   loop)         │     └─────────────────┘
//!                      └───────┬─────────┘
//!                              ▼
//!                      ┌─────────────────┐     ┌─────────────────┐
//!                      │  Memtable List  │────▶│    Storage      │
//!                      │ (seal, flush)   │     │   (SSTables)    │
//!                      └─────────────────┘     └────────▲────────┘
//!                                                       │ shares
//!                                              ┌────────┴────────┐
//!                                              │ Flush Controller│
//!                                              └─────────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;
pub mod utils;

pub mod schema;
pub mod replication;
pub mod keyspace;
pub mod mutation;
pub mod query;

pub mod commitlog;
pub mod storage;
pub mod memtable;
pub mod dirty_memory;
pub mod backlog;
pub mod admission;
pub mod table;
pub mod database;
pub mod multishard;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use config::{CommitlogSyncStrategy, Config};
pub use database::{Database, DatabaseBuilder, DbStatsSnapshot};
pub use error::{Result, ShardError};
pub use keyspace::KeyspaceMetadata;
pub use mutation::{ClusteringKey, Mutation, PartitionKey};
pub use query::{PartitionRange, QueryOptions, QueryResult, ReadCommand};
pub use schema::{Schema, SchemaRef, TableId};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of cfshard
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
