//! Storage Module
//!
//! Per-table persistent storage: immutable sstables written from flushed
//! memtables, plus the table directory's snapshot and truncation bookkeeping.
//!
//! ## Responsibilities
//! - Persist sealed memtables as sorted, checksummed files
//! - Point lookups and range scans merged across all sstables of a table
//! - Discard sstables older than a truncation time
//! - Snapshots by hard link
//!
//! ## Directory Layout
//! ```text
//! {data_dir}/{keyspace}/{table}-{id}/
//!   ├── sst-000001.db
//!   ├── sst-000002.db
//!   ├── truncated.rec
//!   └── snapshots/{name}/sst-*.db
//! ```
//!
//! The byte layout of an sstable is described in [`sstable`]. Compaction is
//! not part of this crate; sstables accumulate until truncated.

mod manager;
pub mod sstable;
mod writer;

pub use manager::{TableStorage, TruncationRecord};
pub use sstable::{SstableBuilder, SstableInfo, SstableReader};
pub use writer::{SstableWriter, StorageWriter};
