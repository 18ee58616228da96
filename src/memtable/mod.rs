//! MemTable Module
//!
//! In-memory data of a table that has not reached storage yet.
//!
//! ## Responsibilities
//! - Merge incoming mutations per partition key
//! - Charge every byte to the table's dirty memory pool
//! - Track the log records each memtable holds so segments can be reclaimed after flush
//! - Keep exactly one active memtable per list; sealed ones stay readable until flushed
//!
//! ## Lifecycle
//! ```text
//!   active ──seal──▶ sealed (virtual dirty released) ──flush ok──▶ dropped (real dirty released)
//!                        │
//!                        └──flush failed──▶ sealed, virtual dirty re-charged, retried later
//! ```
//!
//! ## Data Structure Choice
//! Using BTreeMap wrapped in RwLock:
//! - Ordered keys (required for sstable generation and range reads)
//! - Simple and correct first

mod list;
mod table;

pub use list::{FlushFuture, MemtableFlusher, MemtableList, MemtableListStats, FLUSH_FAILURE_BACKOFF};
pub use table::Memtable;
