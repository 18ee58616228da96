//! SSTable Module
//!
//! Sorted String Table - immutable on-disk partitions of one table, sorted by partition key.
//!
//! ## File Format
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │ Header (14 bytes)                                       │
//! │   Magic: "CFSS" (4) | Version: u16 (2) | Count: u64 (8) │
//! ├─────────────────────────────────────────────────────────┤
//! │ Data Block (variable)                                   │
//! │   [KeyLen: u32][ValLen: u32][Key][bincode(Partition)]   │
//! │   ... repeated for each partition ...                   │
//! ├─────────────────────────────────────────────────────────┤
//! │ Index Block (variable)                                  │
//! │   [KeyLen: u32][Offset: u64][Key]                       │
//! ├─────────────────────────────────────────────────────────┤
//! │ Footer (40 bytes)                                       │
//! │   IndexOffset: u64 | DataCRC: u32 | Padding (4)         │
//! │   MaxPosition: segment u64, offset u64                  │
//! │   CreatedAt: i64 (unix millis)                          │
//! └─────────────────────────────────────────────────────────┘
//! ```

mod builder;
mod iterator;
mod reader;

use std::path::PathBuf;

pub use builder::SstableBuilder;
pub use iterator::SstableIterator;
pub use reader::SstableReader;

use crate::commitlog::ReplayPosition;
use crate::mutation::PartitionKey;

// =============================================================================
// Shared Constants (used by builder, reader, iterator)
// =============================================================================

/// Magic bytes identifying an sstable file
pub(crate) const MAGIC: &[u8; 4] = b"CFSS";

/// Current sstable format version
pub(crate) const VERSION: u16 = 1;

/// Header size: Magic (4) + Version (2) + EntryCount (8) = 14 bytes
pub(crate) const HEADER_SIZE: u64 = 14;

/// Footer size: IndexOffset (8) + DataCRC (4) + Padding (4) + MaxPosition (16) + CreatedAt (8)
pub(crate) const FOOTER_SIZE: u64 = 40;

// =============================================================================
// SSTable Metadata
// =============================================================================

/// Metadata of a written sstable
#[derive(Debug, Clone)]
pub struct SstableInfo {
    /// Path to the sstable file
    pub path: PathBuf,
    /// Generation number, from the file name
    pub generation: u64,
    /// Number of partitions in this sstable
    pub entry_count: u64,
    /// Smallest partition key (for range filtering)
    pub min_key: Option<PartitionKey>,
    /// Largest partition key (for range filtering)
    pub max_key: Option<PartitionKey>,
    /// File size in bytes
    pub file_size: u64,
    /// Newest log position of the data written into this sstable
    pub max_position: ReplayPosition,
    /// Creation time, unix millis; compared against truncation times
    pub created_at: i64,
}

impl SstableInfo {
    /// Quick check if a key might be in this sstable (range check)
    /// Returns false if key is definitely outside [min_key, max_key]
    pub fn might_contain(&self, key: &PartitionKey) -> bool {
        match (&self.min_key, &self.max_key) {
            (Some(min), Some(max)) => key >= min && key <= max,
            _ => false,
        }
    }
}
