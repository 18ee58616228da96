//! Commitlog Module
//!
//! Durability log shared by all tables of a shard. A mutation is appended
//! here before it is applied to a memtable; on restart, records not yet
//! covered by flushed sstables are replayed.
//!
//! ## Responsibilities
//! - Append framed, checksummed records into size-bounded segments
//! - Hand out replay positions, monotonic across segments and restarts
//! - Track, per segment, how many records of each table are still only in memory
//! - Delete segments once every table's records in them have been flushed
//! - Ask tables to flush when the log grows past its space budget
//!
//! ## Segment Format
//! ```text
//! CommitLog-000042.log
//! ┌─────────────────────────────────────────────┐
//! │ Record                                      │
//! │ ┌──────────────┬─────────┬────────┬───────┐ │
//! │ │ Position (8) │ CRC (4) │Len (4) │ Data  │ │
//! │ └──────────────┴─────────┴────────┴───────┘ │
//! │ ... repeated ...                            │
//! └─────────────────────────────────────────────┘
//! Data = bincode(CommitLogRecord { table_id, mutation })
//! ```

mod entry;
mod file;
mod reader;
mod replay;
mod segment;

pub use entry::{CommitLogRecord, HEADER_SIZE};
pub use file::FileCommitLog;
pub use reader::SegmentReader;
pub use replay::{CommitLogReplayer, ReplayResult, ReplayedEntry};
pub use segment::SegmentWriter;

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::schema::TableId;
use crate::utils::Deadline;

// =============================================================================
// Replay Positions
// =============================================================================

/// Position of a record in the log. Orders by segment, then offset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReplayPosition {
    pub segment_id: u64,
    pub position: u64,
}

impl ReplayPosition {
    pub fn new(segment_id: u64, position: u64) -> Self {
        Self {
            segment_id,
            position,
        }
    }

    /// The zero position, carried by writes that bypass the log
    pub fn zero() -> Self {
        Self::default()
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::zero()
    }
}

impl fmt::Display for ReplayPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.segment_id, self.position)
    }
}

/// Per-segment record counts of one table held by a memtable
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RpSet {
    counts: BTreeMap<u64, u64>,
}

impl RpSet {
    pub fn add(&mut self, position: ReplayPosition) {
        if !position.is_zero() {
            *self.counts.entry(position.segment_id).or_insert(0) += 1;
        }
    }

    pub fn segments(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.counts.iter().map(|(id, count)| (*id, *count))
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

// =============================================================================
// Dirty Tracking Handles
// =============================================================================

/// Receives the release of a record that never made it into a memtable
pub trait DirtyTracker: Send + Sync {
    fn release(&self, table_id: TableId, segment_id: u64, count: u64);
}

/// A freshly appended record. Until it is moved into a memtable with
/// `into_position`, dropping it marks the record clean again.
pub struct RpHandle {
    table_id: TableId,
    position: ReplayPosition,
    tracker: Option<Arc<dyn DirtyTracker>>,
}

impl RpHandle {
    pub fn new(table_id: TableId, position: ReplayPosition, tracker: Arc<dyn DirtyTracker>) -> Self {
        Self {
            table_id,
            position,
            tracker: Some(tracker),
        }
    }

    /// A handle that tracks nothing (no log, or replayed records)
    pub fn untracked(table_id: TableId, position: ReplayPosition) -> Self {
        Self {
            table_id,
            position,
            tracker: None,
        }
    }

    pub fn position(&self) -> ReplayPosition {
        self.position
    }

    pub fn table_id(&self) -> TableId {
        self.table_id
    }

    /// Transfer responsibility for the record to the caller
    pub fn into_position(mut self) -> ReplayPosition {
        self.tracker = None;
        self.position
    }
}

impl Drop for RpHandle {
    fn drop(&mut self) {
        if let Some(tracker) = self.tracker.take() {
            tracker.release(self.table_id, self.position.segment_id, 1);
        }
    }
}

impl fmt::Debug for RpHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpHandle")
            .field("table_id", &self.table_id)
            .field("position", &self.position)
            .field("tracked", &self.tracker.is_some())
            .finish()
    }
}

// =============================================================================
// Durability Log Contract
// =============================================================================

/// Invoked with a table and the newest position of its records in a segment
/// that the log wants to reclaim
pub type FlushHandler = Arc<dyn Fn(TableId, ReplayPosition) + Send + Sync>;

#[async_trait]
pub trait CommitLog: Send + Sync {
    /// Append a serialized mutation. Resolves once the record is written.
    async fn add_entry(&self, table_id: TableId, data: &[u8], deadline: Deadline) -> Result<RpHandle>;

    /// A memtable holding `flushed` records of `table_id` reached storage.
    /// `None` forgets all records of the table (truncate, drop).
    fn discard_completed_segments(&self, table_id: TableId, flushed: Option<&RpSet>);

    fn register_flush_handler(&self, table_id: TableId, handler: FlushHandler);

    fn unregister_flush_handler(&self, table_id: TableId);

    /// Position the next record would get
    fn current_position(&self) -> ReplayPosition;

    /// Segments left behind by a previous run
    fn segments_to_replay(&self) -> Vec<PathBuf> {
        Vec::new()
    }

    /// Delete the segments returned by `segments_to_replay` after a successful replay
    fn release_replayed_segments(&self) -> Result<()> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<()>;
}
