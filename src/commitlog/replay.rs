//! Commitlog replay
//!
//! Reads the segments a previous run left behind, in segment order.

use std::path::PathBuf;

use tracing::{info, warn};

use crate::error::Result;
use crate::schema::TableId;

use super::{ReplayPosition, SegmentReader, SegmentWriter};

/// One record recovered from the log
#[derive(Debug, Clone)]
pub struct ReplayedEntry {
    pub position: ReplayPosition,
    pub table_id: TableId,
    pub mutation: Vec<u8>,
}

/// Result of a replay pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReplayResult {
    /// Number of records successfully recovered
    pub entries_recovered: u64,

    /// Number of segments whose reading stopped at a corrupt record
    pub segments_corrupted: u64,

    /// Number of segments read
    pub segments_replayed: u64,

    /// Last valid position
    pub last_position: ReplayPosition,

    /// Whether some segment ended in a partial write
    pub was_truncated: bool,
}

/// Reads records out of leftover segments
pub struct CommitLogReplayer;

impl CommitLogReplayer {
    /// Recover entries from `segments`
    ///
    /// This will:
    /// 1. Order segments by id
    /// 2. Read each until its end of valid data
    /// 3. Stop reading a segment at its first corrupt record and carry on with the next
    /// 4. Return all valid records in log order
    pub fn recover(segments: &[PathBuf]) -> Result<(Vec<ReplayedEntry>, ReplayResult)> {
        let mut ordered: Vec<(u64, &PathBuf)> = segments
            .iter()
            .filter_map(|p| SegmentWriter::parse_segment_id(p).map(|id| (id, p)))
            .collect();
        ordered.sort_by_key(|(id, _)| *id);

        let mut entries = Vec::new();
        let mut result = ReplayResult::default();

        for (id, path) in ordered {
            let mut reader = SegmentReader::open(path)?;
            loop {
                match reader.next_entry() {
                    Ok(Some((position, record))) => {
                        result.entries_recovered += 1;
                        result.last_position = position;
                        entries.push(ReplayedEntry {
                            position,
                            table_id: record.table_id,
                            mutation: record.mutation,
                        });
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(segment = id, error = %e, "Stopping replay of corrupt commitlog segment");
                        result.segments_corrupted += 1;
                        break;
                    }
                }
            }
            result.was_truncated |= reader.truncated_tail();
            result.segments_replayed += 1;
        }

        if result.segments_replayed > 0 {
            info!(
                segments = result.segments_replayed,
                entries = result.entries_recovered,
                corrupted = result.segments_corrupted,
                last_position = %result.last_position,
                "Read commitlog segments"
            );
        }

        Ok((entries, result))
    }
}
