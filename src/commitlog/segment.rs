//! Segment writer
//!
//! Appends frames to one segment file and syncs according to the configured strategy.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::config::CommitlogSyncStrategy;
use crate::error::Result;

use super::{CommitLogRecord, ReplayPosition, HEADER_SIZE};

const SEGMENT_PREFIX: &str = "CommitLog-";
const SEGMENT_SUFFIX: &str = ".log";

/// Writes records to a single segment file
pub struct SegmentWriter {
    id: u64,
    path: PathBuf,
    writer: BufWriter<File>,
    /// Bytes written so far, also the offset of the next record
    offset: u64,
    /// Records written since the last fsync
    unsynced: usize,
    sync_strategy: CommitlogSyncStrategy,
}

impl SegmentWriter {
    /// Create a new, empty segment `id` in `dir`
    pub fn create(dir: &Path, id: u64, sync_strategy: CommitlogSyncStrategy) -> Result<Self> {
        let path = Self::segment_path(dir, id);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;

        Ok(Self {
            id,
            path,
            writer: BufWriter::new(file),
            offset: 0,
            unsynced: 0,
            sync_strategy,
        })
    }

    /// Append one record's data. Returns its position.
    pub fn append(&mut self, data: &[u8]) -> Result<ReplayPosition> {
        let position = ReplayPosition::new(self.id, self.offset);
        let frame = CommitLogRecord::frame(self.offset, data);

        self.writer.write_all(&frame)?;
        // Hand the frame to the OS on every append; fsync is up to the strategy
        self.writer.flush()?;
        self.offset += frame.len() as u64;
        self.unsynced += 1;

        let should_sync = match self.sync_strategy {
            CommitlogSyncStrategy::EveryWrite => true,
            CommitlogSyncStrategy::EveryNEntries { count } => self.unsynced >= count.max(1),
        };
        if should_sync {
            self.sync()?;
        }

        Ok(position)
    }

    /// Force sync to disk
    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        self.unsynced = 0;
        Ok(())
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.offset
    }

    /// Whether a record of `data_len` bytes still fits under `limit`
    pub fn fits(&self, data_len: usize, limit: u64) -> bool {
        self.offset == 0 || self.offset + (HEADER_SIZE + data_len) as u64 <= limit
    }

    /// "CommitLog-000042.log" for id 42
    pub fn segment_path(dir: &Path, id: u64) -> PathBuf {
        dir.join(format!("{}{:06}{}", SEGMENT_PREFIX, id, SEGMENT_SUFFIX))
    }

    /// "CommitLog-000042.log" → Some(42)
    pub fn parse_segment_id(path: &Path) -> Option<u64> {
        let name = path.file_name()?.to_string_lossy();
        let id = name.strip_prefix(SEGMENT_PREFIX)?.strip_suffix(SEGMENT_SUFFIX)?;
        id.parse().ok()
    }
}
