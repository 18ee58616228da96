//! Segment reader
//!
//! Reads records back from a segment file. A torn frame at the tail (a write
//! cut short by a crash) ends the segment; a checksum mismatch is corruption.

use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use std::path::Path;

use crate::error::{Result, ShardError};

use super::{CommitLogRecord, ReplayPosition, SegmentWriter, HEADER_SIZE};

/// Reads records from one segment
pub struct SegmentReader {
    id: u64,
    reader: BufReader<File>,
    offset: u64,
    truncated_tail: bool,
}

impl SegmentReader {
    pub fn open(path: &Path) -> Result<Self> {
        let id = SegmentWriter::parse_segment_id(path).ok_or_else(|| {
            ShardError::LogCorruption(format!("not a segment file: {}", path.display()))
        })?;
        let file = File::open(path)?;
        Ok(Self {
            id,
            reader: BufReader::new(file),
            offset: 0,
            truncated_tail: false,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// True once reading stopped at an incomplete frame
    pub fn truncated_tail(&self) -> bool {
        self.truncated_tail
    }

    /// Read the next record. `Ok(None)` at the end of valid data.
    pub fn next_entry(&mut self) -> Result<Option<(ReplayPosition, CommitLogRecord)>> {
        let mut header = [0u8; HEADER_SIZE];
        match read_full(&mut self.reader, &mut header)? {
            0 => return Ok(None),
            n if n < HEADER_SIZE => {
                self.truncated_tail = true;
                return Ok(None);
            }
            _ => {}
        }

        let mut word = [0u8; 8];
        word.copy_from_slice(&header[0..8]);
        let stored_position = u64::from_le_bytes(word);
        let mut half = [0u8; 4];
        half.copy_from_slice(&header[8..12]);
        let stored_crc = u32::from_le_bytes(half);
        half.copy_from_slice(&header[12..16]);
        let len = u32::from_le_bytes(half) as usize;

        // Zeroed space past the last record (preallocated or torn)
        if stored_position == 0 && stored_crc == 0 && len == 0 && self.offset != 0 {
            self.truncated_tail = true;
            return Ok(None);
        }

        let mut data = vec![0u8; len];
        if read_full(&mut self.reader, &mut data)? < len {
            self.truncated_tail = true;
            return Ok(None);
        }

        if stored_position != self.offset {
            return Err(ShardError::LogCorruption(format!(
                "segment {} offset {}: frame claims position {}",
                self.id, self.offset, stored_position
            )));
        }
        if CommitLogRecord::compute_crc(&data) != stored_crc {
            return Err(ShardError::LogCorruption(format!(
                "segment {} offset {}: checksum mismatch",
                self.id, self.offset
            )));
        }

        let record = CommitLogRecord::deserialize(&data)?;
        let position = ReplayPosition::new(self.id, self.offset);
        self.offset += (HEADER_SIZE + len) as u64;
        Ok(Some((position, record)))
    }

    /// Iterate over all valid records
    pub fn entries(self) -> SegmentIterator {
        SegmentIterator {
            reader: self,
            done: false,
        }
    }
}

/// Like `read_exact` but reports how much was read before EOF
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

/// Iterator over segment records; stops after the first error
pub struct SegmentIterator {
    reader: SegmentReader,
    done: bool,
}

impl Iterator for SegmentIterator {
    type Item = Result<(ReplayPosition, CommitLogRecord)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.reader.next_entry() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
