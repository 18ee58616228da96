//! SSTable Iterator
//!
//! Sequential iteration over the partitions of an sstable, from the first
//! entry or from any entry offset taken from the index.

use std::fs::File;
use std::io::{BufReader, Seek, SeekFrom};

use parking_lot::MutexGuard;

use crate::error::Result;
use crate::mutation::{Partition, PartitionKey};

use super::reader::read_next_entry;
use super::HEADER_SIZE;

/// Iterator over sstable partitions in sorted key order.
/// Holds the reader's file lock until dropped.
pub struct SstableIterator<'a> {
    file: MutexGuard<'a, BufReader<File>>,
    /// Stop reading when we reach this offset (start of index block)
    end_offset: u64,
    /// Current position in file
    current_offset: u64,
}

impl<'a> SstableIterator<'a> {
    /// Iterate every entry
    pub(super) fn new(file: MutexGuard<'a, BufReader<File>>, end_offset: u64) -> Result<Self> {
        Self::starting_at(file, HEADER_SIZE, end_offset)
    }

    /// Iterate from the entry at `offset`, which must start an entry
    pub(super) fn starting_at(
        mut file: MutexGuard<'a, BufReader<File>>,
        offset: u64,
        end_offset: u64,
    ) -> Result<Self> {
        file.seek(SeekFrom::Start(offset))?;
        Ok(Self {
            file,
            end_offset,
            current_offset: offset,
        })
    }
}

impl<'a> Iterator for SstableIterator<'a> {
    type Item = Result<(PartitionKey, Partition)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current_offset >= self.end_offset {
            return None;
        }
        match read_next_entry(&mut self.file) {
            Ok((key, partition, size)) => {
                self.current_offset += size;
                Some(Ok((key, partition)))
            }
            Err(e) => {
                // Nothing sensible follows a broken entry
                self.current_offset = self.end_offset;
                Some(Err(e))
            }
        }
    }
}
