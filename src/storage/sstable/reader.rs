//! SSTable Reader
//!
//! Opens sstable files and provides O(log n) partition lookups via an in-memory index.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::ops::Bound;
use std::path::Path;

use parking_lot::Mutex;

use crate::commitlog::ReplayPosition;
use crate::error::{Result, ShardError};
use crate::mutation::{Partition, PartitionKey};

use super::iterator::SstableIterator;
use super::{SstableInfo, FOOTER_SIZE, HEADER_SIZE, MAGIC, VERSION};

/// Reader for sstable files with in-memory index for O(log n) lookups
///
/// The file handle sits behind a mutex so a reader can be shared between
/// concurrent reads; each lookup seeks and reads under the lock.
pub struct SstableReader {
    file: Mutex<BufReader<File>>,
    /// In-memory index: key → file offset
    index: BTreeMap<PartitionKey, u64>,
    info: SstableInfo,
    data_crc: u32,
    /// Index block starting offset (for iteration)
    index_offset: u64,
}

fn le_u64(bytes: &[u8]) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(word)
}

fn le_u32(bytes: &[u8]) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(word)
}

impl SstableReader {
    /// Open an sstable for reading
    ///
    /// Loads the entire index into memory for fast lookups.
    pub fn open(path: &Path, generation: u64) -> Result<Self> {
        let mut file = File::open(path)?;
        let file_size = file.metadata()?.len();
        if file_size < HEADER_SIZE + FOOTER_SIZE {
            return Err(ShardError::Storage(format!(
                "sstable {} is too short ({} bytes)",
                path.display(),
                file_size
            )));
        }

        // Read and validate header
        let mut header = [0u8; HEADER_SIZE as usize];
        file.read_exact(&mut header)?;

        if &header[0..4] != MAGIC {
            return Err(ShardError::Storage(format!(
                "Invalid sstable magic: expected CFSS, got {:?}",
                &header[0..4]
            )));
        }

        let version = u16::from_le_bytes([header[4], header[5]]);
        if version != VERSION {
            return Err(ShardError::Storage(format!(
                "Unsupported sstable version: {}",
                version
            )));
        }

        let entry_count = le_u64(&header[6..14]);

        // Read footer
        file.seek(SeekFrom::End(-(FOOTER_SIZE as i64)))?;
        let mut footer = [0u8; FOOTER_SIZE as usize];
        file.read_exact(&mut footer)?;

        let index_offset = le_u64(&footer[0..8]);
        let data_crc = le_u32(&footer[8..12]);
        let max_position = ReplayPosition::new(le_u64(&footer[16..24]), le_u64(&footer[24..32]));
        let created_at = le_u64(&footer[32..40]) as i64;

        if index_offset < HEADER_SIZE || index_offset > file_size - FOOTER_SIZE {
            return Err(ShardError::Storage(format!(
                "sstable {} has index offset {} outside the file",
                path.display(),
                index_offset
            )));
        }

        // Load index into memory
        let mut index = BTreeMap::new();
        file.seek(SeekFrom::Start(index_offset))?;
        let index_block_size = file_size - FOOTER_SIZE - index_offset;
        let mut index_data = vec![0u8; index_block_size as usize];
        file.read_exact(&mut index_data)?;

        // Parse index entries: [key_len(4)][offset(8)][key]
        let mut pos = 0;
        while pos + 12 <= index_data.len() {
            let key_len = le_u32(&index_data[pos..]) as usize;
            let offset = le_u64(&index_data[pos + 4..]);
            pos += 12;
            if pos + key_len > index_data.len() {
                return Err(ShardError::Storage(format!(
                    "sstable {} has a truncated index",
                    path.display()
                )));
            }
            let key = PartitionKey::from(&index_data[pos..pos + key_len]);
            pos += key_len;
            index.insert(key, offset);
        }

        let info = SstableInfo {
            path: path.to_path_buf(),
            generation,
            entry_count,
            min_key: index.keys().next().cloned(),
            max_key: index.keys().next_back().cloned(),
            file_size,
            max_position,
            created_at,
        };

        Ok(Self {
            file: Mutex::new(BufReader::new(file)),
            index,
            info,
            data_crc,
            index_offset,
        })
    }

    /// Get a partition by key in O(log n) through the in-memory index
    pub fn get(&self, key: &PartitionKey) -> Result<Option<Partition>> {
        let offset = match self.index.get(key) {
            Some(&off) => off,
            None => return Ok(None),
        };
        let mut file = self.file.lock();
        read_entry_at(&mut file, offset).map(|(_, partition)| Some(partition))
    }

    /// Partitions with keys in `[start, end)`, in key order
    pub fn range(
        &self,
        start: Option<&PartitionKey>,
        end: Option<&PartitionKey>,
    ) -> Result<Vec<(PartitionKey, Partition)>> {
        if let (Some(s), Some(e)) = (start, end) {
            if s >= e {
                return Ok(Vec::new());
            }
        }
        let lower = start.map_or(Bound::Unbounded, Bound::Included);
        let upper = end.map_or(Bound::Unbounded, Bound::Excluded);
        let Some(first) = self.index.range((lower, upper)).next().map(|(_, off)| *off) else {
            return Ok(Vec::new());
        };

        // Entries are stored in key order: read on from the first match
        let mut partitions = Vec::new();
        for entry in SstableIterator::starting_at(self.file.lock(), first, self.index_offset)? {
            let (key, partition) = entry?;
            if end.is_some_and(|e| &key >= e) {
                break;
            }
            partitions.push((key, partition));
        }
        Ok(partitions)
    }

    pub fn info(&self) -> &SstableInfo {
        &self.info
    }

    pub fn entry_count(&self) -> u64 {
        self.info.entry_count
    }

    pub fn might_contain(&self, key: &PartitionKey) -> bool {
        self.info.might_contain(key)
    }

    /// Recompute the data checksum and compare it with the footer
    pub fn verify_checksum(&self) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(HEADER_SIZE))?;
        let index_offset = self.index_offset;
        let mut data = vec![0u8; (index_offset - HEADER_SIZE) as usize];
        file.read_exact(&mut data)?;
        if crc32fast::hash(&data) != self.data_crc {
            return Err(ShardError::Storage(format!(
                "sstable {} data checksum mismatch",
                self.info.path.display()
            )));
        }
        Ok(())
    }

    /// Sequential iteration over all partitions
    pub fn iter(&self) -> Result<SstableIterator<'_>> {
        SstableIterator::new(self.file.lock(), self.index_offset)
    }
}

/// Read the `[key_len][val_len][key][value]` entry at `offset`
pub(super) fn read_entry_at(
    file: &mut BufReader<File>,
    offset: u64,
) -> Result<(PartitionKey, Partition)> {
    file.seek(SeekFrom::Start(offset))?;
    read_next_entry(file).map(|(key, partition, _)| (key, partition))
}

/// Read one entry at the current position. Also returns its size in bytes.
pub(super) fn read_next_entry(file: &mut BufReader<File>) -> Result<(PartitionKey, Partition, u64)> {
    let mut header = [0u8; 8];
    file.read_exact(&mut header)?;
    let key_len = le_u32(&header[0..4]) as usize;
    let val_len = le_u32(&header[4..8]) as usize;

    let mut key = vec![0u8; key_len];
    file.read_exact(&mut key)?;
    let mut value = vec![0u8; val_len];
    file.read_exact(&mut value)?;

    let partition: Partition = bincode::deserialize(&value)?;
    Ok((PartitionKey::from(key), partition, (8 + key_len + val_len) as u64))
}
