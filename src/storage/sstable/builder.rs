//! SSTable Builder
//!
//! Writes sorted partitions to a new sstable file.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::commitlog::ReplayPosition;
use crate::error::{Result, ShardError};
use crate::mutation::{Partition, PartitionKey};

use super::{SstableInfo, HEADER_SIZE, MAGIC, VERSION};

/// Builder for creating new sstables from sorted partitions
pub struct SstableBuilder {
    /// Output file path
    path: PathBuf,
    /// Generation parsed by the caller from the path
    generation: u64,
    /// Buffered writer for performance
    writer: BufWriter<File>,
    /// Number of partitions written
    entry_count: u64,
    /// Current write position (for index)
    current_offset: u64,
    /// Index: key → file offset of entry
    index: Vec<(PartitionKey, u64)>,
    /// Running CRC hasher for data section
    data_hasher: crc32fast::Hasher,
}

impl SstableBuilder {
    /// Create a new sstable builder
    ///
    /// Writes header immediately; call `add()` in sorted key order,
    /// then `finish()` to write index and footer.
    pub fn new(path: &Path, generation: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;

        let mut writer = BufWriter::new(file);

        // Write header (entry_count placeholder, will be updated in finish)
        writer.write_all(MAGIC)?;
        writer.write_all(&VERSION.to_le_bytes())?;
        writer.write_all(&0u64.to_le_bytes())?;

        Ok(Self {
            path: path.to_path_buf(),
            generation,
            writer,
            entry_count: 0,
            current_offset: HEADER_SIZE,
            index: Vec::new(),
            data_hasher: crc32fast::Hasher::new(),
        })
    }

    /// Add a partition (must be called in sorted key order)
    pub fn add(&mut self, key: &PartitionKey, partition: &Partition) -> Result<()> {
        if let Some((last, _)) = self.index.last() {
            if key <= last {
                return Err(ShardError::Storage(format!(
                    "sstable keys out of order: {} after {}",
                    key, last
                )));
            }
        }
        let value = bincode::serialize(partition)?;
        self.index.push((key.clone(), self.current_offset));

        // Entry bytes: [key_len(4)][val_len(4)][key][value]
        let key_len_bytes = (key.len() as u32).to_le_bytes();
        let val_len_bytes = (value.len() as u32).to_le_bytes();

        for chunk in [&key_len_bytes[..], &val_len_bytes[..], key.as_bytes(), &value] {
            self.writer.write_all(chunk)?;
            self.data_hasher.update(chunk);
        }

        self.current_offset += 8 + key.len() as u64 + value.len() as u64;
        self.entry_count += 1;
        Ok(())
    }

    /// Finish building: write index block, footer, and return metadata
    pub fn finish(mut self, max_position: ReplayPosition, created_at: i64) -> Result<SstableInfo> {
        let index_offset = self.current_offset;

        for (key, offset) in &self.index {
            self.writer.write_all(&(key.len() as u32).to_le_bytes())?;
            self.writer.write_all(&offset.to_le_bytes())?;
            self.writer.write_all(key.as_bytes())?;
        }

        let data_crc = self.data_hasher.finalize();

        self.writer.write_all(&index_offset.to_le_bytes())?;
        self.writer.write_all(&data_crc.to_le_bytes())?;
        self.writer.write_all(&[0u8; 4])?;
        self.writer.write_all(&max_position.segment_id.to_le_bytes())?;
        self.writer.write_all(&max_position.position.to_le_bytes())?;
        self.writer.write_all(&created_at.to_le_bytes())?;

        self.writer.flush()?;

        // Seek back and update entry count in header
        let mut file = self
            .writer
            .into_inner()
            .map_err(|e| ShardError::Storage(format!("Failed to flush sstable: {}", e)))?;
        file.seek(SeekFrom::Start(6))?;
        file.write_all(&self.entry_count.to_le_bytes())?;
        file.sync_all()?;

        let file_size = file.metadata()?.len();

        Ok(SstableInfo {
            path: self.path,
            generation: self.generation,
            entry_count: self.entry_count,
            min_key: self.index.first().map(|(k, _)| k.clone()),
            max_key: self.index.last().map(|(k, _)| k.clone()),
            file_size,
            max_position,
            created_at,
        })
    }
}
