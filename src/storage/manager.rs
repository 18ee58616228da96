//! Table Storage
//!
//! Manages the sstables of one table and the files around them.
//!
//! ## Responsibilities
//! - Discover existing sstables on startup
//! - Merge partitions across all sstables for reads
//! - Create new sstables from memtable flushes
//! - Discard sstables on truncate, hard-link them for snapshots
//! - Persist the truncation record used by commitlog replay

use std::collections::BTreeMap;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::commitlog::ReplayPosition;
use crate::error::{Result, ShardError};
use crate::mutation::{Partition, PartitionKey};
use crate::query::PartitionRange;
use crate::schema::Schema;

use super::{SstableBuilder, SstableInfo, SstableReader};

/// When a table was last truncated and up to which log position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TruncationRecord {
    /// Unix millis
    pub truncated_at: i64,
    /// Log records at or below this position belong to the truncated data
    pub position: ReplayPosition,
}

/// Manages the storage of one table
///
/// ## Concurrency:
/// - `sstables`: Protected by RwLock, swapped whole on flush and truncate
/// - `next_generation`: Atomic counter (lock-free)
/// - Readers are shared (`Arc`); each has its own file lock
pub struct TableStorage {
    /// Directory holding this table's files
    dir: PathBuf,

    /// "keyspace.table", for log lines
    name: String,

    /// Open sstable readers, ordered newest → oldest
    sstables: RwLock<Vec<Arc<SstableReader>>>,

    /// Next generation for new sstables
    next_generation: AtomicU64,
}

impl TableStorage {
    const TRUNCATION_RECORD: &'static str = "truncated.rec";
    const SNAPSHOTS_DIR: &'static str = "snapshots";

    /// `{data_dir}/{keyspace}/{table}-{id}`
    pub fn table_dir(data_dir: &Path, schema: &Schema) -> PathBuf {
        data_dir
            .join(schema.ks_name())
            .join(format!("{}-{}", schema.cf_name(), schema.id().0.simple()))
    }

    /// Open or create storage for `schema` under `data_dir`
    ///
    /// On startup:
    /// 1. Create directory if it doesn't exist
    /// 2. Discover existing sstable files
    /// 3. Open readers for each (loads indexes into RAM)
    /// 4. Order by generation descending (newest first)
    pub fn open(data_dir: &Path, schema: &Schema) -> Result<Self> {
        let dir = Self::table_dir(data_dir, schema);
        Self::open_dir(&dir, schema.qualified_name())
    }

    pub fn open_dir(dir: &Path, name: String) -> Result<Self> {
        fs::create_dir_all(dir)?;

        let mut generations: Vec<u64> = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_file() {
                if let Some(generation) = Self::parse_generation(&path) {
                    generations.push(generation);
                }
            }
        }
        generations.sort_unstable_by(|a, b| b.cmp(a));

        let mut sstables = Vec::with_capacity(generations.len());
        for generation in &generations {
            let path = Self::sstable_path(dir, *generation);
            sstables.push(Arc::new(SstableReader::open(&path, *generation)?));
        }

        let next_generation = generations.first().map(|g| g + 1).unwrap_or(1);
        if !sstables.is_empty() {
            debug!(table = %name, sstables = sstables.len(), "Loaded sstables");
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            name,
            sstables: RwLock::new(sstables),
            next_generation: AtomicU64::new(next_generation),
        })
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// The partition `key` merged across all sstables
    pub fn read_partition(&self, key: &PartitionKey) -> Result<Option<Partition>> {
        let sstables = self.sstables.read().clone();
        let mut merged: Option<Partition> = None;
        for reader in sstables.iter().filter(|r| r.might_contain(key)) {
            if let Some(partition) = reader.get(key)? {
                match merged.as_mut() {
                    Some(m) => m.apply(partition),
                    None => merged = Some(partition),
                }
            }
        }
        Ok(merged)
    }

    /// All partitions in `range`, merged across sstables
    pub fn scan(&self, range: &PartitionRange) -> Result<BTreeMap<PartitionKey, Partition>> {
        let sstables = self.sstables.read().clone();
        let mut merged: BTreeMap<PartitionKey, Partition> = BTreeMap::new();
        for reader in sstables.iter() {
            let partitions = match range {
                PartitionRange::Single(key) => reader
                    .get(key)?
                    .map(|p| vec![(key.clone(), p)])
                    .unwrap_or_default(),
                PartitionRange::Range { start, end } => reader.range(start.as_ref(), end.as_ref())?,
            };
            for (key, partition) in partitions {
                merged.entry(key).or_default().apply(partition);
            }
        }
        Ok(merged)
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Write sorted partitions to a new sstable and start serving it
    pub fn write_sstable<'a, I>(
        &self,
        partitions: I,
        max_position: ReplayPosition,
    ) -> Result<SstableInfo>
    where
        I: IntoIterator<Item = (&'a PartitionKey, &'a Partition)>,
    {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let path = Self::sstable_path(&self.dir, generation);

        let mut builder = SstableBuilder::new(&path, generation)?;
        for (key, partition) in partitions {
            builder.add(key, partition)?;
        }
        let info = builder.finish(max_position, crate::utils::unix_millis())?;

        let reader = SstableReader::open(&path, generation)?;
        self.sstables.write().insert(0, Arc::new(reader));

        debug!(
            table = %self.name,
            generation,
            partitions = info.entry_count,
            bytes = info.file_size,
            "Wrote sstable"
        );
        Ok(info)
    }

    /// Drop every sstable created at or before `truncated_at` (unix millis).
    /// Returns the newest log position among the discarded data.
    pub fn discard_sstables(&self, truncated_at: i64) -> Result<ReplayPosition> {
        let removed: Vec<Arc<SstableReader>> = {
            let mut sstables = self.sstables.write();
            let (old, keep): (Vec<_>, Vec<_>) = sstables
                .drain(..)
                .partition(|r| r.info().created_at <= truncated_at);
            *sstables = keep;
            old
        };

        let mut max_position = ReplayPosition::zero();
        for reader in &removed {
            max_position = max_position.max(reader.info().max_position);
            fs::remove_file(&reader.info().path)?;
        }

        info!(
            table = %self.name,
            discarded = removed.len(),
            position = %max_position,
            "Discarded sstables"
        );
        Ok(max_position)
    }

    /// Hard-link the current sstables into `snapshots/{name}/`
    pub fn snapshot(&self, name: &str) -> Result<PathBuf> {
        let target = self.dir.join(Self::SNAPSHOTS_DIR).join(name);
        fs::create_dir_all(&target)?;
        let sstables = self.sstables.read().clone();
        for reader in &sstables {
            let source = &reader.info().path;
            let Some(file_name) = source.file_name() else {
                continue;
            };
            let link = target.join(file_name);
            if !link.exists() {
                fs::hard_link(source, &link)?;
            }
        }
        info!(table = %self.name, snapshot = name, files = sstables.len(), "Took snapshot");
        Ok(target)
    }

    // =========================================================================
    // Truncation Record
    // =========================================================================

    pub fn save_truncation_record(&self, record: TruncationRecord) -> Result<()> {
        let data = bincode::serialize(&record)?;
        let tmp = self.dir.join(format!("{}.tmp", Self::TRUNCATION_RECORD));
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&crc32fast::hash(&data).to_le_bytes())?;
            file.write_all(&data)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, self.dir.join(Self::TRUNCATION_RECORD))?;
        Ok(())
    }

    pub fn load_truncation_record(&self) -> Result<Option<TruncationRecord>> {
        let path = self.dir.join(Self::TRUNCATION_RECORD);
        if !path.exists() {
            return Ok(None);
        }
        let mut bytes = Vec::new();
        fs::File::open(&path)?.read_to_end(&mut bytes)?;
        if bytes.len() < 4 {
            return Err(ShardError::Storage(format!("{} is truncated", path.display())));
        }
        let (crc, data) = bytes.split_at(4);
        if crc32fast::hash(data).to_le_bytes() != crc {
            return Err(ShardError::Storage(format!("{} checksum mismatch", path.display())));
        }
        Ok(Some(bincode::deserialize(data)?))
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn sstable_count(&self) -> usize {
        self.sstables.read().len()
    }

    pub fn sstables(&self) -> Vec<SstableInfo> {
        self.sstables.read().iter().map(|r| r.info().clone()).collect()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn sstable_path(dir: &Path, generation: u64) -> PathBuf {
        dir.join(format!("sst-{:06}.db", generation))
    }

    /// "sst-000042.db" → Some(42)
    fn parse_generation(path: &Path) -> Option<u64> {
        let name = path.file_name()?.to_string_lossy();
        name.strip_prefix("sst-")?.strip_suffix(".db")?.parse().ok()
    }
}
