//! Storage writer
//!
//! The hand-off point between a sealed memtable and durable storage. Also the
//! I/O priority class the memtable flush controller tunes.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{Result, ShardError};
use crate::memtable::Memtable;

use super::{SstableInfo, TableStorage};

/// Persists sealed memtables
#[async_trait]
pub trait StorageWriter: Send + Sync {
    /// Write `memtable` into `storage`. `None` when there was nothing to write.
    async fn write_memtable(
        &self,
        storage: Arc<TableStorage>,
        memtable: Arc<Memtable>,
    ) -> Result<Option<SstableInfo>>;

    /// New scheduling weight for flush I/O
    async fn update_shares(&self, shares: u32) -> Result<()>;
}

/// Default writer: builds an sstable on the blocking pool
pub struct SstableWriter {
    shares: AtomicU32,
}

impl SstableWriter {
    pub fn new() -> Self {
        Self {
            shares: AtomicU32::new(0),
        }
    }

    /// Shares most recently applied by the flush controller
    pub fn shares(&self) -> u32 {
        self.shares.load(Ordering::Relaxed)
    }
}

impl Default for SstableWriter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageWriter for SstableWriter {
    async fn write_memtable(
        &self,
        storage: Arc<TableStorage>,
        memtable: Arc<Memtable>,
    ) -> Result<Option<SstableInfo>> {
        let partitions = memtable.snapshot();
        if partitions.is_empty() {
            return Ok(None);
        }
        let max_position = memtable.max_position();

        tokio::task::spawn_blocking(move || {
            storage
                .write_sstable(partitions.iter().map(|(k, p)| (k, p)), max_position)
                .map(Some)
        })
        .await
        .map_err(|e| ShardError::Storage(format!("sstable writer task failed: {}", e)))?
    }

    async fn update_shares(&self, shares: u32) -> Result<()> {
        let previous = self.shares.swap(shares, Ordering::Relaxed);
        if previous != shares {
            debug!(shares, "Updated flush I/O shares");
        }
        Ok(())
    }
}
