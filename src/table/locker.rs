//! Row and cell locks
//!
//! Locks are created on demand and removed again once nobody holds or waits
//! for them. A row lock takes the partition lock shared and the row lock
//! exclusive; a partition-wide lock takes the partition lock exclusive.
//! Cell locks are always taken in key order so two writers touching the same
//! cells cannot deadlock.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

use crate::error::{Result, ShardError};
use crate::mutation::{ClusteringKey, PartitionKey};
use crate::utils::Deadline;

#[derive(Debug, Default)]
pub struct LockStats {
    pub acquisitions: AtomicU64,
    pub timeouts: AtomicU64,
    pub live_locks: AtomicU64,
}

type LockTable<K> = Arc<Mutex<HashMap<K, Arc<RwLock<()>>>>>;

enum Held {
    Shared(OwnedRwLockReadGuard<()>),
    Exclusive(OwnedRwLockWriteGuard<()>),
}

/// One held lock; drops its table entry when it was the last user
struct LockGuard<K: Eq + Hash + Clone> {
    table: LockTable<K>,
    key: K,
    held: Option<Held>,
}

impl<K: Eq + Hash + Clone> Drop for LockGuard<K> {
    fn drop(&mut self) {
        drop(self.held.take());
        let mut table = self.table.lock();
        if let Some(lock) = table.get(&self.key) {
            if Arc::strong_count(lock) == 1 {
                table.remove(&self.key);
            }
        }
    }
}

struct LockMap<K: Eq + Hash + Clone> {
    table: LockTable<K>,
}

impl<K: Eq + Hash + Clone> LockMap<K> {
    fn new() -> Self {
        Self {
            table: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn entry(&self, key: &K) -> Arc<RwLock<()>> {
        self.table
            .lock()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    async fn lock(&self, key: K, exclusive: bool, deadline: Deadline, what: &'static str) -> Result<LockGuard<K>> {
        let lock = self.entry(&key);
        // The guard is built before waiting so a timeout still cleans up
        let mut guard = LockGuard {
            table: self.table.clone(),
            key,
            held: None,
        };
        let held = if exclusive {
            tokio::time::timeout_at(deadline, lock.write_owned())
                .await
                .map(Held::Exclusive)
        } else {
            tokio::time::timeout_at(deadline, lock.read_owned())
                .await
                .map(Held::Shared)
        };
        match held {
            Ok(held) => {
                guard.held = Some(held);
                Ok(guard)
            }
            Err(_) => Err(ShardError::Timeout(what)),
        }
    }

    fn len(&self) -> usize {
        self.table.lock().len()
    }
}

/// Scoped ownership of a partition or row lock
pub struct RowLockHolder {
    _row: Option<LockGuard<(PartitionKey, ClusteringKey)>>,
    _partition: LockGuard<PartitionKey>,
}

pub struct RowLocker {
    partitions: LockMap<PartitionKey>,
    rows: LockMap<(PartitionKey, ClusteringKey)>,
    stats: LockStats,
}

impl RowLocker {
    pub fn new() -> Self {
        Self {
            partitions: LockMap::new(),
            rows: LockMap::new(),
            stats: LockStats::default(),
        }
    }

    /// Lock one row of `key`, or the whole partition when `row` is `None`
    pub async fn lock(
        &self,
        key: &PartitionKey,
        row: Option<&ClusteringKey>,
        deadline: Deadline,
    ) -> Result<RowLockHolder> {
        let result = self.lock_inner(key, row, deadline).await;
        self.count(&result);
        result
    }

    async fn lock_inner(
        &self,
        key: &PartitionKey,
        row: Option<&ClusteringKey>,
        deadline: Deadline,
    ) -> Result<RowLockHolder> {
        let Some(ck) = row else {
            let partition = self.partitions.lock(key.clone(), true, deadline, "partition lock").await?;
            return Ok(RowLockHolder {
                _row: None,
                _partition: partition,
            });
        };
        let partition = self.partitions.lock(key.clone(), false, deadline, "partition lock").await?;
        let row = self
            .rows
            .lock((key.clone(), ck.clone()), true, deadline, "row lock")
            .await?;
        Ok(RowLockHolder {
            _row: Some(row),
            _partition: partition,
        })
    }

    fn count<T>(&self, result: &Result<T>) {
        match result {
            Ok(_) => self.stats.acquisitions.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.stats.timeouts.fetch_add(1, Ordering::Relaxed),
        };
        self.stats
            .live_locks
            .store((self.partitions.len() + self.rows.len()) as u64, Ordering::Relaxed);
    }

    pub fn stats(&self) -> &LockStats {
        &self.stats
    }
}

impl Default for RowLocker {
    fn default() -> Self {
        Self::new()
    }
}

/// Identity of one cell: partition, row and column
pub type CellKey = (PartitionKey, ClusteringKey, String);

/// Scoped ownership of a set of cell locks
pub struct CellLockHolder {
    cells: Vec<LockGuard<CellKey>>,
}

impl CellLockHolder {
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

pub struct CellLocker {
    cells: LockMap<CellKey>,
    stats: LockStats,
}

impl CellLocker {
    pub fn new() -> Self {
        Self {
            cells: LockMap::new(),
            stats: LockStats::default(),
        }
    }

    /// Lock every cell in `cells`, in sorted order
    pub async fn lock_cells(&self, mut cells: Vec<CellKey>, deadline: Deadline) -> Result<CellLockHolder> {
        cells.sort();
        cells.dedup();

        let mut held = Vec::with_capacity(cells.len());
        for cell in cells {
            match self.cells.lock(cell, true, deadline, "cell lock").await {
                Ok(guard) => held.push(guard),
                Err(e) => {
                    self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                    return Err(e);
                }
            }
        }
        self.stats.acquisitions.fetch_add(1, Ordering::Relaxed);
        self.stats.live_locks.store(self.cells.len() as u64, Ordering::Relaxed);
        Ok(CellLockHolder { cells: held })
    }

    pub fn stats(&self) -> &LockStats {
        &self.stats
    }
}

impl Default for CellLocker {
    fn default() -> Self {
        Self::new()
    }
}
