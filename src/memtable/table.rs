//! Memtable implementation
//!
//! BTreeMap-based memtable charged against a dirty memory pool.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::commitlog::{ReplayPosition, RpSet};
use crate::dirty_memory::DirtyMemoryManager;
use crate::mutation::{Mutation, Partition, PartitionKey};
use crate::query::PartitionRange;

static NEXT_MEMTABLE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Default)]
struct LogPositions {
    rp_set: RpSet,
    max: ReplayPosition,
}

/// In-memory table for recent writes
pub struct Memtable {
    id: u64,
    partitions: RwLock<BTreeMap<PartitionKey, Partition>>,
    dirty: Arc<DirtyMemoryManager>,
    /// Bytes charged to the pool
    occupancy: AtomicUsize,
    /// Virtual dirty memory already handed back for a flush in progress
    flushing: AtomicBool,
    positions: Mutex<LogPositions>,
}

impl Memtable {
    pub fn new(dirty: Arc<DirtyMemoryManager>) -> Self {
        Self {
            id: NEXT_MEMTABLE_ID.fetch_add(1, Ordering::Relaxed),
            partitions: RwLock::new(BTreeMap::new()),
            dirty,
            occupancy: AtomicUsize::new(0),
            flushing: AtomicBool::new(false),
            positions: Mutex::new(LogPositions::default()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Merge `mutation`, logged at `position`, into this memtable
    pub fn apply(&self, mutation: &Mutation, position: ReplayPosition) {
        let bytes = mutation.memory_usage();
        {
            let mut partitions = self.partitions.write();
            partitions
                .entry(mutation.key().clone())
                .or_default()
                .apply(mutation.partition().clone());
        }
        self.occupancy.fetch_add(bytes, Ordering::SeqCst);
        self.dirty.reserve(bytes);

        let mut positions = self.positions.lock();
        positions.rp_set.add(position);
        positions.max = positions.max.max(position);
    }

    /// Get a copy of one partition
    pub fn get(&self, key: &PartitionKey) -> Option<Partition> {
        self.partitions.read().get(key).cloned()
    }

    /// Copies of the partitions in `range`, in key order
    pub fn range(&self, range: &PartitionRange) -> Vec<(PartitionKey, Partition)> {
        let partitions = self.partitions.read();
        match range {
            PartitionRange::Single(key) => partitions
                .get(key)
                .map(|p| vec![(key.clone(), p.clone())])
                .unwrap_or_default(),
            PartitionRange::Range { .. } => partitions
                .iter()
                .filter(|(k, _)| range.contains(k))
                .map(|(k, p)| (k.clone(), p.clone()))
                .collect(),
        }
    }

    /// All partitions in key order (for flush)
    pub fn snapshot(&self) -> Vec<(PartitionKey, Partition)> {
        self.partitions
            .read()
            .iter()
            .map(|(k, p)| (k.clone(), p.clone()))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.read().is_empty()
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.read().len()
    }

    /// Bytes charged to the dirty memory pool
    pub fn occupancy(&self) -> usize {
        self.occupancy.load(Ordering::SeqCst)
    }

    pub fn is_flushing(&self) -> bool {
        self.flushing.load(Ordering::SeqCst)
    }

    /// Newest log position applied
    pub fn max_position(&self) -> ReplayPosition {
        self.positions.lock().max
    }

    /// Per-segment record counts held by this memtable
    pub fn rp_set(&self) -> RpSet {
        self.positions.lock().rp_set.clone()
    }

    /// Release virtual dirty memory: a flush of this memtable started
    pub fn mark_flushing(&self) {
        if !self.flushing.swap(true, Ordering::SeqCst) {
            self.dirty.start_release(self.occupancy());
        }
    }

    /// The flush failed; count the memory as dirty again
    pub fn revert_flushing(&self) {
        if self.flushing.swap(false, Ordering::SeqCst) {
            self.dirty.revert_release(self.occupancy());
        }
    }
}

impl Drop for Memtable {
    fn drop(&mut self) {
        let bytes = *self.occupancy.get_mut();
        let virtual_held = !*self.flushing.get_mut();
        self.dirty.release(bytes, virtual_held);
    }
}
