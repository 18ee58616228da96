//! Table (column family)
//!
//! A table owns its schema, its memtable lists (regular and streaming), its
//! sstables and the locks used to serialize counter and view updates.
//!
//! ## Write path inside a table
//! ```text
//!   apply(mutation, rp)
//!     │  rp below the truncate low mark? ──▶ ReorderedWithTruncate
//!     ▼
//!   active memtable ──(seal)──▶ sealed memtable ──(flush)──▶ sstable
//!                                                     └──▶ commitlog segments released
//! ```
//!
//! ## Concurrency
//! - `apply_lock` is shared by appliers and taken exclusively to move the
//!   truncate low mark, so a write is either applied before the mark or
//!   checked against it.
//! - Reads merge every memtable and every sstable; no lock is held across
//!   an await.

mod locker;
mod view;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use crossbeam::atomic::AtomicCell;
use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::commitlog::{CommitLog, ReplayPosition, RpHandle};
use crate::dirty_memory::DirtyMemoryManager;
use crate::error::{Result, ShardError};
use crate::memtable::{Memtable, MemtableFlusher, MemtableList};
use crate::mutation::{ClusteringKey, Mutation, Partition, PartitionKey};
use crate::query::PartitionRange;
use crate::schema::{SchemaRef, TableId};
use crate::storage::{StorageWriter, TableStorage, TruncationRecord};
use crate::utils::{Deadline, GateGuard, OperationGate};

pub use locker::{CellKey, CellLockHolder, CellLocker, LockStats, RowLockHolder, RowLocker};
pub use view::{generate_view_updates, view_clustering_key};

/// Shared services a table is opened with
#[derive(Clone)]
pub struct TableContext {
    pub data_dir: PathBuf,
    /// `None` for tables of keyspaces without durable writes
    pub commitlog: Option<Arc<dyn CommitLog>>,
    pub dirty: Arc<DirtyMemoryManager>,
    pub streaming_dirty: Arc<DirtyMemoryManager>,
    pub writer: Arc<dyn StorageWriter>,
}

#[derive(Debug, Default)]
pub struct TableStats {
    pub writes: AtomicU64,
    pub streaming_writes: AtomicU64,
    pub reads: AtomicU64,
    pub failed_counter_applies: AtomicU64,
    pub view_updates: AtomicU64,
}

/// Writes sealed memtables and releases their log segments
struct TableFlusher {
    table_id: TableId,
    storage: Arc<TableStorage>,
    writer: Arc<dyn StorageWriter>,
    commitlog: Option<Arc<dyn CommitLog>>,
}

#[async_trait]
impl MemtableFlusher for TableFlusher {
    async fn flush_memtable(&self, memtable: Arc<Memtable>) -> Result<()> {
        let info = self
            .writer
            .write_memtable(self.storage.clone(), memtable.clone())
            .await?;
        if let Some(commitlog) = &self.commitlog {
            commitlog.discard_completed_segments(self.table_id, Some(&memtable.rp_set()));
        }
        if let Some(info) = info {
            debug!(
                table = %self.storage.name(),
                generation = info.generation,
                position = %info.max_position,
                "Flushed memtable"
            );
        }
        Ok(())
    }
}

pub struct Table {
    id: TableId,
    schema: RwLock<SchemaRef>,
    memtables: Arc<MemtableList>,
    streaming_memtables: Arc<MemtableList>,
    commitlog: Option<Arc<dyn CommitLog>>,
    storage: Arc<TableStorage>,
    row_locker: RowLocker,
    cell_locker: CellLocker,
    /// Views whose base is this table
    views: RwLock<Vec<SchemaRef>>,
    apply_lock: RwLock<()>,
    highest_rp: AtomicCell<ReplayPosition>,
    lowest_allowed_rp: AtomicCell<ReplayPosition>,
    gate: OperationGate,
    stats: TableStats,
}

impl Table {
    /// Open the table's storage and set up its memtables
    pub fn open(schema: SchemaRef, ctx: &TableContext) -> Result<Arc<Self>> {
        let storage = Arc::new(TableStorage::open(&ctx.data_dir, &schema)?);
        let name = schema.qualified_name();
        let flusher = Arc::new(TableFlusher {
            table_id: schema.id(),
            storage: storage.clone(),
            writer: ctx.writer.clone(),
            commitlog: ctx.commitlog.clone(),
        });

        Ok(Arc::new(Self {
            id: schema.id(),
            memtables: MemtableList::new(name.clone(), ctx.dirty.clone(), flusher.clone()),
            streaming_memtables: MemtableList::new(name, ctx.streaming_dirty.clone(), flusher),
            schema: RwLock::new(schema),
            commitlog: ctx.commitlog.clone(),
            storage,
            row_locker: RowLocker::new(),
            cell_locker: CellLocker::new(),
            views: RwLock::new(Vec::new()),
            apply_lock: RwLock::new(()),
            highest_rp: AtomicCell::new(ReplayPosition::zero()),
            lowest_allowed_rp: AtomicCell::new(ReplayPosition::zero()),
            gate: OperationGate::new(),
            stats: TableStats::default(),
        }))
    }

    pub fn id(&self) -> TableId {
        self.id
    }

    pub fn schema(&self) -> SchemaRef {
        self.schema.read().clone()
    }

    pub(crate) fn set_schema(&self, schema: SchemaRef) {
        *self.schema.write() = schema;
    }

    /// "keyspace.table"
    pub fn name(&self) -> String {
        self.schema.read().qualified_name()
    }

    pub fn commitlog(&self) -> Option<&Arc<dyn CommitLog>> {
        self.commitlog.as_ref()
    }

    pub fn storage(&self) -> &Arc<TableStorage> {
        &self.storage
    }

    pub fn memtables(&self) -> &Arc<MemtableList> {
        &self.memtables
    }

    pub fn streaming_memtables(&self) -> &Arc<MemtableList> {
        &self.streaming_memtables
    }

    pub fn stats(&self) -> &TableStats {
        &self.stats
    }

    /// Keeps the table alive for the duration of an operation
    pub fn hold(&self) -> Result<GateGuard> {
        self.gate.enter()
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Apply a logged mutation to the active memtable
    ///
    /// A mutation logged before the current truncate low mark belongs to the
    /// truncated data and is refused with `ReorderedWithTruncate`. Its log
    /// record is released when `rp` is dropped.
    pub fn apply(&self, mutation: &Mutation, rp: RpHandle) -> Result<()> {
        let _applying = self.apply_lock.read();
        let position = rp.position();
        let low_mark = self.lowest_allowed_rp.load();
        if !position.is_zero() && position < low_mark {
            return Err(ShardError::ReorderedWithTruncate {
                table: self.name(),
                position,
                low_mark,
            });
        }

        self.memtables.apply(mutation, rp.into_position());
        advance(&self.highest_rp, position);
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        trace!(table = %self.id, key = %mutation.key(), position = %position, "Applied mutation");
        Ok(())
    }

    /// Apply a mutation received by streaming; it is not logged
    pub fn apply_streaming(&self, mutation: &Mutation) {
        self.streaming_memtables.apply(mutation, ReplayPosition::zero());
        self.stats.streaming_writes.fetch_add(1, Ordering::Relaxed);
    }

    /// Only mutations logged at or after the returned position may be
    /// applied from now on
    pub fn set_low_replay_position_mark(&self) -> ReplayPosition {
        let _exclusive = self.apply_lock.write();
        let mark = self.highest_rp.load();
        self.lowest_allowed_rp.store(mark);
        mark
    }

    pub fn highest_replay_position(&self) -> ReplayPosition {
        self.highest_rp.load()
    }

    pub fn lowest_allowed_replay_position(&self) -> ReplayPosition {
        self.lowest_allowed_rp.load()
    }

    pub(crate) fn count_failed_counter_apply(&self) {
        self.stats.failed_counter_applies.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_view_updates(&self, count: usize) {
        self.stats.view_updates.fetch_add(count as u64, Ordering::Relaxed);
    }

    // =========================================================================
    // Flush / Truncate Support
    // =========================================================================

    /// Flush both memtable lists
    pub async fn flush(&self) -> Result<()> {
        let regular = self.memtables.request_flush();
        let streaming = self.streaming_memtables.request_flush();
        let (regular, streaming) = tokio::join!(regular, streaming);
        regular.and(streaming)
    }

    /// Drop all memtable data without writing it and release the log
    /// records it held
    pub async fn clear(&self) {
        let mut cleared = self.memtables.clear().await;
        cleared.extend(self.streaming_memtables.clear().await);
        if let Some(commitlog) = &self.commitlog {
            for memtable in &cleared {
                commitlog.discard_completed_segments(self.id, Some(&memtable.rp_set()));
            }
        }
        debug!(table = %self.name(), memtables = cleared.len(), "Cleared memtables");
    }

    /// Remove sstables created at or before `truncated_at`; returns the
    /// newest log position they covered
    pub fn discard_sstables(&self, truncated_at: i64) -> Result<ReplayPosition> {
        self.storage.discard_sstables(truncated_at)
    }

    pub fn snapshot(&self, name: &str) -> Result<PathBuf> {
        self.storage.snapshot(name)
    }

    pub fn save_truncation_record(&self, record: TruncationRecord) -> Result<()> {
        self.storage.save_truncation_record(record)
    }

    pub fn truncation_record(&self) -> Result<Option<TruncationRecord>> {
        self.storage.load_truncation_record()
    }

    /// Wait for in-flight operations and refuse new ones
    pub async fn stop(&self) {
        self.gate.close().await;
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// `key` merged across memtables and sstables
    pub fn read_partition(&self, key: &PartitionKey) -> Result<Option<Partition>> {
        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        // Memtables before sstables: a memtable leaves the list only after
        // its sstable is registered, so each row is in one snapshot or both
        let memtables = self.all_memtables();
        let mut merged = self.storage.read_partition(key)?;
        for memtable in memtables {
            if let Some(partition) = memtable.get(key) {
                match merged.as_mut() {
                    Some(m) => m.apply(partition),
                    None => merged = Some(partition),
                }
            }
        }
        Ok(merged)
    }

    /// Every partition in `range`, merged across memtables and sstables
    pub fn scan(&self, range: &PartitionRange) -> Result<BTreeMap<PartitionKey, Partition>> {
        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        let memtables = self.all_memtables();
        let mut merged = self.storage.scan(range)?;
        for memtable in memtables {
            for (key, partition) in memtable.range(range) {
                merged.entry(key).or_default().apply(partition);
            }
        }
        Ok(merged)
    }

    fn all_memtables(&self) -> Vec<Arc<Memtable>> {
        let mut memtables = self.memtables.memtables();
        memtables.extend(self.streaming_memtables.memtables());
        memtables
    }

    // =========================================================================
    // Locks
    // =========================================================================

    pub async fn lock_row(
        &self,
        key: &PartitionKey,
        row: Option<&ClusteringKey>,
        deadline: Deadline,
    ) -> Result<RowLockHolder> {
        self.row_locker.lock(key, row, deadline).await
    }

    pub async fn lock_cells(&self, cells: Vec<CellKey>, deadline: Deadline) -> Result<CellLockHolder> {
        self.cell_locker.lock_cells(cells, deadline).await
    }

    pub fn row_lock_stats(&self) -> &LockStats {
        self.row_locker.stats()
    }

    pub fn cell_lock_stats(&self) -> &LockStats {
        self.cell_locker.stats()
    }

    // =========================================================================
    // Views
    // =========================================================================

    pub fn views(&self) -> Vec<SchemaRef> {
        self.views.read().clone()
    }

    pub fn has_views(&self) -> bool {
        !self.views.read().is_empty()
    }

    /// Add or replace a view of this table
    pub(crate) fn add_or_update_view(&self, view: SchemaRef) {
        let mut views = self.views.write();
        views.retain(|v| v.id() != view.id());
        views.push(view);
    }

    pub(crate) fn remove_view(&self, view_id: TableId) {
        self.views.write().retain(|v| v.id() != view_id);
    }
}

/// Move `cell` forward to `position` if it is newer
fn advance(cell: &AtomicCell<ReplayPosition>, position: ReplayPosition) {
    let mut current = cell.load();
    while position > current {
        match cell.compare_exchange(current, position) {
            Ok(_) => return,
            Err(actual) => current = actual,
        }
    }
}
