//! File-backed commitlog
//!
//! ## Concurrency
//! - Appends are serialized by one mutex around the active segment and the
//!   per-segment dirty counts; the blocking file I/O runs on tokio's blocking pool.
//! - Flush handlers are called with no lock held.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::{CommitlogSyncStrategy, Config};
use crate::error::{Result, ShardError};
use crate::schema::TableId;
use crate::utils::{with_deadline, Deadline};

use super::{
    CommitLog, CommitLogRecord, DirtyTracker, FlushHandler, ReplayPosition, RpHandle, RpSet,
    SegmentWriter,
};

/// A closed segment that still holds unflushed records
struct SealedSegment {
    path: PathBuf,
    size: u64,
    dirty: HashMap<TableId, DirtyCount>,
}

#[derive(Debug, Clone, Copy)]
struct DirtyCount {
    records: u64,
    /// Newest position of the table's records in the segment
    newest: ReplayPosition,
}

struct LogState {
    active: SegmentWriter,
    active_dirty: HashMap<TableId, DirtyCount>,
    sealed: BTreeMap<u64, SealedSegment>,
    /// Oldest segment for which flush handlers have already been invoked
    flush_requested_for: Option<u64>,
}

struct LogShared {
    dir: PathBuf,
    segment_size: u64,
    total_space: u64,
    sync_strategy: CommitlogSyncStrategy,
    state: Mutex<LogState>,
    handlers: RwLock<HashMap<TableId, FlushHandler>>,
    replay_segments: Mutex<Vec<PathBuf>>,
    shut_down: AtomicBool,
}

/// Durability log stored as `CommitLog-NNNNNN.log` segments under one directory
#[derive(Clone)]
pub struct FileCommitLog {
    shared: Arc<LogShared>,
}

impl FileCommitLog {
    /// Subdirectory of the data directory holding segments
    pub const DIR_NAME: &'static str = "commitlog";

    /// Open the log under `{data_dir}/commitlog`
    ///
    /// On startup:
    /// 1. Create the directory if missing
    /// 2. Remember existing segments for replay
    /// 3. Start a new segment numbered after the newest existing one
    pub fn open(config: &Config) -> Result<Self> {
        Self::open_dir(
            &config.data_dir.join(Self::DIR_NAME),
            config.commitlog_segment_size,
            config.commitlog_total_space,
            config.commitlog_sync,
        )
    }

    pub fn open_dir(
        dir: &Path,
        segment_size: u64,
        total_space: u64,
        sync_strategy: CommitlogSyncStrategy,
    ) -> Result<Self> {
        fs::create_dir_all(dir)?;

        let mut existing: Vec<(u64, PathBuf)> = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if let Some(id) = SegmentWriter::parse_segment_id(&path) {
                existing.push((id, path));
            }
        }
        existing.sort();

        let next_id = existing.last().map(|(id, _)| id + 1).unwrap_or(1);
        let active = SegmentWriter::create(dir, next_id, sync_strategy)?;

        if !existing.is_empty() {
            info!(
                segments = existing.len(),
                first_new_segment = next_id,
                "Found commitlog segments from a previous run"
            );
        }

        Ok(Self {
            shared: Arc::new(LogShared {
                dir: dir.to_path_buf(),
                segment_size,
                total_space,
                sync_strategy,
                state: Mutex::new(LogState {
                    active,
                    active_dirty: HashMap::new(),
                    sealed: BTreeMap::new(),
                    flush_requested_for: None,
                }),
                handlers: RwLock::new(HashMap::new()),
                replay_segments: Mutex::new(existing.into_iter().map(|(_, p)| p).collect()),
                shut_down: AtomicBool::new(false),
            }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.shared.dir
    }

    /// Segments that currently hold unflushed records, active one included
    pub fn live_segment_count(&self) -> usize {
        self.shared.state.lock().sealed.len() + 1
    }

    /// Bytes held by live segments
    pub fn disk_usage(&self) -> u64 {
        let state = self.shared.state.lock();
        state.sealed.values().map(|s| s.size).sum::<u64>() + state.active.size()
    }

    /// Force sync of the active segment
    pub fn sync(&self) -> Result<()> {
        self.shared.state.lock().active.sync()
    }
}

impl LogShared {
    /// Blocking append. Returns the position and any flush requests to issue.
    fn write(&self, table_id: TableId, data: &[u8]) -> Result<(ReplayPosition, Vec<(TableId, ReplayPosition)>)> {
        let mut state = self.state.lock();

        if !state.active.fits(data.len(), self.segment_size) {
            self.roll_segment(&mut state)?;
        }

        let position = state.active.append(data)?;
        state
            .active_dirty
            .entry(table_id)
            .and_modify(|d| {
                d.records += 1;
                d.newest = d.newest.max(position);
            })
            .or_insert(DirtyCount {
                records: 1,
                newest: position,
            });

        Ok((position, self.over_budget_tables(&mut state)))
    }

    fn roll_segment(&self, state: &mut LogState) -> Result<()> {
        state.active.sync()?;
        let next = SegmentWriter::create(&self.dir, state.active.id() + 1, self.sync_strategy)?;
        let old = std::mem::replace(&mut state.active, next);
        let dirty = std::mem::take(&mut state.active_dirty);

        debug!(segment = old.id(), size = old.size(), "Sealed commitlog segment");
        if dirty.is_empty() {
            remove_segment_file(old.path());
        } else {
            state.sealed.insert(
                old.id(),
                SealedSegment {
                    path: old.path().to_path_buf(),
                    size: old.size(),
                    dirty,
                },
            );
        }
        Ok(())
    }

    /// Tables to flush so the oldest segment can go, once per segment
    fn over_budget_tables(&self, state: &mut LogState) -> Vec<(TableId, ReplayPosition)> {
        let total: u64 = state.sealed.values().map(|s| s.size).sum::<u64>() + state.active.size();
        if total <= self.total_space {
            return Vec::new();
        }
        let Some((&oldest, segment)) = state.sealed.iter().next() else {
            return Vec::new();
        };
        if state.flush_requested_for == Some(oldest) {
            return Vec::new();
        }
        state.flush_requested_for = Some(oldest);
        segment
            .dirty
            .iter()
            .map(|(table, count)| (*table, count.newest))
            .collect()
    }

    fn mark_clean(&self, table_id: TableId, segment_id: u64, records: u64) {
        let mut state = self.state.lock();
        if state.active.id() == segment_id {
            decrement(&mut state.active_dirty, table_id, records);
            return;
        }
        let now_clean = match state.sealed.get_mut(&segment_id) {
            Some(segment) => {
                decrement(&mut segment.dirty, table_id, records);
                segment.dirty.is_empty()
            }
            None => false,
        };
        if now_clean {
            if let Some(segment) = state.sealed.remove(&segment_id) {
                debug!(segment = segment_id, "Deleting fully flushed commitlog segment");
                remove_segment_file(&segment.path);
            }
        }
    }

    fn forget_table(&self, table_id: TableId) {
        let mut state = self.state.lock();
        state.active_dirty.remove(&table_id);
        let clean: Vec<u64> = state
            .sealed
            .iter_mut()
            .filter_map(|(id, segment)| {
                segment.dirty.remove(&table_id);
                segment.dirty.is_empty().then_some(*id)
            })
            .collect();
        for id in clean {
            if let Some(segment) = state.sealed.remove(&id) {
                remove_segment_file(&segment.path);
            }
        }
    }

    fn invoke_flush_handlers(&self, requests: Vec<(TableId, ReplayPosition)>) {
        if requests.is_empty() {
            return;
        }
        let handlers = self.handlers.read().clone();
        for (table_id, position) in requests {
            if let Some(handler) = handlers.get(&table_id) {
                debug!(table = %table_id, position = %position, "Commitlog over budget, requesting flush");
                handler(table_id, position);
            }
        }
    }
}

impl DirtyTracker for LogShared {
    fn release(&self, table_id: TableId, segment_id: u64, count: u64) {
        self.mark_clean(table_id, segment_id, count);
    }
}

fn decrement(dirty: &mut HashMap<TableId, DirtyCount>, table_id: TableId, records: u64) {
    if let Some(count) = dirty.get_mut(&table_id) {
        count.records = count.records.saturating_sub(records);
        if count.records == 0 {
            dirty.remove(&table_id);
        }
    }
}

fn remove_segment_file(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        warn!(path = %path.display(), error = %e, "Failed to delete commitlog segment");
    }
}

#[async_trait]
impl CommitLog for FileCommitLog {
    async fn add_entry(&self, table_id: TableId, data: &[u8], deadline: Deadline) -> Result<RpHandle> {
        if self.shared.shut_down.load(Ordering::Acquire) {
            return Err(ShardError::ShuttingDown);
        }

        let record = CommitLogRecord::new(table_id, data.to_vec()).serialize()?;
        let shared = self.shared.clone();
        // The handle is built on the blocking thread: if the caller's deadline
        // fires first, the dropped output releases the record.
        let write = tokio::task::spawn_blocking(move || {
            let (position, requests) = shared.write(table_id, &record)?;
            let tracker: Arc<dyn DirtyTracker> = shared;
            Ok::<_, ShardError>((RpHandle::new(table_id, position, tracker), requests))
        });

        let (handle, flush_requests) = with_deadline(deadline, "commitlog write", async {
            write
                .await
                .map_err(|e| ShardError::Storage(format!("commitlog writer task failed: {}", e)))?
        })
        .await?;

        self.shared.invoke_flush_handlers(flush_requests);
        Ok(handle)
    }

    fn discard_completed_segments(&self, table_id: TableId, flushed: Option<&RpSet>) {
        match flushed {
            Some(set) => {
                for (segment_id, records) in set.segments() {
                    self.shared.mark_clean(table_id, segment_id, records);
                }
            }
            None => self.shared.forget_table(table_id),
        }
    }

    fn register_flush_handler(&self, table_id: TableId, handler: FlushHandler) {
        self.shared.handlers.write().insert(table_id, handler);
    }

    fn unregister_flush_handler(&self, table_id: TableId) {
        self.shared.handlers.write().remove(&table_id);
    }

    fn current_position(&self) -> ReplayPosition {
        let state = self.shared.state.lock();
        ReplayPosition::new(state.active.id(), state.active.size())
    }

    fn segments_to_replay(&self) -> Vec<PathBuf> {
        self.shared.replay_segments.lock().clone()
    }

    fn release_replayed_segments(&self) -> Result<()> {
        let segments = std::mem::take(&mut *self.shared.replay_segments.lock());
        for path in segments {
            fs::remove_file(&path)?;
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        if self.shared.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let shared = self.shared.clone();
        tokio::task::spawn_blocking(move || shared.state.lock().active.sync())
            .await
            .map_err(|e| ShardError::Storage(format!("commitlog sync task failed: {}", e)))??;
        info!(dir = %self.shared.dir.display(), "Commitlog shut down");
        Ok(())
    }
}
