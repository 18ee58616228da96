//! Memtable list and flush orchestration
//!
//! One list per table (and pool). Writers always go to the active memtable;
//! sealing swaps in a fresh one under the write lock so writers never wait
//! for a flush. Sealed memtables are flushed oldest first, one flush per
//! list at a time, each holding a flush permit of the pool.
//!
//! ```text
//!   request_flush ──┐ (coalesced while pending)
//!                   ▼
//!   flush permit ─▶ seal active ─▶ flush sealed[0], sealed[1], ... ─▶ result to all waiters
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error};

use crate::commitlog::ReplayPosition;
use crate::dirty_memory::{DirtyMemoryManager, FlushPermit};
use crate::error::{Result, ShardError};
use crate::mutation::Mutation;
use crate::utils::SharedPromise;

use super::Memtable;

/// Pause after a failed flush before its memory counts as dirty again
pub const FLUSH_FAILURE_BACKOFF: Duration = Duration::from_millis(100);

/// Seal-and-flush work handed to whoever drives it
pub type FlushFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// Persists one sealed memtable
#[async_trait]
pub trait MemtableFlusher: Send + Sync {
    async fn flush_memtable(&self, memtable: Arc<Memtable>) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MemtableListStats {
    pub flushes: AtomicU64,
    pub failed_flushes: AtomicU64,
    pub coalesced_requests: AtomicU64,
}

pub struct MemtableList {
    /// "keyspace.table", for log lines and errors
    name: String,

    active: RwLock<Arc<Memtable>>,

    /// Oldest first
    sealed: Mutex<Vec<Arc<Memtable>>>,

    dirty: Arc<DirtyMemoryManager>,
    flusher: Arc<dyn MemtableFlusher>,

    /// The pending explicit flush, if any
    flush_coalescing: Mutex<Option<SharedPromise>>,

    /// One flush pass per list at a time keeps sstables in seal order
    flush_serializer: tokio::sync::Mutex<()>,

    stats: MemtableListStats,
}

impl MemtableList {
    pub fn new(
        name: impl Into<String>,
        dirty: Arc<DirtyMemoryManager>,
        flusher: Arc<dyn MemtableFlusher>,
    ) -> Arc<Self> {
        let list = Arc::new(Self {
            name: name.into(),
            active: RwLock::new(Arc::new(Memtable::new(dirty.clone()))),
            sealed: Mutex::new(Vec::new()),
            dirty: dirty.clone(),
            flusher,
            flush_coalescing: Mutex::new(None),
            flush_serializer: tokio::sync::Mutex::new(()),
            stats: MemtableListStats::default(),
        });
        dirty.register_list(Arc::downgrade(&list));
        list
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dirty_memory_manager(&self) -> &Arc<DirtyMemoryManager> {
        &self.dirty
    }

    // =========================================================================
    // Writes and Reads
    // =========================================================================

    /// Apply to the active memtable. The read lock keeps a concurrent seal
    /// from moving the memtable to the flush queue mid-apply.
    pub fn apply(&self, mutation: &Mutation, position: ReplayPosition) {
        let active = self.active.read();
        active.apply(mutation, position);
    }

    pub fn active(&self) -> Arc<Memtable> {
        self.active.read().clone()
    }

    /// Active memtable first, then sealed ones newest to oldest
    pub fn memtables(&self) -> Vec<Arc<Memtable>> {
        let active = self.active.read();
        let sealed = self.sealed.lock();
        std::iter::once(active.clone())
            .chain(sealed.iter().rev().cloned())
            .collect()
    }

    pub fn sealed_count(&self) -> usize {
        self.sealed.lock().len()
    }

    /// Bytes a flush would release: everything not already being flushed
    pub fn flushable_size(&self) -> usize {
        let active = self.active.read().occupancy();
        let sealed: usize = self
            .sealed
            .lock()
            .iter()
            .filter(|m| !m.is_flushing())
            .map(|m| m.occupancy())
            .sum();
        active + sealed
    }

    /// Nothing written and nothing waiting for flush
    pub fn is_empty(&self) -> bool {
        self.active.read().is_empty() && self.sealed.lock().is_empty()
    }

    // =========================================================================
    // Flush
    // =========================================================================

    /// Flush the active memtable, joining a pending flush if there is one
    ///
    /// The returned future resolves once every memtable sealed by that flush
    /// is in storage.
    pub fn request_flush(self: &Arc<Self>) -> impl Future<Output = Result<()>> + Send + 'static {
        let mut pending = self.flush_coalescing.lock();
        if let Some(promise) = pending.as_ref() {
            self.stats.coalesced_requests.fetch_add(1, Ordering::Relaxed);
            return promise.future();
        }

        let promise = SharedPromise::new();
        let waiter = promise.future();
        *pending = Some(promise);
        drop(pending);

        let list = self.clone();
        let extraneous = self.dirty.start_extraneous_flush();
        tokio::spawn(async move {
            let _extraneous = extraneous;
            // Later callers start a new flush once this one has its permit
            let result = match list.dirty.get_flush_permit().await {
                Ok(permit) => {
                    let promise = list.flush_coalescing.lock().take();
                    let result = list.seal_active_memtable_immediate(permit).await;
                    (promise, result)
                }
                Err(e) => (list.flush_coalescing.lock().take(), Err(e)),
            };
            if let (Some(promise), outcome) = result {
                promise.set(outcome);
            }
        });

        waiter
    }

    /// Seal the active memtable now; the returned future writes it out
    pub fn seal_active_memtable_immediate(self: &Arc<Self>, permit: FlushPermit) -> FlushFuture {
        self.seal_active();
        let list = self.clone();
        Box::pin(async move { list.flush_sealed(permit).await })
    }

    fn seal_active(&self) {
        let mut active = self.active.write();
        if active.is_empty() {
            return;
        }
        let fresh = Arc::new(Memtable::new(self.dirty.clone()));
        let old = std::mem::replace(&mut *active, fresh);
        old.mark_flushing();
        debug!(
            table = %self.name,
            memtable = old.id(),
            bytes = old.occupancy(),
            "Sealed memtable"
        );
        self.sealed.lock().push(old);
    }

    async fn flush_sealed(&self, _permit: FlushPermit) -> Result<()> {
        let _serial = self.flush_serializer.lock().await;

        loop {
            let next = self.sealed.lock().first().cloned();
            let Some(memtable) = next else {
                return Ok(());
            };
            memtable.mark_flushing();

            match self.flusher.flush_memtable(memtable.clone()).await {
                Ok(()) => {
                    self.sealed.lock().retain(|m| !Arc::ptr_eq(m, &memtable));
                    self.stats.flushes.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.stats.failed_flushes.fetch_add(1, Ordering::Relaxed);
                    error!(table = %self.name, error = %e, "Failed to flush memtable of {}", self.name);
                    // Hold the permit through the pause so the pressure loop
                    // cannot pick this list again straight away
                    tokio::time::sleep(FLUSH_FAILURE_BACKOFF).await;
                    // Kept for the next attempt; count the memory as dirty again
                    for sealed in self.sealed.lock().iter() {
                        sealed.revert_flushing();
                    }
                    return Err(match e {
                        ShardError::FlushFailed { .. } => e,
                        other => ShardError::FlushFailed {
                            table: self.name.clone(),
                            reason: other.to_string(),
                        },
                    });
                }
            }
        }
    }

    /// Take every memtable out of the list without writing it. The caller
    /// owns the log records they hold.
    pub async fn clear(&self) -> Vec<Arc<Memtable>> {
        let _serial = self.flush_serializer.lock().await;
        let mut active = self.active.write();
        let old = std::mem::replace(&mut *active, Arc::new(Memtable::new(self.dirty.clone())));
        let mut cleared = std::mem::take(&mut *self.sealed.lock());
        cleared.push(old);
        cleared
    }

    pub fn stats(&self) -> &MemtableListStats {
        &self.stats
    }
}
