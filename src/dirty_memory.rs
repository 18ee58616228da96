//! Dirty Memory Manager
//!
//! Accounts for the bytes held by memtables that have not reached storage yet,
//! throttles writers when that exceeds the pool's threshold, and runs the
//! background loop that turns memory pressure into memtable flushes.
//!
//! ## Real vs Virtual
//! ```text
//!   real    = bytes of every unflushed memtable (sealed ones included)
//!   virtual = real - bytes of memtables whose flush has started
//!
//!   reserve(n)        real += n, virtual += n
//!   start_release(n)  virtual -= n           (flush started)
//!   revert_release(n) virtual += n           (flush failed)
//!   release(n)        real -= n              (memtable gone)
//! ```
//! Admission and pressure look at virtual usage: memory whose flush is already
//! under way will come back on its own and should not trigger another flush.
//!
//! ## Flush Loop
//! 1. Wait until virtual usage crosses the soft limit
//! 2. Take a flush permit (bounds concurrent flushes)
//! 3. Yield while explicitly requested flushes are pending
//! 4. Seal the largest memtable list in the pool and flush it in the background

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use crate::error::{Result, ShardError};
use crate::memtable::MemtableList;
use crate::utils::Deadline;

/// Pause of the flush loop when pressure is reported but nothing is flushable
const IDLE_BACKOFF: Duration = Duration::from_millis(1);

/// Scoped right to run one flush; released on drop
pub struct FlushPermit {
    _permit: OwnedSemaphorePermit,
}

/// Held while an explicitly requested flush is pending
pub struct ExtraneousFlushGuard {
    manager: Arc<DirtyMemoryManager>,
}

impl Drop for ExtraneousFlushGuard {
    fn drop(&mut self) {
        self.manager.extraneous_flushes.fetch_sub(1, Ordering::SeqCst);
        self.manager.pressure.notify_one();
    }
}

#[derive(Debug, Default)]
pub struct DirtyMemoryStats {
    pub blocked_requests: AtomicU64,
    pub timed_out_requests: AtomicU64,
    pub overloaded_requests: AtomicU64,
    pub pressure_flushes: AtomicU64,
}

/// Point-in-time gauges of one pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirtyMemorySnapshot {
    pub real_dirty: usize,
    pub virtual_dirty: usize,
    pub currently_blocked: usize,
    pub blocked_requests: u64,
    pub timed_out_requests: u64,
    pub pressure_flushes: u64,
}

pub struct DirtyMemoryManager {
    name: &'static str,

    /// Writers wait while virtual usage is at or above this
    throttle_threshold: usize,

    /// The flush loop starts flushing above this
    soft_limit: usize,

    real_dirty: AtomicUsize,
    virtual_dirty: AtomicUsize,

    /// Signalled whenever usage goes down
    memory_released: Notify,

    /// Signalled whenever the flush loop should look again
    pressure: Notify,

    blocked: AtomicUsize,
    max_blocked: usize,

    flush_permits: Arc<Semaphore>,
    max_flushes: usize,

    extraneous_flushes: AtomicUsize,

    /// Memtable lists charged to this pool; dead entries are pruned lazily
    lists: Mutex<Vec<Weak<MemtableList>>>,

    shutting_down: AtomicBool,
    flush_loop: Mutex<Option<JoinHandle<()>>>,

    stats: DirtyMemoryStats,
}

impl DirtyMemoryManager {
    /// A pool of `threshold` bytes that starts flushing at `soft_limit * threshold`
    pub fn new(
        name: &'static str,
        threshold: usize,
        soft_limit: f64,
        max_flushes: usize,
        max_blocked: usize,
    ) -> Arc<Self> {
        let max_flushes = max_flushes.max(1);
        Arc::new(Self {
            name,
            throttle_threshold: threshold,
            soft_limit: (threshold as f64 * soft_limit) as usize,
            real_dirty: AtomicUsize::new(0),
            virtual_dirty: AtomicUsize::new(0),
            memory_released: Notify::new(),
            pressure: Notify::new(),
            blocked: AtomicUsize::new(0),
            max_blocked,
            flush_permits: Arc::new(Semaphore::new(max_flushes)),
            max_flushes,
            extraneous_flushes: AtomicUsize::new(0),
            lists: Mutex::new(Vec::new()),
            shutting_down: AtomicBool::new(false),
            flush_loop: Mutex::new(None),
            stats: DirtyMemoryStats::default(),
        })
    }

    /// Spawn the background flush loop. Must be called inside a tokio runtime.
    pub fn start(self: &Arc<Self>) {
        let mut slot = self.flush_loop.lock();
        if slot.is_some() {
            return;
        }
        let manager = self.clone();
        *slot = Some(tokio::spawn(async move { manager.flush_when_needed().await }));
        debug!(pool = self.name, threshold = self.throttle_threshold, "Started flush loop");
    }

    // =========================================================================
    // Accounting
    // =========================================================================

    pub fn reserve(&self, bytes: usize) {
        self.real_dirty.fetch_add(bytes, Ordering::SeqCst);
        let virtual_dirty = self.virtual_dirty.fetch_add(bytes, Ordering::SeqCst) + bytes;
        if virtual_dirty > self.soft_limit {
            self.pressure.notify_one();
        }
    }

    /// A flush of `bytes` started; they no longer count as virtual dirty
    pub fn start_release(&self, bytes: usize) {
        saturating_sub(&self.virtual_dirty, bytes);
        self.memory_released.notify_waiters();
    }

    /// A flush of `bytes` failed; count them as virtual dirty again
    pub fn revert_release(&self, bytes: usize) {
        let virtual_dirty = self.virtual_dirty.fetch_add(bytes, Ordering::SeqCst) + bytes;
        if virtual_dirty > self.soft_limit {
            self.pressure.notify_one();
        }
    }

    /// A memtable holding `bytes` is gone. `virtual_held` is false when its
    /// virtual share was already handed back by `start_release`.
    pub fn release(&self, bytes: usize, virtual_held: bool) {
        saturating_sub(&self.real_dirty, bytes);
        if virtual_held {
            saturating_sub(&self.virtual_dirty, bytes);
        }
        self.memory_released.notify_waiters();
    }

    pub fn real_dirty_memory(&self) -> usize {
        self.real_dirty.load(Ordering::SeqCst)
    }

    pub fn virtual_dirty_memory(&self) -> usize {
        self.virtual_dirty.load(Ordering::SeqCst)
    }

    pub fn throttle_threshold(&self) -> usize {
        self.throttle_threshold
    }

    pub fn soft_limit(&self) -> usize {
        self.soft_limit
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn over_soft_limit(&self) -> bool {
        self.virtual_dirty_memory() > self.soft_limit
    }

    fn under_threshold(&self) -> bool {
        self.virtual_dirty_memory() < self.throttle_threshold
    }

    // =========================================================================
    // Admission
    // =========================================================================

    /// Run `task` once virtual usage is below the throttle threshold
    ///
    /// Fails with `Timeout` when `deadline` passes first and with `Overloaded`
    /// when too many writers are already waiting.
    pub async fn run_when_memory_available<T, F>(&self, deadline: Deadline, task: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        if self.under_threshold() {
            return task();
        }
        if self.is_shutting_down() {
            return Err(ShardError::ShuttingDown);
        }

        // Step 1: Join the queue of blocked writers, if there is room
        if self.blocked.fetch_add(1, Ordering::SeqCst) >= self.max_blocked {
            self.blocked.fetch_sub(1, Ordering::SeqCst);
            self.stats.overloaded_requests.fetch_add(1, Ordering::Relaxed);
            return Err(ShardError::Overloaded(format!(
                "too many writes blocked on {} dirty memory",
                self.name
            )));
        }
        let _blocked = BlockedGuard(&self.blocked);
        self.stats.blocked_requests.fetch_add(1, Ordering::Relaxed);
        self.pressure.notify_one();

        // Step 2: Wait for memory to come back
        loop {
            let released = self.memory_released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            if self.under_threshold() {
                break;
            }
            if self.is_shutting_down() {
                return Err(ShardError::ShuttingDown);
            }
            if tokio::time::timeout_at(deadline, released).await.is_err() {
                self.stats.timed_out_requests.fetch_add(1, Ordering::Relaxed);
                return Err(ShardError::Timeout("dirty memory"));
            }
        }

        // Step 3: Run
        task()
    }

    // =========================================================================
    // Flush Coordination
    // =========================================================================

    /// Wait for a flush permit
    pub async fn get_flush_permit(&self) -> Result<FlushPermit> {
        self.flush_permits
            .clone()
            .acquire_owned()
            .await
            .map(|permit| FlushPermit { _permit: permit })
            .map_err(|_| ShardError::ShuttingDown)
    }

    pub fn available_flush_permits(&self) -> usize {
        self.flush_permits.available_permits()
    }

    /// Mark an explicitly requested flush as pending. The pressure loop
    /// stays out of the way until the guard is dropped.
    pub fn start_extraneous_flush(self: &Arc<Self>) -> ExtraneousFlushGuard {
        self.extraneous_flushes.fetch_add(1, Ordering::SeqCst);
        ExtraneousFlushGuard {
            manager: self.clone(),
        }
    }

    pub fn has_extraneous_flushes(&self) -> bool {
        self.extraneous_flushes.load(Ordering::SeqCst) > 0
    }

    pub fn register_list(&self, list: Weak<MemtableList>) {
        self.lists.lock().push(list);
    }

    pub fn registered_lists(&self) -> usize {
        let mut lists = self.lists.lock();
        lists.retain(|l| l.strong_count() > 0);
        lists.len()
    }

    /// The live list with the most flushable bytes
    fn pick_largest(&self) -> Option<Arc<MemtableList>> {
        let candidates: Vec<Arc<MemtableList>> = {
            let mut lists = self.lists.lock();
            lists.retain(|l| l.strong_count() > 0);
            lists.iter().filter_map(Weak::upgrade).collect()
        };
        candidates
            .into_iter()
            .map(|list| (list.flushable_size(), list))
            .max_by_key(|(size, _)| *size)
            .map(|(_, list)| list)
    }

    async fn flush_when_needed(self: Arc<Self>) {
        loop {
            // Step 1: Wait for pressure
            loop {
                let notified = self.pressure.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.is_shutting_down() {
                    return;
                }
                if self.over_soft_limit() {
                    break;
                }
                notified.await;
            }

            // Step 2: Bound concurrent flushes
            let permit = match self.get_flush_permit().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            if self.is_shutting_down() {
                return;
            }

            // Step 3: Explicit flushes go first
            if self.has_extraneous_flushes() {
                drop(permit);
                tokio::time::sleep(IDLE_BACKOFF).await;
                continue;
            }
            if !self.over_soft_limit() {
                continue;
            }

            // Step 4: Flush the largest memtable
            match self.pick_largest() {
                Some(list) if list.flushable_size() > 0 => {
                    self.stats.pressure_flushes.fetch_add(1, Ordering::Relaxed);
                    trace!(
                        pool = self.name,
                        table = list.name(),
                        virtual_dirty = self.virtual_dirty_memory(),
                        "Flushing under memory pressure"
                    );
                    let flush = list.seal_active_memtable_immediate(permit);
                    spawn_detached(flush);
                }
                _ => {
                    // Lagging release, not real pressure
                    drop(permit);
                    tokio::time::sleep(IDLE_BACKOFF).await;
                }
            }
        }
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Stop the flush loop after every in-flight flush has finished
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.pressure.notify_one();
        self.pressure.notify_waiters();
        self.memory_released.notify_waiters();

        let handle = self.flush_loop.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        // Every permit back means no flush is running
        if let Ok(all) = self.flush_permits.acquire_many(self.max_flushes as u32).await {
            self.flush_permits.close();
            drop(all);
        }
        info!(pool = self.name, real_dirty = self.real_dirty_memory(), "Dirty memory manager shut down");
    }

    pub fn stats(&self) -> DirtyMemorySnapshot {
        DirtyMemorySnapshot {
            real_dirty: self.real_dirty_memory(),
            virtual_dirty: self.virtual_dirty_memory(),
            currently_blocked: self.blocked.load(Ordering::SeqCst),
            blocked_requests: self.stats.blocked_requests.load(Ordering::Relaxed),
            timed_out_requests: self.stats.timed_out_requests.load(Ordering::Relaxed),
            pressure_flushes: self.stats.pressure_flushes.load(Ordering::Relaxed),
        }
    }
}

struct BlockedGuard<'a>(&'a AtomicUsize);

impl Drop for BlockedGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn saturating_sub(counter: &AtomicUsize, bytes: usize) {
    let _ = counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| Some(v.saturating_sub(bytes)));
}

/// Failures are logged by the memtable list
fn spawn_detached<F>(flush: F)
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let _ = flush.await;
    });
}
