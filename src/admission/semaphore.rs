//! Reader concurrency semaphore
//!
//! Bounds concurrent reads by count and by memory. Waiters are served in
//! arrival order. Paused reads can park in the inactive-read registry: they
//! keep their permit, but the semaphore may evict them (oldest first) when
//! somebody else is waiting for resources.
//!
//! ```text
//!   acquire ──▶ resources free & nobody queued? ──yes──▶ permit
//!                 │ no
//!                 ▼
//!             queue full? ──yes──▶ Overloaded (+ overload callback)
//!                 │ no
//!                 ▼
//!             enqueue, evict inactive reads, wait (deadline unless streaming)
//! ```

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{Result, ShardError};
use crate::utils::Deadline;

/// Count and memory held by a permit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResourceUnits {
    pub count: usize,
    pub memory: usize,
}

impl ResourceUnits {
    pub fn new(count: usize, memory: usize) -> Self {
        Self { count, memory }
    }
}

/// A paused read that can give its resources back on request
pub trait InactiveRead: Send {
    /// Resources that eviction would return
    fn units(&self) -> ResourceUnits;

    /// Drop the read's state (and with it, its permit)
    fn evict(self: Box<Self>);
}

pub type OverloadCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Default)]
pub struct SemaphoreStats {
    pub permit_based_evictions: AtomicU64,
    pub timeouts: AtomicU64,
    pub overloads: AtomicU64,
    pub admitted: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SemaphoreSnapshot {
    pub available: ResourceUnits,
    pub waiters: usize,
    pub inactive_reads: usize,
    pub permit_based_evictions: u64,
    pub timeouts: u64,
    pub overloads: u64,
    pub admitted: u64,
}

struct Waiter {
    id: u64,
    units: ResourceUnits,
    tx: oneshot::Sender<ReaderPermit>,
}

struct InactiveEntry {
    read: Box<dyn InactiveRead>,
}

struct SemState {
    available: ResourceUnits,
    waiters: VecDeque<Waiter>,
    /// Keyed by registration order, so the first entry is the oldest
    inactive: BTreeMap<u64, InactiveEntry>,
    next_id: u64,
    stopped: bool,
}

impl SemState {
    fn fits(&self, units: ResourceUnits) -> bool {
        self.available.count >= units.count && self.available.memory >= units.memory
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Pop waiters that fit now, in order
    fn grantable(&mut self) -> Vec<(oneshot::Sender<ReaderPermit>, ResourceUnits)> {
        let mut granted = Vec::new();
        while let Some(head) = self.waiters.front() {
            if !self.fits(head.units) {
                break;
            }
            if let Some(waiter) = self.waiters.pop_front() {
                self.available.count -= waiter.units.count;
                self.available.memory -= waiter.units.memory;
                granted.push((waiter.tx, waiter.units));
            }
        }
        granted
    }

    /// Inactive reads to evict, oldest first, until the head waiter would fit
    fn evictions_for_head(&mut self) -> Vec<Box<dyn InactiveRead>> {
        let Some(needed) = self.waiters.front().map(|w| w.units) else {
            return Vec::new();
        };
        let mut freed = self.available;
        let mut evicted = Vec::new();
        while freed.count < needed.count || freed.memory < needed.memory {
            let Some((_, entry)) = self.inactive.pop_first() else {
                break;
            };
            let units = entry.read.units();
            freed.count += units.count;
            freed.memory += units.memory;
            evicted.push(entry.read);
        }
        evicted
    }
}

struct SemaphoreInner {
    name: &'static str,
    limits: ResourceUnits,
    /// `None` = unbounded
    max_queue_length: Option<usize>,
    /// Streaming reads wait without a deadline
    timeouts: bool,
    on_overload: Option<OverloadCallback>,
    state: Mutex<SemState>,
    stats: SemaphoreStats,
}

impl SemaphoreInner {
    fn release(self: &Arc<Self>, units: ResourceUnits) {
        let granted = {
            let mut state = self.state.lock();
            state.available.count += units.count;
            state.available.memory += units.memory;
            state.grantable()
        };
        self.hand_out(granted);
    }

    /// Send permits with no lock held: a failed send drops the permit,
    /// which re-enters `release`.
    fn hand_out(self: &Arc<Self>, granted: Vec<(oneshot::Sender<ReaderPermit>, ResourceUnits)>) {
        for (tx, units) in granted {
            self.stats.admitted.fetch_add(1, Ordering::Relaxed);
            let _ = tx.send(ReaderPermit {
                semaphore: self.clone(),
                units,
            });
        }
    }

    fn evict(&self, reads: Vec<Box<dyn InactiveRead>>) {
        for read in reads {
            self.stats.permit_based_evictions.fetch_add(1, Ordering::Relaxed);
            debug!(semaphore = self.name, units = ?read.units(), "Evicting inactive read");
            read.evict();
        }
    }
}

/// Count + memory bounded admission for reads
#[derive(Clone)]
pub struct ReaderConcurrencySemaphore {
    inner: Arc<SemaphoreInner>,
}

impl ReaderConcurrencySemaphore {
    /// A semaphore whose waiters time out at their deadline and whose queue
    /// holds at most `max_queue_length` waiters
    pub fn new(
        name: &'static str,
        count: usize,
        memory: usize,
        max_queue_length: Option<usize>,
        on_overload: Option<OverloadCallback>,
    ) -> Self {
        Self::build(name, ResourceUnits::new(count, memory), max_queue_length, true, on_overload)
    }

    /// No queue bound and no timeouts: streaming and repair reads are never
    /// shed by admission
    pub fn for_streaming(name: &'static str, count: usize, memory: usize) -> Self {
        Self::build(name, ResourceUnits::new(count, memory), None, false, None)
    }

    fn build(
        name: &'static str,
        limits: ResourceUnits,
        max_queue_length: Option<usize>,
        timeouts: bool,
        on_overload: Option<OverloadCallback>,
    ) -> Self {
        Self {
            inner: Arc::new(SemaphoreInner {
                name,
                limits,
                max_queue_length,
                timeouts,
                on_overload,
                state: Mutex::new(SemState {
                    available: limits,
                    waiters: VecDeque::new(),
                    inactive: BTreeMap::new(),
                    next_id: 0,
                    stopped: false,
                }),
                stats: SemaphoreStats::default(),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    pub fn limits(&self) -> ResourceUnits {
        self.inner.limits
    }

    pub fn available(&self) -> ResourceUnits {
        self.inner.state.lock().available
    }

    /// Wait for `count` slots and `memory` bytes
    ///
    /// Requests larger than the limits are clamped to them so one big read
    /// can still run alone.
    pub async fn acquire(&self, count: usize, memory: usize, deadline: Deadline) -> Result<ReaderPermit> {
        let units = ResourceUnits::new(
            count.min(self.inner.limits.count),
            memory.min(self.inner.limits.memory),
        );

        // Step 1: Fast path, or join the queue
        let (id, rx, evicted) = {
            let mut state = self.inner.state.lock();
            if state.stopped {
                return Err(ShardError::ShuttingDown);
            }
            if state.waiters.is_empty() && state.fits(units) {
                state.available.count -= units.count;
                state.available.memory -= units.memory;
                drop(state);
                self.inner.stats.admitted.fetch_add(1, Ordering::Relaxed);
                return Ok(ReaderPermit {
                    semaphore: self.inner.clone(),
                    units,
                });
            }
            if let Some(max) = self.inner.max_queue_length {
                if state.waiters.len() >= max {
                    drop(state);
                    self.inner.stats.overloads.fetch_add(1, Ordering::Relaxed);
                    if let Some(callback) = &self.inner.on_overload {
                        callback();
                    }
                    return Err(ShardError::Overloaded(format!(
                        "{} read admission queue is full",
                        self.inner.name
                    )));
                }
            }
            let id = state.next_id();
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(Waiter { id, units, tx });
            let evicted = state.evictions_for_head();
            (id, rx, evicted)
        };

        // Step 2: Make room; evicted permits flow back through `release`
        self.inner.evict(evicted);

        // Step 3: Wait
        if !self.inner.timeouts {
            return rx.await.map_err(|_| ShardError::ShuttingDown);
        }
        tokio::pin!(rx);
        match tokio::time::timeout_at(deadline, &mut rx).await {
            Ok(result) => result.map_err(|_| ShardError::ShuttingDown),
            Err(_) => {
                let removed = {
                    let mut state = self.inner.state.lock();
                    let before = state.waiters.len();
                    state.waiters.retain(|w| w.id != id);
                    state.waiters.len() != before
                };
                if removed {
                    self.inner.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                    // The head may have changed
                    let granted = self.inner.state.lock().grantable();
                    self.inner.hand_out(granted);
                    return Err(ShardError::Timeout("read admission"));
                }
                // Granted while timing out; the permit is on its way
                rx.await.map_err(|_| ShardError::ShuttingDown)
            }
        }
    }

    // =========================================================================
    // Inactive Reads
    // =========================================================================

    /// Park a paused read. If others are already waiting it is evicted
    /// right away.
    pub fn register_inactive_read(&self, read: Box<dyn InactiveRead>) -> InactiveReadHandle {
        let mut state = self.inner.state.lock();
        if !state.waiters.is_empty() || state.stopped {
            drop(state);
            self.inner.evict(vec![read]);
            return InactiveReadHandle {
                semaphore: Weak::new(),
                id: 0,
            };
        }
        let id = state.next_id();
        state.inactive.insert(id, InactiveEntry { read });
        InactiveReadHandle {
            semaphore: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Take a parked read back; `None` if it was evicted meanwhile
    pub fn unregister_inactive_read(&self, handle: InactiveReadHandle) -> Option<Box<dyn InactiveRead>> {
        handle.take_read()
    }

    pub fn inactive_reads(&self) -> usize {
        self.inner.state.lock().inactive.len()
    }

    /// Evict every parked read
    pub fn evict_inactive_reads(&self) -> usize {
        let reads: Vec<Box<dyn InactiveRead>> = {
            let mut state = self.inner.state.lock();
            std::mem::take(&mut state.inactive)
                .into_values()
                .map(|e| e.read)
                .collect()
        };
        let count = reads.len();
        self.inner.evict(reads);
        count
    }

    /// Refuse new reads, evict parked ones and fail queued waiters
    pub fn stop(&self) {
        let waiters = {
            let mut state = self.inner.state.lock();
            state.stopped = true;
            std::mem::take(&mut state.waiters)
        };
        drop(waiters);
        let evicted = self.evict_inactive_reads();
        debug!(semaphore = self.inner.name, evicted, "Stopped read semaphore");
    }

    pub fn stats(&self) -> SemaphoreSnapshot {
        let state = self.inner.state.lock();
        let stats = &self.inner.stats;
        SemaphoreSnapshot {
            available: state.available,
            waiters: state.waiters.len(),
            inactive_reads: state.inactive.len(),
            permit_based_evictions: stats.permit_based_evictions.load(Ordering::Relaxed),
            timeouts: stats.timeouts.load(Ordering::Relaxed),
            overloads: stats.overloads.load(Ordering::Relaxed),
            admitted: stats.admitted.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for ReaderConcurrencySemaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReaderConcurrencySemaphore")
            .field("name", &self.inner.name)
            .field("limits", &self.inner.limits)
            .finish()
    }
}

/// Resources held by one admitted read; returned on drop
pub struct ReaderPermit {
    semaphore: Arc<SemaphoreInner>,
    units: ResourceUnits,
}

impl ReaderPermit {
    pub fn units(&self) -> ResourceUnits {
        self.units
    }

    /// The semaphore that issued this permit
    pub fn semaphore(&self) -> ReaderConcurrencySemaphore {
        ReaderConcurrencySemaphore {
            inner: self.semaphore.clone(),
        }
    }
}

impl Drop for ReaderPermit {
    fn drop(&mut self) {
        self.semaphore.release(self.units);
    }
}

impl fmt::Debug for ReaderPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReaderPermit")
            .field("semaphore", &self.semaphore.name)
            .field("units", &self.units)
            .finish()
    }
}

/// Ticket for a parked read
pub struct InactiveReadHandle {
    semaphore: Weak<SemaphoreInner>,
    id: u64,
}

impl InactiveReadHandle {
    pub(crate) fn take_read(self) -> Option<Box<dyn InactiveRead>> {
        let semaphore = self.semaphore.upgrade()?;
        let entry = semaphore.state.lock().inactive.remove(&self.id);
        entry.map(|e| e.read)
    }

    /// Whether the read is still parked
    pub fn is_registered(&self) -> bool {
        self.semaphore
            .upgrade()
            .map_or(false, |s| s.state.lock().inactive.contains_key(&self.id))
    }
}
