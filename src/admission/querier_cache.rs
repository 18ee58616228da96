//! Querier cache
//!
//! Keeps the cursor of a paged query between pages so the next page can
//! continue where the last one stopped instead of reading everything again.
//!
//! A cached querier still owns its read permit, so every entry is also
//! registered as an inactive read with the permit's semaphore. Entries leave
//! the cache on:
//! - lookup (hit, miss or drop)
//! - time: older than the TTL
//! - resource pressure: the semaphore evicted the inactive read
//! - memory: the cache is over its budget (oldest first)

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::trace;
use uuid::Uuid;

use crate::mutation::{Partition, PartitionKey};
use crate::query::PagePosition;
use crate::schema::TableId;

use super::semaphore::{InactiveRead, InactiveReadHandle, ReaderPermit, ResourceUnits};

/// A paused read: the partitions left to return and the permit it runs under
pub struct Querier {
    table_id: TableId,
    position: Option<PagePosition>,
    remaining: VecDeque<(PartitionKey, Partition)>,
    memory: usize,
    permit: ReaderPermit,
}

impl Querier {
    /// `position` is where the page that produced this querier stopped
    pub fn new(
        table_id: TableId,
        position: Option<PagePosition>,
        remaining: VecDeque<(PartitionKey, Partition)>,
        permit: ReaderPermit,
    ) -> Self {
        let memory = remaining
            .iter()
            .map(|(k, p)| k.len() + p.memory_usage())
            .sum();
        Self {
            table_id,
            position,
            remaining,
            memory,
            permit,
        }
    }

    pub fn table_id(&self) -> TableId {
        self.table_id
    }

    pub fn position(&self) -> Option<&PagePosition> {
        self.position.as_ref()
    }

    pub fn memory_usage(&self) -> usize {
        self.memory
    }

    pub fn permit(&self) -> &ReaderPermit {
        &self.permit
    }

    pub fn into_parts(self) -> (VecDeque<(PartitionKey, Partition)>, ReaderPermit) {
        (self.remaining, self.permit)
    }
}

#[derive(Debug, Default)]
pub struct QuerierCacheStats {
    pub lookups: AtomicU64,
    pub misses: AtomicU64,
    pub drops: AtomicU64,
    pub time_based_evictions: AtomicU64,
    pub resource_based_evictions: AtomicU64,
    pub memory_based_evictions: AtomicU64,
    pub population: AtomicUsize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QuerierCacheSnapshot {
    pub lookups: u64,
    pub misses: u64,
    pub drops: u64,
    pub time_based_evictions: u64,
    pub resource_based_evictions: u64,
    pub memory_based_evictions: u64,
    pub population: usize,
}

type Slot = Arc<Mutex<Option<Querier>>>;

/// What the semaphore sees of a cached querier
struct CachedRead {
    query_id: Uuid,
    slot: Slot,
    units: ResourceUnits,
    state: Arc<Mutex<CacheState>>,
    stats: Arc<QuerierCacheStats>,
}

impl InactiveRead for CachedRead {
    fn units(&self) -> ResourceUnits {
        self.units
    }

    fn evict(self: Box<Self>) {
        let Some(querier) = self.slot.lock().take() else {
            return;
        };
        self.stats.resource_based_evictions.fetch_add(1, Ordering::Relaxed);
        self.stats.population.fetch_sub(1, Ordering::Relaxed);

        // The id may already name a newer querier; only our entry goes
        let removed = {
            let mut state = self.state.lock();
            let ours = state
                .entries
                .get(&self.query_id)
                .is_some_and(|e| Arc::ptr_eq(&e.slot, &self.slot));
            let removed = if ours { state.entries.remove(&self.query_id) } else { None };
            if let Some(entry) = removed.as_ref() {
                state.memory -= entry.memory;
            }
            removed
        };
        trace!(query = %self.query_id, "Querier evicted by its semaphore");
        drop(removed);
        drop(querier);
    }
}

struct Entry {
    table_id: TableId,
    slot: Slot,
    handle: InactiveReadHandle,
    inserted: Instant,
    memory: usize,
}

impl Entry {
    /// Take the querier out of the semaphore's registry and the slot
    fn take(self) -> Option<Querier> {
        if let Some(read) = self.handle.take_read() {
            drop(read);
        }
        self.slot.lock().take()
    }
}

struct CacheState {
    entries: HashMap<Uuid, Entry>,
    memory: usize,
}

pub struct QuerierCache {
    ttl: Duration,
    max_memory: usize,
    /// Shared with the semaphore's view of each entry so an eviction there
    /// removes the entry here too
    state: Arc<Mutex<CacheState>>,
    stats: Arc<QuerierCacheStats>,
}

impl QuerierCache {
    pub fn new(ttl: Duration, max_memory: usize) -> Self {
        Self {
            ttl,
            max_memory,
            state: Arc::new(Mutex::new(CacheState {
                entries: HashMap::new(),
                memory: 0,
            })),
            stats: Arc::new(QuerierCacheStats::default()),
        }
    }

    /// Cache `querier` under `query_id`, replacing an older entry
    pub fn insert(&self, query_id: Uuid, querier: Querier) {
        self.evict_expired();

        let table_id = querier.table_id;
        let memory = querier.memory;
        let semaphore = querier.permit.semaphore();
        let units = querier.permit.units();
        let slot: Slot = Arc::new(Mutex::new(Some(querier)));

        self.stats.population.fetch_add(1, Ordering::Relaxed);
        let handle = semaphore.register_inactive_read(Box::new(CachedRead {
            query_id,
            slot: slot.clone(),
            units,
            state: self.state.clone(),
            stats: self.stats.clone(),
        }));

        let (replaced, over_budget) = {
            let mut state = self.state.lock();
            // Evicted as soon as it was parked: nothing left to cache
            if slot.lock().is_none() {
                trace!(query = %query_id, "Querier evicted before it was cached");
                return;
            }
            state.memory += memory;
            let replaced = state.entries.insert(
                query_id,
                Entry {
                    table_id,
                    slot,
                    handle,
                    inserted: Instant::now(),
                    memory,
                },
            );
            if let Some(old) = replaced.as_ref() {
                state.memory -= old.memory;
            }
            let over_budget = Self::take_over_budget(&mut state, self.max_memory);
            (replaced, over_budget)
        };

        if let Some(old) = replaced {
            self.discard(old);
        }
        for entry in over_budget {
            self.stats.memory_based_evictions.fetch_add(1, Ordering::Relaxed);
            self.discard(entry);
        }
        trace!(query = %query_id, memory, "Cached querier");
    }

    /// Find the querier of `query_id` for a page of `table_id` starting after
    /// `position`. A querier positioned elsewhere is dropped, not returned.
    pub fn lookup(&self, query_id: Uuid, table_id: TableId, position: Option<&PagePosition>) -> Option<Querier> {
        self.stats.lookups.fetch_add(1, Ordering::Relaxed);
        let entry = {
            let mut state = self.state.lock();
            let entry = state.entries.remove(&query_id);
            if let Some(e) = entry.as_ref() {
                state.memory -= e.memory;
            }
            entry
        };

        let Some(entry) = entry else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };
        let Some(querier) = entry.take() else {
            // Evicted by the semaphore while cached
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };
        self.stats.population.fetch_sub(1, Ordering::Relaxed);

        if querier.table_id != table_id || querier.position.as_ref() != position {
            self.stats.drops.fetch_add(1, Ordering::Relaxed);
            trace!(query = %query_id, "Dropping querier with mismatching position");
            return None;
        }
        Some(querier)
    }

    /// Remove entries older than the TTL
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<Entry> = {
            let mut state = self.state.lock();
            let keys: Vec<Uuid> = state
                .entries
                .iter()
                .filter(|(_, e)| now.duration_since(e.inserted) >= self.ttl)
                .map(|(k, _)| *k)
                .collect();
            let mut expired = Vec::with_capacity(keys.len());
            for key in keys {
                if let Some(entry) = state.entries.remove(&key) {
                    state.memory -= entry.memory;
                    expired.push(entry);
                }
            }
            expired
        };
        let mut evicted = 0;
        for entry in expired {
            if self.discard(entry) {
                self.stats.time_based_evictions.fetch_add(1, Ordering::Relaxed);
                evicted += 1;
            }
        }
        evicted
    }

    /// Drop every querier reading `table_id`
    pub fn evict_all_for_table(&self, table_id: TableId) {
        let removed: Vec<Entry> = {
            let mut state = self.state.lock();
            let keys: Vec<Uuid> = state
                .entries
                .iter()
                .filter(|(_, e)| e.table_id == table_id)
                .map(|(k, _)| *k)
                .collect();
            keys.into_iter()
                .filter_map(|k| state.entries.remove(&k))
                .collect()
        };
        for entry in removed {
            self.state.lock().memory -= entry.memory;
            self.discard(entry);
        }
    }

    pub fn evict_all(&self) {
        let removed: Vec<Entry> = {
            let mut state = self.state.lock();
            state.memory = 0;
            state.entries.drain().map(|(_, e)| e).collect()
        };
        for entry in removed {
            self.discard(entry);
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn memory_usage(&self) -> usize {
        self.state.lock().memory
    }

    pub fn stats(&self) -> QuerierCacheSnapshot {
        let s = &self.stats;
        QuerierCacheSnapshot {
            lookups: s.lookups.load(Ordering::Relaxed),
            misses: s.misses.load(Ordering::Relaxed),
            drops: s.drops.load(Ordering::Relaxed),
            time_based_evictions: s.time_based_evictions.load(Ordering::Relaxed),
            resource_based_evictions: s.resource_based_evictions.load(Ordering::Relaxed),
            memory_based_evictions: s.memory_based_evictions.load(Ordering::Relaxed),
            population: s.population.load(Ordering::Relaxed),
        }
    }

    /// Oldest entries beyond the memory budget; the newest one always stays
    fn take_over_budget(state: &mut CacheState, max_memory: usize) -> Vec<Entry> {
        let mut evicted = Vec::new();
        while state.memory > max_memory && state.entries.len() > 1 {
            let oldest = state
                .entries
                .iter()
                .min_by_key(|(_, e)| e.inserted)
                .map(|(k, _)| *k);
            let Some(key) = oldest else { break };
            if let Some(entry) = state.entries.remove(&key) {
                state.memory -= entry.memory;
                evicted.push(entry);
            }
        }
        evicted
    }

    /// Release an entry's querier; false if the semaphore got it first
    fn discard(&self, entry: Entry) -> bool {
        match entry.take() {
            Some(querier) => {
                self.stats.population.fetch_sub(1, Ordering::Relaxed);
                drop(querier);
                true
            }
            None => false,
        }
    }
}

/// Per-request view of the cache: a read without a query id, or the first
/// page of a query, never hits it
pub struct QuerierCacheContext<'a> {
    cache: Option<&'a QuerierCache>,
    query_id: Option<Uuid>,
    is_first_page: bool,
}

impl<'a> QuerierCacheContext<'a> {
    pub fn new(cache: Option<&'a QuerierCache>, query_id: Option<Uuid>, is_first_page: bool) -> Self {
        Self {
            cache,
            query_id,
            is_first_page,
        }
    }

    pub fn lookup(&self, table_id: TableId, position: Option<&PagePosition>) -> Option<Querier> {
        match (self.cache, self.query_id) {
            (Some(cache), Some(id)) if !self.is_first_page => cache.lookup(id, table_id, position),
            _ => None,
        }
    }

    pub fn insert(&self, querier: Querier) {
        if let (Some(cache), Some(id)) = (self.cache, self.query_id) {
            cache.insert(id, querier);
        }
    }
}
