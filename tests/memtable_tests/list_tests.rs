//! Tests for the memtable list
//!
//! These tests verify:
//! - Writes go to the active memtable and reads see sealed ones too
//! - Requested flushes seal and write out the active memtable
//! - Concurrent flush requests coalesce into one flush
//! - A failed flush keeps its memtable and reports the failure to every waiter

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cfshard::commitlog::ReplayPosition;
use cfshard::dirty_memory::DirtyMemoryManager;
use cfshard::memtable::{Memtable, MemtableFlusher, MemtableList};
use cfshard::schema::TableId;
use cfshard::{Mutation, PartitionKey, ShardError};

// =============================================================================
// Helper Functions
// =============================================================================

fn dirty_manager() -> Arc<DirtyMemoryManager> {
    DirtyMemoryManager::new("regular", 64 * 1024 * 1024, 0.5, 1, 100)
}

fn mutation(key: &str, value: &str) -> Mutation {
    let mut m = Mutation::for_table(TableId::from_name("ks", "t"), key);
    m.set("ck", "v", value.to_string(), 1);
    m
}

/// Counts flushes; fails them while `failing` is set
#[derive(Default)]
struct TestFlusher {
    calls: AtomicUsize,
    partitions: AtomicUsize,
    failing: AtomicBool,
}

#[async_trait]
impl MemtableFlusher for TestFlusher {
    async fn flush_memtable(&self, memtable: Arc<Memtable>) -> cfshard::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(ShardError::Storage("disk full".to_string()));
        }
        self.partitions.fetch_add(memtable.partition_count(), Ordering::SeqCst);
        Ok(())
    }
}

fn setup() -> (Arc<DirtyMemoryManager>, Arc<TestFlusher>, Arc<MemtableList>) {
    let dirty = dirty_manager();
    let flusher = Arc::new(TestFlusher::default());
    let list = MemtableList::new("ks.t", dirty.clone(), flusher.clone());
    (dirty, flusher, list)
}

// =============================================================================
// Write and Read Tests
// =============================================================================

#[tokio::test]
async fn test_apply_goes_to_active_memtable() {
    let (dirty, _flusher, list) = setup();

    list.apply(&mutation("k1", "a"), ReplayPosition::new(1, 10));
    list.apply(&mutation("k2", "b"), ReplayPosition::new(1, 20));

    let active = list.active();
    assert_eq!(active.partition_count(), 2);
    assert_eq!(active.max_position(), ReplayPosition::new(1, 20));
    assert_eq!(list.memtables().len(), 1);
    assert_eq!(dirty.real_dirty_memory(), active.occupancy());
    assert!(!list.is_empty());
}

#[tokio::test]
async fn test_sealed_memtables_stay_readable() {
    let (dirty, flusher, list) = setup();
    flusher.failing.store(true, Ordering::SeqCst);
    list.apply(&mutation("k1", "old"), ReplayPosition::zero());

    let _ = list.request_flush().await;
    list.apply(&mutation("k2", "new"), ReplayPosition::zero());

    let memtables = list.memtables();
    assert_eq!(memtables.len(), 2);
    assert!(memtables[0].get(&PartitionKey::from("k2")).is_some());
    assert!(memtables[1].get(&PartitionKey::from("k1")).is_some());
    assert_eq!(dirty.virtual_dirty_memory(), dirty.real_dirty_memory());
}

// =============================================================================
// Flush Tests
// =============================================================================

#[tokio::test]
async fn test_request_flush_writes_active_memtable() {
    let (dirty, flusher, list) = setup();
    list.apply(&mutation("k1", "a"), ReplayPosition::zero());
    list.apply(&mutation("k2", "b"), ReplayPosition::zero());

    list.request_flush().await.unwrap();

    assert_eq!(flusher.calls.load(Ordering::SeqCst), 1);
    assert_eq!(flusher.partitions.load(Ordering::SeqCst), 2);
    assert!(list.is_empty());
    assert_eq!(list.stats().flushes.load(Ordering::Relaxed), 1);
    assert_eq!(dirty.real_dirty_memory(), 0);
}

#[tokio::test]
async fn test_flush_of_empty_list_writes_nothing() {
    let (_dirty, flusher, list) = setup();

    list.request_flush().await.unwrap();

    assert_eq!(flusher.calls.load(Ordering::SeqCst), 0);
    assert_eq!(list.sealed_count(), 0);
}

#[tokio::test]
async fn test_concurrent_flush_requests_coalesce() {
    let (dirty, flusher, list) = setup();
    list.apply(&mutation("k1", "a"), ReplayPosition::zero());

    // Hold the only permit so every request finds the first one pending
    let permit = dirty.get_flush_permit().await.unwrap();
    let waiters: Vec<_> = (0..5).map(|_| list.request_flush()).collect();
    assert_eq!(list.stats().coalesced_requests.load(Ordering::Relaxed), 4);

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(flusher.calls.load(Ordering::SeqCst), 0);
    drop(permit);

    for waiter in waiters {
        waiter.await.unwrap();
    }
    assert_eq!(flusher.calls.load(Ordering::SeqCst), 1);
    assert!(list.is_empty());
}

#[tokio::test]
async fn test_request_after_flush_started_gets_new_flush() {
    let (_dirty, flusher, list) = setup();
    list.apply(&mutation("k1", "a"), ReplayPosition::zero());
    list.request_flush().await.unwrap();

    list.apply(&mutation("k2", "b"), ReplayPosition::zero());
    list.request_flush().await.unwrap();

    assert_eq!(flusher.calls.load(Ordering::SeqCst), 2);
    assert_eq!(list.stats().coalesced_requests.load(Ordering::Relaxed), 0);
}

#[tokio::test]
async fn test_failed_flush_propagates_to_all_waiters() {
    let (dirty, flusher, list) = setup();
    flusher.failing.store(true, Ordering::SeqCst);
    list.apply(&mutation("k1", "a"), ReplayPosition::zero());

    let permit = dirty.get_flush_permit().await.unwrap();
    let first = list.request_flush();
    let second = list.request_flush();
    drop(permit);

    let (first, second) = tokio::join!(first, second);
    assert!(matches!(first, Err(ShardError::FlushFailed { .. })));
    assert!(matches!(second, Err(ShardError::FlushFailed { .. })));
    assert_eq!(list.stats().failed_flushes.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn test_failed_flush_keeps_memtable_for_retry() {
    let (dirty, flusher, list) = setup();
    flusher.failing.store(true, Ordering::SeqCst);
    list.apply(&mutation("k1", "a"), ReplayPosition::zero());
    let charged = dirty.real_dirty_memory();

    let result = list.request_flush().await;

    assert!(result.is_err());
    assert_eq!(list.sealed_count(), 1);
    assert_eq!(dirty.virtual_dirty_memory(), charged);

    // The next flush picks the kept memtable up
    flusher.failing.store(false, Ordering::SeqCst);
    list.request_flush().await.unwrap();

    assert_eq!(list.sealed_count(), 0);
    assert_eq!(flusher.partitions.load(Ordering::SeqCst), 1);
    assert_eq!(dirty.real_dirty_memory(), 0);
}

#[tokio::test]
async fn test_clear_takes_every_memtable() {
    let (dirty, flusher, list) = setup();
    flusher.failing.store(true, Ordering::SeqCst);
    list.apply(&mutation("k1", "a"), ReplayPosition::new(1, 1));
    let _ = list.request_flush().await;
    list.apply(&mutation("k2", "b"), ReplayPosition::new(1, 2));

    let cleared = list.clear().await;

    assert_eq!(cleared.len(), 2);
    assert!(list.is_empty());
    drop(cleared);
    assert_eq!(dirty.real_dirty_memory(), 0);
    assert_eq!(dirty.virtual_dirty_memory(), 0);
}
