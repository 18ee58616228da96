//! Tests for the querier cache
//!
//! These tests verify:
//! - A querier is found again only at the position its page stopped
//! - Entries expire after the TTL
//! - The memory budget evicts the oldest entries
//! - The read semaphore can take a cached querier's permit back, and the
//!   entry with it
//! - First pages and reads without a query id bypass the cache

use std::collections::VecDeque;
use std::time::Duration;

use cfshard::admission::{Querier, QuerierCache, QuerierCacheContext, ReaderConcurrencySemaphore};
use cfshard::query::PagePosition;
use cfshard::schema::TableId;
use cfshard::utils::{deadline_after, no_deadline};
use cfshard::{ClusteringKey, Mutation, PartitionKey};
use uuid::Uuid;

// =============================================================================
// Helper Functions
// =============================================================================

fn table() -> TableId {
    TableId::from_name("ks", "t")
}

fn semaphore(count: usize) -> ReaderConcurrencySemaphore {
    ReaderConcurrencySemaphore::new("test_read", count, 1 << 20, Some(100), None)
}

fn position(key: &str, ck: &str) -> PagePosition {
    PagePosition {
        key: PartitionKey::from(key),
        clustering: Some(ClusteringKey::from(ck)),
    }
}

async fn querier(sem: &ReaderConcurrencySemaphore, table_id: TableId, at: PagePosition, value_size: usize) -> Querier {
    let permit = sem.acquire(1, 1024, no_deadline()).await.unwrap();
    let mut m = Mutation::for_table(table_id, "next");
    m.set("c1", "v", vec![1u8; value_size], 1);
    let mut remaining = VecDeque::new();
    remaining.push_back(m.into_parts());
    Querier::new(table_id, Some(at), remaining, permit)
}

// =============================================================================
// Lookup Tests
// =============================================================================

#[tokio::test]
async fn test_lookup_at_matching_position_hits() {
    let sem = semaphore(10);
    let cache = QuerierCache::new(Duration::from_secs(10), 1 << 20);
    let id = Uuid::new_v4();
    let at = position("k1", "c9");

    cache.insert(id, querier(&sem, table(), at.clone(), 16).await);
    assert_eq!(cache.len(), 1);
    assert_eq!(sem.inactive_reads(), 1);

    let found = cache.lookup(id, table(), Some(&at)).unwrap();

    assert_eq!(found.position(), Some(&at));
    assert!(cache.is_empty());
    assert_eq!(sem.inactive_reads(), 0);
    let stats = cache.stats();
    assert_eq!(stats.lookups, 1);
    assert_eq!(stats.misses, 0);
    assert_eq!(stats.population, 0);
}

#[tokio::test]
async fn test_lookup_unknown_query_misses() {
    let cache = QuerierCache::new(Duration::from_secs(10), 1 << 20);

    let found = cache.lookup(Uuid::new_v4(), table(), None);

    assert!(found.is_none());
    assert_eq!(cache.stats().misses, 1);
}

#[tokio::test]
async fn test_lookup_at_other_position_drops_querier() {
    let sem = semaphore(10);
    let cache = QuerierCache::new(Duration::from_secs(10), 1 << 20);
    let id = Uuid::new_v4();
    cache.insert(id, querier(&sem, table(), position("k1", "c9"), 16).await);

    let found = cache.lookup(id, table(), Some(&position("k1", "c3")));

    assert!(found.is_none());
    assert_eq!(cache.stats().drops, 1);
    assert!(cache.is_empty());
    assert_eq!(sem.available().count, 10);
}

#[tokio::test]
async fn test_lookup_for_other_table_drops_querier() {
    let sem = semaphore(10);
    let cache = QuerierCache::new(Duration::from_secs(10), 1 << 20);
    let id = Uuid::new_v4();
    let at = position("k1", "c9");
    cache.insert(id, querier(&sem, table(), at.clone(), 16).await);

    let found = cache.lookup(id, TableId::from_name("ks", "other"), Some(&at));

    assert!(found.is_none());
    assert_eq!(cache.stats().drops, 1);
}

#[tokio::test]
async fn test_insert_replaces_entry_of_same_query() {
    let sem = semaphore(10);
    let cache = QuerierCache::new(Duration::from_secs(10), 1 << 20);
    let id = Uuid::new_v4();

    cache.insert(id, querier(&sem, table(), position("k1", "c1"), 16).await);
    cache.insert(id, querier(&sem, table(), position("k2", "c1"), 16).await);

    assert_eq!(cache.len(), 1);
    assert_eq!(cache.stats().population, 1);
    assert_eq!(sem.available().count, 9);
    assert!(cache.lookup(id, table(), Some(&position("k2", "c1"))).is_some());
}

// =============================================================================
// Eviction Tests
// =============================================================================

#[tokio::test]
async fn test_entries_expire_after_ttl() {
    let sem = semaphore(10);
    let cache = QuerierCache::new(Duration::from_millis(10), 1 << 20);
    cache.insert(Uuid::new_v4(), querier(&sem, table(), position("k1", "c1"), 16).await);

    tokio::time::sleep(Duration::from_millis(30)).await;

    assert_eq!(cache.evict_expired(), 1);
    assert!(cache.is_empty());
    assert_eq!(cache.stats().time_based_evictions, 1);
    assert_eq!(sem.available().count, 10);
}

#[tokio::test]
async fn test_insert_evicts_expired_entries() {
    let sem = semaphore(10);
    let cache = QuerierCache::new(Duration::from_millis(10), 1 << 20);
    cache.insert(Uuid::new_v4(), querier(&sem, table(), position("k1", "c1"), 16).await);
    tokio::time::sleep(Duration::from_millis(30)).await;

    cache.insert(Uuid::new_v4(), querier(&sem, table(), position("k2", "c1"), 16).await);

    assert_eq!(cache.len(), 1);
    assert_eq!(cache.stats().time_based_evictions, 1);
}

#[tokio::test]
async fn test_memory_budget_evicts_oldest() {
    let sem = semaphore(10);
    let cache = QuerierCache::new(Duration::from_secs(10), 6000);
    let old = Uuid::new_v4();
    let new = Uuid::new_v4();

    cache.insert(old, querier(&sem, table(), position("k1", "c1"), 4000).await);
    tokio::time::sleep(Duration::from_millis(2)).await;
    cache.insert(new, querier(&sem, table(), position("k2", "c1"), 4000).await);

    assert_eq!(cache.len(), 1);
    assert_eq!(cache.stats().memory_based_evictions, 1);
    assert!(cache.memory_usage() <= 6000);
    assert!(cache.lookup(new, table(), Some(&position("k2", "c1"))).is_some());
    assert!(cache.lookup(old, table(), Some(&position("k1", "c1"))).is_none());
}

#[tokio::test]
async fn test_semaphore_takes_cached_permit_back() {
    let sem = semaphore(1);
    let cache = QuerierCache::new(Duration::from_secs(10), 1 << 20);
    let id = Uuid::new_v4();
    let at = position("k1", "c1");
    cache.insert(id, querier(&sem, table(), at.clone(), 16).await);

    let permit = sem
        .acquire(1, 1024, deadline_after(Duration::from_secs(5)))
        .await
        .unwrap();

    assert_eq!(cache.stats().resource_based_evictions, 1);
    assert_eq!(cache.stats().population, 0);
    assert_eq!(cache.len(), 0);
    assert_eq!(cache.memory_usage(), 0);
    assert!(cache.lookup(id, table(), Some(&at)).is_none());
    assert_eq!(cache.stats().misses, 1);
    drop(permit);
}

#[tokio::test]
async fn test_evicted_querier_frees_cache_budget() {
    let busy = semaphore(1);
    let idle = semaphore(10);
    let cache = QuerierCache::new(Duration::from_secs(10), 6000);
    let live = Uuid::new_v4();
    let evicted = Uuid::new_v4();

    cache.insert(live, querier(&idle, table(), position("k1", "c1"), 2000).await);
    tokio::time::sleep(Duration::from_millis(2)).await;
    cache.insert(evicted, querier(&busy, table(), position("k2", "c1"), 3000).await);
    let permit = busy
        .acquire(1, 1024, deadline_after(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(cache.len(), 1);

    // Fits next to the live querier once the evicted one stops counting
    tokio::time::sleep(Duration::from_millis(2)).await;
    cache.insert(Uuid::new_v4(), querier(&idle, table(), position("k3", "c1"), 2000).await);

    assert_eq!(cache.len(), 2);
    assert_eq!(cache.stats().memory_based_evictions, 0);
    assert!(cache.lookup(live, table(), Some(&position("k1", "c1"))).is_some());
    drop(permit);
}

#[tokio::test]
async fn test_evict_all_for_table() {
    let sem = semaphore(10);
    let cache = QuerierCache::new(Duration::from_secs(10), 1 << 20);
    let other = TableId::from_name("ks", "other");
    cache.insert(Uuid::new_v4(), querier(&sem, table(), position("k1", "c1"), 16).await);
    cache.insert(Uuid::new_v4(), querier(&sem, table(), position("k2", "c1"), 16).await);
    let kept = Uuid::new_v4();
    cache.insert(kept, querier(&sem, other, position("k3", "c1"), 16).await);

    cache.evict_all_for_table(table());

    assert_eq!(cache.len(), 1);
    assert_eq!(sem.available().count, 9);
    assert!(cache.lookup(kept, other, Some(&position("k3", "c1"))).is_some());
}

// =============================================================================
// Context Tests
// =============================================================================

#[tokio::test]
async fn test_first_page_never_hits() {
    let sem = semaphore(10);
    let cache = QuerierCache::new(Duration::from_secs(10), 1 << 20);
    let id = Uuid::new_v4();
    let at = position("k1", "c1");
    cache.insert(id, querier(&sem, table(), at.clone(), 16).await);

    let first_page = QuerierCacheContext::new(Some(&cache), Some(id), true);
    assert!(first_page.lookup(table(), Some(&at)).is_none());
    assert_eq!(cache.len(), 1);

    let next_page = QuerierCacheContext::new(Some(&cache), Some(id), false);
    assert!(next_page.lookup(table(), Some(&at)).is_some());
}

#[tokio::test]
async fn test_read_without_query_id_is_not_cached() {
    let sem = semaphore(10);
    let cache = QuerierCache::new(Duration::from_secs(10), 1 << 20);
    let context = QuerierCacheContext::new(Some(&cache), None, false);

    context.insert(querier(&sem, table(), position("k1", "c1"), 16).await);

    assert!(cache.is_empty());
    assert_eq!(sem.available().count, 10);
}
