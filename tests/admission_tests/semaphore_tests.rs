//! Tests for the reader concurrency semaphore
//!
//! These tests verify:
//! - Count and memory limits, with permits returned on drop
//! - Waiters are served in arrival order
//! - Timeouts and queue overload
//! - Streaming semaphores never time out
//! - Inactive reads are evicted when someone needs their resources

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cfshard::admission::{
    InactiveRead, OverloadCallback, ReaderConcurrencySemaphore, ReaderPermit, ResourceUnits,
};
use cfshard::utils::{deadline_after, no_deadline};
use cfshard::ShardError;

// =============================================================================
// Helper Functions
// =============================================================================

fn semaphore(count: usize, memory: usize) -> ReaderConcurrencySemaphore {
    ReaderConcurrencySemaphore::new("test_read", count, memory, Some(100), None)
}

/// A parked read that remembers whether it was evicted
struct ParkedRead {
    permit: Option<ReaderPermit>,
    evicted: Arc<AtomicBool>,
}

impl ParkedRead {
    fn boxed(permit: Option<ReaderPermit>) -> (Box<Self>, Arc<AtomicBool>) {
        let evicted = Arc::new(AtomicBool::new(false));
        let read = Box::new(Self {
            permit,
            evicted: evicted.clone(),
        });
        (read, evicted)
    }
}

impl InactiveRead for ParkedRead {
    fn units(&self) -> ResourceUnits {
        self.permit.as_ref().map(|p| p.units()).unwrap_or_default()
    }

    fn evict(self: Box<Self>) {
        self.evicted.store(true, Ordering::SeqCst);
    }
}

async fn wait_for_waiters(sem: &ReaderConcurrencySemaphore, waiters: usize) {
    for _ in 0..200 {
        if sem.stats().waiters == waiters {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("expected {} waiters", waiters);
}

// =============================================================================
// Limit Tests
// =============================================================================

#[tokio::test]
async fn test_permit_returns_resources_on_drop() {
    let sem = semaphore(10, 1000);

    let permit = sem.acquire(1, 400, no_deadline()).await.unwrap();
    assert_eq!(sem.available(), ResourceUnits::new(9, 600));

    drop(permit);
    assert_eq!(sem.available(), ResourceUnits::new(10, 1000));
    assert_eq!(sem.stats().admitted, 1);
}

#[tokio::test]
async fn test_count_limit_blocks_until_release() {
    let sem = semaphore(2, 1000);
    let first = sem.acquire(1, 10, no_deadline()).await.unwrap();
    let _second = sem.acquire(1, 10, no_deadline()).await.unwrap();

    let third = {
        let sem = sem.clone();
        tokio::spawn(async move { sem.acquire(1, 10, no_deadline()).await })
    };
    wait_for_waiters(&sem, 1).await;

    drop(first);
    let permit = third.await.unwrap().unwrap();
    assert_eq!(permit.units(), ResourceUnits::new(1, 10));
    assert_eq!(sem.stats().waiters, 0);
}

#[tokio::test]
async fn test_memory_limit_blocks_until_release() {
    let sem = semaphore(10, 1000);
    let big = sem.acquire(1, 800, no_deadline()).await.unwrap();

    let waiter = {
        let sem = sem.clone();
        tokio::spawn(async move { sem.acquire(1, 300, no_deadline()).await })
    };
    wait_for_waiters(&sem, 1).await;

    drop(big);
    waiter.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_oversized_request_is_clamped() {
    let sem = semaphore(4, 1000);

    let permit = sem.acquire(8, 5000, no_deadline()).await.unwrap();

    assert_eq!(permit.units(), ResourceUnits::new(4, 1000));
    assert_eq!(sem.available(), ResourceUnits::new(0, 0));
}

#[tokio::test]
async fn test_waiters_served_in_arrival_order() {
    let sem = semaphore(10, 1000);
    let held = sem.acquire(1, 900, no_deadline()).await.unwrap();

    let large = {
        let sem = sem.clone();
        tokio::spawn(async move { sem.acquire(1, 500, no_deadline()).await })
    };
    wait_for_waiters(&sem, 1).await;

    // Fits right now, but must not overtake the queued request
    let small = {
        let sem = sem.clone();
        tokio::spawn(async move { sem.acquire(1, 50, no_deadline()).await })
    };
    wait_for_waiters(&sem, 2).await;
    assert!(!small.is_finished());
    assert_eq!(sem.available(), ResourceUnits::new(9, 100));

    drop(held);
    let large = large.await.unwrap().unwrap();
    let small = small.await.unwrap().unwrap();
    assert_eq!(large.units().memory + small.units().memory, 550);
    assert_eq!(sem.available(), ResourceUnits::new(8, 450));
}

// =============================================================================
// Timeout and Overload Tests
// =============================================================================

#[tokio::test]
async fn test_waiter_times_out_at_deadline() {
    let sem = semaphore(1, 1000);
    let _held = sem.acquire(1, 10, no_deadline()).await.unwrap();

    let result = sem
        .acquire(1, 10, deadline_after(Duration::from_millis(20)))
        .await;

    assert!(matches!(result, Err(ShardError::Timeout("read admission"))));
    let stats = sem.stats();
    assert_eq!(stats.timeouts, 1);
    assert_eq!(stats.waiters, 0);
}

#[tokio::test]
async fn test_full_queue_is_overload() {
    let overloads = Arc::new(AtomicUsize::new(0));
    let callback: OverloadCallback = {
        let overloads = overloads.clone();
        Arc::new(move || {
            overloads.fetch_add(1, Ordering::SeqCst);
        })
    };
    let sem = ReaderConcurrencySemaphore::new("test_read", 1, 1000, Some(1), Some(callback));
    let held = sem.acquire(1, 10, no_deadline()).await.unwrap();

    let queued = {
        let sem = sem.clone();
        tokio::spawn(async move { sem.acquire(1, 10, no_deadline()).await })
    };
    wait_for_waiters(&sem, 1).await;

    let rejected = sem.acquire(1, 10, no_deadline()).await;

    assert!(matches!(rejected, Err(ShardError::Overloaded(_))));
    assert_eq!(overloads.load(Ordering::SeqCst), 1);
    assert_eq!(sem.stats().overloads, 1);

    drop(held);
    queued.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_streaming_semaphore_never_times_out() {
    let sem = ReaderConcurrencySemaphore::for_streaming("streaming", 1, 1000);
    let held = sem.acquire(1, 10, no_deadline()).await.unwrap();

    let waiter = {
        let sem = sem.clone();
        tokio::spawn(async move {
            sem.acquire(1, 10, deadline_after(Duration::from_millis(10)))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(!waiter.is_finished());

    drop(held);
    waiter.await.unwrap().unwrap();
    assert_eq!(sem.stats().timeouts, 0);
}

// =============================================================================
// Inactive Read Tests
// =============================================================================

#[tokio::test]
async fn test_inactive_read_evicted_for_waiter() {
    let sem = semaphore(1, 1000);
    let permit = sem.acquire(1, 100, no_deadline()).await.unwrap();
    let (read, evicted) = ParkedRead::boxed(Some(permit));
    let handle = sem.register_inactive_read(read);
    assert!(handle.is_registered());
    assert_eq!(sem.inactive_reads(), 1);

    let permit = sem
        .acquire(1, 100, deadline_after(Duration::from_secs(5)))
        .await
        .unwrap();

    assert!(evicted.load(Ordering::SeqCst));
    assert!(!handle.is_registered());
    assert_eq!(sem.stats().permit_based_evictions, 1);
    assert_eq!(permit.units(), ResourceUnits::new(1, 100));
}

#[tokio::test]
async fn test_unregister_returns_parked_read() {
    let sem = semaphore(2, 1000);
    let permit = sem.acquire(1, 100, no_deadline()).await.unwrap();
    let (read, evicted) = ParkedRead::boxed(Some(permit));
    let handle = sem.register_inactive_read(read);

    let read = sem.unregister_inactive_read(handle);

    assert!(read.is_some());
    assert!(!evicted.load(Ordering::SeqCst));
    assert_eq!(sem.inactive_reads(), 0);
    drop(read);
    assert_eq!(sem.available(), ResourceUnits::new(2, 1000));
}

#[tokio::test]
async fn test_register_with_waiters_evicts_immediately() {
    let sem = semaphore(1, 1000);
    let held = sem.acquire(1, 10, no_deadline()).await.unwrap();
    let waiter = {
        let sem = sem.clone();
        tokio::spawn(async move { sem.acquire(1, 10, no_deadline()).await })
    };
    wait_for_waiters(&sem, 1).await;

    let (read, evicted) = ParkedRead::boxed(None);
    let handle = sem.register_inactive_read(read);

    assert!(evicted.load(Ordering::SeqCst));
    assert!(!handle.is_registered());
    drop(held);
    waiter.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_stop_fails_waiters_and_refuses_new_reads() {
    let sem = semaphore(1, 1000);
    let held = sem.acquire(1, 10, no_deadline()).await.unwrap();
    let queued = {
        let sem = sem.clone();
        tokio::spawn(async move { sem.acquire(1, 10, no_deadline()).await })
    };
    wait_for_waiters(&sem, 1).await;

    sem.stop();

    assert!(matches!(queued.await.unwrap(), Err(ShardError::ShuttingDown)));
    assert!(matches!(
        sem.acquire(1, 10, no_deadline()).await,
        Err(ShardError::ShuttingDown)
    ));
    drop(held);
    assert_eq!(sem.available(), ResourceUnits::new(1, 1000));
}

#[tokio::test]
async fn test_stop_evicts_parked_reads() {
    let sem = semaphore(2, 1000);
    let permit = sem.acquire(1, 100, no_deadline()).await.unwrap();
    let (read, evicted) = ParkedRead::boxed(Some(permit));
    let handle = sem.register_inactive_read(read);

    sem.stop();

    assert!(evicted.load(Ordering::SeqCst));
    assert!(!handle.is_registered());
    assert_eq!(sem.available(), ResourceUnits::new(2, 1000));
}
