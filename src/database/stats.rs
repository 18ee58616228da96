//! Per-shard counters
//!
//! Plain relaxed atomics; they are for observability only.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Result, ShardError};

#[derive(Debug, Default)]
pub struct DbStats {
    pub total_writes: AtomicU64,
    pub total_writes_failed: AtomicU64,
    pub total_writes_timedout: AtomicU64,
    pub total_reads: AtomicU64,
    pub total_reads_failed: AtomicU64,
    pub short_data_queries: AtomicU64,
    pub short_mutation_queries: AtomicU64,
    pub sstable_read_queue_overloaded: AtomicU64,
    pub dropped_reordered_writes: AtomicU64,
    pub view_updates_dropped: AtomicU64,
    pub counter_updates_dropped: AtomicU64,
    pub streaming_writes: AtomicU64,
}

/// Point-in-time copy of [`DbStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DbStatsSnapshot {
    pub total_writes: u64,
    pub total_writes_failed: u64,
    pub total_writes_timedout: u64,
    pub total_reads: u64,
    pub total_reads_failed: u64,
    pub short_data_queries: u64,
    pub short_mutation_queries: u64,
    pub sstable_read_queue_overloaded: u64,
    pub dropped_reordered_writes: u64,
    pub view_updates_dropped: u64,
    pub counter_updates_dropped: u64,
    pub streaming_writes: u64,
}

impl DbStatsSnapshot {
    /// Writes that completed without error
    pub fn successful_writes(&self) -> u64 {
        self.total_writes - self.total_writes_failed
    }
}

impl DbStats {
    /// Count a finished write. A timeout counts as failed and timed out.
    pub fn record_write<T>(&self, result: &Result<T>) {
        self.total_writes.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = result {
            self.total_writes_failed.fetch_add(1, Ordering::Relaxed);
            if e.is_timeout() {
                self.total_writes_timedout.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn record_read<T>(&self, result: &Result<T>) {
        self.total_reads.fetch_add(1, Ordering::Relaxed);
        if result.is_err() {
            self.total_reads_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DbStatsSnapshot {
        DbStatsSnapshot {
            total_writes: self.total_writes.load(Ordering::Relaxed),
            total_writes_failed: self.total_writes_failed.load(Ordering::Relaxed),
            total_writes_timedout: self.total_writes_timedout.load(Ordering::Relaxed),
            total_reads: self.total_reads.load(Ordering::Relaxed),
            total_reads_failed: self.total_reads_failed.load(Ordering::Relaxed),
            short_data_queries: self.short_data_queries.load(Ordering::Relaxed),
            short_mutation_queries: self.short_mutation_queries.load(Ordering::Relaxed),
            sstable_read_queue_overloaded: self.sstable_read_queue_overloaded.load(Ordering::Relaxed),
            dropped_reordered_writes: self.dropped_reordered_writes.load(Ordering::Relaxed),
            view_updates_dropped: self.view_updates_dropped.load(Ordering::Relaxed),
            counter_updates_dropped: self.counter_updates_dropped.load(Ordering::Relaxed),
            streaming_writes: self.streaming_writes.load(Ordering::Relaxed),
        }
    }
}

/// Ok for a write that lost the race with a truncate; it is obsolete
pub(crate) fn is_reordered_with_truncate(error: &ShardError) -> bool {
    matches!(error, ShardError::ReorderedWithTruncate { .. })
}
