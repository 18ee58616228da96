//! Admission control for reads
//!
//! Three independent semaphores per shard (regular, streaming, system)
//! bound concurrent reads by count and memory. Paged queries park their
//! cursors in the querier cache between pages.

mod querier_cache;
mod semaphore;

pub use querier_cache::{
    Querier, QuerierCache, QuerierCacheContext, QuerierCacheSnapshot, QuerierCacheStats,
};
pub use semaphore::{
    InactiveRead, InactiveReadHandle, OverloadCallback, ReaderConcurrencySemaphore, ReaderPermit,
    ResourceUnits, SemaphoreSnapshot, SemaphoreStats,
};
