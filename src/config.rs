//! Configuration for a cfshard shard
//!
//! Centralized configuration with sensible defaults.

use std::path::PathBuf;
use std::time::Duration;

use uuid::Uuid;

/// Main configuration for one shard's database instance
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Root directory for all data files.
    /// Internal structure:
    ///   {data_dir}/
    ///     ├── commitlog/                 (durability log segments)
    ///     └── {keyspace}/{table}-{id}/   (sstables, snapshots, truncation record)
    pub data_dir: PathBuf,

    /// Memory available to this shard, in bytes. Pool sizes derive from it.
    pub available_memory: usize,

    // -------------------------------------------------------------------------
    // Dirty Memory Configuration
    // -------------------------------------------------------------------------
    /// Fraction of a pool's throttle threshold at which background flushing starts
    pub virtual_dirty_soft_limit: f64,

    /// Fixed memtable flush shares; 0 selects the feedback controller
    pub memtable_flush_static_shares: f32,

    /// Sampling period of the feedback flush controller
    pub flush_controller_interval: Duration,

    /// Maximum concurrent flushes per dirty memory pool
    pub max_background_flushes: usize,

    /// Maximum writes queued on a pool's memory gate before rejecting
    pub max_blocked_writes: usize,

    // -------------------------------------------------------------------------
    // Commitlog Configuration
    // -------------------------------------------------------------------------
    /// Whether writes go through the durability log
    pub enable_commitlog: bool,

    /// Sync strategy: how often to fsync the log
    pub commitlog_sync: CommitlogSyncStrategy,

    /// Segment rollover size in bytes
    pub commitlog_segment_size: u64,

    /// Total log space before flush handlers are invoked
    pub commitlog_total_space: u64,

    // -------------------------------------------------------------------------
    // Read Admission Configuration
    // -------------------------------------------------------------------------
    /// Concurrent regular reads
    pub max_concurrent_reads: usize,

    /// Concurrent streaming reads
    pub max_streaming_concurrent_reads: usize,

    /// Concurrent reads on system tables
    pub max_system_concurrent_reads: usize,

    /// Fraction of available memory granted to each read semaphore
    pub reader_memory_fraction: f64,

    /// Queue bound of the regular read semaphore
    pub max_inactive_queue_length: usize,

    /// How long a paused querier may stay cached
    pub querier_cache_ttl: Duration,

    /// Fraction of available memory granted to the querier cache
    pub querier_cache_memory_fraction: f64,

    // -------------------------------------------------------------------------
    // Write Path Configuration
    // -------------------------------------------------------------------------
    /// Upper bound on in-flight view update bytes
    pub max_pending_view_update_bytes: usize,

    /// Truncate takes a snapshot (and therefore flushes) before discarding
    pub auto_snapshot: bool,

    /// Identity of this node in counter shards
    pub host_id: Uuid,
}

/// Commitlog sync strategy
#[derive(Debug, Clone, Copy)]
pub enum CommitlogSyncStrategy {
    /// fsync after every record (safest, slowest)
    EveryWrite,

    /// fsync after N unsynced records (balanced durability/performance)
    EveryNEntries { count: usize },
}

/// Shard-level system pools get a fixed 10 MB regardless of shard memory.
pub const SYSTEM_DIRTY_MEMORY: usize = 10 << 20;

impl Default for Config {
    fn default() -> Self {
        let available_memory = 1 << 30; // 1 GB
        Self {
            data_dir: PathBuf::from("./cfshard_data"),
            available_memory,
            virtual_dirty_soft_limit: 0.6,
            memtable_flush_static_shares: 0.0,
            flush_controller_interval: Duration::from_millis(50),
            max_background_flushes: 4,
            max_blocked_writes: 4096,
            enable_commitlog: true,
            commitlog_sync: CommitlogSyncStrategy::EveryNEntries { count: 100 },
            commitlog_segment_size: 32 * 1024 * 1024,
            commitlog_total_space: 256 * 1024 * 1024,
            max_concurrent_reads: 100,
            max_streaming_concurrent_reads: 10,
            max_system_concurrent_reads: 10,
            reader_memory_fraction: 0.02,
            max_inactive_queue_length: 1000,
            querier_cache_ttl: Duration::from_secs(10),
            querier_cache_memory_fraction: 0.04,
            max_pending_view_update_bytes: available_memory / 10,
            auto_snapshot: true,
            host_id: Uuid::from_u128(0x6366_7368_6172_6400_0000_0000_0000_0001),
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Regular writes get 45% of shard memory
    pub fn regular_dirty_memory(&self) -> usize {
        (self.available_memory as f64 * 0.45) as usize
    }

    /// Streaming writes get 10% of shard memory
    pub fn streaming_dirty_memory(&self) -> usize {
        (self.available_memory as f64 * 0.10) as usize
    }

    pub fn reader_memory(&self) -> usize {
        (self.available_memory as f64 * self.reader_memory_fraction) as usize
    }

    pub fn querier_cache_memory(&self) -> usize {
        (self.available_memory as f64 * self.querier_cache_memory_fraction) as usize
    }

    /// Reject configurations the control loops cannot work with
    pub fn validate(&self) -> crate::Result<()> {
        if !(self.virtual_dirty_soft_limit > 0.0 && self.virtual_dirty_soft_limit < 1.0) {
            return Err(crate::ShardError::Config(format!(
                "virtual_dirty_soft_limit must be in (0, 1), got {}",
                self.virtual_dirty_soft_limit
            )));
        }
        if self.max_background_flushes == 0 {
            return Err(crate::ShardError::Config(
                "max_background_flushes must be at least 1".to_string(),
            ));
        }
        if self.commitlog_segment_size == 0 {
            return Err(crate::ShardError::Config(
                "commitlog_segment_size must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the data directory (root for all storage)
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_dir = path.into();
        self
    }

    /// Set the memory available to the shard (in bytes)
    pub fn available_memory(mut self, bytes: usize) -> Self {
        self.config.available_memory = bytes;
        self
    }

    /// Set the soft limit ratio at which flushing starts
    pub fn virtual_dirty_soft_limit(mut self, ratio: f64) -> Self {
        self.config.virtual_dirty_soft_limit = ratio;
        self
    }

    /// Use a fixed share count for memtable flushes
    pub fn memtable_flush_static_shares(mut self, shares: f32) -> Self {
        self.config.memtable_flush_static_shares = shares;
        self
    }

    pub fn flush_controller_interval(mut self, interval: Duration) -> Self {
        self.config.flush_controller_interval = interval;
        self
    }

    pub fn max_background_flushes(mut self, count: usize) -> Self {
        self.config.max_background_flushes = count;
        self
    }

    pub fn max_blocked_writes(mut self, count: usize) -> Self {
        self.config.max_blocked_writes = count;
        self
    }

    /// Enable or disable the commitlog
    pub fn enable_commitlog(mut self, enabled: bool) -> Self {
        self.config.enable_commitlog = enabled;
        self
    }

    /// Set the commitlog sync strategy
    pub fn commitlog_sync(mut self, strategy: CommitlogSyncStrategy) -> Self {
        self.config.commitlog_sync = strategy;
        self
    }

    pub fn commitlog_segment_size(mut self, bytes: u64) -> Self {
        self.config.commitlog_segment_size = bytes;
        self
    }

    pub fn commitlog_total_space(mut self, bytes: u64) -> Self {
        self.config.commitlog_total_space = bytes;
        self
    }

    pub fn max_concurrent_reads(mut self, count: usize) -> Self {
        self.config.max_concurrent_reads = count;
        self
    }

    pub fn max_streaming_concurrent_reads(mut self, count: usize) -> Self {
        self.config.max_streaming_concurrent_reads = count;
        self
    }

    pub fn max_system_concurrent_reads(mut self, count: usize) -> Self {
        self.config.max_system_concurrent_reads = count;
        self
    }

    pub fn reader_memory_fraction(mut self, fraction: f64) -> Self {
        self.config.reader_memory_fraction = fraction;
        self
    }

    pub fn max_inactive_queue_length(mut self, count: usize) -> Self {
        self.config.max_inactive_queue_length = count;
        self
    }

    pub fn querier_cache_ttl(mut self, ttl: Duration) -> Self {
        self.config.querier_cache_ttl = ttl;
        self
    }

    pub fn querier_cache_memory_fraction(mut self, fraction: f64) -> Self {
        self.config.querier_cache_memory_fraction = fraction;
        self
    }

    pub fn max_pending_view_update_bytes(mut self, bytes: usize) -> Self {
        self.config.max_pending_view_update_bytes = bytes;
        self
    }

    pub fn auto_snapshot(mut self, enabled: bool) -> Self {
        self.config.auto_snapshot = enabled;
        self
    }

    pub fn host_id(mut self, id: Uuid) -> Self {
        self.config.host_id = id;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
