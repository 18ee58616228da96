//! Multishard streaming reader
//!
//! Streams the partitions of one table across every shard, in key order.
//! Each shard holds only the keys that hash to it; the reader keeps one
//! context per shard, indexed by shard id, and merges their outputs.
//!
//! ```text
//!   shard 0 ─ reader ─┐
//!   shard 1 ─ reader ─┼─▶ merge by partition key ─▶ next_mutation()
//!   shard 2 ─ reader ─┘
//! ```
//!
//! How a shard reader is admitted and torn down is a [`ReaderLifecyclePolicy`]:
//! streaming reads go through each shard's streaming semaphore and never
//! time out, local reads use the regular semaphore and a deadline.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::admission::ReaderPermit;
use crate::database::Database;
use crate::error::{Result, ShardError};
use crate::mutation::{Mutation, Partition, PartitionKey};
use crate::query::PartitionRange;
use crate::schema::TableId;
use crate::utils::{no_deadline, Deadline};

/// Memory a shard reader asks its semaphore for
pub const SHARD_READER_MEMORY: usize = 128 * 1024;

/// Shard owning `key` among `shard_count` shards
pub fn shard_of(key: &PartitionKey, shard_count: usize) -> usize {
    crc32fast::hash(key.as_bytes()) as usize % shard_count.max(1)
}

// =============================================================================
// Shard Set
// =============================================================================

/// The databases of every shard of this node, indexed by shard id
#[derive(Clone)]
pub struct ShardSet {
    shards: Vec<Arc<Database>>,
}

impl ShardSet {
    pub fn new(shards: Vec<Arc<Database>>) -> Result<Self> {
        if shards.is_empty() {
            return Err(ShardError::InvalidArgument("a shard set needs at least one shard".to_string()));
        }
        Ok(Self { shards })
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    pub fn shard_of(&self, key: &PartitionKey) -> usize {
        shard_of(key, self.shards.len())
    }

    pub fn shard(&self, id: usize) -> Option<&Arc<Database>> {
        self.shards.get(id)
    }

    /// The database that owns `key`
    pub fn database_for(&self, key: &PartitionKey) -> &Arc<Database> {
        &self.shards[self.shard_of(key)]
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &Arc<Database>)> {
        self.shards.iter().enumerate()
    }
}

// =============================================================================
// Shard Readers
// =============================================================================

/// The partitions one shard contributes, and the permit they are read under
pub struct ShardReader {
    shard: usize,
    partitions: VecDeque<(PartitionKey, Partition)>,
    _permit: ReaderPermit,
}

impl ShardReader {
    pub fn shard(&self) -> usize {
        self.shard
    }

    fn peek_key(&self) -> Option<&PartitionKey> {
        self.partitions.front().map(|(k, _)| k)
    }

    fn pop(&mut self) -> Option<(PartitionKey, Partition)> {
        self.partitions.pop_front()
    }
}

/// Creates and destroys the reader of each shard
#[async_trait]
pub trait ReaderLifecyclePolicy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn create_reader(
        &self,
        shard: usize,
        db: &Arc<Database>,
        table_id: TableId,
        range: &PartitionRange,
        shard_count: usize,
    ) -> Result<ShardReader>;

    /// Called once a shard reader is exhausted or the merge is dropped
    fn destroy_reader(&self, reader: ShardReader) {
        debug!(policy = self.name(), shard = reader.shard, "Destroyed shard reader");
    }
}

/// Streaming and repair: the streaming semaphore, no deadline
#[derive(Debug, Default, Clone, Copy)]
pub struct StreamingLifecyclePolicy;

#[async_trait]
impl ReaderLifecyclePolicy for StreamingLifecyclePolicy {
    fn name(&self) -> &'static str {
        "streaming"
    }

    async fn create_reader(
        &self,
        shard: usize,
        db: &Arc<Database>,
        table_id: TableId,
        range: &PartitionRange,
        shard_count: usize,
    ) -> Result<ShardReader> {
        let permit = db
            .streaming_read_semaphore()
            .acquire(1, SHARD_READER_MEMORY, no_deadline())
            .await?;
        open_shard_reader(shard, db, table_id, range, shard_count, permit)
    }
}

/// Reads serving a query: the table's regular semaphore, bounded by a deadline
#[derive(Debug, Clone, Copy)]
pub struct LocalLifecyclePolicy {
    deadline: Deadline,
}

impl LocalLifecyclePolicy {
    pub fn new(deadline: Deadline) -> Self {
        Self { deadline }
    }
}

#[async_trait]
impl ReaderLifecyclePolicy for LocalLifecyclePolicy {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn create_reader(
        &self,
        shard: usize,
        db: &Arc<Database>,
        table_id: TableId,
        range: &PartitionRange,
        shard_count: usize,
    ) -> Result<ShardReader> {
        let schema = db.find_schema_by_id(table_id)?;
        let permit = db
            .read_semaphore_for(&schema)
            .acquire(1, SHARD_READER_MEMORY, self.deadline)
            .await?;
        open_shard_reader(shard, db, table_id, range, shard_count, permit)
    }
}

fn open_shard_reader(
    shard: usize,
    db: &Database,
    table_id: TableId,
    range: &PartitionRange,
    shard_count: usize,
    permit: ReaderPermit,
) -> Result<ShardReader> {
    let table = db.find_table_by_id(table_id)?;
    let _op = table.hold()?;
    let partitions = table
        .scan(range)?
        .into_iter()
        .filter(|(key, _)| shard_of(key, shard_count) == shard)
        .collect();
    Ok(ShardReader {
        shard,
        partitions,
        _permit: permit,
    })
}

// =============================================================================
// Merging Reader
// =============================================================================

enum ShardContext {
    NotCreated,
    Active(ShardReader),
    Exhausted,
}

/// Merges per-shard readers in partition key order
pub struct MultishardStreamingReader {
    shards: ShardSet,
    table_id: TableId,
    range: PartitionRange,
    policy: Arc<dyn ReaderLifecyclePolicy>,
    /// Indexed by shard id
    contexts: Vec<ShardContext>,
}

/// Read `range` of `table_id` from every shard of `shards`
pub fn make_multishard_streaming_reader(
    shards: &ShardSet,
    table_id: TableId,
    range: PartitionRange,
    policy: Arc<dyn ReaderLifecyclePolicy>,
) -> MultishardStreamingReader {
    let contexts = (0..shards.len()).map(|_| ShardContext::NotCreated).collect();
    MultishardStreamingReader {
        shards: shards.clone(),
        table_id,
        range,
        policy,
        contexts,
    }
}

impl MultishardStreamingReader {
    /// The next partition in key order, or `None` when all shards are done
    pub async fn next_partition(&mut self) -> Result<Option<(PartitionKey, Partition)>> {
        self.create_pending_readers().await?;

        let next = self
            .contexts
            .iter()
            .enumerate()
            .filter_map(|(shard, ctx)| match ctx {
                ShardContext::Active(reader) => reader.peek_key().map(|key| (shard, key)),
                _ => None,
            })
            .min_by(|(_, a), (_, b)| a.cmp(b))
            .map(|(shard, _)| shard);
        let Some(shard) = next else {
            return Ok(None);
        };

        let ShardContext::Active(reader) = &mut self.contexts[shard] else {
            return Ok(None);
        };
        let item = reader.pop();
        if reader.peek_key().is_none() {
            self.retire(shard);
        }
        Ok(item)
    }

    /// The next partition as a mutation of the table
    pub async fn next_mutation(&mut self) -> Result<Option<Mutation>> {
        Ok(self
            .next_partition()
            .await?
            .map(|(key, partition)| Mutation::from_partition(self.table_id, key, partition)))
    }

    /// Shards whose reader is still open
    pub fn active_shards(&self) -> usize {
        self.contexts
            .iter()
            .filter(|ctx| matches!(ctx, ShardContext::Active(_)))
            .count()
    }

    async fn create_pending_readers(&mut self) -> Result<()> {
        for shard in 0..self.contexts.len() {
            if !matches!(self.contexts[shard], ShardContext::NotCreated) {
                continue;
            }
            let Some(db) = self.shards.shard(shard).cloned() else {
                self.contexts[shard] = ShardContext::Exhausted;
                continue;
            };
            let reader = self
                .policy
                .create_reader(shard, &db, self.table_id, &self.range, self.shards.len())
                .await?;
            self.contexts[shard] = ShardContext::Active(reader);
            if self.contexts_front_empty(shard) {
                self.retire(shard);
            }
        }
        Ok(())
    }

    fn contexts_front_empty(&self, shard: usize) -> bool {
        matches!(&self.contexts[shard], ShardContext::Active(reader) if reader.peek_key().is_none())
    }

    fn retire(&mut self, shard: usize) {
        if let ShardContext::Active(reader) = std::mem::replace(&mut self.contexts[shard], ShardContext::Exhausted) {
            self.policy.destroy_reader(reader);
        }
    }
}

impl Drop for MultishardStreamingReader {
    fn drop(&mut self) {
        for shard in 0..self.contexts.len() {
            self.retire(shard);
        }
    }
}
