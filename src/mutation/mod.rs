//! Mutation Module
//!
//! The unit of write: all changes to one partition of one table.
//!
//! ```text
//! Mutation
//!  ├── table_id
//!  ├── key: PartitionKey
//!  └── Partition
//!       ├── tombstone?
//!       ├── static_row: Row { tombstone?, column → Cell }
//!       └── rows: ClusteringKey → Row
//! ```
//!
//! Mutations are serialized with bincode into durability log records.

mod cell;
mod counter;
mod partition;

pub use cell::{compare_atomic_cell_for_merge, AtomicCell, Cell, Timestamp};
pub use counter::{merge_shards, transform_counter_updates_to_shards, CounterShard};
pub use partition::{Partition, Row, Tombstone};

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Result, ShardError};
use crate::schema::{Schema, TableId};

// =============================================================================
// Keys
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionKey(pub Bytes);

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClusteringKey(pub Bytes);

macro_rules! key_conversions {
    ($key:ident) => {
        impl $key {
            pub fn as_bytes(&self) -> &[u8] {
                &self.0
            }

            pub fn len(&self) -> usize {
                self.0.len()
            }

            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl From<&str> for $key {
            fn from(s: &str) -> Self {
                $key(Bytes::copy_from_slice(s.as_bytes()))
            }
        }

        impl From<&[u8]> for $key {
            fn from(b: &[u8]) -> Self {
                $key(Bytes::copy_from_slice(b))
            }
        }

        impl From<Vec<u8>> for $key {
            fn from(b: Vec<u8>) -> Self {
                $key(Bytes::from(b))
            }
        }

        impl From<Bytes> for $key {
            fn from(b: Bytes) -> Self {
                $key(b)
            }
        }

        impl fmt::Display for $key {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", String::from_utf8_lossy(&self.0))
            }
        }
    };
}

key_conversions!(PartitionKey);
key_conversions!(ClusteringKey);

impl ClusteringKey {
    /// Key of the single row in tables without clustering columns
    pub fn empty() -> Self {
        ClusteringKey(Bytes::new())
    }
}

// =============================================================================
// Mutation
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mutation {
    table_id: TableId,
    key: PartitionKey,
    partition: Partition,
}

impl Mutation {
    pub fn new(schema: &Schema, key: impl Into<PartitionKey>) -> Self {
        Self::for_table(schema.id(), key)
    }

    pub fn for_table(table_id: TableId, key: impl Into<PartitionKey>) -> Self {
        Self {
            table_id,
            key: key.into(),
            partition: Partition::default(),
        }
    }

    pub fn from_partition(table_id: TableId, key: PartitionKey, partition: Partition) -> Self {
        Self {
            table_id,
            key,
            partition,
        }
    }

    pub fn table_id(&self) -> TableId {
        self.table_id
    }

    pub fn key(&self) -> &PartitionKey {
        &self.key
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn partition_mut(&mut self) -> &mut Partition {
        &mut self.partition
    }

    pub fn into_parts(self) -> (PartitionKey, Partition) {
        (self.key, self.partition)
    }

    pub fn set_cell(&mut self, ck: impl Into<ClusteringKey>, column: impl Into<String>, cell: Cell) {
        self.partition.row_mut(ck.into()).set_cell(column, cell);
    }

    /// Write a live regular cell
    pub fn set(
        &mut self,
        ck: impl Into<ClusteringKey>,
        column: impl Into<String>,
        value: impl Into<Bytes>,
        timestamp: Timestamp,
    ) {
        self.set_cell(ck, column, Cell::Atomic(AtomicCell::live(timestamp, value)));
    }

    pub fn set_static(&mut self, column: impl Into<String>, value: impl Into<Bytes>, timestamp: Timestamp) {
        self.partition
            .static_row_mut()
            .set_cell(column, Cell::Atomic(AtomicCell::live(timestamp, value)));
    }

    pub fn delete_cell(
        &mut self,
        ck: impl Into<ClusteringKey>,
        column: impl Into<String>,
        timestamp: Timestamp,
        now: i64,
    ) {
        self.set_cell(ck, column, Cell::Atomic(AtomicCell::dead(timestamp, now)));
    }

    pub fn delete_row(&mut self, ck: impl Into<ClusteringKey>, timestamp: Timestamp, now: i64) {
        self.partition
            .row_mut(ck.into())
            .delete(Tombstone::new(timestamp, now));
    }

    pub fn delete_partition(&mut self, timestamp: Timestamp, now: i64) {
        self.partition.delete(Tombstone::new(timestamp, now));
    }

    /// Counter increment (or decrement for a negative `delta`)
    pub fn add_counter(
        &mut self,
        ck: impl Into<ClusteringKey>,
        column: impl Into<String>,
        delta: i64,
        timestamp: Timestamp,
    ) {
        self.set_cell(ck, column, Cell::CounterUpdate { timestamp, delta });
    }

    /// Merge another mutation of the same partition into this one
    pub fn apply(&mut self, other: Mutation) -> Result<()> {
        if other.table_id != self.table_id || other.key != self.key {
            return Err(ShardError::InvalidArgument(format!(
                "cannot merge mutation of {}/{} into {}/{}",
                other.table_id, other.key, self.table_id, self.key
            )));
        }
        self.partition.apply(other.partition);
        Ok(())
    }

    pub fn has_counter_updates(&self) -> bool {
        let is_update = |(_, c): (&String, &Cell)| matches!(c, Cell::CounterUpdate { .. });
        self.partition.static_row().cells().any(is_update)
            || self
                .partition
                .rows()
                .any(|(_, row)| row.cells().any(is_update))
    }

    pub fn memory_usage(&self) -> usize {
        std::mem::size_of::<Mutation>() + self.key.len() + self.partition.memory_usage()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}
