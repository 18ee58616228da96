//! Counter shards
//!
//! A counter is the sum of per-node shards. Each node only ever advances its
//! own shard, bumping the shard clock so merges keep the newest value.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::cell::Cell;
use super::partition::{Partition, Row};
use super::Mutation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterShard {
    pub id: Uuid,
    pub value: i64,
    pub clock: i64,
}

/// Union of two shard sets; for a shared id the higher clock wins
pub fn merge_shards(left: Vec<CounterShard>, right: Vec<CounterShard>) -> Vec<CounterShard> {
    let mut merged = left;
    for shard in right {
        match merged.iter_mut().find(|s| s.id == shard.id) {
            Some(existing) => {
                if (shard.clock, shard.value) > (existing.clock, existing.value) {
                    *existing = shard;
                }
            }
            None => merged.push(shard),
        }
    }
    merged.sort_by_key(|s| s.id);
    merged
}

fn local_shard(cell: Option<&Cell>, local_id: Uuid) -> Option<CounterShard> {
    match cell? {
        Cell::Counter { shards, .. } => shards.iter().find(|s| s.id == local_id).copied(),
        _ => None,
    }
}

fn transform_row(row: &mut Row, existing: Option<&Row>, local_id: Uuid) {
    for (column, cell) in row.cells_mut() {
        if let Cell::CounterUpdate { timestamp, delta } = *cell {
            let current = local_shard(existing.and_then(|r| r.cell(column)), local_id);
            let (value, clock) = current.map_or((0, 0), |s| (s.value, s.clock));
            *cell = Cell::Counter {
                timestamp,
                shards: vec![CounterShard {
                    id: local_id,
                    value: value + delta,
                    clock: clock + 1,
                }],
            };
        }
    }
}

/// Replace every counter delta in `mutation` with this node's new absolute
/// shard, computed from the existing state read back under cell locks.
pub fn transform_counter_updates_to_shards(
    mutation: &mut Mutation,
    existing: Option<&Partition>,
    local_id: Uuid,
) {
    let partition = mutation.partition_mut();
    transform_row(
        partition.static_row_mut(),
        existing.map(|p| p.static_row()),
        local_id,
    );
    for (ck, row) in partition.rows_mut() {
        transform_row(row, existing.and_then(|p| p.row(ck)), local_id);
    }
}
