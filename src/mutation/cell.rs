//! Cells and the reconciliation rule between two versions of one cell.

use std::cmp::Ordering;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::counter::{merge_shards, CounterShard};

/// Write timestamp, microseconds by convention
pub type Timestamp = i64;

/// A regular (non-counter) cell
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AtomicCell {
    Live {
        timestamp: Timestamp,
        value: Bytes,
        /// Expiry in seconds since the epoch, for cells written with a TTL
        expiry: Option<i64>,
    },
    Dead {
        timestamp: Timestamp,
        /// Seconds since the epoch
        deletion_time: i64,
    },
}

impl AtomicCell {
    pub fn live(timestamp: Timestamp, value: impl Into<Bytes>) -> Self {
        AtomicCell::Live {
            timestamp,
            value: value.into(),
            expiry: None,
        }
    }

    pub fn live_with_expiry(timestamp: Timestamp, value: impl Into<Bytes>, expiry: i64) -> Self {
        AtomicCell::Live {
            timestamp,
            value: value.into(),
            expiry: Some(expiry),
        }
    }

    pub fn dead(timestamp: Timestamp, deletion_time: i64) -> Self {
        AtomicCell::Dead {
            timestamp,
            deletion_time,
        }
    }

    pub fn timestamp(&self) -> Timestamp {
        match self {
            AtomicCell::Live { timestamp, .. } | AtomicCell::Dead { timestamp, .. } => *timestamp,
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, AtomicCell::Live { .. })
    }

    /// Live and not expired at `now` (seconds)
    pub fn is_live_at(&self, now: i64) -> bool {
        match self {
            AtomicCell::Live { expiry, .. } => expiry.map_or(true, |e| e > now),
            AtomicCell::Dead { .. } => false,
        }
    }

    pub fn value(&self) -> Option<&Bytes> {
        match self {
            AtomicCell::Live { value, .. } => Some(value),
            AtomicCell::Dead { .. } => None,
        }
    }

    fn expiry(&self) -> Option<i64> {
        match self {
            AtomicCell::Live { expiry, .. } => *expiry,
            AtomicCell::Dead { .. } => None,
        }
    }
}

/// Order two versions of the same cell. `Greater` means `left` wins the merge.
///
/// Priority: higher timestamp; live over dead; larger value as unsigned bytes;
/// a cell with an expiry over one without; the later expiry. Between two dead
/// cells the later deletion time wins.
pub fn compare_atomic_cell_for_merge(left: &AtomicCell, right: &AtomicCell) -> Ordering {
    if left.timestamp() != right.timestamp() {
        return left.timestamp().cmp(&right.timestamp());
    }
    if left.is_live() != right.is_live() {
        return if left.is_live() {
            Ordering::Greater
        } else {
            Ordering::Less
        };
    }
    match (left, right) {
        (AtomicCell::Live { value: lv, .. }, AtomicCell::Live { value: rv, .. }) => {
            // &[u8] compares lexicographically as unsigned bytes
            let by_value = lv.as_ref().cmp(rv.as_ref());
            if by_value != Ordering::Equal {
                return by_value;
            }
            match (left.expiry(), right.expiry()) {
                (Some(_), None) => Ordering::Greater,
                (None, Some(_)) => Ordering::Less,
                (Some(l), Some(r)) => l.cmp(&r),
                (None, None) => Ordering::Equal,
            }
        }
        (
            AtomicCell::Dead {
                deletion_time: ld, ..
            },
            AtomicCell::Dead {
                deletion_time: rd, ..
            },
        ) => (*ld as u64).cmp(&(*rd as u64)),
        _ => Ordering::Equal,
    }
}

/// Any value stored under a column of a row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Cell {
    Atomic(AtomicCell),
    /// Unresolved counter increment as submitted by a client
    CounterUpdate { timestamp: Timestamp, delta: i64 },
    /// Resolved counter state, one shard per contributing node
    Counter {
        timestamp: Timestamp,
        shards: Vec<CounterShard>,
    },
}

impl Cell {
    pub fn timestamp(&self) -> Timestamp {
        match self {
            Cell::Atomic(c) => c.timestamp(),
            Cell::CounterUpdate { timestamp, .. } | Cell::Counter { timestamp, .. } => *timestamp,
        }
    }

    pub fn as_atomic(&self) -> Option<&AtomicCell> {
        match self {
            Cell::Atomic(c) => Some(c),
            _ => None,
        }
    }

    /// Sum of all shards of a resolved counter
    pub fn counter_value(&self) -> Option<i64> {
        match self {
            Cell::Counter { shards, .. } => Some(shards.iter().map(|s| s.value).sum()),
            Cell::CounterUpdate { delta, .. } => Some(*delta),
            Cell::Atomic(_) => None,
        }
    }

    pub fn is_live_at(&self, now: i64) -> bool {
        match self {
            Cell::Atomic(c) => c.is_live_at(now),
            _ => true,
        }
    }

    /// Reconcile two versions of the same cell into one
    pub fn merge(self, other: Cell) -> Cell {
        match (self, other) {
            (Cell::Atomic(left), Cell::Atomic(right)) => {
                if compare_atomic_cell_for_merge(&left, &right) == Ordering::Less {
                    Cell::Atomic(right)
                } else {
                    Cell::Atomic(left)
                }
            }
            (
                Cell::Counter {
                    timestamp: lt,
                    shards: ls,
                },
                Cell::Counter {
                    timestamp: rt,
                    shards: rs,
                },
            ) => Cell::Counter {
                timestamp: lt.max(rt),
                shards: merge_shards(ls, rs),
            },
            (
                Cell::CounterUpdate {
                    timestamp: lt,
                    delta: ld,
                },
                Cell::CounterUpdate {
                    timestamp: rt,
                    delta: rd,
                },
            ) => Cell::CounterUpdate {
                timestamp: lt.max(rt),
                delta: ld + rd,
            },
            // A counter deletion shadows counter state at or below its timestamp
            (Cell::Atomic(dead @ AtomicCell::Dead { .. }), counter)
            | (counter, Cell::Atomic(dead @ AtomicCell::Dead { .. })) => {
                if dead.timestamp() >= counter.timestamp() {
                    Cell::Atomic(dead)
                } else {
                    counter
                }
            }
            (left, right) => {
                if right.timestamp() > left.timestamp() {
                    right
                } else {
                    left
                }
            }
        }
    }

    pub fn memory_usage(&self) -> usize {
        std::mem::size_of::<Cell>()
            + match self {
                Cell::Atomic(AtomicCell::Live { value, .. }) => value.len(),
                Cell::Counter { shards, .. } => shards.len() * std::mem::size_of::<CounterShard>(),
                _ => 0,
            }
    }
}

impl From<AtomicCell> for Cell {
    fn from(cell: AtomicCell) -> Self {
        Cell::Atomic(cell)
    }
}
