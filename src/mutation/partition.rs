//! Rows and partitions

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::cell::{Cell, Timestamp};
use super::ClusteringKey;

/// Deletion marker covering everything written at or below `timestamp`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tombstone {
    pub timestamp: Timestamp,
    pub deletion_time: i64,
}

impl Tombstone {
    pub fn new(timestamp: Timestamp, deletion_time: i64) -> Self {
        Self {
            timestamp,
            deletion_time,
        }
    }

    pub fn shadows(&self, timestamp: Timestamp) -> bool {
        timestamp <= self.timestamp
    }

    /// The stronger of two optional tombstones
    pub fn merge(left: Option<Tombstone>, right: Option<Tombstone>) -> Option<Tombstone> {
        match (left, right) {
            (Some(l), Some(r)) => {
                if (r.timestamp, r.deletion_time) > (l.timestamp, l.deletion_time) {
                    Some(r)
                } else {
                    Some(l)
                }
            }
            (l, None) => l,
            (None, r) => r,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    tombstone: Option<Tombstone>,
    cells: BTreeMap<String, Cell>,
}

impl Row {
    pub fn cell(&self, column: &str) -> Option<&Cell> {
        self.cells.get(column)
    }

    pub fn cells(&self) -> impl Iterator<Item = (&String, &Cell)> {
        self.cells.iter()
    }

    pub(crate) fn cells_mut(&mut self) -> impl Iterator<Item = (&String, &mut Cell)> {
        self.cells.iter_mut()
    }

    pub fn tombstone(&self) -> Option<Tombstone> {
        self.tombstone
    }

    pub fn is_empty(&self) -> bool {
        self.tombstone.is_none() && self.cells.is_empty()
    }

    pub fn set_cell(&mut self, column: impl Into<String>, cell: Cell) {
        let column = column.into();
        let merged = match self.cells.remove(&column) {
            Some(existing) => existing.merge(cell),
            None => cell,
        };
        self.cells.insert(column, merged);
    }

    pub fn delete(&mut self, tombstone: Tombstone) {
        self.tombstone = Tombstone::merge(self.tombstone, Some(tombstone));
    }

    pub fn apply(&mut self, other: Row) {
        self.tombstone = Tombstone::merge(self.tombstone, other.tombstone);
        for (column, cell) in other.cells {
            self.set_cell(column, cell);
        }
    }

    /// Cells that are visible at `now` under this row's tombstone and `outer`
    pub fn live_cells(
        &self,
        outer: Option<Tombstone>,
        now: i64,
    ) -> impl Iterator<Item = (&String, &Cell)> {
        let tombstone = Tombstone::merge(self.tombstone, outer);
        self.cells.iter().filter(move |(_, cell)| {
            !tombstone.map_or(false, |t| t.shadows(cell.timestamp())) && cell.is_live_at(now)
        })
    }

    pub fn has_live_cells(&self, outer: Option<Tombstone>, now: i64) -> bool {
        self.live_cells(outer, now).next().is_some()
    }

    pub fn max_timestamp(&self) -> Timestamp {
        let cells = self.cells.values().map(|c| c.timestamp());
        cells
            .chain(self.tombstone.map(|t| t.timestamp))
            .max()
            .unwrap_or(Timestamp::MIN)
    }

    pub fn memory_usage(&self) -> usize {
        std::mem::size_of::<Row>()
            + self
                .cells
                .iter()
                .map(|(k, c)| k.len() + c.memory_usage())
                .sum::<usize>()
    }
}

/// All data of one partition key
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    tombstone: Option<Tombstone>,
    static_row: Row,
    rows: BTreeMap<ClusteringKey, Row>,
}

impl Partition {
    pub fn tombstone(&self) -> Option<Tombstone> {
        self.tombstone
    }

    pub fn static_row(&self) -> &Row {
        &self.static_row
    }

    pub(crate) fn static_row_mut(&mut self) -> &mut Row {
        &mut self.static_row
    }

    pub fn row(&self, key: &ClusteringKey) -> Option<&Row> {
        self.rows.get(key)
    }

    pub fn rows(&self) -> impl Iterator<Item = (&ClusteringKey, &Row)> {
        self.rows.iter()
    }

    pub(crate) fn rows_mut(&mut self) -> impl Iterator<Item = (&ClusteringKey, &mut Row)> {
        self.rows.iter_mut()
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn row_mut(&mut self, key: ClusteringKey) -> &mut Row {
        self.rows.entry(key).or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.tombstone.is_none() && self.static_row.is_empty() && self.rows.is_empty()
    }

    pub fn delete(&mut self, tombstone: Tombstone) {
        self.tombstone = Tombstone::merge(self.tombstone, Some(tombstone));
    }

    /// Merge `other` into this partition
    pub fn apply(&mut self, other: Partition) {
        self.tombstone = Tombstone::merge(self.tombstone, other.tombstone);
        self.static_row.apply(other.static_row);
        for (key, row) in other.rows {
            match self.rows.get_mut(&key) {
                Some(existing) => existing.apply(row),
                None => {
                    self.rows.insert(key, row);
                }
            }
        }
    }

    /// Rows with anything visible at `now`
    pub fn live_rows(&self, now: i64) -> impl Iterator<Item = (&ClusteringKey, &Row)> {
        let tombstone = self.tombstone;
        self.rows
            .iter()
            .filter(move |(_, row)| row.has_live_cells(tombstone, now))
    }

    /// Move the rows strictly after `key` into a new partition. The new
    /// partition shares this one's tombstone and static cells.
    pub(crate) fn split_rows_after(&mut self, key: &ClusteringKey) -> Partition {
        let tail = self.rows.split_off(key);
        let mut rest = Partition {
            tombstone: self.tombstone,
            static_row: self.static_row.clone(),
            rows: tail,
        };
        // split_off keeps `key` in the tail; it belongs to the returned head
        if let Some(row) = rest.rows.remove(key) {
            self.rows.insert(key.clone(), row);
        }
        rest
    }

    pub fn max_timestamp(&self) -> Timestamp {
        let rows = self.rows.values().map(|r| r.max_timestamp());
        rows.chain(std::iter::once(self.static_row.max_timestamp()))
            .chain(self.tombstone.map(|t| t.timestamp))
            .max()
            .unwrap_or(Timestamp::MIN)
    }

    pub fn memory_usage(&self) -> usize {
        std::mem::size_of::<Partition>()
            + self.static_row.memory_usage()
            + self
                .rows
                .iter()
                .map(|(k, r)| k.len() + r.memory_usage())
                .sum::<usize>()
    }
}
