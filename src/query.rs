//! Read commands and results
//!
//! A read names a table, one or more partition ranges, optional column
//! selection and limits. Paged reads carry a query id so the paused cursor
//! can be found again in the querier cache.

use std::collections::BTreeMap;

use bytes::Bytes;
use uuid::Uuid;

use crate::mutation::{Cell, ClusteringKey, Partition, PartitionKey, Row, Tombstone};
use crate::schema::TableId;

/// Which partitions a read covers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionRange {
    /// Exactly one partition
    Single(PartitionKey),
    /// `[start, end)`; `None` bounds are open
    Range {
        start: Option<PartitionKey>,
        end: Option<PartitionKey>,
    },
}

impl PartitionRange {
    pub fn full() -> Self {
        PartitionRange::Range {
            start: None,
            end: None,
        }
    }

    pub fn single(key: impl Into<PartitionKey>) -> Self {
        PartitionRange::Single(key.into())
    }

    pub fn contains(&self, key: &PartitionKey) -> bool {
        match self {
            PartitionRange::Single(k) => k == key,
            PartitionRange::Range { start, end } => {
                start.as_ref().map_or(true, |s| key >= s) && end.as_ref().map_or(true, |e| key < e)
            }
        }
    }
}

/// Position of the last row handed out in a page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PagePosition {
    pub key: PartitionKey,
    pub clustering: Option<ClusteringKey>,
}

#[derive(Debug, Clone)]
pub struct ReadCommand {
    pub table_id: TableId,
    pub ranges: Vec<PartitionRange>,
    /// `None` selects all columns
    pub columns: Option<Vec<String>>,
    pub row_limit: usize,
    pub partition_limit: usize,
    /// Query time in seconds, for expiry
    pub now: i64,
    /// Identity of a paged query; `None` disables querier caching
    pub query_id: Option<Uuid>,
    pub is_first_page: bool,
    /// Where the previous page stopped
    pub after: Option<PagePosition>,
}

impl ReadCommand {
    pub fn new(table_id: TableId, ranges: Vec<PartitionRange>) -> Self {
        Self {
            table_id,
            ranges,
            columns: None,
            row_limit: usize::MAX,
            partition_limit: usize::MAX,
            now: crate::utils::unix_seconds(),
            query_id: None,
            is_first_page: true,
            after: None,
        }
    }

    pub fn with_row_limit(mut self, limit: usize) -> Self {
        self.row_limit = limit;
        self
    }

    pub fn with_partition_limit(mut self, limit: usize) -> Self {
        self.partition_limit = limit;
        self
    }

    pub fn with_columns(mut self, columns: Vec<String>) -> Self {
        self.columns = Some(columns);
        self
    }

    /// Mark this command as a page of query `query_id`
    pub fn paged(mut self, query_id: Uuid, after: Option<PagePosition>) -> Self {
        self.is_first_page = after.is_none();
        self.query_id = Some(query_id);
        self.after = after;
        self
    }

    pub fn selects(&self, column: &str) -> bool {
        self.columns
            .as_ref()
            .map_or(true, |cols| cols.iter().any(|c| c == column))
    }

    pub fn includes(&self, key: &PartitionKey) -> bool {
        self.ranges.iter().any(|r| r.contains(key))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct QueryOptions {
    /// Page memory bound; a page that reaches it ends early as a short read
    pub max_result_size: usize,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            max_result_size: 1024 * 1024,
        }
    }
}

/// A cell value as returned to readers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultValue {
    Bytes(Bytes),
    Counter(i64),
}

impl ResultValue {
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            ResultValue::Bytes(b) => Some(b),
            ResultValue::Counter(_) => None,
        }
    }

    pub fn as_counter(&self) -> Option<i64> {
        match self {
            ResultValue::Counter(v) => Some(*v),
            ResultValue::Bytes(_) => None,
        }
    }

    fn from_cell(cell: &Cell) -> Option<Self> {
        match cell {
            Cell::Atomic(atomic) => atomic.value().cloned().map(ResultValue::Bytes),
            Cell::Counter { .. } | Cell::CounterUpdate { .. } => {
                cell.counter_value().map(ResultValue::Counter)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultRow {
    pub key: PartitionKey,
    pub clustering: ClusteringKey,
    pub cells: BTreeMap<String, ResultValue>,
}

impl ResultRow {
    pub fn get(&self, column: &str) -> Option<&ResultValue> {
        self.cells.get(column)
    }

    /// Build the visible form of `row`, merging in the partition's static cells
    pub(crate) fn render(
        key: &PartitionKey,
        clustering: &ClusteringKey,
        row: &Row,
        static_row: &Row,
        partition_tombstone: Option<Tombstone>,
        cmd: &ReadCommand,
    ) -> Self {
        let mut cells = BTreeMap::new();
        let visible = static_row
            .live_cells(partition_tombstone, cmd.now)
            .chain(row.live_cells(partition_tombstone, cmd.now));
        for (column, cell) in visible {
            if !cmd.selects(column) {
                continue;
            }
            if let Some(value) = ResultValue::from_cell(cell) {
                cells.insert(column.clone(), value);
            }
        }
        Self {
            key: key.clone(),
            clustering: clustering.clone(),
            cells,
        }
    }
}

/// One page of a data query
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub rows: Vec<ResultRow>,
    pub partition_count: usize,
    /// The page ended early because of the size bound, not a limit
    pub is_short_read: bool,
    /// Set when more data remains; pass it back to fetch the next page
    pub last_position: Option<PagePosition>,
}

impl QueryResult {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

/// Raw partitions, suitable for reconciliation between replicas
#[derive(Debug, Clone, Default)]
pub struct ReconcilableResult {
    pub partitions: Vec<(PartitionKey, Partition)>,
    pub is_short_read: bool,
}

impl ReconcilableResult {
    pub fn row_count(&self) -> usize {
        self.partitions.iter().map(|(_, p)| p.row_count()).sum()
    }
}
