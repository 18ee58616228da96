//! Read path
//!
//! ```text
//!   query(cmd)
//!     ├─ querier cache hit? ──▶ resume the cached cursor and permit
//!     └─ miss ──▶ read permit (count + memory) ──▶ merge ranges ──▶ skip past `after`
//!                                                        │
//!   build page (row / partition limits, size bound) ◀────┘
//!     └─ data left? ──▶ park cursor + permit in the querier cache
//! ```

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::Ordering;

use tracing::trace;

use crate::admission::{Querier, QuerierCacheContext, ReaderPermit};
use crate::error::Result;
use crate::mutation::{ClusteringKey, Partition, PartitionKey};
use crate::query::{PagePosition, QueryOptions, QueryResult, ReadCommand, ReconcilableResult, ResultRow, ResultValue};
use crate::schema::Schema;
use crate::table::Table;
use crate::utils::Deadline;

use super::Database;

type Cursor = VecDeque<(PartitionKey, Partition)>;

impl Database {
    /// Read one page of `cmd`
    pub async fn query(
        &self,
        schema: &Schema,
        cmd: &ReadCommand,
        options: QueryOptions,
        deadline: Deadline,
    ) -> Result<QueryResult> {
        let result = self.do_query(schema, cmd, options, deadline).await;
        self.stats.record_read(&result);
        result
    }

    async fn do_query(
        &self,
        schema: &Schema,
        cmd: &ReadCommand,
        options: QueryOptions,
        deadline: Deadline,
    ) -> Result<QueryResult> {
        let table = self.find_table_by_id(cmd.table_id)?;
        let _op = table.hold()?;

        let cache = QuerierCacheContext::new(Some(&self.querier_cache), cmd.query_id, cmd.is_first_page);
        let (mut cursor, permit) = match cache.lookup(table.id(), cmd.after.as_ref()) {
            Some(querier) => {
                trace!(table = %table.name(), "Resuming cached querier");
                querier.into_parts()
            }
            None => {
                let permit = self.read_permit(schema, options.max_result_size, deadline).await?;
                (read_ranges(&table, cmd)?, permit)
            }
        };

        let result = build_page(&mut cursor, cmd, options);
        if result.is_short_read {
            self.stats.short_data_queries.fetch_add(1, Ordering::Relaxed);
        }
        if result.last_position.is_some() {
            cache.insert(Querier::new(table.id(), result.last_position.clone(), cursor, permit));
        }
        Ok(result)
    }

    /// Raw partitions of `cmd`, bounded by its limits and `max_result_size`
    pub async fn query_mutations(
        &self,
        schema: &Schema,
        cmd: &ReadCommand,
        max_result_size: usize,
        deadline: Deadline,
    ) -> Result<ReconcilableResult> {
        let result = self.do_query_mutations(schema, cmd, max_result_size, deadline).await;
        self.stats.record_read(&result);
        result
    }

    async fn do_query_mutations(
        &self,
        schema: &Schema,
        cmd: &ReadCommand,
        max_result_size: usize,
        deadline: Deadline,
    ) -> Result<ReconcilableResult> {
        let table = self.find_table_by_id(cmd.table_id)?;
        let _op = table.hold()?;
        let _permit = self.read_permit(schema, max_result_size, deadline).await?;

        let mut result = ReconcilableResult::default();
        let mut rows = 0;
        let mut size = 0;
        let mut cursor = read_ranges(&table, cmd)?;
        while let Some((key, partition)) = cursor.pop_front() {
            if result.partitions.len() >= cmd.partition_limit || rows >= cmd.row_limit {
                break;
            }
            if size >= max_result_size {
                result.is_short_read = true;
                break;
            }
            rows += partition.row_count();
            size += key.len() + partition.memory_usage();
            result.partitions.push((key, partition));
        }
        if result.is_short_read {
            self.stats.short_mutation_queries.fetch_add(1, Ordering::Relaxed);
        }
        Ok(result)
    }

    async fn read_permit(&self, schema: &Schema, memory: usize, deadline: Deadline) -> Result<ReaderPermit> {
        self.read_semaphore_for(schema).acquire(1, memory, deadline).await
    }
}

/// Every partition of `cmd`, in key order, starting after `cmd.after`
fn read_ranges(table: &Table, cmd: &ReadCommand) -> Result<Cursor> {
    let mut merged: BTreeMap<PartitionKey, Partition> = BTreeMap::new();
    for range in &cmd.ranges {
        for (key, partition) in table.scan(range)? {
            merged.entry(key).or_insert(partition);
        }
    }

    let mut cursor = Cursor::new();
    for (key, mut partition) in merged {
        if let Some(after) = &cmd.after {
            if key < after.key {
                continue;
            }
            if key == after.key {
                match &after.clustering {
                    // The previous page finished this partition
                    None => continue,
                    Some(ck) => partition = partition.split_rows_after(ck),
                }
                if partition.row_count() == 0 {
                    continue;
                }
            }
        }
        cursor.push_back((key, partition));
    }
    Ok(cursor)
}

/// Take one page of rows off the front of `cursor`
fn build_page(cursor: &mut Cursor, cmd: &ReadCommand, options: QueryOptions) -> QueryResult {
    let mut result = QueryResult::default();
    let mut size = 0;
    let mut last: Option<PagePosition> = None;

    'partitions: while let Some((key, mut partition)) = cursor.pop_front() {
        if result.partition_count >= cmd.partition_limit || result.rows.len() >= cmd.row_limit {
            cursor.push_front((key, partition));
            break;
        }

        let live: Vec<ClusteringKey> = partition.live_rows(cmd.now).map(|(ck, _)| ck.clone()).collect();
        if live.is_empty() {
            // A partition with only static cells renders as one row
            if partition.static_row().has_live_cells(partition.tombstone(), cmd.now) {
                let row = ResultRow::render(
                    &key,
                    &ClusteringKey::empty(),
                    &Default::default(),
                    partition.static_row(),
                    partition.tombstone(),
                    cmd,
                );
                size += rendered_size(&row);
                result.rows.push(row);
                result.partition_count += 1;
                last = Some(PagePosition { key, clustering: None });
                if size >= options.max_result_size {
                    result.is_short_read = true;
                    break;
                }
            }
            continue;
        }

        result.partition_count += 1;
        for (i, ck) in live.iter().enumerate() {
            let Some(row) = partition.row(ck) else { continue };
            let rendered = ResultRow::render(&key, ck, row, partition.static_row(), partition.tombstone(), cmd);
            size += rendered_size(&rendered);
            result.rows.push(rendered);

            let limit_hit = result.rows.len() >= cmd.row_limit;
            let size_hit = size >= options.max_result_size;
            if !limit_hit && !size_hit {
                continue;
            }
            result.is_short_read = size_hit && !limit_hit;
            if i + 1 < live.len() {
                let tail = partition.split_rows_after(ck);
                cursor.push_front((key.clone(), tail));
                last = Some(PagePosition {
                    key,
                    clustering: Some(ck.clone()),
                });
            } else {
                last = Some(PagePosition { key, clustering: None });
            }
            break 'partitions;
        }
        last = Some(PagePosition { key, clustering: None });
    }

    if cursor.is_empty() {
        result.is_short_read = false;
    } else {
        result.last_position = last;
    }
    result
}

fn rendered_size(row: &ResultRow) -> usize {
    let cells: usize = row
        .cells
        .iter()
        .map(|(column, value)| {
            column.len()
                + match value {
                    ResultValue::Bytes(b) => b.len(),
                    ResultValue::Counter(_) => 8,
                }
        })
        .sum();
    row.key.len() + row.clustering.len() + cells
}
