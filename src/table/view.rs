//! Materialized view update generation
//!
//! A view is partitioned by one regular column of its base table. Each view
//! row is keyed by `(base column value)` and clustered by the base row's full
//! primary key, and carries the base row's visible cells.
//!
//! ```text
//!   base  pk=u1 ck=c1 {email=a@x, name=A}   ──▶  view pk=a@x ck=[u1|c1] {email=a@x, name=A}
//!   update email=b@x                         ──▶  view pk=a@x ck=[u1|c1] row tombstone
//!                                                 view pk=b@x ck=[u1|c1] {email=b@x, name=A}
//! ```

use std::collections::BTreeSet;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Result, ShardError};
use crate::mutation::{ClusteringKey, Mutation, Partition, PartitionKey, Row, Tombstone};
use crate::schema::Schema;

/// View clustering key: `[u32 base pk length][base pk][base ck]`
pub fn view_clustering_key(key: &PartitionKey, ck: &ClusteringKey) -> ClusteringKey {
    let mut buf = BytesMut::with_capacity(4 + key.len() + ck.len());
    buf.put_u32(key.len() as u32);
    buf.put_slice(key.as_bytes());
    buf.put_slice(ck.as_bytes());
    ClusteringKey(buf.freeze())
}

/// The updates `view` needs when `update` is applied on top of `existing`
///
/// `existing` is the base partition as it was before the update, read under
/// the base row lock.
pub fn generate_view_updates(
    view: &Schema,
    existing: Option<&Partition>,
    update: &Mutation,
    now: i64,
) -> Result<Vec<Mutation>> {
    let info = view.view_info().ok_or_else(|| {
        ShardError::InvalidArgument(format!("{} is not a view", view.qualified_name()))
    })?;

    let empty = Partition::default();
    let before = existing.unwrap_or(&empty);
    let mut after = before.clone();
    after.apply(update.partition().clone());

    // Rows touched by the update; a partition deletion touches all of them
    let mut touched: BTreeSet<ClusteringKey> = update.partition().rows().map(|(ck, _)| ck.clone()).collect();
    if update.partition().tombstone().is_some() || !update.partition().static_row().is_empty() {
        touched.extend(before.rows().map(|(ck, _)| ck.clone()));
    }

    let deletion_ts = update.partition().max_timestamp();
    let mut updates = Vec::new();

    for ck in touched {
        let old_key = view_key(before, &ck, &info.key_column, now);
        let new_key = view_key(&after, &ck, &info.key_column, now);
        let view_ck = view_clustering_key(update.key(), &ck);

        if let Some(old) = old_key.as_ref() {
            if new_key.as_ref() != Some(old) {
                let mut tombstone = Mutation::for_table(view.id(), old.clone());
                tombstone
                    .partition_mut()
                    .row_mut(view_ck.clone())
                    .delete(Tombstone::new(deletion_ts, now));
                updates.push(tombstone);
            }
        }

        if let Some(new) = new_key {
            let row = visible_row(&after, &ck, now);
            let mut upsert = Mutation::for_table(view.id(), new);
            let target = upsert.partition_mut().row_mut(view_ck);
            for (column, cell) in row.cells() {
                if view.column(column).is_some() {
                    target.set_cell(column.clone(), cell.clone());
                }
            }
            updates.push(upsert);
        }
    }

    Ok(updates)
}

/// The view partition key of a base row: the live value of `column`
fn view_key(partition: &Partition, ck: &ClusteringKey, column: &str, now: i64) -> Option<PartitionKey> {
    let row = partition.row(ck)?;
    let (_, cell) = row
        .live_cells(partition.tombstone(), now)
        .find(|(name, _)| name.as_str() == column)?;
    let value: Bytes = cell.as_atomic()?.value()?.clone();
    Some(PartitionKey(value))
}

/// Static and regular cells of a base row that are visible at `now`
fn visible_row(partition: &Partition, ck: &ClusteringKey, now: i64) -> Row {
    let mut row = Row::default();
    for (column, cell) in partition.static_row().live_cells(partition.tombstone(), now) {
        row.set_cell(column.clone(), cell.clone());
    }
    if let Some(base) = partition.row(ck) {
        for (column, cell) in base.live_cells(partition.tombstone(), now) {
            row.set_cell(column.clone(), cell.clone());
        }
    }
    row
}
