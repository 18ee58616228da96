//! Counter updates
//!
//! A counter delta cannot be merged blindly: this node's shard must be read,
//! advanced and written back. The cells are locked across that
//! read-transform-apply sequence so two updates of one cell never read the
//! same starting value.

use tracing::{debug, warn};

use crate::error::Result;
use crate::mutation::{transform_counter_updates_to_shards, ClusteringKey, Mutation};
use crate::schema::Schema;
use crate::table::CellKey;
use crate::utils::Deadline;

use super::{Database, DbStats};

impl Database {
    /// Resolve the counter deltas in `mutation` against current state and
    /// apply the result. Returns the mutation as applied, with absolute
    /// shard values in place of deltas.
    pub async fn apply_counter_update(&self, schema: &Schema, mutation: Mutation, deadline: Deadline) -> Result<Mutation> {
        let result = self.do_apply_counter_update(schema, mutation, deadline).await;
        self.stats.record_write(&result);
        result
    }

    async fn do_apply_counter_update(
        &self,
        schema: &Schema,
        mut mutation: Mutation,
        deadline: Deadline,
    ) -> Result<Mutation> {
        let table = self.find_table_by_id(mutation.table_id())?;
        let _op = match table.hold() {
            Ok(guard) => guard,
            Err(_) => {
                warn!(table = %table.name(), "Dropping counter update for a table being dropped");
                DbStats::bump(&self.stats.counter_updates_dropped);
                return Ok(mutation);
            }
        };
        self.check_schema_synced(schema)?;

        // Step 1: Lock every touched cell
        let _locks = table.lock_cells(counter_cells(&mutation), deadline).await?;

        // Step 2: Read back and turn deltas into this node's shards
        let existing = table.read_partition(mutation.key())?;
        transform_counter_updates_to_shards(&mut mutation, existing.as_ref(), self.config.host_id);

        // Step 3: Apply like any other write, still under the cell locks
        if let Err(e) = self.apply_to_table(&table, &mutation, deadline).await {
            table.count_failed_counter_apply();
            debug!(table = %table.name(), error = %e, "Counter apply failed");
            return Err(e);
        }
        Ok(mutation)
    }
}

/// The cells a counter mutation writes; static cells use the empty
/// clustering key
fn counter_cells(mutation: &Mutation) -> Vec<CellKey> {
    let key = mutation.key();
    let partition = mutation.partition();
    let statics = partition
        .static_row()
        .cells()
        .map(|(column, _)| (key.clone(), ClusteringKey::empty(), column.clone()));
    let rows = partition.rows().flat_map(|(ck, row)| {
        row.cells()
            .map(move |(column, _)| (key.clone(), ck.clone(), column.clone()))
    });
    statics.chain(rows).collect()
}
