//! Write path
//!
//! ```text
//!   apply(schema, mutation, deadline)
//!     │
//!     ├─ Step 1: resolve table ─────────────── NoSuchTableId
//!     ├─ Step 2: schema synced? ────────────── SchemaNotSynced
//!     ├─ Step 3: views? lock base row, build view updates
//!     ├─ Step 4: commitlog append ──────────── (skipped without a log)
//!     ├─ Step 5: dirty memory gate + memtable apply (one deadline)
//!     └─ Step 6: view updates applied, base lock released
//! ```
//!
//! A write that lost the race with a truncate comes back from the table as
//! `ReorderedWithTruncate`; it is dropped here and reported as success.

use std::sync::Arc;

use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::commitlog::{ReplayPosition, RpHandle};
use crate::error::{Result, ShardError};
use crate::mutation::Mutation;
use crate::schema::Schema;
use crate::table::{generate_view_updates, RowLockHolder, Table};
use crate::utils::{no_deadline, unix_seconds, with_deadline, Deadline};

use super::stats::is_reordered_with_truncate;
use super::{Database, DbStats};

/// Base row lock and view updates waiting for the base write
struct PendingViewUpdates {
    _lock: RowLockHolder,
    _units: Option<tokio::sync::OwnedSemaphorePermit>,
    updates: Vec<(Arc<Table>, Mutation)>,
}

impl Database {
    /// Apply `mutation` through the full write path
    pub async fn apply(&self, schema: &Schema, mutation: Mutation, deadline: Deadline) -> Result<()> {
        let result = self.do_apply(schema, mutation, deadline).await;
        self.stats.record_write(&result);
        result
    }

    async fn do_apply(&self, schema: &Schema, mutation: Mutation, deadline: Deadline) -> Result<()> {
        // Step 1: Resolve
        let table = self.find_table_by_id(mutation.table_id())?;
        let _op = table.hold()?;

        // Step 2: Schema
        self.check_schema_synced(schema)?;
        if mutation.has_counter_updates() {
            return Err(ShardError::InvalidArgument(format!(
                "counter updates to {} must go through apply_counter_update",
                schema.qualified_name()
            )));
        }

        // Step 3: Views
        let pending = if table.has_views() {
            Some(self.prepare_view_updates(&table, &mutation, deadline).await?)
        } else {
            None
        };

        // Steps 4 and 5
        self.apply_to_table(&table, &mutation, deadline).await?;

        // Step 6
        if let Some(pending) = pending {
            self.push_view_updates(&table, pending, deadline).await?;
        }
        Ok(())
    }

    /// Log `mutation` and apply it to `table` once memory allows
    pub(crate) async fn apply_to_table(&self, table: &Arc<Table>, mutation: &Mutation, deadline: Deadline) -> Result<()> {
        let rp = match table.commitlog() {
            Some(commitlog) => {
                let data = mutation.to_bytes()?;
                commitlog.add_entry(table.id(), &data, deadline).await?
            }
            None => RpHandle::untracked(table.id(), ReplayPosition::zero()),
        };

        let dirty = self.dirty_manager_for(&table.schema()).clone();
        let result = dirty
            .run_when_memory_available(deadline, move || table.apply(mutation, rp))
            .await;
        self.maybe_handle_reorder(result)
    }

    /// Writes that predate a truncate's low mark are obsolete
    fn maybe_handle_reorder(&self, result: Result<()>) -> Result<()> {
        match result {
            Err(e) if is_reordered_with_truncate(&e) => {
                debug!(error = %e, "Dropping write reordered with truncate");
                DbStats::bump(&self.stats.dropped_reordered_writes);
                Ok(())
            }
            other => other,
        }
    }

    // =========================================================================
    // Views
    // =========================================================================

    /// Lock the affected base rows and compute every view's updates from the
    /// base state as it is now
    async fn prepare_view_updates(
        &self,
        table: &Arc<Table>,
        mutation: &Mutation,
        deadline: Deadline,
    ) -> Result<PendingViewUpdates> {
        let partition = mutation.partition();
        let single_row = partition.tombstone().is_none()
            && partition.static_row().is_empty()
            && partition.row_count() == 1;
        let row = if single_row {
            partition.rows().next().map(|(ck, _)| ck.clone())
        } else {
            None
        };
        let lock = table.lock_row(mutation.key(), row.as_ref(), deadline).await?;

        let existing = table.read_partition(mutation.key())?;
        let now = unix_seconds();
        let mut updates = Vec::new();
        for view in table.views() {
            let view_table = match self.find_table_by_id(view.id()) {
                Ok(t) => t,
                Err(_) => {
                    warn!(
                        base = %table.name(),
                        view = %view.qualified_name(),
                        "Dropping view update for a removed view"
                    );
                    DbStats::bump(&self.stats.view_updates_dropped);
                    continue;
                }
            };
            for update in generate_view_updates(&view, existing.as_ref(), mutation, now)? {
                updates.push((view_table.clone(), update));
            }
        }

        let bytes: usize = updates.iter().map(|(_, m)| m.memory_usage()).sum();
        let units = if bytes == 0 {
            None
        } else {
            let (semaphore, budget) = self.view_update_semaphore();
            let wanted = bytes.clamp(1, budget) as u32;
            let permit = with_deadline(deadline, "view update units", async {
                semaphore
                    .clone()
                    .acquire_many_owned(wanted)
                    .await
                    .map_err(|_| ShardError::ShuttingDown)
            })
            .await?;
            Some(permit)
        };

        Ok(PendingViewUpdates {
            _lock: lock,
            _units: units,
            updates,
        })
    }

    async fn push_view_updates(&self, base: &Table, pending: PendingViewUpdates, deadline: Deadline) -> Result<()> {
        base.count_view_updates(pending.updates.len());
        for (view_table, update) in &pending.updates {
            let _op = match view_table.hold() {
                Ok(guard) => guard,
                Err(_) => {
                    warn!(view = %view_table.name(), "Dropping view update for a view being dropped");
                    DbStats::bump(&self.stats.view_updates_dropped);
                    continue;
                }
            };
            self.apply_to_table(view_table, update, deadline).await?;
        }
        trace!(base = %base.name(), updates = pending.updates.len(), "Applied view updates");
        Ok(())
    }

    // =========================================================================
    // Streaming
    // =========================================================================

    /// Apply a mutation received from another node while streaming
    ///
    /// Not logged; it goes to the table's streaming memtables through the
    /// streaming dirty memory pool.
    pub async fn apply_streaming_mutation(&self, schema: &Schema, plan_id: Uuid, mutation: Mutation) -> Result<()> {
        let table = self.find_table_by_id(mutation.table_id())?;
        let _op = table.hold()?;
        self.check_schema_synced(schema)?;

        let streaming = table.clone();
        self.streaming_dirty
            .run_when_memory_available(no_deadline(), move || {
                streaming.apply_streaming(&mutation);
                Ok(())
            })
            .await?;

        DbStats::bump(&self.stats.streaming_writes);
        trace!(table = %table.name(), plan = %plan_id, "Applied streamed mutation");
        Ok(())
    }
}
