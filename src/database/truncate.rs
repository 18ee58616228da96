//! Truncate
//!
//! ```text
//!   1. low mark    = highest position applied so far; older writes now fail
//!   2. flush (snapshotting) or clear memtables
//!   3. truncated_at = timestamp source
//!   4. snapshot "<truncated_at>-<table>"          (when snapshotting)
//!   5. discard sstables created up to truncated_at
//!   6. position = max(discarded position, low mark)
//!   7. persist (truncated_at, position) for replay
//! ```
//!
//! Writes logged before the mark that have not reached the memtable yet are
//! rejected by the table and dropped by the write path. Writes logged after
//! it land in the fresh memtable and survive.

use std::sync::Arc;

use tracing::info;

use crate::commitlog::ReplayPosition;
use crate::error::Result;
use crate::storage::TruncationRecord;
use crate::table::Table;

use super::Database;

impl Database {
    /// Remove all data of `keyspace.name` and of its views
    ///
    /// `timestamp_source` is called once, after the memtables are flushed
    /// or cleared; every sstable created at or before that instant goes.
    /// Returns the table's truncation position.
    pub async fn truncate<F>(
        &self,
        keyspace: &str,
        name: &str,
        timestamp_source: F,
        with_snapshot: bool,
    ) -> Result<ReplayPosition>
    where
        F: FnOnce() -> i64,
    {
        let table = self.find_table(keyspace, name)?;
        let _op = table.hold()?;
        let snapshot = with_snapshot && self.config.auto_snapshot;

        let low_mark = table.set_low_replay_position_mark();
        self.drain_memtables(&table, snapshot).await?;
        let truncated_at = timestamp_source();
        let position = self.truncate_storage(&table, truncated_at, low_mark, snapshot)?;

        for view in table.views() {
            let Ok(view_table) = self.find_table_by_id(view.id()) else {
                continue;
            };
            let view_mark = view_table.set_low_replay_position_mark();
            self.drain_memtables(&view_table, snapshot).await?;
            self.truncate_storage(&view_table, truncated_at, view_mark, snapshot)?;
        }

        info!(
            keyspace,
            table = name,
            truncated_at,
            position = %position,
            snapshot,
            "Truncated table"
        );
        Ok(position)
    }

    async fn drain_memtables(&self, table: &Arc<Table>, snapshot: bool) -> Result<()> {
        if snapshot {
            table.flush().await
        } else {
            table.clear().await;
            Ok(())
        }
    }

    fn truncate_storage(
        &self,
        table: &Table,
        truncated_at: i64,
        low_mark: ReplayPosition,
        snapshot: bool,
    ) -> Result<ReplayPosition> {
        if snapshot {
            table.snapshot(&format!("{}-{}", truncated_at, table.schema().cf_name()))?;
        }
        let position = table.discard_sstables(truncated_at)?.max(low_mark);
        table.save_truncation_record(TruncationRecord {
            truncated_at,
            position,
        })?;
        self.querier_cache.evict_all_for_table(table.id());
        Ok(position)
    }
}
