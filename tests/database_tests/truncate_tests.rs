//! Tests for truncate
//!
//! These tests verify:
//! - Truncate removes memtable and sstable data
//! - Snapshots are taken before discarding
//! - The truncation position never falls below the low mark
//! - Writes logged before the mark are dropped, writes after it survive
//! - Views are truncated with their base

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cfshard::commitlog::{CommitLog, FlushHandler, ReplayPosition, RpHandle, RpSet};
use cfshard::keyspace::KeyspaceMetadata;
use cfshard::schema::TableId;
use cfshard::utils::{deadline_after, unix_millis, Deadline};
use cfshard::{Config, Database, Mutation, PartitionRange, QueryOptions, ReadCommand, Schema, SchemaRef};
use parking_lot::Mutex;
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn long_deadline() -> Deadline {
    deadline_after(Duration::from_secs(600))
}

fn table_schema() -> SchemaRef {
    Schema::builder("ks1", "t1")
        .partition_key("pk")
        .clustering_key("ck")
        .regular_column("v")
        .build()
        .unwrap()
}

async fn setup_db(auto_snapshot: bool) -> (TempDir, Arc<Database>, SchemaRef) {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .data_dir(temp_dir.path())
        .available_memory(64 * 1024 * 1024)
        .auto_snapshot(auto_snapshot)
        .build();
    let db = Database::open(config).await.unwrap();
    db.create_keyspace(KeyspaceMetadata::local("ks1")).unwrap();
    let schema = table_schema();
    db.add_table(schema.clone()).unwrap();
    (temp_dir, db, schema)
}

async fn write(db: &Database, schema: &Schema, key: &str, value: &str, ts: i64) {
    let mut m = Mutation::new(schema, key);
    m.set("c1", "v", value.to_string(), ts);
    db.apply(schema, m, long_deadline()).await.unwrap();
}

async fn row_count(db: &Database, schema: &Schema) -> usize {
    let cmd = ReadCommand::new(schema.id(), vec![PartitionRange::full()]);
    db.query(schema, &cmd, QueryOptions::default(), long_deadline())
        .await
        .unwrap()
        .row_count()
}

/// Hands out log positions from a script instead of writing anything
#[derive(Default)]
struct ScriptedLog {
    positions: Mutex<VecDeque<ReplayPosition>>,
}

impl ScriptedLog {
    fn push(&self, position: ReplayPosition) {
        self.positions.lock().push_back(position);
    }
}

#[async_trait]
impl CommitLog for ScriptedLog {
    async fn add_entry(&self, table_id: TableId, _data: &[u8], _deadline: Deadline) -> cfshard::Result<RpHandle> {
        let position = self.positions.lock().pop_front().unwrap_or_default();
        Ok(RpHandle::untracked(table_id, position))
    }

    fn discard_completed_segments(&self, _table_id: TableId, _flushed: Option<&RpSet>) {}

    fn register_flush_handler(&self, _table_id: TableId, _handler: FlushHandler) {}

    fn unregister_flush_handler(&self, _table_id: TableId) {}

    fn current_position(&self) -> ReplayPosition {
        ReplayPosition::zero()
    }

    fn segments_to_replay(&self) -> Vec<PathBuf> {
        Vec::new()
    }

    async fn shutdown(&self) -> cfshard::Result<()> {
        Ok(())
    }
}

// =============================================================================
// Basic Truncate Tests
// =============================================================================

#[tokio::test]
async fn test_truncate_removes_memtable_and_sstable_data() {
    let (_temp, db, schema) = setup_db(false).await;
    let table = db.find_table_by_id(schema.id()).unwrap();

    write(&db, &schema, "k1", "flushed", 1).await;
    table.flush().await.unwrap();
    write(&db, &schema, "k2", "in memory", 2).await;
    assert_eq!(table.storage().sstable_count(), 1);
    assert_eq!(row_count(&db, &schema).await, 2);

    db.truncate("ks1", "t1", unix_millis, true).await.unwrap();

    assert_eq!(row_count(&db, &schema).await, 0);
    assert_eq!(table.storage().sstable_count(), 0);
    assert!(table.memtables().is_empty());
}

#[tokio::test]
async fn test_truncate_persists_truncation_record() {
    let (_temp, db, schema) = setup_db(false).await;
    let table = db.find_table_by_id(schema.id()).unwrap();
    write(&db, &schema, "k1", "a", 1).await;

    let position = db.truncate("ks1", "t1", || 12345, false).await.unwrap();

    let record = table.truncation_record().unwrap().unwrap();
    assert_eq!(record.truncated_at, 12345);
    assert_eq!(record.position, position);
}

#[tokio::test]
async fn test_truncate_with_snapshot_links_sstables() {
    let (_temp, db, schema) = setup_db(true).await;
    let table = db.find_table_by_id(schema.id()).unwrap();
    write(&db, &schema, "k1", "a", 1).await;

    let mut truncated_at = 0;
    db.truncate(
        "ks1",
        "t1",
        || {
            truncated_at = unix_millis();
            truncated_at
        },
        true,
    )
    .await
    .unwrap();

    let snapshot = table
        .storage()
        .dir()
        .join("snapshots")
        .join(format!("{}-t1", truncated_at));
    assert!(snapshot.is_dir());
    assert_eq!(std::fs::read_dir(&snapshot).unwrap().count(), 1);
    assert_eq!(table.storage().sstable_count(), 0);
}

#[tokio::test]
async fn test_truncate_unknown_table_fails() {
    let (_temp, db, _schema) = setup_db(false).await;

    let result = db.truncate("ks1", "missing", unix_millis, false).await;

    assert!(result.unwrap_err().is_not_found());
}

// =============================================================================
// Ordering Tests
// =============================================================================

#[tokio::test]
async fn test_truncate_position_never_below_low_mark() {
    let (_temp, db, schema) = setup_db(false).await;
    let table = db.find_table_by_id(schema.id()).unwrap();

    let writer = {
        let db = db.clone();
        let schema = schema.clone();
        tokio::spawn(async move {
            for i in 0..200 {
                write(&db, &schema, &format!("k{}", i), "v", i).await;
            }
        })
    };
    tokio::time::sleep(Duration::from_millis(5)).await;

    let position = db.truncate("ks1", "t1", unix_millis, false).await.unwrap();
    writer.await.unwrap();

    assert!(position >= table.lowest_allowed_replay_position());
    assert_eq!(db.stats().total_writes_failed, 0);
}

#[tokio::test]
async fn test_write_logged_before_mark_is_dropped() {
    let temp_dir = TempDir::new().unwrap();
    let log = Arc::new(ScriptedLog::default());
    let config = Config::builder()
        .data_dir(temp_dir.path())
        .available_memory(64 * 1024 * 1024)
        .auto_snapshot(false)
        .build();
    let db = Database::builder(config)
        .commitlog(log.clone())
        .open()
        .await
        .unwrap();
    db.create_keyspace(KeyspaceMetadata::local("ks1")).unwrap();
    let schema = table_schema();
    db.add_table(schema.clone()).unwrap();

    // Step 1: A write at (1, 100) sets the mark
    log.push(ReplayPosition::new(1, 100));
    write(&db, &schema, "before", "x", 1).await;
    let position = db.truncate("ks1", "t1", unix_millis, false).await.unwrap();
    assert_eq!(position, ReplayPosition::new(1, 100));

    // Step 2: A write logged at (1, 50) reaches the memtable after truncate
    log.push(ReplayPosition::new(1, 50));
    write(&db, &schema, "reordered", "x", 2).await;

    // Step 3: A write logged after the mark survives
    log.push(ReplayPosition::new(1, 200));
    write(&db, &schema, "after", "x", 3).await;

    let stats = db.stats();
    assert_eq!(stats.dropped_reordered_writes, 1);
    assert_eq!(stats.total_writes_failed, 0);

    let cmd = ReadCommand::new(schema.id(), vec![PartitionRange::full()]);
    let result = db
        .query(&schema, &cmd, QueryOptions::default(), long_deadline())
        .await
        .unwrap();
    assert_eq!(result.row_count(), 1);
    assert_eq!(result.rows[0].key.as_bytes(), b"after");
}

// =============================================================================
// View Tests
// =============================================================================

#[tokio::test]
async fn test_truncate_truncates_views() {
    let (_temp, db, _schema) = setup_db(false).await;
    let base = Schema::builder("ks1", "users")
        .partition_key("id")
        .clustering_key("ck")
        .regular_column("email")
        .build()
        .unwrap();
    let view = Schema::builder("ks1", "users_by_email")
        .partition_key("email")
        .clustering_key("base_key")
        .view_of(&base, "email")
        .build()
        .unwrap();
    db.add_table(base.clone()).unwrap();
    let view_table = db.add_table(view.clone()).unwrap();

    let mut m = Mutation::new(&base, "u1");
    m.set("c1", "email", "a@x", 1);
    db.apply(&base, m, long_deadline()).await.unwrap();
    assert_eq!(row_count(&db, &view).await, 1);

    db.truncate("ks1", "users", unix_millis, false).await.unwrap();

    assert_eq!(row_count(&db, &base).await, 0);
    assert_eq!(row_count(&db, &view).await, 0);
    assert!(view_table.truncation_record().unwrap().is_some());
}
