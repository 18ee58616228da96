//! Tests for the keyspace and table registry
//!
//! These tests verify:
//! - Keyspace creation, update and drop
//! - Lookup by id and by name always agree
//! - Both indices are removed together on drop
//! - View registration with the base table
//! - Schema sync and version tracking

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use cfshard::keyspace::KeyspaceMetadata;
use cfshard::schema::TableId;
use cfshard::utils::deadline_after;
use cfshard::{Config, Database, Mutation, PartitionKey, Schema, SchemaRef, ShardError};
use tempfile::TempDir;
use uuid::Uuid;

// =============================================================================
// Helper Functions
// =============================================================================

async fn setup_db() -> (TempDir, Arc<Database>) {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .data_dir(temp_dir.path())
        .available_memory(64 * 1024 * 1024)
        .enable_commitlog(false)
        .build();
    let db = Database::open(config).await.unwrap();
    (temp_dir, db)
}

fn users_schema(keyspace: &str, table: &str) -> SchemaRef {
    Schema::builder(keyspace, table)
        .partition_key("id")
        .clustering_key("ck")
        .regular_column("email")
        .regular_column("name")
        .build()
        .unwrap()
}

fn users_by_email(base: &Schema) -> SchemaRef {
    Schema::builder(base.ks_name(), format!("{}_by_email", base.cf_name()))
        .partition_key("email")
        .clustering_key("base_key")
        .regular_column("name")
        .view_of(base, "email")
        .build()
        .unwrap()
}

// =============================================================================
// Keyspace Tests
// =============================================================================

#[tokio::test]
async fn test_create_keyspace_is_idempotent() {
    let (_temp, db) = setup_db().await;

    db.create_keyspace(KeyspaceMetadata::local("ks1")).unwrap();
    db.create_keyspace(KeyspaceMetadata::local("ks1")).unwrap();

    assert!(db.has_keyspace("ks1"));
    assert_eq!(db.keyspace_names(), vec!["ks1".to_string()]);
}

#[tokio::test]
async fn test_empty_strategy_defaults_to_network_topology() {
    let (_temp, db) = setup_db().await;
    let mut options = BTreeMap::new();
    options.insert("dc1".to_string(), "3".to_string());

    db.create_keyspace(KeyspaceMetadata::new("ks1", "", options, true)).unwrap();

    let ks = db.find_keyspace("ks1").unwrap();
    assert_eq!(ks.metadata().strategy_name(), "NetworkTopologyStrategy");
    assert_eq!(ks.strategy().replication_factor(), 3);
}

#[tokio::test]
async fn test_update_keyspace_keeps_tables() {
    let (_temp, db) = setup_db().await;
    db.create_keyspace(KeyspaceMetadata::local("ks1")).unwrap();
    db.add_table(users_schema("ks1", "t1")).unwrap();

    let mut options = BTreeMap::new();
    options.insert("replication_factor".to_string(), "2".to_string());
    db.update_keyspace(KeyspaceMetadata::new("ks1", "SimpleStrategy", options, true))
        .unwrap();

    let ks = db.find_keyspace("ks1").unwrap();
    assert_eq!(ks.strategy().replication_factor(), 2);
    assert!(ks.metadata().table("t1").is_some());
}

#[tokio::test]
async fn test_unknown_keyspace_is_not_found() {
    let (_temp, db) = setup_db().await;

    let result = db.find_keyspace("missing");

    assert!(matches!(result, Err(ShardError::NoSuchKeyspace(_))));
}

#[tokio::test]
async fn test_non_system_keyspaces_exclude_system() {
    let (_temp, db) = setup_db().await;
    db.create_keyspace(KeyspaceMetadata::local("system_schema")).unwrap();
    db.create_keyspace(KeyspaceMetadata::local("app")).unwrap();

    assert_eq!(db.non_system_keyspaces(), vec!["app".to_string()]);
}

// =============================================================================
// Table Tests
// =============================================================================

#[tokio::test]
async fn test_find_table_by_id_and_name_agree() {
    let (_temp, db) = setup_db().await;
    db.create_keyspace(KeyspaceMetadata::local("ks1")).unwrap();
    let schema = users_schema("ks1", "t1");

    db.add_table(schema.clone()).unwrap();

    let by_id = db.find_table_by_id(schema.id()).unwrap();
    let by_name = db.find_table("ks1", "t1").unwrap();
    assert!(Arc::ptr_eq(&by_id, &by_name));
    assert_eq!(db.find_uuid("ks1", "t1").unwrap(), schema.id());
    assert!(db.has_schema("ks1", "t1"));
}

#[tokio::test]
async fn test_add_table_requires_keyspace() {
    let (_temp, db) = setup_db().await;

    let schema = users_schema("nope", "t1");
    let result = db.add_table(schema.clone());

    assert!(matches!(result, Err(ShardError::NoSuchKeyspace(_))));
    assert_eq!(db.table_count(), 0);
    assert!(!db.schema_registry().is_synced(schema.version()));
}

#[tokio::test]
async fn test_add_table_rejects_duplicate_name() {
    let (_temp, db) = setup_db().await;
    db.create_keyspace(KeyspaceMetadata::local("ks1")).unwrap();
    db.add_table(users_schema("ks1", "t1")).unwrap();

    let duplicate = Schema::builder("ks1", "t1")
        .id(TableId::new_random())
        .partition_key("id")
        .build()
        .unwrap();
    let result = db.add_table(duplicate.clone());

    assert!(matches!(result, Err(ShardError::AlreadyExists(_))));
    assert!(db.find_table_by_id(duplicate.id()).is_err());
    assert!(!db.schema_registry().is_synced(duplicate.version()));
}

#[tokio::test]
async fn test_drop_table_removes_both_indices() {
    let (_temp, db) = setup_db().await;
    db.create_keyspace(KeyspaceMetadata::local("ks1")).unwrap();
    let schema = users_schema("ks1", "t1");
    db.add_table(schema.clone()).unwrap();

    db.drop_table("ks1", "t1").await.unwrap();

    assert!(matches!(db.find_table_by_id(schema.id()), Err(ShardError::NoSuchTableId(_))));
    assert!(matches!(db.find_table("ks1", "t1"), Err(ShardError::NoSuchTable { .. })));
    assert!(db.find_keyspace("ks1").unwrap().metadata().table("t1").is_none());
}

#[tokio::test]
async fn test_recreated_table_gets_new_id() {
    let (_temp, db) = setup_db().await;
    db.create_keyspace(KeyspaceMetadata::local("ks1")).unwrap();
    let old = users_schema("ks1", "t1");
    db.add_table(old.clone()).unwrap();
    let mut stale = Mutation::new(&old, "k1");
    stale.set("c1", "email", "old@example.com", 1);

    db.drop_table("ks1", "t1").await.unwrap();
    let new = users_schema("ks1", "t1");
    db.add_table(new.clone()).unwrap();

    assert_ne!(old.id(), new.id());
    assert_eq!(db.find_uuid("ks1", "t1").unwrap(), new.id());

    // A write aimed at the dropped incarnation must not land in the new one
    let result = db
        .apply(&old, stale, deadline_after(Duration::from_secs(600)))
        .await;
    assert!(matches!(result, Err(ShardError::NoSuchTableId(_))));
    let table = db.find_table_by_id(new.id()).unwrap();
    assert!(table.read_partition(&PartitionKey::from("k1")).unwrap().is_none());
}

#[tokio::test]
async fn test_lookups_agree_under_concurrent_add_and_drop() {
    let (_temp, db) = setup_db().await;
    db.create_keyspace(KeyspaceMetadata::local("ks1")).unwrap();

    let mut tasks = Vec::new();
    for i in 0..8 {
        let db = db.clone();
        tasks.push(tokio::spawn(async move {
            let name = format!("t{}", i);
            for _ in 0..5 {
                let schema = users_schema("ks1", &name);
                db.add_table(schema.clone()).unwrap();
                db.drop_table("ks1", &name).await.unwrap();
            }
        }));
    }

    let checker = {
        let db = db.clone();
        tokio::spawn(async move {
            for _ in 0..200 {
                for table in db.tables() {
                    let schema = table.schema();
                    if let Ok(id) = db.find_uuid(schema.ks_name(), schema.cf_name()) {
                        assert_eq!(id, schema.id());
                    }
                }
                tokio::task::yield_now().await;
            }
        })
    };

    for task in tasks {
        task.await.unwrap();
    }
    checker.await.unwrap();
    assert_eq!(db.table_count(), 0);
}

#[tokio::test]
async fn test_update_table_reports_column_changes() {
    let (_temp, db) = setup_db().await;
    db.create_keyspace(KeyspaceMetadata::local("ks1")).unwrap();
    let schema = users_schema("ks1", "t1");
    db.add_table(schema.clone()).unwrap();

    let same_columns = Schema::builder("ks1", "t1")
        .id(schema.id())
        .version(Uuid::new_v4())
        .partition_key("id")
        .clustering_key("ck")
        .regular_column("email")
        .regular_column("name")
        .build()
        .unwrap();
    assert!(!db.update_table(same_columns.clone()).unwrap());

    let more_columns = Schema::builder("ks1", "t1")
        .id(schema.id())
        .partition_key("id")
        .clustering_key("ck")
        .regular_column("email")
        .regular_column("name")
        .regular_column("age")
        .build()
        .unwrap();
    assert!(db.update_table(more_columns.clone()).unwrap());

    let current = db.find_schema("ks1", "t1").unwrap();
    assert_eq!(current.version(), more_columns.version());
    assert!(db.schema_registry().is_synced(more_columns.version()));
}

// =============================================================================
// View Tests
// =============================================================================

#[tokio::test]
async fn test_view_registers_with_base() {
    let (_temp, db) = setup_db().await;
    db.create_keyspace(KeyspaceMetadata::local("ks1")).unwrap();
    let base = users_schema("ks1", "users");
    let view = users_by_email(&base);

    let base_table = db.add_table(base.clone()).unwrap();
    db.add_table(view.clone()).unwrap();

    assert!(base_table.has_views());
    assert_eq!(db.views().len(), 1);
    assert_eq!(db.views()[0].id(), view.id());
}

#[tokio::test]
async fn test_drop_base_with_views_is_refused() {
    let (_temp, db) = setup_db().await;
    db.create_keyspace(KeyspaceMetadata::local("ks1")).unwrap();
    let base = users_schema("ks1", "users");
    db.add_table(base.clone()).unwrap();
    db.add_table(users_by_email(&base)).unwrap();

    let result = db.drop_table("ks1", "users").await;

    assert!(matches!(result, Err(ShardError::InvalidArgument(_))));
    assert!(db.has_schema("ks1", "users"));
}

#[tokio::test]
async fn test_drop_view_then_base() {
    let (_temp, db) = setup_db().await;
    db.create_keyspace(KeyspaceMetadata::local("ks1")).unwrap();
    let base = users_schema("ks1", "users");
    let base_table = db.add_table(base.clone()).unwrap();
    db.add_table(users_by_email(&base)).unwrap();

    db.drop_table("ks1", "users_by_email").await.unwrap();
    assert!(!base_table.has_views());

    db.drop_table("ks1", "users").await.unwrap();
    assert_eq!(db.table_count(), 0);
}

#[tokio::test]
async fn test_drop_keyspace_drops_views_first() {
    let (_temp, db) = setup_db().await;
    db.create_keyspace(KeyspaceMetadata::local("ks1")).unwrap();
    let base = users_schema("ks1", "users");
    db.add_table(base.clone()).unwrap();
    db.add_table(users_by_email(&base)).unwrap();
    db.add_table(users_schema("ks1", "other")).unwrap();

    db.drop_keyspace("ks1").await.unwrap();

    assert!(!db.has_keyspace("ks1"));
    assert_eq!(db.table_count(), 0);
}

// =============================================================================
// Schema Version Tests
// =============================================================================

#[tokio::test]
async fn test_schema_version_defaults_and_updates() {
    let (_temp, db) = setup_db().await;
    let empty = Uuid::new_v5(&Uuid::NAMESPACE_OID, b"");
    assert_eq!(db.version(), empty);

    let next = Uuid::new_v4();
    db.update_version(next);

    assert_eq!(db.version(), next);
}

#[tokio::test]
async fn test_non_system_tables() {
    let (_temp, db) = setup_db().await;
    db.create_keyspace(KeyspaceMetadata::local("system")).unwrap();
    db.create_keyspace(KeyspaceMetadata::local("app")).unwrap();
    db.add_table(users_schema("system", "local")).unwrap();
    db.add_table(users_schema("app", "t1")).unwrap();

    let tables = db.non_system_tables();

    assert_eq!(tables.len(), 1);
    assert_eq!(tables[0].name(), "app.t1");
}
