//! Tests for the multishard streaming reader
//!
//! These tests verify:
//! - Keys are owned by exactly one shard
//! - The merged stream is in key order and covers every shard
//! - Each shard reader only contributes keys it owns
//! - Permits are returned once the stream is done or dropped

use std::sync::Arc;
use std::time::Duration;

use cfshard::keyspace::KeyspaceMetadata;
use cfshard::multishard::{
    make_multishard_streaming_reader, shard_of, LocalLifecyclePolicy, ReaderLifecyclePolicy,
    ShardSet, StreamingLifecyclePolicy,
};
use cfshard::utils::deadline_after;
use cfshard::{Config, Database, Mutation, PartitionKey, PartitionRange, Schema, SchemaRef, ShardError};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn table_schema() -> SchemaRef {
    Schema::builder("ks1", "t1")
        .partition_key("pk")
        .clustering_key("ck")
        .regular_column("v")
        .build()
        .unwrap()
}

async fn open_shard(dir: &TempDir, schema: &SchemaRef) -> Arc<Database> {
    let config = Config::builder()
        .data_dir(dir.path())
        .available_memory(32 * 1024 * 1024)
        .enable_commitlog(false)
        .build();
    let db = Database::open(config).await.unwrap();
    db.create_keyspace(KeyspaceMetadata::local("ks1")).unwrap();
    db.add_table(schema.clone()).unwrap();
    db
}

async fn setup_shards(count: usize) -> (Vec<TempDir>, ShardSet, SchemaRef) {
    let schema = table_schema();
    let mut dirs = Vec::new();
    let mut dbs = Vec::new();
    for _ in 0..count {
        let dir = TempDir::new().unwrap();
        dbs.push(open_shard(&dir, &schema).await);
        dirs.push(dir);
    }
    (dirs, ShardSet::new(dbs).unwrap(), schema)
}

async fn write(db: &Database, schema: &Schema, key: &str) {
    let mut m = Mutation::new(schema, key);
    m.set("c1", "v", key.to_string(), 1);
    db.apply(schema, m, deadline_after(Duration::from_secs(60)))
        .await
        .unwrap();
}

/// Write `count` keys, each to the shard that owns it
async fn populate(shards: &ShardSet, schema: &Schema, count: usize) -> Vec<PartitionKey> {
    let mut keys = Vec::new();
    for i in 0..count {
        let key = format!("key{:04}", i);
        let pk = PartitionKey::from(key.as_str());
        write(shards.database_for(&pk), schema, &key).await;
        keys.push(pk);
    }
    keys
}

async fn read_all(
    shards: &ShardSet,
    schema: &Schema,
    range: PartitionRange,
    policy: Arc<dyn ReaderLifecyclePolicy>,
) -> Vec<PartitionKey> {
    let mut reader = make_multishard_streaming_reader(shards, schema.id(), range, policy);
    let mut keys = Vec::new();
    while let Some(m) = reader.next_mutation().await.unwrap() {
        assert_eq!(m.table_id(), schema.id());
        keys.push(m.key().clone());
    }
    assert_eq!(reader.active_shards(), 0);
    keys
}

// =============================================================================
// Shard Set Tests
// =============================================================================

#[test]
fn test_shard_of_is_stable_and_in_range() {
    for i in 0..100 {
        let key = PartitionKey::from(format!("key{}", i).as_str());
        let shard = shard_of(&key, 4);
        assert!(shard < 4);
        assert_eq!(shard, shard_of(&key, 4));
        assert_eq!(shard_of(&key, 1), 0);
    }
}

#[test]
fn test_empty_shard_set_rejected() {
    assert!(matches!(ShardSet::new(Vec::new()), Err(ShardError::InvalidArgument(_))));
}

#[tokio::test]
async fn test_shard_set_routes_keys() {
    let (_dirs, shards, _schema) = setup_shards(3).await;

    assert_eq!(shards.len(), 3);
    let key = PartitionKey::from("some-key");
    let owner = shards.shard_of(&key);
    assert!(Arc::ptr_eq(shards.database_for(&key), shards.shard(owner).unwrap()));
    assert!(shards.shard(3).is_none());
}

// =============================================================================
// Streaming Tests
// =============================================================================

#[tokio::test]
async fn test_streams_every_shard_in_key_order() {
    let (_dirs, shards, schema) = setup_shards(3).await;
    let written = populate(&shards, &schema, 40).await;

    let keys = read_all(
        &shards,
        &schema,
        PartitionRange::full(),
        Arc::new(StreamingLifecyclePolicy),
    )
    .await;

    assert_eq!(keys, written);
    // Every shard held part of the data
    for (id, db) in shards.iter() {
        let table = db.find_table("ks1", "t1").unwrap();
        let owned = table.scan(&PartitionRange::full()).unwrap();
        assert!(!owned.is_empty(), "shard {} is empty", id);
    }
}

#[tokio::test]
async fn test_local_policy_reads_range() {
    let (_dirs, shards, schema) = setup_shards(2).await;
    populate(&shards, &schema, 10).await;
    let policy = LocalLifecyclePolicy::new(deadline_after(Duration::from_secs(60)));

    let keys = read_all(
        &shards,
        &schema,
        PartitionRange::single("key0007"),
        Arc::new(policy),
    )
    .await;

    assert_eq!(keys, vec![PartitionKey::from("key0007")]);
}

#[tokio::test]
async fn test_shard_skips_keys_it_does_not_own() {
    let (_dirs, shards, schema) = setup_shards(2).await;
    let key = PartitionKey::from("misplaced");
    let owner = shards.shard_of(&key);
    let other = 1 - owner;

    // Written to the wrong shard: no reader reports it
    write(shards.shard(other).unwrap(), &schema, "misplaced").await;

    let keys = read_all(
        &shards,
        &schema,
        PartitionRange::full(),
        Arc::new(StreamingLifecyclePolicy),
    )
    .await;
    assert!(keys.is_empty());
}

#[tokio::test]
async fn test_empty_table_ends_immediately() {
    let (_dirs, shards, schema) = setup_shards(3).await;

    let keys = read_all(
        &shards,
        &schema,
        PartitionRange::full(),
        Arc::new(StreamingLifecyclePolicy),
    )
    .await;

    assert!(keys.is_empty());
}

#[tokio::test]
async fn test_permits_returned_after_drop() {
    let (_dirs, shards, schema) = setup_shards(2).await;
    populate(&shards, &schema, 10).await;
    let before: Vec<_> = shards
        .iter()
        .map(|(_, db)| db.streaming_read_semaphore().available())
        .collect();

    let mut reader = make_multishard_streaming_reader(
        &shards,
        schema.id(),
        PartitionRange::full(),
        Arc::new(StreamingLifecyclePolicy),
    );
    assert!(reader.next_partition().await.unwrap().is_some());
    assert!(reader.active_shards() > 0);
    drop(reader);

    let after: Vec<_> = shards
        .iter()
        .map(|(_, db)| db.streaming_read_semaphore().available())
        .collect();
    assert_eq!(before, after);
}

#[tokio::test]
async fn test_unknown_table_fails() {
    let (_dirs, shards, schema) = setup_shards(2).await;
    let other = cfshard::TableId::from_name("ks1", "missing");
    assert_ne!(other, schema.id());

    let mut reader = make_multishard_streaming_reader(
        &shards,
        other,
        PartitionRange::full(),
        Arc::new(StreamingLifecyclePolicy),
    );

    assert!(reader.next_partition().await.is_err());
}
