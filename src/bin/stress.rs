//! cfshard Stress Binary
//!
//! Drives a write load against one shard and prints its counters.

use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use cfshard::keyspace::KeyspaceMetadata;
use cfshard::schema::TableId;
use cfshard::utils::deadline_after;
use cfshard::{Config, Database, Mutation, PartitionRange, QueryOptions, ReadCommand, Schema};
use tracing_subscriber::{fmt, EnvFilter};

/// cfshard write load driver
#[derive(Parser, Debug)]
#[command(name = "cfshard-stress")]
#[command(about = "Write load driver for a cfshard shard")]
#[command(version)]
struct Args {
    /// Data directory
    #[arg(short, long, default_value = "./cfshard_data")]
    data_dir: String,

    /// Shard memory in MB
    #[arg(short = 'm', long, default_value = "256")]
    memory_mb: usize,

    /// Number of writes
    #[arg(short = 'n', long, default_value = "100000")]
    writes: usize,

    /// Concurrent writers
    #[arg(short, long, default_value = "16")]
    concurrency: usize,

    /// Value size in bytes
    #[arg(short, long, default_value = "128")]
    value_size: usize,

    /// Disable the commitlog
    #[arg(long)]
    no_commitlog: bool,

    /// Per-write timeout in milliseconds
    #[arg(short, long, default_value = "2000")]
    timeout_ms: u64,
}

fn main() {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,cfshard=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();

    tracing::info!("cfshard stress v{}", cfshard::VERSION);
    tracing::info!("Data directory: {}", args.data_dir);

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!("Failed to start runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(args)) {
        tracing::error!("Stress run failed: {}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> cfshard::Result<()> {
    let config = Config::builder()
        .data_dir(&args.data_dir)
        .available_memory(args.memory_mb * 1024 * 1024)
        .enable_commitlog(!args.no_commitlog)
        .build();

    let db = Database::open(config).await?;
    db.create_keyspace(KeyspaceMetadata::local("stress"))?;
    // Same id on every run so the previous run's log records replay into it
    let schema = Schema::builder("stress", "standard")
        .id(TableId::from_name("stress", "standard"))
        .partition_key("key")
        .clustering_key("ck")
        .regular_column("value")
        .build()?;
    if !db.has_schema("stress", "standard") {
        db.add_table(schema.clone())?;
    }
    let replay = db.replay_commitlog().await?;
    if replay.entries_recovered > 0 {
        tracing::info!("Replayed {} log records", replay.entries_recovered);
    }

    // Step 1: Write load
    let started = Instant::now();
    let value = vec![b'x'; args.value_size];
    let per_writer = args.writes.div_ceil(args.concurrency.max(1));
    let timeout = Duration::from_millis(args.timeout_ms);

    let mut writers = Vec::with_capacity(args.concurrency);
    for writer in 0..args.concurrency.max(1) {
        let db = Arc::clone(&db);
        let schema = schema.clone();
        let value = value.clone();
        writers.push(tokio::spawn(async move {
            for i in 0..per_writer {
                let n = writer * per_writer + i;
                let mut m = Mutation::new(&schema, format!("key{:08}", n % 10_000).as_str());
                m.set(format!("ck{}", n).as_str(), "value", value.clone(), n as i64);
                // Failures are counted by the shard
                let _ = db.apply(&schema, m, deadline_after(timeout)).await;
            }
        }));
    }
    for writer in writers {
        let _ = writer.await;
    }
    let elapsed = started.elapsed();

    // Step 2: Read back one partition
    let cmd = ReadCommand::new(schema.id(), vec![PartitionRange::single("key00000000")]).with_row_limit(10);
    let page = db
        .query(&schema, &cmd, QueryOptions::default(), deadline_after(timeout))
        .await?;

    // Step 3: Report
    let stats = db.stats();
    let dirty = db.dirty_memory_manager().stats();
    println!("writes:            {}", stats.total_writes);
    println!("  failed:          {}", stats.total_writes_failed);
    println!("  timed out:       {}", stats.total_writes_timedout);
    println!("elapsed:           {:.2?}", elapsed);
    println!(
        "throughput:        {:.0} writes/s",
        stats.successful_writes() as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );
    println!("blocked writes:    {}", dirty.blocked_requests);
    println!("pressure flushes:  {}", dirty.pressure_flushes);
    println!("flush shares:      {:.1}", db.flush_controller().shares());
    println!("sample page rows:  {}", page.row_count());

    db.stop().await
}
