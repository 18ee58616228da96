//! Database Module
//!
//! The per-shard registry of keyspaces and tables, and the entry point for
//! every write and read.
//!
//! ## Responsibilities
//! - Keep the keyspace and table registries consistent
//! - Own the dirty memory pools, the flush controller and the read semaphores
//! - Sequence writes: log, memory admission, memtable, views, counters
//! - Replay the commitlog of a previous run
//! - Drain everything on `stop()`
//!
//! ## Registry invariant
//! ```text
//!   tables.by_id:   TableId ──────────▶ Arc<Table>
//!   tables.by_name: (keyspace, name) ─▶ TableId
//! ```
//! Both maps live under one lock and change together.

mod apply;
mod counter;
mod read;
mod stats;
mod truncate;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::admission::{QuerierCache, ReaderConcurrencySemaphore};
use crate::backlog::{ControlCurve, FlushController, SchedulingGroup, StorageIoPriority};
use crate::commitlog::{CommitLog, CommitLogReplayer, FileCommitLog, ReplayPosition, ReplayResult, RpHandle};
use crate::config::{Config, SYSTEM_DIRTY_MEMORY};
use crate::dirty_memory::DirtyMemoryManager;
use crate::error::{Result, ShardError};
use crate::keyspace::{Keyspace, KeyspaceMetadata};
use crate::mutation::Mutation;
use crate::replication::{ReplicationStrategyProvider, StaticReplicationProvider};
use crate::schema::{Schema, SchemaRef, SchemaRegistry, TableId};
use crate::storage::{SstableWriter, StorageWriter};
use crate::table::{Table, TableContext};

pub use stats::{DbStats, DbStatsSnapshot};

/// Shares of the memtable flush class at the "explicit flush pending" level
const EXTRANEOUS_FLUSH_SHARES: f32 = 200.0;

#[derive(Default)]
struct Tables {
    by_id: HashMap<TableId, Arc<Table>>,
    by_name: HashMap<(String, String), TableId>,
}

/// Builder for [`Database`]; every external collaborator can be replaced
pub struct DatabaseBuilder {
    config: Config,
    commitlog: Option<Arc<dyn CommitLog>>,
    writer: Option<Arc<dyn StorageWriter>>,
    replication: Option<Arc<dyn ReplicationStrategyProvider>>,
    schema_registry: Option<Arc<SchemaRegistry>>,
}

impl DatabaseBuilder {
    /// Use `commitlog` instead of opening a file log under the data directory
    pub fn commitlog(mut self, commitlog: Arc<dyn CommitLog>) -> Self {
        self.commitlog = Some(commitlog);
        self
    }

    pub fn storage_writer(mut self, writer: Arc<dyn StorageWriter>) -> Self {
        self.writer = Some(writer);
        self
    }

    pub fn replication(mut self, provider: Arc<dyn ReplicationStrategyProvider>) -> Self {
        self.replication = Some(provider);
        self
    }

    pub fn schema_registry(mut self, registry: Arc<SchemaRegistry>) -> Self {
        self.schema_registry = Some(registry);
        self
    }

    /// Open the database. Must run inside a tokio runtime.
    pub async fn open(self) -> Result<Arc<Database>> {
        Database::open_with(self).await
    }
}

pub struct Database {
    config: Config,

    keyspaces: RwLock<HashMap<String, Arc<Keyspace>>>,
    tables: RwLock<Tables>,

    schema_registry: Arc<SchemaRegistry>,
    replication: Arc<dyn ReplicationStrategyProvider>,
    commitlog: Option<Arc<dyn CommitLog>>,
    writer: Arc<dyn StorageWriter>,

    dirty: Arc<DirtyMemoryManager>,
    system_dirty: Arc<DirtyMemoryManager>,
    streaming_dirty: Arc<DirtyMemoryManager>,

    flush_group: Arc<SchedulingGroup>,
    flush_controller: FlushController,

    read_semaphore: ReaderConcurrencySemaphore,
    streaming_read_semaphore: ReaderConcurrencySemaphore,
    system_read_semaphore: ReaderConcurrencySemaphore,
    querier_cache: QuerierCache,

    /// Bytes of view updates in flight
    view_update_semaphore: Arc<Semaphore>,
    view_update_budget: usize,

    version: RwLock<Uuid>,
    stats: Arc<DbStats>,
    self_ref: Weak<Database>,
}

impl Database {
    pub fn builder(config: Config) -> DatabaseBuilder {
        DatabaseBuilder {
            config,
            commitlog: None,
            writer: None,
            replication: None,
            schema_registry: None,
        }
    }

    /// Open with default collaborators
    pub async fn open(config: Config) -> Result<Arc<Self>> {
        Self::builder(config).open().await
    }

    /// On startup:
    /// 1. Validate config and create the data directory
    /// 2. Open the commitlog (unless one was injected or it is disabled)
    /// 3. Start the three dirty memory pools and the flush controller
    /// 4. Set up the read semaphores and the querier cache
    async fn open_with(builder: DatabaseBuilder) -> Result<Arc<Self>> {
        let DatabaseBuilder {
            config,
            commitlog,
            writer,
            replication,
            schema_registry,
        } = builder;

        // Step 1: Config and directory
        config.validate()?;
        std::fs::create_dir_all(&config.data_dir)?;

        // Step 2: Collaborators
        let commitlog: Option<Arc<dyn CommitLog>> = match commitlog {
            Some(log) => Some(log),
            None if config.enable_commitlog => Some(Arc::new(FileCommitLog::open(&config)?)),
            None => None,
        };
        let writer = writer.unwrap_or_else(|| Arc::new(SstableWriter::new()));
        let replication = replication.unwrap_or_else(|| Arc::new(StaticReplicationProvider));
        let schema_registry = schema_registry.unwrap_or_else(|| Arc::new(SchemaRegistry::new()));

        // Step 3: Dirty memory and flush control
        let soft_limit = config.virtual_dirty_soft_limit;
        let pool = |name, threshold| {
            DirtyMemoryManager::new(
                name,
                threshold,
                soft_limit,
                config.max_background_flushes,
                config.max_blocked_writes,
            )
        };
        let dirty = pool("regular", config.regular_dirty_memory());
        let system_dirty = pool("system", SYSTEM_DIRTY_MEMORY);
        let streaming_dirty = pool("streaming", config.streaming_dirty_memory());
        for manager in [&dirty, &system_dirty, &streaming_dirty] {
            manager.start();
        }

        let flush_group = SchedulingGroup::new("memtable_flush", 0.0);
        let io = StorageIoPriority::new(writer.clone());
        let flush_controller = if config.memtable_flush_static_shares > 0.0 {
            FlushController::fixed(config.memtable_flush_static_shares, flush_group.clone(), io)?
        } else {
            let curve = ControlCurve::memtable_flush(soft_limit as f32);
            let urgent = curve.backlog_of_shares(EXTRANEOUS_FLUSH_SHARES);
            let pressure = dirty.clone();
            FlushController::feedback(
                curve,
                config.flush_controller_interval,
                flush_group.clone(),
                io,
                move || {
                    let threshold = pressure.throttle_threshold().max(1) as f32;
                    let backlog = pressure.virtual_dirty_memory() as f32 / threshold;
                    if pressure.has_extraneous_flushes() {
                        backlog.max(urgent)
                    } else {
                        backlog
                    }
                },
            )
        };

        // Step 4: Reads
        let stats = Arc::new(DbStats::default());
        let overloads = stats.clone();
        let reader_memory = config.reader_memory();
        let read_semaphore = ReaderConcurrencySemaphore::new(
            "regular",
            config.max_concurrent_reads,
            reader_memory,
            Some(config.max_inactive_queue_length),
            Some(Arc::new(move || DbStats::bump(&overloads.sstable_read_queue_overloaded))),
        );
        let streaming_read_semaphore = ReaderConcurrencySemaphore::for_streaming(
            "streaming",
            config.max_streaming_concurrent_reads,
            reader_memory,
        );
        let system_read_semaphore = ReaderConcurrencySemaphore::new(
            "system",
            config.max_system_concurrent_reads,
            reader_memory,
            None,
            None,
        );
        let querier_cache = QuerierCache::new(config.querier_cache_ttl, config.querier_cache_memory());

        let view_update_budget = config.max_pending_view_update_bytes.clamp(1, u32::MAX as usize);

        info!(
            data_dir = %config.data_dir.display(),
            commitlog = commitlog.is_some(),
            regular_dirty = config.regular_dirty_memory(),
            "Opened database"
        );

        Ok(Arc::new_cyclic(|self_ref| Self {
            config,
            keyspaces: RwLock::new(HashMap::new()),
            tables: RwLock::new(Tables::default()),
            schema_registry,
            replication,
            commitlog,
            writer,
            dirty,
            system_dirty,
            streaming_dirty,
            flush_group,
            flush_controller,
            read_semaphore,
            streaming_read_semaphore,
            system_read_semaphore,
            querier_cache,
            view_update_semaphore: Arc::new(Semaphore::new(view_update_budget)),
            view_update_budget,
            version: RwLock::new(empty_version()),
            stats,
            self_ref: self_ref.clone(),
        }))
    }

    // =========================================================================
    // Keyspaces
    // =========================================================================

    /// Create a keyspace; creating an existing one is a no-op
    pub fn create_keyspace(&self, metadata: KeyspaceMetadata) -> Result<()> {
        let mut keyspaces = self.keyspaces.write();
        if keyspaces.contains_key(metadata.name()) {
            debug!(keyspace = metadata.name(), "Keyspace already exists");
            return Ok(());
        }
        let name = metadata.name().to_string();
        let keyspace = Keyspace::new(metadata, self.replication.as_ref())?;
        info!(
            keyspace = %name,
            strategy = keyspace.strategy().name(),
            "Created keyspace"
        );
        keyspaces.insert(name, Arc::new(keyspace));
        Ok(())
    }

    /// Swap in new keyspace parameters
    pub fn update_keyspace(&self, metadata: KeyspaceMetadata) -> Result<()> {
        let keyspace = self.find_keyspace(metadata.name())?;
        keyspace.update_from(metadata, self.replication.as_ref())?;
        info!(keyspace = keyspace.metadata().name(), "Updated keyspace");
        Ok(())
    }

    /// Drop a keyspace and every table in it, views first
    pub async fn drop_keyspace(&self, name: &str) -> Result<()> {
        let keyspace = self.find_keyspace(name)?;
        let mut schemas: Vec<SchemaRef> = keyspace.metadata().tables().cloned().collect();
        schemas.sort_by_key(|s| !s.is_view());
        for schema in schemas {
            self.drop_table(schema.ks_name(), schema.cf_name()).await?;
        }
        self.keyspaces.write().remove(name);
        info!(keyspace = name, "Dropped keyspace");
        Ok(())
    }

    pub fn find_keyspace(&self, name: &str) -> Result<Arc<Keyspace>> {
        self.keyspaces
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ShardError::NoSuchKeyspace(name.to_string()))
    }

    pub fn has_keyspace(&self, name: &str) -> bool {
        self.keyspaces.read().contains_key(name)
    }

    pub fn keyspace_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.keyspaces.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn non_system_keyspaces(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .keyspaces
            .read()
            .iter()
            .filter(|(_, ks)| !ks.metadata().is_system())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    // =========================================================================
    // Tables
    // =========================================================================

    /// Register a table (or view) for `schema`
    ///
    /// The schema is learned, and marked synced once the table is in the
    /// registry. Fails if the keyspace is unknown or the id or name is
    /// already taken.
    pub fn add_table(&self, schema: SchemaRef) -> Result<Arc<Table>> {
        let schema = self.schema_registry.learn(schema);

        let keyspace = self.find_keyspace(schema.ks_name())?;
        let base = match schema.view_info() {
            Some(info) => Some(self.find_table_by_id(info.base_id)?),
            None => None,
        };

        let name = (schema.ks_name().to_string(), schema.cf_name().to_string());
        let table = {
            let mut tables = self.tables.write();
            if tables.by_id.contains_key(&schema.id()) {
                return Err(ShardError::AlreadyExists(format!("table id {}", schema.id())));
            }
            if tables.by_name.contains_key(&name) {
                return Err(ShardError::AlreadyExists(format!("table {}.{}", name.0, name.1)));
            }
            let table = Table::open(schema.clone(), &self.table_context(&schema, &keyspace))?;
            tables.by_id.insert(schema.id(), table.clone());
            tables.by_name.insert(name, schema.id());
            // Under the write lock: whoever finds the table finds it synced
            self.schema_registry.mark_synced(schema.version());
            table
        };

        keyspace.add_table(schema.clone());
        if let Some(base) = base {
            base.add_or_update_view(schema.clone());
        }
        self.register_flush_handler(&table);

        info!(
            keyspace = schema.ks_name(),
            table = schema.cf_name(),
            id = %schema.id(),
            view = schema.is_view(),
            "Added table"
        );
        Ok(table)
    }

    /// Replace a table's schema. Returns whether its columns changed.
    pub fn update_table(&self, schema: SchemaRef) -> Result<bool> {
        let schema = self.schema_registry.learn(schema);
        let table = self.find_table_by_id(schema.id())?;
        self.schema_registry.mark_synced(schema.version());
        let old = table.schema();
        let columns_changed = old.columns() != schema.columns();
        table.set_schema(schema.clone());
        self.find_keyspace(schema.ks_name())?.add_table(schema.clone());
        if let Some(info) = schema.view_info() {
            self.find_table_by_id(info.base_id)?.add_or_update_view(schema.clone());
        }

        debug!(
            table = %schema.qualified_name(),
            version = %schema.version(),
            columns_changed,
            "Updated table"
        );
        Ok(columns_changed)
    }

    /// Remove a table once its in-flight operations have drained
    ///
    /// Both registry entries go first so nothing new can find the table.
    /// Its memtables are dropped, its sstables discarded (after a snapshot
    /// when auto-snapshot is on) and its log records forgotten.
    pub async fn drop_table(&self, keyspace: &str, name: &str) -> Result<()> {
        let table = self.find_table(keyspace, name)?;
        if table.has_views() {
            return Err(ShardError::InvalidArgument(format!(
                "cannot drop {}.{} while it has views",
                keyspace, name
            )));
        }

        // Step 1: Unregister
        {
            let mut tables = self.tables.write();
            tables.by_id.remove(&table.id());
            tables.by_name.remove(&(keyspace.to_string(), name.to_string()));
        }
        if let Ok(ks) = self.find_keyspace(keyspace) {
            ks.remove_table(name);
        }
        let schema = table.schema();
        if let Some(info) = schema.view_info() {
            if let Ok(base) = self.find_table_by_id(info.base_id) {
                base.remove_view(schema.id());
            }
        }

        // Step 2: Drain
        table.stop().await;
        self.querier_cache.evict_all_for_table(table.id());

        // Step 3: Release storage
        table.clear().await;
        if self.config.auto_snapshot {
            table.snapshot(&format!("{}-dropped-{}", crate::utils::unix_millis(), name))?;
        }
        table.discard_sstables(i64::MAX)?;
        if let Some(commitlog) = table.commitlog() {
            commitlog.unregister_flush_handler(table.id());
            commitlog.discard_completed_segments(table.id(), None);
        }

        info!(keyspace, table = name, id = %table.id(), "Dropped table");
        Ok(())
    }

    pub fn find_table_by_id(&self, id: TableId) -> Result<Arc<Table>> {
        self.tables
            .read()
            .by_id
            .get(&id)
            .cloned()
            .ok_or(ShardError::NoSuchTableId(id.0))
    }

    pub fn find_table(&self, keyspace: &str, name: &str) -> Result<Arc<Table>> {
        let id = self.find_uuid(keyspace, name)?;
        self.find_table_by_id(id)
    }

    pub fn find_uuid(&self, keyspace: &str, name: &str) -> Result<TableId> {
        self.tables
            .read()
            .by_name
            .get(&(keyspace.to_string(), name.to_string()))
            .copied()
            .ok_or_else(|| ShardError::NoSuchTable {
                keyspace: keyspace.to_string(),
                table: name.to_string(),
            })
    }

    pub fn find_schema(&self, keyspace: &str, name: &str) -> Result<SchemaRef> {
        Ok(self.find_table(keyspace, name)?.schema())
    }

    pub fn find_schema_by_id(&self, id: TableId) -> Result<SchemaRef> {
        Ok(self.find_table_by_id(id)?.schema())
    }

    pub fn has_schema(&self, keyspace: &str, name: &str) -> bool {
        self.find_uuid(keyspace, name).is_ok()
    }

    pub fn tables(&self) -> Vec<Arc<Table>> {
        self.tables.read().by_id.values().cloned().collect()
    }

    pub fn table_count(&self) -> usize {
        self.tables.read().by_id.len()
    }

    pub fn non_system_tables(&self) -> Vec<Arc<Table>> {
        self.tables()
            .into_iter()
            .filter(|t| !t.schema().is_system())
            .collect()
    }

    /// Schemas of every view
    pub fn views(&self) -> Vec<SchemaRef> {
        self.tables()
            .into_iter()
            .map(|t| t.schema())
            .filter(|s| s.is_view())
            .collect()
    }

    // =========================================================================
    // Schema Version
    // =========================================================================

    pub fn version(&self) -> Uuid {
        *self.version.read()
    }

    pub fn update_version(&self, version: Uuid) {
        *self.version.write() = version;
    }

    pub fn schema_registry(&self) -> &Arc<SchemaRegistry> {
        &self.schema_registry
    }

    // =========================================================================
    // Commitlog
    // =========================================================================

    /// Re-apply records left by the previous run, flush, and delete them
    ///
    /// Records at or below a table's truncation position, and records of
    /// unknown tables, are skipped. Re-applying already flushed records is
    /// harmless: merges are idempotent.
    pub async fn replay_commitlog(&self) -> Result<ReplayResult> {
        let Some(commitlog) = self.commitlog.clone() else {
            return Ok(ReplayResult::default());
        };
        let segments = commitlog.segments_to_replay();
        if segments.is_empty() {
            return Ok(ReplayResult::default());
        }

        let (entries, result) = tokio::task::spawn_blocking(move || CommitLogReplayer::recover(&segments))
            .await
            .map_err(|e| ShardError::Storage(format!("commitlog replay task failed: {}", e)))??;

        let mut floors: HashMap<TableId, ReplayPosition> = HashMap::new();
        let mut replayed: BTreeMap<TableId, Arc<Table>> = BTreeMap::new();
        let mut skipped = 0u64;

        for entry in entries {
            let Ok(table) = self.find_table_by_id(entry.table_id) else {
                skipped += 1;
                continue;
            };
            let floor = match floors.get(&entry.table_id) {
                Some(floor) => *floor,
                None => {
                    let floor = table
                        .truncation_record()?
                        .map(|r| r.position)
                        .unwrap_or_default();
                    floors.insert(entry.table_id, floor);
                    floor
                }
            };
            if entry.position <= floor {
                skipped += 1;
                continue;
            }
            let mutation = match Mutation::from_bytes(&entry.mutation) {
                Ok(m) => m,
                Err(e) => {
                    warn!(table = %table.name(), position = %entry.position, error = %e, "Skipping undecodable log record");
                    skipped += 1;
                    continue;
                }
            };
            table.apply(&mutation, RpHandle::untracked(table.id(), ReplayPosition::zero()))?;
            replayed.insert(table.id(), table);
        }

        for table in replayed.values() {
            table.flush().await?;
        }
        commitlog.release_replayed_segments()?;

        info!(
            entries = result.entries_recovered,
            skipped,
            tables = replayed.len(),
            segments = result.segments_replayed,
            "Replayed commitlog"
        );
        Ok(result)
    }

    fn register_flush_handler(&self, table: &Arc<Table>) {
        let Some(commitlog) = table.commitlog() else {
            return;
        };
        let db = self.self_ref.clone();
        commitlog.register_flush_handler(
            table.id(),
            Arc::new(move |id, position| {
                let Some(db) = db.upgrade() else { return };
                let Ok(table) = db.find_table_by_id(id) else { return };
                debug!(table = %table.name(), position = %position, "Flushing to free commitlog space");
                let flush = table.memtables().request_flush();
                let name = table.name();
                tokio::spawn(async move {
                    if let Err(e) = flush.await {
                        warn!(table = %name, error = %e, "Commitlog-requested flush failed");
                    }
                });
            }),
        );
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn stats(&self) -> DbStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn dirty_memory_manager(&self) -> &Arc<DirtyMemoryManager> {
        &self.dirty
    }

    pub fn system_dirty_memory_manager(&self) -> &Arc<DirtyMemoryManager> {
        &self.system_dirty
    }

    pub fn streaming_dirty_memory_manager(&self) -> &Arc<DirtyMemoryManager> {
        &self.streaming_dirty
    }

    pub fn flush_controller(&self) -> &FlushController {
        &self.flush_controller
    }

    pub fn flush_scheduling_group(&self) -> &Arc<SchedulingGroup> {
        &self.flush_group
    }

    pub fn read_semaphore(&self) -> &ReaderConcurrencySemaphore {
        &self.read_semaphore
    }

    pub fn streaming_read_semaphore(&self) -> &ReaderConcurrencySemaphore {
        &self.streaming_read_semaphore
    }

    pub fn system_read_semaphore(&self) -> &ReaderConcurrencySemaphore {
        &self.system_read_semaphore
    }

    pub fn querier_cache(&self) -> &QuerierCache {
        &self.querier_cache
    }

    pub fn commitlog(&self) -> Option<&Arc<dyn CommitLog>> {
        self.commitlog.as_ref()
    }

    pub fn storage_writer(&self) -> &Arc<dyn StorageWriter> {
        &self.writer
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Graceful drain
    ///
    /// 1. Stop taking reads; evict parked ones
    /// 2. Drain every table's in-flight operations
    /// 3. Shut down the commitlog
    /// 4. Wait for in-flight view updates
    /// 5. Stop the dirty memory pools after their flushes finish
    /// 6. Stop the flush controller
    pub async fn stop(&self) -> Result<()> {
        // Step 1: Reads
        self.querier_cache.evict_all();
        for semaphore in [
            &self.read_semaphore,
            &self.streaming_read_semaphore,
            &self.system_read_semaphore,
        ] {
            semaphore.stop();
        }

        // Step 2: Tables
        for table in self.tables() {
            table.stop().await;
        }

        // Step 3: Log
        if let Some(commitlog) = &self.commitlog {
            commitlog.shutdown().await?;
        }

        // Step 4: Views
        if let Ok(all) = self.view_update_semaphore.acquire_many(self.view_update_budget as u32).await {
            self.view_update_semaphore.close();
            drop(all);
        }

        // Step 5: Dirty memory
        self.system_dirty.shutdown().await;
        self.dirty.shutdown().await;
        self.streaming_dirty.shutdown().await;

        // Step 6: Controller
        self.flush_controller.shutdown().await;

        info!(data_dir = %self.config.data_dir.display(), "Database stopped");
        Ok(())
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn table_context(&self, schema: &Schema, keyspace: &Keyspace) -> TableContext {
        let commitlog = if keyspace.durable_writes() {
            self.commitlog.clone()
        } else {
            None
        };
        TableContext {
            data_dir: self.config.data_dir.clone(),
            commitlog,
            dirty: self.dirty_manager_for(schema).clone(),
            streaming_dirty: self.streaming_dirty.clone(),
            writer: self.writer.clone(),
        }
    }

    pub(crate) fn dirty_manager_for(&self, schema: &Schema) -> &Arc<DirtyMemoryManager> {
        if schema.is_system() {
            &self.system_dirty
        } else {
            &self.dirty
        }
    }

    pub(crate) fn read_semaphore_for(&self, schema: &Schema) -> &ReaderConcurrencySemaphore {
        if schema.is_system() {
            &self.system_read_semaphore
        } else {
            &self.read_semaphore
        }
    }

    /// Fails unless `schema` is the synced version
    pub(crate) fn check_schema_synced(&self, schema: &Schema) -> Result<()> {
        if self.schema_registry.is_synced(schema.version()) {
            return Ok(());
        }
        Err(ShardError::SchemaNotSynced {
            keyspace: schema.ks_name().to_string(),
            table: schema.cf_name().to_string(),
            version: schema.version(),
        })
    }

    pub(crate) fn db_stats(&self) -> &DbStats {
        &self.stats
    }

    pub(crate) fn view_update_semaphore(&self) -> (&Arc<Semaphore>, usize) {
        (&self.view_update_semaphore, self.view_update_budget)
    }
}

/// The version of a database with no schema
fn empty_version() -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, b"")
}
