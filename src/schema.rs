//! Schema Module
//!
//! Table identity and definitions, plus the registry that interns schema
//! versions and records which of them are authoritative ("synced").
//!
//! ```text
//! SchemaBuilder ──build──▶ Arc<Schema> ──learn──▶ SchemaRegistry
//!                                                  │
//!                              mark_synced(version)▼
//!                                       writes accepted for this version
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, ShardError};

/// Shared, immutable schema handle
pub type SchemaRef = Arc<Schema>;

/// Keyspaces whose names start with this prefix use the system pools
pub const SYSTEM_KEYSPACE_PREFIX: &str = "system";

/// Unique identifier of a table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableId(pub Uuid);

impl TableId {
    pub fn new_random() -> Self {
        TableId(Uuid::new_v4())
    }

    /// Deterministic id derived from the table's name
    pub fn from_name(keyspace: &str, table: &str) -> Self {
        let name = format!("{}.{}", keyspace, table);
        TableId(Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()))
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnKind {
    PartitionKey,
    ClusteringKey,
    Static,
    Regular,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ColumnDefinition {
    pub name: String,
    pub kind: ColumnKind,
    pub is_counter: bool,
}

/// Materialized view definition: which base table it derives from and which
/// base column becomes the view's partition key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ViewInfo {
    pub base_id: TableId,
    pub base_name: String,
    pub key_column: String,
}

/// Immutable table definition. A changed table gets a new `Schema` with a new version.
#[derive(Debug)]
pub struct Schema {
    id: TableId,
    version: Uuid,
    ks_name: String,
    cf_name: String,
    columns: Vec<ColumnDefinition>,
    view_info: Option<ViewInfo>,
}

impl Schema {
    pub fn builder(keyspace: impl Into<String>, table: impl Into<String>) -> SchemaBuilder {
        SchemaBuilder::new(keyspace, table)
    }

    pub fn id(&self) -> TableId {
        self.id
    }

    pub fn version(&self) -> Uuid {
        self.version
    }

    pub fn ks_name(&self) -> &str {
        &self.ks_name
    }

    pub fn cf_name(&self) -> &str {
        &self.cf_name
    }

    pub fn columns(&self) -> &[ColumnDefinition] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDefinition> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn regular_columns(&self) -> impl Iterator<Item = &ColumnDefinition> {
        self.columns
            .iter()
            .filter(|c| matches!(c.kind, ColumnKind::Regular | ColumnKind::Static))
    }

    /// A counter table holds only counter regular columns
    pub fn is_counter(&self) -> bool {
        let mut regular = self.regular_columns().peekable();
        regular.peek().is_some() && regular.all(|c| c.is_counter)
    }

    pub fn is_view(&self) -> bool {
        self.view_info.is_some()
    }

    pub fn view_info(&self) -> Option<&ViewInfo> {
        self.view_info.as_ref()
    }

    pub fn is_system(&self) -> bool {
        self.ks_name.starts_with(SYSTEM_KEYSPACE_PREFIX)
    }

    /// "keyspace.table", the identity used in log lines
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.ks_name, self.cf_name)
    }
}

/// Builder for Schema
pub struct SchemaBuilder {
    id: Option<TableId>,
    version: Option<Uuid>,
    ks_name: String,
    cf_name: String,
    columns: Vec<ColumnDefinition>,
    view_info: Option<ViewInfo>,
}

impl SchemaBuilder {
    pub fn new(keyspace: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            id: None,
            version: None,
            ks_name: keyspace.into(),
            cf_name: table.into(),
            columns: Vec::new(),
            view_info: None,
        }
    }

    /// Use an explicit id
    ///
    /// Without one every build gets a fresh random id, so a table that is
    /// dropped and created again under the same name never shares an id
    /// with its predecessor. Callers that must find the same table across
    /// restarts pin it with [`TableId::from_name`] or a stored id.
    pub fn id(mut self, id: TableId) -> Self {
        self.id = Some(id);
        self
    }

    /// Use an explicit version (defaults to a digest of the definition)
    pub fn version(mut self, version: Uuid) -> Self {
        self.version = Some(version);
        self
    }

    pub fn partition_key(self, name: impl Into<String>) -> Self {
        self.with_column(name, ColumnKind::PartitionKey, false)
    }

    pub fn clustering_key(self, name: impl Into<String>) -> Self {
        self.with_column(name, ColumnKind::ClusteringKey, false)
    }

    pub fn static_column(self, name: impl Into<String>) -> Self {
        self.with_column(name, ColumnKind::Static, false)
    }

    pub fn regular_column(self, name: impl Into<String>) -> Self {
        self.with_column(name, ColumnKind::Regular, false)
    }

    pub fn counter_column(self, name: impl Into<String>) -> Self {
        self.with_column(name, ColumnKind::Regular, true)
    }

    /// Make this a view of `base`, partitioned by the base column `key_column`
    pub fn view_of(mut self, base: &Schema, key_column: impl Into<String>) -> Self {
        self.view_info = Some(ViewInfo {
            base_id: base.id(),
            base_name: base.cf_name().to_string(),
            key_column: key_column.into(),
        });
        self
    }

    fn with_column(mut self, name: impl Into<String>, kind: ColumnKind, is_counter: bool) -> Self {
        self.columns.push(ColumnDefinition {
            name: name.into(),
            kind,
            is_counter,
        });
        self
    }

    pub fn build(self) -> Result<SchemaRef> {
        if self.ks_name.is_empty() || self.cf_name.is_empty() {
            return Err(ShardError::InvalidArgument(
                "keyspace and table names must not be empty".to_string(),
            ));
        }
        if !self
            .columns
            .iter()
            .any(|c| c.kind == ColumnKind::PartitionKey)
        {
            return Err(ShardError::InvalidArgument(format!(
                "{}.{} has no partition key column",
                self.ks_name, self.cf_name
            )));
        }
        if let Some(info) = &self.view_info {
            if self.columns.iter().any(|c| c.is_counter) {
                return Err(ShardError::InvalidArgument(format!(
                    "view {}.{} cannot contain counters",
                    self.ks_name, self.cf_name
                )));
            }
            if info.key_column.is_empty() {
                return Err(ShardError::InvalidArgument(
                    "view key column must not be empty".to_string(),
                ));
            }
        }

        let id = self.id.unwrap_or_else(TableId::new_random);
        let version = self.version.unwrap_or_else(|| {
            let digest = format!(
                "{}|{}|{}|{:?}|{:?}",
                id, self.ks_name, self.cf_name, self.columns, self.view_info
            );
            Uuid::new_v5(&Uuid::NAMESPACE_OID, digest.as_bytes())
        });

        Ok(Arc::new(Schema {
            id,
            version,
            ks_name: self.ks_name,
            cf_name: self.cf_name,
            columns: self.columns,
            view_info: self.view_info,
        }))
    }
}

// =============================================================================
// Schema Registry
// =============================================================================

struct RegistryEntry {
    schema: SchemaRef,
    synced: bool,
}

/// Interns schemas by version and tracks which versions are synced.
///
/// Passed explicitly to the database so that independent instances (tests,
/// several shards) never share hidden global state.
#[derive(Default)]
pub struct SchemaRegistry {
    entries: RwLock<HashMap<Uuid, RegistryEntry>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern `schema`. Returns the already-known instance for this version if any.
    pub fn learn(&self, schema: SchemaRef) -> SchemaRef {
        let mut entries = self.entries.write();
        entries
            .entry(schema.version())
            .or_insert(RegistryEntry {
                schema,
                synced: false,
            })
            .schema
            .clone()
    }

    pub fn mark_synced(&self, version: Uuid) {
        if let Some(entry) = self.entries.write().get_mut(&version) {
            entry.synced = true;
        }
    }

    pub fn is_synced(&self, version: Uuid) -> bool {
        self.entries
            .read()
            .get(&version)
            .map(|e| e.synced)
            .unwrap_or(false)
    }

    pub fn get(&self, version: Uuid) -> Option<SchemaRef> {
        self.entries.read().get(&version).map(|e| e.schema.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
