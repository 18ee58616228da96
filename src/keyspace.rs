//! Keyspaces
//!
//! `KeyspaceMetadata` is an immutable snapshot. Schema changes build a new
//! snapshot and swap it in; readers holding the old `Arc` keep a consistent view.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::Result;
use crate::replication::{ReplicationStrategy, ReplicationStrategyProvider, NETWORK_TOPOLOGY_STRATEGY};
use crate::schema::{SchemaRef, SYSTEM_KEYSPACE_PREFIX};

/// A user-defined type: a named tuple of fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserType {
    pub name: String,
    pub field_names: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct KeyspaceMetadata {
    name: String,
    strategy_name: String,
    strategy_options: BTreeMap<String, String>,
    durable_writes: bool,
    user_types: BTreeMap<String, UserType>,
    tables: BTreeMap<String, SchemaRef>,
}

impl KeyspaceMetadata {
    /// An empty strategy name selects `NetworkTopologyStrategy`
    pub fn new(
        name: impl Into<String>,
        strategy_name: impl Into<String>,
        strategy_options: BTreeMap<String, String>,
        durable_writes: bool,
    ) -> Self {
        let strategy_name = strategy_name.into();
        Self {
            name: name.into(),
            strategy_name: if strategy_name.is_empty() {
                NETWORK_TOPOLOGY_STRATEGY.to_string()
            } else {
                strategy_name
            },
            strategy_options,
            durable_writes,
            user_types: BTreeMap::new(),
            tables: BTreeMap::new(),
        }
    }

    /// Single-replica keyspace, handy for tests and local tables
    pub fn local(name: impl Into<String>) -> Self {
        Self::new(name, crate::replication::LOCAL_STRATEGY, BTreeMap::new(), true)
    }

    pub fn with_user_type(mut self, user_type: UserType) -> Self {
        self.user_types.insert(user_type.name.clone(), user_type);
        self
    }

    pub fn with_durable_writes(mut self, durable_writes: bool) -> Self {
        self.durable_writes = durable_writes;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn strategy_name(&self) -> &str {
        &self.strategy_name
    }

    pub fn strategy_options(&self) -> &BTreeMap<String, String> {
        &self.strategy_options
    }

    pub fn durable_writes(&self) -> bool {
        self.durable_writes
    }

    pub fn user_types(&self) -> &BTreeMap<String, UserType> {
        &self.user_types
    }

    pub fn tables(&self) -> impl Iterator<Item = &SchemaRef> {
        self.tables.values()
    }

    pub fn table(&self, name: &str) -> Option<&SchemaRef> {
        self.tables.get(name)
    }

    pub fn is_system(&self) -> bool {
        self.name.starts_with(SYSTEM_KEYSPACE_PREFIX)
    }

    fn with_table(&self, schema: SchemaRef) -> Self {
        let mut next = self.clone();
        next.tables.insert(schema.cf_name().to_string(), schema);
        next
    }

    fn without_table(&self, name: &str) -> Self {
        let mut next = self.clone();
        next.tables.remove(name);
        next
    }
}

/// A live keyspace: the current metadata snapshot and its replication strategy
pub struct Keyspace {
    metadata: RwLock<Arc<KeyspaceMetadata>>,
    strategy: RwLock<Arc<dyn ReplicationStrategy>>,
}

impl Keyspace {
    pub fn new(metadata: KeyspaceMetadata, provider: &dyn ReplicationStrategyProvider) -> Result<Self> {
        let strategy = provider.create(metadata.strategy_name(), metadata.strategy_options())?;
        Ok(Self {
            metadata: RwLock::new(Arc::new(metadata)),
            strategy: RwLock::new(strategy),
        })
    }

    pub fn metadata(&self) -> Arc<KeyspaceMetadata> {
        self.metadata.read().clone()
    }

    pub fn strategy(&self) -> Arc<dyn ReplicationStrategy> {
        self.strategy.read().clone()
    }

    pub fn durable_writes(&self) -> bool {
        self.metadata.read().durable_writes()
    }

    /// Replace parameters from a newer definition. Tables are carried over;
    /// they change through `add_table`/`remove_table` only.
    pub fn update_from(
        &self,
        metadata: KeyspaceMetadata,
        provider: &dyn ReplicationStrategyProvider,
    ) -> Result<()> {
        let strategy = provider.create(metadata.strategy_name(), metadata.strategy_options())?;

        let mut current = self.metadata.write();
        let mut next = metadata;
        next.tables = current.tables.clone();
        *current = Arc::new(next);
        *self.strategy.write() = strategy;
        Ok(())
    }

    pub(crate) fn add_table(&self, schema: SchemaRef) {
        let mut current = self.metadata.write();
        *current = Arc::new(current.with_table(schema));
    }

    pub(crate) fn remove_table(&self, name: &str) {
        let mut current = self.metadata.write();
        *current = Arc::new(current.without_table(name));
    }
}
