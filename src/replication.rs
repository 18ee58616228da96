//! Replication strategies
//!
//! Placement logic lives outside the shard. A keyspace only needs a strategy
//! object built from its parameters, so construction goes through a provider
//! the database is given at open time.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

use crate::error::{Result, ShardError};

pub const SIMPLE_STRATEGY: &str = "SimpleStrategy";
pub const NETWORK_TOPOLOGY_STRATEGY: &str = "NetworkTopologyStrategy";
pub const LOCAL_STRATEGY: &str = "LocalStrategy";
pub const EVERYWHERE_STRATEGY: &str = "EverywhereStrategy";

/// An opaque replication strategy instance
pub trait ReplicationStrategy: Send + Sync + Debug {
    fn name(&self) -> &str;

    fn replication_factor(&self) -> usize;
}

/// Builds strategies from keyspace parameters
pub trait ReplicationStrategyProvider: Send + Sync {
    fn create(
        &self,
        strategy_name: &str,
        options: &BTreeMap<String, String>,
    ) -> Result<Arc<dyn ReplicationStrategy>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticStrategy {
    name: String,
    replication_factor: usize,
}

impl ReplicationStrategy for StaticStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn replication_factor(&self) -> usize {
        self.replication_factor
    }
}

/// Provider for the built-in strategy names. Accepts fully qualified class
/// names and uses only their last segment.
#[derive(Debug, Default, Clone, Copy)]
pub struct StaticReplicationProvider;

impl StaticReplicationProvider {
    fn parse_factor(key: &str, value: &str) -> Result<usize> {
        value.trim().parse::<usize>().map_err(|_| {
            ShardError::InvalidArgument(format!(
                "replication factor for {} must be a non-negative integer, got {:?}",
                key, value
            ))
        })
    }
}

impl ReplicationStrategyProvider for StaticReplicationProvider {
    fn create(
        &self,
        strategy_name: &str,
        options: &BTreeMap<String, String>,
    ) -> Result<Arc<dyn ReplicationStrategy>> {
        let short_name = strategy_name.rsplit('.').next().unwrap_or(strategy_name);

        let replication_factor = match short_name {
            SIMPLE_STRATEGY => {
                let rf = options.get("replication_factor").ok_or_else(|| {
                    ShardError::InvalidArgument(
                        "SimpleStrategy requires a replication_factor option".to_string(),
                    )
                })?;
                Self::parse_factor("replication_factor", rf)?
            }
            NETWORK_TOPOLOGY_STRATEGY => {
                // Per-datacenter factors; the total is what matters to a single shard
                let mut total = 0;
                for (key, value) in options.iter().filter(|(k, _)| k.as_str() != "class") {
                    total += Self::parse_factor(key, value)?;
                }
                total
            }
            LOCAL_STRATEGY | EVERYWHERE_STRATEGY => 1,
            other => {
                return Err(ShardError::Config(format!(
                    "unknown replication strategy {}",
                    other
                )))
            }
        };

        Ok(Arc::new(StaticStrategy {
            name: short_name.to_string(),
            replication_factor,
        }))
    }
}
