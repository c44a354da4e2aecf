//! Service configuration
//!
//! Loaded from a TOML file. Every section is optional and falls back to the
//! defaults below, so an empty file runs a single-node coordinator on one
//! in-memory partition.

use crate::{Error, Result};
use a2pc_participant::{LockRetryPolicy, TableConfig, TableKind};
use a2pc_recovery::{CleanupConfig, RollbackConfig};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub server: ServerConfig,
    pub nodes: Vec<NodeConfig>,
    pub coordinator: CoordinatorConfig,
    pub lock_retry: LockRetryConfig,
    pub rollback: RollbackSection,
    pub cleanup: CleanupSection,
    pub id: IdConfig,
    pub tables: Vec<TableConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 9000,
        }
    }
}

/// Backend implementation behind a node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    #[default]
    Memory,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NodeConfig {
    pub name: String,
    #[serde(default)]
    pub kind: NodeKind,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    #[serde(default = "default_lock_wait_timeout_ms")]
    pub lock_wait_timeout_ms: u64,
}

fn default_max_connections() -> usize {
    32
}

fn default_acquire_timeout_ms() -> u64 {
    3_000
}

fn default_lock_wait_timeout_ms() -> u64 {
    5_000
}

impl NodeConfig {
    pub fn memory(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: NodeKind::Memory,
            max_connections: default_max_connections(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            lock_wait_timeout_ms: default_lock_wait_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Nodes holding `transaction_info_{n}` and `lock_table_{n}`, in partition order
    pub partitions: Vec<String>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            partitions: vec!["tm_0".into()],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LockRetryConfig {
    pub attempts: u32,
    pub backoff_ms: u64,
}

impl Default for LockRetryConfig {
    fn default() -> Self {
        let policy = LockRetryPolicy::default();
        Self {
            attempts: policy.attempts,
            backoff_ms: policy.backoff.as_millis() as u64,
        }
    }
}

impl LockRetryConfig {
    pub fn policy(&self) -> LockRetryPolicy {
        LockRetryPolicy {
            attempts: self.attempts,
            backoff: Duration::from_millis(self.backoff_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RollbackSection {
    pub interval_ms: u64,
    pub active_timeout_ms: u64,
    pub batch_size: usize,
}

impl Default for RollbackSection {
    fn default() -> Self {
        let defaults = RollbackConfig::default();
        Self {
            interval_ms: defaults.interval.as_millis() as u64,
            active_timeout_ms: defaults.active_timeout.as_millis() as u64,
            batch_size: defaults.batch_size,
        }
    }
}

impl RollbackSection {
    pub fn worker_config(&self) -> RollbackConfig {
        RollbackConfig {
            interval: Duration::from_millis(self.interval_ms),
            active_timeout: Duration::from_millis(self.active_timeout_ms),
            batch_size: self.batch_size,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CleanupSection {
    pub interval_ms: u64,
    pub batch_size: usize,
    /// Extra nodes whose compensation logs are swept for every transaction
    pub log_nodes: Vec<String>,
}

impl Default for CleanupSection {
    fn default() -> Self {
        let defaults = CleanupConfig::default();
        Self {
            interval_ms: defaults.interval.as_millis() as u64,
            batch_size: defaults.batch_size,
            log_nodes: defaults.log_nodes,
        }
    }
}

impl CleanupSection {
    pub fn worker_config(&self) -> CleanupConfig {
        CleanupConfig {
            interval: Duration::from_millis(self.interval_ms),
            batch_size: self.batch_size,
            log_nodes: self.log_nodes.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct IdConfig {
    pub worker_id: u8,
    pub datacenter_id: u8,
}

impl Config {
    /// Read and validate a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| Error::ReadConfig {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::parse(&text)?;
        tracing::debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Parse and validate configuration text
    pub fn parse(text: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(text)?;
        config.fill_nodes();
        config.validate()?;
        Ok(config)
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.server.host, self.server.port)
            .parse()
            .map_err(|err| {
                Error::InvalidConfig(format!(
                    "listen address {}:{}: {}",
                    self.server.host, self.server.port, err
                ))
            })
    }

    /// Partition nodes need no `[[nodes]]` entry when the defaults suit them
    fn fill_nodes(&mut self) {
        for partition in &self.coordinator.partitions {
            if !self.nodes.iter().any(|node| &node.name == partition) {
                self.nodes.push(NodeConfig::memory(partition));
            }
        }
    }

    fn validate(&self) -> Result<()> {
        let mut names = BTreeSet::new();
        for node in &self.nodes {
            if !names.insert(node.name.as_str()) {
                return Err(Error::InvalidConfig(format!(
                    "node {} declared twice",
                    node.name
                )));
            }
        }
        if self.coordinator.partitions.is_empty() {
            return Err(Error::InvalidConfig(
                "coordinator.partitions must name at least one node".into(),
            ));
        }
        if self.lock_retry.attempts == 0 {
            return Err(Error::InvalidConfig("lock_retry.attempts must be positive".into()));
        }

        let known = |node: &str, what: &str| {
            if names.contains(node) {
                Ok(())
            } else {
                Err(Error::InvalidConfig(format!("{} names unknown node {}", what, node)))
            }
        };
        for node in &self.cleanup.log_nodes {
            known(node, "cleanup.log_nodes")?;
        }
        for table in &self.tables {
            let what = format!("table {}", table.name);
            match &table.kind {
                TableKind::Raw { backend } => known(&backend.node, &what)?,
                TableKind::Sharding { strategies } | TableKind::DoubleSharding { strategies } => {
                    for backend in strategies.iter().flat_map(|s| &s.backends) {
                        known(&backend.node, &what)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Nodes that hold application rows and therefore a compensation log
    pub fn data_nodes(&self) -> BTreeSet<String> {
        let mut nodes: BTreeSet<String> = self.cleanup.log_nodes.iter().cloned().collect();
        for table in &self.tables {
            match &table.kind {
                TableKind::Raw { backend } => {
                    nodes.insert(backend.node.clone());
                }
                TableKind::Sharding { strategies } | TableKind::DoubleSharding { strategies } => {
                    nodes.extend(
                        strategies
                            .iter()
                            .flat_map(|s| &s.backends)
                            .map(|b| b.node.clone()),
                    );
                }
            }
        }
        nodes
    }
}
