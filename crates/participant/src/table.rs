//! Logical tables and their routing to physical shards

use crate::{ParticipantError, Result};
use a2pc_backend::Statement;
use a2pc_common::{LockKey, Row};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// A physical location of a logical row
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
pub struct ShardRef {
    pub node: String,
    pub table: String,
}

impl ShardRef {
    pub fn new(node: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            table: table.into(),
        }
    }
}

/// Routing contract consumed by the participant
pub trait Table: Send + Sync {
    /// Logical name
    fn name(&self) -> &str;

    /// Columns whose values identify a row for global locking
    fn lock_columns(&self) -> &[String];

    /// Every physical location the statement's row maps to.
    ///
    /// Reads use the first entry; writes go to all of them.
    fn get_node(&self, statement: &Statement) -> Result<Vec<ShardRef>>;

    /// Lock key of the row addressed by `statement`
    fn lock_key(&self, statement: &Statement) -> Result<LockKey> {
        let identity = statement.row_identity();
        let mut values = Row::new();
        for column in self.lock_columns() {
            let value = identity
                .get(column)
                .filter(|v| !v.is_null())
                .ok_or_else(|| ParticipantError::MissingLockColumn {
                    table: self.name().to_string(),
                    column: column.clone(),
                })?;
            values.insert(column.clone(), value.clone());
        }
        Ok(LockKey::new(values))
    }
}

/// Table living on exactly one node
pub struct RawTable {
    name: String,
    lock_columns: Vec<String>,
    target: ShardRef,
}

impl RawTable {
    pub fn new(name: impl Into<String>, lock_columns: Vec<String>, target: ShardRef) -> Self {
        Self {
            name: name.into(),
            lock_columns,
            target,
        }
    }
}

impl Table for RawTable {
    fn name(&self) -> &str {
        &self.name
    }

    fn lock_columns(&self) -> &[String] {
        &self.lock_columns
    }

    fn get_node(&self, _statement: &Statement) -> Result<Vec<ShardRef>> {
        Ok(vec![self.target.clone()])
    }
}

/// Modulo sharding over integer columns with numbered backends
#[derive(Debug, Clone)]
pub struct ShardingStrategy {
    columns: Vec<String>,
    modulus: i64,
    backends: BTreeMap<i64, ShardRef>,
}

impl ShardingStrategy {
    pub fn new(
        table: &str,
        columns: Vec<String>,
        modulus: i64,
        backends: BTreeMap<i64, ShardRef>,
    ) -> Result<Self> {
        let invalid = |reason: &str| ParticipantError::InvalidTable {
            table: table.to_string(),
            reason: reason.to_string(),
        };
        if columns.is_empty() {
            return Err(invalid("sharding strategy needs sharding columns"));
        }
        if modulus <= 0 {
            return Err(invalid("sharding modulus must be positive"));
        }
        if backends.is_empty() {
            return Err(invalid("sharding strategy needs backends"));
        }
        Ok(Self {
            columns,
            modulus,
            backends,
        })
    }

    /// Backend number for the row identified by `identity`
    fn number(&self, table: &str, identity: &Row) -> Result<i64> {
        let mut sum: i64 = 0;
        for column in &self.columns {
            let value = identity
                .get(column)
                .filter(|v| !v.is_null())
                .ok_or_else(|| ParticipantError::MissingShardingColumn {
                    table: table.to_string(),
                    column: column.clone(),
                })?;
            let value = value
                .as_i64()
                .ok_or_else(|| ParticipantError::InvalidShardingValue {
                    table: table.to_string(),
                    column: column.clone(),
                })?;
            sum = sum.wrapping_add(value);
        }
        Ok(sum.rem_euclid(self.modulus))
    }

    fn route(&self, table: &str, identity: &Row) -> Result<ShardRef> {
        let number = self.number(table, identity)?;
        self.backends
            .get(&number)
            .cloned()
            .ok_or_else(|| ParticipantError::NoBackend {
                table: table.to_string(),
                number,
            })
    }
}

/// Table split across backends by one strategy
pub struct ShardingTable {
    name: String,
    lock_columns: Vec<String>,
    strategy: ShardingStrategy,
}

impl ShardingTable {
    pub fn new(
        name: impl Into<String>,
        lock_columns: Vec<String>,
        strategy: ShardingStrategy,
    ) -> Self {
        Self {
            name: name.into(),
            lock_columns,
            strategy,
        }
    }
}

impl Table for ShardingTable {
    fn name(&self) -> &str {
        &self.name
    }

    fn lock_columns(&self) -> &[String] {
        &self.lock_columns
    }

    fn get_node(&self, statement: &Statement) -> Result<Vec<ShardRef>> {
        let identity = statement.row_identity();
        Ok(vec![self.strategy.route(&self.name, &identity)?])
    }
}

/// Table stored twice, once per sharding dimension
pub struct DoubleShardingTable {
    name: String,
    lock_columns: Vec<String>,
    strategies: [ShardingStrategy; 2],
}

impl DoubleShardingTable {
    pub fn new(
        name: impl Into<String>,
        lock_columns: Vec<String>,
        primary: ShardingStrategy,
        secondary: ShardingStrategy,
    ) -> Self {
        Self {
            name: name.into(),
            lock_columns,
            strategies: [primary, secondary],
        }
    }
}

impl Table for DoubleShardingTable {
    fn name(&self) -> &str {
        &self.name
    }

    fn lock_columns(&self) -> &[String] {
        &self.lock_columns
    }

    fn get_node(&self, statement: &Statement) -> Result<Vec<ShardRef>> {
        let identity = statement.row_identity();
        let mut targets = Vec::with_capacity(2);
        for strategy in &self.strategies {
            let target = strategy.route(&self.name, &identity)?;
            if !targets.contains(&target) {
                targets.push(target);
            }
        }
        Ok(targets)
    }
}

/// Table description as found in configuration files
#[derive(Debug, Clone, Deserialize)]
pub struct TableConfig {
    pub name: String,
    #[serde(flatten)]
    pub kind: TableKind,
    pub lock_columns: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TableKind {
    Raw { backend: ShardRef },
    Sharding { strategies: Vec<StrategyConfig> },
    DoubleSharding { strategies: Vec<StrategyConfig> },
}

#[derive(Debug, Clone, Deserialize)]
pub struct StrategyConfig {
    pub sharding_columns: Vec<String>,
    pub modulus: i64,
    pub backends: Vec<NumberedBackend>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NumberedBackend {
    pub number: i64,
    pub node: String,
    pub table: String,
}

impl StrategyConfig {
    fn build(&self, table: &str) -> Result<ShardingStrategy> {
        let backends = self
            .backends
            .iter()
            .map(|b| (b.number, ShardRef::new(&b.node, &b.table)))
            .collect();
        ShardingStrategy::new(
            table,
            self.sharding_columns.clone(),
            self.modulus,
            backends,
        )
    }
}

impl TableConfig {
    pub fn build(&self) -> Result<Arc<dyn Table>> {
        let strategies = |expected: usize| -> Result<Vec<ShardingStrategy>> {
            let (TableKind::Sharding { strategies } | TableKind::DoubleSharding { strategies }) =
                &self.kind
            else {
                return Ok(Vec::new());
            };
            if strategies.len() != expected {
                return Err(ParticipantError::InvalidTable {
                    table: self.name.clone(),
                    reason: format!("expected {} strategies, got {}", expected, strategies.len()),
                });
            }
            strategies.iter().map(|s| s.build(&self.name)).collect()
        };

        let table: Arc<dyn Table> = match &self.kind {
            TableKind::Raw { backend } => Arc::new(RawTable::new(
                &self.name,
                self.lock_columns.clone(),
                backend.clone(),
            )),
            TableKind::Sharding { .. } => {
                let mut built = strategies(1)?;
                Arc::new(ShardingTable::new(
                    &self.name,
                    self.lock_columns.clone(),
                    built.remove(0),
                ))
            }
            TableKind::DoubleSharding { .. } => {
                let mut built = strategies(2)?;
                let secondary = built.remove(1);
                let primary = built.remove(0);
                Arc::new(DoubleShardingTable::new(
                    &self.name,
                    self.lock_columns.clone(),
                    primary,
                    secondary,
                ))
            }
        };
        Ok(table)
    }
}

/// Logical tables of one database, looked up by name
#[derive(Default)]
pub struct Database {
    tables: HashMap<String, Arc<dyn Table>>,
}

impl Database {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(tables: &[TableConfig]) -> Result<Self> {
        let mut database = Self::new();
        for config in tables {
            database.add_table(config.build()?);
        }
        Ok(database)
    }

    pub fn add_table(&mut self, table: Arc<dyn Table>) {
        self.tables.insert(table.name().to_string(), table);
    }

    pub fn get_table(&self, name: &str) -> Result<Arc<dyn Table>> {
        self.tables
            .get(name)
            .cloned()
            .ok_or_else(|| ParticipantError::UnknownTable(name.to_string()))
    }
}
