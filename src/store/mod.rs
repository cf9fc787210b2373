// ============================================================================
// Store Boundary
// ============================================================================
//
// The tracker hands the store one ordered `WriteBatch` per save. The store
// either applies every command inside one transaction and reports per-command
// results, or fails without applying anything.
//
// ============================================================================

pub mod memory;
pub mod transaction;

pub use memory::{MemoryStore, Row, TransactionSummary};
pub use transaction::{StoreTransaction, TransactionId, TransactionState};

use crate::core::{Result, Value};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityOperation {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for EntityOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Insert => write!(f, "Insert"),
            Self::Update => write!(f, "Update"),
            Self::Delete => write!(f, "Delete"),
        }
    }
}

/// Column payload of a command.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Value(Value),
    /// Value the store produces for an earlier command in the same batch,
    /// e.g. the generated key of a principal inserted just before.
    FromCommand { command: usize, property: String },
}

#[derive(Debug, Clone)]
pub struct ModificationCommand {
    pub entity_type: String,
    pub table: String,
    pub operation: EntityOperation,
    /// Row identity for updates and deletes, in primary-key order. Empty for inserts.
    pub key: Vec<(String, Value)>,
    /// Inserts carry every supplied column, updates only the modified ones.
    pub values: Vec<(String, ColumnValue)>,
    /// Store-generated properties the caller wants reported back.
    pub generated: Vec<String>,
}

impl ModificationCommand {
    pub fn value(&self, property: &str) -> Option<&ColumnValue> {
        self.values
            .iter()
            .find(|(name, _)| name == property)
            .map(|(_, value)| value)
    }
}

#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    commands: Vec<ModificationCommand>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, command: ModificationCommand) -> usize {
        self.commands.push(command);
        self.commands.len() - 1
    }

    pub fn commands(&self) -> &[ModificationCommand] {
        &self.commands
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModificationCommand> {
        self.commands.iter()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandResult {
    pub rows_affected: usize,
    /// Values produced by the store: requested generated properties and any
    /// `FromCommand` columns it resolved.
    pub generated_values: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default)]
pub struct StoreOutcome {
    pub results: Vec<CommandResult>,
}

impl StoreOutcome {
    pub fn rows_affected(&self) -> usize {
        self.results.iter().map(|r| r.rows_affected).sum()
    }
}

#[async_trait]
pub trait DataStore: Send + Sync {
    /// Applies the whole batch atomically, blocking the caller.
    fn execute(&self, batch: &WriteBatch) -> Result<StoreOutcome>;

    async fn execute_async(&self, batch: &WriteBatch) -> Result<StoreOutcome> {
        self.execute(batch)
    }
}
