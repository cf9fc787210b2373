use super::{
    ColumnValue, CommandResult, DataStore, EntityOperation, ModificationCommand, StoreOutcome,
    StoreTransaction, TransactionId, TransactionState, WriteBatch,
};
use crate::core::{DataType, DbError, Result, Value};
use crate::metadata::{EntityType, Model};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::{Level, event, info_span};
use uuid::Uuid;

pub type Row = BTreeMap<String, Value>;

#[derive(Debug, Clone, Default)]
struct MemoryTable {
    rows: HashMap<Vec<Value>, Row>,
    next_identity: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionSummary {
    pub id: TransactionId,
    pub state: TransactionState,
    pub commands_applied: usize,
}

/// In-process `DataStore` with one table per entity type.
///
/// A batch is applied to a private copy of the table image and published with
/// a single pointer swap, so readers never observe a half-applied batch and a
/// failed batch leaves nothing behind. Writers are serialized.
pub struct MemoryStore {
    model: Arc<Model>,
    tables: RwLock<Arc<HashMap<String, MemoryTable>>>,
    write_lock: Mutex<()>,
    batches_executed: AtomicUsize,
    transactions: Mutex<Vec<TransactionSummary>>,
    latency: Option<Duration>,
}

impl MemoryStore {
    pub fn new(model: Arc<Model>) -> Self {
        let tables = model
            .entity_types()
            .map(|ty| (ty.name().to_string(), MemoryTable::default()))
            .collect();
        Self {
            model,
            tables: RwLock::new(Arc::new(tables)),
            write_lock: Mutex::new(()),
            batches_executed: AtomicUsize::new(0),
            transactions: Mutex::new(Vec::new()),
            latency: None,
        }
    }

    /// Simulated round-trip delay applied by `execute_async`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Loads a row as if it had been committed earlier, bypassing constraint checks.
    pub fn seed(&self, entity_type: &str, row: Row) -> Result<()> {
        let ty = self.entity_type(entity_type)?;
        let key = key_of(ty, &row);
        let _guard = self.write_lock.lock()?;
        let mut image = (**self.tables.read()?).clone();
        let table = image.entry(entity_type.to_string()).or_default();
        bump_identity(ty, table, &row);
        table.rows.insert(key, row);
        *self.tables.write()? = Arc::new(image);
        Ok(())
    }

    pub fn row(&self, entity_type: &str, key: &[Value]) -> Option<Row> {
        let tables = self.tables.read().ok()?.clone();
        tables.get(entity_type)?.rows.get(key).cloned()
    }

    pub fn rows(&self, entity_type: &str) -> Vec<Row> {
        let Ok(tables) = self.tables.read().map(|t| t.clone()) else {
            return Vec::new();
        };
        tables
            .get(entity_type)
            .map(|table| table.rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn row_count(&self, entity_type: &str) -> usize {
        self.tables
            .read()
            .ok()
            .and_then(|tables| tables.get(entity_type).map(|t| t.rows.len()))
            .unwrap_or(0)
    }

    pub fn batches_executed(&self) -> usize {
        self.batches_executed.load(Ordering::SeqCst)
    }

    pub fn transaction_log(&self) -> Vec<TransactionSummary> {
        self.transactions
            .lock()
            .map(|log| log.clone())
            .unwrap_or_default()
    }

    fn entity_type(&self, name: &str) -> Result<&Arc<EntityType>> {
        self.model
            .entity_type(name)
            .ok_or_else(|| DbError::StoreError(format!("Table for entity type '{}' not found", name)))
    }

    fn apply(
        &self,
        image: &mut HashMap<String, MemoryTable>,
        command: &ModificationCommand,
        prior: &[CommandResult],
    ) -> Result<CommandResult> {
        let ty = self.entity_type(&command.entity_type)?;
        match command.operation {
            EntityOperation::Insert => self.apply_insert(image, ty, command, prior),
            EntityOperation::Update => self.apply_update(image, ty, command, prior),
            EntityOperation::Delete => self.apply_delete(image, ty, command),
        }
    }

    fn apply_insert(
        &self,
        image: &mut HashMap<String, MemoryTable>,
        ty: &EntityType,
        command: &ModificationCommand,
        prior: &[CommandResult],
    ) -> Result<CommandResult> {
        let mut result = CommandResult::default();
        let mut row = Row::new();
        for (name, column) in &command.values {
            let value = resolve(column, prior)?;
            if matches!(column, ColumnValue::FromCommand { .. }) {
                result.generated_values.insert(name.clone(), value.clone());
            }
            row.insert(name.clone(), value);
        }

        let table = image.entry(ty.name().to_string()).or_default();
        for property in ty.properties() {
            let current = row.get(property.name()).cloned().unwrap_or(Value::Null);
            let value = if current.is_null() && property.is_store_generated() {
                match property.data_type() {
                    DataType::Integer => {
                        table.next_identity += 1;
                        Value::Integer(table.next_identity)
                    }
                    DataType::Text => Value::Text(Uuid::new_v4().to_string()),
                    other => {
                        return Err(DbError::StoreError(format!(
                            "Cannot generate a {} value for '{}.{}'",
                            other,
                            ty.name(),
                            property.name()
                        )));
                    }
                }
            } else {
                current
            };
            property.validate(&value)?;
            row.insert(property.name().to_string(), value);
        }

        let key = key_of(ty, &row);
        if key.iter().any(Value::is_null) {
            return Err(DbError::ConstraintViolation(format!(
                "Primary key of table '{}' cannot be NULL",
                ty.table_name()
            )));
        }
        if table.rows.contains_key(&key) {
            return Err(DbError::ConstraintViolation(format!(
                "Duplicate key {} violates unique constraint on table '{}'",
                display_key(&key),
                ty.table_name()
            )));
        }
        bump_identity(ty, table, &row);

        self.check_references(image, ty, &row, None)?;

        for name in &command.generated {
            if let Some(value) = row.get(name) {
                result.generated_values.insert(name.clone(), value.clone());
            }
        }
        image
            .entry(ty.name().to_string())
            .or_default()
            .rows
            .insert(key, row);
        result.rows_affected = 1;
        Ok(result)
    }

    fn apply_update(
        &self,
        image: &mut HashMap<String, MemoryTable>,
        ty: &EntityType,
        command: &ModificationCommand,
        prior: &[CommandResult],
    ) -> Result<CommandResult> {
        let key = command_key(command);
        let Some(mut row) = image
            .get(ty.name())
            .and_then(|table| table.rows.get(&key))
            .cloned()
        else {
            return Err(missing_row(ty, &key));
        };

        let mut result = CommandResult::default();
        let mut changed = Vec::new();
        for (name, column) in &command.values {
            if ty.is_key_property(name) {
                return Err(DbError::ConstraintViolation(format!(
                    "Primary key column '{}' of table '{}' cannot be modified",
                    name,
                    ty.table_name()
                )));
            }
            let property = ty.property(name).ok_or_else(|| {
                DbError::StoreError(format!("Column '{}' not found in table '{}'", name, ty.table_name()))
            })?;
            let value = resolve(column, prior)?;
            property.validate(&value)?;
            if matches!(column, ColumnValue::FromCommand { .. }) {
                result.generated_values.insert(name.clone(), value.clone());
            }
            row.insert(name.clone(), value);
            changed.push(name.as_str());
        }

        self.check_references(image, ty, &row, Some(&changed))?;
        if let Some(table) = image.get_mut(ty.name()) {
            table.rows.insert(key, row);
        }
        result.rows_affected = 1;
        Ok(result)
    }

    fn apply_delete(
        &self,
        image: &mut HashMap<String, MemoryTable>,
        ty: &EntityType,
        command: &ModificationCommand,
    ) -> Result<CommandResult> {
        let key = command_key(command);
        let Some(row) = image
            .get(ty.name())
            .and_then(|table| table.rows.get(&key))
            .cloned()
        else {
            return Err(missing_row(ty, &key));
        };

        for (dependent, fk) in self.model.dependents_of(ty.name()) {
            let referenced: Vec<Value> = fk
                .principal_key()
                .iter()
                .map(|k| row.get(k).cloned().unwrap_or(Value::Null))
                .collect();
            let still_referenced = image.get(dependent.name()).is_some_and(|table| {
                table.rows.values().any(|dep_row| {
                    fk.properties()
                        .iter()
                        .zip(&referenced)
                        .all(|(p, v)| dep_row.get(p) == Some(v))
                })
            });
            if still_referenced {
                return Err(DbError::ConstraintViolation(format!(
                    "Delete on table '{}' violates foreign key constraint '{}' on table '{}'",
                    ty.table_name(),
                    fk.name(),
                    dependent.table_name()
                )));
            }
        }

        if let Some(table) = image.get_mut(ty.name()) {
            table.rows.remove(&key);
        }
        Ok(CommandResult {
            rows_affected: 1,
            generated_values: BTreeMap::new(),
        })
    }

    /// Every non-null foreign key on `row` must match a principal row.
    /// `changed` restricts the check to foreign keys touching those columns.
    fn check_references(
        &self,
        image: &HashMap<String, MemoryTable>,
        ty: &EntityType,
        row: &Row,
        changed: Option<&[&str]>,
    ) -> Result<()> {
        for fk in ty.foreign_keys() {
            if let Some(changed) = changed {
                if !fk.properties().iter().any(|p| changed.contains(&p.as_str())) {
                    continue;
                }
            }
            let values: Vec<Value> = fk
                .properties()
                .iter()
                .map(|p| row.get(p).cloned().unwrap_or(Value::Null))
                .collect();
            if values.iter().any(Value::is_null) {
                if fk.is_required() {
                    return Err(DbError::ConstraintViolation(format!(
                        "Required foreign key '{}' on table '{}' cannot be NULL",
                        fk.name(),
                        ty.table_name()
                    )));
                }
                continue;
            }

            let principal = self.entity_type(fk.principal_type())?;
            let exists = image.get(principal.name()).is_some_and(|table| {
                if fk.principal_key() == principal.primary_key() {
                    table.rows.contains_key(&values)
                } else {
                    table.rows.values().any(|candidate| {
                        fk.principal_key()
                            .iter()
                            .zip(&values)
                            .all(|(k, v)| candidate.get(k) == Some(v))
                    })
                }
            });
            if !exists {
                return Err(DbError::ConstraintViolation(format!(
                    "Foreign key '{}' on table '{}' references non-existent key {} in table '{}'",
                    fk.name(),
                    ty.table_name(),
                    display_key(&values),
                    principal.table_name()
                )));
            }
        }
        Ok(())
    }

    fn record(&self, txn: &StoreTransaction) {
        if let Ok(mut log) = self.transactions.lock() {
            log.push(TransactionSummary {
                id: txn.id(),
                state: txn.state(),
                commands_applied: txn.commands_applied(),
            });
        }
    }
}

#[async_trait]
impl DataStore for MemoryStore {
    fn execute(&self, batch: &WriteBatch) -> Result<StoreOutcome> {
        let span = info_span!("store.memory.execute", commands = batch.len());
        let _enter = span.enter();

        self.batches_executed.fetch_add(1, Ordering::SeqCst);
        let _guard = self.write_lock.lock()?;
        let mut txn = StoreTransaction::begin();
        let mut image = (**self.tables.read()?).clone();
        let mut results: Vec<CommandResult> = Vec::with_capacity(batch.len());

        for (index, command) in batch.iter().enumerate() {
            match self.apply(&mut image, command, &results) {
                Ok(result) => {
                    results.push(result);
                    txn.record_command()?;
                }
                Err(err) => {
                    txn.rollback()?;
                    self.record(&txn);
                    event!(
                        Level::DEBUG,
                        txn = %txn.id(),
                        index,
                        error = %err,
                        "memory store transaction aborted"
                    );
                    return Err(DbError::CommandFailed {
                        index,
                        source: Box::new(err),
                    });
                }
            }
        }

        txn.commit()?;
        *self.tables.write()? = Arc::new(image);
        self.record(&txn);
        event!(
            Level::DEBUG,
            txn = %txn.id(),
            commands = txn.commands_applied(),
            "memory store transaction committed"
        );
        Ok(StoreOutcome { results })
    }

    async fn execute_async(&self, batch: &WriteBatch) -> Result<StoreOutcome> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        self.execute(batch)
    }
}

fn resolve(column: &ColumnValue, prior: &[CommandResult]) -> Result<Value> {
    match column {
        ColumnValue::Value(value) => Ok(value.clone()),
        ColumnValue::FromCommand { command, property } => prior
            .get(*command)
            .and_then(|result| result.generated_values.get(property))
            .cloned()
            .ok_or_else(|| {
                DbError::StoreError(format!(
                    "Value '{}' of command {} is not available yet",
                    property, command
                ))
            }),
    }
}

fn key_of(ty: &EntityType, row: &Row) -> Vec<Value> {
    ty.primary_key()
        .iter()
        .map(|k| row.get(k).cloned().unwrap_or(Value::Null))
        .collect()
}

fn command_key(command: &ModificationCommand) -> Vec<Value> {
    command.key.iter().map(|(_, value)| value.clone()).collect()
}

fn bump_identity(ty: &EntityType, table: &mut MemoryTable, row: &Row) {
    for key in ty.primary_key() {
        let generated = ty.property(key).is_some_and(|p| p.is_store_generated());
        if let (true, Some(Value::Integer(v))) = (generated, row.get(key)) {
            table.next_identity = table.next_identity.max(*v);
        }
    }
}

fn missing_row(ty: &EntityType, key: &[Value]) -> DbError {
    DbError::ConcurrencyConflict(format!(
        "Expected 1 row affected in table '{}' for key {} but 0 rows were affected",
        ty.table_name(),
        display_key(key)
    ))
}

fn display_key(key: &[Value]) -> String {
    let parts: Vec<String> = key.iter().map(|v| v.to_string()).collect();
    format!("({})", parts.join(", "))
}
