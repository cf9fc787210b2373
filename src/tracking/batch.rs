use super::entry::{EntityState, Entry, EntryId};
use super::registry::Registry;
use super::snapshot::NavigationSnapshot;
use crate::core::{DbError, Result, Value};
use crate::metadata::{ForeignKey, Model, NavigationRole};
use crate::store::{ColumnValue, EntityOperation, ModificationCommand, WriteBatch};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{Level, event};

/// Ordered batch plus the entry behind each command.
#[derive(Debug, Default)]
pub struct PreparedBatch {
    pub batch: WriteBatch,
    pub entries: Vec<EntryId>,
}

impl PreparedBatch {
    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }

    pub fn len(&self) -> usize {
        self.batch.len()
    }
}

/// Turns pending entries into a dependency-ordered write batch.
///
/// Ordering runs entirely in memory; a cycle is reported before anything
/// reaches the store.
pub struct BatchBuilder<'a> {
    model: &'a Model,
    registry: &'a Registry,
}

impl<'a> BatchBuilder<'a> {
    pub fn new(model: &'a Model, registry: &'a Registry) -> Self {
        Self { model, registry }
    }

    pub fn build(&self) -> Result<PreparedBatch> {
        let candidates: Vec<EntryId> = self
            .registry
            .iter()
            .filter(|e| e.state().is_pending())
            .filter(|e| {
                let usable = e.is_alive() || e.state() == EntityState::Deleted;
                if !usable {
                    event!(Level::WARN, entry = %e.id(), state = %e.state(), "skipping entry whose object was dropped");
                }
                usable
            })
            .map(Entry::id)
            .collect();

        let edges = self.dependencies(&candidates)?;
        let order = topological_order(&candidates, &edges).map_err(|stuck| {
            let members: Vec<String> = stuck
                .iter()
                .filter_map(|id| self.registry.get(*id))
                .map(|e| format!("{} ({}, {})", e.entity_type().name(), e.id(), e.state()))
                .collect();
            DbError::DependencyCycle(format!(
                "Unable to order the changes because of a circular dependency between: {}",
                members.join(", ")
            ))
        })?;

        let mut prepared = PreparedBatch::default();
        let mut command_of: HashMap<EntryId, usize> = HashMap::new();
        for id in order {
            let Some(entry) = self.registry.get(id) else {
                continue;
            };
            let command = self.command_for(entry, &command_of);
            command_of.insert(id, prepared.batch.push(command));
            prepared.entries.push(id);
        }

        event!(Level::DEBUG, commands = prepared.len(), "write batch assembled");
        Ok(prepared)
    }

    /// Edges run from the entry that must be written first to the one that waits.
    fn dependencies(&self, candidates: &[EntryId]) -> Result<BTreeMap<EntryId, BTreeSet<EntryId>>> {
        let in_batch: BTreeSet<EntryId> = candidates.iter().copied().collect();
        let mut edges: BTreeMap<EntryId, BTreeSet<EntryId>> = BTreeMap::new();

        for &id in candidates {
            let Some(entry) = self.registry.get(id) else {
                continue;
            };
            match entry.state() {
                EntityState::Added | EntityState::Modified => {
                    for fk in entry.entity_type().foreign_keys() {
                        if entry.state() == EntityState::Modified
                            && !fk.properties().iter().any(|p| entry.is_modified(p))
                        {
                            continue;
                        }
                        let Some(principal) = self.principal_of(entry, fk) else {
                            continue;
                        };
                        if principal == id {
                            if entry.state() == EntityState::Added && self.key_pending(entry) {
                                return Err(DbError::DependencyCycle(format!(
                                    "Entity '{}' ({}) references itself through '{}' but its key is generated by the store",
                                    entry.entity_type().name(),
                                    id,
                                    fk.name()
                                )));
                            }
                            continue;
                        }
                        let principal_state = self.registry.get(principal).map(Entry::state);
                        if in_batch.contains(&principal)
                            && matches!(principal_state, Some(EntityState::Added | EntityState::Modified))
                        {
                            edges.entry(principal).or_default().insert(id);
                        }
                    }
                }
                EntityState::Deleted => {
                    for (dependent_type, fk) in self.model.dependents_of(entry.entity_type().name()) {
                        let key: Vec<Value> = fk
                            .principal_key()
                            .iter()
                            .map(|k| stored_or_current(entry, k))
                            .collect();
                        if key.iter().any(Value::is_null) {
                            continue;
                        }
                        for &other in candidates {
                            let Some(dependent) = self.registry.get(other) else {
                                continue;
                            };
                            if other == id || dependent.entity_type().name() != dependent_type.name() {
                                continue;
                            }
                            let leaving = match dependent.state() {
                                EntityState::Deleted => true,
                                EntityState::Modified => {
                                    fk.properties().iter().any(|p| dependent.is_modified(p))
                                }
                                _ => false,
                            };
                            let stored_reference: Vec<Value> = fk
                                .properties()
                                .iter()
                                .map(|p| stored_or_current(dependent, p))
                                .collect();
                            if leaving && stored_reference == key {
                                edges.entry(other).or_default().insert(id);
                            }
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(edges)
    }

    /// Principal entry `entry` points at through `fk`: its reference
    /// navigation first, then principals listing it, then key values.
    fn principal_of(&self, entry: &Entry, fk: &ForeignKey) -> Option<EntryId> {
        let tracked = |id: EntryId| {
            self.registry
                .get(id)
                .filter(|p| p.state() != EntityState::Detached && p.entity_type().name() == fk.principal_type())
                .map(Entry::id)
        };

        if let Some(nav) = entry.entity_type().principal_navigation_for(fk.name()) {
            if let Some(NavigationSnapshot::Reference(Some(target))) = entry.current_navigation(nav.name()) {
                if let Some(id) = self.registry.id_of(target).and_then(tracked) {
                    return Some(id);
                }
            }
        }

        let listed = self.registry.iter().find(|p| {
            p.state() != EntityState::Detached
                && p.entity_type().name() == fk.principal_type()
                && p.entity_type().navigations().iter().any(|nav| {
                    nav.role() == NavigationRole::ToDependents
                        && nav.foreign_key() == Some(fk.name())
                        && p.current_navigation(nav.name())
                            .is_some_and(|members| members.members().contains(&entry.object_key()))
                })
        });
        if let Some(p) = listed {
            return Some(p.id());
        }

        let values: Vec<Value> = fk.properties().iter().map(|p| entry.current_value(p)).collect();
        if values.iter().any(Value::is_null) {
            return None;
        }
        self.registry
            .iter()
            .find(|p| {
                p.state() != EntityState::Detached
                    && p.entity_type().name() == fk.principal_type()
                    && fk
                        .principal_key()
                        .iter()
                        .zip(&values)
                        .all(|(k, v)| p.current_value(k) == *v)
            })
            .map(Entry::id)
    }

    /// True when some store-generated key property has no value yet.
    fn key_pending(&self, entry: &Entry) -> bool {
        let entity_type = entry.entity_type();
        entity_type.primary_key().iter().any(|k| {
            entity_type.property(k).is_some_and(|p| p.is_store_generated())
                && entry.current_value(k).is_null()
        })
    }

    fn command_for(&self, entry: &Entry, command_of: &HashMap<EntryId, usize>) -> ModificationCommand {
        let entity_type = entry.entity_type();
        let deferred = self.deferred_columns(entry, command_of);
        let column = |name: &str| {
            deferred
                .get(name)
                .cloned()
                .unwrap_or_else(|| ColumnValue::Value(entry.current_value(name)))
        };

        let mut command = ModificationCommand {
            entity_type: entity_type.name().to_string(),
            table: entity_type.table_name().to_string(),
            operation: EntityOperation::Insert,
            key: Vec::new(),
            values: Vec::new(),
            generated: Vec::new(),
        };
        match entry.state() {
            EntityState::Added => {
                for property in entity_type.properties() {
                    let name = property.name();
                    if property.is_store_generated() && entry.current_value(name).is_null() {
                        command.generated.push(name.to_string());
                        continue;
                    }
                    command.values.push((name.to_string(), column(name)));
                }
            }
            EntityState::Modified => {
                command.operation = EntityOperation::Update;
                command.key = entry.store_key();
                for property in entity_type.properties() {
                    if entry.is_modified(property.name()) {
                        command
                            .values
                            .push((property.name().to_string(), column(property.name())));
                    }
                }
            }
            _ => {
                command.operation = EntityOperation::Delete;
                command.key = entry.store_key();
            }
        }
        command
    }

    /// Foreign-key columns whose value is the not-yet-generated key of a
    /// principal inserted earlier in the batch.
    fn deferred_columns(
        &self,
        entry: &Entry,
        command_of: &HashMap<EntryId, usize>,
    ) -> HashMap<String, ColumnValue> {
        let mut deferred = HashMap::new();
        if !matches!(entry.state(), EntityState::Added | EntityState::Modified) {
            return deferred;
        }
        for fk in entry.entity_type().foreign_keys() {
            let Some(principal_id) = self.principal_of(entry, fk) else {
                continue;
            };
            let (Some(principal), Some(&command)) =
                (self.registry.get(principal_id), command_of.get(&principal_id))
            else {
                continue;
            };
            if principal_id == entry.id() || principal.state() != EntityState::Added {
                continue;
            }
            for (property, principal_key) in fk.properties().iter().zip(fk.principal_key()) {
                let generated = principal
                    .entity_type()
                    .property(principal_key)
                    .is_some_and(|p| p.is_store_generated());
                if generated && principal.current_value(principal_key).is_null() {
                    deferred.insert(
                        property.clone(),
                        ColumnValue::FromCommand {
                            command,
                            property: principal_key.clone(),
                        },
                    );
                }
            }
        }
        deferred
    }
}

fn stored_or_current(entry: &Entry, property: &str) -> Value {
    entry
        .stored_value(property)
        .cloned()
        .unwrap_or_else(|| entry.current_value(property))
}

/// Kahn's algorithm with the ready set ordered by entry id. On a cycle the
/// entries that could not be placed are returned.
fn topological_order(
    nodes: &[EntryId],
    edges: &BTreeMap<EntryId, BTreeSet<EntryId>>,
) -> std::result::Result<Vec<EntryId>, Vec<EntryId>> {
    let mut indegree: BTreeMap<EntryId, usize> = nodes.iter().map(|id| (*id, 0)).collect();
    for successors in edges.values() {
        for successor in successors {
            if let Some(count) = indegree.get_mut(successor) {
                *count += 1;
            }
        }
    }

    let mut ready: BTreeSet<EntryId> = indegree
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut order = Vec::with_capacity(nodes.len());
    while let Some(id) = ready.pop_first() {
        order.push(id);
        for successor in edges.get(&id).into_iter().flatten() {
            if let Some(count) = indegree.get_mut(successor) {
                *count -= 1;
                if *count == 0 {
                    ready.insert(*successor);
                }
            }
        }
    }

    if order.len() == nodes.len() {
        Ok(order)
    } else {
        let placed: BTreeSet<EntryId> = order.into_iter().collect();
        Err(nodes.iter().filter(|id| !placed.contains(id)).copied().collect())
    }
}
