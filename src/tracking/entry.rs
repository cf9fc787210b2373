use super::snapshot::{NavigationSnapshot, RelationshipSnapshot, ValueSnapshot};
use crate::core::Value;
use crate::entity::{Entity, EntityRef, ObjectKey, SubscriptionId};
use crate::metadata::EntityType;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Weak};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryId(pub u64);

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "entry_{}", self.0)
    }
}

/// Lifecycle state of a tracked object.
///
/// ```text
/// Detached ──> Added ──save──> Unchanged <──save── Modified
///                │                 │  ▲               ▲
///                │ delete          │  └── mutation ───┘
///                ▼                 ▼
///            (detached)         Deleted ──save──> (removed)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityState {
    Detached,
    Unchanged,
    Added,
    Modified,
    Deleted,
}

impl EntityState {
    /// States that produce a command on save.
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Added | Self::Modified | Self::Deleted)
    }

    /// States in which the store is believed to hold the row.
    pub fn is_stored(&self) -> bool {
        matches!(self, Self::Unchanged | Self::Modified | Self::Deleted)
    }
}

impl fmt::Display for EntityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Detached => "Detached",
            Self::Unchanged => "Unchanged",
            Self::Added => "Added",
            Self::Modified => "Modified",
            Self::Deleted => "Deleted",
        };
        f.write_str(name)
    }
}

/// How an entry learns about mutations, fixed when tracking starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeSource {
    /// The object raises notifications; only the listed collection
    /// navigations must still be compared against a snapshot.
    Push { polled_navigations: Vec<String> },
    /// Every property and navigation is compared against a snapshot.
    Poll,
}

impl ChangeSource {
    pub fn is_poll(&self) -> bool {
        matches!(self, Self::Poll)
    }
}

/// Bookkeeping of one entry as it stood before a save began.
#[derive(Debug, Clone)]
pub(crate) struct EntryCheckpoint {
    id: EntryId,
    state: EntityState,
    original_values: ValueSnapshot,
    relationships: RelationshipSnapshot,
    modified: BTreeSet<String>,
}

impl EntryCheckpoint {
    pub(crate) fn id(&self) -> EntryId {
        self.id
    }
}

/// Tracking record for one object instance.
pub struct Entry {
    id: EntryId,
    object: Weak<dyn Entity>,
    key: ObjectKey,
    entity_type: Arc<EntityType>,
    pub(crate) state: EntityState,
    pub(crate) change_source: ChangeSource,
    pub(crate) original_values: ValueSnapshot,
    pub(crate) relationships: RelationshipSnapshot,
    pub(crate) stored_values: Option<ValueSnapshot>,
    pub(crate) modified: BTreeSet<String>,
    pub(crate) subscriptions: Vec<SubscriptionId>,
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("id", &self.id)
            .field("entity_type", &self.entity_type.name())
            .field("state", &self.state)
            .field("change_source", &self.change_source)
            .field("modified", &self.modified)
            .finish()
    }
}

impl Entry {
    pub(crate) fn new(
        id: EntryId,
        entity: &EntityRef,
        entity_type: Arc<EntityType>,
        change_source: ChangeSource,
    ) -> Self {
        Self {
            id,
            object: Arc::downgrade(entity),
            key: ObjectKey::of(entity),
            entity_type,
            state: EntityState::Detached,
            change_source,
            original_values: ValueSnapshot::new(),
            relationships: RelationshipSnapshot::new(),
            stored_values: None,
            modified: BTreeSet::new(),
            subscriptions: Vec::new(),
        }
    }

    pub fn id(&self) -> EntryId {
        self.id
    }

    pub fn object_key(&self) -> ObjectKey {
        self.key
    }

    /// The tracked object, or `None` once its owner has dropped it.
    pub fn entity(&self) -> Option<EntityRef> {
        self.object.upgrade()
    }

    pub fn is_alive(&self) -> bool {
        self.object.strong_count() > 0
    }

    pub fn entity_type(&self) -> &Arc<EntityType> {
        &self.entity_type
    }

    pub fn state(&self) -> EntityState {
        self.state
    }

    pub fn change_source(&self) -> &ChangeSource {
        &self.change_source
    }

    /// Reads through the object; a dropped object falls back to the store image.
    pub fn current_value(&self, property: &str) -> Value {
        match self.object.upgrade() {
            Some(entity) => entity.get_value(property).unwrap_or(Value::Null),
            None => self.stored_value(property).cloned().unwrap_or(Value::Null),
        }
    }

    pub fn current_values(&self) -> BTreeMap<String, Value> {
        self.entity_type
            .properties()
            .iter()
            .map(|p| (p.name().to_string(), self.current_value(p.name())))
            .collect()
    }

    /// Writes through the object's setter. Returns false when the value was
    /// already equal or the object is gone.
    pub fn set_current_value(&self, property: &str, value: Value) -> bool {
        let Some(entity) = self.object.upgrade() else {
            return false;
        };
        if entity.get_value(property).unwrap_or(Value::Null) == value {
            return false;
        }
        entity.set_value(property, value);
        true
    }

    pub fn current_navigation(&self, navigation: &str) -> Option<NavigationSnapshot> {
        let nav = self.entity_type.navigation(navigation)?;
        Some(match self.object.upgrade() {
            Some(entity) => NavigationSnapshot::capture(entity.as_ref(), nav),
            None => NavigationSnapshot::empty(nav.kind()),
        })
    }

    pub fn original_value(&self, property: &str) -> Option<&Value> {
        self.original_values.get(property)
    }

    pub fn original_values(&self) -> &ValueSnapshot {
        &self.original_values
    }

    pub fn relationship(&self, navigation: &str) -> Option<&NavigationSnapshot> {
        self.relationships.get(navigation)
    }

    pub fn stored_value(&self, property: &str) -> Option<&Value> {
        self.stored_values.as_ref()?.get(property)
    }

    pub fn stored_values(&self) -> Option<&ValueSnapshot> {
        self.stored_values.as_ref()
    }

    pub fn is_modified(&self, property: &str) -> bool {
        self.modified.contains(property)
    }

    pub fn modified_properties(&self) -> impl Iterator<Item = &str> {
        self.modified.iter().map(String::as_str)
    }

    /// Primary key identifying the stored row; current values until the row exists.
    pub fn store_key(&self) -> Vec<(String, Value)> {
        self.entity_type
            .primary_key()
            .iter()
            .map(|k| {
                let value = self
                    .stored_value(k)
                    .cloned()
                    .unwrap_or_else(|| self.current_value(k));
                (k.clone(), value)
            })
            .collect()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    pub(crate) fn capture_stored_values(&mut self) {
        if let Some(entity) = self.object.upgrade() {
            self.stored_values = Some(ValueSnapshot::capture(entity.as_ref(), &self.entity_type));
        }
    }

    /// Resets every baseline to the object's current values.
    pub(crate) fn accept_current_values(&mut self) {
        let Some(entity) = self.object.upgrade() else {
            return;
        };
        let snapshot = ValueSnapshot::capture(entity.as_ref(), &self.entity_type);
        self.relationships =
            RelationshipSnapshot::capture(entity.as_ref(), self.entity_type.navigations());
        self.original_values = snapshot.clone();
        self.stored_values = Some(snapshot);
        self.modified.clear();
    }

    pub(crate) fn mark_all_modified(&mut self) {
        let entity_type = self.entity_type.clone();
        self.modified = entity_type
            .properties()
            .iter()
            .filter(|p| !entity_type.is_key_property(p.name()))
            .map(|p| p.name().to_string())
            .collect();
    }

    pub(crate) fn checkpoint(&self) -> EntryCheckpoint {
        EntryCheckpoint {
            id: self.id,
            state: self.state,
            original_values: self.original_values.clone(),
            relationships: self.relationships.clone(),
            modified: self.modified.clone(),
        }
    }

    pub(crate) fn restore(&mut self, checkpoint: EntryCheckpoint) {
        self.state = checkpoint.state;
        self.original_values = checkpoint.original_values;
        self.relationships = checkpoint.relationships;
        self.modified = checkpoint.modified;
    }

    /// Removes every notification handler this entry installed.
    pub(crate) fn unsubscribe(&mut self) {
        let subscriptions = std::mem::take(&mut self.subscriptions);
        let Some(entity) = self.object.upgrade() else {
            return;
        };
        if let Some(notifier) = entity.change_notifier() {
            for id in subscriptions {
                notifier.unsubscribe(id);
            }
        }
    }
}
