use super::entry::{Entry, EntryCheckpoint, EntryId};
use crate::entity::{EntityRef, ObjectKey};
use std::collections::{BTreeMap, HashMap};

/// Identity map: one entry per tracked object, iterated in entry-id order.
#[derive(Debug, Default)]
pub struct Registry {
    entries: BTreeMap<EntryId, Entry>,
    identity: HashMap<ObjectKey, EntryId>,
    next_id: u64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn next_id(&mut self) -> EntryId {
        self.next_id += 1;
        EntryId(self.next_id)
    }

    pub(crate) fn insert(&mut self, entry: Entry) {
        self.identity.insert(entry.object_key(), entry.id());
        self.entries.insert(entry.id(), entry);
    }

    pub(crate) fn remove(&mut self, id: EntryId) -> Option<Entry> {
        let entry = self.entries.remove(&id)?;
        if self.identity.get(&entry.object_key()) == Some(&id) {
            self.identity.remove(&entry.object_key());
        }
        Some(entry)
    }

    pub fn get(&self, id: EntryId) -> Option<&Entry> {
        self.entries.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: EntryId) -> Option<&mut Entry> {
        self.entries.get_mut(&id)
    }

    pub fn id_of(&self, key: ObjectKey) -> Option<EntryId> {
        self.identity.get(&key).copied()
    }

    pub fn lookup(&self, entity: &EntityRef) -> Option<EntryId> {
        self.id_of(ObjectKey::of(entity))
    }

    pub fn ids(&self) -> Vec<EntryId> {
        self.entries.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn checkpoint(&self) -> Vec<EntryCheckpoint> {
        self.entries.values().map(Entry::checkpoint).collect()
    }

    /// Puts entries back as checkpointed. Entries removed since are not revived.
    pub(crate) fn restore(&mut self, checkpoint: Vec<EntryCheckpoint>) {
        for saved in checkpoint {
            if let Some(entry) = self.entries.get_mut(&saved.id()) {
                entry.restore(saved);
            }
        }
    }
}
