use crate::core::Value;
use crate::entity::{Entity, NavigationValue, ObjectKey};
use crate::metadata::{EntityType, Navigation, NavigationKind};
use std::collections::{BTreeMap, BTreeSet};

/// Frozen copy of a subset of an entry's scalar values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValueSnapshot {
    values: BTreeMap<String, Value>,
}

impl ValueSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Captures every property of `entity_type`; missing members read as `Null`.
    pub fn capture(entity: &dyn Entity, entity_type: &EntityType) -> Self {
        let values = entity_type
            .properties()
            .iter()
            .map(|p| {
                let value = entity.get_value(p.name()).unwrap_or(Value::Null);
                (p.name().to_string(), value)
            })
            .collect();
        Self { values }
    }

    pub fn get(&self, property: &str) -> Option<&Value> {
        self.values.get(property)
    }

    pub fn contains(&self, property: &str) -> bool {
        self.values.contains_key(property)
    }

    pub fn insert(&mut self, property: &str, value: Value) {
        self.values.insert(property.to_string(), value);
    }

    /// Keeps an existing value; used for lazily captured originals.
    pub fn insert_if_absent(&mut self, property: &str, value: Value) -> bool {
        if self.values.contains_key(property) {
            return false;
        }
        self.values.insert(property.to_string(), value);
        true
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn to_map(&self) -> BTreeMap<String, Value> {
        self.values.clone()
    }
}

/// Snapshot of one navigation: the identities it referenced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NavigationSnapshot {
    Reference(Option<ObjectKey>),
    Collection(BTreeSet<ObjectKey>),
}

impl NavigationSnapshot {
    pub fn empty(kind: NavigationKind) -> Self {
        match kind {
            NavigationKind::Reference => Self::Reference(None),
            NavigationKind::Collection => Self::Collection(BTreeSet::new()),
        }
    }

    pub fn from_value(kind: NavigationKind, value: Option<&NavigationValue>) -> Self {
        match (kind, value) {
            (_, None) => Self::empty(kind),
            (NavigationKind::Reference, Some(value)) => {
                Self::Reference(value.members().first().map(|target| ObjectKey::of(target)))
            }
            (NavigationKind::Collection, Some(value)) => {
                Self::Collection(value.members().into_iter().map(ObjectKey::of).collect())
            }
        }
    }

    /// Reads the current value of `navigation` from `entity`.
    pub fn capture(entity: &dyn Entity, navigation: &Navigation) -> Self {
        Self::from_value(navigation.kind(), entity.navigation(navigation.name()).as_ref())
    }

    pub fn members(&self) -> BTreeSet<ObjectKey> {
        match self {
            Self::Reference(target) => target.iter().copied().collect(),
            Self::Collection(items) => items.clone(),
        }
    }

    /// Members present in `newer` but not here, then members only present here.
    pub fn diff(&self, newer: &NavigationSnapshot) -> (Vec<ObjectKey>, Vec<ObjectKey>) {
        let before = self.members();
        let after = newer.members();
        let added = after.difference(&before).copied().collect();
        let removed = before.difference(&after).copied().collect();
        (added, removed)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RelationshipSnapshot {
    navigations: BTreeMap<String, NavigationSnapshot>,
}

impl RelationshipSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn capture<'a>(
        entity: &dyn Entity,
        navigations: impl IntoIterator<Item = &'a Navigation>,
    ) -> Self {
        let navigations = navigations
            .into_iter()
            .map(|nav| (nav.name().to_string(), NavigationSnapshot::capture(entity, nav)))
            .collect();
        Self { navigations }
    }

    pub fn get(&self, navigation: &str) -> Option<&NavigationSnapshot> {
        self.navigations.get(navigation)
    }

    pub fn contains(&self, navigation: &str) -> bool {
        self.navigations.contains_key(navigation)
    }

    pub fn insert(&mut self, navigation: &str, snapshot: NavigationSnapshot) {
        self.navigations.insert(navigation.to_string(), snapshot);
    }

    pub fn insert_if_absent(&mut self, navigation: &str, snapshot: NavigationSnapshot) -> bool {
        if self.navigations.contains_key(navigation) {
            return false;
        }
        self.navigations.insert(navigation.to_string(), snapshot);
        true
    }

    pub fn len(&self) -> usize {
        self.navigations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.navigations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::DynamicEntity;

    #[test]
    fn test_collection_diff() {
        let order = DynamicEntity::new("Order");
        let a = DynamicEntity::new("LineItem").into_ref();
        let b = DynamicEntity::new("LineItem").into_ref();
        order.add_to_collection("items", a.clone());

        let nav = Navigation::new(
            "items",
            "LineItem",
            NavigationKind::Collection,
            crate::metadata::NavigationRole::ToDependents,
        );
        let before = NavigationSnapshot::capture(&order, &nav);
        order.remove_from_collection("items", &a);
        order.add_to_collection("items", b.clone());
        let after = NavigationSnapshot::capture(&order, &nav);

        let (added, removed) = before.diff(&after);
        assert_eq!(added, vec![ObjectKey::of(&b)]);
        assert_eq!(removed, vec![ObjectKey::of(&a)]);
        assert_eq!(after.diff(&after), (vec![], vec![]));
    }

    #[test]
    fn test_missing_navigation_is_empty() {
        assert_eq!(
            NavigationSnapshot::from_value(NavigationKind::Reference, None),
            NavigationSnapshot::Reference(None)
        );
        assert!(NavigationSnapshot::empty(NavigationKind::Collection).members().is_empty());
    }

    #[test]
    fn test_insert_if_absent_keeps_first_value() {
        let mut snapshot = ValueSnapshot::new();
        assert!(snapshot.insert_if_absent("name", Value::from("x")));
        assert!(!snapshot.insert_if_absent("name", Value::from("y")));
        assert_eq!(snapshot.get("name"), Some(&Value::from("x")));
    }
}
