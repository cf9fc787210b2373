use super::{ChangeNotifier, Entity, EntityRef, NavigationValue, ObjectKey};
use crate::core::{DbError, Result, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};

/// Schema-less entity backed by a value map.
///
/// Without a notifier it behaves like a plain object the tracker has to poll;
/// with one it raises changing/changed notifications from its setters.
pub struct DynamicEntity {
    type_name: String,
    values: RwLock<BTreeMap<String, Value>>,
    navigations: RwLock<BTreeMap<String, NavigationValue>>,
    notifier: Option<ChangeNotifier>,
    notifying_collections: BTreeSet<String>,
}

impl DynamicEntity {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            values: RwLock::new(BTreeMap::new()),
            navigations: RwLock::new(BTreeMap::new()),
            notifier: None,
            notifying_collections: BTreeSet::new(),
        }
    }

    /// Entity raising both pre- and post-change notifications.
    pub fn notifying(type_name: impl Into<String>) -> Self {
        Self::new(type_name).with_notifier(ChangeNotifier::new())
    }

    pub fn with_notifier(mut self, notifier: ChangeNotifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Initial value; does not raise notifications.
    pub fn with_value(self, name: &str, value: impl Into<Value>) -> Self {
        self.values
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(name.to_string(), value.into());
        self
    }

    /// Collection whose membership changes are reported through the notifier.
    pub fn with_notifying_collection(mut self, navigation: &str) -> Self {
        self.notifying_collections.insert(navigation.to_string());
        self
    }

    /// Builds an entity from a JSON object of scalar fields.
    pub fn from_json(type_name: &str, json: &serde_json::Value) -> Result<Self> {
        DbError::check_not_empty(type_name, "type_name")?;
        let fields = json.as_object().ok_or_else(|| {
            DbError::invalid_argument(format!("Fields of '{}' must be a JSON object", type_name))
        })?;
        let mut entity = Self::new(type_name);
        for (name, value) in fields {
            entity = entity.with_value(name, Value::from_json(value)?);
        }
        Ok(entity)
    }

    pub fn into_ref(self) -> EntityRef {
        Arc::new(self)
    }

    pub fn get(&self, name: &str) -> Value {
        self.get_value(name).unwrap_or(Value::Null)
    }

    pub fn set(&self, name: &str, value: impl Into<Value>) {
        self.set_value(name, value.into());
    }

    pub fn set_reference(&self, navigation: &str, target: Option<EntityRef>) {
        self.notify_changing(navigation);
        self.navigations
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(navigation.to_string(), NavigationValue::Reference(target));
        self.notify_changed(navigation);
    }

    pub fn reference(&self, navigation: &str) -> Option<EntityRef> {
        self.navigation(navigation)
            .and_then(|value| value.reference().cloned())
    }

    pub fn add_to_collection(&self, navigation: &str, member: EntityRef) {
        let notifies = self.collection_notifies(navigation);
        if notifies {
            self.notify_changing(navigation);
        }
        {
            let mut navigations = self
                .navigations
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let entry = navigations
                .entry(navigation.to_string())
                .or_insert_with(|| NavigationValue::Collection(Vec::new()));
            match entry {
                NavigationValue::Collection(items) => items.push(member),
                other => *other = NavigationValue::Collection(vec![member]),
            }
        }
        if notifies {
            self.notify_changed(navigation);
        }
    }

    pub fn remove_from_collection(&self, navigation: &str, member: &EntityRef) -> bool {
        let notifies = self.collection_notifies(navigation);
        if notifies {
            self.notify_changing(navigation);
        }
        let removed = {
            let mut navigations = self
                .navigations
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            match navigations.get_mut(navigation) {
                Some(NavigationValue::Collection(items)) => {
                    let key = ObjectKey::of(member);
                    let before = items.len();
                    items.retain(|item| ObjectKey::of(item) != key);
                    items.len() != before
                }
                _ => false,
            }
        };
        if notifies {
            self.notify_changed(navigation);
        }
        removed
    }

    pub fn to_json(&self) -> serde_json::Value {
        let values = self
            .values
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        serde_json::Value::Object(
            values
                .iter()
                .map(|(name, value)| (name.clone(), value.to_json()))
                .collect(),
        )
    }

    fn notify_changing(&self, member: &str) {
        if let Some(notifier) = &self.notifier {
            notifier.notify_changing(member);
        }
    }

    fn notify_changed(&self, member: &str) {
        if let Some(notifier) = &self.notifier {
            notifier.notify_changed(member);
        }
    }
}

impl Entity for DynamicEntity {
    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn get_value(&self, property: &str) -> Option<Value> {
        self.values
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(property)
            .cloned()
    }

    fn set_value(&self, property: &str, value: Value) {
        self.notify_changing(property);
        self.values
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(property.to_string(), value);
        self.notify_changed(property);
    }

    fn navigation(&self, name: &str) -> Option<NavigationValue> {
        self.navigations
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(name)
            .cloned()
    }

    fn change_notifier(&self) -> Option<&ChangeNotifier> {
        self.notifier.as_ref()
    }

    fn collection_notifies(&self, navigation: &str) -> bool {
        self.notifier.is_some() && self.notifying_collections.contains(navigation)
    }
}
