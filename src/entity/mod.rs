// ============================================================================
// Tracked Objects
// ============================================================================
//
// The tracker sees user objects only through the `Entity` trait: named scalar
// values, named navigations, and an optional notification hub. Objects are
// shared (`Arc`) and use interior mutability, so the tracker can read and
// fix up values without owning them.
//
// ============================================================================

pub mod dynamic;
pub mod notification;

pub use dynamic::DynamicEntity;
pub use notification::{ChangeNotifier, MemberHandler, SubscriptionId};

use crate::core::Value;
use std::fmt;
use std::sync::{Arc, Weak};

pub trait Entity: Send + Sync + 'static {
    /// Stable name of the object's entity type in the model.
    fn type_name(&self) -> &str;

    /// Current value of a scalar property; `None` when the object has no such member.
    fn get_value(&self, property: &str) -> Option<Value>;

    /// Writes a scalar property the way a user setter would, raising
    /// notifications if the object supports them.
    fn set_value(&self, property: &str, value: Value);

    /// Current value of a navigation; `None` when the object has no such member.
    fn navigation(&self, _name: &str) -> Option<NavigationValue> {
        None
    }

    fn change_notifier(&self) -> Option<&ChangeNotifier> {
        None
    }

    /// Whether membership changes of a collection navigation are reported
    /// through the change notifier.
    fn collection_notifies(&self, _navigation: &str) -> bool {
        false
    }
}

pub type EntityRef = Arc<dyn Entity>;

impl fmt::Debug for dyn Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Entity({})", self.type_name())
    }
}

/// Reference identity of a tracked object.
///
/// Derived from the allocation address, which stays reserved while the
/// tracker holds a `Weak` to it, so keys are never reused for live entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey(usize);

impl ObjectKey {
    pub fn of(entity: &EntityRef) -> Self {
        Self(Arc::as_ptr(entity) as *const () as usize)
    }

    pub fn of_weak(entity: &Weak<dyn Entity>) -> Self {
        Self(Weak::as_ptr(entity) as *const () as usize)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj_{:x}", self.0)
    }
}

#[derive(Debug, Clone)]
pub enum NavigationValue {
    Reference(Option<EntityRef>),
    Collection(Vec<EntityRef>),
}

impl NavigationValue {
    pub fn members(&self) -> Vec<&EntityRef> {
        match self {
            Self::Reference(target) => target.iter().collect(),
            Self::Collection(items) => items.iter().collect(),
        }
    }

    pub fn reference(&self) -> Option<&EntityRef> {
        match self {
            Self::Reference(target) => target.as_ref(),
            Self::Collection(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_key_is_reference_identity() {
        let a: EntityRef = DynamicEntity::new("Order").with_value("id", 1).into_ref();
        let b: EntityRef = DynamicEntity::new("Order").with_value("id", 1).into_ref();
        let a_again = a.clone();

        assert_eq!(ObjectKey::of(&a), ObjectKey::of(&a_again));
        assert_ne!(ObjectKey::of(&a), ObjectKey::of(&b));
        assert_eq!(ObjectKey::of(&a), ObjectKey::of_weak(&Arc::downgrade(&a)));
    }
}
