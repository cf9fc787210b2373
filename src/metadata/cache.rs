use super::model::Model;
use crate::core::{DbError, Result};
use lazy_static::lazy_static;
use std::any::TypeId;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use tracing::{Level, event};

lazy_static! {
    static ref GLOBAL_MODEL_CACHE: ModelCache = ModelCache::new();
}

/// Memoized mapping from a context type to its built model.
///
/// Each key is built at most once per successful build and the result is shared
/// read-only afterwards. A build that re-enters the cache for its own key on the
/// same thread is reported as recursive configuration instead of deadlocking.
pub struct ModelCache {
    models: Mutex<HashMap<TypeId, Arc<Model>>>,
    building: Mutex<HashSet<(TypeId, ThreadId)>>,
}

impl Default for ModelCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelCache {
    pub fn new() -> Self {
        Self {
            models: Mutex::new(HashMap::new()),
            building: Mutex::new(HashSet::new()),
        }
    }

    pub fn global() -> &'static ModelCache {
        &GLOBAL_MODEL_CACHE
    }

    pub fn get_or_build<F>(&self, key: TypeId, label: &str, build: F) -> Result<Arc<Model>>
    where
        F: FnOnce() -> Result<Model>,
    {
        if let Some(model) = self.models.lock()?.get(&key) {
            return Ok(model.clone());
        }

        let marker = (key, thread::current().id());
        if !self.building.lock()?.insert(marker) {
            return Err(DbError::RecursiveConfiguration(format!(
                "An attempt was made to use the model of '{}' while it is being configured",
                label
            )));
        }

        event!(Level::DEBUG, context = %label, "building model");
        let built = build();
        self.building.lock()?.remove(&marker);
        let model = Arc::new(built?);

        // Another thread may have finished first; keep the first model.
        let mut models = self.models.lock()?;
        Ok(models.entry(key).or_insert(model).clone())
    }

    pub fn contains(&self, key: TypeId) -> bool {
        self.models
            .lock()
            .map(|models| models.contains_key(&key))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.models.lock().map(|models| models.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::DataType;
    use crate::metadata::Property;

    struct ShopContext;
    struct OtherContext;

    fn shop_model() -> Result<Model> {
        let mut builder = Model::builder();
        builder
            .entity("Order")
            .property(Property::new("id", DataType::Integer))
            .key(&["id"]);
        builder.build()
    }

    #[test]
    fn test_model_is_built_once() {
        let cache = ModelCache::new();
        let mut builds = 0;
        let first = cache
            .get_or_build(TypeId::of::<ShopContext>(), "ShopContext", || {
                builds += 1;
                shop_model()
            })
            .unwrap();
        let second = cache
            .get_or_build(TypeId::of::<ShopContext>(), "ShopContext", || {
                panic!("model must come from the cache")
            })
            .unwrap();
        assert_eq!(builds, 1);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_reentrant_build_is_rejected() {
        let cache = ModelCache::new();
        let err = cache
            .get_or_build(TypeId::of::<ShopContext>(), "ShopContext", || {
                cache.get_or_build(TypeId::of::<ShopContext>(), "ShopContext", shop_model)?;
                shop_model()
            })
            .unwrap_err();
        assert!(matches!(err, DbError::RecursiveConfiguration(_)));
        assert!(!cache.contains(TypeId::of::<ShopContext>()));

        // nested builds of a different key are fine
        let model = cache
            .get_or_build(TypeId::of::<ShopContext>(), "ShopContext", || {
                cache.get_or_build(TypeId::of::<OtherContext>(), "OtherContext", shop_model)?;
                shop_model()
            })
            .unwrap();
        assert!(model.entity_type("Order").is_some());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_failed_build_is_not_cached() {
        let cache = ModelCache::new();
        let err = cache.get_or_build(TypeId::of::<ShopContext>(), "ShopContext", || {
            let mut builder = Model::builder();
            builder.annotation("", "x");
            builder.build()
        });
        assert!(err.is_err());
        assert!(cache.is_empty());
    }
}
