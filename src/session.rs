use crate::core::{DbError, Result};
use crate::entity::EntityRef;
use crate::metadata::{Model, ModelBuilder, ModelCache};
use crate::store::DataStore;
use crate::tracking::{DetectionReport, EntityState, Entry, StateManager, TrackingConfig};
use std::any::{TypeId, type_name};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{Level, event};

/// Type whose model is configured once per process and shared by every
/// session created for it.
pub trait SessionContext: 'static {
    fn configure_model(builder: &mut ModelBuilder) -> Result<()>;

    fn tracking_config() -> TrackingConfig {
        TrackingConfig::default()
    }
}

/// Unit of work over one data store.
///
/// ```ignore
/// let mut session = Session::for_context::<ShopContext>(store)?;
/// session.add(&order)?;
/// session.save_changes()?;
/// ```
pub struct Session {
    manager: StateManager,
    store: Arc<dyn DataStore>,
}

impl Session {
    pub fn new(model: Arc<Model>, store: Arc<dyn DataStore>) -> Self {
        Self::with_config(model, store, TrackingConfig::default())
    }

    pub fn with_config(model: Arc<Model>, store: Arc<dyn DataStore>, config: TrackingConfig) -> Self {
        Self {
            manager: StateManager::new(model, config),
            store,
        }
    }

    /// Session over the cached model of `C`, building it on first use.
    pub fn for_context<C: SessionContext>(store: Arc<dyn DataStore>) -> Result<Self> {
        let model = Self::model_for::<C>()?;
        Ok(Self::with_config(model, store, C::tracking_config()))
    }

    pub fn model_for<C: SessionContext>() -> Result<Arc<Model>> {
        ModelCache::global().get_or_build(TypeId::of::<C>(), type_name::<C>(), || {
            let mut builder = Model::builder();
            C::configure_model(&mut builder)?;
            builder.build()
        })
    }

    pub fn model(&self) -> &Arc<Model> {
        self.manager.model()
    }

    pub fn store(&self) -> &Arc<dyn DataStore> {
        &self.store
    }

    pub fn state_manager(&mut self) -> &mut StateManager {
        &mut self.manager
    }

    /// Begins tracking `entity` as a new row.
    pub fn add(&mut self, entity: &EntityRef) -> Result<()> {
        self.manager.set_state(entity, EntityState::Added)
    }

    pub fn add_range(&mut self, entities: &[EntityRef]) -> Result<()> {
        for entity in entities {
            self.add(entity)?;
        }
        Ok(())
    }

    /// Begins tracking `entity` as an existing, unmodified row.
    pub fn attach(&mut self, entity: &EntityRef) -> Result<()> {
        self.manager.set_state(entity, EntityState::Unchanged)
    }

    pub fn attach_range(&mut self, entities: &[EntityRef]) -> Result<()> {
        for entity in entities {
            self.attach(entity)?;
        }
        Ok(())
    }

    /// Marks every non-key property of `entity` for update.
    pub fn update(&mut self, entity: &EntityRef) -> Result<()> {
        self.manager.set_state(entity, EntityState::Modified)
    }

    pub fn update_range(&mut self, entities: &[EntityRef]) -> Result<()> {
        for entity in entities {
            self.update(entity)?;
        }
        Ok(())
    }

    /// Schedules `entity` for deletion; an entity that was only added is
    /// simply no longer tracked.
    pub fn remove(&mut self, entity: &EntityRef) -> Result<()> {
        self.manager.set_state(entity, EntityState::Deleted)
    }

    pub fn remove_range(&mut self, entities: &[EntityRef]) -> Result<()> {
        for entity in entities {
            self.remove(entity)?;
        }
        Ok(())
    }

    pub fn entry(&mut self, entity: &EntityRef) -> Option<&Entry> {
        self.manager.entry(entity)
    }

    pub fn state_of(&mut self, entity: &EntityRef) -> EntityState {
        self.manager.state_of(entity)
    }

    pub fn has_changes(&mut self) -> bool {
        self.manager.has_changes()
    }

    pub fn detect_changes(&mut self) -> DetectionReport {
        self.manager.detect_changes()
    }

    pub fn save_changes(&mut self) -> Result<usize> {
        self.manager
            .save_changes(self.store.as_ref())
            .inspect_err(log_save_error)
    }

    pub async fn save_changes_async(&mut self) -> Result<usize> {
        self.manager
            .save_changes_async(self.store.as_ref())
            .await
            .inspect_err(log_save_error)
    }

    pub async fn save_changes_with_cancellation(&mut self, token: &CancellationToken) -> Result<usize> {
        self.manager
            .save_changes_with_cancellation(self.store.as_ref(), token)
            .await
            .inspect_err(log_save_error)
    }
}

fn log_save_error(err: &DbError) {
    match err {
        DbError::SaveFailed {
            operation,
            entity_type,
            source,
        } => {
            event!(
                Level::ERROR,
                operation = %operation,
                entity_type = %entity_type,
                error = %source,
                "saving changes failed"
            );
        }
        other => {
            event!(Level::ERROR, error = %other, "saving changes failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::DataType;
    use crate::entity::DynamicEntity;
    use crate::metadata::Property;
    use crate::store::MemoryStore;

    struct LibraryContext;

    impl SessionContext for LibraryContext {
        fn configure_model(builder: &mut ModelBuilder) -> Result<()> {
            builder
                .entity("Book")
                .property(Property::new("id", DataType::Integer).not_null().generated())
                .property(Property::new("title", DataType::Text).not_null())
                .key(&["id"]);
            Ok(())
        }
    }

    #[test]
    fn test_sessions_share_the_context_model() {
        let model = Session::model_for::<LibraryContext>().unwrap();
        let store: Arc<dyn DataStore> = Arc::new(MemoryStore::new(model.clone()));
        let first = Session::for_context::<LibraryContext>(store.clone()).unwrap();
        let second = Session::for_context::<LibraryContext>(store).unwrap();
        assert!(Arc::ptr_eq(first.model(), second.model()));
    }

    #[test]
    fn test_add_then_remove_forgets_the_entity() {
        let model = Session::model_for::<LibraryContext>().unwrap();
        let store = Arc::new(MemoryStore::new(model.clone()));
        let mut session = Session::new(model, store.clone());
        let book = DynamicEntity::new("Book").with_value("title", "Dune").into_ref();

        session.add(&book).unwrap();
        assert_eq!(session.state_of(&book), EntityState::Added);
        session.remove(&book).unwrap();
        assert_eq!(session.state_of(&book), EntityState::Detached);

        assert_eq!(session.save_changes().unwrap(), 0);
        assert_eq!(store.batches_executed(), 0);
    }

    fn book(id: i64, title: &str) -> EntityRef {
        DynamicEntity::new("Book")
            .with_value("id", id)
            .with_value("title", title)
            .into_ref()
    }

    #[test]
    fn test_range_operations_apply_to_every_entity() {
        let model = Session::model_for::<LibraryContext>().unwrap();
        let store = Arc::new(MemoryStore::new(model.clone()));
        let mut session = Session::new(model, store);
        let books = vec![book(1, "Dune"), book(2, "Emma"), book(3, "Ulysses")];

        session.attach_range(&books).unwrap();
        assert!(books.iter().all(|b| session.state_of(b) == EntityState::Unchanged));
        assert!(!session.has_changes());

        session.update_range(&books[..2]).unwrap();
        assert_eq!(session.state_of(&books[0]), EntityState::Modified);
        assert_eq!(session.state_of(&books[1]), EntityState::Modified);
        assert_eq!(session.state_of(&books[2]), EntityState::Unchanged);
        assert!(session.entry(&books[0]).unwrap().is_modified("title"));

        session.remove_range(&books[1..]).unwrap();
        assert_eq!(session.state_of(&books[0]), EntityState::Modified);
        assert_eq!(session.state_of(&books[1]), EntityState::Deleted);
        assert_eq!(session.state_of(&books[2]), EntityState::Deleted);
    }

    #[test]
    fn test_range_stops_at_the_first_rejected_entity() {
        let model = Session::model_for::<LibraryContext>().unwrap();
        let store = Arc::new(MemoryStore::new(model.clone()));
        let mut session = Session::new(model, store);
        let dune = book(1, "Dune");
        let stray = DynamicEntity::new("Magazine").into_ref();
        let emma = book(2, "Emma");

        let err = session
            .attach_range(&[dune.clone(), stray, emma.clone()])
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidArgument(_)));
        assert_eq!(session.state_of(&dune), EntityState::Unchanged);
        assert_eq!(session.state_of(&emma), EntityState::Detached);
    }

    #[test]
    fn test_save_assigns_generated_key() {
        let model = Session::model_for::<LibraryContext>().unwrap();
        let store = Arc::new(MemoryStore::new(model.clone()));
        let mut session = Session::new(model, store.clone());
        let book = DynamicEntity::new("Book").with_value("title", "Dune").into_ref();

        session.add(&book).unwrap();
        assert!(session.has_changes());
        assert_eq!(session.save_changes().unwrap(), 1);

        let entry = session.entry(&book).unwrap();
        assert_eq!(entry.state(), EntityState::Unchanged);
        assert!(!entry.current_value("id").is_null());
        assert_eq!(store.row_count("Book"), 1);
        assert!(!session.has_changes());
    }
}
