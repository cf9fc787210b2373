use super::batch::{BatchBuilder, PreparedBatch};
use super::config::TrackingConfig;
use super::detector::{ChangeDetector, DetectionReport};
use super::entry::{EntityState, Entry, EntryCheckpoint, EntryId};
use super::notifier::EntryNotifier;
use super::registry::Registry;
use super::signal::ChangeSignal;
use super::subscriber::ChangeSubscriber;
use crate::core::{DbError, Result};
use crate::entity::EntityRef;
use crate::metadata::Model;
use crate::store::{DataStore, StoreOutcome};
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Level, event, info_span};

/// Owns the identity map of one unit of work and drives the save pipeline.
///
/// Mutating operations take `&mut self`: one manager is used by one owner at
/// a time, while independent managers share nothing but the model.
/// Notifications raised by tracked objects are queued and applied at the
/// start of every operation that reads tracking state.
pub struct StateManager {
    model: Arc<Model>,
    config: TrackingConfig,
    registry: Registry,
    subscriber: ChangeSubscriber,
    signals: UnboundedReceiver<ChangeSignal>,
    last_detection: Option<DetectionReport>,
}

impl StateManager {
    pub fn new(model: Arc<Model>, config: TrackingConfig) -> Self {
        let (sender, signals) = mpsc::unbounded_channel();
        let subscriber = ChangeSubscriber::new(sender, config.force_eager_snapshots);
        Self {
            model,
            config,
            registry: Registry::new(),
            subscriber,
            signals,
            last_detection: None,
        }
    }

    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    pub fn config(&self) -> &TrackingConfig {
        &self.config
    }

    /// Number of entries in the identity map, `Detached` ones included.
    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    /// Existing entry for this object, or a new subscribed one in `Detached`.
    pub fn get_or_create_entry(&mut self, entity: &EntityRef) -> Result<&Entry> {
        let id = self.get_or_create_id(entity)?;
        self.registry
            .get(id)
            .ok_or_else(|| DbError::invalid_argument(format!("Entry {} is no longer tracked", id)))
    }

    pub fn entry(&mut self, entity: &EntityRef) -> Option<&Entry> {
        self.drain_signals();
        let id = self.registry.lookup(entity)?;
        self.registry.get(id)
    }

    pub fn entry_by_id(&mut self, id: EntryId) -> Option<&Entry> {
        self.drain_signals();
        self.registry.get(id)
    }

    /// All entries in entry-id order.
    pub fn entries(&mut self) -> Vec<&Entry> {
        self.drain_signals();
        self.registry.iter().collect()
    }

    pub fn state_of(&mut self, entity: &EntityRef) -> EntityState {
        self.entry(entity)
            .map(Entry::state)
            .unwrap_or(EntityState::Detached)
    }

    /// True when a save would write something, after detecting changes if enabled.
    pub fn has_changes(&mut self) -> bool {
        self.drain_signals();
        if self.config.auto_detect_changes {
            self.detect_changes();
        }
        self.registry.iter().any(|e| e.state().is_pending())
    }

    pub fn set_state(&mut self, entity: &EntityRef, state: EntityState) -> Result<()> {
        let id = self.get_or_create_id(entity)?;
        self.set_entry_state(id, state);
        Ok(())
    }

    pub fn detect_changes(&mut self) -> DetectionReport {
        self.drain_signals();
        let report = {
            let mut notifier = EntryNotifier::new(&self.model, &mut self.registry, &self.config);
            ChangeDetector::detect_changes(&mut notifier)
        };
        self.last_detection = Some(report.clone());
        report
    }

    /// Report of the most recent detection run.
    pub fn last_detection(&self) -> Option<&DetectionReport> {
        self.last_detection.as_ref()
    }

    pub fn save_changes(&mut self, store: &dyn DataStore) -> Result<usize> {
        let span = info_span!("tracking.save_changes", mode = "sync", tracked = self.registry.len());
        let _enter = span.enter();

        self.drain_signals();
        let checkpoint = self.registry.checkpoint();
        let prepared = match self.prepare_save() {
            Ok(prepared) => prepared,
            Err(err) => return Err(self.rollback(checkpoint, err)),
        };
        if prepared.is_empty() {
            event!(Level::DEBUG, "no changes to save");
            return Ok(0);
        }
        match store.execute(&prepared.batch) {
            Ok(outcome) => Ok(self.accept(&prepared, &outcome)),
            Err(err) => Err(self.rollback(checkpoint, save_failed(&prepared, err))),
        }
    }

    pub async fn save_changes_async(&mut self, store: &dyn DataStore) -> Result<usize> {
        self.save_changes_with_cancellation(store, &CancellationToken::new())
            .await
    }

    /// Cancellation is honoured up to the moment the batch is handed to the
    /// store; once submitted, the save runs to completion.
    pub async fn save_changes_with_cancellation(
        &mut self,
        store: &dyn DataStore,
        token: &CancellationToken,
    ) -> Result<usize> {
        let span = info_span!("tracking.save_changes", mode = "async", tracked = self.registry.len());
        self.save_async(store, token).instrument(span).await
    }

    async fn save_async(&mut self, store: &dyn DataStore, token: &CancellationToken) -> Result<usize> {
        ensure_not_cancelled(token, "before change detection")?;
        self.drain_signals();
        let checkpoint = self.registry.checkpoint();
        let prepared = match self.prepare_save() {
            Ok(prepared) => prepared,
            Err(err) => return Err(self.rollback(checkpoint, err)),
        };
        if let Err(err) = ensure_not_cancelled(token, "after the write batch was assembled") {
            return Err(self.rollback(checkpoint, err));
        }
        if prepared.is_empty() {
            event!(Level::DEBUG, "no changes to save");
            return Ok(0);
        }

        if let Err(err) = ensure_not_cancelled(token, "before the write batch was submitted") {
            return Err(self.rollback(checkpoint, err));
        }
        match store.execute_async(&prepared.batch).await {
            Ok(outcome) => Ok(self.accept(&prepared, &outcome)),
            Err(err) => Err(self.rollback(checkpoint, save_failed(&prepared, err))),
        }
    }

    /// Puts states and snapshots back as they were when the save began, so a
    /// retry sees the same pending work.
    fn rollback(&mut self, checkpoint: Vec<EntryCheckpoint>, err: DbError) -> DbError {
        event!(Level::DEBUG, entries = checkpoint.len(), error = %err, "restoring tracking state after failed save");
        self.registry.restore(checkpoint);
        err
    }

    fn prepare_save(&mut self) -> Result<PreparedBatch> {
        if self.config.auto_detect_changes {
            self.detect_changes();
        }
        BatchBuilder::new(&self.model, &self.registry).build()
    }

    /// Applies a committed batch: absorbs store-generated values, then moves
    /// every written entry to its post-save state.
    fn accept(&mut self, prepared: &PreparedBatch, outcome: &StoreOutcome) -> usize {
        let mut absorbed: Vec<(EntryId, String)> = Vec::new();
        for (index, id) in prepared.entries.iter().enumerate() {
            let (Some(result), Some(entry)) = (outcome.results.get(index), self.registry.get(*id)) else {
                continue;
            };
            if entry.state() == EntityState::Deleted {
                continue;
            }
            for (property, value) in &result.generated_values {
                if entry.set_current_value(property, value.clone()) {
                    absorbed.push((*id, property.clone()));
                }
            }
        }
        {
            let mut notifier = EntryNotifier::new(&self.model, &mut self.registry, &self.config);
            for (id, property) in &absorbed {
                notifier.property_changed(*id, property);
            }
        }
        self.drain_signals();

        for id in &prepared.entries {
            let Some(state) = self.registry.get(*id).map(Entry::state) else {
                continue;
            };
            match state {
                EntityState::Deleted => self.detach(*id),
                EntityState::Added | EntityState::Modified => {
                    if let Some(entry) = self.registry.get_mut(*id) {
                        entry.state = EntityState::Unchanged;
                        entry.accept_current_values();
                    }
                }
                _ => {}
            }
        }

        event!(
            Level::DEBUG,
            written = prepared.len(),
            generated = absorbed.len(),
            "changes saved"
        );
        prepared.len()
    }

    fn get_or_create_id(&mut self, entity: &EntityRef) -> Result<EntryId> {
        self.drain_signals();
        if let Some(id) = self.registry.lookup(entity) {
            return Ok(id);
        }

        let type_name = entity.type_name();
        DbError::check_not_empty(type_name, "entityType")?;
        let entity_type = self.model.entity_type(type_name).cloned().ok_or_else(|| {
            DbError::InvalidArgument(format!(
                "The entity type '{}' was not found. Ensure that the entity type has been added to the model.",
                type_name
            ))
        })?;

        let id = self.registry.next_id();
        let source = self.subscriber.change_source(entity.as_ref(), &entity_type);
        let mut entry = Entry::new(id, entity, entity_type, source);
        self.subscriber.snapshot_and_subscribe(&mut entry, entity);
        event!(
            Level::DEBUG,
            entry = %id,
            entity_type = %type_name,
            poll = entry.change_source().is_poll(),
            "tracking started"
        );
        self.registry.insert(entry);
        Ok(id)
    }

    fn set_entry_state(&mut self, id: EntryId, new_state: EntityState) {
        let Some(entry) = self.registry.get_mut(id) else {
            return;
        };
        let old_state = entry.state;
        if old_state == new_state && new_state != EntityState::Modified {
            return;
        }
        if new_state == EntityState::Detached
            || (old_state == EntityState::Added && new_state == EntityState::Deleted)
        {
            self.detach(id);
            return;
        }

        let entity = entry.entity();
        if let Some(entity) = &entity {
            if old_state == EntityState::Detached || new_state == EntityState::Unchanged {
                self.subscriber.snapshot(entry, entity.as_ref());
            }
        }
        if new_state.is_stored() && matches!(old_state, EntityState::Detached | EntityState::Added) {
            entry.capture_stored_values();
        }
        if new_state == EntityState::Added {
            entry.stored_values = None;
        }

        entry.state = new_state;
        if new_state == EntityState::Modified {
            entry.mark_all_modified();
        } else {
            entry.modified.clear();
        }
        event!(Level::DEBUG, entry = %id, from = %old_state, to = %new_state, "entity state changed");
    }

    fn detach(&mut self, id: EntryId) {
        if let Some(mut entry) = self.registry.remove(id) {
            entry.unsubscribe();
            event!(Level::DEBUG, entry = %id, entity_type = %entry.entity_type().name(), "tracking stopped");
        }
    }

    fn drain_signals(&mut self) {
        let mut notifier = EntryNotifier::new(&self.model, &mut self.registry, &self.config);
        while let Ok(signal) = self.signals.try_recv() {
            notifier.dispatch(signal);
        }
    }
}

fn ensure_not_cancelled(token: &CancellationToken, stage: &str) -> Result<()> {
    if token.is_cancelled() {
        event!(Level::DEBUG, stage, "save cancelled");
        return Err(DbError::Cancelled(format!("Saving changes was cancelled {}", stage)));
    }
    Ok(())
}

/// Attaches the failing command's entity type and operation to a store error.
fn save_failed(prepared: &PreparedBatch, err: DbError) -> DbError {
    let index = match &err {
        DbError::CommandFailed { index, .. } => *index,
        _ => 0,
    };
    match prepared.batch.commands().get(index) {
        Some(command) => DbError::SaveFailed {
            operation: command.operation,
            entity_type: command.entity_type.clone(),
            source: Box::new(err),
        },
        None => err,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{DataType, Value};
    use crate::entity::{DynamicEntity, Entity};
    use crate::metadata::Property;
    use crate::store::{EntityOperation, WriteBatch};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn model() -> Arc<Model> {
        let mut builder = Model::builder();
        builder
            .entity("Customer")
            .property(Property::new("id", DataType::Integer).not_null())
            .property(Property::new("name", DataType::Text))
            .property(Property::new("email", DataType::Text))
            .key(&["id"]);
        Arc::new(builder.build().unwrap())
    }

    struct RejectingStore {
        calls: AtomicUsize,
    }

    impl DataStore for RejectingStore {
        fn execute(&self, _batch: &WriteBatch) -> Result<StoreOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(DbError::CommandFailed {
                index: 0,
                source: Box::new(DbError::ConstraintViolation("duplicate key".into())),
            })
        }
    }

    fn customer(id: i64, name: &str) -> EntityRef {
        DynamicEntity::new("Customer")
            .with_value("id", id)
            .with_value("name", name)
            .into_ref()
    }

    #[test]
    fn test_identity_map_returns_the_same_entry() {
        let mut manager = StateManager::new(model(), TrackingConfig::default());
        let ann = customer(1, "Ann");
        let twin = customer(1, "Ann");

        let first = manager.get_or_create_entry(&ann).unwrap().id();
        let again = manager.get_or_create_entry(&ann).unwrap().id();
        let other = manager.get_or_create_entry(&twin).unwrap().id();

        assert_eq!(first, again);
        assert_ne!(first, other);
        assert_eq!(manager.get_or_create_entry(&ann).unwrap().state(), EntityState::Detached);
    }

    #[test]
    fn test_unknown_and_empty_types_are_rejected() {
        let mut manager = StateManager::new(model(), TrackingConfig::default());
        let unknown = DynamicEntity::new("Invoice").into_ref();
        let unnamed = DynamicEntity::new("").into_ref();

        assert!(matches!(
            manager.get_or_create_entry(&unknown),
            Err(DbError::InvalidArgument(_))
        ));
        let err = manager.set_state(&unnamed, EntityState::Added).unwrap_err();
        assert!(err.to_string().contains("'entityType' cannot be empty"));
        assert!(manager.is_empty());
    }

    #[test]
    fn test_state_transition_rules() {
        let mut manager = StateManager::new(model(), TrackingConfig::default());
        let ann = customer(1, "Ann");

        manager.set_state(&ann, EntityState::Added).unwrap();
        manager.set_state(&ann, EntityState::Deleted).unwrap();
        assert_eq!(manager.state_of(&ann), EntityState::Detached);
        assert!(manager.is_empty());

        manager.set_state(&ann, EntityState::Modified).unwrap();
        let entry = manager.entry(&ann).unwrap();
        assert_eq!(entry.modified_properties().collect::<Vec<_>>(), vec!["email", "name"]);
        assert_eq!(entry.stored_value("name"), Some(&Value::from("Ann")));

        manager.set_state(&ann, EntityState::Unchanged).unwrap();
        assert_eq!(manager.entry(&ann).unwrap().modified_properties().count(), 0);

        manager.set_state(&ann, EntityState::Detached).unwrap();
        assert!(manager.entry(&ann).is_none());
    }

    #[test]
    fn test_push_notifications_apply_without_detection() {
        let mut manager = StateManager::new(model(), TrackingConfig::new().auto_detect_changes(false));
        let ann = DynamicEntity::notifying("Customer")
            .with_value("id", 1)
            .with_value("name", "Ann")
            .into_ref();
        manager.set_state(&ann, EntityState::Unchanged).unwrap();

        ann.set_value("name", Value::from("Bea"));
        ann.set_value("Nickname", Value::from("B"));

        let entry = manager.entry(&ann).unwrap();
        assert_eq!(entry.state(), EntityState::Modified);
        assert!(entry.is_modified("name"));
        assert_eq!(entry.original_value("name"), Some(&Value::from("Ann")));
        assert!(manager.last_detection().is_none());
    }

    #[test]
    fn test_detaching_unsubscribes() {
        let mut manager = StateManager::new(model(), TrackingConfig::default());
        let ann = DynamicEntity::notifying("Customer").with_value("id", 1).into_ref();
        manager.set_state(&ann, EntityState::Unchanged).unwrap();
        assert_eq!(ann.change_notifier().unwrap().subscriber_count(), 2);

        manager.set_state(&ann, EntityState::Detached).unwrap();
        assert_eq!(ann.change_notifier().unwrap().subscriber_count(), 0);
    }

    #[test]
    fn test_store_failure_is_wrapped_and_leaves_state_alone() {
        let mut manager = StateManager::new(model(), TrackingConfig::default());
        let ann = customer(1, "Ann");
        manager.set_state(&ann, EntityState::Added).unwrap();
        let store = RejectingStore {
            calls: AtomicUsize::new(0),
        };

        let err = manager.save_changes(&store).unwrap_err();
        match &err {
            DbError::SaveFailed {
                operation,
                entity_type,
                source,
            } => {
                assert_eq!(*operation, EntityOperation::Insert);
                assert_eq!(entity_type, "Customer");
                assert!(matches!(**source, DbError::CommandFailed { index: 0, .. }));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
        assert_eq!(manager.state_of(&ann), EntityState::Added);
    }

    #[test]
    fn test_store_failure_restores_detected_changes() {
        let mut manager = StateManager::new(model(), TrackingConfig::default());
        let ann = customer(1, "Ann");
        manager.set_state(&ann, EntityState::Unchanged).unwrap();
        ann.set_value("name", Value::from("Bea"));
        let store = RejectingStore {
            calls: AtomicUsize::new(0),
        };

        let err = manager.save_changes(&store).unwrap_err();
        assert!(matches!(err, DbError::SaveFailed { .. }));
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);

        let entry = manager.entry(&ann).unwrap();
        assert_eq!(entry.state(), EntityState::Unchanged);
        assert!(!entry.is_modified("name"));
        assert_eq!(entry.original_value("name"), Some(&Value::from("Ann")));

        // the edit is found again on the next attempt
        let report = manager.detect_changes();
        assert!(report.contains("Customer", "name"));
        assert_eq!(manager.state_of(&ann), EntityState::Modified);
    }

    #[tokio::test]
    async fn test_cancelled_token_stops_before_detection() {
        let mut manager = StateManager::new(model(), TrackingConfig::default());
        let ann = customer(1, "Ann");
        manager.set_state(&ann, EntityState::Unchanged).unwrap();
        ann.set_value("name", Value::from("Bea"));
        let store = RejectingStore {
            calls: AtomicUsize::new(0),
        };

        let token = CancellationToken::new();
        token.cancel();
        let err = manager
            .save_changes_with_cancellation(&store, &token)
            .await
            .unwrap_err();

        assert!(matches!(err, DbError::Cancelled(_)));
        assert_eq!(store.calls.load(Ordering::SeqCst), 0);
        assert!(manager.last_detection().is_none());
        assert_eq!(manager.state_of(&ann), EntityState::Unchanged);
    }
}
