/// Session context tests
///
/// Model caching per context type and entity types written by hand.
/// Run with: cargo test --test session_context_tests

mod common;

use common::*;
use memotrack::core::{DataType, DbError, Result, Value};
use memotrack::entity::{ChangeNotifier, Entity};
use memotrack::metadata::{ModelBuilder, ModelCache, Property};
use memotrack::store::{DataStore, MemoryStore};
use memotrack::tracking::{EntityState, TrackingConfig};
use memotrack::{Session, SessionContext};
use std::any::TypeId;
use std::sync::{Arc, RwLock};

struct ShopContext;

impl SessionContext for ShopContext {
    fn configure_model(builder: &mut ModelBuilder) -> Result<()> {
        builder
            .entity("Customer")
            .property(Property::new("id", DataType::Integer).not_null().generated())
            .property(Property::new("name", DataType::Text).not_null())
            .key(&["id"]);
        Ok(())
    }

    fn tracking_config() -> TrackingConfig {
        TrackingConfig::new().auto_detect_changes(false)
    }
}

struct SelfReferencingContext;

impl SessionContext for SelfReferencingContext {
    fn configure_model(builder: &mut ModelBuilder) -> Result<()> {
        Session::model_for::<SelfReferencingContext>()?;
        builder
            .entity("Unreachable")
            .property(Property::new("id", DataType::Integer).not_null())
            .key(&["id"]);
        Ok(())
    }
}

#[test]
fn test_context_model_is_built_once_and_shared() -> Result<()> {
    let models: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|_| scope.spawn(Session::model_for::<ShopContext>))
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("builder thread"))
            .collect()
    });
    let models = models.into_iter().collect::<Result<Vec<_>>>()?;
    assert!(models.windows(2).all(|pair| Arc::ptr_eq(&pair[0], &pair[1])));
    assert!(ModelCache::global().contains(TypeId::of::<ShopContext>()));

    let store: Arc<dyn DataStore> = Arc::new(MemoryStore::new(models[0].clone()));
    let mut session = Session::for_context::<ShopContext>(store)?;
    assert!(Arc::ptr_eq(session.model(), &models[0]));
    assert!(!session.state_manager().config().auto_detect_changes);
    Ok(())
}

#[test]
fn test_configuration_reentering_its_own_model_fails() {
    let store: Arc<dyn DataStore> = Arc::new(MemoryStore::new(shop_model()));
    match Session::for_context::<SelfReferencingContext>(store) {
        Err(DbError::RecursiveConfiguration(msg)) => {
            assert!(msg.contains("SelfReferencingContext"));
        }
        Err(other) => panic!("Expected RecursiveConfiguration, got {:?}", other),
        Ok(_) => panic!("Expected RecursiveConfiguration, got a session"),
    }
    assert!(!ModelCache::global().contains(TypeId::of::<SelfReferencingContext>()));
}

/// Hand-written entity with a fixed key and a notifying title.
struct Book {
    isbn: String,
    title: RwLock<String>,
    notifier: ChangeNotifier,
}

impl Book {
    fn new(isbn: &str, title: &str) -> Arc<Self> {
        Arc::new(Self {
            isbn: isbn.to_string(),
            title: RwLock::new(title.to_string()),
            notifier: ChangeNotifier::new(),
        })
    }
}

impl Entity for Book {
    fn type_name(&self) -> &str {
        "Book"
    }

    fn get_value(&self, property: &str) -> Option<Value> {
        match property {
            "isbn" => Some(Value::from(self.isbn.as_str())),
            "title" => Some(Value::from(self.title.read().unwrap().clone())),
            _ => None,
        }
    }

    fn set_value(&self, property: &str, value: Value) {
        if property != "title" {
            return;
        }
        if let Value::Text(title) = value {
            self.notifier.notify_changing("title");
            *self.title.write().unwrap() = title;
            self.notifier.notify_changed("title");
        }
    }

    fn change_notifier(&self) -> Option<&ChangeNotifier> {
        Some(&self.notifier)
    }
}

struct LibraryContext;

impl SessionContext for LibraryContext {
    fn configure_model(builder: &mut ModelBuilder) -> Result<()> {
        builder
            .entity("Book")
            .property(Property::new("isbn", DataType::Text).not_null())
            .property(Property::new("title", DataType::Text).not_null())
            .key(&["isbn"]);
        Ok(())
    }
}

#[test]
fn test_hand_written_entity_round_trips_through_a_session() -> Result<()> {
    let model = Session::model_for::<LibraryContext>()?;
    let store = Arc::new(MemoryStore::new(model));
    let mut session = Session::for_context::<LibraryContext>(store.clone())?;

    let book = Book::new("978-0441013593", "Dune");
    let tracked: Arc<dyn Entity> = book.clone();
    session.add(&tracked)?;
    assert_eq!(tokio_test::block_on(session.save_changes_async())?, 1);

    book.set_value("title", Value::from("Dune Messiah"));
    assert_eq!(session.state_of(&tracked), EntityState::Modified);
    assert_eq!(session.save_changes()?, 1);

    let saved = store
        .row("Book", &[Value::from("978-0441013593")])
        .expect("book row");
    assert_eq!(saved.get("title"), Some(&Value::from("Dune Messiah")));
    assert_eq!(session.state_of(&tracked), EntityState::Unchanged);
    Ok(())
}
