/// Notification tests
///
/// Objects that raise change notifications are tracked without polling.
/// Run with: cargo test --test notification_tests

mod common;

use common::*;
use memotrack::core::{Result, Value};
use memotrack::entity::{ChangeNotifier, DynamicEntity, Entity};
use memotrack::store::MemoryStore;
use memotrack::tracking::{ChangeSource, EntityState};
use memotrack::Session;
use std::sync::Arc;

fn notifying_customer(id: i64, name: &str) -> Arc<DynamicEntity> {
    Arc::new(
        DynamicEntity::notifying("Customer")
            .with_value("id", id)
            .with_value("name", name),
    )
}

#[test]
fn test_notified_change_is_recorded_without_detection() -> Result<()> {
    let model = shop_model();
    let store = Arc::new(MemoryStore::new(model.clone()));
    store.seed("Customer", row(&[("id", Value::Integer(1)), ("name", Value::from("x"))]))?;
    let mut session = Session::new(model, store.clone());

    let ann = notifying_customer(1, "x");
    session.attach(&entity_ref(&ann))?;
    assert!(!session.entry(&entity_ref(&ann)).expect("tracked").change_source().is_poll());

    ann.set("name", "y");
    let entry = session.entry(&entity_ref(&ann)).expect("tracked");
    assert_eq!(entry.state(), EntityState::Modified);
    assert!(entry.is_modified("name"));
    assert_eq!(entry.original_value("name"), Some(&Value::from("x")));

    // push entries have no property snapshot to compare against
    assert!(session.detect_changes().is_empty());

    assert_eq!(session.save_changes()?, 1);
    let saved = store.row("Customer", &[Value::Integer(1)]).expect("customer row");
    assert_eq!(saved.get("name"), Some(&Value::from("y")));
    assert_eq!(session.state_of(&entity_ref(&ann)), EntityState::Unchanged);
    Ok(())
}

#[test]
fn test_unknown_member_notifications_are_ignored() -> Result<()> {
    let model = shop_model();
    let store = Arc::new(MemoryStore::new(model.clone()));
    let mut session = Session::new(model, store);

    let ann = notifying_customer(1, "Ann");
    session.attach(&entity_ref(&ann))?;

    let notifier = ann.change_notifier().expect("notifying entity");
    notifier.notify_changing("nickname");
    notifier.notify_changed("nickname");

    assert_eq!(session.state_of(&entity_ref(&ann)), EntityState::Unchanged);
    assert!(!session.has_changes());
    Ok(())
}

#[test]
fn test_detaching_removes_subscriptions() -> Result<()> {
    let model = shop_model();
    let store = Arc::new(MemoryStore::new(model.clone()));
    let mut session = Session::new(model, store);

    let ann = notifying_customer(1, "Ann");
    session.attach(&entity_ref(&ann))?;
    let notifier = ann.change_notifier().expect("notifying entity");
    assert_eq!(notifier.subscriber_count(), 2);

    session
        .state_manager()
        .set_state(&entity_ref(&ann), EntityState::Detached)?;
    assert_eq!(notifier.subscriber_count(), 0);

    ann.set("name", "Bea");
    assert_eq!(session.state_of(&entity_ref(&ann)), EntityState::Detached);
    assert!(session.state_manager().is_empty());
    Ok(())
}

#[test]
fn test_changed_only_notifier_still_marks_modified() -> Result<()> {
    let model = shop_model();
    let store = Arc::new(MemoryStore::new(model.clone()));
    let mut session = Session::new(model, store);

    let ann = Arc::new(
        DynamicEntity::new("Customer")
            .with_notifier(ChangeNotifier::changed_only())
            .with_value("id", 1)
            .with_value("name", "Ann"),
    );
    session.attach(&entity_ref(&ann))?;
    assert_eq!(ann.change_notifier().map(|n| n.subscriber_count()), Some(1));

    ann.set("name", "Bea");
    let entry = session.entry(&entity_ref(&ann)).expect("tracked");
    assert_eq!(entry.state(), EntityState::Modified);
    assert!(entry.is_modified("name"));
    Ok(())
}

#[test]
fn test_notifying_collection_fixes_up_foreign_keys_immediately() -> Result<()> {
    let model = shop_model();
    let store = Arc::new(MemoryStore::new(model.clone()));
    let mut session = Session::new(model, store);

    let placed = Arc::new(
        DynamicEntity::notifying("Order")
            .with_notifying_collection("items")
            .with_value("id", 10),
    );
    let item = Arc::new(
        DynamicEntity::new("LineItem")
            .with_value("id", 100)
            .with_value("sku", "A"),
    );
    session.attach(&entity_ref(&placed))?;
    session.attach(&entity_ref(&item))?;
    match session.entry(&entity_ref(&placed)).expect("tracked").change_source() {
        ChangeSource::Push { polled_navigations } => assert!(polled_navigations.is_empty()),
        ChangeSource::Poll => panic!("Expected a push entry"),
    }

    placed.add_to_collection("items", entity_ref(&item));
    assert_eq!(session.state_of(&entity_ref(&item)), EntityState::Modified);
    assert_eq!(item.get("order_id"), Value::Integer(10));

    placed.remove_from_collection("items", &entity_ref(&item));
    assert_eq!(session.state_of(&entity_ref(&item)), EntityState::Modified);
    // required foreign key: removal leaves the value in place
    assert_eq!(item.get("order_id"), Value::Integer(10));
    Ok(())
}
