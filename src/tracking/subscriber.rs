use super::entry::{ChangeSource, Entry, EntryId};
use super::signal::ChangeSignal;
use super::snapshot::{NavigationSnapshot, RelationshipSnapshot, ValueSnapshot};
use crate::core::Value;
use crate::entity::{Entity, EntityRef, MemberHandler};
use crate::metadata::{EntityType, Member};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc::UnboundedSender;

/// Sets up an entry's baseline and wires the object's notifications into the
/// owning state manager's signal channel.
pub struct ChangeSubscriber {
    sender: UnboundedSender<ChangeSignal>,
    force_eager_snapshots: bool,
}

impl ChangeSubscriber {
    pub fn new(sender: UnboundedSender<ChangeSignal>, force_eager_snapshots: bool) -> Self {
        Self {
            sender,
            force_eager_snapshots,
        }
    }

    pub fn change_source(&self, entity: &dyn Entity, entity_type: &EntityType) -> ChangeSource {
        let notifies = entity
            .change_notifier()
            .is_some_and(|notifier| notifier.supports_changed());
        if entity_type.uses_eager_snapshots() || self.force_eager_snapshots || !notifies {
            return ChangeSource::Poll;
        }

        let polled_navigations = entity_type
            .navigations()
            .iter()
            .filter(|nav| nav.is_collection() && !entity.collection_notifies(nav.name()))
            .map(|nav| nav.name().to_string())
            .collect();
        ChangeSource::Push { polled_navigations }
    }

    /// Never fails: objects without notifications are simply polled.
    pub fn snapshot_and_subscribe(&self, entry: &mut Entry, entity: &EntityRef) {
        self.snapshot(entry, entity.as_ref());
        if entry.change_source().is_poll() {
            return;
        }
        let Some(notifier) = entity.change_notifier() else {
            return;
        };

        let changing = self.changing_handler(entry.id(), entry.entity_type().clone(), entity);
        if let Some(id) = notifier.subscribe_changing(changing) {
            entry.subscriptions.push(id);
        }
        let changed = self.changed_handler(entry.id(), entry.entity_type().clone());
        if let Some(id) = notifier.subscribe_changed(changed) {
            entry.subscriptions.push(id);
        }
    }

    /// Captures the baseline the entry's change source needs.
    pub fn snapshot(&self, entry: &mut Entry, entity: &dyn Entity) {
        let entity_type = entry.entity_type().clone();
        match &entry.change_source {
            ChangeSource::Poll => {
                entry.original_values = ValueSnapshot::capture(entity, &entity_type);
                entry.relationships =
                    RelationshipSnapshot::capture(entity, entity_type.navigations());
            }
            ChangeSource::Push { polled_navigations } => {
                let polled = entity_type
                    .navigations()
                    .iter()
                    .filter(|nav| polled_navigations.iter().any(|name| name == nav.name()));
                entry.original_values = ValueSnapshot::new();
                entry.relationships = RelationshipSnapshot::capture(entity, polled);
            }
        }
    }

    fn changing_handler(
        &self,
        entry: EntryId,
        entity_type: Arc<EntityType>,
        entity: &EntityRef,
    ) -> MemberHandler {
        let sender = self.sender.clone();
        let object: Weak<dyn Entity> = Arc::downgrade(entity);
        Arc::new(move |member: &str| {
            let Some(entity) = object.upgrade() else {
                return;
            };
            let signal = match entity_type.find_member(member) {
                Some(Member::Property(property)) => ChangeSignal::PropertyChanging {
                    entry,
                    property: property.name().to_string(),
                    old: entity.get_value(property.name()).unwrap_or(Value::Null),
                },
                Some(Member::Navigation(navigation)) => ChangeSignal::NavigationChanging {
                    entry,
                    navigation: navigation.name().to_string(),
                    old: NavigationSnapshot::capture(entity.as_ref(), navigation),
                },
                None => return,
            };
            let _ = sender.send(signal);
        })
    }

    fn changed_handler(&self, entry: EntryId, entity_type: Arc<EntityType>) -> MemberHandler {
        let sender = self.sender.clone();
        Arc::new(move |member: &str| {
            let signal = match entity_type.find_member(member) {
                Some(Member::Property(property)) => ChangeSignal::PropertyChanged {
                    entry,
                    property: property.name().to_string(),
                },
                Some(Member::Navigation(navigation)) => ChangeSignal::NavigationChanged {
                    entry,
                    navigation: navigation.name().to_string(),
                },
                None => return,
            };
            let _ = sender.send(signal);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::DataType;
    use crate::entity::{ChangeNotifier, DynamicEntity};
    use crate::metadata::{Model, Property};
    use tokio::sync::mpsc;

    fn order_type(eager: bool) -> Arc<EntityType> {
        let mut builder = Model::builder();
        builder
            .entity("Order")
            .property(Property::new("id", DataType::Integer))
            .property(Property::new("customer", DataType::Text))
            .key(&["id"])
            .collection("items", "LineItem", "fk_item_order")
            .collection("notes", "LineItem", "fk_item_order")
            .eager_snapshots(eager);
        builder
            .entity("LineItem")
            .property(Property::new("id", DataType::Integer))
            .property(Property::new("order_id", DataType::Integer))
            .key(&["id"])
            .foreign_key(crate::metadata::ForeignKey::new("fk_item_order", &["order_id"], "Order", &[]));
        builder.build().unwrap().entity_type("Order").unwrap().clone()
    }

    #[test]
    fn test_change_source_selection() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let subscriber = ChangeSubscriber::new(tx.clone(), false);

        let plain = DynamicEntity::new("Order");
        assert_eq!(subscriber.change_source(&plain, &order_type(false)), ChangeSource::Poll);

        let notifying = DynamicEntity::notifying("Order").with_notifying_collection("items");
        assert_eq!(
            subscriber.change_source(&notifying, &order_type(false)),
            ChangeSource::Push {
                polled_navigations: vec!["notes".to_string()]
            }
        );
        assert_eq!(subscriber.change_source(&notifying, &order_type(true)), ChangeSource::Poll);

        let changing_only = DynamicEntity::new("Order").with_notifier(ChangeNotifier::with_support(true, false));
        assert_eq!(subscriber.change_source(&changing_only, &order_type(false)), ChangeSource::Poll);

        let forced = ChangeSubscriber::new(tx, true);
        assert_eq!(forced.change_source(&notifying, &order_type(false)), ChangeSource::Poll);
    }

    #[test]
    fn test_handlers_forward_signals_and_ignore_unknown_members() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscriber = ChangeSubscriber::new(tx, false);
        let order = DynamicEntity::notifying("Order")
            .with_value("customer", "Ann")
            .into_ref();
        let ty = order_type(false);
        let source = subscriber.change_source(order.as_ref(), &ty);
        let mut entry = Entry::new(EntryId(3), &order, ty, source);
        subscriber.snapshot_and_subscribe(&mut entry, &order);
        assert_eq!(entry.subscription_count(), 2);

        order.set_value("customer", Value::from("Bea"));
        order.set_value("NotMapped", Value::from(1));

        assert_eq!(
            rx.try_recv().unwrap(),
            ChangeSignal::PropertyChanging {
                entry: EntryId(3),
                property: "customer".into(),
                old: Value::from("Ann"),
            }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            ChangeSignal::PropertyChanged {
                entry: EntryId(3),
                property: "customer".into(),
            }
        );
        assert!(rx.try_recv().is_err());

        entry.unsubscribe();
        assert_eq!(order.change_notifier().unwrap().subscriber_count(), 0);
    }

    #[test]
    fn test_poll_entries_snapshot_everything_and_do_not_subscribe() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let subscriber = ChangeSubscriber::new(tx, true);
        let order = DynamicEntity::notifying("Order").with_value("id", 1).into_ref();
        let ty = order_type(false);
        let mut entry = Entry::new(EntryId(1), &order, ty.clone(), subscriber.change_source(order.as_ref(), &ty));
        subscriber.snapshot_and_subscribe(&mut entry, &order);

        assert_eq!(entry.subscription_count(), 0);
        assert_eq!(entry.original_value("id"), Some(&Value::Integer(1)));
        assert_eq!(entry.original_value("customer"), Some(&Value::Null));
        assert!(entry.relationship("items").is_some());
    }
}
