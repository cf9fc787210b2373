#![allow(dead_code)]

use memotrack::core::{DataType, Value};
use memotrack::entity::{DynamicEntity, EntityRef};
use memotrack::metadata::{ForeignKey, Model, Property};
use memotrack::store::Row;
use std::sync::Arc;

/// Customer 1-n Order 1-n LineItem, all with store-generated integer keys.
pub fn shop_model() -> Arc<Model> {
    let mut builder = Model::builder();
    builder
        .entity("Customer")
        .property(Property::new("id", DataType::Integer).not_null().generated())
        .property(Property::new("name", DataType::Text).not_null())
        .key(&["id"])
        .collection("orders", "Order", "fk_order_customer");
    builder
        .entity("Order")
        .property(Property::new("id", DataType::Integer).not_null().generated())
        .property(Property::new("customer_id", DataType::Integer))
        .property(Property::new("note", DataType::Text))
        .key(&["id"])
        .foreign_key(ForeignKey::new("fk_order_customer", &["customer_id"], "Customer", &[]))
        .reference("customer", "Customer", "fk_order_customer")
        .collection("items", "LineItem", "fk_item_order");
    builder
        .entity("LineItem")
        .property(Property::new("id", DataType::Integer).not_null().generated())
        .property(Property::new("order_id", DataType::Integer))
        .property(Property::new("sku", DataType::Text).not_null())
        .key(&["id"])
        .foreign_key(ForeignKey::new("fk_item_order", &["order_id"], "Order", &[]).required());
    Arc::new(builder.build().expect("shop model"))
}

pub fn customer(name: &str) -> Arc<DynamicEntity> {
    Arc::new(DynamicEntity::new("Customer").with_value("name", name))
}

pub fn stored_customer(id: i64, name: &str) -> Arc<DynamicEntity> {
    Arc::new(
        DynamicEntity::new("Customer")
            .with_value("id", id)
            .with_value("name", name),
    )
}

pub fn order(note: &str) -> Arc<DynamicEntity> {
    Arc::new(DynamicEntity::new("Order").with_value("note", note))
}

pub fn line_item(sku: &str) -> Arc<DynamicEntity> {
    Arc::new(DynamicEntity::new("LineItem").with_value("sku", sku))
}

pub fn entity_ref(entity: &Arc<DynamicEntity>) -> EntityRef {
    entity.clone()
}

pub fn row(values: &[(&str, Value)]) -> Row {
    values
        .iter()
        .map(|(name, value)| (name.to_string(), value.clone()))
        .collect()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn integer(value: Value) -> i64 {
    match value {
        Value::Integer(id) => id,
        other => panic!("expected an integer, got {:?}", other),
    }
}
