use super::annotation::{Annotation, Annotations};
use super::entity_type::{
    EntityType, ForeignKey, Navigation, NavigationKind, NavigationRole, Property,
};
use crate::core::{DbError, Result};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Immutable set of entity types shared by every session built on it.
#[derive(Debug, Clone)]
pub struct Model {
    entity_types: HashMap<String, Arc<EntityType>>,
    order: Vec<String>,
    annotations: Annotations,
}

impl Model {
    pub fn builder() -> ModelBuilder {
        ModelBuilder::default()
    }

    pub fn entity_type(&self, name: &str) -> Option<&Arc<EntityType>> {
        self.entity_types.get(name)
    }

    /// Entity types in declaration order.
    pub fn entity_types(&self) -> impl Iterator<Item = &Arc<EntityType>> {
        self.order.iter().filter_map(|name| self.entity_types.get(name))
    }

    pub fn annotations(&self) -> &Annotations {
        &self.annotations
    }

    /// Foreign keys (with their declaring types) whose principal is `principal_type`.
    pub fn dependents_of(&self, principal_type: &str) -> Vec<(&Arc<EntityType>, &ForeignKey)> {
        self.entity_types()
            .flat_map(|ty| {
                ty.foreign_keys()
                    .iter()
                    .filter(move |fk| fk.principal_type() == principal_type)
                    .map(move |fk| (ty, fk))
            })
            .collect()
    }

    /// Foreign key behind a navigation, looked up on whichever side declares it.
    pub fn foreign_key_for(&self, owner: &EntityType, navigation: &Navigation) -> Option<&ForeignKey> {
        let fk_name = navigation.foreign_key()?;
        match navigation.role() {
            NavigationRole::ToPrincipal => self.entity_type(owner.name())?.foreign_key(fk_name),
            NavigationRole::ToDependents => self
                .entity_type(navigation.target_type())?
                .foreign_key(fk_name),
        }
    }
}

#[derive(Debug, Default)]
pub struct ModelBuilder {
    types: Vec<EntityTypeBuilder>,
    annotations: Annotations,
    errors: Vec<String>,
}

impl ModelBuilder {
    /// Returns the builder for `name`, adding it on first use.
    pub fn entity(&mut self, name: &str) -> &mut EntityTypeBuilder {
        let index = match self.types.iter().position(|t| t.name == name) {
            Some(index) => index,
            None => {
                self.types.push(EntityTypeBuilder::new(name));
                self.types.len() - 1
            }
        };
        &mut self.types[index]
    }

    pub fn annotation(&mut self, name: &str, value: &str) -> &mut Self {
        match Annotation::new(name, value) {
            Ok(annotation) => self.annotations.add(annotation),
            Err(err) => self.errors.push(err.to_string()),
        }
        self
    }

    pub fn build(self) -> Result<Model> {
        if let Some(err) = self.errors.first() {
            return Err(DbError::InvalidArgument(err.clone()));
        }

        let mut shapes = Vec::with_capacity(self.types.len());
        for builder in self.types {
            shapes.push(builder.finish()?);
        }

        let keys: HashMap<String, Vec<String>> = shapes
            .iter()
            .map(|ty| (ty.name.clone(), ty.primary_key.clone()))
            .collect();

        for ty in &mut shapes {
            let dependent_name = ty.name.clone();
            for fk in &mut ty.foreign_keys {
                fk.set_dependent_type(&dependent_name);
                let principal_key = keys.get(fk.principal_type()).ok_or_else(|| {
                    DbError::InvalidArgument(format!(
                        "Foreign key '{}' on '{}' references unknown entity type '{}'",
                        fk.name(),
                        dependent_name,
                        fk.principal_type()
                    ))
                })?;
                if fk.principal_key().is_empty() {
                    fk.set_principal_key(principal_key.clone());
                }
                if fk.principal_key().len() != fk.properties().len() {
                    return Err(DbError::InvalidArgument(format!(
                        "Foreign key '{}' on '{}' has {} properties but the principal key has {}",
                        fk.name(),
                        dependent_name,
                        fk.properties().len(),
                        fk.principal_key().len()
                    )));
                }
            }
        }

        let by_name: HashMap<&str, &EntityType> =
            shapes.iter().map(|ty| (ty.name.as_str(), ty)).collect();
        for ty in &shapes {
            for fk in &ty.foreign_keys {
                let principal = by_name[fk.principal_type()];
                if let Some(missing) = fk
                    .principal_key()
                    .iter()
                    .find(|k| principal.property(k).is_none())
                {
                    return Err(DbError::InvalidArgument(format!(
                        "Foreign key '{}' targets missing property '{}.{}'",
                        fk.name(),
                        principal.name,
                        missing
                    )));
                }
            }
            for nav in &ty.navigations {
                validate_navigation(ty, nav, &by_name)?;
            }
        }

        let order = shapes.iter().map(|ty| ty.name.clone()).collect();
        let entity_types = shapes
            .into_iter()
            .map(|ty| (ty.name.clone(), Arc::new(ty)))
            .collect();

        Ok(Model {
            entity_types,
            order,
            annotations: self.annotations,
        })
    }
}

fn validate_navigation(
    owner: &EntityType,
    nav: &Navigation,
    by_name: &HashMap<&str, &EntityType>,
) -> Result<()> {
    let target = by_name.get(nav.target_type()).ok_or_else(|| {
        DbError::InvalidArgument(format!(
            "Navigation '{}.{}' targets unknown entity type '{}'",
            owner.name,
            nav.name(),
            nav.target_type()
        ))
    })?;

    let Some(fk_name) = nav.foreign_key() else {
        return Ok(());
    };

    let (declaring, principal) = match nav.role() {
        NavigationRole::ToPrincipal => (owner, *target),
        NavigationRole::ToDependents => (*target, owner),
    };
    let fk = declaring.foreign_key(fk_name).ok_or_else(|| {
        DbError::InvalidArgument(format!(
            "Navigation '{}.{}' uses foreign key '{}' which is not declared on '{}'",
            owner.name,
            nav.name(),
            fk_name,
            declaring.name
        ))
    })?;
    if fk.principal_type() != principal.name {
        return Err(DbError::InvalidArgument(format!(
            "Navigation '{}.{}' expects foreign key '{}' to reference '{}'",
            owner.name,
            nav.name(),
            fk_name,
            principal.name
        )));
    }
    if nav.points_to_principal() && nav.is_collection() {
        return Err(DbError::InvalidArgument(format!(
            "Navigation '{}.{}' points to a principal and must be a reference",
            owner.name,
            nav.name()
        )));
    }
    Ok(())
}

#[derive(Debug)]
pub struct EntityTypeBuilder {
    name: String,
    properties: Vec<Property>,
    key: Vec<String>,
    navigations: Vec<Navigation>,
    foreign_keys: Vec<ForeignKey>,
    eager_snapshots: bool,
    annotations: Annotations,
    errors: Vec<String>,
}

impl EntityTypeBuilder {
    fn new(name: &str) -> Self {
        let mut errors = Vec::new();
        if let Err(err) = DbError::check_not_empty(name, "name") {
            errors.push(err.to_string());
        }
        Self {
            name: name.to_string(),
            properties: Vec::new(),
            key: Vec::new(),
            navigations: Vec::new(),
            foreign_keys: Vec::new(),
            eager_snapshots: false,
            annotations: Annotations::default(),
            errors,
        }
    }

    pub fn property(&mut self, property: Property) -> &mut Self {
        if self.properties.iter().any(|p| p.name() == property.name()) {
            self.errors.push(format!(
                "Property '{}' is declared twice on '{}'",
                property.name(),
                self.name
            ));
        } else {
            self.properties.push(property);
        }
        self
    }

    pub fn key(&mut self, properties: &[&str]) -> &mut Self {
        self.key = properties.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn foreign_key(&mut self, foreign_key: ForeignKey) -> &mut Self {
        self.foreign_keys.push(foreign_key);
        self
    }

    pub fn navigation(&mut self, navigation: Navigation) -> &mut Self {
        self.navigations.push(navigation);
        self
    }

    /// Reference from this dependent to its principal.
    pub fn reference(&mut self, name: &str, target: &str, foreign_key: &str) -> &mut Self {
        self.navigation(
            Navigation::new(name, target, NavigationKind::Reference, NavigationRole::ToPrincipal)
                .with_foreign_key(foreign_key),
        )
    }

    /// Collection of dependents held by this principal.
    pub fn collection(&mut self, name: &str, target: &str, foreign_key: &str) -> &mut Self {
        self.navigation(
            Navigation::new(name, target, NavigationKind::Collection, NavigationRole::ToDependents)
                .with_foreign_key(foreign_key),
        )
    }

    /// One-to-one reference from this principal to its dependent.
    pub fn dependent_reference(&mut self, name: &str, target: &str, foreign_key: &str) -> &mut Self {
        self.navigation(
            Navigation::new(name, target, NavigationKind::Reference, NavigationRole::ToDependents)
                .with_foreign_key(foreign_key),
        )
    }

    pub fn eager_snapshots(&mut self, eager: bool) -> &mut Self {
        self.eager_snapshots = eager;
        self
    }

    pub fn annotation(&mut self, name: &str, value: &str) -> &mut Self {
        match Annotation::new(name, value) {
            Ok(annotation) => self.annotations.add(annotation),
            Err(err) => self.errors.push(err.to_string()),
        }
        self
    }

    fn finish(self) -> Result<EntityType> {
        if let Some(err) = self.errors.into_iter().next() {
            return Err(DbError::InvalidArgument(err));
        }
        if self.key.is_empty() {
            return Err(DbError::InvalidArgument(format!(
                "Entity type '{}' has no primary key",
                self.name
            )));
        }
        for name in self.key.iter().chain(self.foreign_keys.iter().flat_map(|fk| fk.properties())) {
            if !self.properties.iter().any(|p| p.name() == name) {
                return Err(DbError::InvalidArgument(format!(
                    "Property '{}' is not declared on '{}'",
                    name, self.name
                )));
            }
        }

        let mut member_names = HashSet::new();
        for name in self
            .properties
            .iter()
            .map(Property::name)
            .chain(self.navigations.iter().map(Navigation::name))
        {
            DbError::check_not_empty(name, "name")?;
            if !member_names.insert(name) {
                return Err(DbError::InvalidArgument(format!(
                    "Member '{}' is declared twice on '{}'",
                    name, self.name
                )));
            }
        }

        Ok(EntityType {
            name: self.name,
            properties: self.properties,
            primary_key: self.key,
            navigations: self.navigations,
            foreign_keys: self.foreign_keys,
            eager_snapshots: self.eager_snapshots,
            annotations: self.annotations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::DataType;

    #[test]
    fn test_missing_key_is_rejected() {
        let mut builder = Model::builder();
        builder
            .entity("Order")
            .property(Property::new("id", DataType::Integer));
        let err = builder.build().unwrap_err();
        assert!(err.to_string().contains("has no primary key"));
    }

    #[test]
    fn test_foreign_key_to_unknown_type_is_rejected() {
        let mut builder = Model::builder();
        builder
            .entity("LineItem")
            .property(Property::new("id", DataType::Integer))
            .property(Property::new("order_id", DataType::Integer))
            .key(&["id"])
            .foreign_key(ForeignKey::new("fk", &["order_id"], "Order", &[]));
        assert!(matches!(builder.build(), Err(DbError::InvalidArgument(_))));
    }

    #[test]
    fn test_empty_annotation_surfaces_at_build() {
        let mut builder = Model::builder();
        builder
            .entity("Order")
            .property(Property::new("id", DataType::Integer))
            .key(&["id"])
            .annotation("table", "");
        let err = builder.build().unwrap_err();
        assert!(err.to_string().contains("'value' cannot be empty"));
    }

    #[test]
    fn test_dependents_of_and_table_name() {
        let mut builder = Model::builder();
        builder
            .entity("Order")
            .property(Property::new("id", DataType::Integer))
            .key(&["id"])
            .annotation("table", "orders");
        builder
            .entity("LineItem")
            .property(Property::new("id", DataType::Integer))
            .property(Property::new("order_id", DataType::Integer))
            .key(&["id"])
            .foreign_key(ForeignKey::new("fk_item_order", &["order_id"], "Order", &[]));
        let model = builder.build().unwrap();

        assert_eq!(model.entity_type("Order").unwrap().table_name(), "orders");
        assert_eq!(model.entity_type("LineItem").unwrap().table_name(), "LineItem");
        let dependents = model.dependents_of("Order");
        assert_eq!(dependents.len(), 1);
        assert_eq!(dependents[0].1.name(), "fk_item_order");
    }

    #[test]
    fn test_foreign_key_for_resolves_both_sides() {
        let mut builder = Model::builder();
        builder
            .entity("Order")
            .property(Property::new("id", DataType::Integer))
            .key(&["id"])
            .collection("items", "LineItem", "fk_item_order");
        builder
            .entity("LineItem")
            .property(Property::new("id", DataType::Integer))
            .property(Property::new("order_id", DataType::Integer))
            .key(&["id"])
            .foreign_key(ForeignKey::new("fk_item_order", &["order_id"], "Order", &[]))
            .reference("order", "Order", "fk_item_order");
        let model = builder.build().unwrap();

        let order = model.entity_type("Order").unwrap();
        let item = model.entity_type("LineItem").unwrap();
        let to_items = order.navigation("items").unwrap();
        let to_order = item.navigation("order").unwrap();

        let from_principal = model.foreign_key_for(order, to_items).unwrap();
        let from_dependent = model.foreign_key_for(item, to_order).unwrap();
        assert_eq!(from_principal.name(), "fk_item_order");
        assert_eq!(from_dependent.properties(), &["order_id".to_string()]);
    }
}
