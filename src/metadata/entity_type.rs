use super::annotation::{Annotations, TABLE_ANNOTATION};
use crate::core::{DataType, DbError, Result, Value};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    name: String,
    data_type: DataType,
    nullable: bool,
    store_generated: bool,
}

impl Property {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: true,
            store_generated: false,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Value is produced by the store on insert (identity or generated key).
    pub fn generated(mut self) -> Self {
        self.store_generated = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn is_nullable(&self) -> bool {
        self.nullable
    }

    pub fn is_store_generated(&self) -> bool {
        self.store_generated
    }

    pub fn validate(&self, value: &Value) -> Result<()> {
        if value.is_null() {
            if !self.nullable {
                return Err(DbError::ConstraintViolation(format!(
                    "Property '{}' cannot be NULL",
                    self.name
                )));
            }
            return Ok(());
        }

        if !self.data_type.is_compatible(value) {
            return Err(DbError::TypeMismatch(format!(
                "Property '{}' expects type {}, got {}",
                self.name,
                self.data_type,
                value.type_name()
            )));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NavigationKind {
    Reference,
    Collection,
}

/// Which end of the foreign key the navigation's owner sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NavigationRole {
    /// Owner is the dependent; the navigation points at its principal.
    ToPrincipal,
    /// Owner is the principal; the navigation holds its dependents.
    ToDependents,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Navigation {
    name: String,
    target_type: String,
    kind: NavigationKind,
    role: NavigationRole,
    foreign_key: Option<String>,
}

impl Navigation {
    pub fn new(
        name: impl Into<String>,
        target_type: impl Into<String>,
        kind: NavigationKind,
        role: NavigationRole,
    ) -> Self {
        Self {
            name: name.into(),
            target_type: target_type.into(),
            kind,
            role,
            foreign_key: None,
        }
    }

    pub fn with_foreign_key(mut self, foreign_key: impl Into<String>) -> Self {
        self.foreign_key = Some(foreign_key.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn target_type(&self) -> &str {
        &self.target_type
    }

    pub fn kind(&self) -> NavigationKind {
        self.kind
    }

    pub fn role(&self) -> NavigationRole {
        self.role
    }

    pub fn is_collection(&self) -> bool {
        self.kind == NavigationKind::Collection
    }

    pub fn points_to_principal(&self) -> bool {
        self.role == NavigationRole::ToPrincipal
    }

    /// Name of the foreign key; declared on the dependent type.
    pub fn foreign_key(&self) -> Option<&str> {
        self.foreign_key.as_deref()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    name: String,
    dependent_type: String,
    properties: Vec<String>,
    principal_type: String,
    principal_key: Vec<String>,
    required: bool,
}

impl ForeignKey {
    /// An empty `principal_key` defaults to the principal's primary key when
    /// the model is built.
    pub fn new(
        name: impl Into<String>,
        properties: &[&str],
        principal_type: impl Into<String>,
        principal_key: &[&str],
    ) -> Self {
        Self {
            name: name.into(),
            dependent_type: String::new(),
            properties: properties.iter().map(|p| p.to_string()).collect(),
            principal_type: principal_type.into(),
            principal_key: principal_key.iter().map(|p| p.to_string()).collect(),
            required: false,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dependent_type(&self) -> &str {
        &self.dependent_type
    }

    pub fn properties(&self) -> &[String] {
        &self.properties
    }

    pub fn principal_type(&self) -> &str {
        &self.principal_type
    }

    pub fn principal_key(&self) -> &[String] {
        &self.principal_key
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    pub fn contains_property(&self, property: &str) -> bool {
        self.properties.iter().any(|p| p == property)
    }

    pub(crate) fn set_dependent_type(&mut self, dependent_type: &str) {
        self.dependent_type = dependent_type.to_string();
    }

    pub(crate) fn set_principal_key(&mut self, principal_key: Vec<String>) {
        self.principal_key = principal_key;
    }
}

/// Property-or-navigation handle resolved from a member name.
#[derive(Debug, Clone, Copy)]
pub enum Member<'a> {
    Property(&'a Property),
    Navigation(&'a Navigation),
}

impl Member<'_> {
    pub fn name(&self) -> &str {
        match self {
            Member::Property(p) => p.name(),
            Member::Navigation(n) => n.name(),
        }
    }
}

/// Immutable shape of one entity type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityType {
    pub(crate) name: String,
    pub(crate) properties: Vec<Property>,
    pub(crate) primary_key: Vec<String>,
    pub(crate) navigations: Vec<Navigation>,
    pub(crate) foreign_keys: Vec<ForeignKey>,
    pub(crate) eager_snapshots: bool,
    pub(crate) annotations: Annotations,
}

impl EntityType {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn table_name(&self) -> &str {
        self.annotations.get(TABLE_ANNOTATION).unwrap_or(&self.name)
    }

    pub fn properties(&self) -> &[Property] {
        &self.properties
    }

    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties.iter().find(|p| p.name == name)
    }

    pub fn primary_key(&self) -> &[String] {
        &self.primary_key
    }

    pub fn is_key_property(&self, name: &str) -> bool {
        self.primary_key.iter().any(|k| k == name)
    }

    /// True when any key property is filled in by the store.
    pub fn has_generated_key(&self) -> bool {
        self.primary_key
            .iter()
            .filter_map(|k| self.property(k))
            .any(Property::is_store_generated)
    }

    pub fn navigations(&self) -> &[Navigation] {
        &self.navigations
    }

    pub fn navigation(&self, name: &str) -> Option<&Navigation> {
        self.navigations.iter().find(|n| n.name == name)
    }

    pub fn foreign_keys(&self) -> &[ForeignKey] {
        &self.foreign_keys
    }

    pub fn foreign_key(&self, name: &str) -> Option<&ForeignKey> {
        self.foreign_keys.iter().find(|fk| fk.name == name)
    }

    /// Reference navigation on this type that targets the principal of `foreign_key`.
    pub fn principal_navigation_for(&self, foreign_key: &str) -> Option<&Navigation> {
        self.navigations
            .iter()
            .find(|n| n.points_to_principal() && n.foreign_key() == Some(foreign_key))
    }

    pub fn uses_eager_snapshots(&self) -> bool {
        self.eager_snapshots
    }

    pub fn annotations(&self) -> &Annotations {
        &self.annotations
    }

    /// Resolves a notified member name: properties first, then navigations.
    pub fn find_member(&self, name: &str) -> Option<Member<'_>> {
        self.property(name)
            .map(Member::Property)
            .or_else(|| self.navigation(name).map(Member::Navigation))
    }
}
