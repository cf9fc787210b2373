use crate::core::{DbError, Result};
use serde::{Deserialize, Serialize};

/// Well-known annotation naming the store table of an entity type.
pub const TABLE_ANNOTATION: &str = "table";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotation {
    name: String,
    value: String,
}

impl Annotation {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let value = value.into();
        DbError::check_not_empty(&name, "name")?;
        DbError::check_not_empty(&value, "value")?;
        Ok(Self { name, value })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &str {
        &self.value
    }
}

/// Ordered annotation set; adding an existing name replaces its value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotations {
    items: Vec<Annotation>,
}

impl Annotations {
    pub fn add(&mut self, annotation: Annotation) {
        match self.items.iter_mut().find(|a| a.name == annotation.name) {
            Some(existing) => existing.value = annotation.value,
            None => self.items.push(annotation),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.items
            .iter()
            .find(|a| a.name == name)
            .map(|a| a.value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Annotation> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
