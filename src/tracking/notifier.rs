use super::config::TrackingConfig;
use super::entry::{EntityState, EntryId};
use super::registry::Registry;
use super::signal::ChangeSignal;
use super::snapshot::NavigationSnapshot;
use crate::core::Value;
use crate::metadata::{ForeignKey, Model, NavigationRole};
use std::collections::VecDeque;
use tracing::{Level, event};

#[derive(Debug)]
enum Work {
    PropertyChanged { entry: EntryId, property: String },
    NavigationChanged { entry: EntryId, navigation: String },
    KeyChanged { entry: EntryId },
}

/// Routes change signals into entry state and foreign-key fix-up.
///
/// Every signal is processed to completion through a worklist. Foreign-key
/// writes only happen when the value differs, so propagation stops on its
/// own; `max_fixup_steps` guards against models where it would not.
pub struct EntryNotifier<'a> {
    pub(crate) model: &'a Model,
    pub(crate) registry: &'a mut Registry,
    pub(crate) config: &'a TrackingConfig,
}

impl<'a> EntryNotifier<'a> {
    pub fn new(model: &'a Model, registry: &'a mut Registry, config: &'a TrackingConfig) -> Self {
        Self {
            model,
            registry,
            config,
        }
    }

    pub fn dispatch(&mut self, signal: ChangeSignal) {
        match signal {
            ChangeSignal::PropertyChanging { entry, property, old } => {
                self.property_changing(entry, &property, old)
            }
            ChangeSignal::NavigationChanging { entry, navigation, old } => {
                self.navigation_changing(entry, &navigation, old)
            }
            ChangeSignal::PropertyChanged { entry, property } => {
                self.property_changed(entry, &property)
            }
            ChangeSignal::NavigationChanged { entry, navigation } => {
                self.navigation_changed(entry, &navigation)
            }
        }
    }

    /// Records the pre-change value unless an original is already held.
    pub fn property_changing(&mut self, entry: EntryId, property: &str, old: Value) {
        if let Some(e) = self.registry.get_mut(entry) {
            if e.state != EntityState::Detached {
                e.original_values.insert_if_absent(property, old);
            }
        }
    }

    pub fn navigation_changing(&mut self, entry: EntryId, navigation: &str, old: NavigationSnapshot) {
        if let Some(e) = self.registry.get_mut(entry) {
            if e.state != EntityState::Detached {
                e.relationships.insert_if_absent(navigation, old);
            }
        }
    }

    pub fn property_changed(&mut self, entry: EntryId, property: &str) {
        self.run(Work::PropertyChanged {
            entry,
            property: property.to_string(),
        });
    }

    pub fn navigation_changed(&mut self, entry: EntryId, navigation: &str) {
        self.run(Work::NavigationChanged {
            entry,
            navigation: navigation.to_string(),
        });
    }

    /// Pushes the principal's current key into every tracked dependent.
    pub fn key_changed(&mut self, entry: EntryId) {
        self.run(Work::KeyChanged { entry });
    }

    fn run(&mut self, first: Work) {
        let mut worklist = VecDeque::from([first]);
        let mut steps = 0usize;
        while let Some(work) = worklist.pop_front() {
            steps += 1;
            if steps > self.config.max_fixup_steps {
                event!(
                    Level::ERROR,
                    steps,
                    pending = worklist.len() + 1,
                    "foreign key fix-up exceeded its step limit; remaining work dropped"
                );
                return;
            }
            match work {
                Work::PropertyChanged { entry, property } => {
                    self.apply_property_changed(entry, &property, &mut worklist)
                }
                Work::NavigationChanged { entry, navigation } => {
                    self.apply_navigation_changed(entry, &navigation, &mut worklist)
                }
                Work::KeyChanged { entry } => self.apply_key_changed(entry, &mut worklist),
            }
        }
    }

    fn apply_property_changed(&mut self, entry: EntryId, property: &str, worklist: &mut VecDeque<Work>) {
        let model = self.model;
        let sensitive = self.config.sensitive_logging;
        let Some(e) = self.registry.get_mut(entry) else {
            return;
        };
        if e.state == EntityState::Detached {
            return;
        }
        let current = e.current_value(property);
        if e.original_values.get(property) == Some(&current) {
            return;
        }

        match e.state {
            EntityState::Unchanged => {
                e.state = EntityState::Modified;
                e.modified.insert(property.to_string());
            }
            EntityState::Modified => {
                e.modified.insert(property.to_string());
            }
            _ => {}
        }

        if sensitive {
            event!(Level::DEBUG, entry = %entry, property, value = %current, state = %e.state, "property change recorded");
        } else {
            event!(Level::DEBUG, entry = %entry, property, state = %e.state, "property change recorded");
        }

        let is_principal_key = model
            .dependents_of(e.entity_type().name())
            .iter()
            .any(|(_, fk)| fk.principal_key().iter().any(|k| k == property));
        if is_principal_key {
            worklist.push_back(Work::KeyChanged { entry });
        }
    }

    fn apply_navigation_changed(&mut self, entry: EntryId, navigation: &str, worklist: &mut VecDeque<Work>) {
        let model = self.model;
        let Some(e) = self.registry.get_mut(entry) else {
            return;
        };
        if e.state == EntityState::Detached {
            return;
        }
        let entity_type = e.entity_type().clone();
        let Some(nav) = entity_type.navigation(navigation) else {
            return;
        };
        let current = e
            .current_navigation(navigation)
            .unwrap_or_else(|| NavigationSnapshot::empty(nav.kind()));
        let previous = e
            .relationships
            .get(navigation)
            .cloned()
            .unwrap_or_else(|| NavigationSnapshot::empty(nav.kind()));
        if previous == current {
            return;
        }
        e.relationships.insert(navigation, current.clone());
        event!(Level::DEBUG, entry = %entry, navigation, "navigation change recorded");

        let Some(fk) = model.foreign_key_for(&entity_type, nav) else {
            return;
        };

        match nav.role() {
            NavigationRole::ToPrincipal => match current {
                NavigationSnapshot::Reference(Some(target)) => match self.registry.id_of(target) {
                    Some(principal) => {
                        let values = self.principal_key_values(principal, fk);
                        self.write_foreign_key(entry, fk, values, worklist);
                        if self.key_pending(principal, fk) {
                            self.mark_foreign_key_pending(entry, fk);
                        }
                    }
                    None => {
                        event!(Level::DEBUG, entry = %entry, navigation, "referenced object is not tracked");
                    }
                },
                NavigationSnapshot::Reference(None) if !fk.is_required() => {
                    let nulls = vec![Value::Null; fk.properties().len()];
                    self.write_foreign_key(entry, fk, nulls, worklist);
                }
                _ => {}
            },
            NavigationRole::ToDependents => {
                let (added, removed) = previous.diff(&current);
                let key = self.principal_key_values(entry, fk);
                let pending = self.key_pending(entry, fk);
                for member in added {
                    match self.registry.id_of(member) {
                        Some(dependent) => {
                            self.write_foreign_key(dependent, fk, key.clone(), worklist);
                            if pending {
                                self.mark_foreign_key_pending(dependent, fk);
                            }
                        }
                        None => {
                            event!(Level::DEBUG, entry = %entry, navigation, "added dependent is not tracked");
                        }
                    }
                }
                if fk.is_required() {
                    return;
                }
                for member in removed {
                    let Some(dependent) = self.registry.id_of(member) else {
                        continue;
                    };
                    if self.foreign_key_values(dependent, fk) == key {
                        let nulls = vec![Value::Null; fk.properties().len()];
                        self.write_foreign_key(dependent, fk, nulls, worklist);
                    }
                }
            }
        }
    }

    fn apply_key_changed(&mut self, principal: EntryId, worklist: &mut VecDeque<Work>) {
        let model = self.model;
        let Some(p) = self.registry.get(principal) else {
            return;
        };
        let entity_type = p.entity_type().clone();
        let principal_object = p.object_key();

        let mut targets: Vec<(EntryId, &ForeignKey)> = Vec::new();
        for (dependent_type, fk) in model.dependents_of(entity_type.name()) {
            for nav in entity_type.navigations().iter().filter(|nav| {
                nav.role() == NavigationRole::ToDependents && nav.foreign_key() == Some(fk.name())
            }) {
                if let Some(snapshot) = p.current_navigation(nav.name()) {
                    targets.extend(
                        snapshot
                            .members()
                            .into_iter()
                            .filter_map(|member| self.registry.id_of(member))
                            .map(|id| (id, fk)),
                    );
                }
            }

            if let Some(dependent_nav) = dependent_type.principal_navigation_for(fk.name()) {
                let pointing_here = NavigationSnapshot::Reference(Some(principal_object));
                targets.extend(
                    self.registry
                        .iter()
                        .filter(|d| d.entity_type().name() == dependent_type.name())
                        .filter(|d| d.current_navigation(dependent_nav.name()).as_ref() == Some(&pointing_here))
                        .map(|d| (d.id(), fk)),
                );
            }
        }

        for (dependent, fk) in targets {
            let key = self.principal_key_values(principal, fk);
            self.write_foreign_key(dependent, fk, key, worklist);
        }
    }

    fn principal_key_values(&self, principal: EntryId, fk: &ForeignKey) -> Vec<Value> {
        match self.registry.get(principal) {
            Some(p) => fk.principal_key().iter().map(|k| p.current_value(k)).collect(),
            None => vec![Value::Null; fk.principal_key().len()],
        }
    }

    /// True while the principal is awaiting a store-generated key for `fk`.
    fn key_pending(&self, principal: EntryId, fk: &ForeignKey) -> bool {
        self.registry.get(principal).is_some_and(|p| {
            p.state == EntityState::Added
                && fk.principal_key().iter().any(|k| {
                    p.entity_type().property(k).is_some_and(|prop| prop.is_store_generated())
                        && p.current_value(k).is_null()
                })
        })
    }

    /// The dependent already holds the value it will get (NULL), but the row
    /// still needs an update carrying the principal's key once it exists.
    fn mark_foreign_key_pending(&mut self, dependent: EntryId, fk: &ForeignKey) {
        let Some(d) = self.registry.get_mut(dependent) else {
            return;
        };
        if d.entity_type().name() != fk.dependent_type() {
            return;
        }
        match d.state {
            EntityState::Unchanged => d.state = EntityState::Modified,
            EntityState::Modified => {}
            _ => return,
        }
        d.modified.extend(fk.properties().iter().cloned());
        event!(Level::DEBUG, entry = %dependent, foreign_key = %fk.name(), "foreign key awaits a generated key");
    }

    fn foreign_key_values(&self, dependent: EntryId, fk: &ForeignKey) -> Vec<Value> {
        match self.registry.get(dependent) {
            Some(d) => fk.properties().iter().map(|p| d.current_value(p)).collect(),
            None => Vec::new(),
        }
    }

    fn write_foreign_key(
        &mut self,
        dependent: EntryId,
        fk: &ForeignKey,
        values: Vec<Value>,
        worklist: &mut VecDeque<Work>,
    ) {
        let Some(d) = self.registry.get_mut(dependent) else {
            return;
        };
        if matches!(d.state, EntityState::Detached | EntityState::Deleted)
            || d.entity_type().name() != fk.dependent_type()
        {
            return;
        }
        for (property, value) in fk.properties().iter().zip(values) {
            let current = d.current_value(property);
            if current == value {
                continue;
            }
            d.original_values.insert_if_absent(property, current);
            if d.set_current_value(property, value) {
                worklist.push_back(Work::PropertyChanged {
                    entry: dependent,
                    property: property.clone(),
                });
            }
        }
    }
}
