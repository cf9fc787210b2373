use super::entry::{ChangeSource, EntityState, EntryId};
use super::notifier::EntryNotifier;
use super::snapshot::NavigationSnapshot;
use crate::core::Value;
use serde::{Deserialize, Serialize};
use tracing::{Level, event};

/// Further passes only run when fix-up wrote into entries already scanned.
const MAX_PASSES: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Property,
    Navigation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedChange {
    pub entry: EntryId,
    pub entity_type: String,
    pub member: String,
    pub kind: ChangeKind,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DetectionReport {
    changes: Vec<DetectedChange>,
    pruned: Vec<EntryId>,
}

impl DetectionReport {
    pub fn changes(&self) -> &[DetectedChange] {
        &self.changes
    }

    /// Entries dropped from tracking because their objects no longer exist.
    pub fn pruned(&self) -> &[EntryId] {
        &self.pruned
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn contains(&self, entity_type: &str, member: &str) -> bool {
        self.changes
            .iter()
            .any(|c| c.entity_type == entity_type && c.member == member)
    }
}

/// Finds mutations the tracker was not told about.
///
/// Poll entries are compared member by member against their snapshots; push
/// entries only for collections that do not notify. Each mismatch is fed to
/// the notifier exactly as a notifying object would have reported it, after
/// which the snapshot is moved forward, so a second run without mutations
/// finds nothing.
pub struct ChangeDetector;

impl ChangeDetector {
    pub fn detect_changes(notifier: &mut EntryNotifier<'_>) -> DetectionReport {
        let mut report = DetectionReport::default();
        Self::prune(notifier, &mut report);

        let mut settled = false;
        for _ in 0..MAX_PASSES {
            if Self::scan(notifier, &mut report) == 0 {
                settled = true;
                break;
            }
        }
        if !settled {
            event!(Level::ERROR, passes = MAX_PASSES, "change detection did not settle");
        }

        event!(
            Level::DEBUG,
            changes = report.len(),
            pruned = report.pruned.len(),
            "change detection finished"
        );
        report
    }

    fn prune(notifier: &mut EntryNotifier<'_>, report: &mut DetectionReport) {
        let dropped: Vec<(EntryId, EntityState, String)> = notifier
            .registry
            .iter()
            .filter(|e| !e.is_alive() && e.state() != EntityState::Deleted)
            .map(|e| (e.id(), e.state(), e.entity_type().name().to_string()))
            .collect();

        for (id, state, entity_type) in dropped {
            notifier.registry.remove(id);
            if state != EntityState::Detached {
                event!(
                    Level::WARN,
                    entry = %id,
                    entity_type = %entity_type,
                    state = %state,
                    "tracked object was dropped; entry removed"
                );
                report.pruned.push(id);
            }
        }
    }

    fn scan(notifier: &mut EntryNotifier<'_>, report: &mut DetectionReport) -> usize {
        let mut found = 0;
        for id in notifier.registry.ids() {
            let Some(e) = notifier.registry.get(id) else {
                continue;
            };
            if e.state() == EntityState::Detached {
                continue;
            }
            let Some(entity) = e.entity() else {
                continue;
            };
            let entity_type = e.entity_type().clone();
            let (properties, navigations): (Vec<String>, Vec<String>) = match e.change_source() {
                ChangeSource::Poll => (
                    entity_type.properties().iter().map(|p| p.name().to_string()).collect(),
                    entity_type.navigations().iter().map(|n| n.name().to_string()).collect(),
                ),
                ChangeSource::Push { polled_navigations } => (Vec::new(), polled_navigations.clone()),
            };

            for property in &properties {
                let current = entity.get_value(property).unwrap_or(Value::Null);
                let Some(e) = notifier.registry.get_mut(id) else {
                    break;
                };
                match e.original_values.get(property) {
                    Some(original) if *original == current => continue,
                    Some(_) => {}
                    None => {
                        e.original_values.insert(property, current);
                        continue;
                    }
                }

                found += 1;
                if notifier.config.sensitive_logging {
                    event!(Level::DEBUG, entry = %id, property = %property, value = %current, "detected property change");
                } else {
                    event!(Level::DEBUG, entry = %id, property = %property, "detected property change");
                }
                report.changes.push(DetectedChange {
                    entry: id,
                    entity_type: entity_type.name().to_string(),
                    member: property.clone(),
                    kind: ChangeKind::Property,
                });
                notifier.property_changed(id, property);
                if let Some(e) = notifier.registry.get_mut(id) {
                    let settled = e.current_value(property);
                    e.original_values.insert(property, settled);
                }
            }

            for navigation in &navigations {
                let Some(nav) = entity_type.navigation(navigation) else {
                    continue;
                };
                let current = NavigationSnapshot::capture(entity.as_ref(), nav);
                let Some(e) = notifier.registry.get_mut(id) else {
                    break;
                };
                match e.relationships.get(navigation) {
                    Some(snapshot) if *snapshot == current => continue,
                    Some(_) => {}
                    None => {
                        e.relationships.insert(navigation, current);
                        continue;
                    }
                }

                found += 1;
                event!(Level::DEBUG, entry = %id, navigation = %navigation, "detected navigation change");
                report.changes.push(DetectedChange {
                    entry: id,
                    entity_type: entity_type.name().to_string(),
                    member: navigation.clone(),
                    kind: ChangeKind::Navigation,
                });
                notifier.navigation_changed(id, navigation);
            }
        }
        found
    }
}
