use super::entry::EntryId;
use super::snapshot::NavigationSnapshot;
use crate::core::Value;

/// Change notification addressed to one entry.
///
/// Pre-change signals carry the value read before the setter ran, so the
/// baseline stays correct even though the signal is applied later.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeSignal {
    PropertyChanging {
        entry: EntryId,
        property: String,
        old: Value,
    },
    PropertyChanged {
        entry: EntryId,
        property: String,
    },
    NavigationChanging {
        entry: EntryId,
        navigation: String,
        old: NavigationSnapshot,
    },
    NavigationChanged {
        entry: EntryId,
        navigation: String,
    },
}

impl ChangeSignal {
    pub fn entry(&self) -> EntryId {
        match self {
            Self::PropertyChanging { entry, .. }
            | Self::PropertyChanged { entry, .. }
            | Self::NavigationChanging { entry, .. }
            | Self::NavigationChanged { entry, .. } => *entry,
        }
    }
}
