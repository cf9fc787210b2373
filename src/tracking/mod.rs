// ============================================================================
// Change Tracking
// ============================================================================
//
// The unit-of-work core:
//
//   object mutated -> signal (pushed through the channel, or found by the
//   detector) -> EntryNotifier updates entry state and fixes up foreign keys
//   -> save: BatchBuilder orders the pending entries -> DataStore executes the
//   batch -> StateManager accepts the outcome.
//
// ============================================================================

pub mod batch;
pub mod config;
pub mod detector;
pub mod entry;
pub mod notifier;
pub mod registry;
pub mod signal;
pub mod snapshot;
pub mod state_manager;
pub mod subscriber;

pub use batch::{BatchBuilder, PreparedBatch};
pub use config::TrackingConfig;
pub use detector::{ChangeDetector, ChangeKind, DetectedChange, DetectionReport};
pub use entry::{ChangeSource, EntityState, Entry, EntryId};
pub use notifier::EntryNotifier;
pub use registry::Registry;
pub use signal::ChangeSignal;
pub use snapshot::{NavigationSnapshot, RelationshipSnapshot, ValueSnapshot};
pub use state_manager::StateManager;
pub use subscriber::ChangeSubscriber;
