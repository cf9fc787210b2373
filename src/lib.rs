// ============================================================================
// MemoTrack Library
// ============================================================================

pub mod core;
pub mod entity;
pub mod metadata;
pub mod prelude;
pub mod session;
pub mod store;
pub mod tracking;

// Re-export main types for convenience
pub use core::{DataType, DbError, Result, Value};
pub use entity::{ChangeNotifier, DynamicEntity, Entity, EntityRef, NavigationValue, ObjectKey};
pub use metadata::{ForeignKey, Model, ModelBuilder, ModelCache, Navigation, Property};
pub use session::{Session, SessionContext};

// Re-export the store boundary
pub use store::{
    ColumnValue, CommandResult, DataStore, EntityOperation, MemoryStore, ModificationCommand,
    StoreOutcome, WriteBatch,
};

// Re-export tracking
pub use tracking::{
    ChangeDetector, DetectionReport, EntityState, Entry, EntryId, StateManager, TrackingConfig,
};
