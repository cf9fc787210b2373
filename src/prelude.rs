//! Everyday imports for application code.
//!
//! `use memotrack::prelude::*;` brings in the session, the model builder and
//! the entity trait. Lower-level tracking types stay under `advanced`.

pub use crate::{
    DataType, DbError, DynamicEntity, Entity, EntityRef, EntityState, ForeignKey, MemoryStore,
    Model, ModelBuilder, Property, Result, Session, SessionContext, TrackingConfig, Value,
};

pub mod advanced {
    //! Tracker internals for tooling and custom stores.
    pub use crate::store::{ColumnValue, DataStore, ModificationCommand, StoreOutcome, WriteBatch};
    pub use crate::tracking::{
        BatchBuilder, ChangeDetector, DetectionReport, EntryNotifier, PreparedBatch, StateManager,
    };
}
