// ============================================================================
// Entity Metadata
// ============================================================================
//
// Immutable description of entity shapes: scalar properties, primary keys,
// foreign keys and navigations. Built once through `ModelBuilder` and shared
// by reference; sessions never mutate it.
//
// ============================================================================

pub mod annotation;
pub mod cache;
pub mod entity_type;
pub mod model;

pub use annotation::{Annotation, Annotations, TABLE_ANNOTATION};
pub use cache::ModelCache;
pub use entity_type::{
    EntityType, ForeignKey, Member, Navigation, NavigationKind, NavigationRole, Property,
};
pub use model::{EntityTypeBuilder, Model, ModelBuilder};
