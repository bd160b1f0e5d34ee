// ============================================================================
// Entity Metadata Module
// ============================================================================
//
// The registry answers three questions for the rest of the engine: what
// attributes and relationships a type has, which permission expression
// guards a type/field/operation, and which lifecycle hooks are bound to a
// (type, operation, phase). It is assembled once at startup through the
// builder, validated, and shared read-only behind an Arc for the process
// lifetime.
//
// ============================================================================

pub mod entity;
pub mod registry;

pub use entity::{AttributeDef, EntityDef, RelationKind, RelationshipDef};
pub use registry::{MetadataRegistry, MetadataRegistryBuilder};
