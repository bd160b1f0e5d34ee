// ============================================================================
// CrudKit Library
// ============================================================================

//! Entity lifecycle and permission-execution engine.
//!
//! Declare entities, permission checks, and lifecycle hooks in a
//! [`MetadataRegistry`], bind the registry to a [`DataStore`], and run
//! requests through the [`Engine`]:
//!
//! ```
//! use crudkit::{
//!     AttributeDef, DataType, Engine, EntityDef, ManagedEntity, MetadataRegistry,
//!     Operation, PermissionExpression, Principal, Value,
//! };
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let metadata = Arc::new(
//!     MetadataRegistry::builder()
//!         .user_check("anyone", |_: &Principal| true)
//!         .register_entity(
//!             EntityDef::new("book")
//!                 .with_attribute(AttributeDef::new("title", DataType::Text))
//!                 .with_permission(Operation::Create, PermissionExpression::check("anyone")),
//!         )
//!         .build()
//!         .unwrap(),
//! );
//!
//! let engine = Engine::in_memory(metadata);
//! engine
//!     .run(Principal::new("alice"), |scope| async move {
//!         let book = ManagedEntity::create(&scope, "book", Some(Value::Text("b1".into())))?;
//!         book.update_attribute(&scope, "title", Value::Text("Dune".into()))?;
//!         Ok(())
//!     })
//!     .await
//!     .unwrap();
//! # });
//! ```

pub mod change;
pub mod core;
pub mod facade;
pub mod lifecycle;
pub mod metadata;
pub mod resource;
pub mod scope;
pub mod security;
pub mod storage;

// Re-export main types for convenience
pub use change::ChangeDiff;
pub use core::{DataType, EngineError, EntityKey, EntityRecord, Operation, Phase, Result, Value};
pub use facade::Engine;
pub use lifecycle::{CrudEvent, HookScope, LifecycleHook};
pub use metadata::{
    AttributeDef, EntityDef, MetadataRegistry, MetadataRegistryBuilder, RelationKind,
    RelationshipDef,
};
pub use resource::{ManagedEntity, RelationValue, ResourceObject};
pub use scope::RequestScope;
pub use security::{
    Check, CommitCheck, FilterCheck, FilterPredicate, OperationCheck, PermissionExpression,
    Principal, RoleCheck, UserCheck,
};
pub use storage::{DataStore, InMemoryStore, StorageTransaction};
