// ============================================================================
// Storage Collaborator Module
// ============================================================================
//
// The lifecycle core never talks to a backing store directly; it drives a
// StorageTransaction through a fixed protocol:
//
//   loads/saves/deletes -> pre_commit -> flush -> commit -> close
//
// close() runs on every exit path. A transaction driven out of order
// answers with a phase ordering violation.
//
// ============================================================================

pub mod memory;

use async_trait::async_trait;

use crate::core::{EntityRecord, Result};
use crate::security::FilterPredicate;

pub use memory::InMemoryStore;

/// Factory for one transaction per request scope.
#[async_trait]
pub trait DataStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn StorageTransaction>>;
}

/// One logical unit of work against the backing store.
///
/// Loads accept an optional storage-level predicate so that filter-check
/// permissions exclude denied objects before they are materialized.
#[async_trait]
pub trait StorageTransaction: Send {
    async fn load(
        &mut self,
        entity_type: &str,
        id: &str,
        filter: Option<&FilterPredicate>,
    ) -> Result<Option<EntityRecord>>;

    async fn load_all(
        &mut self,
        entity_type: &str,
        filter: Option<&FilterPredicate>,
    ) -> Result<Vec<EntityRecord>>;

    async fn save(&mut self, entity_type: &str, id: &str, record: EntityRecord) -> Result<()>;

    async fn delete(&mut self, entity_type: &str, id: &str) -> Result<()>;

    /// Members of a to-many relationship of `record`, pre-filtered.
    async fn get_to_many(
        &mut self,
        record: &EntityRecord,
        relation: &str,
        filter: Option<&FilterPredicate>,
    ) -> Result<Vec<EntityRecord>>;

    async fn pre_commit(&mut self) -> Result<()>;

    /// Pushes buffered writes to the backing store without finalizing.
    async fn flush(&mut self) -> Result<()>;

    async fn commit(&mut self) -> Result<()>;

    /// Releases the transaction. Uncommitted work is discarded. Must be
    /// callable exactly once on every exit path, success or failure.
    async fn close(&mut self) -> Result<()>;
}
