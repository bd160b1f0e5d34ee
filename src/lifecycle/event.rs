use std::sync::Arc;

use uuid::Uuid;

use crate::change::ChangeDiff;
use crate::core::Operation;
use crate::resource::ManagedEntity;

/// One pending hook invocation, queued per phase by the request scope.
///
/// A class-level event carries no field and no diff; a field-level event
/// names the mutated field and carries the diff computed for it.
#[derive(Clone)]
pub struct CrudEvent {
    pub operation: Operation,
    pub entity: Arc<ManagedEntity>,
    pub field: Option<String>,
    pub diff: Option<ChangeDiff>,
}

impl CrudEvent {
    pub fn class_level(operation: Operation, entity: Arc<ManagedEntity>) -> Self {
        Self {
            operation,
            entity,
            field: None,
            diff: None,
        }
    }

    pub fn field_level(
        operation: Operation,
        entity: Arc<ManagedEntity>,
        field: impl Into<String>,
        diff: ChangeDiff,
    ) -> Self {
        Self {
            operation,
            entity,
            field: Some(field.into()),
            diff: Some(diff),
        }
    }

    /// Dedup identity within one phase queue. The diff is deliberately
    /// excluded: the first publication of an event wins.
    pub fn key(&self) -> EventKey {
        EventKey {
            operation: self.operation,
            entity: self.entity.uuid(),
            field: self.field.clone(),
        }
    }
}

impl std::fmt::Debug for CrudEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrudEvent")
            .field("operation", &self.operation)
            .field("entity", &self.entity.key())
            .field("field", &self.field)
            .field("has_diff", &self.diff.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventKey {
    pub operation: Operation,
    pub entity: Uuid,
    pub field: Option<String>,
}
