use std::sync::Arc;

use crate::change::ChangeDiff;
use crate::core::{Operation, Phase, Result};
use crate::resource::ManagedEntity;
use crate::scope::RequestScope;

/// A user-supplied lifecycle callback.
///
/// Hooks receive the operation and phase they were bound to, the entity the
/// event concerns, the owning request scope, and the change diff when the
/// event was raised for a field mutation. Returning an error aborts the
/// remainder of the current phase drain.
pub trait LifecycleHook: Send + Sync {
    fn call(
        &self,
        operation: Operation,
        phase: Phase,
        entity: &Arc<ManagedEntity>,
        scope: &RequestScope,
        diff: Option<&ChangeDiff>,
    ) -> Result<()>;
}

impl<F> LifecycleHook for F
where
    F: Fn(Operation, Phase, &Arc<ManagedEntity>, &RequestScope, Option<&ChangeDiff>) -> Result<()>
        + Send
        + Sync,
{
    fn call(
        &self,
        operation: Operation,
        phase: Phase,
        entity: &Arc<ManagedEntity>,
        scope: &RequestScope,
        diff: Option<&ChangeDiff>,
    ) -> Result<()> {
        self(operation, phase, entity, scope, diff)
    }
}

/// Granularity a hook binding applies at.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HookScope {
    /// Fires once per (operation, phase) for the whole entity.
    Class,
    /// Fires for every field-level event on the entity.
    AllFields,
    /// Fires only for events on the named field.
    Field(String),
}

impl HookScope {
    /// Whether an event with the given field targets this binding.
    pub fn matches(&self, event_field: Option<&str>) -> bool {
        match (self, event_field) {
            (HookScope::Class, None) => true,
            (HookScope::AllFields, Some(_)) => true,
            (HookScope::Field(name), Some(field)) => name == field,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_matching() {
        assert!(HookScope::Class.matches(None));
        assert!(!HookScope::Class.matches(Some("title")));

        assert!(HookScope::AllFields.matches(Some("title")));
        assert!(!HookScope::AllFields.matches(None));

        assert!(HookScope::Field("title".into()).matches(Some("title")));
        assert!(!HookScope::Field("title".into()).matches(Some("body")));
        assert!(!HookScope::Field("title".into()).matches(None));
    }
}
