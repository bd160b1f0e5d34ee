use std::sync::Arc;

use tracing::trace;

use crate::core::{EngineError, Phase, Result};
use crate::metadata::MetadataRegistry;
use crate::scope::RequestScope;

use super::CrudEvent;

/// Invokes every hook bound to (type, operation, phase) that matches the
/// event's granularity, in metadata-registration order.
pub struct HookDispatcher {
    metadata: Arc<MetadataRegistry>,
}

impl HookDispatcher {
    pub fn new(metadata: Arc<MetadataRegistry>) -> Self {
        Self { metadata }
    }

    /// Runs all matching hooks for one event. The first hook error stops
    /// dispatch; client errors cross unchanged, anything else surfaces as a
    /// hook failure.
    pub fn invoke(&self, phase: Phase, event: &CrudEvent, scope: &RequestScope) -> Result<()> {
        let bindings =
            self.metadata
                .hooks_for(event.entity.entity_type(), event.operation, phase);

        for (hook_scope, hook) in bindings {
            if !hook_scope.matches(event.field.as_deref()) {
                continue;
            }
            trace!(
                entity = %event.entity.key(),
                operation = %event.operation,
                %phase,
                field = event.field.as_deref().unwrap_or("<class>"),
                "invoking lifecycle hook"
            );
            hook.call(event.operation, phase, &event.entity, scope, event.diff.as_ref())
                .map_err(|err| {
                    if err.is_client_error() {
                        err
                    } else {
                        EngineError::HookFailure(format!(
                            "{} {} hook on {}: {}",
                            event.operation,
                            phase,
                            event.entity.key(),
                            err
                        ))
                    }
                })?;
        }
        Ok(())
    }
}
