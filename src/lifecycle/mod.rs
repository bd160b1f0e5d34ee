// ============================================================================
// Lifecycle Hook Module
// ============================================================================
//
// Hook bindings are static metadata: (entity type, operation, phase, scope)
// mapped to a callable. They are registered once at startup and only ever
// looked up afterwards. Invocation happens either synchronously at mutation
// time (the PRESECURITY phase) or when the request scope drains a phase
// queue at the matching point of the transaction commit protocol.
//
// ============================================================================

pub mod dispatcher;
pub mod event;
pub mod hooks;

pub use dispatcher::HookDispatcher;
pub use event::{CrudEvent, EventKey};
pub use hooks::{HookScope, LifecycleHook};
