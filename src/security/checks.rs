use std::collections::HashSet;
use std::sync::Arc;

use crate::change::ChangeDiff;
use crate::resource::ManagedEntity;
use crate::scope::RequestScope;

use super::FilterPredicate;

/// The authenticated caller of one request.
#[derive(Debug, Clone)]
pub struct Principal {
    name: String,
    roles: HashSet<String>,
}

impl Principal {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            roles: HashSet::new(),
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.insert(role.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }
}

/// Evaluated once per request against the principal alone. Results are
/// cached for the rest of the request.
pub trait UserCheck: Send + Sync {
    fn ok(&self, principal: &Principal) -> bool;
}

/// Evaluated against the in-memory, not-yet-committed object state; sees a
/// pending mutation through the optional diff.
pub trait OperationCheck: Send + Sync {
    fn ok(
        &self,
        entity: &Arc<ManagedEntity>,
        scope: &RequestScope,
        diff: Option<&ChangeDiff>,
    ) -> bool;
}

/// Same shape as an operation check, but deferred: evaluated only after
/// PRECOMMIT triggers ran, against the fully mutated state.
pub trait CommitCheck: Send + Sync {
    fn ok(
        &self,
        entity: &Arc<ManagedEntity>,
        scope: &RequestScope,
        diff: Option<&ChangeDiff>,
    ) -> bool;
}

/// Yields a storage-level predicate instead of a boolean, so denied objects
/// are filtered at load time rather than loaded and rejected. For a single
/// candidate the predicate is applied to its in-memory record.
pub trait FilterCheck: Send + Sync {
    fn predicate(&self, scope: &RequestScope) -> FilterPredicate;
}

/// A named check as registered in metadata.
#[derive(Clone)]
pub enum Check {
    User(Arc<dyn UserCheck>),
    Operation(Arc<dyn OperationCheck>),
    Commit(Arc<dyn CommitCheck>),
    Filter(Arc<dyn FilterCheck>),
}

impl Check {
    pub fn kind(&self) -> &'static str {
        match self {
            Check::User(_) => "user",
            Check::Operation(_) => "operation",
            Check::Commit(_) => "commit",
            Check::Filter(_) => "filter",
        }
    }
}

impl std::fmt::Debug for Check {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Check::{}", self.kind())
    }
}

/// Adapter so a plain closure over the principal registers as a user check.
pub struct RoleCheck {
    role: String,
}

impl RoleCheck {
    pub fn new(role: impl Into<String>) -> Self {
        Self { role: role.into() }
    }
}

impl UserCheck for RoleCheck {
    fn ok(&self, principal: &Principal) -> bool {
        principal.has_role(&self.role)
    }
}

impl<F> UserCheck for F
where
    F: Fn(&Principal) -> bool + Send + Sync,
{
    fn ok(&self, principal: &Principal) -> bool {
        self(principal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_principal_roles() {
        let principal = Principal::new("alice").with_role("editor");
        assert_eq!(principal.name(), "alice");
        assert!(principal.has_role("editor"));
        assert!(!principal.has_role("admin"));
    }

    #[test]
    fn test_role_check() {
        let check = RoleCheck::new("admin");
        assert!(check.ok(&Principal::new("root").with_role("admin")));
        assert!(!check.ok(&Principal::new("guest")));
    }
}
