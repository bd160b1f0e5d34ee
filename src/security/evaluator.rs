use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, trace};
use uuid::Uuid;

use crate::change::ChangeDiff;
use crate::core::{EngineError, Operation, Result};
use crate::resource::ManagedEntity;
use crate::scope::RequestScope;

use super::{Check, FilterPredicate, PermissionExpression};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DecisionKey {
    entity: Uuid,
    field: Option<String>,
    operation: Operation,
}

struct DeferredCheck {
    entity: Arc<ManagedEntity>,
    field: Option<String>,
    operation: Operation,
    expression: PermissionExpression,
    diff: Option<ChangeDiff>,
}

enum EvalMode {
    /// Mutation-time evaluation: commit checks pass provisionally and are
    /// queued for deferred evaluation.
    Mutation,
    /// Post-PRECOMMIT evaluation of the deferred queue: commit checks run
    /// for real.
    Commit,
}

/// Evaluates permission expressions for one request scope.
///
/// User-check results are cached per request; (entity, field, operation)
/// decisions are cached only when no change diff was in play, since checks
/// may inspect the pending change. Nothing is cached across requests.
pub struct PermissionEvaluator {
    user_cache: Mutex<HashMap<String, bool>>,
    decision_cache: Mutex<HashMap<DecisionKey, bool>>,
    deferred: Mutex<Vec<DeferredCheck>>,
}

impl PermissionEvaluator {
    pub fn new() -> Self {
        Self {
            user_cache: Mutex::new(HashMap::new()),
            decision_cache: Mutex::new(HashMap::new()),
            deferred: Mutex::new(Vec::new()),
        }
    }

    /// Entity-level check. Denial is an authorization error.
    pub fn check_entity(
        &self,
        scope: &RequestScope,
        entity: &Arc<ManagedEntity>,
        operation: Operation,
        diff: Option<&ChangeDiff>,
    ) -> Result<()> {
        if self.entity_allowed_with_diff(scope, entity, operation, diff)? {
            Ok(())
        } else {
            Err(EngineError::AuthorizationDenied(format!(
                "{} denied on {}",
                operation,
                entity.key()
            )))
        }
    }

    /// Entity-level check returning the decision instead of failing, used
    /// when denied members of a collection are omitted rather than fatal.
    pub fn entity_allowed(
        &self,
        scope: &RequestScope,
        entity: &Arc<ManagedEntity>,
        operation: Operation,
    ) -> Result<bool> {
        self.entity_allowed_with_diff(scope, entity, operation, None)
    }

    fn entity_allowed_with_diff(
        &self,
        scope: &RequestScope,
        entity: &Arc<ManagedEntity>,
        operation: Operation,
        diff: Option<&ChangeDiff>,
    ) -> Result<bool> {
        // Objects still under construction in this request have no
        // persisted state to protect; their CREATE check already ran.
        if operation == Operation::Read && scope.is_new(entity) {
            return Ok(true);
        }

        let expression = scope
            .metadata()
            .entity_permission(entity.entity_type(), operation)?;
        match expression {
            None => Ok(true),
            Some(expr) => self.decide(scope, entity, None, operation, diff, &expr),
        }
    }

    /// Field-level check. Denial is an authorization error.
    pub fn check_field(
        &self,
        scope: &RequestScope,
        entity: &Arc<ManagedEntity>,
        field: &str,
        operation: Operation,
        diff: Option<&ChangeDiff>,
    ) -> Result<()> {
        if self.field_allowed_with_diff(scope, entity, field, operation, diff)? {
            Ok(())
        } else {
            Err(EngineError::AuthorizationDenied(format!(
                "{} denied on field '{}' of {}",
                operation,
                field,
                entity.key()
            )))
        }
    }

    /// Field-level decision without failing; projection omits denied fields.
    pub fn field_allowed(
        &self,
        scope: &RequestScope,
        entity: &Arc<ManagedEntity>,
        field: &str,
        operation: Operation,
    ) -> Result<bool> {
        self.field_allowed_with_diff(scope, entity, field, operation, None)
    }

    fn field_allowed_with_diff(
        &self,
        scope: &RequestScope,
        entity: &Arc<ManagedEntity>,
        field: &str,
        operation: Operation,
        diff: Option<&ChangeDiff>,
    ) -> Result<bool> {
        if operation == Operation::Read && scope.is_new(entity) {
            return Ok(true);
        }

        // A field-level expression overrides the entity-level one.
        let expression = scope
            .metadata()
            .field_permission(entity.entity_type(), field, operation)?;
        match expression {
            None => Ok(true),
            Some(expr) => self.decide(scope, entity, Some(field), operation, diff, &expr),
        }
    }

    fn decide(
        &self,
        scope: &RequestScope,
        entity: &Arc<ManagedEntity>,
        field: Option<&str>,
        operation: Operation,
        diff: Option<&ChangeDiff>,
        expression: &PermissionExpression,
    ) -> Result<bool> {
        // Decisions that saw a pending change are never cached: the same
        // expression may be re-evaluated against a different diff later.
        let cacheable = diff.is_none();
        let key = DecisionKey {
            entity: entity.uuid(),
            field: field.map(str::to_string),
            operation,
        };

        if cacheable {
            if let Some(cached) = self.decision_cache.lock()?.get(&key) {
                trace!(entity = %entity.key(), %operation, "permission decision from cache");
                return Ok(*cached);
            }
        }

        let mut has_commit_checks = false;
        let allowed = self.evaluate(
            scope,
            entity,
            diff,
            expression,
            &EvalMode::Mutation,
            &mut has_commit_checks,
        )?;

        if allowed && has_commit_checks {
            self.deferred.lock()?.push(DeferredCheck {
                entity: Arc::clone(entity),
                field: field.map(str::to_string),
                operation,
                expression: expression.clone(),
                diff: diff.cloned(),
            });
        }

        if cacheable {
            self.decision_cache.lock()?.insert(key, allowed);
        }

        debug!(
            entity = %entity.key(),
            %operation,
            field = field.unwrap_or("<entity>"),
            allowed,
            "permission decision"
        );
        Ok(allowed)
    }

    fn evaluate(
        &self,
        scope: &RequestScope,
        entity: &Arc<ManagedEntity>,
        diff: Option<&ChangeDiff>,
        expression: &PermissionExpression,
        mode: &EvalMode,
        has_commit_checks: &mut bool,
    ) -> Result<bool> {
        match expression {
            PermissionExpression::Check(name) => {
                let check = scope.metadata().check(name)?;
                match check {
                    Check::User(user_check) => {
                        if let Some(cached) = self.user_cache.lock()?.get(name) {
                            return Ok(*cached);
                        }
                        let result = user_check.ok(scope.principal());
                        self.user_cache.lock()?.insert(name.clone(), result);
                        Ok(result)
                    }
                    Check::Operation(op_check) => Ok(op_check.ok(entity, scope, diff)),
                    Check::Commit(commit_check) => match mode {
                        EvalMode::Mutation => {
                            *has_commit_checks = true;
                            Ok(true)
                        }
                        EvalMode::Commit => Ok(commit_check.ok(entity, scope, diff)),
                    },
                    Check::Filter(filter_check) => {
                        Ok(filter_check.predicate(scope).matches(&entity.snapshot()))
                    }
                }
            }
            PermissionExpression::AllOf(children) => {
                for child in children {
                    if !self.evaluate(scope, entity, diff, child, mode, has_commit_checks)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            PermissionExpression::AnyOf(children) => {
                for child in children {
                    if self.evaluate(scope, entity, diff, child, mode, has_commit_checks)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            PermissionExpression::Not(child) => Ok(!self.evaluate(
                scope,
                entity,
                diff,
                child,
                mode,
                has_commit_checks,
            )?),
        }
    }

    /// Composes a storage-level predicate for READ pre-filtering of a
    /// collection. Pushdown only applies when every leaf of the type's READ
    /// expression is a filter check; any other check kind forces per-object
    /// evaluation after load.
    pub fn read_filter(
        &self,
        scope: &RequestScope,
        entity_type: &str,
    ) -> Result<Option<FilterPredicate>> {
        let Some(expression) = scope
            .metadata()
            .entity_permission(entity_type, Operation::Read)?
        else {
            return Ok(None);
        };
        Ok(self.pushdown(scope, &expression))
    }

    fn pushdown(
        &self,
        scope: &RequestScope,
        expression: &PermissionExpression,
    ) -> Option<FilterPredicate> {
        match expression {
            PermissionExpression::Check(name) => match scope.metadata().check(name).ok()? {
                Check::Filter(filter_check) => Some(filter_check.predicate(scope)),
                _ => None,
            },
            PermissionExpression::AllOf(children) => {
                let predicates = children
                    .iter()
                    .map(|c| self.pushdown(scope, c))
                    .collect::<Option<Vec<_>>>()?;
                Some(FilterPredicate::And(predicates))
            }
            PermissionExpression::AnyOf(children) => {
                let predicates = children
                    .iter()
                    .map(|c| self.pushdown(scope, c))
                    .collect::<Option<Vec<_>>>()?;
                Some(FilterPredicate::Or(predicates))
            }
            PermissionExpression::Not(child) => self
                .pushdown(scope, child)
                .map(|p| FilterPredicate::Not(Box::new(p))),
        }
    }

    /// Evaluates every deferred commit check against the fully mutated,
    /// about-to-be-committed state. Called after PRECOMMIT triggers; a
    /// failure here aborts the commit even though earlier hooks already ran.
    pub fn run_deferred(&self, scope: &RequestScope) -> Result<()> {
        let pending = std::mem::take(&mut *self.deferred.lock()?);
        for check in pending {
            let mut unused = false;
            let allowed = self.evaluate(
                scope,
                &check.entity,
                check.diff.as_ref(),
                &check.expression,
                &EvalMode::Commit,
                &mut unused,
            )?;
            if !allowed {
                return Err(EngineError::AuthorizationDenied(format!(
                    "commit check denied {} on {}{}",
                    check.operation,
                    check.entity.key(),
                    check
                        .field
                        .map(|f| format!(" (field '{}')", f))
                        .unwrap_or_default()
                )));
            }
        }
        Ok(())
    }
}

impl Default for PermissionEvaluator {
    fn default() -> Self {
        Self::new()
    }
}
