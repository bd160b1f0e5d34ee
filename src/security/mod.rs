// ============================================================================
// Security Module
// ============================================================================
//
// Permission expressions are boolean trees over named checks, declared in
// metadata per type/field/operation. Evaluation short-circuits, caches
// per-request, and distinguishes four check kinds by timing:
//
// - user checks:       once per request, principal only
// - operation checks:  in-memory object state at mutation time
// - filter checks:     produce a storage-level predicate
// - commit checks:     deferred until after PRECOMMIT triggers
//
// ============================================================================

pub mod checks;
pub mod evaluator;
pub mod expression;
pub mod filter;

pub use checks::{Check, CommitCheck, FilterCheck, OperationCheck, Principal, RoleCheck, UserCheck};
pub use evaluator::PermissionEvaluator;
pub use expression::PermissionExpression;
pub use filter::FilterPredicate;
