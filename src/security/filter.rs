use std::cmp::Ordering;

use crate::core::{EntityRecord, Value};

/// A storage-level predicate over entity records.
///
/// Filter checks produce these so the storage transaction can exclude
/// denied objects before they are loaded. The same predicate evaluates
/// in-memory against a single record when a collection pushdown is not in
/// play.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterPredicate {
    Eq(String, Value),
    Ne(String, Value),
    Lt(String, Value),
    Le(String, Value),
    Gt(String, Value),
    Ge(String, Value),
    In(String, Vec<Value>),
    IsNull(String),
    NotNull(String),
    And(Vec<FilterPredicate>),
    Or(Vec<FilterPredicate>),
    Not(Box<FilterPredicate>),
}

impl FilterPredicate {
    pub fn matches(&self, record: &EntityRecord) -> bool {
        match self {
            FilterPredicate::Eq(field, value) => record.attribute(field) == *value,
            FilterPredicate::Ne(field, value) => record.attribute(field) != *value,
            FilterPredicate::Lt(field, value) => {
                Self::ordered(record, field, value, &[Ordering::Less])
            }
            FilterPredicate::Le(field, value) => {
                Self::ordered(record, field, value, &[Ordering::Less, Ordering::Equal])
            }
            FilterPredicate::Gt(field, value) => {
                Self::ordered(record, field, value, &[Ordering::Greater])
            }
            FilterPredicate::Ge(field, value) => {
                Self::ordered(record, field, value, &[Ordering::Greater, Ordering::Equal])
            }
            FilterPredicate::In(field, values) => {
                let actual = record.attribute(field);
                values.iter().any(|v| *v == actual)
            }
            FilterPredicate::IsNull(field) => record.attribute(field).is_null(),
            FilterPredicate::NotNull(field) => !record.attribute(field).is_null(),
            FilterPredicate::And(children) => children.iter().all(|p| p.matches(record)),
            FilterPredicate::Or(children) => children.iter().any(|p| p.matches(record)),
            FilterPredicate::Not(child) => !child.matches(record),
        }
    }

    fn ordered(record: &EntityRecord, field: &str, value: &Value, accept: &[Ordering]) -> bool {
        let actual = record.attribute(field);
        // NULL never satisfies a range comparison.
        if actual.is_null() || value.is_null() {
            return false;
        }
        accept.contains(&actual.compare(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(status: &str, rank: i64) -> EntityRecord {
        let mut r = EntityRecord::new();
        r.set_attribute("status", Value::Text(status.into()));
        r.set_attribute("rank", Value::Integer(rank));
        r
    }

    #[test]
    fn test_comparisons() {
        let r = record("published", 5);
        assert!(FilterPredicate::Eq("status".into(), "published".into()).matches(&r));
        assert!(FilterPredicate::Gt("rank".into(), Value::Integer(4)).matches(&r));
        assert!(!FilterPredicate::Lt("rank".into(), Value::Integer(5)).matches(&r));
        assert!(FilterPredicate::In(
            "rank".into(),
            vec![Value::Integer(1), Value::Integer(5)]
        )
        .matches(&r));
    }

    #[test]
    fn test_null_never_satisfies_ranges() {
        let r = EntityRecord::new();
        assert!(!FilterPredicate::Gt("rank".into(), Value::Integer(0)).matches(&r));
        assert!(FilterPredicate::IsNull("rank".into()).matches(&r));
        assert!(!FilterPredicate::NotNull("rank".into()).matches(&r));
    }

    #[test]
    fn test_boolean_composition() {
        let r = record("draft", 2);
        let pred = FilterPredicate::Or(vec![
            FilterPredicate::Eq("status".into(), "published".into()),
            FilterPredicate::And(vec![
                FilterPredicate::Eq("status".into(), "draft".into()),
                FilterPredicate::Le("rank".into(), Value::Integer(3)),
            ]),
        ]);
        assert!(pred.matches(&r));
        assert!(!FilterPredicate::Not(Box::new(pred)).matches(&r));
    }
}
