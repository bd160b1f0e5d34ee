// ============================================================================
// Change Tracking
// ============================================================================
//
// A ChangeDiff captures the before/after state of one mutation. It is
// computed from the pre-mutation state, attached to the lifecycle events
// published for that mutation, and handed to every hook and check that
// inspects the change.
//
// ============================================================================

use crate::core::{EntityKey, Value};

/// The before/after description of a single field or relationship mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeDiff {
    /// Scalar attribute change: direct old/new pair.
    Attribute {
        field: String,
        original: Value,
        modified: Value,
    },

    /// Collection relationship change. Both sides are treated as sets;
    /// `added` and `removed` are the set differences, `modified` the full
    /// candidate membership.
    Relationship {
        field: String,
        original: Vec<EntityKey>,
        modified: Vec<EntityKey>,
        added: Vec<EntityKey>,
        removed: Vec<EntityKey>,
    },
}

impl ChangeDiff {
    /// Diff a scalar attribute. Must be computed before the write lands.
    pub fn attribute(field: impl Into<String>, original: Value, modified: Value) -> Self {
        ChangeDiff::Attribute {
            field: field.into(),
            original,
            modified,
        }
    }

    /// Diff a collection relationship: `added = candidate - original`,
    /// `removed = original - candidate`.
    pub fn relationship(
        field: impl Into<String>,
        original: Vec<EntityKey>,
        candidate: Vec<EntityKey>,
    ) -> Self {
        let added = candidate
            .iter()
            .filter(|m| !original.contains(m))
            .cloned()
            .collect();
        let removed = original
            .iter()
            .filter(|m| !candidate.contains(m))
            .cloned()
            .collect();

        ChangeDiff::Relationship {
            field: field.into(),
            original,
            modified: candidate,
            added,
            removed,
        }
    }

    pub fn field(&self) -> &str {
        match self {
            ChangeDiff::Attribute { field, .. } => field,
            ChangeDiff::Relationship { field, .. } => field,
        }
    }

    /// True when the mutation is a no-op on the tracked state.
    pub fn is_empty(&self) -> bool {
        match self {
            ChangeDiff::Attribute {
                original, modified, ..
            } => original == modified,
            ChangeDiff::Relationship { added, removed, .. } => {
                added.is_empty() && removed.is_empty()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: &str) -> EntityKey {
        EntityKey::new("child", id)
    }

    #[test]
    fn test_attribute_diff() {
        let diff = ChangeDiff::attribute("title", Value::Text("a".into()), Value::Text("b".into()));
        assert_eq!(diff.field(), "title");
        assert!(!diff.is_empty());
    }

    #[test]
    fn test_relationship_set_difference() {
        let diff = ChangeDiff::relationship(
            "children",
            vec![key("1"), key("2")],
            vec![key("1"), key("3")],
        );
        match &diff {
            ChangeDiff::Relationship { added, removed, .. } => {
                assert_eq!(added, &vec![key("3")]);
                assert_eq!(removed, &vec![key("2")]);
            }
            _ => panic!("expected relationship diff"),
        }
    }

    #[test]
    fn test_diff_of_stable_state_is_empty() {
        // Re-diffing the candidate against itself yields an empty diff.
        let stable = vec![key("1"), key("3")];
        let diff = ChangeDiff::relationship("children", stable.clone(), stable);
        assert!(diff.is_empty());

        let scalar = ChangeDiff::attribute("title", Value::Integer(7), Value::Integer(7));
        assert!(scalar.is_empty());
    }
}
