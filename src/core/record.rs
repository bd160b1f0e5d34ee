use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{EntityKey, Value};

/// The raw, schema-less state of one domain object instance.
///
/// Attribute values and relationship membership are stored by field name;
/// the metadata registry owns the schema and validates access. Relationship
/// members are referenced by [`EntityKey`] so a record never holds another
/// record, which keeps cyclic graphs representable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    attributes: BTreeMap<String, Value>,
    to_one: BTreeMap<String, Option<EntityKey>>,
    to_many: BTreeMap<String, Vec<EntityKey>>,
}

impl EntityRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attribute(&self, name: &str) -> Value {
        self.attributes.get(name).cloned().unwrap_or(Value::Null)
    }

    pub fn set_attribute(&mut self, name: impl Into<String>, value: Value) {
        self.attributes.insert(name.into(), value);
    }

    pub fn attributes(&self) -> &BTreeMap<String, Value> {
        &self.attributes
    }

    pub fn to_one(&self, name: &str) -> Option<EntityKey> {
        self.to_one.get(name).cloned().flatten()
    }

    pub fn set_to_one(&mut self, name: impl Into<String>, target: Option<EntityKey>) {
        self.to_one.insert(name.into(), target);
    }

    /// Members of a to-many relationship, in insertion order.
    pub fn to_many(&self, name: &str) -> Vec<EntityKey> {
        self.to_many.get(name).cloned().unwrap_or_default()
    }

    pub fn set_to_many(&mut self, name: impl Into<String>, members: Vec<EntityKey>) {
        let mut deduped: Vec<EntityKey> = Vec::with_capacity(members.len());
        for member in members {
            if !deduped.contains(&member) {
                deduped.push(member);
            }
        }
        self.to_many.insert(name.into(), deduped);
    }

    /// Adds a member, preserving order and uniqueness. Returns false when
    /// the member was already present.
    pub fn add_to_many(&mut self, name: &str, member: EntityKey) -> bool {
        let members = self.to_many.entry(name.to_string()).or_default();
        if members.contains(&member) {
            return false;
        }
        members.push(member);
        true
    }

    /// Removes a member. Returns false when it was not present.
    pub fn remove_to_many(&mut self, name: &str, member: &EntityKey) -> bool {
        match self.to_many.get_mut(name) {
            Some(members) => {
                let before = members.len();
                members.retain(|m| m != member);
                members.len() != before
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_attribute_reads_null() {
        let record = EntityRecord::new();
        assert_eq!(record.attribute("title"), Value::Null);
    }

    #[test]
    fn test_to_many_is_a_set() {
        let mut record = EntityRecord::new();
        let child = EntityKey::new("child", "1");

        assert!(record.add_to_many("children", child.clone()));
        assert!(!record.add_to_many("children", child.clone()));
        assert_eq!(record.to_many("children").len(), 1);

        assert!(record.remove_to_many("children", &child));
        assert!(!record.remove_to_many("children", &child));
        assert!(record.to_many("children").is_empty());
    }

    #[test]
    fn test_set_to_many_dedups() {
        let mut record = EntityRecord::new();
        let a = EntityKey::new("child", "a");
        record.set_to_many("children", vec![a.clone(), a.clone()]);
        assert_eq!(record.to_many("children"), vec![a]);
    }
}
