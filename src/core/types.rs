use std::fmt;

use serde::{Deserialize, Serialize};

use super::Value;

/// The kind of access being performed on an entity or field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    Create,
    Read,
    Update,
    Delete,
}

impl Operation {
    pub const ALL: [Operation; 4] = [
        Operation::Create,
        Operation::Read,
        Operation::Update,
        Operation::Delete,
    ];
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Create => write!(f, "CREATE"),
            Operation::Read => write!(f, "READ"),
            Operation::Update => write!(f, "UPDATE"),
            Operation::Delete => write!(f, "DELETE"),
        }
    }
}

/// A point in the transaction commit protocol at which queued lifecycle
/// hooks run. Ordered: PreSecurity < PreFlush < PreCommit < PostCommit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Phase {
    PreSecurity,
    PreFlush,
    PreCommit,
    PostCommit,
}

impl Phase {
    pub const ALL: [Phase; 4] = [
        Phase::PreSecurity,
        Phase::PreFlush,
        Phase::PreCommit,
        Phase::PostCommit,
    ];

    pub fn index(self) -> usize {
        match self {
            Phase::PreSecurity => 0,
            Phase::PreFlush => 1,
            Phase::PreCommit => 2,
            Phase::PostCommit => 3,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::PreSecurity => write!(f, "PRESECURITY"),
            Phase::PreFlush => write!(f, "PREFLUSH"),
            Phase::PreCommit => write!(f, "PRECOMMIT"),
            Phase::PostCommit => write!(f, "POSTCOMMIT"),
        }
    }
}

/// Identity-map key: one logical entity per request.
///
/// The id component is the persisted id when known, otherwise the
/// per-request temporary UUID assigned at wrap time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    pub entity_type: String,
    pub id: String,
}

impl EntityKey {
    pub fn new(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.id)
    }
}

/// Declared attribute type, validated on every write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    Integer,
    Float,
    Boolean,
    Text,
    Timestamp,
}

impl DataType {
    pub fn is_compatible(&self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) => true,
            (DataType::Integer, Value::Integer(_)) => true,
            // Integers widen to float columns.
            (DataType::Float, Value::Float(_) | Value::Integer(_)) => true,
            (DataType::Boolean, Value::Boolean(_)) => true,
            (DataType::Text, Value::Text(_)) => true,
            (DataType::Timestamp, Value::Timestamp(_)) => true,
            _ => false,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Integer => write!(f, "INTEGER"),
            DataType::Float => write!(f, "FLOAT"),
            DataType::Boolean => write!(f, "BOOLEAN"),
            DataType::Text => write!(f, "TEXT"),
            DataType::Timestamp => write!(f, "TIMESTAMP"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_ordering() {
        assert!(Phase::PreSecurity < Phase::PreFlush);
        assert!(Phase::PreFlush < Phase::PreCommit);
        assert!(Phase::PreCommit < Phase::PostCommit);
    }

    #[test]
    fn test_data_type_compatibility() {
        assert!(DataType::Integer.is_compatible(&Value::Integer(1)));
        assert!(DataType::Integer.is_compatible(&Value::Null));
        assert!(!DataType::Integer.is_compatible(&Value::Text("x".into())));
        assert!(DataType::Float.is_compatible(&Value::Integer(1)));
    }
}
