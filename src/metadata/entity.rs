use std::collections::HashMap;

use crate::core::{DataType, EngineError, Operation, Result, Value};
use crate::security::PermissionExpression;

/// A declared scalar attribute.
#[derive(Debug, Clone)]
pub struct AttributeDef {
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
    permissions: HashMap<Operation, PermissionExpression>,
}

impl AttributeDef {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: true,
            permissions: HashMap::new(),
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Field-level permission override for one operation.
    pub fn with_permission(mut self, operation: Operation, expr: PermissionExpression) -> Self {
        self.permissions.insert(operation, expr);
        self
    }

    pub fn permission(&self, operation: Operation) -> Option<&PermissionExpression> {
        self.permissions.get(&operation)
    }

    pub fn validate(&self, value: &Value) -> Result<()> {
        if value.is_null() && !self.nullable {
            return Err(EngineError::ValidationFailed(format!(
                "attribute '{}' cannot be NULL",
                self.name
            )));
        }
        if !self.data_type.is_compatible(value) {
            return Err(EngineError::ValidationFailed(format!(
                "attribute '{}' expects {}, got {}",
                self.name,
                self.data_type,
                value.type_name()
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationKind {
    ToOne,
    ToMany,
}

/// A declared relationship to another registered type.
#[derive(Debug, Clone)]
pub struct RelationshipDef {
    pub name: String,
    pub target: String,
    pub kind: RelationKind,
    /// Relationship name on the target type pointing back at this one;
    /// the entity wrapper keeps both sides consistent through it.
    pub inverse: Option<String>,
    permissions: HashMap<Operation, PermissionExpression>,
}

impl RelationshipDef {
    pub fn to_many(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            kind: RelationKind::ToMany,
            inverse: None,
            permissions: HashMap::new(),
        }
    }

    pub fn to_one(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            kind: RelationKind::ToOne,
            inverse: None,
            permissions: HashMap::new(),
        }
    }

    pub fn with_inverse(mut self, inverse: impl Into<String>) -> Self {
        self.inverse = Some(inverse.into());
        self
    }

    pub fn with_permission(mut self, operation: Operation, expr: PermissionExpression) -> Self {
        self.permissions.insert(operation, expr);
        self
    }

    pub fn permission(&self, operation: Operation) -> Option<&PermissionExpression> {
        self.permissions.get(&operation)
    }
}

/// Schema of one entity type: attributes, relationships, and the
/// entity-level permission expressions per operation.
#[derive(Debug, Clone)]
pub struct EntityDef {
    pub name: String,
    pub id_attribute: String,
    attributes: Vec<AttributeDef>,
    relationships: Vec<RelationshipDef>,
    permissions: HashMap<Operation, PermissionExpression>,
}

impl EntityDef {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            name,
            id_attribute: "id".to_string(),
            attributes: vec![AttributeDef::new("id", DataType::Text)],
            relationships: Vec::new(),
            permissions: HashMap::new(),
        }
    }

    pub fn with_attribute(mut self, attribute: AttributeDef) -> Self {
        self.attributes.push(attribute);
        self
    }

    pub fn with_relationship(mut self, relationship: RelationshipDef) -> Self {
        self.relationships.push(relationship);
        self
    }

    pub fn with_permission(mut self, operation: Operation, expr: PermissionExpression) -> Self {
        self.permissions.insert(operation, expr);
        self
    }

    pub fn attributes(&self) -> &[AttributeDef] {
        &self.attributes
    }

    pub fn relationships(&self) -> &[RelationshipDef] {
        &self.relationships
    }

    pub fn attribute(&self, name: &str) -> Result<&AttributeDef> {
        self.attributes
            .iter()
            .find(|a| a.name == name)
            .ok_or_else(|| EngineError::UnknownField(name.to_string(), self.name.clone()))
    }

    pub fn relationship(&self, name: &str) -> Result<&RelationshipDef> {
        self.relationships
            .iter()
            .find(|r| r.name == name)
            .ok_or_else(|| EngineError::UnknownField(name.to_string(), self.name.clone()))
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.attributes.iter().any(|a| a.name == name)
            || self.relationships.iter().any(|r| r.name == name)
    }

    pub fn permission(&self, operation: Operation) -> Option<&PermissionExpression> {
        self.permissions.get(&operation)
    }
}
