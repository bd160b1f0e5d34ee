use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::core::{EngineError, EntityRecord, Operation, Phase, Result, Value};
use crate::lifecycle::{HookScope, LifecycleHook};
use crate::security::{Check, CommitCheck, FilterCheck, OperationCheck, PermissionExpression, UserCheck};

use super::EntityDef;

type HookTable = HashMap<(String, Operation, Phase), Vec<(HookScope, Arc<dyn LifecycleHook>)>>;

/// Immutable startup-built lookup structure for entity schemas, named
/// checks, and lifecycle hook bindings. Safe for concurrent reads.
pub struct MetadataRegistry {
    entities: HashMap<String, EntityDef>,
    checks: HashMap<String, Check>,
    hooks: HookTable,
}

impl MetadataRegistry {
    pub fn builder() -> MetadataRegistryBuilder {
        MetadataRegistryBuilder::new()
    }

    pub fn entity(&self, entity_type: &str) -> Result<&EntityDef> {
        self.entities
            .get(entity_type)
            .ok_or_else(|| EngineError::UnknownType(entity_type.to_string()))
    }

    pub fn check(&self, name: &str) -> Result<Check> {
        self.checks
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::UnknownCheck(name.to_string()))
    }

    /// Entity-level permission expression for an operation, if declared.
    pub fn entity_permission(
        &self,
        entity_type: &str,
        operation: Operation,
    ) -> Result<Option<PermissionExpression>> {
        Ok(self.entity(entity_type)?.permission(operation).cloned())
    }

    /// Field-level expression for an attribute or relationship. A field
    /// declaration overrides the entity-level one; absent both, access is
    /// unguarded.
    pub fn field_permission(
        &self,
        entity_type: &str,
        field: &str,
        operation: Operation,
    ) -> Result<Option<PermissionExpression>> {
        let entity = self.entity(entity_type)?;

        let field_level = entity
            .attributes()
            .iter()
            .find(|a| a.name == field)
            .and_then(|a| a.permission(operation))
            .or_else(|| {
                entity
                    .relationships()
                    .iter()
                    .find(|r| r.name == field)
                    .and_then(|r| r.permission(operation))
            });

        if !entity.has_field(field) {
            return Err(EngineError::UnknownField(
                field.to_string(),
                entity_type.to_string(),
            ));
        }

        Ok(field_level.or_else(|| entity.permission(operation)).cloned())
    }

    /// Hook bindings for (type, operation, phase), in registration order.
    pub fn hooks_for(
        &self,
        entity_type: &str,
        operation: Operation,
        phase: Phase,
    ) -> &[(HookScope, Arc<dyn LifecycleHook>)] {
        self.hooks
            .get(&(entity_type.to_string(), operation, phase))
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Builds an empty instance of a type: NULL attributes, empty
    /// relationships.
    pub fn new_record(&self, entity_type: &str) -> Result<EntityRecord> {
        let def = self.entity(entity_type)?;
        let mut record = EntityRecord::new();
        for attribute in def.attributes() {
            record.set_attribute(attribute.name.clone(), Value::Null);
        }
        for relationship in def.relationships() {
            match relationship.kind {
                super::RelationKind::ToOne => record.set_to_one(relationship.name.clone(), None),
                super::RelationKind::ToMany => {
                    record.set_to_many(relationship.name.clone(), Vec::new())
                }
            }
        }
        Ok(record)
    }
}

impl std::fmt::Debug for MetadataRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataRegistry")
            .field("entities", &self.entities.keys().collect::<Vec<_>>())
            .field("checks", &self.checks.keys().collect::<Vec<_>>())
            .field("hook_bindings", &self.hooks.len())
            .finish()
    }
}

/// Collects entity definitions, named checks, and hook bindings, then
/// validates cross-references in [`MetadataRegistryBuilder::build`].
pub struct MetadataRegistryBuilder {
    entities: HashMap<String, EntityDef>,
    checks: HashMap<String, Check>,
    hooks: HookTable,
}

impl MetadataRegistryBuilder {
    pub fn new() -> Self {
        Self {
            entities: HashMap::new(),
            checks: HashMap::new(),
            hooks: HashMap::new(),
        }
    }

    pub fn register_entity(mut self, entity: EntityDef) -> Self {
        self.entities.insert(entity.name.clone(), entity);
        self
    }

    pub fn register_check(mut self, name: impl Into<String>, check: Check) -> Self {
        self.checks.insert(name.into(), check);
        self
    }

    pub fn user_check(self, name: impl Into<String>, check: impl UserCheck + 'static) -> Self {
        self.register_check(name, Check::User(Arc::new(check)))
    }

    pub fn operation_check(
        self,
        name: impl Into<String>,
        check: impl OperationCheck + 'static,
    ) -> Self {
        self.register_check(name, Check::Operation(Arc::new(check)))
    }

    pub fn commit_check(self, name: impl Into<String>, check: impl CommitCheck + 'static) -> Self {
        self.register_check(name, Check::Commit(Arc::new(check)))
    }

    pub fn filter_check(self, name: impl Into<String>, check: impl FilterCheck + 'static) -> Self {
        self.register_check(name, Check::Filter(Arc::new(check)))
    }

    pub fn bind_hook(
        mut self,
        entity_type: impl Into<String>,
        operation: Operation,
        phase: Phase,
        scope: HookScope,
        hook: impl LifecycleHook + 'static,
    ) -> Self {
        self.hooks
            .entry((entity_type.into(), operation, phase))
            .or_default()
            .push((scope, Arc::new(hook)));
        self
    }

    /// Validates every cross-reference and freezes the registry.
    pub fn build(self) -> Result<MetadataRegistry> {
        for entity in self.entities.values() {
            for relationship in entity.relationships() {
                let target = self.entities.get(&relationship.target).ok_or_else(|| {
                    EngineError::ValidationFailed(format!(
                        "relationship '{}.{}' targets unregistered type '{}'",
                        entity.name, relationship.name, relationship.target
                    ))
                })?;
                if let Some(inverse) = &relationship.inverse {
                    if target.relationship(inverse).is_err() {
                        return Err(EngineError::ValidationFailed(format!(
                            "relationship '{}.{}' names missing inverse '{}.{}'",
                            entity.name, relationship.name, relationship.target, inverse
                        )));
                    }
                }
            }

            self.validate_expression_checks(entity.name.as_str(), None, entity)?;
        }

        for ((entity_type, _, _), bindings) in &self.hooks {
            let entity = self.entities.get(entity_type).ok_or_else(|| {
                EngineError::ValidationFailed(format!(
                    "hook bound to unregistered type '{}'",
                    entity_type
                ))
            })?;
            for (scope, _) in bindings {
                if let HookScope::Field(field) = scope {
                    if !entity.has_field(field) {
                        return Err(EngineError::ValidationFailed(format!(
                            "hook bound to missing field '{}.{}'",
                            entity_type, field
                        )));
                    }
                }
            }
        }

        debug!(
            entities = self.entities.len(),
            checks = self.checks.len(),
            hook_bindings = self.hooks.values().map(Vec::len).sum::<usize>(),
            "metadata registry built"
        );

        Ok(MetadataRegistry {
            entities: self.entities,
            checks: self.checks,
            hooks: self.hooks,
        })
    }

    fn validate_expression_checks(
        &self,
        entity_type: &str,
        field: Option<&str>,
        entity: &EntityDef,
    ) -> Result<()> {
        let mut expressions: Vec<(&PermissionExpression, Option<&str>)> = Vec::new();
        for operation in Operation::ALL {
            if let Some(expr) = entity.permission(operation) {
                expressions.push((expr, field));
            }
        }
        for attribute in entity.attributes() {
            for operation in Operation::ALL {
                if let Some(expr) = attribute.permission(operation) {
                    expressions.push((expr, Some(attribute.name.as_str())));
                }
            }
        }
        for relationship in entity.relationships() {
            for operation in Operation::ALL {
                if let Some(expr) = relationship.permission(operation) {
                    expressions.push((expr, Some(relationship.name.as_str())));
                }
            }
        }

        for (expression, field) in expressions {
            for name in expression.check_names() {
                if !self.checks.contains_key(name) {
                    return Err(EngineError::ValidationFailed(format!(
                        "permission on '{}{}' references unregistered check '{}'",
                        entity_type,
                        field.map(|f| format!(".{}", f)).unwrap_or_default(),
                        name
                    )));
                }
            }
        }
        Ok(())
    }
}

impl Default for MetadataRegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::DataType;
    use crate::metadata::{AttributeDef, RelationshipDef};
    use crate::security::Principal;

    fn base_builder() -> MetadataRegistryBuilder {
        MetadataRegistry::builder()
            .user_check("anyone", |_: &Principal| true)
            .register_entity(
                EntityDef::new("book")
                    .with_attribute(AttributeDef::new("title", DataType::Text))
                    .with_relationship(
                        RelationshipDef::to_many("chapters", "chapter").with_inverse("book"),
                    ),
            )
            .register_entity(
                EntityDef::new("chapter").with_relationship(RelationshipDef::to_one("book", "book")),
            )
    }

    #[test]
    fn test_build_and_lookup() {
        let registry = base_builder().build().unwrap();
        assert!(registry.entity("book").is_ok());
        assert!(matches!(
            registry.entity("magazine"),
            Err(EngineError::UnknownType(_))
        ));

        let record = registry.new_record("book").unwrap();
        assert!(record.attribute("title").is_null());
        assert!(record.to_many("chapters").is_empty());
    }

    #[test]
    fn test_build_rejects_missing_relationship_target() {
        let result = MetadataRegistry::builder()
            .register_entity(
                EntityDef::new("book")
                    .with_relationship(RelationshipDef::to_many("chapters", "chapter")),
            )
            .build();
        assert!(matches!(result, Err(EngineError::ValidationFailed(_))));
    }

    #[test]
    fn test_build_rejects_unregistered_check() {
        let result = MetadataRegistry::builder()
            .register_entity(
                EntityDef::new("book")
                    .with_permission(Operation::Read, PermissionExpression::check("nobody")),
            )
            .build();
        assert!(matches!(result, Err(EngineError::ValidationFailed(_))));
    }

    #[test]
    fn test_field_permission_falls_back_to_entity_level() {
        let registry = MetadataRegistry::builder()
            .user_check("anyone", |_: &Principal| true)
            .register_entity(
                EntityDef::new("book")
                    .with_permission(Operation::Read, PermissionExpression::check("anyone"))
                    .with_attribute(AttributeDef::new("title", DataType::Text)),
            )
            .build()
            .unwrap();

        let expr = registry
            .field_permission("book", "title", Operation::Read)
            .unwrap();
        assert_eq!(expr, Some(PermissionExpression::check("anyone")));
    }
}
