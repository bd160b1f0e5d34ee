// ============================================================================
// Managed Entity
// ============================================================================
//
// The transaction-scoped wrapper for one domain object instance. Every
// read, write, relationship change, and deletion flows through it: it
// validates against metadata, evaluates permission expressions, computes
// the change diff before the mutation lands, applies the write, and
// publishes the lifecycle events that feed the phase queues.
//
// Per mutation: permission -> diff -> mutate -> post-mutation field check
// -> events published (PRESECURITY runs inline, the rest deferred).
//
// ============================================================================

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use serde::Serialize;
use tracing::trace;
use uuid::Uuid;

use crate::change::ChangeDiff;
use crate::core::{EngineError, EntityKey, EntityRecord, Operation, Result, Value};
use crate::lifecycle::CrudEvent;
use crate::metadata::{RelationKind, RelationshipDef};
use crate::scope::RequestScope;

/// A permission-filtered projection of one entity, ready for the wire
/// layer to encode.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceObject {
    pub entity_type: String,
    pub id: String,
    pub attributes: BTreeMap<String, Value>,
    pub relationships: BTreeMap<String, RelationValue>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum RelationValue {
    ToOne(Option<EntityKey>),
    ToMany(Vec<EntityKey>),
}

impl ResourceObject {
    pub fn to_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Transaction-scoped handle for one domain object instance.
///
/// At most one wrapper exists per logical entity per request (the scope's
/// identity map enforces it), so traversals re-entering an entity reuse
/// the same handle and cycles terminate by construction.
pub struct ManagedEntity {
    uuid: Uuid,
    key: EntityKey,
    /// Relationship name this entity was reached through, when it was
    /// loaded by traversing a parent.
    owning_relation: Option<String>,
    record: RwLock<EntityRecord>,
}

impl ManagedEntity {
    pub(crate) fn from_parts(
        uuid: Uuid,
        key: EntityKey,
        record: EntityRecord,
        owning_relation: Option<String>,
    ) -> Self {
        Self {
            uuid,
            key,
            owning_relation,
            record: RwLock::new(record),
        }
    }

    /// Allocates a wrapper for a brand-new instance, registers it as new
    /// in the scope, runs the CREATE permission check, and publishes the
    /// class-level CREATE event (its PRESECURITY hooks fire right here).
    pub fn create(
        scope: &RequestScope,
        entity_type: &str,
        id: Option<Value>,
    ) -> Result<Arc<ManagedEntity>> {
        let def = scope.metadata().entity(entity_type)?;
        let mut record = scope.metadata().new_record(entity_type)?;

        let uuid = Uuid::new_v4();
        let id_string = match id {
            Some(id_value) => {
                def.attribute(&def.id_attribute)?.validate(&id_value)?;
                let id_string = id_value.as_id_string();
                record.set_attribute(def.id_attribute.clone(), id_value);
                id_string
            }
            // Forward references within one payload resolve through the
            // temporary id until the entity is persisted.
            None => uuid.to_string(),
        };

        let entity = Arc::new(ManagedEntity::from_parts(
            uuid,
            EntityKey::new(entity_type, id_string),
            record,
            None,
        ));
        scope.register_created(&entity)?;
        trace!(entity = %entity.key, "entity created");

        scope
            .permissions()
            .check_entity(scope, &entity, Operation::Create, None)?;
        scope.publish(CrudEvent::class_level(Operation::Create, Arc::clone(&entity)))?;
        Ok(entity)
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn key(&self) -> &EntityKey {
        &self.key
    }

    pub fn entity_type(&self) -> &str {
        &self.key.entity_type
    }

    pub fn owning_relation(&self) -> Option<&str> {
        self.owning_relation.as_deref()
    }

    /// Copy of the underlying record, for checks and predicates.
    pub fn snapshot(&self) -> EntityRecord {
        self.record
            .read()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    /// Permission-free attribute access for checks and hooks.
    pub fn peek(&self, name: &str) -> Value {
        self.record
            .read()
            .map(|r| r.attribute(name))
            .unwrap_or(Value::Null)
    }

    pub(crate) fn with_record<T>(&self, f: impl FnOnce(&EntityRecord) -> T) -> Result<T> {
        Ok(f(&*self.record.read()?))
    }

    fn with_record_mut<T>(&self, f: impl FnOnce(&mut EntityRecord) -> T) -> Result<T> {
        Ok(f(&mut *self.record.write()?))
    }

    /// Assigns the persisted id right before the first save when none was
    /// supplied at creation: the temporary id becomes the stored one.
    pub(crate) fn ensure_persisted_id(&self, id_attribute: &str) -> Result<()> {
        let mut record = self.record.write()?;
        if record.attribute(id_attribute).is_null() {
            record.set_attribute(id_attribute, Value::Text(self.key.id.clone()));
        }
        Ok(())
    }

    /// CREATE while the entity is still under construction in this
    /// request, UPDATE afterwards. Decides which hooks a mutation feeds.
    fn effective_operation(self: &Arc<Self>, scope: &RequestScope) -> Operation {
        if scope.is_new(self) {
            Operation::Create
        } else {
            Operation::Update
        }
    }

    // ------------------------------------------------------------------
    // Attributes
    // ------------------------------------------------------------------

    /// Permission-checked attribute read. Fails closed; pure reads fire no
    /// hooks.
    pub fn get_attribute(self: &Arc<Self>, scope: &RequestScope, name: &str) -> Result<Value> {
        let def = scope.metadata().entity(self.entity_type())?;
        def.attribute(name)?;
        scope
            .permissions()
            .check_field(scope, self, name, Operation::Read, None)?;
        self.with_record(|r| r.attribute(name))
    }

    /// Permission-checked attribute write. The diff is computed from the
    /// pre-mutation state; the field-level check runs against the mutated
    /// state since checks may inspect the change.
    pub fn update_attribute(
        self: &Arc<Self>,
        scope: &RequestScope,
        name: &str,
        value: Value,
    ) -> Result<()> {
        let def = scope.metadata().entity(self.entity_type())?;
        let attribute = def.attribute(name)?;
        if name == def.id_attribute {
            return Err(EngineError::ValidationFailed(format!(
                "attribute '{}' is assigned at creation and immutable",
                name
            )));
        }
        attribute.validate(&value)?;

        let operation = self.effective_operation(scope);
        if operation == Operation::Update {
            scope
                .permissions()
                .check_entity(scope, self, Operation::Update, None)?;
        }

        let original = self.with_record(|r| r.attribute(name))?;
        let diff = ChangeDiff::attribute(name, original, value.clone());
        if diff.is_empty() {
            return Ok(());
        }

        self.with_record_mut(|r| r.set_attribute(name, value))?;
        scope
            .permissions()
            .check_field(scope, self, name, operation, Some(&diff))?;

        scope.publish(CrudEvent::field_level(
            operation,
            Arc::clone(self),
            name,
            diff,
        ))?;
        scope.publish(CrudEvent::class_level(operation, Arc::clone(self)))?;
        scope.mark_dirty(self);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Relationships
    // ------------------------------------------------------------------

    /// Adds one member to a to-many relationship.
    pub async fn add_relation(
        self: &Arc<Self>,
        scope: &RequestScope,
        name: &str,
        member: &Arc<ManagedEntity>,
    ) -> Result<()> {
        let mut candidate = self.with_record(|r| r.to_many(name))?;
        if !candidate.contains(member.key()) {
            candidate.push(member.key().clone());
        }
        self.apply_to_many(scope, name, candidate).await
    }

    /// Removes one member from a to-many relationship.
    pub async fn remove_relation(
        self: &Arc<Self>,
        scope: &RequestScope,
        name: &str,
        member: &Arc<ManagedEntity>,
    ) -> Result<()> {
        let mut candidate = self.with_record(|r| r.to_many(name))?;
        candidate.retain(|k| k != member.key());
        self.apply_to_many(scope, name, candidate).await
    }

    /// Replaces the full membership of a to-many relationship.
    pub async fn replace_relation(
        self: &Arc<Self>,
        scope: &RequestScope,
        name: &str,
        members: &[Arc<ManagedEntity>],
    ) -> Result<()> {
        let candidate: Vec<EntityKey> = members.iter().map(|m| m.key().clone()).collect();
        self.apply_to_many(scope, name, candidate).await
    }

    /// Points a to-one relationship at a new target (or clears it).
    pub async fn set_relation(
        self: &Arc<Self>,
        scope: &RequestScope,
        name: &str,
        target: Option<&Arc<ManagedEntity>>,
    ) -> Result<()> {
        let def = scope.metadata().entity(self.entity_type())?;
        let rel = def.relationship(name)?;
        if rel.kind != RelationKind::ToOne {
            return Err(EngineError::ValidationFailed(format!(
                "relationship '{}.{}' is to-many; use replace_relation",
                self.entity_type(),
                name
            )));
        }

        let original: Vec<EntityKey> = self.with_record(|r| r.to_one(name))?.into_iter().collect();
        let candidate: Vec<EntityKey> = target.map(|t| t.key().clone()).into_iter().collect();
        let diff = ChangeDiff::relationship(name, original, candidate.clone());
        if diff.is_empty() {
            return Ok(());
        }

        let operation = self.effective_operation(scope);
        if operation == Operation::Update {
            scope
                .permissions()
                .check_entity(scope, self, Operation::Update, None)?;
        }

        self.with_record_mut(|r| r.set_to_one(name, candidate.first().cloned()))?;
        scope
            .permissions()
            .check_field(scope, self, name, operation, Some(&diff))?;

        self.apply_inverse_bookkeeping(scope, rel.clone(), &diff)
            .await?;

        scope.publish(CrudEvent::field_level(
            operation,
            Arc::clone(self),
            name,
            diff,
        ))?;
        scope.publish(CrudEvent::class_level(operation, Arc::clone(self)))?;
        scope.mark_dirty(self);
        Ok(())
    }

    async fn apply_to_many(
        self: &Arc<Self>,
        scope: &RequestScope,
        name: &str,
        candidate: Vec<EntityKey>,
    ) -> Result<()> {
        let def = scope.metadata().entity(self.entity_type())?;
        let rel = def.relationship(name)?;
        if rel.kind != RelationKind::ToMany {
            return Err(EngineError::ValidationFailed(format!(
                "relationship '{}.{}' is to-one; use set_relation",
                self.entity_type(),
                name
            )));
        }

        let original = self.with_record(|r| r.to_many(name))?;
        let diff = ChangeDiff::relationship(name, original, candidate.clone());
        if diff.is_empty() {
            return Ok(());
        }

        // CREATE-vs-UPDATE at the owning side depends on whether the
        // owner itself is new, not on what happened to the members.
        let operation = self.effective_operation(scope);
        if operation == Operation::Update {
            scope
                .permissions()
                .check_entity(scope, self, Operation::Update, None)?;
        }

        self.with_record_mut(|r| r.set_to_many(name, candidate))?;
        scope
            .permissions()
            .check_field(scope, self, name, operation, Some(&diff))?;

        self.apply_inverse_bookkeeping(scope, rel.clone(), &diff)
            .await?;

        scope.publish(CrudEvent::field_level(
            operation,
            Arc::clone(self),
            name,
            diff,
        ))?;
        scope.publish(CrudEvent::class_level(operation, Arc::clone(self)))?;
        scope.mark_dirty(self);
        Ok(())
    }

    /// Keeps the other side of a bidirectional relationship consistent.
    /// The identity map supplies already-reached members without recursion;
    /// members the request never touched are loaded and wrapped so their
    /// stored inverse pointer is corrected too.
    async fn apply_inverse_bookkeeping(
        self: &Arc<Self>,
        scope: &RequestScope,
        rel: RelationshipDef,
        diff: &ChangeDiff,
    ) -> Result<()> {
        let Some(inverse) = rel.inverse.clone() else {
            return Ok(());
        };
        let ChangeDiff::Relationship { added, removed, .. } = diff else {
            return Ok(());
        };

        for key in added {
            if let Some(member) = scope.wrap_member(key, &rel.name).await? {
                member.link_inverse(scope, &inverse, self)?;
            }
        }
        for key in removed {
            if let Some(member) = scope.wrap_member(key, &rel.name).await? {
                member.unlink_inverse(scope, &inverse, self)?;
            }
        }
        Ok(())
    }

    fn link_inverse(
        self: &Arc<Self>,
        scope: &RequestScope,
        inverse: &str,
        owner: &Arc<ManagedEntity>,
    ) -> Result<()> {
        let def = scope.metadata().entity(self.entity_type())?;
        let rel = def.relationship(inverse)?;
        let operation = self.effective_operation(scope);
        if operation == Operation::Update {
            scope
                .permissions()
                .check_entity(scope, self, Operation::Update, None)?;
        }

        let diff = match rel.kind {
            RelationKind::ToMany => {
                let original = self.with_record(|r| r.to_many(inverse))?;
                if original.contains(owner.key()) {
                    return Ok(());
                }
                let mut candidate = original.clone();
                candidate.push(owner.key().clone());
                self.with_record_mut(|r| r.add_to_many(inverse, owner.key().clone()))?;
                ChangeDiff::relationship(inverse, original, candidate)
            }
            RelationKind::ToOne => {
                let original: Vec<EntityKey> =
                    self.with_record(|r| r.to_one(inverse))?.into_iter().collect();
                if original.first() == Some(owner.key()) {
                    return Ok(());
                }
                self.with_record_mut(|r| r.set_to_one(inverse, Some(owner.key().clone())))?;
                ChangeDiff::relationship(inverse, original, vec![owner.key().clone()])
            }
        };

        scope.publish(CrudEvent::field_level(
            operation,
            Arc::clone(self),
            inverse,
            diff,
        ))?;
        scope.publish(CrudEvent::class_level(operation, Arc::clone(self)))?;
        scope.mark_dirty(self);
        Ok(())
    }

    fn unlink_inverse(
        self: &Arc<Self>,
        scope: &RequestScope,
        inverse: &str,
        owner: &Arc<ManagedEntity>,
    ) -> Result<()> {
        let def = scope.metadata().entity(self.entity_type())?;
        let rel = def.relationship(inverse)?;
        let operation = self.effective_operation(scope);
        if operation == Operation::Update {
            scope
                .permissions()
                .check_entity(scope, self, Operation::Update, None)?;
        }

        let diff = match rel.kind {
            RelationKind::ToMany => {
                let original = self.with_record(|r| r.to_many(inverse))?;
                if !original.contains(owner.key()) {
                    return Ok(());
                }
                let candidate: Vec<EntityKey> = original
                    .iter()
                    .filter(|k| *k != owner.key())
                    .cloned()
                    .collect();
                self.with_record_mut(|r| r.remove_to_many(inverse, owner.key()))?;
                ChangeDiff::relationship(inverse, original, candidate)
            }
            RelationKind::ToOne => {
                let original: Vec<EntityKey> =
                    self.with_record(|r| r.to_one(inverse))?.into_iter().collect();
                if original.first() != Some(owner.key()) {
                    return Ok(());
                }
                self.with_record_mut(|r| r.set_to_one(inverse, None))?;
                ChangeDiff::relationship(inverse, original, Vec::new())
            }
        };

        scope.publish(CrudEvent::field_level(
            operation,
            Arc::clone(self),
            inverse,
            diff,
        ))?;
        scope.publish(CrudEvent::class_level(operation, Arc::clone(self)))?;
        scope.mark_dirty(self);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Deletion
    // ------------------------------------------------------------------

    /// Marks the entity for removal at commit time and publishes DELETE
    /// events across all phases. READ hooks never fire for deletes.
    pub fn delete(self: &Arc<Self>, scope: &RequestScope) -> Result<()> {
        scope
            .permissions()
            .check_entity(scope, self, Operation::Delete, None)?;
        scope.publish(CrudEvent::class_level(Operation::Delete, Arc::clone(self)))?;
        scope.mark_deleted(self);
        trace!(entity = %self.key, "entity marked for deletion");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Projection
    // ------------------------------------------------------------------

    /// Materializes the permitted view of this entity. A READ denial on
    /// the object itself is an error; a denied field is silently omitted.
    pub fn to_resource(self: &Arc<Self>, scope: &RequestScope) -> Result<ResourceObject> {
        scope
            .permissions()
            .check_entity(scope, self, Operation::Read, None)?;

        let def = scope.metadata().entity(self.entity_type())?;
        let record = self.snapshot();

        let mut attributes = BTreeMap::new();
        for attribute in def.attributes() {
            if attribute.name == def.id_attribute {
                continue;
            }
            if scope
                .permissions()
                .field_allowed(scope, self, &attribute.name, Operation::Read)?
            {
                attributes.insert(attribute.name.clone(), record.attribute(&attribute.name));
            }
        }

        let mut relationships = BTreeMap::new();
        for rel in def.relationships() {
            if scope
                .permissions()
                .field_allowed(scope, self, &rel.name, Operation::Read)?
            {
                let value = match rel.kind {
                    RelationKind::ToOne => RelationValue::ToOne(record.to_one(&rel.name)),
                    RelationKind::ToMany => RelationValue::ToMany(record.to_many(&rel.name)),
                };
                relationships.insert(rel.name.clone(), value);
            }
        }

        Ok(ResourceObject {
            entity_type: self.entity_type().to_string(),
            id: self.key.id.clone(),
            attributes,
            relationships,
        })
    }
}

impl std::fmt::Debug for ManagedEntity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedEntity")
            .field("uuid", &self.uuid)
            .field("key", &self.key)
            .field("owning_relation", &self.owning_relation)
            .finish()
    }
}
