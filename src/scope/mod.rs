// ============================================================================
// Request Scope / Phase Queues
// ============================================================================
//
// One RequestScope per inbound operation. It owns the storage transaction,
// the identity map (at most one wrapper per logical entity per request),
// and four ordered queues of pending hook invocations, one per phase.
//
// Publishing an event enqueues it into every phase queue (with per-phase
// dedup) and then immediately drains the PRESECURITY queue: presecurity
// hooks run synchronously at mutation time, the other phases when the
// orchestrator calls the matching run_queued_* method. Events published
// while a queue is draining join that same queue and are drained in the
// same run, until the queue is empty. Once PRECOMMIT triggers start the
// mutation window is closed: further publishes are ordering violations,
// never silently dropped writes.
//
// ============================================================================

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::sync::Arc;

use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::core::{EngineError, EntityKey, EntityRecord, Operation, Phase, Result};
use crate::lifecycle::{CrudEvent, EventKey, HookDispatcher};
use crate::metadata::{MetadataRegistry, RelationKind};
use crate::resource::ManagedEntity;
use crate::security::{PermissionEvaluator, Principal};
use crate::storage::StorageTransaction;

struct PhaseQueues {
    queues: [VecDeque<CrudEvent>; 4],
    /// Event identities ever enqueued per phase; retained after drains so a
    /// class-level event fires exactly once per (operation, phase) no
    /// matter how many fields were mutated.
    seen: [HashSet<EventKey>; 4],
}

impl PhaseQueues {
    fn new() -> Self {
        Self {
            queues: Default::default(),
            seen: Default::default(),
        }
    }

    fn enqueue(&mut self, phase: Phase, event: &CrudEvent) -> bool {
        let idx = phase.index();
        if !self.seen[idx].insert(event.key()) {
            return false;
        }
        self.queues[idx].push_back(event.clone());
        true
    }

    fn pop(&mut self, phase: Phase) -> Option<CrudEvent> {
        self.queues[phase.index()].pop_front()
    }
}

struct ScopeState {
    identity_map: HashMap<EntityKey, Arc<ManagedEntity>>,
    new_entities: HashSet<Uuid>,
    dirty: Vec<Arc<ManagedEntity>>,
    dirty_seen: HashSet<Uuid>,
    deleted: Vec<Arc<ManagedEntity>>,
    deleted_seen: HashSet<Uuid>,
    queues: PhaseQueues,
    last_phase: Option<Phase>,
    committed: bool,
}

/// Per-request owner of the transaction, identity map, and phase queues.
pub struct RequestScope {
    request_id: Uuid,
    principal: Principal,
    metadata: Arc<MetadataRegistry>,
    dispatcher: HookDispatcher,
    permissions: PermissionEvaluator,
    tx: AsyncMutex<Box<dyn StorageTransaction>>,
    state: Mutex<ScopeState>,
}

impl RequestScope {
    pub fn new(
        principal: Principal,
        metadata: Arc<MetadataRegistry>,
        tx: Box<dyn StorageTransaction>,
    ) -> Self {
        let request_id = Uuid::new_v4();
        debug!(%request_id, principal = principal.name(), "request scope opened");
        Self {
            request_id,
            principal,
            dispatcher: HookDispatcher::new(Arc::clone(&metadata)),
            metadata,
            permissions: PermissionEvaluator::new(),
            tx: AsyncMutex::new(tx),
            state: Mutex::new(ScopeState {
                identity_map: HashMap::new(),
                new_entities: HashSet::new(),
                dirty: Vec::new(),
                dirty_seen: HashSet::new(),
                deleted: Vec::new(),
                deleted_seen: HashSet::new(),
                queues: PhaseQueues::new(),
                last_phase: None,
                committed: false,
            }),
        }
    }

    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    pub fn metadata(&self) -> &MetadataRegistry {
        &self.metadata
    }

    pub fn permissions(&self) -> &PermissionEvaluator {
        &self.permissions
    }

    /// Stable per-request identifier for an entity. Already assigned at
    /// wrap time; new, unpersisted entities carry a temporary UUID.
    pub fn uuid_for(&self, entity: &Arc<ManagedEntity>) -> Uuid {
        entity.uuid()
    }

    pub fn is_new(&self, entity: &Arc<ManagedEntity>) -> bool {
        self.state
            .lock()
            .map(|s| s.new_entities.contains(&entity.uuid()))
            .unwrap_or(false)
    }

    // ------------------------------------------------------------------
    // Identity map
    // ------------------------------------------------------------------

    pub(crate) fn lookup(&self, key: &EntityKey) -> Option<Arc<ManagedEntity>> {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.identity_map.get(key).cloned())
    }

    /// Wraps a loaded record, reusing the existing wrapper when the entity
    /// was already reached in this request (this is what breaks cycles).
    pub(crate) fn wrap(
        &self,
        entity_type: &str,
        record: EntityRecord,
        owning_relation: Option<String>,
    ) -> Result<Arc<ManagedEntity>> {
        let def = self.metadata.entity(entity_type)?;
        let id_value = record.attribute(&def.id_attribute);
        let uuid = Uuid::new_v4();
        let id = if id_value.is_null() {
            uuid.to_string()
        } else {
            id_value.as_id_string()
        };
        let key = EntityKey::new(entity_type, id);

        let mut state = self.state.lock()?;
        if let Some(existing) = state.identity_map.get(&key) {
            return Ok(Arc::clone(existing));
        }
        let entity = Arc::new(ManagedEntity::from_parts(uuid, key.clone(), record, owning_relation));
        state.identity_map.insert(key, Arc::clone(&entity));
        Ok(entity)
    }

    /// Resolves a relationship member by key for inverse bookkeeping,
    /// loading and wrapping it when it was not yet reached in this
    /// request. Bookkeeping bypasses READ filters so the far side of a
    /// bidirectional relationship stays consistent regardless of what the
    /// caller may read; a dangling key resolves to `None`.
    pub(crate) async fn wrap_member(
        &self,
        key: &EntityKey,
        reached_through: &str,
    ) -> Result<Option<Arc<ManagedEntity>>> {
        if let Some(existing) = self.lookup(key) {
            return Ok(Some(existing));
        }
        let record = {
            let mut tx = self.tx.lock().await;
            tx.load(&key.entity_type, &key.id, None).await?
        };
        match record {
            Some(record) => Ok(Some(self.wrap(
                &key.entity_type,
                record,
                Some(reached_through.to_string()),
            )?)),
            None => Ok(None),
        }
    }

    /// Registers a brand-new wrapper. Fails when the id is already taken
    /// within this request.
    pub(crate) fn register_created(&self, entity: &Arc<ManagedEntity>) -> Result<()> {
        let mut state = self.state.lock()?;
        if state.identity_map.contains_key(entity.key()) {
            return Err(EngineError::ValidationFailed(format!(
                "duplicate entity '{}' in one request",
                entity.key()
            )));
        }
        state
            .identity_map
            .insert(entity.key().clone(), Arc::clone(entity));
        state.new_entities.insert(entity.uuid());
        Ok(())
    }

    pub(crate) fn mark_dirty(&self, entity: &Arc<ManagedEntity>) {
        if let Ok(mut state) = self.state.lock() {
            if state.dirty_seen.insert(entity.uuid()) {
                state.dirty.push(Arc::clone(entity));
            }
        }
    }

    pub(crate) fn mark_deleted(&self, entity: &Arc<ManagedEntity>) {
        if let Ok(mut state) = self.state.lock() {
            if state.deleted_seen.insert(entity.uuid()) {
                state.deleted.push(Arc::clone(entity));
            }
        }
    }

    // ------------------------------------------------------------------
    // Phase queues
    // ------------------------------------------------------------------

    /// Appends one hook-invocation record to every phase queue, then runs
    /// the PRESECURITY records synchronously. A presecurity hook failure
    /// propagates out of the mutating call itself.
    ///
    /// The mutation window closes once PRECOMMIT triggers start: write-back
    /// already ran, so a mutation published from a PRECOMMIT or POSTCOMMIT
    /// hook could never reach the store and is rejected instead.
    pub(crate) fn publish(&self, event: CrudEvent) -> Result<()> {
        {
            let mut state = self.state.lock()?;
            if let Some(last @ (Phase::PreCommit | Phase::PostCommit)) = state.last_phase {
                return Err(EngineError::PhaseOrderingViolation(format!(
                    "mutation of {} published after {} triggers started; \
                     the write-back window is closed",
                    event.entity.key(),
                    last
                )));
            }
            let mut queued = false;
            for phase in Phase::ALL {
                queued |= state.queues.enqueue(phase, &event);
            }
            if queued {
                trace!(?event, "lifecycle event queued");
            }
        }
        self.drain(Phase::PreSecurity)
    }

    fn drain(&self, phase: Phase) -> Result<()> {
        loop {
            let event = { self.state.lock()?.queues.pop(phase) };
            let Some(event) = event else { break };
            self.dispatcher.invoke(phase, &event, self)?;
        }
        Ok(())
    }

    fn run_phase(&self, phase: Phase) -> Result<()> {
        {
            let mut state = self.state.lock()?;
            let expected = match phase {
                Phase::PreSecurity => None,
                Phase::PreFlush => Some(Phase::PreSecurity),
                Phase::PreCommit => Some(Phase::PreFlush),
                Phase::PostCommit => Some(Phase::PreCommit),
            };
            if state.last_phase != expected {
                return Err(EngineError::PhaseOrderingViolation(format!(
                    "{} triggers requested after {:?}",
                    phase, state.last_phase
                )));
            }
            if phase == Phase::PostCommit && !state.committed {
                return Err(EngineError::PhaseOrderingViolation(
                    "POSTCOMMIT triggers requested before commit".to_string(),
                ));
            }
            state.last_phase = Some(phase);
        }
        debug!(%phase, "running queued triggers");
        self.drain(phase)
    }

    /// Drains anything still pending at PRESECURITY. Normally a no-op:
    /// presecurity records already ran synchronously at publish time.
    pub fn run_queued_pre_security_triggers(&self) -> Result<()> {
        self.run_phase(Phase::PreSecurity)
    }

    pub fn run_queued_pre_flush_triggers(&self) -> Result<()> {
        self.run_phase(Phase::PreFlush)
    }

    pub fn run_queued_pre_commit_triggers(&self) -> Result<()> {
        self.run_phase(Phase::PreCommit)
    }

    pub fn run_queued_post_commit_triggers(&self) -> Result<()> {
        self.run_phase(Phase::PostCommit)
    }

    /// Deferred commit checks, evaluated after PRECOMMIT triggers against
    /// the fully mutated state.
    pub fn run_deferred_commit_checks(&self) -> Result<()> {
        self.permissions.run_deferred(self)
    }

    pub fn mark_committed(&self) -> Result<()> {
        self.state.lock()?.committed = true;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Loading
    // ------------------------------------------------------------------

    /// Loads one entity by id. A READ denial on a top-level load aborts
    /// the operation; an object excluded by a READ filter predicate is
    /// simply not found.
    pub async fn load_one(&self, entity_type: &str, id: &str) -> Result<Arc<ManagedEntity>> {
        if let Some(existing) = self.lookup(&EntityKey::new(entity_type, id)) {
            // A wrapper first reached through a relationship was only ever
            // vetted as a member (denied members are omitted, not erased
            // from the identity map); a top-level read still runs the
            // object-level check. Wrappers loaded top-level already passed
            // it, and new entities skip READ checks.
            if existing.owning_relation().is_some() {
                self.permissions
                    .check_entity(self, &existing, Operation::Read, None)?;
            }
            return Ok(existing);
        }

        let filter = self.permissions.read_filter(self, entity_type)?;
        let record = {
            let mut tx = self.tx.lock().await;
            tx.load(entity_type, id, filter.as_ref()).await?
        };
        let record = record.ok_or_else(|| {
            EngineError::NotFound(entity_type.to_string(), id.to_string())
        })?;

        let entity = self.wrap(entity_type, record, None)?;
        self.permissions
            .check_entity(self, &entity, Operation::Read, None)?;
        Ok(entity)
    }

    /// Loads a collection. Filter-expression checks are pushed to the
    /// store; objects denied by the remaining checks are omitted, never
    /// surfaced as errors.
    pub async fn load_collection(&self, entity_type: &str) -> Result<Vec<Arc<ManagedEntity>>> {
        let filter = self.permissions.read_filter(self, entity_type)?;
        let records = {
            let mut tx = self.tx.lock().await;
            tx.load_all(entity_type, filter.as_ref()).await?
        };

        let mut entities = Vec::new();
        for record in records {
            let entity = self.wrap(entity_type, record, None)?;
            if self
                .permissions
                .entity_allowed(self, &entity, Operation::Read)?
            {
                entities.push(entity);
            }
        }
        Ok(entities)
    }

    /// Traverses a relationship of a wrapped entity. Members already
    /// wrapped in this request are reused; denied members are omitted.
    pub async fn load_related(
        &self,
        entity: &Arc<ManagedEntity>,
        relation: &str,
    ) -> Result<Vec<Arc<ManagedEntity>>> {
        let def = self.metadata.entity(entity.entity_type())?;
        let rel = def.relationship(relation)?;

        self.permissions
            .check_field(self, entity, relation, Operation::Read, None)?;

        let keys = match rel.kind {
            RelationKind::ToMany => entity.with_record(|r| r.to_many(relation))?,
            RelationKind::ToOne => entity
                .with_record(|r| r.to_one(relation))?
                .into_iter()
                .collect(),
        };

        let filter = self.permissions.read_filter(self, &rel.target)?;
        let mut members = Vec::new();
        for key in keys {
            let member = match self.lookup(&key) {
                Some(existing) => Some(existing),
                None => {
                    let record = {
                        let mut tx = self.tx.lock().await;
                        tx.load(&key.entity_type, &key.id, filter.as_ref()).await?
                    };
                    match record {
                        Some(record) => {
                            Some(self.wrap(&key.entity_type, record, Some(relation.to_string()))?)
                        }
                        None => None,
                    }
                }
            };
            if let Some(member) = member {
                if self
                    .permissions
                    .entity_allowed(self, &member, Operation::Read)?
                {
                    members.push(member);
                }
            }
        }
        Ok(members)
    }

    // ------------------------------------------------------------------
    // Transaction protocol
    // ------------------------------------------------------------------

    /// Writes accumulated creations, updates, and deletions back to the
    /// storage transaction. Invoked by the orchestrator between PREFLUSH
    /// triggers and the transaction's own flush.
    pub async fn flush_writes(&self) -> Result<()> {
        let (new, dirty, deleted, deleted_seen) = {
            let state = self.state.lock()?;
            (
                state
                    .new_entities
                    .iter()
                    .copied()
                    .collect::<HashSet<Uuid>>(),
                state.dirty.clone(),
                state.deleted.clone(),
                state.deleted_seen.clone(),
            )
        };

        // New entities get their persisted id before the first save.
        let to_save: Vec<Arc<ManagedEntity>> = {
            let state = self.state.lock()?;
            let mut ordered: Vec<Arc<ManagedEntity>> = state
                .identity_map
                .values()
                .filter(|e| new.contains(&e.uuid()))
                .cloned()
                .collect();
            ordered.sort_by(|a, b| a.key().to_string().cmp(&b.key().to_string()));
            for entity in dirty.iter() {
                if !new.contains(&entity.uuid()) {
                    ordered.push(Arc::clone(entity));
                }
            }
            ordered
        };

        let mut tx = self.tx.lock().await;
        for entity in &to_save {
            if deleted_seen.contains(&entity.uuid()) {
                continue;
            }
            let def = self.metadata.entity(entity.entity_type())?;
            entity.ensure_persisted_id(&def.id_attribute)?;
            let record = entity.snapshot();
            trace!(entity = %entity.key(), "saving entity");
            tx.save(entity.entity_type(), &entity.key().id, record)
                .await?;
        }
        for entity in &deleted {
            trace!(entity = %entity.key(), "deleting entity");
            tx.delete(entity.entity_type(), &entity.key().id).await?;
        }
        Ok(())
    }

    pub async fn pre_commit(&self) -> Result<()> {
        self.tx.lock().await.pre_commit().await
    }

    pub async fn flush(&self) -> Result<()> {
        self.tx.lock().await.flush().await
    }

    pub async fn commit(&self) -> Result<()> {
        self.tx.lock().await.commit().await
    }

    pub async fn close(&self) -> Result<()> {
        debug!(request_id = %self.request_id, "request scope closing");
        self.tx.lock().await.close().await
    }
}
