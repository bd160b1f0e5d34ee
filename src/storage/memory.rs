// ============================================================================
// In-Memory Store
// ============================================================================
//
// Reference DataStore implementation: a shared table map plus transactions
// that buffer writes locally, stage them at flush, and publish them at
// commit. A transaction closed without commit discards its buffers.
//
// ============================================================================

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::core::{EngineError, EntityRecord, Result};
use crate::metadata::MetadataRegistry;
use crate::security::FilterPredicate;

use super::{DataStore, StorageTransaction};

type Tables = HashMap<String, BTreeMap<String, EntityRecord>>;

pub struct InMemoryStore {
    metadata: Arc<MetadataRegistry>,
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryStore {
    pub fn new(metadata: Arc<MetadataRegistry>) -> Arc<Self> {
        Arc::new(Self {
            metadata,
            tables: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Committed record count for one type, for assertions in tests.
    pub async fn count(&self, entity_type: &str) -> usize {
        self.tables
            .read()
            .await
            .get(entity_type)
            .map(BTreeMap::len)
            .unwrap_or(0)
    }

    /// Committed record by id, bypassing any transaction.
    pub async fn committed(&self, entity_type: &str, id: &str) -> Option<EntityRecord> {
        self.tables
            .read()
            .await
            .get(entity_type)
            .and_then(|table| table.get(id))
            .cloned()
    }
}

#[async_trait]
impl DataStore for InMemoryStore {
    async fn begin(&self) -> Result<Box<dyn StorageTransaction>> {
        Ok(Box::new(InMemoryTransaction {
            metadata: Arc::clone(&self.metadata),
            tables: Arc::clone(&self.tables),
            pending: Vec::new(),
            staged: Vec::new(),
            state: TxState::Active,
        }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxState {
    Active,
    PreCommitted,
    Flushed,
    Committed,
    Closed,
}

#[derive(Debug, Clone)]
enum WriteOp {
    Save {
        entity_type: String,
        id: String,
        record: EntityRecord,
    },
    Delete {
        entity_type: String,
        id: String,
    },
}

pub struct InMemoryTransaction {
    metadata: Arc<MetadataRegistry>,
    tables: Arc<RwLock<Tables>>,
    /// Writes buffered until flush.
    pending: Vec<WriteOp>,
    /// Flushed writes awaiting commit.
    staged: Vec<WriteOp>,
    state: TxState,
}

impl InMemoryTransaction {
    fn ensure_open(&self, action: &str) -> Result<()> {
        if matches!(self.state, TxState::Committed | TxState::Closed) {
            return Err(EngineError::TransactionError(format!(
                "cannot {} on a {} transaction",
                action,
                match self.state {
                    TxState::Committed => "committed",
                    _ => "closed",
                }
            )));
        }
        Ok(())
    }

    /// The transaction's own view: committed state with local writes
    /// overlaid in order.
    async fn view(&self, entity_type: &str) -> BTreeMap<String, EntityRecord> {
        let mut table = self
            .tables
            .read()
            .await
            .get(entity_type)
            .cloned()
            .unwrap_or_default();

        for op in self.staged.iter().chain(self.pending.iter()) {
            match op {
                WriteOp::Save {
                    entity_type: t,
                    id,
                    record,
                } if t == entity_type => {
                    table.insert(id.clone(), record.clone());
                }
                WriteOp::Delete { entity_type: t, id } if t == entity_type => {
                    table.remove(id);
                }
                _ => {}
            }
        }
        table
    }

    fn validate(&self, entity_type: &str, record: &EntityRecord) -> Result<()> {
        let def = self.metadata.entity(entity_type)?;
        for attribute in def.attributes() {
            attribute.validate(&record.attribute(&attribute.name))?;
        }
        Ok(())
    }
}

#[async_trait]
impl StorageTransaction for InMemoryTransaction {
    async fn load(
        &mut self,
        entity_type: &str,
        id: &str,
        filter: Option<&FilterPredicate>,
    ) -> Result<Option<EntityRecord>> {
        self.ensure_open("load")?;
        let record = self.view(entity_type).await.remove(id);
        Ok(record.filter(|r| filter.map(|f| f.matches(r)).unwrap_or(true)))
    }

    async fn load_all(
        &mut self,
        entity_type: &str,
        filter: Option<&FilterPredicate>,
    ) -> Result<Vec<EntityRecord>> {
        self.ensure_open("load")?;
        Ok(self
            .view(entity_type)
            .await
            .into_values()
            .filter(|r| filter.map(|f| f.matches(r)).unwrap_or(true))
            .collect())
    }

    async fn save(&mut self, entity_type: &str, id: &str, record: EntityRecord) -> Result<()> {
        self.ensure_open("save")?;
        self.pending.push(WriteOp::Save {
            entity_type: entity_type.to_string(),
            id: id.to_string(),
            record,
        });
        Ok(())
    }

    async fn delete(&mut self, entity_type: &str, id: &str) -> Result<()> {
        self.ensure_open("delete")?;
        self.pending.push(WriteOp::Delete {
            entity_type: entity_type.to_string(),
            id: id.to_string(),
        });
        Ok(())
    }

    async fn get_to_many(
        &mut self,
        record: &EntityRecord,
        relation: &str,
        filter: Option<&FilterPredicate>,
    ) -> Result<Vec<EntityRecord>> {
        self.ensure_open("load")?;
        let mut members = Vec::new();
        for key in record.to_many(relation) {
            if let Some(member) = self.load(&key.entity_type, &key.id, filter).await? {
                members.push(member);
            }
        }
        Ok(members)
    }

    async fn pre_commit(&mut self) -> Result<()> {
        if self.state != TxState::Active {
            return Err(EngineError::PhaseOrderingViolation(format!(
                "pre_commit on a transaction in state {:?}",
                self.state
            )));
        }
        self.state = TxState::PreCommitted;
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        if self.state != TxState::PreCommitted {
            return Err(EngineError::PhaseOrderingViolation(format!(
                "flush on a transaction in state {:?}",
                self.state
            )));
        }

        // Constraint violations surface here, not at commit.
        for op in &self.pending {
            if let WriteOp::Save {
                entity_type,
                record,
                ..
            } = op
            {
                self.validate(entity_type, record)?;
            }
        }

        self.staged.append(&mut self.pending);
        self.state = TxState::Flushed;
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        if self.state != TxState::Flushed {
            return Err(EngineError::PhaseOrderingViolation(format!(
                "commit on a transaction in state {:?}",
                self.state
            )));
        }

        let mut tables = self.tables.write().await;
        for op in self.staged.drain(..) {
            match op {
                WriteOp::Save {
                    entity_type,
                    id,
                    record,
                } => {
                    tables.entry(entity_type).or_default().insert(id, record);
                }
                WriteOp::Delete { entity_type, id } => {
                    if let Some(table) = tables.get_mut(&entity_type) {
                        table.remove(&id);
                    }
                }
            }
        }
        self.state = TxState::Committed;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.state != TxState::Committed && (!self.pending.is_empty() || !self.staged.is_empty())
        {
            debug!(
                pending = self.pending.len(),
                staged = self.staged.len(),
                "discarding uncommitted writes on close"
            );
        }
        self.pending.clear();
        self.staged.clear();
        self.state = TxState::Closed;
        Ok(())
    }
}
