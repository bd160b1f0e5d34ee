// ============================================================================
// Engine Facade
// ============================================================================
//
// Public entry point. `Engine::run` opens a request scope around a caller
// supplied body and drives the canonical commit sequence afterwards:
//
//   body -> queued PRESECURITY -> tx.pre_commit -> queued PREFLUSH
//        -> write-back -> tx.flush -> queued PRECOMMIT
//        -> deferred commit checks -> tx.commit -> queued POSTCOMMIT
//
// The transaction is closed on every exit path; an error anywhere in the
// sequence aborts the request and the original error propagates.
//
// ============================================================================

use std::future::Future;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::core::Result;
use crate::metadata::MetadataRegistry;
use crate::scope::RequestScope;
use crate::security::Principal;
use crate::storage::{DataStore, InMemoryStore};

/// The lifecycle engine: a metadata registry bound to a data store.
///
/// One engine serves many concurrent requests; each [`Engine::run`] call
/// gets its own transaction and [`RequestScope`].
pub struct Engine {
    metadata: Arc<MetadataRegistry>,
    store: Arc<dyn DataStore>,
}

impl Engine {
    pub fn new(metadata: Arc<MetadataRegistry>, store: Arc<dyn DataStore>) -> Self {
        Self { metadata, store }
    }

    /// Engine over the reference in-memory store.
    pub fn in_memory(metadata: Arc<MetadataRegistry>) -> Self {
        let store = InMemoryStore::new(Arc::clone(&metadata));
        Self::new(metadata, store)
    }

    pub fn metadata(&self) -> &Arc<MetadataRegistry> {
        &self.metadata
    }

    /// Runs one request: opens a transaction and scope, executes `body`,
    /// then drives the remaining lifecycle phases through commit.
    ///
    /// # Errors
    ///
    /// Any failure — a denied permission, a hook error, a validation or
    /// storage failure — aborts the request before commit. The transaction
    /// is closed either way and the original error is returned.
    pub async fn run<T, F, Fut>(&self, principal: Principal, body: F) -> Result<T>
    where
        F: FnOnce(Arc<RequestScope>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let tx = self.store.begin().await?;
        let scope = Arc::new(RequestScope::new(
            principal,
            Arc::clone(&self.metadata),
            tx,
        ));

        let outcome = Self::drive(Arc::clone(&scope), body).await;
        if let Err(error) = &outcome {
            warn!(request_id = %scope.request_id(), %error, "request aborted");
        }

        let closed = scope.close().await;
        match outcome {
            Ok(value) => {
                closed?;
                Ok(value)
            }
            // The body's failure is the interesting one; a close failure
            // on the abort path only gets logged.
            Err(error) => {
                if let Err(close_error) = closed {
                    warn!(%close_error, "transaction close failed after abort");
                }
                Err(error)
            }
        }
    }

    async fn drive<T, F, Fut>(scope: Arc<RequestScope>, body: F) -> Result<T>
    where
        F: FnOnce(Arc<RequestScope>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let value = body(Arc::clone(&scope)).await?;

        scope.run_queued_pre_security_triggers()?;
        scope.pre_commit().await?;
        scope.run_queued_pre_flush_triggers()?;
        scope.flush_writes().await?;
        scope.flush().await?;
        scope.run_queued_pre_commit_triggers()?;
        scope.run_deferred_commit_checks()?;
        scope.commit().await?;
        scope.mark_committed()?;
        scope.run_queued_post_commit_triggers()?;

        debug!(request_id = %scope.request_id(), "request committed");
        Ok(value)
    }
}
