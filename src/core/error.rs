use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Authorization denied: {0}")]
    AuthorizationDenied(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Lifecycle hook failed: {0}")]
    HookFailure(String),

    #[error("Phase ordering violation: {0}")]
    PhaseOrderingViolation(String),

    #[error("Entity type '{0}' not registered")]
    UnknownType(String),

    #[error("Field '{0}' not found on type '{1}'")]
    UnknownField(String, String),

    #[error("Check '{0}' not registered")]
    UnknownCheck(String),

    #[error("Entity '{1}' of type '{0}' not found")]
    NotFound(String, String),

    #[error("Transaction error: {0}")]
    TransactionError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Lock error: {0}")]
    LockError(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// Client-visible errors cross the hook boundary unchanged; anything
    /// else raised by a hook is reported as a hook failure.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            EngineError::AuthorizationDenied(_) | EngineError::ValidationFailed(_)
        )
    }
}

impl<T> From<std::sync::PoisonError<T>> for EngineError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}
