//! Store error model shared by the outbox, job queue and heartbeat stores.

use thiserror::Error;

use jobrelay_core::DomainError;

/// Store operation error.
///
/// These are infrastructure failures. A uniqueness conflict during enqueue is
/// *not* represented here: it is reported as a successful duplicate by the
/// queue itself.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    /// The row exists but is not in a state that allows the operation.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The caller supplied a value the store refuses to persist.
    #[error("invalid input: {0}")]
    Invalid(String),

    /// Datastore unreachable, pool closed, decode failure, lock poisoned, ...
    #[error("storage error: {0}")]
    Storage(String),
}

impl StoreError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub(crate) fn poisoned() -> Self {
        Self::Storage("lock poisoned".to_string())
    }
}

impl From<DomainError> for StoreError {
    fn from(err: DomainError) -> Self {
        Self::Invalid(err.to_string())
    }
}
