//! Crate-wide error types
//!
//! Component-local errors (`StorageError`, `EmbeddingError`, `VectorSearchError`,
//! `WorkflowError`, `AgentError`) convert into `EngineError` via `#[from]`, so
//! callers working at the `Engine` level see one error type while components
//! can still be tested against their own narrower error enum.

use crate::embedding::EmbeddingError;
use crate::storage::StorageError;
use crate::vector_index::VectorSearchError;
use crate::workflow::AgentError;

/// Top-level engine error.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Input failed validation and was rejected before entering the pipeline.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Graph store failure.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Embedding provider / cache failure.
    #[error("embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    /// Vector index failure.
    #[error("vector index error: {0}")]
    VectorIndex(#[from] VectorSearchError),

    /// Agent role failure (timeout, malformed output, exhausted consensus).
    #[error("agent error: {0}")]
    Agent(#[from] AgentError),

    /// A transaction was aborted because a precondition no longer held
    /// (e.g. the candidate's confidence band changed under concurrent update).
    #[error("logical conflict: {0}")]
    Conflict(String),

    /// A work item attempted an illegal state transition.
    #[error("illegal transition: {from:?} -> {to:?}")]
    IllegalTransition {
        /// Origin state.
        from: crate::model::WorkflowState,
        /// Attempted destination state.
        to: crate::model::WorkflowState,
    },

    /// The operation was rejected by policy (blacklist match, human-edited
    /// concept) rather than failing outright. Callers should reroute, not retry.
    #[error("policy rejection: {0}")]
    Policy(String),

    /// Retries were exhausted; the work item rests in its last non-terminal
    /// state and should surface as a high-priority review.
    #[error("persistent error after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        /// Number of attempts made.
        attempts: u32,
        /// The last underlying error, as text (kept `'static`-friendly).
        last_error: String,
    },

    /// Requested entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, EngineError>;
