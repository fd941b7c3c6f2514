//! # problemgraph-core
//!
//! The canonical problem matching engine: takes extracted problem-statement
//! mentions from research papers and either links each to an existing
//! canonical concept or mints a new one, using a confidence-banded pipeline
//! of vector similarity, citation-graph corroboration, and an agent debate
//! workflow with a human review queue as the backstop.
//!
//! ## Pipeline
//!
//! A submitted mention is embedded, matched against the concept vector
//! index, and classified into a confidence band:
//!
//! - **HIGH** - linked automatically, re-verified transactionally.
//! - **MEDIUM** - a single agent evaluator decides link / reject / escalate.
//! - **LOW** - routed straight to the Maker/Hater/Arbiter consensus loop.
//! - **NONE** - a new concept is minted from the mention itself.
//!
//! Escalations and low-confidence consensus both land in the durable review
//! queue, where a human resolves them. Concepts refine their canonical
//! statement automatically once enough mentions have accumulated.
//!
//! ## Modules
//!
//! - [`model`] - mentions, concepts, work items, reviews, checkpoints.
//! - [`config`] - [`config::EngineConfig`] and its component configs.
//! - [`storage`] - the [`storage::GraphStore`] trait and its SQLite backend.
//! - [`embedding`] - the embedding provider trait and its normalising LRU cache.
//! - [`vector_index`] - the HNSW concept vector index.
//! - [`matcher`] - candidate retrieval, citation boost, confidence classification.
//! - [`autolink`] - transactional HIGH-band linking and new-concept creation.
//! - [`workflow`] - agent roles and the evaluator/consensus orchestrator.
//! - [`refinement`] - threshold-triggered concept re-synthesis.
//! - [`queue`] - the durable, priority-ordered human review queue.
//! - [`retry`] - jittered exponential backoff shared across components.
//! - [`error`] - the crate-wide [`error::EngineError`].
//! - [`engine`] - [`Engine`], the orchestrator tying everything together.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use problemgraph_core::{Engine, EngineConfig, MentionInput};
//! use problemgraph_core::storage::SqliteGraphStore;
//! use chrono::Utc;
//!
//! let store = Box::new(SqliteGraphStore::open_in_memory()?);
//! let engine = Engine::new(store, embedding_provider, roster, EngineConfig::default())?;
//! let trace_id = engine.submit_mention(mention_input, Utc::now()).await?;
//! ```

pub mod autolink;
pub mod config;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod matcher;
pub mod model;
pub mod queue;
pub mod refinement;
pub mod retry;
pub mod storage;
pub mod vector_index;
pub mod workflow;

pub use config::EngineConfig;
pub use engine::{Engine, ReprocessFilter};
pub use error::{EngineError, Result};
pub use model::{
    BlacklistEntry, Checkpoint, ConceptStatus, ConfidenceBand, MatchMethod, MentionInput,
    PendingReview, ProblemConcept, ProblemMention, ResolutionDecision, StateHistoryEntry,
    SuggestedConcept, WorkItem, WorkflowState,
};
pub use storage::{GraphStore, SqliteGraphStore, StorageError};
