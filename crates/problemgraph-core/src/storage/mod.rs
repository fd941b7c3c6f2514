//! Graph store abstraction and its SQLite implementation
//!
//! `GraphStore` covers the node/edge operations the engine needs: uniqueness
//! on every node id, indexes on the lookup paths the matcher and review
//! queue exercise, and a transaction boundary that the auto-linker uses to
//! keep concept creation and its first `INSTANCE_OF` edge atomic.

mod migrations;
mod sqlite;

pub use migrations::MIGRATIONS;
pub use sqlite::SqliteGraphStore;

use crate::error::EngineError;
use crate::model::{
    BlacklistEntry, Checkpoint, ConceptVersionSnapshot, PendingReview, ProblemConcept, ProblemMention, WorkItem,
};

/// Errors raised by a [`GraphStore`] implementation.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("migration error: {0}")]
    Migration(String),
    #[error("constraint violation: {0}")]
    Constraint(String),
}

/// A serialisable transaction against the graph store. Implementations hold
/// an open database transaction for the lifetime of the callback passed to
/// [`GraphStore::with_transaction`]; committing happens only if the callback
/// returns `Ok`.
pub trait GraphTransaction {
    fn get_concept(&mut self, id: &str) -> Result<Option<ProblemConcept>, EngineError>;
    fn create_concept(&mut self, concept: &ProblemConcept) -> Result<(), EngineError>;
    fn create_instance_of_edge(&mut self, mention_id: &str, concept_id: &str) -> Result<(), EngineError>;
    /// Remove `mention_id`'s outgoing edge, if any. Returns the concept id it
    /// pointed to so the caller can recompute that concept's aggregates.
    fn remove_instance_of_edge(&mut self, mention_id: &str) -> Result<Option<String>, EngineError>;
    fn increment_concept_mention_count(
        &mut self,
        concept_id: &str,
        mention_paper_year: Option<i32>,
    ) -> Result<(), EngineError>;
    /// Recompute `mention_count`/`paper_count`/`first_mentioned_year`/
    /// `last_mentioned_year` from the concept's current `instance_of_edges`,
    /// replacing whatever the row currently holds. Used to repair a
    /// concept's counters after an edge is removed outside the normal
    /// increment path (e.g. rollback).
    fn recompute_concept_aggregates(&mut self, concept_id: &str) -> Result<(), EngineError>;
    fn get_mention(&mut self, id: &str) -> Result<Option<ProblemMention>, EngineError>;
    fn save_mention(&mut self, mention: &ProblemMention) -> Result<(), EngineError>;
    fn save_work_item(&mut self, work_item: &WorkItem) -> Result<(), EngineError>;
    fn paper_year(&mut self, paper_id: &str) -> Result<Option<i32>, EngineError>;
}

/// The graph store: durable persistence for every node and edge kind the
/// engine owns. One implementation (`SqliteGraphStore`) backs both
/// production and tests; tests use a `:memory:` database.
pub trait GraphStore: Send + Sync {
    /// Run `f` inside a single serialisable transaction. On `Ok(())` the
    /// transaction commits; on `Err` it rolls back and the error is
    /// propagated to the caller.
    fn with_transaction(
        &self,
        f: &mut dyn FnMut(&mut dyn GraphTransaction) -> Result<(), EngineError>,
    ) -> Result<(), EngineError>;

    // -- mentions --
    fn create_mention(&self, mention: &ProblemMention) -> Result<(), EngineError>;
    fn save_mention(&self, mention: &ProblemMention) -> Result<(), EngineError>;
    fn get_mention(&self, id: &str) -> Result<Option<ProblemMention>, EngineError>;
    fn list_mentions_for_concept(&self, concept_id: &str) -> Result<Vec<ProblemMention>, EngineError>;

    // -- concepts --
    fn get_concept(&self, id: &str) -> Result<Option<ProblemConcept>, EngineError>;
    fn save_concept(&self, concept: &ProblemConcept) -> Result<(), EngineError>;
    /// Every concept currently in the store. Used to rebuild the in-memory
    /// vector index on startup; never destructive (no `delete_concept`
    /// exists - deprecation is a status change via `save_concept`).
    fn list_concepts(&self) -> Result<Vec<ProblemConcept>, EngineError>;
    /// The content snapshot recorded for `concept_id` at `version`, if one
    /// was ever committed. Backs `rollback(concept_version)`.
    fn get_concept_version(
        &self,
        concept_id: &str,
        version: i64,
    ) -> Result<Option<ConceptVersionSnapshot>, EngineError>;

    // -- papers / citations --
    fn create_paper(&self, paper_id: &str, year: Option<i32>) -> Result<(), EngineError>;
    fn paper_year(&self, paper_id: &str) -> Result<Option<i32>, EngineError>;
    fn record_citation(&self, citing_paper_id: &str, cited_paper_id: &str) -> Result<(), EngineError>;
    fn cited_paper_ids(&self, paper_id: &str) -> Result<Vec<String>, EngineError>;
    /// Paper ids in which `concept_id` has at least one linked mention.
    fn papers_with_mentions_of(&self, concept_id: &str) -> Result<Vec<String>, EngineError>;

    // -- work items --
    fn create_work_item(&self, work_item: &WorkItem) -> Result<(), EngineError>;
    fn save_work_item(&self, work_item: &WorkItem) -> Result<(), EngineError>;
    fn get_work_item(&self, id: &str) -> Result<Option<WorkItem>, EngineError>;
    fn list_stuck_work_items(
        &self,
        older_than: chrono::DateTime<chrono::Utc>,
    ) -> Result<Vec<WorkItem>, EngineError>;

    /// Claim the per-work-item processing lock via an atomic
    /// `UPDATE ... RETURNING`-style claim. Returns whether the claim
    /// succeeded (false means another stage is already running).
    fn try_claim_work_item(&self, work_item_id: &str, holder: &str) -> Result<bool, EngineError>;
    fn release_work_item_claim(&self, work_item_id: &str, holder: &str) -> Result<(), EngineError>;

    // -- checkpoints --
    fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), EngineError>;
    fn get_checkpoint(&self, id: &str) -> Result<Option<Checkpoint>, EngineError>;
    fn list_checkpoints_for_trace(&self, trace_id: &str) -> Result<Vec<Checkpoint>, EngineError>;
    fn latest_checkpoint_before(
        &self,
        trace_id: &str,
        before: chrono::DateTime<chrono::Utc>,
    ) -> Result<Option<Checkpoint>, EngineError>;

    // -- review queue --
    fn save_pending_review(&self, review: &PendingReview) -> Result<(), EngineError>;
    fn get_pending_review(&self, id: &str) -> Result<Option<PendingReview>, EngineError>;
    /// Atomically resolve a review: sets `resolution`/`resolved_by`/`resolved_at`
    /// only if the row is still unresolved, in one transaction, so two
    /// concurrent resolutions of the same review can't both apply their side
    /// effect. Returns the row's state after the call plus whether this
    /// call is the one that resolved it (vs. finding it already resolved).
    fn try_resolve_pending_review(
        &self,
        id: &str,
        reviewer_id: &str,
        decision: crate::model::ResolutionDecision,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<Option<(PendingReview, bool)>, EngineError>;
    fn pop_highest_priority_unassigned(
        &self,
        now: chrono::DateTime<chrono::Utc>,
        lease_minutes: i64,
    ) -> Result<Option<PendingReview>, EngineError>;
    fn list_pending_reviews(&self) -> Result<Vec<PendingReview>, EngineError>;

    // -- blacklist --
    fn record_blacklist_entry(&self, entry: &BlacklistEntry) -> Result<(), EngineError>;
    fn is_blacklisted(&self, mention_id: &str, concept_id: &str) -> Result<bool, EngineError>;
    /// Currently active (latest `never_allow = true`) pattern-scoped entries.
    fn list_blacklist_patterns(&self) -> Result<Vec<BlacklistEntry>, EngineError>;
}
