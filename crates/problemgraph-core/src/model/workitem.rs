//! The per-mention processing record and its state machine
//!
//! Modeled as an explicit enum plus a static transition table rather than
//! coroutines: every state change is recorded before it happens, so a
//! restarted process can resume a work item from its last checkpoint without
//! re-deriving control flow.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A stage of the matching/review pipeline a mention passes through.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowState {
    Extracted,
    Matching,
    HighConfidence,
    MediumConfidence,
    LowConfidence,
    NoMatch,
    AgentReview,
    NeedsConsensus,
    PendingReview,
    Approved,
    Rejected,
    Blacklisted,
    /// Terminal: a concept link exists.
    AutoLinked,
    /// Terminal: a new concept was created for this mention.
    CreateNewConcept,
    /// Terminal: cancelled by an admin operation. Synthetic - not reachable
    /// from the ordinary transition table, only via `WorkItem::cancel`.
    Cancelled,
}

impl std::fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkflowState::Extracted => "EXTRACTED",
            WorkflowState::Matching => "MATCHING",
            WorkflowState::HighConfidence => "HIGH_CONFIDENCE",
            WorkflowState::MediumConfidence => "MEDIUM_CONFIDENCE",
            WorkflowState::LowConfidence => "LOW_CONFIDENCE",
            WorkflowState::NoMatch => "NO_MATCH",
            WorkflowState::AgentReview => "AGENT_REVIEW",
            WorkflowState::NeedsConsensus => "NEEDS_CONSENSUS",
            WorkflowState::PendingReview => "PENDING_REVIEW",
            WorkflowState::Approved => "APPROVED",
            WorkflowState::Rejected => "REJECTED",
            WorkflowState::Blacklisted => "BLACKLISTED",
            WorkflowState::AutoLinked => "AUTO_LINKED",
            WorkflowState::CreateNewConcept => "CREATE_NEW_CONCEPT",
            WorkflowState::Cancelled => "CANCELLED",
        };
        write!(f, "{s}")
    }
}

impl WorkflowState {
    /// Terminal states end processing for a work item: `AUTO_LINKED` and
    /// `CREATE_NEW_CONCEPT`, plus the synthetic `CANCELLED` state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowState::AutoLinked | WorkflowState::CreateNewConcept | WorkflowState::Cancelled
        )
    }

    /// The ordinary transition table. `CANCELLED` is reachable from any
    /// non-terminal state but is handled separately by `WorkItem::cancel`,
    /// not listed here, since it is an admin override rather than a pipeline
    /// step.
    fn allowed_targets(self) -> &'static [WorkflowState] {
        use WorkflowState::*;
        match self {
            Extracted => &[Matching],
            Matching => &[HighConfidence, MediumConfidence, LowConfidence, NoMatch],
            // AutoLinked is the ordinary outcome; PendingReview covers §4.4's
            // "band changed under concurrent update" reroute, when the
            // auto-linker's re-verification aborts the transaction.
            HighConfidence => &[AutoLinked, PendingReview],
            MediumConfidence => &[AgentReview],
            LowConfidence => &[PendingReview],
            NoMatch => &[CreateNewConcept],
            AgentReview => &[Approved, NeedsConsensus, CreateNewConcept],
            NeedsConsensus => &[PendingReview],
            Approved => &[AutoLinked],
            PendingReview => &[Approved, Rejected, Blacklisted],
            Rejected => &[CreateNewConcept],
            Blacklisted => &[CreateNewConcept],
            AutoLinked | CreateNewConcept | Cancelled => &[],
        }
    }

    /// Whether `self -> to` is a legal transition per the pipeline's
    /// transition table.
    pub fn can_transition_to(self, to: WorkflowState) -> bool {
        self.allowed_targets().contains(&to)
    }
}

/// A single recorded transition in a work item's history. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateHistoryEntry {
    pub from: WorkflowState,
    pub to: WorkflowState,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
    pub metadata: serde_json::Value,
    pub user: Option<String>,
}

/// The per-mention processing record driving a mention from extraction
/// through to a terminal link or concept creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItem {
    /// Stable unique id.
    pub id: String,
    /// `{UTC timestamp}-{short-id}-{operation}`, assigned once at creation
    /// and carried through every checkpoint and history entry.
    pub trace_id: String,
    /// The mention this work item processes.
    pub mention_id: String,
    /// Current workflow state.
    pub current_state: WorkflowState,
    /// Ordered transition history, oldest first.
    pub history: Vec<StateHistoryEntry>,
    /// Concept ids surfaced by the matcher as candidates, highest score first.
    pub candidate_concepts: Vec<String>,
    /// The concept id ultimately selected for linking, once decided.
    pub selected_concept_id: Option<String>,
    /// Priority, 1 (highest) to 10 (lowest).
    pub priority: u8,
    /// SLA deadline for a pending review.
    pub sla_deadline: Option<DateTime<Utc>>,
    /// Number of retry attempts consumed so far.
    pub retry_count: u32,
    /// Maximum retries before surfacing a persistent error.
    pub max_retries: u32,
    /// The most recent error message, if a step failed.
    pub last_error: Option<String>,
    /// Checkpoint ids recorded for this work item, oldest first.
    pub checkpoint_ids: Vec<String>,
    /// Reviewer currently holding this item's review lease, if any.
    pub assigned_reviewer_id: Option<String>,
    /// When the current reviewer lease was taken out.
    pub assigned_at: Option<DateTime<Utc>>,
}

impl WorkItem {
    /// Create a fresh work item for a newly submitted mention, in state
    /// `EXTRACTED`.
    pub fn new(
        id: String,
        trace_id: String,
        mention_id: String,
        priority: u8,
        max_retries: u32,
    ) -> Self {
        Self {
            id,
            trace_id,
            mention_id,
            current_state: WorkflowState::Extracted,
            history: Vec::new(),
            candidate_concepts: Vec::new(),
            selected_concept_id: None,
            priority: priority.clamp(1, 10),
            sla_deadline: None,
            retry_count: 0,
            max_retries,
            last_error: None,
            checkpoint_ids: Vec::new(),
            assigned_reviewer_id: None,
            assigned_at: None,
        }
    }

    /// The sole mutator of `current_state`. Enforces that every transition
    /// is legal per the transition table and appends a history entry before
    /// applying it, so the work item can be reconstructed from history alone.
    pub fn transition(
        &mut self,
        to: WorkflowState,
        reason: impl Into<String>,
        metadata: serde_json::Value,
        user: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), crate::error::EngineError> {
        if !self.current_state.can_transition_to(to) {
            return Err(crate::error::EngineError::IllegalTransition {
                from: self.current_state,
                to,
            });
        }
        self.history.push(StateHistoryEntry {
            from: self.current_state,
            to,
            timestamp: now,
            reason: reason.into(),
            metadata,
            user,
        });
        self.current_state = to;
        Ok(())
    }

    /// Admin override: cancel a work item in any non-terminal state. Bypasses
    /// the ordinary transition table since `CANCELLED` is reachable from
    /// anywhere non-terminal, not just from the states the table lists.
    pub fn cancel(
        &mut self,
        reason: impl Into<String>,
        user: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), crate::error::EngineError> {
        if self.current_state.is_terminal() {
            return Err(crate::error::EngineError::IllegalTransition {
                from: self.current_state,
                to: WorkflowState::Cancelled,
            });
        }
        self.history.push(StateHistoryEntry {
            from: self.current_state,
            to: WorkflowState::Cancelled,
            timestamp: now,
            reason: reason.into(),
            metadata: serde_json::Value::Null,
            user,
        });
        self.current_state = WorkflowState::Cancelled;
        Ok(())
    }

    /// Whether this item has exhausted its retry budget.
    pub fn retries_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    /// Admin override: force a non-terminal work item straight into
    /// `PENDING_REVIEW`, bypassing the ordinary transition table. Used when a
    /// work item has sat beyond its stuck-timeout with no retry budget left.
    pub fn force_into_pending_review(
        &mut self,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), crate::error::EngineError> {
        if self.current_state.is_terminal() {
            return Err(crate::error::EngineError::IllegalTransition {
                from: self.current_state,
                to: WorkflowState::PendingReview,
            });
        }
        self.history.push(StateHistoryEntry {
            from: self.current_state,
            to: WorkflowState::PendingReview,
            timestamp: now,
            reason: reason.into(),
            metadata: serde_json::Value::Null,
            user: None,
        });
        self.current_state = WorkflowState::PendingReview;
        Ok(())
    }
}
