//! Review queue records: pending reviews and blacklist entries

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A candidate concept surfaced for human review, with the matcher/agent
/// reasoning that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuggestedConcept {
    pub concept_id: String,
    pub score: f32,
    pub reasoning: String,
}

/// How a pending review was resolved.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionDecision {
    /// Link the mention to the chosen suggested concept.
    Linked,
    /// Create a new concept for the mention.
    CreatedNew,
    /// Reject the match and record a blacklist entry.
    Blacklisted,
}

/// The durable record of a queued human review.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingReview {
    /// Stable unique id.
    pub id: String,
    /// The work item this review was enqueued for.
    pub work_item_id: String,
    /// The mention under review, captured at enqueue time.
    pub mention_id: String,
    /// Candidate concepts with per-candidate score and reasoning.
    pub suggested_concepts: Vec<SuggestedConcept>,
    /// Captured agent artefacts (debate transcripts, evaluator scores, ...).
    pub agent_artefacts: serde_json::Value,
    /// Why this item was escalated to human review.
    pub escalation_reason: String,
    /// The mention's domain, captured at enqueue time so a later aging sweep
    /// can recompute priority without re-reading the mention.
    pub domain: String,
    /// The match confidence that drove the original priority computation.
    pub match_confidence: f32,
    /// The matched candidate concept's mention count at enqueue time.
    pub candidate_mention_count: i64,
    /// Priority, 1 (highest) to 10 (lowest), mirrored from the work item.
    pub priority: u8,
    /// SLA deadline for this review.
    pub sla_deadline: DateTime<Utc>,
    /// Reviewer currently holding the assignment lease, if any.
    pub assigned_to: Option<String>,
    /// When the current lease was taken out.
    pub assigned_at: Option<DateTime<Utc>>,
    /// Final resolution, once resolved.
    pub resolution: Option<ResolutionDecision>,
    /// Reviewer who resolved this item.
    pub resolved_by: Option<String>,
    /// When this item was resolved.
    pub resolved_at: Option<DateTime<Utc>>,
    /// When this review was created.
    pub created_at: DateTime<Utc>,
}

impl PendingReview {
    /// Whether the assignment lease (if any) has expired as of `now`, making
    /// this item reclaimable by `ReviewQueue::next`.
    pub fn lease_expired(&self, now: DateTime<Utc>, lease_minutes: i64) -> bool {
        match self.assigned_at {
            Some(assigned_at) => now - assigned_at >= chrono::Duration::minutes(lease_minutes),
            None => false,
        }
    }

    /// Whether this item is currently assigned and unexpired.
    pub fn is_leased(&self, now: DateTime<Utc>, lease_minutes: i64) -> bool {
        self.assigned_to.is_some() && !self.lease_expired(now, lease_minutes)
    }
}

/// A durable, append-only record interdicting a mention/concept pairing (or
/// a one-sided / pattern-based interdiction) from being re-suggested by the
/// matcher.
///
/// At least one of `mention_id`, `concept_id`, `pattern` is non-null.
/// Removal is not destructive: a later entry with `never_allow = false` for
/// the same `(mention_id, concept_id)` key supersedes an earlier
/// interdiction (see [`BlacklistEntry::key`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlacklistEntry {
    /// Stable unique id.
    pub id: String,
    /// The mention that was rejected from `concept_id`, if this entry is
    /// pair-scoped.
    pub mention_id: Option<String>,
    /// The concept the mention was rejected from, if this entry is
    /// pair-scoped.
    pub concept_id: Option<String>,
    /// A free-text pattern matched against mention statements, for entries
    /// that interdict by content rather than by a specific pair.
    pub pattern: Option<String>,
    /// Human-provided reason for the rejection.
    pub reason: String,
    /// Whether this entry forbids the pairing (`true`) or supersedes and
    /// lifts a prior interdiction for the same key (`false`).
    pub never_allow: bool,
    /// Reviewer who recorded the rejection.
    pub recorded_by: Option<String>,
    /// When the entry was recorded.
    pub created_at: DateTime<Utc>,
}

impl BlacklistEntry {
    /// Construct a pair-scoped entry forbidding `(mention_id, concept_id)`.
    pub fn forbid_pair(
        id: String,
        mention_id: String,
        concept_id: String,
        reason: String,
        recorded_by: Option<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            mention_id: Some(mention_id),
            concept_id: Some(concept_id),
            pattern: None,
            reason,
            never_allow: true,
            recorded_by,
            created_at,
        }
    }

    /// The `(mention_id, concept_id)` key this entry supersedes by, if it is
    /// pair-scoped.
    pub fn pair_key(&self) -> Option<(&str, &str)> {
        match (&self.mention_id, &self.concept_id) {
            (Some(m), Some(c)) => Some((m.as_str(), c.as_str())),
            _ => None,
        }
    }
}
