//! Problem concepts - the canonical, paper-agnostic representation
//!
//! A [`ProblemConcept`] is created with exactly one mention and accrues more
//! over time. Aggregated attributes carry per-mention provenance so
//! conflicting claims (e.g. two papers reporting different baseline numbers
//! for the same metric) remain individually traceable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::mention::{Assumption, Baseline, Constraint, DatasetRef, MetricRef};

/// Lifecycle status of a canonical concept.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConceptStatus {
    /// Actively accruing mentions, not yet resolved.
    #[default]
    Open,
    /// Under active investigation/resolution.
    InProgress,
    /// Considered resolved by the research community.
    Resolved,
    /// Soft-deleted: excluded from matching and UI, but never destroyed
    /// Concepts with incoming links are never destructively deleted.
    Deprecated,
}

/// An aggregated attribute tagged with the mention it was sourced from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Provenanced<T> {
    /// The aggregated value.
    pub value: T,
    /// The mention this value was sourced from.
    pub source_mention_id: String,
}

/// Synthesis metadata recorded each time the canonical statement is refined.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SynthesisMetadata {
    /// Synthesis method tag (e.g. "llm_synthesis", "initial").
    pub method: String,
    /// Model id used for synthesis, if an LLM synthesiser was used.
    pub model_id: Option<String>,
    /// When the synthesis completed.
    pub synthesized_at: DateTime<Utc>,
    /// Who/what performed the synthesis ("system", a human reviewer id, ...).
    pub synthesizer_id: String,
}

/// The canonical representation of a research problem.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProblemConcept {
    /// Stable unique id.
    pub id: String,
    /// The canonical statement.
    pub canonical_statement: String,
    /// Domain tag.
    pub domain: String,
    /// Lifecycle status.
    pub status: ConceptStatus,

    /// Aggregated assumptions, each tagged with its source mention.
    pub assumptions: Vec<Provenanced<Assumption>>,
    /// Aggregated constraints, each tagged with its source mention.
    pub constraints: Vec<Provenanced<Constraint>>,
    /// Aggregated datasets, each tagged with its source mention.
    pub datasets: Vec<Provenanced<DatasetRef>>,
    /// Aggregated metrics, each tagged with its source mention.
    pub metrics: Vec<Provenanced<MetricRef>>,

    /// Baselines promoted to "verified" (reproducible) via an explicit
    /// external signal. Synthesis never promotes into this list.
    pub verified_baselines: Vec<Baseline>,
    /// Baselines reported by papers but not independently verified.
    pub claimed_baselines: Vec<Baseline>,

    /// Synthesis metadata from the most recent refinement, if any.
    pub synthesis: Option<SynthesisMetadata>,
    /// Whether a human has edited the canonical statement; blocks automated
    /// refinement until cleared by a human action.
    pub human_edited: bool,
    /// Monotonically increasing version counter.
    pub version: i64,

    /// Count of incoming `INSTANCE_OF` edges.
    pub mention_count: i64,
    /// Count of distinct papers among linked mentions.
    pub paper_count: i64,
    /// Earliest publication year among linked mentions.
    pub first_mentioned_year: Option<i32>,
    /// Latest publication year among linked mentions.
    pub last_mentioned_year: Option<i32>,
    /// `mention_count` value as of the last successful refinement.
    pub last_refined_at_count: i64,

    /// Canonical embedding, cosine-comparable to mention embeddings.
    pub embedding: Vec<f32>,

    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// A point-in-time snapshot of a concept's content fields, recorded
/// alongside every create/save so `rollback(concept_version)` has something
/// to restore from. Counts (`mention_count`, `paper_count`, ...) and
/// `status`/`human_edited` are deliberately excluded: those stay authoritative
/// from live `instance_of_edges` and are recomputed rather than restored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConceptVersionSnapshot {
    pub concept_id: String,
    pub version: i64,
    pub canonical_statement: String,
    pub domain: String,
    pub assumptions: Vec<Provenanced<Assumption>>,
    pub constraints: Vec<Provenanced<Constraint>>,
    pub datasets: Vec<Provenanced<DatasetRef>>,
    pub metrics: Vec<Provenanced<MetricRef>>,
    pub verified_baselines: Vec<Baseline>,
    pub claimed_baselines: Vec<Baseline>,
    pub embedding: Vec<f32>,
    pub created_at: DateTime<Utc>,
}

impl ProblemConcept {
    /// Create a new concept from its first mention.
    #[allow(clippy::too_many_arguments)]
    pub fn from_first_mention(
        id: String,
        canonical_statement: String,
        domain: String,
        embedding: Vec<f32>,
        paper_year: Option<i32>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            canonical_statement,
            domain,
            status: ConceptStatus::Open,
            assumptions: Vec::new(),
            constraints: Vec::new(),
            datasets: Vec::new(),
            metrics: Vec::new(),
            verified_baselines: Vec::new(),
            claimed_baselines: Vec::new(),
            synthesis: None,
            human_edited: false,
            version: 1,
            mention_count: 1,
            paper_count: 1,
            first_mentioned_year: paper_year,
            last_mentioned_year: paper_year,
            last_refined_at_count: 0,
            embedding,
            created_at,
        }
    }

    /// Whether this concept is eligible for refinement at its current
    /// mention count: true only when `mention_count` has advanced past a
    /// threshold not yet accounted for by `last_refined_at_count`, not for
    /// every subsequent mention once the first threshold is cleared.
    pub fn is_refinement_due(&self, thresholds: &[i64]) -> bool {
        if self.human_edited {
            return false;
        }
        thresholds
            .iter()
            .any(|&t| t > self.last_refined_at_count && t <= self.mention_count)
    }
}
