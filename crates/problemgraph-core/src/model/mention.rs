//! Problem mentions - paper-specific problem statements
//!
//! A [`ProblemMention`] is immutable after creation except for its workflow
//! state and concept linkage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::WorkflowState;

// ============================================================================
// RICH ATTRIBUTES
// ============================================================================

/// A stated or implicit assumption behind a problem statement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Assumption {
    /// The assumption text.
    pub text: String,
    /// Whether the assumption is implicit (not stated verbatim in the paper).
    pub implicit: bool,
    /// Extraction confidence, 0.0-1.0.
    pub confidence: f32,
}

/// The category of a constraint attached to a problem statement.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintKind {
    /// A compute/memory/latency constraint.
    Computational,
    /// A data availability or quality constraint.
    Data,
    /// A constraint on the methodology itself.
    Methodological,
    /// A constraint rooted in theory (e.g. a proof assumption).
    Theoretical,
}

impl std::fmt::Display for ConstraintKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConstraintKind::Computational => "computational",
            ConstraintKind::Data => "data",
            ConstraintKind::Methodological => "methodological",
            ConstraintKind::Theoretical => "theoretical",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ConstraintKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "computational" => Ok(ConstraintKind::Computational),
            "data" => Ok(ConstraintKind::Data),
            "methodological" => Ok(ConstraintKind::Methodological),
            "theoretical" => Ok(ConstraintKind::Theoretical),
            other => Err(format!("unknown constraint kind: {other}")),
        }
    }
}

/// A constraint on the problem (computational, data, methodological, theoretical).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Constraint {
    /// The constraint text.
    pub text: String,
    /// The constraint's category.
    pub kind: ConstraintKind,
    /// Extraction confidence, 0.0-1.0.
    pub confidence: f32,
}

/// A dataset referenced by the problem statement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct DatasetRef {
    /// Dataset name.
    pub name: String,
    /// Dataset URL, if known.
    pub url: Option<String>,
    /// Whether the dataset is publicly available.
    pub available: Option<bool>,
    /// Human-readable size description (e.g. "1.2M examples").
    pub size: Option<String>,
}

/// An evaluation metric referenced by the problem statement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct MetricRef {
    /// Metric name (e.g. "BLEU", "accuracy").
    pub name: String,
    /// Free-text description of the metric.
    pub description: Option<String>,
    /// A reported baseline value for this metric, if any.
    pub baseline_value: Option<f64>,
}

/// A reported baseline: a named system with per-metric performance numbers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Baseline {
    /// Baseline system name.
    pub name: String,
    /// DOI of the paper reporting this baseline, if known.
    pub paper_doi: Option<String>,
    /// Metric name -> reported value.
    pub performance: HashMap<String, f64>,
}

// ============================================================================
// LINKAGE & PROVENANCE
// ============================================================================

/// Confidence classification of a match between a mention and a concept.
///
/// `None` is the matcher's "no qualifying candidate" classification;
/// `Rejected` marks a mention whose match was rejected (by an evaluator,
/// arbiter, or human) rather than never attempted.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConfidenceBand {
    /// Score at or above the HIGH threshold.
    High,
    /// Score at or above the MEDIUM threshold.
    Medium,
    /// Score at or above the LOW threshold.
    Low,
    /// Score below every threshold (classifier output only).
    None,
    /// The match was explicitly rejected.
    Rejected,
}

impl std::fmt::Display for ConfidenceBand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConfidenceBand::High => "HIGH",
            ConfidenceBand::Medium => "MEDIUM",
            ConfidenceBand::Low => "LOW",
            ConfidenceBand::None => "NONE",
            ConfidenceBand::Rejected => "REJECTED",
        };
        write!(f, "{s}")
    }
}

/// How a mention came to be linked (or not linked) to a concept.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMethod {
    /// Linked automatically by the matcher/auto-linker.
    Auto,
    /// Linked (or created) via the agent debate workflow.
    Agent,
    /// Linked (or created) via human review resolution.
    Human,
}

impl std::fmt::Display for MatchMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MatchMethod::Auto => "auto",
            MatchMethod::Agent => "agent",
            MatchMethod::Human => "human",
        };
        write!(f, "{s}")
    }
}

/// Review status of a mention as it moves through the workflow.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    /// Not yet routed to a human reviewer.
    Pending,
    /// Approved by a human reviewer.
    Approved,
    /// Rejected by a human reviewer.
    Rejected,
    /// Routed into the agent consensus protocol.
    NeedsConsensus,
}

// ============================================================================
// PROBLEM MENTION
// ============================================================================

/// A paper-specific problem statement plus its extracted attributes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProblemMention {
    /// Stable unique id.
    pub id: String,
    /// The problem statement text.
    pub statement: String,
    /// Id of the paper this mention was extracted from.
    pub paper_id: String,
    /// Section label the statement was found in (e.g. "Introduction").
    pub section: String,
    /// Verbatim quoted source text.
    pub source_text: String,
    /// Domain tag (e.g. "NLP", "Vision").
    pub domain: String,

    /// Ordered assumptions behind the problem statement.
    pub assumptions: Vec<Assumption>,
    /// Constraints on the problem.
    pub constraints: Vec<Constraint>,
    /// Datasets referenced.
    pub datasets: Vec<DatasetRef>,
    /// Metrics referenced.
    pub metrics: Vec<MetricRef>,
    /// Baselines referenced.
    pub baselines: Vec<Baseline>,

    /// Extractor version string.
    pub extractor_version: String,
    /// Identifier of the extraction model used.
    pub extraction_model_id: String,
    /// Extraction confidence, 0.0-1.0.
    pub extraction_confidence: f32,
    /// Reviewer id, if a human touched the extraction.
    pub reviewer_id: Option<String>,

    /// Dense embedding vector, populated once the embedding stage completes.
    pub embedding: Option<Vec<f32>>,

    /// Linked concept id, once matched.
    pub concept_id: Option<String>,
    /// Confidence band of the current match, if any.
    pub match_confidence: Option<ConfidenceBand>,
    /// Numeric match score backing `match_confidence`.
    pub match_score: Option<f32>,
    /// How the current match was made.
    pub match_method: Option<MatchMethod>,

    /// Current workflow state.
    pub workflow_state: WorkflowState,
    /// Review status.
    pub review_status: ReviewStatus,

    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// Caller-supplied fields for submitting a new mention; the engine fills in
/// id, embedding, linkage, and workflow state.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct MentionInput {
    /// The problem statement text.
    pub statement: String,
    /// Id of the paper this mention was extracted from.
    pub paper_id: String,
    /// Section label.
    pub section: String,
    /// Verbatim quoted source text.
    pub source_text: String,
    /// Domain tag.
    pub domain: String,
    /// Ordered assumptions.
    pub assumptions: Vec<Assumption>,
    /// Constraints.
    pub constraints: Vec<Constraint>,
    /// Datasets.
    pub datasets: Vec<DatasetRef>,
    /// Metrics.
    pub metrics: Vec<MetricRef>,
    /// Baselines.
    pub baselines: Vec<Baseline>,
    /// Extractor version string.
    pub extractor_version: String,
    /// Extraction model id.
    pub extraction_model_id: String,
    /// Extraction confidence, 0.0-1.0.
    pub extraction_confidence: f32,
    /// Reviewer id, if any.
    pub reviewer_id: Option<String>,
}

impl ProblemMention {
    /// Construct a fresh mention in the `EXTRACTED` state from extractor input.
    pub fn new(id: String, input: MentionInput, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            statement: input.statement,
            paper_id: input.paper_id,
            section: input.section,
            source_text: input.source_text,
            domain: input.domain,
            assumptions: input.assumptions,
            constraints: input.constraints,
            datasets: input.datasets,
            metrics: input.metrics,
            baselines: input.baselines,
            extractor_version: input.extractor_version,
            extraction_model_id: input.extraction_model_id,
            extraction_confidence: input.extraction_confidence,
            reviewer_id: input.reviewer_id,
            embedding: None,
            concept_id: None,
            match_confidence: None,
            match_score: None,
            match_method: None,
            workflow_state: WorkflowState::Extracted,
            review_status: ReviewStatus::Pending,
            created_at,
        }
    }

    /// A mention in `AUTO_LINKED` always carries exactly one concept link.
    pub fn is_linked(&self) -> bool {
        self.workflow_state == WorkflowState::AutoLinked && self.concept_id.is_some()
    }
}
