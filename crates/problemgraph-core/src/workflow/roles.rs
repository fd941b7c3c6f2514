//! Agent role contracts: Evaluator, Maker, Hater, Arbiter
//!
//! Each role is a black-box structured generator: a pure async function of
//! its input that returns a typed output or an [`AgentError`]. Dispatch is by
//! an explicit [`AgentRole`] tag and a [`AgentRoster`] trait object rather
//! than a class hierarchy, so a test roster can script fixed outputs per role
//! without touching the orchestrator.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Errors raised invoking an agent role.
#[non_exhaustive]
#[derive(Debug, Clone, thiserror::Error)]
pub enum AgentError {
    /// The role call did not complete within its configured timeout.
    #[error("role {role} timed out after {timeout_secs}s")]
    Timeout { role: AgentRole, timeout_secs: u64 },
    /// The underlying LLM provider returned output that didn't match the
    /// role's structured-output contract.
    #[error("role {role} returned malformed output: {message}")]
    MalformedOutput { role: AgentRole, message: String },
    /// The provider itself failed (outage, rate limit, ...).
    #[error("role {role} provider failure: {message}")]
    ProviderFailure { role: AgentRole, message: String },
}

/// Which agent role is being invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Evaluator,
    Maker,
    Hater,
    Arbiter,
    Synthesizer,
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AgentRole::Evaluator => "evaluator",
            AgentRole::Maker => "maker",
            AgentRole::Hater => "hater",
            AgentRole::Arbiter => "arbiter",
            AgentRole::Synthesizer => "synthesizer",
        };
        write!(f, "{s}")
    }
}

/// A concept summary as seen by an agent role, independent of storage shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConceptSummary {
    pub concept_id: String,
    pub canonical_statement: String,
    pub domain: String,
    pub mention_count: i64,
}

/// Input to the Evaluator role.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluatorInput {
    pub mention_statement: String,
    pub candidate: ConceptSummary,
    pub similarity_score: f32,
}

/// Evaluator decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluatorDecision {
    Approve,
    Reject,
    Escalate,
}

/// Output of the Evaluator role.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluatorOutput {
    pub decision: EvaluatorDecision,
    pub confidence: f32,
    pub reasoning: String,
    pub key_factors: Vec<String>,
}

/// A single argument produced by the Maker or Hater role.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Argument {
    pub claim: String,
    pub evidence: String,
    pub strength: f32,
}

/// Input shared by the Maker and Hater roles.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebaterInput {
    pub mention_statement: String,
    pub candidate: ConceptSummary,
}

/// Output shared by the Maker and Hater roles: 3-5 arguments plus an overall
/// confidence and an index into the argument list marking the strongest one.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebaterOutput {
    pub arguments: Vec<Argument>,
    pub overall_confidence: f32,
    pub strongest_argument_index: usize,
}

/// Input to the Arbiter role.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArbiterInput {
    pub maker: DebaterOutput,
    pub hater: DebaterOutput,
    pub round: u32,
    pub max_rounds: u32,
}

/// Arbiter decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArbiterDecision {
    Link,
    CreateNew,
    Retry,
}

/// Output of the Arbiter role.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArbiterOutput {
    pub decision: ArbiterDecision,
    pub confidence: f32,
    pub reasoning: String,
    /// Relative weight assigned to the maker's case, in [0, 1].
    pub maker_weight: f32,
    /// Relative weight assigned to the hater's case, in [0, 1].
    pub hater_weight: f32,
    pub decisive_factor: String,
}

/// A single linked mention as seen by the Synthesizer role: statement text
/// only, since rich attributes (assumptions, constraints, datasets, metrics,
/// baselines) are unioned deterministically by the refinement service rather
/// than left to the model to reproduce.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SynthesisMention {
    pub mention_id: String,
    pub statement: String,
}

/// Input to the Synthesizer role.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SynthesizerInput {
    pub concept_id: String,
    pub current_canonical_statement: String,
    pub mentions: Vec<SynthesisMention>,
}

/// Output of the Synthesizer role: the re-synthesised canonical statement
/// (at most two sentences) plus any conflicts it noticed across mentions
/// (contradictory assumptions, incompatible framings, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SynthesizerOutput {
    pub canonical_statement: String,
    pub conflict_markers: Vec<String>,
}

/// A roster of agent role implementations. Production wires this to an LLM
/// provider behind each role's structured-output contract; tests wire a
/// scripted roster that returns pre-recorded outputs.
#[async_trait]
pub trait AgentRoster: Send + Sync {
    async fn evaluate(&self, input: &EvaluatorInput) -> Result<EvaluatorOutput, AgentError>;
    async fn make(&self, input: &DebaterInput) -> Result<DebaterOutput, AgentError>;
    async fn hate(&self, input: &DebaterInput) -> Result<DebaterOutput, AgentError>;
    async fn arbitrate(&self, input: &ArbiterInput) -> Result<ArbiterOutput, AgentError>;
    async fn synthesize(&self, input: &SynthesizerInput) -> Result<SynthesizerOutput, AgentError>;
}
