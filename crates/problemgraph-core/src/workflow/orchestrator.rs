//! Single-evaluator-then-adversarial-consensus orchestration
//!
//! Bounded-work guarantees: each role call is wrapped in [`tokio::time::timeout`];
//! a timed-out call is retried exactly once before the item escalates to the
//! review queue. Total wall time for the consensus path is bounded by
//! `max_consensus_rounds * 3 * role_timeout`.

use std::time::Duration;

use tracing::{instrument, warn};

use super::roles::{
    AgentError, AgentRole, AgentRoster, ArbiterDecision, ArbiterInput, ConceptSummary,
    DebaterInput, EvaluatorDecision, EvaluatorInput,
};

/// Everything the orchestrator needs to record a checkpoint. Implemented by
/// the engine's storage layer; a no-op implementation is used in tests that
/// don't assert on checkpoint content.
pub trait CheckpointWriter {
    /// Record a checkpoint before `stage` runs, returning its id.
    fn checkpoint(&self, stage: &str, artefacts: serde_json::Value) -> Result<String, crate::error::EngineError>;
}

/// Final disposition of a work item that went through the agent workflow.
#[derive(Debug, Clone)]
pub enum WorkflowOutcome {
    /// Link to the given concept id, recorded via the given method/band.
    Link { concept_id: String, confidence: f32 },
    /// Create a new concept for the mention.
    CreateNew,
    /// Escalate to the review queue with the collected artefacts.
    Escalate {
        reason: String,
        artefacts: serde_json::Value,
    },
}

/// Configuration the orchestrator needs, independent of the rest of
/// [`crate::config::EngineConfig`] so it can be unit tested in isolation.
#[derive(Debug, Clone, Copy)]
pub struct OrchestratorConfig {
    pub max_consensus_rounds: u32,
    pub arbiter_confidence_threshold: f32,
    pub role_timeout_secs: u64,
}

async fn call_with_retry<T, F, Fut>(
    role: AgentRole,
    timeout: Duration,
    mut call: F,
) -> Result<T, AgentError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, AgentError>>,
{
    for attempt in 0..2u32 {
        match tokio::time::timeout(timeout, call()).await {
            Ok(result) => return result,
            Err(_) if attempt == 0 => {
                warn!(role = %role, "agent role timed out, retrying once");
                continue;
            }
            Err(_) => {
                return Err(AgentError::Timeout {
                    role,
                    timeout_secs: timeout.as_secs(),
                });
            }
        }
    }
    unreachable!("loop always returns within two attempts")
}

/// Run the MEDIUM-band path: a single Evaluator call.
#[instrument(skip(roster, checkpoints), fields(concept_id = %candidate.concept_id))]
pub async fn run_evaluator_path(
    roster: &dyn AgentRoster,
    checkpoints: &dyn CheckpointWriter,
    cfg: OrchestratorConfig,
    mention_statement: &str,
    candidate: &ConceptSummary,
    similarity_score: f32,
) -> Result<WorkflowOutcome, crate::error::EngineError> {
    checkpoints.checkpoint("evaluator", serde_json::json!({ "candidate": candidate.concept_id }))?;

    let input = EvaluatorInput {
        mention_statement: mention_statement.to_string(),
        candidate: candidate.clone(),
        similarity_score,
    };
    let timeout = Duration::from_secs(cfg.role_timeout_secs);

    let outcome = call_with_retry(AgentRole::Evaluator, timeout, || roster.evaluate(&input)).await;

    match outcome {
        Ok(output) => match output.decision {
            EvaluatorDecision::Approve => Ok(WorkflowOutcome::Link {
                concept_id: candidate.concept_id.clone(),
                confidence: output.confidence,
            }),
            EvaluatorDecision::Reject => Ok(WorkflowOutcome::CreateNew),
            EvaluatorDecision::Escalate => {
                run_consensus_loop(roster, checkpoints, cfg, mention_statement, candidate, vec![
                    serde_json::json!({ "stage": "evaluator", "reasoning": output.reasoning }),
                ])
                .await
            }
        },
        Err(e) => Ok(WorkflowOutcome::Escalate {
            reason: format!("evaluator failed: {e}"),
            artefacts: serde_json::json!({ "error": e.to_string() }),
        }),
    }
}

/// Run the LOW-band / escalated path: Maker -> Hater -> Arbiter, looping up
/// to `max_consensus_rounds`.
#[instrument(skip(roster, checkpoints, prior_artefacts), fields(concept_id = %candidate.concept_id))]
pub async fn run_consensus_loop(
    roster: &dyn AgentRoster,
    checkpoints: &dyn CheckpointWriter,
    cfg: OrchestratorConfig,
    mention_statement: &str,
    candidate: &ConceptSummary,
    mut prior_artefacts: Vec<serde_json::Value>,
) -> Result<WorkflowOutcome, crate::error::EngineError> {
    let timeout = Duration::from_secs(cfg.role_timeout_secs);
    let debater_input = DebaterInput {
        mention_statement: mention_statement.to_string(),
        candidate: candidate.clone(),
    };

    for round in 0..cfg.max_consensus_rounds {
        checkpoints.checkpoint(
            "consensus_round",
            serde_json::json!({ "round": round, "concept_id": candidate.concept_id }),
        )?;

        let maker = match call_with_retry(AgentRole::Maker, timeout, || roster.make(&debater_input)).await {
            Ok(output) => output,
            Err(e) => {
                return Ok(WorkflowOutcome::Escalate {
                    reason: format!("maker failed at round {round}: {e}"),
                    artefacts: serde_json::Value::Array(prior_artefacts),
                });
            }
        };
        let hater = match call_with_retry(AgentRole::Hater, timeout, || roster.hate(&debater_input)).await {
            Ok(output) => output,
            Err(e) => {
                return Ok(WorkflowOutcome::Escalate {
                    reason: format!("hater failed at round {round}: {e}"),
                    artefacts: serde_json::Value::Array(prior_artefacts),
                });
            }
        };

        let arbiter_input = ArbiterInput {
            maker: maker.clone(),
            hater: hater.clone(),
            round,
            max_rounds: cfg.max_consensus_rounds,
        };
        let arbiter = match call_with_retry(AgentRole::Arbiter, timeout, || roster.arbitrate(&arbiter_input)).await {
            Ok(output) => output,
            Err(e) => {
                return Ok(WorkflowOutcome::Escalate {
                    reason: format!("arbiter failed at round {round}: {e}"),
                    artefacts: serde_json::Value::Array(prior_artefacts),
                });
            }
        };

        prior_artefacts.push(serde_json::json!({
            "round": round,
            "maker": maker,
            "hater": hater,
            "arbiter": arbiter,
        }));

        let is_final_round = round + 1 == cfg.max_consensus_rounds;

        // The arbiter's own RETRY gate (confidence < threshold) is advisory;
        // on the final round RETRY is not a legal decision at all, so a
        // RETRY here (forced or chosen) resolves to the conservative
        // default: LINK.
        let effective_decision = if is_final_round && arbiter.decision == ArbiterDecision::Retry {
            ArbiterDecision::Link
        } else {
            arbiter.decision
        };

        match effective_decision {
            ArbiterDecision::Link if arbiter.confidence >= cfg.arbiter_confidence_threshold || is_final_round => {
                checkpoints.checkpoint(
                    "commit",
                    serde_json::json!({ "decision": "link", "concept_id": candidate.concept_id }),
                )?;
                return Ok(WorkflowOutcome::Link {
                    concept_id: candidate.concept_id.clone(),
                    confidence: arbiter.confidence,
                });
            }
            ArbiterDecision::CreateNew if arbiter.confidence >= cfg.arbiter_confidence_threshold || is_final_round => {
                checkpoints.checkpoint("commit", serde_json::json!({ "decision": "create_new" }))?;
                return Ok(WorkflowOutcome::CreateNew);
            }
            _ => {
                // RETRY, or a LINK/CREATE_NEW that didn't clear the
                // confidence bar on a non-final round: loop again.
                continue;
            }
        }
    }

    // Unreachable in practice: the final round always resolves via the
    // is_final_round branch above. Kept as a safety net against a future
    // change to the round-exit conditions.
    Ok(WorkflowOutcome::Escalate {
        reason: "consensus rounds exhausted without a decision".to_string(),
        artefacts: serde_json::Value::Array(prior_artefacts),
    })
}
