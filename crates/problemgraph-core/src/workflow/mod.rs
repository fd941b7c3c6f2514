//! The agent debate workflow: roles, orchestration, bounded retries

pub mod orchestrator;
pub mod roles;

pub use orchestrator::{run_consensus_loop, run_evaluator_path, CheckpointWriter, OrchestratorConfig, WorkflowOutcome};
pub use roles::{
    AgentError, AgentRole, AgentRoster, Argument, ArbiterDecision, ArbiterInput, ArbiterOutput,
    ConceptSummary, DebaterInput, DebaterOutput, EvaluatorDecision, EvaluatorInput, EvaluatorOutput,
    SynthesisMention, SynthesizerInput, SynthesizerOutput,
};
