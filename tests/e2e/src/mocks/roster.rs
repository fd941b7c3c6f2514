//! A scriptable [`AgentRoster`] for exercising the evaluator and
//! Maker/Hater/Arbiter consensus paths deterministically.
//!
//! Each role's outputs are a FIFO queue: every call to that role pops the
//! front entry. A role invoked more times than it was scripted panics with a
//! clear message - in practice this is a useful assertion, since an
//! unexpected extra call (e.g. a second refinement synthesis that shouldn't
//! have fired) shows up as a test failure rather than silently succeeding.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use problemgraph_core::workflow::{
    AgentError, AgentRoster, ArbiterInput, ArbiterOutput, DebaterInput, DebaterOutput,
    EvaluatorInput, EvaluatorOutput, SynthesizerInput, SynthesizerOutput,
};

pub struct ScriptedRoster {
    evaluator: Mutex<VecDeque<EvaluatorOutput>>,
    maker: Mutex<VecDeque<DebaterOutput>>,
    hater: Mutex<VecDeque<DebaterOutput>>,
    arbiter: Mutex<VecDeque<ArbiterOutput>>,
    synthesizer: Mutex<VecDeque<SynthesizerOutput>>,
}

/// Builds a [`ScriptedRoster`] by queuing outputs per role in call order.
#[derive(Default)]
pub struct RosterBuilder {
    evaluator: VecDeque<EvaluatorOutput>,
    maker: VecDeque<DebaterOutput>,
    hater: VecDeque<DebaterOutput>,
    arbiter: VecDeque<ArbiterOutput>,
    synthesizer: VecDeque<SynthesizerOutput>,
}

impl RosterBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn evaluator(mut self, output: EvaluatorOutput) -> Self {
        self.evaluator.push_back(output);
        self
    }

    pub fn maker(mut self, output: DebaterOutput) -> Self {
        self.maker.push_back(output);
        self
    }

    pub fn hater(mut self, output: DebaterOutput) -> Self {
        self.hater.push_back(output);
        self
    }

    pub fn arbiter(mut self, output: ArbiterOutput) -> Self {
        self.arbiter.push_back(output);
        self
    }

    pub fn synthesizer(mut self, output: SynthesizerOutput) -> Self {
        self.synthesizer.push_back(output);
        self
    }

    pub fn build(self) -> ScriptedRoster {
        ScriptedRoster {
            evaluator: Mutex::new(self.evaluator),
            maker: Mutex::new(self.maker),
            hater: Mutex::new(self.hater),
            arbiter: Mutex::new(self.arbiter),
            synthesizer: Mutex::new(self.synthesizer),
        }
    }
}

/// A single debater argument with plausible, non-empty content - every
/// round of a scripted consensus loop that doesn't care about argument
/// content can reuse this.
pub fn stub_debater_output(confidence: f32) -> DebaterOutput {
    use problemgraph_core::workflow::Argument;
    DebaterOutput {
        arguments: vec![Argument {
            claim: "shares terminology and framing with the candidate".to_string(),
            evidence: "overlapping key phrases".to_string(),
            strength: confidence,
        }],
        overall_confidence: confidence,
        strongest_argument_index: 0,
    }
}

#[async_trait]
impl AgentRoster for ScriptedRoster {
    async fn evaluate(&self, _input: &EvaluatorInput) -> Result<EvaluatorOutput, AgentError> {
        Ok(self
            .evaluator
            .lock()
            .expect("evaluator queue lock poisoned")
            .pop_front()
            .expect("no more scripted evaluator outputs"))
    }

    async fn make(&self, _input: &DebaterInput) -> Result<DebaterOutput, AgentError> {
        Ok(self
            .maker
            .lock()
            .expect("maker queue lock poisoned")
            .pop_front()
            .expect("no more scripted maker outputs"))
    }

    async fn hate(&self, _input: &DebaterInput) -> Result<DebaterOutput, AgentError> {
        Ok(self
            .hater
            .lock()
            .expect("hater queue lock poisoned")
            .pop_front()
            .expect("no more scripted hater outputs"))
    }

    async fn arbitrate(&self, _input: &ArbiterInput) -> Result<ArbiterOutput, AgentError> {
        Ok(self
            .arbiter
            .lock()
            .expect("arbiter queue lock poisoned")
            .pop_front()
            .expect("no more scripted arbiter outputs"))
    }

    async fn synthesize(&self, _input: &SynthesizerInput) -> Result<SynthesizerOutput, AgentError> {
        Ok(self
            .synthesizer
            .lock()
            .expect("synthesizer queue lock poisoned")
            .pop_front()
            .expect("no more scripted synthesizer outputs - did refinement fire more times than expected?"))
    }
}
