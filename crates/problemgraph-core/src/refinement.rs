//! Concept refinement: threshold-triggered re-synthesis of the canonical
//! statement from accumulated mentions
//!
//! Refinement is advisory-locked per concept (`RefinementLocks`) rather than
//! serialised through the graph store's transaction machinery: the
//! auto-linker keeps incrementing counters on a concept mid-refinement, and
//! refinement re-reads mentions and the `human_edited` flag at the moment it
//! is about to commit rather than holding a long-lived transaction open
//! across an LLM round trip.

use std::collections::HashSet;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

use crate::config::RefinementThresholds;
use crate::embedding::EmbeddingCache;
use crate::error::EngineError;
use crate::model::{
    Provenanced, ProblemConcept, SynthesisMetadata,
};
use crate::retry;
use crate::storage::GraphStore;
use crate::workflow::{AgentRoster, SynthesisMention, SynthesizerInput};

/// A set of concept ids currently being refined, guarding against two
/// concurrent refinements of the same concept. Not a general-purpose lock
/// manager - acquisition is non-blocking: a concept already locked is simply
/// skipped, since refinement is triggered opportunistically after every
/// link/creation and will be retried on the next trigger.
pub struct RefinementLocks {
    held: Mutex<HashSet<String>>,
}

impl Default for RefinementLocks {
    fn default() -> Self {
        Self::new()
    }
}

impl RefinementLocks {
    pub fn new() -> Self {
        Self {
            held: Mutex::new(HashSet::new()),
        }
    }

    /// Attempt to acquire the lock for `concept_id`. Returns `None` if
    /// another refinement already holds it.
    fn try_acquire(&self, concept_id: &str) -> Option<RefinementLockGuard<'_>> {
        let mut held = self.held.lock().expect("refinement lock set poisoned");
        if held.insert(concept_id.to_string()) {
            Some(RefinementLockGuard {
                locks: self,
                concept_id: concept_id.to_string(),
            })
        } else {
            None
        }
    }
}

struct RefinementLockGuard<'a> {
    locks: &'a RefinementLocks,
    concept_id: String,
}

impl Drop for RefinementLockGuard<'_> {
    fn drop(&mut self) {
        self.locks
            .held
            .lock()
            .expect("refinement lock set poisoned")
            .remove(&self.concept_id);
    }
}

/// Outcome of a refinement attempt that didn't error, but also didn't
/// produce a new concept version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefinementSkipReason {
    /// Another refinement of this concept is already in flight.
    AlreadyInFlight,
    /// The concept is not at a refinement threshold, or is human-edited.
    NotDue,
    /// `human_edited` flipped to `true` while synthesis was running.
    DiscardedHumanEdit,
}

/// Result of [`RefinementService::refine`].
#[derive(Debug, Clone)]
pub enum RefinementOutcome {
    Refined(ProblemConcept),
    Skipped(RefinementSkipReason),
}

fn validate_canonical_statement(statement: &str, max_tokens: usize) -> Result<(), EngineError> {
    let trimmed = statement.trim();
    if trimmed.is_empty() {
        return Err(EngineError::Validation(
            "synthesized canonical statement is empty".to_string(),
        ));
    }
    let sentence_count = trimmed
        .matches(|c| c == '.' || c == '!' || c == '?')
        .count()
        .max(1);
    if sentence_count > 2 {
        return Err(EngineError::Validation(format!(
            "synthesized canonical statement has {sentence_count} sentences, expected at most 2"
        )));
    }
    let token_count = trimmed.split_whitespace().count();
    if token_count > max_tokens {
        return Err(EngineError::Validation(format!(
            "synthesized canonical statement has {token_count} tokens, expected at most {max_tokens}"
        )));
    }
    Ok(())
}

fn union_provenanced<T: Clone>(values: Vec<(String, Vec<T>)>) -> Vec<Provenanced<T>> {
    values
        .into_iter()
        .flat_map(|(mention_id, items)| {
            items.into_iter().map(move |value| Provenanced {
                value,
                source_mention_id: mention_id.clone(),
            })
        })
        .collect()
}

/// Drives threshold-triggered concept refinement.
///
/// `locks` is borrowed rather than owned: a fresh `RefinementService` is
/// built per refinement attempt, but the advisory lock set must outlive any
/// single attempt for it to guard anything, so callers hold one
/// `RefinementLocks` for the engine's lifetime and pass it in by reference.
pub struct RefinementService<'a> {
    store: &'a dyn GraphStore,
    embeddings: &'a EmbeddingCache,
    roster: &'a dyn AgentRoster,
    locks: &'a RefinementLocks,
    thresholds: RefinementThresholds,
    retry_policy: crate::config::RetryPolicy,
}

impl<'a> RefinementService<'a> {
    pub fn new(
        store: &'a dyn GraphStore,
        embeddings: &'a EmbeddingCache,
        roster: &'a dyn AgentRoster,
        locks: &'a RefinementLocks,
        thresholds: RefinementThresholds,
        retry_policy: crate::config::RetryPolicy,
    ) -> Self {
        Self {
            store,
            embeddings,
            roster,
            locks,
            thresholds,
            retry_policy,
        }
    }

    /// Refine `concept_id` if it is currently due, retrying the synthesis
    /// round trip up to `thresholds.max_retries` times on failure.
    #[instrument(skip(self), fields(concept_id = %concept_id))]
    pub async fn refine(&self, concept_id: &str, now: DateTime<Utc>) -> Result<RefinementOutcome, EngineError> {
        let Some(_guard) = self.locks.try_acquire(concept_id) else {
            return Ok(RefinementOutcome::Skipped(RefinementSkipReason::AlreadyInFlight));
        };

        let concept = self
            .store
            .get_concept(concept_id)?
            .ok_or_else(|| EngineError::NotFound(format!("concept {concept_id}")))?;

        if !concept.is_refinement_due(&self.thresholds.counts) {
            return Ok(RefinementOutcome::Skipped(RefinementSkipReason::NotDue));
        }

        let mentions = self.store.list_mentions_for_concept(concept_id)?;
        let synthesis_mentions: Vec<SynthesisMention> = mentions
            .iter()
            .map(|m| SynthesisMention {
                mention_id: m.id.clone(),
                statement: m.statement.clone(),
            })
            .collect();

        let input = SynthesizerInput {
            concept_id: concept.id.clone(),
            current_canonical_statement: concept.canonical_statement.clone(),
            mentions: synthesis_mentions,
        };

        let roster = self.roster;
        let max_tokens = self.thresholds.max_canonical_statement_tokens;
        let output = retry::with_backoff_async(&self.retry_policy, |attempt| {
            let input = input.clone();
            async move {
                if attempt > 0 {
                    warn!(attempt, "retrying concept synthesis");
                }
                let output = roster.synthesize(&input).await?;
                validate_canonical_statement(&output.canonical_statement, max_tokens)?;
                Ok::<_, EngineError>(output)
            }
        })
        .await?;

        for marker in &output.conflict_markers {
            warn!(concept_id, marker, "synthesizer flagged a conflict across mentions");
        }

        // Re-read immediately before committing: human_edited may have
        // flipped while the synthesis round trip was in flight.
        let fresh = self
            .store
            .get_concept(concept_id)?
            .ok_or_else(|| EngineError::NotFound(format!("concept {concept_id}")))?;
        if fresh.human_edited {
            return Ok(RefinementOutcome::Skipped(RefinementSkipReason::DiscardedHumanEdit));
        }

        let new_embedding = self.embeddings.embed(&output.canonical_statement)?;

        // Re-read mentions at the moment of commit rather than reusing the
        // snapshot passed to the synthesizer: the auto-linker may have added
        // more mentions to this concept while synthesis was in flight.
        let committed_mentions = self.store.list_mentions_for_concept(concept_id)?;
        let assumptions = union_provenanced(
            committed_mentions.iter().map(|m| (m.id.clone(), m.assumptions.clone())).collect(),
        );
        let constraints = union_provenanced(
            committed_mentions.iter().map(|m| (m.id.clone(), m.constraints.clone())).collect(),
        );
        let datasets = union_provenanced(
            committed_mentions.iter().map(|m| (m.id.clone(), m.datasets.clone())).collect(),
        );
        let metrics = union_provenanced(
            committed_mentions.iter().map(|m| (m.id.clone(), m.metrics.clone())).collect(),
        );

        let mut refined = fresh;
        refined.canonical_statement = output.canonical_statement;
        refined.assumptions = assumptions;
        refined.constraints = constraints;
        refined.datasets = datasets;
        refined.metrics = metrics;
        refined.embedding = new_embedding;
        refined.synthesis = Some(SynthesisMetadata {
            method: "llm_synthesis".to_string(),
            model_id: None,
            synthesized_at: now,
            synthesizer_id: "system".to_string(),
        });
        refined.version += 1;
        refined.last_refined_at_count = refined.mention_count;

        self.store.save_concept(&refined)?;
        info!(concept_id, version = refined.version, "concept refined");
        Ok(RefinementOutcome::Refined(refined))
    }
}
