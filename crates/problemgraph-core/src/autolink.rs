//! Auto-linker: transactional HIGH-band linking and new-concept creation
//!
//! Both operations run inside a single serialisable transaction on the graph
//! store: no partial state is ever visible, and on failure the work item
//! returns to its pre-linker state, retryable up to its retry cap.

use chrono::{DateTime, Utc};

use crate::error::EngineError;
use crate::matcher::{Candidate, ConceptMatcher};
use crate::model::{ConfidenceBand, MatchMethod, ProblemConcept, ProblemMention, WorkItem, WorkflowState};
use crate::storage::{GraphStore, GraphTransaction};

/// Re-reads the top candidate for `mention`, verifies its band is still
/// HIGH, and transactionally creates the `INSTANCE_OF` edge, updates concept
/// counters, and transitions the work item to `AUTO_LINKED`.
///
/// If the band has changed under concurrent update the transaction aborts
/// and the caller should reroute the work item back through the matcher.
pub fn auto_link_high(
    store: &dyn GraphStore,
    matcher: &ConceptMatcher<'_>,
    work_item: &mut WorkItem,
    mention: &mut ProblemMention,
    candidate: &Candidate,
    match_method: MatchMethod,
    now: DateTime<Utc>,
) -> Result<(), EngineError> {
    let mention_embedding = mention
        .embedding
        .clone()
        .ok_or_else(|| EngineError::Validation("mention has no embedding".to_string()))?;
    let citation_component = (candidate.boosted_score - candidate.raw_score).max(0.0);
    let concept_id = candidate.concept_id.clone();

    store.with_transaction(&mut |txn: &mut dyn GraphTransaction| {
        let fresh = txn
            .get_concept(&concept_id)?
            .ok_or_else(|| EngineError::Conflict(format!("concept {concept_id} no longer exists")))?;

        let fresh_raw = crate::embedding::cosine_similarity(&mention_embedding, &fresh.embedding);
        let fresh_boosted = fresh_raw + citation_component;
        if matcher.classify(fresh_boosted) != ConfidenceBand::High {
            return Err(EngineError::Conflict(
                "candidate's confidence band changed under concurrent update".to_string(),
            ));
        }

        txn.create_instance_of_edge(&mention.id, &fresh.id)?;
        let paper_year = txn.paper_year(&mention.paper_id)?;
        txn.increment_concept_mention_count(&fresh.id, paper_year)?;

        mention.concept_id = Some(fresh.id.clone());
        mention.match_confidence = Some(ConfidenceBand::High);
        mention.match_score = Some(fresh_boosted);
        mention.match_method = Some(match_method);
        mention.workflow_state = WorkflowState::AutoLinked;
        txn.save_mention(mention)?;

        work_item.selected_concept_id = Some(fresh.id.clone());
        work_item.transition(
            WorkflowState::AutoLinked,
            "auto-linker: HIGH band confirmed",
            serde_json::json!({ "concept_id": fresh.id }),
            None,
            now,
        )?;
        txn.save_work_item(work_item)?;

        Ok(())
    })
}

/// Produces a [`ProblemConcept`] whose canonical statement initially equals
/// the mention statement and embedding equals the mention embedding; creates
/// the concept row and its first `INSTANCE_OF` edge in one transaction.
pub fn create_new_concept(
    store: &dyn GraphStore,
    work_item: &mut WorkItem,
    mention: &mut ProblemMention,
    new_concept_id: String,
    now: DateTime<Utc>,
) -> Result<ProblemConcept, EngineError> {
    let embedding = mention
        .embedding
        .clone()
        .ok_or_else(|| EngineError::Validation("mention has no embedding".to_string()))?;

    let mut created: Option<ProblemConcept> = None;

    store.with_transaction(&mut |txn: &mut dyn GraphTransaction| {
        let paper_year = txn.paper_year(&mention.paper_id)?;
        let concept = ProblemConcept::from_first_mention(
            new_concept_id.clone(),
            mention.statement.clone(),
            mention.domain.clone(),
            embedding.clone(),
            paper_year,
            now,
        );

        txn.create_concept(&concept)?;
        txn.create_instance_of_edge(&mention.id, &concept.id)?;

        mention.concept_id = Some(concept.id.clone());
        mention.match_confidence = None;
        mention.match_score = None;
        mention.match_method = Some(MatchMethod::Auto);
        mention.workflow_state = WorkflowState::CreateNewConcept;
        txn.save_mention(mention)?;

        work_item.selected_concept_id = Some(concept.id.clone());
        work_item.transition(
            WorkflowState::CreateNewConcept,
            "auto-linker: no qualifying candidate",
            serde_json::json!({ "concept_id": concept.id }),
            None,
            now,
        )?;
        txn.save_work_item(work_item)?;

        created = Some(concept);
        Ok(())
    })?;

    created.ok_or_else(|| EngineError::Conflict("concept creation transaction produced no concept".to_string()))
}

/// Commits a link decided by the agent workflow or a human reviewer. Unlike
/// [`auto_link_high`] this does not re-verify the candidate's confidence
/// band - the evaluator, arbiter, or human who approved it is the authority
/// for the decision. Requires `work_item` to already be in `APPROVED`.
#[allow(clippy::too_many_arguments)]
pub fn link_approved(
    store: &dyn GraphStore,
    work_item: &mut WorkItem,
    mention: &mut ProblemMention,
    concept_id: &str,
    band: ConfidenceBand,
    match_method: MatchMethod,
    confidence: f32,
    now: DateTime<Utc>,
) -> Result<(), EngineError> {
    store.with_transaction(&mut |txn: &mut dyn GraphTransaction| {
        let concept = txn
            .get_concept(concept_id)?
            .ok_or_else(|| EngineError::Conflict(format!("concept {concept_id} no longer exists")))?;

        txn.create_instance_of_edge(&mention.id, &concept.id)?;
        let paper_year = txn.paper_year(&mention.paper_id)?;
        txn.increment_concept_mention_count(&concept.id, paper_year)?;

        mention.concept_id = Some(concept.id.clone());
        mention.match_confidence = Some(band);
        mention.match_score = Some(confidence);
        mention.match_method = Some(match_method);
        mention.workflow_state = WorkflowState::AutoLinked;
        txn.save_mention(mention)?;

        work_item.selected_concept_id = Some(concept.id.clone());
        work_item.transition(
            WorkflowState::AutoLinked,
            "reviewed link committed",
            serde_json::json!({ "concept_id": concept.id }),
            None,
            now,
        )?;
        txn.save_work_item(work_item)?;

        Ok(())
    })
}
