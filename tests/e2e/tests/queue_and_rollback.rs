//! Operator-facing surfaces: the review queue (resolve/list/SLA), rollback,
//! and the stuck-work-item sweep. These exercise `Engine` methods that the
//! scripted agent roster's escalation paths can't reach deterministically (the
//! mock roster never returns an error), so fixtures here build the relevant
//! `WorkItem`/`PendingReview` state directly via `GraphStore`, the way an
//! operator tool or a recovering process would encounter it.

mod support;

use e2e_support::harness::{similarity_vector, unit_reference_vector, TestHarness, TEST_DIM};
use e2e_support::mocks::{mention_input, RosterBuilder, ScriptedEmbeddingProvider};
use problemgraph_core::storage::GraphStore;
use problemgraph_core::{
    MentionInput, PendingReview, ProblemMention, ResolutionDecision, SuggestedConcept, WorkItem,
    WorkflowState,
};

fn pending_review_for(work_item: &WorkItem, mention_id: &str, concept_id: &str, now: chrono::DateTime<chrono::Utc>) -> PendingReview {
    PendingReview {
        id: uuid::Uuid::new_v4().to_string(),
        work_item_id: work_item.id.clone(),
        mention_id: mention_id.to_string(),
        suggested_concepts: vec![SuggestedConcept {
            concept_id: concept_id.to_string(),
            score: 0.6,
            reasoning: "low confidence auto-match".to_string(),
        }],
        agent_artefacts: serde_json::Value::Null,
        escalation_reason: "manufactured for operator-path test".to_string(),
        domain: "NLP".to_string(),
        match_confidence: 0.6,
        candidate_mention_count: 0,
        priority: 5,
        sla_deadline: now + chrono::Duration::hours(168),
        assigned_to: None,
        assigned_at: None,
        resolution: None,
        resolved_by: None,
        resolved_at: None,
        created_at: now,
    }
}

/// Build a work item parked in `PENDING_REVIEW`, with its mention, directly
/// through the store - the shape an escalated-to-human-review item has,
/// without depending on the mock roster being able to produce an escalation.
fn seeded_pending_review(harness: &TestHarness, statement: &str, paper_id: &str, concept_id: &str, now: chrono::DateTime<chrono::Utc>) -> (WorkItem, ProblemMention, PendingReview) {
    let mention = ProblemMention::new(
        uuid::Uuid::new_v4().to_string(),
        MentionInput { statement: statement.to_string(), paper_id: paper_id.to_string(), domain: "NLP".to_string(), ..Default::default() },
        now,
    );
    harness.store.create_paper(paper_id, None).unwrap();
    harness.store.create_mention(&mention).unwrap();

    let mut work_item = WorkItem::new(uuid::Uuid::new_v4().to_string(), format!("{now}-seeded"), mention.id.clone(), 5, 3);
    work_item.transition(WorkflowState::Matching, "seed", serde_json::Value::Null, None, now).unwrap();
    work_item.transition(WorkflowState::LowConfidence, "seed", serde_json::Value::Null, None, now).unwrap();
    work_item.transition(WorkflowState::PendingReview, "seed", serde_json::Value::Null, None, now).unwrap();
    harness.store.create_work_item(&work_item).unwrap();

    let review = pending_review_for(&work_item, &mention.id, concept_id, now);
    harness.store.save_pending_review(&review).unwrap();
    (work_item, mention, review)
}

/// L3: resolving an already-resolved review is idempotent - the second call
/// leaves the original resolution and resolver untouched, and must not
/// re-apply the link side effect (no double-incremented mention_count).
#[tokio::test]
async fn resolve_is_idempotent_at_the_engine_level() {
    let embeddings = ScriptedEmbeddingProvider::new(TEST_DIM).pin("seed concept", unit_reference_vector(TEST_DIM));
    let roster = RosterBuilder::new().build();
    let harness = TestHarness::with_defaults(Box::new(embeddings), Box::new(roster));

    harness
        .engine
        .submit_mention(mention_input("seed concept", "paper-0", "NLP"), support::at(0))
        .await
        .unwrap();
    let concept = harness.only_concept();

    let (_, mention, review) = seeded_pending_review(&harness, "escalated statement", "paper-1", &concept.id, support::at(1));

    let first = harness.engine.resolve(&review.id, "reviewer-1", ResolutionDecision::Linked, support::at(2)).await.unwrap();
    assert_eq!(first.resolution, Some(ResolutionDecision::Linked));
    assert_eq!(first.resolved_by.as_deref(), Some("reviewer-1"));

    let concept_after_first = harness.store.get_concept(&concept.id).unwrap().unwrap();
    assert_eq!(concept_after_first.mention_count, 2);
    let mention_after_first = harness.store.get_mention(&mention.id).unwrap().unwrap();
    assert!(mention_after_first.is_linked());

    let second = harness.engine.resolve(&review.id, "reviewer-2", ResolutionDecision::Blacklisted, support::at(3)).await.unwrap();
    assert_eq!(second.resolution, Some(ResolutionDecision::Linked), "repeat resolve must not overwrite the original decision");
    assert_eq!(second.resolved_by.as_deref(), Some("reviewer-1"));

    let concept_after_second = harness.store.get_concept(&concept.id).unwrap().unwrap();
    assert_eq!(concept_after_second.mention_count, 2, "idempotent resolve must not re-apply the link side effect");
}

/// `Engine::resolve` with `CreatedNew` routes the mention into a brand new
/// concept rather than linking it to the suggested one.
#[tokio::test]
async fn resolve_created_new_mints_a_fresh_concept() {
    let embeddings = ScriptedEmbeddingProvider::new(TEST_DIM)
        .pin("seed concept", unit_reference_vector(TEST_DIM))
        .pin("escalated, actually distinct", similarity_vector(TEST_DIM, 0.6));
    let roster = RosterBuilder::new().build();
    let harness = TestHarness::with_defaults(Box::new(embeddings), Box::new(roster));

    harness
        .engine
        .submit_mention(mention_input("seed concept", "paper-0", "NLP"), support::at(0))
        .await
        .unwrap();
    let concept = harness.only_concept();

    let (_, mention, review) = seeded_pending_review(&harness, "escalated, actually distinct", "paper-1", &concept.id, support::at(1));

    harness.engine.resolve(&review.id, "reviewer-1", ResolutionDecision::CreatedNew, support::at(2)).await.unwrap();

    let mention_after = harness.store.get_mention(&mention.id).unwrap().unwrap();
    assert_eq!(mention_after.workflow_state, WorkflowState::CreateNewConcept);
    assert_ne!(mention_after.concept_id.as_deref(), Some(concept.id.as_str()));
    assert_eq!(harness.store.list_concepts().unwrap().len(), 2);
}

/// `Engine::resolve` with `Blacklisted` records a pair-scoped interdiction
/// and still routes the mention to a new concept (it must not stay orphaned).
#[tokio::test]
async fn resolve_blacklisted_records_interdiction_and_creates_new_concept() {
    let embeddings = ScriptedEmbeddingProvider::new(TEST_DIM)
        .pin("seed concept", unit_reference_vector(TEST_DIM))
        .pin("rejected match", similarity_vector(TEST_DIM, 0.6));
    let roster = RosterBuilder::new().build();
    let harness = TestHarness::with_defaults(Box::new(embeddings), Box::new(roster));

    harness
        .engine
        .submit_mention(mention_input("seed concept", "paper-0", "NLP"), support::at(0))
        .await
        .unwrap();
    let concept = harness.only_concept();

    let (_, mention, review) = seeded_pending_review(&harness, "rejected match", "paper-1", &concept.id, support::at(1));

    harness.engine.resolve(&review.id, "reviewer-1", ResolutionDecision::Blacklisted, support::at(2)).await.unwrap();

    assert!(harness.store.is_blacklisted(&mention.id, &concept.id).unwrap());
    let mention_after = harness.store.get_mention(&mention.id).unwrap().unwrap();
    assert_eq!(mention_after.workflow_state, WorkflowState::CreateNewConcept);
}

/// B3 at the engine level: a breached review's priority drops by exactly
/// three, clamped to 1, and is not re-escalated on a subsequent sweep that
/// doesn't cross the renewed deadline.
#[tokio::test]
async fn enforce_review_sla_escalates_once_per_breach() {
    let embeddings = ScriptedEmbeddingProvider::new(TEST_DIM).pin("seed concept", unit_reference_vector(TEST_DIM));
    let roster = RosterBuilder::new().build();
    let harness = TestHarness::with_defaults(Box::new(embeddings), Box::new(roster));

    harness
        .engine
        .submit_mention(mention_input("seed concept", "paper-0", "NLP"), support::at(0))
        .await
        .unwrap();
    let concept = harness.only_concept();

    let (_, _, review) = seeded_pending_review(&harness, "escalated statement", "paper-1", &concept.id, support::at(1));
    assert_eq!(review.priority, 5);

    let past_deadline = support::at(1) + chrono::Duration::hours(200);
    let escalated = harness.engine.enforce_review_sla(past_deadline).unwrap();
    assert_eq!(escalated.len(), 1);
    assert_eq!(escalated[0].priority, 2);

    let second_sweep = harness.engine.enforce_review_sla(past_deadline).unwrap();
    assert!(second_sweep.is_empty(), "a review not yet past its renewed deadline must not re-escalate");
}

/// `rollback_to_time` restores the work item snapshot from the latest
/// checkpoint at or before the given instant; `rollback_to_start` restores
/// the very first one. Both persist the restored snapshot back to the store.
#[tokio::test]
async fn rollback_restores_earlier_work_item_snapshots() {
    let embeddings = ScriptedEmbeddingProvider::new(TEST_DIM).pin("seed concept", unit_reference_vector(TEST_DIM));
    let roster = RosterBuilder::new().build();
    let harness = TestHarness::with_defaults(Box::new(embeddings), Box::new(roster));

    let trace_id = harness
        .engine
        .submit_mention(mention_input("seed concept", "paper-0", "NLP"), support::at(0))
        .await
        .unwrap();

    let checkpoints = harness.store.list_checkpoints_for_trace(&trace_id).unwrap();
    assert!(checkpoints.len() >= 2, "a full submission records at least an extracted and a matching checkpoint");

    let restored_to_start = harness.engine.rollback_to_start(&trace_id).unwrap();
    assert_eq!(restored_to_start.current_state, WorkflowState::Extracted);
    assert!(restored_to_start.history.is_empty());

    let midpoint = checkpoints.iter().map(|c| c.created_at).max().unwrap();
    let restored_to_time = harness.engine.rollback_to_time(&trace_id, midpoint).unwrap();
    assert!(restored_to_time.current_state == WorkflowState::Matching || restored_to_time.current_state == WorkflowState::Extracted);
}

/// I2/L4: rolling back a trace that already auto-linked its mention must
/// undo that link (edge removed, linking concept's aggregates recomputed)
/// rather than leaving the store with a `MATCHING`-state work item pointing
/// at a mention that is still `INSTANCE_OF` a concept. Reprocessing the
/// rolled-back item to a different concept must not leave the original
/// concept's `mention_count` permanently inflated by the undone link.
#[tokio::test]
async fn rollback_undoes_an_auto_link_and_reprocessing_does_not_inflate_the_old_concept() {
    let embeddings = ScriptedEmbeddingProvider::new(TEST_DIM)
        .pin("seed concept", unit_reference_vector(TEST_DIM))
        .pin("will be rolled back", unit_reference_vector(TEST_DIM));
    let roster = RosterBuilder::new().build();
    let harness = TestHarness::with_defaults(Box::new(embeddings), Box::new(roster));

    harness
        .engine
        .submit_mention(mention_input("seed concept", "paper-0", "NLP"), support::at(0))
        .await
        .unwrap();
    let concept_a = harness.only_concept();
    assert_eq!(concept_a.mention_count, 1);

    let trace_id = harness
        .engine
        .submit_mention(mention_input("will be rolled back", "paper-1", "NLP"), support::at(1))
        .await
        .unwrap();

    let linked_concept_a = harness.store.get_concept(&concept_a.id).unwrap().unwrap();
    assert_eq!(linked_concept_a.mention_count, 2, "the second mention auto-linked to concept A");
    let mention = harness.find_mention(&concept_a.id, "will be rolled back");
    assert!(mention.is_linked());

    let checkpoints = harness.store.list_checkpoints_for_trace(&trace_id).unwrap();
    let midpoint = checkpoints.iter().map(|c| c.created_at).max().unwrap();
    let restored = harness.engine.rollback_to_time(&trace_id, midpoint).unwrap();
    assert_eq!(restored.current_state, WorkflowState::Matching);

    // I2: the rollback must have undone the link, not just the work item.
    let mention_after_rollback = harness.store.get_mention(&mention.id).unwrap().unwrap();
    assert!(mention_after_rollback.concept_id.is_none(), "rollback must clear the undone link");
    assert!(mention_after_rollback.match_confidence.is_none());
    assert_eq!(mention_after_rollback.workflow_state, WorkflowState::Matching);
    let concept_a_after_rollback = harness.store.get_concept(&concept_a.id).unwrap().unwrap();
    assert_eq!(concept_a_after_rollback.mention_count, 1, "concept A's aggregates must be reconciled back down");

    // Block reprocessing from simply re-making the same link, so the matcher
    // is forced to route the mention to a brand new concept instead.
    harness.engine.blacklist(&mention.id, &concept_a.id, "forced for the rollback test".to_string(), None, support::at(2)).unwrap();

    let reprocessed = harness
        .engine
        .reprocess(
            problemgraph_core::ReprocessFilter { state: Some(WorkflowState::Matching), older_than: Some(support::at(3)) },
            support::at(3),
        )
        .await
        .unwrap();
    assert_eq!(reprocessed.len(), 1);

    let mention_after_reprocess = harness.store.get_mention(&mention.id).unwrap().unwrap();
    assert_ne!(
        mention_after_reprocess.concept_id.as_deref(),
        Some(concept_a.id.as_str()),
        "blacklisted pair must route the mention to a different concept"
    );
    assert_eq!(harness.store.list_concepts().unwrap().len(), 2, "reprocessing created a fresh concept");

    let concept_a_final = harness.store.get_concept(&concept_a.id).unwrap().unwrap();
    assert_eq!(concept_a_final.mention_count, 1, "concept A must not be permanently inflated by the undone, reprocessed link");
}

/// A work item parked non-terminally past `stuck_timeout_minutes` with no
/// retry budget left is forced into `PENDING_REVIEW` and a review is
/// enqueued for it; one with budget remaining only has its retry counter
/// bumped and stays in place.
#[tokio::test]
async fn reap_stuck_work_items_forces_exhausted_items_into_review() {
    let embeddings = ScriptedEmbeddingProvider::new(TEST_DIM).pin("seed concept", unit_reference_vector(TEST_DIM));
    let roster = RosterBuilder::new().build();
    let harness = TestHarness::with_defaults(Box::new(embeddings), Box::new(roster));

    let real_now = chrono::Utc::now();

    let exhausted_mention = ProblemMention::new(
        uuid::Uuid::new_v4().to_string(),
        MentionInput { statement: "stuck, exhausted".to_string(), paper_id: "paper-a".to_string(), domain: "NLP".to_string(), ..Default::default() },
        real_now,
    );
    harness.store.create_paper("paper-a", None).unwrap();
    harness.store.create_mention(&exhausted_mention).unwrap();
    let mut exhausted_item = WorkItem::new(uuid::Uuid::new_v4().to_string(), "trace-exhausted".to_string(), exhausted_mention.id.clone(), 5, 3);
    exhausted_item.transition(WorkflowState::Matching, "seed", serde_json::Value::Null, None, real_now).unwrap();
    exhausted_item.retry_count = 3;
    harness.store.create_work_item(&exhausted_item).unwrap();

    let retriable_mention = ProblemMention::new(
        uuid::Uuid::new_v4().to_string(),
        MentionInput { statement: "stuck, retriable".to_string(), paper_id: "paper-b".to_string(), domain: "NLP".to_string(), ..Default::default() },
        real_now,
    );
    harness.store.create_paper("paper-b", None).unwrap();
    harness.store.create_mention(&retriable_mention).unwrap();
    let mut retriable_item = WorkItem::new(uuid::Uuid::new_v4().to_string(), "trace-retriable".to_string(), retriable_mention.id.clone(), 5, 3);
    retriable_item.transition(WorkflowState::Matching, "seed", serde_json::Value::Null, None, real_now).unwrap();
    harness.store.create_work_item(&retriable_item).unwrap();

    let sweep_now = real_now + chrono::Duration::hours(2);
    let reaped = harness.engine.reap_stuck_work_items(sweep_now).unwrap();
    assert_eq!(reaped.len(), 2);

    let exhausted_after = harness.store.get_work_item(&exhausted_item.id).unwrap().unwrap();
    assert_eq!(exhausted_after.current_state, WorkflowState::PendingReview);
    assert_eq!(
        harness.store.list_pending_reviews().unwrap().into_iter().filter(|r| r.work_item_id == exhausted_item.id).count(),
        1
    );

    let retriable_after = harness.store.get_work_item(&retriable_item.id).unwrap().unwrap();
    assert_eq!(retriable_after.current_state, WorkflowState::Matching);
    assert_eq!(retriable_after.retry_count, 1);
}

/// Admin cancellation: a non-terminal work item can be cancelled at any
/// time, leaving the mention unlinked; a terminal one cannot.
#[tokio::test]
async fn cancel_work_item_admin_override() {
    let embeddings = ScriptedEmbeddingProvider::new(TEST_DIM).pin("seed concept", unit_reference_vector(TEST_DIM));
    let roster = RosterBuilder::new().build();
    let harness = TestHarness::with_defaults(Box::new(embeddings), Box::new(roster));
    let now = chrono::Utc::now();

    let mention = ProblemMention::new(
        uuid::Uuid::new_v4().to_string(),
        MentionInput { statement: "cancel me".to_string(), paper_id: "paper-a".to_string(), domain: "NLP".to_string(), ..Default::default() },
        now,
    );
    harness.store.create_paper("paper-a", None).unwrap();
    harness.store.create_mention(&mention).unwrap();
    let mut item = WorkItem::new(uuid::Uuid::new_v4().to_string(), "trace-cancel".to_string(), mention.id.clone(), 5, 3);
    item.transition(WorkflowState::Matching, "seed", serde_json::Value::Null, None, now).unwrap();
    harness.store.create_work_item(&item).unwrap();

    let cancelled = harness
        .engine
        .cancel_work_item(&item.id, "admin request".to_string(), Some("operator-1".to_string()), now)
        .unwrap();
    assert_eq!(cancelled.current_state, WorkflowState::Cancelled);
    let mention_after = harness.store.get_mention(&mention.id).unwrap().unwrap();
    assert!(mention_after.concept_id.is_none(), "cancellation must not link the mention");

    let err = harness
        .engine
        .cancel_work_item(&item.id, "second attempt".to_string(), None, now)
        .unwrap_err();
    assert!(matches!(err, problemgraph_core::EngineError::IllegalTransition { .. }));
}
