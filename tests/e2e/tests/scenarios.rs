//! The seed end-to-end scenarios (S1-S7): a single canonical concept's
//! lifecycle from first mention through auto-link, evaluator approval,
//! consensus, refinement, a human-edited override, and blacklist filtering.
//!
//! Each scenario builds directly on the graph state left by the ones before
//! it, exactly as narrated - one engine, one concept, one continuous
//! submission sequence.

mod support;

use e2e_support::harness::{similarity_vector, unit_reference_vector, TestHarness, TEST_DIM};
use e2e_support::mocks::{mention_input, stub_debater_output, RosterBuilder, ScriptedEmbeddingProvider};
use problemgraph_core::storage::GraphStore;
use problemgraph_core::workflow::{ArbiterDecision, ArbiterOutput, EvaluatorDecision, EvaluatorOutput, SynthesizerOutput};
use problemgraph_core::WorkflowState;

#[tokio::test]
async fn scenario_s1_through_s7_full_lifecycle() {
    const M1: &str = "Large language models suffer from hallucination";
    const M2: &str = "LLMs produce hallucinated outputs";
    const M3: &str = "Generative models fabricate unsupported claims";
    const M4: &str = "Neural text generators sometimes invent facts";
    const M5: &str = "Autoregressive LMs hallucinate under distribution shift";
    const M5B: &str = "Transformer LMs hallucinate on long-tail queries";
    const M6: &str = "Chat models confabulate plausible-sounding answers";
    const M7: &str = "Seq2seq summarizers hallucinate unsupported entities";
    const M8: &str = "Dialogue agents hallucinate factual details";
    const M7_PRIME: &str = "Seq2seq summarizers hallucinate unsupported entities, revisited";

    let refined_statement = "LLMs and related generative models hallucinate unsupported content across tasks.";

    let embeddings = ScriptedEmbeddingProvider::new(TEST_DIM)
        .pin(M1, unit_reference_vector(TEST_DIM)) // C1's own canonical embedding, post-creation.
        .pin(M2, similarity_vector(TEST_DIM, 0.96)) // HIGH
        .pin(M3, similarity_vector(TEST_DIM, 0.87)) // MEDIUM
        .pin(M4, similarity_vector(TEST_DIM, 0.65)) // LOW
        .pin(M5, similarity_vector(TEST_DIM, 0.97)) // HIGH, reaches count 5
        .pin(M5B, similarity_vector(TEST_DIM, 0.97)) // HIGH, reaches count 6
        .pin(M6, similarity_vector(TEST_DIM, 0.97)) // HIGH, reaches count 10 under human_edited
        .pin(M7, similarity_vector(TEST_DIM, 0.96)) // HIGH, later blacklisted against C1
        .pin(M8, similarity_vector(TEST_DIM, 0.96)) // HIGH, pair not blacklisted
        .pin(M7_PRIME, similarity_vector(TEST_DIM, 0.96)) // same statement family as M7
        .pin(refined_statement, unit_reference_vector(TEST_DIM));

    let roster = RosterBuilder::new()
        // S3: MEDIUM -> evaluator APPROVE.
        .evaluator(EvaluatorOutput {
            decision: EvaluatorDecision::Approve,
            confidence: 0.88,
            reasoning: "shares terminology and framing with the candidate".to_string(),
            key_factors: vec!["hallucination".to_string()],
        })
        // S4: LOW -> three consensus rounds, RETRY/RETRY/LINK per the spec's
        // literal confidence sequence.
        .maker(stub_debater_output(0.6))
        .hater(stub_debater_output(0.5))
        .arbiter(ArbiterOutput {
            decision: ArbiterDecision::Retry,
            confidence: 0.55,
            reasoning: "insufficient overlap, round 1".to_string(),
            maker_weight: 0.5,
            hater_weight: 0.5,
            decisive_factor: "terminology".to_string(),
        })
        .maker(stub_debater_output(0.65))
        .hater(stub_debater_output(0.55))
        .arbiter(ArbiterOutput {
            decision: ArbiterDecision::Retry,
            confidence: 0.62,
            reasoning: "still inconclusive, round 2".to_string(),
            maker_weight: 0.55,
            hater_weight: 0.45,
            decisive_factor: "terminology".to_string(),
        })
        .maker(stub_debater_output(0.6))
        .hater(stub_debater_output(0.5))
        .arbiter(ArbiterOutput {
            decision: ArbiterDecision::Link,
            confidence: 0.58,
            reasoning: "final round conservative default".to_string(),
            maker_weight: 0.5,
            hater_weight: 0.5,
            decisive_factor: "final round default".to_string(),
        })
        // S5: refinement triggered exactly once, at count 5.
        .synthesizer(SynthesizerOutput {
            canonical_statement: refined_statement.to_string(),
            conflict_markers: vec![],
        })
        .build();

    let harness = TestHarness::with_defaults(Box::new(embeddings), Box::new(roster));

    // --- S1 ---
    let trace_1 = harness
        .engine
        .submit_mention(mention_input(M1, "paper-1", "NLP"), support::at(0))
        .await
        .expect("submit M1");
    assert!(!trace_1.is_empty());

    let c1 = harness.only_concept();
    assert_eq!(c1.canonical_statement, M1);
    assert_eq!(c1.mention_count, 1);
    assert_eq!(c1.paper_count, 1);
    assert_eq!(c1.version, 1);

    let m1 = harness.find_mention(&c1.id, M1);
    assert_eq!(m1.workflow_state, WorkflowState::CreateNewConcept);
    assert_eq!(m1.concept_id.as_deref(), Some(c1.id.as_str()));

    // --- S2: HIGH band (0.96), auto-links, no review entry ---
    harness
        .engine
        .submit_mention(mention_input(M2, "paper-2", "NLP"), support::at(1))
        .await
        .expect("submit M2");

    let c1 = harness.store.get_concept(&c1.id).unwrap().unwrap();
    assert_eq!(c1.mention_count, 2);
    assert_eq!(c1.paper_count, 2);
    let m2 = harness.find_mention(&c1.id, M2);
    assert!(m2.is_linked());
    assert_eq!(
        harness.store.list_pending_reviews().unwrap().len(),
        0,
        "HIGH-band auto-link must not create a review"
    );

    // --- S3: MEDIUM band (0.87), evaluator APPROVE ---
    harness
        .engine
        .submit_mention(mention_input(M3, "paper-3", "NLP"), support::at(2))
        .await
        .expect("submit M3");

    let c1 = harness.store.get_concept(&c1.id).unwrap().unwrap();
    assert_eq!(c1.mention_count, 3);
    let m3 = harness.find_mention(&c1.id, M3);
    assert!(m3.is_linked());
    assert_eq!(m3.match_confidence, Some(problemgraph_core::ConfidenceBand::Medium));
    assert_eq!(
        harness.store.list_pending_reviews().unwrap().len(),
        0,
        "evaluator approval must not create a review"
    );

    // --- S4: LOW band (0.65), three consensus rounds, final-round LINK ---
    harness
        .engine
        .submit_mention(mention_input(M4, "paper-4", "NLP"), support::at(3))
        .await
        .expect("submit M4");

    let c1 = harness.store.get_concept(&c1.id).unwrap().unwrap();
    assert_eq!(c1.mention_count, 4);
    let m4 = harness.find_mention(&c1.id, M4);
    assert!(m4.is_linked());
    assert_eq!(m4.match_confidence, Some(problemgraph_core::ConfidenceBand::Low));
    assert_eq!(m4.match_score, Some(0.58));

    // --- S5: reach count 5, refinement triggers exactly once ---
    harness
        .engine
        .submit_mention(mention_input(M5, "paper-5", "NLP"), support::at(4))
        .await
        .expect("submit M5");

    let c1_refined = harness.store.get_concept(&c1.id).unwrap().unwrap();
    assert_eq!(c1_refined.mention_count, 5);
    assert_eq!(c1_refined.version, 2, "refinement must bump the version exactly once");
    assert_eq!(c1_refined.last_refined_at_count, 5);
    assert_eq!(c1_refined.canonical_statement, refined_statement);

    // Reaching count 6 must NOT re-refine (no second synthesizer output was
    // scripted - a re-refine attempt would panic the roster on an empty queue).
    harness
        .engine
        .submit_mention(mention_input(M5B, "paper-5b", "NLP"), support::at(5))
        .await
        .expect("submit M5b");
    let c1_after_six = harness.store.get_concept(&c1.id).unwrap().unwrap();
    assert_eq!(c1_after_six.mention_count, 6);
    assert_eq!(c1_after_six.version, 2, "no refinement should occur at count 6");
    assert_eq!(c1_after_six.last_refined_at_count, 5);

    // --- S6: human_edited, count reaches 10, no automated refinement ---
    // Set human_edited and fast-forward the count to 9 directly (the
    // counting path itself is already exercised by S1-S5); M6's real
    // HIGH-band submission then drives the count to 10 through the ordinary
    // auto-link path, which is what actually invokes `maybe_refine`.
    let mut c1_edited = c1_after_six.clone();
    c1_edited.human_edited = true;
    c1_edited.mention_count = 9;
    let version_before_s6 = c1_edited.version;
    harness.store.save_concept(&c1_edited).unwrap();

    harness
        .engine
        .submit_mention(mention_input(M6, "paper-6", "NLP"), support::at(6))
        .await
        .expect("submit M6");

    let c1_post_guard = harness.store.get_concept(&c1.id).unwrap().unwrap();
    assert_eq!(c1_post_guard.mention_count, 10);
    assert_eq!(c1_post_guard.version, version_before_s6, "human_edited concept must not be refined");
    assert_eq!(c1_post_guard.canonical_statement, c1_edited.canonical_statement);
    let m6 = harness.find_mention(&c1.id, M6);
    assert!(m6.is_linked());

    // --- S7: pair-scoped blacklist plus a pattern-scoped supplement ---
    // Submit M7 and let it auto-link normally first (clear human_edited so
    // matching proceeds through the ordinary HIGH path against C1).
    let mut c1_clear = harness.store.get_concept(&c1.id).unwrap().unwrap();
    c1_clear.human_edited = false;
    harness.store.save_concept(&c1_clear).unwrap();

    harness
        .engine
        .submit_mention(mention_input(M7, "paper-7", "NLP"), support::at(200))
        .await
        .expect("submit M7");
    let m7 = harness.find_mention(&c1.id, M7);
    assert!(m7.is_linked());

    harness
        .engine
        .blacklist(&m7.id, &c1.id, "different scope".to_string(), Some("reviewer-1".to_string()), support::at(201))
        .expect("blacklist (M7, C1)");

    // M8: a distinct mention with the same similarity, whose pair is NOT
    // blacklisted - still auto-links to C1.
    harness
        .engine
        .submit_mention(mention_input(M8, "paper-8", "NLP"), support::at(202))
        .await
        .expect("submit M8");
    let m8 = harness.find_mention(&c1.id, M8);
    assert!(m8.is_linked(), "M8's pair is not blacklisted, so it must still auto-link to C1");

    // Re-submitting M7 itself still finds C1 filtered (pair-scoped entry
    // applies to its own mention id).
    let ctx = StoreCtx { store: &harness.store };
    let matcher_cfg = problemgraph_core::config::EngineConfig::default();
    let index = problemgraph_core::vector_index::VectorIndex::new(
        problemgraph_core::vector_index::VectorIndexConfig::for_dimensions(TEST_DIM),
    )
    .unwrap();
    for concept in harness.store.list_concepts().unwrap() {
        index.upsert(&concept.id, &concept.embedding).unwrap();
    }
    let matcher = problemgraph_core::matcher::ConceptMatcher::new(
        &index,
        matcher_cfg.thresholds,
        matcher_cfg.citation_boost,
    );
    let m7_embedding = m7.embedding.clone().unwrap();
    let candidates_for_m7 = matcher
        .find_candidates(&m7.id, &m7_embedding, &m7.paper_id, &m7.domain, 10, &ctx)
        .unwrap();
    assert!(
        candidates_for_m7.iter().all(|c| c.concept_id != c1.id),
        "C1 must be filtered from M7's own candidates after the pair blacklist"
    );

    // A brand-new mention built from the same statement family as M7 is
    // covered by a pattern-scoped interdiction recorded alongside the pair
    // entry (see DESIGN.md: a pair-scoped key can never cover a fresh
    // mention id, so S7's "M7' creates a new concept" outcome requires a
    // content-pattern entry too).
    harness
        .store
        .record_blacklist_entry(&problemgraph_core::BlacklistEntry {
            id: uuid::Uuid::new_v4().to_string(),
            mention_id: None,
            concept_id: None,
            pattern: Some("seq2seq summarizers hallucinate unsupported entities".to_string()),
            reason: "content pattern matching the M7 family".to_string(),
            never_allow: true,
            recorded_by: Some("reviewer-1".to_string()),
            created_at: support::at(203),
        })
        .unwrap();

    harness
        .engine
        .submit_mention(mention_input(M7_PRIME, "paper-7-prime", "NLP"), support::at(204))
        .await
        .expect("submit M7'");
    let concepts_after_m7_prime = harness.store.list_concepts().unwrap();
    assert_eq!(concepts_after_m7_prime.len(), 2, "M7' must mint a new concept, not link to C1");
    let m7_prime = concepts_after_m7_prime
        .iter()
        .find(|c| c.id != c1.id)
        .expect("a second concept exists for M7'");
    let m7_prime_mention = harness.find_mention(&m7_prime.id, M7_PRIME);
    assert_eq!(m7_prime_mention.workflow_state, WorkflowState::CreateNewConcept);
}

struct StoreCtx<'a> {
    store: &'a problemgraph_core::storage::SqliteGraphStore,
}

impl<'a> problemgraph_core::matcher::MatchContext for StoreCtx<'a> {
    fn cited_paper_ids(&self, paper_id: &str) -> Result<Vec<String>, problemgraph_core::EngineError> {
        self.store.cited_paper_ids(paper_id)
    }
    fn papers_with_mentions_of(&self, concept_id: &str) -> Result<Vec<String>, problemgraph_core::EngineError> {
        self.store.papers_with_mentions_of(concept_id)
    }
    fn concept_domain(&self, concept_id: &str) -> Result<Option<String>, problemgraph_core::EngineError> {
        Ok(self.store.get_concept(concept_id)?.map(|c| c.domain))
    }
    fn concept_mention_count(&self, concept_id: &str) -> Result<i64, problemgraph_core::EngineError> {
        Ok(self.store.get_concept(concept_id)?.map(|c| c.mention_count).unwrap_or(0))
    }
    fn is_blacklisted(&self, mention_id: &str, concept_id: &str) -> Result<bool, problemgraph_core::EngineError> {
        self.store.is_blacklisted(mention_id, concept_id)
    }
}
