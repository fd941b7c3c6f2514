//! `Engine`: the orchestrator wiring matching, auto-linking, the agent
//! debate workflow, the review queue, and concept refinement into the
//! operations callers actually see.
//!
//! Construction rebuilds the in-memory vector index from the graph store's
//! persisted concepts, so the index carries no durable state of its own -
//! restart replays `list_concepts` rather than reading an index snapshot.
//! `ConceptMatcher` and `ReviewQueue` both borrow their dependencies with a
//! lifetime, so `Engine` never stores them as fields; it builds one fresh
//! per call from `&self.store` / `&self.concept_index`.

use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

use crate::autolink::{create_new_concept, link_approved};
use crate::config::EngineConfig;
use crate::embedding::{EmbeddingCache, EmbeddingProvider};
use crate::error::EngineError;
use crate::matcher::{Candidate, ConceptMatcher, MatchContext};
use crate::model::{
    BlacklistEntry, Checkpoint, ConceptStatus, ConfidenceBand, MatchMethod, MentionInput,
    PendingReview, ProblemConcept, ProblemMention, ResolutionDecision, SuggestedConcept, WorkItem,
    WorkflowState,
};
use crate::queue::{ReviewFilter, ReviewQueue};
use crate::refinement::{RefinementLocks, RefinementOutcome, RefinementService};
use crate::storage::GraphStore;
use crate::vector_index::{VectorIndex, VectorIndexConfig};
use crate::workflow::{
    run_consensus_loop, run_evaluator_path, AgentRoster, CheckpointWriter, ConceptSummary,
    OrchestratorConfig, WorkflowOutcome,
};

/// Maximum number of normalised-text -> embedding entries kept in memory.
const EMBEDDING_CACHE_CAPACITY: usize = 50_000;

/// Filter selecting which stuck/errored work items `Engine::reprocess`
/// re-drives. An item qualifies when every `Some` field matches and its
/// retry budget is not exhausted.
#[derive(Debug, Clone, Default)]
pub struct ReprocessFilter {
    /// Only reprocess items currently in this state.
    pub state: Option<WorkflowState>,
    /// Only reprocess items last transitioned before this time.
    pub older_than: Option<DateTime<Utc>>,
}

/// `MatchContext` backed directly by the graph store, so the matcher never
/// depends on the storage engine's concrete type.
struct StoreMatchContext<'a> {
    store: &'a dyn GraphStore,
}

impl MatchContext for StoreMatchContext<'_> {
    fn cited_paper_ids(&self, paper_id: &str) -> Result<Vec<String>, EngineError> {
        self.store.cited_paper_ids(paper_id)
    }

    fn papers_with_mentions_of(&self, concept_id: &str) -> Result<Vec<String>, EngineError> {
        self.store.papers_with_mentions_of(concept_id)
    }

    fn concept_domain(&self, concept_id: &str) -> Result<Option<String>, EngineError> {
        Ok(self.store.get_concept(concept_id)?.map(|c| c.domain))
    }

    fn concept_mention_count(&self, concept_id: &str) -> Result<i64, EngineError> {
        Ok(self.store.get_concept(concept_id)?.map(|c| c.mention_count).unwrap_or(0))
    }

    fn is_blacklisted(&self, mention_id: &str, concept_id: &str) -> Result<bool, EngineError> {
        self.store.is_blacklisted(mention_id, concept_id)
    }
}

/// `CheckpointWriter` over a single, fixed work-item snapshot. The agent
/// workflow never mutates a work item mid-call (`Engine` transitions it
/// between orchestrator calls, not during one), so one snapshot per call
/// suffices.
struct StoreCheckpoints<'a> {
    store: &'a dyn GraphStore,
    work_item: WorkItem,
    now: DateTime<Utc>,
}

impl CheckpointWriter for StoreCheckpoints<'_> {
    fn checkpoint(&self, stage: &str, artefacts: serde_json::Value) -> Result<String, EngineError> {
        let id = uuid::Uuid::new_v4().to_string();
        let mut checkpoint = Checkpoint::before_stage(id.clone(), stage, &self.work_item, self.now);
        checkpoint.stage_output = Some(artefacts);
        self.store.save_checkpoint(&checkpoint)?;
        Ok(id)
    }
}

fn make_trace_id(now: DateTime<Utc>, operation: &str) -> String {
    let short_id = &uuid::Uuid::new_v4().simple().to_string()[..8];
    format!("{}-{short_id}-{operation}", now.to_rfc3339())
}

/// The engine: owns the graph store, the in-memory concept vector index, the
/// embedding cache, and the pluggable agent roster.
pub struct Engine {
    store: Box<dyn GraphStore>,
    concept_index: VectorIndex,
    embeddings: EmbeddingCache,
    roster: Box<dyn AgentRoster>,
    config: EngineConfig,
    /// Held for the engine's whole lifetime so the advisory per-concept
    /// refinement lock actually guards concurrent `maybe_refine` calls rather
    /// than resetting on every invocation.
    refinement_locks: RefinementLocks,
}

impl Engine {
    /// Build an engine over `store`, rebuilding the vector index from every
    /// non-deprecated concept currently persisted.
    pub fn new(
        store: Box<dyn GraphStore>,
        embedding_provider: Box<dyn EmbeddingProvider>,
        roster: Box<dyn AgentRoster>,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        let concept_index = VectorIndex::new(VectorIndexConfig::for_dimensions(config.embedding.dim))?;
        for concept in store.list_concepts()? {
            if concept.status != ConceptStatus::Deprecated {
                concept_index.upsert(&concept.id, &concept.embedding)?;
            }
        }
        let embeddings = EmbeddingCache::new(embedding_provider, EMBEDDING_CACHE_CAPACITY);
        Ok(Self {
            store,
            concept_index,
            embeddings,
            roster,
            config,
            refinement_locks: RefinementLocks::new(),
        })
    }

    fn matcher(&self) -> ConceptMatcher<'_> {
        ConceptMatcher::new(&self.concept_index, self.config.thresholds, self.config.citation_boost)
    }

    fn review_queue(&self) -> Result<ReviewQueue<'_>, EngineError> {
        ReviewQueue::new(
            self.store.as_ref(),
            self.config.priority.clone(),
            self.config.sla_hours,
            self.config.review_lease_minutes,
        )
    }

    fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            max_consensus_rounds: self.config.max_consensus_rounds,
            arbiter_confidence_threshold: self.config.arbiter_confidence_threshold,
            role_timeout_secs: self.config.role_timeout_secs,
        }
    }

    fn concept_summary(&self, concept_id: &str) -> Result<ConceptSummary, EngineError> {
        let concept = self
            .store
            .get_concept(concept_id)?
            .ok_or_else(|| EngineError::NotFound(format!("concept {concept_id}")))?;
        Ok(ConceptSummary {
            concept_id: concept.id,
            canonical_statement: concept.canonical_statement,
            domain: concept.domain,
            mention_count: concept.mention_count,
        })
    }

    fn record_checkpoint(
        &self,
        work_item: &mut WorkItem,
        stage: &str,
        output: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let id = uuid::Uuid::new_v4().to_string();
        let mut checkpoint = Checkpoint::before_stage(id.clone(), stage, work_item, now);
        checkpoint.stage_output = output;
        self.store.save_checkpoint(&checkpoint)?;
        work_item.checkpoint_ids.push(id);
        Ok(())
    }

    /// A mention's statement is rejected up front when it matches an active
    /// (`never_allow = true`) content pattern, independent of whatever the
    /// matcher would otherwise surface. Matching is plain case-insensitive
    /// substring containment - `BlacklistEntry::pattern` is free text, not a
    /// regex dialect the spec pins down.
    fn statement_matches_blacklist_pattern(&self, statement: &str) -> Result<bool, EngineError> {
        let lowered = statement.to_lowercase();
        Ok(self
            .store
            .list_blacklist_patterns()?
            .iter()
            .filter_map(|entry| entry.pattern.as_deref())
            .any(|pattern| !pattern.is_empty() && lowered.contains(&pattern.to_lowercase())))
    }

    fn enqueue_for_review(
        &self,
        work_item: &WorkItem,
        mention: &ProblemMention,
        candidates: &[Candidate],
        reason: String,
        artefacts: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<PendingReview, EngineError> {
        let suggested: Vec<SuggestedConcept> = candidates
            .iter()
            .map(|c| SuggestedConcept {
                concept_id: c.concept_id.clone(),
                score: c.boosted_score,
                reasoning: c.reasoning_tag.clone(),
            })
            .collect();
        let top_score = candidates.first().map(|c| c.boosted_score).unwrap_or(0.0);
        let top_mention_count = match candidates.first() {
            Some(c) => self.store.get_concept(&c.concept_id)?.map(|concept| concept.mention_count).unwrap_or(0),
            None => 0,
        };
        self.review_queue()?.enqueue(
            work_item,
            &mention.id,
            suggested,
            reason,
            artefacts,
            top_score,
            top_mention_count,
            &mention.domain,
            now,
        )
    }

    async fn maybe_refine(&self, concept_id: &str, now: DateTime<Utc>) {
        let service = RefinementService::new(
            self.store.as_ref(),
            &self.embeddings,
            self.roster.as_ref(),
            &self.refinement_locks,
            self.config.refinement_thresholds.clone(),
            self.config.retry,
        );
        match service.refine(concept_id, now).await {
            Ok(RefinementOutcome::Refined(concept)) => {
                if let Err(e) = self.concept_index.upsert(&concept.id, &concept.embedding) {
                    warn!(concept_id, error = %e, "failed to refresh vector index after refinement");
                }
            }
            Ok(RefinementOutcome::Skipped(_)) => {}
            Err(e) => warn!(concept_id, error = %e, "concept refinement attempt failed"),
        }
    }

    /// Submit a freshly extracted mention. Runs the full pipeline - embed,
    /// blacklist-pattern check, match, classify, route - synchronously up to
    /// whatever band is reached, returning the work item's trace id.
    #[instrument(skip(self, input), fields(paper_id = %input.paper_id))]
    pub async fn submit_mention(&self, input: MentionInput, now: DateTime<Utc>) -> Result<String, EngineError> {
        if input.statement.trim().is_empty() {
            return Err(EngineError::Validation("mention statement must not be empty".to_string()));
        }

        let trace_id = make_trace_id(now, "submit_mention");
        let mut mention = ProblemMention::new(uuid::Uuid::new_v4().to_string(), input, now);
        self.store.create_paper(&mention.paper_id, None)?;
        self.store.create_mention(&mention)?;

        let mut work_item = WorkItem::new(
            uuid::Uuid::new_v4().to_string(),
            trace_id.clone(),
            mention.id.clone(),
            5,
            self.config.work_item_max_retries,
        );
        self.record_checkpoint(&mut work_item, "extracted", None, now)?;
        self.store.create_work_item(&work_item)?;

        let embedding = match self.embeddings.embed(&mention.statement) {
            Ok(v) => v,
            Err(e) => {
                work_item.last_error = Some(e.to_string());
                self.store.save_work_item(&work_item)?;
                return Err(EngineError::Embedding(e));
            }
        };
        mention.embedding = Some(embedding.clone());
        self.store.save_mention(&mention)?;

        work_item.transition(WorkflowState::Matching, "matcher invoked", serde_json::json!({}), None, now)?;
        self.record_checkpoint(&mut work_item, "matching", None, now)?;
        self.store.save_work_item(&work_item)?;

        if self.statement_matches_blacklist_pattern(&mention.statement)? {
            info!(mention_id = %mention.id, "mention statement matched an active blacklist pattern");
            work_item.transition(
                WorkflowState::NoMatch,
                "blacklist pattern match",
                serde_json::json!({}),
                None,
                now,
            )?;
            self.store.save_work_item(&work_item)?;
            self.create_new_concept_for(&mut work_item, &mut mention, now)?;
            return Ok(trace_id);
        }

        let matcher = self.matcher();
        let ctx = StoreMatchContext { store: self.store.as_ref() };
        let candidates =
            matcher.find_candidates(&mention.id, &embedding, &mention.paper_id, &mention.domain, 10, &ctx)?;
        work_item.candidate_concepts = candidates.iter().map(|c| c.concept_id.clone()).collect();

        let top = candidates.first().cloned();
        let band = top.as_ref().map(|c| matcher.classify(c.boosted_score)).unwrap_or(ConfidenceBand::None);

        match band {
            ConfidenceBand::High => self.route_high(&mut work_item, &mut mention, &matcher, top.unwrap(), candidates, now).await?,
            ConfidenceBand::Medium => {
                self.route_medium(&mut work_item, &mut mention, top.unwrap(), candidates, now).await?
            }
            ConfidenceBand::Low => self.route_low(&mut work_item, &mut mention, top.unwrap(), candidates, now).await?,
            ConfidenceBand::None | ConfidenceBand::Rejected => {
                work_item.transition(WorkflowState::NoMatch, "no qualifying candidate", serde_json::json!({}), None, now)?;
                self.store.save_work_item(&work_item)?;
                self.create_new_concept_for(&mut work_item, &mut mention, now)?;
            }
        }

        Ok(trace_id)
    }

    fn create_new_concept_for(
        &self,
        work_item: &mut WorkItem,
        mention: &mut ProblemMention,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let concept = create_new_concept(self.store.as_ref(), work_item, mention, uuid::Uuid::new_v4().to_string(), now)?;
        self.concept_index.upsert(&concept.id, &concept.embedding)?;
        Ok(())
    }

    async fn route_high(
        &self,
        work_item: &mut WorkItem,
        mention: &mut ProblemMention,
        matcher: &ConceptMatcher<'_>,
        candidate: Candidate,
        candidates: Vec<Candidate>,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        work_item.transition(
            WorkflowState::HighConfidence,
            "classified HIGH",
            serde_json::json!({ "concept_id": candidate.concept_id }),
            None,
            now,
        )?;
        self.store.save_work_item(work_item)?;

        use crate::autolink::auto_link_high;
        let concept_id = candidate.concept_id.clone();
        match auto_link_high(self.store.as_ref(), matcher, work_item, mention, &candidate, MatchMethod::Auto, now) {
            Ok(()) => {
                self.maybe_refine(&concept_id, now).await;
                Ok(())
            }
            Err(EngineError::Conflict(reason)) => {
                work_item.transition(
                    WorkflowState::PendingReview,
                    "auto-linker re-verification conflict, rerouted to review",
                    serde_json::json!({ "reason": reason }),
                    None,
                    now,
                )?;
                self.store.save_work_item(work_item)?;
                self.enqueue_for_review(work_item, mention, &candidates, reason, serde_json::Value::Null, now)?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn route_medium(
        &self,
        work_item: &mut WorkItem,
        mention: &mut ProblemMention,
        candidate: Candidate,
        candidates: Vec<Candidate>,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        work_item.transition(WorkflowState::MediumConfidence, "classified MEDIUM", serde_json::json!({}), None, now)?;
        self.store.save_work_item(work_item)?;
        work_item.transition(WorkflowState::AgentReview, "evaluator scheduled", serde_json::json!({}), None, now)?;
        self.store.save_work_item(work_item)?;

        let summary = self.concept_summary(&candidate.concept_id)?;
        let checkpoints = StoreCheckpoints { store: self.store.as_ref(), work_item: work_item.clone(), now };
        let outcome = run_evaluator_path(
            self.roster.as_ref(),
            &checkpoints,
            self.orchestrator_config(),
            &mention.statement,
            &summary,
            candidate.boosted_score,
        )
        .await?;

        match outcome {
            WorkflowOutcome::Link { concept_id, confidence } => {
                work_item.transition(
                    WorkflowState::Approved,
                    "evaluator approved",
                    serde_json::json!({ "concept_id": concept_id }),
                    None,
                    now,
                )?;
                self.store.save_work_item(work_item)?;
                link_approved(self.store.as_ref(), work_item, mention, &concept_id, ConfidenceBand::Medium, MatchMethod::Agent, confidence, now)?;
                self.maybe_refine(&concept_id, now).await;
            }
            WorkflowOutcome::CreateNew => {
                // AgentReview -> CreateNewConcept is legal directly; no
                // intermediate transition to make ourselves.
                self.create_new_concept_for(work_item, mention, now)?;
            }
            WorkflowOutcome::Escalate { reason, artefacts } => {
                work_item.transition(WorkflowState::NeedsConsensus, "evaluator escalated", serde_json::json!({}), None, now)?;
                self.store.save_work_item(work_item)?;
                self.run_consensus(work_item, mention, &candidate, candidates, vec![serde_json::json!({ "escalation": reason })], artefacts, now)
                    .await?;
            }
        }
        Ok(())
    }

    async fn route_low(
        &self,
        work_item: &mut WorkItem,
        mention: &mut ProblemMention,
        candidate: Candidate,
        candidates: Vec<Candidate>,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        work_item.transition(WorkflowState::LowConfidence, "classified LOW", serde_json::json!({}), None, now)?;
        self.store.save_work_item(work_item)?;
        work_item.transition(WorkflowState::PendingReview, "enqueued after consensus", serde_json::json!({}), None, now)?;
        self.store.save_work_item(work_item)?;

        self.run_consensus(work_item, mention, &candidate, candidates, vec![], serde_json::Value::Null, now).await
    }

    /// Runs Maker -> Hater -> Arbiter and applies the result. Requires
    /// `work_item` to already be in `NEEDS_CONSENSUS` (medium-escalated) or
    /// `PENDING_REVIEW` (low-confidence).
    #[allow(clippy::too_many_arguments)]
    async fn run_consensus(
        &self,
        work_item: &mut WorkItem,
        mention: &mut ProblemMention,
        candidate: &Candidate,
        candidates: Vec<Candidate>,
        prior_artefacts: Vec<serde_json::Value>,
        escalation_artefacts: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let summary = self.concept_summary(&candidate.concept_id)?;
        let checkpoints = StoreCheckpoints { store: self.store.as_ref(), work_item: work_item.clone(), now };
        let outcome = run_consensus_loop(
            self.roster.as_ref(),
            &checkpoints,
            self.orchestrator_config(),
            &mention.statement,
            &summary,
            prior_artefacts,
        )
        .await?;

        if work_item.current_state != WorkflowState::PendingReview {
            work_item.transition(WorkflowState::PendingReview, "consensus rounds exhausted", serde_json::json!({}), None, now)?;
            self.store.save_work_item(work_item)?;
        }

        match outcome {
            WorkflowOutcome::Link { concept_id, confidence } => {
                work_item.transition(WorkflowState::Approved, "consensus approved link", serde_json::json!({ "concept_id": concept_id }), None, now)?;
                self.store.save_work_item(work_item)?;
                link_approved(self.store.as_ref(), work_item, mention, &concept_id, ConfidenceBand::Low, MatchMethod::Agent, confidence, now)?;
                self.maybe_refine(&concept_id, now).await;
            }
            WorkflowOutcome::CreateNew => {
                work_item.transition(WorkflowState::Rejected, "consensus rejected match", serde_json::json!({}), None, now)?;
                self.store.save_work_item(work_item)?;
                self.create_new_concept_for(work_item, mention, now)?;
            }
            WorkflowOutcome::Escalate { reason, artefacts } => {
                let merged = serde_json::json!({ "escalation_artefacts": escalation_artefacts, "consensus_artefacts": artefacts });
                self.enqueue_for_review(work_item, mention, &candidates, reason, merged, now)?;
            }
        }
        Ok(())
    }

    /// Re-drive work items matching `filter` that are currently parked at
    /// `MATCHING` with retry budget remaining - the resting point a retryable
    /// embedding or vector-index failure leaves behind. Returns the trace ids
    /// of items that were reprocessed.
    #[instrument(skip(self, filter))]
    pub async fn reprocess(&self, filter: ReprocessFilter, now: DateTime<Utc>) -> Result<Vec<String>, EngineError> {
        let cutoff = filter.older_than.unwrap_or(now);
        let mut trace_ids = Vec::new();
        for mut work_item in self.store.list_stuck_work_items(cutoff)? {
            if work_item.current_state != WorkflowState::Matching {
                continue;
            }
            if let Some(wanted) = filter.state {
                if work_item.current_state != wanted {
                    continue;
                }
            }
            if work_item.retries_exhausted() {
                continue;
            }

            let holder = uuid::Uuid::new_v4().to_string();
            if !self.store.try_claim_work_item(&work_item.id, &holder)? {
                continue;
            }
            let work_item_id = work_item.id.clone();

            let result = self.reprocess_one(work_item, now).await;
            self.store.release_work_item_claim(&work_item_id, &holder)?;

            if let Some(trace_id) = result? {
                trace_ids.push(trace_id);
            }
        }
        Ok(trace_ids)
    }

    /// Re-runs matching for a single claimed work item, returning its trace
    /// id on completion.
    async fn reprocess_one(&self, mut work_item: WorkItem, now: DateTime<Utc>) -> Result<Option<String>, EngineError> {
        let Some(mut mention) = self.store.get_mention(&work_item.mention_id)? else {
            return Ok(None);
        };
        let Some(embedding) = mention.embedding.clone() else {
            return Ok(None);
        };

        work_item.retry_count += 1;
        work_item.last_error = None;
        self.store.save_work_item(&work_item)?;

        let matcher = self.matcher();
        let ctx = StoreMatchContext { store: self.store.as_ref() };
        let candidates =
            matcher.find_candidates(&mention.id, &embedding, &mention.paper_id, &mention.domain, 10, &ctx)?;
        work_item.candidate_concepts = candidates.iter().map(|c| c.concept_id.clone()).collect();

        let top = candidates.first().cloned();
        let band = top.as_ref().map(|c| matcher.classify(c.boosted_score)).unwrap_or(ConfidenceBand::None);

        match band {
            ConfidenceBand::High => self.route_high(&mut work_item, &mut mention, &matcher, top.unwrap(), candidates, now).await?,
            ConfidenceBand::Medium => {
                self.route_medium(&mut work_item, &mut mention, top.unwrap(), candidates, now).await?
            }
            ConfidenceBand::Low => self.route_low(&mut work_item, &mut mention, top.unwrap(), candidates, now).await?,
            ConfidenceBand::None | ConfidenceBand::Rejected => {
                work_item.transition(WorkflowState::NoMatch, "no qualifying candidate", serde_json::json!({}), None, now)?;
                self.store.save_work_item(&work_item)?;
                self.create_new_concept_for(&mut work_item, &mut mention, now)?;
            }
        }

        Ok(Some(work_item.trace_id.clone()))
    }

    /// Restore a work item to its last checkpoint at or before `before`,
    /// reconciling its mention/concept linkage to match.
    #[instrument(skip(self))]
    pub fn rollback_to_time(&self, trace_id: &str, before: DateTime<Utc>) -> Result<WorkItem, EngineError> {
        let checkpoint = self
            .store
            .latest_checkpoint_before(trace_id, before)?
            .ok_or_else(|| EngineError::NotFound(format!("no checkpoint for trace {trace_id} before {before}")))?;
        let restored = checkpoint.work_item_snapshot;
        self.reconcile_rollback(&restored)?;
        Ok(restored)
    }

    /// Restore a work item to its very first recorded checkpoint,
    /// reconciling its mention/concept linkage to match.
    #[instrument(skip(self))]
    pub fn rollback_to_start(&self, trace_id: &str) -> Result<WorkItem, EngineError> {
        let checkpoints = self.store.list_checkpoints_for_trace(trace_id)?;
        let first = checkpoints
            .into_iter()
            .min_by_key(|c| c.created_at)
            .ok_or_else(|| EngineError::NotFound(format!("no checkpoints for trace {trace_id}")))?;
        let restored = first.work_item_snapshot;
        self.reconcile_rollback(&restored)?;
        Ok(restored)
    }

    /// Restore a concept's content fields (canonical statement, domain,
    /// aggregated attributes, baselines, embedding) to a previously recorded
    /// version. Mention linkage and derived counts are untouched - those
    /// stay authoritative from `instance_of_edges` rather than any snapshot.
    /// The restored content is written as a new, later version so it never
    /// collides with (or loses) any version recorded since.
    #[instrument(skip(self))]
    pub fn rollback_to_concept_version(
        &self,
        concept_id: &str,
        version: i64,
    ) -> Result<ProblemConcept, EngineError> {
        let snapshot = self.store.get_concept_version(concept_id, version)?.ok_or_else(|| {
            EngineError::NotFound(format!("concept {concept_id} has no recorded version {version}"))
        })?;
        let mut concept = self
            .store
            .get_concept(concept_id)?
            .ok_or_else(|| EngineError::NotFound(format!("concept {concept_id}")))?;

        concept.canonical_statement = snapshot.canonical_statement;
        concept.domain = snapshot.domain;
        concept.assumptions = snapshot.assumptions;
        concept.constraints = snapshot.constraints;
        concept.datasets = snapshot.datasets;
        concept.metrics = snapshot.metrics;
        concept.verified_baselines = snapshot.verified_baselines;
        concept.claimed_baselines = snapshot.claimed_baselines;
        concept.embedding = snapshot.embedding;
        concept.version += 1;

        self.store.save_concept(&concept)?;
        info!(concept_id, restored_from_version = version, new_version = concept.version, "concept rolled back to prior version");
        Ok(concept)
    }

    /// Undo the mention/concept side effects of whatever processing happened
    /// after `restored`'s checkpoint, then persist `restored` as the work
    /// item's current state. If the mention is currently linked but
    /// `restored`'s state predates the terminal `AUTO_LINKED` transition
    /// that link came from, the `INSTANCE_OF` edge is removed, the old
    /// concept's aggregates are recomputed from its remaining edges, and the
    /// mention's linkage fields are cleared so it can be reprocessed.
    fn reconcile_rollback(&self, restored: &WorkItem) -> Result<(), EngineError> {
        let restored_state = restored.current_state;
        self.store.with_transaction(&mut |txn| {
            txn.save_work_item(restored)?;
            let Some(mut mention) = txn.get_mention(&restored.mention_id)? else {
                return Ok(());
            };
            let should_stay_linked = restored_state == WorkflowState::AutoLinked;
            if mention.concept_id.is_some() && !should_stay_linked {
                if let Some(old_concept_id) = txn.remove_instance_of_edge(&mention.id)? {
                    txn.recompute_concept_aggregates(&old_concept_id)?;
                }
                mention.concept_id = None;
                mention.match_confidence = None;
                mention.match_score = None;
                mention.match_method = None;
                mention.workflow_state = restored_state;
                txn.save_mention(&mention)?;
            }
            Ok(())
        })
    }

    /// Record a pair-scoped blacklist interdiction. Does not itself unlink or
    /// reroute any mention already linked to `concept_id`; the caller
    /// resolves the affected review separately via [`Engine::resolve`].
    pub fn blacklist(
        &self,
        mention_id: &str,
        concept_id: &str,
        reason: String,
        recorded_by: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<BlacklistEntry, EngineError> {
        let entry = BlacklistEntry::forbid_pair(
            uuid::Uuid::new_v4().to_string(),
            mention_id.to_string(),
            concept_id.to_string(),
            reason,
            recorded_by,
            now,
        );
        self.store.record_blacklist_entry(&entry)?;
        Ok(entry)
    }

    /// Resolve a pending human review. Idempotent: resolving an
    /// already-resolved review returns its existing resolution without
    /// re-applying the link/create/blacklist side effect.
    #[instrument(skip(self))]
    pub async fn resolve(
        &self,
        review_id: &str,
        reviewer_id: &str,
        decision: ResolutionDecision,
        now: DateTime<Utc>,
    ) -> Result<PendingReview, EngineError> {
        let (review, newly_resolved) = self.review_queue()?.resolve(review_id, reviewer_id, decision, now)?;
        if !newly_resolved {
            return Ok(review);
        }

        let mut work_item = self
            .store
            .get_work_item(&review.work_item_id)?
            .ok_or_else(|| EngineError::NotFound(format!("work item {}", review.work_item_id)))?;
        let mut mention = self
            .store
            .get_mention(&review.mention_id)?
            .ok_or_else(|| EngineError::NotFound(format!("mention {}", review.mention_id)))?;

        match decision {
            ResolutionDecision::Linked => {
                let concept_id = review
                    .suggested_concepts
                    .first()
                    .map(|c| c.concept_id.clone())
                    .ok_or_else(|| EngineError::Validation("review has no suggested concept to link".to_string()))?;
                work_item.transition(
                    WorkflowState::Approved,
                    "human approved link",
                    serde_json::json!({ "concept_id": concept_id }),
                    Some(reviewer_id.to_string()),
                    now,
                )?;
                self.store.save_work_item(&work_item)?;
                link_approved(self.store.as_ref(), &mut work_item, &mut mention, &concept_id, ConfidenceBand::Low, MatchMethod::Human, 1.0, now)?;
                self.maybe_refine(&concept_id, now).await;
            }
            ResolutionDecision::CreatedNew => {
                work_item.transition(WorkflowState::Rejected, "human rejected match", serde_json::json!({}), Some(reviewer_id.to_string()), now)?;
                self.store.save_work_item(&work_item)?;
                self.create_new_concept_for(&mut work_item, &mut mention, now)?;
            }
            ResolutionDecision::Blacklisted => {
                if let Some(concept_id) = review.suggested_concepts.first().map(|c| c.concept_id.clone()) {
                    self.blacklist(
                        &review.mention_id,
                        &concept_id,
                        "rejected via human review".to_string(),
                        Some(reviewer_id.to_string()),
                        now,
                    )?;
                }
                work_item.transition(WorkflowState::Blacklisted, "human blacklisted match", serde_json::json!({}), Some(reviewer_id.to_string()), now)?;
                self.store.save_work_item(&work_item)?;
                self.create_new_concept_for(&mut work_item, &mut mention, now)?;
            }
        }

        Ok(review)
    }

    /// Admin operation: cancel a work item in any non-terminal state. The
    /// mention is left unlinked; no concept is created or updated. Errs if
    /// the item has already reached a terminal state.
    #[instrument(skip(self))]
    pub fn cancel_work_item(
        &self,
        work_item_id: &str,
        reason: String,
        cancelled_by: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<WorkItem, EngineError> {
        let mut work_item = self
            .store
            .get_work_item(work_item_id)?
            .ok_or_else(|| EngineError::NotFound(format!("work item {work_item_id}")))?;
        work_item.cancel(reason, cancelled_by, now)?;
        self.store.save_work_item(&work_item)?;
        Ok(work_item)
    }

    /// Read-only review-queue query, exposed for operator tooling.
    pub fn list_reviews(&self, filter: &ReviewFilter) -> Result<Vec<PendingReview>, EngineError> {
        self.review_queue()?.list(filter)
    }

    /// Sweep SLA-breached reviews, escalating their priority. Intended to be
    /// polled periodically alongside [`Engine::reap_stuck_work_items`].
    pub fn enforce_review_sla(&self, now: DateTime<Utc>) -> Result<Vec<PendingReview>, EngineError> {
        self.review_queue()?.enforce_sla_breaches(now)
    }

    /// Sweep unresolved reviews and re-evaluate their priority against their
    /// real `created_at` age, escalating any whose age now crosses a
    /// priority band that `enqueue` couldn't have seen at insert time.
    /// Intended to be polled periodically alongside [`Engine::enforce_review_sla`].
    pub fn recompute_review_priorities(&self, now: DateTime<Utc>) -> Result<Vec<PendingReview>, EngineError> {
        self.review_queue()?.recompute_aging_priorities(now)
    }

    /// Sweep work items stuck in a non-terminal state beyond
    /// `stuck_timeout_minutes`: reschedule if retry budget remains, else
    /// force into `PENDING_REVIEW` and enqueue a review. A plain polling
    /// function, not a background task - callers invoke it on their own
    /// schedule.
    #[instrument(skip(self))]
    pub fn reap_stuck_work_items(&self, now: DateTime<Utc>) -> Result<Vec<WorkItem>, EngineError> {
        let cutoff = now - chrono::Duration::minutes(self.config.stuck_timeout_minutes);
        let mut reaped = Vec::new();
        for mut work_item in self.store.list_stuck_work_items(cutoff)? {
            // Already parked for a human (or already terminal): reaping it
            // again would just re-enqueue a duplicate review every sweep.
            if work_item.current_state.is_terminal() || work_item.current_state == WorkflowState::PendingReview {
                continue;
            }

            let holder = uuid::Uuid::new_v4().to_string();
            if !self.store.try_claim_work_item(&work_item.id, &holder)? {
                continue;
            }

            if work_item.retries_exhausted() {
                let Some(mention) = self.store.get_mention(&work_item.mention_id)? else {
                    self.store.release_work_item_claim(&work_item.id, &holder)?;
                    continue;
                };
                work_item.force_into_pending_review("stuck", now)?;
                self.store.save_work_item(&work_item)?;
                self.enqueue_for_review(&work_item, &mention, &[], "stuck".to_string(), serde_json::Value::Null, now)?;
                warn!(work_item_id = %work_item.id, "work item stuck beyond timeout, forced into pending review");
            } else {
                work_item.retry_count += 1;
                self.store.save_work_item(&work_item)?;
            }
            self.store.release_work_item_claim(&work_item.id, &holder)?;
            reaped.push(work_item);
        }
        Ok(reaped)
    }
}
