//! The review queue: priority scoring, SLA tracking, assignment leases
//!
//! Durable state lives entirely in the graph store's `pending_reviews`
//! table; the `BinaryHeap` here is a latency-only secondary index over
//! unresolved items, rebuilt from the store on construction and kept best-
//! effort in sync afterward. It is never consulted for correctness -
//! [`ReviewQueue::next`] always claims through the store's atomic pop so two
//! workers can never be handed the same review.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::config::{PriorityConfig, SlaHours};
use crate::error::EngineError;
use crate::model::{PendingReview, ResolutionDecision, SuggestedConcept, WorkItem};
use crate::storage::GraphStore;

/// Priority score, base 5, adjusted per §4.6 and clamped to `[1, 10]`.
pub fn compute_priority(
    cfg: &PriorityConfig,
    match_confidence: f32,
    candidate_mention_count: i64,
    domain: &str,
    enqueued_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> u8 {
    let mut score: i32 = 5;
    score += ((1.0 - match_confidence) * 5.0).floor() as i32;
    if candidate_mention_count > 10 {
        score -= 1;
    }
    if cfg.critical_domains.contains(domain) {
        score -= 2;
    }
    if (now - enqueued_at) > chrono::Duration::days(cfg.age_escalation_days) {
        score -= 3;
    }
    score.clamp(1, 10) as u8
}

/// A single pending-review's position in the priority index: lower priority
/// number first, ties broken by the earlier SLA deadline.
#[derive(Debug, Clone, Eq, PartialEq)]
struct HeapEntry {
    review_id: String,
    priority: u8,
    sla_deadline: DateTime<Utc>,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse so the most urgent entry (lowest
        // priority number, earliest deadline) sorts to the top.
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.sla_deadline.cmp(&self.sla_deadline))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Query filter for [`ReviewQueue::list`].
#[derive(Debug, Clone, Default)]
pub struct ReviewFilter {
    pub priority_min: Option<u8>,
    pub priority_max: Option<u8>,
    pub assigned_to: Option<String>,
    /// `Some(true)` = resolved only, `Some(false)` = unresolved only, `None` = both.
    pub resolved: Option<bool>,
}

impl ReviewFilter {
    fn matches(&self, review: &PendingReview) -> bool {
        if let Some(min) = self.priority_min {
            if review.priority < min {
                return false;
            }
        }
        if let Some(max) = self.priority_max {
            if review.priority > max {
                return false;
            }
        }
        if let Some(reviewer) = &self.assigned_to {
            if review.assigned_to.as_deref() != Some(reviewer.as_str()) {
                return false;
            }
        }
        if let Some(resolved) = self.resolved {
            if review.resolution.is_some() != resolved {
                return false;
            }
        }
        true
    }
}

/// The review queue, backed by `store` and a rebuildable in-process index.
pub struct ReviewQueue<'a> {
    store: &'a dyn GraphStore,
    priority_cfg: PriorityConfig,
    sla_hours: SlaHours,
    lease_minutes: i64,
    index: Mutex<BinaryHeap<HeapEntry>>,
}

impl<'a> ReviewQueue<'a> {
    /// Construct a queue over `store`, immediately rebuilding its in-process
    /// index from whatever unresolved reviews the store already holds.
    pub fn new(
        store: &'a dyn GraphStore,
        priority_cfg: PriorityConfig,
        sla_hours: SlaHours,
        lease_minutes: i64,
    ) -> Result<Self, EngineError> {
        let queue = Self {
            store,
            priority_cfg,
            sla_hours,
            lease_minutes,
            index: Mutex::new(BinaryHeap::new()),
        };
        queue.rebuild_index()?;
        Ok(queue)
    }

    /// Replay the store's pending reviews into the in-process priority index.
    pub fn rebuild_index(&self) -> Result<(), EngineError> {
        let reviews = self.store.list_pending_reviews()?;
        let mut index = self.index.lock().expect("review queue index lock poisoned");
        index.clear();
        for review in reviews.into_iter().filter(|r| r.resolution.is_none()) {
            index.push(HeapEntry {
                review_id: review.id,
                priority: review.priority,
                sla_deadline: review.sla_deadline,
            });
        }
        Ok(())
    }

    /// Enqueue an escalated work item for human review.
    #[allow(clippy::too_many_arguments)]
    pub fn enqueue(
        &self,
        work_item: &WorkItem,
        mention_id: &str,
        suggested_concepts: Vec<SuggestedConcept>,
        escalation_reason: String,
        agent_artefacts: serde_json::Value,
        match_confidence: f32,
        candidate_mention_count: i64,
        domain: &str,
        now: DateTime<Utc>,
    ) -> Result<PendingReview, EngineError> {
        let priority = compute_priority(
            &self.priority_cfg,
            match_confidence,
            candidate_mention_count,
            domain,
            now,
            now,
        );
        let sla_deadline = now + chrono::Duration::hours(self.sla_hours.for_priority(priority));

        let review = PendingReview {
            id: uuid::Uuid::new_v4().to_string(),
            work_item_id: work_item.id.clone(),
            mention_id: mention_id.to_string(),
            suggested_concepts,
            agent_artefacts,
            escalation_reason,
            domain: domain.to_string(),
            match_confidence,
            candidate_mention_count,
            priority,
            sla_deadline,
            assigned_to: None,
            assigned_at: None,
            resolution: None,
            resolved_by: None,
            resolved_at: None,
            created_at: now,
        };

        self.store.save_pending_review(&review)?;
        self.index
            .lock()
            .expect("review queue index lock poisoned")
            .push(HeapEntry {
                review_id: review.id.clone(),
                priority: review.priority,
                sla_deadline: review.sla_deadline,
            });
        Ok(review)
    }

    /// Atomically claim the highest-priority unassigned (or lease-expired)
    /// review for `reviewer_id`.
    pub fn next(&self, reviewer_id: &str, now: DateTime<Utc>) -> Result<Option<PendingReview>, EngineError> {
        let Some(mut review) = self.store.pop_highest_priority_unassigned(now, self.lease_minutes)? else {
            return Ok(None);
        };
        review.assigned_to = Some(reviewer_id.to_string());
        review.assigned_at = Some(now);
        self.store.save_pending_review(&review)?;
        Ok(Some(review))
    }

    /// Release `reviewer_id`'s lease on `review_id`. No-op if `reviewer_id`
    /// does not currently hold it.
    pub fn release(&self, review_id: &str, reviewer_id: &str) -> Result<(), EngineError> {
        let Some(mut review) = self.store.get_pending_review(review_id)? else {
            return Ok(());
        };
        if review.assigned_to.as_deref() != Some(reviewer_id) {
            return Ok(());
        }
        review.assigned_to = None;
        review.assigned_at = None;
        self.store.save_pending_review(&review)
    }

    /// Record a review's resolution. Idempotent (L3): a review that is
    /// already resolved is left untouched on a repeated call, regardless of
    /// the decision passed. The store applies the check-and-set atomically,
    /// so concurrent resolves of the same review can't both win. Returns the
    /// review alongside whether this call is the one that resolved it -
    /// callers use that to decide whether to run the link/create/blacklist
    /// side effect.
    pub fn resolve(
        &self,
        review_id: &str,
        reviewer_id: &str,
        decision: ResolutionDecision,
        now: DateTime<Utc>,
    ) -> Result<(PendingReview, bool), EngineError> {
        self.store
            .try_resolve_pending_review(review_id, reviewer_id, decision, now)?
            .ok_or_else(|| EngineError::NotFound(format!("pending review {review_id}")))
    }

    /// Read-only query over unresolved and resolved reviews.
    pub fn list(&self, filter: &ReviewFilter) -> Result<Vec<PendingReview>, EngineError> {
        Ok(self
            .store
            .list_pending_reviews()?
            .into_iter()
            .filter(|r| filter.matches(r))
            .collect())
    }

    /// Escalate every unresolved review whose SLA deadline has passed:
    /// priority drops by 3 (clamped to 1) and the deadline is renewed from
    /// `now` using the new priority's SLA window, so a review that is not
    /// re-breached before the next sweep is not re-escalated. Returns the
    /// escalated reviews, one operator alert per entry.
    pub fn enforce_sla_breaches(&self, now: DateTime<Utc>) -> Result<Vec<PendingReview>, EngineError> {
        let mut escalated = Vec::new();
        for mut review in self.store.list_pending_reviews()?.into_iter().filter(|r| r.resolution.is_none()) {
            if review.sla_deadline >= now {
                continue;
            }
            let old_priority = review.priority;
            let new_priority = (old_priority as i32 - 3).clamp(1, 10) as u8;
            review.priority = new_priority;
            review.sla_deadline = now + chrono::Duration::hours(self.sla_hours.for_priority(new_priority));
            self.store.save_pending_review(&review)?;
            warn!(
                review_id = %review.id,
                old_priority,
                new_priority,
                "review SLA breached, priority escalated"
            );
            escalated.push(review);
        }
        if !escalated.is_empty() {
            self.rebuild_index()?;
        }
        Ok(escalated)
    }

    /// Re-evaluate `compute_priority` for every unresolved review using its
    /// real `created_at`, so the age-escalation penalty in `compute_priority`
    /// fires once a review has actually been pending past
    /// `age_escalation_days` - distinct from `enforce_sla_breaches`, which
    /// only reacts to a breached SLA deadline and can let a high-priority
    /// item (a long SLA window) sit unescalated well past that age. Only
    /// ever escalates (lowers the priority number): the other inputs to
    /// `compute_priority` are fixed at their enqueue-time values, so ageing
    /// alone can only make a review more urgent, never less.
    pub fn recompute_aging_priorities(&self, now: DateTime<Utc>) -> Result<Vec<PendingReview>, EngineError> {
        let mut escalated = Vec::new();
        for mut review in self.store.list_pending_reviews()?.into_iter().filter(|r| r.resolution.is_none()) {
            let recomputed = compute_priority(
                &self.priority_cfg,
                review.match_confidence,
                review.candidate_mention_count,
                &review.domain,
                review.created_at,
                now,
            );
            if recomputed >= review.priority {
                continue;
            }
            let old_priority = review.priority;
            review.priority = recomputed;
            review.sla_deadline = now + chrono::Duration::hours(self.sla_hours.for_priority(recomputed));
            self.store.save_pending_review(&review)?;
            warn!(
                review_id = %review.id,
                old_priority,
                new_priority = recomputed,
                "pending review aged past the escalation threshold, priority escalated"
            );
            escalated.push(review);
        }
        if !escalated.is_empty() {
            self.rebuild_index()?;
        }
        Ok(escalated)
    }
}
