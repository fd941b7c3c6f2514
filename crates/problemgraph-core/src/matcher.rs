//! Concept matching: nearest-neighbour retrieval, citation boost, classification
//!
//! [`ConceptMatcher`] is a pure function of its inputs (vector index state,
//! citation/provenance data, configuration): for a fixed index and config,
//! `find_candidates` returns the same ranked list every time it is called on
//! the same mention.

use serde::{Deserialize, Serialize};

use crate::config::{CitationBoost, Thresholds};
use crate::model::ConfidenceBand;
use crate::vector_index::{VectorIndex, VectorSearchError};

/// The subset of graph-store knowledge the matcher needs: citation edges,
/// per-concept mention counts, and blacklist entries. Implemented by the
/// graph store so the matcher never depends on its storage engine directly.
pub trait MatchContext {
    /// Paper ids directly cited (depth 1) by `paper_id`.
    fn cited_paper_ids(&self, paper_id: &str) -> Result<Vec<String>, crate::error::EngineError>;

    /// Paper ids in which `concept_id` has at least one linked mention.
    fn papers_with_mentions_of(&self, concept_id: &str) -> Result<Vec<String>, crate::error::EngineError>;

    /// Domain tag of `concept_id`, if it exists.
    fn concept_domain(&self, concept_id: &str) -> Result<Option<String>, crate::error::EngineError>;

    /// Current `mention_count` of `concept_id`, used for tie-breaking.
    fn concept_mention_count(&self, concept_id: &str) -> Result<i64, crate::error::EngineError>;

    /// Whether `(mention_id, concept_id)` has been recorded in the blacklist.
    fn is_blacklisted(&self, mention_id: &str, concept_id: &str) -> Result<bool, crate::error::EngineError>;
}

/// One ranked candidate concept for a mention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub concept_id: String,
    pub raw_score: f32,
    pub boosted_score: f32,
    pub domain_match: bool,
    pub reasoning_tag: String,
}

/// The matcher: ranks candidates and classifies confidence bands.
pub struct ConceptMatcher<'a> {
    index: &'a VectorIndex,
    thresholds: Thresholds,
    citation_boost: CitationBoost,
}

impl<'a> ConceptMatcher<'a> {
    pub fn new(index: &'a VectorIndex, thresholds: Thresholds, citation_boost: CitationBoost) -> Self {
        Self {
            index,
            thresholds,
            citation_boost,
        }
    }

    /// Retrieve up to `top_k` candidate concepts for a mention, enriched with
    /// citation boost and domain-match flags, filtered of any blacklisted
    /// `(mention_id, concept_id)` pairs, sorted by the matcher's tie-break
    /// rule: boosted score descending, then `mention_count` descending, then
    /// concept id ascending.
    pub fn find_candidates(
        &self,
        mention_id: &str,
        mention_embedding: &[f32],
        mention_paper_id: &str,
        mention_domain: &str,
        top_k: usize,
        ctx: &dyn MatchContext,
    ) -> Result<Vec<Candidate>, crate::error::EngineError> {
        let raw_hits = self
            .index
            .search(mention_embedding, top_k)
            .map_err(|e| match e {
                VectorSearchError::Unavailable(msg) => {
                    crate::error::EngineError::VectorIndex(VectorSearchError::Unavailable(msg))
                }
                other => crate::error::EngineError::VectorIndex(other),
            })?;

        let cited_papers = ctx.cited_paper_ids(mention_paper_id)?;

        let mut candidates = Vec::with_capacity(raw_hits.len());
        for (concept_id, raw_score) in raw_hits {
            if ctx.is_blacklisted(mention_id, &concept_id)? {
                continue;
            }

            let concept_papers = ctx.papers_with_mentions_of(&concept_id)?;
            let citing_hits = concept_papers
                .iter()
                .filter(|p| cited_papers.contains(p))
                .count() as f32;
            let boost = (citing_hits * self.citation_boost.per_hit).min(self.citation_boost.cap);
            let boosted_score = raw_score + boost;

            let domain = ctx.concept_domain(&concept_id)?;
            let domain_match = domain.as_deref() == Some(mention_domain);

            let reasoning_tag = if boost > 0.0 {
                format!("cosine={raw_score:.4}, citation_boost={boost:.4}, domain_match={domain_match}")
            } else {
                format!("cosine={raw_score:.4}, domain_match={domain_match}")
            };

            candidates.push(Candidate {
                concept_id,
                raw_score,
                boosted_score,
                domain_match,
                reasoning_tag,
            });
        }

        let mut mention_counts = std::collections::HashMap::new();
        for c in &candidates {
            mention_counts.insert(c.concept_id.clone(), ctx.concept_mention_count(&c.concept_id)?);
        }

        candidates.sort_by(|a, b| {
            b.boosted_score
                .partial_cmp(&a.boosted_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| mention_counts[&b.concept_id].cmp(&mention_counts[&a.concept_id]))
                .then_with(|| a.concept_id.cmp(&b.concept_id))
        });

        Ok(candidates)
    }

    /// Classify a boosted score into a confidence band using the configured
    /// thresholds.
    pub fn classify(&self, boosted_score: f32) -> ConfidenceBand {
        if boosted_score >= self.thresholds.high {
            ConfidenceBand::High
        } else if boosted_score >= self.thresholds.medium {
            ConfidenceBand::Medium
        } else if boosted_score >= self.thresholds.low {
            ConfidenceBand::Low
        } else {
            ConfidenceBand::None
        }
    }

    /// Exposed for tests that assert classification boundaries against
    /// configuration rather than hardcoded constants.
    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }
}
