//! Engine configuration
//!
//! A single [`EngineConfig`] holds every recognised tunable: confidence
//! thresholds, citation boost, consensus and timeout limits, refinement
//! cadence, review-queue priority/SLA, embedding dimension, and retry policy.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// Similarity thresholds classifying a boosted match score into a confidence band.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Thresholds {
    /// Minimum boosted score classified as HIGH.
    pub high: f32,
    /// Minimum boosted score classified as MEDIUM.
    pub medium: f32,
    /// Minimum boosted score classified as LOW.
    pub low: f32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            high: 0.95,
            medium: 0.80,
            low: 0.50,
        }
    }
}

/// Citation-graph boost configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CitationBoost {
    /// Additive boost applied per citing-paper hit.
    pub per_hit: f32,
    /// Maximum aggregate boost regardless of hit count.
    pub cap: f32,
}

impl Default for CitationBoost {
    fn default() -> Self {
        Self {
            per_hit: 0.03,
            cap: 0.20,
        }
    }
}

/// Retry policy shared by embedding, vector index, and linker-transaction callers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Maximum retry attempts before surfacing `persistent_error`.
    pub max: u32,
    /// Initial backoff, milliseconds.
    pub initial_backoff_ms: u64,
    /// Maximum jitter added to each backoff, milliseconds.
    pub jitter_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max: 3,
            initial_backoff_ms: 100,
            jitter_ms: 50,
        }
    }
}

/// Priority scoring and SLA configuration for the review queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PriorityConfig {
    /// Domains treated as critical (priority boost of -2).
    pub critical_domains: HashSet<String>,
    /// Age in days after which a pending review is considered stale (-3 boost).
    pub age_escalation_days: i64,
}

impl Default for PriorityConfig {
    fn default() -> Self {
        Self {
            critical_domains: HashSet::new(),
            age_escalation_days: 7,
        }
    }
}

/// SLA deadline hours keyed by priority band.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SlaHours {
    /// Hours allotted to priority 1-3 items.
    pub p1_3: i64,
    /// Hours allotted to priority 4-6 items.
    pub p4_6: i64,
    /// Hours allotted to priority 7-10 items.
    pub p7_10: i64,
}

impl Default for SlaHours {
    fn default() -> Self {
        Self {
            p1_3: 24,
            p4_6: 7 * 24,
            p7_10: 30 * 24,
        }
    }
}

impl SlaHours {
    /// Resolve the SLA window, in hours, for a clamped priority (1-10).
    pub fn for_priority(&self, priority: u8) -> i64 {
        match priority {
            1..=3 => self.p1_3,
            4..=6 => self.p4_6,
            _ => self.p7_10,
        }
    }
}

/// Embedding dimension/metric configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddingConfig {
    /// Vector dimensionality.
    pub dim: usize,
    /// Similarity metric name (informational; the index always uses cosine).
    pub metric: String,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            dim: 1536,
            metric: "cosine".to_string(),
        }
    }
}

/// Mention-count thresholds that trigger concept refinement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RefinementThresholds {
    /// Mention counts at which refinement is triggered.
    pub counts: Vec<i64>,
    /// Maximum retry attempts for a failed refinement.
    pub max_retries: u32,
    /// Maximum whitespace-delimited token count for a synthesized canonical
    /// statement. Refinement output exceeding this is rejected and retried.
    pub max_canonical_statement_tokens: usize,
}

impl Default for RefinementThresholds {
    fn default() -> Self {
        Self {
            counts: vec![5, 10, 25, 50],
            max_retries: 3,
            max_canonical_statement_tokens: 80,
        }
    }
}

/// Top-level engine configuration, deserializable from TOML.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Confidence-band thresholds.
    pub thresholds: Thresholds,
    /// Citation-graph boost.
    pub citation_boost: CitationBoost,
    /// Maximum Maker/Hater/Arbiter rounds before escalation.
    pub max_consensus_rounds: u32,
    /// Arbiter confidence required to avoid forced RETRY (ignored on the final round).
    pub arbiter_confidence_threshold: f32,
    /// Per-role-invocation timeout, seconds.
    pub role_timeout_secs: u64,
    /// Mention-count thresholds that trigger refinement.
    pub refinement_thresholds: RefinementThresholds,
    /// Review queue priority scoring configuration.
    pub priority: PriorityConfig,
    /// SLA deadlines by priority band.
    pub sla_hours: SlaHours,
    /// Embedding dimension/metric.
    pub embedding: EmbeddingConfig,
    /// Retry policy for transient/conflict errors.
    pub retry: RetryPolicy,
    /// Minutes a work item may sit in a non-terminal state before being
    /// considered stuck.
    pub stuck_timeout_minutes: i64,
    /// Default retry cap assigned to new work items.
    pub work_item_max_retries: u32,
    /// Review-queue assignment lease duration, minutes.
    pub review_lease_minutes: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            thresholds: Thresholds::default(),
            citation_boost: CitationBoost::default(),
            max_consensus_rounds: 3,
            arbiter_confidence_threshold: 0.70,
            role_timeout_secs: 30,
            refinement_thresholds: RefinementThresholds::default(),
            priority: PriorityConfig::default(),
            sla_hours: SlaHours::default(),
            embedding: EmbeddingConfig::default(),
            retry: RetryPolicy::default(),
            stuck_timeout_minutes: 60,
            work_item_max_retries: 3,
            review_lease_minutes: 30,
        }
    }
}

impl EngineConfig {
    /// Parse configuration from a complete TOML document. Every field listed
    /// above is required; use [`EngineConfig::default`] and override
    /// individual fields in code for partial configuration.
    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }
}
