//! Append-only workflow checkpoints
//!
//! Every stage transition a work item makes is preceded by a checkpoint
//! write, so `rollback(trace_id | time | concept_version)` can restore state
//! without replaying agent calls.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::workitem::WorkItem;

/// A durable snapshot of a work item taken immediately before a stage runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    /// Stable unique id.
    pub id: String,
    /// The trace id of the work item this checkpoint belongs to.
    pub trace_id: String,
    /// Name of the stage about to run (e.g. "matching", "auto_link", "evaluator").
    pub stage: String,
    /// Full snapshot of the work item as it was before the stage ran.
    pub work_item_snapshot: WorkItem,
    /// Output produced by the stage, once it completes. `None` while pending.
    pub stage_output: Option<serde_json::Value>,
    /// When the checkpoint was written.
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Record a checkpoint immediately before `stage` runs against `work_item`.
    pub fn before_stage(
        id: String,
        stage: impl Into<String>,
        work_item: &WorkItem,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            trace_id: work_item.trace_id.clone(),
            stage: stage.into(),
            work_item_snapshot: work_item.clone(),
            stage_output: None,
            created_at,
        }
    }
}
