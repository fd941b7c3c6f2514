//! Data model: mentions, concepts, work items and their review records

pub mod checkpoint;
pub mod concept;
pub mod mention;
pub mod review;
pub mod workitem;

pub use checkpoint::Checkpoint;
pub use concept::{ConceptStatus, ConceptVersionSnapshot, ProblemConcept, Provenanced, SynthesisMetadata};
pub use mention::{
    Assumption, Baseline, ConfidenceBand, Constraint, ConstraintKind, DatasetRef, MatchMethod,
    MentionInput, MetricRef, ProblemMention, ReviewStatus,
};
pub use review::{BlacklistEntry, PendingReview, ResolutionDecision, SuggestedConcept};
pub use workitem::{StateHistoryEntry, WorkItem, WorkflowState};
