//! SQLite-backed [`GraphStore`]
//!
//! A single `rusqlite::Connection` behind a `Mutex`, tuned with the same
//! PRAGMA block the teacher's `Storage` applies (WAL, NORMAL synchronous,
//! a generous page cache, `foreign_keys` on). SQLite's own single-writer
//! model gives every transaction here the serialisable-isolation property
//! §5 requires without any additional locking primitive.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use super::migrations::apply_migrations;
use super::{GraphStore, GraphTransaction, StorageError};
use crate::error::EngineError;
use crate::model::{
    BlacklistEntry, Checkpoint, ConceptVersionSnapshot, ConfidenceBand, MatchMethod, PendingReview,
    ProblemConcept, ProblemMention, ResolutionDecision, ReviewStatus, StateHistoryEntry, SuggestedConcept,
    WorkItem, WorkflowState,
};

fn configure_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "busy_timeout", 5000)?;
    conn.pragma_update(None, "cache_size", -64000)?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    Ok(())
}

fn enum_to_text<T: Serialize>(value: &T) -> Result<String, EngineError> {
    serde_json::to_string(value).map_err(|e| EngineError::Storage(StorageError::Serialization(e)))
}

fn json_to_text<T: Serialize>(value: &T) -> Result<String, EngineError> {
    serde_json::to_string(value).map_err(|e| EngineError::Storage(StorageError::Serialization(e)))
}

fn embedding_to_blob(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn blob_to_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

fn parse_rfc3339_or_now(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

// ============================================================================
// row <-> model mapping
// ============================================================================

fn concept_from_row(row: &Row) -> rusqlite::Result<ProblemConcept> {
    let synthesis_method: Option<String> = row.get("synthesis_method")?;
    Ok(ProblemConcept {
        id: row.get("id")?,
        canonical_statement: row.get("canonical_statement")?,
        domain: row.get("domain")?,
        status: serde_json::from_str(&row.get::<_, String>("status")?).unwrap_or_default(),
        assumptions: serde_json::from_str(&row.get::<_, String>("assumptions_json")?).unwrap_or_default(),
        constraints: serde_json::from_str(&row.get::<_, String>("constraints_json")?).unwrap_or_default(),
        datasets: serde_json::from_str(&row.get::<_, String>("datasets_json")?).unwrap_or_default(),
        metrics: serde_json::from_str(&row.get::<_, String>("metrics_json")?).unwrap_or_default(),
        verified_baselines: serde_json::from_str(&row.get::<_, String>("verified_baselines_json")?)
            .unwrap_or_default(),
        claimed_baselines: serde_json::from_str(&row.get::<_, String>("claimed_baselines_json")?)
            .unwrap_or_default(),
        synthesis: match synthesis_method {
            Some(method) => Some(crate::model::SynthesisMetadata {
                method,
                model_id: row.get("synthesis_model_id")?,
                synthesized_at: parse_rfc3339_or_now(&row.get::<_, String>("synthesized_at")?),
                synthesizer_id: row.get::<_, Option<String>>("synthesizer_id")?.unwrap_or_default(),
            }),
            None => None,
        },
        human_edited: row.get::<_, i64>("human_edited")? != 0,
        version: row.get("version")?,
        mention_count: row.get("mention_count")?,
        paper_count: row.get("paper_count")?,
        first_mentioned_year: row.get("first_mentioned_year")?,
        last_mentioned_year: row.get("last_mentioned_year")?,
        last_refined_at_count: row.get("last_refined_at_count")?,
        embedding: blob_to_embedding(&row.get::<_, Vec<u8>>("embedding")?),
        created_at: parse_rfc3339_or_now(&row.get::<_, String>("created_at")?),
    })
}

fn concept_version_from_row(row: &Row) -> rusqlite::Result<ConceptVersionSnapshot> {
    Ok(ConceptVersionSnapshot {
        concept_id: row.get("concept_id")?,
        version: row.get("version")?,
        canonical_statement: row.get("canonical_statement")?,
        domain: row.get("domain")?,
        assumptions: serde_json::from_str(&row.get::<_, String>("assumptions_json")?).unwrap_or_default(),
        constraints: serde_json::from_str(&row.get::<_, String>("constraints_json")?).unwrap_or_default(),
        datasets: serde_json::from_str(&row.get::<_, String>("datasets_json")?).unwrap_or_default(),
        metrics: serde_json::from_str(&row.get::<_, String>("metrics_json")?).unwrap_or_default(),
        verified_baselines: serde_json::from_str(&row.get::<_, String>("verified_baselines_json")?)
            .unwrap_or_default(),
        claimed_baselines: serde_json::from_str(&row.get::<_, String>("claimed_baselines_json")?)
            .unwrap_or_default(),
        embedding: blob_to_embedding(&row.get::<_, Vec<u8>>("embedding")?),
        created_at: parse_rfc3339_or_now(&row.get::<_, String>("created_at")?),
    })
}

fn mention_from_row(row: &Row) -> rusqlite::Result<ProblemMention> {
    Ok(ProblemMention {
        id: row.get("id")?,
        statement: row.get("statement")?,
        paper_id: row.get("paper_id")?,
        section: row.get("section")?,
        source_text: row.get("source_text")?,
        domain: row.get("domain")?,
        assumptions: serde_json::from_str(&row.get::<_, String>("assumptions_json")?).unwrap_or_default(),
        constraints: serde_json::from_str(&row.get::<_, String>("constraints_json")?).unwrap_or_default(),
        datasets: serde_json::from_str(&row.get::<_, String>("datasets_json")?).unwrap_or_default(),
        metrics: serde_json::from_str(&row.get::<_, String>("metrics_json")?).unwrap_or_default(),
        baselines: serde_json::from_str(&row.get::<_, String>("baselines_json")?).unwrap_or_default(),
        extractor_version: row.get("extractor_version")?,
        extraction_model_id: row.get("extraction_model_id")?,
        extraction_confidence: row.get("extraction_confidence")?,
        reviewer_id: row.get("reviewer_id")?,
        embedding: row.get::<_, Option<Vec<u8>>>("embedding")?.map(|b| blob_to_embedding(&b)),
        concept_id: row.get("concept_id")?,
        match_confidence: row
            .get::<_, Option<String>>("match_confidence")?
            .map(|s| serde_json::from_str::<ConfidenceBand>(&s))
            .transpose()
            .unwrap_or(None),
        match_score: row.get("match_score")?,
        match_method: row
            .get::<_, Option<String>>("match_method")?
            .map(|s| serde_json::from_str::<MatchMethod>(&s))
            .transpose()
            .unwrap_or(None),
        workflow_state: serde_json::from_str(&row.get::<_, String>("workflow_state")?)
            .unwrap_or(WorkflowState::Extracted),
        review_status: serde_json::from_str(&row.get::<_, String>("review_status")?)
            .unwrap_or(ReviewStatus::Pending),
        created_at: parse_rfc3339_or_now(&row.get::<_, String>("created_at")?),
    })
}

fn work_item_from_row(row: &Row) -> rusqlite::Result<WorkItem> {
    Ok(WorkItem {
        id: row.get("id")?,
        trace_id: row.get("trace_id")?,
        mention_id: row.get("mention_id")?,
        current_state: serde_json::from_str(&row.get::<_, String>("current_state")?)
            .unwrap_or(WorkflowState::Extracted),
        history: serde_json::from_str::<Vec<StateHistoryEntry>>(&row.get::<_, String>("history_json")?)
            .unwrap_or_default(),
        candidate_concepts: serde_json::from_str(&row.get::<_, String>("candidate_concepts_json")?)
            .unwrap_or_default(),
        selected_concept_id: row.get("selected_concept_id")?,
        priority: row.get::<_, i64>("priority")? as u8,
        sla_deadline: row
            .get::<_, Option<String>>("sla_deadline")?
            .map(|s| parse_rfc3339_or_now(&s)),
        retry_count: row.get::<_, i64>("retry_count")? as u32,
        max_retries: row.get::<_, i64>("max_retries")? as u32,
        last_error: row.get("last_error")?,
        checkpoint_ids: serde_json::from_str(&row.get::<_, String>("checkpoint_ids_json")?).unwrap_or_default(),
        assigned_reviewer_id: row.get("assigned_reviewer_id")?,
        assigned_at: row
            .get::<_, Option<String>>("assigned_at")?
            .map(|s| parse_rfc3339_or_now(&s)),
    })
}

fn checkpoint_from_row(row: &Row) -> rusqlite::Result<Checkpoint> {
    Ok(Checkpoint {
        id: row.get("id")?,
        trace_id: row.get("trace_id")?,
        stage: row.get("stage")?,
        work_item_snapshot: serde_json::from_str(&row.get::<_, String>("work_item_snapshot_json")?)
            .unwrap_or_else(|_| WorkItem::new(String::new(), String::new(), String::new(), 5, 0)),
        stage_output: row
            .get::<_, Option<String>>("stage_output_json")?
            .and_then(|s| serde_json::from_str(&s).ok()),
        created_at: parse_rfc3339_or_now(&row.get::<_, String>("created_at")?),
    })
}

fn pending_review_from_row(row: &Row) -> rusqlite::Result<PendingReview> {
    Ok(PendingReview {
        id: row.get("id")?,
        work_item_id: row.get("work_item_id")?,
        mention_id: row.get("mention_id")?,
        suggested_concepts: serde_json::from_str::<Vec<SuggestedConcept>>(
            &row.get::<_, String>("suggested_concepts_json")?,
        )
        .unwrap_or_default(),
        agent_artefacts: serde_json::from_str(&row.get::<_, String>("agent_artefacts_json")?)
            .unwrap_or(serde_json::Value::Null),
        escalation_reason: row.get("escalation_reason")?,
        domain: row.get("domain")?,
        match_confidence: row.get("match_confidence")?,
        candidate_mention_count: row.get("candidate_mention_count")?,
        priority: row.get::<_, i64>("priority")? as u8,
        sla_deadline: parse_rfc3339_or_now(&row.get::<_, String>("sla_deadline")?),
        assigned_to: row.get("assigned_to")?,
        assigned_at: row
            .get::<_, Option<String>>("assigned_at")?
            .map(|s| parse_rfc3339_or_now(&s)),
        resolution: row
            .get::<_, Option<String>>("resolution")?
            .map(|s| serde_json::from_str::<ResolutionDecision>(&s))
            .transpose()
            .unwrap_or(None),
        resolved_by: row.get("resolved_by")?,
        resolved_at: row
            .get::<_, Option<String>>("resolved_at")?
            .map(|s| parse_rfc3339_or_now(&s)),
        created_at: parse_rfc3339_or_now(&row.get::<_, String>("created_at")?),
    })
}

fn blacklist_entry_from_row(row: &Row) -> rusqlite::Result<BlacklistEntry> {
    Ok(BlacklistEntry {
        id: row.get("id")?,
        mention_id: row.get("mention_id")?,
        concept_id: row.get("concept_id")?,
        pattern: row.get("pattern")?,
        reason: row.get("reason")?,
        never_allow: row.get::<_, i64>("never_allow")? != 0,
        recorded_by: row.get("recorded_by")?,
        created_at: parse_rfc3339_or_now(&row.get::<_, String>("created_at")?),
    })
}

// ============================================================================
// shared statement bodies, usable against either a Connection or a Transaction
// ============================================================================

fn db_err(e: rusqlite::Error) -> EngineError {
    EngineError::Storage(StorageError::Database(e))
}

fn exec_get_concept(conn: &Connection, id: &str) -> Result<Option<ProblemConcept>, EngineError> {
    conn.query_row("SELECT * FROM concepts WHERE id = ?1", [id], concept_from_row)
        .optional()
        .map_err(db_err)
}

fn exec_get_concept_version(
    conn: &Connection,
    concept_id: &str,
    version: i64,
) -> Result<Option<ConceptVersionSnapshot>, EngineError> {
    conn.query_row(
        "SELECT * FROM concept_versions WHERE concept_id = ?1 AND version = ?2",
        params![concept_id, version],
        concept_version_from_row,
    )
    .optional()
    .map_err(db_err)
}

/// Append-only: records `concept`'s content fields under its current
/// `version`. Idempotent on re-save of the same version (retries, replayed
/// checkpoints) since `(concept_id, version)` is the primary key.
fn exec_record_concept_version(conn: &Connection, concept: &ProblemConcept) -> Result<(), EngineError> {
    conn.execute(
        "INSERT OR IGNORE INTO concept_versions (
            concept_id, version, canonical_statement, domain, assumptions_json, constraints_json,
            datasets_json, metrics_json, verified_baselines_json, claimed_baselines_json,
            embedding, created_at
        ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)",
        params![
            concept.id,
            concept.version,
            concept.canonical_statement,
            concept.domain,
            json_to_text(&concept.assumptions)?,
            json_to_text(&concept.constraints)?,
            json_to_text(&concept.datasets)?,
            json_to_text(&concept.metrics)?,
            json_to_text(&concept.verified_baselines)?,
            json_to_text(&concept.claimed_baselines)?,
            embedding_to_blob(&concept.embedding),
            rfc3339(concept.created_at),
        ],
    )
    .map_err(db_err)?;
    Ok(())
}

fn exec_create_concept(conn: &Connection, concept: &ProblemConcept) -> Result<(), EngineError> {
    conn.execute(
        "INSERT INTO concepts (
            id, canonical_statement, domain, status, assumptions_json, constraints_json,
            datasets_json, metrics_json, verified_baselines_json, claimed_baselines_json,
            synthesis_method, synthesis_model_id, synthesized_at, synthesizer_id,
            human_edited, version, mention_count, paper_count, first_mentioned_year,
            last_mentioned_year, last_refined_at_count, embedding, created_at
        ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21,?22,?23)",
        params![
            concept.id,
            concept.canonical_statement,
            concept.domain,
            enum_to_text(&concept.status)?,
            json_to_text(&concept.assumptions)?,
            json_to_text(&concept.constraints)?,
            json_to_text(&concept.datasets)?,
            json_to_text(&concept.metrics)?,
            json_to_text(&concept.verified_baselines)?,
            json_to_text(&concept.claimed_baselines)?,
            concept.synthesis.as_ref().map(|s| s.method.clone()),
            concept.synthesis.as_ref().and_then(|s| s.model_id.clone()),
            concept.synthesis.as_ref().map(|s| rfc3339(s.synthesized_at)),
            concept.synthesis.as_ref().map(|s| s.synthesizer_id.clone()),
            concept.human_edited as i64,
            concept.version,
            concept.mention_count,
            concept.paper_count,
            concept.first_mentioned_year,
            concept.last_mentioned_year,
            concept.last_refined_at_count,
            embedding_to_blob(&concept.embedding),
            rfc3339(concept.created_at),
        ],
    )
    .map_err(db_err)?;
    exec_record_concept_version(conn, concept)?;
    Ok(())
}

fn exec_save_concept(conn: &Connection, concept: &ProblemConcept) -> Result<(), EngineError> {
    let exists: bool = conn
        .query_row("SELECT 1 FROM concepts WHERE id = ?1", [&concept.id], |_| Ok(()))
        .optional()
        .map_err(db_err)?
        .is_some();

    if !exists {
        return exec_create_concept(conn, concept);
    }

    conn.execute(
        "UPDATE concepts SET
            canonical_statement=?2, domain=?3, status=?4, assumptions_json=?5, constraints_json=?6,
            datasets_json=?7, metrics_json=?8, verified_baselines_json=?9, claimed_baselines_json=?10,
            synthesis_method=?11, synthesis_model_id=?12, synthesized_at=?13, synthesizer_id=?14,
            human_edited=?15, version=?16, mention_count=?17, paper_count=?18,
            first_mentioned_year=?19, last_mentioned_year=?20, last_refined_at_count=?21, embedding=?22
        WHERE id=?1",
        params![
            concept.id,
            concept.canonical_statement,
            concept.domain,
            enum_to_text(&concept.status)?,
            json_to_text(&concept.assumptions)?,
            json_to_text(&concept.constraints)?,
            json_to_text(&concept.datasets)?,
            json_to_text(&concept.metrics)?,
            json_to_text(&concept.verified_baselines)?,
            json_to_text(&concept.claimed_baselines)?,
            concept.synthesis.as_ref().map(|s| s.method.clone()),
            concept.synthesis.as_ref().and_then(|s| s.model_id.clone()),
            concept.synthesis.as_ref().map(|s| rfc3339(s.synthesized_at)),
            concept.synthesis.as_ref().map(|s| s.synthesizer_id.clone()),
            concept.human_edited as i64,
            concept.version,
            concept.mention_count,
            concept.paper_count,
            concept.first_mentioned_year,
            concept.last_mentioned_year,
            concept.last_refined_at_count,
            embedding_to_blob(&concept.embedding),
        ],
    )
    .map_err(db_err)?;
    exec_record_concept_version(conn, concept)?;
    Ok(())
}

fn exec_save_mention(conn: &Connection, mention: &ProblemMention) -> Result<(), EngineError> {
    let exists: bool = conn
        .query_row("SELECT 1 FROM mentions WHERE id = ?1", [&mention.id], |_| Ok(()))
        .optional()
        .map_err(db_err)?
        .is_some();

    let match_confidence = mention.match_confidence.as_ref().map(enum_to_text).transpose()?;
    let match_method = mention.match_method.as_ref().map(enum_to_text).transpose()?;

    if exists {
        conn.execute(
            "UPDATE mentions SET
                statement=?2, paper_id=?3, section=?4, source_text=?5, domain=?6,
                assumptions_json=?7, constraints_json=?8, datasets_json=?9, metrics_json=?10,
                baselines_json=?11, extractor_version=?12, extraction_model_id=?13,
                extraction_confidence=?14, reviewer_id=?15, embedding=?16, concept_id=?17,
                match_confidence=?18, match_score=?19, match_method=?20, workflow_state=?21,
                review_status=?22
            WHERE id=?1",
            params![
                mention.id,
                mention.statement,
                mention.paper_id,
                mention.section,
                mention.source_text,
                mention.domain,
                json_to_text(&mention.assumptions)?,
                json_to_text(&mention.constraints)?,
                json_to_text(&mention.datasets)?,
                json_to_text(&mention.metrics)?,
                json_to_text(&mention.baselines)?,
                mention.extractor_version,
                mention.extraction_model_id,
                mention.extraction_confidence,
                mention.reviewer_id,
                mention.embedding.as_ref().map(|e| embedding_to_blob(e)),
                mention.concept_id,
                match_confidence,
                mention.match_score,
                match_method,
                enum_to_text(&mention.workflow_state)?,
                enum_to_text(&mention.review_status)?,
            ],
        )
        .map_err(db_err)?;
    } else {
        conn.execute(
            "INSERT INTO mentions (
                id, statement, paper_id, section, source_text, domain, assumptions_json,
                constraints_json, datasets_json, metrics_json, baselines_json, extractor_version,
                extraction_model_id, extraction_confidence, reviewer_id, embedding, concept_id,
                match_confidence, match_score, match_method, workflow_state, review_status, created_at
            ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21,?22,?23)",
            params![
                mention.id,
                mention.statement,
                mention.paper_id,
                mention.section,
                mention.source_text,
                mention.domain,
                json_to_text(&mention.assumptions)?,
                json_to_text(&mention.constraints)?,
                json_to_text(&mention.datasets)?,
                json_to_text(&mention.metrics)?,
                json_to_text(&mention.baselines)?,
                mention.extractor_version,
                mention.extraction_model_id,
                mention.extraction_confidence,
                mention.reviewer_id,
                mention.embedding.as_ref().map(|e| embedding_to_blob(e)),
                mention.concept_id,
                match_confidence,
                mention.match_score,
                match_method,
                enum_to_text(&mention.workflow_state)?,
                enum_to_text(&mention.review_status)?,
                rfc3339(mention.created_at),
            ],
        )
        .map_err(db_err)?;
    }
    Ok(())
}

/// Upserts the mention's outgoing edge (I4: at most one per mention — a
/// reprocess/reroute replaces rather than duplicates it).
fn exec_create_instance_of_edge(conn: &Connection, mention_id: &str, concept_id: &str) -> Result<(), EngineError> {
    conn.execute(
        "INSERT INTO instance_of_edges (mention_id, concept_id, matched_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(mention_id) DO UPDATE SET concept_id = excluded.concept_id, matched_at = excluded.matched_at",
        params![mention_id, concept_id, rfc3339(Utc::now())],
    )
    .map_err(db_err)?;
    Ok(())
}

fn exec_get_mention(conn: &Connection, id: &str) -> Result<Option<ProblemMention>, EngineError> {
    conn.query_row("SELECT * FROM mentions WHERE id = ?1", [id], mention_from_row)
        .optional()
        .map_err(db_err)
}

/// Removes `mention_id`'s outgoing edge, returning the concept id it pointed
/// to so the caller can recompute that concept's aggregates afterward.
fn exec_remove_instance_of_edge(conn: &Connection, mention_id: &str) -> Result<Option<String>, EngineError> {
    let concept_id: Option<String> = conn
        .query_row(
            "SELECT concept_id FROM instance_of_edges WHERE mention_id = ?1",
            [mention_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(db_err)?;
    if let Some(concept_id) = &concept_id {
        conn.execute("DELETE FROM instance_of_edges WHERE mention_id = ?1", [mention_id])
            .map_err(db_err)?;
        let _ = concept_id;
    }
    Ok(concept_id)
}

/// Recomputes `mention_count`/`paper_count`/`first_mentioned_year`/
/// `last_mentioned_year` directly from `instance_of_edges`, replacing
/// whatever the row currently holds rather than incrementing it.
fn exec_recompute_concept_aggregates(conn: &Connection, concept_id: &str) -> Result<(), EngineError> {
    conn.execute(
        "UPDATE concepts SET
            mention_count = (
                SELECT COUNT(*) FROM instance_of_edges WHERE concept_id = ?1
            ),
            paper_count = (
                SELECT COUNT(DISTINCT m.paper_id) FROM mentions m
                JOIN instance_of_edges e ON e.mention_id = m.id
                WHERE e.concept_id = ?1
            ),
            first_mentioned_year = (
                SELECT MIN(p.year) FROM papers p
                JOIN mentions m ON m.paper_id = p.id
                JOIN instance_of_edges e ON e.mention_id = m.id
                WHERE e.concept_id = ?1
            ),
            last_mentioned_year = (
                SELECT MAX(p.year) FROM papers p
                JOIN mentions m ON m.paper_id = p.id
                JOIN instance_of_edges e ON e.mention_id = m.id
                WHERE e.concept_id = ?1
            )
        WHERE id = ?1",
        [concept_id],
    )
    .map_err(db_err)?;
    Ok(())
}

fn exec_increment_concept_mention_count(
    conn: &Connection,
    concept_id: &str,
    mention_paper_year: Option<i32>,
) -> Result<(), EngineError> {
    conn.execute(
        "UPDATE concepts SET
            mention_count = mention_count + 1,
            first_mentioned_year = CASE
                WHEN first_mentioned_year IS NULL THEN ?2
                WHEN ?2 IS NOT NULL AND ?2 < first_mentioned_year THEN ?2
                ELSE first_mentioned_year END,
            last_mentioned_year = CASE
                WHEN last_mentioned_year IS NULL THEN ?2
                WHEN ?2 IS NOT NULL AND ?2 > last_mentioned_year THEN ?2
                ELSE last_mentioned_year END
        WHERE id = ?1",
        params![concept_id, mention_paper_year],
    )
    .map_err(db_err)?;

    conn.execute(
        "UPDATE concepts SET paper_count = (
            SELECT COUNT(DISTINCT m.paper_id) FROM mentions m
            JOIN instance_of_edges e ON e.mention_id = m.id
            WHERE e.concept_id = ?1
        ) WHERE id = ?1",
        [concept_id],
    )
    .map_err(db_err)?;
    Ok(())
}

fn exec_save_work_item(conn: &Connection, work_item: &WorkItem, now: DateTime<Utc>) -> Result<(), EngineError> {
    let exists: bool = conn
        .query_row("SELECT 1 FROM work_items WHERE id = ?1", [&work_item.id], |_| Ok(()))
        .optional()
        .map_err(db_err)?
        .is_some();

    if exists {
        conn.execute(
            "UPDATE work_items SET
                trace_id=?2, mention_id=?3, current_state=?4, history_json=?5,
                candidate_concepts_json=?6, selected_concept_id=?7, priority=?8, sla_deadline=?9,
                retry_count=?10, max_retries=?11, last_error=?12, checkpoint_ids_json=?13,
                assigned_reviewer_id=?14, assigned_at=?15, updated_at=?16
            WHERE id=?1",
            params![
                work_item.id,
                work_item.trace_id,
                work_item.mention_id,
                enum_to_text(&work_item.current_state)?,
                json_to_text(&work_item.history)?,
                json_to_text(&work_item.candidate_concepts)?,
                work_item.selected_concept_id,
                work_item.priority as i64,
                work_item.sla_deadline.map(rfc3339),
                work_item.retry_count as i64,
                work_item.max_retries as i64,
                work_item.last_error,
                json_to_text(&work_item.checkpoint_ids)?,
                work_item.assigned_reviewer_id,
                work_item.assigned_at.map(rfc3339),
                rfc3339(now),
            ],
        )
        .map_err(db_err)?;
    } else {
        conn.execute(
            "INSERT INTO work_items (
                id, trace_id, mention_id, current_state, history_json, candidate_concepts_json,
                selected_concept_id, priority, sla_deadline, retry_count, max_retries, last_error,
                checkpoint_ids_json, assigned_reviewer_id, assigned_at, updated_at
            ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16)",
            params![
                work_item.id,
                work_item.trace_id,
                work_item.mention_id,
                enum_to_text(&work_item.current_state)?,
                json_to_text(&work_item.history)?,
                json_to_text(&work_item.candidate_concepts)?,
                work_item.selected_concept_id,
                work_item.priority as i64,
                work_item.sla_deadline.map(rfc3339),
                work_item.retry_count as i64,
                work_item.max_retries as i64,
                work_item.last_error,
                json_to_text(&work_item.checkpoint_ids)?,
                work_item.assigned_reviewer_id,
                work_item.assigned_at.map(rfc3339),
                rfc3339(now),
            ],
        )
        .map_err(db_err)?;
    }
    Ok(())
}

fn exec_paper_year(conn: &Connection, paper_id: &str) -> Result<Option<i32>, EngineError> {
    // `year` is nullable (most papers are created with `year = None` up
    // front), so the row itself always exists but its `year` column may be
    // NULL - flatten the "row missing" and "year column NULL" cases together.
    conn.query_row("SELECT year FROM papers WHERE id = ?1", [paper_id], |row| {
        row.get::<_, Option<i32>>(0)
    })
    .optional()
    .map_err(db_err)
    .map(|outer| outer.flatten())
}

// ============================================================================
// GraphTransaction
// ============================================================================

/// The transactional view handed to `with_transaction` callbacks.
struct SqliteTransaction<'conn> {
    tx: &'conn Connection,
}

impl GraphTransaction for SqliteTransaction<'_> {
    fn get_concept(&mut self, id: &str) -> Result<Option<ProblemConcept>, EngineError> {
        exec_get_concept(self.tx, id)
    }

    fn create_concept(&mut self, concept: &ProblemConcept) -> Result<(), EngineError> {
        exec_create_concept(self.tx, concept)
    }

    fn create_instance_of_edge(&mut self, mention_id: &str, concept_id: &str) -> Result<(), EngineError> {
        exec_create_instance_of_edge(self.tx, mention_id, concept_id)
    }

    fn remove_instance_of_edge(&mut self, mention_id: &str) -> Result<Option<String>, EngineError> {
        exec_remove_instance_of_edge(self.tx, mention_id)
    }

    fn increment_concept_mention_count(
        &mut self,
        concept_id: &str,
        mention_paper_year: Option<i32>,
    ) -> Result<(), EngineError> {
        exec_increment_concept_mention_count(self.tx, concept_id, mention_paper_year)
    }

    fn recompute_concept_aggregates(&mut self, concept_id: &str) -> Result<(), EngineError> {
        exec_recompute_concept_aggregates(self.tx, concept_id)
    }

    fn get_mention(&mut self, id: &str) -> Result<Option<ProblemMention>, EngineError> {
        exec_get_mention(self.tx, id)
    }

    fn save_mention(&mut self, mention: &ProblemMention) -> Result<(), EngineError> {
        exec_save_mention(self.tx, mention)
    }

    fn save_work_item(&mut self, work_item: &WorkItem) -> Result<(), EngineError> {
        exec_save_work_item(self.tx, work_item, Utc::now())
    }

    fn paper_year(&mut self, paper_id: &str) -> Result<Option<i32>, EngineError> {
        exec_paper_year(self.tx, paper_id)
    }
}

// ============================================================================
// SqliteGraphStore
// ============================================================================

/// The SQLite-backed graph store. One instance per process; `:memory:` for
/// tests (each test gets its own isolated database), a file path in
/// production.
pub struct SqliteGraphStore {
    conn: Mutex<Connection>,
}

impl SqliteGraphStore {
    /// Open (and migrate) a database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let conn = Connection::open(path).map_err(db_err)?;
        Self::from_connection(conn)
    }

    /// Open an in-memory database, migrated fresh. Used by tests.
    pub fn open_in_memory() -> Result<Self, EngineError> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, EngineError> {
        configure_connection(&conn).map_err(db_err)?;
        apply_migrations(&conn).map_err(|e| EngineError::Storage(StorageError::Migration(e.to_string())))?;
        Ok(Self { conn: Mutex::new(conn) })
    }
}

impl GraphStore for SqliteGraphStore {
    fn with_transaction(
        &self,
        f: &mut dyn FnMut(&mut dyn GraphTransaction) -> Result<(), EngineError>,
    ) -> Result<(), EngineError> {
        let mut guard = self.conn.lock().expect("graph store mutex poisoned");
        let tx = guard.transaction().map_err(db_err)?;
        let mut wrapper = SqliteTransaction { tx: &tx };
        let result = f(&mut wrapper);
        match result {
            Ok(()) => {
                tx.commit().map_err(db_err)?;
                Ok(())
            }
            Err(e) => {
                let _ = tx.rollback();
                Err(e)
            }
        }
    }

    fn create_mention(&self, mention: &ProblemMention) -> Result<(), EngineError> {
        let conn = self.conn.lock().expect("graph store mutex poisoned");
        exec_save_mention(&conn, mention)
    }

    fn save_mention(&self, mention: &ProblemMention) -> Result<(), EngineError> {
        let conn = self.conn.lock().expect("graph store mutex poisoned");
        exec_save_mention(&conn, mention)
    }

    fn get_mention(&self, id: &str) -> Result<Option<ProblemMention>, EngineError> {
        let conn = self.conn.lock().expect("graph store mutex poisoned");
        conn.query_row("SELECT * FROM mentions WHERE id = ?1", [id], mention_from_row)
            .optional()
            .map_err(db_err)
    }

    fn list_mentions_for_concept(&self, concept_id: &str) -> Result<Vec<ProblemMention>, EngineError> {
        let conn = self.conn.lock().expect("graph store mutex poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT m.* FROM mentions m
                 JOIN instance_of_edges e ON e.mention_id = m.id
                 WHERE e.concept_id = ?1 ORDER BY m.created_at ASC",
            )
            .map_err(db_err)?;
        let rows = stmt.query_map([concept_id], mention_from_row).map_err(db_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(db_err)
    }

    fn get_concept(&self, id: &str) -> Result<Option<ProblemConcept>, EngineError> {
        let conn = self.conn.lock().expect("graph store mutex poisoned");
        exec_get_concept(&conn, id)
    }

    fn save_concept(&self, concept: &ProblemConcept) -> Result<(), EngineError> {
        let conn = self.conn.lock().expect("graph store mutex poisoned");
        exec_save_concept(&conn, concept)
    }

    fn list_concepts(&self) -> Result<Vec<ProblemConcept>, EngineError> {
        let conn = self.conn.lock().expect("graph store mutex poisoned");
        let mut stmt = conn.prepare("SELECT * FROM concepts").map_err(db_err)?;
        let rows = stmt.query_map([], concept_from_row).map_err(db_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(db_err)
    }

    fn get_concept_version(
        &self,
        concept_id: &str,
        version: i64,
    ) -> Result<Option<ConceptVersionSnapshot>, EngineError> {
        let conn = self.conn.lock().expect("graph store mutex poisoned");
        exec_get_concept_version(&conn, concept_id, version)
    }

    fn create_paper(&self, paper_id: &str, year: Option<i32>) -> Result<(), EngineError> {
        let conn = self.conn.lock().expect("graph store mutex poisoned");
        conn.execute(
            "INSERT INTO papers (id, year) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET year = COALESCE(excluded.year, papers.year)",
            params![paper_id, year],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn paper_year(&self, paper_id: &str) -> Result<Option<i32>, EngineError> {
        let conn = self.conn.lock().expect("graph store mutex poisoned");
        exec_paper_year(&conn, paper_id)
    }

    fn record_citation(&self, citing_paper_id: &str, cited_paper_id: &str) -> Result<(), EngineError> {
        let conn = self.conn.lock().expect("graph store mutex poisoned");
        conn.execute(
            "INSERT OR IGNORE INTO citations (citing_paper_id, cited_paper_id) VALUES (?1, ?2)",
            params![citing_paper_id, cited_paper_id],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn cited_paper_ids(&self, paper_id: &str) -> Result<Vec<String>, EngineError> {
        let conn = self.conn.lock().expect("graph store mutex poisoned");
        let mut stmt = conn
            .prepare("SELECT cited_paper_id FROM citations WHERE citing_paper_id = ?1")
            .map_err(db_err)?;
        let rows = stmt.query_map([paper_id], |row| row.get::<_, String>(0)).map_err(db_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(db_err)
    }

    fn papers_with_mentions_of(&self, concept_id: &str) -> Result<Vec<String>, EngineError> {
        let conn = self.conn.lock().expect("graph store mutex poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT DISTINCT m.paper_id FROM mentions m
                 JOIN instance_of_edges e ON e.mention_id = m.id
                 WHERE e.concept_id = ?1",
            )
            .map_err(db_err)?;
        let rows = stmt.query_map([concept_id], |row| row.get::<_, String>(0)).map_err(db_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(db_err)
    }

    fn create_work_item(&self, work_item: &WorkItem) -> Result<(), EngineError> {
        let conn = self.conn.lock().expect("graph store mutex poisoned");
        exec_save_work_item(&conn, work_item, Utc::now())
    }

    fn save_work_item(&self, work_item: &WorkItem) -> Result<(), EngineError> {
        let conn = self.conn.lock().expect("graph store mutex poisoned");
        exec_save_work_item(&conn, work_item, Utc::now())
    }

    fn get_work_item(&self, id: &str) -> Result<Option<WorkItem>, EngineError> {
        let conn = self.conn.lock().expect("graph store mutex poisoned");
        conn.query_row("SELECT * FROM work_items WHERE id = ?1", [id], work_item_from_row)
            .optional()
            .map_err(db_err)
    }

    fn list_stuck_work_items(&self, older_than: DateTime<Utc>) -> Result<Vec<WorkItem>, EngineError> {
        let conn = self.conn.lock().expect("graph store mutex poisoned");
        let terminal = [
            enum_to_text(&WorkflowState::AutoLinked)?,
            enum_to_text(&WorkflowState::CreateNewConcept)?,
            enum_to_text(&WorkflowState::Cancelled)?,
        ];
        let mut stmt = conn
            .prepare(
                "SELECT * FROM work_items
                 WHERE updated_at < ?1 AND current_state NOT IN (?2, ?3, ?4)",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(
                params![rfc3339(older_than), terminal[0], terminal[1], terminal[2]],
                work_item_from_row,
            )
            .map_err(db_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(db_err)
    }

    fn try_claim_work_item(&self, work_item_id: &str, holder: &str) -> Result<bool, EngineError> {
        let conn = self.conn.lock().expect("graph store mutex poisoned");
        let now = rfc3339(Utc::now());
        let changed = conn
            .execute(
                "INSERT OR IGNORE INTO work_item_locks (work_item_id, holder, claimed_at) VALUES (?1, ?2, ?3)",
                params![work_item_id, holder, now],
            )
            .map_err(db_err)?;
        if changed == 1 {
            return Ok(true);
        }
        let existing: Option<String> = conn
            .query_row(
                "SELECT holder FROM work_item_locks WHERE work_item_id = ?1",
                [work_item_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        Ok(existing.as_deref() == Some(holder))
    }

    fn release_work_item_claim(&self, work_item_id: &str, holder: &str) -> Result<(), EngineError> {
        let conn = self.conn.lock().expect("graph store mutex poisoned");
        conn.execute(
            "DELETE FROM work_item_locks WHERE work_item_id = ?1 AND holder = ?2",
            params![work_item_id, holder],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), EngineError> {
        let conn = self.conn.lock().expect("graph store mutex poisoned");
        conn.execute(
            "INSERT INTO checkpoints (id, trace_id, stage, work_item_snapshot_json, stage_output_json, created_at)
             VALUES (?1,?2,?3,?4,?5,?6)
             ON CONFLICT(id) DO UPDATE SET stage_output_json = excluded.stage_output_json",
            params![
                checkpoint.id,
                checkpoint.trace_id,
                checkpoint.stage,
                json_to_text(&checkpoint.work_item_snapshot)?,
                checkpoint.stage_output.as_ref().map(json_to_text).transpose()?,
                rfc3339(checkpoint.created_at),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn get_checkpoint(&self, id: &str) -> Result<Option<Checkpoint>, EngineError> {
        let conn = self.conn.lock().expect("graph store mutex poisoned");
        conn.query_row("SELECT * FROM checkpoints WHERE id = ?1", [id], checkpoint_from_row)
            .optional()
            .map_err(db_err)
    }

    fn list_checkpoints_for_trace(&self, trace_id: &str) -> Result<Vec<Checkpoint>, EngineError> {
        let conn = self.conn.lock().expect("graph store mutex poisoned");
        let mut stmt = conn
            .prepare("SELECT * FROM checkpoints WHERE trace_id = ?1 ORDER BY created_at ASC")
            .map_err(db_err)?;
        let rows = stmt.query_map([trace_id], checkpoint_from_row).map_err(db_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(db_err)
    }

    fn latest_checkpoint_before(
        &self,
        trace_id: &str,
        before: DateTime<Utc>,
    ) -> Result<Option<Checkpoint>, EngineError> {
        let conn = self.conn.lock().expect("graph store mutex poisoned");
        conn.query_row(
            "SELECT * FROM checkpoints WHERE trace_id = ?1 AND created_at < ?2
             ORDER BY created_at DESC LIMIT 1",
            params![trace_id, rfc3339(before)],
            checkpoint_from_row,
        )
        .optional()
        .map_err(db_err)
    }

    fn save_pending_review(&self, review: &PendingReview) -> Result<(), EngineError> {
        let conn = self.conn.lock().expect("graph store mutex poisoned");
        conn.execute(
            "INSERT INTO pending_reviews (
                id, work_item_id, mention_id, suggested_concepts_json, agent_artefacts_json,
                escalation_reason, domain, match_confidence, candidate_mention_count, priority,
                sla_deadline, assigned_to, assigned_at, resolution, resolved_by, resolved_at, created_at
            ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17)
            ON CONFLICT(id) DO UPDATE SET
                assigned_to=excluded.assigned_to, assigned_at=excluded.assigned_at,
                resolution=excluded.resolution, resolved_by=excluded.resolved_by,
                resolved_at=excluded.resolved_at, priority=excluded.priority,
                sla_deadline=excluded.sla_deadline",
            params![
                review.id,
                review.work_item_id,
                review.mention_id,
                json_to_text(&review.suggested_concepts)?,
                json_to_text(&review.agent_artefacts)?,
                review.escalation_reason,
                review.domain,
                review.match_confidence,
                review.candidate_mention_count,
                review.priority as i64,
                rfc3339(review.sla_deadline),
                review.assigned_to,
                review.assigned_at.map(rfc3339),
                review.resolution.as_ref().map(enum_to_text).transpose()?,
                review.resolved_by,
                review.resolved_at.map(rfc3339),
                rfc3339(review.created_at),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn get_pending_review(&self, id: &str) -> Result<Option<PendingReview>, EngineError> {
        let conn = self.conn.lock().expect("graph store mutex poisoned");
        conn.query_row("SELECT * FROM pending_reviews WHERE id = ?1", [id], pending_review_from_row)
            .optional()
            .map_err(db_err)
    }

    fn try_resolve_pending_review(
        &self,
        id: &str,
        reviewer_id: &str,
        decision: ResolutionDecision,
        now: DateTime<Utc>,
    ) -> Result<Option<(PendingReview, bool)>, EngineError> {
        let mut guard = self.conn.lock().expect("graph store mutex poisoned");
        let tx = guard.transaction().map_err(db_err)?;

        // UPDATE only applies (and only the first caller wins) while
        // resolution is still NULL, so two concurrent resolves of the same
        // review can't both apply their side effect in Engine::resolve.
        let changed = tx
            .execute(
                "UPDATE pending_reviews SET resolution = ?2, resolved_by = ?3, resolved_at = ?4
                 WHERE id = ?1 AND resolution IS NULL",
                params![id, enum_to_text(&decision)?, reviewer_id, rfc3339(now)],
            )
            .map_err(db_err)?;

        let review = tx
            .query_row("SELECT * FROM pending_reviews WHERE id = ?1", [id], pending_review_from_row)
            .optional()
            .map_err(db_err)?;

        tx.commit().map_err(db_err)?;
        Ok(review.map(|r| (r, changed == 1)))
    }

    fn pop_highest_priority_unassigned(
        &self,
        now: DateTime<Utc>,
        lease_minutes: i64,
    ) -> Result<Option<PendingReview>, EngineError> {
        let mut guard = self.conn.lock().expect("graph store mutex poisoned");
        let tx = guard.transaction().map_err(db_err)?;
        let cutoff = rfc3339(now - chrono::Duration::minutes(lease_minutes));

        let id: Option<String> = tx
            .query_row(
                "SELECT id FROM pending_reviews
                 WHERE resolution IS NULL
                   AND (assigned_at IS NULL OR assigned_at <= ?1)
                 ORDER BY priority ASC, sla_deadline ASC LIMIT 1",
                [&cutoff],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;

        let Some(id) = id else {
            tx.commit().map_err(db_err)?;
            return Ok(None);
        };

        // Mark as claimed (assigned_at = now, assigned_to still unset) so the
        // WHERE clause's assigned_at guard hides this row from the next pop
        // until the lease lapses, even before the review-queue layer attaches
        // a reviewer id.
        tx.execute(
            "UPDATE pending_reviews SET assigned_to = NULL, assigned_at = ?2 WHERE id = ?1",
            params![id, rfc3339(now)],
        )
        .map_err(db_err)?;

        let review = tx
            .query_row("SELECT * FROM pending_reviews WHERE id = ?1", [&id], pending_review_from_row)
            .map_err(db_err)?;

        tx.commit().map_err(db_err)?;
        Ok(Some(review))
    }

    fn list_pending_reviews(&self) -> Result<Vec<PendingReview>, EngineError> {
        let conn = self.conn.lock().expect("graph store mutex poisoned");
        let mut stmt = conn
            .prepare("SELECT * FROM pending_reviews ORDER BY priority ASC, sla_deadline ASC")
            .map_err(db_err)?;
        let rows = stmt.query_map([], pending_review_from_row).map_err(db_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(db_err)
    }

    fn record_blacklist_entry(&self, entry: &BlacklistEntry) -> Result<(), EngineError> {
        let conn = self.conn.lock().expect("graph store mutex poisoned");
        conn.execute(
            "INSERT INTO blacklist_entries (
                id, mention_id, concept_id, pattern, reason, recorded_by, never_allow, created_at
            ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
            params![
                entry.id,
                entry.mention_id,
                entry.concept_id,
                entry.pattern,
                entry.reason,
                entry.recorded_by,
                entry.never_allow as i64,
                rfc3339(entry.created_at),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn is_blacklisted(&self, mention_id: &str, concept_id: &str) -> Result<bool, EngineError> {
        let conn = self.conn.lock().expect("graph store mutex poisoned");
        // Latest-entry-wins: the most recent row for this pair decides.
        let never_allow: Option<i64> = conn
            .query_row(
                "SELECT never_allow FROM blacklist_entries
                 WHERE mention_id = ?1 AND concept_id = ?2
                 ORDER BY created_at DESC LIMIT 1",
                [mention_id, concept_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        Ok(never_allow.unwrap_or(0) != 0)
    }

    fn list_blacklist_patterns(&self) -> Result<Vec<BlacklistEntry>, EngineError> {
        let conn = self.conn.lock().expect("graph store mutex poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT * FROM blacklist_entries b1
                 WHERE pattern IS NOT NULL
                   AND never_allow = 1
                   AND created_at = (
                     SELECT MAX(created_at) FROM blacklist_entries b2 WHERE b2.pattern = b1.pattern
                   )",
            )
            .map_err(db_err)?;
        let rows = stmt.query_map([], blacklist_entry_from_row).map_err(db_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(db_err)
    }
}
