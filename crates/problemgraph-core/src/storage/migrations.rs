//! Database migrations
//!
//! Applied in order against a fresh or existing connection by
//! `SqliteGraphStore::open`. Each entry is a single SQL batch executed with
//! `Connection::execute_batch`; there is no down-migration since the engine
//! only ever runs forward.

/// A database migration.
#[derive(Debug, Clone)]
pub struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub up: &'static str,
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "papers and citation edges",
        up: MIGRATION_V1_UP,
    },
    Migration {
        version: 2,
        description: "concepts",
        up: MIGRATION_V2_UP,
    },
    Migration {
        version: 3,
        description: "mentions",
        up: MIGRATION_V3_UP,
    },
    Migration {
        version: 4,
        description: "instance_of edges",
        up: MIGRATION_V4_UP,
    },
    Migration {
        version: 5,
        description: "work items, history, claim locks",
        up: MIGRATION_V5_UP,
    },
    Migration {
        version: 6,
        description: "checkpoints",
        up: MIGRATION_V6_UP,
    },
    Migration {
        version: 7,
        description: "review queue",
        up: MIGRATION_V7_UP,
    },
    Migration {
        version: 8,
        description: "blacklist entries",
        up: MIGRATION_V8_UP,
    },
    Migration {
        version: 9,
        description: "concept version history",
        up: MIGRATION_V9_UP,
    },
    Migration {
        version: 10,
        description: "pending review aging inputs",
        up: MIGRATION_V10_UP,
    },
];

const MIGRATION_V1_UP: &str = r#"
CREATE TABLE IF NOT EXISTS papers (
    id   TEXT PRIMARY KEY,
    year INTEGER
);

CREATE TABLE IF NOT EXISTS citations (
    citing_paper_id TEXT NOT NULL,
    cited_paper_id  TEXT NOT NULL,
    PRIMARY KEY (citing_paper_id, cited_paper_id)
);
CREATE INDEX IF NOT EXISTS idx_citations_citing ON citations(citing_paper_id);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL
);

INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, datetime('now'));
"#;

const MIGRATION_V2_UP: &str = r#"
CREATE TABLE IF NOT EXISTS concepts (
    id                       TEXT PRIMARY KEY,
    canonical_statement      TEXT NOT NULL,
    domain                   TEXT NOT NULL,
    status                   TEXT NOT NULL,
    assumptions_json         TEXT NOT NULL DEFAULT '[]',
    constraints_json         TEXT NOT NULL DEFAULT '[]',
    datasets_json            TEXT NOT NULL DEFAULT '[]',
    metrics_json             TEXT NOT NULL DEFAULT '[]',
    verified_baselines_json  TEXT NOT NULL DEFAULT '[]',
    claimed_baselines_json   TEXT NOT NULL DEFAULT '[]',
    synthesis_method         TEXT,
    synthesis_model_id       TEXT,
    synthesized_at           TEXT,
    synthesizer_id           TEXT,
    human_edited             INTEGER NOT NULL DEFAULT 0,
    version                  INTEGER NOT NULL DEFAULT 1,
    mention_count            INTEGER NOT NULL DEFAULT 0,
    paper_count              INTEGER NOT NULL DEFAULT 0,
    first_mentioned_year     INTEGER,
    last_mentioned_year      INTEGER,
    last_refined_at_count    INTEGER NOT NULL DEFAULT 0,
    embedding                BLOB NOT NULL,
    created_at               TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_concepts_domain ON concepts(domain);
CREATE INDEX IF NOT EXISTS idx_concepts_status ON concepts(status);

UPDATE schema_version SET version = 2, applied_at = datetime('now');
"#;

const MIGRATION_V3_UP: &str = r#"
CREATE TABLE IF NOT EXISTS mentions (
    id                     TEXT PRIMARY KEY,
    statement              TEXT NOT NULL,
    paper_id               TEXT NOT NULL,
    section                TEXT NOT NULL,
    source_text            TEXT NOT NULL,
    domain                 TEXT NOT NULL,
    assumptions_json       TEXT NOT NULL DEFAULT '[]',
    constraints_json       TEXT NOT NULL DEFAULT '[]',
    datasets_json          TEXT NOT NULL DEFAULT '[]',
    metrics_json           TEXT NOT NULL DEFAULT '[]',
    baselines_json         TEXT NOT NULL DEFAULT '[]',
    extractor_version      TEXT NOT NULL,
    extraction_model_id    TEXT NOT NULL,
    extraction_confidence  REAL NOT NULL,
    reviewer_id            TEXT,
    embedding              BLOB,
    concept_id             TEXT,
    match_confidence       TEXT,
    match_score            REAL,
    match_method           TEXT,
    workflow_state         TEXT NOT NULL,
    review_status          TEXT NOT NULL,
    created_at             TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_mentions_paper ON mentions(paper_id);
CREATE INDEX IF NOT EXISTS idx_mentions_workflow_state ON mentions(workflow_state);
CREATE INDEX IF NOT EXISTS idx_mentions_concept ON mentions(concept_id);

UPDATE schema_version SET version = 3, applied_at = datetime('now');
"#;

const MIGRATION_V4_UP: &str = r#"
-- One row per mention: I4 (a mention has at most one outgoing INSTANCE_OF edge).
-- Confidence band and match method live on the mention row itself
-- (`mentions.match_confidence` / `mentions.match_method`); this table is the
-- edge proper, kept separate so concept-scoped lookups don't need a self-join.
CREATE TABLE IF NOT EXISTS instance_of_edges (
    mention_id      TEXT PRIMARY KEY,
    concept_id      TEXT NOT NULL,
    matched_at      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_instance_of_concept ON instance_of_edges(concept_id);

UPDATE schema_version SET version = 4, applied_at = datetime('now');
"#;

const MIGRATION_V5_UP: &str = r#"
CREATE TABLE IF NOT EXISTS work_items (
    id                      TEXT PRIMARY KEY,
    trace_id                TEXT NOT NULL,
    mention_id              TEXT NOT NULL,
    current_state           TEXT NOT NULL,
    history_json            TEXT NOT NULL DEFAULT '[]',
    candidate_concepts_json TEXT NOT NULL DEFAULT '[]',
    selected_concept_id     TEXT,
    priority                INTEGER NOT NULL,
    sla_deadline            TEXT,
    retry_count             INTEGER NOT NULL DEFAULT 0,
    max_retries             INTEGER NOT NULL,
    last_error              TEXT,
    checkpoint_ids_json     TEXT NOT NULL DEFAULT '[]',
    assigned_reviewer_id    TEXT,
    assigned_at             TEXT,
    updated_at              TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_work_items_state ON work_items(current_state);
CREATE INDEX IF NOT EXISTS idx_work_items_trace ON work_items(trace_id);
CREATE INDEX IF NOT EXISTS idx_work_items_updated ON work_items(updated_at);

-- Advisory per-work-item claim: at most one active stage per work item (§5).
CREATE TABLE IF NOT EXISTS work_item_locks (
    work_item_id TEXT PRIMARY KEY,
    holder       TEXT NOT NULL,
    claimed_at   TEXT NOT NULL
);

UPDATE schema_version SET version = 5, applied_at = datetime('now');
"#;

const MIGRATION_V6_UP: &str = r#"
CREATE TABLE IF NOT EXISTS checkpoints (
    id                      TEXT PRIMARY KEY,
    trace_id                TEXT NOT NULL,
    stage                   TEXT NOT NULL,
    work_item_snapshot_json TEXT NOT NULL,
    stage_output_json       TEXT,
    created_at              TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_checkpoints_trace ON checkpoints(trace_id);
CREATE INDEX IF NOT EXISTS idx_checkpoints_created ON checkpoints(created_at);

UPDATE schema_version SET version = 6, applied_at = datetime('now');
"#;

const MIGRATION_V7_UP: &str = r#"
CREATE TABLE IF NOT EXISTS pending_reviews (
    id                       TEXT PRIMARY KEY,
    work_item_id             TEXT NOT NULL,
    mention_id               TEXT NOT NULL,
    suggested_concepts_json  TEXT NOT NULL DEFAULT '[]',
    agent_artefacts_json     TEXT NOT NULL DEFAULT 'null',
    escalation_reason        TEXT NOT NULL,
    priority                 INTEGER NOT NULL,
    sla_deadline             TEXT NOT NULL,
    assigned_to              TEXT,
    assigned_at              TEXT,
    resolution               TEXT,
    resolved_by              TEXT,
    resolved_at              TEXT,
    created_at               TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_pending_reviews_priority ON pending_reviews(priority, sla_deadline);
CREATE INDEX IF NOT EXISTS idx_pending_reviews_resolution ON pending_reviews(resolution);

UPDATE schema_version SET version = 7, applied_at = datetime('now');
"#;

const MIGRATION_V8_UP: &str = r#"
-- Append-only; a later row with never_allow = 0 for the same
-- (mention_id, concept_id) key supersedes an earlier interdiction.
CREATE TABLE IF NOT EXISTS blacklist_entries (
    id           TEXT PRIMARY KEY,
    mention_id   TEXT,
    concept_id   TEXT,
    pattern      TEXT,
    reason       TEXT NOT NULL,
    recorded_by  TEXT,
    never_allow  INTEGER NOT NULL DEFAULT 1,
    created_at   TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_blacklist_pair ON blacklist_entries(mention_id, concept_id, created_at);
CREATE INDEX IF NOT EXISTS idx_blacklist_pattern ON blacklist_entries(pattern, created_at);

UPDATE schema_version SET version = 8, applied_at = datetime('now');
"#;

const MIGRATION_V9_UP: &str = r#"
-- One row per committed concept version, oldest first. Populated alongside
-- every concepts insert/update so `rollback(concept_version)` has a snapshot
-- to restore from independent of the mutable concepts row.
CREATE TABLE IF NOT EXISTS concept_versions (
    concept_id               TEXT NOT NULL,
    version                  INTEGER NOT NULL,
    canonical_statement      TEXT NOT NULL,
    domain                   TEXT NOT NULL,
    assumptions_json         TEXT NOT NULL DEFAULT '[]',
    constraints_json         TEXT NOT NULL DEFAULT '[]',
    datasets_json            TEXT NOT NULL DEFAULT '[]',
    metrics_json             TEXT NOT NULL DEFAULT '[]',
    verified_baselines_json  TEXT NOT NULL DEFAULT '[]',
    claimed_baselines_json   TEXT NOT NULL DEFAULT '[]',
    embedding                BLOB NOT NULL,
    created_at               TEXT NOT NULL,
    PRIMARY KEY (concept_id, version)
);

UPDATE schema_version SET version = 9, applied_at = datetime('now');
"#;

const MIGRATION_V10_UP: &str = r#"
-- Captured at enqueue time so a later aging sweep can recompute priority
-- from compute_priority's actual inputs rather than just the clock.
ALTER TABLE pending_reviews ADD COLUMN domain TEXT NOT NULL DEFAULT '';
ALTER TABLE pending_reviews ADD COLUMN match_confidence REAL NOT NULL DEFAULT 0.0;
ALTER TABLE pending_reviews ADD COLUMN candidate_mention_count INTEGER NOT NULL DEFAULT 0;

UPDATE schema_version SET version = 10, applied_at = datetime('now');
"#;

/// Current schema version applied to `conn`, or 0 for a fresh database.
pub fn get_current_version(conn: &rusqlite::Connection) -> rusqlite::Result<u32> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
    .or(Ok(0))
}

/// Apply every migration newer than the database's current version.
pub fn apply_migrations(conn: &rusqlite::Connection) -> rusqlite::Result<u32> {
    let current_version = get_current_version(conn)?;
    let mut applied = 0;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                description = migration.description,
                "applying migration"
            );
            conn.execute_batch(migration.up)?;
            applied += 1;
        }
    }

    Ok(applied)
}
