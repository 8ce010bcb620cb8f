//! SQL migration definitions for the run state database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial schema: runs, resources, unit_events, errors",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One row per run directory
CREATE TABLE IF NOT EXISTS runs (
    run_id           TEXT PRIMARY KEY,
    course_url       TEXT NOT NULL,
    status           TEXT NOT NULL,
    stage_cursor     TEXT,
    listing_complete INTEGER NOT NULL DEFAULT 0,
    created_at       TEXT NOT NULL,
    updated_at       TEXT NOT NULL
);

-- Resources in crawl-discovery order (seq)
CREATE TABLE IF NOT EXISTS resources (
    seq          INTEGER PRIMARY KEY AUTOINCREMENT,
    id           TEXT NOT NULL UNIQUE,
    kind         TEXT NOT NULL,
    title        TEXT NOT NULL,
    parent_id    TEXT,
    visibility   TEXT NOT NULL,
    source_ref   TEXT NOT NULL,
    content_hash TEXT
);

-- Append-only per-unit transitions; the latest row per (stage, resource) wins
CREATE TABLE IF NOT EXISTS unit_events (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    resource_id TEXT NOT NULL,
    stage       TEXT NOT NULL,
    state       TEXT NOT NULL,
    attempt     INTEGER NOT NULL DEFAULT 0,
    detail      TEXT,
    recorded_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_unit_events_unit ON unit_events(stage, resource_id);

-- Error log (resource-level and stage-level)
CREATE TABLE IF NOT EXISTS errors (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    resource_id TEXT,
    stage       TEXT NOT NULL,
    kind        TEXT NOT NULL,
    message     TEXT NOT NULL,
    recorded_at TEXT NOT NULL
);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
