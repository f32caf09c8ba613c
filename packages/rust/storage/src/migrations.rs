//! SQL migration definitions for the CourseWatch database.
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
    vec![
        Migration {
            version: 1,
            description: "Initial schema: catalog, session_cookies",
            sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Last-seen state of every content item, replaced wholesale on commit
CREATE TABLE IF NOT EXISTS catalog (
    id           TEXT PRIMARY KEY,
    title        TEXT NOT NULL,
    content_kind TEXT NOT NULL,
    committed_at TEXT NOT NULL
);

-- Browser session cookies, in the order the driver reported them
CREATE TABLE IF NOT EXISTS session_cookies (
    position    INTEGER PRIMARY KEY,
    cookie_json TEXT NOT NULL,
    saved_at    TEXT NOT NULL
);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Cycle history",
            sql: r#"
CREATE TABLE IF NOT EXISTS cycle_runs (
    id          TEXT PRIMARY KEY,
    started_at  TEXT NOT NULL,
    finished_at TEXT NOT NULL,
    outcome     TEXT NOT NULL,
    items       INTEGER,
    events      INTEGER,
    error       TEXT
);

CREATE INDEX IF NOT EXISTS idx_cycle_runs_started ON cycle_runs(started_at);

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
    ]
}
