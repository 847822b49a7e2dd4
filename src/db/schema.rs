//! SQL DDL for all Branchline tables.
//!
//! Defines the `conversations`, `branches`, `messages`, `branch_facts`,
//! `routing_log`, and `schema_meta` tables. All DDL uses `IF NOT EXISTS`
//! for idempotent initialization. Centroids and fact entry histories are
//! stored as JSON text — the engine never searches them, only reads and
//! rewrites whole values.

use rusqlite::Connection;

/// All schema DDL statements for Branchline's core tables.
const SCHEMA_SQL: &str = r#"
-- One row per user-facing chat session
CREATE TABLE IF NOT EXISTS conversations (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    active_branch_id TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_conversations_tenant ON conversations(tenant_id);

-- Topic-coherent segments of a conversation
CREATE TABLE IF NOT EXISTS branches (
    id TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
    parent_id TEXT,
    topic TEXT NOT NULL,
    context TEXT,
    message_count INTEGER NOT NULL DEFAULT 0,
    centroid TEXT NOT NULL DEFAULT '[]',
    depth INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_branches_conversation ON branches(conversation_id);
CREATE INDEX IF NOT EXISTS idx_branches_updated ON branches(updated_at);

-- Role-tagged utterances, immutable once created
CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    branch_id TEXT NOT NULL REFERENCES branches(id) ON DELETE CASCADE,
    role TEXT NOT NULL CHECK(role IN ('user','assistant')),
    content TEXT NOT NULL,
    embedding TEXT,
    action TEXT NOT NULL CHECK(action IN ('STAY','ROUTE','BRANCH')),
    reason TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_messages_branch ON messages(branch_id);

-- Provenance-tracked fact histories, one row per (branch, key)
CREATE TABLE IF NOT EXISTS branch_facts (
    branch_id TEXT NOT NULL REFERENCES branches(id) ON DELETE CASCADE,
    key TEXT NOT NULL,
    entries TEXT NOT NULL,
    message_ids TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (branch_id, key)
);

-- Audit log
CREATE TABLE IF NOT EXISTS routing_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    operation TEXT NOT NULL CHECK(operation IN ('create_branch','route','facts_replace')),
    branch_id TEXT,
    message_id TEXT,
    details TEXT,
    created_at TEXT NOT NULL
);

-- Schema metadata
CREATE TABLE IF NOT EXISTS schema_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// Initialize all schema tables. Idempotent (uses IF NOT EXISTS).
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;

    // Set initial schema version if not already present
    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', '1')",
        [],
    )?;

    Ok(())
}
