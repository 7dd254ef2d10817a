//! Database schema definitions.
//!
//! Contains the SQL schema and migration logic for the engine's `SQLite`
//! database. The lexical index is a standalone FTS5 virtual table carrying
//! the chunk text (indexed) plus identity and page columns (unindexed) so
//! BM25 queries can filter by lecture without joining.

/// Current schema version.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// SQL schema for initial database setup.
pub const SCHEMA_SQL: &str = r"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_info (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

-- Blocks (subjects) group lectures
CREATE TABLE IF NOT EXISTS blocks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    ord INTEGER NOT NULL DEFAULT 0
);

-- Folders form a tree inside a block
CREATE TABLE IF NOT EXISTS block_folders (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    block_id INTEGER NOT NULL,
    parent_id INTEGER,
    name TEXT NOT NULL,
    ord INTEGER NOT NULL DEFAULT 0,
    FOREIGN KEY (block_id) REFERENCES blocks(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_folders_block ON block_folders(block_id);
CREATE INDEX IF NOT EXISTS idx_folders_parent ON block_folders(parent_id);

-- Lectures, the classification target
CREATE TABLE IF NOT EXISTS lectures (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    block_id INTEGER NOT NULL,
    folder_id INTEGER,
    title TEXT NOT NULL,
    ord INTEGER NOT NULL DEFAULT 0,
    FOREIGN KEY (block_id) REFERENCES blocks(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_lectures_block ON lectures(block_id);

-- Lecture note chunks (ingestion-owned, engine-read-only)
CREATE TABLE IF NOT EXISTS lecture_chunks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    lecture_id INTEGER NOT NULL,
    material_id INTEGER,
    page_start INTEGER,
    page_end INTEGER,
    content TEXT NOT NULL,
    char_len INTEGER,
    FOREIGN KEY (lecture_id) REFERENCES lectures(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_chunks_lecture ON lecture_chunks(lecture_id);

-- FTS5 lexical index over chunk text
CREATE VIRTUAL TABLE IF NOT EXISTS lecture_chunks_fts USING fts5(
    content,
    chunk_id UNINDEXED,
    lecture_id UNINDEXED,
    page_start UNINDEXED,
    page_end UNINDEXED
);

-- Unit-norm float32 vectors, one row per (chunk, model)
CREATE TABLE IF NOT EXISTS lecture_chunk_embeddings (
    chunk_id INTEGER NOT NULL,
    lecture_id INTEGER NOT NULL,
    model_name TEXT NOT NULL,
    embedding BLOB NOT NULL,
    dim INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (chunk_id, model_name),
    FOREIGN KEY (chunk_id) REFERENCES lecture_chunks(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_embeddings_model ON lecture_chunk_embeddings(model_name);

-- HyDE artifacts, one row per (question, prompt version)
CREATE TABLE IF NOT EXISTS question_queries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    question_id INTEGER NOT NULL,
    prompt_version TEXT NOT NULL,
    lecture_style_query TEXT NOT NULL,
    keywords_json TEXT NOT NULL DEFAULT '[]',
    negative_keywords_json TEXT NOT NULL DEFAULT '[]',
    created_at INTEGER NOT NULL,
    UNIQUE (question_id, prompt_version)
);

-- Exam questions with advisory AI fields
CREATE TABLE IF NOT EXISTS questions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    exam_title TEXT,
    question_number INTEGER,
    content TEXT NOT NULL DEFAULT '',
    choices_json TEXT NOT NULL DEFAULT '[]',
    lecture_id INTEGER,
    is_classified INTEGER NOT NULL DEFAULT 0,
    classification_status TEXT NOT NULL DEFAULT 'manual',
    ai_suggested_lecture_id INTEGER,
    ai_suggested_lecture_title TEXT,
    ai_confidence REAL,
    ai_reason TEXT,
    ai_model_name TEXT,
    ai_classified_at INTEGER,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_questions_lecture ON questions(lecture_id);

-- Batch classification jobs
CREATE TABLE IF NOT EXISTS classification_jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    status TEXT NOT NULL DEFAULT 'pending',
    total_count INTEGER NOT NULL DEFAULT 0,
    processed_count INTEGER NOT NULL DEFAULT 0,
    success_count INTEGER NOT NULL DEFAULT 0,
    failed_count INTEGER NOT NULL DEFAULT 0,
    error_message TEXT,
    result_json TEXT NOT NULL DEFAULT '{}',
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    completed_at INTEGER
);

-- Persisted evidence rows written by Apply
CREATE TABLE IF NOT EXISTS question_chunk_matches (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    question_id INTEGER NOT NULL,
    lecture_id INTEGER NOT NULL,
    chunk_id INTEGER,
    material_id INTEGER,
    page_start INTEGER,
    page_end INTEGER,
    snippet TEXT NOT NULL DEFAULT '',
    score REAL,
    source TEXT NOT NULL DEFAULT 'ai',
    job_id INTEGER,
    is_primary INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    FOREIGN KEY (question_id) REFERENCES questions(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_matches_question ON question_chunk_matches(question_id);
";

/// SQL to check if schema is initialized.
pub const CHECK_SCHEMA_SQL: &str = r"
SELECT COUNT(*) FROM sqlite_master
WHERE type='table' AND name='schema_info';
";

/// SQL to get schema version.
pub const GET_VERSION_SQL: &str = r"
SELECT value FROM schema_info WHERE key = 'version';
";

/// SQL to set schema version.
pub const SET_VERSION_SQL: &str = r"
INSERT OR REPLACE INTO schema_info (key, value) VALUES ('version', ?);
";

/// Migrations from older schema versions.
pub struct Migration {
    /// Version this migration upgrades from.
    pub from_version: u32,
    /// Version this migration upgrades to.
    pub to_version: u32,
    /// SQL statements to execute.
    pub sql: &'static str,
}

/// Available migrations. None yet; v1 is the initial schema.
pub const MIGRATIONS: &[Migration] = &[];

/// Gets migrations needed to upgrade from a version.
#[must_use]
pub fn get_migrations_from(current_version: u32) -> Vec<&'static Migration> {
    MIGRATIONS
        .iter()
        .filter(|m| m.from_version >= current_version && m.to_version <= CURRENT_SCHEMA_VERSION)
        .collect()
}
