//! Storage layer for the classification engine.
//!
//! Provides persistent storage using `SQLite`: the lecture/chunk corpus and
//! its lexical index (ingestion-owned, engine-read-only), embeddings, HyDE
//! artifacts, questions, batch jobs, and persisted evidence rows.

pub mod schema;
pub mod sqlite;
pub mod traits;

pub use schema::{CURRENT_SCHEMA_VERSION, SCHEMA_SQL};
pub use sqlite::SqliteStorage;
pub use traits::{EmbeddingRecord, Storage, StorageStats};

/// Default database path relative to the working directory.
pub const DEFAULT_DB_PATH: &str = ".lectern/lectern.db";
