//! `SQLite` storage implementation.
//!
//! Persistent storage with WAL journaling, explicit FTS5 maintenance, and
//! migration support. One connection per instance; batch workers open their
//! own instance instead of sharing connections across threads.

// SQLite stores all integers as i64. These casts are intentional and safe
// because we only store non-negative values that fit in usize.
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_possible_wrap)]

use crate::core::{
    AiSuggestion, ApplyAction, ChunkHit, ClassificationJob, ClassificationStatus, JobStatus,
    LectureChunk, LectureInfo, MatchSource, Question, QuestionChunkMatch, ResultPayload,
};
use crate::embedding::{decode_embedding, encode_embedding};
use crate::error::{Error, Result, RetrievalError, StorageError};
use crate::hyde::QueryTransformation;
use crate::storage::schema::{
    CHECK_SCHEMA_SQL, CURRENT_SCHEMA_VERSION, GET_VERSION_SQL, SCHEMA_SQL, SET_VERSION_SQL,
};
use crate::storage::traits::{EmbeddingRecord, Storage, StorageStats};
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Display-snippet cap for dense-index metadata.
const INDEX_SNIPPET_CHARS: usize = 160;

/// SQLite-based storage implementation.
///
/// # Examples
///
/// ```no_run
/// use lectern::storage::{SqliteStorage, Storage};
///
/// let mut storage = SqliteStorage::open(".lectern/lectern.db").unwrap();
/// storage.init().unwrap();
/// ```
pub struct SqliteStorage {
    /// `SQLite` connection.
    conn: Connection,
    /// Path to the database file (None for in-memory).
    path: Option<PathBuf>,
}

impl SqliteStorage {
    /// Opens or creates a `SQLite` database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or configured.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StorageError::Database(e.to_string()))?;
            }
        }

        let conn = Connection::open(&path).map_err(StorageError::from)?;
        conn.execute("PRAGMA foreign_keys = ON;", [])
            .map_err(StorageError::from)?;
        let _: String = conn
            .query_row("PRAGMA journal_mode = WAL;", [], |row| row.get(0))
            .map_err(StorageError::from)?;
        // Job workers and pollers share the file; wait out writer contention.
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(StorageError::from)?;

        Ok(Self {
            conn,
            path: Some(path),
        })
    }

    /// Creates an in-memory database. Useful for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be created.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(StorageError::from)?;
        conn.execute("PRAGMA foreign_keys = ON;", [])
            .map_err(StorageError::from)?;
        Ok(Self { conn, path: None })
    }

    /// Returns the database path (None for in-memory).
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn get_schema_version(&self) -> Result<Option<u32>> {
        let version: Option<String> = self
            .conn
            .query_row(GET_VERSION_SQL, [], |row| row.get(0))
            .optional()
            .map_err(StorageError::from)?;
        Ok(version.and_then(|v| v.parse().ok()))
    }

    fn set_schema_version(&self, version: u32) -> Result<()> {
        self.conn
            .execute(SET_VERSION_SQL, params![version.to_string()])
            .map_err(StorageError::from)?;
        Ok(())
    }

    /// Returns current Unix timestamp.
    fn now() -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }

    fn count(&self, sql: &str) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row(sql, [], |row| row.get(0))
            .map_err(StorageError::from)?;
        Ok(count as usize)
    }

    fn row_to_chunk(row: &rusqlite::Row<'_>) -> rusqlite::Result<LectureChunk> {
        Ok(LectureChunk {
            id: Some(row.get::<_, i64>(0)?),
            lecture_id: row.get(1)?,
            material_id: row.get(2)?,
            page_start: row.get(3)?,
            page_end: row.get(4)?,
            content: row.get(5)?,
            char_len: row.get(6)?,
        })
    }

    fn row_to_question(row: &rusqlite::Row<'_>) -> rusqlite::Result<Question> {
        let choices_json: String = row.get(4)?;
        let status: String = row.get(7)?;
        Ok(Question {
            id: row.get(0)?,
            exam_title: row.get(1)?,
            question_number: row.get(2)?,
            content: row.get(3)?,
            choices: serde_json::from_str(&choices_json).unwrap_or_default(),
            lecture_id: row.get(5)?,
            is_classified: row.get::<_, i64>(6)? != 0,
            status: ClassificationStatus::parse(&status),
            ai: AiSuggestion {
                suggested_lecture_id: row.get(8)?,
                suggested_lecture_title: row.get(9)?,
                confidence: row.get(10)?,
                reason: row.get(11)?,
                model_name: row.get(12)?,
                classified_at: row.get(13)?,
            },
        })
    }

    fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<ClassificationJob> {
        let status: String = row.get(1)?;
        let result_json: String = row.get(7)?;
        Ok(ClassificationJob {
            id: row.get(0)?,
            status: JobStatus::parse(&status),
            total_count: row.get(2)?,
            processed_count: row.get(3)?,
            success_count: row.get(4)?,
            failed_count: row.get(5)?,
            error_message: row.get(6)?,
            payload: serde_json::from_str(&result_json).unwrap_or_default(),
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
            completed_at: row.get(10)?,
        })
    }

    /// Maps an FTS query failure, distinguishing a missing index artifact.
    fn map_fts_error(err: &rusqlite::Error) -> Error {
        let message = err.to_string();
        if message.contains("no such table") {
            return Error::Retrieval(RetrievalError::IndexUnavailable(message));
        }
        Error::Storage(StorageError::Database(message))
    }

    fn display_snippet(content: &str) -> String {
        let flattened = content.replace('\n', " ");
        let trimmed = flattened.trim();
        if trimmed.chars().count() > INDEX_SNIPPET_CHARS {
            let cut: String = trimmed.chars().take(INDEX_SNIPPET_CHARS - 3).collect();
            return format!("{cut}...");
        }
        trimmed.to_string()
    }

    fn update_job_row(
        &mut self,
        id: i64,
        status: JobStatus,
        error_message: Option<&str>,
        payload: &ResultPayload,
        stamp_completed: bool,
    ) -> Result<()> {
        let now = Self::now();
        let result_json = serde_json::to_string(payload).map_err(StorageError::from)?;
        let completed_at = if stamp_completed { Some(now) } else { None };
        self.conn
            .execute(
                r"
            UPDATE classification_jobs SET
                status = ?, error_message = ?, result_json = ?,
                updated_at = ?, completed_at = COALESCE(?, completed_at)
            WHERE id = ?
        ",
                params![
                    status.as_str(),
                    error_message,
                    result_json,
                    now,
                    completed_at,
                    id
                ],
            )
            .map_err(StorageError::from)?;
        Ok(())
    }
}

impl Storage for SqliteStorage {
    fn init(&mut self) -> Result<()> {
        let is_init: i64 = self
            .conn
            .query_row(CHECK_SCHEMA_SQL, [], |row| row.get(0))
            .map_err(StorageError::from)?;

        if is_init == 0 {
            self.conn
                .execute_batch(SCHEMA_SQL)
                .map_err(StorageError::from)?;
            self.set_schema_version(CURRENT_SCHEMA_VERSION)?;
        } else if let Some(current) = self.get_schema_version()? {
            if current < CURRENT_SCHEMA_VERSION {
                let migrations = crate::storage::schema::get_migrations_from(current);
                for migration in migrations {
                    self.conn
                        .execute_batch(migration.sql)
                        .map_err(|e| StorageError::Migration(e.to_string()))?;
                }
                self.set_schema_version(CURRENT_SCHEMA_VERSION)?;
            }
        }

        Ok(())
    }

    fn is_initialized(&self) -> Result<bool> {
        let count: i64 = self
            .conn
            .query_row(CHECK_SCHEMA_SQL, [], |row| row.get(0))
            .map_err(StorageError::from)?;
        Ok(count > 0)
    }

    fn reset(&mut self) -> Result<()> {
        self.conn
            .execute_batch(
                r"
            DELETE FROM question_chunk_matches;
            DELETE FROM classification_jobs;
            DELETE FROM question_queries;
            DELETE FROM questions;
            DELETE FROM lecture_chunk_embeddings;
            DELETE FROM lecture_chunks_fts;
            DELETE FROM lecture_chunks;
            DELETE FROM lectures;
            DELETE FROM block_folders;
            DELETE FROM blocks;
        ",
            )
            .map_err(StorageError::from)?;
        Ok(())
    }

    // ==================== Corpus (ingestion-facing) ====================

    fn add_block(&mut self, name: &str, ord: i64) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO blocks (name, ord) VALUES (?, ?)",
                params![name, ord],
            )
            .map_err(StorageError::from)?;
        Ok(self.conn.last_insert_rowid())
    }

    fn add_folder(
        &mut self,
        block_id: i64,
        parent_id: Option<i64>,
        name: &str,
        ord: i64,
    ) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO block_folders (block_id, parent_id, name, ord) VALUES (?, ?, ?, ?)",
                params![block_id, parent_id, name, ord],
            )
            .map_err(StorageError::from)?;
        Ok(self.conn.last_insert_rowid())
    }

    fn add_lecture(
        &mut self,
        block_id: i64,
        folder_id: Option<i64>,
        title: &str,
        ord: i64,
    ) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO lectures (block_id, folder_id, title, ord) VALUES (?, ?, ?, ?)",
                params![block_id, folder_id, title, ord],
            )
            .map_err(StorageError::from)?;
        Ok(self.conn.last_insert_rowid())
    }

    fn add_chunk(&mut self, chunk: &LectureChunk) -> Result<i64> {
        let char_len = chunk
            .char_len
            .unwrap_or_else(|| chunk.content.chars().count() as i64);
        self.conn
            .execute(
                r"
            INSERT INTO lecture_chunks (lecture_id, material_id, page_start, page_end, content, char_len)
            VALUES (?, ?, ?, ?, ?, ?)
        ",
                params![
                    chunk.lecture_id,
                    chunk.material_id,
                    chunk.page_start,
                    chunk.page_end,
                    chunk.content,
                    char_len,
                ],
            )
            .map_err(StorageError::from)?;
        let chunk_id = self.conn.last_insert_rowid();
        self.conn
            .execute(
                r"
            INSERT INTO lecture_chunks_fts (content, chunk_id, lecture_id, page_start, page_end)
            VALUES (?, ?, ?, ?, ?)
        ",
                params![
                    chunk.content,
                    chunk_id,
                    chunk.lecture_id,
                    chunk.page_start,
                    chunk.page_end,
                ],
            )
            .map_err(StorageError::from)?;
        Ok(chunk_id)
    }

    fn add_question(&mut self, question: &Question) -> Result<i64> {
        let now = Self::now();
        let choices_json = serde_json::to_string(&question.choices).map_err(StorageError::from)?;
        self.conn
            .execute(
                r"
            INSERT INTO questions (
                exam_title, question_number, content, choices_json,
                lecture_id, is_classified, classification_status,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        ",
                params![
                    question.exam_title,
                    question.question_number,
                    question.content,
                    choices_json,
                    question.lecture_id,
                    i64::from(question.is_classified),
                    question.status.as_str(),
                    now,
                    now,
                ],
            )
            .map_err(StorageError::from)?;
        Ok(self.conn.last_insert_rowid())
    }

    fn delete_chunk(&mut self, chunk_id: i64) -> Result<()> {
        // Embeddings cascade via FK; the FTS row and evidence rows are
        // maintained explicitly.
        self.conn
            .execute(
                "DELETE FROM lecture_chunks_fts WHERE chunk_id = ?",
                params![chunk_id],
            )
            .map_err(StorageError::from)?;
        self.conn
            .execute(
                "DELETE FROM question_chunk_matches WHERE chunk_id = ?",
                params![chunk_id],
            )
            .map_err(StorageError::from)?;
        self.conn
            .execute("DELETE FROM lecture_chunks WHERE id = ?", params![chunk_id])
            .map_err(StorageError::from)?;
        Ok(())
    }

    // ==================== Corpus (engine-facing) ====================

    fn get_chunk(&self, id: i64) -> Result<Option<LectureChunk>> {
        let chunk = self
            .conn
            .query_row(
                r"
            SELECT id, lecture_id, material_id, page_start, page_end, content, char_len
            FROM lecture_chunks WHERE id = ?
        ",
                params![id],
                Self::row_to_chunk,
            )
            .optional()
            .map_err(StorageError::from)?;
        Ok(chunk)
    }

    fn list_chunks(&self) -> Result<Vec<LectureChunk>> {
        let mut stmt = self
            .conn
            .prepare(
                r"
            SELECT id, lecture_id, material_id, page_start, page_end, content, char_len
            FROM lecture_chunks ORDER BY id
        ",
            )
            .map_err(StorageError::from)?;
        let chunks = stmt
            .query_map([], Self::row_to_chunk)
            .map_err(StorageError::from)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StorageError::from)?;
        Ok(chunks)
    }

    fn lecture_catalog(&self) -> Result<Vec<LectureInfo>> {
        let mut stmt = self
            .conn
            .prepare(
                r"
            SELECT l.id, l.title, b.id, b.name
            FROM lectures l
            JOIN blocks b ON b.id = l.block_id
            ORDER BY b.ord, l.ord, l.id
        ",
            )
            .map_err(StorageError::from)?;
        let catalog = stmt
            .query_map([], |row| {
                Ok(LectureInfo {
                    id: row.get(0)?,
                    title: row.get(1)?,
                    block_id: row.get(2)?,
                    block_name: row.get(3)?,
                })
            })
            .map_err(StorageError::from)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StorageError::from)?;
        Ok(catalog)
    }

    fn resolve_lecture_ids(
        &self,
        block_id: Option<i64>,
        folder_id: Option<i64>,
        include_descendants: bool,
    ) -> Result<Option<Vec<i64>>> {
        if block_id.is_none() && folder_id.is_none() {
            return Ok(None);
        }

        let folder_ids: Option<Vec<i64>> = match folder_id {
            None => None,
            Some(folder) if !include_descendants => Some(vec![folder]),
            Some(folder) => {
                // UNION (not UNION ALL) dedupes visited folders, which also
                // terminates descent over a cyclic parent link.
                let mut stmt = self
                    .conn
                    .prepare(
                        r"
                    WITH RECURSIVE folder_tree(id) AS (
                        SELECT id FROM block_folders WHERE id = ?
                        UNION
                        SELECT bf.id FROM block_folders bf
                        JOIN folder_tree ft ON bf.parent_id = ft.id
                    )
                    SELECT id FROM folder_tree
                ",
                    )
                    .map_err(StorageError::from)?;
                let ids = stmt
                    .query_map(params![folder], |row| row.get::<_, i64>(0))
                    .map_err(StorageError::from)?
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(StorageError::from)?;
                Some(ids)
            }
        };

        if let Some(ids) = &folder_ids {
            if ids.is_empty() {
                return Ok(Some(Vec::new()));
            }
        }

        let mut sql = "SELECT id FROM lectures WHERE 1=1".to_string();
        let mut values: Vec<Value> = Vec::new();
        if let Some(block) = block_id {
            sql.push_str(" AND block_id = ?");
            values.push(Value::Integer(block));
        }
        if let Some(ids) = &folder_ids {
            let placeholders = vec!["?"; ids.len()].join(", ");
            sql.push_str(&format!(" AND folder_id IN ({placeholders})"));
            values.extend(ids.iter().map(|id| Value::Integer(*id)));
        }
        sql.push_str(" ORDER BY id");

        let mut stmt = self.conn.prepare(&sql).map_err(StorageError::from)?;
        let lecture_ids = stmt
            .query_map(params_from_iter(values), |row| row.get::<_, i64>(0))
            .map_err(StorageError::from)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StorageError::from)?;
        Ok(Some(lecture_ids))
    }

    // ==================== Lexical search ====================

    fn search_chunks_bm25(
        &self,
        match_query: &str,
        top_n: usize,
        lecture_ids: Option<&[i64]>,
    ) -> Result<Vec<ChunkHit>> {
        if match_query.trim().is_empty() {
            return Err(Error::Retrieval(RetrievalError::EmptyQuery));
        }
        if let Some(ids) = lecture_ids {
            if ids.is_empty() {
                return Ok(Vec::new());
            }
        }

        let mut sql = String::from(
            r"
            SELECT
                chunk_id,
                lecture_id,
                page_start,
                page_end,
                snippet(lecture_chunks_fts, 0, '', '', '...', 24) AS snip,
                bm25(lecture_chunks_fts) AS bm25_score
            FROM lecture_chunks_fts
            WHERE lecture_chunks_fts MATCH ?
        ",
        );
        let mut values: Vec<Value> = vec![Value::Text(match_query.to_string())];
        if let Some(ids) = lecture_ids {
            let placeholders = vec!["?"; ids.len()].join(", ");
            sql.push_str(&format!(" AND lecture_id IN ({placeholders})"));
            values.extend(ids.iter().map(|id| Value::Integer(*id)));
        }
        sql.push_str(" ORDER BY bm25_score LIMIT ?");
        values.push(Value::Integer(top_n as i64));

        let mut stmt = self.conn.prepare(&sql).map_err(|e| Self::map_fts_error(&e))?;
        let hits = stmt
            .query_map(params_from_iter(values), |row| {
                let snippet: String = row.get(4)?;
                Ok(ChunkHit {
                    chunk_id: row.get(0)?,
                    lecture_id: row.get(1)?,
                    page_start: row.get(2)?,
                    page_end: row.get(3)?,
                    snippet: snippet.replace('\n', " ").trim().to_string(),
                    bm25_score: Some(row.get::<_, f64>(5)?),
                    embedding_score: None,
                    rrf_score: None,
                })
            })
            .map_err(|e| Self::map_fts_error(&e))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Self::map_fts_error(&e))?;
        Ok(hits)
    }

    fn semantic_neighbors(
        &self,
        match_query: &str,
        lecture_id: i64,
        exclude_chunk_id: i64,
        top_n: usize,
    ) -> Result<Vec<LectureChunk>> {
        if match_query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let mut stmt = self
            .conn
            .prepare(
                r"
            SELECT chunk_id
            FROM lecture_chunks_fts
            WHERE lecture_chunks_fts MATCH ?
              AND lecture_id = ?
            ORDER BY bm25(lecture_chunks_fts)
            LIMIT ?
        ",
            )
            .map_err(|e| Self::map_fts_error(&e))?;
        let chunk_ids = stmt
            .query_map(
                params![match_query, lecture_id, top_n as i64],
                |row| row.get::<_, i64>(0),
            )
            .map_err(|e| Self::map_fts_error(&e))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Self::map_fts_error(&e))?;

        let mut neighbors = Vec::new();
        for chunk_id in chunk_ids {
            if chunk_id == exclude_chunk_id {
                continue;
            }
            if let Some(chunk) = self.get_chunk(chunk_id)? {
                neighbors.push(chunk);
            }
        }
        Ok(neighbors)
    }

    // ==================== Embeddings ====================

    fn upsert_embedding(
        &mut self,
        chunk_id: i64,
        lecture_id: i64,
        model_name: &str,
        vector: &[f32],
    ) -> Result<()> {
        let bytes = encode_embedding(vector);
        self.conn
            .execute(
                r"
            INSERT OR REPLACE INTO lecture_chunk_embeddings
                (chunk_id, lecture_id, model_name, embedding, dim, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
        ",
                params![
                    chunk_id,
                    lecture_id,
                    model_name,
                    bytes,
                    vector.len() as i64,
                    Self::now(),
                ],
            )
            .map_err(StorageError::from)?;
        Ok(())
    }

    fn fetch_embeddings(
        &self,
        model_name: &str,
        chunk_ids: &[i64],
        dim: usize,
    ) -> Result<HashMap<i64, Vec<f32>>> {
        if chunk_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let placeholders = vec!["?"; chunk_ids.len()].join(", ");
        let sql = format!(
            r"
            SELECT chunk_id, embedding
            FROM lecture_chunk_embeddings
            WHERE model_name = ?
              AND chunk_id IN ({placeholders})
        "
        );
        let mut values: Vec<Value> = vec![Value::Text(model_name.to_string())];
        values.extend(chunk_ids.iter().map(|id| Value::Integer(*id)));

        let mut stmt = self.conn.prepare(&sql).map_err(StorageError::from)?;
        let rows = stmt
            .query_map(params_from_iter(values), |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?))
            })
            .map_err(StorageError::from)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StorageError::from)?;

        let mut embeddings = HashMap::new();
        for (chunk_id, blob) in rows {
            if let Some(vector) = decode_embedding(&blob, dim) {
                embeddings.insert(chunk_id, vector);
            }
        }
        Ok(embeddings)
    }

    fn load_embedding_records(&self, model_name: &str, dim: usize) -> Result<Vec<EmbeddingRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                r"
            SELECT e.chunk_id, e.lecture_id, e.embedding,
                   c.page_start, c.page_end, c.content
            FROM lecture_chunk_embeddings e
            JOIN lecture_chunks c ON c.id = e.chunk_id
            WHERE e.model_name = ?
            ORDER BY e.chunk_id
        ",
            )
            .map_err(StorageError::from)?;
        let rows = stmt
            .query_map(params![model_name], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                    row.get::<_, Option<i64>>(3)?,
                    row.get::<_, Option<i64>>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })
            .map_err(StorageError::from)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StorageError::from)?;

        let mut records = Vec::new();
        for (chunk_id, lecture_id, blob, page_start, page_end, content) in rows {
            let Some(vector) = decode_embedding(&blob, dim) else {
                continue;
            };
            records.push(EmbeddingRecord {
                chunk_id,
                lecture_id,
                page_start,
                page_end,
                snippet: Self::display_snippet(&content),
                vector,
            });
        }
        Ok(records)
    }

    // ==================== HyDE artifacts ====================

    fn get_question_query(
        &self,
        question_id: i64,
        prompt_version: &str,
    ) -> Result<Option<QueryTransformation>> {
        let row = self
            .conn
            .query_row(
                r"
            SELECT lecture_style_query, keywords_json, negative_keywords_json
            FROM question_queries
            WHERE question_id = ? AND prompt_version = ?
        ",
                params![question_id, prompt_version],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()
            .map_err(StorageError::from)?;

        Ok(row.map(|(lecture_style_query, keywords_json, negatives_json)| {
            QueryTransformation {
                keywords: serde_json::from_str(&keywords_json).unwrap_or_default(),
                lecture_style_query,
                negative_keywords: serde_json::from_str(&negatives_json).unwrap_or_default(),
            }
        }))
    }

    fn put_question_query(
        &self,
        question_id: i64,
        prompt_version: &str,
        payload: &QueryTransformation,
    ) -> Result<()> {
        let keywords_json = serde_json::to_string(&payload.keywords).map_err(StorageError::from)?;
        let negatives_json =
            serde_json::to_string(&payload.negative_keywords).map_err(StorageError::from)?;
        self.conn
            .execute(
                r"
            INSERT OR REPLACE INTO question_queries
                (question_id, prompt_version, lecture_style_query,
                 keywords_json, negative_keywords_json, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
        ",
                params![
                    question_id,
                    prompt_version,
                    payload.lecture_style_query,
                    keywords_json,
                    negatives_json,
                    Self::now(),
                ],
            )
            .map_err(StorageError::from)?;
        Ok(())
    }

    fn delete_question_query(&self, question_id: i64, prompt_version: &str) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM question_queries WHERE question_id = ? AND prompt_version = ?",
                params![question_id, prompt_version],
            )
            .map_err(StorageError::from)?;
        Ok(())
    }

    // ==================== Questions ====================

    fn get_question(&self, id: i64) -> Result<Option<Question>> {
        let question = self
            .conn
            .query_row(
                r"
            SELECT id, exam_title, question_number, content, choices_json,
                   lecture_id, is_classified, classification_status,
                   ai_suggested_lecture_id, ai_suggested_lecture_title,
                   ai_confidence, ai_reason, ai_model_name, ai_classified_at
            FROM questions WHERE id = ?
        ",
                params![id],
                Self::row_to_question,
            )
            .optional()
            .map_err(StorageError::from)?;
        Ok(question)
    }

    fn filter_existing_questions(&self, ids: &[i64]) -> Result<Vec<i64>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!("SELECT id FROM questions WHERE id IN ({placeholders})");
        let mut stmt = self.conn.prepare(&sql).map_err(StorageError::from)?;
        let existing: std::collections::HashSet<i64> = stmt
            .query_map(
                params_from_iter(ids.iter().map(|id| Value::Integer(*id))),
                |row| row.get::<_, i64>(0),
            )
            .map_err(StorageError::from)?
            .collect::<std::result::Result<_, _>>()
            .map_err(StorageError::from)?;
        Ok(ids
            .iter()
            .copied()
            .filter(|id| existing.contains(id))
            .collect())
    }

    fn apply_classifications(&mut self, actions: &[ApplyAction]) -> Result<usize> {
        let now = Self::now();
        let tx = self.conn.transaction().map_err(StorageError::from)?;
        let mut applied = 0usize;

        for action in actions {
            // Advisory fields are recorded whether or not the assignment is
            // committed; status moves to ai_suggested only from unclassified.
            tx.execute(
                r"
                UPDATE questions SET
                    ai_suggested_lecture_id = ?,
                    ai_suggested_lecture_title = ?,
                    ai_confidence = ?,
                    ai_reason = ?,
                    ai_model_name = ?,
                    ai_classified_at = ?,
                    classification_status = CASE
                        WHEN is_classified = 0 THEN 'ai_suggested'
                        ELSE classification_status
                    END,
                    updated_at = ?
                WHERE id = ?
            ",
                params![
                    action.advisory.suggested_lecture_id,
                    action.advisory.suggested_lecture_title,
                    action.advisory.confidence,
                    action.advisory.reason,
                    action.advisory.model_name,
                    action.advisory.classified_at.unwrap_or(now),
                    now,
                    action.question_id,
                ],
            )
            .map_err(StorageError::from)?;

            let Some(commit) = &action.commit else {
                continue;
            };

            tx.execute(
                r"
                UPDATE questions SET
                    lecture_id = ?,
                    is_classified = 1,
                    classification_status = 'ai_confirmed',
                    updated_at = ?
                WHERE id = ?
            ",
                params![commit.lecture_id, now, action.question_id],
            )
            .map_err(StorageError::from)?;

            tx.execute(
                "DELETE FROM question_chunk_matches WHERE question_id = ? AND source = 'ai'",
                params![action.question_id],
            )
            .map_err(StorageError::from)?;

            for row in &commit.evidence {
                tx.execute(
                    r"
                    INSERT INTO question_chunk_matches (
                        question_id, lecture_id, chunk_id, material_id,
                        page_start, page_end, snippet, score, source,
                        job_id, is_primary, created_at
                    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ",
                    params![
                        row.question_id,
                        row.lecture_id,
                        row.chunk_id,
                        row.material_id,
                        row.page_start,
                        row.page_end,
                        row.snippet,
                        row.score,
                        row.source.as_str(),
                        row.job_id,
                        i64::from(row.is_primary),
                        now,
                    ],
                )
                .map_err(StorageError::from)?;
            }
            applied += 1;
        }

        tx.commit().map_err(StorageError::from)?;
        Ok(applied)
    }

    fn list_question_matches(&self, question_id: i64) -> Result<Vec<QuestionChunkMatch>> {
        let mut stmt = self
            .conn
            .prepare(
                r"
            SELECT id, question_id, lecture_id, chunk_id, material_id,
                   page_start, page_end, snippet, score, source, job_id, is_primary
            FROM question_chunk_matches
            WHERE question_id = ?
            ORDER BY id
        ",
            )
            .map_err(StorageError::from)?;
        let matches = stmt
            .query_map(params![question_id], |row| {
                let source: String = row.get(9)?;
                Ok(QuestionChunkMatch {
                    id: Some(row.get::<_, i64>(0)?),
                    question_id: row.get(1)?,
                    lecture_id: row.get(2)?,
                    chunk_id: row.get(3)?,
                    material_id: row.get(4)?,
                    page_start: row.get(5)?,
                    page_end: row.get(6)?,
                    snippet: row.get(7)?,
                    score: row.get(8)?,
                    source: MatchSource::parse(&source),
                    job_id: row.get(10)?,
                    is_primary: row.get::<_, i64>(11)? != 0,
                })
            })
            .map_err(StorageError::from)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StorageError::from)?;
        Ok(matches)
    }

    // ==================== Jobs ====================

    fn create_job(&mut self, total: i64, payload: &ResultPayload) -> Result<i64> {
        let now = Self::now();
        let result_json = serde_json::to_string(payload).map_err(StorageError::from)?;
        self.conn
            .execute(
                r"
            INSERT INTO classification_jobs
                (status, total_count, processed_count, success_count, failed_count,
                 result_json, created_at, updated_at)
            VALUES ('pending', ?, 0, 0, 0, ?, ?, ?)
        ",
                params![total, result_json, now, now],
            )
            .map_err(StorageError::from)?;
        Ok(self.conn.last_insert_rowid())
    }

    fn get_job(&self, id: i64) -> Result<Option<ClassificationJob>> {
        let job = self
            .conn
            .query_row(
                r"
            SELECT id, status, total_count, processed_count, success_count,
                   failed_count, error_message, result_json,
                   created_at, updated_at, completed_at
            FROM classification_jobs WHERE id = ?
        ",
                params![id],
                Self::row_to_job,
            )
            .optional()
            .map_err(StorageError::from)?;
        Ok(job)
    }

    fn mark_job_processing(&mut self, id: i64) -> Result<()> {
        self.conn
            .execute(
                "UPDATE classification_jobs SET status = 'processing', updated_at = ? WHERE id = ?",
                params![Self::now(), id],
            )
            .map_err(StorageError::from)?;
        Ok(())
    }

    fn update_job_progress(
        &mut self,
        id: i64,
        processed: i64,
        success: i64,
        failed: i64,
        payload: &ResultPayload,
    ) -> Result<()> {
        let result_json = serde_json::to_string(payload).map_err(StorageError::from)?;
        self.conn
            .execute(
                r"
            UPDATE classification_jobs SET
                processed_count = ?, success_count = ?, failed_count = ?,
                result_json = ?, updated_at = ?
            WHERE id = ?
        ",
                params![processed, success, failed, result_json, Self::now(), id],
            )
            .map_err(StorageError::from)?;
        Ok(())
    }

    fn complete_job(&mut self, id: i64, payload: &ResultPayload) -> Result<()> {
        self.update_job_row(id, JobStatus::Completed, None, payload, true)
    }

    fn fail_job(&mut self, id: i64, error_message: &str, payload: &ResultPayload) -> Result<()> {
        self.update_job_row(id, JobStatus::Failed, Some(error_message), payload, true)
    }

    fn recent_jobs(&self, limit: usize) -> Result<Vec<ClassificationJob>> {
        let mut stmt = self
            .conn
            .prepare(
                r"
            SELECT id, status, total_count, processed_count, success_count,
                   failed_count, error_message, result_json,
                   created_at, updated_at, completed_at
            FROM classification_jobs
            ORDER BY created_at DESC, id DESC
            LIMIT ?
        ",
            )
            .map_err(StorageError::from)?;
        let jobs = stmt
            .query_map(params![limit as i64], Self::row_to_job)
            .map_err(StorageError::from)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StorageError::from)?;
        Ok(jobs)
    }

    // ==================== Utility ====================

    fn stats(&self) -> Result<StorageStats> {
        Ok(StorageStats {
            lecture_count: self.count("SELECT COUNT(*) FROM lectures")?,
            chunk_count: self.count("SELECT COUNT(*) FROM lecture_chunks")?,
            embedding_count: self.count("SELECT COUNT(*) FROM lecture_chunk_embeddings")?,
            question_count: self.count("SELECT COUNT(*) FROM questions")?,
            job_count: self.count("SELECT COUNT(*) FROM classification_jobs")?,
            schema_version: self.get_schema_version()?.unwrap_or(0),
        })
    }
}
