//! Storage trait definition.
//!
//! Defines the persistence facade the engine reads and writes through. The
//! corpus side (`blocks`, `lectures`, `lecture_chunks` and the lexical index)
//! is written by the ingestion collaborator and read-only for the engine;
//! embeddings, HyDE artifacts, jobs, questions, and evidence rows are
//! engine-owned.

use crate::core::{
    ApplyAction, ChunkHit, ClassificationJob, LectureChunk, LectureInfo, Question,
    QuestionChunkMatch, ResultPayload,
};
use crate::error::Result;
use crate::hyde::QueryTransformation;
use serde::Serialize;
use std::collections::HashMap;

/// One row of the dense-index load: chunk identity, display metadata, and
/// its decoded vector.
#[derive(Debug, Clone)]
pub struct EmbeddingRecord {
    /// Source chunk.
    pub chunk_id: i64,
    /// Owning lecture.
    pub lecture_id: i64,
    /// First page of the passage.
    pub page_start: Option<i64>,
    /// Last page of the passage.
    pub page_end: Option<i64>,
    /// Short display snippet of the chunk content.
    pub snippet: String,
    /// Unit-norm vector.
    pub vector: Vec<f32>,
}

/// Trait for persistent storage backends.
pub trait Storage: Send {
    /// Initializes storage (creates schema, runs migrations).
    ///
    /// Idempotent; safe to call multiple times.
    ///
    /// # Errors
    ///
    /// Returns an error if schema creation or migration fails.
    fn init(&mut self) -> Result<()>;

    /// Checks if storage is initialized.
    ///
    /// # Errors
    ///
    /// Returns an error if the check cannot be performed.
    fn is_initialized(&self) -> Result<bool>;

    /// Deletes all data but preserves the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if deletion fails.
    fn reset(&mut self) -> Result<()>;

    // ==================== Corpus (ingestion-facing) ====================

    /// Adds a block. Returns the assigned id.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    fn add_block(&mut self, name: &str, ord: i64) -> Result<i64>;

    /// Adds a folder under a block (and optionally a parent folder).
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    fn add_folder(&mut self, block_id: i64, parent_id: Option<i64>, name: &str, ord: i64)
    -> Result<i64>;

    /// Adds a lecture. Returns the assigned id.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    fn add_lecture(
        &mut self,
        block_id: i64,
        folder_id: Option<i64>,
        title: &str,
        ord: i64,
    ) -> Result<i64>;

    /// Adds a chunk and its lexical-index row. Returns the assigned id.
    ///
    /// # Errors
    ///
    /// Returns an error if either insert fails.
    fn add_chunk(&mut self, chunk: &LectureChunk) -> Result<i64>;

    /// Adds a question. Returns the assigned id.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    fn add_question(&mut self, question: &Question) -> Result<i64>;

    /// Deletes a chunk, cascading to its index row, embeddings, and
    /// evidence rows.
    ///
    /// # Errors
    ///
    /// Returns an error if deletion fails.
    fn delete_chunk(&mut self, chunk_id: i64) -> Result<()>;

    // ==================== Corpus (engine-facing, read-only) ====================

    /// Retrieves a chunk by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    fn get_chunk(&self, id: i64) -> Result<Option<LectureChunk>>;

    /// Lists all chunks.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    fn list_chunks(&self) -> Result<Vec<LectureChunk>>;

    /// Lecture catalog ordered by `(block.ord, lecture.ord)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    fn lecture_catalog(&self) -> Result<Vec<LectureInfo>>;

    /// Resolves a block/folder scope filter to lecture ids.
    ///
    /// `None` means no restriction (neither block nor folder given). A
    /// non-empty folder restriction walks the folder tree recursively when
    /// `include_descendants`; descent is cycle-safe.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    fn resolve_lecture_ids(
        &self,
        block_id: Option<i64>,
        folder_id: Option<i64>,
        include_descendants: bool,
    ) -> Result<Option<Vec<i64>>>;

    // ==================== Lexical search ====================

    /// BM25 search over the lexical index.
    ///
    /// Hits are ordered by ascending `bm25()` (smaller is better) and carry
    /// an index-generated snippet. `lecture_ids: Some(&[])` returns empty;
    /// `None` applies no restriction.
    ///
    /// # Errors
    ///
    /// [`crate::error::RetrievalError::EmptyQuery`] for an empty match
    /// string; [`crate::error::RetrievalError::IndexUnavailable`] when the
    /// FTS artifact is missing.
    fn search_chunks_bm25(
        &self,
        match_query: &str,
        top_n: usize,
        lecture_ids: Option<&[i64]>,
    ) -> Result<Vec<ChunkHit>>;

    /// Same-lecture BM25 neighbors of a seed chunk, seed excluded.
    ///
    /// # Errors
    ///
    /// Propagates lexical-search errors.
    fn semantic_neighbors(
        &self,
        match_query: &str,
        lecture_id: i64,
        exclude_chunk_id: i64,
        top_n: usize,
    ) -> Result<Vec<LectureChunk>>;

    // ==================== Embeddings ====================

    /// Upserts one (chunk, model) vector stored as little-endian `f32`.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn upsert_embedding(
        &mut self,
        chunk_id: i64,
        lecture_id: i64,
        model_name: &str,
        vector: &[f32],
    ) -> Result<()>;

    /// Fetches stored vectors for specific chunks, skipping rows whose blob
    /// does not decode at `dim`.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    fn fetch_embeddings(
        &self,
        model_name: &str,
        chunk_ids: &[i64],
        dim: usize,
    ) -> Result<HashMap<i64, Vec<f32>>>;

    /// Loads every stored vector for a model, with chunk display metadata.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    fn load_embedding_records(&self, model_name: &str, dim: usize) -> Result<Vec<EmbeddingRecord>>;

    // ==================== HyDE artifacts ====================

    /// Fetches the cached HyDE payload for `(question, prompt_version)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    fn get_question_query(
        &self,
        question_id: i64,
        prompt_version: &str,
    ) -> Result<Option<QueryTransformation>>;

    /// Stores (or replaces) the HyDE payload for `(question, prompt_version)`.
    ///
    /// Takes `&self`: this is a write-through cache fill that happens inside
    /// retrieval read flows.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn put_question_query(
        &self,
        question_id: i64,
        prompt_version: &str,
        payload: &QueryTransformation,
    ) -> Result<()>;

    /// Invalidates the HyDE payload for `(question, prompt_version)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    fn delete_question_query(&self, question_id: i64, prompt_version: &str) -> Result<()>;

    // ==================== Questions ====================

    /// Retrieves a question by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    fn get_question(&self, id: i64) -> Result<Option<Question>>;

    /// Filters the given ids down to those of existing questions,
    /// preserving input order.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    fn filter_existing_questions(&self, ids: &[i64]) -> Result<Vec<i64>>;

    /// Applies a batch of classification updates in one transaction.
    ///
    /// Advisory fields are always written; actions carrying a commit also
    /// assign the lecture and replace the question's evidence rows. Returns
    /// the number of committed assignments.
    ///
    /// # Errors
    ///
    /// Returns an error (and rolls back) if any update fails.
    fn apply_classifications(&mut self, actions: &[ApplyAction]) -> Result<usize>;

    /// Lists persisted evidence rows for a question.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    fn list_question_matches(&self, question_id: i64) -> Result<Vec<QuestionChunkMatch>>;

    // ==================== Jobs ====================

    /// Persists a new job in `pending` state. Returns the job id.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    fn create_job(&mut self, total: i64, payload: &ResultPayload) -> Result<i64>;

    /// Retrieves a job by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    fn get_job(&self, id: i64) -> Result<Option<ClassificationJob>>;

    /// Transitions a job to `processing`.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    fn mark_job_processing(&mut self, id: i64) -> Result<()>;

    /// Persists counters and the partial payload after one question.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    fn update_job_progress(
        &mut self,
        id: i64,
        processed: i64,
        success: i64,
        failed: i64,
        payload: &ResultPayload,
    ) -> Result<()>;

    /// Transitions a job to `completed`, stamping `completed_at`.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    fn complete_job(&mut self, id: i64, payload: &ResultPayload) -> Result<()>;

    /// Transitions a job to `failed`, preserving the partial payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    fn fail_job(&mut self, id: i64, error_message: &str, payload: &ResultPayload) -> Result<()>;

    /// Most recent jobs, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    fn recent_jobs(&self, limit: usize) -> Result<Vec<ClassificationJob>>;

    // ==================== Utility ====================

    /// Gets storage statistics.
    ///
    /// # Errors
    ///
    /// Returns an error if statistics cannot be gathered.
    fn stats(&self) -> Result<StorageStats>;
}

/// Storage statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StorageStats {
    /// Number of lectures.
    pub lecture_count: usize,
    /// Number of chunks in the corpus.
    pub chunk_count: usize,
    /// Number of stored embedding rows.
    pub embedding_count: usize,
    /// Number of questions.
    pub question_count: usize,
    /// Number of classification jobs.
    pub job_count: usize,
    /// Schema version.
    pub schema_version: u32,
}
