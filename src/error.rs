//! Error types for the classification engine.
//!
//! This module provides the error hierarchy using `thiserror` for retrieval,
//! storage, LLM, cache, and batch-job operations.
//!
//! Model- and data-quality problems are deliberately *not* errors at the
//! public boundary: dense search degrades to empty, judge output repairs to a
//! `no_match` decision, a corrupt cache file reads as an empty cache. The
//! variants here cover the failures that callers must actually handle.

use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for engine operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Retrieval-related errors (lexical/dense search).
    #[error("retrieval error: {0}")]
    Retrieval(#[from] RetrievalError),

    /// Storage-related errors (database operations).
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// LLM provider errors.
    #[error("llm error: {0}")]
    Llm(#[from] LlmError),

    /// Batch job errors.
    #[error("job error: {0}")]
    Job(#[from] JobError),

    /// I/O errors (cache file, CLI input).
    #[error("I/O error: {0}")]
    Io(String),

    /// Configuration errors. Fatal at initialization.
    #[error("configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },
}

/// Retrieval-specific errors.
#[derive(Error, Debug)]
pub enum RetrievalError {
    /// The normalized query produced no usable match string.
    ///
    /// Callers treat this as "no candidates", not as a failure.
    #[error("empty query after normalization")]
    EmptyQuery,

    /// The full-text index artifact is missing or unreadable.
    #[error("full-text index unavailable: {0}")]
    IndexUnavailable(String),

    /// Dense retrieval is unavailable (missing model, dim mismatch, empty index).
    ///
    /// Hybrid search degrades to BM25-only when it observes this.
    #[error("embedding search unavailable: {0}")]
    EmbeddingUnavailable(String),
}

/// Storage-specific errors for database operations.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Database connection or query error.
    #[error("database error: {0}")]
    Database(String),

    /// Storage not initialized (init command not run).
    #[error("lectern not initialized. Run: lectern init")]
    NotInitialized,

    /// Chunk not found by ID.
    #[error("chunk not found: {id}")]
    ChunkNotFound {
        /// Chunk ID that was not found.
        id: i64,
    },

    /// Question not found by ID.
    #[error("question not found: {id}")]
    QuestionNotFound {
        /// Question ID that was not found.
        id: i64,
    },

    /// Job row not found by ID.
    #[error("classification job not found: {id}")]
    JobNotFound {
        /// Job ID that was not found.
        id: i64,
    },

    /// Schema migration error.
    #[error("migration error: {0}")]
    Migration(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// LLM provider errors.
///
/// The transient/permanent split drives the retry policy: transient failures
/// are retried with exponential backoff, permanent ones are not.
#[derive(Error, Debug)]
pub enum LlmError {
    /// Recoverable provider failure (rate limit, 5xx, network).
    #[error("transient provider failure: {0}")]
    Transient(String),

    /// Unrecoverable provider failure (bad request, auth, quota).
    #[error("permanent provider failure: {0}")]
    Permanent(String),

    /// The provider returned a response the engine could not use at all.
    #[error("invalid provider response: {0}")]
    InvalidResponse(String),

    /// API key missing from configuration.
    #[error("API key is not configured")]
    MissingApiKey,
}

impl LlmError {
    /// Whether a retry may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Batch job errors.
#[derive(Error, Debug)]
pub enum JobError {
    /// The job is not yet complete (result requested too early).
    #[error("job {id} is not complete")]
    NotComplete {
        /// Job ID.
        id: i64,
    },

    /// The worker pool has shut down and cannot accept jobs.
    #[error("worker pool unavailable")]
    PoolUnavailable,

    /// The job payload could not be decoded.
    #[error("invalid job payload: {0}")]
    InvalidPayload(String),
}

// Implement From traits for standard library and dependency errors

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(StorageError::Database(err.to_string()))
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Database(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Storage(StorageError::Serialization(err.to_string()))
    }
}
