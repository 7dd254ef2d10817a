//! # lectern
//!
//! Retrieval and classification engine that maps exam questions to the
//! lecture notes that teach them.
//!
//! The engine is a hybrid lexical+dense retriever over chunked lecture notes
//! (FTS5 BM25 fused with embedding rerank via RRF), a HyDE query
//! transformer, a calibrated auto-confirm rule gate, an LLM judge with JSON
//! repair, and a persistent, progress-tracked batch job runner with an
//! apply/preview layer.
//!
//! ## Features
//!
//! - **Hybrid retrieval**: BM25 over an FTS5 index, embedding rerank,
//!   reciprocal-rank fusion
//! - **`SQLite` storage**: corpus, embeddings, jobs, and evidence rows in one
//!   WAL-mode database
//! - **Rule gate**: strong, consistent retrieval signals skip the LLM
//! - **Batch jobs**: bounded worker pool with per-question progress

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(missing_docs)]
#![warn(unsafe_code)]

pub mod apply;
pub mod cache;
pub mod cli;
pub mod config;
pub mod core;
pub mod embedding;
pub mod error;
pub mod expand;
pub mod hyde;
pub mod job;
pub mod judge;
pub mod llm;
pub mod pipeline;
pub mod search;
pub mod storage;
pub mod tokenize;

// Re-export commonly used types at crate root
pub use error::{Error, Result};

// Re-export core domain types
pub use core::{
    Candidate, ChunkHit, ClassificationDecision, ClassificationJob, Evidence, JobStatus,
    LectureChunk, LectureInfo, Question, RequestMeta, ResultPayload,
};

// Re-export configuration
pub use config::EngineConfig;

// Re-export storage types
pub use storage::{DEFAULT_DB_PATH, SqliteStorage, Storage};

// Re-export engine services
pub use cache::ResultCache;
pub use job::BatchProcessor;
pub use pipeline::ClassificationPipeline;
pub use search::{EmbeddingIndex, Retriever};

// Re-export CLI types
pub use cli::{Cli, Commands};
