//! Core domain models for the classification engine.
//!
//! This module contains the fundamental data structures used throughout the
//! engine: lecture chunks, questions, candidates, decisions, and job records.
//! These are pure domain models with no I/O dependencies; the persistence
//! boundary converts to and from JSON/SQL in one place (`storage`).

pub mod chunk;
pub mod decision;
pub mod job;
pub mod question;

pub use chunk::{ChunkHit, LectureChunk, LectureInfo};
pub use decision::{
    AUTO_CONFIRM_MODEL_NAME, Candidate, ClassificationDecision, Evidence, JudgeEvidence, PageRange,
};
pub use job::{
    ApplyAction, ClassificationJob, CommitAssignment, JobStatus, MatchSource, QuestionChunkMatch,
    QuestionResult, RequestMeta, ResultPayload,
};
pub use question::{AiSuggestion, ClassificationStatus, Question};
