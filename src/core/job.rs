//! Batch job records, result payloads, and persisted evidence rows.

use crate::core::decision::ClassificationDecision;
use serde::{Deserialize, Serialize};

/// Lifecycle state of a classification job.
///
/// State advances monotonically: `pending → processing → completed|failed`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Persisted, waiting for a worker slot.
    #[default]
    Pending,
    /// A worker is classifying questions.
    Processing,
    /// All questions processed; payload immutable.
    Completed,
    /// Worker hit an unhandled error; partial payload preserved.
    Failed,
}

impl JobStatus {
    /// Stable string form used in storage.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Parses the storage string form; unknown values read as `failed`.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value {
            "pending" => Self::Pending,
            "processing" => Self::Processing,
            "completed" => Self::Completed,
            _ => Self::Failed,
        }
    }

    /// Whether this is a terminal state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Scope filter captured at job submission.
///
/// `lecture_ids: None` means "no restriction"; `Some` with an empty list
/// restricts to nothing (every question resolves to `no_match`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMeta {
    /// Restrict to one block.
    pub block_id: Option<i64>,
    /// Restrict to one folder subtree.
    pub folder_id: Option<i64>,
    /// Explicit lecture restriction (wins over block/folder).
    pub lecture_ids: Option<Vec<i64>>,
    /// Whether folder restriction descends into child folders.
    pub include_descendants: bool,
}

/// One per-question entry of a job's result payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionResult {
    /// Classified question.
    pub question_id: i64,
    /// Question number within its exam.
    pub question_number: Option<i64>,
    /// Source exam title.
    pub exam_title: Option<String>,
    /// Lecture currently assigned to the question.
    pub current_lecture_id: Option<i64>,
    /// Whether committing the decision would change the assignment.
    pub would_change_lecture: bool,
    /// Title of the decided lecture, for preview grouping.
    pub lecture_title: Option<String>,
    /// Block of the decided lecture, for preview grouping.
    pub block_name: Option<String>,
    /// Per-question processing error, when classification failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The decision itself.
    #[serde(flatten)]
    pub decision: ClassificationDecision,
}

/// Persisted payload of a classification job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultPayload {
    /// Scope filter captured at submission.
    pub request_meta: RequestMeta,
    /// Per-question results in input order.
    pub results: Vec<QuestionResult>,
}

impl ResultPayload {
    /// Finds the result for a question.
    #[must_use]
    pub fn result_for(&self, question_id: i64) -> Option<&QuestionResult> {
        self.results.iter().find(|r| r.question_id == question_id)
    }
}

/// A persisted classification job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationJob {
    /// Unique identifier.
    pub id: i64,
    /// Lifecycle state.
    pub status: JobStatus,
    /// Number of questions submitted.
    pub total_count: i64,
    /// Number of questions processed so far.
    pub processed_count: i64,
    /// Questions classified without error.
    pub success_count: i64,
    /// Questions whose classification failed.
    pub failed_count: i64,
    /// Error message for a failed job.
    pub error_message: Option<String>,
    /// Result payload (partial while processing).
    pub payload: ResultPayload,
    /// Unix timestamp of creation.
    pub created_at: i64,
    /// Unix timestamp of the last progress write.
    pub updated_at: i64,
    /// Unix timestamp of reaching a terminal state.
    pub completed_at: Option<i64>,
}

impl ClassificationJob {
    /// Integer progress in `[0, 100]`.
    #[must_use]
    pub const fn progress_percent(&self) -> i64 {
        if self.total_count == 0 {
            return 0;
        }
        self.processed_count * 100 / self.total_count
    }

    /// Whether the job reached a terminal state.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Source of a persisted evidence row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchSource {
    /// Written by the Apply layer from a job decision.
    Ai,
    /// Entered by a user.
    Manual,
}

impl MatchSource {
    /// Stable string form used in storage.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ai => "ai",
            Self::Manual => "manual",
        }
    }

    /// Parses the storage string form; unknown values read as `manual`.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value {
            "ai" => Self::Ai,
            _ => Self::Manual,
        }
    }
}

/// A persisted evidence row linking a question to a chunk.
///
/// At most one row per (question, job) carries `is_primary`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionChunkMatch {
    /// Row identifier (assigned by storage).
    pub id: Option<i64>,
    /// Linked question.
    pub question_id: i64,
    /// Lecture the evidence supports.
    pub lecture_id: i64,
    /// Source chunk, when still present.
    pub chunk_id: Option<i64>,
    /// Source material, when known.
    pub material_id: Option<i64>,
    /// First page of the passage.
    pub page_start: Option<i64>,
    /// Last page of the passage.
    pub page_end: Option<i64>,
    /// Evidence snippet (at most 500 chars).
    pub snippet: String,
    /// Retrieval/judge score, when known.
    pub score: Option<f64>,
    /// Row provenance.
    pub source: MatchSource,
    /// Job that produced the row, for `ai` rows.
    pub job_id: Option<i64>,
    /// Whether this is the primary evidence for (question, job).
    pub is_primary: bool,
}

/// The committed half of an apply action: assignment plus evidence rows.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitAssignment {
    /// Lecture to assign.
    pub lecture_id: i64,
    /// Replacement evidence rows (first row is primary).
    pub evidence: Vec<QuestionChunkMatch>,
}

/// One question's worth of updates for a single apply call.
///
/// Advisory fields are always written; `commit` is present only when the
/// apply mode decided to change the assignment. The storage layer executes a
/// list of these in one transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplyAction {
    /// Target question.
    pub question_id: i64,
    /// Advisory AI fields to record.
    pub advisory: crate::core::question::AiSuggestion,
    /// Assignment to commit, when the mode allows it.
    pub commit: Option<CommitAssignment>,
}
