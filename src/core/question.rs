//! Question records and classification status.

use crate::tokenize::truncate_graphemes;
use serde::{Deserialize, Serialize};

/// Character cap for the text handed to retrieval and the judge.
pub const QUESTION_TEXT_MAX_CHARS: usize = 4000;

/// Classification lifecycle of a question.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationStatus {
    /// Manually managed (default).
    #[default]
    Manual,
    /// An AI suggestion has been recorded but not committed.
    AiSuggested,
    /// An AI suggestion has been committed.
    AiConfirmed,
}

impl ClassificationStatus {
    /// Stable string form used in storage.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::AiSuggested => "ai_suggested",
            Self::AiConfirmed => "ai_confirmed",
        }
    }

    /// Parses the storage string form; unknown values fall back to `manual`.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value {
            "ai_suggested" => Self::AiSuggested,
            "ai_confirmed" => Self::AiConfirmed,
            _ => Self::Manual,
        }
    }
}

/// Advisory AI fields written by the Apply layer regardless of commit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AiSuggestion {
    /// Suggested lecture identifier.
    pub suggested_lecture_id: Option<i64>,
    /// `Block > Lecture` snapshot at suggestion time.
    pub suggested_lecture_title: Option<String>,
    /// Judge confidence in `[0, 1]`.
    pub confidence: Option<f64>,
    /// Short judge rationale.
    pub reason: Option<String>,
    /// Model that produced the suggestion.
    pub model_name: Option<String>,
    /// Unix timestamp of the suggestion.
    pub classified_at: Option<i64>,
}

/// An exam question.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Question {
    /// Unique identifier.
    pub id: i64,
    /// Title of the source exam, for display in result payloads.
    pub exam_title: Option<String>,
    /// Question number within the exam.
    pub question_number: Option<i64>,
    /// Question stem text.
    pub content: String,
    /// Choice texts in choice-number order.
    pub choices: Vec<String>,
    /// Assigned lecture, when classified.
    pub lecture_id: Option<i64>,
    /// Whether an assignment has been committed.
    pub is_classified: bool,
    /// Classification lifecycle state.
    pub status: ClassificationStatus,
    /// Advisory AI fields.
    pub ai: AiSuggestion,
}

impl Question {
    /// Text handed to retrieval and the judge: stem plus choices, trimmed
    /// and capped at [`QUESTION_TEXT_MAX_CHARS`].
    #[must_use]
    pub fn classification_text(&self) -> String {
        let mut text = self.content.clone();
        if !self.choices.is_empty() {
            text.push('\n');
            text.push_str(&self.choices.join(" "));
        }
        truncate_graphemes(text.trim(), QUESTION_TEXT_MAX_CHARS)
    }
}
