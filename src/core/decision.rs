//! Candidates, evidence, and classification decisions.

use serde::{Deserialize, Serialize};

/// Model-name sentinel carried by auto-confirmed decisions.
///
/// Downstream consumers that branch on model names must recognize it.
pub const AUTO_CONFIRM_MODEL_NAME: &str = "auto_confirm_v2";

/// Maximum snippet/quote length persisted anywhere.
pub const SNIPPET_MAX_CHARS: usize = 500;

/// An inclusive page range; either bound may be unknown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRange {
    /// First page (inclusive).
    pub start: Option<i64>,
    /// Last page (inclusive).
    pub end: Option<i64>,
}

impl PageRange {
    /// Renders the page label used in judge prompts: `p.12`, `p.12-13`, or
    /// `p.?` when the start is unknown. Collapses when start equals end.
    #[must_use]
    pub fn label(self) -> String {
        match (self.start, self.end) {
            (Some(start), Some(end)) if start != end => format!("p.{start}-{end}"),
            (Some(start), _) => format!("p.{start}"),
            (None, _) => "p.?".to_string(),
        }
    }
}

/// Evidence attached to a retrieval candidate: one chunk-backed snippet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    /// Source chunk.
    pub chunk_id: i64,
    /// First page of the source passage.
    pub page_start: Option<i64>,
    /// Last page of the source passage.
    pub page_end: Option<i64>,
    /// Snippet text (substring of the source chunk after whitespace
    /// normalization; at most [`SNIPPET_MAX_CHARS`] chars).
    pub snippet: String,
    /// Retrieval score contribution, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

impl Evidence {
    /// Page range of this evidence.
    #[must_use]
    pub const fn pages(&self) -> PageRange {
        PageRange {
            start: self.page_start,
            end: self.page_end,
        }
    }
}

/// A lecture proposed by retrieval, bundled with its best evidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    /// Lecture identifier.
    pub lecture_id: i64,
    /// Lecture title.
    pub title: String,
    /// Owning block name.
    pub block_name: String,
    /// Display path `Block > Lecture`.
    pub full_path: String,
    /// Aggregate retrieval score (higher is better).
    pub score: f64,
    /// Ordered evidence snippets (best first, at most three).
    pub evidence: Vec<Evidence>,
    /// Expanded context assembled by the context expander, when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_text: Option<String>,
    /// Chunks contributing to `parent_text`, in concatenation order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parent_chunk_ids: Vec<i64>,
    /// Page ranges of the contributing chunks.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parent_page_ranges: Vec<PageRange>,
}

impl Candidate {
    /// Chunk ids offered as evidence for this candidate.
    #[must_use]
    pub fn evidence_chunk_ids(&self) -> Vec<i64> {
        self.evidence.iter().map(|e| e.chunk_id).collect()
    }
}

/// Evidence row inside a classification decision.
///
/// Unlike candidate [`Evidence`], the judge echoes these back; the
/// post-processor re-anchors pages and quotes to the candidate snippets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeEvidence {
    /// Lecture the quote supports.
    pub lecture_id: Option<i64>,
    /// First page of the source passage.
    pub page_start: Option<i64>,
    /// Last page of the source passage.
    pub page_end: Option<i64>,
    /// Quoted snippet.
    pub quote: String,
    /// Source chunk.
    pub chunk_id: Option<i64>,
}

/// Final classification decision for one question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationDecision {
    /// Chosen lecture; `None` iff `no_match`.
    pub lecture_id: Option<i64>,
    /// Confidence in `[0, 1]`.
    pub confidence: f64,
    /// Short rationale.
    pub reason: String,
    /// Short study hint.
    pub study_hint: String,
    /// Evidence for the chosen lecture; empty iff `no_match`.
    pub evidence: Vec<JudgeEvidence>,
    /// Whether no candidate lecture explains the question.
    pub no_match: bool,
    /// Producing model, or [`AUTO_CONFIRM_MODEL_NAME`].
    pub model_name: String,
    /// Candidate lectures that were considered.
    pub candidate_ids: Vec<i64>,
    /// Whether the rule gate decided without the judge.
    pub auto_confirmed: bool,
}

impl ClassificationDecision {
    /// Builds a `no_match` decision with the given reason.
    #[must_use]
    pub fn no_match(reason: String, model_name: String, candidate_ids: Vec<i64>) -> Self {
        Self {
            lecture_id: None,
            confidence: 0.0,
            reason,
            study_hint: String::new(),
            evidence: Vec::new(),
            no_match: true,
            model_name,
            candidate_ids,
            auto_confirmed: false,
        }
    }

    /// Verifies the `no_match ⇔ lecture_id is null ⇔ evidence empty` law.
    #[must_use]
    pub fn is_coherent(&self) -> bool {
        if self.no_match {
            self.lecture_id.is_none() && self.evidence.is_empty()
        } else {
            self.lecture_id.is_some()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_label_collapses() {
        let range = PageRange {
            start: Some(12),
            end: Some(12),
        };
        assert_eq!(range.label(), "p.12");
    }

    #[test]
    fn test_page_label_range() {
        let range = PageRange {
            start: Some(12),
            end: Some(13),
        };
        assert_eq!(range.label(), "p.12-13");
    }

    #[test]
    fn test_page_label_unknown() {
        assert_eq!(PageRange::default().label(), "p.?");
        let half = PageRange {
            start: Some(4),
            end: None,
        };
        assert_eq!(half.label(), "p.4");
    }

    #[test]
    fn test_no_match_decision_coherent() {
        let decision =
            ClassificationDecision::no_match("no candidates".to_string(), "m".to_string(), vec![]);
        assert!(decision.is_coherent());
        assert!(decision.no_match);
        assert!(decision.evidence.is_empty());
    }

    #[test]
    fn test_incoherent_decision_detected() {
        let mut decision =
            ClassificationDecision::no_match("r".to_string(), "m".to_string(), vec![1]);
        decision.lecture_id = Some(1);
        assert!(!decision.is_coherent());
    }

    #[test]
    fn test_evidence_chunk_ids() {
        let candidate = Candidate {
            lecture_id: 1,
            title: "t".to_string(),
            block_name: "b".to_string(),
            full_path: "b > t".to_string(),
            score: 1.0,
            evidence: vec![
                Evidence {
                    chunk_id: 10,
                    page_start: None,
                    page_end: None,
                    snippet: String::new(),
                    score: None,
                },
                Evidence {
                    chunk_id: 11,
                    page_start: None,
                    page_end: None,
                    snippet: String::new(),
                    score: None,
                },
            ],
            parent_text: None,
            parent_chunk_ids: Vec::new(),
            parent_page_ranges: Vec::new(),
        };
        assert_eq!(candidate.evidence_chunk_ids(), vec![10, 11]);
    }
}
