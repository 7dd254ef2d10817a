//! Apply: commit a job's decisions to the question store.
//!
//! For each requested question the matching payload result is mapped to
//! advisory AI fields (always written) and, depending on the apply mode, a
//! committed assignment with fresh evidence rows. All per-question updates
//! for one call commit in a single transaction.

use crate::core::decision::SNIPPET_MAX_CHARS;
use crate::core::{
    AiSuggestion, ApplyAction, CommitAssignment, MatchSource, Question, QuestionChunkMatch,
    QuestionResult,
};
use crate::error::{Error, JobError, Result, StorageError};
use crate::storage::Storage;
use crate::tokenize::truncate_graphemes;
use std::str::FromStr;

/// Which decisions an apply call is allowed to commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyMode {
    /// Commit every non-`no_match` decision.
    All,
    /// Commit only for questions that are not yet classified.
    OnlyUnclassified,
    /// Commit only when the suggestion differs from the current assignment.
    OnlyChanges,
}

impl FromStr for ApplyMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "all" => Ok(Self::All),
            "only_unclassified" => Ok(Self::OnlyUnclassified),
            "only_changes" => Ok(Self::OnlyChanges),
            other => Err(Error::Config {
                message: format!("unknown apply mode: {other}"),
            }),
        }
    }
}

/// Whether the mode commits this decision for this question.
fn should_commit(mode: ApplyMode, question: &Question, suggested: Option<i64>) -> bool {
    let Some(suggested) = suggested else {
        return false;
    };
    match mode {
        ApplyMode::All => true,
        ApplyMode::OnlyUnclassified => !question.is_classified,
        ApplyMode::OnlyChanges => question.lecture_id != Some(suggested),
    }
}

/// Builds the replacement evidence rows for a committed assignment.
///
/// Missing page and material ids back-fill from the source chunk when it
/// still exists; the first row is primary; snippets truncate to 500 chars.
fn evidence_rows(
    storage: &dyn Storage,
    result: &QuestionResult,
    lecture_id: i64,
    job_id: i64,
) -> Vec<QuestionChunkMatch> {
    result
        .decision
        .evidence
        .iter()
        .enumerate()
        .map(|(idx, item)| {
            let chunk = item
                .chunk_id
                .and_then(|id| storage.get_chunk(id).ok().flatten());
            let (mut page_start, mut page_end) = (item.page_start, item.page_end);
            let mut material_id = None;
            if let Some(chunk) = &chunk {
                page_start = page_start.or(chunk.page_start);
                page_end = page_end.or(chunk.page_end);
                material_id = chunk.material_id;
            }
            QuestionChunkMatch {
                id: None,
                question_id: result.question_id,
                lecture_id,
                chunk_id: item.chunk_id,
                material_id,
                page_start,
                page_end,
                snippet: truncate_graphemes(item.quote.trim(), SNIPPET_MAX_CHARS),
                score: None,
                source: MatchSource::Ai,
                job_id: Some(job_id),
                is_primary: idx == 0,
            }
        })
        .collect()
}

/// Applies a completed job's results to the requested questions.
///
/// Questions with no matching payload entry are skipped. Advisory AI fields
/// are written for every matched question regardless of mode; the returned
/// count covers committed assignments only.
///
/// # Errors
///
/// Fails when the job does not exist or has not reached a terminal state,
/// or when the transactional update fails (nothing is committed then).
pub fn apply_classification_results(
    storage: &mut dyn Storage,
    question_ids: &[i64],
    job_id: i64,
    mode: ApplyMode,
) -> Result<usize> {
    let job = storage
        .get_job(job_id)?
        .ok_or(Error::Storage(StorageError::JobNotFound { id: job_id }))?;
    if !job.is_complete() {
        return Err(Error::Job(JobError::NotComplete { id: job_id }));
    }

    let mut actions = Vec::new();
    for &question_id in question_ids {
        let Some(result) = job.payload.result_for(question_id) else {
            tracing::debug!(question_id, job_id, "no result in payload, skipped");
            continue;
        };
        let Some(question) = storage.get_question(question_id)? else {
            continue;
        };

        let decision = &result.decision;
        let suggested = if decision.no_match { None } else { decision.lecture_id };
        let suggested_title = match (&result.block_name, &result.lecture_title) {
            (Some(block), Some(title)) => Some(format!("{block} > {title}")),
            (None, Some(title)) => Some(title.clone()),
            _ => None,
        };

        let advisory = AiSuggestion {
            suggested_lecture_id: suggested,
            suggested_lecture_title: suggested_title,
            confidence: Some(decision.confidence),
            reason: Some(decision.reason.clone()),
            model_name: Some(decision.model_name.clone()),
            classified_at: None,
        };

        let commit = if should_commit(mode, &question, suggested) {
            suggested.map(|lecture_id| CommitAssignment {
                lecture_id,
                evidence: evidence_rows(storage, result, lecture_id, job_id),
            })
        } else {
            None
        };

        actions.push(ApplyAction {
            question_id,
            advisory,
            commit,
        });
    }

    let applied = storage.apply_classifications(&actions)?;
    tracing::info!(job_id, applied, total = actions.len(), "apply finished");
    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{
        ClassificationDecision, ClassificationStatus, JudgeEvidence, LectureChunk, RequestMeta,
        ResultPayload,
    };
    use crate::storage::SqliteStorage;

    struct Fixture {
        storage: SqliteStorage,
        lecture: i64,
        chunk: i64,
        question: i64,
    }

    fn fixture() -> Fixture {
        let mut storage = SqliteStorage::in_memory().unwrap();
        storage.init().unwrap();
        let block = storage.add_block("Cardiology", 1).unwrap();
        let lecture = storage.add_lecture(block, None, "ECG basics", 1).unwrap();
        let chunk = storage
            .add_chunk(
                &LectureChunk::new(lecture, "The P wave precedes the QRS".to_string())
                    .with_pages(12, 13)
                    .with_material(4),
            )
            .unwrap();
        let question = storage
            .add_question(&Question {
                content: "Which wave precedes QRS?".to_string(),
                ..Question::default()
            })
            .unwrap();
        Fixture {
            storage,
            lecture,
            chunk,
            question,
        }
    }

    fn decision_for(lecture: i64, chunk: i64) -> ClassificationDecision {
        ClassificationDecision {
            lecture_id: Some(lecture),
            confidence: 0.9,
            reason: "ECG morphology".to_string(),
            study_hint: "review P waves".to_string(),
            evidence: vec![
                JudgeEvidence {
                    lecture_id: Some(lecture),
                    page_start: Some(12),
                    page_end: Some(13),
                    quote: "The P wave precedes".to_string(),
                    chunk_id: Some(chunk),
                },
                JudgeEvidence {
                    lecture_id: Some(lecture),
                    page_start: None,
                    page_end: None,
                    quote: "QRS".to_string(),
                    chunk_id: Some(chunk),
                },
            ],
            no_match: false,
            model_name: "test-model".to_string(),
            candidate_ids: vec![lecture],
            auto_confirmed: false,
        }
    }

    fn completed_job(fixture: &mut Fixture, decision: ClassificationDecision) -> i64 {
        let payload = ResultPayload {
            request_meta: RequestMeta::default(),
            results: vec![QuestionResult {
                question_id: fixture.question,
                question_number: None,
                exam_title: None,
                current_lecture_id: None,
                would_change_lecture: true,
                lecture_title: Some("ECG basics".to_string()),
                block_name: Some("Cardiology".to_string()),
                error: None,
                decision,
            }],
        };
        let job_id = fixture.storage.create_job(1, &payload).unwrap();
        fixture.storage.complete_job(job_id, &payload).unwrap();
        job_id
    }

    #[test]
    fn test_apply_mode_parsing() {
        assert_eq!("all".parse::<ApplyMode>().unwrap(), ApplyMode::All);
        assert_eq!(
            "only_unclassified".parse::<ApplyMode>().unwrap(),
            ApplyMode::OnlyUnclassified
        );
        assert_eq!(
            "only_changes".parse::<ApplyMode>().unwrap(),
            ApplyMode::OnlyChanges
        );
        assert!("everything".parse::<ApplyMode>().is_err());
    }

    #[test]
    fn test_apply_commits_and_writes_evidence() {
        let mut fixture = fixture();
        let decision = decision_for(fixture.lecture, fixture.chunk);
        let job_id = completed_job(&mut fixture, decision);

        let applied = apply_classification_results(
            &mut fixture.storage,
            &[fixture.question],
            job_id,
            ApplyMode::All,
        )
        .unwrap();
        assert_eq!(applied, 1);

        let question = fixture.storage.get_question(fixture.question).unwrap().unwrap();
        assert_eq!(question.lecture_id, Some(fixture.lecture));
        assert!(question.is_classified);
        assert_eq!(question.status, ClassificationStatus::AiConfirmed);
        assert_eq!(question.ai.suggested_lecture_id, Some(fixture.lecture));
        assert_eq!(
            question.ai.suggested_lecture_title.as_deref(),
            Some("Cardiology > ECG basics")
        );
        assert!(question.ai.classified_at.is_some());

        let matches = fixture.storage.list_question_matches(fixture.question).unwrap();
        assert_eq!(matches.len(), 2);
        assert!(matches[0].is_primary);
        assert!(!matches[1].is_primary);
        assert_eq!(matches[0].page_start, Some(12));
        // Missing pages and material back-fill from the chunk.
        assert_eq!(matches[1].page_start, Some(12));
        assert_eq!(matches[1].material_id, Some(4));
        assert_eq!(matches[0].job_id, Some(job_id));
    }

    #[test]
    fn test_apply_idempotent() {
        let mut fixture = fixture();
        let decision = decision_for(fixture.lecture, fixture.chunk);
        let job_id = completed_job(&mut fixture, decision);

        for _ in 0..2 {
            apply_classification_results(
                &mut fixture.storage,
                &[fixture.question],
                job_id,
                ApplyMode::All,
            )
            .unwrap();
        }

        let question = fixture.storage.get_question(fixture.question).unwrap().unwrap();
        assert_eq!(question.lecture_id, Some(fixture.lecture));
        assert!(question.is_classified);
        assert_eq!(question.status, ClassificationStatus::AiConfirmed);
        let matches = fixture.storage.list_question_matches(fixture.question).unwrap();
        assert_eq!(matches.len(), 2);
        let primaries: Vec<bool> = matches.iter().map(|m| m.is_primary).collect();
        assert_eq!(primaries, vec![true, false]);
    }

    #[test]
    fn test_apply_never_commits_no_match() {
        let mut fixture = fixture();
        let decision = ClassificationDecision::no_match(
            "nothing fits".to_string(),
            "test-model".to_string(),
            vec![],
        );
        let job_id = completed_job(&mut fixture, decision);

        let applied = apply_classification_results(
            &mut fixture.storage,
            &[fixture.question],
            job_id,
            ApplyMode::All,
        )
        .unwrap();
        assert_eq!(applied, 0);

        let question = fixture.storage.get_question(fixture.question).unwrap().unwrap();
        assert!(question.lecture_id.is_none());
        assert!(!question.is_classified);
        // Advisory fields are still recorded.
        assert_eq!(question.ai.reason.as_deref(), Some("nothing fits"));
        assert_eq!(question.status, ClassificationStatus::AiSuggested);
    }

    #[test]
    fn test_only_unclassified_skips_classified() {
        let mut fixture = fixture();
        // Classify manually first.
        let other_block = fixture.storage.add_block("Renal", 2).unwrap();
        let other = fixture
            .storage
            .add_lecture(other_block, None, "Nephron", 1)
            .unwrap();
        let decision = decision_for(fixture.lecture, fixture.chunk);
        let job_id = completed_job(&mut fixture, decision);

        // Pre-assign the question to a different lecture.
        let actions = vec![ApplyAction {
            question_id: fixture.question,
            advisory: AiSuggestion::default(),
            commit: Some(CommitAssignment {
                lecture_id: other,
                evidence: Vec::new(),
            }),
        }];
        fixture.storage.apply_classifications(&actions).unwrap();

        let applied = apply_classification_results(
            &mut fixture.storage,
            &[fixture.question],
            job_id,
            ApplyMode::OnlyUnclassified,
        )
        .unwrap();
        assert_eq!(applied, 0);
        let question = fixture.storage.get_question(fixture.question).unwrap().unwrap();
        assert_eq!(question.lecture_id, Some(other));
        // Advisory suggestion still updated.
        assert_eq!(question.ai.suggested_lecture_id, Some(fixture.lecture));
    }

    #[test]
    fn test_only_changes_skips_same_assignment() {
        let mut fixture = fixture();
        let decision = decision_for(fixture.lecture, fixture.chunk);
        let job_id = completed_job(&mut fixture, decision);

        apply_classification_results(
            &mut fixture.storage,
            &[fixture.question],
            job_id,
            ApplyMode::All,
        )
        .unwrap();
        // Same suggestion again under only_changes: nothing to do.
        let applied = apply_classification_results(
            &mut fixture.storage,
            &[fixture.question],
            job_id,
            ApplyMode::OnlyChanges,
        )
        .unwrap();
        assert_eq!(applied, 0);
    }

    #[test]
    fn test_questions_without_results_skipped() {
        let mut fixture = fixture();
        let decision = decision_for(fixture.lecture, fixture.chunk);
        let job_id = completed_job(&mut fixture, decision);
        let applied = apply_classification_results(
            &mut fixture.storage,
            &[987_654],
            job_id,
            ApplyMode::All,
        )
        .unwrap();
        assert_eq!(applied, 0);
    }

    #[test]
    fn test_incomplete_job_rejected() {
        let mut fixture = fixture();
        let job_id = fixture
            .storage
            .create_job(1, &ResultPayload::default())
            .unwrap();
        let err = apply_classification_results(
            &mut fixture.storage,
            &[fixture.question],
            job_id,
            ApplyMode::All,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Job(JobError::NotComplete { .. })));
    }
}
