//! End-to-end tests for the classification engine.
//!
//! Drives the real pipeline — FTS5 index, hashing embeddings, fusion, gate,
//! judge, batch jobs, and apply — against a file-backed database with a
//! scripted LLM provider in place of the network.

#![allow(clippy::expect_used)]

use lectern::apply::{ApplyMode, apply_classification_results};
use lectern::core::{
    AUTO_CONFIRM_MODEL_NAME, ClassificationStatus, JobStatus, LectureChunk, Question, RequestMeta,
};
use lectern::error::Result;
use lectern::job::BatchProcessor;
use lectern::llm::{GenerationParams, LlmProvider};
use lectern::pipeline::ClassificationPipeline;
use lectern::search::EmbeddingIndex;
use lectern::storage::{SqliteStorage, Storage};
use lectern::{EngineConfig, embedding::HashingEmbedder};
use std::time::{Duration, Instant};
use tempfile::TempDir;

const DIM: usize = 64;

/// Provider that replays a fixed response for every call.
struct FixedLlm(String);

impl LlmProvider for FixedLlm {
    fn generate(&self, _: &str, _: &str, _: &GenerationParams) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// Provider that must never be reached.
struct UnreachableLlm;

impl LlmProvider for UnreachableLlm {
    fn generate(&self, _: &str, _: &str, _: &GenerationParams) -> Result<String> {
        Err(lectern::error::Error::Llm(
            lectern::error::LlmError::Permanent("provider should not be reached".to_string()),
        ))
    }
}

fn engine_config(dir: &TempDir) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.retrieval.embedding_model_name = format!("hashing-{DIM}");
    config.retrieval.embedding_dim = DIM;
    config.retrieval.embedding_top_n = 50;
    config.cache_path = dir.path().join("cache.json");
    config
}

struct Corpus {
    _dir: TempDir,
    db_path: std::path::PathBuf,
    config: EngineConfig,
    ecg_lecture: i64,
    renal_lecture: i64,
    folder_lectures: Vec<i64>,
    ecg_chunk: i64,
    question: i64,
}

/// Builds a corpus with a dominant ECG lecture, a renal lecture, and a
/// folder subtree of three lectures used by the scope tests.
fn build_corpus() -> Corpus {
    let dir = TempDir::new().expect("tempdir");
    let db_path = dir.path().join("lectern.db");
    let config = engine_config(&dir);

    let mut storage = SqliteStorage::open(&db_path).expect("open");
    storage.init().expect("init");

    let cardio = storage.add_block("Cardiology", 1).expect("block");
    let ecg_lecture = storage
        .add_lecture(cardio, None, "ECG basics", 1)
        .expect("lecture");
    let renal_block = storage.add_block("Renal", 2).expect("block");
    let renal_lecture = storage
        .add_lecture(renal_block, None, "Acid-base disorders", 1)
        .expect("lecture");

    // Folder subtree: root -> child, one lecture each plus one at the root
    // level of the block.
    let folder_root = storage.add_folder(cardio, None, "Electrophysiology", 1).expect("folder");
    let folder_child = storage
        .add_folder(cardio, Some(folder_root), "Arrhythmias", 1)
        .expect("folder");
    let in_root = storage
        .add_lecture(cardio, Some(folder_root), "Conduction system", 2)
        .expect("lecture");
    let in_child = storage
        .add_lecture(cardio, Some(folder_child), "Atrial fibrillation", 3)
        .expect("lecture");

    let embedder = HashingEmbedder::new(DIM);
    let model = format!("hashing-{DIM}");

    let strong_ecg = format!(
        "P wave atrial depolarization ECG rhythm. {}",
        "The atrial depolarization wave precedes the ventricular complex on the ECG \
         rhythm strip and its P wave morphology localizes the pacemaker. "
            .repeat(3)
    );
    let seeds = [
        (ecg_lecture, strong_ecg.as_str(), 12, 13),
        (ecg_lecture, "Ventricular repolarization shapes the T wave.", 14, 14),
        (
            renal_lecture,
            "Metabolic acidosis lowers bicarbonate and compensatory hyperventilation lowers pCO2.",
            40,
            41,
        ),
        (in_root, "The AV node delays conduction between atria and ventricles.", 3, 3),
        (in_child, "Atrial fibrillation shows an irregularly irregular rhythm.", 8, 9),
    ];

    let mut first_chunk = None;
    for (lecture, content, start, end) in seeds {
        let chunk_id = storage
            .add_chunk(
                &LectureChunk::new(lecture, content.to_string())
                    .with_pages(start, end)
                    .with_material(1),
            )
            .expect("chunk");
        if first_chunk.is_none() {
            first_chunk = Some(chunk_id);
        }
        let vector =
            lectern::embedding::Embedder::embed(&embedder, content).expect("embed");
        storage
            .upsert_embedding(chunk_id, lecture, &model, &vector)
            .expect("embedding");
    }

    let question = storage
        .add_question(&Question {
            content: "P wave atrial depolarization ECG rhythm".to_string(),
            choices: vec!["sinus rhythm".to_string(), "atrial flutter".to_string()],
            question_number: Some(1),
            exam_title: Some("2021 Physiology Midterm".to_string()),
            ..Question::default()
        })
        .expect("question");

    Corpus {
        _dir: dir,
        db_path,
        config,
        ecg_lecture,
        renal_lecture,
        folder_lectures: vec![in_root, in_child],
        ecg_chunk: first_chunk.expect("chunk id"),
        question,
    }
}

fn wait_for_terminal(db_path: &std::path::Path, job_id: i64) -> lectern::ClassificationJob {
    let storage = SqliteStorage::open(db_path).expect("open");
    let deadline = Instant::now() + Duration::from_secs(20);
    loop {
        let job = storage.get_job(job_id).expect("get_job").expect("job row");
        if job.is_complete() {
            return job;
        }
        assert!(Instant::now() < deadline, "job did not finish in time");
        std::thread::sleep(Duration::from_millis(25));
    }
}

#[test]
fn test_auto_confirm_short_circuit() {
    // Strong, consistent retrieval signals skip the judge entirely.
    let corpus = build_corpus();
    let storage = SqliteStorage::open(&corpus.db_path).expect("open");
    let question = storage
        .get_question(corpus.question)
        .expect("get")
        .expect("question");

    let embedder = HashingEmbedder::new(DIM);
    let index = EmbeddingIndex::new();
    let llm = UnreachableLlm;
    let pipeline =
        ClassificationPipeline::new(Some(&embedder), &llm, &index, &corpus.config, None);

    let decision = pipeline
        .classify_question(&storage, &question, &RequestMeta::default())
        .expect("classify");

    assert!(decision.auto_confirmed);
    assert_eq!(decision.model_name, AUTO_CONFIRM_MODEL_NAME);
    assert_eq!(decision.lecture_id, Some(corpus.ecg_lecture));
    assert!((decision.confidence - 1.0).abs() < f64::EPSILON);
    assert!(decision.is_coherent());
    // Evidence anchors to the dominant chunk.
    assert!(decision
        .evidence
        .iter()
        .any(|e| e.chunk_id == Some(corpus.ecg_chunk)));
}

#[test]
fn test_out_of_candidate_judge_repair() {
    // The judge names a lecture that retrieval never proposed; the decision
    // downgrades to no_match with confidence retained.
    let corpus = build_corpus();
    let mut config = corpus.config.clone();
    config.auto_confirm.enabled = false;
    let storage = SqliteStorage::open(&corpus.db_path).expect("open");
    let question = storage
        .get_question(corpus.question)
        .expect("get")
        .expect("question");

    let embedder = HashingEmbedder::new(DIM);
    let index = EmbeddingIndex::new();
    let llm = FixedLlm(
        "{\"lecture_id\": 424242, \"confidence\": 0.9, \"reason\": \"confident but wrong\", \"no_match\": false, \"evidence\": []}"
            .to_string(),
    );
    let pipeline = ClassificationPipeline::new(Some(&embedder), &llm, &index, &config, None);

    let decision = pipeline
        .classify_question(&storage, &question, &RequestMeta::default())
        .expect("classify");

    assert!(decision.no_match);
    assert!(decision.lecture_id.is_none());
    assert!(decision.evidence.is_empty());
    assert!((decision.confidence - 0.9).abs() < f64::EPSILON);
    assert!(!decision.candidate_ids.contains(&424_242));
}

#[test]
fn test_judge_json_repair_path() {
    // Fenced JSON with a trailing comma still parses into a decision whose
    // evidence re-anchors to the candidate snippet.
    let corpus = build_corpus();
    let mut config = corpus.config.clone();
    config.auto_confirm.enabled = false;
    let storage = SqliteStorage::open(&corpus.db_path).expect("open");
    let question = storage
        .get_question(corpus.question)
        .expect("get")
        .expect("question");

    let embedder = HashingEmbedder::new(DIM);
    let index = EmbeddingIndex::new();
    let llm = FixedLlm(format!(
        "```json\n{{\"lecture_id\": {}, \"confidence\": 0.8, \"reason\": \"matches ECG lecture\", \"no_match\": false, \"evidence\": [{{\"chunk_id\": {}, \"quote\": \"P wave\", \"page_start\": 12, \"page_end\": 13}}] ,}}\n```",
        corpus.ecg_lecture, corpus.ecg_chunk
    ));
    let pipeline = ClassificationPipeline::new(Some(&embedder), &llm, &index, &config, None);

    let decision = pipeline
        .classify_question(&storage, &question, &RequestMeta::default())
        .expect("classify");

    assert_eq!(decision.lecture_id, Some(corpus.ecg_lecture));
    assert!((decision.confidence - 0.8).abs() < f64::EPSILON);
    assert!(!decision.no_match);
    let anchored = decision
        .evidence
        .iter()
        .find(|e| e.chunk_id == Some(corpus.ecg_chunk))
        .expect("evidence for the quoted chunk");
    assert_eq!(anchored.quote, "P wave");
    assert_eq!(anchored.page_start, Some(12));
}

#[test]
fn test_folder_scoped_job_yields_no_match_outside_scope() {
    // A job scoped to the folder subtree retrieves only its lectures; the
    // ECG question's best chunks live elsewhere, so it resolves to no_match.
    let corpus = build_corpus();
    let llm = FixedLlm(
        "{\"lecture_id\": null, \"confidence\": 0.0, \"reason\": \"none fit\", \"no_match\": true, \"evidence\": []}"
            .to_string(),
    );
    let processor = BatchProcessor::new(
        corpus.db_path.clone(),
        corpus.config.clone(),
        Some(Box::new(HashingEmbedder::new(DIM))),
        Box::new(llm),
    );

    let meta = RequestMeta {
        block_id: Some(1),
        folder_id: Some(1),
        include_descendants: true,
        lecture_ids: None,
    };
    let job_id = processor
        .start_classification_job(&[corpus.question], meta)
        .expect("start job");
    let job = wait_for_terminal(&corpus.db_path, job_id);

    assert_eq!(job.status, JobStatus::Completed);
    let result = &job.payload.results[0];
    assert!(result.decision.no_match);
    assert!(result.decision.lecture_id.is_none());
    // Every candidate the scoped retrieval produced came from the subtree.
    for id in &result.decision.candidate_ids {
        assert!(corpus.folder_lectures.contains(id), "lecture {id} out of scope");
    }
    // Scope recorded in the payload for preview.
    assert_eq!(job.payload.request_meta.folder_id, Some(1));
}

#[test]
fn test_batch_then_apply_idempotent() {
    // Full flow: batch job, then two identical apply calls converge.
    let corpus = build_corpus();
    let mut config = corpus.config.clone();
    config.auto_confirm.enabled = false;
    let llm = FixedLlm(format!(
        "{{\"lecture_id\": {}, \"confidence\": 0.85, \"reason\": \"ECG morphology\", \"study_hint\": \"review P waves\", \"no_match\": false, \"evidence\": [{{\"chunk_id\": {}, \"quote\": \"P wave\", \"page_start\": 12, \"page_end\": 13}}]}}",
        corpus.ecg_lecture, corpus.ecg_chunk
    ));
    let processor = BatchProcessor::new(
        corpus.db_path.clone(),
        config,
        Some(Box::new(HashingEmbedder::new(DIM))),
        Box::new(llm),
    );

    let job_id = processor
        .start_classification_job(&[corpus.question], RequestMeta::default())
        .expect("start job");
    let job = wait_for_terminal(&corpus.db_path, job_id);
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.processed_count, job.success_count + job.failed_count);

    let result = &job.payload.results[0];
    assert_eq!(result.decision.lecture_id, Some(corpus.ecg_lecture));
    assert!(result.would_change_lecture);
    assert_eq!(result.exam_title.as_deref(), Some("2021 Physiology Midterm"));

    let mut storage = SqliteStorage::open(&corpus.db_path).expect("open");
    for _ in 0..2 {
        let applied = apply_classification_results(
            &mut storage,
            &[corpus.question],
            job_id,
            ApplyMode::All,
        )
        .expect("apply");
        assert_eq!(applied, 1);
    }

    let question = storage
        .get_question(corpus.question)
        .expect("get")
        .expect("question");
    assert_eq!(question.lecture_id, Some(corpus.ecg_lecture));
    assert!(question.is_classified);
    assert_eq!(question.status, ClassificationStatus::AiConfirmed);
    assert_eq!(question.ai.suggested_lecture_id, Some(corpus.ecg_lecture));
    assert_eq!(
        question.ai.suggested_lecture_title.as_deref(),
        Some("Cardiology > ECG basics")
    );

    let matches = storage
        .list_question_matches(corpus.question)
        .expect("matches");
    assert!(!matches.is_empty());
    assert!(matches[0].is_primary);
    assert!(matches.iter().skip(1).all(|m| !m.is_primary));
    // Snippet substring law: every snippet appears in its source chunk.
    for m in &matches {
        let chunk = storage
            .get_chunk(m.chunk_id.expect("chunk id"))
            .expect("get")
            .expect("chunk");
        let collapse =
            |s: &str| s.split_whitespace().collect::<Vec<_>>().join(" ");
        assert!(collapse(&chunk.content).contains(&collapse(&m.snippet)));
    }
}

#[test]
fn test_cached_decision_reused_across_jobs() {
    // Second job for the same question under the same config reads the
    // cache and never consults the provider again.
    let corpus = build_corpus();
    let mut config = corpus.config.clone();
    config.auto_confirm.enabled = false;

    let llm = FixedLlm(format!(
        "{{\"lecture_id\": {}, \"confidence\": 0.85, \"reason\": \"first run\", \"no_match\": false, \"evidence\": []}}",
        corpus.ecg_lecture
    ));
    let processor = BatchProcessor::new(
        corpus.db_path.clone(),
        config.clone(),
        Some(Box::new(HashingEmbedder::new(DIM))),
        Box::new(llm),
    );
    let job_id = processor
        .start_classification_job(&[corpus.question], RequestMeta::default())
        .expect("start job");
    wait_for_terminal(&corpus.db_path, job_id);
    drop(processor);

    // New processor with a provider that would fail the judge.
    let processor = BatchProcessor::new(
        corpus.db_path.clone(),
        config,
        Some(Box::new(HashingEmbedder::new(DIM))),
        Box::new(UnreachableLlm),
    );
    let job_id = processor
        .start_classification_job(&[corpus.question], RequestMeta::default())
        .expect("start job");
    let job = wait_for_terminal(&corpus.db_path, job_id);

    assert_eq!(job.status, JobStatus::Completed);
    let result = &job.payload.results[0];
    assert_eq!(result.decision.lecture_id, Some(corpus.ecg_lecture));
    assert_eq!(result.decision.reason, "first run");
}

#[test]
fn test_renal_question_classifies_to_renal() {
    // A second question with acid-base wording lands on the renal lecture.
    let corpus = build_corpus();
    let mut storage = SqliteStorage::open(&corpus.db_path).expect("open");
    let question_id = storage
        .add_question(&Question {
            content: "동맥혈 검사에서 metabolic acidosis, bicarbonate 저하, pCO2 보상 저하의 해석은?"
                .to_string(),
            ..Question::default()
        })
        .expect("question");
    drop(storage);

    let mut config = corpus.config.clone();
    config.auto_confirm.enabled = false;
    let llm = FixedLlm(format!(
        "{{\"lecture_id\": {}, \"confidence\": 0.75, \"reason\": \"acid-base\", \"no_match\": false, \"evidence\": []}}",
        corpus.renal_lecture
    ));
    let storage = SqliteStorage::open(&corpus.db_path).expect("open");
    let question = storage
        .get_question(question_id)
        .expect("get")
        .expect("question");
    let embedder = HashingEmbedder::new(DIM);
    let index = EmbeddingIndex::new();
    let pipeline = ClassificationPipeline::new(Some(&embedder), &llm, &index, &config, None);

    let decision = pipeline
        .classify_question(&storage, &question, &RequestMeta::default())
        .expect("classify");
    assert_eq!(decision.lecture_id, Some(corpus.renal_lecture));
    assert!(decision.candidate_ids.contains(&corpus.renal_lecture));
    assert!(!decision.evidence.is_empty());
}
