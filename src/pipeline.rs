//! Classification pipeline: RETRIEVE → EXPAND → JUDGE for one question.
//!
//! The single entry point for classifying a question. Stages in order:
//! candidate retrieval through the configured mode, feature extraction for
//! the auto-confirm and uncertainty gates, optional same-lecture context
//! expansion for uncertain cases, and the LLM judge — unless the rule gate
//! already confirmed the top lecture, in which case the judge is skipped and
//! the decision carries the `auto_confirm_v2` model-name sentinel.
//!
//! The pipeline owns no storage: callers hand in a [`Retriever`] (whose
//! catalog they refresh at their own cadence) so batch workers can interleave
//! classification with job-row writes on a separate connection.

use crate::cache::ResultCache;
use crate::config::EngineConfig;
use crate::core::{
    AUTO_CONFIRM_MODEL_NAME, Candidate, ClassificationDecision, JudgeEvidence, Question,
    RequestMeta,
};
use crate::embedding::Embedder;
use crate::error::Result;
use crate::expand::expand_candidates;
use crate::judge::classify_single;
use crate::llm::LlmProvider;
use crate::search::{
    DEFAULT_TOP_K_LECTURES, DEFAULT_TOP_N, EmbeddingIndex, Retriever, RetrievalFeatures,
    auto_confirm_v2, is_uncertain,
};
use crate::storage::Storage;

/// Top-k preserved in feature ranking lists.
const FEATURES_TOP_K: usize = 5;

/// Resolves a scope filter to lecture ids.
///
/// Explicit `lecture_ids` win; otherwise block/folder resolve through
/// storage. `None` means no restriction.
///
/// # Errors
///
/// Returns an error if the scope query fails.
pub fn resolve_scope(storage: &dyn Storage, meta: &RequestMeta) -> Result<Option<Vec<i64>>> {
    if let Some(ids) = &meta.lecture_ids {
        return Ok(Some(ids.clone()));
    }
    storage.resolve_lecture_ids(meta.block_id, meta.folder_id, meta.include_descendants)
}

/// One-question classification pipeline.
pub struct ClassificationPipeline<'a> {
    embedder: Option<&'a dyn Embedder>,
    llm: &'a dyn LlmProvider,
    index: &'a EmbeddingIndex,
    config: &'a EngineConfig,
    cache: Option<&'a ResultCache>,
    config_hash: String,
}

impl<'a> ClassificationPipeline<'a> {
    /// Creates a pipeline over the engine's services.
    #[must_use]
    pub fn new(
        embedder: Option<&'a dyn Embedder>,
        llm: &'a dyn LlmProvider,
        index: &'a EmbeddingIndex,
        config: &'a EngineConfig,
        cache: Option<&'a ResultCache>,
    ) -> Self {
        Self {
            embedder,
            llm,
            index,
            config,
            cache,
            config_hash: config.config_hash(),
        }
    }

    /// Builds a retriever over `storage` with a fresh catalog snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the catalog query fails.
    pub fn retriever(&self, storage: &'a dyn Storage) -> Result<Retriever<'a>> {
        let mut retriever =
            Retriever::new(storage, self.embedder, self.llm, self.index, self.config);
        retriever.refresh_catalog()?;
        Ok(retriever)
    }

    /// Classifies one question, resolving scope and building a retriever.
    ///
    /// Convenience wrapper for single-shot callers; batch workers construct
    /// one retriever per job and call [`Self::classify_one`] directly.
    ///
    /// # Errors
    ///
    /// Returns an error for storage or lexical-index failures. Model-quality
    /// problems never error; they yield `no_match` decisions.
    pub fn classify_question(
        &self,
        storage: &'a dyn Storage,
        question: &Question,
        scope: &RequestMeta,
    ) -> Result<ClassificationDecision> {
        let lecture_ids = resolve_scope(storage, scope)?;
        let retriever = self.retriever(storage)?;
        self.classify_one(&retriever, question, lecture_ids.as_deref())
    }

    /// Runs the pipeline stages for one question against a prepared
    /// retriever.
    ///
    /// # Errors
    ///
    /// Returns an error for storage or lexical-index failures.
    pub fn classify_one(
        &self,
        retriever: &Retriever<'_>,
        question: &Question,
        lecture_ids: Option<&[i64]>,
    ) -> Result<ClassificationDecision> {
        let question_text = question.classification_text();

        if let Some(cache) = self.cache {
            if let Some(hit) =
                cache.get(question.id, &self.config_hash, &self.config.judge.model_name)
            {
                tracing::debug!(question_id = question.id, "result cache hit");
                return Ok(hit);
            }
        }

        // RETRIEVE
        let mut candidates = retriever.find_candidates(
            &question_text,
            DEFAULT_TOP_K_LECTURES,
            Some(question.id),
            lecture_ids,
        )?;

        // GATE + EXPAND
        if self.config.auto_confirm.enabled || self.config.expansion.parent_enabled {
            let artifacts = retriever.build_artifacts(
                &question_text,
                Some(question.id),
                DEFAULT_TOP_N,
                FEATURES_TOP_K,
            )?;
            let features = &artifacts.features;

            let auto = self.config.auto_confirm.enabled
                && auto_confirm_v2(
                    features,
                    f64::from(self.config.auto_confirm.delta),
                    self.config.auto_confirm.max_bm25_rank,
                );
            let uncertain = is_uncertain(
                features,
                f64::from(self.config.auto_confirm.delta_uncertain),
                self.config.auto_confirm.min_chunk_len,
                auto,
            );

            if auto && !uncertain {
                if let Some(decision) = auto_confirm_decision(features, &candidates) {
                    tracing::debug!(question_id = question.id, "auto-confirmed, judge skipped");
                    return Ok(decision);
                }
            }
            if self.config.expansion.parent_enabled && uncertain {
                candidates = expand_candidates(
                    retriever.storage(),
                    &self.config.expansion,
                    candidates,
                );
            }
        }

        // JUDGE
        let decision = classify_single(
            self.llm,
            &self.config.judge,
            &question_text,
            &question.choices,
            &candidates,
        );

        if let Some(cache) = self.cache {
            cache.set(
                question.id,
                &self.config_hash,
                &self.config.judge.model_name,
                decision.clone(),
            );
        }
        Ok(decision)
    }
}

/// Builds the skip-LLM decision from gate features.
///
/// Requires the hybrid top-1 lecture to be present in the candidate set
/// (scope restriction can exclude it, in which case the judge runs after
/// all). Evidence copies from the confirmed candidate so the decision
/// invariants hold.
fn auto_confirm_decision(
    features: &RetrievalFeatures,
    candidates: &[Candidate],
) -> Option<ClassificationDecision> {
    let lecture_id = features.hybrid_top1_lecture_id?;
    let candidate = candidates.iter().find(|c| c.lecture_id == lecture_id)?;
    let evidence: Vec<JudgeEvidence> = candidate
        .evidence
        .iter()
        .map(|e| JudgeEvidence {
            lecture_id: Some(lecture_id),
            page_start: e.page_start,
            page_end: e.page_end,
            quote: e.snippet.clone(),
            chunk_id: Some(e.chunk_id),
        })
        .collect();
    if evidence.is_empty() {
        return None;
    }
    Some(ClassificationDecision {
        lecture_id: Some(lecture_id),
        confidence: 1.0,
        reason: "lexical and hybrid retrieval agree on the top passage with a clear margin"
            .to_string(),
        study_hint: String::new(),
        evidence,
        no_match: false,
        model_name: AUTO_CONFIRM_MODEL_NAME.to_string(),
        candidate_ids: candidates.iter().map(|c| c.lecture_id).collect(),
        auto_confirmed: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Evidence, LectureChunk};
    use crate::embedding::HashingEmbedder;
    use crate::error::{Error, LlmError};
    use crate::llm::GenerationParams;
    use crate::storage::SqliteStorage;

    /// Provider that fails permanently; proves the judge was skipped when a
    /// decision still comes back confirmed.
    struct FailingLlm;

    impl LlmProvider for FailingLlm {
        fn generate(&self, _: &str, _: &str, _: &GenerationParams) -> Result<String> {
            Err(Error::Llm(LlmError::Permanent("should not be called".to_string())))
        }
    }

    /// Provider returning one fixed JSON decision.
    struct FixedLlm(String);

    impl LlmProvider for FixedLlm {
        fn generate(&self, _: &str, _: &str, _: &GenerationParams) -> Result<String> {
            Ok(self.0.clone())
        }
    }

    fn test_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.retrieval.embedding_model_name = "hashing-64".to_string();
        config.retrieval.embedding_dim = 64;
        config.retrieval.embedding_top_n = 50;
        config
    }

    /// Corpus where one long chunk dominates every signal for the query
    /// "P wave atrial depolarization ECG rhythm".
    fn aligned_storage() -> (SqliteStorage, i64) {
        let mut storage = SqliteStorage::in_memory().unwrap();
        storage.init().unwrap();
        let block = storage.add_block("Cardiology", 1).unwrap();
        let ecg = storage.add_lecture(block, None, "ECG basics", 1).unwrap();
        let other = storage.add_lecture(block, None, "Renal", 2).unwrap();

        let strong = format!(
            "P wave atrial depolarization ECG rhythm. {}",
            "The atrial depolarization wave precedes the ventricular complex on the ECG \
             rhythm strip and its P wave morphology localizes the pacemaker. "
                .repeat(3)
        );
        let embedder = HashingEmbedder::new(64);
        for (lecture, content) in [
            (ecg, strong.as_str()),
            (ecg, "Ventricular repolarization and the T wave segment."),
            (other, "Glomerular filtration and sodium handling in the nephron."),
        ] {
            let chunk_id = storage
                .add_chunk(&LectureChunk::new(lecture, content.to_string()).with_pages(1, 2))
                .unwrap();
            let vector = crate::embedding::Embedder::embed(&embedder, content).unwrap();
            storage
                .upsert_embedding(chunk_id, lecture, "hashing-64", &vector)
                .unwrap();
        }
        (storage, ecg)
    }

    fn question(id: i64, content: &str) -> Question {
        Question {
            id,
            content: content.to_string(),
            ..Question::default()
        }
    }

    #[test]
    fn test_auto_confirm_short_circuits_judge() {
        let (storage, ecg) = aligned_storage();
        let config = test_config();
        let embedder = HashingEmbedder::new(64);
        let index = EmbeddingIndex::new();
        let llm = FailingLlm;
        let pipeline = ClassificationPipeline::new(Some(&embedder), &llm, &index, &config, None);

        let decision = pipeline
            .classify_question(
                &storage,
                &question(1, "P wave atrial depolarization ECG rhythm"),
                &RequestMeta::default(),
            )
            .unwrap();

        assert!(decision.auto_confirmed);
        assert_eq!(decision.model_name, AUTO_CONFIRM_MODEL_NAME);
        assert_eq!(decision.lecture_id, Some(ecg));
        assert!((decision.confidence - 1.0).abs() < f64::EPSILON);
        assert!(!decision.evidence.is_empty());
        assert!(decision.candidate_ids.contains(&ecg));
        assert!(decision.is_coherent());
    }

    #[test]
    fn test_judge_runs_when_gate_disabled() {
        let (storage, ecg) = aligned_storage();
        let mut config = test_config();
        config.auto_confirm.enabled = false;
        let embedder = HashingEmbedder::new(64);
        let index = EmbeddingIndex::new();
        let llm = FixedLlm(format!(
            "{{\"lecture_id\": {ecg}, \"confidence\": 0.8, \"reason\": \"r\", \"study_hint\": \"h\", \"no_match\": false, \"evidence\": []}}"
        ));
        let pipeline = ClassificationPipeline::new(Some(&embedder), &llm, &index, &config, None);

        let decision = pipeline
            .classify_question(
                &storage,
                &question(1, "P wave atrial depolarization ECG rhythm"),
                &RequestMeta::default(),
            )
            .unwrap();

        assert!(!decision.auto_confirmed);
        assert_eq!(decision.lecture_id, Some(ecg));
        assert_eq!(decision.model_name, config.judge.model_name);
    }

    #[test]
    fn test_scope_restriction_forces_no_match() {
        let (storage, _) = aligned_storage();
        let mut config = test_config();
        config.auto_confirm.enabled = false;
        let embedder = HashingEmbedder::new(64);
        let index = EmbeddingIndex::new();
        let llm = FailingLlm;
        let pipeline = ClassificationPipeline::new(Some(&embedder), &llm, &index, &config, None);

        // Lecture 999 has no chunks, so retrieval yields no candidates and
        // the judge is never consulted.
        let decision = pipeline
            .classify_question(
                &storage,
                &question(1, "P wave atrial depolarization ECG rhythm"),
                &RequestMeta {
                    lecture_ids: Some(vec![999]),
                    ..RequestMeta::default()
                },
            )
            .unwrap();
        assert!(decision.no_match);
        assert!(decision.candidate_ids.is_empty());
    }

    #[test]
    fn test_cache_hit_bypasses_pipeline() {
        let (storage, _) = aligned_storage();
        let config = test_config();
        let embedder = HashingEmbedder::new(64);
        let index = EmbeddingIndex::new();
        let llm = FailingLlm;
        let dir = tempfile::tempdir().unwrap();
        let cache = ResultCache::new(dir.path().join("cache.json"));

        let cached_decision = ClassificationDecision::no_match(
            "cached".to_string(),
            config.judge.model_name.clone(),
            vec![],
        );
        cache.set(
            1,
            &config.config_hash(),
            &config.judge.model_name,
            cached_decision,
        );

        let pipeline =
            ClassificationPipeline::new(Some(&embedder), &llm, &index, &config, Some(&cache));
        let decision = pipeline
            .classify_question(&storage, &question(1, "anything at all"), &RequestMeta::default())
            .unwrap();
        assert_eq!(decision.reason, "cached");
    }

    #[test]
    fn test_judge_decision_written_to_cache() {
        let (storage, ecg) = aligned_storage();
        let mut config = test_config();
        config.auto_confirm.enabled = false;
        let embedder = HashingEmbedder::new(64);
        let index = EmbeddingIndex::new();
        let llm = FixedLlm(format!(
            "{{\"lecture_id\": {ecg}, \"confidence\": 0.7, \"reason\": \"r\", \"no_match\": false, \"evidence\": []}}"
        ));
        let dir = tempfile::tempdir().unwrap();
        let cache = ResultCache::new(dir.path().join("cache.json"));
        let pipeline =
            ClassificationPipeline::new(Some(&embedder), &llm, &index, &config, Some(&cache));

        pipeline
            .classify_question(
                &storage,
                &question(5, "P wave atrial depolarization ECG rhythm"),
                &RequestMeta::default(),
            )
            .unwrap();
        assert!(cache
            .get(5, &config.config_hash(), &config.judge.model_name)
            .is_some());
    }

    #[test]
    fn test_auto_confirm_decision_requires_candidate() {
        let features = RetrievalFeatures {
            hybrid_top1_lecture_id: Some(42),
            ..RetrievalFeatures::default()
        };
        assert!(auto_confirm_decision(&features, &[]).is_none());

        let candidate = Candidate {
            lecture_id: 42,
            title: "t".to_string(),
            block_name: "b".to_string(),
            full_path: "b > t".to_string(),
            score: 1.0,
            evidence: vec![Evidence {
                chunk_id: 7,
                page_start: Some(1),
                page_end: Some(1),
                snippet: "s".to_string(),
                score: None,
            }],
            parent_text: None,
            parent_chunk_ids: Vec::new(),
            parent_page_ranges: Vec::new(),
        };
        let decision = auto_confirm_decision(&features, &[candidate]).unwrap();
        assert_eq!(decision.lecture_id, Some(42));
        assert_eq!(decision.evidence[0].chunk_id, Some(7));
    }

    #[test]
    fn test_resolve_scope_explicit_ids_win() {
        let (storage, _) = aligned_storage();
        let meta = RequestMeta {
            block_id: Some(1),
            lecture_ids: Some(vec![5, 6]),
            ..RequestMeta::default()
        };
        assert_eq!(resolve_scope(&storage, &meta).unwrap(), Some(vec![5, 6]));
    }
}
