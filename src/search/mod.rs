//! Hybrid retrieval over the lecture-chunk corpus.
//!
//! Combines FTS5 BM25 with embedding rerank via Reciprocal Rank Fusion and
//! collapses the fused hits into per-lecture candidates. HyDE payloads, when
//! enabled, reshape both the lexical term set and the dense query vector.
//!
//! Degradation policy: an empty match string means "no candidates"; any
//! dense-side failure (unhosted model, dimension mismatch, missing vectors)
//! logs and falls back to lexical-only results. Only a missing lexical index
//! surfaces as an error.

pub mod aggregate;
pub mod dense;
pub mod features;
mod rrf;

pub use aggregate::{DEFAULT_EVIDENCE_PER_LECTURE, DEFAULT_TOP_K_LECTURES, aggregate_candidates};
pub use dense::EmbeddingIndex;
pub use features::{RankedChunk, RetrievalFeatures, auto_confirm_v2, extract_features, is_uncertain};
pub use rrf::{RrfConfig, fuse_rankings};

use crate::config::{EngineConfig, HydeBm25Variant, HydeNegativeMode, HydeStrategy, RetrievalMode};
use crate::core::{Candidate, ChunkHit, LectureInfo};
use crate::embedding::{Embedder, inner_product, l2_normalize, prepare_input};
use crate::error::{Error, Result, RetrievalError};
use crate::hyde::{QueryTransformation, get_query_payload};
use crate::llm::LlmProvider;
use crate::storage::Storage;
use crate::tokenize::{
    EMBEDDING_TEXT_MAX_CHARS, MAX_MATCH_TERMS, QueryNormalizer, build_match_query,
    filter_negative_terms, normalize_embedding_text,
};
use std::collections::HashMap;

/// Default retrieval pool size per list.
pub const DEFAULT_TOP_N: usize = 80;

/// Retrieval lists and derived features for one question.
#[derive(Debug, Clone, Default)]
pub struct RetrievalArtifacts {
    /// BM25 list.
    pub bm25_chunks: Vec<ChunkHit>,
    /// Embedding rerank of the BM25 list.
    pub embed_chunks: Vec<ChunkHit>,
    /// Fused list.
    pub hybrid_chunks: Vec<ChunkHit>,
    /// Derived signals.
    pub features: RetrievalFeatures,
}

/// Candidate retriever over the chunk corpus.
///
/// Owns a lecture-catalog snapshot (refreshed per batch job) and borrows the
/// engine's services; construction is cheap.
pub struct Retriever<'a> {
    storage: &'a dyn Storage,
    embedder: Option<&'a dyn Embedder>,
    llm: &'a dyn LlmProvider,
    index: &'a EmbeddingIndex,
    config: &'a EngineConfig,
    normalizer: QueryNormalizer,
    catalog: HashMap<i64, LectureInfo>,
}

impl<'a> Retriever<'a> {
    /// Creates a retriever with an empty catalog snapshot.
    #[must_use]
    pub fn new(
        storage: &'a dyn Storage,
        embedder: Option<&'a dyn Embedder>,
        llm: &'a dyn LlmProvider,
        index: &'a EmbeddingIndex,
        config: &'a EngineConfig,
    ) -> Self {
        Self {
            storage,
            embedder,
            llm,
            index,
            config,
            normalizer: QueryNormalizer::default(),
            catalog: HashMap::new(),
        }
    }

    /// Reloads the lecture catalog snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the catalog query fails.
    pub fn refresh_catalog(&mut self) -> Result<()> {
        self.catalog = self
            .storage
            .lecture_catalog()?
            .into_iter()
            .map(|info| (info.id, info))
            .collect();
        Ok(())
    }

    /// The current catalog snapshot.
    #[must_use]
    pub const fn catalog(&self) -> &HashMap<i64, LectureInfo> {
        &self.catalog
    }

    /// The underlying storage handle.
    #[must_use]
    pub const fn storage(&self) -> &'a dyn Storage {
        self.storage
    }

    fn hyde_payload(
        &self,
        question_id: Option<i64>,
        question_text: &str,
    ) -> Option<QueryTransformation> {
        let question_id = question_id?;
        if !self.config.hyde.enabled {
            return None;
        }
        get_query_payload(
            self.storage,
            self.llm,
            self.config,
            question_id,
            question_text,
            self.config.hyde.auto_generate,
        )
    }

    /// BM25 retrieval with optional HyDE term mixing.
    ///
    /// # Errors
    ///
    /// [`RetrievalError::EmptyQuery`] when normalization leaves no terms;
    /// [`RetrievalError::IndexUnavailable`] when the FTS artifact is missing.
    pub fn search_chunks_bm25(
        &self,
        query: &str,
        top_n: usize,
        question_id: Option<i64>,
        lecture_ids: Option<&[i64]>,
    ) -> Result<Vec<ChunkHit>> {
        let tokens = self.normalizer.tokens(query);
        let mut match_query = build_match_query(&tokens, MAX_MATCH_TERMS);

        if let Some(payload) = self.hyde_payload(question_id, query) {
            let mut positive: Vec<String> = match self.config.hyde.bm25_variant {
                HydeBm25Variant::OrigOnly => tokens.clone(),
                HydeBm25Variant::HydeOnly => payload.keywords.clone(),
                HydeBm25Variant::MixedLight => payload
                    .keywords
                    .iter()
                    .cloned()
                    .chain(self.normalizer.strip_stopwords(&tokens))
                    .collect(),
            };
            if self.config.hyde.negative_mode == HydeNegativeMode::Stopwords {
                positive = filter_negative_terms(&positive, &payload.negative_keywords);
            }
            if !positive.is_empty() {
                match_query = build_match_query(&positive, MAX_MATCH_TERMS);
            }
        }

        self.storage
            .search_chunks_bm25(&match_query, top_n, lecture_ids)
    }

    /// Dense retrieval: rerank mode when `candidate_chunks` is given, full
    /// in-memory index mode otherwise.
    ///
    /// Never fails: every dense-side problem logs and yields an empty list,
    /// which callers treat as "dense unavailable".
    #[must_use]
    pub fn search_chunks_embedding(
        &self,
        query: &str,
        top_n: usize,
        candidate_chunks: Option<&[ChunkHit]>,
        question_id: Option<i64>,
    ) -> Vec<ChunkHit> {
        let normalized = normalize_embedding_text(query, EMBEDDING_TEXT_MAX_CHARS);
        if normalized.is_empty() {
            return Vec::new();
        }

        let dim = self.config.retrieval.embedding_dim;
        let Some(embedder) = self.embedder else {
            tracing::debug!("no embedder available, dense search skipped");
            return Vec::new();
        };
        if embedder.dimensions() != dim {
            tracing::warn!(
                model_dim = embedder.dimensions(),
                configured_dim = dim,
                "embedding dimension mismatch, dense search skipped"
            );
            return Vec::new();
        }

        let query_vec = match self.encode_query(embedder, &normalized, question_id, query) {
            Ok(vector) => vector,
            Err(error) => {
                tracing::warn!(%error, "embedding query failed");
                return Vec::new();
            }
        };

        if let Some(candidates) = candidate_chunks {
            return self.rerank(candidates, &query_vec, top_n);
        }

        let model = &self.config.retrieval.embedding_model_name;
        if let Err(error) = self.index.ensure_loaded(self.storage, model, dim) {
            tracing::warn!(%error, "dense index load failed");
            return Vec::new();
        }
        self.index.search(&query_vec, top_n)
    }

    /// Encodes the query text, blending in the HyDE pseudo-query when the
    /// strategy asks for it.
    fn encode_query(
        &self,
        embedder: &dyn Embedder,
        normalized: &str,
        question_id: Option<i64>,
        raw_query: &str,
    ) -> Result<Vec<f32>> {
        let model = &self.config.retrieval.embedding_model_name;
        let orig_vec = embedder.embed(&prepare_input(model, normalized, true))?;

        if self.config.hyde.strategy == HydeStrategy::Blend {
            if let Some(payload) = self.hyde_payload(question_id, raw_query) {
                let hyde_norm =
                    normalize_embedding_text(&payload.lecture_style_query, EMBEDDING_TEXT_MAX_CHARS);
                if !hyde_norm.is_empty() {
                    let hyde_vec = embedder.embed(&prepare_input(model, &hyde_norm, true))?;
                    let w_orig = self.config.hyde.embed_weight_orig;
                    let w_hyde = self.config.hyde.embed_weight;
                    let mut combined: Vec<f32> = orig_vec
                        .iter()
                        .zip(hyde_vec.iter())
                        .map(|(o, h)| o * w_orig + h * w_hyde)
                        .collect();
                    let norm: f32 = combined.iter().map(|x| x * x).sum::<f32>().sqrt();
                    if norm > 0.0 {
                        l2_normalize(&mut combined);
                        return Ok(combined);
                    }
                }
            }
        }
        Ok(orig_vec)
    }

    /// Scores candidate chunks against a query vector using stored vectors.
    fn rerank(&self, candidates: &[ChunkHit], query_vec: &[f32], top_n: usize) -> Vec<ChunkHit> {
        let model = &self.config.retrieval.embedding_model_name;
        let dim = self.config.retrieval.embedding_dim;
        let chunk_ids: Vec<i64> = candidates.iter().map(|c| c.chunk_id).collect();
        let vectors = match self.storage.fetch_embeddings(model, &chunk_ids, dim) {
            Ok(map) => map,
            Err(error) => {
                tracing::warn!(%error, "embedding fetch failed");
                return Vec::new();
            }
        };
        if vectors.is_empty() {
            return Vec::new();
        }

        let mut hits: Vec<ChunkHit> = candidates
            .iter()
            .filter_map(|candidate| {
                let vector = vectors.get(&candidate.chunk_id)?;
                Some(ChunkHit {
                    embedding_score: Some(inner_product(vector, query_vec)),
                    rrf_score: None,
                    ..candidate.clone()
                })
            })
            .collect();
        hits.sort_by(|a, b| {
            b.embedding_score
                .partial_cmp(&a.embedding_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(top_n);
        hits
    }

    /// Hybrid retrieval: BM25 pool, dense rerank, RRF fusion.
    ///
    /// With the `best_of_two` strategy and a HyDE payload available, the
    /// original-query and pseudo-query rerankings compete on top-1/top-2
    /// margin; ties within `margin_eps` favor the original.
    ///
    /// # Errors
    ///
    /// Propagates lexical-index failures. An empty query yields `Ok(empty)`.
    pub fn search_chunks_hybrid_rrf(
        &self,
        query: &str,
        top_n: usize,
        question_id: Option<i64>,
        lecture_ids: Option<&[i64]>,
    ) -> Result<Vec<ChunkHit>> {
        let embed_top_n = self.config.retrieval.embedding_top_n;
        let bm25_top_n = top_n.max(embed_top_n);

        let bm25_chunks =
            match self.search_chunks_bm25(query, bm25_top_n, question_id, lecture_ids) {
                Ok(hits) => hits,
                Err(Error::Retrieval(RetrievalError::EmptyQuery)) => return Ok(Vec::new()),
                Err(error) => return Err(error),
            };
        if bm25_chunks.is_empty() {
            return Ok(Vec::new());
        }

        let emb_chunks = if self.config.hyde.strategy == HydeStrategy::BestOfTwo {
            self.best_of_two_rerank(query, question_id, &bm25_chunks, embed_top_n)
        } else {
            self.search_chunks_embedding(query, embed_top_n, Some(&bm25_chunks), question_id)
        };

        Ok(fuse_rankings(
            &bm25_chunks,
            &emb_chunks,
            RrfConfig::new(self.config.retrieval.rrf_k),
            top_n,
        ))
    }

    fn best_of_two_rerank(
        &self,
        query: &str,
        question_id: Option<i64>,
        bm25_chunks: &[ChunkHit],
        embed_top_n: usize,
    ) -> Vec<ChunkHit> {
        let Some(payload) = self.hyde_payload(question_id, query) else {
            return self.search_chunks_embedding(
                query,
                embed_top_n,
                Some(bm25_chunks),
                question_id,
            );
        };
        if payload.lecture_style_query.is_empty() {
            return self.search_chunks_embedding(
                query,
                embed_top_n,
                Some(bm25_chunks),
                question_id,
            );
        }

        // Score with both vectors; question_id is withheld so neither pass
        // re-applies the blend.
        let orig_chunks = self.search_chunks_embedding(query, embed_top_n, Some(bm25_chunks), None);
        let hyde_chunks = self.search_chunks_embedding(
            &payload.lecture_style_query,
            embed_top_n,
            Some(bm25_chunks),
            None,
        );

        fn top_margin(chunks: &[ChunkHit]) -> f64 {
            if chunks.is_empty() {
                return -1.0;
            }
            let top1 = chunks[0].embedding_score.map_or(0.0, f64::from);
            let top2 = chunks
                .get(1)
                .and_then(|c| c.embedding_score)
                .map_or(0.0, f64::from);
            top1 - top2
        }

        let margin_orig = top_margin(&orig_chunks);
        let margin_hyde = top_margin(&hyde_chunks);
        if margin_hyde > margin_orig + f64::from(self.config.hyde.margin_eps) {
            hyde_chunks
        } else {
            orig_chunks
        }
    }

    /// Retrieves candidates for one question through the configured mode.
    ///
    /// # Errors
    ///
    /// Propagates lexical-index failures; an empty query yields no
    /// candidates.
    pub fn find_candidates(
        &self,
        question_text: &str,
        top_k: usize,
        question_id: Option<i64>,
        lecture_ids: Option<&[i64]>,
    ) -> Result<Vec<Candidate>> {
        let chunks = match self.config.retrieval.mode {
            RetrievalMode::Bm25 => {
                match self.search_chunks_bm25(question_text, DEFAULT_TOP_N, question_id, lecture_ids)
                {
                    Ok(hits) => hits,
                    Err(Error::Retrieval(RetrievalError::EmptyQuery)) => Vec::new(),
                    Err(error) => return Err(error),
                }
            }
            RetrievalMode::HybridRrf => self.search_chunks_hybrid_rrf(
                question_text,
                DEFAULT_TOP_N,
                question_id,
                lecture_ids,
            )?,
        };
        Ok(aggregate_candidates(
            &chunks,
            &self.catalog,
            top_k,
            DEFAULT_EVIDENCE_PER_LECTURE,
        ))
    }

    /// Builds the three retrieval lists and their derived features.
    ///
    /// Runs unrestricted: features feed the auto-confirm and uncertainty
    /// gates, not the candidate set.
    ///
    /// # Errors
    ///
    /// Propagates lexical-index failures.
    pub fn build_artifacts(
        &self,
        question_text: &str,
        question_id: Option<i64>,
        top_n: usize,
        top_k: usize,
    ) -> Result<RetrievalArtifacts> {
        let bm25_chunks = match self.search_chunks_bm25(question_text, top_n, question_id, None) {
            Ok(hits) => hits,
            Err(Error::Retrieval(RetrievalError::EmptyQuery)) => Vec::new(),
            Err(error) => return Err(error),
        };
        let embed_chunks =
            self.search_chunks_embedding(question_text, top_n, Some(&bm25_chunks), question_id);
        let hybrid_chunks =
            self.search_chunks_hybrid_rrf(question_text, top_n, question_id, None)?;

        let features = extract_features(
            &bm25_chunks,
            &embed_chunks,
            &hybrid_chunks,
            top_k,
            |chunk_id| {
                self.storage
                    .get_chunk(chunk_id)
                    .ok()
                    .flatten()
                    .map(|chunk| chunk.length())
            },
        );

        Ok(RetrievalArtifacts {
            bm25_chunks,
            embed_chunks,
            hybrid_chunks,
            features,
        })
    }
}
