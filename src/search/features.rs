//! Retrieval feature extraction and the auto-confirm v2 gate.
//!
//! From the BM25, embedding, and hybrid top-k lists the extractor derives
//! margin, agreement, rank, and chunk-length signals per question. The gate
//! predicates over those signals are pure functions: they drive both the
//! "skip the LLM" path and the "should we expand context" decision, and they
//! depend only on their arguments.

use crate::core::ChunkHit;
use serde::Serialize;

/// One entry of a preserved top-k ranking list.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedChunk {
    /// Chunk identifier.
    pub chunk_id: i64,
    /// Owning lecture.
    pub lecture_id: i64,
    /// Score in the producing list's own scale.
    pub score: f64,
    /// 1-based rank.
    pub rank: usize,
}

/// Per-question retrieval signals.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RetrievalFeatures {
    /// Top-1 chunk of the BM25 list.
    pub bm25_top1_chunk_id: Option<i64>,
    /// Lecture of the BM25 top-1.
    pub bm25_top1_lecture_id: Option<i64>,
    /// Top-1 chunk of the embedding list.
    pub embed_top1_chunk_id: Option<i64>,
    /// Lecture of the embedding top-1.
    pub embed_top1_lecture_id: Option<i64>,
    /// Top-1 chunk of the hybrid list.
    pub hybrid_top1_chunk_id: Option<i64>,
    /// Lecture of the hybrid top-1.
    pub hybrid_top1_lecture_id: Option<i64>,
    /// `top1 - top2` BM25 scores; `None` for fewer than two hits.
    pub bm25_margin: Option<f64>,
    /// `top1 - top2` embedding scores; `None` for fewer than two hits.
    pub embed_margin: Option<f64>,
    /// BM25 and hybrid top-1 agree.
    pub bm25_hybrid_agree: bool,
    /// Embedding and hybrid top-1 agree.
    pub embed_hybrid_agree: bool,
    /// BM25 and embedding top-1 agree.
    pub bm25_embed_agree: bool,
    /// 1-based position of the hybrid top-1 inside the BM25 list.
    pub hybrid_top1_bm25_rank: Option<usize>,
    /// 1-based position of the hybrid top-1 inside the embedding list.
    pub hybrid_top1_embed_rank: Option<usize>,
    /// Character length of the hybrid top-1 chunk.
    pub hybrid_top1_chunk_len: Option<usize>,
    /// Preserved BM25 top-k, for reporting.
    pub bm25_topk: Vec<RankedChunk>,
    /// Preserved embedding top-k, for reporting.
    pub embed_topk: Vec<RankedChunk>,
    /// Preserved hybrid top-k, for reporting.
    pub hybrid_topk: Vec<RankedChunk>,
}

fn ranked_list(
    chunks: &[ChunkHit],
    score_of: impl Fn(&ChunkHit) -> f64,
    top_k: usize,
) -> Vec<RankedChunk> {
    chunks
        .iter()
        .take(top_k)
        .enumerate()
        .map(|(idx, chunk)| RankedChunk {
            chunk_id: chunk.chunk_id,
            lecture_id: chunk.lecture_id,
            score: score_of(chunk),
            rank: idx + 1,
        })
        .collect()
}

fn margin(chunks: &[ChunkHit], score_of: impl Fn(&ChunkHit) -> f64) -> Option<f64> {
    if chunks.len() < 2 {
        return None;
    }
    Some(score_of(&chunks[0]) - score_of(&chunks[1]))
}

fn top1(chunks: &[ChunkHit]) -> (Option<i64>, Option<i64>) {
    chunks
        .first()
        .map_or((None, None), |c| (Some(c.chunk_id), Some(c.lecture_id)))
}

fn rank_of(chunks: &[ChunkHit], chunk_id: Option<i64>) -> Option<usize> {
    let chunk_id = chunk_id?;
    chunks
        .iter()
        .position(|c| c.chunk_id == chunk_id)
        .map(|idx| idx + 1)
}

/// Derives features from the three retrieval lists.
///
/// `chunk_len_of` resolves a chunk id to its character length (storage
/// lookup, with content-length fallback); it is only consulted for the
/// hybrid top-1.
pub fn extract_features(
    bm25_chunks: &[ChunkHit],
    embed_chunks: &[ChunkHit],
    hybrid_chunks: &[ChunkHit],
    top_k: usize,
    chunk_len_of: impl Fn(i64) -> Option<usize>,
) -> RetrievalFeatures {
    let bm25_score = |c: &ChunkHit| c.bm25_score.unwrap_or(0.0);
    let embed_score = |c: &ChunkHit| c.embedding_score.map_or(0.0, f64::from);
    let rrf_score = |c: &ChunkHit| c.rrf_score.unwrap_or(0.0);

    let (bm25_top1_chunk_id, bm25_top1_lecture_id) = top1(bm25_chunks);
    let (embed_top1_chunk_id, embed_top1_lecture_id) = top1(embed_chunks);
    let (hybrid_top1_chunk_id, hybrid_top1_lecture_id) = top1(hybrid_chunks);

    RetrievalFeatures {
        bm25_top1_chunk_id,
        bm25_top1_lecture_id,
        embed_top1_chunk_id,
        embed_top1_lecture_id,
        hybrid_top1_chunk_id,
        hybrid_top1_lecture_id,
        bm25_margin: margin(bm25_chunks, bm25_score),
        embed_margin: margin(embed_chunks, embed_score),
        bm25_hybrid_agree: bm25_top1_chunk_id.is_some()
            && bm25_top1_chunk_id == hybrid_top1_chunk_id,
        embed_hybrid_agree: embed_top1_chunk_id.is_some()
            && embed_top1_chunk_id == hybrid_top1_chunk_id,
        bm25_embed_agree: bm25_top1_chunk_id.is_some()
            && bm25_top1_chunk_id == embed_top1_chunk_id,
        hybrid_top1_bm25_rank: rank_of(bm25_chunks, hybrid_top1_chunk_id),
        hybrid_top1_embed_rank: rank_of(embed_chunks, hybrid_top1_chunk_id),
        hybrid_top1_chunk_len: hybrid_top1_chunk_id.and_then(&chunk_len_of),
        bm25_topk: ranked_list(bm25_chunks, bm25_score, top_k),
        embed_topk: ranked_list(embed_chunks, embed_score, top_k),
        hybrid_topk: ranked_list(hybrid_chunks, rrf_score, top_k),
    }
}

/// Auto-confirm v2 gate.
///
/// Confirms (skips the judge) only when the BM25 and hybrid top-1 chunks
/// agree, the embedding margin clears `delta`, and the hybrid top-1 sits
/// within the first `max_bm25_rank` BM25 hits.
#[must_use]
pub fn auto_confirm_v2(features: &RetrievalFeatures, delta: f64, max_bm25_rank: usize) -> bool {
    let (Some(bm25_top1), Some(hybrid_top1)) =
        (features.bm25_top1_chunk_id, features.hybrid_top1_chunk_id)
    else {
        return false;
    };
    if bm25_top1 != hybrid_top1 {
        return false;
    }
    match features.embed_margin {
        Some(margin) if margin >= delta => {}
        _ => return false,
    }
    match features.hybrid_top1_bm25_rank {
        Some(rank) if rank <= max_bm25_rank => {}
        _ => return false,
    }
    true
}

/// Uncertainty predicate driving context expansion.
///
/// A question is uncertain when it was not auto-confirmed, the embedding
/// margin is thin, the lexical and hybrid rankings disagree on top-1, or the
/// hybrid top-1 chunk is too short to anchor a judgment.
#[must_use]
pub fn is_uncertain(
    features: &RetrievalFeatures,
    delta_uncertain: f64,
    min_chunk_len: usize,
    auto_confirm: bool,
) -> bool {
    if !auto_confirm {
        return true;
    }
    match features.embed_margin {
        Some(margin) if margin >= delta_uncertain => {}
        _ => return true,
    }
    if let (Some(bm25_top1), Some(hybrid_top1)) =
        (features.bm25_top1_chunk_id, features.hybrid_top1_chunk_id)
    {
        if bm25_top1 != hybrid_top1 {
            return true;
        }
    }
    match features.hybrid_top1_chunk_len {
        Some(len) if len >= min_chunk_len => {}
        _ => return true,
    }
    false
}
