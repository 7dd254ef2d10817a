//! Reciprocal Rank Fusion (RRF).
//!
//! Merges the lexical and dense rankings into one fused ranking.
//! Based on: Cormack, Clarke, Buettcher (2009) - "Reciprocal Rank Fusion
//! outperforms Condorcet and individual Rank Learning Methods"

use crate::core::ChunkHit;
use std::collections::HashMap;

/// Configuration for the RRF algorithm.
#[derive(Debug, Clone, Copy)]
pub struct RrfConfig {
    /// The k parameter controls how much weight is given to lower-ranked
    /// items. Default is 60, the value recommended in the original paper.
    pub k: u32,
}

impl Default for RrfConfig {
    fn default() -> Self {
        Self { k: 60 }
    }
}

impl RrfConfig {
    /// Creates a new RRF config with the specified k value.
    #[must_use]
    pub const fn new(k: u32) -> Self {
        Self { k }
    }

    /// Score contribution of a 0-based rank: `1 / (k + rank + 1)`.
    #[must_use]
    pub fn score_at(self, rank: usize) -> f64 {
        #[allow(clippy::cast_possible_truncation)]
        let rank = rank as u32;
        1.0 / f64::from(self.k + rank + 1)
    }
}

/// Fuses the BM25 and embedding rankings.
///
/// Each chunk scores `Σ 1/(k + rank + 1)` over the lists containing it, so a
/// chunk present in both lists strictly outscores the same chunk in either
/// list alone. Metadata (snippet, pages, per-list scores) merges across both
/// occurrences. Ties break by first appearance (BM25 list first), and the
/// result is truncated to `top_n`.
///
/// When the dense list is empty the BM25 list passes through with
/// `rrf_score = 1/(k + rank + 1)`.
#[must_use]
pub fn fuse_rankings(
    bm25_hits: &[ChunkHit],
    embedding_hits: &[ChunkHit],
    config: RrfConfig,
    top_n: usize,
) -> Vec<ChunkHit> {
    if embedding_hits.is_empty() {
        return bm25_hits
            .iter()
            .take(top_n)
            .enumerate()
            .map(|(rank, hit)| ChunkHit {
                rrf_score: Some(config.score_at(rank)),
                ..hit.clone()
            })
            .collect();
    }

    // Insertion order doubles as the tie-break: first appearance wins.
    let mut order: Vec<i64> = Vec::new();
    let mut scores: HashMap<i64, f64> = HashMap::new();
    let mut merged: HashMap<i64, ChunkHit> = HashMap::new();

    for (rank, hit) in bm25_hits.iter().enumerate() {
        let entry = scores.entry(hit.chunk_id).or_insert_with(|| {
            order.push(hit.chunk_id);
            0.0
        });
        *entry += config.score_at(rank);
        merged.entry(hit.chunk_id).or_insert_with(|| hit.clone());
    }
    for (rank, hit) in embedding_hits.iter().enumerate() {
        let entry = scores.entry(hit.chunk_id).or_insert_with(|| {
            order.push(hit.chunk_id);
            0.0
        });
        *entry += config.score_at(rank);
        merged
            .entry(hit.chunk_id)
            .and_modify(|existing| {
                if existing.embedding_score.is_none() {
                    existing.embedding_score = hit.embedding_score;
                }
                if existing.bm25_score.is_none() {
                    existing.bm25_score = hit.bm25_score;
                }
            })
            .or_insert_with(|| hit.clone());
    }

    let mut fused: Vec<ChunkHit> = order
        .into_iter()
        .filter_map(|chunk_id| {
            let hit = merged.remove(&chunk_id)?;
            Some(ChunkHit {
                rrf_score: Some(scores.get(&chunk_id).copied().unwrap_or(0.0)),
                ..hit
            })
        })
        .collect();

    // Stable sort keeps first-appearance order among equal scores.
    fused.sort_by(|a, b| {
        b.rrf_score
            .partial_cmp(&a.rrf_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    fused.truncate(top_n);
    fused
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(chunk_id: i64, lecture_id: i64) -> ChunkHit {
        ChunkHit {
            chunk_id,
            lecture_id,
            page_start: None,
            page_end: None,
            snippet: format!("chunk {chunk_id}"),
            bm25_score: None,
            embedding_score: None,
            rrf_score: None,
        }
    }

    #[test]
    fn test_score_formula() {
        let config = RrfConfig::new(60);
        assert!((config.score_at(0) - 1.0 / 61.0).abs() < f64::EPSILON);
        assert!((config.score_at(2) - 1.0 / 63.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_fusion_math() {
        // BM25 ranks A=0, B=1, C=2; embedding ranks B=0, D=1, A=2; k=60.
        let bm25 = vec![hit(1, 10), hit(2, 10), hit(3, 10)]; // A, B, C
        let emb = vec![hit(2, 10), hit(4, 10), hit(1, 10)]; // B, D, A
        let fused = fuse_rankings(&bm25, &emb, RrfConfig::new(60), 10);

        let score = |id: i64| {
            fused
                .iter()
                .find(|h| h.chunk_id == id)
                .and_then(|h| h.rrf_score)
                .unwrap()
        };
        assert!((score(1) - (1.0 / 61.0 + 1.0 / 63.0)).abs() < 1e-12);
        assert!((score(2) - (1.0 / 62.0 + 1.0 / 61.0)).abs() < 1e-12);
        assert!((score(3) - 1.0 / 63.0).abs() < 1e-12);
        assert!((score(4) - 1.0 / 62.0).abs() < 1e-12);

        let order: Vec<i64> = fused.iter().map(|h| h.chunk_id).collect();
        assert_eq!(order, vec![2, 1, 4, 3]); // B, A, D, C
    }

    #[test]
    fn test_both_lists_beats_single_list() {
        let bm25 = vec![hit(1, 10), hit(2, 10)];
        let emb = vec![hit(1, 10)];
        let fused = fuse_rankings(&bm25, &emb, RrfConfig::default(), 10);
        let shared = fused.iter().find(|h| h.chunk_id == 1).unwrap();
        let single = fused.iter().find(|h| h.chunk_id == 2).unwrap();
        assert!(shared.rrf_score.unwrap() > RrfConfig::default().score_at(0));
        assert!(shared.rrf_score.unwrap() > single.rrf_score.unwrap());
    }

    #[test]
    fn test_empty_dense_passthrough() {
        let mut bm25 = vec![hit(1, 10), hit(2, 10)];
        bm25[0].bm25_score = Some(-3.0);
        let fused = fuse_rankings(&bm25, &[], RrfConfig::new(60), 10);
        assert_eq!(fused.len(), 2);
        assert!((fused[0].rrf_score.unwrap() - 1.0 / 61.0).abs() < f64::EPSILON);
        assert!((fused[1].rrf_score.unwrap() - 1.0 / 62.0).abs() < f64::EPSILON);
        // BM25 metadata survives the passthrough.
        assert_eq!(fused[0].bm25_score, Some(-3.0));
    }

    #[test]
    fn test_tie_breaks_by_first_appearance() {
        // Disjoint lists at equal ranks tie; BM25-list chunks come first.
        let bm25 = vec![hit(1, 10)];
        let emb = vec![hit(2, 10)];
        let fused = fuse_rankings(&bm25, &emb, RrfConfig::new(60), 10);
        assert_eq!(fused[0].chunk_id, 1);
        assert_eq!(fused[1].chunk_id, 2);
    }

    #[test]
    fn test_truncates_to_top_n() {
        let bm25: Vec<ChunkHit> = (0..10).map(|i| hit(i, 10)).collect();
        let fused = fuse_rankings(&bm25, &[], RrfConfig::default(), 4);
        assert_eq!(fused.len(), 4);
    }

    #[test]
    fn test_merges_scores_across_lists() {
        let mut bm25 = vec![hit(1, 10)];
        bm25[0].bm25_score = Some(-2.5);
        let mut emb = vec![hit(1, 10)];
        emb[0].embedding_score = Some(0.9);
        let fused = fuse_rankings(&bm25, &emb, RrfConfig::default(), 10);
        assert_eq!(fused[0].bm25_score, Some(-2.5));
        assert_eq!(fused[0].embedding_score, Some(0.9));
    }
}
