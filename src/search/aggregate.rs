//! Candidate aggregation: chunk hits collapse into per-lecture candidates.

use crate::core::decision::SNIPPET_MAX_CHARS;
use crate::core::{Candidate, ChunkHit, Evidence, LectureInfo};
use crate::tokenize::truncate_graphemes;
use std::collections::HashMap;

/// Default number of candidate lectures kept.
pub const DEFAULT_TOP_K_LECTURES: usize = 8;

/// Default evidence snippets kept per lecture.
pub const DEFAULT_EVIDENCE_PER_LECTURE: usize = 3;

/// Collapses chunk hits into per-lecture candidates.
///
/// Each chunk contributes `-bm25_score` (smaller BM25 means a better match,
/// so negation makes higher better). Per lecture, the best
/// `evidence_per_lecture` chunks become evidence; candidates sort by
/// aggregate score descending with ties broken by lower lecture id, and only
/// the top `top_k_lectures` survive. Lectures missing from the catalog are
/// dropped.
#[must_use]
pub fn aggregate_candidates(
    chunks: &[ChunkHit],
    catalog: &HashMap<i64, LectureInfo>,
    top_k_lectures: usize,
    evidence_per_lecture: usize,
) -> Vec<Candidate> {
    if chunks.is_empty() {
        return Vec::new();
    }

    struct LectureEntry {
        score: f64,
        evidence: Vec<Evidence>,
    }

    let mut per_lecture: HashMap<i64, LectureEntry> = HashMap::new();
    for chunk in chunks {
        let score = -chunk.bm25_score.unwrap_or(0.0);
        let entry = per_lecture.entry(chunk.lecture_id).or_insert(LectureEntry {
            score: 0.0,
            evidence: Vec::new(),
        });
        entry.score += score;
        entry.evidence.push(Evidence {
            chunk_id: chunk.chunk_id,
            page_start: chunk.page_start,
            page_end: chunk.page_end,
            snippet: truncate_graphemes(&chunk.snippet, SNIPPET_MAX_CHARS),
            score: Some(score),
        });
    }

    let mut candidates: Vec<Candidate> = per_lecture
        .into_iter()
        .filter_map(|(lecture_id, mut entry)| {
            let info = catalog.get(&lecture_id)?;
            entry.evidence.sort_by(|a, b| {
                b.score
                    .partial_cmp(&a.score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            entry.evidence.truncate(evidence_per_lecture);
            Some(Candidate {
                lecture_id,
                title: info.title.clone(),
                block_name: info.block_name.clone(),
                full_path: info.full_path(),
                score: entry.score,
                evidence: entry.evidence,
                parent_text: None,
                parent_chunk_ids: Vec::new(),
                parent_page_ranges: Vec::new(),
            })
        })
        .collect();

    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.lecture_id.cmp(&b.lecture_id))
    });
    candidates.truncate(top_k_lectures);
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> HashMap<i64, LectureInfo> {
        [(1, "ECG"), (2, "Valves"), (3, "Arrhythmia")]
            .into_iter()
            .map(|(id, title)| {
                (
                    id,
                    LectureInfo {
                        id,
                        title: title.to_string(),
                        block_id: 1,
                        block_name: "Cardiology".to_string(),
                    },
                )
            })
            .collect()
    }

    fn hit(chunk_id: i64, lecture_id: i64, bm25: f64) -> ChunkHit {
        ChunkHit {
            chunk_id,
            lecture_id,
            page_start: Some(1),
            page_end: Some(2),
            snippet: format!("snippet {chunk_id}"),
            bm25_score: Some(bm25),
            embedding_score: None,
            rrf_score: None,
        }
    }

    #[test]
    fn test_aggregates_by_lecture() {
        let chunks = vec![hit(10, 1, -3.0), hit(11, 1, -2.0), hit(20, 2, -4.0)];
        let candidates = aggregate_candidates(&chunks, &catalog(), 8, 3);
        assert_eq!(candidates.len(), 2);
        // Lecture 1 sums 3 + 2 = 5, lecture 2 sums 4.
        assert_eq!(candidates[0].lecture_id, 1);
        assert!((candidates[0].score - 5.0).abs() < f64::EPSILON);
        assert_eq!(candidates[1].lecture_id, 2);
    }

    #[test]
    fn test_evidence_best_first_and_capped() {
        let chunks = vec![
            hit(10, 1, -1.0),
            hit(11, 1, -5.0),
            hit(12, 1, -3.0),
            hit(13, 1, -2.0),
        ];
        let candidates = aggregate_candidates(&chunks, &catalog(), 8, 3);
        let evidence = &candidates[0].evidence;
        assert_eq!(evidence.len(), 3);
        assert_eq!(evidence[0].chunk_id, 11);
        assert_eq!(evidence[1].chunk_id, 12);
        assert_eq!(evidence[2].chunk_id, 13);
    }

    #[test]
    fn test_ties_break_by_lower_lecture_id() {
        let chunks = vec![hit(30, 3, -2.0), hit(10, 1, -2.0)];
        let candidates = aggregate_candidates(&chunks, &catalog(), 8, 3);
        assert_eq!(candidates[0].lecture_id, 1);
        assert_eq!(candidates[1].lecture_id, 3);
    }

    #[test]
    fn test_top_k_limit() {
        let chunks = vec![hit(10, 1, -1.0), hit(20, 2, -2.0), hit(30, 3, -3.0)];
        let candidates = aggregate_candidates(&chunks, &catalog(), 2, 3);
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].lecture_id, 3);
    }

    #[test]
    fn test_unknown_lecture_dropped() {
        let chunks = vec![hit(10, 99, -2.0), hit(11, 1, -1.0)];
        let candidates = aggregate_candidates(&chunks, &catalog(), 8, 3);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].lecture_id, 1);
    }

    #[test]
    fn test_display_path() {
        let chunks = vec![hit(10, 1, -1.0)];
        let candidates = aggregate_candidates(&chunks, &catalog(), 8, 3);
        assert_eq!(candidates[0].full_path, "Cardiology > ECG");
    }

    #[test]
    fn test_empty_input() {
        assert!(aggregate_candidates(&[], &catalog(), 8, 3).is_empty());
    }
}
