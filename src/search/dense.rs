//! In-memory dense index for full-corpus embedding search.
//!
//! Holds one flat row-major matrix of unit-norm vectors keyed by
//! `(model_name, dim)`. Loading is lazy and single-flight: the mutex is held
//! for the duration of a load, so concurrent first callers wait instead of
//! duplicating work, and the matrix reloads only when the model or dimension
//! changes.
//!
//! The index is constructed by the engine root and shared by reference;
//! there is no process-global instance.

use crate::core::ChunkHit;
use crate::embedding::inner_product;
use crate::error::Result;
use crate::storage::Storage;
use rayon::prelude::*;
use std::sync::Mutex;

/// Per-chunk metadata mirrored alongside the matrix rows.
#[derive(Debug, Clone)]
struct RowMeta {
    chunk_id: i64,
    lecture_id: i64,
    page_start: Option<i64>,
    page_end: Option<i64>,
    snippet: String,
}

struct LoadedIndex {
    model_name: String,
    dim: usize,
    /// Row-major `rows × dim` matrix.
    matrix: Vec<f32>,
    meta: Vec<RowMeta>,
}

/// Lazily loaded dense index.
pub struct EmbeddingIndex {
    inner: Mutex<Option<LoadedIndex>>,
}

impl Default for EmbeddingIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl EmbeddingIndex {
    /// Creates an empty, unloaded index.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    /// Loads the matrix for `(model_name, dim)` if not already resident.
    ///
    /// Idempotent for an unchanged key; a changed key evicts and reloads.
    ///
    /// # Errors
    ///
    /// Returns an error if the embedding rows cannot be read.
    pub fn ensure_loaded(&self, storage: &dyn Storage, model_name: &str, dim: usize) -> Result<()> {
        let mut guard = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(loaded) = guard.as_ref() {
            if loaded.model_name == model_name && loaded.dim == dim {
                return Ok(());
            }
        }

        let records = storage.load_embedding_records(model_name, dim)?;
        let mut matrix = Vec::with_capacity(records.len() * dim);
        let mut meta = Vec::with_capacity(records.len());
        for record in records {
            matrix.extend_from_slice(&record.vector);
            meta.push(RowMeta {
                chunk_id: record.chunk_id,
                lecture_id: record.lecture_id,
                page_start: record.page_start,
                page_end: record.page_end,
                snippet: record.snippet,
            });
        }
        tracing::debug!(model_name, dim, rows = meta.len(), "dense index loaded");
        *guard = Some(LoadedIndex {
            model_name: model_name.to_string(),
            dim,
            matrix,
            meta,
        });
        Ok(())
    }

    /// Number of resident rows (0 when unloaded).
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .as_ref()
            .map_or(0, |loaded| loaded.meta.len())
    }

    /// Whether the index holds no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Scores the whole matrix against a query vector and returns the top
    /// `top_n` hits by inner product, best first.
    ///
    /// Uses a partial selection (partition, then sort only the top block)
    /// when `top_n` is smaller than the corpus.
    #[must_use]
    pub fn search(&self, query: &[f32], top_n: usize) -> Vec<ChunkHit> {
        let guard = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let Some(loaded) = guard.as_ref() else {
            return Vec::new();
        };
        if loaded.meta.is_empty() || query.len() != loaded.dim || top_n == 0 {
            return Vec::new();
        }

        let dim = loaded.dim;
        let scores: Vec<f32> = loaded
            .matrix
            .par_chunks_exact(dim)
            .map(|row| inner_product(row, query))
            .collect();

        let mut indices: Vec<usize> = (0..scores.len()).collect();
        let by_score_desc = |a: &usize, b: &usize| {
            scores[*b]
                .partial_cmp(&scores[*a])
                .unwrap_or(std::cmp::Ordering::Equal)
        };
        if top_n < indices.len() {
            indices.select_nth_unstable_by(top_n - 1, by_score_desc);
            indices.truncate(top_n);
        }
        indices.sort_by(by_score_desc);

        indices
            .into_iter()
            .map(|idx| {
                let meta = &loaded.meta[idx];
                ChunkHit {
                    chunk_id: meta.chunk_id,
                    lecture_id: meta.lecture_id,
                    page_start: meta.page_start,
                    page_end: meta.page_end,
                    snippet: meta.snippet.clone(),
                    bm25_score: None,
                    embedding_score: Some(scores[idx]),
                    rrf_score: None,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::LectureChunk;
    use crate::storage::SqliteStorage;

    fn seeded_storage() -> SqliteStorage {
        let mut storage = SqliteStorage::in_memory().unwrap();
        storage.init().unwrap();
        let block = storage.add_block("block", 1).unwrap();
        let lecture = storage.add_lecture(block, None, "lecture", 1).unwrap();
        for (i, vector) in [[1.0f32, 0.0], [0.0, 1.0], [0.6, 0.8]].iter().enumerate() {
            let chunk_id = storage
                .add_chunk(&LectureChunk::new(lecture, format!("chunk {i}")))
                .unwrap();
            storage
                .upsert_embedding(chunk_id, lecture, "hashing-2", vector)
                .unwrap();
        }
        storage
    }

    #[test]
    fn test_load_and_search() {
        let storage = seeded_storage();
        let index = EmbeddingIndex::new();
        index.ensure_loaded(&storage, "hashing-2", 2).unwrap();
        assert_eq!(index.len(), 3);

        let hits = index.search(&[1.0, 0.0], 2);
        assert_eq!(hits.len(), 2);
        assert!(hits[0].embedding_score.unwrap() >= hits[1].embedding_score.unwrap());
        assert!((hits[0].embedding_score.unwrap() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_ensure_loaded_idempotent() {
        let storage = seeded_storage();
        let index = EmbeddingIndex::new();
        index.ensure_loaded(&storage, "hashing-2", 2).unwrap();
        index.ensure_loaded(&storage, "hashing-2", 2).unwrap();
        assert_eq!(index.len(), 3);
    }

    #[test]
    fn test_reload_on_model_change() {
        let storage = seeded_storage();
        let index = EmbeddingIndex::new();
        index.ensure_loaded(&storage, "hashing-2", 2).unwrap();
        assert_eq!(index.len(), 3);
        // No rows stored under this model name.
        index.ensure_loaded(&storage, "hashing-other", 2).unwrap();
        assert_eq!(index.len(), 0);
    }

    #[test]
    fn test_search_unloaded_empty() {
        let index = EmbeddingIndex::new();
        assert!(index.search(&[1.0, 0.0], 5).is_empty());
        assert!(index.is_empty());
    }

    #[test]
    fn test_search_dim_mismatch_empty() {
        let storage = seeded_storage();
        let index = EmbeddingIndex::new();
        index.ensure_loaded(&storage, "hashing-2", 2).unwrap();
        assert!(index.search(&[1.0, 0.0, 0.0], 5).is_empty());
    }

    #[test]
    fn test_partial_selection_matches_full_sort() {
        let storage = seeded_storage();
        let index = EmbeddingIndex::new();
        index.ensure_loaded(&storage, "hashing-2", 2).unwrap();
        let all = index.search(&[0.6, 0.8], 3);
        let top2 = index.search(&[0.6, 0.8], 2);
        assert_eq!(all[0].chunk_id, top2[0].chunk_id);
        assert_eq!(all[1].chunk_id, top2[1].chunk_id);
    }
}
