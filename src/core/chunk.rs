//! Lecture chunk and catalog records.
//!
//! A chunk is a contiguous passage of one lecture's notes with a known
//! inclusive page range. Chunks are created by the ingestion collaborator and
//! are immutable for the engine; deleting one cascades to its lexical-index
//! row, embeddings, and evidence.

use serde::{Deserialize, Serialize};

/// A contiguous passage of a lecture note.
///
/// # Examples
///
/// ```
/// use lectern::core::LectureChunk;
///
/// let chunk = LectureChunk::new(1, "The P wave precedes the QRS complex.".to_string())
///     .with_pages(12, 13);
/// assert_eq!(chunk.page_start, Some(12));
/// assert!(chunk.length() > 0);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LectureChunk {
    /// Unique identifier (assigned by the ingestion collaborator).
    pub id: Option<i64>,

    /// Owning lecture.
    pub lecture_id: i64,

    /// Owning source material, when known.
    pub material_id: Option<i64>,

    /// First page of the passage (inclusive).
    pub page_start: Option<i64>,

    /// Last page of the passage (inclusive, `>= page_start`).
    pub page_end: Option<i64>,

    /// Passage text.
    pub content: String,

    /// Cached character length; [`Self::length`] falls back to the content.
    pub char_len: Option<i64>,
}

impl LectureChunk {
    /// Creates a chunk with no page range.
    #[must_use]
    pub const fn new(lecture_id: i64, content: String) -> Self {
        Self {
            id: None,
            lecture_id,
            material_id: None,
            page_start: None,
            page_end: None,
            content,
            char_len: None,
        }
    }

    /// Sets the inclusive page range.
    #[must_use]
    pub const fn with_pages(mut self, start: i64, end: i64) -> Self {
        self.page_start = Some(start);
        self.page_end = Some(end);
        self
    }

    /// Sets the owning material.
    #[must_use]
    pub const fn with_material(mut self, material_id: i64) -> Self {
        self.material_id = Some(material_id);
        self
    }

    /// Character length, preferring the stored value.
    #[must_use]
    pub fn length(&self) -> usize {
        #[allow(clippy::cast_sign_loss)]
        self.char_len.map_or_else(
            || self.content.chars().count(),
            |len| len.max(0) as usize,
        )
    }

    /// Checks if the chunk has no text.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.content.trim().is_empty()
    }
}

/// One retrieval hit over the chunk corpus.
///
/// Carries whichever scores the producing list assigned: `bm25_score`
/// (smaller is better), `embedding_score` (inner product, higher is better),
/// and `rrf_score` (fused, higher is better).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkHit {
    /// Source chunk.
    pub chunk_id: i64,
    /// Owning lecture.
    pub lecture_id: i64,
    /// First page of the passage.
    pub page_start: Option<i64>,
    /// Last page of the passage.
    pub page_end: Option<i64>,
    /// Index-generated snippet (newlines collapsed).
    pub snippet: String,
    /// BM25 score, when the lexical index produced or scored this hit.
    pub bm25_score: Option<f64>,
    /// Inner-product score, when the dense index scored this hit.
    pub embedding_score: Option<f32>,
    /// Fused score, when reciprocal-rank fusion produced this hit.
    pub rrf_score: Option<f64>,
}

/// One entry of the lecture catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LectureInfo {
    /// Lecture identifier.
    pub id: i64,
    /// Lecture title.
    pub title: String,
    /// Owning block identifier.
    pub block_id: i64,
    /// Owning block name.
    pub block_name: String,
}

impl LectureInfo {
    /// Display path of the form `Block > Lecture`.
    #[must_use]
    pub fn full_path(&self) -> String {
        if self.block_name.is_empty() {
            return self.title.clone();
        }
        format!("{} > {}", self.block_name, self.title)
    }
}
