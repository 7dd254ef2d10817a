//! Deterministic hashing embedder.
//!
//! Token-bucket pseudo-embeddings for the `hashing-*` model family. Each
//! alphanumeric/Hangul token hashes to one bucket of the output vector; the
//! result is normalized to unit length so inner product equals cosine.
//!
//! This is lexical-overlap similarity, not semantics. It exists so the dense
//! path is fully exercisable without a hosted sentence encoder, and it is
//! stable across processes and builds (SHA-1, not `DefaultHasher`) because
//! query vectors must match passage vectors encoded at ingestion time.

use crate::embedding::{Embedder, l2_normalize};
use crate::error::Result;
use rayon::prelude::*;
use regex::Regex;
use sha1::{Digest, Sha1};
use std::sync::LazyLock;

static HASH_TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[0-9A-Za-z\u{ac00}-\u{d7a3}]+")
        .unwrap_or_else(|e| panic!("hash token pattern failed to compile: {e}"))
});

/// Deterministic token-bucket embedder.
///
/// # Examples
///
/// ```
/// use lectern::embedding::{Embedder, HashingEmbedder, is_unit_norm};
///
/// let embedder = HashingEmbedder::new(256);
/// let vector = embedder.embed("sinus rhythm P wave").unwrap();
/// assert_eq!(vector.len(), 256);
/// assert!(is_unit_norm(&vector));
/// ```
pub struct HashingEmbedder {
    dim: usize,
}

impl HashingEmbedder {
    /// Creates a hashing embedder with the given dimension.
    #[must_use]
    pub const fn new(dim: usize) -> Self {
        Self { dim }
    }

    /// Maps a token to its bucket index.
    #[allow(clippy::cast_possible_truncation)]
    fn bucket(&self, token: &str) -> usize {
        let mut hasher = Sha1::new();
        hasher.update(token.as_bytes());
        let digest = hasher.finalize();
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        (u64::from_le_bytes(prefix) % self.dim as u64) as usize
    }

    fn generate(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dim];
        let lowered = text.to_lowercase();
        for token in HASH_TOKEN_RE.find_iter(&lowered) {
            vector[self.bucket(token.as_str())] += 1.0;
        }
        l2_normalize(&mut vector);
        vector
    }
}

impl Embedder for HashingEmbedder {
    fn dimensions(&self) -> usize {
        self.dim
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.generate(text))
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.par_iter().map(|text| self.generate(text)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{inner_product, is_unit_norm};

    #[test]
    fn test_deterministic() {
        let embedder = HashingEmbedder::new(128);
        let a = embedder.embed("급성 신부전 creatinine 상승").unwrap();
        let b = embedder.embed("급성 신부전 creatinine 상승").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_unit_norm() {
        let embedder = HashingEmbedder::new(128);
        let vector = embedder.embed("hello world").unwrap();
        assert!(is_unit_norm(&vector));
    }

    #[test]
    fn test_empty_text_zero_vector() {
        let embedder = HashingEmbedder::new(64);
        let vector = embedder.embed("").unwrap();
        assert!(vector.iter().all(|&x| x == 0.0));
    }

    #[test]
    fn test_overlap_scores_higher() {
        let embedder = HashingEmbedder::new(256);
        let base = embedder.embed("sinus rhythm with P wave").unwrap();
        let close = embedder.embed("P wave precedes the QRS in sinus rhythm").unwrap();
        let far = embedder.embed("renal tubular acidosis bicarbonate").unwrap();
        assert!(inner_product(&base, &close) > inner_product(&base, &far));
    }

    #[test]
    fn test_case_insensitive() {
        let embedder = HashingEmbedder::new(128);
        let a = embedder.embed("HCO3").unwrap();
        let b = embedder.embed("hco3").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_batch_matches_single() {
        let embedder = HashingEmbedder::new(64);
        let batch = embedder.embed_batch(&["one", "two"]).unwrap();
        assert_eq!(batch[0], embedder.embed("one").unwrap());
        assert_eq!(batch[1], embedder.embed("two").unwrap());
    }
}
