//! Embedding encoders and vector codecs for dense retrieval.
//!
//! The engine stores one unit-norm `f32` vector per (chunk, model) and scores
//! by inner product. Heavyweight sentence-encoder models are hosted by the
//! ingestion collaborator; in-process the engine provides the deterministic
//! `hashing-*` model family (see [`HashingEmbedder`]), which is also what the
//! test suite runs against. Requesting an unhosted model is not fatal:
//! callers log it and degrade to lexical-only retrieval.

mod hashing;

pub use hashing::HashingEmbedder;

use crate::error::{Error, Result, RetrievalError};

/// Tolerance for the unit-norm invariant on stored vectors.
pub const UNIT_NORM_TOLERANCE: f32 = 1e-3;

/// Trait for embedding encoders.
///
/// Implementations must be thread-safe (`Send + Sync`); the batch entry point
/// is used when building passage vectors for a whole corpus.
pub trait Embedder: Send + Sync {
    /// Returns the embedding dimension.
    fn dimensions(&self) -> usize;

    /// Encodes text to a unit-norm vector.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Encodes multiple texts.
    ///
    /// The default implementation encodes sequentially; implementations may
    /// override for batch optimization.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails for any text.
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        texts.iter().map(|t| self.embed(t)).collect()
    }
}

/// Creates the embedder for a configured model name.
///
/// Only the `hashing-*` family is hosted in-process. Other model names
/// (sentence-encoder families like E5) have their passage vectors built by
/// the ingestion collaborator; queries for them cannot be encoded here.
///
/// # Errors
///
/// Returns [`RetrievalError::EmbeddingUnavailable`] for unhosted models.
pub fn create_embedder(model_name: &str, dim: usize) -> Result<Box<dyn Embedder>> {
    if model_name.starts_with("hashing-") {
        return Ok(Box::new(HashingEmbedder::new(dim)));
    }
    Err(Error::Retrieval(RetrievalError::EmbeddingUnavailable(
        format!("model {model_name} is not hosted in-process"),
    )))
}

/// Whether a model name belongs to the E5 family (needs input prefixes).
#[must_use]
pub fn is_e5_model(model_name: &str) -> bool {
    model_name.to_lowercase().contains("e5")
}

/// Prepares encoder input, applying the E5 `query: `/`passage: ` prefix
/// when the model family requires it.
#[must_use]
pub fn prepare_input(model_name: &str, text: &str, is_query: bool) -> String {
    if is_e5_model(model_name) {
        let prefix = if is_query { "query: " } else { "passage: " };
        return format!("{prefix}{text}");
    }
    text.to_string()
}

/// Serializes a vector as little-endian `f32` bytes.
#[must_use]
pub fn encode_embedding(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for value in vector {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Deserializes little-endian `f32` bytes, validating the dimension.
///
/// Returns `None` when the blob length does not match `dim` values; callers
/// skip such rows rather than failing the search.
#[must_use]
pub fn decode_embedding(bytes: &[u8], dim: usize) -> Option<Vec<f32>> {
    if bytes.len() != dim * 4 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
    )
}

/// Inner product of two vectors. Zero when lengths differ.
#[must_use]
pub fn inner_product(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Scales a vector to unit length in place. Zero vectors are left unchanged.
pub fn l2_normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in vector.iter_mut() {
            *value /= norm;
        }
    }
}

/// Checks the unit-norm invariant within [`UNIT_NORM_TOLERANCE`].
#[must_use]
pub fn is_unit_norm(vector: &[f32]) -> bool {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    (norm - 1.0).abs() < UNIT_NORM_TOLERANCE
}
