//! Engine configuration.
//!
//! Typed configuration for retrieval, HyDE, auto-confirm, context expansion,
//! the LLM judge, and the result cache. Values load from environment
//! variables with sensible defaults; validation is fatal at initialization.
//!
//! The full retrieval+judge tuple is fingerprinted by [`EngineConfig::config_hash`],
//! which keys the result cache together with the question id and model name.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::path::PathBuf;
use std::str::FromStr;

/// Default embedding model.
pub const DEFAULT_EMBEDDING_MODEL: &str = "intfloat/multilingual-e5-base";

/// Default embedding dimension for the default model.
pub const DEFAULT_EMBEDDING_DIM: usize = 768;

/// Default judge model.
pub const DEFAULT_JUDGE_MODEL: &str = "gemini-2.0-flash-lite";

/// Retrieval mode for candidate search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalMode {
    /// Lexical-only BM25 retrieval.
    Bm25,
    /// BM25 + embedding rerank fused with reciprocal-rank fusion.
    HybridRrf,
}

impl FromStr for RetrievalMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "bm25" => Ok(Self::Bm25),
            "hybrid_rrf" => Ok(Self::HybridRrf),
            other => Err(Error::Config {
                message: format!("unknown retrieval mode: {other}"),
            }),
        }
    }
}

/// How the HyDE pseudo-query participates in dense scoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HydeStrategy {
    /// Blend original and HyDE query vectors, renormalized.
    Blend,
    /// Score with both vectors; keep the list with the larger top-1/top-2 margin.
    BestOfTwo,
}

impl FromStr for HydeStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "blend" => Ok(Self::Blend),
            "best_of_two" => Ok(Self::BestOfTwo),
            other => Err(Error::Config {
                message: format!("unknown HyDE strategy: {other}"),
            }),
        }
    }
}

/// Which term set feeds the BM25 match string when a HyDE payload exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HydeBm25Variant {
    /// HyDE keywords plus de-stop-worded original tokens.
    MixedLight,
    /// Original tokens only.
    OrigOnly,
    /// HyDE keywords only.
    HydeOnly,
}

impl FromStr for HydeBm25Variant {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "mixed_light" => Ok(Self::MixedLight),
            "orig_only" => Ok(Self::OrigOnly),
            "hyde_only" => Ok(Self::HydeOnly),
            other => Err(Error::Config {
                message: format!("unknown HyDE bm25 variant: {other}"),
            }),
        }
    }
}

/// How HyDE negative keywords are applied to the positive term set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HydeNegativeMode {
    /// Drop positive terms with a case-insensitive match in the negatives.
    Stopwords,
    /// Do not apply negatives.
    None,
}

impl FromStr for HydeNegativeMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "stopwords" => Ok(Self::Stopwords),
            "none" => Ok(Self::None),
            other => Err(Error::Config {
                message: format!("unknown HyDE negative mode: {other}"),
            }),
        }
    }
}

/// Retrieval tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Retrieval mode for candidate search.
    pub mode: RetrievalMode,
    /// RRF constant `k`.
    pub rrf_k: u32,
    /// Dense rerank depth (also the floor for the BM25 pool in hybrid mode).
    pub embedding_top_n: usize,
    /// Embedding model name.
    pub embedding_model_name: String,
    /// Embedding dimension the engine expects from the model.
    pub embedding_dim: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            mode: RetrievalMode::HybridRrf,
            rrf_k: 60,
            embedding_top_n: 300,
            embedding_model_name: DEFAULT_EMBEDDING_MODEL.to_string(),
            embedding_dim: DEFAULT_EMBEDDING_DIM,
        }
    }
}

/// HyDE query-transformation tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HydeConfig {
    /// Whether HyDE payloads participate in retrieval at all.
    pub enabled: bool,
    /// Whether a missing payload may be generated on demand.
    pub auto_generate: bool,
    /// Prompt version; part of the payload cache key.
    pub prompt_version: String,
    /// Override model for HyDE generation (falls back to the judge model).
    pub model_name: Option<String>,
    /// Dense-side strategy.
    pub strategy: HydeStrategy,
    /// Lexical-side term-set variant.
    pub bm25_variant: HydeBm25Variant,
    /// Negative-keyword application mode.
    pub negative_mode: HydeNegativeMode,
    /// Margin epsilon for `best_of_two` tie-breaking.
    pub margin_eps: f32,
    /// Keyword cap per payload.
    pub max_keywords: usize,
    /// Negative-keyword cap per payload.
    pub max_negative: usize,
    /// Weight of the HyDE vector in `blend`.
    pub embed_weight: f32,
    /// Weight of the original vector in `blend`.
    pub embed_weight_orig: f32,
}

impl Default for HydeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            auto_generate: false,
            prompt_version: "hyde_v1".to_string(),
            model_name: None,
            strategy: HydeStrategy::Blend,
            bm25_variant: HydeBm25Variant::MixedLight,
            negative_mode: HydeNegativeMode::Stopwords,
            margin_eps: 0.0,
            max_keywords: 7,
            max_negative: 6,
            embed_weight: 0.7,
            embed_weight_orig: 0.3,
        }
    }
}

/// Auto-confirm v2 gate thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoConfirmConfig {
    /// Whether the gate may skip the LLM judge.
    pub enabled: bool,
    /// Minimum embedding margin to confirm.
    pub delta: f32,
    /// Maximum BM25 rank of the hybrid top-1 to confirm.
    pub max_bm25_rank: usize,
    /// Embedding margin below which retrieval counts as uncertain.
    pub delta_uncertain: f32,
    /// Hybrid top-1 chunk length below which retrieval counts as uncertain.
    pub min_chunk_len: usize,
}

impl Default for AutoConfirmConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            delta: 0.05,
            max_bm25_rank: 5,
            delta_uncertain: 0.03,
            min_chunk_len: 200,
        }
    }
}

/// Context-expansion tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpansionConfig {
    /// Master switch for the expansion stage.
    pub parent_enabled: bool,
    /// Character budget for the assembled parent text.
    pub parent_max_chars: usize,
    /// Whether same-lecture semantic neighbors are attached.
    pub semantic_enabled: bool,
    /// Neighbor pool size per seed.
    pub semantic_top_n: usize,
    /// Neighbors kept per seed.
    pub semantic_max_extra: usize,
    /// Seed-text cap when building the neighbor match query.
    pub semantic_query_max_chars: usize,
}

impl Default for ExpansionConfig {
    fn default() -> Self {
        Self {
            parent_enabled: false,
            parent_max_chars: 3500,
            semantic_enabled: true,
            semantic_top_n: 6,
            semantic_max_extra: 2,
            semantic_query_max_chars: 1200,
        }
    }
}

/// LLM judge tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeConfig {
    /// Judge model name.
    pub model_name: String,
    /// Output-token ceiling for the judge call.
    pub max_output_tokens: u32,
    /// Sampling temperature (kept low for determinism).
    pub temperature: f32,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            model_name: DEFAULT_JUDGE_MODEL.to_string(),
            max_output_tokens: 2048,
            temperature: 0.1,
        }
    }
}

/// Full engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Retrieval tuning.
    pub retrieval: RetrievalConfig,
    /// HyDE tuning.
    pub hyde: HydeConfig,
    /// Auto-confirm gate thresholds.
    pub auto_confirm: AutoConfirmConfig,
    /// Context-expansion tuning.
    pub expansion: ExpansionConfig,
    /// Judge tuning.
    pub judge: JudgeConfig,
    /// Result cache file path.
    #[serde(skip)]
    pub cache_path: PathBuf,
}

fn env_flag(name: &str, default: bool) -> bool {
    std::env::var(name).map_or(default, |v| {
        matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on")
    })
}

fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_string(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

impl EngineConfig {
    /// Builds a configuration from environment variables, falling back to
    /// defaults, and validates it.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when a threshold or enum value is
    /// invalid. Configuration errors are fatal at initialization.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            retrieval: RetrievalConfig {
                mode: env_parse("RETRIEVAL_MODE", defaults.retrieval.mode),
                rrf_k: env_parse("RRF_K", defaults.retrieval.rrf_k),
                embedding_top_n: env_parse("EMBEDDING_TOP_N", defaults.retrieval.embedding_top_n),
                embedding_model_name: env_string("EMBEDDING_MODEL_NAME", DEFAULT_EMBEDDING_MODEL),
                embedding_dim: env_parse("EMBEDDING_DIM", defaults.retrieval.embedding_dim),
            },
            hyde: HydeConfig {
                enabled: env_flag("HYDE_ENABLED", defaults.hyde.enabled),
                auto_generate: env_flag("HYDE_AUTO_GENERATE", defaults.hyde.auto_generate),
                prompt_version: env_string("HYDE_PROMPT_VERSION", &defaults.hyde.prompt_version),
                model_name: std::env::var("HYDE_MODEL_NAME").ok(),
                strategy: env_parse("HYDE_STRATEGY", defaults.hyde.strategy),
                bm25_variant: env_parse("HYDE_BM25_VARIANT", defaults.hyde.bm25_variant),
                negative_mode: env_parse("HYDE_NEGATIVE_MODE", defaults.hyde.negative_mode),
                margin_eps: env_parse("HYDE_MARGIN_EPS", defaults.hyde.margin_eps),
                max_keywords: env_parse("HYDE_MAX_KEYWORDS", defaults.hyde.max_keywords),
                max_negative: env_parse("HYDE_MAX_NEGATIVE", defaults.hyde.max_negative),
                embed_weight: env_parse("HYDE_EMBED_WEIGHT", defaults.hyde.embed_weight),
                embed_weight_orig: env_parse(
                    "HYDE_EMBED_WEIGHT_ORIG",
                    defaults.hyde.embed_weight_orig,
                ),
            },
            auto_confirm: AutoConfirmConfig {
                enabled: env_flag("AUTO_CONFIRM_V2_ENABLED", defaults.auto_confirm.enabled),
                delta: env_parse("AUTO_CONFIRM_V2_DELTA", defaults.auto_confirm.delta),
                max_bm25_rank: env_parse(
                    "AUTO_CONFIRM_V2_MAX_BM25_RANK",
                    defaults.auto_confirm.max_bm25_rank,
                ),
                delta_uncertain: env_parse(
                    "AUTO_CONFIRM_V2_DELTA_UNCERTAIN",
                    defaults.auto_confirm.delta_uncertain,
                ),
                min_chunk_len: env_parse(
                    "AUTO_CONFIRM_V2_MIN_CHUNK_LEN",
                    defaults.auto_confirm.min_chunk_len,
                ),
            },
            expansion: ExpansionConfig {
                parent_enabled: env_flag("PARENT_ENABLED", defaults.expansion.parent_enabled),
                parent_max_chars: env_parse(
                    "PARENT_MAX_CHARS",
                    defaults.expansion.parent_max_chars,
                ),
                semantic_enabled: env_flag(
                    "SEMANTIC_EXPANSION_ENABLED",
                    defaults.expansion.semantic_enabled,
                ),
                semantic_top_n: env_parse(
                    "SEMANTIC_EXPANSION_TOP_N",
                    defaults.expansion.semantic_top_n,
                ),
                semantic_max_extra: env_parse(
                    "SEMANTIC_EXPANSION_MAX_EXTRA",
                    defaults.expansion.semantic_max_extra,
                ),
                semantic_query_max_chars: env_parse(
                    "SEMANTIC_EXPANSION_QUERY_MAX_CHARS",
                    defaults.expansion.semantic_query_max_chars,
                ),
            },
            judge: JudgeConfig {
                model_name: env_string("GEMINI_MODEL_NAME", DEFAULT_JUDGE_MODEL),
                max_output_tokens: env_parse(
                    "GEMINI_MAX_OUTPUT_TOKENS",
                    defaults.judge.max_output_tokens,
                ),
                temperature: env_parse("GEMINI_TEMPERATURE", defaults.judge.temperature),
            },
            cache_path: env_string("CLASSIFIER_CACHE_PATH", "data/classifier_cache.json").into(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Validates thresholds and cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for any out-of-range value.
    pub fn validate(&self) -> Result<()> {
        fn fail(message: impl Into<String>) -> Result<()> {
            Err(Error::Config {
                message: message.into(),
            })
        }

        if self.retrieval.rrf_k == 0 {
            return fail("RRF_K must be > 0");
        }
        if self.retrieval.embedding_dim == 0 {
            return fail("EMBEDDING_DIM must be > 0");
        }
        if self.auto_confirm.delta < 0.0 {
            return fail("AUTO_CONFIRM_V2_DELTA must be >= 0");
        }
        if self.auto_confirm.delta_uncertain < 0.0 {
            return fail("AUTO_CONFIRM_V2_DELTA_UNCERTAIN must be >= 0");
        }
        if !(0.0..=1.0).contains(&self.hyde.embed_weight) {
            return fail("HYDE_EMBED_WEIGHT must be within [0, 1]");
        }
        if !(0.0..=1.0).contains(&self.hyde.embed_weight_orig) {
            return fail("HYDE_EMBED_WEIGHT_ORIG must be within [0, 1]");
        }
        if self.hyde.embed_weight + self.hyde.embed_weight_orig > 1.0 + f32::EPSILON {
            return fail("HYDE blend weights must sum to <= 1");
        }
        if self.judge.temperature > 0.2 {
            return fail("GEMINI_TEMPERATURE must be <= 0.2 for the judge");
        }
        if self.judge.max_output_tokens < 650 {
            return fail("GEMINI_MAX_OUTPUT_TOKENS must be >= 650");
        }
        Ok(())
    }

    /// Stable SHA-1 fingerprint of the retrieval+judge tuple.
    ///
    /// Serializes the configuration (minus the cache path, which does not
    /// affect results) to canonical JSON with sorted keys and hashes it. Two
    /// configurations that classify identically share a hash.
    #[must_use]
    pub fn config_hash(&self) -> String {
        // serde_json maps are BTree-backed, so object keys serialize sorted.
        let canonical =
            serde_json::to_value(self).map_or_else(|_| String::new(), |v| v.to_string());
        let mut hasher = Sha1::new();
        hasher.update(canonical.as_bytes());
        let digest = hasher.finalize();
        digest.iter().fold(String::new(), |mut acc, byte| {
            use std::fmt::Write as _;
            let _ = write!(acc, "{byte:02x}");
            acc
        })
    }

    /// Model used for HyDE generation (explicit override or the judge model).
    #[must_use]
    pub fn hyde_model(&self) -> &str {
        self.hyde
            .model_name
            .as_deref()
            .unwrap_or(&self.judge.model_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.retrieval.rrf_k, 60);
        assert_eq!(config.retrieval.embedding_top_n, 300);
        assert_eq!(config.auto_confirm.max_bm25_rank, 5);
        assert_eq!(config.expansion.parent_max_chars, 3500);
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!(
            "hybrid_rrf".parse::<RetrievalMode>().unwrap(),
            RetrievalMode::HybridRrf
        );
        assert_eq!("bm25".parse::<RetrievalMode>().unwrap(), RetrievalMode::Bm25);
        assert!("cosine".parse::<RetrievalMode>().is_err());
    }

    #[test]
    fn test_hyde_enum_parsing() {
        assert_eq!(
            "best_of_two".parse::<HydeStrategy>().unwrap(),
            HydeStrategy::BestOfTwo
        );
        assert_eq!(
            "mixed_light".parse::<HydeBm25Variant>().unwrap(),
            HydeBm25Variant::MixedLight
        );
        assert_eq!(
            "none".parse::<HydeNegativeMode>().unwrap(),
            HydeNegativeMode::None
        );
    }

    #[test]
    fn test_validate_rejects_bad_thresholds() {
        let mut config = EngineConfig::default();
        config.retrieval.rrf_k = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.judge.temperature = 0.9;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.hyde.embed_weight = 0.9;
        config.hyde.embed_weight_orig = 0.9;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_hash_stable() {
        let a = EngineConfig::default();
        let b = EngineConfig::default();
        assert_eq!(a.config_hash(), b.config_hash());
        assert_eq!(a.config_hash().len(), 40);
    }

    #[test]
    fn test_config_hash_sensitive_to_tuning() {
        let a = EngineConfig::default();
        let mut b = EngineConfig::default();
        b.retrieval.rrf_k = 10;
        assert_ne!(a.config_hash(), b.config_hash());
    }

    #[test]
    fn test_cache_path_not_in_hash() {
        let a = EngineConfig::default();
        let mut b = EngineConfig::default();
        b.cache_path = PathBuf::from("/elsewhere/cache.json");
        assert_eq!(a.config_hash(), b.config_hash());
    }

    #[test]
    fn test_hyde_model_fallback() {
        let mut config = EngineConfig::default();
        assert_eq!(config.hyde_model(), DEFAULT_JUDGE_MODEL);
        config.hyde.model_name = Some("gemini-2.0-flash".to_string());
        assert_eq!(config.hyde_model(), "gemini-2.0-flash");
    }
}
