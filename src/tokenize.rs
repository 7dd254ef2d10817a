//! Query tokenization and normalization.
//!
//! One raw question string produces two artifacts: an FTS5 match string for
//! the lexical index and a normalized text for the embedding encoder.
//!
//! The token patterns are tuned for exam text that mixes Korean prose with
//! clinical abbreviations (`HCO3`, `pCO2`, `HbA1c`), ratios (`120/80`) and
//! decimals (`7.35`). Reserved FTS5 operators and exam-scaffolding stopwords
//! are filtered so the generated match string can never break the parser.

use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;
use unicode_segmentation::UnicodeSegmentation;

/// Maximum number of terms in a generated match string.
pub const MAX_MATCH_TERMS: usize = 16;

/// Character cap applied to embedding input text.
pub const EMBEDDING_TEXT_MAX_CHARS: usize = 4000;

/// FTS5 reserved operators (compared case-insensitively).
const FTS_RESERVED: [&str; 4] = ["OR", "AND", "NOT", "NEAR"];

/// Exam-scaffolding stopwords dropped from lexical queries.
///
/// These are the connective words of question stems ("다음 중 옳은 것은...")
/// that match every chunk and drown out the clinical terms.
const DEFAULT_STOPWORDS: [&str; 19] = [
    "다음",
    "중",
    "옳은",
    "틀린",
    "아닌",
    "것",
    "가장",
    "맞는",
    "고른",
    "고르시오",
    "선지",
    "문항",
    "보기",
    "위",
    "아래",
    "다음중",
    "해당",
    "설명",
    "것은",
];

// Token patterns, in priority order:
//  - ratios like 120/80
//  - decimals like 7.35
//  - alnum like HCO3, HbA1c, pCO2 (and the digit-first mirror, like 2A)
//  - Latin words with optional trailing +/-
//  - Hangul runs
//  - bare integers
static TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\d+/\d+|\d+\.\d+|[A-Za-z]+\d+[A-Za-z0-9]*[+-]?|\d+[A-Za-z]+[A-Za-z0-9]*|[A-Za-z]+[+-]?|[가-힣]+|\d+",
    )
    .unwrap_or_else(|e| panic!("token pattern failed to compile: {e}"))
});

static WHITESPACE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\s+").unwrap_or_else(|e| panic!("whitespace pattern failed to compile: {e}"))
});

/// Tokenizer and match-string builder for lexical retrieval.
///
/// Owns the stop-phrase set so deployments can extend it; the default set
/// covers Korean exam scaffolding.
#[derive(Debug, Clone)]
pub struct QueryNormalizer {
    stopwords: HashSet<String>,
}

impl Default for QueryNormalizer {
    fn default() -> Self {
        Self {
            stopwords: DEFAULT_STOPWORDS.iter().map(ToString::to_string).collect(),
        }
    }
}

impl QueryNormalizer {
    /// Creates a normalizer with an extended stop-phrase set.
    #[must_use]
    pub fn with_stopwords<I: IntoIterator<Item = String>>(extra: I) -> Self {
        let mut normalizer = Self::default();
        normalizer.stopwords.extend(extra);
        normalizer
    }

    /// Extracts lexical tokens from raw text.
    ///
    /// Tokens equal to an FTS5 reserved operator or a stop-phrase are
    /// dropped. Order is preserved; duplicates are kept (the match-string
    /// builder dedupes).
    #[must_use]
    pub fn tokens(&self, text: &str) -> Vec<String> {
        TOKEN_RE
            .find_iter(text)
            .map(|m| m.as_str().to_string())
            .filter(|t| !is_reserved(t) && !self.stopwords.contains(t))
            .collect()
    }

    /// Removes stop-phrases from an externally supplied token list.
    ///
    /// Used when mixing HyDE keywords with original tokens.
    #[must_use]
    pub fn strip_stopwords(&self, tokens: &[String]) -> Vec<String> {
        tokens
            .iter()
            .filter(|t| !self.stopwords.contains(*t))
            .cloned()
            .collect()
    }

    /// Builds the default match string (16-term cap, `OR`-joined).
    #[must_use]
    pub fn match_query(&self, text: &str) -> String {
        build_match_query(&self.tokens(text), MAX_MATCH_TERMS)
    }

    /// Builds progressively narrower match strings (16, 8, 4 terms).
    ///
    /// Callers that hit an over-broad match can retry down the ladder.
    #[must_use]
    pub fn match_query_variants(&self, text: &str) -> Vec<String> {
        let tokens = self.tokens(text);
        if tokens.is_empty() {
            return Vec::new();
        }
        [MAX_MATCH_TERMS, 8, 4]
            .iter()
            .map(|&n| build_match_query(&tokens, n))
            .collect()
    }
}

fn is_reserved(token: &str) -> bool {
    FTS_RESERVED
        .iter()
        .any(|op| token.eq_ignore_ascii_case(op))
}

/// Whether a token must be double-quoted inside an FTS5 match string.
///
/// Quoting is required for single characters, digit-leading tokens, and
/// anything containing FTS5 punctuation.
#[must_use]
pub fn needs_quote(token: &str) -> bool {
    if token.is_empty() {
        return false;
    }
    if token.chars().count() == 1 {
        return true;
    }
    if token.starts_with(|c: char| c.is_ascii_digit()) {
        return true;
    }
    token
        .chars()
        .any(|c| matches!(c, '-' | '+' | '/' | '*' | '"' | '(' | ')' | '{' | '}' | '[' | ']' | ':'))
}

/// Joins tokens into an FTS5 match string.
///
/// Dedupes preserving first occurrence, caps at `max_terms`, quotes tokens
/// that need it, and joins with ` OR `. A single retained token emits just
/// that (possibly quoted) token. Empty input emits an empty string.
#[must_use]
pub fn build_match_query(tokens: &[String], max_terms: usize) -> String {
    let mut seen = HashSet::new();
    let mut deduped: Vec<&String> = Vec::new();
    for token in tokens {
        if token.is_empty() || !seen.insert(token.as_str()) {
            continue;
        }
        deduped.push(token);
        if deduped.len() >= max_terms {
            break;
        }
    }
    let quoted: Vec<String> = deduped
        .iter()
        .map(|t| {
            if needs_quote(t) {
                format!("\"{t}\"")
            } else {
                (*t).clone()
            }
        })
        .collect();
    quoted.join(" OR ")
}

/// Drops positive terms that appear (case-insensitively) in the negatives.
#[must_use]
pub fn filter_negative_terms(tokens: &[String], negatives: &[String]) -> Vec<String> {
    if tokens.is_empty() || negatives.is_empty() {
        return tokens.to_vec();
    }
    let negatives: HashSet<String> = negatives
        .iter()
        .filter(|n| !n.is_empty())
        .map(|n| n.to_lowercase())
        .collect();
    tokens
        .iter()
        .filter(|t| !negatives.contains(&t.to_lowercase()))
        .cloned()
        .collect()
}

/// Normalizes text for embedding: NBSP to space, whitespace collapse, trim,
/// and a grapheme-safe truncation to `max_chars`.
#[must_use]
pub fn normalize_embedding_text(text: &str, max_chars: usize) -> String {
    if text.is_empty() {
        return String::new();
    }
    let replaced = text.replace('\u{00a0}', " ");
    let collapsed = WHITESPACE_RE.replace_all(&replaced, " ");
    truncate_graphemes(collapsed.trim(), max_chars)
}

/// Truncates to at most `max` grapheme clusters without splitting one.
#[must_use]
pub fn truncate_graphemes(text: &str, max: usize) -> String {
    match text.grapheme_indices(true).nth(max) {
        Some((byte_idx, _)) => text[..byte_idx].to_string(),
        None => text.to_string(),
    }
}
