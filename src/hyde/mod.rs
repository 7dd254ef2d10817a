//! HyDE query transformation.
//!
//! Exam questions are wrapped in scaffolding ("which of the following is
//! correct...") that matches every chunk and none of the lecture prose. The
//! query transformer asks an LLM for a lecture-style paraphrase plus keyword
//! and negative-keyword lists, caches the artifact per
//! `(question_id, prompt_version)`, and retrieval mixes it into both the
//! lexical and dense queries.
//!
//! Generation is best-effort: on persistent LLM or parse failure the payload
//! is treated as absent and retrieval proceeds with the original text.

use crate::config::EngineConfig;
use crate::error::{Error, LlmError, Result};
use crate::llm::{
    GenerationParams, LlmProvider, RETRY_ATTEMPTS, RETRY_BASE_DELAY, RETRY_MAX_DELAY,
    retry_with_backoff,
};
use crate::storage::Storage;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// Output-token ceiling for HyDE generation.
const HYDE_MAX_OUTPUT_TOKENS: u32 = 400;

/// Prompt for the query generator.
///
/// The model must never answer the question or pick a choice; it rewrites
/// the question into retrieval artifacts under three fixed section headers.
const PROMPT_TEMPLATE: &str = r#"Role: you are a search-query generator for a lecture-note retrieval system.

Rules:
- Never state the answer to the question.
- Never pick or mention a specific choice number.
- Drop exam scaffolding such as "which of the following is correct/incorrect".
- Focus on the core concepts, mechanisms, diagnostic points, and differentials a lecture would cover.
- Keep domain terms in their original language (including English abbreviations) alongside any translation.
- Output exactly the format below.

Output format:
[KEYWORDS]
- (4-7 core keywords, 2-5 words each)

[LECTURE_STYLE_QUERY]
(1-2 declarative sentences phrased the way lecture notes would state it)

[NEGATIVE_KEYWORDS]
- (3-6 exam phrases or generic words that would hurt the search)

Question:
<<<
{question_text}
>>>
"#;

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)\[KEYWORDS\](.*?)\[LECTURE_STYLE_QUERY\](.*?)\[NEGATIVE_KEYWORDS\](.*)")
        .unwrap_or_else(|e| panic!("section pattern failed to compile: {e}"))
});

/// A cached HyDE artifact for one (question, prompt version).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryTransformation {
    /// Core keywords (at most the configured cap).
    pub keywords: Vec<String>,
    /// One-to-two-sentence lecture-style paraphrase.
    pub lecture_style_query: String,
    /// Exam phrases to subtract from the positive terms.
    pub negative_keywords: Vec<String>,
}

/// Renders the generation prompt for a question.
#[must_use]
pub fn build_prompt(question_text: &str) -> String {
    PROMPT_TEMPLATE.replace("{question_text}", question_text)
}

fn parse_bullets(section: &str) -> Vec<String> {
    let mut items = Vec::new();
    for line in section.lines() {
        let mut item = line.trim();
        if item.is_empty() {
            continue;
        }
        if let Some(stripped) = item.strip_prefix('-') {
            item = stripped.trim();
        }
        if !item.is_empty() && !items.iter().any(|existing| existing == item) {
            items.push(item.to_string());
        }
    }
    items
}

/// Parses generator output by scanning the three section headers in order.
///
/// Returns `None` when the lecture-style query section is missing or empty;
/// keyword sections may be empty.
#[must_use]
pub fn parse_transformation(text: &str) -> Option<QueryTransformation> {
    let captures = SECTION_RE.captures(text)?;
    let keywords = parse_bullets(captures.get(1).map_or("", |m| m.as_str()));
    let negative_keywords = parse_bullets(captures.get(3).map_or("", |m| m.as_str()));

    let lecture_style_query = captures
        .get(2)
        .map_or("", |m| m.as_str())
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    if lecture_style_query.is_empty() {
        return None;
    }

    Some(QueryTransformation {
        keywords,
        lecture_style_query,
        negative_keywords,
    })
}

fn cap_items(items: &mut Vec<String>, max: usize) {
    if max > 0 && items.len() > max {
        items.truncate(max);
    }
}

fn generate(
    llm: &dyn LlmProvider,
    config: &EngineConfig,
    question_text: &str,
) -> Result<QueryTransformation> {
    let prompt = build_prompt(question_text);
    let params = GenerationParams::text(0.2, HYDE_MAX_OUTPUT_TOKENS).with_top_p(0.8);
    retry_with_backoff(RETRY_ATTEMPTS, RETRY_BASE_DELAY, RETRY_MAX_DELAY, || {
        let text = llm.generate(config.hyde_model(), &prompt, &params)?;
        let mut parsed = parse_transformation(&text).ok_or_else(|| {
            Error::Llm(LlmError::InvalidResponse(
                "query transformation output missing sections".to_string(),
            ))
        })?;
        cap_items(&mut parsed.keywords, config.hyde.max_keywords);
        cap_items(&mut parsed.negative_keywords, config.hyde.max_negative);
        Ok(parsed)
    })
}

/// Fetches the HyDE payload for a question, optionally generating it.
///
/// Lookup order: cache row for `(question_id, prompt_version)`; then, if
/// `allow_generate`, an LLM call with retry. Persistent failure logs and
/// returns `None` — the payload is simply absent. A cache-write failure also
/// logs and still returns the generated payload.
pub fn get_query_payload(
    storage: &dyn Storage,
    llm: &dyn LlmProvider,
    config: &EngineConfig,
    question_id: i64,
    question_text: &str,
    allow_generate: bool,
) -> Option<QueryTransformation> {
    if question_text.is_empty() {
        return None;
    }
    let prompt_version = &config.hyde.prompt_version;
    match storage.get_question_query(question_id, prompt_version) {
        Ok(Some(cached)) => return Some(cached),
        Ok(None) => {}
        Err(error) => {
            tracing::warn!(question_id, %error, "HyDE cache lookup failed");
            return None;
        }
    }

    if !allow_generate {
        return None;
    }

    let generated = match generate(llm, config, question_text) {
        Ok(payload) => payload,
        Err(error) => {
            tracing::warn!(question_id, %error, "HyDE query generation failed");
            return None;
        }
    };

    if let Err(error) = storage.put_question_query(question_id, prompt_version, &generated) {
        tracing::warn!(question_id, %error, "HyDE query cache save failed");
    }
    Some(generated)
}
