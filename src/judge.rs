//! LLM judge: prompt construction, output parsing, and decision repair.
//!
//! The judge receives the question plus a numbered candidate block and must
//! return a JSON decision. Model output is messy in practice, so parsing is
//! layered: extract the first balanced `{...}` block (string-escape aware),
//! scrub fences/control characters/smart quotes/trailing commas, attempt a
//! strict parse, and only then fall back to regex field scraping.
//!
//! Post-processing enforces the decision invariants regardless of what the
//! model said: a lecture outside the candidate set downgrades to `no_match`,
//! and every evidence row is re-anchored to a snippet the candidate actually
//! offered.

use crate::config::JudgeConfig;
use crate::core::{Candidate, ClassificationDecision, JudgeEvidence};
use crate::error::{Error, LlmError, Result};
use crate::llm::{
    GenerationParams, LlmProvider, RETRY_ATTEMPTS, RETRY_BASE_DELAY, RETRY_MAX_DELAY,
    retry_with_backoff,
};
use regex::Regex;
use serde::Deserialize;
use std::sync::LazyLock;

/// Fallback evidence rows synthesized when the model's evidence filters to
/// nothing.
const FALLBACK_EVIDENCE_ROWS: usize = 2;

/// Raw evidence item as the model emits it.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawEvidence {
    /// Lecture the quote supports (per the model).
    pub lecture_id: Option<i64>,
    /// First page (per the model; replaced during normalization).
    pub page_start: Option<i64>,
    /// Last page (per the model; replaced during normalization).
    pub page_end: Option<i64>,
    /// Quoted text.
    pub quote: Option<String>,
    /// Source chunk (per the model).
    pub chunk_id: Option<i64>,
}

/// Raw decision as the model emits it, before invariant repair.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawDecision {
    /// Chosen lecture.
    pub lecture_id: Option<i64>,
    /// Confidence in `[0, 1]`.
    pub confidence: Option<f64>,
    /// Short rationale.
    pub reason: Option<String>,
    /// Short study hint.
    pub study_hint: Option<String>,
    /// Whether no candidate fits.
    pub no_match: Option<bool>,
    /// Evidence items.
    pub evidence: Option<Vec<RawEvidence>>,
}

/// Builds the classification prompt.
///
/// Candidates render as a numbered block; each candidate line carries its
/// identifier and display path, followed by up to three evidence lines of
/// the form `- p.X[-Y]: "snippet" (chunk_id: N)` and, when the context
/// expander ran, the assembled surrounding passage.
#[must_use]
pub fn build_classification_prompt(
    question_text: &str,
    choices: &[String],
    candidates: &[Candidate],
) -> String {
    let mut prompt = String::from(
        "You match an exam question to the single lecture whose notes best explain it.\n\n",
    );
    prompt.push_str("Question:\n");
    prompt.push_str(question_text);
    prompt.push('\n');
    if !choices.is_empty() {
        prompt.push_str("\nChoices:\n");
        for (idx, choice) in choices.iter().enumerate() {
            prompt.push_str(&format!("{}. {}\n", idx + 1, choice));
        }
    }

    prompt.push_str("\nCandidate lectures:\n");
    for (idx, candidate) in candidates.iter().enumerate() {
        prompt.push_str(&format!(
            "{}. [id: {}] {}\n",
            idx + 1,
            candidate.lecture_id,
            candidate.full_path
        ));
        for evidence in candidate.evidence.iter().take(3) {
            prompt.push_str(&format!(
                "   - {}: \"{}\" (chunk_id: {})\n",
                evidence.pages().label(),
                evidence.snippet,
                evidence.chunk_id
            ));
        }
        if let Some(parent) = &candidate.parent_text {
            prompt.push_str("   surrounding notes:\n");
            for line in parent.lines() {
                prompt.push_str("   > ");
                prompt.push_str(line);
                prompt.push('\n');
            }
        }
    }

    prompt.push_str(
        "\nReturn ONLY a JSON object with these fields:\n\
         - lecture_id: integer id of the chosen candidate, or null\n\
         - confidence: number between 0 and 1\n\
         - reason: short sentence naming the deciding concept\n\
         - study_hint: short sentence pointing the student at what to review\n\
         - no_match: true when no candidate lecture explains the question\n\
         - evidence: array of {lecture_id, page_start, page_end, quote, chunk_id}\n\
         Quote only from the candidate snippets above. If no_match is true,\n\
         lecture_id must be null and evidence must be empty.\n",
    );
    prompt
}

/// Extracts the first balanced `{...}` block, tolerating string escapes.
#[must_use]
pub fn extract_json_block(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in text[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=start + offset]);
                }
            }
            _ => {}
        }
    }
    None
}

static TRAILING_COMMA_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r",\s*([}\]])").unwrap_or_else(|e| panic!("comma pattern failed to compile: {e}"))
});

/// Scrubs common model-output damage: code fences, control characters,
/// smart quotes, and trailing commas.
#[must_use]
pub fn repair_json(text: &str) -> String {
    let defenced = text.replace("```json", "").replace("```", "");
    let cleaned: String = defenced
        .chars()
        .map(|c| {
            if c.is_control() && c != '\n' && c != '\t' {
                ' '
            } else {
                match c {
                    '\u{201c}' | '\u{201d}' => '"',
                    '\u{2018}' | '\u{2019}' => '\'',
                    other => other,
                }
            }
        })
        .collect();
    TRAILING_COMMA_RE.replace_all(&cleaned, "$1").into_owned()
}

static SCRAPE_LECTURE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""lecture_id"\s*:\s*(null|-?\d+)"#)
        .unwrap_or_else(|e| panic!("scrape pattern failed to compile: {e}"))
});
static SCRAPE_CONFIDENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""confidence"\s*:\s*([0-9.]+)"#)
        .unwrap_or_else(|e| panic!("scrape pattern failed to compile: {e}"))
});
static SCRAPE_NO_MATCH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""no_match"\s*:\s*(true|false)"#)
        .unwrap_or_else(|e| panic!("scrape pattern failed to compile: {e}"))
});
static SCRAPE_REASON_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""reason"\s*:\s*"([^"]*)""#)
        .unwrap_or_else(|e| panic!("scrape pattern failed to compile: {e}"))
});
static SCRAPE_HINT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""study_hint"\s*:\s*"([^"]*)""#)
        .unwrap_or_else(|e| panic!("scrape pattern failed to compile: {e}"))
});

/// Regex-scrapes scalar fields from unparseable output. Fallback path only;
/// evidence is unrecoverable here.
#[must_use]
pub fn scrape_fields(text: &str) -> Option<RawDecision> {
    let lecture = SCRAPE_LECTURE_RE.captures(text)?;
    let lecture_id = match &lecture[1] {
        "null" => None,
        digits => digits.parse().ok(),
    };
    Some(RawDecision {
        lecture_id,
        confidence: SCRAPE_CONFIDENCE_RE
            .captures(text)
            .and_then(|c| c[1].parse().ok()),
        reason: SCRAPE_REASON_RE.captures(text).map(|c| c[1].to_string()),
        study_hint: SCRAPE_HINT_RE.captures(text).map(|c| c[1].to_string()),
        no_match: SCRAPE_NO_MATCH_RE
            .captures(text)
            .and_then(|c| c[1].parse().ok()),
        evidence: None,
    })
}

/// Parses judge output through the extract → repair → strict-parse →
/// scrape ladder.
#[must_use]
pub fn parse_judge_output(text: &str) -> Option<RawDecision> {
    if let Some(block) = extract_json_block(text) {
        let repaired = repair_json(block);
        if let Ok(decision) = serde_json::from_str::<RawDecision>(&repaired) {
            return Some(decision);
        }
        tracing::debug!("strict JSON parse failed, falling back to field scrape");
    }
    scrape_fields(text)
}

fn collapse_ws(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Normalizes evidence for the selected candidate.
///
/// Items whose chunk is not offered by the candidate are dropped; a quote
/// that is not a substring of the candidate snippet falls back to that
/// snippet; pages always come from the candidate, never the model. When
/// nothing survives, the top candidate evidences are synthesized instead.
fn normalize_evidence(
    raw_items: &[RawEvidence],
    candidate: &Candidate,
) -> Vec<JudgeEvidence> {
    let mut normalized = Vec::new();
    for item in raw_items {
        let Some(chunk_id) = item.chunk_id else {
            continue;
        };
        let Some(source) = candidate.evidence.iter().find(|e| e.chunk_id == chunk_id) else {
            continue;
        };
        let quote = item.quote.as_deref().map(str::trim).unwrap_or_default();
        let quote = if !quote.is_empty()
            && collapse_ws(&source.snippet).contains(&collapse_ws(quote))
        {
            quote.to_string()
        } else {
            source.snippet.clone()
        };
        normalized.push(JudgeEvidence {
            lecture_id: Some(candidate.lecture_id),
            page_start: source.page_start,
            page_end: source.page_end,
            quote,
            chunk_id: Some(chunk_id),
        });
    }

    if normalized.is_empty() {
        normalized = candidate
            .evidence
            .iter()
            .take(FALLBACK_EVIDENCE_ROWS)
            .map(|source| JudgeEvidence {
                lecture_id: Some(candidate.lecture_id),
                page_start: source.page_start,
                page_end: source.page_end,
                quote: source.snippet.clone(),
                chunk_id: Some(source.chunk_id),
            })
            .collect();
    }
    normalized
}

/// Repairs a raw decision into an invariant-holding [`ClassificationDecision`].
///
/// Confidence is clamped to `[0, 1]` but otherwise retained even when the
/// decision downgrades to `no_match` (the caller may discount it).
#[must_use]
pub fn postprocess_decision(
    raw: RawDecision,
    candidates: &[Candidate],
    model_name: &str,
) -> ClassificationDecision {
    let candidate_ids: Vec<i64> = candidates.iter().map(|c| c.lecture_id).collect();
    let confidence = raw.confidence.unwrap_or(0.0).clamp(0.0, 1.0);
    let reason = raw.reason.unwrap_or_default();
    let study_hint = raw.study_hint.unwrap_or_default();
    let mut no_match = raw.no_match.unwrap_or(false);
    let mut lecture_id = raw.lecture_id;

    if no_match {
        lecture_id = None;
    } else if let Some(id) = lecture_id {
        if !candidate_ids.contains(&id) {
            tracing::debug!(lecture_id = id, "judge chose a lecture outside the candidate set");
            lecture_id = None;
            no_match = true;
        }
    } else {
        no_match = true;
    }

    let evidence = lecture_id
        .and_then(|id| candidates.iter().find(|c| c.lecture_id == id))
        .map(|candidate| {
            normalize_evidence(raw.evidence.as_deref().unwrap_or_default(), candidate)
        })
        .unwrap_or_default();

    ClassificationDecision {
        lecture_id,
        confidence,
        reason,
        study_hint,
        evidence,
        no_match,
        model_name: model_name.to_string(),
        candidate_ids,
        auto_confirmed: false,
    }
}

/// Classifies one question against its candidate list.
///
/// Calls the provider with a JSON response type and low temperature, retries
/// transient and parse failures with exponential backoff, and never raises
/// for model-quality problems: a permanently unusable response becomes a
/// `no_match` decision carrying the error in its reason.
#[must_use]
pub fn classify_single(
    llm: &dyn LlmProvider,
    config: &JudgeConfig,
    question_text: &str,
    choices: &[String],
    candidates: &[Candidate],
) -> ClassificationDecision {
    let candidate_ids: Vec<i64> = candidates.iter().map(|c| c.lecture_id).collect();
    if candidates.is_empty() {
        return ClassificationDecision::no_match(
            "no candidate lectures from retrieval".to_string(),
            config.model_name.clone(),
            candidate_ids,
        );
    }

    let prompt = build_classification_prompt(question_text, choices, candidates);
    let params = GenerationParams::json(config.temperature, config.max_output_tokens);

    let parsed = retry_with_backoff(RETRY_ATTEMPTS, RETRY_BASE_DELAY, RETRY_MAX_DELAY, || {
        let text = llm.generate(&config.model_name, &prompt, &params)?;
        parse_judge_output(&text).ok_or_else(|| {
            Error::Llm(LlmError::InvalidResponse(
                "judge output was not parseable JSON".to_string(),
            ))
        })
    });

    match parsed {
        Ok(raw) => postprocess_decision(raw, candidates, &config.model_name),
        Err(error) => {
            tracing::warn!(%error, "judge call failed permanently");
            let reason = match &error {
                Error::Llm(LlmError::InvalidResponse(detail)) => {
                    format!("JSON parse error: {detail}")
                }
                other => format!("LLM error: {other}"),
            };
            ClassificationDecision::no_match(reason, config.model_name.clone(), candidate_ids)
        }
    }
}
