//! Context expansion for uncertain retrievals.
//!
//! Grows each candidate's best evidence chunk into a same-lecture semantic
//! neighborhood: the seed text becomes a BM25 query restricted to its own
//! lecture, the top neighbors are concatenated after the seed under a
//! character budget, and the assembled parent text is attached to the
//! candidate for the judge prompt.
//!
//! Idempotent: repeated invocation with unchanged state yields identical
//! output.

use crate::config::ExpansionConfig;
use crate::core::{Candidate, LectureChunk, PageRange};
use crate::storage::Storage;
use crate::tokenize::{QueryNormalizer, truncate_graphemes};

/// Separator between the seed and its neighbors in the parent text.
const PARENT_SEPARATOR: &str = "\n\n---\n\n";

/// Suffix appended when the assembled text is cut at the budget.
const TRUNCATION_MARK: &str = "...(truncated)";

/// Assembles `[seed, neighbors...]` into one text block under `max_chars`.
///
/// Chunks append in order until the next one would exceed the budget. A seed
/// that alone exceeds the budget is kept by itself and ellipsized.
fn assemble_parent_text(chunks: &[LectureChunk], max_chars: usize) -> (String, Vec<i64>) {
    let mut selected: Vec<&LectureChunk> = Vec::new();
    let mut total = 0usize;

    for chunk in chunks {
        let content_len = chunk.content.chars().count();
        let added = content_len
            + if selected.is_empty() {
                0
            } else {
                PARENT_SEPARATOR.len()
            };
        if !selected.is_empty() && total + added > max_chars {
            break;
        }
        if selected.is_empty() && content_len > max_chars {
            selected.push(chunk);
            break;
        }
        selected.push(chunk);
        total += added;
    }

    if selected.is_empty() {
        return (String::new(), Vec::new());
    }

    let mut text = selected
        .iter()
        .map(|c| c.content.as_str())
        .collect::<Vec<_>>()
        .join(PARENT_SEPARATOR);
    if text.chars().count() > max_chars {
        text = truncate_graphemes(&text, max_chars);
        text.push_str(TRUNCATION_MARK);
    }
    let ids = selected.iter().filter_map(|c| c.id).collect();
    (text, ids)
}

/// Expands candidates with same-lecture semantic neighbors.
///
/// Each candidate's `evidence[0]` chunk seeds the expansion; candidates with
/// no usable seed pass through unchanged. Disabled entirely by
/// `semantic_enabled = false`.
#[must_use]
pub fn expand_candidates(
    storage: &dyn Storage,
    config: &ExpansionConfig,
    mut candidates: Vec<Candidate>,
) -> Vec<Candidate> {
    if candidates.is_empty() || !config.semantic_enabled {
        return candidates;
    }

    let normalizer = QueryNormalizer::default();
    for candidate in &mut candidates {
        let Some(seed_id) = candidate.evidence.first().map(|e| e.chunk_id) else {
            continue;
        };
        let Ok(Some(seed)) = storage.get_chunk(seed_id) else {
            continue;
        };
        if seed.is_empty() {
            continue;
        }

        let seed_text = truncate_graphemes(seed.content.trim(), config.semantic_query_max_chars);
        let match_query = normalizer.match_query(&seed_text);
        if match_query.is_empty() {
            continue;
        }

        let neighbors = match storage.semantic_neighbors(
            &match_query,
            seed.lecture_id,
            seed_id,
            config.semantic_top_n,
        ) {
            Ok(neighbors) => neighbors,
            Err(error) => {
                tracing::warn!(seed_id, %error, "semantic neighbor search failed");
                continue;
            }
        };

        let mut ordered: Vec<LectureChunk> = Vec::with_capacity(1 + config.semantic_max_extra);
        ordered.push(seed);
        ordered.extend(neighbors.into_iter().take(config.semantic_max_extra));
        // Defensive dedupe preserving order.
        let mut seen = std::collections::HashSet::new();
        ordered.retain(|chunk| chunk.id.is_some_and(|id| seen.insert(id)));

        let (parent_text, parent_chunk_ids) =
            assemble_parent_text(&ordered, config.parent_max_chars);
        if parent_text.is_empty() {
            continue;
        }

        candidate.parent_page_ranges = ordered
            .iter()
            .filter(|chunk| chunk.id.is_some_and(|id| parent_chunk_ids.contains(&id)))
            .map(|chunk| PageRange {
                start: chunk.page_start,
                end: chunk.page_end,
            })
            .collect();
        candidate.parent_text = Some(parent_text);
        candidate.parent_chunk_ids = parent_chunk_ids;
    }

    candidates
}
