//! Citation resolver.
//!
//! Given a generated answer and the turn's [`SourceMap`], determines which
//! sources the answer actually used and renumbers them densely.
//!
//! # Passes
//!
//! 1. **Explicit**: every `[n]` marker whose `n` is in the source map marks
//!    that source as used, ordered by first occurrence in the answer.
//! 2. **Fallback**: only when the explicit pass found nothing and the policy
//!    allows it: a source is used if any of its sentences of at least
//!    `min_len` characters appears verbatim (case-insensitive) in the answer.
//!    Models routinely drop markers on follow-up turns while reusing earlier
//!    material; this heuristic recovers some of those. It has false positives
//!    (incidental overlap) and false negatives (paraphrase).
//!
//! # Rewrite
//!
//! All markers are rewritten in one pass over the original answer. Known
//! ids map to their new dense id; unknown ids are dropped together with the
//! whitespace before them. Rewriting in a single pass matters: remapping
//! `2→1` and then `1→2` as two independent substitutions would turn
//! `"[2] and [1]"` into `"[2] and [2]"`.

use regex::{Captures, Regex};
use std::collections::HashMap;
use std::sync::LazyLock;

use crate::models::CitedSource;
use crate::source_map::{split_sentences, SourceMap};

static MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[(\d+)\]").expect("valid marker regex"));
static MARKER_WITH_LEADING_SPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\s*)\[(\d+)\]").expect("valid marker regex"));

/// Default minimum sentence length for fallback attribution.
pub const DEFAULT_FALLBACK_MIN_CHARS: usize = 30;

/// How sources are attributed when the answer carries no usable markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CitationPolicy {
    /// Only `[n]` markers count.
    ExplicitOnly,
    /// Markers first; if none, verbatim sentence overlap of at least
    /// `min_len` characters.
    ExplicitThenSubstringFallback { min_len: usize },
}

impl Default for CitationPolicy {
    fn default() -> Self {
        CitationPolicy::ExplicitThenSubstringFallback {
            min_len: DEFAULT_FALLBACK_MIN_CHARS,
        }
    }
}

/// How the used sources were found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attribution {
    Explicit,
    Fallback,
    None,
}

/// Output of [`resolve_citations`].
#[derive(Debug, Clone)]
pub struct Resolution {
    /// Answer with markers renumbered and unknown markers removed.
    pub answer: String,
    /// Used sources in new-id order.
    pub sources: Vec<CitedSource>,
    pub attribution: Attribution,
}

/// Resolve and renumber the citations of `answer` against `sources`.
pub fn resolve_citations(answer: &str, sources: &SourceMap, policy: CitationPolicy) -> Resolution {
    let mut used = explicit_citations(answer, sources);
    let mut attribution = if used.is_empty() {
        Attribution::None
    } else {
        Attribution::Explicit
    };

    if used.is_empty() && !sources.is_empty() {
        if let CitationPolicy::ExplicitThenSubstringFallback { min_len } = policy {
            used = fallback_citations(answer, sources, min_len);
            if !used.is_empty() {
                tracing::info!(
                    used = used.len(),
                    "attributed sources by content overlap without markers"
                );
                attribution = Attribution::Fallback;
            }
        }
    }

    let renumber: HashMap<&str, String> = used
        .iter()
        .enumerate()
        .map(|(i, old)| (old.as_str(), (i + 1).to_string()))
        .collect();

    let rewritten = rewrite_markers(answer, &renumber);

    let cited: Vec<CitedSource> = used
        .iter()
        .filter_map(|old| {
            let entry = sources.get(old)?;
            Some(CitedSource {
                id: renumber.get(old.as_str())?.clone(),
                title: entry.title.clone(),
                content: entry.normalized_text.clone(),
                parent_id: entry.parent_id.clone(),
            })
        })
        .collect();

    tracing::info!(
        cited = cited.len(),
        available = sources.len(),
        "resolved citations"
    );

    Resolution {
        answer: rewritten,
        sources: cited,
        attribution,
    }
}

/// Ids of all `[n]` markers in `text`, in order, including repeats.
pub fn marker_ids(text: &str) -> impl Iterator<Item = &str> {
    MARKER
        .captures_iter(text)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
}

/// Source ids cited by marker, in order of first occurrence.
///
/// Markers naming ids outside the map are ignored.
pub fn explicit_citations(answer: &str, sources: &SourceMap) -> Vec<String> {
    let mut used: Vec<String> = Vec::new();
    for id in marker_ids(answer) {
        if sources.get(id).is_some() && !used.iter().any(|u| u == id) {
            used.push(id.to_string());
        }
    }
    used
}

/// Source ids whose long-enough sentences appear verbatim in `answer`,
/// in source-map key order.
pub fn fallback_citations(answer: &str, sources: &SourceMap, min_len: usize) -> Vec<String> {
    let answer_lower = answer.to_lowercase();
    sources
        .iter()
        .filter(|entry| {
            split_sentences(&entry.normalized_text)
                .into_iter()
                .map(strip_emphasis)
                .filter(|s| s.chars().count() >= min_len)
                .any(|s| answer_lower.contains(&s.to_lowercase()))
        })
        .map(|entry| entry.id.clone())
        .collect()
}

fn strip_emphasis(sentence: &str) -> &str {
    sentence
        .strip_prefix("**")
        .and_then(|s| s.strip_suffix("**"))
        .unwrap_or(sentence)
}

/// Rewrite every `[old]` marker to `[new]` in a single pass.
///
/// Markers whose id is not in `renumber` are removed along with the
/// whitespace that precedes them.
pub fn rewrite_markers(answer: &str, renumber: &HashMap<&str, String>) -> String {
    MARKER_WITH_LEADING_SPACE
        .replace_all(answer, |caps: &Captures| match renumber.get(&caps[2]) {
            Some(new_id) => format!("{}[{}]", &caps[1], new_id),
            None => String::new(),
        })
        .into_owned()
}
