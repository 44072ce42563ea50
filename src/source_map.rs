//! Source map builder.
//!
//! Turns the ranked hits of one retrieval call into a bounded, numbered,
//! citable context block plus a lookup table from citation id to passage.
//!
//! ```text
//! hits (≤ top_k) ──▶ first max_sources ──▶ drop blank ──▶ normalize ──▶ "1".."N"
//!                                                                         │
//!                          <source id="1">…</source>\n\n<source id="2">…  ◀┘
//! ```
//!
//! Text normalization is presentation only: sentences are put on their own
//! paragraph and short capitalized lines are bolded as headings.

use regex::Regex;
use std::sync::LazyLock;

use crate::models::{RetrievalHit, SourceEntry};

/// Context string used when no hit survives filtering.
///
/// Callers must not run generation against it.
pub const NO_CONTEXT_SENTINEL: &str = "[No context available from knowledge base]";

/// Default cap on the number of hits that become sources in one turn.
pub const DEFAULT_MAX_SOURCES: usize = 5;

static SENTENCE_END: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[.!?]\s+").expect("valid sentence regex"));
static BLANK_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n[ \t]*\n").expect("valid paragraph regex"));

/// Per-turn table from citation id to passage, in id order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceMap {
    entries: Vec<SourceEntry>,
}

impl SourceMap {
    /// Build a map from already-numbered entries. Later duplicates of an id
    /// are ignored.
    pub fn from_entries(entries: Vec<SourceEntry>) -> Self {
        let mut map = Self::default();
        for entry in entries {
            if map.get(&entry.id).is_none() {
                map.entries.push(entry);
            }
        }
        map
    }

    pub fn get(&self, id: &str) -> Option<&SourceEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    /// Entries in key order (`"1"`, `"2"`, …).
    pub fn iter(&self) -> impl Iterator<Item = &SourceEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Output of [`build_source_map`].
#[derive(Debug, Clone)]
pub struct SourceContext {
    /// Concatenated `<source id="n">…</source>` blocks, or
    /// [`NO_CONTEXT_SENTINEL`].
    pub context: String,
    pub sources: SourceMap,
}

impl SourceContext {
    /// `true` when retrieval produced nothing citable.
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

/// Build the numbered context block for one turn.
///
/// Keeps at most `max_sources` of the leading hits, skips hits whose text is
/// blank after trimming, and numbers the survivors `"1"`, `"2"`, … in the
/// order given.
pub fn build_source_map(hits: &[RetrievalHit], max_sources: usize) -> SourceContext {
    let mut entries = Vec::new();
    let mut blocks = Vec::new();

    for (position, hit) in hits.iter().take(max_sources).enumerate() {
        let text = hit.text.trim();
        if text.is_empty() {
            tracing::warn!(position, title = %hit.title, "skipping empty retrieval hit");
            continue;
        }

        let id = (entries.len() + 1).to_string();
        let normalized = format_context_text(text);
        if hit.parent_id.is_empty() {
            tracing::debug!(source = %id, "source has no parent id");
        }

        blocks.push(format!("<source id=\"{}\">{}</source>", id, normalized));
        entries.push(SourceEntry {
            id,
            title: hit.title.clone(),
            normalized_text: normalized,
            parent_id: hit.parent_id.clone(),
        });
    }

    let context = if entries.is_empty() {
        tracing::warn!(hits = hits.len(), "no usable retrieval hits");
        NO_CONTEXT_SENTINEL.to_string()
    } else {
        blocks.join("\n\n")
    };

    tracing::info!(
        hits = hits.len(),
        sources = entries.len(),
        "prepared retrieval context"
    );

    SourceContext {
        context,
        sources: SourceMap { entries },
    }
}

/// Split text into trimmed sentences.
///
/// Boundaries are `.`, `!` or `?` followed by whitespace, and blank lines.
/// Terminal punctuation stays with its sentence.
pub fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    for paragraph in BLANK_LINE.split(text) {
        let mut start = 0;
        for m in SENTENCE_END.find_iter(paragraph) {
            // punctuation is a single byte, keep it with the sentence
            let end = m.start() + 1;
            push_trimmed(&mut sentences, &paragraph[start..end]);
            start = m.end();
        }
        push_trimmed(&mut sentences, &paragraph[start..]);
    }
    sentences
}

fn push_trimmed<'a>(out: &mut Vec<&'a str>, piece: &'a str) {
    let piece = piece.trim();
    if !piece.is_empty() {
        out.push(piece);
    }
}

/// Normalize passage text for presentation.
///
/// Every sentence becomes its own paragraph. Interior paragraphs that look
/// like headings (see [`looks_like_heading`]) are wrapped in `**`.
pub fn format_context_text(text: &str) -> String {
    let sentences = split_sentences(text.trim());
    let last = sentences.len().saturating_sub(1);

    sentences
        .iter()
        .enumerate()
        .map(|(i, sentence)| {
            if i > 0 && i < last && looks_like_heading(sentence) {
                format!("**{}**", sentence)
            } else {
                (*sentence).to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Uppercase first letter, 6 to 41 characters, single line, no colon.
pub fn looks_like_heading(line: &str) -> bool {
    let mut chars = line.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if !first.is_uppercase() {
        return false;
    }
    let rest = line.chars().count() - 1;
    (5..=40).contains(&rest) && !line.contains('\n') && !line.contains(':')
}
