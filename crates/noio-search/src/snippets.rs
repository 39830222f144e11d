//! Snippet extraction for one backend hit.
//!
//! Sources are tried in order and the first non-empty one wins:
//! backend highlights, qualifying inner sentences (sentence modes only), a
//! window around the first occurrence of the query phrase, and finally the
//! head of the text.

use regex::RegexBuilder;

use noio_core::types::{InnerHit, RawHit};
use noio_core::vector::cosine_similarity;
use noio_core::SearchMode;

/// Sentences kept per hit when inner hits are turned into snippets.
pub const MAX_SENTENCE_SNIPPETS: usize = 3;

#[derive(Debug, Clone, Copy)]
pub struct SnippetOptions {
    pub snippet_size: usize,
    pub similarity_threshold: f32,
}

pub fn extract_snippets(
    hit: &RawHit,
    mode: SearchMode,
    query_text: &str,
    query_vector: Option<&[f32]>,
    opts: &SnippetOptions,
) -> Vec<String> {
    if !hit.highlights.is_empty() {
        return hit.highlights.clone();
    }
    if mode.is_sentence_level() {
        if let Some(qv) = query_vector {
            let sentences: Vec<String> = qualifying_sentences(&hit.inner_hits, qv, opts.similarity_threshold)
                .into_iter()
                .take(MAX_SENTENCE_SNIPPETS)
                .map(|(_, ih)| ih.text.clone())
                .collect();
            if !sentences.is_empty() {
                return sentences;
            }
        }
    }
    let Some(text) = hit.text.as_deref().filter(|t| !t.is_empty()) else {
        return Vec::new();
    };
    if let Some(window) = phrase_window(text, query_text, opts.snippet_size) {
        return vec![window];
    }
    let head: String = text.chars().take(opts.snippet_size).collect();
    let head = head.trim();
    if head.is_empty() {
        Vec::new()
    } else {
        vec![head.to_string()]
    }
}

/// Inner hits carrying a vector whose cosine with `query_vector` reaches
/// `threshold`, most similar first.
pub fn qualifying_sentences<'a>(inner: &'a [InnerHit], query_vector: &[f32], threshold: f32) -> Vec<(f32, &'a InnerHit)> {
    let mut out: Vec<(f32, &InnerHit)> = inner
        .iter()
        .filter_map(|ih| {
            let v = ih.vector.as_deref()?;
            let sim = cosine_similarity(query_vector, v);
            (sim >= threshold).then_some((sim, ih))
        })
        .collect();
    out.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    out
}

/// Text around the first case-insensitive occurrence of the `*`-stripped
/// query, padded by half of `size` characters on each side. Newlines are
/// flattened first.
pub fn phrase_window(text: &str, query_text: &str, size: usize) -> Option<String> {
    let phrase = query_text.trim_matches('*');
    if phrase.trim().is_empty() {
        return None;
    }
    let flat = text.replace('\n', " ");
    let re = RegexBuilder::new(&regex::escape(phrase)).case_insensitive(true).build().ok()?;
    let m = re.find(&flat)?;

    let start_char = flat[..m.start()].chars().count();
    let end_char = start_char + m.as_str().chars().count();
    let half = size / 2;
    let from = start_char.saturating_sub(half);
    let to = end_char + half;
    let window: String = flat.chars().skip(from).take(to - from).collect();
    let window = window.trim();
    (!window.is_empty()).then(|| window.to_string())
}
