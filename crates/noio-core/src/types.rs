//! Domain types shared by the builder, backends, cache and orchestrator.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::mode::SearchMode;

pub type DocId = String;
pub type Fingerprint = String;

/// A source document with its nested sentences.
///
/// - `doc_id`: stable identity across reindexing
/// - `groupname`/`sourcename`/`authors`/`date`: descriptive attributes
/// - `text`: raw full text
/// - `text_vector`: full-text embedding, when computed
/// - `hawaiian_word_ratio`: document-level quality prior in [0,1]
/// - `sentences`: ordered nested sentences
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Document {
    pub doc_id: DocId,
    #[serde(default)]
    pub groupname: String,
    #[serde(default)]
    pub sourcename: String,
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub text_vector: Option<Vec<f32>>,
    #[serde(default)]
    pub hawaiian_word_ratio: Option<f32>,
    #[serde(default)]
    pub sentences: Vec<Sentence>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Sentence {
    pub text: String,
    pub position: usize,
    #[serde(default)]
    pub vector: Option<Vec<f32>>,
    #[serde(default)]
    pub fingerprint: Option<Fingerprint>,
}

/// Per-sentence quality signals, keyed by fingerprint.
///
/// Everything except `frequency` may be absent; an absent field is not the
/// same as zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataRecord {
    #[serde(default)]
    pub frequency: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub word_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boilerplate_score: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hawaiian_word_ratio: Option<f32>,
}

impl MetadataRecord {
    pub fn is_empty(&self) -> bool { *self == Self::default() }

    /// Monotonic counter; what one increment means is up to the caller.
    pub fn bump_frequency(&mut self) -> u64 {
        self.frequency = self.frequency.saturating_add(1);
        self.frequency
    }

    /// `1 - boilerplate_score`, or 0 when the score is unknown.
    pub fn quality(&self) -> f32 { self.boilerplate_score.map(|b| 1.0 - b).unwrap_or(0.0) }
}

/// A nested sentence returned alongside its parent hit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InnerHit {
    pub score: f32,
    pub text: String,
    #[serde(default)]
    pub position: Option<usize>,
    #[serde(default)]
    pub vector: Option<Vec<f32>>,
}

/// One hit as returned by a backend, before snippet extraction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawHit {
    pub id: DocId,
    pub score: f32,
    #[serde(default)]
    pub sourcename: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub highlights: Vec<String>,
    #[serde(default)]
    pub inner_hits: Vec<InnerHit>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_matches: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cosine_score: Option<f32>,
}

/// A result entry. `score` is mode-specific; higher is better.
/// `combined_score` is only set by the reranker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub source_id: DocId,
    pub source_name: String,
    pub mode: SearchMode,
    pub score: f32,
    pub snippets: Vec<String>,
    pub metrics: Metrics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub combined_score: Option<f32>,
}

impl SearchHit {
    pub fn primary_snippet(&self) -> &str { self.snippets.first().map(String::as_str).unwrap_or("") }
}

pub type HitsBySource = BTreeMap<String, Vec<SearchHit>>;

/// Total number of hits across all sources.
pub fn hit_count(hits: &HitsBySource) -> usize { hits.values().map(Vec::len).sum() }

/// Append every hit of `other` to `into`, keeping duplicates.
pub fn union_hits(into: &mut HitsBySource, other: HitsBySource) {
    for (source, entries) in other {
        into.entry(source).or_default().extend(entries);
    }
}

/// Flatten grouped hits and order them by `combined_score` when present,
/// otherwise by raw score. Ties keep grouping order.
pub fn flatten_ranked(hits: &HitsBySource) -> Vec<&SearchHit> {
    let mut all: Vec<&SearchHit> = hits.values().flatten().collect();
    all.sort_by(|a, b| {
        let ka = a.combined_score.unwrap_or(a.score);
        let kb = b.combined_score.unwrap_or(b.score);
        kb.partial_cmp(&ka).unwrap_or(std::cmp::Ordering::Equal)
    });
    all
}

/// The `n` best hits across all sources, in [`flatten_ranked`] order.
pub fn top_hits(hits: &HitsBySource, n: usize) -> Vec<&SearchHit> {
    let mut all = flatten_ranked(hits);
    all.truncate(n);
    all
}
