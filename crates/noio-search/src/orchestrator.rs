use std::sync::Arc;

use noio_core::config::SearchSettings;
use noio_core::query::{Field, Highlight, StructuredQuery};
use noio_core::traits::{BackendGateway, Embedder, MetadataLookup};
use noio_core::types::{union_hits, HitsBySource, RawHit, SearchHit};
use noio_core::{Error, ModeSelection, Result, SearchMode};
use noio_query::{QueryBuilder, QueryParams};

use crate::metrics::compute_metrics;
use crate::rerank::Reranker;
use crate::snippets::{extract_snippets, qualifying_sentences, SnippetOptions};

/// One search call.
///
/// - `max_results`: the backend is asked for `max_results * candidate_multiplier` hits
/// - `snippet_size`/`num_fragments`: highlight and fallback-window shape
/// - `similarity_threshold`: minimum cosine for a sentence to count as a match
/// - `k`: overrides the per-mode neighbour count
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query: String,
    pub modes: ModeSelection,
    pub max_results: usize,
    pub snippet_size: usize,
    pub num_fragments: usize,
    pub similarity_threshold: f32,
    pub candidate_multiplier: usize,
    pub k: Option<usize>,
}

impl SearchRequest {
    /// A request with the built-in search defaults.
    pub fn new(query: impl Into<String>, modes: ModeSelection) -> Self { Self::from_settings(query, modes, &SearchSettings::default()) }

    pub fn from_settings(query: impl Into<String>, modes: ModeSelection, settings: &SearchSettings) -> Self {
        Self {
            query: query.into(),
            modes,
            max_results: settings.max_results,
            snippet_size: settings.snippet_size,
            num_fragments: settings.num_fragments,
            similarity_threshold: settings.similarity_threshold,
            candidate_multiplier: settings.candidate_multiplier,
            k: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_results == 0 {
            return Err(Error::InvalidConfig("max_results must be at least 1".into()));
        }
        if self.candidate_multiplier == 0 {
            return Err(Error::InvalidConfig("candidate_multiplier must be at least 1".into()));
        }
        if self.snippet_size == 0 {
            return Err(Error::InvalidConfig("snippet_size must be at least 1".into()));
        }
        Ok(())
    }

    fn params(&self) -> QueryParams {
        QueryParams { k: self.k, candidate_multiplier: Some(self.candidate_multiplier), similarity_threshold: self.similarity_threshold }
    }

    fn snippet_options(&self) -> SnippetOptions {
        SnippetOptions { snippet_size: self.snippet_size, similarity_threshold: self.similarity_threshold }
    }
}

/// Runs one or all modes against a backend and turns raw hits into
/// snippet-bearing results grouped by source name.
///
/// A backend failure empties that mode's results and is logged; embedding and
/// configuration errors abort the whole call.
pub struct SearchOrchestrator {
    builder: QueryBuilder,
    gateway: Arc<dyn BackendGateway>,
    expand_sentence_hits: bool,
}

impl SearchOrchestrator {
    pub fn new(embedder: Arc<dyn Embedder>, gateway: Arc<dyn BackendGateway>) -> Self {
        Self { builder: QueryBuilder::new(embedder), gateway, expand_sentence_hits: true }
    }

    /// When on (the default), sentence-level modes yield one hit per
    /// qualifying sentence instead of one per parent document.
    pub fn with_sentence_expansion(mut self, on: bool) -> Self {
        self.expand_sentence_hits = on;
        self
    }

    pub fn search(&self, request: &SearchRequest) -> Result<HitsBySource> {
        request.validate()?;
        let mut results = HitsBySource::new();
        for mode in request.modes.modes() {
            let hits = self.search_mode(mode, request)?;
            tracing::info!(mode = %mode, sources = hits.len(), "mode finished");
            union_hits(&mut results, hits);
        }
        Ok(results)
    }

    /// [`SearchOrchestrator::search`] followed by the quality reranker when a
    /// single sentence-level mode was requested. Other selections pass through.
    pub fn search_reranked<L>(&self, request: &SearchRequest, reranker: &Reranker, metadata: &mut L) -> Result<HitsBySource>
    where
        L: MetadataLookup + ?Sized,
    {
        let hits = self.search(request)?;
        match request.modes {
            ModeSelection::Single(mode) if mode.is_sentence_level() => Ok(reranker.rerank(hits, metadata)),
            _ => Ok(hits),
        }
    }

    fn search_mode(&self, mode: SearchMode, request: &SearchRequest) -> Result<HitsBySource> {
        let query = self
            .builder
            .build(mode, &request.query, &request.params())?
            .with_size(request.max_results.saturating_mul(request.candidate_multiplier))
            .with_highlight(Highlight { field: Field::Text, fragment_size: request.snippet_size, number_of_fragments: request.num_fragments });

        let raw = match self.gateway.execute_query(&query) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(mode = %mode, query = %request.query, error = %e, "backend query failed; mode returns no hits");
                return Ok(HitsBySource::new());
            }
        };
        tracing::debug!(mode = %mode, raw_hits = raw.len(), "backend returned");

        if mode.is_sentence_level() && self.expand_sentence_hits {
            Ok(expand_sentences(&query, raw, request))
        } else {
            Ok(document_hits(&query, raw, request))
        }
    }
}

fn source_name(hit: &RawHit) -> String { hit.sourcename.clone().filter(|s| !s.is_empty()).unwrap_or_else(|| hit.id.clone()) }

fn document_hits(query: &StructuredQuery, raw: Vec<RawHit>, request: &SearchRequest) -> HitsBySource {
    let opts = request.snippet_options();
    let mut out = HitsBySource::new();
    for hit in raw {
        let snippets = extract_snippets(&hit, query.mode, &request.query, query.query_vector.as_deref(), &opts);
        if snippets.is_empty() {
            tracing::debug!(id = %hit.id, "hit without snippets dropped");
            continue;
        }
        let metrics = compute_metrics(&snippets, &request.query, query.mode, hit.score);
        let name = source_name(&hit);
        out.entry(name.clone()).or_default().push(SearchHit {
            source_id: hit.id,
            source_name: name,
            mode: query.mode,
            score: hit.score,
            snippets,
            metrics,
            combined_score: None,
        });
    }
    out
}

/// One hit per inner sentence whose cosine with the query vector reaches the
/// threshold, at most the requested inner-hit count per parent. Hits are
/// ordered by sentence score across all parents before grouping.
fn expand_sentences(query: &StructuredQuery, raw: Vec<RawHit>, request: &SearchRequest) -> HitsBySource {
    let Some(query_vector) = query.query_vector.as_deref() else {
        return HitsBySource::new();
    };
    let per_parent = query.inner_hits().and_then(|ih| ih.size).unwrap_or(usize::MAX);

    let mut sentences: Vec<SearchHit> = Vec::new();
    for hit in &raw {
        let name = source_name(hit);
        for (_, inner) in qualifying_sentences(&hit.inner_hits, query_vector, request.similarity_threshold)
            .into_iter()
            .take(per_parent)
        {
            let snippets = vec![inner.text.clone()];
            let metrics = compute_metrics(&snippets, &request.query, query.mode, inner.score);
            sentences.push(SearchHit {
                source_id: hit.id.clone(),
                source_name: name.clone(),
                mode: query.mode,
                score: inner.score,
                snippets,
                metrics,
                combined_score: None,
            });
        }
    }
    sentences.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

    let mut out = HitsBySource::new();
    for hit in sentences {
        out.entry(hit.source_name.clone()).or_default().push(hit);
    }
    out
}
