use std::collections::BTreeMap;
use std::sync::Arc;

use recording::RecordingGateway;

use noio_backend::MemoryBackend;
use noio_cache::MetadataCache;
use noio_core::fingerprint::fingerprint;
use noio_core::traits::{BackendGateway, EmbedPurpose, Embedder, MetadataStore};
use noio_core::types::{hit_count, Document, HitsBySource, MetadataRecord, Metrics, SearchHit, Sentence};
use noio_core::{Error, ModeSelection, SearchMode};
use noio_embed::HashEmbedder;
use noio_search::{rerank, Reranker, SearchOrchestrator, SearchRequest};

const DIM: usize = 256;

fn embedder() -> Arc<HashEmbedder> { Arc::new(HashEmbedder::new(DIM)) }

fn doc(id: &str, source: &str, ratio: Option<f32>, sentences: &[&str]) -> Document {
    let e = embedder();
    let text = sentences.join(" ");
    Document {
        doc_id: id.to_string(),
        sourcename: source.to_string(),
        text_vector: Some(e.embed(&text, EmbedPurpose::Passage).unwrap()),
        text,
        hawaiian_word_ratio: ratio,
        sentences: sentences
            .iter()
            .enumerate()
            .map(|(i, s)| Sentence {
                text: s.to_string(),
                position: i,
                vector: Some(e.embed(s, EmbedPurpose::Passage).unwrap()),
                fingerprint: None,
            })
            .collect(),
        ..Document::default()
    }
}

fn backend() -> Arc<MemoryBackend> {
    Arc::new(MemoryBackend::with_documents(vec![
        doc("d1", "Ka Lama Hawaii", Some(0.8), &["ka wai", "ka wai", "he mele hou"]),
        doc("d2", "Ka Hoku o Hawaii", Some(0.5), &["ka wai", "nani loa"]),
        doc("d3", "", Some(0.2), &["aloha kakou", "ua hele au"]),
    ]))
}

fn orchestrator(backend: Arc<MemoryBackend>) -> SearchOrchestrator { SearchOrchestrator::new(embedder(), backend) }

mod recording {
    use std::sync::Mutex;

    use noio_core::query::StructuredQuery;
    use noio_core::traits::BackendGateway;
    use noio_core::types::RawHit;

    /// Remembers the last query and answers with nothing.
    #[derive(Default)]
    pub struct RecordingGateway {
        pub last: Mutex<Option<StructuredQuery>>,
    }

    impl BackendGateway for RecordingGateway {
        fn execute_query(&self, query: &StructuredQuery) -> noio_core::Result<Vec<RawHit>> {
            *self.last.lock().unwrap() = Some(query.clone());
            Ok(Vec::new())
        }
    }
}

struct FailingGateway;

impl BackendGateway for FailingGateway {
    fn execute_query(&self, query: &noio_core::query::StructuredQuery) -> noio_core::Result<Vec<noio_core::types::RawHit>> {
        Err(Error::backend_query(query.mode, &query.text, "connection reset"))
    }
}

struct FailingEmbedder;

impl Embedder for FailingEmbedder {
    fn dim(&self) -> usize { DIM }
    fn embed(&self, text: &str, _purpose: EmbedPurpose) -> noio_core::Result<Vec<f32>> { Err(Error::embedding(text, "model unavailable")) }
}

#[test]
fn lexical_hits_carry_highlight_snippets_and_metrics() {
    let hits = orchestrator(backend()).search(&SearchRequest::new("nani", ModeSelection::Single(SearchMode::Match))).unwrap();
    assert_eq!(hit_count(&hits), 1);
    let hit = &hits["Ka Hoku o Hawaii"][0];
    assert_eq!(hit.source_id, "d2");
    assert_eq!(hit.mode, SearchMode::Match);
    assert!(hit.snippets[0].contains("<em>nani</em>"));
    assert_eq!(hit.metrics.token_matches, Some(1));
    assert_eq!(hit.metrics.snippet_length, Some(hit.snippets[0].chars().count()));
    assert_eq!(hit.metrics.cosine_score, None);
}

#[test]
fn missing_source_name_falls_back_to_id() {
    let hits = orchestrator(backend()).search(&SearchRequest::new("aloha", ModeSelection::Single(SearchMode::Match))).unwrap();
    assert_eq!(hits.keys().collect::<Vec<_>>(), vec!["d3"]);
}

#[test]
fn vector_hits_report_offset_cosine() {
    let hits = orchestrator(backend()).search(&SearchRequest::new("ka wai", ModeSelection::Single(SearchMode::Vector))).unwrap();
    assert_eq!(hit_count(&hits), 3);
    for hit in hits.values().flatten() {
        let expected = ((hit.score - 1.0) * 10_000.0).round() / 10_000.0;
        assert_eq!(hit.metrics.cosine_score, Some(expected));
        assert!(!hit.snippets.is_empty());
    }
}

#[test]
fn request_shape_reaches_the_gateway() {
    let gateway = Arc::new(RecordingGateway::default());
    let orch = SearchOrchestrator::new(embedder(), gateway.clone());
    let mut request = SearchRequest::new("wai", ModeSelection::Single(SearchMode::Phrase));
    request.max_results = 7;
    request.snippet_size = 40;
    request.num_fragments = 2;
    assert!(orch.search(&request).unwrap().is_empty());

    let last = gateway.last.lock().unwrap().clone().unwrap();
    assert_eq!(last.size, 70);
    let highlight = last.highlight.unwrap();
    assert_eq!(highlight.fragment_size, 40);
    assert_eq!(highlight.number_of_fragments, 2);
}

#[test]
fn vectorsentence_keeps_only_similar_sentences() {
    let hits = orchestrator(backend())
        .search(&SearchRequest::new("ka wai", ModeSelection::Single(SearchMode::VectorSentence)))
        .unwrap();
    assert_eq!(hit_count(&hits), 3);
    assert_eq!(hits["Ka Lama Hawaii"].len(), 2);
    assert_eq!(hits["Ka Hoku o Hawaii"].len(), 1);
    for hit in hits.values().flatten() {
        assert_eq!(hit.snippets, vec!["ka wai".to_string()]);
    }
}

#[test]
fn vectorsentence_k_bounds_parents_and_sentences() {
    let mut request = SearchRequest::new("ka wai", ModeSelection::Single(SearchMode::VectorSentence));
    request.k = Some(1);
    let hits = orchestrator(backend()).search(&request).unwrap();
    assert_eq!(hit_count(&hits), 1);
}

#[test]
fn threshold_above_every_similarity_yields_nothing() {
    let b = Arc::new(MemoryBackend::with_documents(vec![doc("d", "A", Some(0.5), &["he mele hou"])]));
    let hits = orchestrator(b).search(&SearchRequest::new("ka wai", ModeSelection::Single(SearchMode::VectorSentence))).unwrap();
    assert!(hits.is_empty());
}

#[test]
fn all_is_the_union_of_every_mode() {
    let orch = orchestrator(backend());
    let per_mode: usize = SearchMode::ALL
        .iter()
        .map(|m| hit_count(&orch.search(&SearchRequest::new("ka wai", ModeSelection::Single(*m))).unwrap()))
        .sum();
    let all = orch.search(&SearchRequest::new("ka wai", ModeSelection::All)).unwrap();
    assert!(per_mode > 0);
    assert_eq!(hit_count(&all), per_mode);
}

#[test]
fn embedding_failure_aborts_the_search() {
    let orch = SearchOrchestrator::new(Arc::new(FailingEmbedder), backend());
    let err = orch.search(&SearchRequest::new("wai", ModeSelection::Single(SearchMode::Vector)));
    assert!(matches!(err, Err(Error::Embedding { .. })));
    assert!(matches!(orch.search(&SearchRequest::new("wai", ModeSelection::All)), Err(Error::Embedding { .. })));
    assert!(orch.search(&SearchRequest::new("wai", ModeSelection::Single(SearchMode::Match))).is_ok());
}

#[test]
fn backend_failure_degrades_to_empty() {
    let orch = SearchOrchestrator::new(embedder(), Arc::new(FailingGateway));
    let hits = orch.search(&SearchRequest::new("wai", ModeSelection::All)).unwrap();
    assert!(hits.is_empty());
}

#[test]
fn invalid_request_is_rejected() {
    let mut request = SearchRequest::new("wai", ModeSelection::Single(SearchMode::Match));
    request.max_results = 0;
    assert!(matches!(orchestrator(backend()).search(&request), Err(Error::InvalidConfig(_))));
}

fn sentence_hit(source: &str, snippet: &str, score: f32) -> SearchHit {
    SearchHit {
        source_id: format!("{source}-id"),
        source_name: source.to_string(),
        mode: SearchMode::VectorSentence,
        score,
        snippets: vec![snippet.to_string()],
        metrics: Metrics::default(),
        combined_score: None,
    }
}

fn cache_with(records: &[(&str, f32)]) -> MetadataCache {
    let store = Arc::new(MemoryBackend::with_documents(Vec::new()));
    let batch: BTreeMap<String, MetadataRecord> = records
        .iter()
        .map(|(snippet, bp)| (fingerprint(snippet), MetadataRecord { boilerplate_score: Some(*bp), ..MetadataRecord::default() }))
        .collect();
    store.bulk_upsert_metadata(&batch).unwrap();
    MetadataCache::new(store, 16, std::time::Duration::from_secs(3600)).unwrap()
}

#[test]
fn rerank_mixes_relevance_and_quality() {
    let mut hits = HitsBySource::new();
    hits.insert("A".into(), vec![sentence_hit("A", "ka wai ola", 10.0)]);
    hits.insert("B".into(), vec![sentence_hit("B", "nani ka aina", 5.0)]);
    let mut cache = cache_with(&[("ka wai ola", 0.8), ("nani ka aina", 0.0)]);

    let ranked = rerank(hits, &mut cache, 0.5).unwrap();
    let a = ranked["A"][0].combined_score.unwrap();
    let b = ranked["B"][0].combined_score.unwrap();
    assert!((a - 0.6).abs() < 1e-5);
    assert!((b - 0.75).abs() < 1e-5);
    let flat = noio_core::types::flatten_ranked(&ranked);
    assert_eq!(flat[0].source_name, "B");
}

#[test]
fn rerank_orders_within_a_source_and_tolerates_missing_metadata() {
    let mut hits = HitsBySource::new();
    hits.insert("A".into(), vec![sentence_hit("A", "boilerplate", 4.0), sentence_hit("A", "unknown", 2.0), sentence_hit("A", "clean", 2.0)]);
    let mut cache = cache_with(&[("boilerplate", 1.0), ("clean", 0.0)]);
    let ranked = Reranker::new(0.9).unwrap().rerank(hits, &mut cache);
    let order: Vec<&str> = ranked["A"].iter().map(|h| h.snippets[0].as_str()).collect();
    assert_eq!(order, vec!["clean", "boilerplate", "unknown"]);
}

#[test]
fn rerank_rejects_weights_outside_unit_interval() {
    assert!(matches!(Reranker::new(1.5), Err(Error::InvalidConfig(_))));
    assert!(matches!(Reranker::new(f32::NAN), Err(Error::InvalidConfig(_))));
    let mut cache = cache_with(&[]);
    assert!(rerank(HitsBySource::new(), &mut cache, 0.3).unwrap().is_empty());
}

#[test]
fn search_reranked_only_touches_sentence_modes() {
    let orch = orchestrator(backend());
    let mut cache = cache_with(&[]);
    let reranker = Reranker::default();

    let lexical = orch
        .search_reranked(&SearchRequest::new("nani", ModeSelection::Single(SearchMode::Match)), &reranker, &mut cache)
        .unwrap();
    assert!(lexical.values().flatten().all(|h| h.combined_score.is_none()));

    let sentences = orch
        .search_reranked(&SearchRequest::new("ka wai", ModeSelection::Single(SearchMode::VectorSentence)), &reranker, &mut cache)
        .unwrap();
    assert_eq!(hit_count(&sentences), 3);
    assert!(sentences.values().flatten().all(|h| h.combined_score.is_some()));
}
