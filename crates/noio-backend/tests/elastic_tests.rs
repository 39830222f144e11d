use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{json, Value};

use noio_backend::elastic::{bulk_body, bulk_item_error, parse_search_response, render_request};
use noio_core::query::{Field, Highlight};
use noio_core::types::MetadataRecord;
use noio_core::SearchMode;
use noio_embed::HashEmbedder;
use noio_query::{QueryBuilder, QueryParams};

fn render(mode: SearchMode, text: &str) -> Value {
    let builder = QueryBuilder::new(Arc::new(HashEmbedder::new(8)));
    let q = builder.build(mode, text, &QueryParams::default()).unwrap();
    render_request(&q)
}

#[test]
fn lexical_modes_render_ln1p_prior() {
    let body = render(SearchMode::Match, "aloha");
    let fs = &body["query"]["function_score"];
    assert_eq!(fs["query"], json!({ "match": { "text": { "query": "aloha", "operator": "or" } } }));
    assert_eq!(fs["functions"][0]["field_value_factor"]["modifier"], "ln1p");
    assert_eq!(fs["functions"][0]["field_value_factor"]["field"], "hawaiian_word_ratio");
    assert_eq!(fs["functions"][1]["weight"], 1.0);
    assert_eq!(fs["score_mode"], "sum");
    assert_eq!(fs["boost_mode"], "multiply");

    assert_eq!(render(SearchMode::Term, "Aloha")["query"]["function_score"]["query"], json!({ "term": { "text.keyword": "Aloha" } }));
    assert_eq!(
        render(SearchMode::Regexp, "al.*")["query"]["function_score"]["query"],
        json!({ "regexp": { "text.keyword": { "value": "al.*" } } })
    );
    assert_eq!(
        render(SearchMode::Wildcard, "al*")["query"]["function_score"]["query"],
        json!({ "wildcard": { "text": { "value": "al*", "case_insensitive": true } } })
    );
    assert_eq!(render(SearchMode::Phrase, "ka wai")["query"]["function_score"]["query"], json!({ "match_phrase": { "text": "ka wai" } }));
}

#[test]
fn vector_and_hybrid_render_script_score() {
    let body = render(SearchMode::Vector, "wai");
    let ss = &body["query"]["script_score"];
    assert_eq!(
        ss["script"]["source"],
        "(cosineSimilarity(params.query_vector, 'text_vector') + 1.0) * (doc['hawaiian_word_ratio'].value + 0.1)"
    );
    assert_eq!(ss["script"]["params"]["query_vector"].as_array().map(Vec::len), Some(8));
    assert_eq!(ss["query"]["bool"]["filter"][0], json!({ "exists": { "field": "text_vector" } }));

    let body = render(SearchMode::Hybrid, "wai");
    let b = &body["query"]["script_score"]["query"]["bool"];
    assert_eq!(b["minimum_should_match"], 1);
    assert_eq!(b["should"][1]["wildcard"]["text"]["value"], "*wai*");
    assert!(b["filter"][3]["script"]["script"]["source"].as_str().unwrap().contains("doc['text.keyword'].value != ''"));
}

#[test]
fn knn_renders_at_top_level() {
    let body = render(SearchMode::Knn, "wai");
    assert!(body.get("query").is_none());
    assert_eq!(body["knn"]["field"], "text_vector");
    assert_eq!(body["knn"]["k"], 10);
    assert_eq!(body["knn"]["num_candidates"], 100);
    assert!(body["knn"]["filter"]["bool"]["filter"][0]["script"].is_object());
}

#[test]
fn sentence_modes_render_nested_with_inner_hits() {
    let body = render(SearchMode::VectorSentence, "wai");
    let nested = &body["query"]["nested"];
    assert_eq!(nested["path"], "sentences");
    assert_eq!(nested["query"]["knn"]["field"], "sentences.vector");
    assert_eq!(nested["query"]["knn"]["num_candidates"], 200);
    assert_eq!(nested["inner_hits"], json!({ "name": "matched_sentences", "size": 100, "_source": true }));
    assert_eq!(body["_source"], json!(["sourcename"]));

    let body = render(SearchMode::HybridSentence, "wai");
    let nested = &body["query"]["nested"];
    assert_eq!(nested["score_mode"], "max");
    assert_eq!(nested["inner_hits"]["size"], 5);
    assert_eq!(nested["inner_hits"]["sort"], json!([{ "_score": { "order": "desc" } }]));
    let fs = &nested["query"]["function_score"];
    assert_eq!(fs["boost_mode"], "multiply");
    assert_eq!(fs["query"]["match"]["sentences.text"]["operator"], "and");
    assert_eq!(
        fs["functions"][0]["script_score"]["script"]["source"],
        "(cosineSimilarity(params.query_vector, 'sentences.vector') + 1.0)"
    );

    let body = render(SearchMode::MatchSentenceAll, "ka wai");
    let inner = &body["query"]["nested"]["inner_hits"];
    assert!(inner.get("size").is_none());
    assert!(inner.get("sort").is_none());
    assert_eq!(body["_source"], json!(["sourcename", "text"]));
}

#[test]
fn highlight_and_size_are_rendered() {
    let builder = QueryBuilder::new(Arc::new(HashEmbedder::new(8)));
    let q = builder
        .build(SearchMode::Match, "wai", &QueryParams::default())
        .unwrap()
        .with_size(100)
        .with_highlight(Highlight { field: Field::Text, fragment_size: 150, number_of_fragments: 3 });
    let body = render_request(&q);
    assert_eq!(body["size"], 100);
    assert_eq!(body["highlight"], json!({ "fields": { "text": { "fragment_size": 150, "number_of_fragments": 3 } } }));
}

#[test]
fn parses_hits_highlights_and_inner_hits() {
    let payload = json!({
        "hits": { "hits": [
            {
                "_id": "doc-1",
                "_score": 2.5,
                "_source": { "sourcename": "Ka Lama", "text": "Ka wai ola." },
                "highlight": { "text": ["Ka <em>wai</em> ola."] },
                "inner_hits": { "matched_sentences": { "hits": { "hits": [
                    { "_score": 0.9, "_nested": { "field": "sentences", "offset": 4 },
                      "_source": { "text": "Ka wai ola.", "vector": [0.5, 0.5] } }
                ] } } }
            },
            { "_id": "doc-2", "_score": null, "_source": { "sourcename": "Ka Hoku" } }
        ] }
    });
    let hits = parse_search_response(&payload);
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].id, "doc-1");
    assert!((hits[0].score - 2.5).abs() < 1e-6);
    assert_eq!(hits[0].highlights, vec!["Ka <em>wai</em> ola.".to_string()]);
    let ih = &hits[0].inner_hits[0];
    assert_eq!(ih.position, Some(4));
    assert_eq!(ih.vector.as_deref(), Some(&[0.5f32, 0.5][..]));
    assert_eq!(hits[1].score, 0.0);
    assert_eq!(hits[1].text, None);
    assert!(parse_search_response(&json!({})).is_empty());
}

#[test]
fn bulk_body_is_ndjson_and_item_errors_are_reported() {
    let mut records = BTreeMap::new();
    records.insert("abc".to_string(), MetadataRecord { frequency: 2, ..MetadataRecord::default() });
    let body = bulk_body("hawaiian-metadata", &records).unwrap();
    let lines: Vec<&str> = body.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(body.ends_with('\n'));
    let action: Value = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(action, json!({ "index": { "_index": "hawaiian-metadata", "_id": "abc" } }));
    let doc: Value = serde_json::from_str(lines[1]).unwrap();
    assert_eq!(doc, json!({ "frequency": 2 }));

    assert_eq!(bulk_item_error(&json!({ "errors": false, "items": [] })), None);
    let failed = json!({ "errors": true, "items": [
        { "index": { "_id": "ok", "status": 200 } },
        { "index": { "_id": "bad", "status": 400, "error": { "reason": "mapper_parsing_exception" } } }
    ] });
    let reason = bulk_item_error(&failed).unwrap();
    assert!(reason.contains("bad") && reason.contains("mapper_parsing_exception"));
}
