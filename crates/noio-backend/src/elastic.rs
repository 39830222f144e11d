//! Elasticsearch gateway over the blocking HTTP client.
//!
//! [`render_request`] turns a [`StructuredQuery`] into `_search` DSL and
//! [`parse_search_response`] turns the response back into [`RawHit`]s; both
//! are pure so they can be tested without a cluster.

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;

use noio_core::config::BackendSettings;
use noio_core::error::{Error, Result};
use noio_core::query::{
    BoolQuery, Field, InnerHitSort, KnnQuery, NestedQuery, Operator, Query, ScoreCombine, ScoreMode, StructuredQuery,
    VectorScore, INNER_HITS_NAME,
};
use noio_core::traits::{BackendGateway, MetadataStore};
use noio_core::types::{InnerHit, MetadataRecord, RawHit};

pub struct ElasticsearchGateway {
    client: Client,
    base_url: String,
    index: String,
    metadata_index: String,
}

impl ElasticsearchGateway {
    pub fn new(settings: &BackendSettings) -> Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(key) = &settings.api_key {
            let value = HeaderValue::from_str(&format!("ApiKey {key}"))
                .map_err(|e| Error::InvalidConfig(format!("backend.api_key is not a valid header value: {e}")))?;
            headers.insert(AUTHORIZATION, value);
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .danger_accept_invalid_certs(settings.accept_invalid_certs)
            .default_headers(headers)
            .build()
            .map_err(|e| Error::InvalidConfig(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: settings.url.trim_end_matches('/').to_string(),
            index: settings.index.clone(),
            metadata_index: settings.metadata_index.clone(),
        })
    }

    fn search_url(&self) -> String { format!("{}/{}/_search", self.base_url, self.index) }
}

impl BackendGateway for ElasticsearchGateway {
    fn execute_query(&self, sq: &StructuredQuery) -> Result<Vec<RawHit>> {
        let body = render_request(sq);
        let fail = |message: String| Error::backend_query(sq.mode, &sq.text, message);
        let response = self.client.post(self.search_url()).json(&body).send().map_err(|e| fail(e.to_string()))?;
        let status = response.status();
        let payload: Value = response.json().map_err(|e| fail(format!("invalid response body: {e}")))?;
        if !status.is_success() {
            return Err(fail(format!("status {status}: {}", error_reason(&payload))));
        }
        let hits = parse_search_response(&payload);
        tracing::debug!(mode = %sq.mode, hits = hits.len(), "elasticsearch query");
        Ok(hits)
    }
}

impl MetadataStore for ElasticsearchGateway {
    fn get_metadata(&self, key: &str) -> Result<Option<MetadataRecord>> {
        let read_err = |message: String| Error::BackendRead { key: key.to_string(), message };
        let url = format!("{}/{}/_doc/{}", self.base_url, self.metadata_index, key);
        let response = self.client.get(url).send().map_err(|e| read_err(e.to_string()))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(read_err(format!("status {}", response.status())));
        }
        let payload: Value = response.json().map_err(|e| read_err(e.to_string()))?;
        match payload.get("_source") {
            Some(source) => serde_json::from_value(source.clone()).map(Some).map_err(|e| read_err(e.to_string())),
            None => Ok(None),
        }
    }

    fn bulk_upsert_metadata(&self, records: &BTreeMap<String, MetadataRecord>) -> Result<()> {
        if records.is_empty() { return Ok(()); }
        let write_err = |message: String| Error::BackendWrite { keys: records.len(), message };
        let body = bulk_body(&self.metadata_index, records).map_err(|e| write_err(e.to_string()))?;
        let response = self
            .client
            .post(format!("{}/_bulk", self.base_url))
            .header(CONTENT_TYPE, "application/x-ndjson")
            .body(body)
            .send()
            .map_err(|e| write_err(e.to_string()))?;
        let status = response.status();
        let payload: Value = response.json().map_err(|e| write_err(e.to_string()))?;
        if !status.is_success() {
            return Err(write_err(format!("status {status}: {}", error_reason(&payload))));
        }
        match bulk_item_error(&payload) {
            Some(reason) => Err(write_err(reason)),
            None => Ok(()),
        }
    }
}

/// NDJSON `_bulk` body indexing every record under its key.
pub fn bulk_body(index: &str, records: &BTreeMap<String, MetadataRecord>) -> serde_json::Result<String> {
    let mut body = String::new();
    for (key, record) in records {
        body.push_str(&serde_json::to_string(&json!({ "index": { "_index": index, "_id": key } }))?);
        body.push('\n');
        body.push_str(&serde_json::to_string(record)?);
        body.push('\n');
    }
    Ok(body)
}

/// First item-level failure reported by a `_bulk` response.
pub fn bulk_item_error(payload: &Value) -> Option<String> {
    if !payload.get("errors").and_then(Value::as_bool).unwrap_or(false) {
        return None;
    }
    let items = payload.get("items").and_then(Value::as_array)?;
    let failed = items.iter().filter_map(|item| item.as_object()?.values().next()).find(|op| op.get("error").is_some());
    Some(match failed {
        Some(op) => format!("{} failed: {}", op.get("_id").and_then(Value::as_str).unwrap_or("?"), error_reason(op)),
        None => "bulk request reported errors".to_string(),
    })
}

fn error_reason(payload: &Value) -> String {
    let err = payload.get("error");
    err.and_then(|e| e.get("reason"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| err.map(Value::to_string))
        .unwrap_or_else(|| "unknown error".to_string())
}

/// Full `_search` request body.
pub fn render_request(sq: &StructuredQuery) -> Value {
    let mut body = Map::new();
    body.insert("size".into(), json!(sq.size));
    match &sq.query {
        Query::Knn(knn) => {
            body.insert("knn".into(), render_knn(knn));
        }
        q => {
            body.insert("query".into(), render_query(q));
        }
    }
    let source: Vec<&str> = sq.source_fields.iter().map(Field::path).collect();
    body.insert("_source".into(), json!(source));
    if let Some(h) = &sq.highlight {
        body.insert(
            "highlight".into(),
            json!({ "fields": { h.field.path(): {
                "fragment_size": h.fragment_size,
                "number_of_fragments": h.number_of_fragments,
            } } }),
        );
    }
    Value::Object(body)
}

pub fn render_query(query: &Query) -> Value {
    match query {
        Query::MatchAll => json!({ "match_all": {} }),
        Query::Match { field, text, operator } => json!({
            "match": { field.path(): { "query": text, "operator": operator_name(*operator) } }
        }),
        Query::Term { field, value } => json!({ "term": { field.path(): value } }),
        Query::Phrase { field, text } => json!({ "match_phrase": { field.path(): text } }),
        Query::Regexp { field, pattern } => json!({ "regexp": { field.path(): { "value": pattern } } }),
        Query::Wildcard { field, pattern, case_insensitive } => json!({
            "wildcard": { field.path(): { "value": pattern, "case_insensitive": case_insensitive } }
        }),
        Query::Exists { field } => json!({ "exists": { "field": field.path() } }),
        Query::NonEmpty { field } => {
            // doc values live on the keyword sub-field
            let path = if *field == Field::Text { Field::TextKeyword.path() } else { field.path() };
            json!({ "script": { "script": {
                "source": format!("doc['{path}'].size() != 0 && doc['{path}'].value != ''"),
                "lang": "painless",
            } } })
        }
        Query::Bool(b) => render_bool(b),
        Query::RatioPrior(inner) => json!({
            "function_score": {
                "query": render_query(inner),
                "functions": [
                    { "field_value_factor": {
                        "field": Field::HawaiianWordRatio.path(),
                        "modifier": "ln1p",
                        "factor": 1.0,
                        "missing": 0,
                    } },
                    { "weight": 1.0 },
                ],
                "score_mode": "sum",
                "boost_mode": "multiply",
            }
        }),
        Query::VectorScore(vs) => render_vector_score(vs),
        Query::Knn(knn) => json!({ "knn": render_knn(knn) }),
        Query::Nested(nested) => render_nested(nested),
    }
}

fn operator_name(op: Operator) -> &'static str {
    match op {
        Operator::Or => "or",
        Operator::And => "and",
    }
}

fn render_bool(b: &BoolQuery) -> Value {
    let mut inner = Map::new();
    for (name, clauses) in [("must", &b.must), ("should", &b.should), ("filter", &b.filter)] {
        if !clauses.is_empty() {
            inner.insert(name.into(), Value::Array(clauses.iter().map(render_query).collect()));
        }
    }
    if let Some(msm) = b.minimum_should_match {
        inner.insert("minimum_should_match".into(), json!(msm));
    }
    json!({ "bool": inner })
}

/// Painless source for `(cosine + offset) [* (ratio + offset)]`.
pub fn vector_script(vs: &VectorScore) -> String {
    let mut source = format!("(cosineSimilarity(params.query_vector, '{}') + {:?})", vs.field.path(), vs.cosine_offset);
    if let Some(offset) = vs.ratio_offset {
        source.push_str(&format!(" * (doc['{}'].value + {:?})", Field::HawaiianWordRatio.path(), offset));
    }
    source
}

fn render_vector_score(vs: &VectorScore) -> Value {
    let script = json!({ "source": vector_script(vs), "params": { "query_vector": vs.vector } });
    match vs.combine {
        ScoreCombine::Replace => json!({ "script_score": { "query": render_query(&vs.query), "script": script } }),
        ScoreCombine::Multiply => json!({
            "function_score": {
                "query": render_query(&vs.query),
                "functions": [ { "script_score": { "script": script } } ],
                "boost_mode": "multiply",
            }
        }),
    }
}

fn render_knn(knn: &KnnQuery) -> Value {
    let mut body = Map::new();
    body.insert("field".into(), json!(knn.field.path()));
    body.insert("query_vector".into(), json!(knn.vector));
    body.insert("k".into(), json!(knn.k));
    body.insert("num_candidates".into(), json!(knn.num_candidates));
    if let Some(filter) = &knn.filter {
        body.insert("filter".into(), render_query(filter));
    }
    Value::Object(body)
}

fn render_nested(nested: &NestedQuery) -> Value {
    let mut inner_hits = Map::new();
    inner_hits.insert("name".into(), json!(nested.inner_hits.name));
    if let Some(size) = nested.inner_hits.size {
        inner_hits.insert("size".into(), json!(size));
    }
    if nested.inner_hits.sort == InnerHitSort::ScoreDesc {
        inner_hits.insert("sort".into(), json!([{ "_score": { "order": "desc" } }]));
    }
    inner_hits.insert("_source".into(), json!(true));

    let mut body = Map::new();
    body.insert("path".into(), json!(nested.path));
    body.insert("query".into(), render_query(&nested.query));
    let score_mode = match nested.score_mode {
        ScoreMode::Avg => "avg",
        ScoreMode::Max => "max",
        ScoreMode::None => "none",
    };
    body.insert("score_mode".into(), json!(score_mode));
    body.insert("inner_hits".into(), Value::Object(inner_hits));
    json!({ "nested": body })
}

/// Extract hits, stored fields, highlight fragments and named inner hits.
pub fn parse_search_response(payload: &Value) -> Vec<RawHit> {
    let Some(hits) = payload.pointer("/hits/hits").and_then(Value::as_array) else { return Vec::new() };
    hits.iter().map(parse_hit).collect()
}

fn score_of(hit: &Value) -> f32 { hit.get("_score").and_then(Value::as_f64).unwrap_or(0.0) as f32 }

fn parse_hit(hit: &Value) -> RawHit {
    let source = hit.get("_source");
    let str_field = |name: &str| source.and_then(|s| s.get(name)).and_then(Value::as_str).map(str::to_string);
    let highlights = hit
        .pointer(&format!("/highlight/{}", Field::Text.path()))
        .and_then(Value::as_array)
        .map(|frags| frags.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default();
    let inner_hits = hit
        .pointer(&format!("/inner_hits/{INNER_HITS_NAME}/hits/hits"))
        .and_then(Value::as_array)
        .map(|inner| inner.iter().map(parse_inner_hit).collect())
        .unwrap_or_default();
    RawHit {
        id: hit.get("_id").and_then(Value::as_str).unwrap_or_default().to_string(),
        score: score_of(hit),
        sourcename: str_field("sourcename"),
        text: str_field("text"),
        highlights,
        inner_hits,
    }
}

fn parse_inner_hit(hit: &Value) -> InnerHit {
    let source = hit.get("_source");
    let position = source
        .and_then(|s| s.get("position"))
        .or_else(|| hit.pointer("/_nested/offset"))
        .and_then(Value::as_u64)
        .map(|p| p as usize);
    let vector = source
        .and_then(|s| s.get("vector"))
        .and_then(Value::as_array)
        .map(|v| v.iter().filter_map(Value::as_f64).map(|x| x as f32).collect());
    InnerHit {
        score: score_of(hit),
        text: source.and_then(|s| s.get("text")).and_then(Value::as_str).unwrap_or_default().to_string(),
        position,
        vector,
    }
}
