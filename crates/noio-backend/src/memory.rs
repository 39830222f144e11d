//! In-memory gateway.
//!
//! Evaluates the structured query tree directly over a loaded corpus and keeps
//! metadata in a map. Read/write counters and injectable write failures make it
//! the instrumented store used throughout the test suites.

use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use noio_core::error::{Error, Result};
use noio_core::query::{
    ratio_prior, BoolQuery, Field, Highlight, InnerHitSort, KnnQuery, NestedQuery, Operator, Query, ScoreCombine,
    ScoreMode, StructuredQuery, VectorScore,
};
use noio_core::traits::{BackendGateway, MetadataStore};
use noio_core::types::{Document, InnerHit, MetadataRecord, RawHit, Sentence};
use noio_core::vector::cosine_similarity;

use crate::analysis::{analyze, terms};

/// BM25 term-frequency saturation constant.
const BM25_K1: f32 = 1.2;
/// Inner hits returned when the request leaves the size open.
pub const DEFAULT_INNER_HITS_SIZE: usize = 3;

/// On-disk corpus: documents plus pre-computed sentence metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Corpus {
    #[serde(default)]
    pub documents: Vec<Document>,
    #[serde(default)]
    pub metadata: BTreeMap<String, MetadataRecord>,
}

impl Corpus {
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::InvalidConfig(format!("invalid corpus JSON: {e}")))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::InvalidConfig(format!("cannot read corpus {}: {e}", path.display())))?;
        Self::from_json_str(&raw)
    }

    pub fn merge(&mut self, other: Corpus) {
        self.documents.extend(other.documents);
        self.metadata.extend(other.metadata);
    }
}

pub struct MemoryBackend {
    documents: Vec<Document>,
    metadata: Mutex<BTreeMap<String, MetadataRecord>>,
    reads: AtomicUsize,
    write_calls: AtomicUsize,
    failing_writes: AtomicUsize,
}

impl MemoryBackend {
    pub fn new(corpus: Corpus) -> Self {
        Self {
            documents: corpus.documents,
            metadata: Mutex::new(corpus.metadata),
            reads: AtomicUsize::new(0),
            write_calls: AtomicUsize::new(0),
            failing_writes: AtomicUsize::new(0),
        }
    }

    pub fn with_documents(documents: Vec<Document>) -> Self { Self::new(Corpus { documents, metadata: BTreeMap::new() }) }

    pub fn documents(&self) -> &[Document] { &self.documents }

    /// Number of `get_metadata` calls served.
    pub fn reads(&self) -> usize { self.reads.load(Ordering::SeqCst) }

    /// Number of `bulk_upsert_metadata` calls, failed ones included.
    pub fn write_calls(&self) -> usize { self.write_calls.load(Ordering::SeqCst) }

    /// Make the next `n` bulk upserts fail.
    pub fn fail_next_writes(&self, n: usize) { self.failing_writes.store(n, Ordering::SeqCst); }

    pub fn stored_metadata(&self, key: &str) -> Option<MetadataRecord> { self.metadata.lock().get(key).cloned() }

    pub fn stored_len(&self) -> usize { self.metadata.lock().len() }

    fn to_raw_hit(&self, doc: &Document, score: f32, inner_hits: Vec<InnerHit>, sq: &StructuredQuery) -> RawHit {
        let wants = |f: Field| sq.source_fields.contains(&f);
        let highlights = sq.highlight.as_ref().map(|h| highlight(doc, &sq.query, h)).unwrap_or_default();
        RawHit {
            id: doc.doc_id.clone(),
            score,
            sourcename: wants(Field::SourceName).then(|| doc.sourcename.clone()),
            text: wants(Field::Text).then(|| doc.text.clone()),
            highlights,
            inner_hits,
        }
    }
}

impl BackendGateway for MemoryBackend {
    fn execute_query(&self, sq: &StructuredQuery) -> Result<Vec<RawHit>> {
        let mut ev = Evaluator::new(sq);
        let mut scored: Vec<(usize, f32, Vec<InnerHit>)> = match &sq.query {
            Query::Knn(knn) => ev.knn_documents(knn, &self.documents)?,
            Query::Nested(nested) if matches!(nested.query.as_ref(), Query::Knn(_)) => {
                ev.knn_sentences(nested, &self.documents)?
            }
            query => {
                let mut out = Vec::new();
                for (i, doc) in self.documents.iter().enumerate() {
                    ev.inner_hits.clear();
                    if let Some(score) = ev.eval(query, Scope::Doc(doc))? {
                        out.push((i, score, std::mem::take(&mut ev.inner_hits)));
                    }
                }
                out
            }
        };
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(sq.size);
        tracing::debug!(mode = %sq.mode, hits = scored.len(), "memory backend query");
        Ok(scored
            .into_iter()
            .map(|(i, score, inner)| self.to_raw_hit(&self.documents[i], score, inner, sq))
            .collect())
    }
}

impl MetadataStore for MemoryBackend {
    fn get_metadata(&self, key: &str) -> Result<Option<MetadataRecord>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.metadata.lock().get(key).cloned())
    }

    fn bulk_upsert_metadata(&self, records: &BTreeMap<String, MetadataRecord>) -> Result<()> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Error::BackendWrite { keys: records.len(), message: "injected write failure".into() });
        }
        let mut store = self.metadata.lock();
        for (k, v) in records {
            store.insert(k.clone(), v.clone());
        }
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum Scope<'a> {
    Doc(&'a Document),
    Sentence(&'a Document, &'a Sentence),
}

impl<'a> Scope<'a> {
    fn doc(&self) -> &'a Document {
        match self {
            Scope::Doc(d) | Scope::Sentence(d, _) => *d,
        }
    }

    fn text(&self, field: Field) -> Option<&'a str> {
        match (field, self) {
            (Field::Text | Field::TextKeyword, s) => Some(s.doc().text.as_str()),
            (Field::SourceName, s) => Some(s.doc().sourcename.as_str()),
            (Field::SentenceText, Scope::Sentence(_, sent)) => Some(sent.text.as_str()),
            _ => None,
        }
    }

    fn vector(&self, field: Field) -> Option<&'a [f32]> {
        let v = match (field, self) {
            (Field::TextVector, s) => s.doc().text_vector.as_deref(),
            (Field::SentenceVector, Scope::Sentence(_, sent)) => sent.vector.as_deref(),
            _ => None,
        };
        v.filter(|v| !v.is_empty())
    }

    fn ratio(&self) -> Option<f32> { self.doc().hawaiian_word_ratio }

    fn exists(&self, field: Field) -> bool {
        match field {
            Field::HawaiianWordRatio => self.ratio().is_some(),
            Field::TextVector | Field::SentenceVector => self.vector(field).is_some(),
            _ => self.text(field).is_some(),
        }
    }
}

fn saturate(tf: usize) -> f32 {
    let tf = tf as f32;
    tf * (BM25_K1 + 1.0) / (tf + BM25_K1)
}

struct Evaluator<'q> {
    sq: &'q StructuredQuery,
    regexes: HashMap<String, Regex>,
    inner_hits: Vec<InnerHit>,
}

impl<'q> Evaluator<'q> {
    fn new(sq: &'q StructuredQuery) -> Self { Self { sq, regexes: HashMap::new(), inner_hits: Vec::new() } }

    fn query_error(&self, clause: &str, message: impl ToString) -> Error {
        Error::backend_query(self.sq.mode, &self.sq.text, format!("{clause}: {}", message.to_string()))
    }

    fn regex(&mut self, pattern: &str) -> Result<&Regex> {
        if !self.regexes.contains_key(pattern) {
            let re = Regex::new(pattern).map_err(|e| self.query_error(pattern, format!("invalid pattern: {e}")))?;
            self.regexes.insert(pattern.to_string(), re);
        }
        self.regexes.get(pattern).ok_or_else(|| self.query_error(pattern, "regex cache miss"))
    }

    fn eval(&mut self, query: &Query, scope: Scope<'_>) -> Result<Option<f32>> {
        Ok(match query {
            Query::MatchAll => Some(1.0),
            Query::Match { field, text, operator } => scope.text(*field).and_then(|value| match_score(value, text, *operator)),
            Query::Term { field, value } => scope.text(*field).filter(|v| *v == value.as_str()).map(|_| 1.0),
            Query::Phrase { field, text } => scope.text(*field).and_then(|value| phrase_score(value, text)),
            Query::Regexp { field, pattern } => {
                let anchored = format!("(?s)^(?:{pattern})$");
                match scope.text(*field) {
                    Some(value) => self.regex(&anchored)?.is_match(value).then_some(1.0),
                    None => None,
                }
            }
            Query::Wildcard { field, pattern, case_insensitive } => {
                let translated = wildcard_to_regex(pattern, *case_insensitive);
                match scope.text(*field) {
                    Some(value) => self.regex(&translated)?.is_match(value).then_some(1.0),
                    None => None,
                }
            }
            Query::Exists { field } => scope.exists(*field).then_some(1.0),
            Query::NonEmpty { field } => scope.text(*field).filter(|v| !v.is_empty()).map(|_| 1.0),
            Query::Bool(b) => self.eval_bool(b, scope)?,
            Query::RatioPrior(inner) => self.eval(inner, scope)?.map(|s| s * ratio_prior(scope.ratio())),
            Query::VectorScore(vs) => self.eval_vector_score(vs, scope)?,
            Query::Knn(_) => return Err(self.query_error("knn", "knn is only supported at the top level or directly under nested")),
            Query::Nested(nested) => self.eval_nested(nested, scope)?,
        })
    }

    fn eval_bool(&mut self, b: &BoolQuery, scope: Scope<'_>) -> Result<Option<f32>> {
        for f in &b.filter {
            if self.eval(f, scope)?.is_none() { return Ok(None); }
        }
        let mut score = 0.0;
        for m in &b.must {
            match self.eval(m, scope)? {
                Some(s) => score += s,
                None => return Ok(None),
            }
        }
        let mut matched_should = 0;
        for s in &b.should {
            if let Some(v) = self.eval(s, scope)? {
                matched_should += 1;
                score += v;
            }
        }
        let required = b.minimum_should_match.unwrap_or(if b.must.is_empty() && b.filter.is_empty() && !b.should.is_empty() { 1 } else { 0 });
        if matched_should < required { return Ok(None); }
        if b.must.is_empty() && b.should.is_empty() && b.filter.is_empty() { score = 1.0; }
        Ok(Some(score))
    }

    fn eval_vector_score(&mut self, vs: &VectorScore, scope: Scope<'_>) -> Result<Option<f32>> {
        let Some(inner) = self.eval(&vs.query, scope)? else { return Ok(None) };
        let Some(field_vec) = scope.vector(vs.field) else { return Ok(None) };
        let mut score = cosine_similarity(&vs.vector, field_vec) + vs.cosine_offset;
        if let Some(offset) = vs.ratio_offset {
            score *= scope.ratio().unwrap_or(0.0) + offset;
        }
        Ok(Some(match vs.combine {
            ScoreCombine::Replace => score,
            ScoreCombine::Multiply => inner * score,
        }))
    }

    fn eval_nested(&mut self, nested: &NestedQuery, scope: Scope<'_>) -> Result<Option<f32>> {
        let doc = scope.doc();
        let mut matched: Vec<(f32, &Sentence)> = Vec::new();
        for sentence in &doc.sentences {
            if let Some(score) = self.eval(&nested.query, Scope::Sentence(doc, sentence))? {
                matched.push((score, sentence));
            }
        }
        if matched.is_empty() { return Ok(None); }
        let parent = parent_score(nested.score_mode, matched.iter().map(|(s, _)| *s));
        self.inner_hits = select_inner_hits(matched, nested.inner_hits.size, nested.inner_hits.sort);
        Ok(Some(parent))
    }

    /// Top-level k-NN over document vectors. Similarity is `(1 + cos) / 2`.
    fn knn_documents(&mut self, knn: &KnnQuery, docs: &[Document]) -> Result<Vec<(usize, f32, Vec<InnerHit>)>> {
        let mut out = Vec::new();
        for (i, doc) in docs.iter().enumerate() {
            let scope = Scope::Doc(doc);
            if let Some(filter) = &knn.filter {
                if self.eval(filter, scope)?.is_none() { continue; }
            }
            if let Some(v) = scope.vector(knn.field) {
                out.push((i, knn_similarity(&knn.vector, v), Vec::new()));
            }
        }
        out.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        out.truncate(knn.k);
        Ok(out)
    }

    /// Nested k-NN: each parent scores by its nearest sentence; the k best parents are kept.
    fn knn_sentences(&mut self, nested: &NestedQuery, docs: &[Document]) -> Result<Vec<(usize, f32, Vec<InnerHit>)>> {
        let Query::Knn(knn) = nested.query.as_ref() else { return Err(self.query_error("nested", "expected nested knn")) };
        let mut out = Vec::new();
        for (i, doc) in docs.iter().enumerate() {
            let mut matched: Vec<(f32, &Sentence)> = Vec::new();
            for sentence in &doc.sentences {
                let scope = Scope::Sentence(doc, sentence);
                if let Some(filter) = &knn.filter {
                    if self.eval(filter, scope)?.is_none() { continue; }
                }
                if let Some(v) = scope.vector(knn.field) {
                    matched.push((knn_similarity(&knn.vector, v), sentence));
                }
            }
            if matched.is_empty() { continue; }
            let parent = parent_score(nested.score_mode, matched.iter().map(|(s, _)| *s));
            // knn inner hits are always nearest-first
            let inner = select_inner_hits(matched, nested.inner_hits.size, InnerHitSort::ScoreDesc);
            out.push((i, parent, inner));
        }
        out.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        out.truncate(knn.k);
        Ok(out)
    }
}

fn knn_similarity(query: &[f32], v: &[f32]) -> f32 { (1.0 + cosine_similarity(query, v)) / 2.0 }

fn parent_score(mode: ScoreMode, scores: impl Iterator<Item = f32>) -> f32 {
    let scores: Vec<f32> = scores.collect();
    match mode {
        ScoreMode::Max => scores.iter().copied().fold(f32::MIN, f32::max),
        ScoreMode::Avg => scores.iter().sum::<f32>() / scores.len().max(1) as f32,
        ScoreMode::None => 0.0,
    }
}

fn select_inner_hits(mut matched: Vec<(f32, &Sentence)>, size: Option<usize>, sort: InnerHitSort) -> Vec<InnerHit> {
    if sort == InnerHitSort::ScoreDesc {
        matched.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    }
    matched
        .into_iter()
        .take(size.unwrap_or(DEFAULT_INNER_HITS_SIZE))
        .map(|(score, s)| InnerHit { score, text: s.text.clone(), position: Some(s.position), vector: s.vector.clone() })
        .collect()
}

fn match_score(value: &str, query: &str, operator: Operator) -> Option<f32> {
    let mut wanted = terms(query);
    wanted.sort();
    wanted.dedup();
    if wanted.is_empty() { return None; }
    let mut tf: HashMap<String, usize> = HashMap::new();
    for t in terms(value) {
        *tf.entry(t).or_default() += 1;
    }
    let counts: Vec<usize> = wanted.iter().map(|t| tf.get(t).copied().unwrap_or(0)).collect();
    let hit = match operator {
        Operator::Or => counts.iter().any(|&c| c > 0),
        Operator::And => counts.iter().all(|&c| c > 0),
    };
    hit.then(|| counts.into_iter().map(saturate).sum())
}

fn phrase_score(value: &str, phrase: &str) -> Option<f32> {
    let wanted = terms(phrase);
    if wanted.is_empty() { return None; }
    let have = terms(value);
    let occurrences = have.windows(wanted.len()).filter(|w| *w == wanted.as_slice()).count();
    (occurrences > 0).then(|| saturate(occurrences) * wanted.len() as f32)
}

/// Translate a `*`/`?` wildcard into an anchored regex over the whole value.
pub fn wildcard_to_regex(pattern: &str, case_insensitive: bool) -> String {
    let mut re = String::from(if case_insensitive { "(?is)^" } else { "(?s)^" });
    let mut buf = [0u8; 4];
    for c in pattern.chars() {
        match c {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            _ => re.push_str(&regex::escape(c.encode_utf8(&mut buf))),
        }
    }
    re.push('$');
    re
}

/// Terms to highlight: those of `match`/`phrase` clauses on the highlighted field.
fn highlight_terms(query: &Query, field: Field, out: &mut Vec<String>) {
    match query {
        Query::Match { field: f, text, .. } | Query::Phrase { field: f, text } if *f == field => out.extend(terms(text)),
        Query::Bool(b) => {
            for q in b.must.iter().chain(&b.should).chain(&b.filter) {
                highlight_terms(q, field, out);
            }
        }
        Query::RatioPrior(inner) => highlight_terms(inner, field, out),
        Query::VectorScore(vs) => highlight_terms(&vs.query, field, out),
        _ => {}
    }
}

/// Fragments of at most `fragment_size` characters around matched terms, each
/// match wrapped in `<em>`.
fn highlight(doc: &Document, query: &Query, h: &Highlight) -> Vec<String> {
    let mut wanted = Vec::new();
    highlight_terms(query, h.field, &mut wanted);
    if wanted.is_empty() || h.number_of_fragments == 0 { return Vec::new(); }
    let text = match h.field {
        Field::Text | Field::TextKeyword => doc.text.as_str(),
        _ => return Vec::new(),
    };
    let matches: Vec<(usize, usize)> = analyze(text)
        .into_iter()
        .filter(|t| wanted.contains(&t.text))
        .map(|t| (t.offset_from, t.offset_to))
        .collect();
    if matches.is_empty() { return Vec::new(); }

    // char index -> byte offset, with one past the end
    let bounds: Vec<usize> = text.char_indices().map(|(b, _)| b).chain(std::iter::once(text.len())).collect();
    let char_of = |byte: usize| bounds.partition_point(|&b| b < byte);
    let total = bounds.len() - 1;
    let size = h.fragment_size.max(1);

    let mut fragments = Vec::new();
    let mut next = 0;
    while next < matches.len() && fragments.len() < h.number_of_fragments {
        let (from, to) = matches[next];
        let (cf, ct) = (char_of(from), char_of(to));
        let center = (cf + ct) / 2;
        let start = center.saturating_sub(size / 2).min(total.saturating_sub(size));
        let end = (start + size).min(total).max(ct);
        let (bstart, bend) = (bounds[start], bounds[end]);

        let mut frag = String::new();
        let mut cursor = bstart;
        while next < matches.len() && matches[next].1 <= bend {
            let (mf, mt) = matches[next];
            if mf >= cursor {
                frag.push_str(&text[cursor..mf]);
                frag.push_str("<em>");
                frag.push_str(&text[mf..mt]);
                frag.push_str("</em>");
                cursor = mt;
            }
            next += 1;
        }
        frag.push_str(&text[cursor..bend]);
        fragments.push(frag.trim().to_string());
    }
    fragments
}
