//! noio-query
//!
//! Turns `(mode, query text, params)` into a backend-neutral [`StructuredQuery`].
//! Lexical modes are wrapped in the Hawaiian-word-ratio prior; vector modes
//! embed the query text once and carry the vector on the returned query.

use std::sync::Arc;

use noio_core::query::{
    BoolQuery, Field, InnerHitSort, InnerHits, KnnQuery, NestedQuery, Operator, Query, ScoreCombine, ScoreMode,
    StructuredQuery, VectorScore, SENTENCES_PATH,
};
use noio_core::traits::{EmbedPurpose, Embedder};
use noio_core::{Error, Result, SearchMode};

/// Added to cosine similarity so vector scores stay non-negative.
pub const COSINE_OFFSET: f32 = 1.0;
/// Added to the Hawaiian-word ratio in document-level vector scoring.
pub const RATIO_OFFSET: f32 = 0.1;
pub const DEFAULT_KNN_K: usize = 10;
pub const DEFAULT_SENTENCE_K: usize = 100;
/// `num_candidates = k * SENTENCE_OVERSAMPLING` for sentence-level ANN.
pub const SENTENCE_OVERSAMPLING: usize = 2;
pub const DEFAULT_CANDIDATE_MULTIPLIER: usize = 10;
pub const HYBRID_SENTENCE_INNER_HITS: usize = 5;
pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.80;

/// Per-query knobs. `None` picks the mode's default.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueryParams {
    pub k: Option<usize>,
    pub candidate_multiplier: Option<usize>,
    pub similarity_threshold: f32,
}

impl Default for QueryParams {
    fn default() -> Self { Self { k: None, candidate_multiplier: None, similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD } }
}

impl QueryParams {
    pub fn validate(&self) -> Result<()> {
        if self.k == Some(0) {
            return Err(Error::InvalidConfig("k must be at least 1".into()));
        }
        if self.candidate_multiplier == Some(0) {
            return Err(Error::InvalidConfig("candidate_multiplier must be at least 1".into()));
        }
        if !(-1.0..=1.0).contains(&self.similarity_threshold) {
            return Err(Error::InvalidConfig(format!(
                "similarity_threshold must be within [-1, 1], got {}",
                self.similarity_threshold
            )));
        }
        Ok(())
    }

    fn knn_k(&self) -> usize { self.k.unwrap_or(DEFAULT_KNN_K) }

    fn sentence_k(&self) -> usize { self.k.unwrap_or(DEFAULT_SENTENCE_K) }

    fn multiplier(&self) -> usize { self.candidate_multiplier.unwrap_or(DEFAULT_CANDIDATE_MULTIPLIER) }
}

pub struct QueryBuilder {
    embedder: Arc<dyn Embedder>,
}

impl QueryBuilder {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self { Self { embedder } }

    /// Like [`QueryBuilder::build`], but takes a mode name; unknown names build a `match` query.
    pub fn build_named(&self, mode: &str, text: &str, params: &QueryParams) -> Result<StructuredQuery> {
        self.build(SearchMode::parse_or_default(mode), text, params)
    }

    pub fn build(&self, mode: SearchMode, text: &str, params: &QueryParams) -> Result<StructuredQuery> {
        params.validate()?;
        let query = match mode {
            SearchMode::Match => lexical(mode, text, Query::Match { field: Field::Text, text: text.to_string(), operator: Operator::Or }),
            SearchMode::Term => lexical(mode, text, Query::Term { field: Field::TextKeyword, value: text.to_string() }),
            SearchMode::Phrase => lexical(mode, text, Query::Phrase { field: Field::Text, text: text.to_string() }),
            SearchMode::Regexp => lexical(mode, text, Query::Regexp { field: Field::TextKeyword, pattern: text.to_string() }),
            SearchMode::Wildcard => lexical(
                mode,
                text,
                Query::Wildcard { field: Field::Text, pattern: text.to_string(), case_insensitive: true },
            ),
            SearchMode::Vector => self.vector(text)?,
            SearchMode::Hybrid => self.hybrid(text)?,
            SearchMode::Knn => self.knn(text, params)?,
            SearchMode::VectorSentence => self.vector_sentence(text, params)?,
            SearchMode::HybridSentence => self.hybrid_sentence(text)?,
            SearchMode::MatchSentenceAll => match_sentence_all(text),
        };
        tracing::debug!(mode = %mode, query = %text, "built structured query");
        Ok(query)
    }

    fn embed_query(&self, text: &str) -> Result<Vec<f32>> { self.embedder.embed(text, EmbedPurpose::Query) }

    fn vector(&self, text: &str) -> Result<StructuredQuery> {
        let vector = self.embed_query(text)?;
        let filter = BoolQuery {
            filter: vec![Query::Exists { field: Field::TextVector }, Query::Exists { field: Field::HawaiianWordRatio }],
            ..BoolQuery::default()
        };
        let query = document_vector_score(Query::Bool(filter), vector.clone());
        Ok(with_text(StructuredQuery::new(SearchMode::Vector, text, query)).with_query_vector(vector))
    }

    fn hybrid(&self, text: &str) -> Result<StructuredQuery> {
        let vector = self.embed_query(text)?;
        let candidates = BoolQuery {
            should: vec![
                Query::Match { field: Field::Text, text: text.to_string(), operator: Operator::Or },
                Query::Wildcard { field: Field::Text, pattern: format!("*{text}*"), case_insensitive: true },
            ],
            filter: vec![
                Query::Exists { field: Field::Text },
                Query::Exists { field: Field::TextVector },
                Query::Exists { field: Field::HawaiianWordRatio },
                Query::NonEmpty { field: Field::TextKeyword },
            ],
            minimum_should_match: Some(1),
            ..BoolQuery::default()
        };
        let query = document_vector_score(Query::Bool(candidates), vector.clone());
        Ok(with_text(StructuredQuery::new(SearchMode::Hybrid, text, query)).with_query_vector(vector))
    }

    fn knn(&self, text: &str, params: &QueryParams) -> Result<StructuredQuery> {
        let vector = self.embed_query(text)?;
        let k = params.knn_k();
        let filter = BoolQuery { filter: vec![Query::NonEmpty { field: Field::Text }], ..BoolQuery::default() };
        let query = Query::Knn(KnnQuery {
            field: Field::TextVector,
            vector: vector.clone(),
            k,
            num_candidates: k.saturating_mul(params.multiplier()),
            filter: Some(Box::new(Query::Bool(filter))),
        });
        Ok(with_text(StructuredQuery::new(SearchMode::Knn, text, query)).with_query_vector(vector))
    }

    fn vector_sentence(&self, text: &str, params: &QueryParams) -> Result<StructuredQuery> {
        let vector = self.embed_query(text)?;
        let k = params.sentence_k();
        let knn = Query::Knn(KnnQuery {
            field: Field::SentenceVector,
            vector: vector.clone(),
            k,
            num_candidates: k.saturating_mul(SENTENCE_OVERSAMPLING),
            filter: None,
        });
        let query = Query::Nested(NestedQuery {
            path: SENTENCES_PATH.to_string(),
            query: Box::new(knn),
            score_mode: ScoreMode::Max,
            inner_hits: InnerHits::matched_sentences(Some(k), InnerHitSort::Default),
        });
        Ok(StructuredQuery::new(SearchMode::VectorSentence, text, query).with_query_vector(vector))
    }

    fn hybrid_sentence(&self, text: &str) -> Result<StructuredQuery> {
        let vector = self.embed_query(text)?;
        let scored = Query::VectorScore(VectorScore {
            query: Box::new(Query::Match { field: Field::SentenceText, text: text.to_string(), operator: Operator::And }),
            field: Field::SentenceVector,
            vector: vector.clone(),
            cosine_offset: COSINE_OFFSET,
            ratio_offset: None,
            combine: ScoreCombine::Multiply,
        });
        let query = Query::Nested(NestedQuery {
            path: SENTENCES_PATH.to_string(),
            query: Box::new(scored),
            score_mode: ScoreMode::Max,
            inner_hits: InnerHits::matched_sentences(Some(HYBRID_SENTENCE_INNER_HITS), InnerHitSort::ScoreDesc),
        });
        Ok(with_text(StructuredQuery::new(SearchMode::HybridSentence, text, query)).with_query_vector(vector))
    }
}

fn lexical(mode: SearchMode, text: &str, base: Query) -> StructuredQuery {
    with_text(StructuredQuery::new(mode, text, Query::RatioPrior(Box::new(base))))
}

fn match_sentence_all(text: &str) -> StructuredQuery {
    let query = Query::Nested(NestedQuery {
        path: SENTENCES_PATH.to_string(),
        query: Box::new(Query::Match { field: Field::SentenceText, text: text.to_string(), operator: Operator::And }),
        score_mode: ScoreMode::Avg,
        inner_hits: InnerHits::matched_sentences(None, InnerHitSort::Default),
    });
    with_text(StructuredQuery::new(SearchMode::MatchSentenceAll, text, query))
}

/// `(cosine(q, text_vector) + 1.0) * (ratio + 0.1)` over the filtered candidates.
fn document_vector_score(candidates: Query, vector: Vec<f32>) -> Query {
    Query::VectorScore(VectorScore {
        query: Box::new(candidates),
        field: Field::TextVector,
        vector,
        cosine_offset: COSINE_OFFSET,
        ratio_offset: Some(RATIO_OFFSET),
        combine: ScoreCombine::Replace,
    })
}

fn with_text(query: StructuredQuery) -> StructuredQuery {
    query.with_source_fields(vec![Field::SourceName, Field::Text])
}
