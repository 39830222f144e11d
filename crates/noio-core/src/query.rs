//! Backend-neutral structured query.
//!
//! The builder produces this tree; each backend either evaluates it directly
//! (the in-memory backend) or renders it to its native query language.

use serde::{Deserialize, Serialize};

use crate::mode::SearchMode;

/// Nested path holding sentence sub-documents.
pub const SENTENCES_PATH: &str = "sentences";
/// Name under which backends report nested matches.
pub const INNER_HITS_NAME: &str = "matched_sentences";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Field {
    /// Analyzed document text.
    Text,
    /// Exact, unanalyzed document text.
    TextKeyword,
    /// Analyzed nested sentence text.
    SentenceText,
    HawaiianWordRatio,
    TextVector,
    SentenceVector,
    SourceName,
}

impl Field {
    pub fn path(&self) -> &'static str {
        match self {
            Field::Text => "text",
            Field::TextKeyword => "text.keyword",
            Field::SentenceText => "sentences.text",
            Field::HawaiianWordRatio => "hawaiian_word_ratio",
            Field::TextVector => "text_vector",
            Field::SentenceVector => "sentences.vector",
            Field::SourceName => "sourcename",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    Or,
    And,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScoreMode {
    Avg,
    Max,
    None,
}

/// How a vector score combines with the score of the clause it wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScoreCombine {
    /// The vector score replaces the inner score (filter-then-score).
    Replace,
    /// The vector score multiplies the inner score.
    Multiply,
}

/// `(cosine(query, field) + cosine_offset) * (ratio + ratio_offset)`; the
/// ratio factor is omitted when `ratio_offset` is `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorScore {
    pub query: Box<Query>,
    pub field: Field,
    pub vector: Vec<f32>,
    pub cosine_offset: f32,
    pub ratio_offset: Option<f32>,
    pub combine: ScoreCombine,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnnQuery {
    pub field: Field,
    pub vector: Vec<f32>,
    pub k: usize,
    pub num_candidates: usize,
    pub filter: Option<Box<Query>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InnerHitSort {
    /// Whatever order the backend uses by default.
    Default,
    ScoreDesc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InnerHits {
    pub name: String,
    /// `None` leaves the size to the backend default.
    pub size: Option<usize>,
    pub sort: InnerHitSort,
}

impl InnerHits {
    pub fn matched_sentences(size: Option<usize>, sort: InnerHitSort) -> Self {
        Self { name: INNER_HITS_NAME.to_string(), size, sort }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NestedQuery {
    pub path: String,
    pub query: Box<Query>,
    pub score_mode: ScoreMode,
    pub inner_hits: InnerHits,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BoolQuery {
    pub must: Vec<Query>,
    pub should: Vec<Query>,
    pub filter: Vec<Query>,
    pub minimum_should_match: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Query {
    MatchAll,
    Match { field: Field, text: String, operator: Operator },
    Term { field: Field, value: String },
    Phrase { field: Field, text: String },
    Regexp { field: Field, pattern: String },
    Wildcard { field: Field, pattern: String, case_insensitive: bool },
    Exists { field: Field },
    /// Field present and not the empty string.
    NonEmpty { field: Field },
    Bool(BoolQuery),
    /// Multiplies the inner score by `ln(1 + ratio) + 1`; missing ratio is neutral.
    RatioPrior(Box<Query>),
    VectorScore(VectorScore),
    Knn(KnnQuery),
    Nested(NestedQuery),
}

/// Score multiplier applied by [`Query::RatioPrior`]: `ln(1 + r) + 1`, or a
/// neutral 1 when the document has no ratio.
pub fn ratio_prior(ratio: Option<f32>) -> f32 {
    match ratio {
        Some(r) if r.is_finite() && r > -1.0 => r.ln_1p() + 1.0,
        _ => 1.0,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Highlight {
    pub field: Field,
    pub fragment_size: usize,
    pub number_of_fragments: usize,
}

/// A query ready for a backend: the clause tree plus request options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredQuery {
    pub mode: SearchMode,
    /// The free-text query this was built from.
    pub text: String,
    pub query: Query,
    pub size: usize,
    pub highlight: Option<Highlight>,
    pub source_fields: Vec<Field>,
    /// The embedded query text, when the mode needed one.
    #[serde(skip)]
    pub query_vector: Option<Vec<f32>>,
}

impl StructuredQuery {
    pub fn new(mode: SearchMode, text: &str, query: Query) -> Self {
        Self {
            mode,
            text: text.to_string(),
            query,
            size: 10,
            highlight: None,
            source_fields: vec![Field::SourceName],
            query_vector: None,
        }
    }

    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    pub fn with_highlight(mut self, highlight: Highlight) -> Self {
        self.highlight = Some(highlight);
        self
    }

    pub fn with_source_fields(mut self, fields: Vec<Field>) -> Self {
        self.source_fields = fields;
        self
    }

    pub fn with_query_vector(mut self, vector: Vec<f32>) -> Self {
        self.query_vector = Some(vector);
        self
    }

    /// The inner-hits request of a top-level nested query, if any.
    pub fn inner_hits(&self) -> Option<&InnerHits> {
        match &self.query {
            Query::Nested(nested) => Some(&nested.inner_hits),
            _ => None,
        }
    }
}
