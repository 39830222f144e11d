use std::collections::BTreeMap;

use crate::error::Result;
use crate::query::StructuredQuery;
use crate::types::{MetadataRecord, RawHit};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedPurpose {
    Query,
    Passage,
}

pub trait Embedder: Send + Sync {
    fn dim(&self) -> usize;
    /// Embed one text. `purpose` selects the model's query/passage prefix.
    fn embed(&self, text: &str, purpose: EmbedPurpose) -> Result<Vec<f32>>;
}

pub trait BackendGateway: Send + Sync {
    fn execute_query(&self, query: &StructuredQuery) -> Result<Vec<RawHit>>;
}

pub trait MetadataStore: Send + Sync {
    fn get_metadata(&self, key: &str) -> Result<Option<MetadataRecord>>;
    /// Idempotent upsert of every record; any failed item fails the call.
    fn bulk_upsert_metadata(&self, records: &BTreeMap<String, MetadataRecord>) -> Result<()>;
}

/// Read access to sentence metadata, as used by the reranker.
pub trait MetadataLookup {
    fn lookup(&mut self, key: &str) -> Result<MetadataRecord>;
}
