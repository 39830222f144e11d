//! noio-backend
//!
//! Backend gateways: an in-memory store that evaluates structured queries
//! itself, and an Elasticsearch client that renders them to the query DSL.

use std::sync::Arc;

use noio_core::config::{BackendKind, BackendSettings};
use noio_core::traits::{BackendGateway, MetadataStore};
use noio_core::Result;

pub mod analysis;
pub mod elastic;
pub mod memory;

pub use elastic::ElasticsearchGateway;
pub use memory::{Corpus, MemoryBackend};

/// One backend seen through both of its roles.
#[derive(Clone)]
pub struct Connection {
    pub gateway: Arc<dyn BackendGateway>,
    pub store: Arc<dyn MetadataStore>,
}

impl Connection {
    pub fn memory(backend: MemoryBackend) -> Self {
        let backend = Arc::new(backend);
        Self { gateway: backend.clone(), store: backend }
    }

    pub fn elasticsearch(gateway: ElasticsearchGateway) -> Self {
        let gateway = Arc::new(gateway);
        Self { gateway: gateway.clone(), store: gateway }
    }
}

/// Open the configured backend. `corpus` feeds the memory backend and is
/// ignored for Elasticsearch.
pub fn connect(settings: &BackendSettings, corpus: Corpus) -> Result<Connection> {
    match settings.kind {
        BackendKind::Memory => {
            tracing::info!(documents = corpus.documents.len(), "using in-memory backend");
            Ok(Connection::memory(MemoryBackend::new(corpus)))
        }
        BackendKind::Elasticsearch => {
            tracing::info!(url = %settings.url, index = %settings.index, "using elasticsearch backend");
            Ok(Connection::elasticsearch(ElasticsearchGateway::new(settings)?))
        }
    }
}
