//! noio-search
//!
//! Search orchestration over a [`noio_core::traits::BackendGateway`]: query
//! building per mode, snippet extraction, result metrics, and the
//! quality-weighted reranker for sentence-level modes.

pub mod metrics;
pub mod orchestrator;
pub mod rerank;
pub mod snippets;

pub use orchestrator::{SearchOrchestrator, SearchRequest};
pub use rerank::{rerank, Reranker};
