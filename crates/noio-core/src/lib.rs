//! noio-core
//!
//! Shared vocabulary of the retrieval engine: documents and hits, the error
//! taxonomy, search modes, the structured query tree, content fingerprints,
//! configuration, and the traits backends and embedders implement.

pub mod config;
pub mod error;
pub mod fingerprint;
pub mod mode;
pub mod query;
pub mod traits;
pub mod types;
pub mod vector;

pub use error::{Error, Result};
pub use mode::{ModeSelection, SearchMode};
