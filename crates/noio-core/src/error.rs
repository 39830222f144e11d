use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Embedding failed for {text:?}: {message}")]
    Embedding { text: String, message: String },

    #[error("Backend query failed (mode {mode}, query {query:?}): {message}")]
    BackendQuery { mode: String, query: String, message: String },

    #[error("Metadata read failed for key {key}: {message}")]
    BackendRead { key: String, message: String },

    #[error("Metadata write failed for {keys} key(s): {message}")]
    BackendWrite { keys: usize, message: String },
}

impl Error {
    pub fn embedding(text: &str, message: impl ToString) -> Self {
        Self::Embedding { text: text.to_string(), message: message.to_string() }
    }

    pub fn backend_query(mode: impl ToString, query: &str, message: impl ToString) -> Self {
        Self::BackendQuery { mode: mode.to_string(), query: query.to_string(), message: message.to_string() }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
