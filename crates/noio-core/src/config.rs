//! Configuration loader and path helpers.
//!
//! Uses Figment to merge `config.toml` + `config.<env>.toml` + `NOIO_*` env
//! vars (`__` separates nested keys, e.g. `NOIO_CACHE__MAX_SIZE`). Typed
//! settings are extracted with [`Config::settings`] and validated before use.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

pub struct Config {
    figment: Figment,
    env_name: String,
}

impl Config {
    pub fn load() -> Result<Self> {
        let env_name = env::var("RUST_ENV").unwrap_or_else(|_| "dev".to_string());

        let mut figment = Figment::from(Serialized::defaults(Settings::default())).merge(Toml::file("config.toml"));
        match env_name.as_str() {
            "dev" | "development" => figment = figment.merge(Toml::file("config.dev.toml")),
            "prod" | "production" => figment = figment.merge(Toml::file("config.prod.toml")),
            "test" | "testing" => figment = figment.merge(Toml::file("config.test.toml")),
            _ => {}
        }
        figment = figment.merge(Env::prefixed("NOIO_").split("__"));

        let config = Self { figment, env_name };
        config.validate_for_env()?;
        Ok(config)
    }

    /// Build from an explicit figment layered over the defaults.
    pub fn from_figment(env_name: &str, figment: Figment) -> Result<Self> {
        let figment = Figment::from(Serialized::defaults(Settings::default())).merge(figment);
        let config = Self { figment, env_name: env_name.to_string() };
        config.validate_for_env()?;
        Ok(config)
    }

    pub fn env_name(&self) -> &str { &self.env_name }

    pub fn get<T>(&self, key: &str) -> Result<T>
    where
        T: serde::de::DeserializeOwned,
    {
        self.figment
            .extract_inner(key)
            .map_err(|e| Error::InvalidConfig(format!("Failed to get '{}': {}", key, e)))
    }

    pub fn settings(&self) -> Result<Settings> {
        let settings: Settings = self
            .figment
            .extract()
            .map_err(|e| Error::InvalidConfig(format!("Failed to extract settings: {}", e)))?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate_for_env(&self) -> Result<()> {
        let settings = self.settings()?;
        match self.env_name.as_str() {
            "prod" | "production" => {
                if settings.backend.kind != BackendKind::Elasticsearch {
                    return Err(Error::InvalidConfig("prod requires backend.kind = \"elasticsearch\"".into()));
                }
                if settings.embed.use_fake {
                    return Err(Error::InvalidConfig("prod must not use the fake embedder".into()));
                }
            }
            "dev" | "development" | "test" | "testing" => {}
            _ => {}
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub cache: CacheSettings,
    pub search: SearchSettings,
    pub embed: EmbedSettings,
    pub backend: BackendSettings,
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        self.cache.validate()?;
        self.search.validate()?;
        self.embed.validate()?;
        self.backend.validate()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub max_size: usize,
    pub flush_interval_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self { Self { max_size: 10_000, flush_interval_secs: 60 } }
}

impl CacheSettings {
    fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(Error::InvalidConfig("cache.max_size must be at least 1".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchSettings {
    pub max_results: usize,
    pub snippet_size: usize,
    pub num_fragments: usize,
    pub similarity_threshold: f32,
    pub candidate_multiplier: usize,
    pub quality_weight: f32,
    pub expand_sentence_hits: bool,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            max_results: 10,
            snippet_size: 150,
            num_fragments: 3,
            similarity_threshold: 0.80,
            candidate_multiplier: 10,
            quality_weight: 0.3,
            expand_sentence_hits: true,
        }
    }
}

impl SearchSettings {
    fn validate(&self) -> Result<()> {
        if self.max_results == 0 {
            return Err(Error::InvalidConfig("search.max_results must be at least 1".into()));
        }
        if self.snippet_size == 0 {
            return Err(Error::InvalidConfig("search.snippet_size must be at least 1".into()));
        }
        if self.candidate_multiplier == 0 {
            return Err(Error::InvalidConfig("search.candidate_multiplier must be at least 1".into()));
        }
        if !(-1.0..=1.0).contains(&self.similarity_threshold) {
            return Err(Error::InvalidConfig(format!(
                "search.similarity_threshold must be within [-1, 1], got {}",
                self.similarity_threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.quality_weight) {
            return Err(Error::InvalidConfig(format!(
                "search.quality_weight must be within [0, 1], got {}",
                self.quality_weight
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbedSettings {
    pub model_dir: Option<String>,
    pub dim: usize,
    pub max_len: usize,
    pub query_prefix: String,
    pub passage_prefix: String,
    pub use_fake: bool,
}

impl Default for EmbedSettings {
    fn default() -> Self {
        Self {
            model_dir: None,
            dim: 384,
            max_len: 512,
            query_prefix: "query: ".to_string(),
            passage_prefix: "passage: ".to_string(),
            use_fake: false,
        }
    }
}

impl EmbedSettings {
    fn validate(&self) -> Result<()> {
        if self.dim == 0 || self.max_len == 0 {
            return Err(Error::InvalidConfig("embed.dim and embed.max_len must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Memory,
    Elasticsearch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendSettings {
    pub kind: BackendKind,
    pub corpus_path: Option<String>,
    pub url: String,
    pub index: String,
    pub metadata_index: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
    pub accept_invalid_certs: bool,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            kind: BackendKind::Memory,
            corpus_path: None,
            url: "https://localhost:9200".to_string(),
            index: "hawaiian".to_string(),
            metadata_index: "hawaiian-metadata".to_string(),
            api_key: None,
            timeout_secs: 120,
            accept_invalid_certs: false,
        }
    }
}

impl BackendSettings {
    fn validate(&self) -> Result<()> {
        if self.kind == BackendKind::Elasticsearch {
            if !(self.url.starts_with("http://") || self.url.starts_with("https://")) {
                return Err(Error::InvalidConfig(format!("backend.url must be an http(s) URL, got {:?}", self.url)));
            }
            if self.index.is_empty() || self.metadata_index.is_empty() {
                return Err(Error::InvalidConfig("backend.index and backend.metadata_index must be set".into()));
            }
        }
        if self.timeout_secs == 0 {
            return Err(Error::InvalidConfig("backend.timeout_secs must be positive".into()));
        }
        Ok(())
    }
}

/// Expand a user-provided path string:
/// - Expands leading '~' to the user's home directory
/// - Expands ${VAR} and $VAR environment variables
/// - Returns a PathBuf without attempting to canonicalize
pub fn expand_path<S: AsRef<str>>(input: S) -> PathBuf {
    let s = input.as_ref();
    // Expand env vars first
    let expanded_env = shellexpand::env(s).unwrap_or(std::borrow::Cow::Borrowed(s));
    let expanded = shellexpand::tilde(&expanded_env);
    PathBuf::from(expanded.as_ref())
}

/// Resolve a possibly relative path against a given base directory after expansion.
pub fn resolve_with_base<S: AsRef<str>>(base: &Path, p: S) -> PathBuf {
    let p = expand_path(p);
    if p.is_absolute() { p } else { base.join(p) }
}
