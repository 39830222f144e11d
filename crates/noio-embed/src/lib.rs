use anyhow::{anyhow, Context};
use std::path::{Path, PathBuf};
use std::time::Instant;

use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use candle_transformers::models::bert::{BertModel, Config as BertConfig};
use tokenizers::Tokenizer;

use noio_core::config::{expand_path, EmbedSettings};
use noio_core::traits::{EmbedPurpose, Embedder};
use noio_core::{Error, Result};

mod device;
mod pool;
mod tokenize;

pub use device::select_device;
pub use pool::masked_mean_l2;
pub use tokenize::tokenize_on_device;

const DEFAULT_MODEL_DIRS: [&str; 2] = ["models/multilingual-e5-small", "../models/multilingual-e5-small"];

/// BERT-family sentence embedder (E5 conventions: prefixed inputs, mean pooling, L2 norm).
pub struct E5Embedder {
    model: BertModel,
    tokenizer: Tokenizer,
    device: Device,
    dim: usize,
    max_len: usize,
    query_prefix: String,
    passage_prefix: String,
}

impl E5Embedder {
    pub fn new(settings: &EmbedSettings) -> anyhow::Result<Self> {
        let device = select_device();
        let model_dir = resolve_model_dir(settings.model_dir.as_deref())?;
        tracing::info!(model_dir = %model_dir.display(), "loading embedding model");

        let tokenizer_path = model_dir.join("tokenizer.json");
        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow!("Failed to load tokenizer from {}: {}", tokenizer_path.display(), e))?;

        let config_path = model_dir.join("config.json");
        let config: BertConfig = serde_json::from_str(
            &std::fs::read_to_string(&config_path).with_context(|| format!("reading {}", config_path.display()))?,
        )?;

        let vb = load_weights(&model_dir, &device)?;
        let model = BertModel::load(vb, &config)?;
        tracing::info!(dim = settings.dim, max_len = settings.max_len, "embedding model loaded");

        Ok(Self {
            model,
            tokenizer,
            device,
            dim: settings.dim,
            max_len: settings.max_len,
            query_prefix: settings.query_prefix.clone(),
            passage_prefix: settings.passage_prefix.clone(),
        })
    }

    fn embed_raw(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        let start = Instant::now();
        let (input_ids, token_type_ids, attention_mask) = tokenize_on_device(&self.tokenizer, text, self.max_len, &self.device)?;
        let hidden = self.model.forward(&input_ids, &token_type_ids, Some(&attention_mask))?;
        let pooled = masked_mean_l2(&hidden, &attention_mask)?;
        let emb: Vec<f32> = pooled.to_device(&Device::Cpu)?.squeeze(0)?.to_dtype(DType::F32)?.to_vec1()?;
        if emb.len() != self.dim {
            return Err(anyhow!("model produced dim {} but embed.dim is {}", emb.len(), self.dim));
        }
        let elapsed = start.elapsed().as_millis();
        if elapsed > 100 { tracing::debug!(elapsed_ms = elapsed as u64, "slow embedding"); }
        Ok(emb)
    }
}

impl Embedder for E5Embedder {
    fn dim(&self) -> usize { self.dim }

    fn embed(&self, text: &str, purpose: EmbedPurpose) -> Result<Vec<f32>> {
        let prefix = match purpose {
            EmbedPurpose::Query => &self.query_prefix,
            EmbedPurpose::Passage => &self.passage_prefix,
        };
        self.embed_raw(&format!("{prefix}{text}")).map_err(|e| Error::embedding(text, e))
    }
}

/// Deterministic bag-of-tokens embedder. Tokens are lowercased and hashed into
/// buckets, so texts sharing words have positive cosine similarity.
pub struct HashEmbedder { dim: usize }

impl HashEmbedder {
    pub fn new(dim: usize) -> Self { Self { dim: dim.max(1) } }
}

impl Embedder for HashEmbedder {
    fn dim(&self) -> usize { self.dim }

    fn embed(&self, text: &str, _purpose: EmbedPurpose) -> Result<Vec<f32>> {
        use std::hash::{Hash, Hasher};
        use twox_hash::XxHash64;
        let mut v = vec![0f32; self.dim];
        for token in text.split_whitespace() {
            let token = token.to_lowercase();
            let mut hasher = XxHash64::with_seed(0);
            token.hash(&mut hasher);
            let h = hasher.finish();
            let idx = (h as usize) % self.dim;
            let val = 0.5 + (((h >> 32) as u32) as f32) / (u32::MAX as f32);
            v[idx] += val;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 { for x in &mut v { *x /= norm; } }
        Ok(v)
    }
}

pub fn get_default_embedder(settings: &EmbedSettings) -> anyhow::Result<Box<dyn Embedder>> {
    if settings.use_fake {
        tracing::info!(dim = settings.dim, "using hashing embedder");
        return Ok(Box::new(HashEmbedder::new(settings.dim)));
    }
    Ok(Box::new(E5Embedder::new(settings)?))
}

fn load_weights(model_dir: &Path, device: &Device) -> anyhow::Result<VarBuilder<'static>> {
    let safetensors = model_dir.join("model.safetensors");
    if safetensors.exists() {
        // SAFETY: the weights file is not modified while mapped.
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[safetensors], DType::F32, device)? };
        return Ok(vb);
    }
    let weights_path = model_dir.join("pytorch_model.bin");
    let weights = candle_core::pickle::read_all(&weights_path).with_context(|| format!("reading {}", weights_path.display()))?;
    let weights_map: std::collections::HashMap<String, candle_core::Tensor> = weights.into_iter().collect();
    Ok(VarBuilder::from_tensors(weights_map, DType::F32, device))
}

fn resolve_model_dir(configured: Option<&str>) -> anyhow::Result<PathBuf> {
    if let Some(dir) = configured {
        let p = expand_path(dir);
        if p.exists() { return Ok(p); }
        return Err(anyhow!("embed.model_dir {} does not exist", p.display()));
    }
    DEFAULT_MODEL_DIRS
        .iter()
        .map(Path::new)
        .find(|p| p.exists())
        .map(Path::to_path_buf)
        .ok_or_else(|| anyhow!("Could not locate an embedding model directory; set embed.model_dir"))
}
