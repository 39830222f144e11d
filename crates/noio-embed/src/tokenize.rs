use anyhow::{anyhow, Result};
use candle_core::{Device, Tensor};
use tokenizers::Tokenizer;

/// Encode one text as `[1, T]` tensors `(input_ids, token_type_ids, attention_mask)`.
/// Sequences longer than `max_len` are truncated; no padding is added for a single input.
pub fn tokenize_on_device(tokenizer: &Tokenizer, text: &str, max_len: usize, device: &Device) -> Result<(Tensor, Tensor, Tensor)> {
    let enc = tokenizer.encode(text, true).map_err(|e| anyhow!("Tokenization failed: {}", e))?;
    let mut ids = enc.get_ids().to_vec();
    let mut mask = enc.get_attention_mask().to_vec();
    if ids.len() > max_len { ids.truncate(max_len); mask.truncate(max_len); }
    let len = ids.len();
    if len == 0 { return Err(anyhow!("Tokenizer produced no tokens")); }
    let input_ids = Tensor::from_iter(ids, device)?.reshape((1, len))?;
    let token_type_ids = input_ids.zeros_like()?;
    let attention_mask = Tensor::from_iter(mask, device)?.reshape((1, len))?;
    Ok((input_ids, token_type_ids, attention_mask))
}
