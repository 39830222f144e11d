use anyhow::{ensure, Result};
use candle_core::{DType, Tensor};

/// Smallest norm a pooled row is divided by.
fn norm_floor(dtype: DType) -> f64 {
    match dtype {
        DType::F16 | DType::BF16 => 1e-6,
        _ => 1e-12,
    }
}

/// Sentence embedding from token states: the mean of the tokens whose
/// attention mask is set, scaled to unit length.
/// `hidden` is `[batch, tokens, dim]`; the result is `[batch, dim]`.
pub fn masked_mean_l2(hidden: &Tensor, attention_mask: &Tensor) -> Result<Tensor> {
    let (batch, _tokens, dim) = hidden.dims3()?;
    let weights = attention_mask.to_device(hidden.device())?.to_dtype(hidden.dtype())?.unsqueeze(2)?;

    let summed = hidden.broadcast_mul(&weights)?.sum(1)?;
    // an all-zero mask yields a zero row instead of NaN
    let counts = weights.sum(1)?.clamp(1.0, f64::MAX)?;
    let mean = summed.broadcast_div(&counts)?;

    let norms = mean.sqr()?.sum_keepdim(1)?.sqrt()?.clamp(norm_floor(hidden.dtype()), f64::MAX)?;
    let pooled = mean.broadcast_div(&norms)?;
    ensure!(pooled.dims() == [batch, dim], "pooled shape {:?}, expected [{batch}, {dim}]", pooled.dims());
    Ok(pooled)
}
