//! Attention mask utilities for padded batches
//!
//! Causal masks are cached by `(seq_len, device_type, dtype)`; padding masks
//! are built per batch from the tokenizer attention mask.

use std::collections::HashMap;
use std::sync::{LazyLock, Mutex, PoisonError};

use candle_core::{DType, Device, Tensor};

use crate::error::Result;

/// Additive score for padded keys. Finite so that a row with no visible key
/// still softmaxes to numbers instead of NaN, and small enough for F16.
pub const PADDING_MASK_VALUE: f32 = -1e4;

type CausalMaskCache = LazyLock<Mutex<HashMap<(usize, usize, DType), Tensor>>>;

static CAUSAL_MASK_CACHE: CausalMaskCache = LazyLock::new(|| Mutex::new(HashMap::new()));

fn device_id(device: &Device) -> usize {
    match device {
        Device::Cpu => 0,
        Device::Cuda(_) => 1,
        Device::Metal(_) => 2,
    }
}

/// Create or retrieve a cached causal mask
///
/// Masks are cached by `(seq_len, device_type, dtype)` so each forward pass
/// of a batch reuses the same tensor.
///
/// # Returns
///
/// A tensor of shape `[1, 1, seq_len, seq_len]` where:
/// - `0.0` for positions that can attend (j <= i)
/// - `-inf` for positions that cannot attend (j > i)
///
/// # Example
///
/// For seq_len=3:
/// ```text
/// [[[[0, -inf, -inf],
///    [0,    0, -inf],
///    [0,    0,    0]]]]
/// ```
pub fn create_causal_mask(seq_len: usize, device: &Device, dtype: DType) -> Result<Tensor> {
    let cache_key = (seq_len, device_id(device), dtype);

    {
        let cache = CAUSAL_MASK_CACHE
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(cached) = cache.get(&cache_key) {
            return Ok(cached.clone());
        }
    }

    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| (0..seq_len).map(move |j| if j <= i { 0.0 } else { f32::NEG_INFINITY }))
        .collect();
    let mask_tensor = Tensor::from_vec(mask, (1, 1, seq_len, seq_len), device)?.to_dtype(dtype)?;

    CAUSAL_MASK_CACHE
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(cache_key, mask_tensor.clone());

    Ok(mask_tensor)
}

/// Build the additive key-padding mask
///
/// `attention_mask` is `[batch, seq_len]` with 1 for real tokens and 0 for
/// padding.
///
/// # Returns
///
/// A tensor of shape `[batch, 1, 1, seq_len]`: `0.0` over real tokens and
/// [`PADDING_MASK_VALUE`] over padded keys, broadcast over heads and queries.
pub fn create_padding_mask(attention_mask: &Tensor, dtype: DType) -> Result<Tensor> {
    let (b, seq_len) = attention_mask.dims2()?;
    // (1 - m) * PADDING_MASK_VALUE
    let mask = attention_mask
        .to_dtype(DType::F32)?
        .affine(-f64::from(PADDING_MASK_VALUE), f64::from(PADDING_MASK_VALUE))?;
    Ok(mask.reshape((b, 1, 1, seq_len))?.to_dtype(dtype)?)
}

/// Causal mask combined with the key-padding mask
///
/// # Returns
///
/// A tensor of shape `[batch, 1, seq_len, seq_len]`. For a right-padded row
/// `[1, 1, 0]` the last key column also gets `P = PADDING_MASK_VALUE`:
/// ```text
/// [[0, -inf, -inf],
///  [0,    0, -inf],
///  [0,    0,    P]]
/// ```
pub fn create_batch_mask(attention_mask: &Tensor, dtype: DType) -> Result<Tensor> {
    let (_, seq_len) = attention_mask.dims2()?;
    let causal = create_causal_mask(seq_len, attention_mask.device(), dtype)?;
    let padding = create_padding_mask(attention_mask, dtype)?;
    Ok(causal.broadcast_add(&padding)?)
}

/// Clear all cached causal masks
pub fn clear_mask_caches() {
    CAUSAL_MASK_CACHE
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clear();
}

/// Number of cached causal masks
pub fn mask_cache_size() -> usize {
    CAUSAL_MASK_CACHE
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .len()
}
