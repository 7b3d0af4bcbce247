//! Pooled activation collection
//!
//! Runs texts through the model in batches and reduces each text to the
//! attention-masked mean of a layer's hidden states.

use candle_core::{DType, Tensor};
use tracing::{debug, info};

use crate::balance::BalancedGroups;
use crate::cache::ActivationCache;
use crate::error::{ProbeError, Result};
use crate::model::ActivationModel;

/// Masked mean over the sequence axis.
///
/// `hidden`: `[batch, seq, d]`, `mask`: `[batch, seq]` (1 = token, 0 = pad).
/// Returns `[batch, d]` in F32. An example with no unmasked token is an
/// [`ProbeError::EmptyAttentionMask`] error.
pub fn masked_mean_pool(hidden: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let hidden = hidden.to_dtype(DType::F32)?;
    let mask = mask.to_dtype(DType::F32)?;

    let counts = mask.sum(1)?;
    if let Some(index) = counts.to_vec1::<f32>()?.iter().position(|&c| c == 0.0) {
        return Err(ProbeError::EmptyAttentionMask { index });
    }

    let summed = hidden.broadcast_mul(&mask.unsqueeze(2)?)?.sum(1)?;
    Ok(summed.broadcast_div(&counts.unsqueeze(1)?)?)
}

/// Pooled activations for every text, in input order: `[texts.len(), d_model]`
///
/// Texts are processed in consecutive batches of `batch_size`; the last
/// batch may be shorter.
pub fn get_all_activations(
    texts: &[String],
    model: &dyn ActivationModel,
    batch_size: usize,
    layer: usize,
    context_length: usize,
) -> Result<Tensor> {
    if batch_size == 0 {
        return Err(ProbeError::Contract("batch_size must be positive".into()));
    }
    if texts.is_empty() {
        return Ok(Tensor::zeros(
            (0, model.d_model()),
            DType::F32,
            model.device(),
        )?);
    }

    let mut batches = Vec::with_capacity(texts.len().div_ceil(batch_size));
    for (i, chunk) in texts.chunks(batch_size).enumerate() {
        let pooled = model
            .forward_and_pool(chunk, layer, context_length, masked_mean_pool)
            .map_err(|e| match e {
                ProbeError::EmptyAttentionMask { index } => ProbeError::EmptyAttentionMask {
                    index: i * batch_size + index,
                },
                other => other,
            })?;
        debug!("Batch {i}: pooled {:?}", pooled.dims());
        batches.push(pooled);
    }

    Ok(Tensor::cat(&batches, 0)?)
}

/// Pooled activations for every class of a balanced split
pub fn collect_class_activations(
    groups: &BalancedGroups,
    model: &dyn ActivationModel,
    batch_size: usize,
    layer: usize,
    context_length: usize,
) -> Result<ActivationCache> {
    let mut cache = ActivationCache::new();
    for (&class, texts) in groups {
        info!("Collecting activations for class {class} ({} texts)", texts.len());
        let acts = get_all_activations(texts, model, batch_size, layer, context_length)?;
        cache.insert(class, acts);
    }
    Ok(cache)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TextLengthModel;
    use candle_core::Device;

    #[test]
    fn test_masked_mean_pool() {
        let device = Device::Cpu;
        // batch 2, seq 3, d 2
        let hidden = Tensor::new(
            &[
                [[1f32, 2.], [3., 4.], [100., 100.]],
                [[2., 0.], [0., 2.], [4., 4.]],
            ],
            &device,
        )
        .unwrap();
        let mask = Tensor::new(&[[1u32, 1, 0], [1, 1, 1]], &device).unwrap();

        let pooled = masked_mean_pool(&hidden, &mask).unwrap();
        assert_eq!(
            pooled.to_vec2::<f32>().unwrap(),
            vec![vec![2.0, 3.0], vec![2.0, 2.0]]
        );
    }

    #[test]
    fn test_empty_mask_is_rejected() {
        let device = Device::Cpu;
        let hidden = Tensor::ones((2, 2, 3), DType::F32, &device).unwrap();
        let mask = Tensor::new(&[[1u32, 0], [0, 0]], &device).unwrap();
        let err = masked_mean_pool(&hidden, &mask).unwrap_err();
        assert!(matches!(err, ProbeError::EmptyAttentionMask { index: 1 }));
    }

    #[test]
    fn test_all_activations_preserve_order_across_batches() {
        let model = TextLengthModel::new(4);
        let texts: Vec<String> = ["a", "bb", "ccc", "dddd", "eeeee"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let acts = get_all_activations(&texts, &model, 2, 0, 128).unwrap();
        assert_eq!(acts.dims(), &[5, 4]);
        let first: Vec<f32> = acts
            .narrow(1, 0, 1)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(first, vec![1.0, 2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn test_context_length_truncates() {
        let model = TextLengthModel::new(2);
        let texts = vec!["abcdefgh".to_string()];
        let acts = get_all_activations(&texts, &model, 4, 0, 3).unwrap();
        assert_eq!(acts.to_vec2::<f32>().unwrap()[0][0], 3.0);
    }

    #[test]
    fn test_empty_text_reports_global_index() {
        let model = TextLengthModel::new(2);
        let texts: Vec<String> = ["a", "b", "c", ""].iter().map(|s| s.to_string()).collect();
        let err = get_all_activations(&texts, &model, 2, 0, 8).unwrap_err();
        assert!(matches!(err, ProbeError::EmptyAttentionMask { index: 3 }));
    }
}
