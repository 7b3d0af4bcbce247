//! Balanced, shuffled probe batches built from per-class activations

use candle_core::{DType, Tensor};
use rand::rngs::StdRng;
use rand::seq::{index, SliceRandom};

use crate::cache::ActivationCache;
use crate::classes::{paired_partner, ClassId, NEGATIVE_CLASS_LABEL, POSITIVE_CLASS_LABEL};
use crate::error::{ProbeError, Result};

/// Activation batches `[batch_size, d]` and their U32 label batches `[batch_size]`
pub type ProbeData = (Vec<Tensor>, Vec<Tensor>);

/// Build 1:1 positive/negative batches for the probe of `class_id`.
///
/// Non-negative ids are trained one-vs-all: negatives are drawn from every
/// other class in `acts`. Negative ids are paired classes and draw their
/// negatives from the registered partner only. The negative pool is
/// subsampled without replacement to the positive count, the union is
/// shuffled jointly with its labels and cut into `batch_size` batches; the
/// trailing remainder is dropped.
///
/// With `single_class` and a non-negative id, the positives alone are
/// batched (unshuffled, all labelled positive).
pub fn prepare_probe_data(
    acts: &ActivationCache,
    class_id: ClassId,
    batch_size: usize,
    single_class: bool,
    rng: &mut StdRng,
) -> Result<ProbeData> {
    if batch_size == 0 {
        return Err(ProbeError::Contract("batch_size must be positive".into()));
    }
    let positive = acts.require(class_id)?;
    let n_positive = positive.dim(0)?;

    if single_class && class_id >= 0 {
        let labels = Tensor::full(POSITIVE_CLASS_LABEL, n_positive, positive.device())?;
        return into_batches(positive, &labels, batch_size);
    }

    let negative_pool = if class_id >= 0 {
        let others: Vec<Tensor> = acts
            .iter()
            .filter(|(id, _)| *id != class_id)
            .map(|(_, t)| t.clone())
            .collect();
        if others.is_empty() {
            return Err(ProbeError::Invariant(format!(
                "class {class_id} has no negative classes"
            )));
        }
        Tensor::cat(&others, 0)?
    } else {
        let partner = paired_partner(class_id).ok_or(ProbeError::InvalidClass(class_id))?;
        acts.require(partner)?.clone()
    };

    let n_negative = negative_pool.dim(0)?;
    if n_negative < n_positive {
        return Err(ProbeError::Invariant(format!(
            "class {class_id}: {n_negative} negatives for {n_positive} positives"
        )));
    }
    let picked: Vec<u32> = index::sample(rng, n_negative, n_positive)
        .into_iter()
        .map(|i| i as u32)
        .collect();
    let picked = Tensor::from_vec(picked, n_positive, negative_pool.device())?;
    let negative = negative_pool.index_select(&picked, 0)?;
    if negative.dims() != positive.dims() {
        return Err(ProbeError::Invariant(format!(
            "sampled negatives {:?} do not match positives {:?}",
            negative.dims(),
            positive.dims()
        )));
    }

    let combined = Tensor::cat(&[positive, &negative], 0)?;
    let device = combined.device();
    let labels = Tensor::cat(
        &[
            Tensor::full(POSITIVE_CLASS_LABEL, n_positive, device)?,
            Tensor::full(NEGATIVE_CLASS_LABEL, n_positive, device)?,
        ],
        0,
    )?;

    let mut order: Vec<u32> = (0..combined.dim(0)? as u32).collect();
    order.shuffle(rng);
    let order = Tensor::from_vec(order, combined.dim(0)?, device)?;
    let shuffled = combined.index_select(&order, 0)?;
    let shuffled_labels = labels.index_select(&order, 0)?;

    into_batches(&shuffled, &shuffled_labels, batch_size)
}

/// Slice rows into `floor(n / batch_size)` equal batches
fn into_batches(acts: &Tensor, labels: &Tensor, batch_size: usize) -> Result<ProbeData> {
    let n_batches = acts.dim(0)? / batch_size;
    let mut act_batches = Vec::with_capacity(n_batches);
    let mut label_batches = Vec::with_capacity(n_batches);
    for i in 0..n_batches {
        act_batches.push(acts.narrow(0, i * batch_size, batch_size)?);
        label_batches.push(labels.narrow(0, i * batch_size, batch_size)?.to_dtype(DType::U32)?);
    }
    Ok((act_batches, label_batches))
}
