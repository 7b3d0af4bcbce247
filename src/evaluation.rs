//! SAE evaluation driver
//!
//! Streams token activations of a text corpus through each trained
//! dictionary and writes reconstruction metrics to
//! `{ae_path}/eval_results.json`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use candle_core::{DType, IndexOp, Tensor};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::buffer::{ActivationBuffer, BufferConfig, IoMode};
use crate::error::{ProbeError, Result};
use crate::model::ActivationModel;
use crate::sae::{load_dictionary, Dictionary};

/// Results file written beside each dictionary
pub const EVAL_RESULTS_FILE: &str = "eval_results.json";

/// Settings for [`eval_saes`]
#[derive(Debug, Clone)]
pub struct EvalConfig {
    pub n_inputs: usize,
    pub context_length: usize,
    pub llm_batch_size: usize,
    pub sae_batch_size: usize,
    /// Upper bound on the number of contexts held by the activation buffer
    pub buffer_size: usize,
    pub io: IoMode,
    /// Overrides the layer recorded in the dictionary config
    pub layer: Option<usize>,
    pub seed: u64,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            n_inputs: 10_000,
            context_length: 128,
            llm_batch_size: 16,
            sae_batch_size: 16,
            buffer_size: 512,
            io: IoMode::Out,
            layer: None,
            seed: 42,
        }
    }
}

/// Run parameters stored with each result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalHyperparameters {
    pub n_inputs: usize,
    pub context_length: usize,
}

/// Reconstruction metrics of a dictionary over every buffered token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalResults {
    /// Mean L2 norm of the reconstruction error
    pub l2_loss: f64,
    /// Mean L1 norm of the feature code
    pub l1_loss: f64,
    /// Mean number of active features per token
    pub l0: f64,
    /// Fraction of features active on at least one token
    pub frac_alive: f64,
    pub frac_variance_explained: f64,
    /// Mean cosine similarity of target and reconstruction
    pub cossim: f64,
    /// Mean `|x_hat| / |x|`
    pub l2_ratio: f64,
    /// `E|x_hat|^2 / E<x, x_hat>`
    pub relative_reconstruction_bias: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hyperparameters: Option<EvalHyperparameters>,
}

/// Running sums over evaluated tokens
#[derive(Default)]
struct MetricSums {
    n: usize,
    l2: f64,
    l1: f64,
    l0: f64,
    cossim: f64,
    l2_ratio: f64,
    x_hat_sq: f64,
    x_dot_x_hat: f64,
    /// Per-feature sums of target, target^2, residual, residual^2
    x_sum: Option<Tensor>,
    x_sq_sum: Option<Tensor>,
    r_sum: Option<Tensor>,
    r_sq_sum: Option<Tensor>,
    alive: Option<Tensor>,
}

fn accumulate(slot: &mut Option<Tensor>, value: Tensor) -> Result<()> {
    *slot = Some(match slot.take() {
        Some(acc) => (acc + value)?,
        None => value,
    });
    Ok(())
}

fn scalar(t: &Tensor) -> Result<f64> {
    Ok(f64::from(t.to_dtype(DType::F32)?.to_scalar::<f32>()?))
}

impl MetricSums {
    fn add_batch(&mut self, x: &Tensor, x_hat: &Tensor, f: &Tensor) -> Result<()> {
        let residual = (x - x_hat)?;
        let x_norm = x.sqr()?.sum(1)?.sqrt()?;
        let x_hat_norm = x_hat.sqr()?.sum(1)?.sqrt()?;
        let dot = (x * x_hat)?.sum(1)?;

        self.n += x.dim(0)?;
        self.l2 += scalar(&residual.sqr()?.sum(1)?.sqrt()?.sum_all()?)?;
        self.l1 += scalar(&f.abs()?.sum_all()?)?;
        let active = f.ne(0.0)?.to_dtype(DType::F32)?;
        self.l0 += scalar(&active.sum_all()?)?;
        self.cossim += scalar(&(&dot / (&x_norm * &x_hat_norm)?)?.sum_all()?)?;
        self.l2_ratio += scalar(&(&x_hat_norm / &x_norm)?.sum_all()?)?;
        self.x_hat_sq += scalar(&x_hat.sqr()?.sum_all()?)?;
        self.x_dot_x_hat += scalar(&dot.sum_all()?)?;

        accumulate(&mut self.x_sum, x.sum(0)?)?;
        accumulate(&mut self.x_sq_sum, x.sqr()?.sum(0)?)?;
        accumulate(&mut self.r_sum, residual.sum(0)?)?;
        accumulate(&mut self.r_sq_sum, residual.sqr()?.sum(0)?)?;
        let batch_alive = active.max(0)?;
        self.alive = Some(match self.alive.take() {
            Some(acc) => acc.maximum(&batch_alive)?,
            None => batch_alive,
        });
        Ok(())
    }

    /// Summed per-feature variance from running sums: `sum(s2 - s1^2 / n)`
    fn total_variance(sum: &Option<Tensor>, sq_sum: &Option<Tensor>, n: usize) -> Result<f64> {
        match (sum, sq_sum) {
            (Some(s1), Some(s2)) => {
                let mean_sq = (s1.sqr()? / n as f64)?;
                scalar(&(s2 - mean_sq)?.sum_all()?)
            }
            _ => Ok(0.0),
        }
    }

    fn finish(self) -> Result<EvalResults> {
        if self.n == 0 {
            return Err(ProbeError::EmptyBuffer);
        }
        let n = self.n as f64;
        let total_variance = Self::total_variance(&self.x_sum, &self.x_sq_sum, self.n)?;
        let residual_variance = Self::total_variance(&self.r_sum, &self.r_sq_sum, self.n)?;
        let frac_alive = match &self.alive {
            Some(alive) => scalar(&alive.mean_all()?)?,
            None => 0.0,
        };

        Ok(EvalResults {
            l2_loss: self.l2 / n,
            l1_loss: self.l1 / n,
            l0: self.l0 / n,
            frac_alive,
            frac_variance_explained: 1.0 - residual_variance / total_variance,
            cossim: self.cossim / n,
            l2_ratio: self.l2_ratio / n,
            relative_reconstruction_bias: self.x_hat_sq / self.x_dot_x_hat,
            hyperparameters: None,
        })
    }
}

/// Score a dictionary on every batch of a buffer.
///
/// In [`IoMode::InAndOut`] the dictionary encodes the layer input and is
/// scored against the layer output. An empty buffer is an
/// [`ProbeError::EmptyBuffer`] error.
pub fn evaluate<D, B>(dictionary: &D, batches: B, io: IoMode) -> Result<EvalResults>
where
    D: Dictionary + ?Sized,
    B: IntoIterator<Item = Result<Tensor>>,
{
    let mut sums = MetricSums::default();
    for batch in batches {
        let batch = batch?.to_dtype(DType::F32)?;
        let (input, target) = match io {
            IoMode::Out => (batch.clone(), batch),
            IoMode::InAndOut => (batch.i((.., 0))?, batch.i((.., 1))?),
        };
        let f = dictionary.encode(&input)?;
        let x_hat = dictionary.decode(&f)?;
        sums.add_batch(&target, &x_hat, &f)?;
    }
    sums.finish()
}

/// Evaluate every dictionary in `ae_paths` on `texts` with `model`.
///
/// Texts are capped at `n_inputs`. Each result is written to
/// `{ae_path}/eval_results.json` with its hyperparameters; the last one is
/// returned. Any failure stops the whole run.
pub fn eval_saes(
    model: &dyn ActivationModel,
    ae_paths: &[PathBuf],
    texts: &[String],
    config: &EvalConfig,
) -> Result<Option<EvalResults>> {
    let texts = &texts[..texts.len().min(config.n_inputs)];
    let n_ctxs = config.buffer_size.min(texts.len());

    let mut last = None;
    for ae_path in ae_paths {
        let (dictionary, dict_config) = load_dictionary(ae_path, model.device())?;
        let layer = config
            .layer
            .or(dict_config.trainer.layer)
            .ok_or_else(|| {
                ProbeError::Config(format!("{}: no layer in dictionary config", ae_path.display()))
            })?;
        info!(
            "Evaluating {} on layer {layer} ({} inputs, io={})",
            ae_path.display(),
            texts.len(),
            config.io
        );

        let buffer = ActivationBuffer::new(
            texts.iter().cloned(),
            model,
            layer,
            BufferConfig {
                n_ctxs,
                ctx_len: config.context_length,
                refresh_batch_size: config.llm_batch_size,
                out_batch_size: config.sae_batch_size,
                io: config.io,
                seed: config.seed,
            },
        );

        let mut results = evaluate(&dictionary, buffer, config.io)?;
        results.hyperparameters = Some(EvalHyperparameters {
            n_inputs: config.n_inputs,
            context_length: config.context_length,
        });
        info!("{results:?}");

        let output = ae_path.join(EVAL_RESULTS_FILE);
        fs::write(&output, serde_json::to_string_pretty(&results)?)?;
        info!("Wrote {}", output.display());
        last = Some(results);
    }
    Ok(last)
}

/// Submodule name -> trainer ids of a sweep
pub type SubmoduleTrainers = BTreeMap<String, Vec<usize>>;

/// A submodule directory of a sweep and the trainers to load from it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AeGroup {
    pub path: PathBuf,
    pub trainer_ids: Vec<usize>,
}

/// `{dictionaries}/{model_location}{sweep_name}/{submodule}` for each submodule
pub fn ae_group_paths(
    dictionaries_path: &Path,
    model_location: &str,
    sweep_name: &str,
    submodule_trainers: &SubmoduleTrainers,
) -> Vec<AeGroup> {
    let sweep_dir = dictionaries_path.join(format!("{model_location}{sweep_name}"));
    submodule_trainers
        .iter()
        .map(|(submodule, ids)| AeGroup {
            path: sweep_dir.join(submodule),
            trainer_ids: ids.clone(),
        })
        .collect()
}

/// `{group}/trainer_{id}` for every trainer of every group
pub fn ae_paths(groups: &[AeGroup]) -> Vec<PathBuf> {
    groups
        .iter()
        .flat_map(|group| {
            group
                .trainer_ids
                .iter()
                .map(move |id| group.path.join(format!("trainer_{id}")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sae::tests::write_identity_ae;
    use crate::test_support::TextLengthModel;
    use candle_core::Device;

    struct ZeroDictionary;

    impl Dictionary for ZeroDictionary {
        fn activation_dim(&self) -> usize {
            2
        }
        fn dict_size(&self) -> usize {
            4
        }
        fn encode(&self, x: &Tensor) -> Result<Tensor> {
            Ok(Tensor::zeros((x.dim(0)?, 4), DType::F32, x.device())?)
        }
        fn decode(&self, f: &Tensor) -> Result<Tensor> {
            Ok(Tensor::zeros((f.dim(0)?, 2), DType::F32, f.device())?)
        }
    }

    #[test]
    fn test_paths() {
        let mut trainers = SubmoduleTrainers::new();
        trainers.insert("resid_post_layer_4".into(), vec![10, 12]);
        let groups = ae_group_paths(Path::new("dicts"), "smollm135m", "_sweep0709", &trainers);
        assert_eq!(
            groups[0].path,
            PathBuf::from("dicts/smollm135m_sweep0709/resid_post_layer_4")
        );
        assert_eq!(
            ae_paths(&groups),
            vec![
                PathBuf::from("dicts/smollm135m_sweep0709/resid_post_layer_4/trainer_10"),
                PathBuf::from("dicts/smollm135m_sweep0709/resid_post_layer_4/trainer_12"),
            ]
        );
    }

    #[test]
    fn test_metrics_of_zero_dictionary() {
        let x = Tensor::new(&[[3f32, 4.0], [0.0, 2.0]], &Device::Cpu).unwrap();
        let results = evaluate(&ZeroDictionary, vec![Ok(x)], IoMode::Out).unwrap();
        assert!((results.l2_loss - 3.5).abs() < 1e-6);
        assert_eq!(results.l0, 0.0);
        assert_eq!(results.frac_alive, 0.0);
        assert!((results.frac_variance_explained).abs() < 1e-6);
    }

    #[test]
    fn test_empty_buffer_is_error() {
        let err = evaluate(&ZeroDictionary, Vec::new(), IoMode::Out).unwrap_err();
        assert!(matches!(err, ProbeError::EmptyBuffer));
    }

    #[test]
    fn test_eval_saes_writes_results() {
        let dir = tempfile::tempdir().unwrap();
        let ae_path = dir.path().join("trainer_0");
        write_identity_ae(&ae_path, 3);

        let model = TextLengthModel::new(3);
        let texts: Vec<String> = (1..=6).map(|n| "y".repeat(n)).collect();
        let config = EvalConfig {
            n_inputs: 5,
            context_length: 4,
            llm_batch_size: 2,
            sae_batch_size: 3,
            ..Default::default()
        };

        let results = eval_saes(&model, &[ae_path.clone()], &texts, &config)
            .unwrap()
            .unwrap();
        assert!(results.l2_loss.abs() < 1e-6);
        assert!((results.cossim - 1.0).abs() < 1e-5);
        assert!((results.l2_ratio - 1.0).abs() < 1e-5);
        assert!((results.frac_variance_explained - 1.0).abs() < 1e-5);
        assert!((results.relative_reconstruction_bias - 1.0).abs() < 1e-5);
        assert!((results.l0 - 3.0).abs() < 1e-6);
        assert!((results.frac_alive - 0.5).abs() < 1e-6);

        let written: EvalResults =
            serde_json::from_str(&fs::read_to_string(ae_path.join(EVAL_RESULTS_FILE)).unwrap())
                .unwrap();
        assert_eq!(
            written.hyperparameters,
            Some(EvalHyperparameters {
                n_inputs: 5,
                context_length: 4
            })
        );
    }

    #[test]
    fn test_eval_saes_without_inputs_fails() {
        let dir = tempfile::tempdir().unwrap();
        let ae_path = dir.path().join("trainer_0");
        write_identity_ae(&ae_path, 3);

        let model = TextLengthModel::new(3);
        let config = EvalConfig {
            n_inputs: 0,
            ..Default::default()
        };
        let err = eval_saes(&model, &[ae_path.clone()], &[], &config).unwrap_err();
        assert!(matches!(err, ProbeError::EmptyBuffer));
        assert!(!ae_path.join(EVAL_RESULTS_FILE).exists());
    }
}
