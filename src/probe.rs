//! Linear probes trained with candle
//!
//! One probe per class: a single `d_model -> 1` linear layer trained with
//! AdamW on binary cross-entropy over the logits.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{AdamW, Linear, Module, Optimizer, ParamsAdamW};
use rand::rngs::StdRng;
use rand::Rng;
use serde::Serialize;
use tracing::{debug, info};

use crate::cache::ActivationCache;
use crate::classes::{ClassId, ALL_PROBES_KEY};
use crate::error::{ProbeError, Result};
use crate::probe_data::prepare_probe_data;

/// Number of leading training batches scored after each epoch
pub const TRAIN_EVAL_BATCHES: usize = 30;

/// Results from evaluating a probe
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeResults {
    /// Fraction of examples whose thresholded logit matches the label
    pub accuracy: f64,
    /// Number of correct predictions
    pub correct: usize,
    /// Total number of evaluated examples
    pub total: usize,
    /// True positives (predicted 1, label 1)
    pub true_positives: usize,
    /// True negatives (predicted 0, label 0)
    pub true_negatives: usize,
    /// False positives (predicted 1, label 0)
    pub false_positives: usize,
    /// False negatives (predicted 0, label 1)
    pub false_negatives: usize,
}

impl ProbeResults {
    /// Compute precision (label 1 = positive class)
    pub fn precision(&self) -> f64 {
        let denom = self.true_positives + self.false_positives;
        if denom == 0 {
            0.0
        } else {
            self.true_positives as f64 / denom as f64
        }
    }

    /// Compute recall (label 1 = positive class)
    pub fn recall(&self) -> f64 {
        let denom = self.true_positives + self.false_negatives;
        if denom == 0 {
            0.0
        } else {
            self.true_positives as f64 / denom as f64
        }
    }

    /// Compute F1 score
    pub fn f1(&self) -> f64 {
        let p = self.precision();
        let r = self.recall();
        if p + r == 0.0 {
            0.0
        } else {
            2.0 * p * r / (p + r)
        }
    }

    /// Tally predictions against labels. An empty set scores 0.
    fn from_predictions(predictions: &[u32], labels: &[u32]) -> Self {
        let mut tp = 0;
        let mut tn = 0;
        let mut fp = 0;
        let mut r#fn = 0;

        for (pred, label) in predictions.iter().zip(labels) {
            match (*pred, *label) {
                (1, 1) => tp += 1,
                (0, 0) => tn += 1,
                (1, 0) => fp += 1,
                (0, _) => r#fn += 1,
                _ => fp += 1,
            }
        }

        let correct = tp + tn;
        let total = predictions.len().min(labels.len());
        let accuracy = if total == 0 {
            0.0
        } else {
            correct as f64 / total as f64
        };

        ProbeResults {
            accuracy,
            correct,
            total,
            true_positives: tp,
            true_negatives: tn,
            false_positives: fp,
            false_negatives: r#fn,
        }
    }
}

/// A linear probe: `logit = w · x + b`
#[derive(Debug, Clone)]
pub struct Probe {
    linear: Linear,
}

impl Probe {
    /// Build a probe from its weight `[1, dim]` and bias `[1]`
    pub fn from_parts(weight: Tensor, bias: Tensor) -> Result<Self> {
        let (out, _) = weight.dims2()?;
        if out != 1 || bias.dims() != [1] {
            return Err(ProbeError::Config(format!(
                "probe expects weight [1, d] and bias [1], got {:?} and {:?}",
                weight.dims(),
                bias.dims()
            )));
        }
        Ok(Self {
            linear: Linear::new(weight, Some(bias)),
        })
    }

    /// Fresh trainable probe, uniform in `±1/sqrt(dim)` like a default linear layer
    fn init(dim: usize, device: &Device, rng: &mut StdRng) -> Result<(Self, Vec<Var>)> {
        let bound = 1.0 / (dim as f32).sqrt();
        let w: Vec<f32> = (0..dim).map(|_| rng.gen_range(-bound..bound)).collect();
        let b = rng.gen_range(-bound..bound);

        let weight = Var::from_tensor(&Tensor::from_vec(w, (1, dim), device)?)?;
        let bias = Var::from_tensor(&Tensor::from_vec(vec![b], 1, device)?)?;
        let probe = Self::from_parts(weight.as_tensor().clone(), bias.as_tensor().clone())?;
        Ok((probe, vec![weight, bias]))
    }

    /// Logits `[batch]` for activations `[batch, dim]`
    pub fn forward(&self, acts: &Tensor) -> Result<Tensor> {
        let acts = acts.to_dtype(DType::F32)?;
        Ok(self.linear.forward(&acts)?.squeeze(1)?)
    }

    pub fn weight(&self) -> &Tensor {
        self.linear.weight()
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.linear.bias()
    }

    /// Input dimension
    pub fn dim(&self) -> Result<usize> {
        Ok(self.linear.weight().dim(1)?)
    }
}

/// Input batches for training or evaluation.
///
/// A run uses one kind throughout: pooled activations computed ahead of
/// time, or raw texts turned into activations on the fly.
#[derive(Debug, Clone)]
pub enum ProbeBatches {
    /// `[batch, dim]` activation tensors
    Precomputed(Vec<Tensor>),
    /// Texts, pooled by an extractor during training
    RawText(Vec<Vec<String>>),
}

impl ProbeBatches {
    pub fn len(&self) -> usize {
        match self {
            ProbeBatches::Precomputed(b) => b.len(),
            ProbeBatches::RawText(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn kind(&self) -> &'static str {
        match self {
            ProbeBatches::Precomputed(_) => "precomputed",
            ProbeBatches::RawText(_) => "raw text",
        }
    }

    /// The first `n` batches
    fn prefix(&self, n: usize) -> ProbeBatches {
        match self {
            ProbeBatches::Precomputed(b) => {
                ProbeBatches::Precomputed(b.iter().take(n).cloned().collect())
            }
            ProbeBatches::RawText(b) => ProbeBatches::RawText(b.iter().take(n).cloned().collect()),
        }
    }
}

/// Turns a batch of texts into pooled activations `[batch, dim]`
pub type ActivationFn<'a> = &'a dyn Fn(&[String]) -> Result<Tensor>;

/// Optimizer settings for [`train_probe`]
#[derive(Debug, Clone)]
pub struct ProbeTrainConfig {
    pub dim: usize,
    pub epochs: usize,
    pub lr: f64,
    pub device: Device,
}

impl ProbeTrainConfig {
    pub fn new(dim: usize, device: Device) -> Self {
        Self {
            dim,
            epochs: 10,
            lr: 1e-2,
            device,
        }
    }
}

/// Loss and accuracies at the end of one epoch
#[derive(Debug, Clone, Serialize)]
pub struct EpochStats {
    pub epoch: usize,
    /// Loss of the last training batch
    pub loss: f32,
    pub train_accuracy: f64,
    pub test_accuracy: f64,
}

/// Output of [`train_probe`]
#[derive(Debug, Clone)]
pub struct TrainedProbe {
    pub probe: Probe,
    /// Test accuracy after the final epoch
    pub test_accuracy: f64,
    pub history: Vec<EpochStats>,
}

/// Numerically stable `BCEWithLogits`: `max(x, 0) - x * y + ln(1 + e^-|x|)`, batch mean
pub fn bce_with_logits(logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
    let targets = targets.to_dtype(DType::F32)?;
    let softplus = logits.abs()?.neg()?.exp()?.affine(1.0, 1.0)?.log()?;
    let loss = logits
        .relu()?
        .sub(&logits.mul(&targets)?)?
        .add(&softplus)?;
    Ok(loss.mean_all()?)
}

/// Train a fresh probe and score it after every epoch.
///
/// Train inputs and labels must have the same number of batches, and train
/// and test inputs must be of the same kind. Raw-text batches need
/// `get_acts`. Each epoch takes one AdamW step per batch, then scores the
/// first [`TRAIN_EVAL_BATCHES`] training batches and the whole test set.
///
/// Scoring goes through [`test_probe`], so a raw-text run stops with
/// `NotImplemented` after its first training pass.
pub fn train_probe(
    train_inputs: &ProbeBatches,
    train_labels: &[Tensor],
    test_inputs: &ProbeBatches,
    test_labels: &[Tensor],
    get_acts: Option<ActivationFn<'_>>,
    config: &ProbeTrainConfig,
    rng: &mut StdRng,
) -> Result<TrainedProbe> {
    if std::mem::discriminant(train_inputs) != std::mem::discriminant(test_inputs) {
        return Err(ProbeError::Contract(format!(
            "train batches are {} but test batches are {}",
            train_inputs.kind(),
            test_inputs.kind()
        )));
    }
    if train_inputs.len() != train_labels.len() {
        return Err(ProbeError::Contract(format!(
            "{} train input batches but {} label batches",
            train_inputs.len(),
            train_labels.len()
        )));
    }
    if train_inputs.is_empty() {
        return Err(ProbeError::Contract("no training batches".into()));
    }
    let extract = |batch: &[String]| -> Result<Tensor> {
        match get_acts {
            Some(f) => f(batch),
            None => Err(ProbeError::Contract(
                "raw text batches need an activation extractor".into(),
            )),
        }
    };

    let (probe, vars) = Probe::init(config.dim, &config.device, rng)?;
    let mut optimizer = AdamW::new(
        vars,
        ParamsAdamW {
            lr: config.lr,
            ..Default::default()
        },
    )?;

    let mut history = Vec::with_capacity(config.epochs);
    let mut test_accuracy = 0.0;
    for epoch in 0..config.epochs {
        let mut last_loss = 0.0;
        for (i, labels) in train_labels.iter().enumerate() {
            let acts = match train_inputs {
                ProbeBatches::Precomputed(batches) => batches[i].to_device(&config.device)?,
                ProbeBatches::RawText(batches) => extract(&batches[i])?,
            };
            let labels = labels.to_device(&config.device)?;
            let logits = probe.forward(&acts)?;
            let loss = bce_with_logits(&logits, &labels)?;
            optimizer.backward_step(&loss)?;
            last_loss = loss.to_scalar::<f32>()?;
        }
        info!("Epoch {}/{} Loss: {last_loss}", epoch + 1, config.epochs);

        let n_eval = TRAIN_EVAL_BATCHES.min(train_labels.len());
        let train_accuracy = test_probe(
            &train_inputs.prefix(n_eval),
            &train_labels[..n_eval],
            &probe,
        )?
        .accuracy;
        info!("Train Accuracy: {train_accuracy}");

        test_accuracy = test_probe(test_inputs, test_labels, &probe)?.accuracy;
        info!("Test Accuracy: {test_accuracy}");

        history.push(EpochStats {
            epoch: epoch + 1,
            loss: last_loss,
            train_accuracy,
            test_accuracy,
        });
    }

    Ok(TrainedProbe {
        probe,
        test_accuracy,
        history,
    })
}

/// Score a probe on precomputed batches; a logit above 0 predicts label 1.
///
/// Raw-text evaluation is not supported.
pub fn test_probe(inputs: &ProbeBatches, labels: &[Tensor], probe: &Probe) -> Result<ProbeResults> {
    let ProbeBatches::Precomputed(batches) = inputs else {
        return Err(ProbeError::NotImplemented(
            "probe evaluation on raw text batches",
        ));
    };
    if batches.len() != labels.len() {
        return Err(ProbeError::Contract(format!(
            "{} input batches but {} label batches",
            batches.len(),
            labels.len()
        )));
    }

    let mut predictions = Vec::new();
    let mut targets = Vec::new();
    for (acts, labels_b) in batches.iter().zip(labels) {
        let acts = acts.to_device(probe.weight().device())?;
        let preds = probe.forward(&acts)?.gt(0.0)?.to_dtype(DType::U32)?;
        predictions.extend(preds.to_vec1::<u32>()?);
        targets.extend(labels_b.to_dtype(DType::U32)?.to_vec1::<u32>()?);
    }
    Ok(ProbeResults::from_predictions(&predictions, &targets))
}

/// Test accuracies of trained probes, keyed under [`ALL_PROBES_KEY`]
pub type ProbeAccuracies = BTreeMap<ClassId, BTreeMap<ClassId, f64>>;

/// Score each class's probe on freshly prepared batches from `acts`
pub fn get_probe_test_accuracy(
    probes: &BTreeMap<ClassId, Probe>,
    classes: &[ClassId],
    acts: &ActivationCache,
    batch_size: usize,
    rng: &mut StdRng,
) -> Result<ProbeAccuracies> {
    let mut per_class = BTreeMap::new();
    for &class in classes {
        let probe = probes.get(&class).ok_or(ProbeError::InvalidClass(class))?;
        let (inputs, labels) = prepare_probe_data(acts, class, batch_size, false, rng)?;
        let results = test_probe(&ProbeBatches::Precomputed(inputs), &labels, probe)?;
        debug!("class {class} test accuracy: {}", results.accuracy);
        per_class.insert(class, results.accuracy);
    }

    let mut accuracies = BTreeMap::new();
    accuracies.insert(ALL_PROBES_KEY, per_class);
    Ok(accuracies)
}

/// Checkpoint location: `{probe_dir}/{model basename}/probes_ctx_len_{context_length}.safetensors`
pub fn probe_checkpoint_path(probe_dir: &Path, model_id: &str, context_length: usize) -> PathBuf {
    let basename = model_id.rsplit('/').next().unwrap_or(model_id);
    probe_dir
        .join(basename)
        .join(format!("probes_ctx_len_{context_length}.safetensors"))
}

/// Write probes as `probe.{class}.weight` / `probe.{class}.bias`
pub fn save_probes(probes: &BTreeMap<ClassId, Probe>, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut tensors = HashMap::new();
    for (class, probe) in probes {
        tensors.insert(format!("probe.{class}.weight"), probe.weight().detach());
        if let Some(bias) = probe.bias() {
            tensors.insert(format!("probe.{class}.bias"), bias.detach());
        }
    }
    candle_core::safetensors::save(&tensors, path)?;
    info!("Saved {} probes to {}", probes.len(), path.display());
    Ok(())
}

/// Read probes written by [`save_probes`]
pub fn load_probes(path: &Path, device: &Device) -> Result<BTreeMap<ClassId, Probe>> {
    let mut tensors = candle_core::safetensors::load(path, device)?;
    let mut classes: Vec<ClassId> = Vec::new();
    for name in tensors.keys() {
        let class = name
            .strip_prefix("probe.")
            .and_then(|rest| rest.strip_suffix(".weight"));
        if let Some(class) = class {
            let class = class
                .parse()
                .map_err(|_| ProbeError::Config(format!("bad probe tensor name: {name}")))?;
            classes.push(class);
        }
    }

    let mut probes = BTreeMap::new();
    for class in classes {
        let missing = |part: &str| ProbeError::Config(format!("missing probe.{class}.{part}"));
        let weight = tensors
            .remove(&format!("probe.{class}.weight"))
            .ok_or_else(|| missing("weight"))?;
        let bias = tensors
            .remove(&format!("probe.{class}.bias"))
            .ok_or_else(|| missing("bias"))?;
        probes.insert(class, Probe::from_parts(weight, bias)?);
    }
    Ok(probes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    /// Two classes separated along feature 0 by a wide margin
    fn separable_batches(n_batches: usize, batch_size: usize, dim: usize, seed: u64) -> (Vec<Tensor>, Vec<Tensor>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut acts = Vec::new();
        let mut labels = Vec::new();
        for _ in 0..n_batches {
            let mut data = vec![0f32; batch_size * dim];
            let mut lab = Vec::with_capacity(batch_size);
            for row in 0..batch_size {
                let positive = row % 2 == 0;
                let magnitude = rng.gen_range(20.0..30.0);
                data[row * dim] = if positive { magnitude } else { -magnitude };
                lab.push(u32::from(positive));
            }
            acts.push(Tensor::from_vec(data, (batch_size, dim), &Device::Cpu).unwrap());
            labels.push(Tensor::from_vec(lab, batch_size, &Device::Cpu).unwrap());
        }
        (acts, labels)
    }

    #[test]
    fn test_probe_results_metrics() {
        let results = ProbeResults {
            accuracy: 0.8,
            correct: 8,
            total: 10,
            true_positives: 4,
            true_negatives: 4,
            false_positives: 1,
            false_negatives: 1,
        };

        assert!((results.precision() - 0.8).abs() < 0.01);
        assert!((results.recall() - 0.8).abs() < 0.01);
        assert!((results.f1() - 0.8).abs() < 0.01);
    }

    #[test]
    fn test_bce_matches_closed_form() {
        let device = Device::Cpu;
        let logits = Tensor::new(&[0f32, 2.0, -3.0], &device).unwrap();
        let targets = Tensor::new(&[1u32, 0, 0], &device).unwrap();
        let loss = bce_with_logits(&logits, &targets)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();

        let expected = ((2f32).ln() + (1.0 + 2f32.exp()).ln() + (1.0 + (-3f32).exp()).ln()) / 3.0;
        assert!((loss - expected).abs() < 1e-5, "{loss} vs {expected}");
    }

    #[test]
    fn test_probe_converges_on_separable_data() {
        let (acts, labels) = separable_batches(2, 10, 32, 7);
        let train = ProbeBatches::Precomputed(acts.clone());
        let test = ProbeBatches::Precomputed(acts);
        let mut config = ProbeTrainConfig::new(32, Device::Cpu);
        config.epochs = 1;
        config.lr = 2.0;

        let mut rng = StdRng::seed_from_u64(42);
        let trained = train_probe(&train, &labels, &test, &labels, None, &config, &mut rng).unwrap();

        assert_eq!(trained.history.len(), 1);
        assert!(trained.history[0].train_accuracy > 0.95);
        assert!(trained.test_accuracy > 0.95);
    }

    #[test]
    fn test_mismatched_batch_counts_rejected() {
        let (acts, labels) = separable_batches(3, 4, 8, 0);
        let train = ProbeBatches::Precomputed(acts);
        let config = ProbeTrainConfig::new(8, Device::Cpu);
        let mut rng = StdRng::seed_from_u64(0);
        let err = train_probe(&train, &labels[..2], &train, &labels, None, &config, &mut rng)
            .unwrap_err();
        assert!(matches!(err, ProbeError::Contract(_)));
    }

    #[test]
    fn test_mixed_batch_kinds_rejected() {
        let (acts, labels) = separable_batches(1, 4, 8, 0);
        let train = ProbeBatches::Precomputed(acts);
        let test = ProbeBatches::RawText(vec![vec!["a".into(); 4]]);
        let config = ProbeTrainConfig::new(8, Device::Cpu);
        let mut rng = StdRng::seed_from_u64(0);
        let err = train_probe(&train, &labels, &test, &labels, None, &config, &mut rng).unwrap_err();
        assert!(matches!(err, ProbeError::Contract(_)));
    }

    #[test]
    fn test_raw_text_evaluation_not_implemented() {
        let (_, labels) = separable_batches(1, 2, 4, 0);
        let probe = Probe::from_parts(
            Tensor::ones((1, 4), DType::F32, &Device::Cpu).unwrap(),
            Tensor::zeros(1, DType::F32, &Device::Cpu).unwrap(),
        )
        .unwrap();
        let inputs = ProbeBatches::RawText(vec![vec!["x".into(), "y".into()]]);
        let err = test_probe(&inputs, &labels, &probe).unwrap_err();
        assert!(matches!(err, ProbeError::NotImplemented(_)));
    }

    #[test]
    fn test_raw_text_training_needs_extractor() {
        let (_, labels) = separable_batches(1, 2, 4, 0);
        let inputs = ProbeBatches::RawText(vec![vec!["x".into(), "y".into()]]);
        let config = ProbeTrainConfig::new(4, Device::Cpu);
        let mut rng = StdRng::seed_from_u64(0);
        let err = train_probe(&inputs, &labels, &inputs, &labels, None, &config, &mut rng)
            .unwrap_err();
        assert!(matches!(err, ProbeError::Contract(_)));
    }

    #[test]
    fn test_raw_text_training_pools_then_stops_at_scoring() {
        let (acts, labels) = separable_batches(2, 2, 4, 3);
        let inputs = ProbeBatches::RawText(vec![vec!["a".into(), "b".into()]; 2]);
        let calls = std::cell::Cell::new(0usize);
        let extractor = |batch: &[String]| -> Result<Tensor> {
            assert_eq!(batch.len(), 2);
            let i = calls.get();
            calls.set(i + 1);
            Ok(acts[i % acts.len()].clone())
        };
        let config = ProbeTrainConfig::new(4, Device::Cpu);
        let mut rng = StdRng::seed_from_u64(0);

        let err = train_probe(&inputs, &labels, &inputs, &labels, Some(&extractor), &config, &mut rng)
            .unwrap_err();
        assert!(matches!(err, ProbeError::NotImplemented(_)));
        // one pass over both training batches before the first evaluation
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_threshold_at_zero() {
        let device = Device::Cpu;
        let probe = Probe::from_parts(
            Tensor::new(&[[1f32, 0.0]], &device).unwrap(),
            Tensor::new(&[0f32], &device).unwrap(),
        )
        .unwrap();
        // logits 1, 0, -1 -> predictions 1, 0, 0
        let acts = Tensor::new(&[[1f32, 5.0], [0.0, 5.0], [-1.0, 5.0]], &device).unwrap();
        let labels = Tensor::new(&[1u32, 1, 0], &device).unwrap();
        let results = test_probe(&ProbeBatches::Precomputed(vec![acts]), &[labels], &probe).unwrap();
        assert_eq!(results.true_positives, 1);
        assert_eq!(results.false_negatives, 1);
        assert_eq!(results.true_negatives, 1);
        assert!((results.accuracy - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_checkpoint_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = probe_checkpoint_path(dir.path(), "HuggingFaceTB/SmolLM2-135M", 128);
        assert!(path.ends_with("SmolLM2-135M/probes_ctx_len_128.safetensors"));

        let device = Device::Cpu;
        let mut probes = BTreeMap::new();
        probes.insert(
            -4,
            Probe::from_parts(
                Tensor::new(&[[0.5f32, -1.0, 2.0]], &device).unwrap(),
                Tensor::new(&[0.25f32], &device).unwrap(),
            )
            .unwrap(),
        );
        probes.insert(
            13,
            Probe::from_parts(
                Tensor::new(&[[1f32, 1.0, 1.0]], &device).unwrap(),
                Tensor::new(&[-3f32], &device).unwrap(),
            )
            .unwrap(),
        );
        save_probes(&probes, &path).unwrap();

        let loaded = load_probes(&path, &device).unwrap();
        assert_eq!(loaded.keys().copied().collect::<Vec<_>>(), vec![-4, 13]);
        assert_eq!(
            loaded[&-4].weight().to_vec2::<f32>().unwrap(),
            vec![vec![0.5, -1.0, 2.0]]
        );
        assert_eq!(loaded[&13].bias().unwrap().to_vec1::<f32>().unwrap(), vec![-3.0]);
    }
}
