//! Experiment runner for bias-in-bios probing
//!
//! Coordinates balancing, activation extraction, and per-class probe
//! training, then saves the probes and their test accuracies.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{info, warn};

use crate::activations::collect_class_activations;
use crate::balance::get_train_test_data;
use crate::classes::{class_name, is_paired_class, ClassId};
use crate::corpus::{BiasInBios, Split};
use crate::error::Result;
use crate::model::{ActivationModel, ModelEvalConfig};
use crate::probe::{
    probe_checkpoint_path, save_probes, train_probe, EpochStats, Probe, ProbeBatches,
    ProbeTrainConfig,
};
use crate::probe_data::prepare_probe_data;

/// Configuration for a probing run
#[derive(Debug, Clone)]
pub struct ExperimentConfig {
    pub train_set_size: usize,
    pub test_set_size: usize,
    /// Tokens kept per biography
    pub context_length: usize,
    pub probe_batch_size: usize,
    /// Texts per model forward pass
    pub llm_batch_size: usize,
    pub epochs: usize,
    pub lr: f64,
    /// Also build the male / female / professor / nurse groups
    pub include_paired_classes: bool,
    /// Layer to probe (default: the model's configured probe layer)
    pub layer: Option<usize>,
    pub probe_dir: PathBuf,
    pub save_results: bool,
    /// Random seed for reproducibility
    pub seed: u64,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            train_set_size: 1000,
            test_set_size: 1000,
            context_length: 128,
            probe_batch_size: 50,
            llm_batch_size: 20,
            epochs: 10,
            lr: 1e-2,
            include_paired_classes: true,
            layer: None,
            probe_dir: PathBuf::from("trained_bib_probes"),
            save_results: true,
            seed: 42,
        }
    }
}

/// Results from a probing run
#[derive(Debug)]
pub struct ExperimentResults {
    pub probes: BTreeMap<ClassId, Probe>,
    /// Final-epoch test accuracy per class
    pub test_accuracies: BTreeMap<ClassId, f64>,
    pub histories: BTreeMap<ClassId, Vec<EpochStats>>,
    pub layer: usize,
    /// Where the probes were saved, if they were
    pub checkpoint: Option<PathBuf>,
}

/// Main experiment runner
pub struct Experiment {
    config: ExperimentConfig,
    model: Box<dyn ActivationModel>,
}

impl Experiment {
    /// Create a new experiment
    pub fn new(model: Box<dyn ActivationModel>, config: ExperimentConfig) -> Self {
        Self { config, model }
    }

    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    /// Train one probe per profession class of `corpus`
    pub fn run(&self, corpus: &BiasInBios) -> Result<ExperimentResults> {
        let config = &self.config;
        info!("Starting probe training");
        info!("Config: {config:?}");

        let eval_config = ModelEvalConfig::for_model(self.model.as_ref());
        let layer = config.layer.unwrap_or(eval_config.probe_layer);
        let d_model = self.model.d_model();
        if eval_config.activation_dim != d_model {
            warn!(
                "Model reports d_model {d_model}, expected {}",
                eval_config.activation_dim
            );
        }
        info!("Probing layer {layer} of {}", self.model.model_id());

        corpus.log_label_distribution(Split::Train);
        let (train_bios, test_bios) = get_train_test_data(
            corpus,
            config.train_set_size,
            config.test_set_size,
            config.include_paired_classes,
            config.seed,
        )?;

        let train_acts = collect_class_activations(
            &train_bios,
            self.model.as_ref(),
            config.llm_batch_size,
            layer,
            config.context_length,
        )?;
        let test_acts = collect_class_activations(
            &test_bios,
            self.model.as_ref(),
            config.llm_batch_size,
            layer,
            config.context_length,
        )?;

        let mut rng = StdRng::seed_from_u64(config.seed);
        let train_config = ProbeTrainConfig {
            dim: d_model,
            epochs: config.epochs,
            lr: config.lr,
            device: self.model.device().clone(),
        };

        let mut probes = BTreeMap::new();
        let mut test_accuracies = BTreeMap::new();
        let mut histories = BTreeMap::new();
        for class in train_acts.classes() {
            // paired groups only serve as negatives here
            if is_paired_class(class) {
                continue;
            }
            info!(
                "Training probe for class {class} ({})",
                class_name(class).unwrap_or("unknown")
            );

            let (train_inputs, train_labels) =
                prepare_probe_data(&train_acts, class, config.probe_batch_size, false, &mut rng)?;
            let (test_inputs, test_labels) =
                prepare_probe_data(&test_acts, class, config.probe_batch_size, false, &mut rng)?;

            let trained = train_probe(
                &ProbeBatches::Precomputed(train_inputs),
                &train_labels,
                &ProbeBatches::Precomputed(test_inputs),
                &test_labels,
                None,
                &train_config,
                &mut rng,
            )?;

            test_accuracies.insert(class, trained.test_accuracy);
            histories.insert(class, trained.history);
            probes.insert(class, trained.probe);
        }

        let checkpoint = if config.save_results {
            let path = probe_checkpoint_path(
                &config.probe_dir,
                self.model.model_id(),
                config.context_length,
            );
            save_probes(&probes, &path)?;
            let accuracies_path = path.with_file_name(format!(
                "probes_ctx_len_{}_accuracies.json",
                config.context_length
            ));
            fs::write(
                &accuracies_path,
                serde_json::to_string_pretty(&test_accuracies)?,
            )?;
            info!("Accuracies saved to {}", accuracies_path.display());
            Some(path)
        } else {
            None
        };

        Ok(ExperimentResults {
            probes,
            test_accuracies,
            histories,
            layer,
            checkpoint,
        })
    }
}
