// Pedantic clippy configuration for ML/math codebase
// These are acceptable in numerical/ML code:
#![allow(clippy::cast_precision_loss)] // usize→f64/f32 intentional in ML
#![allow(clippy::cast_possible_truncation)] // usize→u32 in tensor indexing
#![allow(clippy::cast_possible_wrap)] // usize→i64 in tensor ops
#![allow(clippy::many_single_char_names)] // x, y, i, j standard in math
#![allow(clippy::similar_names)] // related variables like `head`/`heads`
#![allow(clippy::module_name_repetitions)] // ProbeModel in model.rs is fine
// Documentation pedantic - acceptable for research code:
#![allow(clippy::doc_markdown)] // backticks for every technical term is excessive
#![allow(clippy::missing_errors_doc)] // # Errors section for every Result fn
#![allow(clippy::missing_panics_doc)] // # Panics section for every panic
// Method style pedantic:
#![allow(clippy::must_use_candidate)] // #[must_use] on every pure fn is excessive
#![allow(clippy::return_self_not_must_use)] // #[must_use] on Self returns
#![allow(clippy::unused_self)] // &self for API consistency
#![allow(clippy::trivially_copy_pass_by_ref)] // &usize for API consistency
#![allow(clippy::struct_field_names)] // field postfix patterns
#![allow(clippy::needless_pass_by_value)] // value params for API flexibility
#![allow(clippy::unnecessary_wraps)] // Result for future error handling
#![allow(clippy::cast_sign_loss)] // f64→usize when value is known positive

//! bias-probes: profession and gender probing of language model activations
//!
//! Trains one linear probe per bias-in-bios profession on mean-pooled
//! residual activations, and scores trained sparse autoencoders on a text
//! corpus.
//!
//! ## Models
//!
//! Activations come from LLaMA-family and Qwen2 decoders loaded from
//! HuggingFace; `HuggingFaceTB/SmolLM2-135M` is the default. GPT-NeoX
//! checkpoints such as `EleutherAI/pythia-70m-deduped` are not supported, so
//! the SmolLM2 family takes the role of the small reference model.
//!
//! ## Architecture
//!
//! - `classes`: Profession vocabulary, label constants and paired class ids
//! - `corpus`: Bias-in-bios and plain-text corpus loading
//! - `balance`: Gender-balanced per-profession groups and paired classes
//! - `model`: `ActivationModel` capability and the HuggingFace-backed `ProbeModel`
//! - `forward_llama`: LLaMA / Qwen2 decoder stack run up to a layer
//! - `masks`: Causal and key-padding attention masks
//! - `activations`: Masked mean-pooled activation collection
//! - `cache`: Per-class activation store
//! - `probe_data`: Balanced, shuffled probe batches
//! - `probe`: Linear probe training, evaluation and checkpoints
//! - `experiment`: Experiment runner coordinating the probing pipeline
//! - `sae`: Sparse autoencoder dictionaries
//! - `buffer`: Streaming buffer of token activations
//! - `evaluation`: SAE evaluation driver

pub mod activations;
pub mod balance;
pub mod buffer;
pub mod cache;
pub mod classes;
pub mod corpus;
pub mod error;
pub mod evaluation;
pub mod experiment;
pub mod forward_llama;
pub mod masks;
pub mod model;
pub mod probe;
pub mod probe_data;
pub mod sae;

#[cfg(test)]
mod test_support;

pub use activations::{collect_class_activations, get_all_activations, masked_mean_pool};
pub use balance::{ensure_shared_keys, get_balanced_dataset, get_train_test_data, BalancedGroups};
pub use buffer::{ActivationBuffer, BufferConfig, IoMode};
pub use cache::ActivationCache;
pub use classes::{
    ClassId, ALL_PROBES_KEY, FEMALE, FEMALE_CLASS, MALE, MALE_CLASS, NEGATIVE_CLASS_LABEL,
    NURSE_CLASS, PAIRED_CLASS_KEYS, POSITIVE_CLASS_LABEL, PROFESSIONS, PROFESSOR_CLASS,
};
pub use corpus::{
    load_text_inputs, parquet_split_file, truncate_inputs, BiasInBios, BioExample, Split,
    PARQUET_REVISION,
};
pub use error::{ProbeError, Result};
pub use evaluation::{
    ae_group_paths, ae_paths, eval_saes, evaluate, AeGroup, EvalConfig, EvalHyperparameters,
    EvalResults, SubmoduleTrainers,
};
pub use experiment::{Experiment, ExperimentConfig, ExperimentResults};
pub use forward_llama::{LlamaConfig, LlamaStack};
pub use masks::{clear_mask_caches, create_batch_mask, create_causal_mask, create_padding_mask};
pub use model::{
    ActivationModel, LayerBackend, LayerCapture, ModelArchitecture, ModelEvalConfig, PoolFn,
    ProbeModel,
};
pub use probe::{
    get_probe_test_accuracy, load_probes, probe_checkpoint_path, save_probes, test_probe,
    train_probe, EpochStats, Probe, ProbeBatches, ProbeResults, ProbeTrainConfig, TrainedProbe,
};
pub use probe_data::prepare_probe_data;
pub use sae::{load_dictionary, AutoEncoder, Dictionary, DictionaryConfig, TrainerConfig};
