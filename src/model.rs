//! Model wrapper exposing per-layer activations for padded text batches
//!
//! The probing and evaluation code only sees the [`ActivationModel`]
//! capability; [`ProbeModel`] is the concrete implementation backed by a
//! tokenizer and a decoder stack loaded from HuggingFace.

use candle_core::{DType, Device, Tensor};
use hf_hub::{api::sync::Api, Repo, RepoType};
use tokenizers::Tokenizer;
use tracing::info;

use crate::error::{ProbeError, Result};
use crate::forward_llama::LlamaStack;

/// Residual stream around one layer for a padded batch
#[derive(Debug, Clone)]
pub struct LayerCapture {
    /// Residual stream entering the layer: `[batch, seq, d_model]`
    pub input: Tensor,
    /// Residual stream leaving the layer: `[batch, seq, d_model]`
    pub output: Tensor,
    /// 1 for real tokens, 0 for padding: `[batch, seq]`
    pub attention_mask: Tensor,
}

/// Reduces `(hidden [batch, seq, d], mask [batch, seq])` to `[batch, d]`
pub type PoolFn = fn(&Tensor, &Tensor) -> Result<Tensor>;

/// Run a forward pass and expose a layer's hidden states and padding mask.
pub trait ActivationModel {
    /// HuggingFace id (or any name) of the model
    fn model_id(&self) -> &str;
    fn n_layers(&self) -> usize;
    fn d_model(&self) -> usize;
    fn device(&self) -> &Device;

    /// Tokenize `texts` (truncated to `context_length` tokens, right padded)
    /// and run the model up to and including `layer`.
    fn capture_layer(
        &self,
        texts: &[String],
        layer: usize,
        context_length: usize,
    ) -> Result<LayerCapture>;

    /// Capture `layer` and reduce it to one vector per text with `pool`
    fn forward_and_pool(
        &self,
        texts: &[String],
        layer: usize,
        context_length: usize,
        pool: PoolFn,
    ) -> Result<Tensor> {
        let capture = self.capture_layer(texts, layer, context_length)?;
        pool(&capture.output, &capture.attention_mask)
    }
}

/// Decoder stack that can stop after a given layer.
pub trait LayerBackend {
    fn n_layers(&self) -> usize;
    fn d_model(&self) -> usize;

    /// Returns the residual stream entering and leaving `layer`.
    ///
    /// `input_ids` and `attention_mask` are `[batch, seq]`.
    fn run_to_layer(
        &self,
        input_ids: &Tensor,
        attention_mask: &Tensor,
        layer: usize,
    ) -> Result<(Tensor, Tensor)>;
}

/// Supported model architectures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelArchitecture {
    /// LLaMA family (LLaMA, SmolLM, TinyLlama, Mistral-style configs)
    Llama,
    /// Qwen2 / Qwen2.5: LLaMA layout plus bias on Q/K/V
    Qwen2,
}

impl ModelArchitecture {
    /// Detect architecture from model ID
    pub fn from_model_id(model_id: &str) -> Self {
        if model_id.to_lowercase().contains("qwen") {
            ModelArchitecture::Qwen2
        } else {
            ModelArchitecture::Llama
        }
    }

    /// Whether the attention projections carry a bias
    pub fn attention_bias(self) -> bool {
        matches!(self, ModelArchitecture::Qwen2)
    }
}

/// Probe settings for a model: residual width and which layer to read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelEvalConfig {
    pub model_id: String,
    pub activation_dim: usize,
    pub probe_layer: usize,
}

impl ModelEvalConfig {
    /// Known models and the layer probed on each
    const KNOWN: [(&'static str, usize, usize); 3] = [
        ("HuggingFaceTB/SmolLM2-135M", 576, 15),
        ("HuggingFaceTB/SmolLM2-360M", 960, 16),
        ("Qwen/Qwen2.5-0.5B", 896, 12),
    ];

    /// Settings for a model listed in the table
    pub fn from_full_model_name(model_id: &str) -> Option<Self> {
        Self::KNOWN
            .iter()
            .find(|(name, _, _)| *name == model_id)
            .map(|&(name, activation_dim, probe_layer)| Self {
                model_id: name.to_string(),
                activation_dim,
                probe_layer,
            })
    }

    /// Settings for a loaded model; unknown models are probed at the middle layer
    pub fn for_model(model: &dyn ActivationModel) -> Self {
        Self::from_full_model_name(model.model_id()).unwrap_or_else(|| Self {
            model_id: model.model_id().to_string(),
            activation_dim: model.d_model(),
            probe_layer: model.n_layers() / 2,
        })
    }
}

/// Tokenizer plus decoder stack, loaded from HuggingFace
pub struct ProbeModel {
    backend: Box<dyn LayerBackend>,
    tokenizer: Tokenizer,
    pad_id: u32,
    device: Device,
    architecture: ModelArchitecture,
    model_id: String,
}

impl ProbeModel {
    /// Load a model from HuggingFace (tries CUDA, falls back to CPU)
    pub fn from_pretrained(model_id: &str) -> Result<Self> {
        Self::from_pretrained_with_device(model_id, false)
    }

    /// Load with explicit device choice
    pub fn from_pretrained_with_device(model_id: &str, force_cpu: bool) -> Result<Self> {
        let (device, dtype) = if force_cpu {
            info!("Forcing CPU mode");
            (Device::Cpu, DType::F32)
        } else {
            match Device::cuda_if_available(0) {
                Ok(dev) if dev.is_cuda() => {
                    info!("Using CUDA device");
                    (dev, DType::BF16)
                }
                _ => {
                    info!("CUDA not available, using CPU");
                    (Device::Cpu, DType::F32)
                }
            }
        };

        let architecture = ModelArchitecture::from_model_id(model_id);
        info!("Loading model: {model_id} ({architecture:?}, {dtype:?})");

        let api = Api::new().map_err(|e| ProbeError::Hub(e.to_string()))?;
        let repo = api.repo(Repo::new(model_id.to_string(), RepoType::Model));
        let tokenizer_path = repo
            .get("tokenizer.json")
            .map_err(|e| ProbeError::Hub(format!("failed to download tokenizer.json: {e}")))?;
        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| ProbeError::Tokenizer(e.to_string()))?;

        let backend = LlamaStack::load(&repo, &device, dtype, architecture)?;

        Ok(Self::new(
            Box::new(backend),
            tokenizer,
            device,
            architecture,
            model_id,
        ))
    }

    /// Wrap an already built backend
    pub fn new(
        backend: Box<dyn LayerBackend>,
        tokenizer: Tokenizer,
        device: Device,
        architecture: ModelArchitecture,
        model_id: &str,
    ) -> Self {
        let pad_id = pad_token_id(&tokenizer);
        Self {
            backend,
            tokenizer,
            pad_id,
            device,
            architecture,
            model_id: model_id.to_string(),
        }
    }

    pub fn architecture(&self) -> ModelArchitecture {
        self.architecture
    }

    /// Tokenize a batch into right-padded `(input_ids, attention_mask)`
    ///
    /// Each text keeps at most `context_length` tokens. A batch whose texts all
    /// tokenize to nothing still gets one (padding) column.
    pub fn tokenize_batch(&self, texts: &[String], context_length: usize) -> Result<(Tensor, Tensor)> {
        let mut rows = Vec::with_capacity(texts.len());
        for text in texts {
            let encoding = self
                .tokenizer
                .encode(text.as_str(), true)
                .map_err(|e| ProbeError::Tokenizer(e.to_string()))?;
            let ids: Vec<u32> = encoding
                .get_ids()
                .iter()
                .take(context_length)
                .copied()
                .collect();
            rows.push(ids);
        }
        pad_batch(&rows, self.pad_id, &self.device)
    }
}

impl ActivationModel for ProbeModel {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn n_layers(&self) -> usize {
        self.backend.n_layers()
    }

    fn d_model(&self) -> usize {
        self.backend.d_model()
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn capture_layer(
        &self,
        texts: &[String],
        layer: usize,
        context_length: usize,
    ) -> Result<LayerCapture> {
        if layer >= self.n_layers() {
            return Err(ProbeError::Config(format!(
                "layer {layer} out of range ({} layers)",
                self.n_layers()
            )));
        }
        let (input_ids, attention_mask) = self.tokenize_batch(texts, context_length)?;
        let (input, output) = self
            .backend
            .run_to_layer(&input_ids, &attention_mask, layer)?;
        Ok(LayerCapture {
            input,
            output,
            attention_mask,
        })
    }
}

/// Padding token id: the tokenizer's own, else a common special token, else 0
fn pad_token_id(tokenizer: &Tokenizer) -> u32 {
    tokenizer
        .get_padding()
        .map(|p| p.pad_id)
        .or_else(|| tokenizer.token_to_id("<|endoftext|>"))
        .or_else(|| tokenizer.token_to_id("</s>"))
        .or_else(|| tokenizer.token_to_id("<pad>"))
        .unwrap_or(0)
}

/// Right-pad token rows into `[batch, max_len]` ids and a 0/1 mask
pub(crate) fn pad_batch(rows: &[Vec<u32>], pad_id: u32, device: &Device) -> Result<(Tensor, Tensor)> {
    let max_len = rows.iter().map(Vec::len).max().unwrap_or(0).max(1);
    let mut ids = Vec::with_capacity(rows.len() * max_len);
    let mut mask = Vec::with_capacity(rows.len() * max_len);
    for row in rows {
        ids.extend_from_slice(row);
        ids.extend(std::iter::repeat(pad_id).take(max_len - row.len()));
        mask.extend(std::iter::repeat(1u32).take(row.len()));
        mask.extend(std::iter::repeat(0u32).take(max_len - row.len()));
    }
    let shape = (rows.len(), max_len);
    Ok((
        Tensor::from_vec(ids, shape, device)?,
        Tensor::from_vec(mask, shape, device)?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_architecture_detection() {
        assert_eq!(
            ModelArchitecture::from_model_id("Qwen/Qwen2.5-0.5B"),
            ModelArchitecture::Qwen2
        );
        assert_eq!(
            ModelArchitecture::from_model_id("HuggingFaceTB/SmolLM2-135M"),
            ModelArchitecture::Llama
        );
        assert!(ModelArchitecture::Qwen2.attention_bias());
        assert!(!ModelArchitecture::Llama.attention_bias());
    }

    #[test]
    fn test_known_model_config() {
        let config = ModelEvalConfig::from_full_model_name("HuggingFaceTB/SmolLM2-135M").unwrap();
        assert_eq!(config.activation_dim, 576);
        assert_eq!(config.probe_layer, 15);
        assert!(ModelEvalConfig::from_full_model_name("unknown/model").is_none());
    }

    #[test]
    fn test_pad_batch() {
        let rows = vec![vec![5, 6, 7], vec![8]];
        let (ids, mask) = pad_batch(&rows, 0, &Device::Cpu).unwrap();
        assert_eq!(
            ids.to_vec2::<u32>().unwrap(),
            vec![vec![5, 6, 7], vec![8, 0, 0]]
        );
        assert_eq!(
            mask.to_vec2::<u32>().unwrap(),
            vec![vec![1, 1, 1], vec![1, 0, 0]]
        );
    }

    #[test]
    fn test_pad_batch_all_empty_keeps_one_column() {
        let rows = vec![vec![], vec![]];
        let (ids, mask) = pad_batch(&rows, 2, &Device::Cpu).unwrap();
        assert_eq!(ids.dims(), &[2, 1]);
        assert_eq!(mask.to_vec2::<u32>().unwrap(), vec![vec![0], vec![0]]);
    }
}
