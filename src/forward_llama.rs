//! LLaMA-family decoder stack that stops at a requested layer
//!
//! Runs right-padded batches with a combined causal + key-padding mask and
//! returns the residual stream around the requested layer. Covers LLaMA
//! (no projection bias) and Qwen2 (bias on Q/K/V); no LM head is loaded.

use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::{embedding, linear_b, linear_no_bias, Embedding, Linear, RmsNorm, VarBuilder};
use hf_hub::api::sync::ApiRepo;
use tracing::info;

use crate::error::{ProbeError, Result};
use crate::masks::create_batch_mask;
use crate::model::{LayerBackend, ModelArchitecture};

/// Model configuration (subset of HuggingFace config.json)
#[derive(Debug, Clone, serde::Deserialize)]
pub struct LlamaConfig {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_attention_heads: usize,
    #[serde(default)]
    pub num_key_value_heads: Option<usize>,
    #[serde(default)]
    pub head_dim: Option<usize>,
    pub num_hidden_layers: usize,
    pub vocab_size: usize,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
}

fn default_rope_theta() -> f64 {
    10_000.0
}

fn default_rms_norm_eps() -> f64 {
    1e-5
}

fn default_max_position_embeddings() -> usize {
    2048
}

impl LlamaConfig {
    fn head_dim(&self) -> usize {
        self.head_dim
            .unwrap_or(self.hidden_size / self.num_attention_heads)
    }

    fn num_kv_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }
}

/// Rotary position embeddings, rotate-half layout
struct RotaryEmbedding {
    /// `[max_position, head_dim / 2]`
    cos: Tensor,
    sin: Tensor,
}

impl RotaryEmbedding {
    fn new(head_dim: usize, max_position: usize, theta: f64, device: &Device, dtype: DType) -> Result<Self> {
        let half_dim = head_dim / 2;
        let inv_freq: Vec<f32> = (0..half_dim)
            .map(|i| (1.0 / theta.powf(2.0 * i as f64 / head_dim as f64)) as f32)
            .collect();
        let inv_freq = Tensor::from_vec(inv_freq, (1, half_dim), device)?;
        let positions: Vec<f32> = (0..max_position).map(|p| p as f32).collect();
        let positions = Tensor::from_vec(positions, (max_position, 1), device)?;

        let freqs = positions.matmul(&inv_freq)?;
        Ok(Self {
            cos: freqs.cos()?.to_dtype(dtype)?,
            sin: freqs.sin()?.to_dtype(dtype)?,
        })
    }

    /// `x`: `[batch, heads, seq, head_dim]`
    fn apply(&self, x: &Tensor) -> Result<Tensor> {
        let (_, _, seq_len, head_dim) = x.dims4()?;
        let half_dim = head_dim / 2;
        let cos = self.cos.narrow(0, 0, seq_len)?.unsqueeze(0)?.unsqueeze(0)?;
        let sin = self.sin.narrow(0, 0, seq_len)?.unsqueeze(0)?.unsqueeze(0)?;

        let x1 = x.narrow(D::Minus1, 0, half_dim)?;
        let x2 = x.narrow(D::Minus1, half_dim, half_dim)?;
        let rotated_x1 = (x1.broadcast_mul(&cos)? - x2.broadcast_mul(&sin)?)?;
        let rotated_x2 = (x1.broadcast_mul(&sin)? + x2.broadcast_mul(&cos)?)?;
        Ok(Tensor::cat(&[&rotated_x1, &rotated_x2], D::Minus1)?)
    }
}

struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
}

impl Attention {
    fn load(vb: VarBuilder, config: &LlamaConfig, bias: bool) -> Result<Self> {
        let head_dim = config.head_dim();
        let num_kv_heads = config.num_kv_heads();
        let q_proj = linear_b(
            config.hidden_size,
            config.num_attention_heads * head_dim,
            bias,
            vb.pp("q_proj"),
        )?;
        let k_proj = linear_b(config.hidden_size, num_kv_heads * head_dim, bias, vb.pp("k_proj"))?;
        let v_proj = linear_b(config.hidden_size, num_kv_heads * head_dim, bias, vb.pp("v_proj"))?;
        let o_proj = linear_no_bias(
            config.num_attention_heads * head_dim,
            config.hidden_size,
            vb.pp("o_proj"),
        )?;

        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            o_proj,
            num_heads: config.num_attention_heads,
            num_kv_heads,
            head_dim,
        })
    }

    /// `mask`: additive `[batch, 1, seq, seq]`
    fn forward(&self, x: &Tensor, rotary: &RotaryEmbedding, mask: &Tensor) -> Result<Tensor> {
        let (b, seq_len, _) = x.dims3()?;

        let q = self
            .q_proj
            .forward(x)?
            .reshape((b, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let k = self
            .k_proj
            .forward(x)?
            .reshape((b, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let v = self
            .v_proj
            .forward(x)?
            .reshape((b, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        let q = rotary.apply(&q)?;
        let k = rotary.apply(&k)?;

        let n_rep = self.num_heads / self.num_kv_heads;
        let k = repeat_kv(k, n_rep)?.contiguous()?;
        let v = repeat_kv(v, n_rep)?.contiguous()?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let scores = (q.matmul(&k.transpose(2, 3)?.contiguous()?)? * scale)?;
        let scores = scores.broadcast_add(mask)?;
        let weights = candle_nn::ops::softmax_last_dim(&scores)?;
        let out = weights.matmul(&v)?;

        let out = out.transpose(1, 2)?.reshape((b, seq_len, ()))?;
        Ok(self.o_proj.forward(&out)?)
    }
}

fn repeat_kv(x: Tensor, n_rep: usize) -> Result<Tensor> {
    if n_rep == 1 {
        return Ok(x);
    }
    let (b, num_kv_heads, seq_len, head_dim) = x.dims4()?;
    let x = x
        .unsqueeze(2)?
        .expand((b, num_kv_heads, n_rep, seq_len, head_dim))?;
    Ok(x.reshape((b, num_kv_heads * n_rep, seq_len, head_dim))?)
}

/// SwiGLU feed-forward block
struct Mlp {
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
}

impl Mlp {
    fn load(vb: VarBuilder, config: &LlamaConfig) -> Result<Self> {
        Ok(Self {
            gate_proj: linear_no_bias(config.hidden_size, config.intermediate_size, vb.pp("gate_proj"))?,
            up_proj: linear_no_bias(config.hidden_size, config.intermediate_size, vb.pp("up_proj"))?,
            down_proj: linear_no_bias(config.intermediate_size, config.hidden_size, vb.pp("down_proj"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let gate = candle_nn::ops::silu(&self.gate_proj.forward(x)?)?;
        let up = self.up_proj.forward(x)?;
        Ok(self.down_proj.forward(&(gate * up)?)?)
    }
}

struct DecoderLayer {
    self_attn: Attention,
    mlp: Mlp,
    input_layernorm: RmsNorm,
    post_attention_layernorm: RmsNorm,
}

impl DecoderLayer {
    fn load(vb: VarBuilder, config: &LlamaConfig, bias: bool) -> Result<Self> {
        Ok(Self {
            self_attn: Attention::load(vb.pp("self_attn"), config, bias)?,
            mlp: Mlp::load(vb.pp("mlp"), config)?,
            input_layernorm: candle_nn::rms_norm(
                config.hidden_size,
                config.rms_norm_eps,
                vb.pp("input_layernorm"),
            )?,
            post_attention_layernorm: candle_nn::rms_norm(
                config.hidden_size,
                config.rms_norm_eps,
                vb.pp("post_attention_layernorm"),
            )?,
        })
    }

    fn forward(&self, x: &Tensor, rotary: &RotaryEmbedding, mask: &Tensor) -> Result<Tensor> {
        let residual = x;
        let h = self.input_layernorm.forward(x)?;
        let h = self.self_attn.forward(&h, rotary, mask)?;
        let x = (residual + h)?;

        let residual = &x;
        let h = self.post_attention_layernorm.forward(&x)?;
        let h = self.mlp.forward(&h)?;
        Ok((residual + h)?)
    }
}

/// Safetensors index for sharded models
#[derive(Debug, serde::Deserialize)]
struct SafetensorsIndex {
    weight_map: std::collections::HashMap<String, String>,
}

/// Embedding plus decoder layers of a LLaMA-family model
pub struct LlamaStack {
    embed_tokens: Embedding,
    layers: Vec<DecoderLayer>,
    rotary: RotaryEmbedding,
    hidden_size: usize,
    dtype: DType,
}

impl LlamaStack {
    /// Load config and weights from a HuggingFace model repository
    pub fn load(
        repo: &ApiRepo,
        device: &Device,
        dtype: DType,
        architecture: ModelArchitecture,
    ) -> Result<Self> {
        let hub = |name: &str| {
            repo.get(name)
                .map_err(|e| ProbeError::Hub(format!("failed to download {name}: {e}")))
        };

        let config_str = std::fs::read_to_string(hub("config.json")?)?;
        let config: LlamaConfig = serde_json::from_str(&config_str)?;
        info!(
            "Model config: {} layers, {} hidden, {} vocab",
            config.num_hidden_layers, config.hidden_size, config.vocab_size
        );

        let weights_paths = match hub("model.safetensors.index.json") {
            Ok(index_path) => {
                let index: SafetensorsIndex =
                    serde_json::from_str(&std::fs::read_to_string(index_path)?)?;
                let mut shard_names: Vec<String> = index.weight_map.into_values().collect();
                shard_names.sort();
                shard_names.dedup();
                info!("Downloading {} shard files...", shard_names.len());
                shard_names
                    .iter()
                    .map(|name| hub(name))
                    .collect::<Result<Vec<_>>>()?
            }
            Err(_) => vec![hub("model.safetensors")?],
        };

        // SAFETY: the files are not modified while mapped
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&weights_paths, dtype, device)? };
        Self::from_var_builder(vb.pp("model"), &config, architecture, device, dtype)
    }

    /// Build from a `VarBuilder` rooted at the `model` prefix
    pub fn from_var_builder(
        vb: VarBuilder,
        config: &LlamaConfig,
        architecture: ModelArchitecture,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let embed_tokens = embedding(config.vocab_size, config.hidden_size, vb.pp("embed_tokens"))?;
        let bias = architecture.attention_bias();

        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for i in 0..config.num_hidden_layers {
            layers.push(DecoderLayer::load(vb.pp(format!("layers.{i}")), config, bias)?);
        }

        let rotary = RotaryEmbedding::new(
            config.head_dim(),
            config.max_position_embeddings,
            config.rope_theta,
            device,
            dtype,
        )?;

        info!("Loaded {} decoder layers", layers.len());
        Ok(Self {
            embed_tokens,
            layers,
            rotary,
            hidden_size: config.hidden_size,
            dtype,
        })
    }
}

impl LayerBackend for LlamaStack {
    fn n_layers(&self) -> usize {
        self.layers.len()
    }

    fn d_model(&self) -> usize {
        self.hidden_size
    }

    fn run_to_layer(
        &self,
        input_ids: &Tensor,
        attention_mask: &Tensor,
        layer: usize,
    ) -> Result<(Tensor, Tensor)> {
        if layer >= self.layers.len() {
            return Err(ProbeError::Config(format!(
                "layer {layer} out of range ({} layers)",
                self.layers.len()
            )));
        }
        let mask = create_batch_mask(attention_mask, self.dtype)?;
        let mut hidden = self.embed_tokens.forward(input_ids)?;
        for block in &self.layers[..layer] {
            hidden = block.forward(&hidden, &self.rotary, &mask)?;
        }
        let output = self.layers[layer].forward(&hidden, &self.rotary, &mask)?;
        Ok((hidden, output))
    }
}
