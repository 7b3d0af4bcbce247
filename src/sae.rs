//! Sparse autoencoder dictionaries
//!
//! Loads a trained ReLU sparse autoencoder from a trainer directory holding
//! `ae.safetensors` and `config.json`:
//!
//! ```text
//! {ae_path}/
//!   ae.safetensors   encoder.weight [dict, d]  encoder.bias [dict]
//!                    decoder.weight [d, dict]  bias [d]
//!   config.json      {"trainer": {"activation_dim": d, "dict_size": dict, "layer": l, ...}}
//! ```

use std::path::Path;

use candle_core::{DType, Device, Tensor};
use safetensors::tensor::SafeTensors;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{ProbeError, Result};

/// Weights file inside a trainer directory
pub const AE_WEIGHTS_FILE: &str = "ae.safetensors";
/// Config file inside a trainer directory
pub const AE_CONFIG_FILE: &str = "config.json";

/// Trainer section of a dictionary's `config.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainerConfig {
    pub activation_dim: usize,
    pub dict_size: usize,
    #[serde(default)]
    pub layer: Option<usize>,
    #[serde(default)]
    pub lm_name: Option<String>,
    #[serde(default)]
    pub submodule_name: Option<String>,
}

/// A dictionary's `config.json`; fields other than `trainer` are ignored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DictionaryConfig {
    pub trainer: TrainerConfig,
}

impl DictionaryConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// Maps activations to a sparse feature code and back.
pub trait Dictionary {
    fn activation_dim(&self) -> usize;
    fn dict_size(&self) -> usize;

    /// Features `[n, dict_size]` for activations `[n, activation_dim]`
    fn encode(&self, x: &Tensor) -> Result<Tensor>;

    /// Reconstruction `[n, activation_dim]` from features `[n, dict_size]`
    fn decode(&self, f: &Tensor) -> Result<Tensor>;

    /// Reconstruction and features
    fn forward(&self, x: &Tensor) -> Result<(Tensor, Tensor)> {
        let f = self.encode(x)?;
        let x_hat = self.decode(&f)?;
        Ok((x_hat, f))
    }
}

/// `f = relu(W_enc (x - b_dec) + b_enc)`, `x_hat = W_dec f + b_dec`
#[derive(Debug, Clone)]
pub struct AutoEncoder {
    encoder_weight: Tensor,
    encoder_bias: Tensor,
    decoder_weight: Tensor,
    bias: Tensor,
}

impl AutoEncoder {
    /// Build from raw weights, checking their shapes agree
    pub fn from_tensors(
        encoder_weight: Tensor,
        encoder_bias: Tensor,
        decoder_weight: Tensor,
        bias: Tensor,
    ) -> Result<Self> {
        let (dict_size, activation_dim) = encoder_weight.dims2()?;
        let expected: [(&str, &Tensor, &[usize]); 3] = [
            ("encoder.bias", &encoder_bias, &[dict_size]),
            ("decoder.weight", &decoder_weight, &[activation_dim, dict_size]),
            ("bias", &bias, &[activation_dim]),
        ];
        for (name, tensor, shape) in expected {
            if tensor.dims() != shape {
                return Err(ProbeError::Config(format!(
                    "{name} has shape {:?}, expected {shape:?}",
                    tensor.dims()
                )));
            }
        }
        Ok(Self {
            encoder_weight: encoder_weight.to_dtype(DType::F32)?,
            encoder_bias: encoder_bias.to_dtype(DType::F32)?,
            decoder_weight: decoder_weight.to_dtype(DType::F32)?,
            bias: bias.to_dtype(DType::F32)?,
        })
    }

    /// Load `ae.safetensors` from a trainer directory
    pub fn load(ae_path: &Path, device: &Device) -> Result<Self> {
        let data = std::fs::read(ae_path.join(AE_WEIGHTS_FILE))?;
        let st = SafeTensors::deserialize(&data)?;
        let get = |name: &str| -> Result<Tensor> { tensor_from_view(&st.tensor(name)?, device) };
        Self::from_tensors(
            get("encoder.weight")?,
            get("encoder.bias")?,
            get("decoder.weight")?,
            get("bias")?,
        )
    }
}

impl Dictionary for AutoEncoder {
    fn activation_dim(&self) -> usize {
        self.bias.dims()[0]
    }

    fn dict_size(&self) -> usize {
        self.encoder_bias.dims()[0]
    }

    fn encode(&self, x: &Tensor) -> Result<Tensor> {
        let x = x.to_dtype(DType::F32)?.broadcast_sub(&self.bias)?;
        Ok(x
            .matmul(&self.encoder_weight.t()?)?
            .broadcast_add(&self.encoder_bias)?
            .relu()?)
    }

    fn decode(&self, f: &Tensor) -> Result<Tensor> {
        Ok(f
            .matmul(&self.decoder_weight.t()?)?
            .broadcast_add(&self.bias)?)
    }
}

/// Load a trainer directory: the autoencoder and its config
pub fn load_dictionary(ae_path: &Path, device: &Device) -> Result<(AutoEncoder, DictionaryConfig)> {
    let config = DictionaryConfig::from_file(&ae_path.join(AE_CONFIG_FILE))?;
    let ae = AutoEncoder::load(ae_path, device)?;
    if ae.activation_dim() != config.trainer.activation_dim
        || ae.dict_size() != config.trainer.dict_size
    {
        return Err(ProbeError::Config(format!(
            "{}: weights are {}x{} but config says {}x{}",
            ae_path.display(),
            ae.activation_dim(),
            ae.dict_size(),
            config.trainer.activation_dim,
            config.trainer.dict_size
        )));
    }
    info!(
        "Loaded dictionary {} ({} -> {})",
        ae_path.display(),
        ae.activation_dim(),
        ae.dict_size()
    );
    Ok((ae, config))
}

fn tensor_from_view(view: &safetensors::tensor::TensorView<'_>, device: &Device) -> Result<Tensor> {
    let shape: Vec<usize> = view.shape().to_vec();
    let dtype = match view.dtype() {
        safetensors::Dtype::BF16 => DType::BF16,
        safetensors::Dtype::F16 => DType::F16,
        safetensors::Dtype::F32 => DType::F32,
        other => {
            return Err(ProbeError::Config(format!(
                "unsupported dictionary tensor dtype: {other:?}"
            )))
        }
    };
    Ok(Tensor::from_raw_buffer(view.data(), dtype, &shape, device)?)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Identity-like autoencoder on `dim` features with 2 * dim latents
    /// (`x -> [relu(x), relu(-x)] -> x`).
    pub(crate) fn write_identity_ae(dir: &Path, dim: usize) {
        let device = Device::Cpu;
        let eye = Tensor::eye(dim, DType::F32, &device).unwrap();
        let enc = Tensor::cat(&[&eye, &eye.neg().unwrap()], 0).unwrap();
        let dec = enc.t().unwrap().contiguous().unwrap();
        let mut tensors = HashMap::new();
        tensors.insert("encoder.weight".to_string(), enc);
        tensors.insert(
            "encoder.bias".to_string(),
            Tensor::zeros(2 * dim, DType::F32, &device).unwrap(),
        );
        tensors.insert("decoder.weight".to_string(), dec);
        tensors.insert(
            "bias".to_string(),
            Tensor::zeros(dim, DType::F32, &device).unwrap(),
        );
        std::fs::create_dir_all(dir).unwrap();
        candle_core::safetensors::save(&tensors, dir.join(AE_WEIGHTS_FILE)).unwrap();
        let config = serde_json::json!({
            "trainer": {"activation_dim": dim, "dict_size": 2 * dim, "layer": 1, "lr": 1e-3},
            "buffer": {"ctx_len": 128}
        });
        std::fs::write(dir.join(AE_CONFIG_FILE), config.to_string()).unwrap();
    }

    #[test]
    fn test_load_and_reconstruct() {
        let dir = tempfile::tempdir().unwrap();
        write_identity_ae(dir.path(), 3);

        let (ae, config) = load_dictionary(dir.path(), &Device::Cpu).unwrap();
        assert_eq!(config.trainer.activation_dim, 3);
        assert_eq!(config.trainer.layer, Some(1));
        assert_eq!(ae.dict_size(), 6);

        let x = Tensor::new(&[[1f32, -2.0, 0.5]], &Device::Cpu).unwrap();
        let (x_hat, f) = ae.forward(&x).unwrap();
        assert_eq!(
            f.to_vec2::<f32>().unwrap(),
            vec![vec![1.0, 0.0, 0.5, 0.0, 2.0, 0.0]]
        );
        assert_eq!(x_hat.to_vec2::<f32>().unwrap(), x.to_vec2::<f32>().unwrap());
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let device = Device::Cpu;
        let err = AutoEncoder::from_tensors(
            Tensor::zeros((4, 2), DType::F32, &device).unwrap(),
            Tensor::zeros(4, DType::F32, &device).unwrap(),
            Tensor::zeros((4, 2), DType::F32, &device).unwrap(),
            Tensor::zeros(2, DType::F32, &device).unwrap(),
        )
        .unwrap_err();
        assert!(matches!(err, ProbeError::Config(_)));
    }

    #[test]
    fn test_missing_config_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_dictionary(dir.path(), &Device::Cpu).unwrap_err();
        assert!(matches!(err, ProbeError::Io(_)));
    }
}
