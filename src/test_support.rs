//! Lightweight model double for unit tests

use candle_core::{Device, Tensor};

use crate::error::{ProbeError, Result};
use crate::model::{pad_batch, ActivationModel, LayerCapture};

/// One token per character; every hidden feature of a text equals its token
/// count, so mean pooling yields the (truncated) text length. The layer input
/// is the output minus one.
pub(crate) struct TextLengthModel {
    d_model: usize,
    n_layers: usize,
    device: Device,
}

impl TextLengthModel {
    pub(crate) fn new(d_model: usize) -> Self {
        Self {
            d_model,
            n_layers: 4,
            device: Device::Cpu,
        }
    }
}

impl ActivationModel for TextLengthModel {
    fn model_id(&self) -> &str {
        "test/text-length"
    }

    fn n_layers(&self) -> usize {
        self.n_layers
    }

    fn d_model(&self) -> usize {
        self.d_model
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
        if layer >= self.n_layers {
            return Err(ProbeError::Config(format!("layer {layer} out of range")));
        }
        let rows: Vec<Vec<u32>> = texts
            .iter()
            .map(|t| t.chars().take(context_length).map(|c| c as u32).collect())
            .collect();
        let (_, attention_mask) = pad_batch(&rows, 0, &self.device)?;
        let seq = attention_mask.dim(1)?;

        let mut values = Vec::with_capacity(rows.len() * seq * self.d_model);
        for row in &rows {
            values.extend(std::iter::repeat(row.len() as f32).take(seq * self.d_model));
        }
        let output = Tensor::from_vec(values, (rows.len(), seq, self.d_model), &self.device)?;
        let input = (&output - 1.0)?;
        Ok(LayerCapture {
            input,
            output,
            attention_mask,
        })
    }
}
