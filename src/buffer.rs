//! Streaming buffer of token-level activations
//!
//! Holds up to `n_ctxs * ctx_len` activations of real (unpadded) tokens.
//! Batches are drawn at random from the unread rows; when fewer than half of
//! the rows are unread, the buffer is topped up from the text stream.

use std::fmt;
use std::str::FromStr;

use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::index;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ProbeError, Result};
use crate::model::ActivationModel;

/// Which side of the layer the buffer records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IoMode {
    /// Layer output: rows are `[d]`
    #[default]
    Out,
    /// Layer input and output, for transcoders: rows are `[2, d]`
    InAndOut,
}

impl fmt::Display for IoMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoMode::Out => write!(f, "out"),
            IoMode::InAndOut => write!(f, "in_and_out"),
        }
    }
}

impl FromStr for IoMode {
    type Err = ProbeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "out" => Ok(IoMode::Out),
            "in_and_out" => Ok(IoMode::InAndOut),
            other => Err(ProbeError::Config(format!("unknown io mode: {other}"))),
        }
    }
}

/// Sizing of an [`ActivationBuffer`]
#[derive(Debug, Clone)]
pub struct BufferConfig {
    /// Number of contexts the buffer holds
    pub n_ctxs: usize,
    /// Tokens kept per text
    pub ctx_len: usize,
    /// Texts per model forward pass when refilling
    pub refresh_batch_size: usize,
    /// Rows per yielded batch
    pub out_batch_size: usize,
    pub io: IoMode,
    pub seed: u64,
}

impl BufferConfig {
    /// Capacity in token activations
    pub fn capacity(&self) -> usize {
        self.n_ctxs * self.ctx_len
    }
}

/// Iterator over shuffled activation batches `[out_batch_size, d]`
/// (or `[out_batch_size, 2, d]` in [`IoMode::InAndOut`])
pub struct ActivationBuffer<'a, I: Iterator<Item = String>> {
    data: I,
    model: &'a dyn ActivationModel,
    layer: usize,
    config: BufferConfig,
    activations: Option<Tensor>,
    read: Vec<bool>,
    rng: StdRng,
    exhausted: bool,
}

impl<'a, I: Iterator<Item = String>> ActivationBuffer<'a, I> {
    pub fn new(data: I, model: &'a dyn ActivationModel, layer: usize, config: BufferConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            data,
            model,
            layer,
            config,
            activations: None,
            read: Vec::new(),
            rng,
            exhausted: false,
        }
    }

    /// Rows currently held, read or not
    pub fn len(&self) -> usize {
        self.read.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read.is_empty()
    }

    fn unread(&self) -> Vec<u32> {
        self.read
            .iter()
            .enumerate()
            .filter(|(_, read)| !**read)
            .map(|(i, _)| i as u32)
            .collect()
    }

    fn device(&self) -> &Device {
        self.model.device()
    }

    /// Drop read rows and top up from the text stream
    fn refresh(&mut self) -> Result<()> {
        let unread = self.unread();
        let mut parts = Vec::new();
        let mut held = unread.len();
        if let Some(acts) = &self.activations {
            if held > 0 {
                let idx = Tensor::from_vec(unread, held, self.device())?;
                parts.push(acts.index_select(&idx, 0)?);
            }
        }

        while held < self.config.capacity() {
            let texts: Vec<String> = self
                .data
                .by_ref()
                .take(self.config.refresh_batch_size)
                .collect();
            if texts.is_empty() {
                self.exhausted = true;
                break;
            }
            let rows = self.token_activations(&texts)?;
            held += rows.dim(0)?;
            parts.push(rows);
        }

        self.activations = if parts.is_empty() {
            None
        } else {
            Some(Tensor::cat(&parts, 0)?)
        };
        self.read = vec![false; held];
        debug!("Activation buffer refreshed: {held} rows");
        Ok(())
    }

    /// Activations of every unpadded token of a batch of texts
    fn token_activations(&self, texts: &[String]) -> Result<Tensor> {
        let capture = self
            .model
            .capture_layer(texts, self.layer, self.config.ctx_len)?;
        let (b, seq, d) = capture.output.dims3()?;
        let keep: Vec<u32> = capture
            .attention_mask
            .flatten_all()?
            .to_vec1::<u32>()?
            .iter()
            .enumerate()
            .filter(|(_, m)| **m != 0)
            .map(|(i, _)| i as u32)
            .collect();
        let n_keep = keep.len();
        let keep = Tensor::from_vec(keep, n_keep, self.device())?;

        let select = |t: &Tensor| -> Result<Tensor> {
            Ok(t.to_dtype(candle_core::DType::F32)?
                .reshape((b * seq, d))?
                .index_select(&keep, 0)?)
        };
        match self.config.io {
            IoMode::Out => select(&capture.output),
            IoMode::InAndOut => Ok(Tensor::stack(
                &[select(&capture.input)?, select(&capture.output)?],
                1,
            )?),
        }
    }

    fn next_batch(&mut self) -> Result<Option<Tensor>> {
        if !self.exhausted && self.unread().len() < self.config.capacity().div_ceil(2) {
            self.refresh()?;
        }
        let unread = self.unread();
        let Some(acts) = &self.activations else {
            return Ok(None);
        };
        if unread.is_empty() {
            return Ok(None);
        }

        let n = self.config.out_batch_size.min(unread.len());
        let picked: Vec<u32> = index::sample(&mut self.rng, unread.len(), n)
            .into_iter()
            .map(|i| unread[i])
            .collect();
        for &i in &picked {
            self.read[i as usize] = true;
        }
        let idx = Tensor::from_vec(picked, n, acts.device())?;
        Ok(Some(acts.index_select(&idx, 0)?))
    }
}

impl<I: Iterator<Item = String>> Iterator for ActivationBuffer<'_, I> {
    type Item = Result<Tensor>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_batch().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TextLengthModel;

    fn config(n_ctxs: usize, ctx_len: usize, out_batch_size: usize, io: IoMode) -> BufferConfig {
        BufferConfig {
            n_ctxs,
            ctx_len,
            refresh_batch_size: 2,
            out_batch_size,
            io,
            seed: 0,
        }
    }

    fn texts(lengths: &[usize]) -> Vec<String> {
        lengths.iter().map(|&n| "x".repeat(n)).collect()
    }

    #[test]
    fn test_yields_every_token_once() {
        let model = TextLengthModel::new(3);
        let data = texts(&[2, 5, 1, 4, 3]);
        let buffer = ActivationBuffer::new(data.into_iter(), &model, 0, config(2, 4, 3, IoMode::Out));

        let batches: Vec<Tensor> = buffer.collect::<Result<_>>().unwrap();
        // ctx_len 4 truncates the 5-char text: 2 + 4 + 1 + 4 + 3 tokens
        let rows: usize = batches.iter().map(|b| b.dim(0).unwrap()).sum();
        assert_eq!(rows, 14);

        let mut firsts: Vec<f32> = batches
            .iter()
            .flat_map(|b| b.to_vec2::<f32>().unwrap())
            .map(|r| r[0])
            .collect();
        firsts.sort_by(f32::total_cmp);
        let mut expected = vec![2.0, 2.0, 4.0, 4.0, 4.0, 4.0, 1.0];
        expected.extend([4.0; 4]);
        expected.extend([3.0; 3]);
        expected.sort_by(f32::total_cmp);
        assert_eq!(firsts, expected);
    }

    #[test]
    fn test_in_and_out_rows() {
        let model = TextLengthModel::new(2);
        let data = texts(&[3]);
        let mut buffer =
            ActivationBuffer::new(data.into_iter(), &model, 1, config(1, 8, 8, IoMode::InAndOut));
        let batch = buffer.next().unwrap().unwrap();
        assert_eq!(batch.dims(), &[3, 2, 2]);
        let row = batch.get(0).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(row, vec![vec![2.0, 2.0], vec![3.0, 3.0]]);
        assert!(buffer.next().is_none());
    }

    #[test]
    fn test_empty_stream_yields_nothing() {
        let model = TextLengthModel::new(2);
        let mut buffer = ActivationBuffer::new(
            Vec::<String>::new().into_iter(),
            &model,
            0,
            config(4, 8, 2, IoMode::Out),
        );
        assert!(buffer.next().is_none());
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_io_mode_parse() {
        assert_eq!("out".parse::<IoMode>().unwrap(), IoMode::Out);
        assert_eq!("in_and_out".parse::<IoMode>().unwrap(), IoMode::InAndOut);
        assert!("sideways".parse::<IoMode>().is_err());
        assert_eq!(IoMode::InAndOut.to_string(), "in_and_out");
    }
}
