//! Error types for bias-probes.

use crate::classes::ClassId;

/// Errors raised by the probing and evaluation pipelines.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    /// Tensor operation or model forward pass error (wraps candle).
    #[error("model error: {0}")]
    Model(#[from] candle_core::Error),

    /// Tokenizer failure.
    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    /// Hugging Face hub download failure.
    #[error("hub error: {0}")]
    Hub(String),

    /// Malformed model, dictionary or corpus configuration.
    #[error("config error: {0}")]
    Config(String),

    /// A paired class id without a registered partner.
    #[error("class index {0} is not a valid class index")]
    InvalidClass(ClassId),

    /// Caller broke an input contract (mixed batch kinds, unequal batch counts, ...).
    #[error("contract violation: {0}")]
    Contract(String),

    /// Internal invariant failed (group sizes, sampled shapes).
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// Code path that is deliberately not supported.
    #[error("not implemented: {0}")]
    NotImplemented(&'static str),

    /// Masked mean-pooling over a sequence with no unmasked tokens.
    #[error("example {index} has an empty attention mask")]
    EmptyAttentionMask {
        /// Position of the offending example in the input.
        index: usize,
    },

    /// The activation buffer produced no activations to evaluate.
    #[error("activation buffer is empty")]
    EmptyBuffer,

    /// JSON (de)serialization error.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Safetensors parsing error.
    #[error(transparent)]
    Safetensors(#[from] safetensors::SafeTensorError),

    /// Parquet decoding error.
    #[error(transparent)]
    Parquet(#[from] parquet::errors::ParquetError),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type alias for bias-probes operations.
pub type Result<T> = std::result::Result<T, ProbeError>;
