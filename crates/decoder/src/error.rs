//! Error type shared by the decoder crate.

use attention::AttentionError;
use layers::{GemmAlgorithm, OperationType};
use thiserror::Error;

use crate::gemm::GemmSite;

pub type Result<T> = std::result::Result<T, DecoderError>;

#[derive(Error, Debug)]
pub enum DecoderError {
    #[error("invalid shape: {0}")]
    InvalidShape(String),

    #[error("GEMM algorithm {algorithm} for the {site} site is not usable with {precision}")]
    InvalidAlgorithm {
        site: GemmSite,
        algorithm: GemmAlgorithm,
        precision: OperationType,
    },

    #[error("workspace error: {0}")]
    Workspace(String),

    #[error("decoder step used before initialize")]
    NotInitialized,

    #[error("step {step} is outside max_seq_len {max_seq_len}")]
    StepOutOfRange { step: usize, max_seq_len: usize },

    #[error("invalid step input: {0}")]
    InvalidInput(String),

    #[error("failed to parse config: {0}")]
    ConfigFormat(String),

    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("compute error: {0}")]
    Compute(#[from] candle_core::Error),

    #[error("attention error: {0}")]
    Attention(#[from] AttentionError),
}

impl From<toml::de::Error> for DecoderError {
    fn from(value: toml::de::Error) -> Self {
        DecoderError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for DecoderError {
    fn from(value: serde_json::Error) -> Self {
        DecoderError::ConfigFormat(value.to_string())
    }
}
