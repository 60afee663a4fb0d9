//! Configuration errors and warnings
//!
//! Model code reports failures through `candle_core::Result`. Problems found
//! while validating a [`crate::config::ResMapConfig`] are typed here so that
//! callers can match on them before any weights are touched.

use std::path::PathBuf;

use thiserror::Error;

/// A configuration that cannot be turned into a model.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown final layer `{name}`, expected one of: {}", .available.join(", "))]
    UnknownStage {
        name: String,
        available: Vec<String>,
    },

    #[error("nhead must be at least 1")]
    ZeroHeads,

    #[error("model width {d_model} is not divisible by nhead {nhead}")]
    HeadsDoNotDivide { d_model: usize, nhead: usize },

    #[error("dropout must be in [0, 1), got {0}")]
    InvalidDropout(f32),

    #[error("dim_feedforward must be at least 1")]
    ZeroFeedForward,

    #[error("input size must be non-zero, got {0}x{1}")]
    ZeroInputSize(usize, usize),

    #[error("failed to read config file {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// A configuration that is usable but probably not what was intended.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigWarning {
    #[error(
        "input size {}x{} differs from the center-crop transform output {}x{}",
        .configured.0, .configured.1, .transform.0, .transform.1
    )]
    InputSizeMismatch {
        configured: (usize, usize),
        transform: (usize, usize),
    },

    #[error(
        "input size {}x{} is not a multiple of the `{stage}` stride {stride}, the last feature row or column covers a partial window",
        .input.0, .input.1
    )]
    StrideRemainder {
        input: (usize, usize),
        stage: String,
        stride: usize,
    },
}
