//! ResMap Model Configuration
//!
//! This module defines the construction parameters of the feature extractor,
//! the presets used for re-identification, and validation against the stage
//! list declared by a backbone.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigWarning};
use crate::model::backbone::StageInfo;

/// Shorter-side length of the center-crop transform.
pub const CENTER_CROP_RESIZE: usize = 256;

/// Side length of the center-crop transform output.
pub const CENTER_CROP_SIZE: usize = 224;

/// Input resolution (height, width) used for person re-identification.
pub const REID_INPUT_SIZE: (usize, usize) = (384, 128);

/// Normalization variant of the ResNet-50 backbone
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum IbnMode {
    /// Plain torchvision ResNet-50, BatchNorm everywhere
    None,
    /// IBN-a: half instance / half batch norm inside the bottlenecks of layer1-3
    A,
    /// IBN-b: instance norm in the stem and after the residual sums of layer1-2
    #[default]
    B,
}

impl IbnMode {
    pub fn as_str(self) -> &'static str {
        match self {
            IbnMode::None => "none",
            IbnMode::A => "a",
            IbnMode::B => "b",
        }
    }
}

/// How images are turned into model input
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum PreprocessMode {
    /// Resize directly to `input_size`
    #[default]
    Reid,
    /// Resize the shorter side to 256, then center-crop 224x224
    CenterCrop,
}

/// Configuration for the ResMap feature extractor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResMapConfig {
    // Backbone adapter configuration
    /// Name of the last backbone stage to run (inclusive)
    pub final_layer: String,
    /// Output width of the 3x3 neck convolution, 0 disables the neck
    pub neck: usize,
    /// Normalization variant of the backbone
    pub ibn: IbnMode,
    /// Whether the backbone starts from pretrained weights
    pub pretrained: bool,

    // Encoder configuration
    /// Number of attention heads per encoder layer
    pub nhead: usize,
    /// Number of encoder layers, 0 disables the encoder
    pub num_encoder_layers: usize,
    /// Hidden width of the encoder feed-forward block
    pub dim_feedforward: usize,
    /// Dropout rate inside the encoder layers
    pub dropout: f32,
    /// Whether a LayerNorm is applied to every recorded encoder output
    pub encoder_norm: bool,

    // Input configuration
    /// Model input resolution (height, width)
    pub input_size: (usize, usize),
    /// Image preprocessing transform
    pub preprocess: PreprocessMode,
}

impl Default for ResMapConfig {
    fn default() -> Self {
        Self {
            final_layer: "layer3".to_string(),
            neck: 512,
            ibn: IbnMode::B,
            pretrained: true,
            nhead: 1,
            num_encoder_layers: 2,
            dim_feedforward: 2048,
            dropout: 0.0,
            encoder_norm: false,
            input_size: REID_INPUT_SIZE,
            preprocess: PreprocessMode::Reid,
        }
    }
}

/// Result of validating a configuration against a backbone
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedConfig {
    /// Index of `final_layer` in the backbone stage list
    pub stage_index: usize,
    /// The stage `final_layer` resolved to
    pub stage: StageInfo,
    /// Channel width seen by the encoder (neck width or stage width)
    pub d_model: usize,
    /// Non-fatal findings
    pub warnings: Vec<ConfigWarning>,
}

impl ResMapConfig {
    /// Layer3 features, a 128-wide neck and six encoder layers
    pub fn transmatcher() -> Self {
        Self {
            neck: 128,
            num_encoder_layers: 6,
            ..Self::default()
        }
    }

    /// Load a configuration from a JSON file; missing fields take their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&contents).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Size (height, width) of the tensors produced by the preprocessing transform
    pub fn transform_output_size(&self) -> (usize, usize) {
        match self.preprocess {
            PreprocessMode::Reid => self.input_size,
            PreprocessMode::CenterCrop => (CENTER_CROP_SIZE, CENTER_CROP_SIZE),
        }
    }

    /// Channel width after the backbone adapter
    pub fn d_model(&self, stage: &StageInfo) -> usize {
        if self.neck > 0 {
            self.neck
        } else {
            stage.out_channels
        }
    }

    /// Check this configuration against the stages a backbone declares.
    ///
    /// Fails on anything that would make construction or the forward pass
    /// meaningless; returns warnings for suspicious but usable settings.
    pub fn validate(&self, stages: &[StageInfo]) -> Result<ValidatedConfig, ConfigError> {
        let stage_index = stages
            .iter()
            .position(|stage| stage.name == self.final_layer)
            .ok_or_else(|| ConfigError::UnknownStage {
                name: self.final_layer.clone(),
                available: stages.iter().map(|s| s.name.to_string()).collect(),
            })?;
        let stage = stages[stage_index];
        let d_model = self.d_model(&stage);

        if self.num_encoder_layers > 0 {
            if self.nhead == 0 {
                return Err(ConfigError::ZeroHeads);
            }
            if d_model % self.nhead != 0 {
                return Err(ConfigError::HeadsDoNotDivide {
                    d_model,
                    nhead: self.nhead,
                });
            }
            if self.dim_feedforward == 0 {
                return Err(ConfigError::ZeroFeedForward);
            }
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(ConfigError::InvalidDropout(self.dropout));
        }

        let (height, width) = self.input_size;
        if height == 0 || width == 0 {
            return Err(ConfigError::ZeroInputSize(height, width));
        }

        let mut warnings = Vec::new();
        if self.preprocess == PreprocessMode::CenterCrop
            && self.input_size != (CENTER_CROP_SIZE, CENTER_CROP_SIZE)
        {
            warnings.push(ConfigWarning::InputSizeMismatch {
                configured: self.input_size,
                transform: (CENTER_CROP_SIZE, CENTER_CROP_SIZE),
            });
        }
        let (in_h, in_w) = self.transform_output_size();
        if in_h % stage.stride != 0 || in_w % stage.stride != 0 {
            warnings.push(ConfigWarning::StrideRemainder {
                input: (in_h, in_w),
                stage: stage.name.to_string(),
                stride: stage.stride,
            });
        }

        Ok(ValidatedConfig {
            stage_index,
            stage,
            d_model,
            warnings,
        })
    }

    /// Output channel width: backbone features plus one block per encoder layer
    pub fn out_channels(&self, stage: &StageInfo) -> usize {
        let d_model = self.d_model(stage);
        d_model + d_model * self.num_encoder_layers
    }
}
