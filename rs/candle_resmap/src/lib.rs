//! ResMap: spatial feature maps for person re-identification
//!
//! A ResNet-50 (optionally IBN-a / IBN-b) truncated at a named stage, an
//! optional 3x3 neck convolution, and an optional transformer encoder whose
//! per-layer outputs are concatenated onto the backbone features.

pub mod config;
pub mod debug;
pub mod error;
pub mod model;
pub mod preprocess;
pub mod weights;

pub use config::{IbnMode, PreprocessMode, ResMapConfig};
pub use error::{ConfigError, ConfigWarning};
pub use model::backbone::{Backbone, StageInfo};
pub use model::resnet::{ResNet, RESNET50_STAGES};
pub use model::ResMap;
