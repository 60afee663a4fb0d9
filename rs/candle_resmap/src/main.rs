//! ResMap feature extraction with Candle
//!
//! This binary builds the ResMap model and runs it on images (`extract`) or on
//! a random batch (`shapes`).

#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

#[cfg(feature = "accelerate")]
extern crate accelerate_src;

mod cmd_extract;
mod cmd_shapes;

use std::path::PathBuf;
use std::time::Instant;

use anyhow::Context;
use candle_core::{DType, Device, Result};
use candle_nn::{VarBuilder, VarMap};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use candle_resmap::weights::{self, IBN_NET_RELEASES};
use candle_resmap::{IbnMode, ResMap, ResMapConfig, ResNet, RESNET50_STAGES};

/// Hub repository holding the torchvision ResNet-50 weights in safetensors format
const PRETRAINED_REPO: &str = "timm/resnet50.tv_in1k";
const PRETRAINED_FILE: &str = "model.safetensors";

/// Select the compute device
pub fn device(cpu: bool) -> Result<Device> {
    if cpu {
        Ok(Device::Cpu)
    } else if candle_core::utils::cuda_is_available() {
        Ok(Device::new_cuda(0)?)
    } else if candle_core::utils::metal_is_available() {
        Ok(Device::new_metal(0)?)
    } else {
        #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
        {
            tracing::info!("Running on CPU, to run on GPU(metal), build with `--features metal`");
        }
        #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
        {
            tracing::info!("Running on CPU, to run on GPU, build with `--features cuda`");
        }
        Ok(Device::Cpu)
    }
}

/// Configuration presets
#[derive(Clone, Copy, ValueEnum, Debug)]
enum Which {
    /// layer3, neck 512, 2 encoder layers
    Default,
    /// layer3, neck 128, 6 encoder layers
    Transmatcher,
}

impl Which {
    fn config(&self) -> ResMapConfig {
        match self {
            Which::Default => ResMapConfig::default(),
            Which::Transmatcher => ResMapConfig::transmatcher(),
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Run on CPU rather than on GPU.
    #[arg(long, global = true)]
    cpu: bool,

    /// Configuration preset, ignored when --config is given.
    #[arg(long, value_enum, default_value_t = Which::Transmatcher, global = true)]
    which: Which,

    /// JSON configuration file; missing fields take their defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Full model weights, safetensors or PyTorch .pth (backbone under `base.`).
    #[arg(long, global = true)]
    weights: Option<PathBuf>,

    /// Backbone-only weights with torchvision / IBN-Net naming, safetensors or
    /// PyTorch .pth (e.g. resnet50_ibn_b-9ca61e85.pth).
    #[arg(long, global = true)]
    backbone_weights: Option<PathBuf>,

    /// Last backbone stage to run.
    #[arg(long, global = true)]
    final_layer: Option<String>,

    /// Neck width, 0 disables the neck.
    #[arg(long, global = true)]
    neck: Option<usize>,

    /// Attention heads per encoder layer.
    #[arg(long, global = true)]
    nhead: Option<usize>,

    /// Number of encoder layers, 0 disables the encoder.
    #[arg(long, global = true)]
    num_encoder_layers: Option<usize>,

    /// Hidden width of the encoder feed-forward block.
    #[arg(long, global = true)]
    dim_feedforward: Option<usize>,

    /// Backbone normalization variant.
    #[arg(long, value_enum, global = true)]
    ibn: Option<IbnMode>,

    /// Start from random backbone weights.
    #[arg(long, global = true)]
    no_pretrained: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Extract feature maps from images
    Extract(cmd_extract::ExtractArgs),
    /// Run a random batch through the model and report the output shape
    Shapes(cmd_shapes::ShapesArgs),
}

impl Cli {
    /// Base configuration with command line overrides applied
    fn model_config(&self) -> anyhow::Result<ResMapConfig> {
        let mut config = match &self.config {
            Some(path) => ResMapConfig::from_json_file(path)?,
            None => self.which.config(),
        };
        if let Some(final_layer) = &self.final_layer {
            config.final_layer = final_layer.clone();
        }
        if let Some(neck) = self.neck {
            config.neck = neck;
        }
        if let Some(nhead) = self.nhead {
            config.nhead = nhead;
        }
        if let Some(num_encoder_layers) = self.num_encoder_layers {
            config.num_encoder_layers = num_encoder_layers;
        }
        if let Some(dim_feedforward) = self.dim_feedforward {
            config.dim_feedforward = dim_feedforward;
        }
        if let Some(ibn) = self.ibn {
            config.ibn = ibn;
        }
        if self.no_pretrained {
            config.pretrained = false;
        }
        Ok(config)
    }

    /// Path of the pretrained backbone weights, downloading them when needed
    fn backbone_weights_path(&self, ibn: IbnMode) -> anyhow::Result<PathBuf> {
        if let Some(path) = &self.backbone_weights {
            return Ok(path.clone());
        }
        if ibn != IbnMode::None {
            anyhow::bail!(
                "IBN-{} backbone weights are not on the hub, download resnet50_ibn_{}-*.pth \
                from {} and pass it with --backbone-weights, or use --ibn none / --no-pretrained",
                ibn.as_str(),
                ibn.as_str(),
                IBN_NET_RELEASES
            );
        }
        let api = hf_hub::api::sync::Api::new()?;
        let path = api
            .model(PRETRAINED_REPO.to_string())
            .get(PRETRAINED_FILE)
            .with_context(|| format!("failed to fetch {PRETRAINED_REPO}/{PRETRAINED_FILE}"))?;
        Ok(path)
    }
}

/// Build the model according to the weight flags
///
/// - `--weights`: every parameter comes from one checkpoint
/// - pretrained: backbone from its own checkpoint, neck and encoder random
/// - otherwise everything random
fn load_model(cli: &Cli, config: &ResMapConfig, device: &Device) -> anyhow::Result<ResMap> {
    // Fail on a bad configuration before anything is downloaded
    config.validate(&RESNET50_STAGES)?;

    if let Some(path) = &cli.weights {
        tracing::info!("Loading model from: {:?}", path);
        let vb = weights::var_builder(path, DType::F32, device)?;
        return Ok(ResMap::load(vb, config)?);
    }

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
    if config.pretrained {
        let path = cli.backbone_weights_path(config.ibn)?;
        tracing::info!("Loading backbone from: {:?}", path);
        let backbone_vb = weights::var_builder(&path, DType::F32, device)?;
        let backbone = ResNet::load(backbone_vb, config.ibn)?;
        Ok(ResMap::new(backbone, vb, config)?)
    } else {
        tracing::info!("Initializing all weights randomly");
        Ok(ResMap::load(vb, config)?)
    }
}

pub fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let device = device(cli.cpu)?;
    tracing::info!("Using device: {:?}", device);

    let config = cli.model_config()?;
    tracing::info!(
        "Model config: final_layer={}, neck={}, ibn={}, nhead={}, encoder_layers={}, dim_feedforward={}",
        config.final_layer,
        config.neck,
        config.ibn.as_str(),
        config.nhead,
        config.num_encoder_layers,
        config.dim_feedforward
    );

    let start = Instant::now();
    let model = load_model(&cli, &config, &device)?;
    tracing::info!(
        "Model loaded in {:?}, backbone ibn={}, output channels {}, stride {}",
        start.elapsed(),
        model.backbone().ibn().as_str(),
        model.out_channels(),
        model.stride()
    );

    match &cli.command {
        Command::Extract(args) => cmd_extract::run(args, &model, &device),
        Command::Shapes(args) => cmd_shapes::run(args, &model, &device),
    }
}
