//! Extract subcommand: feature maps for a list of images.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Instant;

use candle_core::{Device, Tensor};
use clap::Args;

use candle_resmap::debug::TensorStats;
use candle_resmap::preprocess;
use candle_resmap::ResMap;

/// Arguments for the extract subcommand
#[derive(Args, Debug)]
pub struct ExtractArgs {
    /// Input images to process.
    #[arg(required = true)]
    pub images: Vec<PathBuf>,
    /// Save the feature maps to this safetensors file, under the key `features`.
    #[arg(long)]
    pub output: Option<PathBuf>,
    /// Number of images per forward pass.
    #[arg(long, default_value_t = 16)]
    pub batch_size: usize,
}

/// Run the extract subcommand
pub fn run(args: &ExtractArgs, model: &ResMap, device: &Device) -> anyhow::Result<()> {
    if args.batch_size == 0 {
        anyhow::bail!("--batch-size must be at least 1");
    }
    let config = model.config();
    let (height, width) = config.transform_output_size();
    tracing::info!(
        "Extracting features from {} images at {}x{}",
        args.images.len(),
        height,
        width
    );

    let start = Instant::now();
    let mut outputs = Vec::with_capacity(args.images.len().div_ceil(args.batch_size));
    for chunk in args.images.chunks(args.batch_size) {
        let images = chunk
            .iter()
            .map(|path| preprocess::preprocess_image(path, config, device))
            .collect::<anyhow::Result<Vec<_>>>()?;
        let batch = preprocess::stack_batch(&images)?;

        let features = model.forward_t(&batch, false)?;
        tracing::debug!("batch {:?} -> {:?}", batch.dims(), features.dims());
        outputs.push(features);
    }
    let features = Tensor::cat(&outputs, 0)?;
    tracing::info!("Inference completed in {:?}", start.elapsed());

    let stats = TensorStats::from_tensor(&features)?;
    tracing::info!(
        "features: shape={:?}, min={:.6}, max={:.6}, mean={:.6}, std={:.6}",
        stats.shape,
        stats.min,
        stats.max,
        stats.mean,
        stats.std
    );

    if let Some(output) = &args.output {
        let tensors = HashMap::from([("features".to_string(), features)]);
        candle_core::safetensors::save(&tensors, output)?;
        tracing::info!("Feature maps saved to: {:?}", output);
    }

    Ok(())
}
