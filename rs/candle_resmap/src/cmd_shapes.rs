//! Shapes subcommand: push a random batch through the model.

use std::time::Instant;

use candle_core::{Device, Tensor};
use clap::Args;

use candle_resmap::ResMap;

/// Arguments for the shapes subcommand
#[derive(Args, Debug)]
pub struct ShapesArgs {
    /// Number of images in the random batch.
    #[arg(long, default_value_t = 64)]
    pub batch_size: usize,
    /// Input height, defaults to the configured transform output.
    #[arg(long)]
    pub height: Option<usize>,
    /// Input width, defaults to the configured transform output.
    #[arg(long)]
    pub width: Option<usize>,
}

/// Run the shapes subcommand
pub fn run(args: &ShapesArgs, model: &ResMap, device: &Device) -> anyhow::Result<()> {
    let (default_h, default_w) = model.config().transform_output_size();
    let height = args.height.unwrap_or(default_h);
    let width = args.width.unwrap_or(default_w);

    let input = Tensor::rand(0f32, 1f32, (args.batch_size, 3, height, width), device)?;
    tracing::info!("Input shape: {:?}", input.dims());

    let start = Instant::now();
    let output = model.forward_t(&input, false)?;
    tracing::info!("Output shape: {:?} in {:?}", output.dims(), start.elapsed());

    let expected = model.output_shape(args.batch_size, height, width);
    if output.dims() != expected {
        anyhow::bail!(
            "output shape {:?} does not match expected {:?}",
            output.dims(),
            expected
        );
    }

    Ok(())
}
