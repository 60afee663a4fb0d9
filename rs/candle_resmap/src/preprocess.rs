//! Image Preprocessing for ResMap
//!
//! This module handles the preprocessing pipeline for input images:
//! 1. Load image and convert to tensor (RGB, CHW format, values in [0, 1])
//! 2. Resize, either directly to the re-id input size or shorter side to 256
//!    followed by a 224x224 center crop
//! 3. Normalize using ImageNet mean and std

use std::path::Path;

use anyhow::Context;
use candle_core::{Device, Result, Tensor};
use image::DynamicImage;

use crate::config::{PreprocessMode, ResMapConfig, CENTER_CROP_RESIZE, CENTER_CROP_SIZE};
use crate::debug::log_tensor_stats;

/// ImageNet normalization mean values (RGB order)
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];

/// ImageNet normalization std values (RGB order)
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

pub fn load_image(path: &Path) -> anyhow::Result<DynamicImage> {
    image::open(path).with_context(|| format!("failed to open image {}", path.display()))
}

/// Convert a DynamicImage to a tensor in CHW format with values in [0, 1]
///
/// This corresponds to PyTorch's `torchvision.transforms.functional.to_tensor`
///
/// # Returns
/// Tensor of shape [3, H, W] with values in [0.0, 1.0]
pub fn image_to_tensor(img: &DynamicImage, device: &Device) -> Result<Tensor> {
    let img = img.to_rgb8();
    let (width, height) = img.dimensions();

    // Raw bytes are HWC, row by row
    let hwc = Tensor::from_vec(
        img.into_raw(),
        (height as usize, width as usize, 3),
        device,
    )?;
    hwc.permute((2, 0, 1))?.to_dtype(candle_core::DType::F32)? / 255.0
}

/// Normalize a [3, H, W] tensor using ImageNet mean and std
///
/// Formula: output = (input - mean) / std
pub fn normalize(tensor: &Tensor) -> Result<Tensor> {
    let device = tensor.device();
    let mean = Tensor::from_slice(&IMAGENET_MEAN, (3, 1, 1), device)?;
    let std = Tensor::from_slice(&IMAGENET_STD, (3, 1, 1), device)?;
    tensor.broadcast_sub(&mean)?.broadcast_div(&std)
}

/// Resize a [3, H, W] tensor to (height, width) using bilinear interpolation
pub fn resize(tensor: &Tensor, target_size: (usize, usize)) -> Result<Tensor> {
    let (target_h, target_w) = target_size;
    let _ = tensor.dims3()?;

    // upsample_bilinear2d expects [N, C, H, W]; align_corners = false
    tensor
        .unsqueeze(0)?
        .upsample_bilinear2d(target_h, target_w, false)?
        .squeeze(0)
}

/// Output size when the shorter side of a (height, width) image is scaled to `size`.
///
/// The longer side keeps the aspect ratio and is truncated, as torchvision does.
/// Both sides must be non-zero.
fn shorter_side_size(height: usize, width: usize, size: usize) -> (usize, usize) {
    if height <= width {
        (size, size * width / height)
    } else {
        (size * height / width, size)
    }
}

/// Top-left corner of a centered (crop_h, crop_w) window.
///
/// Halves are rounded to even, matching torchvision's `center_crop`. The crop
/// must fit inside the image.
fn center_crop_offset(
    height: usize,
    width: usize,
    crop_h: usize,
    crop_w: usize,
) -> (usize, usize) {
    let top = ((height - crop_h) as f64 / 2.0).round_ties_even() as usize;
    let left = ((width - crop_w) as f64 / 2.0).round_ties_even() as usize;
    (top, left)
}

/// Crop the center (crop_h, crop_w) window of a [3, H, W] tensor
pub fn center_crop(tensor: &Tensor, crop_size: (usize, usize)) -> Result<Tensor> {
    let (_, height, width) = tensor.dims3()?;
    let (crop_h, crop_w) = crop_size;
    if crop_h > height || crop_w > width {
        candle_core::bail!("crop {crop_h}x{crop_w} larger than image {height}x{width}");
    }
    let (top, left) = center_crop_offset(height, width, crop_h, crop_w);
    tensor.narrow(1, top, crop_h)?.narrow(2, left, crop_w)
}

/// Apply the configured transform to a [3, H, W] tensor in [0, 1]
///
/// # Returns
/// Normalized tensor of shape [3, h, w] with (h, w) = `config.transform_output_size()`
pub fn transform(tensor: &Tensor, config: &ResMapConfig) -> Result<Tensor> {
    let (_, h, w) = tensor.dims3()?;
    if h == 0 || w == 0 {
        candle_core::bail!("cannot transform an empty {h}x{w} image");
    }
    let resized = match config.preprocess {
        PreprocessMode::Reid => resize(tensor, config.input_size)?,
        PreprocessMode::CenterCrop => {
            let resized = resize(tensor, shorter_side_size(h, w, CENTER_CROP_RESIZE))?;
            center_crop(&resized, (CENTER_CROP_SIZE, CENTER_CROP_SIZE))?
        }
    };
    normalize(&resized)
}

/// Full preprocessing pipeline: load, convert to tensor, resize, and normalize
///
/// # Returns
/// Tensor of shape [3, h, w] ready to be batched
pub fn preprocess_image(
    image_path: &Path,
    config: &ResMapConfig,
    device: &Device,
) -> anyhow::Result<Tensor> {
    let img = load_image(image_path)?;

    let tensor = image_to_tensor(&img, device)?;
    log_tensor_stats(&tensor, "input_image_raw")?;

    let transformed = transform(&tensor, config)?;
    log_tensor_stats(&transformed, "input_image_transformed")?;

    Ok(transformed)
}

/// Stack preprocessed [3, H, W] images into a [N, 3, H, W] batch
pub fn stack_batch(images: &[Tensor]) -> Result<Tensor> {
    Tensor::stack(images, 0)
}
