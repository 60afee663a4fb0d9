//! Checkpoint loading
//!
//! Full-model checkpoints are exported as safetensors. Pretrained IBN-Net
//! backbones are distributed as PyTorch pickles (`resnet50_ibn_b-9ca61e85.pth`)
//! whose state-dict names already match [`crate::model::resnet::ResNet`].

use std::path::Path;

use candle_core::{DType, Device, Result};
use candle_nn::VarBuilder;

/// Release page for the IBN-Net ImageNet checkpoints
pub const IBN_NET_RELEASES: &str = "https://github.com/XingangPan/IBN-Net/releases";

/// On-disk format of a weight file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightFormat {
    Safetensors,
    /// PyTorch pickle (`torch.save` of a state dict)
    Pth,
}

impl WeightFormat {
    /// Detect the format from the file extension
    pub fn from_path(path: &Path) -> Result<Self> {
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase());
        match extension.as_deref() {
            Some("safetensors") => Ok(Self::Safetensors),
            Some("pth" | "pt") => Ok(Self::Pth),
            _ => candle_core::bail!(
                "unrecognized weight file {}, expected .safetensors, .pth or .pt",
                path.display()
            ),
        }
    }
}

/// Open a weight file as a VarBuilder, dispatching on its extension
pub fn var_builder(path: &Path, dtype: DType, device: &Device) -> Result<VarBuilder<'static>> {
    match WeightFormat::from_path(path)? {
        WeightFormat::Safetensors => unsafe {
            VarBuilder::from_mmaped_safetensors(&[path], dtype, device)
        },
        WeightFormat::Pth => VarBuilder::from_pth(path, dtype, device),
    }
}
