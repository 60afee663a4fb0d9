//! ResNet-50 backbone with instance-batch normalization variants
//!
//! Implements torchvision's ResNet-50 (stride on the 3x3 convolution) and the
//! IBN-a / IBN-b variants from IBN-Net. Only the convolutional trunk is
//! built: the pooling and classifier heads have no use in a feature map
//! extractor and are not declared as stages.
//!
//! Weight names follow the PyTorch state dict:
//! - `conv1.weight`, `bn1.*`
//! - `layer{1..4}.{block}.conv{1,2,3}.weight`, `.bn{1,2,3}.*`
//! - `layer{1..4}.0.downsample.{0,1}.*`
//! - IBN-a: `layer{1..3}.{block}.bn1.IN.*` and `.bn1.BN.*`
//! - IBN-b: `bn1.{weight,bias}` (instance norm), `layer{1,2}.{last}.IN.*`

use candle_core::{Module, ModuleT, Result, Tensor, D};
use candle_nn::{BatchNorm, Conv2d, Conv2dConfig, Init, VarBuilder};

use crate::config::IbnMode;
use crate::model::backbone::{Backbone, StageInfo};

/// Stages of ResNet-50, in execution order
pub const RESNET50_STAGES: [StageInfo; 8] = [
    StageInfo::new("conv1", 64, 2),
    StageInfo::new("bn1", 64, 2),
    StageInfo::new("relu", 64, 2),
    StageInfo::new("maxpool", 64, 4),
    StageInfo::new("layer1", 256, 4),
    StageInfo::new("layer2", 512, 8),
    StageInfo::new("layer3", 1024, 16),
    StageInfo::new("layer4", 2048, 32),
];

/// Bottleneck blocks per layer
const RESNET50_BLOCKS: [usize; 4] = [3, 4, 6, 3];

const BOTTLENECK_EXPANSION: usize = 4;

const NORM_EPS: f64 = 1e-5;

/// 2D Instance Normalization with affine parameters
///
/// Normalizes every (batch, channel) plane over its spatial positions.
#[derive(Debug, Clone)]
pub struct InstanceNorm2d {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl InstanceNorm2d {
    pub fn load(vb: VarBuilder, channels: usize, eps: f64) -> Result<Self> {
        let weight = vb.get_with_hints(channels, "weight", Init::Const(1.0))?;
        let bias = vb.get_with_hints(channels, "bias", Init::Const(0.0))?;
        Ok(Self { weight, bias, eps })
    }
}

impl Module for InstanceNorm2d {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (b, c, h, w) = x.dims4()?;

        // [B, C, H, W] -> [B, C, H*W]
        let x = x.reshape((b, c, h * w))?;
        let mean = x.mean_keepdim(D::Minus1)?;
        let x_centered = x.broadcast_sub(&mean)?;
        let var = x_centered.sqr()?.mean_keepdim(D::Minus1)?;
        let x_normed = x_centered.broadcast_div(&(var + self.eps)?.sqrt()?)?;
        let x_normed = x_normed.reshape((b, c, h, w))?;

        let weight = self.weight.reshape((1, c, 1, 1))?;
        let bias = self.bias.reshape((1, c, 1, 1))?;
        x_normed.broadcast_mul(&weight)?.broadcast_add(&bias)
    }
}

/// IBN-a normalization: instance norm on the first half of the channels,
/// batch norm on the rest
#[derive(Debug, Clone)]
pub struct Ibn {
    half: usize,
    instance_norm: InstanceNorm2d,
    batch_norm: BatchNorm,
}

impl Ibn {
    pub fn load(vb: VarBuilder, planes: usize) -> Result<Self> {
        let half = planes / 2;
        let instance_norm = InstanceNorm2d::load(vb.pp("IN"), half, NORM_EPS)?;
        let batch_norm = candle_nn::batch_norm(planes - half, NORM_EPS, vb.pp("BN"))?;
        Ok(Self {
            half,
            instance_norm,
            batch_norm,
        })
    }
}

impl ModuleT for Ibn {
    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let channels = x.dim(1)?;
        let first = x.narrow(1, 0, self.half)?.contiguous()?;
        let rest = x.narrow(1, self.half, channels - self.half)?.contiguous()?;
        let first = self.instance_norm.forward(&first)?;
        let rest = rest.apply_t(&self.batch_norm, train)?;
        Tensor::cat(&[&first, &rest], 1)
    }
}

/// Normalization layer slot that differs between the ResNet variants
#[derive(Debug, Clone)]
pub enum Norm {
    Batch(BatchNorm),
    Instance(InstanceNorm2d),
    Ibn(Ibn),
}

impl ModuleT for Norm {
    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        match self {
            Norm::Batch(bn) => x.apply_t(bn, train),
            Norm::Instance(norm) => norm.forward(x),
            Norm::Ibn(ibn) => ibn.forward_t(x, train),
        }
    }
}

/// Per-block choice of IBN placement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockIbn {
    None,
    /// IBN in place of `bn1`
    A,
    /// Instance norm after the residual sum
    B,
}

/// Residual shortcut projection (1x1 conv + batch norm)
#[derive(Debug, Clone)]
struct Downsample {
    conv: Conv2d,
    bn: BatchNorm,
}

impl Downsample {
    fn load(vb: VarBuilder, in_channels: usize, out_channels: usize, stride: usize) -> Result<Self> {
        let conv_config = Conv2dConfig {
            stride,
            ..Default::default()
        };
        let conv =
            candle_nn::conv2d_no_bias(in_channels, out_channels, 1, conv_config, vb.pp("0"))?;
        let bn = candle_nn::batch_norm(out_channels, NORM_EPS, vb.pp("1"))?;
        Ok(Self { conv, bn })
    }
}

impl ModuleT for Downsample {
    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        x.apply(&self.conv)?.apply_t(&self.bn, train)
    }
}

/// ResNet bottleneck block: 1x1 reduce, 3x3 (strided), 1x1 expand
#[derive(Debug, Clone)]
pub struct Bottleneck {
    conv1: Conv2d,
    bn1: Norm,
    conv2: Conv2d,
    bn2: BatchNorm,
    conv3: Conv2d,
    bn3: BatchNorm,
    instance_norm: Option<InstanceNorm2d>,
    downsample: Option<Downsample>,
}

impl Bottleneck {
    fn load(
        vb: VarBuilder,
        inplanes: usize,
        planes: usize,
        stride: usize,
        ibn: BlockIbn,
    ) -> Result<Self> {
        let out_planes = planes * BOTTLENECK_EXPANSION;

        let conv1 = candle_nn::conv2d_no_bias(
            inplanes,
            planes,
            1,
            Conv2dConfig::default(),
            vb.pp("conv1"),
        )?;
        let bn1 = match ibn {
            BlockIbn::A => Norm::Ibn(Ibn::load(vb.pp("bn1"), planes)?),
            _ => Norm::Batch(candle_nn::batch_norm(planes, NORM_EPS, vb.pp("bn1"))?),
        };

        let conv2_config = Conv2dConfig {
            stride,
            padding: 1,
            ..Default::default()
        };
        let conv2 = candle_nn::conv2d_no_bias(planes, planes, 3, conv2_config, vb.pp("conv2"))?;
        let bn2 = candle_nn::batch_norm(planes, NORM_EPS, vb.pp("bn2"))?;

        let conv3 = candle_nn::conv2d_no_bias(
            planes,
            out_planes,
            1,
            Conv2dConfig::default(),
            vb.pp("conv3"),
        )?;
        let bn3 = candle_nn::batch_norm(out_planes, NORM_EPS, vb.pp("bn3"))?;

        let instance_norm = if ibn == BlockIbn::B {
            Some(InstanceNorm2d::load(vb.pp("IN"), out_planes, NORM_EPS)?)
        } else {
            None
        };

        let downsample = if stride != 1 || inplanes != out_planes {
            Some(Downsample::load(
                vb.pp("downsample"),
                inplanes,
                out_planes,
                stride,
            )?)
        } else {
            None
        };

        Ok(Self {
            conv1,
            bn1,
            conv2,
            bn2,
            conv3,
            bn3,
            instance_norm,
            downsample,
        })
    }
}

impl ModuleT for Bottleneck {
    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let residual = match &self.downsample {
            Some(downsample) => downsample.forward_t(x, train)?,
            None => x.clone(),
        };

        let out = x.apply(&self.conv1)?.apply_t(&self.bn1, train)?.relu()?;
        let out = out.apply(&self.conv2)?.apply_t(&self.bn2, train)?.relu()?;
        let out = out.apply(&self.conv3)?.apply_t(&self.bn3, train)?;

        let out = (out + residual)?;
        let out = match &self.instance_norm {
            Some(norm) => norm.forward(&out)?,
            None => out,
        };
        out.relu()
    }
}

/// ResNet-50 trunk, optionally with IBN
#[derive(Debug, Clone)]
pub struct ResNet {
    conv1: Conv2d,
    bn1: Norm,
    layers: Vec<Vec<Bottleneck>>,
    ibn: IbnMode,
}

impl ResNet {
    /// Load a ResNet-50 trunk
    ///
    /// # Arguments
    /// * `vb` - VarBuilder rooted at the backbone (e.g. `base` in a full checkpoint)
    /// * `ibn` - Normalization variant
    pub fn load(vb: VarBuilder, ibn: IbnMode) -> Result<Self> {
        let conv1_config = Conv2dConfig {
            stride: 2,
            padding: 3,
            ..Default::default()
        };
        let conv1 = candle_nn::conv2d_no_bias(3, 64, 7, conv1_config, vb.pp("conv1"))?;
        let bn1 = match ibn {
            IbnMode::B => Norm::Instance(InstanceNorm2d::load(vb.pp("bn1"), 64, NORM_EPS)?),
            _ => Norm::Batch(candle_nn::batch_norm(64, NORM_EPS, vb.pp("bn1"))?),
        };

        // IBN placement per layer: IBN-a covers layer1-3, IBN-b layer1-2
        let layer_ibn = match ibn {
            IbnMode::None => [BlockIbn::None; 4],
            IbnMode::A => [BlockIbn::A, BlockIbn::A, BlockIbn::A, BlockIbn::None],
            IbnMode::B => [BlockIbn::B, BlockIbn::B, BlockIbn::None, BlockIbn::None],
        };

        let mut inplanes = 64;
        let mut layers = Vec::with_capacity(RESNET50_BLOCKS.len());
        for (layer_idx, &num_blocks) in RESNET50_BLOCKS.iter().enumerate() {
            let planes = 64 << layer_idx;
            let stride = if layer_idx == 0 { 1 } else { 2 };
            let layer_vb = vb.pp(format!("layer{}", layer_idx + 1));

            let mut blocks = Vec::with_capacity(num_blocks);
            for block_idx in 0..num_blocks {
                let block_ibn = match layer_ibn[layer_idx] {
                    // IBN-b only normalizes the output of the last block
                    BlockIbn::B if block_idx + 1 < num_blocks => BlockIbn::None,
                    other => other,
                };
                let block_stride = if block_idx == 0 { stride } else { 1 };
                blocks.push(Bottleneck::load(
                    layer_vb.pp(block_idx.to_string()),
                    inplanes,
                    planes,
                    block_stride,
                    block_ibn,
                )?);
                inplanes = planes * BOTTLENECK_EXPANSION;
            }
            layers.push(blocks);
        }

        tracing::debug!(ibn = ibn.as_str(), "loaded ResNet-50 backbone");

        Ok(Self {
            conv1,
            bn1,
            layers,
            ibn,
        })
    }

    pub fn ibn(&self) -> IbnMode {
        self.ibn
    }
}

impl Backbone for ResNet {
    fn stages(&self) -> &[StageInfo] {
        &RESNET50_STAGES
    }

    fn forward_stage(&self, index: usize, xs: &Tensor, train: bool) -> Result<Tensor> {
        match index {
            0 => xs.apply(&self.conv1),
            1 => xs.apply_t(&self.bn1, train),
            2 => xs.relu(),
            // 3x3/2 max pool with padding 1; edge replication is equivalent
            // to -inf padding since the edge value is inside every padded window
            3 => xs
                .pad_with_same(D::Minus1, 1, 1)?
                .pad_with_same(D::Minus2, 1, 1)?
                .max_pool2d_with_stride(3, 2),
            4..=7 => {
                let mut xs = xs.clone();
                for block in &self.layers[index - 4] {
                    xs = block.forward_t(&xs, train)?;
                }
                Ok(xs)
            }
            _ => candle_core::bail!("ResNet-50 has no stage {index}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn random_resnet(ibn: IbnMode) -> (ResNet, VarMap) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let resnet = ResNet::load(vb, ibn).unwrap();
        (resnet, varmap)
    }

    #[test]
    fn test_instance_norm_statistics() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let norm = InstanceNorm2d::load(vb, 2, 1e-5).unwrap();

        let x = Tensor::arange(0f32, 32f32, &device)
            .unwrap()
            .reshape((2, 2, 2, 4))
            .unwrap();
        let y = norm.forward(&x).unwrap();
        assert_eq!(y.dims(), &[2, 2, 2, 4]);

        // Each plane has zero mean and unit variance
        let planes = y.reshape((4, 8)).unwrap();
        let means: Vec<f32> = planes.mean(1).unwrap().to_vec1().unwrap();
        let vars: Vec<f32> = planes.sqr().unwrap().mean(1).unwrap().to_vec1().unwrap();
        for (mean, var) in means.iter().zip(vars.iter()) {
            assert!(mean.abs() < 1e-5, "mean {}", mean);
            assert!((var - 1.0).abs() < 1e-3, "var {}", var);
        }
    }

    #[test]
    fn test_ibn_preserves_channels() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let ibn = Ibn::load(vb, 6).unwrap();

        let x = Tensor::randn(0f32, 1f32, (2, 6, 4, 4), &device).unwrap();
        let y = ibn.forward_t(&x, false).unwrap();
        assert_eq!(y.dims(), &[2, 6, 4, 4]);
    }

    #[test]
    fn test_ibn_weight_names() {
        let (_, varmap) = random_resnet(IbnMode::A);
        let data = varmap.data().lock().unwrap();
        assert!(data.contains_key("layer1.0.bn1.IN.weight"));
        assert!(data.contains_key("layer1.0.bn1.BN.running_var"));
        assert!(data.contains_key("layer3.5.bn1.IN.bias"));
        assert!(!data.contains_key("layer4.0.bn1.IN.weight"));
        drop(data);

        let (_, varmap) = random_resnet(IbnMode::B);
        let data = varmap.data().lock().unwrap();
        assert!(data.contains_key("bn1.weight"));
        assert!(!data.contains_key("bn1.running_mean"));
        assert!(data.contains_key("layer1.2.IN.weight"));
        assert!(data.contains_key("layer2.3.IN.weight"));
        assert!(!data.contains_key("layer1.0.IN.weight"));
        assert!(!data.contains_key("layer3.5.IN.weight"));
        assert!(data.contains_key("layer3.0.downsample.0.weight"));
    }

    #[test]
    fn test_stage_shapes() {
        let (resnet, _varmap) = random_resnet(IbnMode::None);
        let x = Tensor::randn(0f32, 1f32, (1, 3, 64, 32), &Device::Cpu).unwrap();

        let mut xs = x;
        for (index, stage) in RESNET50_STAGES.iter().enumerate() {
            xs = resnet.forward_stage(index, &xs, false).unwrap();
            assert_eq!(
                xs.dims(),
                &[1, stage.out_channels, 64 / stage.stride, 32 / stage.stride],
                "stage {}",
                stage.name
            );
        }
    }

    #[test]
    fn test_layer3_depth_independent_of_input_size() {
        let (resnet, _varmap) = random_resnet(IbnMode::B);
        let layer3 = resnet.stage_index("layer3").unwrap();

        for (h, w) in [(32, 32), (64, 32), (48, 80)] {
            let x = Tensor::randn(0f32, 1f32, (1, 3, h, w), &Device::Cpu).unwrap();
            let y = resnet.forward_through(&x, layer3, false).unwrap();
            let (_, c, fh, fw) = y.dims4().unwrap();
            assert_eq!(c, 1024);
            assert_eq!((fh, fw), (h / 16, w / 16));
        }
    }
}
