pub mod backbone;
pub mod resnet;
pub mod transformer;

use candle_core::{Module, Result, Tensor, D};
use candle_nn::{Conv2d, Conv2dConfig, VarBuilder};

use crate::config::ResMapConfig;
use crate::model::backbone::{Backbone, StageInfo};
use crate::model::resnet::{ResNet, RESNET50_STAGES};
use crate::model::transformer::{EncoderLayerConfig, TransformerEncoder};

/// ResMap feature extractor
///
/// A truncated convolutional backbone, an optional 3x3 neck and an optional
/// transformer encoder over spatial positions. The output is channel-last:
/// [batch_size, h, w, c_total], where the encoder's concatenated layer outputs
/// follow the backbone features along the channel axis.
pub struct ResMap<B: Backbone = ResNet> {
    /// Model configuration
    config: ResMapConfig,
    /// Backbone, run up to and including `final_stage`
    backbone: B,
    /// Index of `config.final_layer` in the backbone stage list
    final_stage: usize,
    /// The stage `final_stage` refers to
    stage: StageInfo,
    /// Optional channel projection after the backbone
    neck_conv: Option<Conv2d>,
    /// Optional encoder stack
    encoder: Option<TransformerEncoder>,
}

impl ResMap<ResNet> {
    /// Load a ResMap with a ResNet-50 backbone from a single set of weights
    ///
    /// # Arguments
    /// * `vb` - VarBuilder rooted at the model; backbone weights under `base.*`,
    ///   neck under `neck_conv.*`, encoder under `encoder.*`
    /// * `config` - Model configuration
    pub fn load(vb: VarBuilder, config: &ResMapConfig) -> Result<Self> {
        // Reject the configuration before reading any backbone weights
        config
            .validate(&RESNET50_STAGES)
            .map_err(candle_core::Error::wrap)?;

        let backbone = ResNet::load(vb.pp("base"), config.ibn)?;
        Self::new(backbone, vb, config)
    }
}

impl<B: Backbone> ResMap<B> {
    /// Build a ResMap around an existing backbone
    ///
    /// # Arguments
    /// * `backbone` - Backbone instance, e.g. loaded from pretrained weights
    /// * `vb` - VarBuilder for the layers added on top (`neck_conv.*`, `encoder.*`)
    /// * `config` - Model configuration, validated against the backbone's stages
    pub fn new(backbone: B, vb: VarBuilder, config: &ResMapConfig) -> Result<Self> {
        let validated = config
            .validate(backbone.stages())
            .map_err(candle_core::Error::wrap)?;
        for warning in &validated.warnings {
            tracing::warn!("{warning}");
        }
        let stage = validated.stage;

        let neck_conv = if config.neck > 0 {
            let conv_config = Conv2dConfig {
                padding: 1,
                ..Default::default()
            };
            Some(candle_nn::conv2d(
                stage.out_channels,
                config.neck,
                3,
                conv_config,
                vb.pp("neck_conv"),
            )?)
        } else {
            None
        };

        let encoder = if config.num_encoder_layers > 0 {
            let layer_config = EncoderLayerConfig {
                d_model: validated.d_model,
                nhead: config.nhead,
                dim_feedforward: config.dim_feedforward,
                dropout: config.dropout,
            };
            Some(TransformerEncoder::load(
                &layer_config,
                config.num_encoder_layers,
                config.encoder_norm,
                vb.pp("encoder"),
            )?)
        } else {
            None
        };

        tracing::debug!(
            final_layer = stage.name,
            neck = config.neck,
            encoder_layers = config.num_encoder_layers,
            out_channels = config.out_channels(&stage),
            "built ResMap"
        );

        Ok(Self {
            config: config.clone(),
            backbone,
            final_stage: validated.stage_index,
            stage,
            neck_conv,
            encoder,
        })
    }

    pub fn config(&self) -> &ResMapConfig {
        &self.config
    }

    pub fn backbone(&self) -> &B {
        &self.backbone
    }

    /// Stage the backbone is truncated at
    pub fn final_stage(&self) -> &StageInfo {
        &self.stage
    }

    /// Spatial reduction between the input image and the output feature map
    pub fn stride(&self) -> usize {
        self.stage.stride
    }

    /// Channel width of the final output
    pub fn out_channels(&self) -> usize {
        self.config.out_channels(&self.stage)
    }

    /// Output shape [batch_size, h, w, c_total] for an input of the given size
    ///
    /// Strided stages pad their input, so a size that is not a multiple of
    /// the stride rounds up.
    pub fn output_shape(&self, batch_size: usize, height: usize, width: usize) -> [usize; 4] {
        [
            batch_size,
            height.div_ceil(self.stride()),
            width.div_ceil(self.stride()),
            self.out_channels(),
        ]
    }

    /// Run the backbone adapter: backbone up to `final_layer`, then the neck
    ///
    /// # Arguments
    /// * `pixel_values` - Input tensor of shape [batch_size, 3, height, width]
    ///
    /// # Returns
    /// Feature map of shape [batch_size, channels, h, w]
    pub fn backbone_forward(&self, pixel_values: &Tensor, train: bool) -> Result<Tensor> {
        let x = self
            .backbone
            .forward_through(pixel_values, self.final_stage, train)?;
        match &self.neck_conv {
            Some(neck_conv) => x.apply(neck_conv),
            None => Ok(x),
        }
    }

    /// Run the encoder stack on a feature map
    ///
    /// # Arguments
    /// * `features` - Feature map of shape [batch_size, c, h, w]
    ///
    /// # Returns
    /// `None` without an encoder, otherwise a tensor of shape
    /// [batch_size, h, w, c * num_encoder_layers]
    pub fn encoder_forward(&self, features: &Tensor, train: bool) -> Result<Option<Tensor>> {
        let Some(encoder) = &self.encoder else {
            return Ok(None);
        };
        let (b, c, h, w) = features.dims4()?;

        // [b, c, h, w] -> [h*w, b, c]
        let sequence = features
            .reshape((b, c, h * w))?
            .permute((2, 0, 1))?
            .contiguous()?;
        let encoded = encoder.forward_t(&sequence, None, None, train)?;

        // [h*w, b, c*n] -> [b, h, w, c*n]
        let encoded = encoded
            .permute((1, 0, 2))?
            .contiguous()?
            .reshape((b, h, w, encoder.out_dim()))?;
        Ok(Some(encoded))
    }
}

impl<B: Backbone> ResMap<B> {
    /// Run full feature extraction
    ///
    /// # Arguments
    /// * `pixel_values` - Preprocessed input tensor [batch_size, 3, height, width]
    /// * `train` - Whether batch norm uses batch statistics and dropout is active
    ///
    /// # Returns
    /// Feature map [batch_size, h, w, c_total]
    pub fn forward_t(&self, pixel_values: &Tensor, train: bool) -> Result<Tensor> {
        let features = self.backbone_forward(pixel_values, train)?;

        // [b, c, h, w] -> [b, h, w, c]
        let out = features.permute((0, 2, 3, 1))?.contiguous()?;

        match self.encoder_forward(&features, train)? {
            Some(encoded) => Tensor::cat(&[&out, &encoded], D::Minus1),
            None => Ok(out),
        }
    }
}

impl<B: Backbone> Module for ResMap<B> {
    fn forward(&self, pixel_values: &Tensor) -> Result<Tensor> {
        self.forward_t(pixel_values, false)
    }
}
