//! Transformer Encoder over spatial positions
//!
//! This module implements the sequence side of the feature extractor:
//! - Multi-head self-attention with an optional shared attention mask and a
//!   per-batch key padding mask
//! - Post-norm encoder layer (attention block, then ReLU feed-forward block)
//! - An encoder stack that returns the concatenation of every layer's output
//!   along the feature axis instead of only the last one
//!
//! Sequences are laid out as [seq_len, batch_size, embed_dim], matching the
//! weight layout of PyTorch's `nn.TransformerEncoderLayer`.

use candle_core::{Result, Tensor, D};
use candle_nn::{init, linear, Dropout, Init, LayerNorm, Linear, Module, VarBuilder};

const LAYER_NORM_EPS: f64 = 1e-5;

/// Fill `scores` with -inf wherever `blocked` is non-zero.
///
/// `blocked` must broadcast to the shape of `scores`.
fn masked_fill_neg_inf(scores: &Tensor, blocked: &Tensor) -> Result<Tensor> {
    let blocked = blocked.broadcast_as(scores.shape())?.contiguous()?;
    let neg_inf = Tensor::full(f32::NEG_INFINITY, scores.shape(), scores.device())?
        .to_dtype(scores.dtype())?;
    blocked.where_cond(&neg_inf, scores)
}

/// Apply a [tgt_len, src_len] attention mask to [batch, heads, tgt_len, src_len] scores.
///
/// Float masks are added to the scores; integer masks block pairs where non-zero.
fn apply_attn_mask(scores: &Tensor, mask: &Tensor) -> Result<Tensor> {
    if mask.dtype().is_float() {
        scores.broadcast_add(&mask.to_dtype(scores.dtype())?)
    } else {
        masked_fill_neg_inf(scores, mask)
    }
}

/// Apply a [batch, src_len] key padding mask.
///
/// Float masks are added to the scores; integer masks exclude keys where non-zero.
fn apply_key_padding_mask(scores: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let (batch_size, src_len) = mask.dims2()?;
    let mask = mask.reshape((batch_size, 1, 1, src_len))?;
    if mask.dtype().is_float() {
        scores.broadcast_add(&mask.to_dtype(scores.dtype())?)
    } else {
        masked_fill_neg_inf(scores, &mask)
    }
}

/// Multi-head Attention
pub struct MultiheadAttention {
    num_heads: usize,
    head_dim: usize,
    /// Combined QKV projection
    in_proj_weight: Tensor,
    in_proj_bias: Tensor,
    /// Output projection
    out_proj: Linear,
    /// Dropout on the attention weights
    dropout: Dropout,
}

impl MultiheadAttention {
    /// Load MultiheadAttention from weights
    pub fn load(embed_dim: usize, num_heads: usize, dropout: f32, vb: VarBuilder) -> Result<Self> {
        if num_heads == 0 || embed_dim % num_heads != 0 {
            candle_core::bail!("embed_dim {embed_dim} must be divisible by num_heads {num_heads}");
        }
        let head_dim = embed_dim / num_heads;

        let in_proj_weight = vb.get_with_hints(
            (3 * embed_dim, embed_dim),
            "in_proj_weight",
            init::DEFAULT_KAIMING_NORMAL,
        )?;
        let in_proj_bias = vb.get_with_hints(3 * embed_dim, "in_proj_bias", Init::Const(0.0))?;
        let out_proj = linear(embed_dim, embed_dim, vb.pp("out_proj"))?;

        Ok(Self {
            num_heads,
            head_dim,
            in_proj_weight,
            in_proj_bias,
            out_proj,
            dropout: Dropout::new(dropout),
        })
    }

    /// Project `xs` with one third of the packed QKV weights
    ///
    /// `chunk` selects query (0), key (1) or value (2).
    fn project(&self, xs: &Tensor, chunk: usize) -> Result<Tensor> {
        let embed_dim = self.num_heads * self.head_dim;
        let weight = self.in_proj_weight.narrow(0, chunk * embed_dim, embed_dim)?;
        let bias = self.in_proj_bias.narrow(0, chunk * embed_dim, embed_dim)?;
        xs.broadcast_matmul(&weight.t()?)?.broadcast_add(&bias)
    }

    /// [batch, seq, embed] -> [batch, heads, seq, head_dim]
    fn split_heads(&self, xs: &Tensor) -> Result<Tensor> {
        let (batch_size, seq_len, _) = xs.dims3()?;
        xs.reshape((batch_size, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    /// Forward pass
    ///
    /// # Arguments
    /// * `query` - Query tensor [tgt_len, batch_size, embed_dim]
    /// * `key` - Key tensor [src_len, batch_size, embed_dim]
    /// * `value` - Value tensor [src_len, batch_size, embed_dim]
    /// * `attn_mask` - Optional [tgt_len, src_len] mask shared by all batch elements
    /// * `key_padding_mask` - Optional [batch_size, src_len] mask of excluded keys
    /// * `train` - Whether attention dropout is active
    ///
    /// # Returns
    /// Tensor of shape [tgt_len, batch_size, embed_dim]
    pub fn forward_t(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        attn_mask: Option<&Tensor>,
        key_padding_mask: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        // [seq, batch, embed] -> [batch, seq, embed]
        let query = query.transpose(0, 1)?.contiguous()?;
        let key = key.transpose(0, 1)?.contiguous()?;
        let value = value.transpose(0, 1)?.contiguous()?;
        let (batch_size, tgt_len, embed_dim) = query.dims3()?;

        let q = self.split_heads(&self.project(&query, 0)?)?;
        let k = self.split_heads(&self.project(&key, 1)?)?;
        let v = self.split_heads(&self.project(&value, 2)?)?;

        // Scaled dot-product attention: [batch, heads, tgt_len, src_len]
        let scale = (self.head_dim as f64).sqrt();
        let k_t = k.transpose(D::Minus2, D::Minus1)?.contiguous()?;
        let mut attn_weights = (q.matmul(&k_t)? / scale)?;
        if let Some(mask) = attn_mask {
            attn_weights = apply_attn_mask(&attn_weights, mask)?;
        }
        if let Some(mask) = key_padding_mask {
            attn_weights = apply_key_padding_mask(&attn_weights, mask)?;
        }
        let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights)?;
        let attn_weights = self.dropout.forward(&attn_weights, train)?;
        let attn_output = attn_weights.matmul(&v)?;

        // [batch, heads, tgt_len, head_dim] -> [batch, tgt_len, embed]
        let attn_output = attn_output
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch_size, tgt_len, embed_dim))?;

        // Output projection, back to [tgt_len, batch, embed]
        self.out_proj
            .forward(&attn_output)?
            .transpose(0, 1)?
            .contiguous()
    }
}

/// Hyper-parameters shared by every layer of an encoder stack
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EncoderLayerConfig {
    pub d_model: usize,
    pub nhead: usize,
    pub dim_feedforward: usize,
    pub dropout: f32,
}

/// Transformer Encoder Layer
///
/// Each layer contains:
/// 1. Self-attention, residual, LayerNorm
/// 2. Feed-forward network (ReLU), residual, LayerNorm
pub struct TransformerEncoderLayer {
    /// Self-attention
    self_attn: MultiheadAttention,

    /// FFN layers
    linear1: Linear,
    linear2: Linear,

    /// Layer norms
    norm1: LayerNorm,
    norm2: LayerNorm,

    dropout: Dropout,
}

impl TransformerEncoderLayer {
    /// Load TransformerEncoderLayer from weights
    pub fn load(config: &EncoderLayerConfig, vb: VarBuilder) -> Result<Self> {
        let self_attn = MultiheadAttention::load(
            config.d_model,
            config.nhead,
            config.dropout,
            vb.pp("self_attn"),
        )?;

        let linear1 = linear(config.d_model, config.dim_feedforward, vb.pp("linear1"))?;
        let linear2 = linear(config.dim_feedforward, config.d_model, vb.pp("linear2"))?;

        let norm1 = candle_nn::layer_norm(config.d_model, LAYER_NORM_EPS, vb.pp("norm1"))?;
        let norm2 = candle_nn::layer_norm(config.d_model, LAYER_NORM_EPS, vb.pp("norm2"))?;

        Ok(Self {
            self_attn,
            linear1,
            linear2,
            norm1,
            norm2,
            dropout: Dropout::new(config.dropout),
        })
    }

    /// Forward pass
    ///
    /// # Arguments
    /// * `src` - Sequence [seq_len, batch_size, d_model]
    /// * `src_mask` - Optional [seq_len, seq_len] attention mask
    /// * `key_mask` - Optional [batch_size, seq_len] key padding mask
    /// * `train` - Whether dropout is active
    pub fn forward_t(
        &self,
        src: &Tensor,
        src_mask: Option<&Tensor>,
        key_mask: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        // Self-attention
        let src2 = self
            .self_attn
            .forward_t(src, src, src, src_mask, key_mask, train)?;
        let src2 = self.dropout.forward(&src2, train)?;
        let src = self.norm1.forward(&(src + &src2)?)?;

        // FFN
        let src2 = self.linear1.forward(&src)?.relu()?;
        let src2 = self.dropout.forward(&src2, train)?;
        let src2 = self.linear2.forward(&src2)?;
        let src2 = self.dropout.forward(&src2, train)?;
        self.norm2.forward(&(&src + &src2)?)
    }
}

/// Transformer Encoder
///
/// Stacks identically configured, independently weighted layers and returns
/// every layer's output concatenated along the feature axis:
/// [seq_len, batch_size, d_model] -> [seq_len, batch_size, d_model * num_layers]
pub struct TransformerEncoder {
    /// Encoder layers
    layers: Vec<TransformerEncoderLayer>,
    /// Optional norm applied to each recorded layer output
    norm: Option<LayerNorm>,
    d_model: usize,
}

impl TransformerEncoder {
    /// Load TransformerEncoder from weights
    ///
    /// Layer weights live under `layers.{i}`, the optional norm under `norm`.
    pub fn load(
        config: &EncoderLayerConfig,
        num_layers: usize,
        with_norm: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        if num_layers == 0 {
            candle_core::bail!("TransformerEncoder needs at least one layer");
        }

        let mut layers = Vec::with_capacity(num_layers);
        for i in 0..num_layers {
            let layer = TransformerEncoderLayer::load(config, vb.pp(format!("layers.{}", i)))?;
            layers.push(layer);
        }

        let norm = if with_norm {
            Some(candle_nn::layer_norm(
                config.d_model,
                LAYER_NORM_EPS,
                vb.pp("norm"),
            )?)
        } else {
            None
        };

        Ok(Self {
            layers,
            norm,
            d_model: config.d_model,
        })
    }

    /// Width of the concatenated output
    pub fn out_dim(&self) -> usize {
        self.d_model * self.layers.len()
    }

    /// Forward pass
    ///
    /// # Arguments
    /// * `src` - Sequence [seq_len, batch_size, d_model]
    /// * `src_mask` - Optional [seq_len, seq_len] mask, shared by every layer
    /// * `key_mask` - Optional [batch_size, seq_len] key padding mask, shared by every layer
    /// * `train` - Whether dropout is active
    ///
    /// # Returns
    /// Tensor of shape [seq_len, batch_size, d_model * num_layers]
    pub fn forward_t(
        &self,
        src: &Tensor,
        src_mask: Option<&Tensor>,
        key_mask: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let mut output = src.clone();
        let mut layer_outputs = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            output = layer.forward_t(&output, src_mask, key_mask, train)?;
            layer_outputs.push(output.clone());
        }

        // The running output fed to the next layer stays unnormalized
        if let Some(norm) = &self.norm {
            layer_outputs = layer_outputs
                .iter()
                .map(|out| norm.forward(out))
                .collect::<Result<Vec<_>>>()?;
        }

        Tensor::cat(&layer_outputs, D::Minus1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, IndexOp};
    use candle_nn::VarMap;

    fn layer_config(d_model: usize, nhead: usize) -> EncoderLayerConfig {
        EncoderLayerConfig {
            d_model,
            nhead,
            dim_feedforward: 32,
            dropout: 0.0,
        }
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    }

    #[test]
    fn test_attention_shape() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let attn = MultiheadAttention::load(16, 4, 0.0, vb).unwrap();

        let q = Tensor::randn(0f32, 1f32, (5, 2, 16), &device).unwrap();
        let kv = Tensor::randn(0f32, 1f32, (7, 2, 16), &device).unwrap();
        let out = attn.forward_t(&q, &kv, &kv, None, None, false).unwrap();
        assert_eq!(out.dims(), &[5, 2, 16]);
    }

    #[test]
    fn test_attention_rejects_indivisible_heads() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        assert!(MultiheadAttention::load(10, 4, 0.0, vb).is_err());
    }

    #[test]
    fn test_zero_float_mask_is_noop() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let attn = MultiheadAttention::load(8, 2, 0.0, vb).unwrap();

        let xs = Tensor::randn(0f32, 1f32, (6, 3, 8), &device).unwrap();
        let mask = Tensor::zeros((6, 6), DType::F32, &device).unwrap();
        let plain = attn.forward_t(&xs, &xs, &xs, None, None, false).unwrap();
        let masked = attn
            .forward_t(&xs, &xs, &xs, Some(&mask), None, false)
            .unwrap();
        assert!(max_abs_diff(&plain, &masked) < 1e-6);
    }

    #[test]
    fn test_key_padding_mask_ignores_padded_positions() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let attn = MultiheadAttention::load(8, 2, 0.0, vb).unwrap();

        // Positions 4 and 5 of the single batch element are padding
        let xs = Tensor::randn(0f32, 1f32, (6, 1, 8), &device).unwrap();
        let key_mask = Tensor::new(&[[0u8, 0, 0, 0, 1, 1]], &device).unwrap();
        let out = attn
            .forward_t(&xs, &xs, &xs, None, Some(&key_mask), false)
            .unwrap();

        // Changing the padded positions must not affect the outputs of any query
        let noise = Tensor::randn(0f32, 10f32, (2, 1, 8), &device).unwrap();
        let perturbed = Tensor::cat(&[&xs.narrow(0, 0, 4).unwrap(), &noise], 0).unwrap();
        let out_perturbed = attn
            .forward_t(&xs, &perturbed, &perturbed, None, Some(&key_mask), false)
            .unwrap();
        assert!(max_abs_diff(&out, &out_perturbed) < 1e-5);
    }

    #[test]
    fn test_boolean_attn_mask_blocks_pairs() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let attn = MultiheadAttention::load(8, 1, 0.0, vb).unwrap();

        // Every query may only attend to key 0
        let mut blocked = vec![1u8; 16];
        for row in 0..4 {
            blocked[row * 4] = 0;
        }
        let mask = Tensor::from_vec(blocked, (4, 4), &device).unwrap();

        let xs = Tensor::randn(0f32, 1f32, (4, 2, 8), &device).unwrap();
        let out = attn
            .forward_t(&xs, &xs, &xs, Some(&mask), None, false)
            .unwrap();

        // With a single visible key every query gets the same output
        let first = out.i(0).unwrap();
        for row in 1..4 {
            assert!(max_abs_diff(&first, &out.i(row).unwrap()) < 1e-5);
        }
    }

    #[test]
    fn test_key_mask_shape_mismatch_is_an_error() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let attn = MultiheadAttention::load(8, 2, 0.0, vb).unwrap();

        let xs = Tensor::randn(0f32, 1f32, (6, 2, 8), &device).unwrap();
        let key_mask = Tensor::zeros((2, 5), DType::U8, &device).unwrap();
        assert!(attn
            .forward_t(&xs, &xs, &xs, None, Some(&key_mask), false)
            .is_err());
    }

    #[test]
    fn test_encoder_output_width_scales_with_layers() {
        let device = Device::Cpu;
        for num_layers in 1..=4 {
            let varmap = VarMap::new();
            let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
            let encoder = TransformerEncoder::load(&layer_config(16, 2), num_layers, false, vb)
                .unwrap();

            let src = Tensor::randn(0f32, 1f32, (12, 3, 16), &device).unwrap();
            let out = encoder.forward_t(&src, None, None, false).unwrap();
            assert_eq!(out.dims(), &[12, 3, 16 * num_layers]);
            assert_eq!(encoder.out_dim(), 16 * num_layers);
        }
    }

    #[test]
    fn test_encoder_requires_a_layer() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        assert!(TransformerEncoder::load(&layer_config(16, 2), 0, false, vb).is_err());
    }

    #[test]
    fn test_encoder_chunks_are_layer_outputs() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let config = layer_config(8, 2);
        let encoder = TransformerEncoder::load(&config, 3, false, vb.clone()).unwrap();

        // Layers loaded from the same VarMap share the same weights
        let layer0 = TransformerEncoderLayer::load(&config, vb.pp("layers.0")).unwrap();
        let layer1 = TransformerEncoderLayer::load(&config, vb.pp("layers.1")).unwrap();

        let src = Tensor::randn(0f32, 1f32, (5, 2, 8), &device).unwrap();
        let out = encoder.forward_t(&src, None, None, false).unwrap();

        let expected0 = layer0.forward_t(&src, None, None, false).unwrap();
        let expected1 = layer1.forward_t(&expected0, None, None, false).unwrap();
        assert!(max_abs_diff(&out.narrow(D::Minus1, 0, 8).unwrap(), &expected0) < 1e-5);
        assert!(max_abs_diff(&out.narrow(D::Minus1, 8, 8).unwrap(), &expected1) < 1e-5);
    }

    #[test]
    fn test_float_key_padding_mask_is_additive() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let attn = MultiheadAttention::load(8, 2, 0.0, vb).unwrap();

        let xs = Tensor::randn(0f32, 1f32, (5, 2, 8), &device).unwrap();
        let blocked = Tensor::new(&[[0u8, 0, 0, 1, 1], [0, 0, 0, 0, 1]], &device).unwrap();
        let additive = blocked
            .to_dtype(DType::F32)
            .unwrap()
            .affine(-1e9, 0.0)
            .unwrap();

        let out_blocked = attn
            .forward_t(&xs, &xs, &xs, None, Some(&blocked), false)
            .unwrap();
        let out_additive = attn
            .forward_t(&xs, &xs, &xs, None, Some(&additive), false)
            .unwrap();
        assert!(max_abs_diff(&out_blocked, &out_additive) < 1e-5);

        // A zero float mask changes nothing
        let zeros = Tensor::zeros((2, 5), DType::F32, &device).unwrap();
        let plain = attn.forward_t(&xs, &xs, &xs, None, None, false).unwrap();
        let out_zeros = attn
            .forward_t(&xs, &xs, &xs, None, Some(&zeros), false)
            .unwrap();
        assert!(max_abs_diff(&plain, &out_zeros) < 1e-6);
    }

    #[test]
    fn test_encoder_passes_key_mask_to_every_layer() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let config = layer_config(8, 2);
        let encoder = TransformerEncoder::load(&config, 2, false, vb.clone()).unwrap();
        let layer0 = TransformerEncoderLayer::load(&config, vb.pp("layers.0")).unwrap();
        let layer1 = TransformerEncoderLayer::load(&config, vb.pp("layers.1")).unwrap();

        // The last two positions of both batch elements are padding
        let key_mask = Tensor::new(&[[0u8, 0, 0, 1, 1], [0, 0, 0, 1, 1]], &device).unwrap();
        let src = Tensor::randn(0f32, 1f32, (5, 2, 8), &device).unwrap();
        let out = encoder
            .forward_t(&src, None, Some(&key_mask), false)
            .unwrap();

        let expected0 = layer0
            .forward_t(&src, None, Some(&key_mask), false)
            .unwrap();
        let expected1 = layer1
            .forward_t(&expected0, None, Some(&key_mask), false)
            .unwrap();
        assert!(max_abs_diff(&out.narrow(D::Minus1, 0, 8).unwrap(), &expected0) < 1e-5);
        assert!(max_abs_diff(&out.narrow(D::Minus1, 8, 8).unwrap(), &expected1) < 1e-5);

        // Whatever sits at the padded positions, the other rows are unchanged
        let noise = Tensor::randn(0f32, 10f32, (2, 2, 8), &device).unwrap();
        let perturbed = Tensor::cat(&[&src.narrow(0, 0, 3).unwrap(), &noise], 0).unwrap();
        let out_perturbed = encoder
            .forward_t(&perturbed, None, Some(&key_mask), false)
            .unwrap();
        assert!(
            max_abs_diff(
                &out.narrow(0, 0, 3).unwrap(),
                &out_perturbed.narrow(0, 0, 3).unwrap()
            ) < 1e-5
        );
    }

    #[test]
    fn test_encoder_passes_src_mask_to_every_layer() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let config = layer_config(8, 2);
        let encoder = TransformerEncoder::load(&config, 2, false, vb.clone()).unwrap();
        let layer0 = TransformerEncoderLayer::load(&config, vb.pp("layers.0")).unwrap();
        let layer1 = TransformerEncoderLayer::load(&config, vb.pp("layers.1")).unwrap();

        // Causal mask: query i sees keys 0..=i
        let mut blocked = vec![0u8; 16];
        for row in 0..4 {
            for col in (row + 1)..4 {
                blocked[row * 4 + col] = 1;
            }
        }
        let src_mask = Tensor::from_vec(blocked, (4, 4), &device).unwrap();
        let src = Tensor::randn(0f32, 1f32, (4, 3, 8), &device).unwrap();
        let out = encoder
            .forward_t(&src, Some(&src_mask), None, false)
            .unwrap();

        let expected0 = layer0
            .forward_t(&src, Some(&src_mask), None, false)
            .unwrap();
        let expected1 = layer1
            .forward_t(&expected0, Some(&src_mask), None, false)
            .unwrap();
        assert!(max_abs_diff(&out.narrow(D::Minus1, 8, 8).unwrap(), &expected1) < 1e-5);

        // The first position only ever sees itself, through both layers
        let tail = Tensor::randn(0f32, 10f32, (3, 3, 8), &device).unwrap();
        let perturbed = Tensor::cat(&[&src.narrow(0, 0, 1).unwrap(), &tail], 0).unwrap();
        let out_perturbed = encoder
            .forward_t(&perturbed, Some(&src_mask), None, false)
            .unwrap();
        assert!(max_abs_diff(&out.i(0).unwrap(), &out_perturbed.i(0).unwrap()) < 1e-5);
    }

    #[test]
    fn test_encoder_norm_applies_to_recorded_outputs() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let config = layer_config(8, 2);
        let plain = TransformerEncoder::load(&config, 2, false, vb.clone()).unwrap();
        let normed = TransformerEncoder::load(&config, 2, true, vb.clone()).unwrap();
        let norm = candle_nn::layer_norm(8, LAYER_NORM_EPS, vb.pp("norm")).unwrap();

        let src = Tensor::randn(0f32, 1f32, (5, 2, 8), &device).unwrap();
        let plain_out = plain.forward_t(&src, None, None, false).unwrap();
        let normed_out = normed.forward_t(&src, None, None, false).unwrap();

        // Normalizing each chunk of the plain output reproduces the normed output,
        // so the second layer saw the unnormalized first output
        for chunk in 0..2 {
            let expected = norm
                .forward(&plain_out.narrow(D::Minus1, chunk * 8, 8).unwrap())
                .unwrap();
            let actual = normed_out.narrow(D::Minus1, chunk * 8, 8).unwrap();
            assert!(max_abs_diff(&expected, &actual) < 1e-5);
        }
    }

    #[test]
    fn test_encoder_is_deterministic_without_dropout() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let config = EncoderLayerConfig {
            dropout: 0.1,
            ..layer_config(8, 2)
        };
        let encoder = TransformerEncoder::load(&config, 2, false, vb).unwrap();

        let src = Tensor::randn(0f32, 1f32, (5, 2, 8), &device).unwrap();
        let a = encoder.forward_t(&src, None, None, false).unwrap();
        let b = encoder.forward_t(&src, None, None, false).unwrap();
        assert!(max_abs_diff(&a, &b) < 1e-6);
    }
}
