use candle_core::{DType, Result, Tensor};

/// Summary statistics of a tensor, for logging intermediate activations
#[derive(Debug, Clone, PartialEq)]
pub struct TensorStats {
    pub shape: Vec<usize>,
    pub min: f32,
    pub max: f32,
    pub mean: f32,
    pub std: f32,
}

impl TensorStats {
    pub fn from_tensor(tensor: &Tensor) -> Result<Self> {
        let shape = tensor.dims().to_vec();
        let flat = tensor.flatten_all()?.to_dtype(DType::F32)?;

        let min = flat.min(0)?.to_scalar::<f32>()?;
        let max = flat.max(0)?.to_scalar::<f32>()?;
        let mean = flat.mean_all()?.to_scalar::<f32>()?;
        let std = flat
            .broadcast_sub(&flat.mean_all()?)?
            .sqr()?
            .mean_all()?
            .sqrt()?
            .to_scalar::<f32>()?;

        Ok(Self {
            shape,
            min,
            max,
            mean,
            std,
        })
    }

    /// Emit the statistics as a debug-level event
    pub fn log(&self, name: &str) {
        tracing::debug!(
            "{name}: shape={:?}, min={:.6}, max={:.6}, mean={:.6}, std={:.6}",
            self.shape,
            self.min,
            self.max,
            self.mean,
            self.std
        );
    }
}

/// Log statistics of `tensor` at debug level.
///
/// Does nothing (and skips the device round trip) when debug logging is off.
pub fn log_tensor_stats(tensor: &Tensor, name: &str) -> Result<()> {
    if tracing::enabled!(tracing::Level::DEBUG) {
        TensorStats::from_tensor(tensor)?.log(name);
    }
    Ok(())
}
