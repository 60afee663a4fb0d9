//! Backbone abstraction
//!
//! A backbone declares an ordered list of named stages up front. The feature
//! extractor resolves its `final_layer` against that list once, at
//! construction, and then only ever runs stages by index.

use candle_core::{Result, Tensor};

/// A named stage of a convolutional backbone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageInfo {
    /// Stage name, matching the weight prefix where the stage has weights
    pub name: &'static str,
    /// Channel depth of the stage output
    pub out_channels: usize,
    /// Spatial reduction of the stage output relative to the input image
    pub stride: usize,
}

impl StageInfo {
    pub const fn new(name: &'static str, out_channels: usize, stride: usize) -> Self {
        Self {
            name,
            out_channels,
            stride,
        }
    }
}

/// A feature extractor made of sequential, named stages
pub trait Backbone {
    /// All stages in execution order
    fn stages(&self) -> &[StageInfo];

    /// Run a single stage on the output of the previous one
    fn forward_stage(&self, index: usize, xs: &Tensor, train: bool) -> Result<Tensor>;

    /// Position of the stage called `name`, if any
    fn stage_index(&self, name: &str) -> Option<usize> {
        self.stages().iter().position(|stage| stage.name == name)
    }

    /// Run stages `0..=last` and return the output of stage `last`
    fn forward_through(&self, xs: &Tensor, last: usize, train: bool) -> Result<Tensor> {
        let num_stages = self.stages().len();
        if last >= num_stages {
            candle_core::bail!("stage index {last} out of range, backbone has {num_stages} stages");
        }
        let mut xs = xs.clone();
        for index in 0..=last {
            xs = self.forward_stage(index, &xs, train)?;
        }
        Ok(xs)
    }
}
