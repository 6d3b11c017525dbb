//! Layers: the polymorphic units of computation of a graph.
//!
//! Every layer follows a two-phase protocol:
//! 1. [`Layer::allocate`] infers output shapes from the input shapes alone,
//!    validates structural preconditions and precomputes derived constants.
//! 2. [`Layer::forward`] computes the outputs from the inputs, in place,
//!    into the tensors returned by `allocate`. It may be repeated.
//!
//! Concrete layers are usually created from [`LayerParams`] through a
//! [`LayerRegistry`](registry::LayerRegistry).

use std::fmt::Debug;

use thiserror::Error;

use crate::{
    hal::cpu::KernelError,
    loom::tensor::{Tensor, TensorError},
};

pub mod batch_norm;
pub mod concat;
pub mod convolution;
pub mod eltwise;
pub mod max_unpool;
pub mod params;
pub mod pooling;
pub mod registry;

pub use params::{LayerParams, ParamValue};

#[derive(Debug, Error)]
pub enum LayerError {
    #[error("layer {layer}: shape mismatch: {reason}")]
    ShapeMismatch { layer: String, reason: String },
    #[error("layer {layer}: invalid configuration: {reason}")]
    Config { layer: String, reason: String },
    #[error("layer {layer}: index {index} out of bounds [0, {bound})")]
    Bounds {
        layer: String,
        index: isize,
        bound: usize,
    },
    #[error("layer {0}: forward before allocate")]
    NotAllocated(String),
    #[error(transparent)]
    Tensor(#[from] TensorError),
    #[error(transparent)]
    Kernel(#[from] KernelError),
}

impl LayerError {
    pub fn shape(layer: impl ToString, reason: impl ToString) -> Self {
        Self::ShapeMismatch {
            layer: layer.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn config(layer: impl ToString, reason: impl ToString) -> Self {
        Self::Config {
            layer: layer.to_string(),
            reason: reason.to_string(),
        }
    }
}

pub trait Layer: Debug + Send + Sync {
    /// Unique name of the layer within its graph.
    fn name(&self) -> &str;

    /// Type tag of the layer, as registered in a [`LayerRegistry`](registry::LayerRegistry).
    fn kind(&self) -> &'static str;

    /// Learned parameter blobs.
    fn blobs(&self) -> &[Tensor] {
        &[]
    }

    /// Infers output shapes from `inputs` and creates the outputs, zero-filled.
    /// Only the shapes of `inputs` may be inspected, not their contents.
    fn allocate(&mut self, inputs: &[Tensor]) -> Result<Vec<Tensor>, LayerError>;

    /// Writes the results for `inputs` into `outputs`. `outputs` are the tensors returned by
    /// the last [`allocate`](Layer::allocate); they are never reshaped or replaced.
    fn forward(&self, inputs: &[Tensor], outputs: &mut [Tensor]) -> Result<(), LayerError>;
}

/// A layer that can be created from a parameter record.
pub trait LayerFactory: Layer + Sized + 'static {
    const KIND: &'static str;

    fn create(params: LayerParams) -> Result<Self, LayerError>;
}

/// Checks that a layer got exactly `count` inputs, or at least `count` if `at_least` is set.
pub(crate) fn check_input_count(
    name: &str,
    inputs: &[Tensor],
    count: usize,
    at_least: bool,
) -> Result<(), LayerError> {
    let ok = match at_least {
        true => inputs.len() >= count,
        false => inputs.len() == count,
    };
    match ok {
        true => Ok(()),
        false => Err(LayerError::shape(
            name,
            format!(
                "expected {}{count} inputs, found {}",
                if at_least { "at least " } else { "" },
                inputs.len()
            ),
        )),
    }
}

/// Checks that `forward` got as many outputs as `allocate` returned.
pub(crate) fn check_outputs(name: &str, outputs: &[Tensor], count: usize) -> Result<(), LayerError> {
    match outputs.len() == count {
        true => Ok(()),
        false => Err(LayerError::NotAllocated(name.to_string())),
    }
}
