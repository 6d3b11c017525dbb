//! Graph construction and execution.
//!
//! A [`Graph`] collects layers and the bindings between them; [`Graph::build`] validates it
//! into a [`Net`], which runs the layers in topological order over one input tensor.
//!
//! ```
//! use blobnet::{
//!     layers::{LayerParams, registry::LayerRegistry},
//!     loom::tensor::Tensor,
//!     net::{BlobRef, Graph},
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = LayerRegistry::new().add_default_layers();
//!
//! let mut graph = Graph::new("data");
//! let double = graph.add_boxed(registry.create(
//!     LayerParams::new("Eltwise", "double").with("coeff", vec![1.0f32, 1.0]),
//! )?);
//! graph.connect(BlobRef::Input, double, 0);
//! graph.connect(BlobRef::Input, double, 1);
//!
//! let mut net = graph.build()?;
//! net.run(Tensor::from_data([1, 3], vec![1.0, 2.0, 3.0])?)?;
//! assert_eq!(net.output("double")?.to_vec(), vec![2.0, 4.0, 6.0]);
//! # Ok(())
//! # }
//! ```

use derive_more::Display;
use thiserror::Error;

use crate::{layers::LayerError, loom::tensor::TensorError};

mod executor;
mod graph;

pub use executor::Net;
pub use graph::Graph;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("graph error: unknown layer {0}")]
    UnknownLayer(LayerId),
    #[error("graph error: duplicate blob name `{0}`")]
    DuplicateName(String),
    #[error("graph error: input {slot} of layer `{layer}` is bound more than once")]
    DoublyBound { layer: String, slot: usize },
    #[error("graph error: input {slot} of layer `{layer}` is not bound")]
    Unbound { layer: String, slot: usize },
    #[error("graph error: cycle through layers {}", .0.join(", "))]
    Cycle(Vec<String>),
    #[error("graph error: layer `{layer}` has {count} outputs, output {index} requested")]
    MissingOutput {
        layer: String,
        index: usize,
        count: usize,
    },
    #[error("graph error: unknown blob `{0}`")]
    UnknownBlob(String),
    #[error("graph error: blob `{0}` has not been computed")]
    NotComputed(String),
    #[error("graph error: invalid input")]
    Input(#[source] TensorError),
    #[error("graph error: layer `{name}` failed")]
    Layer {
        name: String,
        #[source]
        source: LayerError,
    },
}

/// Index of a layer in the order it was added to a [`Graph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display)]
#[display("#{_0}")]
pub struct LayerId(pub(crate) usize);

impl LayerId {
    /// Output `index` of this layer.
    #[inline]
    pub fn output(self, index: usize) -> BlobRef {
        BlobRef::Output(self, index)
    }
}

/// A producer of a blob: the graph input, or an output of a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum BlobRef {
    #[display("input")]
    Input,
    #[display("{_0}.{_1}")]
    Output(LayerId, usize),
}

impl From<LayerId> for BlobRef {
    /// Output 0 of the layer.
    #[inline]
    fn from(value: LayerId) -> Self {
        Self::Output(value, 0)
    }
}

/// An edge from a producer to input `slot` of layer `to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Binding {
    pub from: BlobRef,
    pub to: LayerId,
    pub slot: usize,
}
