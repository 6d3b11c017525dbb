//! A small CPU inference engine for layer graphs.
//!
//! - [`loom`]: tensors, layouts and views.
//! - [`hal`]: the numeric kernels (im2col, matmul, elementwise, normalization).
//! - [`layers`]: the layer trait, parameters, the registry and the built-in layers.
//! - [`net`]: building a graph of layers and running it.

pub mod hal;
pub mod layers;
pub mod loom;
pub mod net;
