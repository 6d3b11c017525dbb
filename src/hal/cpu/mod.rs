//! CPU kernels over plain `f32` slices.
//!
//! Kernels take their operands as slices and report size problems as [`KernelError`]
//! instead of panicking. With the `rayon` feature, independent output rows and planes
//! are processed in parallel; results are identical either way.

use thiserror::Error;

pub mod elementwise;
pub mod im2col;
pub mod matmul;
pub mod norm;

use im2col::{ConvGeometry, Size2d};

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("kernel geometry error: {0} has no valid output")]
    Geometry(ConvGeometry),
    #[error("kernel buffer error: expected {expected} elements, found {actual}")]
    Length { expected: usize, actual: usize },
    #[error("kernel matmul error: inner dims {0} and {1} not match")]
    Inner(usize, usize),
    #[error("kernel offsets error: table of {channels} channels with {kernel} kernel not match {geometry}")]
    Offsets {
        channels: usize,
        kernel: Size2d,
        geometry: ConvGeometry,
    },
}

impl KernelError {
    #[inline]
    pub(crate) fn check_len(expected: usize, actual: usize) -> Result<(), Self> {
        match expected == actual {
            true => Ok(()),
            false => Err(Self::Length { expected, actual }),
        }
    }
}
