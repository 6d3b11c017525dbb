use std::sync::Arc;

use derive_more::{Deref, Display, From, Into};
use itertools::Itertools;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::tensor::TensorError;

/// Maximum number of dimensions a tensor may have.
pub const MAX_DIMS: usize = 32;

/// Product of a sequence of dimension sizes. Returns `1` for an empty (scalar) shape.
#[inline]
pub fn shape_total(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// Returns `true` if both shapes have the same rank and the same sizes.
#[inline]
pub fn shape_equal(a: &[usize], b: &[usize]) -> bool {
    a == b
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Hash, Deref, From, Into, Display)]
#[display("[{}]", _0.iter().format(", "))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Shape(Arc<[usize]>);

impl<const N: usize> From<[usize; N]> for Shape {
    #[inline]
    fn from(value: [usize; N]) -> Self {
        Self(value.into())
    }
}

impl From<Vec<usize>> for Shape {
    #[inline]
    fn from(value: Vec<usize>) -> Self {
        Self(value.into())
    }
}

impl From<&[usize]> for Shape {
    #[inline]
    fn from(value: &[usize]) -> Self {
        Self(value.into())
    }
}

impl Shape {
    /// Total number of elements described by the shape.
    #[inline]
    pub fn total(&self) -> usize {
        shape_total(self)
    }

    /// Appends the dimensions of `other` after the dimensions of `self`.
    #[inline]
    pub fn concat(&self, other: &Shape) -> Shape {
        self.iter().chain(other.iter()).copied().collect_vec().into()
    }

    /// Converts the shape into a fixed-size array. Fails if the rank differs from `N`.
    #[inline]
    pub fn try_to_array<const N: usize>(&self) -> Result<[usize; N], TensorError> {
        <[usize; N]>::try_from(&self[..]).map_err(|_| TensorError::Dims(self.clone(), N))
    }

    /// Row-major strides of the shape.
    pub fn canonical_stride(&self) -> Arc<[usize]> {
        let mut stride = vec![1; self.len()];
        for axis in (0..self.len().saturating_sub(1)).rev() {
            stride[axis] = stride[axis + 1] * self[axis + 1];
        }
        stride.into()
    }
}

/// Shape plus per-dimension element strides.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Display)]
#[display("{shape}:[{}]", stride.iter().format(", "))]
pub struct Layout {
    shape: Shape,
    stride: Arc<[usize]>,
}

pub trait IntoLayout {
    fn into_layout(self) -> Layout;
}

impl IntoLayout for Layout {
    #[inline]
    fn into_layout(self) -> Layout {
        self
    }
}

impl IntoLayout for Shape {
    #[inline]
    fn into_layout(self) -> Layout {
        Layout::from_shape(self)
    }
}

impl<const N: usize> IntoLayout for [usize; N] {
    #[inline]
    fn into_layout(self) -> Layout {
        Layout::from_shape(self)
    }
}

impl IntoLayout for Vec<usize> {
    #[inline]
    fn into_layout(self) -> Layout {
        Layout::from_shape(self)
    }
}

impl IntoLayout for &[usize] {
    #[inline]
    fn into_layout(self) -> Layout {
        Layout::from_shape(self)
    }
}

impl Layout {
    /// Creates a row-major layout of the given shape.
    #[inline]
    pub fn from_shape(shape: impl Into<Shape>) -> Self {
        let shape = shape.into();
        let stride = shape.canonical_stride();
        Self { shape, stride }
    }

    #[inline]
    pub(crate) fn from_shape_stride(shape: impl Into<Shape>, stride: Arc<[usize]>) -> Self {
        let shape = shape.into();
        debug_assert_eq!(shape.len(), stride.len());
        Self { shape, stride }
    }

    #[inline]
    pub fn shape(&self) -> Shape {
        self.shape.clone()
    }

    #[inline]
    pub fn stride(&self) -> Arc<[usize]> {
        self.stride.clone()
    }

    #[inline]
    pub fn shape_of(&self, axis: usize) -> usize {
        self.shape[axis]
    }

    #[inline]
    pub fn stride_of(&self, axis: usize) -> usize {
        self.stride[axis]
    }

    /// Number of dimensions.
    #[inline]
    pub fn len(&self) -> usize {
        self.shape.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.shape.is_empty()
    }

    /// Number of elements.
    #[inline]
    pub fn size(&self) -> usize {
        self.shape.total()
    }

    /// Returns `true` if elements are laid out densely in row-major order.
    /// Axes of size 1 do not affect contiguity.
    pub fn is_contiguous(&self) -> bool {
        if self.size() == 0 {
            return true;
        }
        let mut expected = 1;
        for (&shape, &stride) in self.shape.iter().zip(self.stride.iter()).rev() {
            if shape == 1 {
                continue;
            }
            if stride != expected {
                return false;
            }
            expected *= shape;
        }
        true
    }

    /// Element offset of a multi-dimensional index. Does not check bounds.
    #[inline]
    pub fn value(&self, index: &[usize]) -> usize {
        index
            .iter()
            .zip_eq(self.stride.iter())
            .map(|(index, stride)| index * stride)
            .sum()
    }

    /// Element offsets of every index, in row-major order of the shape.
    pub fn offsets(&self) -> Vec<usize> {
        let size = self.size();
        let mut offsets = Vec::with_capacity(size);
        if size == 0 {
            return offsets;
        }

        let mut index = vec![0usize; self.len()];
        let mut offset = 0;
        loop {
            offsets.push(offset);

            let mut axis = self.len();
            loop {
                if axis == 0 {
                    return offsets;
                }
                axis -= 1;
                index[axis] += 1;
                offset += self.stride[axis];
                if index[axis] < self.shape[axis] {
                    break;
                }
                offset -= self.stride[axis] * index[axis];
                index[axis] = 0;
            }
        }
    }
}
