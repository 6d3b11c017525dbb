use std::{ops::Range, sync::Arc};

use casey::snake;
use derive_more::{Deref, DerefMut, Display, From, Into};
use itertools::Itertools;

use super::{
    layout::Layout,
    tensor::{Tensor, TensorError},
};

/// Restriction of one tensor dimension. Ranges are half-open.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum Axis {
    #[default]
    #[display("..")]
    Full,
    /// A single index `i`, i.e. the unit range `i..i + 1`.
    #[display("{_0}")]
    One(usize),
    #[display("{_0}..{_1}")]
    Range(usize, usize),
    #[display("{_0}..")]
    From(usize),
    #[display("..{_0}")]
    To(usize),
}

impl Axis {
    /// Resolves the axis against a dimension of size `len`.
    /// Returns `None` if the range is inverted or exceeds the dimension.
    #[inline]
    pub fn resolve(self, len: usize) -> Option<Range<usize>> {
        let range = match self {
            Axis::Full => 0..len,
            Axis::One(index) => index..index + 1,
            Axis::Range(start, end) => start..end,
            Axis::From(start) => start..len,
            Axis::To(end) => 0..end,
        };
        (range.start <= range.end && range.end <= len).then_some(range)
    }
}

impl From<usize> for Axis {
    #[inline]
    fn from(value: usize) -> Self {
        Self::One(value)
    }
}

impl From<std::ops::RangeFull> for Axis {
    #[inline]
    fn from(_: std::ops::RangeFull) -> Self {
        Self::Full
    }
}

impl From<Range<usize>> for Axis {
    #[inline]
    fn from(value: Range<usize>) -> Self {
        Self::Range(value.start, value.end)
    }
}

impl From<std::ops::RangeFrom<usize>> for Axis {
    #[inline]
    fn from(value: std::ops::RangeFrom<usize>) -> Self {
        Self::From(value.start)
    }
}

impl From<std::ops::RangeTo<usize>> for Axis {
    #[inline]
    fn from(value: std::ops::RangeTo<usize>) -> Self {
        Self::To(value.end)
    }
}

/// Restrictions of the leading dimensions of a tensor.
/// Dimensions past the end of the slice are left unrestricted.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash, Deref, DerefMut, From, Into, Display)]
#[display("[{}]", _0.iter().format(", "))]
pub struct Slice(Arc<[Axis]>);

impl From<Vec<Axis>> for Slice {
    #[inline]
    fn from(value: Vec<Axis>) -> Self {
        Self(value.into())
    }
}

macro_rules! impl_slice_from {
    ($t:ident) => {
        impl<$t: Into<Axis>> From<$t> for Slice {
            #[inline]
            fn from(snake!($t): $t) -> Self {
                Self([snake!($t).into()].into())
            }
        }
    };
    ($($t:ident),+) => {
        impl<$($t),+> From<($($t),+)> for Slice
        where
            $($t: Into<Axis>),+
        {
            #[inline]
            fn from(($(snake!($t)),+): ($($t),+)) -> Self {
                Self([$(snake!($t).into()),+].into())
            }
        }
    };
}

impl_slice_from!(T0);
impl_slice_from!(T0, T1);
impl_slice_from!(T0, T1, T2);
impl_slice_from!(T0, T1, T2, T3);
impl_slice_from!(T0, T1, T2, T3, T4);
impl_slice_from!(T0, T1, T2, T3, T4, T5);
impl_slice_from!(T0, T1, T2, T3, T4, T5, T6);
impl_slice_from!(T0, T1, T2, T3, T4, T5, T6, T7);

impl Slice {
    /// A slice restricting only `axis` to `range`, leaving the axes before it full.
    #[inline]
    pub fn along(axis: usize, range: Range<usize>) -> Self {
        std::iter::repeat_n(Axis::Full, axis)
            .chain([Axis::from(range)])
            .collect_vec()
            .into()
    }

    /// Returns `true` if the slice contains only full axes.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.iter().all(|&axis| matches!(axis, Axis::Full))
    }
}

impl Tensor {
    /// Creates a view restricting the leading dimensions to the ranges of `slice`.
    ///
    /// The view shares the buffer of `self`; writes through it are visible in `self`.
    /// Fails if the slice has more axes than the tensor, or if any range is inverted
    /// or exceeds its dimension.
    pub fn slice(&self, slice: impl Into<Slice>) -> Result<Tensor, TensorError> {
        let slice: Slice = slice.into();
        let layout = self.layout();
        if slice.len() > layout.len() {
            return Err(TensorError::Slice(layout, slice));
        }

        let mut shape = layout.shape().to_vec();
        let mut offset = self.offset();
        for (axis, (&restrict, len)) in slice.iter().zip(shape.iter_mut()).enumerate() {
            let Some(range) = restrict.resolve(*len) else {
                return Err(TensorError::Slice(layout.clone(), slice.clone()));
            };
            offset += range.start * layout.stride_of(axis);
            *len = range.len();
        }

        let layout = Layout::from_shape_stride(shape, layout.stride());
        Ok(self.view(layout, offset))
    }

    /// Creates a view of the feature map of sample `batch`, channel `channel`.
    ///
    /// The result has the trailing dimensions of `self` as its shape, presented as
    /// `[1, w]` when only one trailing dimension exists. Fails if `self` has no more
    /// than two dimensions.
    pub fn plane(&self, batch: usize, channel: usize) -> Result<Tensor, TensorError> {
        let layout = self.layout();
        if layout.len() <= 2 {
            return Err(TensorError::Plane(layout));
        }
        let shape = match &layout.shape()[2..] {
            &[width] => vec![1, width],
            dims => dims.to_vec(),
        };
        self.slice((batch, channel))?.reshape(shape)
    }
}
