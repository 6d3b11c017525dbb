use std::{
    ops::{Deref, DerefMut, Range},
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use itertools::Itertools;
use thiserror::Error;

use super::{
    layout::{IntoLayout, Layout, MAX_DIMS, Shape},
    slice::Slice,
};

#[derive(Debug, Error)]
pub enum TensorError {
    #[error("tensor creation error: layout {0}'s size not match data len {1}")]
    Create(Layout, usize),
    #[error("tensor rank error: rank {0} is outside the supported range")]
    Rank(usize),
    #[error("tensor cast error: {0} bytes is not a whole number of f32 elements")]
    Cast(usize),
    #[error("tensor reshape error: layout {0}'s size not match layout {1}'s")]
    Reshape(Layout, Layout),
    #[error("tensor slice error: slice {1} is not compatible with layout {0}")]
    Slice(Layout, Slice),
    #[error("tensor plane error: layout {0} has no dimensions past the first two")]
    Plane(Layout),
    #[error("tensor access error: layout {0} is not contiguous")]
    Contiguous(Layout),
    #[error("tensor shape error: shape {0} mismatches {1}")]
    Shape(Shape, Shape),
    #[error("tensor dims error: shape {0} does not have {1} dimensions")]
    Dims(Shape, usize),
    #[error("tensor index error: index {0:?} is out of shape {1}")]
    Index(Vec<usize>, Shape),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TensorId;

type Buffer = Arc<RwLock<Box<[f32]>>>;

/// A dense, strided, N-dimensional array of `f32`.
///
/// Cloning a tensor, or taking a [`slice`](Tensor::slice) or [`plane`](Tensor::plane) of it,
/// produces a handle that shares the same buffer. The buffer is freed when the last handle drops.
#[derive(Debug, Clone)]
pub struct Tensor {
    buffer: Buffer,
    layout: Layout,
    offset: usize,
    id: uid::Id<TensorId>,
}

/// Read access to the elements of a contiguous tensor.
pub struct TensorRead<'a> {
    guard: RwLockReadGuard<'a, Box<[f32]>>,
    range: Range<usize>,
}

impl Deref for TensorRead<'_> {
    type Target = [f32];

    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.guard[self.range.clone()]
    }
}

/// Write access to the elements of a contiguous tensor.
pub struct TensorWrite<'a> {
    guard: RwLockWriteGuard<'a, Box<[f32]>>,
    range: Range<usize>,
}

impl Deref for TensorWrite<'_> {
    type Target = [f32];

    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.guard[self.range.clone()]
    }
}

impl DerefMut for TensorWrite<'_> {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard[self.range.clone()]
    }
}

impl Tensor {
    fn check_rank(layout: &Layout) -> Result<(), TensorError> {
        match layout.len() {
            1..=MAX_DIMS => Ok(()),
            rank => Err(TensorError::Rank(rank)),
        }
    }

    /// Create a tensor with the given layout and contents.
    pub fn from_data(
        layout: impl IntoLayout,
        contents: impl Into<Box<[f32]>>,
    ) -> Result<Self, TensorError> {
        let layout = Layout::from_shape(layout.into_layout().shape());
        Self::check_rank(&layout)?;

        let contents: Box<[f32]> = contents.into();
        if layout.size() != contents.len() {
            return Err(TensorError::Create(layout, contents.len()));
        }

        let buffer = Arc::new(RwLock::new(contents));
        let offset = 0;
        let id = uid::Id::new();
        Ok(Self {
            buffer,
            layout,
            offset,
            id,
        })
    }

    /// Create a tensor from native-endian `f32` bytes.
    pub fn from_bytes(layout: impl IntoLayout, bytes: &[u8]) -> Result<Self, TensorError> {
        if bytes.len() % size_of::<f32>() != 0 {
            return Err(TensorError::Cast(bytes.len()));
        }
        let contents: Vec<f32> = bytemuck::pod_collect_to_vec(bytes);
        Self::from_data(layout, contents)
    }

    /// Create a tensor filled with `value`.
    #[inline]
    pub fn full(layout: impl IntoLayout, value: f32) -> Result<Self, TensorError> {
        let layout = layout.into_layout();
        let contents = vec![value; layout.size()];
        Self::from_data(layout, contents)
    }

    /// Create a tensor of zeros.
    #[inline]
    pub fn zeros(layout: impl IntoLayout) -> Result<Self, TensorError> {
        Self::full(layout, 0.0)
    }

    /// Create a tensor of zeros with the same shape.
    #[inline]
    pub fn zeros_like(&self) -> Result<Self, TensorError> {
        Self::zeros(self.shape())
    }

    /// A handle sharing the buffer of `self` with another layout and offset.
    #[inline]
    pub(crate) fn view(&self, layout: Layout, offset: usize) -> Self {
        let buffer = self.buffer.clone();
        let id = self.id;
        Self {
            buffer,
            layout,
            offset,
            id,
        }
    }

    #[inline]
    pub fn layout(&self) -> Layout {
        self.layout.clone()
    }

    #[inline]
    pub fn shape(&self) -> Shape {
        self.layout.shape()
    }

    /// Number of dimensions.
    #[inline]
    pub fn dims(&self) -> usize {
        self.layout.len()
    }

    /// Number of elements.
    #[inline]
    pub fn size(&self) -> usize {
        self.layout.size()
    }

    #[inline]
    pub(crate) fn offset(&self) -> usize {
        self.offset
    }

    /// Identifier of the underlying buffer. Views report the id of the buffer they share.
    #[inline]
    pub fn id(&self) -> uid::Id<TensorId> {
        self.id
    }

    /// Number of handles sharing the buffer.
    #[inline]
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.buffer)
    }

    #[inline]
    pub fn shares_buffer(&self, other: &Tensor) -> bool {
        Arc::ptr_eq(&self.buffer, &other.buffer)
    }

    #[inline]
    pub fn is_contiguous(&self) -> bool {
        self.layout.is_contiguous()
    }

    #[inline]
    fn range(&self) -> Result<Range<usize>, TensorError> {
        match self.layout.is_contiguous() {
            true => Ok(self.offset..self.offset + self.size()),
            false => Err(TensorError::Contiguous(self.layout())),
        }
    }

    /// Borrows the elements of a contiguous tensor.
    pub fn read(&self) -> Result<TensorRead<'_>, TensorError> {
        let range = self.range()?;
        let guard = self.buffer.read().expect("failed to lock");
        Ok(TensorRead { guard, range })
    }

    /// Mutably borrows the elements of a contiguous tensor.
    pub fn write(&mut self) -> Result<TensorWrite<'_>, TensorError> {
        let range = self.range()?;
        let guard = self.buffer.write().expect("failed to lock");
        Ok(TensorWrite { guard, range })
    }

    /// Copies the elements out in row-major order. Works for strided views.
    pub fn to_vec(&self) -> Vec<f32> {
        let data = self.buffer.read().expect("failed to lock");
        match self.range() {
            Ok(range) => data[range].to_vec(),
            Err(_) => self
                .layout
                .offsets()
                .into_iter()
                .map(|offset| data[self.offset + offset])
                .collect(),
        }
    }

    /// Returns `self` if contiguous; otherwise a contiguous copy of it.
    pub fn contiguous(&self) -> Result<Tensor, TensorError> {
        match self.is_contiguous() {
            true => Ok(self.clone()),
            false => self.deep_clone(),
        }
    }

    /// Copies the elements into a new buffer.
    #[inline]
    pub fn deep_clone(&self) -> Result<Tensor, TensorError> {
        Self::from_data(self.shape(), self.to_vec())
    }

    /// Reads the element at a multi-dimensional index.
    pub fn at(&self, index: &[usize]) -> Result<f32, TensorError> {
        let shape = self.shape();
        let in_bounds = index.len() == shape.len()
            && index.iter().zip_eq(shape.iter()).all(|(i, len)| i < len);
        if !in_bounds {
            return Err(TensorError::Index(index.to_vec(), shape));
        }
        let data = self.buffer.read().expect("failed to lock");
        Ok(data[self.offset + self.layout.value(index)])
    }

    /// Sets every element of the tensor (or view) to `value`.
    pub fn fill(&mut self, value: f32) -> Result<(), TensorError> {
        if let Ok(mut data) = self.write() {
            data.fill(value);
            return Ok(());
        }
        let mut data = self.buffer.write().expect("failed to lock");
        for offset in self.layout.offsets() {
            data[self.offset + offset] = value;
        }
        Ok(())
    }

    /// Copies the elements of `source` into `self`. Both may be strided views;
    /// their shapes must be equal.
    pub fn copy_from(&mut self, source: &Tensor) -> Result<(), TensorError> {
        if self.shape() != source.shape() {
            return Err(TensorError::Shape(self.shape(), source.shape()));
        }

        // gather first, so that `source` may share the buffer of `self`
        let contents = source.to_vec();
        if let Ok(mut data) = self.write() {
            data.copy_from_slice(&contents);
            return Ok(());
        }
        let mut data = self.buffer.write().expect("failed to lock");
        for (offset, value) in self.layout.offsets().into_iter().zip_eq(contents) {
            data[self.offset + offset] = value;
        }
        Ok(())
    }

    /// Reshape the tensor, leaving the underlying data untouched.
    /// Only contiguous tensors may be reshaped.
    pub fn reshape(self, layout: impl IntoLayout) -> Result<Self, TensorError> {
        let layout = Layout::from_shape(layout.into_layout().shape());
        Self::check_rank(&layout)?;
        if self.layout.size() != layout.size() {
            return Err(TensorError::Reshape(self.layout(), layout));
        }
        if !self.is_contiguous() {
            return Err(TensorError::Contiguous(self.layout()));
        }
        Ok(Self { layout, ..self })
    }
}
