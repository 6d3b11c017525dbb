use std::sync::Arc;

use derive_more::Display;
use itertools::Itertools;

use super::KernelError;

/// A pair of spatial sizes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[display("{height}x{width}")]
pub struct Size2d {
    pub height: usize,
    pub width: usize,
}

impl Size2d {
    #[inline]
    pub const fn new(height: usize, width: usize) -> Self {
        Self { height, width }
    }

    #[inline]
    pub const fn area(&self) -> usize {
        self.height * self.width
    }
}

impl From<usize> for Size2d {
    #[inline]
    fn from(value: usize) -> Self {
        Self::new(value, value)
    }
}

impl From<(usize, usize)> for Size2d {
    #[inline]
    fn from((height, width): (usize, usize)) -> Self {
        Self::new(height, width)
    }
}

/// Geometry of a 2-D sliding window over a `C×H×W` image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[display("{channels}x{input} (kernel {kernel}, pad {pad}, stride {stride}, dilation {dilation})")]
pub struct ConvGeometry {
    pub channels: usize,
    pub input: Size2d,
    pub kernel: Size2d,
    pub pad: Size2d,
    pub stride: Size2d,
    pub dilation: Size2d,
}

impl ConvGeometry {
    /// Span of the dilated kernel.
    #[inline]
    pub fn extent(&self) -> Size2d {
        let extent = |kernel: usize, dilation: usize| dilation * (kernel.saturating_sub(1)) + 1;
        Size2d::new(
            extent(self.kernel.height, self.dilation.height),
            extent(self.kernel.width, self.dilation.width),
        )
    }

    /// Number of window positions along each axis:
    /// `(input + 2·pad − (dilation·(kernel − 1) + 1)) / stride + 1`.
    pub fn output(&self) -> Result<Size2d, KernelError> {
        let invalid = [self.kernel, self.stride, self.dilation]
            .iter()
            .any(|size| size.height == 0 || size.width == 0);
        if invalid {
            return Err(KernelError::Geometry(*self));
        }

        let extent = self.extent();
        let output = |input: usize, pad: usize, extent: usize, stride: usize| {
            (input + 2 * pad)
                .checked_sub(extent)
                .map(|span| span / stride + 1)
        };
        let height = output(
            self.input.height,
            self.pad.height,
            extent.height,
            self.stride.height,
        );
        let width = output(
            self.input.width,
            self.pad.width,
            extent.width,
            self.stride.width,
        );
        match (height, width) {
            (Some(height), Some(width)) => Ok(Size2d::new(height, width)),
            _ => Err(KernelError::Geometry(*self)),
        }
    }

    /// Length of one row of the column matrix: `C·kH·kW`.
    #[inline]
    pub fn column_len(&self) -> usize {
        self.channels * self.kernel.area()
    }

    /// Number of elements of the image: `C·H·W`.
    #[inline]
    pub fn image_len(&self) -> usize {
        self.channels * self.input.area()
    }

    /// Number of elements of the column matrix: `outH·outW·C·kH·kW`.
    #[inline]
    pub fn matrix_len(&self) -> Result<usize, KernelError> {
        Ok(self.output()?.area() * self.column_len())
    }

    /// Top-left corner of the window at output position `(y, x)`, in padded coordinates
    /// shifted back to the image.
    #[inline]
    fn origin(&self, y: usize, x: usize) -> (isize, isize) {
        let y = (y * self.stride.height) as isize - self.pad.height as isize;
        let x = (x * self.stride.width) as isize - self.pad.width as isize;
        (y, x)
    }

    /// Image index of the tap at kernel `(row, col)` of channel `channel`,
    /// for a window with top-left corner `(y, x)`. `None` if it falls into padding.
    #[inline]
    fn tap(&self, (y, x): (isize, isize), offset: ColumnOffset) -> Option<usize> {
        let y = y + (offset.row * self.dilation.height) as isize;
        let x = x + (offset.col * self.dilation.width) as isize;
        let inside = (0..self.input.height as isize).contains(&y)
            && (0..self.input.width as isize).contains(&x);
        inside.then(|| {
            (offset.channel * self.input.height + y as usize) * self.input.width + x as usize
        })
    }
}

/// Position of one column of the column matrix within the kernel window.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ColumnOffset {
    /// Kernel column (`w_offset`).
    pub col: usize,
    /// Kernel row (`h_offset`).
    pub row: usize,
    pub channel: usize,
}

/// Per-column offset table, ordered channel → kernel row → kernel col.
/// Depends only on the channel count and the kernel size, and can be reused across calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnOffsets {
    channels: usize,
    kernel: Size2d,
    offsets: Arc<[ColumnOffset]>,
}

impl ColumnOffsets {
    pub fn new(channels: usize, kernel: Size2d) -> Self {
        let offsets = itertools::iproduct!(0..channels, 0..kernel.height, 0..kernel.width)
            .map(|(channel, row, col)| ColumnOffset { col, row, channel })
            .collect();
        Self {
            channels,
            kernel,
            offsets,
        }
    }

    #[inline]
    pub fn from_geometry(geometry: &ConvGeometry) -> Self {
        Self::new(geometry.channels, geometry.kernel)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = &ColumnOffset> {
        self.offsets.iter()
    }

    fn check(&self, geometry: &ConvGeometry) -> Result<(), KernelError> {
        match self.channels == geometry.channels && self.kernel == geometry.kernel {
            true => Ok(()),
            false => Err(KernelError::Offsets {
                channels: self.channels,
                kernel: self.kernel,
                geometry: *geometry,
            }),
        }
    }
}

/// Lowers a `C×H×W` image into a row-major `(outH·outW) × (C·kH·kW)` matrix.
///
/// Row `y·outW + x` holds the receptive field of output position `(y, x)`;
/// taps falling into the padding are zero.
pub fn im2col(
    image: &[f32],
    geometry: &ConvGeometry,
    columns: &mut [f32],
) -> Result<(), KernelError> {
    let output = geometry.output()?;
    let row_len = geometry.column_len();
    KernelError::check_len(geometry.image_len(), image.len())?;
    KernelError::check_len(output.area() * row_len, columns.len())?;
    if row_len == 0 {
        return Ok(());
    }

    let offsets = ColumnOffsets::from_geometry(geometry);
    let extent = geometry.extent();
    let plane = geometry.input.area() as isize;
    let taps = offsets
        .iter()
        .map(|offset| {
            offset.channel as isize * plane
                + (offset.row * geometry.dilation.height * geometry.input.width) as isize
                + (offset.col * geometry.dilation.width) as isize
        })
        .collect_vec();

    let fill = |(index, row): (usize, &mut [f32])| {
        let (y, x) = geometry.origin(index / output.width, index % output.width);
        let inside = y >= 0
            && x >= 0
            && y as usize + extent.height <= geometry.input.height
            && x as usize + extent.width <= geometry.input.width;
        match inside {
            true => {
                let base = y * geometry.input.width as isize + x;
                for (value, tap) in row.iter_mut().zip_eq(taps.iter()) {
                    *value = image[(base + tap) as usize];
                }
            }
            false => {
                for (value, &offset) in row.iter_mut().zip_eq(offsets.iter()) {
                    *value = geometry
                        .tap((y, x), offset)
                        .map_or(0.0, |index| image[index]);
                }
            }
        }
    };

    #[cfg(not(feature = "rayon"))]
    columns.chunks_exact_mut(row_len).enumerate().for_each(fill);
    #[cfg(feature = "rayon")]
    {
        use rayon::prelude::*;
        columns
            .par_chunks_exact_mut(row_len)
            .enumerate()
            .for_each(fill);
    }

    Ok(())
}

/// Scatters a column matrix in [`im2col`] layout back into a `C×H×W` image.
///
/// The image is zeroed first; every tap accumulates into the pixel it was read from,
/// so overlapping windows sum up. Taps in the padding are dropped.
pub fn col2im(
    columns: &[f32],
    geometry: &ConvGeometry,
    offsets: &ColumnOffsets,
    image: &mut [f32],
) -> Result<(), KernelError> {
    offsets.check(geometry)?;
    let output = geometry.output()?;
    let row_len = geometry.column_len();
    KernelError::check_len(output.area() * row_len, columns.len())?;
    KernelError::check_len(geometry.image_len(), image.len())?;

    image.fill(0.0);
    let plane_len = geometry.input.area();
    if plane_len == 0 {
        return Ok(());
    }

    // the table is ordered channel first: the taps of a channel are one contiguous run
    let taps_len = geometry.kernel.area();
    let scatter = |(channel, plane): (usize, &mut [f32])| {
        let base = channel * plane_len;
        let first = channel * taps_len;
        let taps = offsets.offsets[first..first + taps_len].iter();
        for (col, &offset) in (first..).zip(taps) {
            debug_assert_eq!(offset.channel, channel);
            for (y, x) in itertools::iproduct!(0..output.height, 0..output.width) {
                let origin = geometry.origin(y, x);
                if let Some(index) = geometry.tap(origin, offset) {
                    let row = y * output.width + x;
                    plane[index - base] += columns[row * row_len + col];
                }
            }
        }
    };

    #[cfg(not(feature = "rayon"))]
    image.chunks_exact_mut(plane_len).enumerate().for_each(scatter);
    #[cfg(feature = "rayon")]
    {
        use rayon::prelude::*;
        image
            .par_chunks_exact_mut(plane_len)
            .enumerate()
            .for_each(scatter);
    }

    Ok(())
}
