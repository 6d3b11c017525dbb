use super::KernelError;

/// A read-only strided matrix over a slice.
///
/// [`MatRef::t`] swaps the strides, so operands can be fed in transposed form without copying.
#[derive(Debug, Clone, Copy)]
pub struct MatRef<'a> {
    data: &'a [f32],
    rows: usize,
    cols: usize,
    row_stride: usize,
    col_stride: usize,
}

impl<'a> MatRef<'a> {
    /// A row-major `rows × cols` matrix.
    pub fn new(data: &'a [f32], rows: usize, cols: usize) -> Result<Self, KernelError> {
        KernelError::check_len(rows * cols, data.len())?;
        Ok(Self {
            data,
            rows,
            cols,
            row_stride: cols,
            col_stride: 1,
        })
    }

    /// The transposed matrix.
    #[inline]
    pub fn t(self) -> Self {
        Self {
            data: self.data,
            rows: self.cols,
            cols: self.rows,
            row_stride: self.col_stride,
            col_stride: self.row_stride,
        }
    }

    #[inline]
    pub fn rows(&self) -> usize {
        self.rows
    }

    #[inline]
    pub fn cols(&self) -> usize {
        self.cols
    }

    #[inline]
    fn get(&self, row: usize, col: usize) -> f32 {
        self.data[row * self.row_stride + col * self.col_stride]
    }
}

/// Computes `c = a · b`, overwriting `c` (row-major, `a.rows() × b.cols()`).
pub fn matmul(a: MatRef, b: MatRef, c: &mut [f32]) -> Result<(), KernelError> {
    if a.cols() != b.rows() {
        return Err(KernelError::Inner(a.cols(), b.rows()));
    }
    KernelError::check_len(a.rows() * b.cols(), c.len())?;
    if b.cols() == 0 {
        return Ok(());
    }

    let row = |(i, row): (usize, &mut [f32])| {
        row.fill(0.0);
        for k in 0..a.cols() {
            let x = a.get(i, k);
            for (j, value) in row.iter_mut().enumerate() {
                *value += x * b.get(k, j);
            }
        }
    };

    #[cfg(not(feature = "rayon"))]
    c.chunks_exact_mut(b.cols()).enumerate().for_each(row);
    #[cfg(feature = "rayon")]
    {
        use rayon::prelude::*;
        c.par_chunks_exact_mut(b.cols()).enumerate().for_each(row);
    }

    Ok(())
}
