use super::KernelError;

/// `acc[i] += x[i]`.
pub fn add_assign(acc: &mut [f32], x: &[f32]) -> Result<(), KernelError> {
    KernelError::check_len(acc.len(), x.len())?;
    #[cfg(not(feature = "rayon"))]
    {
        use itertools::Itertools;
        acc.iter_mut().zip_eq(x).for_each(|(acc, x)| *acc += x);
    }
    #[cfg(feature = "rayon")]
    {
        use rayon::prelude::*;
        acc.par_iter_mut()
            .zip_eq(x.par_iter())
            .for_each(|(acc, x)| *acc += x);
    }
    Ok(())
}

/// `acc[i] *= x[i]`.
pub fn mul_assign(acc: &mut [f32], x: &[f32]) -> Result<(), KernelError> {
    KernelError::check_len(acc.len(), x.len())?;
    #[cfg(not(feature = "rayon"))]
    {
        use itertools::Itertools;
        acc.iter_mut().zip_eq(x).for_each(|(acc, x)| *acc *= x);
    }
    #[cfg(feature = "rayon")]
    {
        use rayon::prelude::*;
        acc.par_iter_mut()
            .zip_eq(x.par_iter())
            .for_each(|(acc, x)| *acc *= x);
    }
    Ok(())
}

/// `acc[i] = max(acc[i], x[i])`.
pub fn max_assign(acc: &mut [f32], x: &[f32]) -> Result<(), KernelError> {
    KernelError::check_len(acc.len(), x.len())?;
    #[cfg(not(feature = "rayon"))]
    {
        use itertools::Itertools;
        acc.iter_mut()
            .zip_eq(x)
            .for_each(|(acc, &x)| *acc = acc.max(x));
    }
    #[cfg(feature = "rayon")]
    {
        use rayon::prelude::*;
        acc.par_iter_mut()
            .zip_eq(x.par_iter())
            .for_each(|(acc, &x)| *acc = acc.max(x));
    }
    Ok(())
}

/// `acc[i] += alpha · x[i]`.
pub fn axpy(acc: &mut [f32], alpha: f32, x: &[f32]) -> Result<(), KernelError> {
    KernelError::check_len(acc.len(), x.len())?;
    #[cfg(not(feature = "rayon"))]
    {
        use itertools::Itertools;
        acc.iter_mut()
            .zip_eq(x)
            .for_each(|(acc, x)| *acc += alpha * x);
    }
    #[cfg(feature = "rayon")]
    {
        use rayon::prelude::*;
        acc.par_iter_mut()
            .zip_eq(x.par_iter())
            .for_each(|(acc, x)| *acc += alpha * x);
    }
    Ok(())
}

/// Adds `bias[r]` to every element of row `r` of a row-major matrix with rows of length `row_len`.
pub fn add_row_bias(acc: &mut [f32], row_len: usize, bias: &[f32]) -> Result<(), KernelError> {
    KernelError::check_len(bias.len() * row_len, acc.len())?;
    if row_len == 0 {
        return Ok(());
    }
    #[cfg(not(feature = "rayon"))]
    {
        use itertools::Itertools;
        acc.chunks_exact_mut(row_len)
            .zip_eq(bias)
            .for_each(|(row, &bias)| row.iter_mut().for_each(|x| *x += bias));
    }
    #[cfg(feature = "rayon")]
    {
        use rayon::prelude::*;
        acc.par_chunks_exact_mut(row_len)
            .zip_eq(bias.par_iter())
            .for_each(|(row, &bias)| row.iter_mut().for_each(|x| *x += bias));
    }
    Ok(())
}
