use wide::f32x8;

use super::KernelError;

/// Per-plane affine transform: `dst[i] = src[i] · scale + shift`.
pub fn scale_shift(src: &[f32], dst: &mut [f32], scale: f32, shift: f32) -> Result<(), KernelError> {
    KernelError::check_len(src.len(), dst.len())?;

    let src_chunks = src.chunks_exact(8);
    let src_tail = src_chunks.remainder();
    let mut dst_chunks = dst.chunks_exact_mut(8);

    let scale_x8 = f32x8::splat(scale);
    let shift_x8 = f32x8::splat(shift);
    for (x, y) in src_chunks.zip(dst_chunks.by_ref()) {
        let x = f32x8::from(std::array::from_fn::<f32, 8, _>(|i| x[i]));
        y.copy_from_slice(&(x * scale_x8 + shift_x8).to_array());
    }
    for (x, y) in src_tail.iter().zip(dst_chunks.into_remainder()) {
        *y = x * scale + shift;
    }
    Ok(())
}
