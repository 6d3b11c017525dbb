use super::{Layer, LayerError, LayerFactory, LayerParams, check_input_count, check_outputs};
use crate::{hal::cpu::im2col::Size2d, loom::tensor::Tensor};

/// Partial inverse of max pooling.
///
/// Takes the pooled values and the in-plane indices of their maxima, and scatters
/// every value back to its index in a zeroed plane of the unpooled size.
#[derive(Debug, Clone)]
pub struct MaxUnpool {
    name: String,
    kernel: Size2d,
    pad: Size2d,
    stride: Size2d,
}

impl MaxUnpool {
    pub fn new(name: impl ToString, kernel: Size2d, pad: Size2d, stride: Size2d) -> Self {
        Self {
            name: name.to_string(),
            kernel,
            pad,
            stride,
        }
    }

    /// `(input − 1) · stride + kernel − 2 · pad` along each axis.
    fn output_size(&self, input: Size2d) -> Option<Size2d> {
        let unpooled = |input: usize, stride: usize, kernel: usize, pad: usize| {
            input
                .checked_sub(1)?
                .checked_mul(stride)?
                .checked_add(kernel)?
                .checked_sub(2 * pad)
        };
        let height = unpooled(
            input.height,
            self.stride.height,
            self.kernel.height,
            self.pad.height,
        )?;
        let width = unpooled(
            input.width,
            self.stride.width,
            self.kernel.width,
            self.pad.width,
        )?;
        Some(Size2d::new(height, width))
    }
}

impl LayerFactory for MaxUnpool {
    const KIND: &'static str = "MaxUnpool";

    fn create(params: LayerParams) -> Result<Self, LayerError> {
        let kernel = params.size2d("pool_k", None)?;
        let pad = params.size2d("pool_pad", None)?;
        let stride = params.size2d("pool_stride", None)?;
        Ok(Self::new(params.name, kernel, pad, stride))
    }
}

impl Layer for MaxUnpool {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn allocate(&mut self, inputs: &[Tensor]) -> Result<Vec<Tensor>, LayerError> {
        check_input_count(&self.name, inputs, 2, false)?;

        let shape = inputs[0].shape();
        if inputs[0].size() != inputs[1].size() {
            return Err(LayerError::shape(
                &self.name,
                format!(
                    "values of shape {shape} and indices of shape {} differ in size",
                    inputs[1].shape()
                ),
            ));
        }
        let [n, c, h, w] = match shape.try_to_array::<4>() {
            Ok([1, c, h, w]) => [1, c, h, w],
            _ => {
                return Err(LayerError::shape(
                    &self.name,
                    format!("values of shape {shape} are not 4-D with batch 1"),
                ));
            }
        };

        let Some(output) = self.output_size(Size2d::new(h, w)) else {
            return Err(LayerError::shape(
                &self.name,
                format!("input {h}x{w} has no unpooled size"),
            ));
        };
        Ok(vec![Tensor::zeros([n, c, output.height, output.width])?])
    }

    fn forward(&self, inputs: &[Tensor], outputs: &mut [Tensor]) -> Result<(), LayerError> {
        check_input_count(&self.name, inputs, 2, false)?;
        check_outputs(&self.name, outputs, 1)?;

        let [_, c, h, w] = inputs[0].shape().try_to_array::<4>()?;
        let [_, _, out_h, out_w] = outputs[0].shape().try_to_array::<4>()?;
        let (in_plane, out_plane) = (h * w, out_h * out_w);

        let indices = inputs[1].to_vec();
        let values = inputs[0].contiguous()?;
        let values = values.read()?;
        let mut output = outputs[0].write()?;
        output.fill(0.0);

        for channel in 0..c {
            let src = channel * in_plane..(channel + 1) * in_plane;
            let dst = &mut output[channel * out_plane..(channel + 1) * out_plane];
            for (&value, &index) in values[src.clone()].iter().zip(&indices[src]) {
                // `as` saturates NaN to 0
                let index = match index.is_finite() {
                    true => index as isize,
                    false => isize::MIN,
                };
                if !(0..out_plane as isize).contains(&index) {
                    return Err(LayerError::Bounds {
                        layer: self.name.clone(),
                        index,
                        bound: out_plane,
                    });
                }
                dst[index as usize] = value;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use itertools::Itertools;

    use super::MaxUnpool;
    use crate::{
        hal::cpu::im2col::Size2d,
        layers::{Layer, LayerError, LayerFactory, LayerParams, pooling::MaxPool},
        loom::tensor::Tensor,
    };

    fn unpool_params() -> LayerParams {
        LayerParams::new("MaxUnpool", "unpool")
            .with("pool_k_h", 2usize)
            .with("pool_k_w", 2usize)
            .with("pool_pad_h", 0usize)
            .with("pool_pad_w", 0usize)
            .with("pool_stride_h", 2usize)
            .with("pool_stride_w", 2usize)
    }

    #[test]
    fn test_unpool_scatter() -> Result<(), Box<dyn Error>> {
        let values = Tensor::from_data([1, 1, 2, 2], vec![5.0, 8.0, 9.0, 7.0])?;
        let indices = Tensor::from_data([1, 1, 2, 2], vec![1.0, 6.0, 12.0, 10.0])?;
        let inputs = [values, indices];

        let mut layer = MaxUnpool::create(unpool_params())?;
        let mut outputs = layer.allocate(&inputs)?;
        assert_eq!(&outputs[0].shape()[..], &[1, 1, 4, 4]);

        layer.forward(&inputs, &mut outputs)?;
        #[rustfmt::skip]
        let expected = vec![
            0.0, 5.0, 0.0, 0.0,
            0.0, 0.0, 8.0, 0.0,
            0.0, 0.0, 7.0, 0.0,
            9.0, 0.0, 0.0, 0.0,
        ];
        assert_eq!(outputs[0].to_vec(), expected);
        Ok(())
    }

    #[test]
    fn test_unpool_inverts_pool() -> Result<(), Box<dyn Error>> {
        fastrand::seed(42);

        let data = (0..3 * 6 * 6).map(|_| fastrand::f32() + 0.1).collect_vec();
        let input = Tensor::from_data([1, 3, 6, 6], data.clone())?;

        let params = LayerParams::new("MaxPool", "pool")
            .with("kernel_size", 2usize)
            .with("stride", 2usize);
        let mut pool = MaxPool::create(params)?;
        let pool_inputs = [input];
        let mut pooled = pool.allocate(&pool_inputs)?;
        pool.forward(&pool_inputs, &mut pooled)?;

        let mut unpool = MaxUnpool::create(unpool_params())?;
        let mut unpooled = unpool.allocate(&pooled)?;
        unpool.forward(&pooled, &mut unpooled)?;
        assert_eq!(&unpooled[0].shape()[..], &[1, 3, 6, 6]);

        // every maximum returns to where it came from; every other position is zero
        let restored = unpooled[0].to_vec();
        for (index, (&x, &y)) in data.iter().zip_eq(restored.iter()).enumerate() {
            let (c, r) = (index / 36, index % 36);
            let (py, px) = ((r / 6) / 2, (r % 6) / 2);
            let window_max = itertools::iproduct!(0..2, 0..2)
                .map(|(dy, dx)| data[c * 36 + (py * 2 + dy) * 6 + px * 2 + dx])
                .fold(f32::NEG_INFINITY, f32::max);
            match x == window_max {
                true => assert_eq!(y, x, "position {index}"),
                false => assert_eq!(y, 0.0, "position {index}"),
            }
        }
        Ok(())
    }

    #[test]
    fn test_unpool_errors() -> Result<(), Box<dyn Error>> {
        assert!(matches!(
            MaxUnpool::create(LayerParams::new("MaxUnpool", "unpool").with("pool_k_h", 2usize)),
            Err(LayerError::Config { .. })
        ));

        let mut layer = MaxUnpool::new(
            "unpool",
            Size2d::new(2, 2),
            Size2d::new(0, 0),
            Size2d::new(2, 2),
        );
        let values = Tensor::zeros([1, 1, 2, 2])?;
        assert!(matches!(
            layer.allocate(&[values.clone(), Tensor::zeros([1, 1, 2, 3])?]),
            Err(LayerError::ShapeMismatch { .. })
        ));
        assert!(matches!(
            layer.allocate(&[values.clone()]),
            Err(LayerError::ShapeMismatch { .. })
        ));
        let batched = Tensor::zeros([2, 1, 2, 2])?;
        assert!(matches!(
            layer.allocate(&[batched.clone(), batched]),
            Err(LayerError::ShapeMismatch { .. })
        ));

        let indices = Tensor::from_data([1, 1, 2, 2], vec![0.0, 1.0, 16.0, 2.0])?;
        let inputs = [values, indices];
        let mut outputs = layer.allocate(&inputs)?;
        assert!(matches!(
            layer.forward(&inputs, &mut outputs),
            Err(LayerError::Bounds {
                index: 16,
                bound: 16,
                ..
            })
        ));

        let indices = Tensor::from_data([1, 1, 2, 2], vec![0.0, -1.0, 3.0, 2.0])?;
        let inputs = [inputs[0].clone(), indices];
        assert!(matches!(
            layer.forward(&inputs, &mut outputs),
            Err(LayerError::Bounds { index: -1, .. })
        ));

        for bad in [f32::NAN, f32::INFINITY, f32::NEG_INFINITY] {
            let indices = Tensor::from_data([1, 1, 2, 2], vec![0.0, 1.0, bad, 2.0])?;
            let inputs = [inputs[0].clone(), indices];
            assert!(
                matches!(
                    layer.forward(&inputs, &mut outputs),
                    Err(LayerError::Bounds { .. })
                ),
                "index {bad} was accepted"
            );
        }
        Ok(())
    }
}
