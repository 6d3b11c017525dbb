use super::{Layer, LayerError, LayerFactory, LayerParams, check_input_count, check_outputs};
use crate::{hal::cpu::im2col::Size2d, loom::tensor::Tensor};

/// 2-D max pooling over `N×C×H×W` inputs.
///
/// Produces two outputs: the maxima, and the in-plane flat index `y · W + x` of every
/// maximum (as `f32`), the format [`MaxUnpool`](super::max_unpool::MaxUnpool) consumes.
#[derive(Debug, Clone)]
pub struct MaxPool {
    name: String,
    kernel: Size2d,
    stride: Size2d,
    pad: Size2d,
}

/// Pooled size of one axis, rounding up, with the last window clipped so that it starts
/// inside the image or its leading padding. Every window covers at least one pixel.
fn pooled(input: usize, kernel: usize, stride: usize, pad: usize) -> Option<usize> {
    let span = (input + 2 * pad).checked_sub(kernel)?;
    let mut output = span.div_ceil(stride) + 1;
    if (output - 1) * stride >= input + pad {
        output -= 1;
    }
    Some(output)
}

impl MaxPool {
    pub fn new(
        name: impl ToString,
        kernel: Size2d,
        stride: Size2d,
        pad: Size2d,
    ) -> Result<Self, LayerError> {
        let name = name.to_string();
        let valid = kernel.area() > 0
            && stride.area() > 0
            && pad.height < kernel.height
            && pad.width < kernel.width;
        if !valid {
            return Err(LayerError::config(
                name,
                format!("kernel {kernel}, stride {stride}, pad {pad} do not form a valid window"),
            ));
        }
        Ok(Self {
            name,
            kernel,
            stride,
            pad,
        })
    }

    fn output_size(&self, input: Size2d) -> Result<Size2d, LayerError> {
        let height = pooled(
            input.height,
            self.kernel.height,
            self.stride.height,
            self.pad.height,
        );
        let width = pooled(
            input.width,
            self.kernel.width,
            self.stride.width,
            self.pad.width,
        );
        match (height, width) {
            (Some(height), Some(width)) => Ok(Size2d::new(height, width)),
            _ => Err(LayerError::shape(
                &self.name,
                format!("input {input} is smaller than kernel {}", self.kernel),
            )),
        }
    }

    /// Clipped window along one axis for output position `index`.
    fn window(index: usize, kernel: usize, stride: usize, pad: usize, len: usize) -> (usize, usize) {
        let start = (index * stride) as isize - pad as isize;
        let end = (start + kernel as isize).min(len as isize);
        (start.max(0) as usize, end.max(0) as usize)
    }
}

impl LayerFactory for MaxPool {
    const KIND: &'static str = "MaxPool";

    fn create(params: LayerParams) -> Result<Self, LayerError> {
        let kernel = params.size2d("kernel", None)?;
        let stride = params.size2d("stride", Some(1))?;
        let pad = params.size2d("pad", Some(0))?;
        Self::new(params.name, kernel, stride, pad)
    }
}

impl Layer for MaxPool {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn allocate(&mut self, inputs: &[Tensor]) -> Result<Vec<Tensor>, LayerError> {
        check_input_count(&self.name, inputs, 1, false)?;
        let shape = inputs[0].shape();
        let Ok([n, c, h, w]) = shape.try_to_array::<4>() else {
            return Err(LayerError::shape(
                &self.name,
                format!("input of shape {shape} is not 4-D"),
            ));
        };

        let output = self.output_size(Size2d::new(h, w))?;
        let shape = [n, c, output.height, output.width];
        Ok(vec![Tensor::zeros(shape)?, Tensor::zeros(shape)?])
    }

    fn forward(&self, inputs: &[Tensor], outputs: &mut [Tensor]) -> Result<(), LayerError> {
        check_input_count(&self.name, inputs, 1, false)?;
        check_outputs(&self.name, outputs, 2)?;

        let input = inputs[0].contiguous()?;
        let [n, c, h, w] = input.shape().try_to_array::<4>()?;
        let [_, _, out_h, out_w] = outputs[0].shape().try_to_array::<4>()?;
        if outputs[1].shape() != outputs[0].shape() {
            return Err(LayerError::NotAllocated(self.name.clone()));
        }

        let input = input.read()?;
        let (values, indices) = outputs.split_at_mut(1);
        let mut values = values[0].write()?;
        let mut indices = indices[0].write()?;

        let planes = input
            .chunks_exact(h * w)
            .zip(values.chunks_exact_mut(out_h * out_w))
            .zip(indices.chunks_exact_mut(out_h * out_w))
            .take(n * c);
        for ((src, values), indices) in planes {
            for (y, x) in itertools::iproduct!(0..out_h, 0..out_w) {
                let (y0, y1) = Self::window(
                    y,
                    self.kernel.height,
                    self.stride.height,
                    self.pad.height,
                    h,
                );
                let (x0, x1) =
                    Self::window(x, self.kernel.width, self.stride.width, self.pad.width, w);

                let mut max = f32::NEG_INFINITY;
                let mut argmax = y0 * w + x0;
                for (yy, xx) in itertools::iproduct!(y0..y1, x0..x1) {
                    let index = yy * w + xx;
                    if src[index] > max {
                        max = src[index];
                        argmax = index;
                    }
                }
                values[y * out_w + x] = max;
                indices[y * out_w + x] = argmax as f32;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::{MaxPool, pooled};
    use crate::{
        hal::cpu::im2col::Size2d,
        layers::{Layer, LayerError, LayerFactory, LayerParams},
        loom::tensor::Tensor,
    };

    #[test]
    fn test_pooled_size() {
        assert_eq!(pooled(4, 2, 2, 0), Some(2));
        assert_eq!(pooled(5, 2, 2, 0), Some(3));
        assert_eq!(pooled(5, 3, 2, 1), Some(3));
        assert_eq!(pooled(4, 2, 2, 1), Some(3));
        // the last window would start entirely in the trailing padding
        assert_eq!(pooled(6, 3, 3, 2), Some(3));
        assert_eq!(pooled(1, 3, 1, 0), None);
        // kernel shorter than stride: no window may start past the edge
        assert_eq!(pooled(5, 1, 3, 0), Some(2));
        assert_eq!(pooled(7, 2, 3, 0), Some(3));
    }

    #[test]
    fn test_max_pool_sparse_windows() -> Result<(), Box<dyn Error>> {
        let data = (0..25).map(|x| x as f32).collect::<Vec<_>>();
        let input = Tensor::from_data([1, 1, 5, 5], data)?;
        let (kernel, stride, pad) = (Size2d::new(1, 1), Size2d::new(3, 3), Size2d::new(0, 0));
        let mut layer = MaxPool::new("pool", kernel, stride, pad)?;
        let inputs = [input];
        let mut outputs = layer.allocate(&inputs)?;
        assert_eq!(&outputs[0].shape()[..], &[1, 1, 2, 2]);

        layer.forward(&inputs, &mut outputs)?;
        assert_eq!(outputs[0].to_vec(), vec![0.0, 3.0, 15.0, 18.0]);
        assert_eq!(outputs[1].to_vec(), vec![0.0, 3.0, 15.0, 18.0]);
        Ok(())
    }

    #[test]
    fn test_max_pool() -> Result<(), Box<dyn Error>> {
        #[rustfmt::skip]
        let input = Tensor::from_data([1, 1, 4, 4], vec![
            1.0, 5.0, 2.0, 0.0,
            3.0, 4.0, 8.0, 1.0,
            0.0, 2.0, 7.0, 6.0,
            9.0, 1.0, 3.0, 5.0,
        ])?;

        let params = LayerParams::new("MaxPool", "pool")
            .with("kernel_size", 2usize)
            .with("stride", 2usize);
        let mut layer = MaxPool::create(params)?;
        let inputs = [input];
        let mut outputs = layer.allocate(&inputs)?;
        assert_eq!(outputs.len(), 2);
        assert_eq!(&outputs[0].shape()[..], &[1, 1, 2, 2]);

        layer.forward(&inputs, &mut outputs)?;
        assert_eq!(outputs[0].to_vec(), vec![5.0, 8.0, 9.0, 7.0]);
        assert_eq!(outputs[1].to_vec(), vec![1.0, 6.0, 12.0, 10.0]);
        Ok(())
    }

    #[test]
    fn test_max_pool_padded() -> Result<(), Box<dyn Error>> {
        let data = vec![1.0, 2.0, 3.0, 4.0, -1.0, -2.0, -3.0, -4.0];
        let input = Tensor::from_data([1, 2, 2, 2], data)?;
        let (kernel, stride, pad) = (Size2d::new(2, 2), Size2d::new(2, 2), Size2d::new(1, 1));
        let mut layer = MaxPool::new("pool", kernel, stride, pad)?;
        let inputs = [input];
        let mut outputs = layer.allocate(&inputs)?;
        assert_eq!(&outputs[0].shape()[..], &[1, 2, 2, 2]);

        layer.forward(&inputs, &mut outputs)?;
        // every clipped window covers exactly one pixel
        assert_eq!(
            outputs[0].to_vec(),
            vec![1.0, 2.0, 3.0, 4.0, -1.0, -2.0, -3.0, -4.0]
        );
        assert_eq!(
            outputs[1].to_vec(),
            vec![0.0, 1.0, 2.0, 3.0, 0.0, 1.0, 2.0, 3.0]
        );
        Ok(())
    }

    #[test]
    fn test_max_pool_errors() -> Result<(), Box<dyn Error>> {
        assert!(matches!(
            MaxPool::create(LayerParams::new("MaxPool", "pool")),
            Err(LayerError::Config { .. })
        ));
        assert!(matches!(
            MaxPool::new("pool", Size2d::new(2, 2), Size2d::new(1, 1), Size2d::new(2, 2)),
            Err(LayerError::Config { .. })
        ));

        let (kernel, stride, pad) = (Size2d::new(3, 3), Size2d::new(1, 1), Size2d::new(0, 0));
        let mut layer = MaxPool::new("pool", kernel, stride, pad)?;
        assert!(matches!(
            layer.allocate(&[Tensor::zeros([1, 1, 2, 2])?]),
            Err(LayerError::ShapeMismatch { .. })
        ));
        assert!(matches!(
            layer.allocate(&[Tensor::zeros([1, 4, 4])?]),
            Err(LayerError::ShapeMismatch { .. })
        ));
        Ok(())
    }
}
