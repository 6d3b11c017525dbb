use super::{Layer, LayerError, LayerFactory, LayerParams, check_input_count, check_outputs};
use crate::{
    hal::cpu::{
        elementwise,
        im2col::{self, ColumnOffsets, ConvGeometry, Size2d},
        matmul::{MatRef, matmul},
    },
    loom::tensor::Tensor,
};

/// Configuration shared by [`Convolution`] and [`Deconvolution`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvParams {
    pub num_output: usize,
    pub kernel: Size2d,
    pub stride: Size2d,
    pub pad: Size2d,
    pub dilation: Size2d,
    pub bias_term: bool,
}

impl ConvParams {
    pub fn from_params(params: &LayerParams) -> Result<Self, LayerError> {
        Ok(Self {
            num_output: params.require("num_output")?,
            kernel: params.size2d("kernel", None)?,
            stride: params.size2d("stride", Some(1))?,
            pad: params.size2d("pad", Some(0))?,
            dilation: params.size2d("dilation", Some(1))?,
            bias_term: params.get_or("bias_term", true)?,
        })
    }

    /// Window geometry over an image of `channels × input`.
    fn geometry(&self, channels: usize, input: Size2d) -> ConvGeometry {
        ConvGeometry {
            channels,
            input,
            kernel: self.kernel,
            pad: self.pad,
            stride: self.stride,
            dilation: self.dilation,
        }
    }

    /// Validates the blob count and the bias length; returns the bias, if any.
    fn check_blobs(
        &self,
        name: &str,
        blobs: &[Tensor],
    ) -> Result<Option<Vec<f32>>, LayerError> {
        let expected = 1 + self.bias_term as usize;
        if blobs.len() < expected {
            return Err(LayerError::config(
                name,
                format!("expected {expected} blobs, {} given", blobs.len()),
            ));
        }
        if self.num_output == 0 || self.kernel.area() == 0 {
            return Err(LayerError::config(
                name,
                format!(
                    "{} outputs with kernel {} is empty",
                    self.num_output, self.kernel
                ),
            ));
        }
        match self.bias_term {
            true => {
                let bias = blobs[1].to_vec();
                match bias.len() == self.num_output {
                    true => Ok(Some(bias)),
                    false => Err(LayerError::config(
                        name,
                        format!("bias of {} values for {} outputs", bias.len(), self.num_output),
                    )),
                }
            }
            false => Ok(None),
        }
    }
}

fn check_weights(name: &str, weights: &Tensor, expected: usize) -> Result<(), LayerError> {
    match weights.size() == expected {
        true => Ok(()),
        false => Err(LayerError::shape(
            name,
            format!(
                "weights of shape {} do not have {expected} elements",
                weights.shape()
            ),
        )),
    }
}

fn input_dims(name: &str, input: &Tensor) -> Result<[usize; 4], LayerError> {
    input.shape().try_to_array::<4>().map_err(|_| {
        LayerError::shape(name, format!("input of shape {} is not 4-D", input.shape()))
    })
}

/// 2-D convolution lowered onto [`im2col`](im2col::im2col) and a matrix product.
///
/// Weights are `[num_output, C · kH · kW]`; bias is `[num_output]`.
#[derive(Debug, Clone)]
pub struct Convolution {
    name: String,
    blobs: Vec<Tensor>,
    params: ConvParams,
    bias: Option<Vec<f32>>,
    geometry: Option<ConvGeometry>,
}

impl Convolution {
    pub fn new(
        name: impl ToString,
        params: ConvParams,
        blobs: Vec<Tensor>,
    ) -> Result<Self, LayerError> {
        let name = name.to_string();
        let bias = params.check_blobs(&name, &blobs)?;
        Ok(Self {
            name,
            blobs,
            params,
            bias,
            geometry: None,
        })
    }
}

impl LayerFactory for Convolution {
    const KIND: &'static str = "Convolution";

    fn create(params: LayerParams) -> Result<Self, LayerError> {
        let conv = ConvParams::from_params(&params)?;
        Self::new(params.name, conv, params.blobs)
    }
}

impl Layer for Convolution {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn blobs(&self) -> &[Tensor] {
        &self.blobs
    }

    fn allocate(&mut self, inputs: &[Tensor]) -> Result<Vec<Tensor>, LayerError> {
        check_input_count(&self.name, inputs, 1, false)?;
        let [n, c, h, w] = input_dims(&self.name, &inputs[0])?;

        let geometry = self.params.geometry(c, Size2d::new(h, w));
        check_weights(
            &self.name,
            &self.blobs[0],
            self.params.num_output * geometry.column_len(),
        )?;
        let output = geometry.output()?;

        log::debug!("{}: convolution over {geometry} gives {output}", self.name);
        self.geometry = Some(geometry);
        Ok(vec![Tensor::zeros([
            n,
            self.params.num_output,
            output.height,
            output.width,
        ])?])
    }

    fn forward(&self, inputs: &[Tensor], outputs: &mut [Tensor]) -> Result<(), LayerError> {
        check_input_count(&self.name, inputs, 1, false)?;
        check_outputs(&self.name, outputs, 1)?;
        let geometry = self
            .geometry
            .ok_or_else(|| LayerError::NotAllocated(self.name.clone()))?;
        let output = geometry.output()?;
        let out_len = self.params.num_output * output.area();

        let weights = self.blobs[0].contiguous()?;
        let weights = weights.read()?;
        let weights = MatRef::new(&weights, self.params.num_output, geometry.column_len())?;

        let input = inputs[0].contiguous()?;
        let input = input.read()?;
        let mut out = outputs[0].write()?;

        let mut columns = vec![0.0; geometry.matrix_len()?];
        let samples = input
            .chunks_exact(geometry.image_len().max(1))
            .zip(out.chunks_exact_mut(out_len.max(1)));
        for (image, out) in samples {
            im2col::im2col(image, &geometry, &mut columns)?;
            let columns = MatRef::new(&columns, output.area(), geometry.column_len())?;
            matmul(weights, columns.t(), out)?;
            if let Some(bias) = &self.bias {
                elementwise::add_row_bias(out, output.area(), bias)?;
            }
        }
        Ok(())
    }
}

/// Transposed 2-D convolution: a matrix product followed by [`col2im`](im2col::col2im).
///
/// Weights are `[C, num_output · kH · kW]`; bias is `[num_output]`.
#[derive(Debug, Clone)]
pub struct Deconvolution {
    name: String,
    blobs: Vec<Tensor>,
    params: ConvParams,
    bias: Option<Vec<f32>>,
    /// Geometry of the convolution this layer transposes, over the output image.
    geometry: Option<(ConvGeometry, ColumnOffsets)>,
}

impl Deconvolution {
    pub fn new(
        name: impl ToString,
        params: ConvParams,
        blobs: Vec<Tensor>,
    ) -> Result<Self, LayerError> {
        let name = name.to_string();
        let bias = params.check_blobs(&name, &blobs)?;
        Ok(Self {
            name,
            blobs,
            params,
            bias,
            geometry: None,
        })
    }

    /// `stride · (input − 1) + dilation · (kernel − 1) + 1 − 2 · pad` along one axis.
    fn output_len(
        input: usize,
        kernel: usize,
        stride: usize,
        pad: usize,
        dilation: usize,
    ) -> Option<usize> {
        (stride * input.checked_sub(1)? + dilation * (kernel - 1) + 1).checked_sub(2 * pad)
    }
}

impl LayerFactory for Deconvolution {
    const KIND: &'static str = "Deconvolution";

    fn create(params: LayerParams) -> Result<Self, LayerError> {
        let conv = ConvParams::from_params(&params)?;
        Self::new(params.name, conv, params.blobs)
    }
}

impl Layer for Deconvolution {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn blobs(&self) -> &[Tensor] {
        &self.blobs
    }

    fn allocate(&mut self, inputs: &[Tensor]) -> Result<Vec<Tensor>, LayerError> {
        check_input_count(&self.name, inputs, 1, false)?;
        let [n, c, h, w] = input_dims(&self.name, &inputs[0])?;
        let ConvParams {
            num_output,
            kernel,
            stride,
            pad,
            dilation,
            ..
        } = self.params;

        let height = Self::output_len(
            h,
            kernel.height,
            stride.height,
            pad.height,
            dilation.height,
        );
        let width = Self::output_len(w, kernel.width, stride.width, pad.width, dilation.width);
        let (Some(height), Some(width)) = (height, width) else {
            return Err(LayerError::shape(
                &self.name,
                format!("input {h}x{w} has no deconvolved size"),
            ));
        };

        let geometry = self.params.geometry(num_output, Size2d::new(height, width));
        check_weights(&self.name, &self.blobs[0], c * geometry.column_len())?;
        if geometry.output()? != Size2d::new(h, w) {
            return Err(LayerError::shape(
                &self.name,
                format!("{geometry} does not map back onto input {h}x{w}"),
            ));
        }

        log::debug!("{}: deconvolution of {h}x{w} gives {geometry}", self.name);
        self.geometry = Some((geometry, ColumnOffsets::from_geometry(&geometry)));
        Ok(vec![Tensor::zeros([n, num_output, height, width])?])
    }

    fn forward(&self, inputs: &[Tensor], outputs: &mut [Tensor]) -> Result<(), LayerError> {
        check_input_count(&self.name, inputs, 1, false)?;
        check_outputs(&self.name, outputs, 1)?;
        let Some((geometry, offsets)) = &self.geometry else {
            return Err(LayerError::NotAllocated(self.name.clone()));
        };
        let [_, c, h, w] = input_dims(&self.name, &inputs[0])?;
        let positions = h * w;

        let weights = self.blobs[0].contiguous()?;
        let weights = weights.read()?;
        let weights = MatRef::new(&weights, c, geometry.column_len())?;

        let input = inputs[0].contiguous()?;
        let input = input.read()?;
        let mut out = outputs[0].write()?;

        let mut columns = vec![0.0; geometry.matrix_len()?];
        let samples = input
            .chunks_exact((c * positions).max(1))
            .zip(out.chunks_exact_mut(geometry.image_len().max(1)));
        for (x, out) in samples {
            let x = MatRef::new(x, c, positions)?;
            matmul(x.t(), weights, &mut columns)?;
            im2col::col2im(&columns, geometry, offsets, out)?;
            if let Some(bias) = &self.bias {
                elementwise::add_row_bias(out, geometry.input.area(), bias)?;
            }
        }
        Ok(())
    }
}
