use super::{Layer, LayerError, LayerFactory, LayerParams, check_input_count, check_outputs};
use crate::{hal::cpu::norm, loom::tensor::Tensor};

/// Per-channel affine normalization with stored statistics.
///
/// Blobs: mean at 0, variance at 1, then weights at 2 if `has_weight`,
/// then bias at `2 + has_weight` if `has_bias`. Without weights and bias, a blob at 2
/// holds a moving-average factor whose reciprocal rescales both mean and variance.
#[derive(Debug, Clone)]
pub struct BatchNorm {
    name: String,
    blobs: Vec<Tensor>,
    mean: Vec<f32>,
    var: Vec<f32>,
    weights: Option<Vec<f32>>,
    bias: Option<Vec<f32>>,
    eps: f32,
    var_mean_scale: f32,
    /// `(var · var_mean_scale + eps)^(-1/2)` per channel, computed in `allocate`.
    inv_std: Vec<f32>,
}

impl BatchNorm {
    fn channel_blob(params: &LayerParams, index: usize) -> Result<Vec<f32>, LayerError> {
        Ok(params.blob(index)?.to_vec())
    }

    pub fn channels(&self) -> usize {
        self.mean.len()
    }

    #[inline]
    pub fn var_mean_scale(&self) -> f32 {
        self.var_mean_scale
    }

    /// Per-channel `(scale, shift)` so that `out = in · scale + shift`.
    fn affine(&self, channel: usize) -> (f32, f32) {
        let weight = self.weights.as_ref().map_or(1.0, |w| w[channel]);
        let bias = self.bias.as_ref().map_or(0.0, |b| b[channel]);
        let scale = weight * self.inv_std[channel];
        let shift = bias - self.mean[channel] * self.var_mean_scale * scale;
        (scale, shift)
    }
}

impl LayerFactory for BatchNorm {
    const KIND: &'static str = "BatchNorm";

    fn create(params: LayerParams) -> Result<Self, LayerError> {
        if params.blobs.len() < 2 {
            return Err(LayerError::config(
                &params.name,
                format!("expected mean and variance blobs, {} given", params.blobs.len()),
            ));
        }

        let has_weight = params.get_or("has_weight", false)?;
        let has_bias = params.get_or("has_bias", false)?;
        let eps = params.get_or("eps", 1e-5f32)?;

        let mean = Self::channel_blob(&params, 0)?;
        let var = Self::channel_blob(&params, 1)?;
        let weights = match has_weight {
            true => Some(Self::channel_blob(&params, 2)?),
            false => None,
        };
        let bias = match has_bias {
            true => Some(Self::channel_blob(&params, 2 + has_weight as usize)?),
            false => None,
        };

        let channels = mean.len();
        let lengths = [Some(&var), weights.as_ref(), bias.as_ref()];
        if lengths.iter().flatten().any(|blob| blob.len() != channels) {
            return Err(LayerError::config(
                &params.name,
                format!("parameter blobs do not all have {channels} channels"),
            ));
        }

        let var_mean_scale = match (has_weight, has_bias, params.blobs.get(2)) {
            (false, false, Some(blob)) => match blob.to_vec().first() {
                Some(&factor) if factor != 0.0 => 1.0 / factor,
                _ => 1.0,
            },
            _ => 1.0,
        };

        Ok(Self {
            name: params.name,
            blobs: params.blobs,
            mean,
            var,
            weights,
            bias,
            eps,
            var_mean_scale,
            inv_std: vec![],
        })
    }
}

impl Layer for BatchNorm {
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
        check_input_count(&self.name, inputs, 1, true)?;

        let channels = self.channels();
        for (index, input) in inputs.iter().enumerate() {
            let shape = input.shape();
            if shape.len() < 2 || shape[1] != channels {
                return Err(LayerError::shape(
                    &self.name,
                    format!("input {index} of shape {shape} does not have {channels} channels"),
                ));
            }
        }

        self.inv_std = self
            .var
            .iter()
            .map(|&var| 1.0 / (var * self.var_mean_scale + self.eps).sqrt())
            .collect();

        inputs
            .iter()
            .map(|input| input.zeros_like().map_err(LayerError::from))
            .collect()
    }

    fn forward(&self, inputs: &[Tensor], outputs: &mut [Tensor]) -> Result<(), LayerError> {
        check_outputs(&self.name, outputs, inputs.len())?;
        if self.inv_std.len() != self.channels() {
            return Err(LayerError::NotAllocated(self.name.clone()));
        }

        for (input, output) in inputs.iter().zip(outputs.iter()) {
            let input = input.contiguous()?;
            let shape = input.shape();
            if shape != output.shape() {
                return Err(LayerError::shape(
                    &self.name,
                    format!("input of shape {shape} does not match output {}", output.shape()),
                ));
            }

            for (n, c) in itertools::iproduct!(0..shape[0], 0..shape[1]) {
                let (src, mut dst) = match shape.len() {
                    2 => (input.slice((n, c))?, output.slice((n, c))?),
                    _ => (input.plane(n, c)?, output.plane(n, c)?),
                };
                let (scale, shift) = self.affine(c);
                norm::scale_shift(&src.read()?, &mut dst.write()?, scale, shift)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use itertools::Itertools;

    use super::BatchNorm;
    use crate::{
        layers::{Layer, LayerError, LayerFactory, LayerParams},
        loom::tensor::Tensor,
    };

    macro_rules! assert_approx_eq {
        ($i:expr, $a:expr, $b:expr, $eps:expr) => {
            assert!(
                ($a - $b).abs() < $eps,
                "assertion failed at {}: `(left ~= right)`\n  left: `{}`\n right: `{}`",
                $i,
                $a,
                $b
            );
        };
    }

    fn run(layer: &mut BatchNorm, input: &Tensor) -> Result<Vec<f32>, Box<dyn Error>> {
        let inputs = [input.clone()];
        let mut outputs = layer.allocate(&inputs)?;
        layer.forward(&inputs, &mut outputs)?;
        Ok(outputs[0].to_vec())
    }

    #[test]
    fn test_identity() -> Result<(), Box<dyn Error>> {
        fastrand::seed(42);

        let data = (0..2 * 3 * 4 * 5).map(|_| fastrand::f32() - 0.5).collect_vec();
        let input = Tensor::from_data([2, 3, 4, 5], data.clone())?;

        let params = LayerParams::new("BatchNorm", "bn")
            .with("eps", 0.0f32)
            .with_blob(Tensor::zeros([3])?)
            .with_blob(Tensor::full([3], 1.0)?);
        let mut layer = BatchNorm::create(params)?;
        assert_eq!(run(&mut layer, &input)?, data);
        Ok(())
    }

    #[test]
    fn test_weight_bias() -> Result<(), Box<dyn Error>> {
        fastrand::seed(42);

        let mean = [0.5, -1.0];
        let var = [4.0, 0.25];
        let weight = [2.0, 0.5];
        let bias = [1.0, -3.0];
        let eps = 1e-5f32;

        let data = (0..3 * 2 * 7).map(|_| fastrand::f32() * 4.0 - 2.0).collect_vec();
        let input = Tensor::from_data([3, 2, 7], data.clone())?;

        let params = LayerParams::new("BatchNorm", "bn")
            .with("has_weight", true)
            .with("has_bias", true)
            .with_blob(Tensor::from_data([2], mean.to_vec())?)
            .with_blob(Tensor::from_data([2], var.to_vec())?)
            .with_blob(Tensor::from_data([2], weight.to_vec())?)
            .with_blob(Tensor::from_data([2], bias.to_vec())?);
        let mut layer = BatchNorm::create(params)?;
        assert_eq!(layer.var_mean_scale(), 1.0);

        let output = run(&mut layer, &input)?;
        for (index, (&x, &y)) in data.iter().zip_eq(output.iter()).enumerate() {
            let c = (index / 7) % 2;
            let expected = (x - mean[c]) / (var[c] + eps).sqrt() * weight[c] + bias[c];
            assert_approx_eq!(index, y, expected, 1e-4);
        }
        Ok(())
    }

    #[test]
    fn test_two_dims() -> Result<(), Box<dyn Error>> {
        let input = Tensor::from_data([2, 2], vec![1.0, 2.0, 3.0, 4.0])?;
        let params = LayerParams::new("BatchNorm", "bn")
            .with("eps", 0.0f32)
            .with_blob(Tensor::from_data([2], vec![1.0, 2.0])?)
            .with_blob(Tensor::from_data([2], vec![1.0, 4.0])?);
        let mut layer = BatchNorm::create(params)?;
        assert_eq!(run(&mut layer, &input)?, vec![0.0, 0.0, 2.0, 1.0]);
        Ok(())
    }

    #[test]
    fn test_moving_average_factor() -> Result<(), Box<dyn Error>> {
        let input = Tensor::from_data([1, 2, 1, 2], vec![3.0, 5.0, 4.0, 6.0])?;

        // statistics accumulated with factor 2: true mean [1, 2], true variance [1, 4]
        let params = LayerParams::new("BatchNorm", "bn")
            .with("eps", 0.0f32)
            .with_blob(Tensor::from_data([2], vec![2.0, 4.0])?)
            .with_blob(Tensor::from_data([2], vec![2.0, 8.0])?)
            .with_blob(Tensor::from_data([1], vec![2.0])?);
        let mut layer = BatchNorm::create(params.clone())?;
        assert_eq!(layer.var_mean_scale(), 0.5);
        assert_eq!(run(&mut layer, &input)?, vec![2.0, 4.0, 1.0, 2.0]);

        // a zero factor leaves the statistics untouched
        let mut params = params;
        params.blobs[2] = Tensor::zeros([1])?;
        let layer = BatchNorm::create(params)?;
        assert_eq!(layer.var_mean_scale(), 1.0);
        Ok(())
    }

    #[test]
    fn test_errors() -> Result<(), Box<dyn Error>> {
        let params = LayerParams::new("BatchNorm", "bn").with_blob(Tensor::zeros([3])?);
        assert!(matches!(
            BatchNorm::create(params),
            Err(LayerError::Config { .. })
        ));

        let params = LayerParams::new("BatchNorm", "bn")
            .with("has_weight", true)
            .with_blob(Tensor::zeros([3])?)
            .with_blob(Tensor::zeros([3])?);
        assert!(matches!(
            BatchNorm::create(params),
            Err(LayerError::Config { .. })
        ));

        let params = LayerParams::new("BatchNorm", "bn")
            .with_blob(Tensor::zeros([3])?)
            .with_blob(Tensor::full([3], 1.0)?);
        let mut layer = BatchNorm::create(params)?;
        assert!(matches!(
            layer.allocate(&[Tensor::zeros([1, 4, 2, 2])?]),
            Err(LayerError::ShapeMismatch { .. })
        ));
        assert!(matches!(
            layer.allocate(&[Tensor::zeros([3])?]),
            Err(LayerError::ShapeMismatch { .. })
        ));

        let inputs = [Tensor::zeros([1, 3, 2, 2])?];
        let mut outputs = vec![Tensor::zeros([1, 3, 2, 2])?];
        assert!(matches!(
            layer.forward(&inputs, &mut outputs),
            Err(LayerError::NotAllocated(_))
        ));
        Ok(())
    }
}
