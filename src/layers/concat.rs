use itertools::Itertools;

use super::{Layer, LayerError, LayerFactory, LayerParams, check_input_count, check_outputs};
use crate::loom::{slice::Slice, tensor::Tensor};

/// Concatenates its inputs along one axis.
#[derive(Debug, Clone)]
pub struct Concat {
    name: String,
    /// Axis as configured; negative values count from the last dimension.
    axis: isize,
    /// Axis resolved against the rank of the allocated inputs.
    resolved: Option<usize>,
}

impl Concat {
    pub fn new(name: impl ToString, axis: isize) -> Self {
        Self {
            name: name.to_string(),
            axis,
            resolved: None,
        }
    }

    fn resolve(&self, dims: usize) -> Result<usize, LayerError> {
        let axis = match self.axis {
            axis if axis < 0 => dims as isize + axis,
            axis => axis,
        };
        match (0..dims as isize).contains(&axis) {
            true => Ok(axis as usize),
            false => Err(LayerError::shape(
                &self.name,
                format!("axis {} is out of range for {dims} dimensions", self.axis),
            )),
        }
    }
}

impl LayerFactory for Concat {
    const KIND: &'static str = "Concat";

    fn create(params: LayerParams) -> Result<Self, LayerError> {
        let axis = params.get_or("axis", 1isize)?;
        Ok(Self::new(params.name, axis))
    }
}

impl Layer for Concat {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn allocate(&mut self, inputs: &[Tensor]) -> Result<Vec<Tensor>, LayerError> {
        check_input_count(&self.name, inputs, 1, true)?;

        let reference = inputs[0].shape();
        let axis = self.resolve(reference.len())?;

        let mut shape = reference.to_vec();
        shape[axis] = 0;
        for (index, input) in inputs.iter().enumerate() {
            let other = input.shape();
            let compatible = other.len() == reference.len()
                && other
                    .iter()
                    .zip_eq(reference.iter())
                    .enumerate()
                    .all(|(dim, (a, b))| dim == axis || a == b);
            if !compatible {
                return Err(LayerError::shape(
                    &self.name,
                    format!("input {index} of shape {other} cannot concat with {reference} along axis {axis}"),
                ));
            }
            shape[axis] += other[axis];
        }

        self.resolved = Some(axis);
        Ok(vec![Tensor::zeros(shape)?])
    }

    fn forward(&self, inputs: &[Tensor], outputs: &mut [Tensor]) -> Result<(), LayerError> {
        let axis = self
            .resolved
            .ok_or_else(|| LayerError::NotAllocated(self.name.clone()))?;
        check_outputs(&self.name, outputs, 1)?;

        let mut start = 0;
        for input in inputs {
            let end = start + input.shape()[axis];
            let mut view = outputs[0].slice(Slice::along(axis, start..end))?;
            view.copy_from(input)?;
            start = end;
        }
        Ok(())
    }
}
