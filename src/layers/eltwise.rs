use std::str::FromStr;

use derive_more::Display;

use super::{Layer, LayerError, LayerFactory, LayerParams, check_input_count, check_outputs};
use crate::{hal::cpu::elementwise, loom::tensor::Tensor};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum EltwiseOp {
    #[default]
    #[display("sum")]
    Sum,
    #[display("prod")]
    Prod,
    #[display("max")]
    Max,
}

impl FromStr for EltwiseOp {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sum" => Ok(Self::Sum),
            "prod" => Ok(Self::Prod),
            "max" => Ok(Self::Max),
            _ => Err(format!("unknown operation `{s}`")),
        }
    }
}

/// Combines two or more inputs of identical shape element by element.
#[derive(Debug, Clone)]
pub struct Eltwise {
    name: String,
    op: EltwiseOp,
    coeffs: Vec<f32>,
}

impl Eltwise {
    /// Fails if coefficients are given for an operation other than [`EltwiseOp::Sum`].
    pub fn new(name: impl ToString, op: EltwiseOp, coeffs: Vec<f32>) -> Result<Self, LayerError> {
        let name = name.to_string();
        if !coeffs.is_empty() && op != EltwiseOp::Sum {
            return Err(LayerError::config(
                name,
                format!("coefficients are only supported by sum, not {op}"),
            ));
        }
        Ok(Self { name, op, coeffs })
    }

    #[inline]
    pub fn op(&self) -> EltwiseOp {
        self.op
    }
}

impl LayerFactory for Eltwise {
    const KIND: &'static str = "Eltwise";

    fn create(params: LayerParams) -> Result<Self, LayerError> {
        let op = match params.get::<String>("operation")? {
            Some(op) => op
                .parse()
                .map_err(|reason| LayerError::config(&params.name, reason))?,
            None => EltwiseOp::default(),
        };
        let coeffs = params.get_or("coeff", vec![])?;
        Self::new(params.name, op, coeffs)
    }
}

impl Layer for Eltwise {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn allocate(&mut self, inputs: &[Tensor]) -> Result<Vec<Tensor>, LayerError> {
        check_input_count(&self.name, inputs, 2, true)?;

        let shape = inputs[0].shape();
        if let Some((index, input)) = inputs
            .iter()
            .enumerate()
            .find(|(_, input)| input.shape() != shape)
        {
            return Err(LayerError::shape(
                &self.name,
                format!("input {index} of shape {} differs from {shape}", input.shape()),
            ));
        }
        if !self.coeffs.is_empty() && self.coeffs.len() != inputs.len() {
            return Err(LayerError::config(
                &self.name,
                format!(
                    "{} coefficients given for {} inputs",
                    self.coeffs.len(),
                    inputs.len()
                ),
            ));
        }

        Ok(vec![Tensor::zeros(shape)?])
    }

    fn forward(&self, inputs: &[Tensor], outputs: &mut [Tensor]) -> Result<(), LayerError> {
        check_outputs(&self.name, outputs, 1)?;
        check_input_count(&self.name, inputs, 2, true)?;

        let shape = outputs[0].shape();
        let mut output = outputs[0].write()?;
        match (self.op, self.coeffs.is_empty()) {
            (EltwiseOp::Sum, false) => output.fill(0.0),
            (EltwiseOp::Prod, _) => output.fill(1.0),
            _ => {}
        }

        // one input borrowed at a time, as the same blob may be bound to several inputs
        for (index, input) in inputs.iter().enumerate() {
            if input.shape() != shape {
                return Err(LayerError::shape(
                    &self.name,
                    format!("input {index} of shape {} differs from {shape}", input.shape()),
                ));
            }
            let input = input.contiguous()?;
            let input = input.read()?;
            match (self.op, self.coeffs.get(index)) {
                (EltwiseOp::Sum, Some(&coeff)) => elementwise::axpy(&mut output, coeff, &input)?,
                (EltwiseOp::Sum | EltwiseOp::Max, None) if index == 0 => {
                    output.copy_from_slice(&input)
                }
                (EltwiseOp::Sum, None) => elementwise::add_assign(&mut output, &input)?,
                (EltwiseOp::Prod, _) => elementwise::mul_assign(&mut output, &input)?,
                (EltwiseOp::Max, _) => elementwise::max_assign(&mut output, &input)?,
            }
        }
        Ok(())
    }
}
