use std::rc::Rc;

use ndarray::prelude::*;

use super::error::{LayerError, Result};
use super::{Origin, Tensor, TensorBuilder};

pub trait Operation {
    fn forward(&self, inputs: Vec<Rc<Tensor>>) -> Result<Rc<Tensor>>;

    /// Gradients with respect to each of `args`, in order. Entries whose
    /// `wanted` flag is false may be (and usually are) `None`.
    fn backward(
        &self,
        out_gradient: &ArrayD<f32>,
        args: &[Rc<Tensor>],
        wanted: &[bool],
    ) -> Result<Vec<Option<ArrayD<f32>>>>;
}

pub(super) fn derived_tensor(array: ArrayD<f32>, origin: Origin) -> Rc<Tensor> {
    Rc::new(TensorBuilder::new(array).origin(origin).build())
}

pub struct Exponentiation {}

impl Operation for Exponentiation {
    fn forward(&self, inputs: Vec<Rc<Tensor>>) -> Result<Rc<Tensor>> {
        assert!(inputs.len() == 1, "unary operation expected");
        let array = inputs[0].borrow_array().mapv(f32::exp);
        let origin = Origin {
            operation: Box::new(Exponentiation {}),
            parents: inputs,
        };
        Ok(derived_tensor(array, origin))
    }

    fn backward(
        &self,
        out_gradient: &ArrayD<f32>,
        args: &[Rc<Tensor>],
        wanted: &[bool],
    ) -> Result<Vec<Option<ArrayD<f32>>>> {
        if !wanted[0] {
            return Ok(vec![None]);
        }
        // d/dx eˣ = eˣ
        Ok(vec![Some(out_gradient * &args[0].borrow_array().mapv(f32::exp))])
    }
}

pub struct Scale {
    factor: f32,
}

impl Scale {
    pub fn new(factor: f32) -> Self {
        Self { factor }
    }
}

impl Operation for Scale {
    fn forward(&self, inputs: Vec<Rc<Tensor>>) -> Result<Rc<Tensor>> {
        assert!(inputs.len() == 1, "unary operation expected");
        let array = self.factor * &*inputs[0].borrow_array();
        let origin = Origin {
            operation: Box::new(Scale {
                factor: self.factor,
            }),
            parents: inputs,
        };
        Ok(derived_tensor(array, origin))
    }

    fn backward(
        &self,
        out_gradient: &ArrayD<f32>,
        _args: &[Rc<Tensor>],
        wanted: &[bool],
    ) -> Result<Vec<Option<ArrayD<f32>>>> {
        Ok(vec![wanted[0].then(|| self.factor * out_gradient)])
    }
}

/// Multiplies the entries of the first argument by the second, a vector
/// repeated along the first argument's trailing axis.
pub struct ScaleRepeated {}

impl Operation for ScaleRepeated {
    fn forward(&self, inputs: Vec<Rc<Tensor>>) -> Result<Rc<Tensor>> {
        assert!(inputs.len() == 2, "binary operation expected");
        let array = {
            let x = inputs[0].borrow_array();
            let scales = inputs[1].borrow_array();
            check_repeatable(&x, &scales)?;
            &*x * &*scales
        };
        let origin = Origin {
            operation: Box::new(ScaleRepeated {}),
            parents: inputs,
        };
        Ok(derived_tensor(array, origin))
    }

    fn backward(
        &self,
        out_gradient: &ArrayD<f32>,
        args: &[Rc<Tensor>],
        wanted: &[bool],
    ) -> Result<Vec<Option<ArrayD<f32>>>> {
        let x = args[0].borrow_array();
        let scales = args[1].borrow_array();
        check_repeatable(&x, &scales)?;

        let x_gradient = wanted[0].then(|| out_gradient * &*scales);
        let scales_gradient = if wanted[1] {
            // each scale touched every entry of its column
            let chunk = scales.len();
            let products = (out_gradient * &*x).into_shape_with_order((x.len() / chunk, chunk))?;
            Some(
                products
                    .sum_axis(Axis(0))
                    .into_shape_with_order(scales.raw_dim())?,
            )
        } else {
            None
        };
        Ok(vec![x_gradient, scales_gradient])
    }
}

fn check_repeatable(x: &ArrayD<f32>, scales: &ArrayD<f32>) -> Result<()> {
    let trailing = x.shape().last().copied().unwrap_or(0);
    if trailing == 0 || scales.ndim() != 1 || scales.len() != trailing {
        return Err(LayerError::ShapeMismatch {
            expected: trailing,
            actual: scales.len(),
        });
    }
    Ok(())
}

/// Sum of squared differences between a prediction (first argument) and a
/// target (second argument) of the same shape.
pub struct SquaredError {}

impl Operation for SquaredError {
    fn forward(&self, inputs: Vec<Rc<Tensor>>) -> Result<Rc<Tensor>> {
        assert!(inputs.len() == 2, "binary operation expected");
        let squared_error = {
            let prediction = inputs[0].borrow_array();
            let target = inputs[1].borrow_array();
            if prediction.shape() != target.shape() {
                return Err(LayerError::ShapeMismatch {
                    expected: target.len(),
                    actual: prediction.len(),
                });
            }
            (&*target - &*prediction).mapv(|d| d * d).sum()
        };
        let origin = Origin {
            operation: Box::new(SquaredError {}),
            parents: inputs,
        };
        Ok(derived_tensor(array![squared_error].into_dyn(), origin))
    }

    fn backward(
        &self,
        out_gradient: &ArrayD<f32>,
        args: &[Rc<Tensor>],
        wanted: &[bool],
    ) -> Result<Vec<Option<ArrayD<f32>>>> {
        // d/dx (y − x)² = 2(y − x) · d/dx(y − x) = 2(y − x) · −1 = −2(y − x)
        // d/dy (y − x)² = 2(y − x) · d/dy(y − x) = 2(y − x) · 1 = 2(y − x)
        let upstream = out_gradient.sum();
        let ddp = 2. * upstream * (&*args[1].borrow_array() - &*args[0].borrow_array());
        Ok(vec![
            wanted[0].then(|| -&ddp),
            wanted[1].then(|| ddp.clone()),
        ])
    }
}
