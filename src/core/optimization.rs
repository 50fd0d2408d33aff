use std::rc::Rc;

use log::debug;

use super::{Gradients, Tensor};

pub trait Optimizer {
    fn step(&mut self, gradients: &Gradients);
    fn step_count(&self) -> usize;
}

pub struct StochasticGradientDescentOptimizer {
    parameters: Vec<Rc<Tensor>>,
    learning_rate: f32,
    step_count: usize,
}

impl StochasticGradientDescentOptimizer {
    pub fn new(parameters: Vec<Rc<Tensor>>, learning_rate: f32) -> Self {
        Self {
            parameters,
            learning_rate,
            step_count: 0,
        }
    }
}

impl Optimizer for StochasticGradientDescentOptimizer {
    fn step(&mut self, gradients: &Gradients) {
        for parameter in &self.parameters {
            match gradients.get(parameter) {
                Some(gradient) => {
                    let mut array = parameter.borrow_array_mut();
                    *array -= &(self.learning_rate * gradient);
                }
                None => debug!("no gradient for {}; leaving it be", parameter.identifier()),
            }
        }
        self.step_count += 1;
    }

    fn step_count(&self) -> usize {
        self.step_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    use crate::core::operations::{Operation, SquaredError};
    use crate::core::{backprop, TensorBuilder};

    use approx::assert_abs_diff_eq;

    #[test]
    fn test_sgd_optimization_step() {
        let tensor1 = Rc::new(
            TensorBuilder::new(array![[1.0, 2.0], [3.0, 4.0]].into_dyn()).build(),
        );
        let tensor2 = Rc::new(
            TensorBuilder::new(array![[0.0, 0.0], [1.0, 1.0]].into_dyn()).build(),
        );
        let frozen = Rc::new(
            TensorBuilder::new(array![5.0].into_dyn())
                .requires_gradient(false)
                .build(),
        );

        let loss = SquaredError {}
            .forward(vec![tensor1.clone(), tensor2.clone()])
            .expect("loss");
        let gradients = backprop(loss).expect("backprop");

        let mut optimizer = StochasticGradientDescentOptimizer::new(
            vec![tensor1.clone(), tensor2.clone(), frozen.clone()],
            0.1,
        );
        optimizer.step(&gradients);
        assert_eq!(optimizer.step_count(), 1);

        // gradient of tensor1 is −2(tensor2 − tensor1) = [[2, 4], [4, 6]]
        assert_abs_diff_eq!(
            *tensor1.borrow_array(),
            array![[0.8, 1.6], [2.6, 3.4]].into_dyn(),
            epsilon = 1e-6
        );
        assert_abs_diff_eq!(
            *tensor2.borrow_array(),
            array![[0.2, 0.4], [1.4, 1.6]].into_dyn(),
            epsilon = 1e-6
        );
        assert_eq!(*frozen.borrow_array(), array![5.0].into_dyn());
    }
}
