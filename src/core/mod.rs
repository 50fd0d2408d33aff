use std::cell::{Ref, RefCell, RefMut};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;
use std::sync::Mutex;

use lazy_static::lazy_static;
use log::debug;
use ndarray::prelude::*;

use topological_sort::TopologicalSort;

pub mod distance;
pub mod error;
pub mod operations;
pub mod optimization;
pub mod radial_basis;
pub mod windows;

use self::error::{LayerError, Result};
use self::operations::Operation;

lazy_static! {
    static ref COUNTER: Mutex<u64> = Mutex::new(0);
}

fn generate_sequential_tensor_id() -> String {
    let mut num = COUNTER.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    *num += 1;
    format!("Tensor{}", num)
}

pub struct Tensor {
    identifier: String,
    array: RefCell<ArrayD<f32>>,
    requires_gradient: bool,
    // identifiers of the gradient-requiring leaves this tensor depends on
    variables: HashSet<String>,
    origin: Option<Origin>,
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("identifier", &self.identifier)
            .field("array", &self.array)
            .field("requires_gradient", &self.requires_gradient)
            .field("variables", &self.variables)
            .finish()
    }
}

impl Hash for Tensor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identifier.hash(state);
    }
}

impl PartialEq for Tensor {
    fn eq(&self, other: &Self) -> bool {
        self.identifier == other.identifier
    }
}

impl Eq for Tensor {}

impl Tensor {
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn borrow_array(&self) -> Ref<ArrayD<f32>> {
        self.array.borrow()
    }

    pub fn borrow_array_mut(&self) -> RefMut<ArrayD<f32>> {
        self.array.borrow_mut()
    }

    /// The sole element of a one-element tensor (e.g., a loss).
    pub fn item(&self) -> Option<f32> {
        let array = self.array.borrow();
        if array.len() == 1 {
            array.iter().next().copied()
        } else {
            None
        }
    }

    pub fn variables(&self) -> &HashSet<String> {
        &self.variables
    }

    /// Whether any gradient-requiring leaf feeds into this tensor.
    pub fn is_differentiable(&self) -> bool {
        !self.variables.is_empty()
    }
}

pub struct TensorBuilder {
    array: ArrayD<f32>,
    identifier: Option<String>,
    requires_gradient: bool,
    origin: Option<Origin>,
}

impl TensorBuilder {
    pub fn new(array: ArrayD<f32>) -> TensorBuilder {
        TensorBuilder {
            array,
            identifier: None,
            requires_gradient: true,
            origin: None,
        }
    }

    pub fn identifier(mut self, identifier: &str) -> TensorBuilder {
        self.identifier = Some(identifier.to_owned());
        self
    }

    pub fn requires_gradient(mut self, requires: bool) -> TensorBuilder {
        self.requires_gradient = requires;
        self
    }

    fn origin(mut self, origin: Origin) -> TensorBuilder {
        self.origin = Some(origin);
        self
    }

    pub fn build(self) -> Tensor {
        let identifier = match self.identifier {
            Some(identifier) => identifier,
            None => generate_sequential_tensor_id(),
        };
        let mut variables = HashSet::new();
        match &self.origin {
            Some(origin) => {
                for parent in &origin.parents {
                    variables.extend(parent.variables.iter().cloned());
                }
            }
            None => {
                if self.requires_gradient {
                    variables.insert(identifier.clone());
                }
            }
        }
        Tensor {
            array: RefCell::new(self.array),
            identifier,
            requires_gradient: self.requires_gradient,
            variables,
            origin: self.origin,
        }
    }
}

struct Origin {
    operation: Box<dyn Operation>,
    parents: Vec<Rc<Tensor>>,
}

/// Gradients of a backward pass, keyed by variable identifier. Nothing is
/// written back into the tensors; an optimizer reads these afterwards.
#[derive(Debug, Default)]
pub struct Gradients {
    gradients: HashMap<String, ArrayD<f32>>,
}

impl Gradients {
    pub fn get(&self, tensor: &Tensor) -> Option<&ArrayD<f32>> {
        self.gradients.get(&tensor.identifier)
    }

    pub fn len(&self) -> usize {
        self.gradients.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.gradients.is_empty()
    }
}

pub trait Parameterized {
    fn identifier(&self) -> &str;
    fn parameters(&self) -> Vec<Rc<Tensor>>;

    fn parameter_count(&self) -> usize {
        self.parameters()
            .iter()
            .map(|parameter| parameter.borrow_array().len())
            .sum()
    }
}

fn register_parents(sorter: &mut TopologicalSort<Rc<Tensor>>, child: Rc<Tensor>) {
    if let Some(origin) = &child.origin {
        for parent in &origin.parents {
            sorter.add_dependency(parent.clone(), child.clone());
            register_parents(sorter, parent.clone());
        }
    }
}

fn sorted_computation_graph(end: Rc<Tensor>) -> Vec<Rc<Tensor>> {
    let mut sorter = TopologicalSort::new();
    register_parents(&mut sorter, end.clone());
    let mut sorted = sorter.collect::<Vec<_>>();
    if sorted.is_empty() {
        // a lone leaf has no edges to sort
        return vec![end];
    }
    // We actually want reverse-topological order
    sorted.reverse();
    sorted
}

pub fn backprop(culmination: Rc<Tensor>) -> Result<Gradients> {
    let seed = Array::ones(culmination.borrow_array().shape());
    backprop_with_gradient(culmination, seed)
}

/// Propagates `out_gradient` (dL/d`culmination`) back to every variable
/// `culmination` depends on. Operations are only asked for the gradients of
/// parents that are themselves differentiable.
pub fn backprop_with_gradient(
    culmination: Rc<Tensor>,
    out_gradient: ArrayD<f32>,
) -> Result<Gradients> {
    if out_gradient.shape() != culmination.borrow_array().shape() {
        return Err(LayerError::ShapeMismatch {
            expected: culmination.borrow_array().len(),
            actual: out_gradient.len(),
        });
    }
    debug!(
        "backprop from {} toward {:?}",
        culmination.identifier(),
        culmination.variables()
    );
    let mut pending = HashMap::<String, ArrayD<f32>>::new();
    pending.insert(culmination.identifier.clone(), out_gradient);
    let mut gradients = Gradients::default();

    for node in sorted_computation_graph(culmination) {
        if !node.is_differentiable() {
            continue;
        }
        let gradient = pending
            .remove(&node.identifier)
            .ok_or_else(|| LayerError::MissingGradient(node.identifier.clone()))?;

        match &node.origin {
            Some(origin) => {
                let wanted = origin
                    .parents
                    .iter()
                    .map(|parent| parent.is_differentiable())
                    .collect::<Vec<_>>();
                let contributions = origin
                    .operation
                    .backward(&gradient, &origin.parents, &wanted)?;
                for (parent, contribution) in origin.parents.iter().zip(contributions) {
                    let Some(contribution) = contribution else {
                        continue;
                    };
                    match pending.get_mut(&parent.identifier) {
                        Some(gradient) => {
                            *gradient += &contribution;
                        }
                        None => {
                            pending.insert(parent.identifier.clone(), contribution);
                        }
                    }
                }
            }
            None => {
                gradients.gradients.insert(node.identifier.clone(), gradient);
            }
        }
    }
    debug!("backprop produced {} variable gradients", gradients.len());
    Ok(gradients)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::operations::{Exponentiation, Scale, SquaredError};
    use approx::{assert_abs_diff_eq, assert_relative_eq};

    #[test]
    fn test_backprop() {
        let a = Rc::new(
            TensorBuilder::new(array![0.5, -1.0].into_dyn())
                .identifier("a")
                .build(),
        );
        let target = Rc::new(
            TensorBuilder::new(array![1.0, 0.0].into_dyn())
                .identifier("target")
                .requires_gradient(false)
                .build(),
        );

        let scaled = Scale::new(3.).forward(vec![a.clone()]).expect("scale");
        let loss = SquaredError {}
            .forward(vec![scaled, target.clone()])
            .expect("loss");
        // (1 − 1.5)² + (0 − −3)²
        assert_abs_diff_eq!(loss.item().expect("scalar loss"), 9.25);

        let gradients = backprop(loss).expect("backprop should succeed");

        // d/da (t − 3a)² = −6(t − 3a)
        assert_eq!(
            *gradients.get(&a).expect("gradient for a"),
            array![3., -18.].into_dyn()
        );
        assert!(gradients.get(&target).is_none());
        assert_eq!(gradients.len(), 1);
    }

    #[test]
    fn test_backprop_with_reuse() {
        let a = Rc::new(TensorBuilder::new(array![2.0].into_dyn()).build());

        // exp(exp(a)) uses a once, but exp(a) feeds a scale twice over
        let exp_a = Exponentiation {}.forward(vec![a.clone()]).expect("exp");
        let doubled = Scale::new(2.).forward(vec![exp_a.clone()]).expect("scale");
        let loss = SquaredError {}
            .forward(vec![doubled, exp_a])
            .expect("loss");
        // (eᵃ − 2eᵃ)² = e²ᵃ, so d/da = 2e²ᵃ
        let gradients = backprop(loss).expect("backprop should succeed");
        assert_relative_eq!(
            *gradients.get(&a).expect("gradient for a"),
            array![2. * 4f32.exp()].into_dyn(),
            max_relative = 1e-4
        );
    }

    #[test]
    fn test_backprop_constants_only() {
        let a = Rc::new(
            TensorBuilder::new(array![1.0].into_dyn())
                .requires_gradient(false)
                .build(),
        );
        let out = Exponentiation {}.forward(vec![a.clone()]).expect("exp");
        assert!(!out.is_differentiable());
        let gradients = backprop(out).expect("backprop should succeed");
        assert!(gradients.is_empty());
    }

    #[test]
    fn test_backprop_rejects_misshapen_seed() {
        let a = Rc::new(TensorBuilder::new(array![1.0, 2.0].into_dyn()).build());
        let out = Exponentiation {}.forward(vec![a]).expect("exp");
        assert!(matches!(
            backprop_with_gradient(out, array![1.0].into_dyn()),
            Err(LayerError::ShapeMismatch {
                expected: 2,
                actual: 1
            })
        ));
    }

    #[test]
    fn test_variables_propagate() {
        let a = Rc::new(TensorBuilder::new(array![1.0].into_dyn()).identifier("a").build());
        let b = Rc::new(
            TensorBuilder::new(array![1.0].into_dyn())
                .identifier("b")
                .requires_gradient(false)
                .build(),
        );
        let loss = SquaredError {}.forward(vec![a, b]).expect("loss");
        assert_eq!(loss.variables().len(), 1);
        assert!(loss.variables().contains("a"));
    }
}
