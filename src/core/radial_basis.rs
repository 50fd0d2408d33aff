use std::rc::Rc;

use ndarray::prelude::*;

use super::distance::{DistanceLayer, DistanceLayerConfiguration};
use super::error::Result;
use super::operations::{Exponentiation, Operation, Scale, ScaleRepeated};
use super::{Parameterized, Tensor, TensorBuilder};

/// Squashes squared distances into radial-basis responses,
/// exp(−normalizer · exp(sⱼ) · d), with one learned log-scale sⱼ per filter.
pub struct RadialBasis {
    identifier: String,
    normalizer: f32,
    scalers: Rc<Tensor>,
}

impl RadialBasis {
    /// Assumes statistically normalized inputs: the normalizer is
    /// 1/(2 · filter size), and the scalers start at zero.
    pub fn new(identifier: &str, configuration: &DistanceLayerConfiguration) -> Self {
        let normalizer = 1. / (2. * configuration.filter_size() as f32);
        Self {
            identifier: identifier.to_owned(),
            normalizer,
            scalers: Rc::new(
                TensorBuilder::new(Array::zeros(configuration.filter_count).into_dyn())
                    .identifier(&format!("{}_scalers", identifier))
                    .requires_gradient(true)
                    .build(),
            ),
        }
    }

    pub fn normalizer(&self) -> f32 {
        self.normalizer
    }

    pub fn scalers(&self) -> Rc<Tensor> {
        self.scalers.clone()
    }

    /// `distances` must have the filter axis last.
    pub fn forward(&self, distances: Rc<Tensor>) -> Result<Rc<Tensor>> {
        let scales = Exponentiation {}.forward(vec![self.scalers.clone()])?;
        let scales = Scale::new(-self.normalizer).forward(vec![scales])?;
        let scaled = ScaleRepeated {}.forward(vec![distances, scales])?;
        Exponentiation {}.forward(vec![scaled])
    }
}

impl Parameterized for RadialBasis {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn parameters(&self) -> Vec<Rc<Tensor>> {
        vec![self.scalers.clone()]
    }
}

/// A distance layer followed by its radial-basis squashing.
pub struct SlidingRadialBasisLayer {
    identifier: String,
    distance: DistanceLayer,
    radial_basis: RadialBasis,
}

impl SlidingRadialBasisLayer {
    pub fn new(identifier: &str, configuration: DistanceLayerConfiguration) -> Result<Self> {
        let distance = DistanceLayer::new(&format!("{}_distance", identifier), configuration)?;
        let radial_basis =
            RadialBasis::new(&format!("{}_radial_basis", identifier), &configuration);
        Ok(Self {
            identifier: identifier.to_owned(),
            distance,
            radial_basis,
        })
    }

    pub fn distance_layer(&self) -> &DistanceLayer {
        &self.distance
    }

    pub fn radial_basis(&self) -> &RadialBasis {
        &self.radial_basis
    }

    pub fn forward(&self, input: Rc<Tensor>) -> Result<Rc<Tensor>> {
        let distances = self.distance.forward(input)?;
        self.radial_basis.forward(distances)
    }
}

impl Parameterized for SlidingRadialBasisLayer {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn parameters(&self) -> Vec<Rc<Tensor>> {
        let mut parameters = self.distance.parameters();
        parameters.extend(self.radial_basis.parameters());
        parameters
    }
}
