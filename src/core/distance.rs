use std::rc::Rc;

use log::{debug, info};
use ndarray::prelude::*;
use ndarray_rand::RandomExt;
use rand_distr::StandardNormal;
use rayon::prelude::*;

use super::error::{LayerError, Result};
use super::operations::{derived_tensor, Operation};
use super::windows::{checked_volume, WindowGeometry};
use super::{Origin, Parameterized, Tensor, TensorBuilder};

/// The eight integers that fully determine a distance layer's shape.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DistanceLayerConfiguration {
    pub input_width: usize,
    pub input_height: usize,
    pub input_depth: usize,
    pub filter_width: usize,
    pub filter_height: usize,
    pub filter_count: usize,
    pub stride_x: usize,
    pub stride_y: usize,
}

impl Default for DistanceLayerConfiguration {
    fn default() -> Self {
        Self {
            input_width: 3,
            input_height: 3,
            input_depth: 2,
            filter_width: 2,
            filter_height: 2,
            filter_count: 2,
            stride_x: 1,
            stride_y: 1,
        }
    }
}

impl DistanceLayerConfiguration {
    pub fn validate(&self) -> Result<WindowGeometry> {
        if self.filter_count == 0 {
            return Err(LayerError::InvalidConfiguration(
                "filter count must be positive".to_owned(),
            ));
        }
        let geometry = WindowGeometry::new(
            (self.input_width, self.input_height, self.input_depth),
            (self.filter_width, self.filter_height),
            (self.stride_x, self.stride_y),
        )?;
        if checked_volume(&[self.filter_count, geometry.window_size()]).is_none()
            || checked_volume(&[self.filter_count, geometry.window_count()]).is_none()
        {
            return Err(LayerError::InvalidConfiguration(format!(
                "{} filters of {} values are too many",
                self.filter_count,
                geometry.window_size()
            )));
        }
        Ok(geometry)
    }

    /// Saturates rather than overflowing, so it's only exact for a
    /// configuration that validates.
    pub fn filter_size(&self) -> usize {
        self.filter_width
            .saturating_mul(self.filter_height)
            .saturating_mul(self.input_depth)
    }
}

/// Which gradients a backward pass should bother computing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GradientRequest {
    pub filters: bool,
    pub input: bool,
}

#[derive(Debug)]
pub struct DistanceGradients {
    /// Shaped (filter count, filter size), like the filter matrix.
    pub filters: Option<Array2<f32>>,
    /// Flat, one sample after another, like the input batch.
    pub input: Option<Array1<f32>>,
}

/// Squared Euclidean distances between every window of every sample in
/// `batch` and every row of `filters`, shaped (batch size, window count,
/// filter count).
///
/// Uses ‖m − f‖² = ‖m‖² − 2·m·f + ‖f‖², so the cross terms for a whole
/// sample come out of one matrix product. Each sample's window matrix only
/// lives as long as that sample's share of the work.
pub fn squared_distances(
    geometry: &WindowGeometry,
    filters: ArrayView2<f32>,
    batch: ArrayView1<f32>,
) -> Result<Array3<f32>> {
    check_filters(geometry, &filters)?;
    let samples = geometry.samples(&batch)?;
    let filter_norms = filters.mapv(|x| x * x).sum_axis(Axis(1));

    let distances = samples
        .par_iter()
        .map(|sample| -> Result<Array2<f32>> {
            let windows = geometry.gather(sample.view())?;
            Ok(sample_distances(windows.view(), filters, filter_norms.view()))
        })
        .collect::<Result<Vec<_>>>()?;
    let views = distances.iter().map(|d| d.view()).collect::<Vec<_>>();
    Ok(ndarray::stack(Axis(0), &views)?)
}

fn sample_distances(
    windows: ArrayView2<f32>,
    filters: ArrayView2<f32>,
    filter_norms: ArrayView1<f32>,
) -> Array2<f32> {
    let window_norms = windows.mapv(|x| x * x).sum_axis(Axis(1));
    let cross = windows.dot(&filters.t());
    -2. * cross + &window_norms.insert_axis(Axis(1)) + &filter_norms.insert_axis(Axis(0))
}

/// Vector-Jacobian product of [`squared_distances`]: given dL/d(distances)
/// as `upstream` (flattened, same layout as the forward output), computes
/// dL/d(filters) and dL/d(batch) as requested.
///
/// Samples are worked on one window matrix at a time, each scattering its
/// input gradient into its own slice of a fresh buffer. Nothing the caller
/// can see is touched unless every sample succeeds.
pub fn distance_gradients(
    geometry: &WindowGeometry,
    filters: ArrayView2<f32>,
    batch: ArrayView1<f32>,
    upstream: ArrayView1<f32>,
    request: GradientRequest,
) -> Result<DistanceGradients> {
    check_filters(geometry, &filters)?;
    let samples = geometry.samples(&batch)?;
    let batch_size = samples.len();
    let filter_count = filters.nrows();
    let expected = batch_size * geometry.window_count() * filter_count;
    if upstream.len() != expected {
        return Err(LayerError::ShapeMismatch {
            expected,
            actual: upstream.len(),
        });
    }
    if !request.filters && !request.input {
        return Ok(DistanceGradients {
            filters: None,
            input: None,
        });
    }
    let upstream =
        upstream.to_shape((batch_size, geometry.window_count(), filter_count))?;

    let mut input_gradient = request.input.then(|| Array1::<f32>::zeros(batch.len()));
    let destinations = match input_gradient.as_mut() {
        Some(gradient) => gradient
            .exact_chunks_mut(geometry.input_size())
            .into_iter()
            .map(Some)
            .collect::<Vec<_>>(),
        None => (0..batch_size).map(|_| None).collect(),
    };
    let filter_contributions = samples
        .par_iter()
        .zip(destinations)
        .enumerate()
        .map(|(i, (sample, destination))| {
            sample_gradients(
                geometry,
                filters,
                sample.view(),
                upstream.index_axis(Axis(0), i),
                request.filters,
                destination,
            )
        })
        .collect::<Result<Vec<_>>>()?;

    let filter_gradient = request.filters.then(|| {
        let mut total = Array2::<f32>::zeros(filters.raw_dim());
        for contribution in filter_contributions.iter().flatten() {
            total += contribution;
        }
        total
    });

    Ok(DistanceGradients {
        filters: filter_gradient,
        input: input_gradient,
    })
}

// The window matrix is gathered again from the input rather than kept around
// from the forward pass; both gradients share it.
fn sample_gradients(
    geometry: &WindowGeometry,
    filters: ArrayView2<f32>,
    sample: ArrayView1<f32>,
    upstream: ArrayView2<f32>,
    want_filters: bool,
    input_destination: Option<ArrayViewMut1<f32>>,
) -> Result<Option<Array2<f32>>> {
    let windows = geometry.gather(sample)?;
    if let Some(destination) = input_destination {
        let window_gradient = sample_window_gradient(windows.view(), filters, upstream);
        geometry.scatter_add(window_gradient.view(), destination)?;
    }
    Ok(want_filters.then(|| sample_filter_gradient(windows.view(), filters, upstream)))
}

// ∂L/∂f_jk = Σ_i U_ij · −2(m_ik − f_jk) = 2·f_jk·(Σ_i U_ij) − 2·(Uᵀ·M)_jk
fn sample_filter_gradient(
    windows: ArrayView2<f32>,
    filters: ArrayView2<f32>,
    upstream: ArrayView2<f32>,
) -> Array2<f32> {
    let per_filter = upstream.sum_axis(Axis(0)).insert_axis(Axis(1));
    2. * (&filters * &per_filter) - 2. * upstream.t().dot(&windows)
}

// ∂L/∂m_ik = Σ_j U_ij · 2(m_ik − f_jk) = 2·m_ik·(Σ_j U_ij) − 2·(U·F)_ik
fn sample_window_gradient(
    windows: ArrayView2<f32>,
    filters: ArrayView2<f32>,
    upstream: ArrayView2<f32>,
) -> Array2<f32> {
    let per_window = upstream.sum_axis(Axis(1)).insert_axis(Axis(1));
    2. * (&windows * &per_window) - 2. * upstream.dot(&filters)
}

fn check_filters(geometry: &WindowGeometry, filters: &ArrayView2<f32>) -> Result<()> {
    if filters.ncols() != geometry.window_size() {
        return Err(LayerError::ShapeMismatch {
            expected: filters.nrows() * geometry.window_size(),
            actual: filters.len(),
        });
    }
    Ok(())
}

/// Graph node for [`squared_distances`]. Arguments are `[filters, input]`;
/// the filters are a (filter count, filter size) matrix and the input may
/// have any shape whose length is a whole number of samples.
pub struct SlidingDistance {
    geometry: WindowGeometry,
}

impl SlidingDistance {
    pub fn new(geometry: WindowGeometry) -> Self {
        Self { geometry }
    }
}

impl Operation for SlidingDistance {
    fn forward(&self, inputs: Vec<Rc<Tensor>>) -> Result<Rc<Tensor>> {
        assert!(inputs.len() == 2, "binary operation expected");
        let distances = {
            let filters = inputs[0].borrow_array();
            let input = inputs[1].borrow_array();
            let flat = input.to_shape(input.len())?;
            squared_distances(
                &self.geometry,
                filters.view().into_dimensionality::<Ix2>()?,
                flat.view(),
            )?
        };
        debug!(
            "distance forward: {} samples × {} windows × {} filters",
            distances.shape()[0],
            distances.shape()[1],
            distances.shape()[2]
        );
        let origin = Origin {
            operation: Box::new(SlidingDistance {
                geometry: self.geometry,
            }),
            parents: inputs,
        };
        Ok(derived_tensor(distances.into_dyn(), origin))
    }

    fn backward(
        &self,
        out_gradient: &ArrayD<f32>,
        args: &[Rc<Tensor>],
        wanted: &[bool],
    ) -> Result<Vec<Option<ArrayD<f32>>>> {
        let filters = args[0].borrow_array();
        let input = args[1].borrow_array();
        let request = GradientRequest {
            filters: wanted[0],
            input: wanted[1],
        };
        debug!("distance backward: {:?}", request);
        let gradients = distance_gradients(
            &self.geometry,
            filters.view().into_dimensionality::<Ix2>()?,
            input.to_shape(input.len())?.view(),
            out_gradient.to_shape(out_gradient.len())?.view(),
            request,
        )?;
        let filter_gradient = gradients.filters.map(|gradient| gradient.into_dyn());
        let input_gradient = match gradients.input {
            Some(gradient) => Some(gradient.into_shape_with_order(input.raw_dim())?),
            None => None,
        };
        Ok(vec![filter_gradient, input_gradient])
    }
}

/// A layer measuring the squared distance from each sliding window of its
/// input to each of its learned filters.
pub struct DistanceLayer {
    identifier: String,
    configuration: DistanceLayerConfiguration,
    geometry: WindowGeometry,
    filters: Rc<Tensor>,
}

impl DistanceLayer {
    /// Creates a layer with standard-normal filters.
    pub fn new(identifier: &str, configuration: DistanceLayerConfiguration) -> Result<Self> {
        let geometry = configuration.validate()?;
        let filters = Array::random(
            (configuration.filter_count, geometry.window_size()),
            StandardNormal,
        );
        Self::from_filters(identifier, configuration, filters.into_dyn())
    }

    /// Creates a layer with the given filters, stacked one after another in
    /// (height, width, depth) order.
    pub fn from_filters(
        identifier: &str,
        configuration: DistanceLayerConfiguration,
        filters: ArrayD<f32>,
    ) -> Result<Self> {
        let geometry = configuration.validate()?;
        // validation guarantees this product fits
        let expected = configuration.filter_count * geometry.window_size();
        if filters.len() != expected {
            return Err(LayerError::InvalidConfiguration(format!(
                "expected {} filter values, got {}",
                expected,
                filters.len()
            )));
        }
        let filters = Array::from_shape_vec(
            (configuration.filter_count, geometry.window_size()),
            filters.iter().copied().collect(),
        )?;
        info!(
            "creating distance layer {:?}: {} filters of {}×{}×{}, output {}×{}×{}",
            identifier,
            configuration.filter_count,
            configuration.filter_width,
            configuration.filter_height,
            configuration.input_depth,
            geometry.window_count_x(),
            geometry.window_count_y(),
            configuration.filter_count
        );
        Ok(Self {
            identifier: identifier.to_owned(),
            configuration,
            geometry,
            filters: Rc::new(
                TensorBuilder::new(filters.into_dyn())
                    .identifier(&format!("{}_filters", identifier))
                    .requires_gradient(true)
                    .build(),
            ),
        })
    }

    pub fn configuration(&self) -> &DistanceLayerConfiguration {
        &self.configuration
    }

    pub fn geometry(&self) -> &WindowGeometry {
        &self.geometry
    }

    pub fn filters(&self) -> Rc<Tensor> {
        self.filters.clone()
    }

    pub fn output_width(&self) -> usize {
        self.geometry.window_count_x()
    }

    pub fn output_height(&self) -> usize {
        self.geometry.window_count_y()
    }

    pub fn output_depth(&self) -> usize {
        self.configuration.filter_count
    }

    /// Output is shaped (batch size, window count, filter count), windows in
    /// y-major order.
    pub fn forward(&self, input: Rc<Tensor>) -> Result<Rc<Tensor>> {
        SlidingDistance::new(self.geometry).forward(vec![self.filters.clone(), input])
    }
}

impl Parameterized for DistanceLayer {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn parameters(&self) -> Vec<Rc<Tensor>> {
        vec![self.filters.clone()]
    }
}
