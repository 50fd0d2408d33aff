use ndarray::prelude::*;

use super::error::{LayerError, Result};

/// The positions of every rectangular window that fits inside one input
/// sample, stepping by a fixed stride along each axis.
///
/// Samples are flattened row-major as (height, width, depth), so depth varies
/// fastest. Windows are enumerated y-major, then x, and each window row is
/// flattened in the same (height, width, depth) order as the sample, which is
/// also the order the layer's filters are stored in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WindowGeometry {
    input_width: usize,
    input_height: usize,
    input_depth: usize,
    window_width: usize,
    window_height: usize,
    stride_x: usize,
    stride_y: usize,
}

impl WindowGeometry {
    pub fn new(
        (input_width, input_height, input_depth): (usize, usize, usize),
        (window_width, window_height): (usize, usize),
        (stride_x, stride_y): (usize, usize),
    ) -> Result<Self> {
        if input_width == 0 || input_height == 0 || input_depth == 0 {
            return Err(LayerError::InvalidConfiguration(format!(
                "input dimensions must be positive, got {}×{}×{}",
                input_width, input_height, input_depth
            )));
        }
        if window_width == 0 || window_height == 0 {
            return Err(LayerError::InvalidConfiguration(format!(
                "window dimensions must be positive, got {}×{}",
                window_width, window_height
            )));
        }
        if window_width > input_width || window_height > input_height {
            return Err(LayerError::InvalidConfiguration(format!(
                "window {}×{} does not fit inside input {}×{}",
                window_width, window_height, input_width, input_height
            )));
        }
        if stride_x == 0 || stride_y == 0 {
            return Err(LayerError::InvalidConfiguration(format!(
                "strides must be at least 1, got ({}, {})",
                stride_x, stride_y
            )));
        }
        let geometry = Self {
            input_width,
            input_height,
            input_depth,
            window_width,
            window_height,
            stride_x,
            stride_y,
        };
        // every buffer derived from the geometry has to be allocatable
        if checked_volume(&[input_width, input_height, input_depth]).is_none() {
            return Err(LayerError::InvalidConfiguration(format!(
                "input of {}×{}×{} values is too large",
                input_width, input_height, input_depth
            )));
        }
        if checked_volume(&[geometry.window_count(), geometry.window_size()]).is_none() {
            return Err(LayerError::InvalidConfiguration(format!(
                "{} windows of {} values do not fit in memory",
                geometry.window_count(),
                geometry.window_size()
            )));
        }
        Ok(geometry)
    }

    pub fn window_count_x(&self) -> usize {
        (self.input_width - self.window_width) / self.stride_x + 1
    }

    pub fn window_count_y(&self) -> usize {
        (self.input_height - self.window_height) / self.stride_y + 1
    }

    pub fn window_count(&self) -> usize {
        self.window_count_x() * self.window_count_y()
    }

    /// Length of one flattened input sample.
    pub fn input_size(&self) -> usize {
        self.input_width * self.input_height * self.input_depth
    }

    /// Length of one flattened window (and so of one filter).
    pub fn window_size(&self) -> usize {
        self.window_width * self.window_height * self.input_depth
    }

    /// Number of samples in a flat batch buffer of the given length.
    pub fn batch_size(&self, length: usize) -> Result<usize> {
        let input_size = self.input_size();
        if length == 0 || length % input_size != 0 {
            return Err(LayerError::ShapeMismatch {
                expected: (length / input_size).max(1) * input_size,
                actual: length,
            });
        }
        Ok(length / input_size)
    }

    // (y, x) of the top-left corner of the `index`th window
    fn window_origin(&self, index: usize) -> (usize, usize) {
        let count_x = self.window_count_x();
        (
            (index / count_x) * self.stride_y,
            (index % count_x) * self.stride_x,
        )
    }

    fn check_sample_length(&self, length: usize) -> Result<()> {
        if length != self.input_size() {
            return Err(LayerError::ShapeMismatch {
                expected: self.input_size(),
                actual: length,
            });
        }
        Ok(())
    }

    /// Copies each window of `sample` into one row of a
    /// (window count, window size) matrix.
    pub fn gather(&self, sample: ArrayView1<f32>) -> Result<Array2<f32>> {
        self.check_sample_length(sample.len())?;
        let volume = sample.to_shape((self.input_height, self.input_width, self.input_depth))?;
        let mut windows = Array2::zeros((self.window_count(), self.window_size()));
        for (i, mut row) in windows.rows_mut().into_iter().enumerate() {
            let (y, x) = self.window_origin(i);
            let window = volume.slice(s![
                y..y + self.window_height,
                x..x + self.window_width,
                ..
            ]);
            for (slot, &value) in row.iter_mut().zip(window.iter()) {
                *slot = value;
            }
        }
        Ok(windows)
    }

    /// Adds each row of `gradient` back onto the positions of `destination`
    /// that the corresponding window was gathered from. Positions covered by
    /// several windows receive the sum of all of their rows' entries.
    pub fn scatter_add(
        &self,
        gradient: ArrayView2<f32>,
        mut destination: ArrayViewMut1<f32>,
    ) -> Result<()> {
        self.check_sample_length(destination.len())?;
        if gradient.dim() != (self.window_count(), self.window_size()) {
            return Err(LayerError::ShapeMismatch {
                expected: self.window_count() * self.window_size(),
                actual: gradient.len(),
            });
        }
        // one line of a window is a contiguous run of the flattened sample
        let line = self.window_width * self.input_depth;
        for (i, row) in gradient.rows().into_iter().enumerate() {
            let (y, x) = self.window_origin(i);
            for dy in 0..self.window_height {
                let start = ((y + dy) * self.input_width + x) * self.input_depth;
                let mut span = destination.slice_mut(s![start..start + line]);
                span += &row.slice(s![dy * line..(dy + 1) * line]);
            }
        }
        Ok(())
    }

    /// Splits a flat batch buffer into one view per sample, in sample order.
    pub fn samples<'a>(&self, batch: &'a ArrayView1<f32>) -> Result<Vec<ArrayView1<'a, f32>>> {
        self.batch_size(batch.len())?;
        Ok(batch.exact_chunks(self.input_size()).into_iter().collect())
    }
}

// Product of `dimensions`, if it stays within what ndarray can allocate.
pub(super) fn checked_volume(dimensions: &[usize]) -> Option<usize> {
    dimensions
        .iter()
        .try_fold(1usize, |volume, &dimension| volume.checked_mul(dimension))
        .filter(|&volume| volume <= isize::MAX as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry(
        input: (usize, usize, usize),
        window: (usize, usize),
        stride: (usize, usize),
    ) -> WindowGeometry {
        WindowGeometry::new(input, window, stride).expect("geometry should be valid")
    }

    #[test]
    fn test_window_counts() {
        // (W, Fw, Sx) → ⌊(W − Fw)/Sx⌋ + 1
        for &(width, window_width, stride_x, expected) in &[
            (3, 2, 1, 2),
            (28, 3, 2, 13),
            (10, 4, 3, 3),
            (7, 3, 3, 2), // 4 isn't divisible by 3; the remainder column is dropped
            (5, 5, 2, 1),
        ] {
            let g = geometry((width, 4, 1), (window_width, 1), (stride_x, 1));
            assert_eq!(g.window_count_x(), expected);
            assert_eq!(g.window_count_y(), 4);
        }
        let g = geometry((4, 3, 5), (2, 3), (1, 4));
        assert_eq!(g.window_count_x(), 3);
        assert_eq!(g.window_count_y(), 1);
        assert_eq!(g.input_size(), 60);
        assert_eq!(g.window_size(), 30);
    }

    #[test]
    fn test_gather() {
        let g = geometry((3, 3, 2), (2, 2), (1, 1));
        let sample = array![
            3., 2., 1., 2., 3., 2., //
            3., 6., 1., 3., 5., -2., //
            -3., 2., 0., 2., 4., 2.
        ];
        let windows = g.gather(sample.view()).expect("sample should gather");
        assert_eq!(
            windows,
            array![
                [3., 2., 1., 2., 3., 6., 1., 3.],
                [1., 2., 3., 2., 1., 3., 5., -2.],
                [3., 6., 1., 3., -3., 2., 0., 2.],
                [1., 3., 5., -2., 0., 2., 4., 2.],
            ]
        );
        // same input, same rows
        assert_eq!(windows, g.gather(sample.view()).expect("sample should gather"));
    }

    #[test]
    fn test_scatter_add_sums_overlaps() {
        let g = geometry((3, 3, 1), (2, 2), (1, 1));
        let mut coverage = Array1::zeros(9);
        g.scatter_add(Array2::ones((4, 4)).view(), coverage.view_mut())
            .expect("scatter should succeed");
        assert_eq!(coverage, array![1., 2., 1., 2., 4., 2., 1., 2., 1.]);
    }

    #[test]
    fn test_scatter_add_inverts_gather_without_overlap() {
        let g = geometry((4, 2, 2), (2, 2), (2, 2));
        let sample = Array1::from_iter((0..16).map(|i| i as f32));
        let windows = g.gather(sample.view()).expect("sample should gather");
        let mut reconstructed = Array1::zeros(16);
        g.scatter_add(windows.view(), reconstructed.view_mut())
            .expect("scatter should succeed");
        assert_eq!(reconstructed, sample);
    }

    #[test]
    fn test_scatter_add_leaves_uncovered_positions() {
        let g = geometry((5, 1, 1), (2, 1), (2, 1));
        let mut destination = array![1., 1., 1., 1., 1.];
        g.scatter_add(array![[1., 2.], [3., 4.]].view(), destination.view_mut())
            .expect("scatter should succeed");
        assert_eq!(destination, array![2., 3., 4., 5., 1.]);
    }

    #[test]
    fn test_samples() {
        let g = geometry((2, 2, 1), (1, 1), (1, 1));
        let batch = array![1., 2., 3., 4., 5., 6., 7., 8.];
        let view = batch.view();
        let samples = g.samples(&view).expect("batch should split");
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[1], array![5., 6., 7., 8.]);
        assert_eq!(
            g.gather(samples[1]).expect("sample should gather"),
            array![[5.], [6.], [7.], [8.]]
        );
    }

    #[test]
    fn test_scatter_add_into_strided_destination() {
        let g = geometry((3, 3, 1), (2, 2), (1, 1));
        let mut buffer = Array1::zeros(18);
        g.scatter_add(
            Array2::ones((4, 4)).view(),
            buffer.slice_mut(s![..;2]),
        )
        .expect("a strided destination of the right length should be accepted");
        assert_eq!(
            buffer.slice(s![..;2]),
            array![1., 2., 1., 2., 4., 2., 1., 2., 1.]
        );
        assert!(buffer.slice(s![1..;2]).iter().all(|&value| value == 0.));
    }

    #[test]
    fn test_shape_mismatches() {
        let g = geometry((3, 3, 2), (2, 2), (1, 1));
        assert!(matches!(
            g.gather(Array1::zeros(17).view()),
            Err(LayerError::ShapeMismatch { expected: 18, actual: 17 })
        ));
        assert!(matches!(
            g.scatter_add(Array2::zeros((4, 8)).view(), Array1::zeros(19).view_mut()),
            Err(LayerError::ShapeMismatch { expected: 18, actual: 19 })
        ));
        assert!(matches!(
            g.scatter_add(Array2::zeros((3, 8)).view(), Array1::zeros(18).view_mut()),
            Err(LayerError::ShapeMismatch { .. })
        ));
        assert!(g.samples(&Array1::zeros(30).view()).is_err());
        assert!(g.samples(&Array1::zeros(0).view()).is_err());
    }

    #[test]
    fn test_invalid_geometries() {
        for (input, window, stride) in [
            ((3, 3, 2), (4, 2), (1, 1)),
            ((3, 3, 2), (2, 4), (1, 1)),
            ((3, 3, 2), (2, 2), (0, 1)),
            ((3, 3, 0), (2, 2), (1, 1)),
            ((3, 3, 2), (0, 2), (1, 1)),
            ((1 << 40, 1 << 40, 1), (1, 1), (1, 1)),
            ((usize::MAX, 2, 2), (2, 2), (1, 1)),
            // a modest input whose window matrix would not be
            ((1 << 16, 1 << 16, 1 << 8), (1 << 15, 1 << 15), (1, 1)),
        ] {
            assert!(matches!(
                WindowGeometry::new(input, window, stride),
                Err(LayerError::InvalidConfiguration(_))
            ));
        }
    }
}
