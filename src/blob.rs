//! Parameter blob: the seam to the external tensor runtime.
//!
//! The autodiff runtime owns forward/backward kernels and tensor layout;
//! podar only needs read access to weight values, read/write access to the
//! gradient buffer, and the logical (rows, cols) view of the tensor. A
//! `ParamBlob` carries exactly that: a dense value buffer, a same-sized
//! gradient buffer, and a shape whose first axis is the output-unit axis
//! with all remaining axes flattened into the fan-in.

use crate::error::PruneError;

/// A learnable parameter tensor paired with its gradient buffer.
///
/// Shape convention: `shape[0]` is the number of output units (filters /
/// neurons); the product of the remaining axes is the flattened fan-in.
/// A 1-D shape denotes a bias blob, which structural (row/column) policies
/// skip.
#[derive(Debug, Clone)]
pub struct ParamBlob {
    data: Vec<f32>,
    diff: Vec<f32>,
    shape: Vec<usize>,
}

impl ParamBlob {
    /// Create a blob from a value slice and shape.
    ///
    /// # Panics
    ///
    /// Panics if the data length doesn't match the product of shape
    /// dimensions.
    #[must_use]
    pub fn new(data: &[f32], shape: &[usize]) -> Self {
        let expected_len: usize = shape.iter().product();
        assert_eq!(
            data.len(),
            expected_len,
            "Data length {} doesn't match shape {:?} (expected {})",
            data.len(),
            shape,
            expected_len
        );

        Self {
            data: data.to_vec(),
            diff: vec![0.0; expected_len],
            shape: shape.to_vec(),
        }
    }

    /// Create a zero-filled blob.
    #[must_use]
    pub fn zeros(shape: &[usize]) -> Self {
        let len: usize = shape.iter().product();
        Self::new(&vec![0.0; len], shape)
    }

    /// Total element count.
    #[must_use]
    pub fn count(&self) -> usize {
        self.data.len()
    }

    /// Number of output units (first axis).
    #[must_use]
    pub fn rows(&self) -> usize {
        self.shape.first().copied().unwrap_or(0)
    }

    /// Flattened fan-in (count / rows).
    #[must_use]
    pub fn cols(&self) -> usize {
        let rows = self.rows();
        if rows == 0 {
            0
        } else {
            self.count() / rows
        }
    }

    /// Whether this is a 1-D bias blob.
    #[must_use]
    pub fn is_bias(&self) -> bool {
        self.shape.len() == 1
    }

    /// Shape of the blob.
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Weight values.
    #[must_use]
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Mutable weight values.
    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Gradient buffer.
    #[must_use]
    pub fn diff(&self) -> &[f32] {
        &self.diff
    }

    /// Mutable gradient buffer.
    pub fn diff_mut(&mut self) -> &mut [f32] {
        &mut self.diff
    }

    /// Simultaneous read access to values and write access to gradients.
    ///
    /// The regularizer reads weights while accumulating into the gradient;
    /// splitting the borrows keeps that a single pass.
    pub fn data_and_diff_mut(&mut self) -> (&[f32], &mut [f32]) {
        (&self.data, &mut self.diff)
    }

    /// Zero the gradient buffer.
    pub fn zero_diff(&mut self) {
        self.diff.iter_mut().for_each(|d| *d = 0.0);
    }

    /// Check the blob against a recorded (rows, cols) view.
    pub fn check_shape(&self, rows: usize, cols: usize) -> Result<(), PruneError> {
        if self.rows() != rows || self.cols() != cols {
            return Err(PruneError::ShapeMismatch {
                expected: vec![rows, cols],
                got: vec![self.rows(), self.cols()],
            });
        }
        Ok(())
    }
}
