//! # Parameter Storage
//!
//! Owns the flat parameter buffer of a convolution layer and hands out typed
//! views over it: the leading part is the filter bank, the tail is the bias.

use ndarray::{ArrayView1, ArrayView3, ArrayViewMut1, ArrayViewMut3};

use super::{cube_view, cube_view_mut, TensorData, TensorError};

/// Flat buffer holding `slices * rows * cols` filter taps followed by `bias_len` biases.
///
/// The filter bank is viewed as a cube of shape `(slices, rows, cols)`; views
/// are bounds-checked `ndarray` views, never raw aliases.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterBuffer {
    data: Vec<TensorData>,
    filter_shape: (usize, usize, usize),
    bias_len: usize,
}

impl ParameterBuffer {
    /// Creates a zeroed buffer.
    pub fn zeros(filter_shape: (usize, usize, usize), bias_len: usize) -> Self {
        let (slices, rows, cols) = filter_shape;
        ParameterBuffer {
            data: vec![0.0; slices * rows * cols + bias_len],
            filter_shape,
            bias_len,
        }
    }

    /// Wraps an existing flat buffer, checking its length.
    pub fn from_vec(
        data: Vec<TensorData>,
        filter_shape: (usize, usize, usize),
        bias_len: usize,
    ) -> Result<Self, TensorError> {
        let (slices, rows, cols) = filter_shape;
        let expected = slices * rows * cols + bias_len;
        if data.len() != expected {
            return Err(TensorError::ShapeMismatch {
                expected: vec![expected],
                got: vec![data.len()],
            });
        }
        Ok(ParameterBuffer {
            data,
            filter_shape,
            bias_len,
        })
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn filter_shape(&self) -> (usize, usize, usize) {
        self.filter_shape
    }

    fn filter_len(&self) -> usize {
        self.data.len() - self.bias_len
    }

    pub fn as_slice(&self) -> &[TensorData] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [TensorData] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<TensorData> {
        self.data
    }

    /// The whole buffer as a 1D view.
    pub fn view(&self) -> ArrayView1<'_, TensorData> {
        ArrayView1::from(&self.data[..])
    }

    /// Filter bank view of shape `(slices, rows, cols)`.
    pub fn filters(&self) -> Result<ArrayView3<'_, TensorData>, TensorError> {
        let (slices, rows, cols) = self.filter_shape;
        cube_view(&self.data[..self.filter_len()], slices, rows, cols)
    }

    pub fn bias(&self) -> ArrayView1<'_, TensorData> {
        ArrayView1::from(&self.data[self.filter_len()..])
    }

    /// Disjoint mutable views of the filter bank and the bias.
    pub fn split_mut(
        &mut self,
    ) -> Result<(ArrayViewMut3<'_, TensorData>, ArrayViewMut1<'_, TensorData>), TensorError> {
        let (slices, rows, cols) = self.filter_shape;
        let split = self.filter_len();
        let (filters, bias) = self.data.split_at_mut(split);
        Ok((
            cube_view_mut(filters, slices, rows, cols)?,
            ArrayViewMut1::from(bias),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn views_alias_the_flat_buffer() {
        let data: Vec<TensorData> = (0..10).map(|v| v as TensorData).collect();
        let buffer = ParameterBuffer::from_vec(data, (2, 2, 2), 2).unwrap();
        let filters = buffer.filters().unwrap();
        assert_eq!(filters[[1, 0, 1]], 5.0);
        assert_eq!(buffer.bias().to_vec(), vec![8.0, 9.0]);
    }

    #[test]
    fn split_mut_writes_through() {
        let mut buffer = ParameterBuffer::zeros((1, 2, 2), 1);
        {
            let (mut filters, mut bias) = buffer.split_mut().unwrap();
            filters[[0, 1, 1]] = 3.0;
            bias[0] = -1.0;
        }
        assert_eq!(buffer.as_slice(), &[0.0, 0.0, 0.0, 3.0, -1.0]);
    }

    #[test]
    fn from_vec_rejects_wrong_length() {
        let err = ParameterBuffer::from_vec(vec![0.0; 4], (1, 2, 2), 1).unwrap_err();
        assert!(matches!(err, TensorError::ShapeMismatch { .. }));
    }
}
