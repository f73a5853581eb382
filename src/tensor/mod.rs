//! # Tensor Module
//!
//! Element type, error taxonomy and the cube views every layer works on.
//!
//! A batch travels through the layers as a flat `Array2` of shape
//! `(batch, channels * height * width)`. Layers reinterpret it zero-copy as a
//! cube of shape `(channels * batch, height, width)`, where slice
//! `channel + batch * channels` holds one feature map.

use ndarray::{
    Array3, ArrayBase, ArrayView2, ArrayView3, ArrayViewMut3, Data, Dimension, ErrorKind, ShapeError,
};

pub mod ops;
pub mod storage;

pub use storage::ParameterBuffer;

/// Scalar type used for all activations, weights and gradients.
pub type TensorData = f64;

/// Owned 3D tensor laid out as `(depth, height, width)`.
pub type Cube = Array3<TensorData>;

#[derive(thiserror::Error, Debug)]
pub enum TensorError {
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    #[error("Invalid padding: derived total padding {total} along {axis} is negative")]
    InvalidPadding { axis: &'static str, total: i64 },
    #[error("Pooling backward called without a pending forward pass")]
    EmptyPoolingStack,
    #[error("Kernel extent {extent} exceeds input extent {input} along {axis}")]
    DimensionOverflow {
        axis: &'static str,
        extent: usize,
        input: usize,
    },
    #[error("Batch size {got} differs from the batch size {expected} of the preceding forward pass")]
    BatchSizeMismatch { expected: usize, got: usize },
    #[error("{0} called before any forward pass")]
    MissingForwardPass(&'static str),
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("ndarray error: {0}")]
    NdarrayError(#[from] ndarray::ShapeError),
}

/// Reinterprets a flat buffer as a `(slices, rows, cols)` cube without copying.
pub fn cube_view(
    data: &[TensorData],
    slices: usize,
    rows: usize,
    cols: usize,
) -> Result<ArrayView3<'_, TensorData>, TensorError> {
    check_len(data.len(), slices, rows, cols)?;
    Ok(ArrayView3::from_shape((slices, rows, cols), data)?)
}

/// Mutable counterpart of [`cube_view`].
pub fn cube_view_mut(
    data: &mut [TensorData],
    slices: usize,
    rows: usize,
    cols: usize,
) -> Result<ArrayViewMut3<'_, TensorData>, TensorError> {
    check_len(data.len(), slices, rows, cols)?;
    Ok(ArrayViewMut3::from_shape((slices, rows, cols), data)?)
}

fn check_len(len: usize, slices: usize, rows: usize, cols: usize) -> Result<(), TensorError> {
    if len != slices * rows * cols {
        return Err(TensorError::ShapeMismatch {
            expected: vec![slices, rows, cols],
            got: vec![len],
        });
    }
    Ok(())
}

/// Borrows the backing slice of a standard-layout array.
pub fn contiguous<S, D>(array: &ArrayBase<S, D>) -> Result<&[TensorData], TensorError>
where
    S: Data<Elem = TensorData>,
    D: Dimension,
{
    array
        .as_slice()
        .ok_or_else(|| ShapeError::from_kind(ErrorKind::IncompatibleLayout).into())
}

/// Validates that a batched flat tensor has `features` columns and returns its batch size.
pub fn batch_of(input: &ArrayView2<'_, TensorData>, features: usize) -> Result<usize, TensorError> {
    let (batch, cols) = input.dim();
    if cols != features || batch == 0 {
        return Err(TensorError::ShapeMismatch {
            expected: vec![batch.max(1), features],
            got: vec![batch, cols],
        });
    }
    Ok(batch)
}

/// Flattens an owned cube of `batch * channels` slices back into `(batch, features)`.
pub fn flatten_batch(cube: Cube, batch: usize) -> Result<ndarray::Array2<TensorData>, TensorError> {
    let features = if batch == 0 { 0 } else { cube.len() / batch };
    let cube = if cube.is_standard_layout() {
        cube
    } else {
        cube.as_standard_layout().into_owned()
    };
    Ok(cube.into_shape((batch, features))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr2, Array2};

    #[test]
    fn cube_view_packs_channels_within_each_sample() {
        // 2 samples, 2 channels, 1x2 maps.
        let flat = arr2(&[[1.0, 2.0, 3.0, 4.0], [5.0, 6.0, 7.0, 8.0]]);
        let data = flat.as_slice().unwrap();
        let cube = cube_view(data, 4, 1, 2).unwrap();
        // slice = channel + batch * channels
        assert_eq!(cube[[1, 0, 0]], 3.0);
        assert_eq!(cube[[2, 0, 1]], 6.0);
        assert_eq!(cube[[3, 0, 1]], 8.0);
    }

    #[test]
    fn cube_view_rejects_wrong_length() {
        let data = [0.0; 7];
        let err = cube_view(&data, 2, 2, 2).unwrap_err();
        assert!(matches!(err, TensorError::ShapeMismatch { .. }));
    }

    #[test]
    fn batch_of_checks_feature_count() {
        let input = Array2::<TensorData>::zeros((3, 8));
        assert_eq!(batch_of(&input.view(), 8).unwrap(), 3);
        assert!(batch_of(&input.view(), 9).is_err());
    }

    #[test]
    fn flatten_batch_keeps_sample_rows() {
        let cube = Cube::from_shape_fn((4, 1, 2), |(s, _, c)| (s * 2 + c) as TensorData);
        let flat = flatten_batch(cube, 2).unwrap();
        assert_eq!(flat.dim(), (2, 4));
        assert_eq!(flat[[1, 0]], 4.0);
    }
}
