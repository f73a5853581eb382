//! # Neural Network Functional Interface (`nn::functional`)
//!
//! Stateless direct 2D convolution kernels. Filters are applied as a dot
//! product against each window (cross-correlation); callers that need a true
//! convolution rotate the filter first.
//!
//! Strides and dilations are `(x, y)` pairs: `x` steps along the width
//! (columns), `y` along the height (rows).

use ndarray::{Array2, ArrayView2, ArrayView3, ArrayViewMut2, Axis, Zip};

use crate::tensor::{Cube, TensorData, TensorError};
use crate::utils::parallel::{should_parallelize, try_for_each_slice};

/// Border handling of a 2D convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BorderMode {
    /// Only positions where the filter fully overlaps the input.
    Valid,
    /// Every partial overlap, as if the input were zero-padded by the filter extent.
    Full,
}

/// Number of valid-mode filter positions along one axis.
///
/// `⌊(input - (filter - 1) * dilation - 1) / stride⌋ + 1`
pub fn conv_output_size(
    input: usize,
    filter: usize,
    stride: usize,
    dilation: usize,
    axis: &'static str,
) -> Result<usize, TensorError> {
    if stride == 0 || dilation == 0 || filter == 0 {
        return Err(TensorError::InvalidConfiguration(format!(
            "{} stride, dilation and filter size must be positive (got {}, {}, {})",
            axis, stride, dilation, filter
        )));
    }
    let extent = (filter - 1) * dilation + 1;
    if extent > input {
        return Err(TensorError::DimensionOverflow {
            axis,
            extent,
            input,
        });
    }
    Ok((input - extent) / stride + 1)
}

/// Full-mode output extent along one axis: `(input - 1) * stride + (filter - 1) * dilation + 1`.
pub fn full_output_size(input: usize, filter: usize, stride: usize, dilation: usize) -> usize {
    if input == 0 || filter == 0 {
        return 0;
    }
    (input - 1) * stride + (filter - 1) * dilation + 1
}

/// Output shape `(rows, cols)` of a 2D convolution.
pub fn conv2d_output_shape(
    input: (usize, usize),
    filter: (usize, usize),
    stride: (usize, usize),
    dilation: (usize, usize),
    mode: BorderMode,
) -> Result<(usize, usize), TensorError> {
    if stride.0 == 0 || stride.1 == 0 || dilation.0 == 0 || dilation.1 == 0 {
        return Err(TensorError::InvalidConfiguration(format!(
            "stride {:?} and dilation {:?} must be positive",
            stride, dilation
        )));
    }
    match mode {
        BorderMode::Valid => Ok((
            conv_output_size(input.0, filter.0, stride.1, dilation.1, "height")?,
            conv_output_size(input.1, filter.1, stride.0, dilation.0, "width")?,
        )),
        BorderMode::Full => Ok((
            full_output_size(input.0, filter.0, stride.1, dilation.1),
            full_output_size(input.1, filter.1, stride.0, dilation.0),
        )),
    }
}

/// Convolves `input` with `filter` into a freshly allocated matrix.
pub fn conv2d(
    input: ArrayView2<'_, TensorData>,
    filter: ArrayView2<'_, TensorData>,
    stride: (usize, usize),
    dilation: (usize, usize),
    mode: BorderMode,
) -> Result<Array2<TensorData>, TensorError> {
    let shape = conv2d_output_shape(input.dim(), filter.dim(), stride, dilation, mode)?;
    let mut output = Array2::zeros(shape);
    conv2d_into(input, filter, stride, dilation, mode, output.view_mut(), true)?;
    Ok(output)
}

/// Convolves `input` with `filter` into a caller-provided `output`.
///
/// With `accumulate` the result is added to what `output` already holds,
/// otherwise `output` is overwritten. `output` must already have the shape
/// given by [`conv2d_output_shape`].
pub fn conv2d_into(
    input: ArrayView2<'_, TensorData>,
    filter: ArrayView2<'_, TensorData>,
    stride: (usize, usize),
    dilation: (usize, usize),
    mode: BorderMode,
    mut output: ArrayViewMut2<'_, TensorData>,
    accumulate: bool,
) -> Result<(), TensorError> {
    let shape = conv2d_output_shape(input.dim(), filter.dim(), stride, dilation, mode)?;
    if output.dim() != shape {
        return Err(TensorError::ShapeMismatch {
            expected: vec![shape.0, shape.1],
            got: output.shape().to_vec(),
        });
    }
    if !accumulate {
        output.fill(0.0);
    }
    if output.is_empty() {
        return Ok(());
    }
    match mode {
        BorderMode::Valid => valid_into(input, filter, stride, dilation, output),
        BorderMode::Full => {
            let padded = full_padded_input(input, filter.dim(), stride, dilation);
            valid_into(padded.view(), filter, (1, 1), dilation, output);
        }
    }
    Ok(())
}

/// Places the input samples `stride` apart inside a border of
/// `(filter - 1) * dilation` zeros per side.
fn full_padded_input(
    input: ArrayView2<'_, TensorData>,
    filter: (usize, usize),
    stride: (usize, usize),
    dilation: (usize, usize),
) -> Array2<TensorData> {
    let (rows, cols) = input.dim();
    let border = ((filter.0 - 1) * dilation.1, (filter.1 - 1) * dilation.0);
    let padded_rows = (rows - 1) * stride.1 + 1 + 2 * border.0;
    let padded_cols = (cols - 1) * stride.0 + 1 + 2 * border.1;
    let mut padded = Array2::zeros((padded_rows, padded_cols));
    for ((r, c), &value) in input.indexed_iter() {
        padded[[border.0 + r * stride.1, border.1 + c * stride.0]] = value;
    }
    padded
}

fn valid_into(
    input: ArrayView2<'_, TensorData>,
    filter: ArrayView2<'_, TensorData>,
    stride: (usize, usize),
    dilation: (usize, usize),
    output: ArrayViewMut2<'_, TensorData>,
) {
    let (filter_rows, filter_cols) = filter.dim();
    let work = output.len() * filter.len();
    let cell = |(row, col): (usize, usize), out: &mut TensorData| {
        let mut acc = 0.0;
        for fr in 0..filter_rows {
            let in_row = row * stride.1 + fr * dilation.1;
            for fc in 0..filter_cols {
                acc += filter[[fr, fc]] * input[[in_row, col * stride.0 + fc * dilation.0]];
            }
        }
        *out += acc;
    };
    if should_parallelize(work) {
        Zip::indexed(output).par_for_each(cell);
    } else {
        Zip::indexed(output).for_each(cell);
    }
}

/// Convolves every input slice with the filter slice of the same index.
pub fn conv2d_cube_cube(
    input: ArrayView3<'_, TensorData>,
    filter: ArrayView3<'_, TensorData>,
    stride: (usize, usize),
    dilation: (usize, usize),
    mode: BorderMode,
) -> Result<Cube, TensorError> {
    if input.len_of(Axis(0)) != filter.len_of(Axis(0)) {
        return Err(TensorError::ShapeMismatch {
            expected: vec![input.len_of(Axis(0))],
            got: vec![filter.len_of(Axis(0))],
        });
    }
    let (slices, in_rows, in_cols) = input.dim();
    let (_, f_rows, f_cols) = filter.dim();
    let shape = conv2d_output_shape((in_rows, in_cols), (f_rows, f_cols), stride, dilation, mode)?;
    let mut output = Cube::zeros((slices, shape.0, shape.1));
    let work = shape.0 * shape.1 * f_rows * f_cols;
    try_for_each_slice(output.view_mut(), work, |index, slice| {
        conv2d_into(
            input.index_axis(Axis(0), index),
            filter.index_axis(Axis(0), index),
            stride,
            dilation,
            mode,
            slice,
            true,
        )
    })?;
    Ok(output)
}

/// Convolves one input matrix with every filter slice; the output has one slice per filter.
pub fn conv2d_matrix_cube(
    input: ArrayView2<'_, TensorData>,
    filter: ArrayView3<'_, TensorData>,
    stride: (usize, usize),
    dilation: (usize, usize),
    mode: BorderMode,
) -> Result<Cube, TensorError> {
    let (slices, f_rows, f_cols) = filter.dim();
    let shape = conv2d_output_shape(input.dim(), (f_rows, f_cols), stride, dilation, mode)?;
    let mut output = Cube::zeros((slices, shape.0, shape.1));
    let work = shape.0 * shape.1 * f_rows * f_cols;
    try_for_each_slice(output.view_mut(), work, |index, slice| {
        conv2d_into(
            input,
            filter.index_axis(Axis(0), index),
            stride,
            dilation,
            mode,
            slice,
            true,
        )
    })?;
    Ok(output)
}

/// Convolves every input slice with one filter matrix.
pub fn conv2d_cube_matrix(
    input: ArrayView3<'_, TensorData>,
    filter: ArrayView2<'_, TensorData>,
    stride: (usize, usize),
    dilation: (usize, usize),
    mode: BorderMode,
) -> Result<Cube, TensorError> {
    let (slices, in_rows, in_cols) = input.dim();
    let shape = conv2d_output_shape((in_rows, in_cols), filter.dim(), stride, dilation, mode)?;
    let mut output = Cube::zeros((slices, shape.0, shape.1));
    let work = shape.0 * shape.1 * filter.len();
    try_for_each_slice(output.view_mut(), work, |index, slice| {
        conv2d_into(
            input.index_axis(Axis(0), index),
            filter,
            stride,
            dilation,
            mode,
            slice,
            true,
        )
    })?;
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr2, Array3};

    fn reference_valid(input: &Array2<TensorData>, filter: &Array2<TensorData>) -> Array2<TensorData> {
        let (ir, ic) = input.dim();
        let (fr, fc) = filter.dim();
        let mut out = Array2::zeros((ir - fr + 1, ic - fc + 1));
        for i in 0..ir - fr + 1 {
            for j in 0..ic - fc + 1 {
                let mut acc = 0.0;
                for a in 0..fr {
                    for b in 0..fc {
                        acc += input[[i + a, j + b]] * filter[[a, b]];
                    }
                }
                out[[i, j]] = acc;
            }
        }
        out
    }

    #[test]
    fn valid_ones_filter_sums_windows() {
        let input = Array2::from_shape_fn((4, 4), |(i, j)| (i * 4 + j) as TensorData);
        let filter = Array2::ones((3, 3));
        let output = conv2d(input.view(), filter.view(), (1, 1), (1, 1), BorderMode::Valid).unwrap();
        assert_eq!(output, arr2(&[[45.0, 54.0], [81.0, 90.0]]));
    }

    #[test]
    fn valid_matches_sliding_window_reference() {
        let input = Array2::from_shape_fn((7, 5), |(i, j)| ((i * 31 + j * 17) % 11) as TensorData - 5.0);
        let filter = arr2(&[[1.0, -2.0], [0.5, 3.0], [-1.0, 0.25]]);
        let output = conv2d(input.view(), filter.view(), (1, 1), (1, 1), BorderMode::Valid).unwrap();
        assert_eq!(output, reference_valid(&input, &filter));
    }

    #[test]
    fn valid_with_stride_and_dilation() {
        let input = Array2::from_shape_fn((5, 7), |(i, j)| (i * 7 + j) as TensorData);
        let filter = arr2(&[[1.0, 1.0]]);
        // width: (7 - 2 - 1) / 2 + 1 = 3, height: (5 - 0 - 1) / 3 + 1 = 2
        let output = conv2d(input.view(), filter.view(), (2, 3), (2, 1), BorderMode::Valid).unwrap();
        assert_eq!(output.dim(), (2, 3));
        assert_eq!(output[[0, 0]], input[[0, 0]] + input[[0, 2]]);
        assert_eq!(output[[1, 2]], input[[3, 4]] + input[[3, 6]]);
    }

    #[test]
    fn accumulate_adds_into_existing_output() {
        let input = Array2::ones((3, 3));
        let filter = Array2::ones((2, 2));
        let mut output = Array2::from_elem((2, 2), 1.0);
        conv2d_into(input.view(), filter.view(), (1, 1), (1, 1), BorderMode::Valid, output.view_mut(), true).unwrap();
        assert_eq!(output, Array2::from_elem((2, 2), 5.0));
        conv2d_into(input.view(), filter.view(), (1, 1), (1, 1), BorderMode::Valid, output.view_mut(), false).unwrap();
        assert_eq!(output, Array2::from_elem((2, 2), 4.0));
    }

    #[test]
    fn full_mode_grows_by_filter_minus_one() {
        let input = Array2::from_shape_fn((1, 5), |(_, j)| j as TensorData + 1.0);
        let filter = arr2(&[[1.0, 10.0, 100.0]]);
        let output = conv2d(input.view(), filter.view(), (1, 1), (1, 1), BorderMode::Full).unwrap();
        assert_eq!(output.dim(), (1, 7));
        // the leading cell only overlaps the last filter tap
        assert_eq!(output[[0, 0]], 100.0);
        assert_eq!(output[[0, 6]], 5.0);
    }

    #[test]
    fn full_mode_with_stride_spreads_samples() {
        let input = arr2(&[[1.0, 2.0]]);
        let filter = arr2(&[[1.0, 1.0]]);
        let output = conv2d(input.view(), filter.view(), (2, 1), (1, 1), BorderMode::Full).unwrap();
        // samples at positions 1 and 3 of [0, 1, 0, 2, 0]
        assert_eq!(output, arr2(&[[1.0, 1.0, 2.0, 2.0]]));
    }

    #[test]
    fn full_mode_with_dilation_widens_the_border() {
        let input = arr2(&[[1.0, 2.0, 3.0]]);
        let filter = arr2(&[[1.0, 10.0]]);
        let output = conv2d(input.view(), filter.view(), (1, 1), (2, 1), BorderMode::Full).unwrap();
        // padded row [0, 0, 1, 2, 3, 0, 0], taps two cells apart
        assert_eq!(output, arr2(&[[10.0, 20.0, 31.0, 2.0, 3.0]]));
    }

    #[test]
    fn oversized_filter_overflows() {
        let input = Array2::<TensorData>::zeros((2, 2));
        let filter = Array2::<TensorData>::zeros((3, 1));
        let err = conv2d(input.view(), filter.view(), (1, 1), (1, 1), BorderMode::Valid).unwrap_err();
        assert!(matches!(err, TensorError::DimensionOverflow { axis: "height", .. }));
    }

    #[test]
    fn zero_stride_is_rejected() {
        let input = Array2::<TensorData>::zeros((2, 2));
        let err = conv2d(input.view(), input.view(), (0, 1), (1, 1), BorderMode::Valid).unwrap_err();
        assert!(matches!(err, TensorError::InvalidConfiguration(_)));
    }

    #[test]
    fn wrong_output_shape_is_rejected() {
        let input = Array2::<TensorData>::zeros((4, 4));
        let filter = Array2::<TensorData>::zeros((2, 2));
        let mut output = Array2::<TensorData>::zeros((2, 2));
        let err = conv2d_into(input.view(), filter.view(), (1, 1), (1, 1), BorderMode::Valid, output.view_mut(), false)
            .unwrap_err();
        assert!(matches!(err, TensorError::ShapeMismatch { .. }));
    }

    #[test]
    fn cube_overloads_follow_the_3d_operand() {
        let input = Array3::from_shape_fn((3, 4, 4), |(s, i, j)| (s + i * j) as TensorData);
        let filters = Array3::from_shape_fn((3, 2, 2), |(s, _, _)| s as TensorData);

        let pairwise = conv2d_cube_cube(input.view(), filters.view(), (1, 1), (1, 1), BorderMode::Valid).unwrap();
        assert_eq!(pairwise.dim(), (3, 3, 3));
        let expected = conv2d(input.index_axis(Axis(0), 2), filters.index_axis(Axis(0), 2), (1, 1), (1, 1), BorderMode::Valid).unwrap();
        assert_eq!(pairwise.index_axis(Axis(0), 2), expected);

        let broadcast_input = conv2d_matrix_cube(input.index_axis(Axis(0), 0), filters.view(), (1, 1), (1, 1), BorderMode::Full).unwrap();
        assert_eq!(broadcast_input.dim(), (3, 5, 5));

        let broadcast_filter = conv2d_cube_matrix(input.view(), filters.index_axis(Axis(0), 1), (2, 2), (1, 1), BorderMode::Valid).unwrap();
        assert_eq!(broadcast_filter.dim(), (3, 2, 2));
    }

    #[test]
    fn cube_cube_requires_equal_depth() {
        let input = Array3::<TensorData>::zeros((2, 3, 3));
        let filters = Array3::<TensorData>::zeros((3, 2, 2));
        assert!(conv2d_cube_cube(input.view(), filters.view(), (1, 1), (1, 1), BorderMode::Valid).is_err());
    }
}
