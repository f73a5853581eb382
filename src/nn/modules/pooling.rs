//! # Max Pooling Layer Module
//!
//! Windowed max reduction over every `(height, width)` slice. In training mode
//! the arg-max of each window is recorded so `backward` can route the gradient
//! to the single input cell that produced each output.

use ndarray::{s, Array2, Array3, ArrayView2, ArrayViewMut2, Axis};
use rayon::prelude::*;

use crate::nn::Module;
use crate::tensor::{batch_of, contiguous, cube_view, flatten_batch, Cube, TensorData, TensorError};
use crate::utils::parallel::{should_parallelize, try_for_each_slice};
use crate::utils::serialization::MaxPoolingState;

/// Arg-max record of one training-mode forward pass.
///
/// Returned by [`MaxPool2d::pool`] and consumed by [`MaxPool2d::unpool`];
/// it cannot be cloned, so every forward pass is paired with at most one
/// backward pass.
#[derive(Debug)]
pub struct PoolingIndices {
    // Flat (row-major) index of each window maximum within its input slice.
    indices: Array3<usize>,
    input_height: usize,
    input_width: usize,
    batch_size: usize,
}

impl PoolingIndices {
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// `(slices, output_height, output_width)`
    pub fn output_dim(&self) -> (usize, usize, usize) {
        self.indices.dim()
    }

    /// `(slices, input_height, input_width)`
    pub fn input_dim(&self) -> (usize, usize, usize) {
        (self.indices.len_of(Axis(0)), self.input_height, self.input_width)
    }
}

/// Applies 2D max pooling over a batch of multi-channel feature maps.
#[derive(Debug)]
pub struct MaxPool2d {
    kernel_width: usize,
    kernel_height: usize,
    stride_width: usize,
    stride_height: usize,
    floor: bool,
    deterministic: bool,
    in_channels: usize,
    batch_size: usize,
    input_width: usize,
    input_height: usize,
    output_width: usize,
    output_height: usize,
    index_stack: Vec<PoolingIndices>,
}

impl MaxPool2d {
    /// Creates a new max-pooling module.
    ///
    /// # Arguments
    /// * `kernel_size`, `stride`: `(width, height)` pairs.
    /// * `floor`: round the output size down (`true`) or up (`false`).
    pub fn new(kernel_size: (usize, usize), stride: (usize, usize), floor: bool) -> Result<Self, TensorError> {
        if kernel_size.0 == 0 || kernel_size.1 == 0 || stride.0 == 0 || stride.1 == 0 {
            return Err(TensorError::InvalidConfiguration(format!(
                "pooling kernel {:?} and stride {:?} must be positive",
                kernel_size, stride
            )));
        }
        Ok(MaxPool2d {
            kernel_width: kernel_size.0,
            kernel_height: kernel_size.1,
            stride_width: stride.0,
            stride_height: stride.1,
            floor,
            deterministic: false,
            in_channels: 0,
            batch_size: 0,
            input_width: 0,
            input_height: 0,
            output_width: 0,
            output_height: 0,
            index_stack: Vec::new(),
        })
    }

    /// Sets the spatial `(width, height)` of incoming feature maps.
    pub fn with_input_size(mut self, width: usize, height: usize) -> Self {
        self.set_input_size(width, height);
        self
    }

    pub fn set_input_size(&mut self, width: usize, height: usize) {
        self.input_width = width;
        self.input_height = height;
    }

    pub fn kernel_width(&self) -> usize {
        self.kernel_width
    }

    pub fn kernel_height(&self) -> usize {
        self.kernel_height
    }

    pub fn stride_width(&self) -> usize {
        self.stride_width
    }

    pub fn stride_height(&self) -> usize {
        self.stride_height
    }

    pub fn floor(&self) -> bool {
        self.floor
    }

    pub fn deterministic(&self) -> bool {
        self.deterministic
    }

    pub fn set_deterministic(&mut self, deterministic: bool) {
        self.deterministic = deterministic;
    }

    /// Channels per sample seen by the last forward pass.
    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn input_width(&self) -> usize {
        self.input_width
    }

    pub fn input_height(&self) -> usize {
        self.input_height
    }

    pub fn output_width(&self) -> usize {
        self.output_width
    }

    pub fn output_height(&self) -> usize {
        self.output_height
    }

    /// Number of forward passes still waiting for their backward pass.
    pub fn pending_backward(&self) -> usize {
        self.index_stack.len()
    }

    pub fn state(&self) -> MaxPoolingState {
        MaxPoolingState {
            kernel_width: self.kernel_width,
            kernel_height: self.kernel_height,
            stride_width: self.stride_width,
            stride_height: self.stride_height,
            batch_size: self.batch_size,
            floor: self.floor,
            input_width: self.input_width,
            input_height: self.input_height,
            output_width: self.output_width,
            output_height: self.output_height,
        }
    }

    pub fn from_state(state: MaxPoolingState) -> Result<Self, TensorError> {
        let mut layer = MaxPool2d::new(
            (state.kernel_width, state.kernel_height),
            (state.stride_width, state.stride_height),
            state.floor,
        )?;
        layer.batch_size = state.batch_size;
        layer.input_width = state.input_width;
        layer.input_height = state.input_height;
        layer.output_width = state.output_width;
        layer.output_height = state.output_height;
        Ok(layer)
    }

    /// `(width, height)` of the pooled output for the configured input size.
    pub fn output_size(&self) -> Result<(usize, usize), TensorError> {
        Ok((
            pooled_size(self.input_width, self.kernel_width, self.stride_width, self.floor, "width")?,
            pooled_size(self.input_height, self.kernel_height, self.stride_height, self.floor, "height")?,
        ))
    }

    /// Pools a batch and returns the arg-max record needed by [`MaxPool2d::unpool`].
    pub fn pool(
        &mut self,
        input: ArrayView2<'_, TensorData>,
        output: &mut Array2<TensorData>,
    ) -> Result<PoolingIndices, TensorError> {
        self.pool_batch(input, output, true)?
            .ok_or_else(|| TensorError::InvalidConfiguration("pooling produced no indices".to_string()))
    }

    /// Scatters `output_gradient` back through the maxima recorded in `indices`.
    pub fn unpool(
        &self,
        indices: PoolingIndices,
        output_gradient: ArrayView2<'_, TensorData>,
        input_gradient: &mut Array2<TensorData>,
    ) -> Result<(), TensorError> {
        check_output_gradient(&indices, &output_gradient)?;
        let (slices, output_height, output_width) = indices.output_dim();
        let batch = indices.batch_size;
        let output_gradient = output_gradient.as_standard_layout();
        let errors = cube_view(contiguous(&output_gradient)?, slices, output_height, output_width)?;

        let mut gradient = Cube::zeros(indices.input_dim());
        try_for_each_slice(gradient.view_mut(), output_height * output_width, |index, mut slice| {
            let recorded = indices.indices.index_axis(Axis(0), index);
            let error = errors.index_axis(Axis(0), index);
            let flat = slice
                .as_slice_mut()
                .ok_or_else(|| TensorError::InvalidConfiguration("gradient slice is not contiguous".to_string()))?;
            for (&target, &value) in recorded.iter().zip(error.iter()) {
                flat[target] += value;
            }
            Ok(())
        })?;

        *input_gradient = flatten_batch(gradient, batch)?;
        Ok(())
    }

    fn pool_batch(
        &mut self,
        input: ArrayView2<'_, TensorData>,
        output: &mut Array2<TensorData>,
        record: bool,
    ) -> Result<Option<PoolingIndices>, TensorError> {
        let plane = self.input_width * self.input_height;
        let (batch, features) = input.dim();
        if plane == 0 || batch == 0 || features == 0 || features % plane != 0 {
            return Err(TensorError::ShapeMismatch {
                expected: vec![batch, self.input_height, self.input_width],
                got: vec![batch, features],
            });
        }
        let in_channels = features / plane;
        let (output_width, output_height) = self.output_size()?;
        let slices = in_channels * batch;

        let input = input.as_standard_layout();
        let input = cube_view(contiguous(&input)?, slices, self.input_height, self.input_width)?;
        let mut pooled = Cube::zeros((slices, output_height, output_width));
        let window = (self.kernel_height, self.kernel_width);
        let stride = (self.stride_height, self.stride_width);
        let work = output_height * output_width * self.kernel_height * self.kernel_width;

        let indices = if record {
            let mut indices = Array3::<usize>::zeros((slices, output_height, output_width));
            if should_parallelize(work * slices) {
                pooled
                    .axis_iter_mut(Axis(0))
                    .into_par_iter()
                    .zip(indices.axis_iter_mut(Axis(0)).into_par_iter())
                    .zip(input.axis_iter(Axis(0)).into_par_iter())
                    .for_each(|((out, idx), inp)| pool_slice(inp, out, Some(idx), window, stride));
            } else {
                pooled
                    .axis_iter_mut(Axis(0))
                    .zip(indices.axis_iter_mut(Axis(0)))
                    .zip(input.axis_iter(Axis(0)))
                    .for_each(|((out, idx), inp)| pool_slice(inp, out, Some(idx), window, stride));
            }
            Some(PoolingIndices {
                indices,
                input_height: self.input_height,
                input_width: self.input_width,
                batch_size: batch,
            })
        } else {
            try_for_each_slice(pooled.view_mut(), work, |index, out| {
                pool_slice(input.index_axis(Axis(0), index), out, None, window, stride);
                Ok(())
            })?;
            None
        };

        *output = flatten_batch(pooled, batch)?;
        self.in_channels = in_channels;
        self.batch_size = batch;
        self.output_width = output_width;
        self.output_height = output_height;
        Ok(indices)
    }
}

impl Module for MaxPool2d {
    fn forward(
        &mut self,
        input: ArrayView2<'_, TensorData>,
        output: &mut Array2<TensorData>,
    ) -> Result<(), TensorError> {
        let record = !self.deterministic;
        if let Some(indices) = self.pool_batch(input, output, record)? {
            self.index_stack.push(indices);
        }
        Ok(())
    }

    /// Routes the gradient through the most recent pending forward pass.
    fn backward(
        &mut self,
        _input: ArrayView2<'_, TensorData>,
        output_gradient: ArrayView2<'_, TensorData>,
        input_gradient: &mut Array2<TensorData>,
    ) -> Result<(), TensorError> {
        let pending = self.index_stack.last().ok_or_else(|| {
            log::warn!("MaxPool2d backward without a pending forward pass");
            TensorError::EmptyPoolingStack
        })?;
        // A rejected gradient leaves the pending pass on the stack.
        check_output_gradient(pending, &output_gradient)?;
        let indices = self.index_stack.pop().ok_or(TensorError::EmptyPoolingStack)?;
        self.unpool(indices, output_gradient, input_gradient)
    }

    fn train(&mut self) {
        self.deterministic = false;
    }

    fn eval(&mut self) {
        self.deterministic = true;
    }
}

/// Checks that an output gradient matches the pass recorded in `indices`.
fn check_output_gradient(
    indices: &PoolingIndices,
    output_gradient: &ArrayView2<'_, TensorData>,
) -> Result<(), TensorError> {
    let (slices, output_height, output_width) = indices.output_dim();
    let batch = indices.batch_size;
    let features = slices / batch * output_height * output_width;
    let got = batch_of(output_gradient, features)?;
    if got != batch {
        return Err(TensorError::BatchSizeMismatch { expected: batch, got });
    }
    Ok(())
}

/// `floor` or `ceil` of `(input - kernel) / stride + 1`, dropping a final
/// ceil-mode window that would start outside the input.
fn pooled_size(
    input: usize,
    kernel: usize,
    stride: usize,
    floor: bool,
    axis: &'static str,
) -> Result<usize, TensorError> {
    let span = (input as f64 - kernel as f64) / stride as f64 + 1.0;
    let size = if floor { span.floor() } else { span.ceil() };
    if size < 1.0 {
        return Err(TensorError::DimensionOverflow {
            axis,
            extent: kernel,
            input,
        });
    }
    let mut size = size as usize;
    if (size - 1) * stride >= input {
        size -= 1;
    }
    Ok(size)
}

/// Max over each window of `input`, clamped to the input extent.
///
/// Windows are scanned row-major and ties keep the first maximum.
fn pool_slice(
    input: ArrayView2<'_, TensorData>,
    mut output: ArrayViewMut2<'_, TensorData>,
    mut indices: Option<ArrayViewMut2<'_, usize>>,
    window: (usize, usize),
    stride: (usize, usize),
) {
    let (rows, cols) = input.dim();
    for ((out_row, out_col), value) in output.indexed_iter_mut() {
        let row_start = out_row * stride.0;
        let col_start = out_col * stride.1;
        let row_end = (row_start + window.0).min(rows);
        let col_end = (col_start + window.1).min(cols);
        let region = input.slice(s![row_start..row_end, col_start..col_end]);
        let mut cells = region
            .indexed_iter()
            .map(|((r, c), &v)| ((row_start + r) * cols + col_start + c, v));
        // Seeded from the first cell so a NaN there propagates.
        let (mut best_index, mut best) =
            cells.next().unwrap_or((row_start * cols + col_start, TensorData::NEG_INFINITY));
        for (offset, candidate) in cells {
            if candidate > best {
                best = candidate;
                best_index = offset;
            }
        }
        *value = best;
        if let Some(indices) = indices.as_mut() {
            indices[[out_row, out_col]] = best_index;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    fn layer(kernel: usize, stride: usize, floor: bool, size: (usize, usize)) -> MaxPool2d {
        MaxPool2d::new((kernel, kernel), (stride, stride), floor)
            .unwrap()
            .with_input_size(size.0, size.1)
    }

    #[test]
    fn pools_two_by_two_windows() {
        let mut pool = layer(2, 2, true, (4, 4));
        let input = Array2::from_shape_fn((1, 16), |(_, j)| j as TensorData);
        let mut output = Array2::zeros((0, 0));
        pool.forward(input.view(), &mut output).unwrap();
        assert_eq!(output, arr2(&[[5.0, 7.0, 13.0, 15.0]]));
        assert_eq!(pool.pending_backward(), 1);
    }

    #[test]
    fn backward_routes_gradient_to_unique_maximum() {
        let mut pool = layer(2, 2, true, (2, 2));
        let input = arr2(&[[0.5, -1.0, 3.0, 2.0]]);
        let mut output = Array2::zeros((0, 0));
        pool.forward(input.view(), &mut output).unwrap();
        let mut grad = Array2::zeros((0, 0));
        pool.backward(input.view(), arr2(&[[1.5]]).view(), &mut grad).unwrap();
        assert_eq!(grad, arr2(&[[0.0, 0.0, 1.5, 0.0]]));
    }

    #[test]
    fn ties_keep_first_occurrence() {
        let mut pool = layer(2, 2, true, (2, 2));
        let input = arr2(&[[1.0, 4.0, 4.0, 4.0]]);
        let mut output = Array2::zeros((0, 0));
        let indices = pool.pool(input.view(), &mut output).unwrap();
        let mut grad = Array2::zeros((0, 0));
        pool.unpool(indices, arr2(&[[1.0]]).view(), &mut grad).unwrap();
        assert_eq!(grad, arr2(&[[0.0, 1.0, 0.0, 0.0]]));
    }

    #[test]
    fn second_backward_fails_with_empty_stack() {
        let mut pool = layer(2, 2, true, (2, 2));
        let input = arr2(&[[1.0, 2.0, 3.0, 4.0]]);
        let mut output = Array2::zeros((0, 0));
        pool.forward(input.view(), &mut output).unwrap();
        let mut grad = Array2::zeros((0, 0));
        pool.backward(input.view(), output.view(), &mut grad).unwrap();
        let err = pool.backward(input.view(), output.view(), &mut grad).unwrap_err();
        assert!(matches!(err, TensorError::EmptyPoolingStack));
    }

    #[test]
    fn ceil_mode_ignores_cells_outside_the_input() {
        // 3x3 input, 2x2 kernel, stride 2: ceil gives 2x2 windows, the last ones clamped.
        let mut pool = layer(2, 2, false, (3, 3));
        let input = Array2::from_shape_fn((1, 9), |(_, j)| -(j as TensorData) - 1.0);
        let mut output = Array2::zeros((0, 0));
        pool.forward(input.view(), &mut output).unwrap();
        assert_eq!((pool.output_width(), pool.output_height()), (2, 2));
        // negative values: a zero fill outside the input would win the max
        assert_eq!(output, arr2(&[[-1.0, -3.0, -7.0, -9.0]]));
        let mut floor_pool = layer(2, 2, true, (3, 3));
        floor_pool.forward(input.view(), &mut output).unwrap();
        assert_eq!(output.dim(), (1, 1));
    }

    #[test]
    fn deterministic_mode_skips_the_stack() {
        let mut pool = layer(2, 1, true, (3, 3));
        pool.eval();
        let input = Array2::ones((2, 18));
        let mut output = Array2::zeros((0, 0));
        pool.forward(input.view(), &mut output).unwrap();
        assert_eq!(output.dim(), (2, 8));
        assert_eq!(pool.in_channels(), 2);
        assert_eq!(pool.pending_backward(), 0);
        let mut grad = Array2::zeros((0, 0));
        assert!(pool.backward(input.view(), output.view(), &mut grad).is_err());
    }

    #[test]
    fn overlapping_windows_accumulate_gradient() {
        let mut pool = MaxPool2d::new((2, 1), (1, 1), true).unwrap().with_input_size(3, 1);
        let input = arr2(&[[0.0, 5.0, 1.0]]);
        let mut output = Array2::zeros((0, 0));
        pool.forward(input.view(), &mut output).unwrap();
        assert_eq!(output, arr2(&[[5.0, 5.0]]));
        let mut grad = Array2::zeros((0, 0));
        pool.backward(input.view(), arr2(&[[1.0, 2.0]]).view(), &mut grad).unwrap();
        assert_eq!(grad, arr2(&[[0.0, 3.0, 0.0]]));
    }

    #[test]
    fn rejected_gradient_keeps_the_pending_pass() {
        let mut pool = layer(2, 2, true, (4, 4));
        let input = Array2::from_shape_fn((1, 16), |(_, j)| j as TensorData);
        let mut output = Array2::zeros((0, 0));
        pool.forward(input.view(), &mut output).unwrap();
        let mut grad = Array2::zeros((0, 0));
        let err = pool.backward(input.view(), Array2::ones((1, 3)).view(), &mut grad).unwrap_err();
        assert!(matches!(err, TensorError::ShapeMismatch { .. }));
        let err = pool.backward(input.view(), Array2::ones((2, 4)).view(), &mut grad).unwrap_err();
        assert!(matches!(err, TensorError::BatchSizeMismatch { expected: 1, got: 2 }));
        assert_eq!(pool.pending_backward(), 1);

        pool.backward(input.view(), Array2::ones((1, 4)).view(), &mut grad).unwrap();
        assert_eq!(grad.sum(), 4.0);
        assert_eq!(pool.pending_backward(), 0);
    }

    #[test]
    fn nan_window_propagates_nan() {
        let mut pool = layer(2, 2, true, (2, 2));
        let input = arr2(&[[TensorData::NAN; 4]]);
        let mut output = Array2::zeros((0, 0));
        pool.forward(input.view(), &mut output).unwrap();
        assert!(output[[0, 0]].is_nan());
        let mut grad = Array2::zeros((0, 0));
        pool.backward(input.view(), arr2(&[[2.0]]).view(), &mut grad).unwrap();
        assert_eq!(grad, arr2(&[[2.0, 0.0, 0.0, 0.0]]));
    }

    #[test]
    fn input_size_must_divide_features() {
        let mut pool = layer(2, 2, true, (3, 3));
        let mut output = Array2::zeros((0, 0));
        let err = pool.forward(Array2::zeros((1, 10)).view(), &mut output).unwrap_err();
        assert!(matches!(err, TensorError::ShapeMismatch { .. }));
    }

    #[test]
    fn state_round_trip() {
        let mut pool = layer(3, 2, false, (7, 5));
        let mut output = Array2::zeros((0, 0));
        pool.forward(Array2::zeros((2, 35)).view(), &mut output).unwrap();
        let restored = MaxPool2d::from_state(pool.state()).unwrap();
        assert_eq!(restored.state(), pool.state());
        assert_eq!(restored.pending_backward(), 0);
    }
}
