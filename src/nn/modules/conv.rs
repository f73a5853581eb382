//! # Convolutional Layer Module

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::distributions::{Distribution, Uniform};
use rand::Rng;

use crate::nn::functional::{conv2d, conv2d_into, conv_output_size, BorderMode};
use crate::nn::modules::padding::{Padding, PaddingType};
use crate::nn::Module;
use crate::tensor::{
    batch_of, contiguous, cube_view, flatten_batch, ops, Cube, ParameterBuffer, TensorData, TensorError,
};
use crate::utils::parallel::try_for_each_slice;
use crate::utils::serialization::ConvolutionState;

/// Applies a 2D convolution over a batch of multi-channel feature maps.
///
/// Input rows hold one sample each, laid out as `(in_channels, height, width)`;
/// output rows are `(out_channels, output_height, output_width)`.
///
/// Parameters live in one flat buffer: `out_channels * in_channels` filters of
/// `kernel_height x kernel_width` (filter `out * in_channels + in` maps input
/// channel `in` to output channel `out`), followed by `out_channels` biases.
#[derive(Debug, Clone)]
pub struct Conv2d {
    in_channels: usize,
    out_channels: usize,
    batch_size: usize,
    kernel_width: usize,
    kernel_height: usize,
    stride_width: usize,
    stride_height: usize,
    padding: Padding,
    padding_type: PaddingType,
    input_width: usize,
    input_height: usize,
    output_width: usize,
    output_height: usize,
    parameters: ParameterBuffer,
    // Padded copy of the last forward input, reused by `gradient`.
    padded_input: Option<Cube>,
}

impl Conv2d {
    /// Creates a new Conv2d module with symmetric padding.
    ///
    /// # Arguments
    /// * `kernel_size`, `stride`, `padding`, `input_size`: `(width, height)` pairs.
    /// * `padding_type`: `"valid"`, `"same"`, or `""`/`"none"` to keep `padding`.
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: (usize, usize),
        stride: (usize, usize),
        padding: (usize, usize),
        input_size: (usize, usize),
        padding_type: &str,
    ) -> Result<Self, TensorError> {
        Self::with_padding(
            in_channels,
            out_channels,
            kernel_size,
            stride,
            (padding.0, padding.0),
            (padding.1, padding.1),
            input_size,
            padding_type,
        )
    }

    /// Creates a new Conv2d module with asymmetric padding:
    /// `pad_width` is `(left, right)`, `pad_height` is `(top, bottom)`.
    #[allow(clippy::too_many_arguments)]
    pub fn with_padding(
        in_channels: usize,
        out_channels: usize,
        kernel_size: (usize, usize),
        stride: (usize, usize),
        pad_width: (usize, usize),
        pad_height: (usize, usize),
        input_size: (usize, usize),
        padding_type: &str,
    ) -> Result<Self, TensorError> {
        if in_channels == 0 || out_channels == 0 {
            return Err(TensorError::InvalidConfiguration(
                "channel counts must be positive".to_string(),
            ));
        }
        if kernel_size.0 == 0 || kernel_size.1 == 0 || stride.0 == 0 || stride.1 == 0 {
            return Err(TensorError::InvalidConfiguration(format!(
                "kernel {:?} and stride {:?} must be positive",
                kernel_size, stride
            )));
        }
        let padding_type: PaddingType = padding_type.parse()?;
        let explicit = Padding::new(pad_width.0, pad_width.1, pad_height.0, pad_height.1);
        let padding = Padding::resolve(padding_type, explicit, input_size, kernel_size, stride)?;
        log::debug!(
            "Conv2d {} -> {} channels, kernel {}x{}, stride {}x{}, {} padding {:?}",
            in_channels,
            out_channels,
            kernel_size.0,
            kernel_size.1,
            stride.0,
            stride.1,
            padding_type,
            padding
        );

        let mut layer = Conv2d {
            in_channels,
            out_channels,
            batch_size: 0,
            kernel_width: kernel_size.0,
            kernel_height: kernel_size.1,
            stride_width: stride.0,
            stride_height: stride.1,
            padding,
            padding_type,
            input_width: input_size.0,
            input_height: input_size.1,
            output_width: 0,
            output_height: 0,
            parameters: ParameterBuffer::zeros(
                (out_channels * in_channels, kernel_size.1, kernel_size.0),
                out_channels,
            ),
            padded_input: None,
        };
        layer.reset_parameters();
        Ok(layer)
    }

    /// Re-initializes filters and bias from `U(-k, k)`, `k = 1 / sqrt(fan_in)`.
    pub fn reset_parameters(&mut self) {
        self.reset_parameters_with(&mut rand::thread_rng());
    }

    /// Same as [`Conv2d::reset_parameters`] with a caller-provided generator.
    pub fn reset_parameters_with<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        let fan_in = self.in_channels * self.kernel_width * self.kernel_height;
        let k = (1.0 / fan_in as TensorData).sqrt();
        let range = Uniform::new_inclusive(-k, k);
        for value in self.parameters.as_mut_slice() {
            *value = range.sample(rng);
        }
    }

    /// Number of parameters: all filter taps plus one bias per output channel.
    pub fn weight_size(&self) -> usize {
        self.out_channels * self.in_channels * self.kernel_width * self.kernel_height + self.out_channels
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    /// Batch size of the last forward pass (0 before the first one).
    pub fn batch_size(&self) -> usize {
        self.batch_size
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

    pub fn padding(&self) -> Padding {
        self.padding
    }

    pub fn padding_type(&self) -> PaddingType {
        self.padding_type
    }

    pub fn pad_left(&self) -> usize {
        self.padding.left
    }

    pub fn pad_right(&self) -> usize {
        self.padding.right
    }

    pub fn pad_top(&self) -> usize {
        self.padding.top
    }

    pub fn pad_bottom(&self) -> usize {
        self.padding.bottom
    }

    pub fn input_width(&self) -> usize {
        self.input_width
    }

    pub fn input_height(&self) -> usize {
        self.input_height
    }

    /// Output width realized by the last forward pass.
    pub fn output_width(&self) -> usize {
        self.output_width
    }

    /// Output height realized by the last forward pass.
    pub fn output_height(&self) -> usize {
        self.output_height
    }

    pub fn parameter_buffer(&self) -> &ParameterBuffer {
        &self.parameters
    }

    /// Mutable parameter access for the optimizer driving this layer.
    pub fn parameter_buffer_mut(&mut self) -> &mut ParameterBuffer {
        &mut self.parameters
    }

    pub fn state(&self) -> ConvolutionState {
        ConvolutionState {
            in_channels: self.in_channels,
            out_channels: self.out_channels,
            batch_size: self.batch_size,
            kernel_width: self.kernel_width,
            kernel_height: self.kernel_height,
            stride_width: self.stride_width,
            stride_height: self.stride_height,
            pad_left: self.padding.left,
            pad_right: self.padding.right,
            pad_top: self.padding.top,
            pad_bottom: self.padding.bottom,
            input_width: self.input_width,
            input_height: self.input_height,
            output_width: self.output_width,
            output_height: self.output_height,
            padding: self.padding,
            parameters: self.parameters.as_slice().to_vec(),
        }
    }

    /// Rebuilds a layer from a persisted state; the padding object wins over the scalar copies.
    pub fn from_state(state: ConvolutionState) -> Result<Self, TensorError> {
        if state.in_channels == 0
            || state.out_channels == 0
            || state.kernel_width == 0
            || state.kernel_height == 0
            || state.stride_width == 0
            || state.stride_height == 0
        {
            return Err(TensorError::InvalidConfiguration(
                "persisted convolution state has zero-sized dimensions".to_string(),
            ));
        }
        let scalar_padding = Padding::new(state.pad_left, state.pad_right, state.pad_top, state.pad_bottom);
        if scalar_padding != state.padding {
            log::warn!(
                "persisted padding {:?} disagrees with padding object {:?}",
                scalar_padding,
                state.padding
            );
        }
        if state.output_width != 0 || state.output_height != 0 {
            let (padded_width, padded_height) = state.padding.padded_size((state.input_width, state.input_height));
            let expected = (
                conv_output_size(padded_height, state.kernel_height, state.stride_height, 1, "height")?,
                conv_output_size(padded_width, state.kernel_width, state.stride_width, 1, "width")?,
            );
            if expected != (state.output_height, state.output_width) {
                return Err(TensorError::ShapeMismatch {
                    expected: vec![expected.0, expected.1],
                    got: vec![state.output_height, state.output_width],
                });
            }
        }
        let parameters = ParameterBuffer::from_vec(
            state.parameters,
            (
                state.out_channels * state.in_channels,
                state.kernel_height,
                state.kernel_width,
            ),
            state.out_channels,
        )?;
        Ok(Conv2d {
            in_channels: state.in_channels,
            out_channels: state.out_channels,
            batch_size: state.batch_size,
            kernel_width: state.kernel_width,
            kernel_height: state.kernel_height,
            stride_width: state.stride_width,
            stride_height: state.stride_height,
            padding: state.padding,
            padding_type: PaddingType::Explicit,
            input_width: state.input_width,
            input_height: state.input_height,
            output_width: state.output_width,
            output_height: state.output_height,
            parameters,
            padded_input: None,
        })
    }

    fn input_features(&self) -> usize {
        self.in_channels * self.input_width * self.input_height
    }

    fn output_features(&self) -> usize {
        self.out_channels * self.output_width * self.output_height
    }

    /// Checks that a backward-direction call matches the preceding forward pass
    /// and returns the batch size.
    fn check_pass(
        &self,
        pass: &'static str,
        input: &ArrayView2<'_, TensorData>,
        output_gradient: &ArrayView2<'_, TensorData>,
    ) -> Result<usize, TensorError> {
        if self.batch_size == 0 || self.output_width == 0 || self.output_height == 0 {
            return Err(TensorError::MissingForwardPass(pass));
        }
        for batch in [
            batch_of(input, self.input_features())?,
            batch_of(output_gradient, self.output_features())?,
        ] {
            if batch != self.batch_size {
                log::warn!("Conv2d {} with batch {} after forward with batch {}", pass, batch, self.batch_size);
                return Err(TensorError::BatchSizeMismatch {
                    expected: self.batch_size,
                    got: batch,
                });
            }
        }
        Ok(self.batch_size)
    }
}

impl Module for Conv2d {
    fn forward(
        &mut self,
        input: ArrayView2<'_, TensorData>,
        output: &mut Array2<TensorData>,
    ) -> Result<(), TensorError> {
        let batch = batch_of(&input, self.input_features())?;
        let (in_channels, out_channels) = (self.in_channels, self.out_channels);
        let input = input.as_standard_layout();
        let input = cube_view(
            contiguous(&input)?,
            in_channels * batch,
            self.input_height,
            self.input_width,
        )?;

        let padded = if self.padding.is_zero() {
            None
        } else {
            Some(self.padding.pad_cube(input)?)
        };
        let source = padded.as_ref().map_or(input, |p| p.view());

        let (padded_width, padded_height) = self.padding.padded_size((self.input_width, self.input_height));
        let output_width = conv_output_size(padded_width, self.kernel_width, self.stride_width, 1, "width")?;
        let output_height = conv_output_size(padded_height, self.kernel_height, self.stride_height, 1, "height")?;

        let filters = self.parameters.filters()?;
        let bias = self.parameters.bias();
        let stride = (self.stride_width, self.stride_height);
        let mut output_cube = Cube::zeros((out_channels * batch, output_height, output_width));
        let work = output_width * output_height * self.kernel_width * self.kernel_height * in_channels;

        try_for_each_slice(output_cube.view_mut(), work, |out_map, mut slice| {
            let channel = out_map % out_channels;
            let sample = out_map / out_channels;
            for in_map in 0..in_channels {
                conv2d_into(
                    source.index_axis(Axis(0), in_map + sample * in_channels),
                    filters.index_axis(Axis(0), channel * in_channels + in_map),
                    stride,
                    (1, 1),
                    BorderMode::Valid,
                    slice.view_mut(),
                    true,
                )?;
            }
            slice += bias[channel];
            Ok(())
        })?;

        *output = flatten_batch(output_cube, batch)?;
        self.padded_input = padded;
        self.batch_size = batch;
        self.output_width = output_width;
        self.output_height = output_height;
        log::trace!("Conv2d forward: batch {}, output {}x{}", batch, output_width, output_height);
        Ok(())
    }

    /// Full convolution of each output-gradient map with the rotated filters,
    /// cropped back to the unpadded input region.
    fn backward(
        &mut self,
        input: ArrayView2<'_, TensorData>,
        output_gradient: ArrayView2<'_, TensorData>,
        input_gradient: &mut Array2<TensorData>,
    ) -> Result<(), TensorError> {
        let batch = self.check_pass("backward", &input, &output_gradient)?;
        let (in_channels, out_channels) = (self.in_channels, self.out_channels);
        let output_gradient = output_gradient.as_standard_layout();
        let errors = cube_view(
            contiguous(&output_gradient)?,
            out_channels * batch,
            self.output_height,
            self.output_width,
        )?;

        let rotated = ops::rotate180_cube(self.parameters.filters()?);
        let stride = (self.stride_width, self.stride_height);
        let offset = (self.padding.top, self.padding.left);
        let mut gradient_cube = Cube::zeros((in_channels * batch, self.input_height, self.input_width));
        let work = self.output_width * self.output_height * self.kernel_width * self.kernel_height * out_channels;

        try_for_each_slice(gradient_cube.view_mut(), work, |in_map, mut slice| {
            let channel = in_map % in_channels;
            let sample = in_map / in_channels;
            for out_channel in 0..out_channels {
                let full = conv2d(
                    errors.index_axis(Axis(0), out_channel + sample * out_channels),
                    rotated.index_axis(Axis(0), out_channel * in_channels + channel),
                    stride,
                    (1, 1),
                    BorderMode::Full,
                )?;
                ops::add_overlap(slice.view_mut(), full.view(), offset);
            }
            Ok(())
        })?;

        *input_gradient = flatten_batch(gradient_cube, batch)?;
        Ok(())
    }

    /// Cross-correlates the padded input with the output gradient (taps spaced
    /// by the stride) for the filters; sums the output gradient for the bias.
    fn gradient(
        &mut self,
        input: ArrayView2<'_, TensorData>,
        output_gradient: ArrayView2<'_, TensorData>,
        gradient: &mut Array1<TensorData>,
    ) -> Result<(), TensorError> {
        let batch = self.check_pass("gradient", &input, &output_gradient)?;
        let (in_channels, out_channels) = (self.in_channels, self.out_channels);
        let output_gradient = output_gradient.as_standard_layout();
        let errors = cube_view(
            contiguous(&output_gradient)?,
            out_channels * batch,
            self.output_height,
            self.output_width,
        )?;
        let input = input.as_standard_layout();
        let input = cube_view(
            contiguous(&input)?,
            in_channels * batch,
            self.input_height,
            self.input_width,
        )?;

        let repadded;
        let source = match (&self.padded_input, self.padding.is_zero()) {
            (_, true) => input,
            (Some(padded), false) if padded.len_of(Axis(0)) == in_channels * batch => padded.view(),
            _ => {
                repadded = self.padding.pad_cube(input)?;
                repadded.view()
            }
        };

        let (_, padded_height, padded_width) = source.dim();
        let correlation = match (
            padded_height.checked_sub((self.output_height - 1) * self.stride_height),
            padded_width.checked_sub((self.output_width - 1) * self.stride_width),
        ) {
            (Some(rows), Some(cols)) if rows >= self.kernel_height && cols >= self.kernel_width => (rows, cols),
            _ => {
                return Err(TensorError::ShapeMismatch {
                    expected: vec![padded_height, padded_width],
                    got: vec![self.output_height, self.output_width],
                })
            }
        };
        if correlation != (self.kernel_height, self.kernel_width) {
            log::trace!(
                "Conv2d gradient: correlation {:?} folded into kernel {}x{}",
                correlation,
                self.kernel_width,
                self.kernel_height
            );
        }

        let dilation = (self.stride_width, self.stride_height);
        let mut buffer = ParameterBuffer::zeros(self.parameters.filter_shape(), out_channels);
        {
            let (filter_gradients, mut bias_gradients) = buffer.split_mut()?;
            let work = correlation.0 * correlation.1 * self.output_width * self.output_height * batch;
            try_for_each_slice(filter_gradients, work, |filter_map, mut slice| {
                let out_channel = filter_map / in_channels;
                let channel = filter_map % in_channels;
                for sample in 0..batch {
                    let correlation = conv2d(
                        source.index_axis(Axis(0), channel + sample * in_channels),
                        errors.index_axis(Axis(0), out_channel + sample * out_channels),
                        (1, 1),
                        dilation,
                        BorderMode::Valid,
                    )?;
                    ops::add_overlap(slice.view_mut(), correlation.view(), (0, 0));
                }
                Ok(())
            })?;

            for (out_channel, value) in bias_gradients.iter_mut().enumerate() {
                *value = (0..batch)
                    .map(|sample| errors.index_axis(Axis(0), out_channel + sample * out_channels).sum())
                    .sum();
            }
        }

        *gradient = Array1::from(buffer.into_vec());
        Ok(())
    }

    fn parameters(&self) -> ArrayView1<'_, TensorData> {
        self.parameters.view()
    }
}
