//! # Zero Padding
//!
//! Asymmetric spatial zero padding and the padding policies a convolution
//! layer can be configured with.

use std::fmt;
use std::str::FromStr;

use ndarray::{s, Array2, ArrayView2, ArrayView3, Axis};
use serde::{Deserialize, Serialize};

use crate::tensor::{Cube, TensorData, TensorError};
use crate::utils::parallel::try_for_each_slice;

/// How a convolution layer derives its padding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaddingType {
    /// Use the explicitly configured padding values.
    Explicit,
    /// No padding at all.
    Valid,
    /// Pad so that a stride-1 convolution preserves the spatial size.
    Same,
}

impl Default for PaddingType {
    fn default() -> Self {
        PaddingType::Explicit
    }
}

impl FromStr for PaddingType {
    type Err = TensorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" | "explicit" => Ok(PaddingType::Explicit),
            "valid" => Ok(PaddingType::Valid),
            "same" => Ok(PaddingType::Same),
            other => Err(TensorError::InvalidConfiguration(format!(
                "unknown padding type '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for PaddingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PaddingType::Explicit => write!(f, "explicit"),
            PaddingType::Valid => write!(f, "valid"),
            PaddingType::Same => write!(f, "same"),
        }
    }
}

/// Zero padding added around every `(height, width)` slice.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Padding {
    pub left: usize,
    pub right: usize,
    pub top: usize,
    pub bottom: usize,
}

impl Padding {
    pub fn new(left: usize, right: usize, top: usize, bottom: usize) -> Self {
        Padding {
            left,
            right,
            top,
            bottom,
        }
    }

    /// The same amount on both sides of each axis.
    pub fn symmetric(pad_width: usize, pad_height: usize) -> Self {
        Padding::new(pad_width, pad_width, pad_height, pad_height)
    }

    /// Solves `O = (W - F + P) / s + 1` for `O = W` along both axes.
    ///
    /// The total `P = (s - 1) * W + F - s` is split as evenly as possible with
    /// the odd remainder going to the right/bottom.
    pub fn same(
        input_size: (usize, usize),
        kernel_size: (usize, usize),
        stride: (usize, usize),
    ) -> Result<Self, TensorError> {
        let (left, right) = split_same(input_size.0, kernel_size.0, stride.0, "width")?;
        let (top, bottom) = split_same(input_size.1, kernel_size.1, stride.1, "height")?;
        Ok(Padding::new(left, right, top, bottom))
    }

    /// Resolves the padding for a policy, starting from explicit values.
    pub fn resolve(
        padding_type: PaddingType,
        explicit: Padding,
        input_size: (usize, usize),
        kernel_size: (usize, usize),
        stride: (usize, usize),
    ) -> Result<Self, TensorError> {
        match padding_type {
            PaddingType::Explicit => Ok(explicit),
            PaddingType::Valid => Ok(Padding::default()),
            PaddingType::Same => Padding::same(input_size, kernel_size, stride),
        }
    }

    pub fn is_zero(&self) -> bool {
        self.left == 0 && self.right == 0 && self.top == 0 && self.bottom == 0
    }

    /// Padded `(width, height)` of an input of `(width, height)`.
    pub fn padded_size(&self, size: (usize, usize)) -> (usize, usize) {
        (
            size.0 + self.left + self.right,
            size.1 + self.top + self.bottom,
        )
    }

    /// Copies `input` into the interior of a zeroed, padded matrix.
    pub fn pad(&self, input: ArrayView2<'_, TensorData>) -> Array2<TensorData> {
        let (rows, cols) = input.dim();
        let mut output = Array2::zeros((rows + self.top + self.bottom, cols + self.left + self.right));
        output
            .slice_mut(s![self.top..self.top + rows, self.left..self.left + cols])
            .assign(&input);
        output
    }

    /// Pads every slice of a cube, one worker per slice.
    pub fn pad_cube(&self, input: ArrayView3<'_, TensorData>) -> Result<Cube, TensorError> {
        let (slices, rows, cols) = input.dim();
        let mut output = Cube::zeros((
            slices,
            rows + self.top + self.bottom,
            cols + self.left + self.right,
        ));
        try_for_each_slice(output.view_mut(), rows * cols, |index, mut slice| {
            slice
                .slice_mut(s![self.top..self.top + rows, self.left..self.left + cols])
                .assign(&input.index_axis(Axis(0), index));
            Ok(())
        })?;
        Ok(output)
    }

    /// The unpadded interior of a padded matrix.
    pub fn crop<'a>(&self, padded: ArrayView2<'a, TensorData>) -> Result<ArrayView2<'a, TensorData>, TensorError> {
        let (rows, cols) = padded.dim();
        if rows < self.top + self.bottom || cols < self.left + self.right {
            return Err(TensorError::ShapeMismatch {
                expected: vec![self.top + self.bottom, self.left + self.right],
                got: vec![rows, cols],
            });
        }
        Ok(padded.slice_move(s![self.top..rows - self.bottom, self.left..cols - self.right]))
    }
}

fn split_same(
    input: usize,
    kernel: usize,
    stride: usize,
    axis: &'static str,
) -> Result<(usize, usize), TensorError> {
    let total = (stride as i64 - 1) * input as i64 + kernel as i64 - stride as i64;
    if total < 0 {
        return Err(TensorError::InvalidPadding { axis, total });
    }
    let total = total as usize;
    Ok((total / 2, total - total / 2))
}
