//! # Neural Network Module (`nn`)
//!
//! Convolution kernels (`functional`) and the trainable layers built on them
//! (`modules`).

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use std::fmt::Debug;

use crate::tensor::{TensorData, TensorError};

pub mod functional;
pub mod modules;

pub use functional::BorderMode;
pub use modules::*;

// --- Core Trait: Module ---

/// Base trait for the layers in this crate.
///
/// Batches are flat `(batch, features)` matrices, one row per sample. The
/// host network owns call ordering: `backward` and `gradient` refer to the
/// most recent `forward`.
pub trait Module: Debug + Send + Sync {
    /// Computes the layer output for a batch.
    fn forward(
        &mut self,
        input: ArrayView2<'_, TensorData>,
        output: &mut Array2<TensorData>,
    ) -> Result<(), TensorError>;

    /// Propagates `output_gradient` back to the layer input.
    fn backward(
        &mut self,
        input: ArrayView2<'_, TensorData>,
        output_gradient: ArrayView2<'_, TensorData>,
        input_gradient: &mut Array2<TensorData>,
    ) -> Result<(), TensorError>;

    /// Computes the gradient with respect to the flat parameter buffer.
    /// Layers without parameters leave `gradient` empty.
    fn gradient(
        &mut self,
        _input: ArrayView2<'_, TensorData>,
        _output_gradient: ArrayView2<'_, TensorData>,
        gradient: &mut Array1<TensorData>,
    ) -> Result<(), TensorError> {
        *gradient = Array1::zeros(0);
        Ok(())
    }

    /// The flat parameter buffer, empty for parameterless layers.
    fn parameters(&self) -> ArrayView1<'_, TensorData> {
        ArrayView1::from(&[] as &[TensorData])
    }

    /// Switches the layer to training mode.
    fn train(&mut self) {}

    /// Switches the layer to deterministic (inference) mode.
    fn eval(&mut self) {}
}
