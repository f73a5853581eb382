//! # RConv Core Library
//!
//! Direct 2D convolution kernels and the two trainable layers built on them:
//! a batched multi-channel convolution layer and a max-pooling layer with
//! arg-max gradient routing. Layers follow a forward / backward / gradient
//! protocol driven by an external network and optimizer.

pub mod nn;
pub mod tensor;
pub mod utils;

pub mod prelude {
    pub use crate::nn::functional::{
        conv2d, conv2d_cube_cube, conv2d_cube_matrix, conv2d_into, conv2d_matrix_cube, BorderMode,
    };
    pub use crate::nn::{Conv2d, MaxPool2d, Module, Padding, PaddingType, PoolingIndices};
    pub use crate::tensor::{Cube, ParameterBuffer, TensorData, TensorError};
    pub use crate::utils::serialization::{ConvolutionState, MaxPoolingState, SerializationError};
}
