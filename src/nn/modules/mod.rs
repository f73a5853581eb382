//! # Neural Network Layer Modules
//!
//! Contains the convolution and pooling layers and their padding support.

pub mod conv;
pub use conv::Conv2d;

pub mod padding;
pub use padding::{Padding, PaddingType};

pub mod pooling;
pub use pooling::{MaxPool2d, PoolingIndices};
