//! # Utility Functions (`utils`)
//!
//! Provides helpers for parallel slice scheduling and layer state serialization.

pub mod parallel;
pub mod serialization;

pub use serialization::{ConvolutionState, MaxPoolingState, SerializationError};
