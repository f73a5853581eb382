//! # Layer State Serialization
//!
//! Persisted-state records for the convolution and pooling layers. An
//! external checkpointing component decides where the bytes go; this module
//! only encodes and decodes them with `bincode`.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::io::{Read, Write};

use crate::nn::modules::padding::Padding;
use crate::tensor::{TensorData, TensorError};

// --- Error Type ---
#[derive(thiserror::Error, Debug)]
pub enum SerializationError {
    #[error("Serialization Error (Bincode): {0}")]
    Bincode(#[from] bincode::Error),
    #[error("Invalid layer state: {0}")]
    Tensor(#[from] TensorError),
}

/// Persisted state of a convolution layer.
///
/// Field order is the checkpoint order: the scalar configuration, then the
/// padding object, then the flat parameter buffer.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ConvolutionState {
    pub in_channels: usize,
    pub out_channels: usize,
    pub batch_size: usize,
    pub kernel_width: usize,
    pub kernel_height: usize,
    pub stride_width: usize,
    pub stride_height: usize,
    pub pad_left: usize,
    pub pad_right: usize,
    pub pad_top: usize,
    pub pad_bottom: usize,
    pub input_width: usize,
    pub input_height: usize,
    pub output_width: usize,
    pub output_height: usize,
    pub padding: Padding,
    pub parameters: Vec<TensorData>,
}

/// Persisted state of a max-pooling layer.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MaxPoolingState {
    pub kernel_width: usize,
    pub kernel_height: usize,
    pub stride_width: usize,
    pub stride_height: usize,
    pub batch_size: usize,
    pub floor: bool,
    pub input_width: usize,
    pub input_height: usize,
    pub output_width: usize,
    pub output_height: usize,
}

/// Encodes a state record into bytes.
pub fn to_bytes<T: Serialize>(state: &T) -> Result<Vec<u8>, SerializationError> {
    Ok(bincode::serialize(state)?)
}

/// Decodes a state record from bytes.
pub fn from_bytes<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, SerializationError> {
    Ok(bincode::deserialize(bytes)?)
}

/// Writes a state record to a caller-provided sink.
pub fn save_into<T: Serialize, W: Write>(state: &T, writer: W) -> Result<(), SerializationError> {
    bincode::serialize_into(writer, state)?;
    Ok(())
}

/// Reads a state record from a caller-provided source.
pub fn load_from<T: DeserializeOwned, R: Read>(reader: R) -> Result<T, SerializationError> {
    Ok(bincode::deserialize_from(reader)?)
}
