//! Tensor metadata and caller-owned tensor buffers.

mod data;
mod dtype;
mod info;
mod quant;
mod shape;

pub use data::{decode_elements, encode_elements, ConstTensor, Element, Tensor};
pub use dtype::DataType;
pub use info::TensorInfo;
pub use quant::{dequantize, quantize, Quantization};
pub use shape::{TensorShape, MAX_NUM_DIMENSIONS};
