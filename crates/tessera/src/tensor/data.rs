use bytes::Bytes;
use half::f16;

use super::TensorInfo;

/// Fixed-size scalar that can be laid out little-endian in tensor storage.
pub trait Element: Copy + Send + Sync + 'static {
    const SIZE: usize;

    fn write_le(self, out: &mut Vec<u8>);

    fn read_le(bytes: &[u8]) -> Self;
}

macro_rules! impl_element {
    ($($ty:ty),*) => {
        $(
            impl Element for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();

                fn write_le(self, out: &mut Vec<u8>) {
                    out.extend_from_slice(&self.to_le_bytes());
                }

                fn read_le(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(&bytes[..Self::SIZE]);
                    <$ty>::from_le_bytes(raw)
                }
            }
        )*
    };
}

impl_element!(f32, i32, i16, i8, u8, f16);

pub fn encode_elements<T: Element>(values: &[T]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * T::SIZE);
    for &value in values {
        value.write_le(&mut out);
    }
    out
}

pub fn decode_elements<T: Element>(bytes: &[u8]) -> Vec<T> {
    bytes.chunks_exact(T::SIZE).map(T::read_le).collect()
}

/// Immutable caller-owned input buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct ConstTensor {
    pub info: TensorInfo,
    pub data: Bytes,
}

impl ConstTensor {
    pub fn new(info: TensorInfo, data: impl Into<Bytes>) -> Result<Self, String> {
        let data = data.into();
        if data.len() != info.num_bytes() {
            return Err(format!(
                "tensor {info} expects {} bytes, got {}",
                info.num_bytes(),
                data.len()
            ));
        }
        Ok(Self { info, data })
    }

    pub fn from_elements<T: Element>(info: TensorInfo, values: &[T]) -> Result<Self, String> {
        if T::SIZE != info.data_type.size_in_bytes() {
            return Err(format!(
                "element size {} does not match {}",
                T::SIZE,
                info.data_type
            ));
        }
        Self::new(info, encode_elements(values))
    }

    pub fn to_elements<T: Element>(&self) -> Vec<T> {
        decode_elements(&self.data)
    }
}

/// Mutable caller-owned output buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    pub info: TensorInfo,
    pub data: Vec<u8>,
}

impl Tensor {
    pub fn zeroed(info: TensorInfo) -> Self {
        let data = vec![0u8; info.num_bytes()];
        Self { info, data }
    }

    pub fn to_elements<T: Element>(&self) -> Vec<T> {
        decode_elements(&self.data)
    }
}
