//! Reference kernels.
//!
//! Arithmetic kernels run in f32: inputs are decoded (dequantized, widened from half
//! precision) and results are encoded back into the output's element type. Data
//! movement kernels copy raw bytes when source and destination share a type space
//! and fall back to decode/encode otherwise. Signed32 is never quantized, so it always
//! takes the raw path and keeps values past 2^24 exact.

mod arith;
mod movement;
mod nn;

pub use arith::{activation, elementwise_binary};
pub use movement::{concat, convert, permute, split};
pub use nn::{batch_normalization, convolution2d, fully_connected, pooling2d};

use half::{bf16, f16};
use tessera::backend::{BackendError, BackendResult};
use tessera::tensor::{dequantize, quantize, DataType, Quantization, TensorInfo};

fn quant_params(info: &TensorInfo) -> impl Fn(usize) -> (f32, i32) + '_ {
    let strides = info.shape.strides();
    move |index: usize| match &info.quantization {
        Some(Quantization::PerTensor { scale, offset }) => (*scale, *offset),
        Some(quant @ Quantization::PerAxis { axis, .. }) => {
            let axis = *axis as usize;
            let channel = (index / strides[axis]) % info.shape.dim(axis) as usize;
            quant.params_for(channel)
        }
        None => (1.0, 0),
    }
}

fn check_len(info: &TensorInfo, len: usize) -> BackendResult<()> {
    if len != info.num_bytes() {
        return Err(BackendError::execution(format!(
            "tensor {info} expects {} bytes, got {len}",
            info.num_bytes()
        )));
    }
    Ok(())
}

/// Decodes a tensor buffer into real values.
pub fn decode_f32(info: &TensorInfo, bytes: &[u8]) -> BackendResult<Vec<f32>> {
    check_len(info, bytes.len())?;
    let params = quant_params(info);
    let values = match info.data_type {
        DataType::Float32 => bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
        DataType::Float16 => bytes
            .chunks_exact(2)
            .map(|c| f16::from_le_bytes([c[0], c[1]]).to_f32())
            .collect(),
        DataType::BFloat16 => bytes
            .chunks_exact(2)
            .map(|c| bf16::from_le_bytes([c[0], c[1]]).to_f32())
            .collect(),
        DataType::Signed32 => bytes
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f32)
            .collect(),
        DataType::QSymmS16 => bytes
            .chunks_exact(2)
            .enumerate()
            .map(|(i, c)| {
                let (scale, offset) = params(i);
                dequantize(i16::from_le_bytes([c[0], c[1]]) as i32, scale, offset)
            })
            .collect(),
        DataType::QSymmS8 | DataType::QAsymmS8 => bytes
            .iter()
            .enumerate()
            .map(|(i, &b)| {
                let (scale, offset) = params(i);
                dequantize(b as i8 as i32, scale, offset)
            })
            .collect(),
        DataType::QAsymmU8 => bytes
            .iter()
            .enumerate()
            .map(|(i, &b)| {
                let (scale, offset) = params(i);
                dequantize(b as i32, scale, offset)
            })
            .collect(),
        DataType::Boolean => bytes
            .iter()
            .map(|&b| if b != 0 { 1.0 } else { 0.0 })
            .collect(),
    };
    Ok(values)
}

/// Reads a Signed32 buffer without the f32 round trip, which is inexact past 2^24.
pub fn decode_i32(info: &TensorInfo, bytes: &[u8]) -> BackendResult<Vec<i32>> {
    if info.data_type != DataType::Signed32 {
        return Err(BackendError::execution(format!("tensor {info} is not Signed32")));
    }
    check_len(info, bytes.len())?;
    Ok(bytes
        .chunks_exact(4)
        .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

/// Encodes real values into `info`'s element type, quantizing with saturation.
pub fn encode_f32(info: &TensorInfo, values: &[f32]) -> BackendResult<Vec<u8>> {
    if values.len() != info.num_elements() {
        return Err(BackendError::execution(format!(
            "tensor {info} expects {} elements, got {}",
            info.num_elements(),
            values.len()
        )));
    }
    let params = quant_params(info);
    let dtype = info.data_type;
    let mut out = Vec::with_capacity(info.num_bytes());
    for (i, &value) in values.iter().enumerate() {
        match dtype {
            DataType::Float32 => out.extend_from_slice(&value.to_le_bytes()),
            DataType::Float16 => out.extend_from_slice(&f16::from_f32(value).to_le_bytes()),
            DataType::BFloat16 => out.extend_from_slice(&bf16::from_f32(value).to_le_bytes()),
            DataType::Signed32 => out.extend_from_slice(&(value.round() as i32).to_le_bytes()),
            DataType::QSymmS16 => {
                let (scale, offset) = params(i);
                let q = quantize(value, scale, offset, dtype) as i16;
                out.extend_from_slice(&q.to_le_bytes());
            }
            DataType::QSymmS8 | DataType::QAsymmS8 => {
                let (scale, offset) = params(i);
                out.push(quantize(value, scale, offset, dtype) as i8 as u8);
            }
            DataType::QAsymmU8 => {
                let (scale, offset) = params(i);
                out.push(quantize(value, scale, offset, dtype) as u8);
            }
            DataType::Boolean => out.push(u8::from(value != 0.0)),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantized_values_round_trip_through_f32() {
        let info = TensorInfo::quantized([3], DataType::QAsymmU8, 0.5, 10);
        let values = decode_f32(&info, &[10, 12, 0]).unwrap();
        assert_eq!(values, vec![0.0, 1.0, -5.0]);
        assert_eq!(encode_f32(&info, &values).unwrap(), vec![10, 12, 0]);
        // Saturates at the type bounds.
        assert_eq!(encode_f32(&info, &[1000.0, -1000.0, 0.0]).unwrap(), vec![255, 0, 10]);
    }

    #[test]
    fn per_axis_scales_follow_the_channel() {
        let info = TensorInfo::per_axis([2, 2], DataType::QSymmS8, vec![1.0, 0.5], 0);
        let values = decode_f32(&info, &[2, 2, 2, 2]).unwrap();
        assert_eq!(values, vec![2.0, 2.0, 1.0, 1.0]);
    }

    #[test]
    fn signed32_reads_exactly() {
        let info = TensorInfo::new([2], DataType::Signed32);
        let mut bytes = 16_777_217i32.to_le_bytes().to_vec();
        bytes.extend_from_slice(&i32::MIN.to_le_bytes());
        assert_eq!(decode_i32(&info, &bytes).unwrap(), vec![16_777_217, i32::MIN]);
        assert!(decode_i32(&TensorInfo::new([2], DataType::Float32), &bytes).is_err());
    }

    #[test]
    fn half_precision_is_widened() {
        let info = TensorInfo::new([2], DataType::Float16);
        let bytes = encode_f32(&info, &[1.5, -2.0]).unwrap();
        assert_eq!(bytes.len(), 4);
        assert_eq!(decode_f32(&info, &bytes).unwrap(), vec![1.5, -2.0]);
    }
}
