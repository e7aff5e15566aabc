use serde::{Deserialize, Serialize};

use super::DataType;

/// Affine quantization parameters: `real = scale * (q - offset)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Quantization {
    PerTensor { scale: f32, offset: i32 },
    PerAxis { scales: Vec<f32>, axis: u32 },
}

impl Quantization {
    pub fn per_tensor(scale: f32, offset: i32) -> Self {
        Quantization::PerTensor { scale, offset }
    }

    /// Scale and offset for the element at channel `channel` of the quantized axis.
    pub fn params_for(&self, channel: usize) -> (f32, i32) {
        match self {
            Quantization::PerTensor { scale, offset } => (*scale, *offset),
            Quantization::PerAxis { scales, .. } => (scales[channel.min(scales.len() - 1)], 0),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        match self {
            Quantization::PerTensor { scale, .. } => {
                if !(scale.is_finite() && *scale > 0.0) {
                    return Err(format!("quantization scale must be positive, got {scale}"));
                }
            }
            Quantization::PerAxis { scales, .. } => {
                if scales.is_empty() {
                    return Err("per-axis quantization requires at least one scale".into());
                }
                if let Some(bad) = scales.iter().find(|s| !(s.is_finite() && **s > 0.0)) {
                    return Err(format!("quantization scale must be positive, got {bad}"));
                }
            }
        }
        Ok(())
    }
}

pub fn quantize(value: f32, scale: f32, offset: i32, dtype: DataType) -> i32 {
    let (lo, hi) = dtype.quantized_range().unwrap_or((i32::MIN, i32::MAX));
    let q = (value / scale).round() as i64 + offset as i64;
    q.clamp(lo as i64, hi as i64) as i32
}

pub fn dequantize(value: i32, scale: f32, offset: i32) -> f32 {
    (value - offset) as f32 * scale
}
