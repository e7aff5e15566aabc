use serde::{Deserialize, Serialize};

use super::{DataType, Quantization, TensorShape};

/// Shape, element type and optional quantization of a tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorInfo {
    pub shape: TensorShape,
    pub data_type: DataType,
    pub quantization: Option<Quantization>,
}

impl TensorInfo {
    pub fn new(shape: impl Into<TensorShape>, data_type: DataType) -> Self {
        Self {
            shape: shape.into(),
            data_type,
            quantization: None,
        }
    }

    pub fn quantized(
        shape: impl Into<TensorShape>,
        data_type: DataType,
        scale: f32,
        offset: i32,
    ) -> Self {
        Self {
            shape: shape.into(),
            data_type,
            quantization: Some(Quantization::per_tensor(scale, offset)),
        }
    }

    pub fn per_axis(
        shape: impl Into<TensorShape>,
        data_type: DataType,
        scales: Vec<f32>,
        axis: u32,
    ) -> Self {
        Self {
            shape: shape.into(),
            data_type,
            quantization: Some(Quantization::PerAxis { scales, axis }),
        }
    }

    pub fn num_elements(&self) -> usize {
        self.shape.num_elements()
    }

    pub fn num_bytes(&self) -> usize {
        self.num_elements() * self.data_type.size_in_bytes()
    }

    pub fn with_shape(&self, shape: TensorShape) -> Self {
        Self {
            shape,
            ..self.clone()
        }
    }

    /// Switches the element type; quantization is dropped for non-quantized targets.
    pub fn with_data_type(&self, data_type: DataType) -> Self {
        Self {
            shape: self.shape.clone(),
            data_type,
            quantization: if data_type.is_quantized() {
                self.quantization.clone()
            } else {
                None
            },
        }
    }

    /// Per-tensor scale and offset, defaulting to the identity mapping.
    pub fn scale_offset(&self) -> (f32, i32) {
        match &self.quantization {
            Some(Quantization::PerTensor { scale, offset }) => (*scale, *offset),
            _ => (1.0, 0),
        }
    }

    /// Same element type and same quantization parameters, so bytes are interchangeable.
    pub fn is_type_space_match(&self, other: &TensorInfo) -> bool {
        if self.data_type != other.data_type {
            return false;
        }
        if !self.data_type.is_quantized() {
            return true;
        }
        self.quantization == other.quantization
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.shape.dims().iter().any(|&d| d == 0) {
            return Err(format!("tensor shape {} has a zero dimension", self.shape));
        }
        match (&self.quantization, self.data_type.is_quantized()) {
            (None, true) => Err(format!(
                "{} tensor requires quantization parameters",
                self.data_type
            )),
            (Some(quant), true) => {
                quant.validate()?;
                if let Quantization::PerAxis { scales, axis } = quant {
                    let axis = *axis as usize;
                    if axis >= self.shape.rank() {
                        return Err(format!(
                            "quantization axis {axis} out of range for shape {}",
                            self.shape
                        ));
                    }
                    if scales.len() != self.shape.dim(axis) as usize {
                        return Err(format!(
                            "expected {} per-axis scales, got {}",
                            self.shape.dim(axis),
                            scales.len()
                        ));
                    }
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

impl std::fmt::Display for TensorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.data_type, self.shape)?;
        if let Some(Quantization::PerTensor { scale, offset }) = &self.quantization {
            write!(f, "(scale={scale}, offset={offset})")?;
        }
        Ok(())
    }
}
