use serde::{Deserialize, Serialize};

/// Element types a tensor can carry.
///
/// The quantized variants store integers whose real value is recovered through the
/// tensor's [`Quantization`](super::Quantization) parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DataType {
    Float32,
    Float16,
    BFloat16,
    Signed32,
    QSymmS16,
    QSymmS8,
    QAsymmS8,
    QAsymmU8,
    Boolean,
}

impl DataType {
    pub const ALL: [DataType; 9] = [
        DataType::Float32,
        DataType::Float16,
        DataType::BFloat16,
        DataType::Signed32,
        DataType::QSymmS16,
        DataType::QSymmS8,
        DataType::QAsymmS8,
        DataType::QAsymmU8,
        DataType::Boolean,
    ];

    pub const fn size_in_bytes(self) -> usize {
        match self {
            DataType::Float32 | DataType::Signed32 => 4,
            DataType::Float16 | DataType::BFloat16 | DataType::QSymmS16 => 2,
            DataType::QSymmS8 | DataType::QAsymmS8 | DataType::QAsymmU8 | DataType::Boolean => 1,
        }
    }

    pub const fn is_quantized(self) -> bool {
        matches!(
            self,
            DataType::QSymmS16 | DataType::QSymmS8 | DataType::QAsymmS8 | DataType::QAsymmU8
        )
    }

    pub const fn is_float(self) -> bool {
        matches!(
            self,
            DataType::Float32 | DataType::Float16 | DataType::BFloat16
        )
    }

    /// Inclusive integer range representable by a quantized type.
    pub const fn quantized_range(self) -> Option<(i32, i32)> {
        match self {
            DataType::QSymmS16 => Some((i16::MIN as i32, i16::MAX as i32)),
            DataType::QSymmS8 | DataType::QAsymmS8 => Some((i8::MIN as i32, i8::MAX as i32)),
            DataType::QAsymmU8 => Some((0, u8::MAX as i32)),
            _ => None,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            DataType::Float32 => "Float32",
            DataType::Float16 => "Float16",
            DataType::BFloat16 => "BFloat16",
            DataType::Signed32 => "Signed32",
            DataType::QSymmS16 => "QSymmS16",
            DataType::QSymmS8 => "QSymmS8",
            DataType::QAsymmS8 => "QAsymmS8",
            DataType::QAsymmU8 => "QAsymmU8",
            DataType::Boolean => "Boolean",
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantized_types_report_integer_ranges() {
        for dtype in DataType::ALL {
            assert_eq!(dtype.is_quantized(), dtype.quantized_range().is_some());
        }
        assert_eq!(DataType::QAsymmU8.quantized_range(), Some((0, 255)));
        assert_eq!(DataType::QSymmS16.size_in_bytes(), 2);
    }
}
