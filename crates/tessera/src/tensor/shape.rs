use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Highest tensor rank the engine accepts.
pub const MAX_NUM_DIMENSIONS: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorShape {
    dims: SmallVec<[u32; MAX_NUM_DIMENSIONS]>,
}

impl TensorShape {
    /// Builds a shape from its dimensions.
    ///
    /// Panics when `dims` is empty or exceeds [`MAX_NUM_DIMENSIONS`]; use
    /// [`TensorShape::try_new`] for caller-supplied dimensions.
    pub fn new(dims: &[u32]) -> Self {
        assert!(
            !dims.is_empty() && dims.len() <= MAX_NUM_DIMENSIONS,
            "tensor rank must be between 1 and {MAX_NUM_DIMENSIONS}, got {}",
            dims.len()
        );
        Self {
            dims: SmallVec::from_slice(dims),
        }
    }

    pub fn try_new(dims: &[u32]) -> Result<Self, String> {
        if dims.is_empty() || dims.len() > MAX_NUM_DIMENSIONS {
            return Err(format!(
                "tensor rank must be between 1 and {MAX_NUM_DIMENSIONS}, got {}",
                dims.len()
            ));
        }
        Ok(Self {
            dims: SmallVec::from_slice(dims),
        })
    }

    pub fn dims(&self) -> &[u32] {
        &self.dims
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn dim(&self, axis: usize) -> u32 {
        self.dims[axis]
    }

    pub fn num_elements(&self) -> usize {
        self.dims.iter().map(|&d| d as usize).product()
    }

    pub fn with_dim(&self, axis: usize, value: u32) -> Self {
        let mut dims = self.dims.clone();
        dims[axis] = value;
        Self { dims }
    }

    /// Row-major element strides.
    pub fn strides(&self) -> SmallVec<[usize; MAX_NUM_DIMENSIONS]> {
        let mut strides: SmallVec<[usize; MAX_NUM_DIMENSIONS]> =
            SmallVec::from_elem(1, self.rank());
        for axis in (0..self.rank().saturating_sub(1)).rev() {
            strides[axis] = strides[axis + 1] * self.dims[axis + 1] as usize;
        }
        strides
    }

    /// Compares shapes after dropping leading unit dimensions from the longer one.
    pub fn matches_expanded(&self, other: &TensorShape) -> bool {
        if self.rank() == other.rank() {
            return self == other;
        }
        let (long, short) = if self.rank() > other.rank() {
            (self, other)
        } else {
            (other, self)
        };
        let extra = long.rank() - short.rank();
        long.dims[..extra].iter().all(|&d| d == 1) && long.dims[extra..] == short.dims[..]
    }
}

impl std::fmt::Display for TensorShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("[")?;
        for (i, dim) in self.dims.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{dim}")?;
        }
        f.write_str("]")
    }
}

impl From<&[u32]> for TensorShape {
    fn from(dims: &[u32]) -> Self {
        TensorShape::new(dims)
    }
}

impl<const N: usize> From<[u32; N]> for TensorShape {
    fn from(dims: [u32; N]) -> Self {
        TensorShape::new(&dims)
    }
}
