//! Tensor layout helpers.
//!
//! Layer parameters carry an explicit 4D data layout. Axis permutations use the
//! transpose convention: output axis `i` takes input axis `perm[i]`.

use serde::{Deserialize, Serialize};

use crate::tensor::TensorShape;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataLayout {
    NCHW,
    NHWC,
}

pub const NCHW_TO_NHWC: [u32; 4] = [0, 2, 3, 1];
pub const NHWC_TO_NCHW: [u32; 4] = [0, 3, 1, 2];

impl DataLayout {
    pub const fn channels_index(self) -> usize {
        match self {
            DataLayout::NCHW => 1,
            DataLayout::NHWC => 3,
        }
    }

    pub const fn height_index(self) -> usize {
        match self {
            DataLayout::NCHW => 2,
            DataLayout::NHWC => 1,
        }
    }

    pub const fn width_index(self) -> usize {
        match self {
            DataLayout::NCHW => 3,
            DataLayout::NHWC => 2,
        }
    }

    /// Permutation turning a tensor in `self` layout into `target` layout.
    pub const fn permutation_to(self, target: DataLayout) -> [u32; 4] {
        match (self, target) {
            (DataLayout::NHWC, DataLayout::NCHW) => NHWC_TO_NCHW,
            (DataLayout::NCHW, DataLayout::NHWC) => NCHW_TO_NHWC,
            _ => [0, 1, 2, 3],
        }
    }
}

impl std::fmt::Display for DataLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataLayout::NCHW => f.write_str("NCHW"),
            DataLayout::NHWC => f.write_str("NHWC"),
        }
    }
}

pub fn is_valid_permutation(perm: &[u32]) -> bool {
    let mut seen = vec![false; perm.len()];
    for &axis in perm {
        match seen.get_mut(axis as usize) {
            Some(slot) if !*slot => *slot = true,
            _ => return false,
        }
    }
    true
}

pub fn inverse_permutation(perm: &[u32]) -> Vec<u32> {
    let mut inverse = vec![0u32; perm.len()];
    for (i, &axis) in perm.iter().enumerate() {
        inverse[axis as usize] = i as u32;
    }
    inverse
}

pub fn is_identity_permutation(perm: &[u32]) -> bool {
    perm.iter().enumerate().all(|(i, &axis)| axis as usize == i)
}

pub fn permute_shape(shape: &TensorShape, perm: &[u32]) -> Result<TensorShape, String> {
    if perm.len() != shape.rank() || !is_valid_permutation(perm) {
        return Err(format!(
            "permutation {perm:?} is not valid for shape {shape}"
        ));
    }
    let dims: Vec<u32> = perm.iter().map(|&axis| shape.dim(axis as usize)).collect();
    TensorShape::try_new(&dims)
}

/// Reorders a dense row-major buffer. `shape` is the input shape.
pub fn permute_bytes(
    src: &[u8],
    shape: &TensorShape,
    perm: &[u32],
    element_size: usize,
) -> Result<Vec<u8>, String> {
    let out_shape = permute_shape(shape, perm)?;
    let expected = shape.num_elements() * element_size;
    if src.len() != expected {
        return Err(format!(
            "permute source holds {} bytes, expected {expected}",
            src.len()
        ));
    }
    let in_strides = shape.strides();
    let src_strides: Vec<usize> = perm.iter().map(|&axis| in_strides[axis as usize]).collect();
    let out_dims = out_shape.dims();
    let mut out = vec![0u8; expected];
    let mut coord = vec![0u32; out_dims.len()];
    for dst_elem in 0..out_shape.num_elements() {
        let src_elem: usize = coord
            .iter()
            .zip(&src_strides)
            .map(|(&c, &stride)| c as usize * stride)
            .sum();
        let dst = dst_elem * element_size;
        let src_off = src_elem * element_size;
        out[dst..dst + element_size].copy_from_slice(&src[src_off..src_off + element_size]);
        for axis in (0..coord.len()).rev() {
            coord[axis] += 1;
            if coord[axis] < out_dims[axis] {
                break;
            }
            coord[axis] = 0;
        }
    }
    Ok(out)
}

/// Visits every innermost-axis row of a box `region` placed at `origin` inside `outer`.
///
/// The callback receives the row's element offset in `outer`, its element offset in the
/// dense region and the row length in elements.
pub fn for_each_region_row(
    outer: &TensorShape,
    region: &TensorShape,
    origin: &[u32],
    mut visit: impl FnMut(usize, usize, usize),
) {
    let rank = outer.rank();
    let outer_strides = outer.strides();
    let row_len = region.dim(rank - 1) as usize;
    let rows = region.num_elements() / row_len.max(1);
    let mut coord = vec![0u32; rank.saturating_sub(1)];
    for row in 0..rows {
        let mut outer_offset = origin[rank - 1] as usize;
        for (axis, &c) in coord.iter().enumerate() {
            outer_offset += (origin[axis] + c) as usize * outer_strides[axis];
        }
        visit(outer_offset, row * row_len, row_len);
        for axis in (0..coord.len()).rev() {
            coord[axis] += 1;
            if coord[axis] < region.dim(axis) {
                break;
            }
            coord[axis] = 0;
        }
    }
}

/// True when a box of `region` at `origin` lies inside `outer`.
pub fn region_fits(outer: &TensorShape, region: &TensorShape, origin: &[u32]) -> bool {
    outer.rank() == region.rank()
        && origin.len() == outer.rank()
        && (0..outer.rank()).all(|axis| {
            u64::from(origin[axis]) + u64::from(region.dim(axis)) <= u64::from(outer.dim(axis))
        })
}

/// True when two boxes share at least one element.
pub fn regions_overlap(
    a_shape: &TensorShape,
    a_origin: &[u32],
    b_shape: &TensorShape,
    b_origin: &[u32],
) -> bool {
    (0..a_shape.rank()).all(|axis| {
        let (a_start, b_start) = (u64::from(a_origin[axis]), u64::from(b_origin[axis]));
        let a_end = a_start + u64::from(a_shape.dim(axis));
        let b_end = b_start + u64::from(b_shape.dim(axis));
        a_start < b_end && b_start < a_end
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn nhwc_to_nchw_moves_channels_forward() {
        let shape = TensorShape::new(&[1, 4, 5, 3]);
        let permuted = permute_shape(&shape, &NHWC_TO_NCHW).unwrap();
        assert_eq!(permuted.dims(), &[1, 3, 4, 5]);
        assert_eq!(inverse_permutation(&NHWC_TO_NCHW), NCHW_TO_NHWC.to_vec());
    }

    #[test]
    fn permute_bytes_transposes_matrix() {
        let shape = TensorShape::new(&[2, 3]);
        let src: Vec<u8> = (0..6).collect();
        let out = permute_bytes(&src, &shape, &[1, 0], 1).unwrap();
        assert_eq!(out, vec![0, 3, 1, 4, 2, 5]);
    }

    #[test]
    fn region_rows_cover_the_box() {
        let outer = TensorShape::new(&[1, 6, 3]);
        let region = TensorShape::new(&[1, 6, 1]);
        let mut offsets = Vec::new();
        for_each_region_row(&outer, &region, &[0, 0, 2], |o, _, len| {
            assert_eq!(len, 1);
            offsets.push(o);
        });
        assert_eq!(offsets, vec![2, 5, 8, 11, 14, 17]);
    }

    #[test]
    fn overlapping_boxes_are_detected() {
        let a = TensorShape::new(&[1, 2]);
        assert!(regions_overlap(&a, &[0, 0], &a, &[0, 1]));
        assert!(!regions_overlap(&a, &[0, 0], &a, &[0, 2]));
        assert!(!regions_overlap(&a, &[0, u32::MAX], &a, &[0, 0]));
        assert!(!region_fits(&TensorShape::new(&[1, 3]), &a, &[0, u32::MAX]));
    }

    proptest! {
        #[test]
        fn layout_round_trip_restores_buffer(
            n in 1u32..3, h in 1u32..5, w in 1u32..5, c in 1u32..5,
        ) {
            let shape = TensorShape::new(&[n, h, w, c]);
            let src: Vec<u8> = (0..shape.num_elements()).map(|i| (i % 251) as u8).collect();
            let nchw = permute_bytes(&src, &shape, &NHWC_TO_NCHW, 1).unwrap();
            let nchw_shape = permute_shape(&shape, &NHWC_TO_NCHW).unwrap();
            let back = permute_bytes(&nchw, &nchw_shape, &NCHW_TO_NHWC, 1).unwrap();
            prop_assert_eq!(back, src);
        }
    }
}
