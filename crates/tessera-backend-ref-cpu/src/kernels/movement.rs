use tessera::backend::{BackendError, BackendResult};
use tessera::graph::{concat_view_origins, split_view_origins, SplitDescriptor};
use tessera::layout::{for_each_region_row, permute_bytes};
use tessera::tensor::TensorInfo;

use super::{check_len, decode_f32, encode_f32};

/// Copies `data` from `input`'s type space into `output`'s, requantizing when they differ.
pub fn convert(input: &TensorInfo, data: &[u8], output: &TensorInfo) -> BackendResult<Vec<u8>> {
    if input.num_elements() != output.num_elements() {
        return Err(BackendError::execution(format!(
            "cannot copy {input} into {output}: element counts differ"
        )));
    }
    check_len(input, data.len())?;
    if input.is_type_space_match(output) {
        return Ok(data.to_vec());
    }
    encode_f32(output, &decode_f32(input, data)?)
}

pub fn permute(input: &TensorInfo, data: &[u8], mappings: &[u32]) -> BackendResult<Vec<u8>> {
    permute_bytes(data, &input.shape, mappings, input.data_type.size_in_bytes())
        .map_err(BackendError::execution)
}

pub fn concat(
    inputs: &[(&TensorInfo, &[u8])],
    output: &TensorInfo,
    axis: u32,
) -> BackendResult<Vec<u8>> {
    let rank = output.shape.rank();
    if axis as usize >= rank {
        return Err(BackendError::execution("concat axis out of range"));
    }
    let shapes: Vec<_> = inputs.iter().map(|(info, _)| info.shape.clone()).collect();
    let total: u32 = shapes.iter().map(|shape| shape.dim(axis as usize)).sum();
    if total != output.shape.dim(axis as usize) {
        return Err(BackendError::execution(
            "concat inputs do not match output axis length",
        ));
    }

    let elem = output.data_type.size_in_bytes();
    let mut out = vec![0u8; output.num_bytes()];
    for ((info, data), origin) in inputs.iter().zip(concat_view_origins(&shapes, axis)) {
        if info.shape.rank() != rank {
            return Err(BackendError::execution("concat rank mismatch"));
        }
        let moved = convert(info, data, &output.with_shape(info.shape.clone()))?;
        for_each_region_row(&output.shape, &info.shape, &origin, |dst, src, len| {
            let (dst, src, len) = (dst * elem, src * elem, len * elem);
            out[dst..dst + len].copy_from_slice(&moved[src..src + len]);
        });
    }
    Ok(out)
}

pub fn split(
    input: &TensorInfo,
    data: &[u8],
    outputs: &[TensorInfo],
    desc: &SplitDescriptor,
) -> BackendResult<Vec<Vec<u8>>> {
    check_len(input, data.len())?;
    if outputs.len() != desc.sizes.len() {
        return Err(BackendError::execution("split output count mismatch"));
    }
    let elem = input.data_type.size_in_bytes();
    let origins = split_view_origins(input.shape.rank(), desc);
    outputs
        .iter()
        .zip(origins)
        .map(|(output, origin)| {
            let mut piece = vec![0u8; output.num_elements() * elem];
            for_each_region_row(&input.shape, &output.shape, &origin, |src, dst, len| {
                let (src, dst, len) = (src * elem, dst * elem, len * elem);
                piece[dst..dst + len].copy_from_slice(&data[src..src + len]);
            });
            convert(&input.with_shape(output.shape.clone()), &piece, output)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera::tensor::{DataType, TensorShape};

    #[test]
    fn concat_interleaves_along_inner_axis() {
        let a = TensorInfo::new([2, 2], DataType::Boolean);
        let b = TensorInfo::new([2, 1], DataType::Boolean);
        let out = TensorInfo::new([2, 3], DataType::Boolean);
        let bytes = concat(&[(&a, &[1, 1, 0, 1]), (&b, &[0, 1])], &out, 1).unwrap();
        assert_eq!(bytes, vec![1, 1, 0, 0, 1, 1]);
    }

    const WIDE: [i32; 6] = [16_777_217, -16_777_219, i32::MAX, i32::MIN, 33_554_435, 7];

    fn wide_bytes(values: &[i32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    #[test]
    fn signed32_moves_without_rounding() {
        let info = TensorInfo::new([2, 3], DataType::Signed32);
        let data = wide_bytes(&WIDE);

        let desc = SplitDescriptor { axis: 1, sizes: vec![1, 2] };
        let outputs = [
            info.with_shape(TensorShape::new(&[2, 1])),
            info.with_shape(TensorShape::new(&[2, 2])),
        ];
        let pieces = split(&info, &data, &outputs, &desc).unwrap();
        assert_eq!(pieces[0], wide_bytes(&[WIDE[0], WIDE[3]]));

        let joined = concat(
            &[(&outputs[0], &pieces[0]), (&outputs[1], &pieces[1])],
            &info,
            1,
        )
        .unwrap();
        assert_eq!(joined, data);

        let transposed = permute(&info, &data, &[1, 0]).unwrap();
        assert_eq!(
            transposed,
            wide_bytes(&[WIDE[0], WIDE[3], WIDE[1], WIDE[4], WIDE[2], WIDE[5]])
        );

        // A scale on one side does not make Signed32 go through f32.
        let scaled = TensorInfo::quantized([2, 3], DataType::Signed32, 0.25, 0);
        assert_eq!(convert(&info, &data, &scaled).unwrap(), data);
    }

    #[test]
    fn split_extracts_consecutive_pieces() {
        let input = TensorInfo::quantized([2, 3], DataType::QAsymmU8, 1.0, 0);
        let outputs = [
            input.with_shape(TensorShape::new(&[2, 1])),
            input.with_shape(TensorShape::new(&[2, 2])),
        ];
        let desc = SplitDescriptor { axis: 1, sizes: vec![1, 2] };
        let pieces = split(&input, &[1, 2, 3, 4, 5, 6], &outputs, &desc).unwrap();
        assert_eq!(pieces, vec![vec![1, 4], vec![2, 3, 5, 6]]);
    }
}
