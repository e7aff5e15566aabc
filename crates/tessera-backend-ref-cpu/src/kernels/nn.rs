use tessera::backend::{BackendError, BackendResult};
use tessera::graph::{
    BatchNormalizationDescriptor, Convolution2dDescriptor, FullyConnectedDescriptor,
    PaddingMethod, Pooling2dDescriptor, PoolingAlgorithm,
};
use tessera::layout::DataLayout;
use tessera::tensor::TensorShape;

use super::decode_f32;

/// Element offsets of a rank-4 activation tensor addressed as `(n, c, h, w)`.
#[derive(Debug, Clone, Copy)]
struct Nchw {
    n: usize,
    c: usize,
    h: usize,
    w: usize,
    strides: [usize; 4],
}

impl Nchw {
    fn new(shape: &TensorShape, layout: DataLayout) -> BackendResult<Self> {
        if shape.rank() != 4 {
            return Err(BackendError::execution(format!(
                "expected a rank 4 tensor, got {shape}"
            )));
        }
        let strides = shape.strides();
        let axes = [0, layout.channels_index(), layout.height_index(), layout.width_index()];
        Ok(Self {
            n: shape.dim(0) as usize,
            c: shape.dim(axes[1]) as usize,
            h: shape.dim(axes[2]) as usize,
            w: shape.dim(axes[3]) as usize,
            strides: axes.map(|axis| strides[axis]),
        })
    }

    fn at(&self, n: usize, c: usize, h: usize, w: usize) -> usize {
        n * self.strides[0] + c * self.strides[1] + h * self.strides[2] + w * self.strides[3]
    }
}

fn channel_axis(shape: &TensorShape, layout: DataLayout) -> usize {
    match layout {
        DataLayout::NCHW => 1.min(shape.rank() - 1),
        DataLayout::NHWC => shape.rank() - 1,
    }
}

pub fn batch_normalization(
    desc: &BatchNormalizationDescriptor,
    shape: &TensorShape,
    values: &[f32],
) -> BackendResult<Vec<f32>> {
    let mean = decode_f32(&desc.mean.info, &desc.mean.data)?;
    let variance = decode_f32(&desc.variance.info, &desc.variance.data)?;
    let beta = decode_f32(&desc.beta.info, &desc.beta.data)?;
    let gamma = decode_f32(&desc.gamma.info, &desc.gamma.data)?;
    let axis = channel_axis(shape, desc.data_layout);
    let stride = shape.strides()[axis];
    let channels = shape.dim(axis) as usize;
    if [mean.len(), variance.len(), beta.len(), gamma.len()]
        .iter()
        .any(|&len| len != channels)
    {
        return Err(BackendError::execution(
            "batch normalization parameters do not match the channel count",
        ));
    }
    Ok(values
        .iter()
        .enumerate()
        .map(|(i, &x)| {
            let c = (i / stride) % channels;
            gamma[c] * (x - mean[c]) / (variance[c] + desc.eps).sqrt() + beta[c]
        })
        .collect())
}

pub fn fully_connected(
    desc: &FullyConnectedDescriptor,
    input: &[f32],
    output: &TensorShape,
) -> BackendResult<Vec<f32>> {
    let weights = decode_f32(&desc.weights.info, &desc.weights.data)?;
    let w_shape = &desc.weights.info.shape;
    let (k, o) = if desc.transpose_weight_matrix {
        (w_shape.dim(1) as usize, w_shape.dim(0) as usize)
    } else {
        (w_shape.dim(0) as usize, w_shape.dim(1) as usize)
    };
    if k == 0 || input.len() % k != 0 || output.num_elements() != input.len() / k * o {
        return Err(BackendError::execution(
            "fully connected operands have inconsistent sizes",
        ));
    }
    let bias = match &desc.bias {
        Some(bias) => decode_f32(&bias.info, &bias.data)?,
        None => vec![0.0; o],
    };
    let rows = input.len() / k;
    let mut out = vec![0.0f32; rows * o];
    for row in 0..rows {
        for col in 0..o {
            let mut acc = bias[col];
            for kk in 0..k {
                let w = if desc.transpose_weight_matrix {
                    weights[col * k + kk]
                } else {
                    weights[kk * o + col]
                };
                acc += input[row * k + kk] * w;
            }
            out[row * o + col] = acc;
        }
    }
    Ok(out)
}

pub fn pooling2d(
    desc: &Pooling2dDescriptor,
    input_shape: &TensorShape,
    input: &[f32],
    output_shape: &TensorShape,
) -> BackendResult<Vec<f32>> {
    let src = Nchw::new(input_shape, desc.data_layout)?;
    let dst = Nchw::new(output_shape, desc.data_layout)?;
    let padded_h = (src.h + (desc.pad_top + desc.pad_bottom) as usize) as isize;
    let padded_w = (src.w + (desc.pad_left + desc.pad_right) as usize) as isize;
    let mut out = vec![0.0f32; output_shape.num_elements()];
    for n in 0..dst.n {
        for c in 0..dst.c {
            for oy in 0..dst.h {
                for ox in 0..dst.w {
                    let y0 = (oy * desc.stride_y as usize) as isize - desc.pad_top as isize;
                    let x0 = (ox * desc.stride_x as usize) as isize - desc.pad_left as isize;
                    let y1 = (y0 + desc.pool_height as isize).min(padded_h - desc.pad_top as isize);
                    let x1 = (x0 + desc.pool_width as isize).min(padded_w - desc.pad_left as isize);
                    let mut max = f32::NEG_INFINITY;
                    let mut sum = 0.0f32;
                    let mut sum_sq = 0.0f32;
                    let mut valid = 0usize;
                    for y in y0.max(0)..y1.min(src.h as isize) {
                        for x in x0.max(0)..x1.min(src.w as isize) {
                            let v = input[src.at(n, c, y as usize, x as usize)];
                            max = max.max(v);
                            sum += v;
                            sum_sq += v * v;
                            valid += 1;
                        }
                    }
                    let count = match desc.padding_method {
                        PaddingMethod::Exclude => valid,
                        PaddingMethod::IgnoreValue => ((y1 - y0) * (x1 - x0)).max(0) as usize,
                    }
                    .max(1);
                    out[dst.at(n, c, oy, ox)] = match desc.pool_type {
                        PoolingAlgorithm::Max => max,
                        PoolingAlgorithm::Average => sum / count as f32,
                        PoolingAlgorithm::L2 => (sum_sq / count as f32).sqrt(),
                    };
                }
            }
        }
    }
    Ok(out)
}

pub fn convolution2d(
    desc: &Convolution2dDescriptor,
    input_shape: &TensorShape,
    input: &[f32],
    output_shape: &TensorShape,
) -> BackendResult<Vec<f32>> {
    let layout = desc.data_layout;
    let src = Nchw::new(input_shape, layout)?;
    let dst = Nchw::new(output_shape, layout)?;
    // Weights are [O, I, kH, kW] or [O, kH, kW, I], the same axis order as the input.
    let kernel = Nchw::new(&desc.weights.info.shape, layout)?;
    let weights = decode_f32(&desc.weights.info, &desc.weights.data)?;
    if kernel.c != src.c || kernel.n != dst.c {
        return Err(BackendError::execution(
            "convolution weights do not match the input and output channels",
        ));
    }
    let bias = match &desc.bias {
        Some(bias) => decode_f32(&bias.info, &bias.data)?,
        None => vec![0.0; dst.c],
    };
    let mut out = vec![0.0f32; output_shape.num_elements()];
    for n in 0..dst.n {
        for o in 0..dst.c {
            for oy in 0..dst.h {
                for ox in 0..dst.w {
                    let mut acc = bias[o];
                    for i in 0..src.c {
                        for ky in 0..kernel.h {
                            let y = (oy * desc.stride_y as usize + ky * desc.dilation_y as usize)
                                as isize
                                - desc.pad_top as isize;
                            if y < 0 || y >= src.h as isize {
                                continue;
                            }
                            for kx in 0..kernel.w {
                                let x = (ox * desc.stride_x as usize
                                    + kx * desc.dilation_x as usize)
                                    as isize
                                    - desc.pad_left as isize;
                                if x < 0 || x >= src.w as isize {
                                    continue;
                                }
                                acc += input[src.at(n, i, y as usize, x as usize)]
                                    * weights[kernel.at(o, i, ky, kx)];
                            }
                        }
                    }
                    out[dst.at(n, o, oy, ox)] = acc;
                }
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera::tensor::{ConstTensor, DataType, TensorInfo};

    #[test]
    fn max_and_average_pooling_over_2x2_windows() {
        let shape = TensorShape::new(&[1, 1, 2, 4]);
        let out_shape = TensorShape::new(&[1, 1, 1, 2]);
        let input = [1.0, 2.0, 5.0, 6.0, 3.0, 4.0, 7.0, 8.0];
        let max = Pooling2dDescriptor::new(PoolingAlgorithm::Max, 2, 2, DataLayout::NCHW);
        assert_eq!(pooling2d(&max, &shape, &input, &out_shape).unwrap(), vec![4.0, 8.0]);
        let avg = Pooling2dDescriptor::new(PoolingAlgorithm::Average, 2, 2, DataLayout::NCHW);
        assert_eq!(pooling2d(&avg, &shape, &input, &out_shape).unwrap(), vec![2.5, 6.5]);
    }

    #[test]
    fn one_by_one_convolution_mixes_channels() {
        let weights = ConstTensor::from_elements(
            TensorInfo::new([1, 2, 1, 1], DataType::Float32),
            &[1.0f32, 10.0],
        )
        .unwrap();
        let desc = Convolution2dDescriptor::new(weights, DataLayout::NCHW);
        let input = [1.0, 2.0, 3.0, 4.0];
        let out = convolution2d(
            &desc,
            &TensorShape::new(&[1, 2, 1, 2]),
            &input,
            &TensorShape::new(&[1, 1, 1, 2]),
        )
        .unwrap();
        assert_eq!(out, vec![31.0, 42.0]);
    }

    #[test]
    fn fully_connected_honours_weight_orientation() {
        let weights = ConstTensor::from_elements(
            TensorInfo::new([2, 1], DataType::Float32),
            &[2.0f32, 3.0],
        )
        .unwrap();
        let desc = FullyConnectedDescriptor {
            transpose_weight_matrix: false,
            weights,
            bias: None,
        };
        let out = fully_connected(&desc, &[1.0, 1.0, 2.0, 0.0], &TensorShape::new(&[2, 1])).unwrap();
        assert_eq!(out, vec![5.0, 4.0]);
    }
}
