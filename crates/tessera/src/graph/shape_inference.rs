//! Output tensor info inference, one rule per layer type.

use serde::{Deserialize, Serialize};

use super::descriptors::*;
use super::graph::Graph;
use super::layer::{LayerParams, LayerType, OutputSlotId};
use crate::error::{Error, Result};
use crate::layout::{permute_shape, DataLayout};
use crate::tensor::{DataType, TensorInfo, TensorShape};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ShapeInferenceMethod {
    /// Every output slot must already carry an info; inferred shapes are only compared.
    ValidateOnly,
    /// Missing infos are filled in, existing ones are validated.
    #[default]
    InferAndValidate,
}

type RuleResult = std::result::Result<Vec<TensorInfo>, String>;

fn same_as_input(inputs: &[TensorInfo]) -> RuleResult {
    Ok(vec![inputs[0].clone()])
}

fn require_rank(info: &TensorInfo, rank: usize, what: &str) -> std::result::Result<(), String> {
    if info.shape.rank() != rank {
        return Err(format!(
            "{what} must have rank {rank}, got shape {}",
            info.shape
        ));
    }
    Ok(())
}

fn window_extent(
    input: u32,
    pad_before: u32,
    pad_after: u32,
    kernel: u32,
    dilation: u32,
    stride: u32,
    ceil: bool,
) -> std::result::Result<u32, String> {
    if stride == 0 {
        return Err("stride must be positive".into());
    }
    if kernel == 0 {
        return Err("window size must be positive".into());
    }
    let dilated = (kernel - 1)
        .checked_mul(dilation.max(1))
        .and_then(|extent| extent.checked_add(1))
        .ok_or_else(|| format!("dilated window of size {kernel} overflows"))?;
    let padded = input
        .checked_add(pad_before)
        .and_then(|extent| extent.checked_add(pad_after))
        .ok_or_else(|| format!("padded input extent {input}+{pad_before}+{pad_after} overflows"))?;
    if padded < dilated {
        return Err(format!(
            "window of extent {dilated} does not fit padded input extent {padded}"
        ));
    }
    let span = padded - dilated;
    let steps = if ceil { span.div_ceil(stride) } else { span / stride };
    Ok(steps + 1)
}

fn spatial_output(
    input: &TensorInfo,
    layout: DataLayout,
    channels: u32,
    height: u32,
    width: u32,
) -> TensorInfo {
    let mut dims = [0u32; 4];
    dims[0] = input.shape.dim(0);
    dims[layout.channels_index()] = channels;
    dims[layout.height_index()] = height;
    dims[layout.width_index()] = width;
    input.with_shape(TensorShape::new(&dims))
}

fn check_bias(bias: &Option<crate::tensor::ConstTensor>, channels: u32) -> std::result::Result<(), String> {
    if let Some(bias) = bias {
        if bias.info.num_elements() != channels as usize {
            return Err(format!(
                "bias holds {} values, expected {channels}",
                bias.info.num_elements()
            ));
        }
    }
    Ok(())
}

fn convolution2d(desc: &Convolution2dDescriptor, inputs: &[TensorInfo]) -> RuleResult {
    let input = &inputs[0];
    let weights = &desc.weights.info;
    require_rank(input, 4, "convolution input")?;
    require_rank(weights, 4, "convolution weights")?;
    let layout = desc.data_layout;
    let in_channels = input.shape.dim(layout.channels_index());
    if weights.shape.dim(layout.channels_index()) != in_channels {
        return Err(format!(
            "weights {} expect {} input channels, input {} has {in_channels}",
            weights.shape,
            weights.shape.dim(layout.channels_index()),
            input.shape
        ));
    }
    let out_channels = weights.shape.dim(0);
    check_bias(&desc.bias, out_channels)?;
    let height = window_extent(
        input.shape.dim(layout.height_index()),
        desc.pad_top,
        desc.pad_bottom,
        weights.shape.dim(layout.height_index()),
        desc.dilation_y,
        desc.stride_y,
        false,
    )?;
    let width = window_extent(
        input.shape.dim(layout.width_index()),
        desc.pad_left,
        desc.pad_right,
        weights.shape.dim(layout.width_index()),
        desc.dilation_x,
        desc.stride_x,
        false,
    )?;
    Ok(vec![spatial_output(input, layout, out_channels, height, width)])
}

fn depthwise_convolution2d(desc: &DepthwiseConvolution2dDescriptor, inputs: &[TensorInfo]) -> RuleResult {
    let input = &inputs[0];
    let weights = &desc.weights.info;
    require_rank(input, 4, "depthwise convolution input")?;
    require_rank(weights, 4, "depthwise convolution weights")?;
    let layout = desc.data_layout;
    let in_channels = input.shape.dim(layout.channels_index());
    let out_channels = weights.shape.dim(3);
    if weights.shape.dim(0) != 1 || out_channels % in_channels != 0 {
        return Err(format!(
            "depthwise weights {} are incompatible with {in_channels} input channels",
            weights.shape
        ));
    }
    check_bias(&desc.bias, out_channels)?;
    let height = window_extent(
        input.shape.dim(layout.height_index()),
        desc.pad_top,
        desc.pad_bottom,
        weights.shape.dim(1),
        desc.dilation_y,
        desc.stride_y,
        false,
    )?;
    let width = window_extent(
        input.shape.dim(layout.width_index()),
        desc.pad_left,
        desc.pad_right,
        weights.shape.dim(2),
        desc.dilation_x,
        desc.stride_x,
        false,
    )?;
    Ok(vec![spatial_output(input, layout, out_channels, height, width)])
}

fn pooling2d(desc: &Pooling2dDescriptor, inputs: &[TensorInfo]) -> RuleResult {
    let input = &inputs[0];
    require_rank(input, 4, "pooling input")?;
    let layout = desc.data_layout;
    let ceil = desc.output_shape_rounding == OutputShapeRounding::Ceiling;
    let height = window_extent(
        input.shape.dim(layout.height_index()),
        desc.pad_top,
        desc.pad_bottom,
        desc.pool_height,
        1,
        desc.stride_y,
        ceil,
    )?;
    let width = window_extent(
        input.shape.dim(layout.width_index()),
        desc.pad_left,
        desc.pad_right,
        desc.pool_width,
        1,
        desc.stride_x,
        ceil,
    )?;
    let channels = input.shape.dim(layout.channels_index());
    Ok(vec![spatial_output(input, layout, channels, height, width)])
}

fn batch_normalization(desc: &BatchNormalizationDescriptor, inputs: &[TensorInfo]) -> RuleResult {
    let input = &inputs[0];
    require_rank(input, 4, "batch normalization input")?;
    let channels = input.shape.dim(desc.data_layout.channels_index()) as usize;
    for (name, tensor) in [
        ("mean", &desc.mean),
        ("variance", &desc.variance),
        ("beta", &desc.beta),
        ("gamma", &desc.gamma),
    ] {
        if tensor.info.num_elements() != channels {
            return Err(format!(
                "{name} holds {} values, expected {channels}",
                tensor.info.num_elements()
            ));
        }
    }
    same_as_input(inputs)
}

fn fully_connected(desc: &FullyConnectedDescriptor, inputs: &[TensorInfo]) -> RuleResult {
    let input = &inputs[0];
    let weights = &desc.weights.info;
    require_rank(weights, 2, "fully connected weights")?;
    let (k, o) = if desc.transpose_weight_matrix {
        (weights.shape.dim(1), weights.shape.dim(0))
    } else {
        (weights.shape.dim(0), weights.shape.dim(1))
    };
    let total = input.num_elements();
    if k == 0 || total % k as usize != 0 {
        return Err(format!(
            "input {} cannot be flattened into rows of {k}",
            input.shape
        ));
    }
    check_bias(&desc.bias, o)?;
    let batch = (total / k as usize) as u32;
    Ok(vec![input.with_shape(TensorShape::new(&[batch, o]))])
}

fn lstm(desc: &LstmDescriptor, inputs: &[TensorInfo]) -> RuleResult {
    let input = &inputs[0];
    require_rank(input, 2, "lstm input")?;
    require_rank(&inputs[1], 2, "lstm output state")?;
    require_rank(&inputs[2], 2, "lstm cell state")?;
    let batch = input.shape.dim(0);
    if inputs[1].shape.dims() != [batch, desc.output_size] {
        return Err(format!(
            "output state {} must be [{batch}, {}]",
            inputs[1].shape, desc.output_size
        ));
    }
    if inputs[2].shape.dims() != [batch, desc.num_units] {
        return Err(format!(
            "cell state {} must be [{batch}, {}]",
            inputs[2].shape, desc.num_units
        ));
    }
    let gates = if desc.cifg_enabled { 3 } else { 4 };
    let scratch = desc
        .num_units
        .checked_mul(gates)
        .ok_or_else(|| format!("lstm scratch width for {} units overflows", desc.num_units))?;
    Ok(vec![
        input.with_shape(TensorShape::new(&[batch, scratch])),
        input.with_shape(TensorShape::new(&[batch, desc.output_size])),
        input.with_shape(TensorShape::new(&[batch, desc.num_units])),
        input.with_shape(TensorShape::new(&[batch, desc.output_size])),
    ])
}

fn detection_post_process(desc: &DetectionPostProcessDescriptor, inputs: &[TensorInfo]) -> RuleResult {
    let boxes = &inputs[0];
    let scores = &inputs[1];
    require_rank(boxes, 3, "box encodings")?;
    require_rank(scores, 3, "scores")?;
    if boxes.shape.dim(2) != 4 {
        return Err(format!("box encodings {} must end in 4", boxes.shape));
    }
    if scores.shape.dim(1) != boxes.shape.dim(1) {
        return Err(format!(
            "scores {} and box encodings {} disagree on the anchor count",
            scores.shape, boxes.shape
        ));
    }
    if scores.shape.dim(2) < desc.num_classes {
        return Err(format!(
            "scores {} hold fewer than {} classes",
            scores.shape, desc.num_classes
        ));
    }
    if let Some(anchors) = &desc.anchors {
        if anchors.info.shape.dims() != [boxes.shape.dim(1), 4] {
            return Err(format!(
                "anchors {} must be [{}, 4]",
                anchors.info.shape,
                boxes.shape.dim(1)
            ));
        }
    }
    if desc.max_detections == 0 {
        return Err("max_detections must be positive".into());
    }
    let max = desc.max_detections;
    Ok(vec![
        TensorInfo::new([1, max, 4], DataType::Float32),
        TensorInfo::new([1, max], DataType::Float32),
        TensorInfo::new([1, max], DataType::Float32),
        TensorInfo::new([1], DataType::Float32),
    ])
}

fn concat(desc: &ConcatDescriptor, inputs: &[TensorInfo]) -> RuleResult {
    let first = inputs
        .first()
        .ok_or_else(|| "concat needs at least one input".to_string())?;
    let axis = desc.axis as usize;
    if axis >= first.shape.rank() {
        return Err(format!("concat axis {axis} out of range for {}", first.shape));
    }
    let mut extent = 0u32;
    for info in inputs {
        if info.shape.rank() != first.shape.rank() {
            return Err(format!(
                "concat inputs differ in rank: {} vs {}",
                first.shape, info.shape
            ));
        }
        for d in 0..first.shape.rank() {
            if d != axis && info.shape.dim(d) != first.shape.dim(d) {
                return Err(format!(
                    "concat inputs {} and {} differ outside axis {axis}",
                    first.shape, info.shape
                ));
            }
        }
        if info.data_type != first.data_type {
            return Err(format!(
                "concat inputs mix {} and {}",
                first.data_type, info.data_type
            ));
        }
        extent = extent
            .checked_add(info.shape.dim(axis))
            .ok_or_else(|| format!("concat extent along axis {axis} overflows"))?;
    }
    Ok(vec![first.with_shape(first.shape.with_dim(axis, extent))])
}

fn split(desc: &SplitDescriptor, inputs: &[TensorInfo]) -> RuleResult {
    let input = &inputs[0];
    let axis = desc.axis as usize;
    if axis >= input.shape.rank() {
        return Err(format!("split axis {axis} out of range for {}", input.shape));
    }
    if desc.sizes.iter().any(|&s| s == 0) {
        return Err("split sizes must be positive".into());
    }
    let total = desc
        .sizes
        .iter()
        .try_fold(0u32, |total, &size| total.checked_add(size))
        .ok_or_else(|| "split sizes overflow".to_string())?;
    if total != input.shape.dim(axis) {
        return Err(format!(
            "split sizes {:?} do not cover extent {} of {}",
            desc.sizes,
            input.shape.dim(axis),
            input.shape
        ));
    }
    Ok(desc
        .sizes
        .iter()
        .map(|&size| input.with_shape(input.shape.with_dim(axis, size)))
        .collect())
}

fn reshape(desc: &ReshapeDescriptor, inputs: &[TensorInfo]) -> RuleResult {
    let input = &inputs[0];
    if desc.target_shape.num_elements() != input.num_elements() {
        return Err(format!(
            "cannot reshape {} into {}",
            input.shape, desc.target_shape
        ));
    }
    Ok(vec![input.with_shape(desc.target_shape.clone())])
}

/// Right-aligned broadcast of two shapes.
pub fn broadcast_shapes(a: &TensorShape, b: &TensorShape) -> std::result::Result<TensorShape, String> {
    let rank = a.rank().max(b.rank());
    let mut dims = vec![0u32; rank];
    for i in 0..rank {
        let da = if i + a.rank() >= rank { a.dim(i + a.rank() - rank) } else { 1 };
        let db = if i + b.rank() >= rank { b.dim(i + b.rank() - rank) } else { 1 };
        dims[i] = match (da, db) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            _ => return Err(format!("shapes {a} and {b} cannot be broadcast")),
        };
    }
    TensorShape::try_new(&dims)
}

fn elementwise_binary(inputs: &[TensorInfo]) -> RuleResult {
    if inputs[0].data_type != inputs[1].data_type {
        return Err(format!(
            "elementwise operands mix {} and {}",
            inputs[0].data_type, inputs[1].data_type
        ));
    }
    let shape = broadcast_shapes(&inputs[0].shape, &inputs[1].shape)?;
    Ok(vec![inputs[0].with_shape(shape)])
}

fn convert(inputs: &[TensorInfo], from: DataType, to: DataType) -> RuleResult {
    if inputs[0].data_type != from {
        return Err(format!(
            "conversion expects {from} input, got {}",
            inputs[0].data_type
        ));
    }
    Ok(vec![inputs[0].with_data_type(to)])
}

/// Output infos a layer produces for the given input infos.
///
/// Quantization parameters of the outputs default to those of input 0.
pub fn infer_output_infos(
    params: &LayerParams,
    inputs: &[TensorInfo],
) -> std::result::Result<Vec<TensorInfo>, String> {
    if inputs.len() != params.num_inputs() {
        return Err(format!(
            "expected {} inputs, got {}",
            params.num_inputs(),
            inputs.len()
        ));
    }
    match params {
        LayerParams::Input(_) => Err("input layers take their info from the caller".into()),
        LayerParams::Output(_) => Ok(Vec::new()),
        LayerParams::Convolution2d(desc) => convolution2d(desc, inputs),
        LayerParams::DepthwiseConvolution2d(desc) => depthwise_convolution2d(desc, inputs),
        LayerParams::Pooling2d(desc) => pooling2d(desc, inputs),
        LayerParams::Concat(desc) => concat(desc, inputs),
        LayerParams::Split(desc) => split(desc, inputs),
        LayerParams::Reshape(desc) => reshape(desc, inputs),
        LayerParams::Activation(_) | LayerParams::Debug(_) | LayerParams::MemCopy => {
            same_as_input(inputs)
        }
        LayerParams::ElementwiseBinary(_) => elementwise_binary(inputs),
        LayerParams::BatchNormalization(desc) => batch_normalization(desc, inputs),
        LayerParams::FullyConnected(desc) => fully_connected(desc, inputs),
        LayerParams::Lstm(desc) => lstm(desc, inputs),
        LayerParams::DetectionPostProcess(desc) => detection_post_process(desc, inputs),
        LayerParams::PreCompiled(_) => {
            Err("precompiled layers carry their own output infos".into())
        }
        LayerParams::Permute(desc) => {
            let shape = permute_shape(&inputs[0].shape, &desc.mappings)?;
            Ok(vec![inputs[0].with_shape(shape)])
        }
        LayerParams::ConvertFp32ToFp16 => convert(inputs, DataType::Float32, DataType::Float16),
        LayerParams::ConvertFp16ToFp32 => convert(inputs, DataType::Float16, DataType::Float32),
    }
}

/// Origin of each input inside the concatenated output: running offsets along `axis`.
///
/// `shapes` must already have passed concat inference, so every offset fits in `u32`.
pub fn concat_view_origins(shapes: &[TensorShape], axis: u32) -> Vec<Vec<u32>> {
    let mut offset = 0u32;
    shapes
        .iter()
        .map(|shape| {
            let mut origin = vec![0u32; shape.rank()];
            origin[axis as usize] = offset;
            offset += shape.dim(axis as usize);
            origin
        })
        .collect()
}

/// Origin of each split output inside the split input.
pub fn split_view_origins(rank: usize, desc: &SplitDescriptor) -> Vec<Vec<u32>> {
    let mut offset = 0u32;
    desc.sizes
        .iter()
        .map(|&size| {
            let mut origin = vec![0u32; rank];
            origin[desc.axis as usize] = offset;
            offset += size;
            origin
        })
        .collect()
}

impl Graph {
    /// Walks the graph in topological order and infers or validates every output info.
    pub fn infer_tensor_infos(
        &mut self,
        method: ShapeInferenceMethod,
        allow_expanded_dims: bool,
    ) -> Result<()> {
        let order = self.topological_order()?.to_vec();
        for id in order {
            let layer = self.require(id)?;
            let name = layer.name().to_string();
            match layer.layer_type() {
                LayerType::Input => {
                    if layer.output_info(0).is_none() {
                        return Err(Error::invalid_graph(format!(
                            "input layer '{name}' has no tensor info"
                        )));
                    }
                    continue;
                }
                LayerType::PreCompiled => {
                    self.output_infos(id)?;
                    continue;
                }
                _ => {}
            }
            let inputs = self.input_infos(id)?;
            let inferred = infer_output_infos(layer.params(), &inputs)
                .map_err(|err| Error::invalid_graph(format!("layer '{name}': {err}")))?;
            for (index, inferred) in inferred.into_iter().enumerate() {
                let slot = OutputSlotId::new(id, index as u32);
                match self.tensor_info(slot) {
                    None if method == ShapeInferenceMethod::ValidateOnly => {
                        return Err(Error::invalid_graph(format!(
                            "output slot {index} of '{name}' has no tensor info and inference is disabled"
                        )));
                    }
                    None => self.set_tensor_info(slot, inferred)?,
                    Some(existing) => {
                        let matches = existing.shape == inferred.shape
                            || (allow_expanded_dims
                                && existing.shape.matches_expanded(&inferred.shape));
                        if !matches {
                            return Err(Error::invalid_graph(format!(
                                "layer '{name}' output {index}: declared shape {} does not match inferred shape {}",
                                existing.shape, inferred.shape
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concat_origins_are_running_offsets() {
        let shapes = [
            TensorShape::new(&[1, 6, 2]),
            TensorShape::new(&[1, 6, 1]),
        ];
        assert_eq!(
            concat_view_origins(&shapes, 2),
            vec![vec![0, 0, 0], vec![0, 0, 2]]
        );
    }

    #[test]
    fn pooling_rounding_changes_extent() {
        let input = TensorInfo::new([1, 1, 5, 5], DataType::Float32);
        let mut desc = Pooling2dDescriptor::new(PoolingAlgorithm::Max, 2, 2, DataLayout::NCHW);
        let floor = pooling2d(&desc, std::slice::from_ref(&input)).unwrap();
        assert_eq!(floor[0].shape.dims(), &[1, 1, 2, 2]);
        desc.output_shape_rounding = OutputShapeRounding::Ceiling;
        let ceil = pooling2d(&desc, std::slice::from_ref(&input)).unwrap();
        assert_eq!(ceil[0].shape.dims(), &[1, 1, 3, 3]);
    }

    #[test]
    fn oversized_padding_is_an_error() {
        let input = TensorInfo::new([1, 1, 5, 5], DataType::Float32);
        let mut desc = Pooling2dDescriptor::new(PoolingAlgorithm::Max, 2, 1, DataLayout::NCHW);
        desc.pad_top = u32::MAX;
        desc.pad_bottom = 1;
        let err = pooling2d(&desc, std::slice::from_ref(&input)).unwrap_err();
        assert!(err.contains("overflows"), "{err}");
    }

    #[test]
    fn concat_and_split_extents_are_bounded() {
        let big = TensorInfo::new([1, u32::MAX - 1], DataType::Float32);
        let small = TensorInfo::new([1, 2], DataType::Float32);
        let desc = ConcatDescriptor {
            axis: 1,
            num_inputs: 2,
        };
        let err = concat(&desc, &[big.clone(), small]).unwrap_err();
        assert!(err.contains("overflows"), "{err}");

        let desc = SplitDescriptor {
            axis: 1,
            sizes: vec![u32::MAX, 2],
        };
        assert!(split(&desc, std::slice::from_ref(&big)).is_err());
    }

    #[test]
    fn broadcast_aligns_from_the_right() {
        let out = broadcast_shapes(&TensorShape::new(&[2, 3, 4]), &TensorShape::new(&[4])).unwrap();
        assert_eq!(out.dims(), &[2, 3, 4]);
        assert!(broadcast_shapes(&TensorShape::new(&[3]), &TensorShape::new(&[4])).is_err());
    }
}
