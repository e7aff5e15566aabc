//! Per-layer parameter blocks.

use std::any::Any;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::layout::DataLayout;
use crate::tensor::{ConstTensor, TensorShape};

/// Identifies a network input or output binding.
pub type LayerBindingId = i32;

#[derive(Debug, Clone, PartialEq)]
pub struct Convolution2dDescriptor {
    pub pad_left: u32,
    pub pad_right: u32,
    pub pad_top: u32,
    pub pad_bottom: u32,
    pub stride_x: u32,
    pub stride_y: u32,
    pub dilation_x: u32,
    pub dilation_y: u32,
    pub data_layout: DataLayout,
    /// `[O, I, kH, kW]` for NCHW, `[O, kH, kW, I]` for NHWC.
    pub weights: ConstTensor,
    pub bias: Option<ConstTensor>,
}

impl Convolution2dDescriptor {
    pub fn new(weights: ConstTensor, data_layout: DataLayout) -> Self {
        Self {
            pad_left: 0,
            pad_right: 0,
            pad_top: 0,
            pad_bottom: 0,
            stride_x: 1,
            stride_y: 1,
            dilation_x: 1,
            dilation_y: 1,
            data_layout,
            weights,
            bias: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DepthwiseConvolution2dDescriptor {
    pub pad_left: u32,
    pub pad_right: u32,
    pub pad_top: u32,
    pub pad_bottom: u32,
    pub stride_x: u32,
    pub stride_y: u32,
    pub dilation_x: u32,
    pub dilation_y: u32,
    pub data_layout: DataLayout,
    /// `[1, kH, kW, I * M]` regardless of data layout.
    pub weights: ConstTensor,
    pub bias: Option<ConstTensor>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolingAlgorithm {
    Max,
    Average,
    L2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputShapeRounding {
    Floor,
    Ceiling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaddingMethod {
    /// Padding cells count towards the averaging window.
    IgnoreValue,
    /// Padding cells are excluded from the averaging window.
    Exclude,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pooling2dDescriptor {
    pub pool_type: PoolingAlgorithm,
    pub pad_left: u32,
    pub pad_right: u32,
    pub pad_top: u32,
    pub pad_bottom: u32,
    pub pool_width: u32,
    pub pool_height: u32,
    pub stride_x: u32,
    pub stride_y: u32,
    pub output_shape_rounding: OutputShapeRounding,
    pub padding_method: PaddingMethod,
    pub data_layout: DataLayout,
}

impl Pooling2dDescriptor {
    pub fn new(pool_type: PoolingAlgorithm, size: u32, stride: u32, data_layout: DataLayout) -> Self {
        Self {
            pool_type,
            pad_left: 0,
            pad_right: 0,
            pad_top: 0,
            pad_bottom: 0,
            pool_width: size,
            pool_height: size,
            stride_x: stride,
            stride_y: stride,
            output_shape_rounding: OutputShapeRounding::Floor,
            padding_method: PaddingMethod::Exclude,
            data_layout,
        }
    }
}

/// Joins `num_inputs` tensors along `axis`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcatDescriptor {
    pub axis: u32,
    pub num_inputs: u32,
}

/// Cuts the input along `axis` into consecutive pieces of the given sizes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitDescriptor {
    pub axis: u32,
    pub sizes: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReshapeDescriptor {
    pub target_shape: TensorShape,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivationFunction {
    ReLu,
    /// `min(a, max(b, x))`
    BoundedReLu,
    Sigmoid,
    TanH,
    /// `a * x + b`
    Linear,
    /// `x > 0 ? x : a * x`
    LeakyReLu,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivationDescriptor {
    pub function: ActivationFunction,
    pub a: f32,
    pub b: f32,
}

impl ActivationDescriptor {
    pub fn new(function: ActivationFunction) -> Self {
        Self {
            function,
            a: 0.0,
            b: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOperation {
    Add,
    Sub,
    Mul,
    Div,
    Maximum,
    Minimum,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementwiseBinaryDescriptor {
    pub operation: BinaryOperation,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchNormalizationDescriptor {
    pub eps: f32,
    pub data_layout: DataLayout,
    pub mean: ConstTensor,
    pub variance: ConstTensor,
    pub beta: ConstTensor,
    pub gamma: ConstTensor,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FullyConnectedDescriptor {
    /// Weights are `[O, K]` when set, `[K, O]` otherwise.
    pub transpose_weight_matrix: bool,
    pub weights: ConstTensor,
    pub bias: Option<ConstTensor>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LstmDescriptor {
    pub num_units: u32,
    pub output_size: u32,
    pub clipping_thres_cell: f32,
    pub clipping_thres_proj: f32,
    pub cifg_enabled: bool,
    pub peephole_enabled: bool,
    pub projection_enabled: bool,
    pub layer_norm_enabled: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectionPostProcessDescriptor {
    pub max_detections: u32,
    pub max_classes_per_detection: u32,
    pub detections_per_class: u32,
    pub nms_score_threshold: f32,
    pub nms_iou_threshold: f32,
    pub num_classes: u32,
    pub use_regular_nms: bool,
    pub scale_x: f32,
    pub scale_y: f32,
    pub scale_w: f32,
    pub scale_h: f32,
    pub anchors: Option<ConstTensor>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermuteDescriptor {
    pub mappings: Vec<u32>,
}

/// Prints the tensor flowing out of `layer_name`'s slot `slot_index`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugDescriptor {
    pub layer_name: String,
    pub slot_index: u32,
    pub to_file: bool,
}

/// Backend-owned compiled object replacing a fused subgraph.
#[derive(Clone)]
pub struct PreCompiledObject(Arc<dyn Any + Send + Sync>);

impl PreCompiledObject {
    pub fn new<T: Any + Send + Sync>(object: T) -> Self {
        Self(Arc::new(object))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }
}

impl std::fmt::Debug for PreCompiledObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PreCompiledObject(..)")
    }
}

impl PartialEq for PreCompiledObject {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PreCompiledDescriptor {
    pub num_inputs: u32,
    pub num_outputs: u32,
    pub object: PreCompiledObject,
    /// Names of the layers the object replaced, in topological order.
    pub fused_layers: Vec<String>,
}
