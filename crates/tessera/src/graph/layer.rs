use serde::{Deserialize, Serialize};

use super::descriptors::*;
use crate::backend::BackendId;
use crate::layout::DataLayout;
use crate::tensor::TensorInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LayerId(pub(crate) u32);

impl LayerId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for LayerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutputSlotId {
    pub layer: LayerId,
    pub index: u32,
}

impl OutputSlotId {
    pub fn new(layer: LayerId, index: u32) -> Self {
        Self { layer, index }
    }
}

impl std::fmt::Display for OutputSlotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:out{}", self.layer, self.index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InputSlotId {
    pub layer: LayerId,
    pub index: u32,
}

impl InputSlotId {
    pub fn new(layer: LayerId, index: u32) -> Self {
        Self { layer, index }
    }
}

impl std::fmt::Display for InputSlotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:in{}", self.layer, self.index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LayerType {
    Input,
    Output,
    Convolution2d,
    DepthwiseConvolution2d,
    Pooling2d,
    Concat,
    Split,
    Reshape,
    Activation,
    ElementwiseBinary,
    BatchNormalization,
    FullyConnected,
    Lstm,
    DetectionPostProcess,
    PreCompiled,
    Debug,
    Permute,
    MemCopy,
    ConvertFp32ToFp16,
    ConvertFp16ToFp32,
}

impl std::fmt::Display for LayerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Closed set of layer kinds with their parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum LayerParams {
    Input(LayerBindingId),
    Output(LayerBindingId),
    Convolution2d(Convolution2dDescriptor),
    DepthwiseConvolution2d(DepthwiseConvolution2dDescriptor),
    Pooling2d(Pooling2dDescriptor),
    Concat(ConcatDescriptor),
    Split(SplitDescriptor),
    Reshape(ReshapeDescriptor),
    Activation(ActivationDescriptor),
    ElementwiseBinary(ElementwiseBinaryDescriptor),
    BatchNormalization(BatchNormalizationDescriptor),
    FullyConnected(FullyConnectedDescriptor),
    Lstm(LstmDescriptor),
    DetectionPostProcess(DetectionPostProcessDescriptor),
    PreCompiled(PreCompiledDescriptor),
    Debug(DebugDescriptor),
    Permute(PermuteDescriptor),
    MemCopy,
    ConvertFp32ToFp16,
    ConvertFp16ToFp32,
}

impl LayerParams {
    pub fn layer_type(&self) -> LayerType {
        match self {
            LayerParams::Input(_) => LayerType::Input,
            LayerParams::Output(_) => LayerType::Output,
            LayerParams::Convolution2d(_) => LayerType::Convolution2d,
            LayerParams::DepthwiseConvolution2d(_) => LayerType::DepthwiseConvolution2d,
            LayerParams::Pooling2d(_) => LayerType::Pooling2d,
            LayerParams::Concat(_) => LayerType::Concat,
            LayerParams::Split(_) => LayerType::Split,
            LayerParams::Reshape(_) => LayerType::Reshape,
            LayerParams::Activation(_) => LayerType::Activation,
            LayerParams::ElementwiseBinary(_) => LayerType::ElementwiseBinary,
            LayerParams::BatchNormalization(_) => LayerType::BatchNormalization,
            LayerParams::FullyConnected(_) => LayerType::FullyConnected,
            LayerParams::Lstm(_) => LayerType::Lstm,
            LayerParams::DetectionPostProcess(_) => LayerType::DetectionPostProcess,
            LayerParams::PreCompiled(_) => LayerType::PreCompiled,
            LayerParams::Debug(_) => LayerType::Debug,
            LayerParams::Permute(_) => LayerType::Permute,
            LayerParams::MemCopy => LayerType::MemCopy,
            LayerParams::ConvertFp32ToFp16 => LayerType::ConvertFp32ToFp16,
            LayerParams::ConvertFp16ToFp32 => LayerType::ConvertFp16ToFp32,
        }
    }

    pub fn num_inputs(&self) -> usize {
        match self {
            LayerParams::Input(_) => 0,
            LayerParams::Concat(desc) => desc.num_inputs as usize,
            LayerParams::ElementwiseBinary(_) => 2,
            LayerParams::Lstm(_) => 3,
            LayerParams::DetectionPostProcess(_) => 2,
            LayerParams::PreCompiled(desc) => desc.num_inputs as usize,
            _ => 1,
        }
    }

    pub fn num_outputs(&self) -> usize {
        match self {
            LayerParams::Output(_) => 0,
            LayerParams::Split(desc) => desc.sizes.len(),
            LayerParams::Lstm(_) => 4,
            LayerParams::DetectionPostProcess(_) => 4,
            LayerParams::PreCompiled(desc) => desc.num_outputs as usize,
            _ => 1,
        }
    }

    pub fn data_layout(&self) -> Option<DataLayout> {
        match self {
            LayerParams::Convolution2d(desc) => Some(desc.data_layout),
            LayerParams::DepthwiseConvolution2d(desc) => Some(desc.data_layout),
            LayerParams::Pooling2d(desc) => Some(desc.data_layout),
            LayerParams::BatchNormalization(desc) => Some(desc.data_layout),
            _ => None,
        }
    }

    pub fn binding_id(&self) -> Option<LayerBindingId> {
        match self {
            LayerParams::Input(id) | LayerParams::Output(id) => Some(*id),
            _ => None,
        }
    }
}

/// Whether a layer came from the caller or was inserted by an optimizer pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerOrigin {
    User,
    Synthetic,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct InputSlot {
    pub(crate) connection: Option<OutputSlotId>,
}

impl InputSlot {
    pub fn connection(&self) -> Option<OutputSlotId> {
        self.connection
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutputSlot {
    pub(crate) connections: Vec<InputSlotId>,
    pub(crate) info: Option<TensorInfo>,
}

impl OutputSlot {
    pub fn connections(&self) -> &[InputSlotId] {
        &self.connections
    }

    pub fn tensor_info(&self) -> Option<&TensorInfo> {
        self.info.as_ref()
    }
}

#[derive(Debug, Clone)]
pub struct Layer {
    pub(crate) id: LayerId,
    pub(crate) name: String,
    pub(crate) params: LayerParams,
    pub(crate) inputs: Vec<InputSlot>,
    pub(crate) outputs: Vec<OutputSlot>,
    pub(crate) backend: Option<BackendId>,
    pub(crate) origin: LayerOrigin,
}

impl Layer {
    pub(crate) fn new(id: LayerId, name: String, params: LayerParams, origin: LayerOrigin) -> Self {
        let inputs = vec![InputSlot::default(); params.num_inputs()];
        let outputs = vec![OutputSlot::default(); params.num_outputs()];
        Self {
            id,
            name,
            params,
            inputs,
            outputs,
            backend: None,
            origin,
        }
    }

    pub fn id(&self) -> LayerId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn layer_type(&self) -> LayerType {
        self.params.layer_type()
    }

    pub fn params(&self) -> &LayerParams {
        &self.params
    }

    pub fn inputs(&self) -> &[InputSlot] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[OutputSlot] {
        &self.outputs
    }

    pub fn backend(&self) -> Option<&BackendId> {
        self.backend.as_ref()
    }

    pub fn origin(&self) -> LayerOrigin {
        self.origin
    }

    pub fn is_synthetic(&self) -> bool {
        self.origin == LayerOrigin::Synthetic
    }

    pub fn output_slot(&self, index: u32) -> OutputSlotId {
        OutputSlotId::new(self.id, index)
    }

    pub fn input_slot(&self, index: u32) -> InputSlotId {
        InputSlotId::new(self.id, index)
    }

    pub fn output_info(&self, index: usize) -> Option<&TensorInfo> {
        self.outputs.get(index).and_then(|slot| slot.info.as_ref())
    }
}
