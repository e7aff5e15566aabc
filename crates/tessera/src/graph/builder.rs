use super::descriptors::*;
use super::graph::Graph;
use super::layer::{InputSlotId, LayerId, LayerParams, OutputSlotId};
use crate::error::Result;
use crate::tensor::TensorInfo;

/// Typed constructors for user-facing layers.
impl Graph {
    pub fn add_input_layer(&mut self, binding: LayerBindingId, name: &str) -> LayerId {
        self.add_layer(LayerParams::Input(binding), name)
    }

    pub fn add_output_layer(&mut self, binding: LayerBindingId, name: &str) -> LayerId {
        self.add_layer(LayerParams::Output(binding), name)
    }

    pub fn add_convolution2d_layer(&mut self, desc: Convolution2dDescriptor, name: &str) -> LayerId {
        self.add_layer(LayerParams::Convolution2d(desc), name)
    }

    pub fn add_depthwise_convolution2d_layer(
        &mut self,
        desc: DepthwiseConvolution2dDescriptor,
        name: &str,
    ) -> LayerId {
        self.add_layer(LayerParams::DepthwiseConvolution2d(desc), name)
    }

    pub fn add_pooling2d_layer(&mut self, desc: Pooling2dDescriptor, name: &str) -> LayerId {
        self.add_layer(LayerParams::Pooling2d(desc), name)
    }

    pub fn add_concat_layer(&mut self, desc: ConcatDescriptor, name: &str) -> LayerId {
        self.add_layer(LayerParams::Concat(desc), name)
    }

    pub fn add_split_layer(&mut self, desc: SplitDescriptor, name: &str) -> LayerId {
        self.add_layer(LayerParams::Split(desc), name)
    }

    pub fn add_reshape_layer(&mut self, desc: ReshapeDescriptor, name: &str) -> LayerId {
        self.add_layer(LayerParams::Reshape(desc), name)
    }

    pub fn add_activation_layer(&mut self, desc: ActivationDescriptor, name: &str) -> LayerId {
        self.add_layer(LayerParams::Activation(desc), name)
    }

    pub fn add_elementwise_binary_layer(
        &mut self,
        operation: BinaryOperation,
        name: &str,
    ) -> LayerId {
        self.add_layer(
            LayerParams::ElementwiseBinary(ElementwiseBinaryDescriptor { operation }),
            name,
        )
    }

    pub fn add_batch_normalization_layer(
        &mut self,
        desc: BatchNormalizationDescriptor,
        name: &str,
    ) -> LayerId {
        self.add_layer(LayerParams::BatchNormalization(desc), name)
    }

    pub fn add_fully_connected_layer(&mut self, desc: FullyConnectedDescriptor, name: &str) -> LayerId {
        self.add_layer(LayerParams::FullyConnected(desc), name)
    }

    pub fn add_lstm_layer(&mut self, desc: LstmDescriptor, name: &str) -> LayerId {
        self.add_layer(LayerParams::Lstm(desc), name)
    }

    pub fn add_detection_post_process_layer(
        &mut self,
        desc: DetectionPostProcessDescriptor,
        name: &str,
    ) -> LayerId {
        self.add_layer(LayerParams::DetectionPostProcess(desc), name)
    }

    pub fn add_permute_layer(&mut self, mappings: Vec<u32>, name: &str) -> LayerId {
        self.add_layer(LayerParams::Permute(PermuteDescriptor { mappings }), name)
    }

    /// Connects output `from_slot` of `from` to input `to_slot` of `to`.
    pub fn connect_layers(
        &mut self,
        from: LayerId,
        from_slot: u32,
        to: LayerId,
        to_slot: u32,
    ) -> Result<()> {
        self.connect(
            OutputSlotId::new(from, from_slot),
            InputSlotId::new(to, to_slot),
        )
    }

    pub fn set_output_info(&mut self, layer: LayerId, slot: u32, info: TensorInfo) -> Result<()> {
        self.set_tensor_info(OutputSlotId::new(layer, slot), info)
    }
}
