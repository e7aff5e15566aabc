use crate::error::{Error, Result};
use crate::graph::{
    Graph, InputSlotId, LayerParams, OutputSlotId, PermuteDescriptor,
};
use crate::layout::{permute_bytes, permute_shape, DataLayout};
use crate::optimizer::OptimizeContext;
use crate::tensor::{ConstTensor, TensorInfo};

use super::{assign_synthetic, GraphPass, PassResult};

/// Wraps layers whose backend insists on another data layout in a pair of Permutes.
///
/// The layer itself is switched to the required layout, including its weights, and
/// its consumers keep seeing the original layout through the inverse Permute.
pub struct LayoutNegotiationPass;

impl LayoutNegotiationPass {
    const NAME: &'static str = "layout-negotiation";
}

fn permuted(info: &TensorInfo, perm: &[u32]) -> Result<TensorInfo> {
    let shape = permute_shape(&info.shape, perm).map_err(Error::invalid_graph)?;
    Ok(info.with_shape(shape))
}

fn permute_const(tensor: &ConstTensor, perm: &[u32]) -> Result<ConstTensor> {
    let info = permuted(&tensor.info, perm)?;
    let data = permute_bytes(
        &tensor.data,
        &tensor.info.shape,
        perm,
        tensor.info.data_type.size_in_bytes(),
    )
    .map_err(Error::invalid_graph)?;
    ConstTensor::new(info, data).map_err(Error::invalid_graph)
}

fn relayout(params: &LayerParams, target: DataLayout, perm: &[u32]) -> Result<LayerParams> {
    let params = match params {
        LayerParams::Convolution2d(desc) => {
            let mut desc = desc.clone();
            desc.weights = permute_const(&desc.weights, perm)?;
            desc.data_layout = target;
            LayerParams::Convolution2d(desc)
        }
        LayerParams::DepthwiseConvolution2d(desc) => {
            let mut desc = desc.clone();
            desc.data_layout = target;
            LayerParams::DepthwiseConvolution2d(desc)
        }
        LayerParams::Pooling2d(desc) => {
            let mut desc = desc.clone();
            desc.data_layout = target;
            LayerParams::Pooling2d(desc)
        }
        LayerParams::BatchNormalization(desc) => {
            let mut desc = desc.clone();
            desc.data_layout = target;
            LayerParams::BatchNormalization(desc)
        }
        other => other.clone(),
    };
    Ok(params)
}

impl GraphPass for LayoutNegotiationPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&self, graph: &mut Graph, cx: &mut OptimizeContext<'_>) -> Result<PassResult> {
        let order = graph.topological_order()?.to_vec();
        let mut result = PassResult {
            iterations: 1,
            ..PassResult::default()
        };
        for id in order {
            let layer = graph.require(id)?;
            let Some(current) = layer.params().data_layout() else {
                continue;
            };
            let name = layer.name().to_string();
            let backend_id = layer.backend().cloned().ok_or_else(|| {
                Error::invalid_graph(format!("layer '{name}' has no backend assigned"))
            })?;
            let Some(required) = cx.backend(&backend_id)?.required_layout(layer.layer_type())
            else {
                continue;
            };
            if required == current {
                continue;
            }
            let forward = current.permutation_to(required);
            let inverse = required.permutation_to(current);
            let num_outputs = layer.outputs().len();
            let params = relayout(layer.params(), required, &forward)?;

            let input = InputSlotId::new(id, 0);
            let producer = graph
                .producer(input)
                .ok_or_else(|| Error::invalid_graph(format!("input of '{name}' is not connected")))?;
            let producer_info = graph.tensor_info(producer).cloned().ok_or_else(|| {
                Error::invalid_graph(format!("input of '{name}' has no tensor info"))
            })?;
            let before = graph.insert_layer_before(
                input,
                LayerParams::Permute(PermuteDescriptor {
                    mappings: forward.to_vec(),
                }),
                format!("permute_{current}_to_{required}_before_{name}"),
            )?;
            graph.set_tensor_info(OutputSlotId::new(before, 0), permuted(&producer_info, &forward)?)?;
            assign_synthetic(cx, graph, before, &backend_id)?;
            result.inserted_layers += 1;

            graph.set_params(id, params)?;

            for index in 0..num_outputs {
                let slot = OutputSlotId::new(id, index as u32);
                let original = graph.tensor_info(slot).cloned().ok_or_else(|| {
                    Error::invalid_graph(format!("output {index} of '{name}' has no tensor info"))
                })?;
                graph.set_tensor_info(slot, permuted(&original, &forward)?)?;
                if graph.consumers(slot).is_empty() {
                    continue;
                }
                let after = graph.insert_layer_after(
                    slot,
                    LayerParams::Permute(PermuteDescriptor {
                        mappings: inverse.to_vec(),
                    }),
                    format!("permute_{required}_to_{current}_after_{name}_{index}"),
                )?;
                graph.set_tensor_info(OutputSlotId::new(after, 0), original)?;
                assign_synthetic(cx, graph, after, &backend_id)?;
                result.inserted_layers += 1;
            }
            tracing::debug!(layer = %name, from = %current, to = %required, "negotiated layout");
            result.rewrites_applied += 1;
        }
        result.changed = result.rewrites_applied > 0;
        Ok(result)
    }
}
