use half::f16;

use crate::error::{Error, Result};
use crate::graph::{Graph, InputSlotId, LayerParams, LayerType, OutputSlotId};
use crate::optimizer::OptimizeContext;
use crate::tensor::{decode_elements, encode_elements, ConstTensor, DataType};

use super::{GraphPass, PassResult};

/// Runs Float32 compute layers in Float16, converting at their boundaries.
///
/// Constant weights are narrowed in place. Back-to-back conversion pairs left between
/// two converted layers are removed by the canonicalization sweep.
pub struct ReduceFp32ToFp16Pass;

fn is_convertible(layer_type: LayerType) -> bool {
    !matches!(
        layer_type,
        LayerType::Input
            | LayerType::Output
            | LayerType::MemCopy
            | LayerType::Debug
            | LayerType::ConvertFp16ToFp32
            | LayerType::ConvertFp32ToFp16
            | LayerType::PreCompiled
            | LayerType::DetectionPostProcess
    )
}

fn narrow(tensor: &ConstTensor) -> Result<ConstTensor> {
    if tensor.info.data_type != DataType::Float32 {
        return Ok(tensor.clone());
    }
    let values: Vec<f16> = decode_elements::<f32>(&tensor.data)
        .into_iter()
        .map(f16::from_f32)
        .collect();
    ConstTensor::from_elements(tensor.info.with_data_type(DataType::Float16), &values)
        .map_err(Error::invalid_graph)
}

fn narrow_opt(tensor: &Option<ConstTensor>) -> Result<Option<ConstTensor>> {
    tensor.as_ref().map(narrow).transpose()
}

fn narrow_constants(params: &LayerParams) -> Result<LayerParams> {
    let params = match params {
        LayerParams::Convolution2d(desc) => {
            let mut desc = desc.clone();
            desc.weights = narrow(&desc.weights)?;
            desc.bias = narrow_opt(&desc.bias)?;
            LayerParams::Convolution2d(desc)
        }
        LayerParams::DepthwiseConvolution2d(desc) => {
            let mut desc = desc.clone();
            desc.weights = narrow(&desc.weights)?;
            desc.bias = narrow_opt(&desc.bias)?;
            LayerParams::DepthwiseConvolution2d(desc)
        }
        LayerParams::FullyConnected(desc) => {
            let mut desc = desc.clone();
            desc.weights = narrow(&desc.weights)?;
            desc.bias = narrow_opt(&desc.bias)?;
            LayerParams::FullyConnected(desc)
        }
        LayerParams::BatchNormalization(desc) => {
            let mut desc = desc.clone();
            desc.mean = narrow(&desc.mean)?;
            desc.variance = narrow(&desc.variance)?;
            desc.beta = narrow(&desc.beta)?;
            desc.gamma = narrow(&desc.gamma)?;
            LayerParams::BatchNormalization(desc)
        }
        other => other.clone(),
    };
    Ok(params)
}

impl GraphPass for ReduceFp32ToFp16Pass {
    fn name(&self) -> &'static str {
        "reduce-fp32-to-fp16"
    }

    fn run(&self, graph: &mut Graph, _cx: &mut OptimizeContext<'_>) -> Result<PassResult> {
        let order = graph.topological_order()?.to_vec();
        let mut result = PassResult {
            iterations: 1,
            ..PassResult::default()
        };
        for id in order {
            let layer = graph.require(id)?;
            if !is_convertible(layer.layer_type()) || layer.inputs().is_empty() {
                continue;
            }
            let inputs = graph.input_infos(id)?;
            let outputs = graph.output_infos(id)?;
            let all_f32 = inputs
                .iter()
                .chain(&outputs)
                .all(|info| info.data_type == DataType::Float32);
            if !all_f32 {
                continue;
            }
            let name = layer.name().to_string();
            let params = narrow_constants(layer.params())?;

            for (index, info) in inputs.iter().enumerate() {
                let convert = graph.insert_layer_before(
                    InputSlotId::new(id, index as u32),
                    LayerParams::ConvertFp32ToFp16,
                    format!("convert_fp32_to_fp16_{name}_{index}"),
                )?;
                graph.set_tensor_info(
                    OutputSlotId::new(convert, 0),
                    info.with_data_type(DataType::Float16),
                )?;
                result.inserted_layers += 1;
            }
            graph.set_params(id, params)?;
            for (index, info) in outputs.into_iter().enumerate() {
                let slot = OutputSlotId::new(id, index as u32);
                graph.set_tensor_info(slot, info.with_data_type(DataType::Float16))?;
                if graph.consumers(slot).is_empty() {
                    continue;
                }
                let convert = graph.insert_layer_after(
                    slot,
                    LayerParams::ConvertFp16ToFp32,
                    format!("convert_fp16_to_fp32_{name}_{index}"),
                )?;
                graph.set_tensor_info(OutputSlotId::new(convert, 0), info)?;
                result.inserted_layers += 1;
            }
            result.rewrites_applied += 1;
        }
        result.changed = result.rewrites_applied > 0;
        Ok(result)
    }
}
