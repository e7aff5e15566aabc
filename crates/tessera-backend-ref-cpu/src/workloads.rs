use std::path::PathBuf;

use serde::Serialize;
use tessera::backend::{
    BackendError, BackendResult, CapabilityTable, LayerQuery, QueueDescriptor, Workload,
    WorkloadFactory, WorkloadInfo,
};
use tessera::graph::{DebugDescriptor, LayerParams};
use tessera::runtime::WorkingMemory;
use tessera::tensor::{DataType, TensorInfo};

use crate::kernels::{self, decode_f32, decode_i32, encode_f32};

const DEBUG_PREVIEW_LEN: usize = 8;

#[derive(Debug)]
pub struct RefWorkloadFactory {
    capabilities: CapabilityTable,
}

impl RefWorkloadFactory {
    pub fn new(capabilities: CapabilityTable) -> Self {
        Self { capabilities }
    }
}

impl WorkloadFactory for RefWorkloadFactory {
    fn is_layer_supported(&self, query: &LayerQuery<'_>) -> Result<(), String> {
        self.capabilities.check(query)
    }

    fn create_workload(
        &self,
        descriptor: QueueDescriptor,
        info: &WorkloadInfo,
    ) -> BackendResult<Box<dyn Workload>> {
        let layer_type = descriptor.params.layer_type();
        if !self.capabilities.supports_type(layer_type) {
            return Err(BackendError::unsupported(
                layer_type,
                "no reference kernel for this layer type",
            ));
        }
        if matches!(descriptor.params, LayerParams::Input(_) | LayerParams::Output(_)) {
            return Err(BackendError::invalid_argument(format!(
                "'{}' is a boundary layer and has no workload",
                descriptor.layer_name
            )));
        }
        Ok(Box::new(RefWorkload {
            descriptor,
            info: info.clone(),
        }))
    }
}

struct RefWorkload {
    descriptor: QueueDescriptor,
    info: WorkloadInfo,
}

impl RefWorkload {
    fn run(&self, inputs: &[Vec<u8>]) -> BackendResult<Vec<Vec<u8>>> {
        let in_infos = &self.info.inputs;
        let out_infos = &self.info.outputs;
        let single = |bytes: Vec<u8>| -> BackendResult<Vec<Vec<u8>>> { Ok(vec![bytes]) };
        match &self.descriptor.params {
            LayerParams::Permute(desc) => {
                single(kernels::permute(&in_infos[0], &inputs[0], &desc.mappings)?)
            }
            LayerParams::Concat(desc) => {
                let parts: Vec<(&TensorInfo, &[u8])> = in_infos
                    .iter()
                    .zip(inputs)
                    .map(|(info, data)| (info, data.as_slice()))
                    .collect();
                single(kernels::concat(&parts, &out_infos[0], desc.axis)?)
            }
            LayerParams::Split(desc) => kernels::split(&in_infos[0], &inputs[0], out_infos, desc),
            LayerParams::Reshape(_)
            | LayerParams::MemCopy
            | LayerParams::ConvertFp32ToFp16
            | LayerParams::ConvertFp16ToFp32 => {
                single(kernels::convert(&in_infos[0], &inputs[0], &out_infos[0])?)
            }
            LayerParams::Debug(desc) => {
                report_debug(desc, &in_infos[0], &DebugValues::decode(&in_infos[0], &inputs[0])?)?;
                single(kernels::convert(&in_infos[0], &inputs[0], &out_infos[0])?)
            }
            LayerParams::Activation(desc) => {
                let mut values = decode_f32(&in_infos[0], &inputs[0])?;
                kernels::activation(desc, &mut values);
                single(encode_f32(&out_infos[0], &values)?)
            }
            LayerParams::ElementwiseBinary(desc) => {
                let lhs = decode_f32(&in_infos[0], &inputs[0])?;
                let rhs = decode_f32(&in_infos[1], &inputs[1])?;
                let values = kernels::elementwise_binary(
                    desc.operation,
                    (&in_infos[0].shape, &lhs),
                    (&in_infos[1].shape, &rhs),
                    &out_infos[0].shape,
                );
                single(encode_f32(&out_infos[0], &values)?)
            }
            LayerParams::BatchNormalization(desc) => {
                let values = decode_f32(&in_infos[0], &inputs[0])?;
                let values = kernels::batch_normalization(desc, &in_infos[0].shape, &values)?;
                single(encode_f32(&out_infos[0], &values)?)
            }
            LayerParams::FullyConnected(desc) => {
                let values = decode_f32(&in_infos[0], &inputs[0])?;
                let values = kernels::fully_connected(desc, &values, &out_infos[0].shape)?;
                single(encode_f32(&out_infos[0], &values)?)
            }
            LayerParams::Pooling2d(desc) => {
                let values = decode_f32(&in_infos[0], &inputs[0])?;
                let values =
                    kernels::pooling2d(desc, &in_infos[0].shape, &values, &out_infos[0].shape)?;
                single(encode_f32(&out_infos[0], &values)?)
            }
            LayerParams::Convolution2d(desc) => {
                let values = decode_f32(&in_infos[0], &inputs[0])?;
                let values =
                    kernels::convolution2d(desc, &in_infos[0].shape, &values, &out_infos[0].shape)?;
                single(encode_f32(&out_infos[0], &values)?)
            }
            other => Err(BackendError::unsupported(
                other.layer_type(),
                "no reference kernel for this layer type",
            )),
        }
    }
}

impl Workload for RefWorkload {
    fn name(&self) -> &str {
        &self.descriptor.layer_name
    }

    fn execute(&self, memory: &WorkingMemory) -> BackendResult<()> {
        let inputs = self
            .descriptor
            .inputs
            .iter()
            .map(|id| memory.handle(*id)?.read_to_vec())
            .collect::<BackendResult<Vec<_>>>()?;
        let outputs = self.run(&inputs)?;
        if outputs.len() != self.descriptor.outputs.len() {
            return Err(BackendError::execution(format!(
                "'{}' produced {} outputs, expected {}",
                self.descriptor.layer_name,
                outputs.len(),
                self.descriptor.outputs.len()
            )));
        }
        for (id, bytes) in self.descriptor.outputs.iter().zip(&outputs) {
            memory.handle(*id)?.write(bytes)?;
        }
        Ok(())
    }
}

/// Tensor contents as reported by a Debug layer. Signed32 keeps its integers.
#[derive(Debug, Serialize)]
#[serde(untagged)]
enum DebugValues {
    Real(Vec<f32>),
    Integer(Vec<i32>),
}

impl DebugValues {
    fn decode(info: &TensorInfo, bytes: &[u8]) -> BackendResult<Self> {
        match info.data_type {
            DataType::Signed32 => Ok(Self::Integer(decode_i32(info, bytes)?)),
            _ => Ok(Self::Real(decode_f32(info, bytes)?)),
        }
    }

    fn range(&self) -> (f64, f64) {
        fn span(values: impl Iterator<Item = f64>) -> (f64, f64) {
            values.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)))
        }
        match self {
            Self::Real(values) => span(values.iter().map(|&v| f64::from(v))),
            Self::Integer(values) => span(values.iter().map(|&v| f64::from(v))),
        }
    }

    fn preview(&self) -> String {
        match self {
            Self::Real(values) => format!("{:?}", &values[..values.len().min(DEBUG_PREVIEW_LEN)]),
            Self::Integer(values) => format!("{:?}", &values[..values.len().min(DEBUG_PREVIEW_LEN)]),
        }
    }
}

#[derive(Serialize)]
struct DebugDump<'a> {
    layer: &'a str,
    slot: u32,
    shape: &'a [u32],
    data_type: &'a str,
    min: f64,
    max: f64,
    values: &'a DebugValues,
}

fn debug_file_name(desc: &DebugDescriptor) -> String {
    let stem: String = desc
        .layer_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    format!("{stem}_{}.json", desc.slot_index)
}

fn report_debug(desc: &DebugDescriptor, info: &TensorInfo, values: &DebugValues) -> BackendResult<()> {
    let (min, max) = values.range();
    if !desc.to_file {
        tracing::info!(
            layer = %desc.layer_name,
            slot = desc.slot_index,
            shape = %info.shape,
            data_type = %info.data_type,
            min,
            max,
            preview = %values.preview(),
            "debug tensor"
        );
        return Ok(());
    }

    let dump = DebugDump {
        layer: &desc.layer_name,
        slot: desc.slot_index,
        shape: info.shape.dims(),
        data_type: info.data_type.name(),
        min,
        max,
        values,
    };
    let dir = tessera::env::debug_dir();
    let path: PathBuf = dir.join(debug_file_name(desc));
    let io_error = |err: std::io::Error| {
        BackendError::execution(format!("cannot write debug dump {}: {err}", path.display()))
    };
    std::fs::create_dir_all(&dir).map_err(io_error)?;
    let json = serde_json::to_vec_pretty(&dump)
        .map_err(|err| BackendError::execution(format!("cannot encode debug dump: {err}")))?;
    std::fs::write(&path, json).map_err(io_error)?;
    tracing::debug!(path = %path.display(), "debug tensor written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_file_names_are_path_safe() {
        let desc = DebugDescriptor {
            layer_name: "[ conv/1 (MemCopy) ]".into(),
            slot_index: 2,
            to_file: true,
        };
        assert_eq!(debug_file_name(&desc), "__conv_1__MemCopy____2.json");
    }

    #[test]
    fn signed32_debug_values_stay_integral() {
        let info = TensorInfo::new([3], DataType::Signed32);
        let bytes: Vec<u8> = [16_777_217i32, -5, 33_554_435]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let values = DebugValues::decode(&info, &bytes).unwrap();
        assert_eq!(values.range(), (-5.0, 33_554_435.0));
        assert_eq!(
            serde_json::to_string(&values).unwrap(),
            "[16777217,-5,33554435]"
        );
        assert_eq!(values.preview(), "[16777217, -5, 33554435]");
    }
}
