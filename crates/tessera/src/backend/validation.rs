use super::error::{BackendError, BackendResult};
use super::workload::{QueueDescriptor, WorkloadInfo};
use crate::graph::{infer_output_infos, LayerParams, LayerType};

impl QueueDescriptor {
    /// Checks handle counts and shapes against `info` before a workload is built.
    pub fn validate(&self, info: &WorkloadInfo) -> BackendResult<()> {
        let name = &self.layer_name;
        let expected_inputs = self.params.num_inputs();
        let expected_outputs = self.params.num_outputs();
        if self.inputs.len() != expected_inputs || info.inputs.len() != expected_inputs {
            return Err(BackendError::invalid_argument(format!(
                "'{name}' expects {expected_inputs} inputs, descriptor has {} handles and {} infos",
                self.inputs.len(),
                info.inputs.len()
            )));
        }
        if self.outputs.len() != expected_outputs || info.outputs.len() != expected_outputs {
            return Err(BackendError::invalid_argument(format!(
                "'{name}' expects {expected_outputs} outputs, descriptor has {} handles and {} infos",
                self.outputs.len(),
                info.outputs.len()
            )));
        }
        if matches!(
            self.params,
            LayerParams::Input(_) | LayerParams::Output(_) | LayerParams::PreCompiled(_)
        ) {
            return Ok(());
        }
        let inferred = infer_output_infos(&self.params, &info.inputs)
            .map_err(|err| BackendError::invalid_argument(format!("'{name}': {err}")))?;
        for (index, (expected, actual)) in inferred.iter().zip(&info.outputs).enumerate() {
            if !expected.shape.matches_expanded(&actual.shape) {
                return Err(BackendError::invalid_argument(format!(
                    "'{name}' output {index} has shape {}, expected {}",
                    actual.shape, expected.shape
                )));
            }
            if preserves_data_type(self.params.layer_type())
                && actual.data_type != info.inputs[0].data_type
            {
                return Err(BackendError::invalid_argument(format!(
                    "'{name}' output {index} is {}, input is {}",
                    actual.data_type, info.inputs[0].data_type
                )));
            }
        }
        Ok(())
    }
}

fn preserves_data_type(layer_type: LayerType) -> bool {
    matches!(
        layer_type,
        LayerType::Permute
            | LayerType::Reshape
            | LayerType::Split
            | LayerType::Concat
            | LayerType::MemCopy
            | LayerType::Debug
    )
}
