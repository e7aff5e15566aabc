use super::error::BackendResult;
use super::support::LayerQuery;
use crate::graph::LayerParams;
use crate::runtime::WorkingMemory;
use crate::tensor::TensorInfo;

/// Index of a tensor handle inside a network's handle table and working memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(pub u32);

impl HandleId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for HandleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "h{}", self.0)
    }
}

/// Parameters plus the input and output handles a workload operates on.
#[derive(Debug, Clone)]
pub struct QueueDescriptor {
    pub layer_name: String,
    pub params: LayerParams,
    pub inputs: Vec<HandleId>,
    pub outputs: Vec<HandleId>,
}

/// Tensor infos matching a [`QueueDescriptor`]'s handles.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkloadInfo {
    pub inputs: Vec<TensorInfo>,
    pub outputs: Vec<TensorInfo>,
}

/// Executable unit for one layer on one backend.
///
/// Workloads hold no tensor state of their own; handles are resolved from the
/// working memory passed to each call, so one workload serves every working memory.
pub trait Workload: Send + Sync {
    fn name(&self) -> &str;

    /// Called once per working memory after all its handles are allocated.
    fn post_allocation_configure(&self, _memory: &WorkingMemory) -> BackendResult<()> {
        Ok(())
    }

    fn execute(&self, memory: &WorkingMemory) -> BackendResult<()>;
}

pub trait WorkloadFactory: Send + Sync {
    /// Pure capability query; the error carries a human-readable reason.
    fn is_layer_supported(&self, query: &LayerQuery<'_>) -> Result<(), String>;

    fn create_workload(
        &self,
        descriptor: QueueDescriptor,
        info: &WorkloadInfo,
    ) -> BackendResult<Box<dyn Workload>>;
}
