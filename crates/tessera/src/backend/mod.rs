//! Backend service-provider interface.
//!
//! A backend contributes a capability query, a workload factory, a tensor handle
//! factory and optional layout and subgraph hooks. The optimizer and runtime only
//! talk to backends through these traits.

mod error;
mod handle_table;
mod id;
mod registry;
mod support;
mod tensor_handle;
mod validation;
mod workload;

use std::sync::Arc;

pub use error::{BackendError, BackendResult};
pub use handle_table::{HandleEntry, HandleKind, HandleTable};
pub use id::BackendId;
pub use registry::{BackendRegistry, DeviceSpec};
pub use support::{CapabilityTable, LayerQuery};
pub use tensor_handle::{TensorHandle, TensorHandleFactory};
pub use workload::{HandleId, QueueDescriptor, Workload, WorkloadFactory, WorkloadInfo};

use crate::graph::{Graph, LayerType, PreCompiledObject, SubgraphView};
use crate::layout::DataLayout;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BackendCapabilities {
    /// Tensor handles may be strided views into a parent handle.
    pub supports_sub_tensors: bool,
    /// Data crossing into or out of this backend must be staged through host memory.
    pub requires_host_copies: bool,
    /// Input handles can adopt caller buffers without copying.
    pub supports_import: bool,
}

pub trait Backend: Send + Sync {
    fn id(&self) -> BackendId;

    fn capabilities(&self) -> BackendCapabilities;

    /// Layout the backend's kernels for `layer_type` insist on, if any.
    fn required_layout(&self, _layer_type: LayerType) -> Option<DataLayout> {
        None
    }

    fn workload_factory(&self) -> Arc<dyn WorkloadFactory>;

    fn tensor_handle_factory(&self) -> Arc<dyn TensorHandleFactory>;

    /// Offers to replace a run of layers with one compiled object.
    fn optimize_subgraph(&self, _graph: &Graph, _subgraph: &SubgraphView) -> Option<PreCompiledObject> {
        None
    }
}
