pub mod handle;
pub mod kernels;
mod workloads;

use std::sync::Arc;

use tessera::backend::{
    Backend, BackendCapabilities, BackendId, BackendRegistry, CapabilityTable, TensorHandleFactory,
    WorkloadFactory,
};
use tessera::graph::LayerType;
use tessera::layout::DataLayout;
use tessera::tensor::DataType;

pub use handle::{CpuTensorHandle, CpuTensorHandleFactory};
pub use workloads::RefWorkloadFactory;

pub const REF_CPU_BACKEND_ID: &str = "CpuRef";

/// Register the reference CPU backend with `registry` under [`REF_CPU_BACKEND_ID`].
pub fn register_ref_cpu_backend(registry: &mut BackendRegistry) {
    registry.register(Arc::new(RefCpuBackend::new()));
}

/// Element types the arithmetic kernels accept. Everything is evaluated in f32.
const COMPUTE_TYPES: &[DataType] = &[
    DataType::Float32,
    DataType::Float16,
    DataType::QAsymmU8,
    DataType::QAsymmS8,
    DataType::QSymmS8,
    DataType::QSymmS16,
];

const FLOAT_TYPES: &[DataType] = &[DataType::Float32, DataType::Float16];

pub fn ref_cpu_capabilities() -> CapabilityTable {
    CapabilityTable::new()
        .support_all(
            &[
                LayerType::Input,
                LayerType::Output,
                LayerType::Concat,
                LayerType::Split,
                LayerType::Reshape,
                LayerType::Permute,
                LayerType::MemCopy,
                LayerType::Debug,
            ],
            &DataType::ALL,
        )
        .support_all(
            &[
                LayerType::Activation,
                LayerType::ElementwiseBinary,
                LayerType::BatchNormalization,
                LayerType::FullyConnected,
                LayerType::Pooling2d,
                LayerType::Convolution2d,
            ],
            COMPUTE_TYPES,
        )
        .support_all(
            &[LayerType::ConvertFp32ToFp16, LayerType::ConvertFp16ToFp32],
            FLOAT_TYPES,
        )
}

#[derive(Clone)]
pub struct RefCpuBackend {
    workloads: Arc<RefWorkloadFactory>,
    handles: Arc<CpuTensorHandleFactory>,
}

impl RefCpuBackend {
    pub fn new() -> Self {
        Self {
            workloads: Arc::new(RefWorkloadFactory::new(ref_cpu_capabilities())),
            handles: Arc::new(CpuTensorHandleFactory),
        }
    }
}

impl Default for RefCpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for RefCpuBackend {
    fn id(&self) -> BackendId {
        BackendId::new(REF_CPU_BACKEND_ID)
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            supports_sub_tensors: true,
            requires_host_copies: false,
            supports_import: true,
        }
    }

    fn required_layout(&self, layer_type: LayerType) -> Option<DataLayout> {
        match layer_type {
            LayerType::Convolution2d | LayerType::Pooling2d => Some(DataLayout::NCHW),
            _ => None,
        }
    }

    fn workload_factory(&self) -> Arc<dyn WorkloadFactory> {
        self.workloads.clone()
    }

    fn tensor_handle_factory(&self) -> Arc<dyn TensorHandleFactory> {
        self.handles.clone()
    }
}
