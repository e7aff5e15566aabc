use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tessera::backend::{
    Backend, BackendCapabilities, BackendError, BackendId, BackendResult, CapabilityTable,
    LayerQuery, QueueDescriptor, TensorHandleFactory, Workload, WorkloadFactory, WorkloadInfo,
};
use tessera::graph::{Graph, LayerType, PreCompiledObject, SubgraphView};
use tessera::layout::DataLayout;
use tessera::runtime::WorkingMemory;
use tessera::tensor::DataType;
use tessera_backend_ref_cpu::{ref_cpu_capabilities, CpuTensorHandleFactory, RefWorkloadFactory};

const ALL_LAYER_TYPES: [LayerType; 20] = [
    LayerType::Input,
    LayerType::Output,
    LayerType::Convolution2d,
    LayerType::DepthwiseConvolution2d,
    LayerType::Pooling2d,
    LayerType::Concat,
    LayerType::Split,
    LayerType::Reshape,
    LayerType::Activation,
    LayerType::ElementwiseBinary,
    LayerType::BatchNormalization,
    LayerType::FullyConnected,
    LayerType::Lstm,
    LayerType::DetectionPostProcess,
    LayerType::PreCompiled,
    LayerType::Debug,
    LayerType::Permute,
    LayerType::MemCopy,
    LayerType::ConvertFp32ToFp16,
    LayerType::ConvertFp16ToFp32,
];

/// Shared log of workload executions, in execution order.
#[derive(Debug, Clone, Default)]
pub struct ExecutionRecorder {
    names: Arc<Mutex<Vec<String>>>,
}

impl ExecutionRecorder {
    fn record(&self, name: &str) {
        self.names
            .lock()
            .expect("recorder mutex poisoned")
            .push(name.to_string());
    }

    pub fn executed(&self) -> Vec<String> {
        self.names.lock().expect("recorder mutex poisoned").clone()
    }

    pub fn clear(&self) {
        self.names.lock().expect("recorder mutex poisoned").clear();
    }
}

/// Compiled object the mock backend hands out for whole runs of layers.
#[derive(Debug, Clone, PartialEq)]
pub struct MockCompiledSubgraph {
    pub backend: BackendId,
    pub layers: Vec<String>,
}

/// Configurable backend for optimizer and runtime tests.
///
/// Kernels come from the reference CPU backend where one exists; other layer types
/// (and precompiled subgraphs) fill their outputs with zeros. Every execution is
/// recorded.
#[derive(Debug, Clone)]
pub struct MockBackendBuilder {
    id: BackendId,
    supported: Vec<LayerType>,
    sub_tensors: bool,
    host_copies: bool,
    import: bool,
    layouts: HashMap<LayerType, DataLayout>,
    precompile: bool,
    fail_on: HashSet<String>,
    delay: Duration,
}

impl MockBackendBuilder {
    pub fn new(id: &str) -> Self {
        Self {
            id: BackendId::new(id),
            supported: ALL_LAYER_TYPES.to_vec(),
            sub_tensors: true,
            host_copies: false,
            import: false,
            layouts: HashMap::new(),
            precompile: false,
            fail_on: HashSet::new(),
            delay: Duration::ZERO,
        }
    }

    pub fn supports(mut self, layer_types: &[LayerType]) -> Self {
        self.supported = layer_types.to_vec();
        self
    }

    /// Supports everything except `layer_types`.
    pub fn rejects(mut self, layer_types: &[LayerType]) -> Self {
        self.supported.retain(|t| !layer_types.contains(t));
        self
    }

    pub fn sub_tensors(mut self, enabled: bool) -> Self {
        self.sub_tensors = enabled;
        self
    }

    pub fn host_copies(mut self, required: bool) -> Self {
        self.host_copies = required;
        self
    }

    pub fn import(mut self, enabled: bool) -> Self {
        self.import = enabled;
        self
    }

    pub fn required_layout(mut self, layer_type: LayerType, layout: DataLayout) -> Self {
        self.layouts.insert(layer_type, layout);
        self
    }

    pub fn precompile(mut self, enabled: bool) -> Self {
        self.precompile = enabled;
        self
    }

    /// Workloads for the named layer report an execution failure.
    pub fn fail_on(mut self, layer_name: &str) -> Self {
        self.fail_on.insert(layer_name.to_string());
        self
    }

    /// Each workload sleeps this long before running.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn build(self) -> MockBackend {
        let recorder = ExecutionRecorder::default();
        let table = CapabilityTable::new().support_all(&self.supported, &DataType::ALL);
        MockBackend {
            id: self.id,
            capabilities: BackendCapabilities {
                supports_sub_tensors: self.sub_tensors,
                requires_host_copies: self.host_copies,
                supports_import: self.import,
            },
            layouts: self.layouts,
            precompile: self.precompile,
            workloads: Arc::new(MockWorkloadFactory {
                table,
                reference: RefWorkloadFactory::new(ref_cpu_capabilities()),
                recorder: recorder.clone(),
                fail_on: self.fail_on,
                delay: self.delay,
            }),
            recorder,
        }
    }
}

pub struct MockBackend {
    id: BackendId,
    capabilities: BackendCapabilities,
    layouts: HashMap<LayerType, DataLayout>,
    precompile: bool,
    workloads: Arc<MockWorkloadFactory>,
    recorder: ExecutionRecorder,
}

impl MockBackend {
    pub fn builder(id: &str) -> MockBackendBuilder {
        MockBackendBuilder::new(id)
    }

    pub fn recorder(&self) -> ExecutionRecorder {
        self.recorder.clone()
    }
}

impl Backend for MockBackend {
    fn id(&self) -> BackendId {
        self.id.clone()
    }

    fn capabilities(&self) -> BackendCapabilities {
        self.capabilities
    }

    fn required_layout(&self, layer_type: LayerType) -> Option<DataLayout> {
        self.layouts.get(&layer_type).copied()
    }

    fn workload_factory(&self) -> Arc<dyn WorkloadFactory> {
        self.workloads.clone()
    }

    fn tensor_handle_factory(&self) -> Arc<dyn TensorHandleFactory> {
        Arc::new(CpuTensorHandleFactory)
    }

    fn optimize_subgraph(&self, graph: &Graph, subgraph: &SubgraphView) -> Option<PreCompiledObject> {
        if !self.precompile {
            return None;
        }
        let layers = subgraph
            .layers
            .iter()
            .filter_map(|id| graph.layer(*id).map(|layer| layer.name().to_string()))
            .collect();
        Some(PreCompiledObject::new(MockCompiledSubgraph {
            backend: self.id.clone(),
            layers,
        }))
    }
}

struct MockWorkloadFactory {
    table: CapabilityTable,
    reference: RefWorkloadFactory,
    recorder: ExecutionRecorder,
    fail_on: HashSet<String>,
    delay: Duration,
}

impl WorkloadFactory for MockWorkloadFactory {
    fn is_layer_supported(&self, query: &LayerQuery<'_>) -> Result<(), String> {
        self.table.check(query)
    }

    fn create_workload(
        &self,
        descriptor: QueueDescriptor,
        info: &WorkloadInfo,
    ) -> BackendResult<Box<dyn Workload>> {
        let layer_type = descriptor.params.layer_type();
        if !self.table.supports_type(layer_type) {
            return Err(BackendError::unsupported(layer_type, "disabled on this mock backend"));
        }
        let name = descriptor.layer_name.clone();
        let fail = self.fail_on.contains(&name);
        let inner = if ref_cpu_capabilities().supports_type(layer_type) {
            Inner::Reference(self.reference.create_workload(descriptor, info)?)
        } else {
            Inner::ZeroFill(descriptor.outputs)
        };
        Ok(Box::new(MockWorkload {
            name,
            inner,
            fail,
            delay: self.delay,
            recorder: self.recorder.clone(),
        }))
    }
}

enum Inner {
    Reference(Box<dyn Workload>),
    ZeroFill(Vec<tessera::backend::HandleId>),
}

struct MockWorkload {
    name: String,
    inner: Inner,
    fail: bool,
    delay: Duration,
    recorder: ExecutionRecorder,
}

impl Workload for MockWorkload {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, memory: &WorkingMemory) -> BackendResult<()> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        self.recorder.record(&self.name);
        if self.fail {
            return Err(BackendError::execution(format!(
                "injected failure in '{}'",
                self.name
            )));
        }
        match &self.inner {
            Inner::Reference(workload) => workload.execute(memory),
            Inner::ZeroFill(outputs) => {
                for id in outputs {
                    let handle = memory.handle(*id)?;
                    handle.write(&vec![0u8; handle.info().num_bytes()])?;
                }
                Ok(())
            }
        }
    }
}
