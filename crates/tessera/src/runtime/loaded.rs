use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::backend::{
    BackendError, BackendId, BackendRegistry, HandleId, HandleTable, QueueDescriptor,
    TensorHandleFactory, Workload, WorkloadInfo,
};
use crate::error::{Error, Result, Status};
use crate::graph::{InputSlotId, LayerBindingId, LayerType, OutputSlotId};
use crate::optimizer::OptimizedNetwork;
use crate::tensor::{ConstTensor, Tensor, TensorInfo};

use super::properties::{MemorySource, NetworkProperties};
use super::working_memory::WorkingMemory;
use super::{NetworkId, NetworkState};

struct WorkloadEntry {
    layer_name: String,
    backend: BackendId,
    workload: Box<dyn Workload>,
}

/// Where a network input or output binding lives in working memory.
#[derive(Debug, Clone, PartialEq)]
pub struct BindingPoint {
    pub binding: LayerBindingId,
    pub handle: HandleId,
    pub info: TensorInfo,
    /// Caller buffers may be adopted instead of copied.
    pub importable: bool,
}

struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// An optimized network turned into workloads and a handle table.
pub struct LoadedNetwork {
    id: NetworkId,
    properties: NetworkProperties,
    handle_table: HandleTable,
    factories: HashMap<BackendId, Arc<dyn TensorHandleFactory>>,
    workloads: Vec<WorkloadEntry>,
    inputs: Vec<BindingPoint>,
    outputs: Vec<BindingPoint>,
    default_memory: Mutex<Option<WorkingMemory>>,
    loaded: AtomicBool,
    in_flight: AtomicUsize,
}

fn build_handle_table(network: &OptimizedNetwork) -> Result<HandleTable> {
    let graph = network.graph();
    let plan = network.memory_plan();
    let mut table = HandleTable::new();

    for id in graph.topological_order()? {
        let layer = graph.require(*id)?;
        for (index, slot) in layer.outputs().iter().enumerate() {
            let slot_id = OutputSlotId::new(*id, index as u32);
            if plan.view_for(slot_id).is_some() {
                continue;
            }
            let info = slot.tensor_info().cloned().ok_or_else(|| {
                Error::invalid_graph(format!("output {index} of '{}' has no tensor info", layer.name()))
            })?;
            let backend = layer.backend().cloned().ok_or_else(|| {
                Error::invalid_graph(format!("layer '{}' has no backend", layer.name()))
            })?;
            table.add_owned(slot_id, info, backend);
        }
    }

    let mut pending: Vec<_> = plan.views().map(|(slot, view)| (*slot, view)).collect();
    while !pending.is_empty() {
        let before = pending.len();
        let mut deferred = Vec::new();
        for (slot, view) in pending {
            let Some(parent) = table.handle_for_slot(view.parent) else {
                deferred.push((slot, view));
                continue;
            };
            let layer = graph.require(slot.layer)?;
            let info = graph
                .tensor_info(slot)
                .cloned()
                .ok_or_else(|| Error::invalid_graph(format!("view slot {slot} has no tensor info")))?;
            let backend = layer.backend().cloned().ok_or_else(|| {
                Error::invalid_graph(format!("layer '{}' has no backend", layer.name()))
            })?;
            table.add_view(slot, info, backend, parent, view.origin.clone())?;
        }
        if deferred.len() == before {
            return Err(Error::runtime("memory views reference parents that never materialize"));
        }
        pending = deferred;
    }
    Ok(table)
}

impl LoadedNetwork {
    pub(crate) fn load(
        id: NetworkId,
        network: &OptimizedNetwork,
        registry: &BackendRegistry,
        properties: NetworkProperties,
    ) -> Result<Self> {
        let _span = tracing::info_span!("load_network", network = %id).entered();
        let graph = network.graph();
        let plan = network.memory_plan();
        let handle_table = build_handle_table(network)?;

        let handle_of = |slot: OutputSlotId| {
            handle_table
                .handle_for_slot(slot)
                .ok_or_else(|| Error::runtime(format!("slot {slot} has no tensor handle")))
        };

        let mut workloads = Vec::new();
        let mut inputs = Vec::new();
        let mut outputs = Vec::new();
        for layer_id in graph.topological_order()? {
            let layer = graph.require(*layer_id)?;
            match layer.layer_type() {
                LayerType::Input => {
                    let handle = handle_of(OutputSlotId::new(*layer_id, 0))?;
                    let backend = layer.backend().and_then(|b| registry.get(b));
                    let importable = properties.input_source != MemorySource::Undefined
                        && !handle_table.has_views(handle)
                        && backend.is_some_and(|b| b.capabilities().supports_import);
                    inputs.push(BindingPoint {
                        binding: layer.params().binding_id().unwrap_or_default(),
                        handle,
                        info: graph.output_infos(*layer_id)?.remove(0),
                        importable,
                    });
                    continue;
                }
                LayerType::Output => {
                    let from = graph.producer(InputSlotId::new(*layer_id, 0)).ok_or_else(|| {
                        Error::invalid_graph(format!("output '{}' is not connected", layer.name()))
                    })?;
                    outputs.push(BindingPoint {
                        binding: layer.params().binding_id().unwrap_or_default(),
                        handle: handle_of(from)?,
                        info: graph.input_infos(*layer_id)?.remove(0),
                        importable: false,
                    });
                    continue;
                }
                _ if plan.is_elided(*layer_id) => continue,
                _ => {}
            }

            let name = layer.name().to_string();
            let backend_id = layer
                .backend()
                .cloned()
                .ok_or_else(|| Error::invalid_graph(format!("layer '{name}' has no backend")))?;
            let backend = registry
                .get(&backend_id)
                .ok_or_else(|| Error::runtime(format!("backend {backend_id} is not registered")))?;

            let mut input_handles = Vec::with_capacity(layer.inputs().len());
            for (index, slot) in layer.inputs().iter().enumerate() {
                let from = slot.connection().ok_or_else(|| {
                    Error::invalid_graph(format!("input {index} of '{name}' is not connected"))
                })?;
                input_handles.push(handle_of(from)?);
            }
            let output_handles = (0..layer.outputs().len())
                .map(|index| handle_of(OutputSlotId::new(*layer_id, index as u32)))
                .collect::<Result<Vec<_>>>()?;

            let info = WorkloadInfo {
                inputs: graph.input_infos(*layer_id)?,
                outputs: graph.output_infos(*layer_id)?,
            };
            let descriptor = QueueDescriptor {
                layer_name: name.clone(),
                params: layer.params().clone(),
                inputs: input_handles,
                outputs: output_handles,
            };
            let invalid = |err: BackendError| match err {
                BackendError::InvalidArgument(message) => Error::InvalidArgument(message),
                other => Error::Backend(other),
            };
            descriptor.validate(&info).map_err(invalid)?;
            let workload = backend
                .workload_factory()
                .create_workload(descriptor, &info)
                .map_err(invalid)?;
            workloads.push(WorkloadEntry {
                layer_name: name,
                backend: backend_id,
                workload,
            });
        }

        if properties.output_source != MemorySource::Undefined {
            tracing::warn!(network = %id, "output import is not supported, outputs are copied");
        }

        let factories = registry.tensor_handle_factories();
        let loaded = Self {
            id,
            properties,
            handle_table,
            factories,
            workloads,
            inputs,
            outputs,
            default_memory: Mutex::new(None),
            loaded: AtomicBool::new(true),
            in_flight: AtomicUsize::new(0),
        };
        let memory = loaded.create_working_memory()?;
        *loaded
            .default_memory
            .lock()
            .expect("working memory lock poisoned") = Some(memory);
        tracing::info!(
            network = %id,
            workloads = loaded.workloads.len(),
            handles = loaded.handle_table.len(),
            "network loaded"
        );
        Ok(loaded)
    }

    pub fn id(&self) -> NetworkId {
        self.id
    }

    pub fn properties(&self) -> &NetworkProperties {
        &self.properties
    }

    pub fn handle_table(&self) -> &HandleTable {
        &self.handle_table
    }

    pub fn input_bindings(&self) -> &[BindingPoint] {
        &self.inputs
    }

    pub fn output_bindings(&self) -> &[BindingPoint] {
        &self.outputs
    }

    pub fn input_binding(&self, binding: LayerBindingId) -> Option<&BindingPoint> {
        self.inputs.iter().find(|point| point.binding == binding)
    }

    pub fn output_binding(&self, binding: LayerBindingId) -> Option<&BindingPoint> {
        self.outputs.iter().find(|point| point.binding == binding)
    }

    /// Names of the layers that run a workload, in execution order.
    pub fn workload_names(&self) -> Vec<&str> {
        self.workloads
            .iter()
            .map(|entry| entry.layer_name.as_str())
            .collect()
    }

    pub fn state(&self) -> NetworkState {
        if !self.loaded.load(Ordering::SeqCst) {
            NetworkState::Unloaded
        } else if self.in_flight.load(Ordering::SeqCst) > 0 {
            NetworkState::Running
        } else {
            NetworkState::Loaded
        }
    }

    /// Materializes a fresh set of handles for one concurrent executor.
    pub fn create_working_memory(&self) -> Result<WorkingMemory> {
        let memory = self.handle_table.materialize(&self.factories)?;
        for entry in &self.workloads {
            entry.workload.post_allocation_configure(&memory)?;
        }
        Ok(memory)
    }

    /// Runs one inference on the network's default working memory.
    pub fn enqueue(
        &self,
        inputs: &[(LayerBindingId, ConstTensor)],
        outputs: &mut [(LayerBindingId, Tensor)],
    ) -> Result<Status> {
        let guard = self
            .default_memory
            .lock()
            .expect("working memory lock poisoned");
        let memory = guard
            .as_ref()
            .ok_or_else(|| Error::runtime(format!("network {} is unloaded", self.id)))?;
        self.execute(memory, inputs, outputs)
    }

    /// Runs one inference on a caller-provided working memory.
    pub fn execute(
        &self,
        memory: &WorkingMemory,
        inputs: &[(LayerBindingId, ConstTensor)],
        outputs: &mut [(LayerBindingId, Tensor)],
    ) -> Result<Status> {
        if !self.loaded.load(Ordering::SeqCst) {
            return Err(Error::runtime(format!("network {} is unloaded", self.id)));
        }
        let _in_flight = InFlight::enter(&self.in_flight);
        self.bind_inputs(memory, inputs)?;
        for entry in &self.workloads {
            let start = self.properties.profiling_enabled.then(Instant::now);
            if let Err(err) = entry.workload.execute(memory) {
                return match err {
                    BackendError::Execution { .. } => {
                        tracing::error!(
                            network = %self.id,
                            layer = %entry.layer_name,
                            backend = %entry.backend,
                            error = %err,
                            "workload execution failed"
                        );
                        Ok(Status::Failure)
                    }
                    other => Err(other.into()),
                };
            }
            if let Some(start) = start {
                tracing::info!(
                    layer = %entry.layer_name,
                    backend = %entry.backend,
                    elapsed_us = start.elapsed().as_micros() as u64,
                    "workload timing"
                );
            }
        }
        self.read_outputs(memory, outputs)?;
        Ok(Status::Success)
    }

    fn bind_inputs(
        &self,
        memory: &WorkingMemory,
        inputs: &[(LayerBindingId, ConstTensor)],
    ) -> Result<()> {
        for (binding, _) in inputs {
            if self.input_binding(*binding).is_none() {
                return Err(Error::invalid_argument(format!("unknown input binding {binding}")));
            }
        }
        for point in &self.inputs {
            let mut matching = inputs.iter().filter(|(binding, _)| *binding == point.binding);
            let Some((_, tensor)) = matching.next() else {
                return Err(Error::invalid_argument(format!(
                    "no tensor supplied for input binding {}",
                    point.binding
                )));
            };
            if matching.next().is_some() {
                return Err(Error::invalid_argument(format!(
                    "input binding {} supplied more than once",
                    point.binding
                )));
            }
            check_binding_info(point, &tensor.info, tensor.data.len())?;
            let handle = memory.handle(point.handle)?;
            if point.importable && handle.import(tensor.data.clone())? {
                continue;
            }
            handle.write(&tensor.data)?;
        }
        Ok(())
    }

    fn read_outputs(
        &self,
        memory: &WorkingMemory,
        outputs: &mut [(LayerBindingId, Tensor)],
    ) -> Result<()> {
        for (binding, tensor) in outputs.iter_mut() {
            let point = self.output_binding(*binding).ok_or_else(|| {
                Error::invalid_argument(format!("unknown output binding {binding}"))
            })?;
            check_binding_info(point, &tensor.info, tensor.data.len())?;
            memory.handle(point.handle)?.read(&mut tensor.data)?;
        }
        Ok(())
    }

    pub(crate) fn unload(&self) {
        self.loaded.store(false, Ordering::SeqCst);
        let memory = self
            .default_memory
            .lock()
            .expect("working memory lock poisoned")
            .take();
        drop(memory);
        tracing::info!(network = %self.id, "network unloaded");
    }
}

fn check_binding_info(point: &BindingPoint, info: &TensorInfo, len: usize) -> Result<()> {
    if info.data_type != point.info.data_type || !info.shape.matches_expanded(&point.info.shape) {
        return Err(Error::invalid_argument(format!(
            "binding {} expects {}, got {info}",
            point.binding, point.info
        )));
    }
    if len != point.info.num_bytes() {
        return Err(Error::invalid_argument(format!(
            "binding {} expects {} bytes, got {len}",
            point.binding,
            point.info.num_bytes()
        )));
    }
    Ok(())
}
