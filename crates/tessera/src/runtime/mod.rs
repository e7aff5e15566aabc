//! Loading optimized networks and running inferences, synchronously or on a thread pool.

mod callback;
mod execution;
mod loaded;
mod properties;
mod threadpool;
mod timing;
mod working_memory;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

pub use callback::{CallbackManager, ExecutionCallback, InferenceCompletion, InferenceId};
pub use execution::{run_asynchronous, run_synchronous, IterationReport};
pub use loaded::{BindingPoint, LoadedNetwork};
pub use properties::{MemorySource, NetworkProperties};
pub use threadpool::{QosExecPriority, Threadpool};
pub use timing::{
    add_inference_time, check_inference_time_threshold, reset_inference_time,
    take_inference_time,
};
pub use working_memory::WorkingMemory;

use crate::backend::{BackendRegistry, DeviceSpec};
use crate::error::{Error, Result, Status};
use crate::graph::LayerBindingId;
use crate::optimizer::OptimizedNetwork;
use crate::tensor::{ConstTensor, Tensor};

pub type InputTensors = Vec<(LayerBindingId, ConstTensor)>;
pub type OutputTensors = Vec<(LayerBindingId, Tensor)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NetworkId(pub u32);

impl std::fmt::Display for NetworkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkState {
    Unloaded,
    Loaded,
    Running,
}

/// Owns loaded networks and dispatches inferences to them.
pub struct Runtime {
    registry: Arc<BackendRegistry>,
    networks: Mutex<HashMap<NetworkId, Arc<LoadedNetwork>>>,
    next_id: AtomicU32,
}

impl Runtime {
    pub fn new(registry: Arc<BackendRegistry>) -> Self {
        Self {
            registry,
            networks: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
        }
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    pub fn device_spec(&self) -> DeviceSpec {
        self.registry.device_spec()
    }

    pub fn load_network(
        &self,
        network: &OptimizedNetwork,
        properties: NetworkProperties,
    ) -> Result<NetworkId> {
        let id = NetworkId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let loaded = LoadedNetwork::load(id, network, &self.registry, properties)?;
        self.networks
            .lock()
            .expect("network table lock poisoned")
            .insert(id, Arc::new(loaded));
        Ok(id)
    }

    /// Releases a network. Waits for a synchronous inference in progress to finish.
    pub fn unload_network(&self, id: NetworkId) -> Result<()> {
        let network = self
            .networks
            .lock()
            .expect("network table lock poisoned")
            .remove(&id)
            .ok_or_else(|| Error::invalid_argument(format!("network {id} is not loaded")))?;
        network.unload();
        Ok(())
    }

    pub fn network(&self, id: NetworkId) -> Result<Arc<LoadedNetwork>> {
        self.networks
            .lock()
            .expect("network table lock poisoned")
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::invalid_argument(format!("network {id} is not loaded")))
    }

    pub fn network_state(&self, id: NetworkId) -> NetworkState {
        self.networks
            .lock()
            .expect("network table lock poisoned")
            .get(&id)
            .map(|network| network.state())
            .unwrap_or(NetworkState::Unloaded)
    }

    /// Runs one inference synchronously.
    ///
    /// Workload failures during execution are reported as [`Status::Failure`];
    /// malformed requests are errors.
    pub fn enqueue_workload(
        &self,
        id: NetworkId,
        inputs: &[(LayerBindingId, ConstTensor)],
        outputs: &mut [(LayerBindingId, Tensor)],
    ) -> Result<Status> {
        let network = self.network(id)?;
        let _span = tracing::debug_span!("enqueue_workload", network = %id).entered();
        network.enqueue(inputs, outputs)
    }

    pub fn create_working_memory(&self, id: NetworkId) -> Result<WorkingMemory> {
        self.network(id)?.create_working_memory()
    }
}
