//! Explicit backend registry.
//!
//! The registry is an ordinary value handed to the optimizer and the runtime; there is
//! no process-wide state. Backend crates expose a `register_*` function that inserts
//! their backend into a registry the caller owns.

use std::collections::HashMap;
use std::sync::Arc;

use super::id::BackendId;
use super::tensor_handle::TensorHandleFactory;
use super::Backend;

/// Set of backends available on this device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceSpec {
    backends: Vec<BackendId>,
}

impl DeviceSpec {
    pub fn new(backends: Vec<BackendId>) -> Self {
        Self { backends }
    }

    pub fn contains(&self, id: &BackendId) -> bool {
        self.backends.contains(id)
    }

    pub fn backends(&self) -> &[BackendId] {
        &self.backends
    }
}

#[derive(Default)]
pub struct BackendRegistry {
    backends: HashMap<BackendId, Arc<dyn Backend>>,
    order: Vec<BackendId>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a backend, returning the one it replaced under the same id.
    pub fn register(&mut self, backend: Arc<dyn Backend>) -> Option<Arc<dyn Backend>> {
        let id = backend.id();
        tracing::debug!(backend = %id, "registering backend");
        let previous = self.backends.insert(id.clone(), backend);
        if previous.is_none() {
            self.order.push(id);
        }
        previous
    }

    pub fn deregister(&mut self, id: &BackendId) -> Option<Arc<dyn Backend>> {
        self.order.retain(|existing| existing != id);
        self.backends.remove(id)
    }

    pub fn get(&self, id: &BackendId) -> Option<&Arc<dyn Backend>> {
        self.backends.get(id)
    }

    pub fn has_backend(&self, id: &BackendId) -> bool {
        self.backends.contains_key(id)
    }

    /// Registered ids in registration order.
    pub fn backend_ids(&self) -> &[BackendId] {
        &self.order
    }

    pub fn device_spec(&self) -> DeviceSpec {
        DeviceSpec::new(self.order.clone())
    }

    pub fn tensor_handle_factories(&self) -> HashMap<BackendId, Arc<dyn TensorHandleFactory>> {
        self.backends
            .iter()
            .map(|(id, backend)| (id.clone(), backend.tensor_handle_factory()))
            .collect()
    }
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &self.order)
            .finish()
    }
}
