use std::sync::Arc;

use tessera::backend::{BackendId, BackendRegistry};
use tessera_backend_ref_cpu::{register_ref_cpu_backend, REF_CPU_BACKEND_ID};
use tessera_backend_tests::{define_backend_tests, MockBackend};

fn ref_cpu() -> (Arc<BackendRegistry>, BackendId) {
    let mut registry = BackendRegistry::new();
    register_ref_cpu_backend(&mut registry);
    (Arc::new(registry), BackendId::new(REF_CPU_BACKEND_ID))
}

fn mock_without_sub_tensors() -> (Arc<BackendRegistry>, BackendId) {
    let mut registry = BackendRegistry::new();
    registry.register(Arc::new(MockBackend::builder("MockCpu").sub_tensors(false).build()));
    (Arc::new(registry), BackendId::new("MockCpu"))
}

define_backend_tests!(ref_cpu_backend, super::ref_cpu);
define_backend_tests!(copying_mock_backend, super::mock_without_sub_tensors);
