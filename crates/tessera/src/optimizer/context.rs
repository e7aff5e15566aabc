use serde::{Deserialize, Serialize};

use crate::backend::{Backend, BackendId, BackendRegistry};
use crate::error::{Error, Result};
use crate::graph::ShapeInferenceMethod;

use super::passes::MemoryPlan;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerOptions {
    /// Run eligible Float32 layers in Float16 behind conversion layers.
    pub reduce_fp32_to_fp16: bool,
    /// Insert a Debug layer after every layer output.
    pub debug: bool,
    /// Debug layers write JSON dumps instead of logging.
    pub debug_to_file: bool,
    pub shape_inference_method: ShapeInferenceMethod,
    /// Shapes differing only by leading unit dimensions compare equal.
    pub allow_expanded_dims: bool,
    /// Upper bound on canonicalization sweeps; `None` reads `TESSERA_CANONICALIZE_ITERS`.
    pub canonicalize_max_iters: Option<usize>,
}

impl Default for OptimizerOptions {
    fn default() -> Self {
        Self {
            reduce_fp32_to_fp16: false,
            debug: false,
            debug_to_file: false,
            shape_inference_method: ShapeInferenceMethod::InferAndValidate,
            allow_expanded_dims: false,
            canonicalize_max_iters: None,
        }
    }
}

impl OptimizerOptions {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|err| Error::invalid_argument(format!("optimizer options: {err}")))
    }
}

/// Shared state threaded through every optimizer pass.
pub struct OptimizeContext<'a> {
    registry: &'a BackendRegistry,
    preferences: Vec<BackendId>,
    options: &'a OptimizerOptions,
    pub(crate) memory_plan: MemoryPlan,
}

impl<'a> OptimizeContext<'a> {
    /// Keeps the preferences that name registered backends, in order.
    pub fn new(
        registry: &'a BackendRegistry,
        preferences: &[BackendId],
        options: &'a OptimizerOptions,
    ) -> Result<Self> {
        let device = registry.device_spec();
        let mut available = Vec::with_capacity(preferences.len());
        for id in preferences {
            if !device.contains(id) {
                tracing::warn!(backend = %id, "preferred backend is not registered, skipping");
                continue;
            }
            if !available.contains(id) {
                available.push(id.clone());
            }
        }
        if available.is_empty() {
            return Err(Error::invalid_argument(format!(
                "none of the preferred backends {:?} are registered",
                preferences.iter().map(BackendId::as_str).collect::<Vec<_>>()
            )));
        }
        Ok(Self {
            registry,
            preferences: available,
            options,
            memory_plan: MemoryPlan::default(),
        })
    }

    pub fn registry(&self) -> &'a BackendRegistry {
        self.registry
    }

    pub fn preferences(&self) -> &[BackendId] {
        &self.preferences
    }

    pub fn options(&self) -> &'a OptimizerOptions {
        self.options
    }

    pub fn backend(&self, id: &BackendId) -> Result<&'a dyn Backend> {
        self.registry
            .get(id)
            .map(|backend| backend.as_ref())
            .ok_or_else(|| Error::invalid_argument(format!("backend {id} is not registered")))
    }

    pub fn memory_plan(&self) -> &MemoryPlan {
        &self.memory_plan
    }

    /// Context with no preferred backends, for passes that never consult one.
    #[cfg(test)]
    pub(crate) fn bare(registry: &'a BackendRegistry, options: &'a OptimizerOptions) -> Self {
        Self {
            registry,
            preferences: Vec::new(),
            options,
            memory_plan: MemoryPlan::default(),
        }
    }
}
