use crate::backend::{BackendId, BackendRegistry};
use crate::error::{Error, Result};
use crate::graph::{Graph, ShapeInferenceMethod};

use super::context::{OptimizeContext, OptimizerOptions};
use super::passes::MemoryPlan;
use super::pipeline::{PassResult, PipelineOptimizer};

/// A graph with every layer assigned to a backend, ready to be loaded.
#[derive(Debug, Clone)]
pub struct OptimizedNetwork {
    graph: Graph,
    memory_plan: MemoryPlan,
    options: OptimizerOptions,
    stats: PassResult,
}

impl OptimizedNetwork {
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn memory_plan(&self) -> &MemoryPlan {
        &self.memory_plan
    }

    pub fn options(&self) -> &OptimizerOptions {
        &self.options
    }

    pub fn stats(&self) -> PassResult {
        self.stats
    }
}

/// Optimizes a copy of `graph` for the preferred backends, first preference first.
///
/// The caller's graph is never modified. Any failure leaves no partial result behind.
pub fn optimize(
    graph: &Graph,
    preferences: &[BackendId],
    registry: &BackendRegistry,
    options: &OptimizerOptions,
) -> Result<OptimizedNetwork> {
    let _span = tracing::info_span!("optimize", layers = graph.num_layers()).entered();
    graph.validate()?;

    let mut working = graph.clone();
    working.infer_tensor_infos(options.shape_inference_method, options.allow_expanded_dims)?;

    let mut cx = OptimizeContext::new(registry, preferences, options)?;
    let pipeline = PipelineOptimizer::new(&cx);
    let stats = pipeline.run(&mut working, &mut cx)?;

    working.validate()?;
    if let Some(layer) = working.layers().find(|layer| layer.backend().is_none()) {
        return Err(Error::invalid_graph(format!(
            "layer '{}' was left without a backend",
            layer.name()
        )));
    }
    working.infer_tensor_infos(ShapeInferenceMethod::ValidateOnly, options.allow_expanded_dims)?;

    tracing::info!(
        layers = working.num_layers(),
        views = cx.memory_plan().views().count(),
        rewrites = stats.rewrites_applied,
        "network optimized"
    );
    Ok(OptimizedNetwork {
        graph: working,
        memory_plan: cx.memory_plan,
        options: options.clone(),
        stats,
    })
}
