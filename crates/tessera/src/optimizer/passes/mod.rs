//! Optimizer passes over the layer graph.

mod assign_backends;
mod canonicalize;
mod debug;
mod fp16;
mod layout;
mod memory_views;
mod partition;

pub use assign_backends::AssignBackendsPass;
pub use canonicalize::{
    ConversionCanonicalizationPass, PermuteCanonicalizationPass, ReshapeCanonicalizationPass,
};
pub use debug::DebugInsertionPass;
pub use fp16::ReduceFp32ToFp16Pass;
pub use layout::LayoutNegotiationPass;
pub use memory_views::{MemoryPlan, MemoryViewPlanningPass, ViewAssignment};
pub use partition::PartitionPass;

pub use super::pipeline::{GraphPass, PassResult};

use crate::backend::{BackendId, LayerQuery};
use crate::error::{Error, Result};
use crate::graph::{Graph, LayerId};

use super::context::OptimizeContext;

/// Asks `backend` whether it can run layer `id` with the graph's current infos.
pub(crate) fn backend_supports(
    cx: &OptimizeContext<'_>,
    backend: &BackendId,
    graph: &Graph,
    id: LayerId,
) -> Result<std::result::Result<(), String>> {
    let layer = graph.require(id)?;
    let inputs = graph.input_infos(id)?;
    let outputs = graph.output_infos(id)?;
    let query = LayerQuery {
        params: layer.params(),
        inputs: &inputs,
        outputs: &outputs,
    };
    Ok(cx.backend(backend)?.workload_factory().is_layer_supported(&query))
}

/// Assigns an optimizer-inserted layer, preferring the backend of the layer it serves.
pub(crate) fn assign_synthetic(
    cx: &OptimizeContext<'_>,
    graph: &mut Graph,
    id: LayerId,
    preferred: &BackendId,
) -> Result<BackendId> {
    let mut candidates = vec![preferred.clone()];
    candidates.extend(
        cx.preferences()
            .iter()
            .filter(|candidate| *candidate != preferred)
            .cloned(),
    );
    let mut reasons = Vec::new();
    for candidate in &candidates {
        if !cx.registry().has_backend(candidate) {
            continue;
        }
        match backend_supports(cx, candidate, graph, id)? {
            Ok(()) => {
                graph.set_backend(id, candidate.clone())?;
                return Ok(candidate.clone());
            }
            Err(reason) => reasons.push(format!("{candidate}: {reason}")),
        }
    }
    Err(Error::LayerNotSupported {
        layer: graph.require(id)?.name().to_string(),
        backends: candidates,
        reasons,
    })
}
