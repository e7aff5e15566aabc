use std::collections::HashMap;

use crate::backend::BackendId;
use crate::error::{Error, Result};
use crate::graph::{
    select_backend_runs, Graph, InputSlotId, LayerId, LayerParams, OutputSlotId,
    PreCompiledDescriptor,
};
use crate::optimizer::OptimizeContext;

use super::{GraphPass, PassResult};

/// Inserts MemCopy layers at backend boundaries that need host staging, then offers
/// each same-backend run to its backend for whole-subgraph compilation.
pub struct PartitionPass;

impl PartitionPass {
    fn insert_mem_copies(
        graph: &mut Graph,
        cx: &OptimizeContext<'_>,
        result: &mut PassResult,
    ) -> Result<()> {
        let order = graph.topological_order()?.to_vec();
        let mut crossings: Vec<(OutputSlotId, InputSlotId, BackendId)> = Vec::new();
        for id in order {
            let layer = graph.require(id)?;
            let Some(consumer_backend) = layer.backend().cloned() else {
                continue;
            };
            for (index, slot) in layer.inputs().iter().enumerate() {
                let Some(from) = slot.connection() else { continue };
                let Some(producer_backend) = graph.require(from.layer)?.backend().cloned() else {
                    continue;
                };
                if producer_backend == consumer_backend {
                    continue;
                }
                let needs_copy = cx.backend(&producer_backend)?.capabilities().requires_host_copies
                    || cx.backend(&consumer_backend)?.capabilities().requires_host_copies;
                if needs_copy {
                    crossings.push((from, InputSlotId::new(id, index as u32), consumer_backend.clone()));
                }
            }
        }

        let mut copies: HashMap<(OutputSlotId, BackendId), LayerId> = HashMap::new();
        for (from, input, backend) in crossings {
            if let Some(copy) = copies.get(&(from, backend.clone())) {
                graph.disconnect(input)?;
                graph.connect(OutputSlotId::new(*copy, 0), input)?;
                continue;
            }
            let info = graph.tensor_info(from).cloned().ok_or_else(|| {
                Error::invalid_graph(format!("slot {from} has no tensor info"))
            })?;
            let name = format!("[ {} (MemCopy) ]", graph.require(from.layer)?.name());
            let copy = graph.insert_layer_before(input, LayerParams::MemCopy, name)?;
            graph.set_tensor_info(OutputSlotId::new(copy, 0), info)?;
            graph.set_backend(copy, backend.clone())?;
            copies.insert((from, backend), copy);
            result.inserted_layers += 1;
            result.rewrites_applied += 1;
        }
        Ok(())
    }

    fn substitute_precompiled(
        graph: &mut Graph,
        cx: &OptimizeContext<'_>,
        result: &mut PassResult,
    ) -> Result<()> {
        let runs = select_backend_runs(graph)?;
        for (index, run) in runs.into_iter().enumerate() {
            let backend = cx.backend(&run.backend)?;
            let Some(object) = backend.optimize_subgraph(graph, &run) else {
                continue;
            };
            let fused_layers = run
                .layers
                .iter()
                .map(|id| graph.require(*id).map(|layer| layer.name().to_string()))
                .collect::<Result<Vec<_>>>()?;
            let params = LayerParams::PreCompiled(PreCompiledDescriptor {
                num_inputs: run.inputs.len() as u32,
                num_outputs: run.outputs.len() as u32,
                object,
                fused_layers,
            });
            let id = graph.substitute_subgraph(&run, params, format!("precompiled_{}_{index}", run.backend))?;
            graph.set_backend(id, run.backend.clone())?;
            tracing::debug!(backend = %run.backend, layers = run.layers.len(), "substituted precompiled subgraph");
            result.inserted_layers += 1;
            result.erased_layers += run.layers.len();
            result.rewrites_applied += 1;
        }
        Ok(())
    }
}

impl GraphPass for PartitionPass {
    fn name(&self) -> &'static str {
        "partition"
    }

    fn run(&self, graph: &mut Graph, cx: &mut OptimizeContext<'_>) -> Result<PassResult> {
        let mut result = PassResult {
            iterations: 1,
            ..PassResult::default()
        };
        Self::insert_mem_copies(graph, cx, &mut result)?;
        Self::substitute_precompiled(graph, cx, &mut result)?;
        cx.memory_plan.retain_live(graph);
        result.changed = result.rewrites_applied > 0;
        Ok(result)
    }
}
