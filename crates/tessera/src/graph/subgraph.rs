use std::collections::HashSet;

use super::graph::Graph;
use super::layer::{InputSlotId, LayerId, LayerType, OutputSlotId};
use crate::backend::BackendId;
use crate::error::{Error, Result};

/// A convex set of layers assigned to one backend, with its boundary slots.
#[derive(Debug, Clone, PartialEq)]
pub struct SubgraphView {
    pub backend: BackendId,
    /// Member layers in topological order.
    pub layers: Vec<LayerId>,
    /// Member input slots fed from outside the subgraph.
    pub inputs: Vec<InputSlotId>,
    /// Member output slots consumed outside the subgraph.
    pub outputs: Vec<OutputSlotId>,
}

impl SubgraphView {
    pub fn from_layers(graph: &Graph, backend: BackendId, layers: Vec<LayerId>) -> Result<Self> {
        let members: HashSet<LayerId> = layers.iter().copied().collect();
        let mut inputs = Vec::new();
        let mut outputs = Vec::new();
        for id in &layers {
            let layer = graph.require(*id)?;
            for (index, slot) in layer.inputs().iter().enumerate() {
                match slot.connection() {
                    Some(from) if members.contains(&from.layer) => {}
                    _ => inputs.push(InputSlotId::new(*id, index as u32)),
                }
            }
            for (index, slot) in layer.outputs().iter().enumerate() {
                let external = slot.connections().is_empty()
                    || slot
                        .connections()
                        .iter()
                        .any(|consumer| !members.contains(&consumer.layer));
                if external {
                    outputs.push(OutputSlotId::new(*id, index as u32));
                }
            }
        }
        Ok(Self {
            backend,
            layers,
            inputs,
            outputs,
        })
    }

    pub fn contains(&self, id: LayerId) -> bool {
        self.layers.contains(&id)
    }
}

fn breaks_runs(layer_type: LayerType) -> bool {
    matches!(
        layer_type,
        LayerType::Input | LayerType::Output | LayerType::MemCopy | LayerType::PreCompiled
    )
}

/// Maximal runs of same-backend layers that are contiguous in topological order.
///
/// Input, Output, MemCopy and PreCompiled layers never join a run. Contiguity in a
/// topological order keeps every run convex: a path leaving and re-entering the run
/// would need a layer ordered between two members.
pub fn select_backend_runs(graph: &Graph) -> Result<Vec<SubgraphView>> {
    let order = graph.topological_order()?.to_vec();
    let mut runs = Vec::new();
    let mut current: Option<(BackendId, Vec<LayerId>)> = None;
    for id in order {
        let layer = graph.require(id)?;
        if matches!(layer.layer_type(), LayerType::Input | LayerType::Output) {
            continue;
        }
        let backend = layer.backend().cloned().ok_or_else(|| {
            Error::invalid_graph(format!("layer '{}' has no backend assigned", layer.name()))
        })?;
        if breaks_runs(layer.layer_type()) {
            if let Some((backend, layers)) = current.take() {
                runs.push(SubgraphView::from_layers(graph, backend, layers)?);
            }
            continue;
        }
        match current.as_mut() {
            Some((run_backend, layers)) if *run_backend == backend => layers.push(id),
            _ => {
                if let Some((backend, layers)) = current.take() {
                    runs.push(SubgraphView::from_layers(graph, backend, layers)?);
                }
                current = Some((backend, vec![id]));
            }
        }
    }
    if let Some((backend, layers)) = current.take() {
        runs.push(SubgraphView::from_layers(graph, backend, layers)?);
    }
    Ok(runs)
}
