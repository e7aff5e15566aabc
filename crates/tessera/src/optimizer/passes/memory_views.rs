//! Subtensor planning: lets Concat inputs and Split outputs alias one buffer.
//!
//! A Concat is planned only when every one of its inputs qualifies; otherwise it
//! keeps its own output buffer and copies. Planned Concats and Splits need no
//! workload at runtime.

use std::collections::{BTreeMap, BTreeSet};

use crate::backend::BackendId;
use crate::error::{Error, Result};
use crate::graph::{
    concat_view_origins, split_view_origins, Graph, InputSlotId, LayerId, LayerParams,
    LayerType, OutputSlotId,
};
use crate::optimizer::OptimizeContext;

use super::{GraphPass, PassResult};

/// `slot`'s tensor lives at `origin` inside `parent`'s buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewAssignment {
    pub parent: OutputSlotId,
    pub origin: Vec<u32>,
    /// The Concat or Split layer the view was planned for.
    pub owner: LayerId,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryPlan {
    views: BTreeMap<OutputSlotId, ViewAssignment>,
    elided: BTreeSet<LayerId>,
}

impl MemoryPlan {
    pub fn view_for(&self, slot: OutputSlotId) -> Option<&ViewAssignment> {
        self.views.get(&slot)
    }

    pub fn views(&self) -> impl Iterator<Item = (&OutputSlotId, &ViewAssignment)> + '_ {
        self.views.iter()
    }

    /// Layers whose data movement is fully expressed by views.
    pub fn is_elided(&self, layer: LayerId) -> bool {
        self.elided.contains(&layer)
    }

    pub fn elided_layers(&self) -> impl Iterator<Item = LayerId> + '_ {
        self.elided.iter().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    fn insert_owner(&mut self, owner: LayerId, views: Vec<(OutputSlotId, ViewAssignment)>) {
        self.views.extend(views);
        self.elided.insert(owner);
    }

    fn remove_owner(&mut self, owner: LayerId) {
        self.views.retain(|_, view| view.owner != owner);
        self.elided.remove(&owner);
    }

    /// Drops every owner whose planned views no longer match the graph.
    pub(crate) fn retain_live(&mut self, graph: &Graph) {
        let stale: Vec<LayerId> = self
            .elided
            .iter()
            .copied()
            .filter(|owner| !self.owner_is_live(graph, *owner))
            .collect();
        for owner in stale {
            tracing::debug!(owner = %owner, "dropping stale memory views");
            self.remove_owner(owner);
        }
    }

    fn owner_is_live(&self, graph: &Graph, owner: LayerId) -> bool {
        let Some(layer) = graph.layer(owner) else {
            return false;
        };
        let views: Vec<_> = self
            .views
            .iter()
            .filter(|(_, view)| view.owner == owner)
            .collect();
        match layer.params() {
            LayerParams::Concat(_) => {
                let parent = OutputSlotId::new(owner, 0);
                views.len() == layer.inputs().len()
                    && layer.inputs().iter().enumerate().all(|(index, input)| {
                        input.connection().is_some_and(|from| {
                            graph.consumers(from) == [InputSlotId::new(owner, index as u32)]
                                && self
                                    .views
                                    .get(&from)
                                    .is_some_and(|view| view.parent == parent && view.owner == owner)
                        })
                    })
            }
            LayerParams::Split(_) => {
                let parent = graph.producer(InputSlotId::new(owner, 0));
                views.len() == layer.outputs().len()
                    && views.iter().all(|(slot, view)| {
                        slot.layer == owner && Some(view.parent) == parent
                    })
            }
            _ => false,
        }
    }
}

pub struct MemoryViewPlanningPass;

fn supports_views(cx: &OptimizeContext<'_>, backend: Option<&BackendId>) -> Result<Option<BackendId>> {
    let Some(id) = backend else {
        return Ok(None);
    };
    Ok(cx
        .backend(id)?
        .capabilities()
        .supports_sub_tensors
        .then(|| id.clone()))
}

fn plan_concat(
    graph: &Graph,
    id: LayerId,
    backend: &BackendId,
    plan: &MemoryPlan,
) -> Result<std::result::Result<Vec<(OutputSlotId, ViewAssignment)>, String>> {
    let layer = graph.require(id)?;
    let LayerParams::Concat(desc) = layer.params() else {
        return Ok(Err("not a concat".into()));
    };
    let parent = OutputSlotId::new(id, 0);
    let output = graph
        .tensor_info(parent)
        .ok_or_else(|| Error::invalid_graph(format!("concat '{}' has no output info", layer.name())))?;
    let inputs = graph.input_infos(id)?;
    let shapes: Vec<_> = inputs.iter().map(|info| info.shape.clone()).collect();
    let origins = concat_view_origins(&shapes, desc.axis);

    let mut views = Vec::with_capacity(inputs.len());
    for (index, (info, origin)) in inputs.iter().zip(origins).enumerate() {
        let Some(from) = graph.producer(InputSlotId::new(id, index as u32)) else {
            return Ok(Err(format!("input {index} is not connected")));
        };
        let producer = graph.require(from.layer)?;
        if !info.is_type_space_match(output) {
            return Ok(Err(format!("input {index} is quantized differently from the output")));
        }
        if producer.backend() != Some(backend) {
            return Ok(Err(format!("input {index} is produced on another backend")));
        }
        match producer.layer_type() {
            LayerType::Input => return Ok(Err(format!("input {index} is a network input"))),
            LayerType::Split => return Ok(Err(format!("input {index} comes from a split"))),
            LayerType::Permute if producer.is_synthetic() => {
                return Ok(Err(format!("input {index} comes from a layout permute")))
            }
            _ => {}
        }
        if graph.consumers(from).len() != 1 {
            return Ok(Err(format!("input {index} has other consumers")));
        }
        if plan.view_for(from).is_some() {
            return Ok(Err(format!("input {index} is already a view")));
        }
        views.push((
            from,
            ViewAssignment {
                parent,
                origin,
                owner: id,
            },
        ));
    }
    Ok(Ok(views))
}

fn plan_split(
    graph: &Graph,
    id: LayerId,
    backend: &BackendId,
    plan: &MemoryPlan,
) -> Result<std::result::Result<Vec<(OutputSlotId, ViewAssignment)>, String>> {
    let layer = graph.require(id)?;
    let LayerParams::Split(desc) = layer.params() else {
        return Ok(Err("not a split".into()));
    };
    let Some(parent) = graph.producer(InputSlotId::new(id, 0)) else {
        return Ok(Err("input is not connected".into()));
    };
    let input = graph
        .tensor_info(parent)
        .ok_or_else(|| Error::invalid_graph(format!("split '{}' has no input info", layer.name())))?;
    let origins = split_view_origins(input.shape.rank(), desc);

    let mut views = Vec::with_capacity(origins.len());
    for (index, origin) in origins.into_iter().enumerate() {
        let slot = OutputSlotId::new(id, index as u32);
        let Some(info) = graph.tensor_info(slot) else {
            return Ok(Err(format!("output {index} has no info")));
        };
        if !info.is_type_space_match(input) {
            return Ok(Err(format!("output {index} is quantized differently from the input")));
        }
        if plan.view_for(slot).is_some() {
            return Ok(Err(format!("output {index} already aliases a concat")));
        }
        for consumer in graph.consumers(slot) {
            let consumer = graph.require(consumer.layer)?;
            if consumer.backend() != Some(backend) {
                return Ok(Err(format!("output {index} is consumed on another backend")));
            }
        }
        views.push((
            slot,
            ViewAssignment {
                parent,
                origin,
                owner: id,
            },
        ));
    }
    Ok(Ok(views))
}

impl GraphPass for MemoryViewPlanningPass {
    fn name(&self) -> &'static str {
        "memory-view-planning"
    }

    fn run(&self, graph: &mut Graph, cx: &mut OptimizeContext<'_>) -> Result<PassResult> {
        let order = graph.topological_order()?.to_vec();
        let mut plan = MemoryPlan::default();

        for layer_type in [LayerType::Concat, LayerType::Split] {
            for id in &order {
                let layer = graph.require(*id)?;
                if layer.layer_type() != layer_type {
                    continue;
                }
                let Some(backend) = supports_views(cx, layer.backend())? else {
                    continue;
                };
                let planned = match layer_type {
                    LayerType::Concat => plan_concat(graph, *id, &backend, &plan)?,
                    _ => plan_split(graph, *id, &backend, &plan)?,
                };
                match planned {
                    Ok(views) => plan.insert_owner(*id, views),
                    Err(reason) => {
                        tracing::debug!(layer = %layer.name(), %reason, "keeping copy-based {layer_type}");
                    }
                }
            }
        }

        let planned = plan.elided.len();
        cx.memory_plan = plan;
        Ok(PassResult {
            changed: false,
            iterations: 1,
            rewrites_applied: planned,
            ..PassResult::default()
        })
    }
}
