use crate::error::{Error, Result};
use crate::graph::{DebugDescriptor, Graph, LayerParams, LayerType, OutputSlotId};
use crate::optimizer::OptimizeContext;

use super::{backend_supports, GraphPass, PassResult};

/// Inserts a Debug layer after every consumed layer output, including the permutes
/// and copies earlier passes synthesized. Each tap runs on its producer's backend.
pub struct DebugInsertionPass {
    pub to_file: bool,
}

impl GraphPass for DebugInsertionPass {
    fn name(&self) -> &'static str {
        "debug-insertion"
    }

    fn run(&self, graph: &mut Graph, cx: &mut OptimizeContext<'_>) -> Result<PassResult> {
        let targets: Vec<_> = graph
            .layers()
            .filter(|layer| !matches!(layer.layer_type(), LayerType::Output | LayerType::Debug))
            .map(|layer| {
                (
                    layer.id(),
                    layer.name().to_string(),
                    layer.outputs().len(),
                    layer.backend().cloned(),
                )
            })
            .collect();
        let mut result = PassResult {
            iterations: 1,
            ..PassResult::default()
        };
        for (id, name, num_outputs, backend) in targets {
            for index in 0..num_outputs {
                let slot = OutputSlotId::new(id, index as u32);
                if graph.consumers(slot).is_empty() {
                    continue;
                }
                let Some(info) = graph.tensor_info(slot).cloned() else {
                    continue;
                };
                let debug = graph.insert_layer_after(
                    slot,
                    LayerParams::Debug(DebugDescriptor {
                        layer_name: name.clone(),
                        slot_index: index as u32,
                        to_file: self.to_file,
                    }),
                    format!("DebugLayerAfter{name}_{index}"),
                )?;
                graph.set_tensor_info(OutputSlotId::new(debug, 0), info)?;
                let backend = backend.clone().ok_or_else(|| {
                    Error::invalid_argument(format!("layer {name} has no backend assigned"))
                })?;
                if let Err(reason) = backend_supports(cx, &backend, graph, debug)? {
                    return Err(Error::LayerNotSupported {
                        layer: graph.require(debug)?.name().to_string(),
                        backends: vec![backend],
                        reasons: vec![reason],
                    });
                }
                graph.set_backend(debug, backend)?;
                result.inserted_layers += 1;
            }
        }
        // Views into a tapped output are no longer exclusive to their owner.
        cx.memory_plan.retain_live(graph);
        result.rewrites_applied = result.inserted_layers;
        result.changed = result.inserted_layers > 0;
        Ok(result)
    }
}
