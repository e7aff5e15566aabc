use crate::error::Result;
use crate::graph::{Graph, InputSlotId, LayerId, LayerParams, LayerType, OutputSlotId, PermuteDescriptor};
use crate::layout::is_identity_permutation;
use crate::optimizer::OptimizeContext;

use super::{GraphPass, PassResult};

fn compose_perms(first: &[u32], second: &[u32]) -> Option<Vec<u32>> {
    if first.len() != second.len() {
        return None;
    }
    let mut result = Vec::with_capacity(first.len());
    for &axis in second {
        result.push(*first.get(axis as usize)?);
    }
    Some(result)
}

/// Producer layer of input 0 when it is of `layer_type` and feeds nothing else.
fn sole_producer_of_type(graph: &Graph, id: LayerId, layer_type: LayerType) -> Option<LayerId> {
    let from = graph.producer(InputSlotId::new(id, 0))?;
    let producer = graph.layer(from.layer)?;
    if producer.layer_type() != layer_type || graph.consumers(from).len() != 1 {
        return None;
    }
    Some(from.layer)
}

/// Rewires `id` to read from `upstream`'s producer and erases `upstream`.
fn skip_upstream(graph: &mut Graph, id: LayerId, upstream: LayerId) -> Result<()> {
    let input = InputSlotId::new(id, 0);
    let Some(source) = graph.producer(InputSlotId::new(upstream, 0)) else {
        return Ok(());
    };
    graph.disconnect(input)?;
    graph.erase_layer(upstream)?;
    graph.connect(source, input)
}

fn layers_of(graph: &Graph, layer_type: LayerType) -> Result<Vec<LayerId>> {
    Ok(graph
        .topological_order()?
        .iter()
        .copied()
        .filter(|id| graph.layer(*id).map(|l| l.layer_type()) == Some(layer_type))
        .collect())
}

fn finish(mut result: PassResult) -> Result<PassResult> {
    result.iterations = 1;
    result.changed = result.rewrites_applied > 0;
    Ok(result)
}

/// Drops identity Permutes and folds Permute chains; inverse pairs vanish entirely.
pub struct PermuteCanonicalizationPass;

impl GraphPass for PermuteCanonicalizationPass {
    fn name(&self) -> &'static str {
        "permute-canonicalize"
    }

    fn run(&self, graph: &mut Graph, _cx: &mut OptimizeContext<'_>) -> Result<PassResult> {
        let mut result = PassResult::default();
        for id in layers_of(graph, LayerType::Permute)? {
            let Some(layer) = graph.layer(id) else { continue };
            let LayerParams::Permute(desc) = layer.params() else { continue };
            let outer = desc.mappings.clone();

            if is_identity_permutation(&outer) {
                graph.bypass_layer(id)?;
                result.rewrites_applied += 1;
                result.erased_layers += 1;
                continue;
            }
            let Some(upstream) = sole_producer_of_type(graph, id, LayerType::Permute) else {
                continue;
            };
            let Some(LayerParams::Permute(inner)) = graph.layer(upstream).map(|l| l.params())
            else {
                continue;
            };
            let Some(composed) = compose_perms(&inner.mappings, &outer) else {
                continue;
            };
            if is_identity_permutation(&composed) {
                graph.bypass_layer(id)?;
                graph.bypass_layer(upstream)?;
                result.erased_layers += 2;
            } else {
                skip_upstream(graph, id, upstream)?;
                graph.set_params(
                    id,
                    LayerParams::Permute(PermuteDescriptor { mappings: composed }),
                )?;
                result.erased_layers += 1;
            }
            result.rewrites_applied += 1;
        }
        finish(result)
    }
}

/// Drops no-op Reshapes and collapses Reshape chains into the last Reshape.
pub struct ReshapeCanonicalizationPass;

impl GraphPass for ReshapeCanonicalizationPass {
    fn name(&self) -> &'static str {
        "reshape-canonicalize"
    }

    fn run(&self, graph: &mut Graph, _cx: &mut OptimizeContext<'_>) -> Result<PassResult> {
        let mut result = PassResult::default();
        for id in layers_of(graph, LayerType::Reshape)? {
            if graph.layer(id).is_none() {
                continue;
            }
            if let Some(upstream) = sole_producer_of_type(graph, id, LayerType::Reshape) {
                skip_upstream(graph, id, upstream)?;
                result.rewrites_applied += 1;
                result.erased_layers += 1;
            }
            let Some(from) = graph.producer(InputSlotId::new(id, 0)) else {
                continue;
            };
            let same = match (graph.tensor_info(from), graph.tensor_info(OutputSlotId::new(id, 0))) {
                (Some(input), Some(output)) => input.shape == output.shape,
                _ => false,
            };
            if same {
                graph.bypass_layer(id)?;
                result.rewrites_applied += 1;
                result.erased_layers += 1;
            }
        }
        finish(result)
    }
}

/// Removes Float16 -> Float32 -> Float16 conversion round trips.
pub struct ConversionCanonicalizationPass;

impl GraphPass for ConversionCanonicalizationPass {
    fn name(&self) -> &'static str {
        "conversion-canonicalize"
    }

    fn run(&self, graph: &mut Graph, _cx: &mut OptimizeContext<'_>) -> Result<PassResult> {
        let mut result = PassResult::default();
        for id in layers_of(graph, LayerType::ConvertFp32ToFp16)? {
            if graph.layer(id).is_none() {
                continue;
            }
            let Some(upstream) = sole_producer_of_type(graph, id, LayerType::ConvertFp16ToFp32)
            else {
                continue;
            };
            graph.bypass_layer(id)?;
            graph.bypass_layer(upstream)?;
            result.rewrites_applied += 1;
            result.erased_layers += 2;
        }
        finish(result)
    }
}
