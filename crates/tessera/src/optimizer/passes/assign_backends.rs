use crate::error::{Error, Result};
use crate::graph::{Graph, LayerType};
use crate::optimizer::OptimizeContext;

use super::{backend_supports, GraphPass, PassResult};

/// Gives every layer the first preferred backend that supports it.
pub struct AssignBackendsPass;

impl AssignBackendsPass {
    const NAME: &'static str = "assign-backends";
}

impl GraphPass for AssignBackendsPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&self, graph: &mut Graph, cx: &mut OptimizeContext<'_>) -> Result<PassResult> {
        let order = graph.topological_order()?.to_vec();
        let mut result = PassResult {
            iterations: 1,
            ..PassResult::default()
        };
        for id in order {
            let layer = graph.require(id)?;
            if layer.layer_type() == LayerType::PreCompiled && layer.backend().is_some() {
                continue;
            }
            let current = layer.backend().cloned();
            let name = layer.name().to_string();

            let mut reasons = Vec::new();
            let mut chosen = None;
            for candidate in cx.preferences() {
                match backend_supports(cx, candidate, graph, id)? {
                    Ok(()) => {
                        chosen = Some(candidate.clone());
                        break;
                    }
                    Err(reason) => reasons.push(format!("{candidate}: {reason}")),
                }
            }
            let Some(chosen) = chosen else {
                return Err(Error::LayerNotSupported {
                    layer: name,
                    backends: cx.preferences().to_vec(),
                    reasons,
                });
            };
            if !reasons.is_empty() {
                tracing::debug!(layer = %name, backend = %chosen, skipped = ?reasons, "fell back to a later backend");
            }
            if current.as_ref() != Some(&chosen) {
                graph.set_backend(id, chosen)?;
                result.rewrites_applied += 1;
            }
        }
        result.changed = result.rewrites_applied > 0;
        Ok(result)
    }
}
