//! Layer graph IR: the arena, slot connections, shape inference and subgraph views.

mod builder;
pub mod descriptors;
#[allow(clippy::module_inception)]
mod graph;
mod layer;
mod shape_inference;
mod subgraph;

pub use descriptors::*;
pub use graph::Graph;
pub use layer::{
    InputSlot, InputSlotId, Layer, LayerId, LayerOrigin, LayerParams, LayerType, OutputSlot,
    OutputSlotId,
};
pub use shape_inference::{
    broadcast_shapes, concat_view_origins, infer_output_infos, split_view_origins,
    ShapeInferenceMethod,
};
pub use subgraph::{select_backend_runs, SubgraphView};
