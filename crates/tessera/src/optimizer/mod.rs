//! Graph optimizer: backend assignment, layout negotiation, canonicalization,
//! memory view planning and partitioning.

mod context;
mod network;
pub mod passes;
mod pipeline;

pub use context::{OptimizeContext, OptimizerOptions};
pub use network::{optimize, OptimizedNetwork};
pub use passes::{MemoryPlan, ViewAssignment};
pub use pipeline::{GraphPass, PassResult, PipelineOptimizer};
