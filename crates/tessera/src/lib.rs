//! Tessera: a neural-network inference engine core.
//!
//! A [`graph::Graph`] of typed layers is optimized against an ordered list of
//! backend preferences into an [`optimizer::OptimizedNetwork`], loaded into a
//! [`runtime::Runtime`] and executed either synchronously or on a
//! [`runtime::Threadpool`]. Backends plug in through the traits in [`backend`].

pub mod backend;
pub mod env;
pub mod error;
pub mod graph;
pub mod layout;
pub mod optimizer;
pub mod runtime;
pub mod tensor;

pub use backend::{Backend, BackendId, BackendRegistry, DeviceSpec};
pub use error::{Error, Result, Status};
pub use graph::{Graph, LayerId, LayerType};
pub use layout::DataLayout;
pub use optimizer::{optimize, OptimizedNetwork, OptimizerOptions};
pub use runtime::{NetworkId, NetworkProperties, Runtime};
pub use tensor::{ConstTensor, DataType, Tensor, TensorInfo, TensorShape};
