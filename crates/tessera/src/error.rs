use thiserror::Error;

use crate::backend::{BackendError, BackendId};

/// Errors raised while building, optimizing, loading or running a network.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid graph: {0}")]
    InvalidGraph(String),
    #[error(
        "layer '{layer}' is not supported by any preferred backend [{}]: {}",
        join_ids(.backends),
        .reasons.join("; ")
    )]
    LayerNotSupported {
        layer: String,
        backends: Vec<BackendId>,
        reasons: Vec<String>,
    },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("runtime error: {0}")]
    Runtime(String),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

fn join_ids(ids: &[BackendId]) -> String {
    ids.iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

impl Error {
    pub fn invalid_graph(message: impl Into<String>) -> Self {
        Error::InvalidGraph(message.into())
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Error::InvalidArgument(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Error::Runtime(message.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Outcome of a single inference.
///
/// Data-dependent workload failures surface as [`Status::Failure`] rather than an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Success,
    Failure,
}

impl Status {
    pub fn is_success(self) -> bool {
        matches!(self, Status::Success)
    }
}
