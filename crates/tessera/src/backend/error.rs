use thiserror::Error;

use crate::graph::LayerType;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("{layer_type} is not supported: {reason}")]
    Unsupported { layer_type: LayerType, reason: String },
    #[error("invalid workload argument: {0}")]
    InvalidArgument(String),
    #[error("backend execution failure: {message}")]
    Execution { message: String },
    #[error("tensor allocation failure: {0}")]
    Allocation(String),
}

impl BackendError {
    pub fn unsupported(layer_type: LayerType, reason: impl Into<String>) -> Self {
        BackendError::Unsupported {
            layer_type,
            reason: reason.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        BackendError::InvalidArgument(message.into())
    }

    pub fn execution(message: impl Into<String>) -> Self {
        BackendError::Execution {
            message: message.into(),
        }
    }

    pub fn allocation(message: impl Into<String>) -> Self {
        BackendError::Allocation(message.into())
    }
}

/// Convenience alias for results returned by backend routines.
pub type BackendResult<T> = Result<T, BackendError>;
