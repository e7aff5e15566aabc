use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Where caller buffers come from when they are imported instead of copied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MemorySource {
    /// Always copy.
    #[default]
    Undefined,
    /// Host heap memory that handles may adopt directly.
    Malloc,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkProperties {
    /// The network may be scheduled on a [`Threadpool`](super::Threadpool).
    pub async_enabled: bool,
    pub input_source: MemorySource,
    pub output_source: MemorySource,
    /// Log per-workload execution times.
    pub profiling_enabled: bool,
}

impl NetworkProperties {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|err| Error::invalid_argument(format!("network properties: {err}")))
    }
}
