use std::sync::Arc;

use crate::backend::{BackendError, BackendResult, HandleId, TensorHandle};

/// One materialized set of tensor handles for a loaded network.
///
/// Each concurrent execution needs its own working memory. Handles are released in
/// reverse creation order so views go before the buffers they alias.
pub struct WorkingMemory {
    handles: Vec<Arc<dyn TensorHandle>>,
}

impl WorkingMemory {
    pub(crate) fn new(handles: Vec<Arc<dyn TensorHandle>>) -> Self {
        Self { handles }
    }

    pub fn handle(&self, id: HandleId) -> BackendResult<&Arc<dyn TensorHandle>> {
        self.handles.get(id.index()).ok_or_else(|| {
            BackendError::invalid_argument(format!("handle {id} is not part of this working memory"))
        })
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn is_allocated(&self) -> bool {
        self.handles.iter().all(|handle| handle.is_allocated())
    }
}

impl Drop for WorkingMemory {
    fn drop(&mut self) {
        while self.handles.pop().is_some() {}
    }
}

impl std::fmt::Debug for WorkingMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkingMemory")
            .field("handles", &self.handles.len())
            .finish()
    }
}
