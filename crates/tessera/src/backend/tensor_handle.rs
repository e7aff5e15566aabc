use std::any::Any;
use std::sync::Arc;

use bytes::Bytes;

use super::error::BackendResult;
use crate::tensor::TensorInfo;

/// Backend-owned storage for one tensor, or a strided view into a parent's storage.
///
/// Creating a handle reserves nothing; memory appears on [`TensorHandle::allocate`].
/// `read` and `write` move data in dense row-major order regardless of how the handle
/// is laid out underneath.
pub trait TensorHandle: Send + Sync + std::fmt::Debug {
    fn info(&self) -> &TensorInfo;

    fn allocate(&self) -> BackendResult<()>;

    fn is_allocated(&self) -> bool;

    fn is_sub_tensor(&self) -> bool {
        false
    }

    fn read(&self, out: &mut [u8]) -> BackendResult<()>;

    fn write(&self, data: &[u8]) -> BackendResult<()>;

    /// Adopts caller memory instead of copying. Returns `false` when the buffer cannot be
    /// imported as-is (wrong size, misaligned, or the handle does not support import).
    fn import(&self, _data: Bytes) -> BackendResult<bool> {
        Ok(false)
    }

    fn read_to_vec(&self) -> BackendResult<Vec<u8>> {
        let mut out = vec![0u8; self.info().num_bytes()];
        self.read(&mut out)?;
        Ok(out)
    }

    fn as_any(&self) -> &dyn Any;
}

pub trait TensorHandleFactory: Send + Sync {
    fn supports_sub_tensors(&self) -> bool;

    fn create_tensor_handle(&self, info: &TensorInfo) -> BackendResult<Arc<dyn TensorHandle>>;

    /// Creates a view of `info`'s shape placed at `origin` inside `parent`.
    fn create_sub_tensor_handle(
        &self,
        parent: &Arc<dyn TensorHandle>,
        info: &TensorInfo,
        origin: &[u32],
    ) -> BackendResult<Arc<dyn TensorHandle>>;
}
