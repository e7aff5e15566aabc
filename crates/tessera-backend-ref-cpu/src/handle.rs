//! Host-memory tensor handles.
//!
//! An owned handle holds the storage. A sub-tensor handle keeps a `Weak` reference to
//! the root storage together with its box inside the root, and moves data row by row.
//! Imported caller buffers are adopted as `Bytes` and copied on the first write.

use std::any::Any;
use std::sync::{Arc, RwLock, Weak};

use bytes::Bytes;
use tessera::backend::{BackendError, BackendResult, TensorHandle, TensorHandleFactory};
use tessera::layout::{for_each_region_row, region_fits};
use tessera::tensor::{TensorInfo, TensorShape};

#[derive(Debug)]
enum CpuMemory {
    Unallocated,
    Owned(Vec<u8>),
    Imported(Bytes),
}

impl CpuMemory {
    fn bytes(&self) -> Option<&[u8]> {
        match self {
            CpuMemory::Unallocated => None,
            CpuMemory::Owned(data) => Some(data),
            CpuMemory::Imported(data) => Some(data),
        }
    }

    /// Mutable access, turning an imported buffer into an owned copy first.
    fn bytes_mut(&mut self) -> Option<&mut Vec<u8>> {
        if let CpuMemory::Imported(data) = self {
            *self = CpuMemory::Owned(data.to_vec());
        }
        match self {
            CpuMemory::Owned(data) => Some(data),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct CpuStorage {
    len: usize,
    memory: RwLock<CpuMemory>,
}

#[derive(Debug)]
enum Backing {
    Owned(Arc<CpuStorage>),
    View {
        storage: Weak<CpuStorage>,
        root_shape: TensorShape,
        root_origin: Vec<u32>,
    },
}

#[derive(Debug)]
pub struct CpuTensorHandle {
    info: TensorInfo,
    backing: Backing,
}

impl CpuTensorHandle {
    pub fn new(info: TensorInfo) -> Self {
        let storage = CpuStorage {
            len: info.num_bytes(),
            memory: RwLock::new(CpuMemory::Unallocated),
        };
        Self {
            info,
            backing: Backing::Owned(Arc::new(storage)),
        }
    }

    /// True when the handle currently reads straight from an adopted caller buffer.
    pub fn is_imported(&self) -> bool {
        match &self.backing {
            Backing::Owned(storage) => matches!(
                *storage.memory.read().expect("cpu tensor lock poisoned"),
                CpuMemory::Imported(_)
            ),
            Backing::View { .. } => false,
        }
    }

    fn storage(&self) -> BackendResult<Arc<CpuStorage>> {
        match &self.backing {
            Backing::Owned(storage) => Ok(Arc::clone(storage)),
            Backing::View { storage, .. } => storage.upgrade().ok_or_else(|| {
                BackendError::allocation("sub-tensor outlived its parent storage")
            }),
        }
    }

    fn root_placement(&self) -> (TensorShape, Vec<u32>) {
        match &self.backing {
            Backing::Owned(_) => (self.info.shape.clone(), vec![0; self.info.shape.rank()]),
            Backing::View {
                root_shape,
                root_origin,
                ..
            } => (root_shape.clone(), root_origin.clone()),
        }
    }

    fn check_len(&self, len: usize) -> BackendResult<()> {
        if len != self.info.num_bytes() {
            return Err(BackendError::invalid_argument(format!(
                "tensor {} holds {} bytes, buffer has {len}",
                self.info,
                self.info.num_bytes()
            )));
        }
        Ok(())
    }
}

fn unallocated() -> BackendError {
    BackendError::allocation("tensor handle used before allocation")
}

impl TensorHandle for CpuTensorHandle {
    fn info(&self) -> &TensorInfo {
        &self.info
    }

    fn allocate(&self) -> BackendResult<()> {
        let storage = self.storage()?;
        if let Backing::View { .. } = self.backing {
            // Views share the root allocation.
            return Ok(());
        }
        let mut memory = storage.memory.write().expect("cpu tensor lock poisoned");
        if let CpuMemory::Unallocated = *memory {
            *memory = CpuMemory::Owned(vec![0u8; storage.len]);
        }
        Ok(())
    }

    fn is_allocated(&self) -> bool {
        self.storage().is_ok_and(|storage| {
            !matches!(
                *storage.memory.read().expect("cpu tensor lock poisoned"),
                CpuMemory::Unallocated
            )
        })
    }

    fn is_sub_tensor(&self) -> bool {
        matches!(self.backing, Backing::View { .. })
    }

    fn read(&self, out: &mut [u8]) -> BackendResult<()> {
        self.check_len(out.len())?;
        let storage = self.storage()?;
        let memory = storage.memory.read().expect("cpu tensor lock poisoned");
        let data = memory.bytes().ok_or_else(unallocated)?;
        match &self.backing {
            Backing::Owned(_) => out.copy_from_slice(data),
            Backing::View { .. } => {
                let elem = self.info.data_type.size_in_bytes();
                let (root_shape, origin) = self.root_placement();
                for_each_region_row(&root_shape, &self.info.shape, &origin, |root, region, row| {
                    let (src, dst, len) = (root * elem, region * elem, row * elem);
                    out[dst..dst + len].copy_from_slice(&data[src..src + len]);
                });
            }
        }
        Ok(())
    }

    fn write(&self, input: &[u8]) -> BackendResult<()> {
        self.check_len(input.len())?;
        let storage = self.storage()?;
        let mut memory = storage.memory.write().expect("cpu tensor lock poisoned");
        if let (Backing::Owned(_), CpuMemory::Imported(_)) = (&self.backing, &*memory) {
            *memory = CpuMemory::Owned(input.to_vec());
            return Ok(());
        }
        let data = memory.bytes_mut().ok_or_else(unallocated)?;
        match &self.backing {
            Backing::Owned(_) => data.copy_from_slice(input),
            Backing::View { .. } => {
                let elem = self.info.data_type.size_in_bytes();
                let (root_shape, origin) = self.root_placement();
                for_each_region_row(&root_shape, &self.info.shape, &origin, |root, region, row| {
                    let (dst, src, len) = (root * elem, region * elem, row * elem);
                    data[dst..dst + len].copy_from_slice(&input[src..src + len]);
                });
            }
        }
        Ok(())
    }

    fn import(&self, data: Bytes) -> BackendResult<bool> {
        let Backing::Owned(storage) = &self.backing else {
            return Ok(false);
        };
        let align = self.info.data_type.size_in_bytes();
        if data.len() != storage.len || (data.as_ptr() as usize) % align != 0 {
            return Ok(false);
        }
        *storage.memory.write().expect("cpu tensor lock poisoned") = CpuMemory::Imported(data);
        Ok(true)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CpuTensorHandleFactory;

impl TensorHandleFactory for CpuTensorHandleFactory {
    fn supports_sub_tensors(&self) -> bool {
        true
    }

    fn create_tensor_handle(&self, info: &TensorInfo) -> BackendResult<Arc<dyn TensorHandle>> {
        Ok(Arc::new(CpuTensorHandle::new(info.clone())))
    }

    fn create_sub_tensor_handle(
        &self,
        parent: &Arc<dyn TensorHandle>,
        info: &TensorInfo,
        origin: &[u32],
    ) -> BackendResult<Arc<dyn TensorHandle>> {
        let parent = parent
            .as_any()
            .downcast_ref::<CpuTensorHandle>()
            .ok_or_else(|| {
                BackendError::invalid_argument("sub-tensor parent is not a CPU tensor handle")
            })?;
        if parent.info.data_type.size_in_bytes() != info.data_type.size_in_bytes() {
            return Err(BackendError::invalid_argument(format!(
                "sub-tensor {info} does not share the element size of its parent {}",
                parent.info
            )));
        }
        if !region_fits(&parent.info.shape, &info.shape, origin) {
            return Err(BackendError::invalid_argument(format!(
                "sub-tensor {} at {origin:?} does not fit inside {}",
                info.shape, parent.info.shape
            )));
        }
        let (root_shape, parent_origin) = parent.root_placement();
        let root_origin = parent_origin
            .iter()
            .zip(origin)
            .map(|(base, offset)| base + offset)
            .collect();
        let storage = match &parent.backing {
            Backing::Owned(storage) => Arc::downgrade(storage),
            Backing::View { storage, .. } => storage.clone(),
        };
        Ok(Arc::new(CpuTensorHandle {
            info: info.clone(),
            backing: Backing::View {
                storage,
                root_shape,
                root_origin,
            },
        }))
    }
}
