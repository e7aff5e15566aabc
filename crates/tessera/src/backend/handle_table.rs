use std::collections::HashMap;
use std::sync::Arc;

use super::error::{BackendError, BackendResult};
use super::id::BackendId;
use super::tensor_handle::{TensorHandle, TensorHandleFactory};
use super::workload::HandleId;
use crate::graph::OutputSlotId;
use crate::layout::{region_fits, regions_overlap};
use crate::runtime::WorkingMemory;
use crate::tensor::{TensorInfo, TensorShape};

#[derive(Debug, Clone, PartialEq)]
pub enum HandleKind {
    Owned,
    /// Box of the entry's shape at `origin` inside `parent`.
    View { parent: HandleId, origin: Vec<u32> },
}

#[derive(Debug, Clone)]
pub struct HandleEntry {
    pub id: HandleId,
    pub slot: OutputSlotId,
    pub info: TensorInfo,
    pub backend: BackendId,
    pub kind: HandleKind,
    /// Owning root handle and the view's origin inside it.
    pub root: HandleId,
    pub root_origin: Vec<u32>,
    /// Byte range spanned inside the root buffer, first element to last.
    pub byte_offset: usize,
    pub byte_len: usize,
}

/// Every tensor handle a loaded network needs, indexed by [`HandleId`].
///
/// Views always follow their parent, and sibling views of one parent never overlap.
/// The table is a recipe: [`HandleTable::materialize`] creates and allocates one
/// concrete set of handles per working memory.
#[derive(Debug, Clone, Default)]
pub struct HandleTable {
    entries: Vec<HandleEntry>,
    by_slot: HashMap<OutputSlotId, HandleId>,
}

fn linear_offset(shape: &TensorShape, coord: &[u32]) -> usize {
    shape
        .strides()
        .iter()
        .zip(coord)
        .map(|(stride, &c)| stride * c as usize)
        .sum()
}

impl HandleTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_owned(&mut self, slot: OutputSlotId, info: TensorInfo, backend: BackendId) -> HandleId {
        let id = HandleId(self.entries.len() as u32);
        let rank = info.shape.rank();
        let byte_len = info.num_bytes();
        self.entries.push(HandleEntry {
            id,
            slot,
            info,
            backend,
            kind: HandleKind::Owned,
            root: id,
            root_origin: vec![0; rank],
            byte_offset: 0,
            byte_len,
        });
        self.by_slot.insert(slot, id);
        id
    }

    pub fn add_view(
        &mut self,
        slot: OutputSlotId,
        info: TensorInfo,
        backend: BackendId,
        parent: HandleId,
        origin: Vec<u32>,
    ) -> BackendResult<HandleId> {
        let parent_entry = self.entries.get(parent.index()).ok_or_else(|| {
            BackendError::invalid_argument(format!("view parent {parent} does not exist"))
        })?;
        if parent_entry.backend != backend {
            return Err(BackendError::invalid_argument(format!(
                "view on {backend} cannot alias a {} handle",
                parent_entry.backend
            )));
        }
        if parent_entry.info.data_type.size_in_bytes() != info.data_type.size_in_bytes() {
            return Err(BackendError::invalid_argument(format!(
                "view {} cannot alias parent {}",
                info, parent_entry.info
            )));
        }
        if !region_fits(&parent_entry.info.shape, &info.shape, &origin) {
            return Err(BackendError::invalid_argument(format!(
                "view {} at {origin:?} exceeds parent {}",
                info.shape, parent_entry.info.shape
            )));
        }
        for sibling in self.children(parent) {
            if let HandleKind::View { origin: other, .. } = &sibling.kind {
                if regions_overlap(&sibling.info.shape, other, &info.shape, &origin) {
                    return Err(BackendError::invalid_argument(format!(
                        "view {} at {origin:?} overlaps view {} of {parent}",
                        info.shape, sibling.id
                    )));
                }
            }
        }

        if info.num_elements() == 0 {
            return Err(BackendError::invalid_argument(format!(
                "view {} of {parent} is empty",
                info.shape
            )));
        }

        let root = parent_entry.root;
        let root_origin = parent_entry
            .root_origin
            .iter()
            .zip(&origin)
            .map(|(a, b)| a.checked_add(*b))
            .collect::<Option<Vec<u32>>>();
        let last = root_origin.as_ref().and_then(|root_origin| {
            root_origin
                .iter()
                .zip(info.shape.dims())
                .map(|(o, d)| o.checked_add(*d).and_then(|end| end.checked_sub(1)))
                .collect::<Option<Vec<u32>>>()
        });
        let (Some(root_origin), Some(last)) = (root_origin, last) else {
            return Err(BackendError::invalid_argument(format!(
                "view {} at {origin:?} overflows the root of {parent}",
                info.shape
            )));
        };
        let root_shape = &self.entries[root.index()].info.shape;
        let element_size = info.data_type.size_in_bytes();
        let first = linear_offset(root_shape, &root_origin);
        let end = linear_offset(root_shape, &last) + 1;

        let id = HandleId(self.entries.len() as u32);
        self.entries.push(HandleEntry {
            id,
            slot,
            info,
            backend,
            kind: HandleKind::View { parent, origin },
            root,
            root_origin,
            byte_offset: first * element_size,
            byte_len: (end - first) * element_size,
        });
        self.by_slot.insert(slot, id);
        Ok(id)
    }

    pub fn handle_for_slot(&self, slot: OutputSlotId) -> Option<HandleId> {
        self.by_slot.get(&slot).copied()
    }

    pub fn entry(&self, id: HandleId) -> Option<&HandleEntry> {
        self.entries.get(id.index())
    }

    pub fn entries(&self) -> &[HandleEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn children(&self, parent: HandleId) -> impl Iterator<Item = &HandleEntry> + '_ {
        self.entries.iter().filter(move |entry| {
            matches!(&entry.kind, HandleKind::View { parent: p, .. } if *p == parent)
        })
    }

    pub fn has_views(&self, id: HandleId) -> bool {
        self.children(id).next().is_some()
    }

    /// Creates every handle through its backend's factory, then allocates.
    pub fn materialize(
        &self,
        factories: &HashMap<BackendId, Arc<dyn TensorHandleFactory>>,
    ) -> BackendResult<WorkingMemory> {
        let mut handles: Vec<Arc<dyn TensorHandle>> = Vec::with_capacity(self.entries.len());
        for entry in &self.entries {
            let factory = factories.get(&entry.backend).ok_or_else(|| {
                BackendError::allocation(format!(
                    "no tensor handle factory for backend {}",
                    entry.backend
                ))
            })?;
            let handle = match &entry.kind {
                HandleKind::Owned => factory.create_tensor_handle(&entry.info)?,
                HandleKind::View { parent, origin } => {
                    if !factory.supports_sub_tensors() {
                        return Err(BackendError::invalid_argument(format!(
                            "backend {} cannot create sub-tensors",
                            entry.backend
                        )));
                    }
                    factory.create_sub_tensor_handle(&handles[parent.index()], &entry.info, origin)?
                }
            };
            handles.push(handle);
        }
        for handle in &handles {
            handle.allocate()?;
        }
        Ok(WorkingMemory::new(handles))
    }
}
