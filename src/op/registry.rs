//! Fast operation-id registry
//!
//! Maps opaque 64-bit operation ids to live descriptors in O(1). Slots are
//! arena-allocated and carry a generation counter that is bumped on free, so
//! an id that outlives its descriptor resolves to nothing instead of to a
//! recycled slot.

use std::sync::{Arc, Mutex};

use super::{OpId, QueuedOp};

struct Slot {
    generation: u32,
    op: Option<Arc<QueuedOp>>,
}

pub struct OpRegistry {
    inner: Mutex<Inner>,
}

struct Inner {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl OpRegistry {
    pub fn new() -> OpRegistry {
        OpRegistry {
            inner: Mutex::new(Inner {
                slots: Vec::new(),
                free: Vec::new(),
            }),
        }
    }

    /// Assign an id to the descriptor and index it.
    pub fn register(&self, op: &Arc<QueuedOp>) -> OpId {
        let mut inner = self.inner.lock().unwrap();
        let slot_index = match inner.free.pop() {
            Some(index) => index,
            None => {
                inner.slots.push(Slot {
                    // generation zero is reserved so that OpId(0) is invalid
                    generation: 1,
                    op: None,
                });
                (inner.slots.len() - 1) as u32
            }
        };
        let slot = &mut inner.slots[slot_index as usize];
        slot.op = Some(Arc::clone(op));
        let id = OpId::pack(slot_index, slot.generation);
        op.set_id(id);
        id
    }

    /// Resolve an id to its live descriptor, if any.
    pub fn lookup(&self, id: OpId) -> Option<Arc<QueuedOp>> {
        let inner = self.inner.lock().unwrap();
        let slot = inner.slots.get(id.slot() as usize)?;
        if slot.generation != id.generation() {
            return None;
        }
        slot.op.clone()
    }

    /// Free an id's slot, bumping its generation. Returns the descriptor
    /// that occupied it.
    pub fn unregister(&self, id: OpId) -> Option<Arc<QueuedOp>> {
        let mut inner = self.inner.lock().unwrap();
        let slot = inner.slots.get_mut(id.slot() as usize)?;
        if slot.generation != id.generation() {
            return None;
        }
        let op = slot.op.take()?;
        slot.generation = slot.generation.wrapping_add(1).max(1);
        inner.free.push(id.slot());
        Some(op)
    }

    pub fn live_count(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.slots.iter().filter(|s| s.op.is_some()).count()
    }
}

impl Default for OpRegistry {
    fn default() -> Self {
        Self::new()
    }
}
