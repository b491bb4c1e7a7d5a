//! Insert chains: ordered processor slots attached to a source or bus.

use crate::processor::Processor;
use parking_lot::Mutex;
use std::sync::Arc;

/// Handle identifying a registered processor.
pub type ProcessorHandle = u32;

/// A registered processor: handle, display name, and the unit itself.
///
/// The inner mutex is held for one block on the render thread and for single
/// parameter calls on control threads; both are bounded critical sections.
pub struct ProcessorSlot {
    handle: ProcessorHandle,
    name: String,
    inner: Mutex<Box<dyn Processor>>,
}

impl ProcessorSlot {
    pub fn new(handle: ProcessorHandle, processor: Box<dyn Processor>) -> Arc<Self> {
        let name = processor.name().to_string();
        Arc::new(Self {
            handle,
            name,
            inner: Mutex::new(processor),
        })
    }

    pub fn handle(&self) -> ProcessorHandle {
        self.handle
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lock(&self) -> parking_lot::MutexGuard<'_, Box<dyn Processor>> {
        self.inner.lock()
    }
}

impl std::fmt::Debug for ProcessorSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorSlot")
            .field("handle", &self.handle)
            .field("name", &self.name)
            .finish()
    }
}

/// An ordered, index-addressable list of processor slots.
///
/// A processor's position determines its place in the signal path between
/// the strip's input and its fader/routing stage. Structural mutation happens
/// on control threads only; the render thread sees the chain through mixer
/// snapshots.
#[derive(Debug, Default)]
pub struct Chain {
    slots: Vec<Arc<ProcessorSlot>>,
}

impl Chain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, slot: Arc<ProcessorSlot>) {
        self.slots.push(slot);
    }

    /// Insert at `index`, clamped to the end.
    pub fn insert(&mut self, index: usize, slot: Arc<ProcessorSlot>) {
        let index = index.min(self.slots.len());
        self.slots.insert(index, slot);
    }

    /// Remove by index. Returns the removed slot, or None when out of range.
    pub fn remove(&mut self, index: usize) -> Option<Arc<ProcessorSlot>> {
        if index < self.slots.len() {
            Some(self.slots.remove(index))
        } else {
            None
        }
    }

    /// Reorder: move the slot at `from` to position `to`.
    pub fn shift(&mut self, from: usize, to: usize) -> bool {
        if from >= self.slots.len() || to >= self.slots.len() {
            return false;
        }
        let slot = self.slots.remove(from);
        self.slots.insert(to, slot);
        true
    }

    pub fn clear(&mut self) -> Vec<Arc<ProcessorSlot>> {
        core::mem::take(&mut self.slots)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn at(&self, index: usize) -> Option<&Arc<ProcessorSlot>> {
        self.slots.get(index)
    }

    pub fn slots(&self) -> &[Arc<ProcessorSlot>] {
        &self.slots
    }

    pub fn index_of(&self, handle: ProcessorHandle) -> Option<usize> {
        self.slots.iter().position(|s| s.handle() == handle)
    }
}
