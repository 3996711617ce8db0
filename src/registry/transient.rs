//! Transient (per-frame) resource registry (§4.2).

use crate::handle::{ResourceFlags, ResourceHandle, ResourceKind};

/// Fixed-capacity, generation-stamped store for resources whose lifetime is a single frame.
///
/// Written only from the compile thread (per §5's concurrency model), so no interior mutability
/// or atomics are needed here; allocation is a plain cursor bump and exhaustion is fatal.
pub struct TransientRegistry<T> {
    registry_index: u8,
    capacity: u32,
    cursor: u32,
    generation: u8,
    slots: Vec<T>,
}

impl<T> TransientRegistry<T> {
    /// Creates a registry bound to `registry_index` (one of [`crate::handle::MAX_TRANSIENT_REGISTRIES`]
    /// concurrently open indices) with room for `capacity` resources per generation.
    pub fn new(registry_index: u8, capacity: u32) -> Self {
        Self {
            registry_index,
            capacity,
            cursor: 0,
            generation: 0,
            slots: Vec::with_capacity(capacity as usize),
        }
    }

    /// Allocates a new slot for `value`, returning a handle valid until the next [`Self::reset`].
    ///
    /// # Panics
    ///
    /// Exhaustion of `capacity` is a fatal programming error (§4.2): the caller sized the
    /// workload wrong and should raise `transient_registry_capacity` in
    /// [`crate::config::RenderGraphConfig`].
    pub fn allocate(
        &mut self,
        kind: ResourceKind,
        flags: ResourceFlags,
        value: T,
    ) -> (ResourceHandle, &T) {
        assert!(
            self.cursor < self.capacity,
            "transient registry {} exhausted (capacity {})",
            self.registry_index,
            self.capacity
        );

        let slot = self.cursor;
        self.cursor += 1;

        if slot as usize == self.slots.len() {
            self.slots.push(value);
        } else {
            self.slots[slot as usize] = value;
        }

        let handle = ResourceHandle::new(
            kind,
            flags | ResourceFlags::empty(),
            self.registry_index,
            self.generation,
            slot,
        );

        (handle, &self.slots[slot as usize])
    }

    /// Looks up the value behind `handle`, returning `None` if the handle belongs to a different
    /// registry index or a stale generation.
    pub fn get(&self, handle: ResourceHandle) -> Option<&T> {
        if !self.handle_is_current(handle) {
            return None;
        }

        self.slots.get(handle.slot() as usize)
    }

    /// As [`Self::get`], but mutable, for updating per-resource state such as
    /// [`crate::resource::ResourceStateFlags`] in place.
    pub fn get_mut(&mut self, handle: ResourceHandle) -> Option<&mut T> {
        if !self.handle_is_current(handle) {
            return None;
        }

        self.slots.get_mut(handle.slot() as usize)
    }

    fn handle_is_current(&self, handle: ResourceHandle) -> bool {
        !handle.is_persistent()
            && handle.transient_registry() == self.registry_index
            && handle.generation() == self.generation
    }

    /// Bumps the generation and rewinds the allocation cursor, invalidating every handle
    /// outstanding from the previous generation without touching the backing storage.
    pub fn reset(&mut self) {
        self.cursor = 0;
        self.generation = self.generation.wrapping_add(1);
    }

    /// Number of resources allocated in the current generation.
    pub fn len(&self) -> u32 {
        self.cursor
    }

    pub fn is_empty(&self) -> bool {
        self.cursor == 0
    }
}
