//! Persistent (cross-frame) resource registry (§4.2).

use crate::handle::{ResourceFlags, ResourceHandle, ResourceKind};
use crate::sync::{lock, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const CHUNK_SIZE: usize = 256;

/// Liveness-tracking state for one persistent slot, reachable without the registry's structural
/// lock so the submission driver and the backend can update it off the hot compile path.
///
/// `active_render_graphs` is a bitmask, one bit per concurrently executing graph (§4.2); the two
/// wait indices are command indices on the single global submission stream (§9 Open Question 3).
#[derive(Debug, Default)]
pub struct SlotAtomics {
    active_render_graphs: AtomicU64,
    read_wait_index: AtomicU64,
    write_wait_index: AtomicU64,
}

impl SlotAtomics {
    /// Sets `graph_bit` in the in-use mask. Called when a pass binds the resource.
    pub fn mark_in_use(&self, graph_bit: u64) {
        self.active_render_graphs.fetch_or(graph_bit, Ordering::Relaxed);
    }

    /// Clears `graph_bit`. Called by the backend once that graph's submission completes.
    pub fn clear_in_use(&self, graph_bit: u64) {
        self.active_render_graphs
            .fetch_and(!graph_bit, Ordering::Relaxed);
    }

    pub fn read_wait_index(&self) -> u64 {
        self.read_wait_index.load(Ordering::Relaxed)
    }

    pub fn write_wait_index(&self) -> u64 {
        self.write_wait_index.load(Ordering::Relaxed)
    }

    /// Advances the read-wait index monotonically. The index only ever moves forward, so a
    /// `fetch_max` tolerates out-of-order completion notifications.
    pub fn advance_read_wait(&self, command_index: u64) {
        self.read_wait_index.fetch_max(command_index, Ordering::Relaxed);
    }

    pub fn advance_write_wait(&self, command_index: u64) {
        self.write_wait_index.fetch_max(command_index, Ordering::Relaxed);
    }

    /// `is_known_in_use = (mask != 0) ∨ (any queue wait index > last-completed)` (§4.2).
    pub fn is_known_in_use(&self, last_completed_index: u64) -> bool {
        self.active_render_graphs.load(Ordering::Relaxed) != 0
            || self.read_wait_index() > last_completed_index
            || self.write_wait_index() > last_completed_index
    }
}

/// A live persistent resource: the opaque handle plus lock-free access to its liveness atomics.
#[derive(Clone)]
pub struct PersistentSlotHandle {
    handle: ResourceHandle,
    atomics: Arc<SlotAtomics>,
}

impl PersistentSlotHandle {
    pub fn handle(&self) -> ResourceHandle {
        self.handle
    }

    pub fn atomics(&self) -> &SlotAtomics {
        &self.atomics
    }
}

struct Slot<T> {
    value: Option<T>,
    generation: u8,
    atomics: Arc<SlotAtomics>,
}

fn new_chunk<T>() -> Box<[Slot<T>]> {
    std::iter::repeat_with(|| Slot {
        value: None,
        generation: 0,
        atomics: Arc::new(SlotAtomics::default()),
    })
    .take(CHUNK_SIZE)
    .collect::<Vec<_>>()
    .into_boxed_slice()
}

struct State<T> {
    chunks: Vec<Box<[Slot<T>]>>,
    free_list: Vec<u32>,
}

/// Global, chunked store for resources that survive across frames. Freed slots return to a
/// free-list and are reissued with a bumped generation, the same way `screen-13`'s pools recycle
/// backing resources instead of recreating them each frame.
pub struct PersistentRegistry<T> {
    state: Mutex<State<T>>,
}

impl<T> PersistentRegistry<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                chunks: Vec::new(),
                free_list: Vec::new(),
            }),
        }
    }

    /// Allocates a new persistent slot for `value`.
    pub fn allocate(&self, kind: ResourceKind, flags: ResourceFlags, value: T) -> PersistentSlotHandle {
        let mut state = lock(&self.state);

        let slot_index = state.free_list.pop().unwrap_or_else(|| {
            let base = (state.chunks.len() * CHUNK_SIZE) as u32;
            state.chunks.push(new_chunk());

            for i in (1..CHUNK_SIZE as u32).rev() {
                state.free_list.push(base + i);
            }

            base
        });

        let chunk = slot_index as usize / CHUNK_SIZE;
        let offset = slot_index as usize % CHUNK_SIZE;
        let slot = &mut state.chunks[chunk][offset];

        slot.value = Some(value);
        slot.atomics = Arc::new(SlotAtomics::default());

        let handle = ResourceHandle::new(
            kind,
            flags | ResourceFlags::PERSISTENT,
            0,
            slot.generation,
            slot_index,
        );

        PersistentSlotHandle {
            handle,
            atomics: Arc::clone(&slot.atomics),
        }
    }

    /// Frees the slot behind `handle`, returning the stored value.
    ///
    /// # Panics
    ///
    /// A stale generation or a slot already freed is a fatal programming error.
    pub fn free(&self, handle: ResourceHandle) -> T {
        let mut state = lock(&self.state);

        let slot_index = handle.slot();
        let chunk = slot_index as usize / CHUNK_SIZE;
        let offset = slot_index as usize % CHUNK_SIZE;
        let slot = &mut state.chunks[chunk][offset];

        assert_eq!(
            slot.generation,
            handle.generation(),
            "stale or double-freed persistent handle {handle:?}"
        );

        let value = slot
            .value
            .take()
            .unwrap_or_else(|| panic!("double free of persistent slot {handle:?}"));
        slot.generation = slot.generation.wrapping_add(1);
        state.free_list.push(slot_index);

        value
    }

    /// Invokes `f` with the value behind `handle`. Returns `None` if the handle is stale.
    pub fn with<R>(&self, handle: ResourceHandle, f: impl FnOnce(&T) -> R) -> Option<R> {
        let state = lock(&self.state);

        let slot_index = handle.slot();
        let chunk = slot_index as usize / CHUNK_SIZE;
        let offset = slot_index as usize % CHUNK_SIZE;
        let slot = state.chunks.get(chunk)?.get(offset)?;

        if slot.generation != handle.generation() {
            return None;
        }

        slot.value.as_ref().map(f)
    }
}

impl<T> Default for PersistentRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_and_resolves() {
        let registry: PersistentRegistry<u32> = PersistentRegistry::new();

        let slot = registry.allocate(ResourceKind::Texture, ResourceFlags::empty(), 5);
        assert!(slot.handle().is_persistent());
        assert_eq!(registry.with(slot.handle(), |v| *v), Some(5));
    }

    #[test]
    fn free_invalidates_and_recycles_slot() {
        let registry: PersistentRegistry<u32> = PersistentRegistry::new();

        let slot = registry.allocate(ResourceKind::Buffer, ResourceFlags::empty(), 1);
        let handle = slot.handle();
        registry.free(handle);

        assert_eq!(registry.with(handle, |v| *v), None);

        let reused = registry.allocate(ResourceKind::Buffer, ResourceFlags::empty(), 2);
        assert_eq!(reused.handle().slot(), handle.slot());
        assert_ne!(reused.handle(), handle);
    }

    #[test]
    #[should_panic(expected = "stale or double-freed")]
    fn double_free_is_fatal() {
        let registry: PersistentRegistry<u32> = PersistentRegistry::new();

        let slot = registry.allocate(ResourceKind::Buffer, ResourceFlags::empty(), 1);
        registry.free(slot.handle());
        registry.free(slot.handle());
    }

    #[test]
    fn in_use_tracking_is_lock_free_and_shared() {
        let registry: PersistentRegistry<u32> = PersistentRegistry::new();
        let slot = registry.allocate(ResourceKind::Buffer, ResourceFlags::empty(), 1);

        slot.atomics().mark_in_use(1 << 2);
        assert!(slot.atomics().is_known_in_use(0));

        slot.atomics().clear_in_use(1 << 2);
        assert!(!slot.atomics().is_known_in_use(0));

        slot.atomics().advance_write_wait(10);
        assert!(slot.atomics().is_known_in_use(5));
        assert!(!slot.atomics().is_known_in_use(10));
    }

    #[test]
    fn allocates_past_a_single_chunk() {
        let registry: PersistentRegistry<u32> = PersistentRegistry::new();

        let handles: Vec<_> = (0..CHUNK_SIZE as u32 + 5)
            .map(|i| registry.allocate(ResourceKind::Buffer, ResourceFlags::empty(), i))
            .collect();

        for (i, slot) in handles.iter().enumerate() {
            assert_eq!(registry.with(slot.handle(), |v| *v), Some(i as u32));
        }
    }
}
