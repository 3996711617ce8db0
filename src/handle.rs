//! Opaque 64-bit resource handles.
//!
//! Bit layout (low to high): `slot(28) | transient_registry(4) | generation(8) | flags(16) |
//! kind(4)`. Two handles compare equal iff their bit patterns are identical.

use std::fmt::{self, Debug, Formatter};

/// The kind of GPU resource a [`ResourceHandle`] refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ResourceKind {
    Buffer = 0,
    Texture = 1,
    ArgumentBuffer = 2,
    AccelerationStructure = 3,
}

impl ResourceKind {
    const fn from_bits(bits: u8) -> Self {
        match bits {
            0 => Self::Buffer,
            1 => Self::Texture,
            2 => Self::ArgumentBuffer,
            3 => Self::AccelerationStructure,
            _ => panic!("invalid resource kind bits"),
        }
    }
}

bitflags::bitflags! {
    /// Per-handle flags, set at resource creation and immutable thereafter.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct ResourceFlags: u16 {
        const PERSISTENT = 1 << 0;
        const WINDOW_HANDLE = 1 << 1;
        const HISTORY_BUFFER = 1 << 2;
        const EXTERNAL_OWNERSHIP = 1 << 3;
        const IMMUTABLE_ONCE_INITIALISED = 1 << 4;
        const RESOURCE_VIEW = 1 << 5;
        /// Backed by host-visible (`StorageClass::Shared`) memory. A pass that reads a
        /// host-visible resource is also treated as a writer of it for dependency-ordering
        /// purposes, since the CPU readback it implies forces a GPU→CPU flush that later
        /// accesses must be ordered after.
        const HOST_VISIBLE = 1 << 6;
    }
}

const SLOT_BITS: u32 = 28;
const TRANSIENT_REGISTRY_BITS: u32 = 4;
const GENERATION_BITS: u32 = 8;
const FLAGS_BITS: u32 = 16;

const SLOT_SHIFT: u32 = 0;
const TRANSIENT_REGISTRY_SHIFT: u32 = SLOT_SHIFT + SLOT_BITS;
const GENERATION_SHIFT: u32 = TRANSIENT_REGISTRY_SHIFT + TRANSIENT_REGISTRY_BITS;
const FLAGS_SHIFT: u32 = GENERATION_SHIFT + GENERATION_BITS;
const KIND_SHIFT: u32 = FLAGS_SHIFT + FLAGS_BITS;

const SLOT_MASK: u64 = (1 << SLOT_BITS) - 1;
const TRANSIENT_REGISTRY_MASK: u64 = (1 << TRANSIENT_REGISTRY_BITS) - 1;
const GENERATION_MASK: u64 = (1 << GENERATION_BITS) - 1;
const FLAGS_MASK: u64 = (1 << FLAGS_BITS) - 1;
const KIND_MASK: u64 = 0xf;

/// Maximum number of live slots a single registry (transient or persistent) may hand out.
pub const MAX_SLOT_INDEX: u32 = (1 << SLOT_BITS) - 1;

/// Maximum number of concurrently-open transient registries (one per in-flight frame index).
pub const MAX_TRANSIENT_REGISTRIES: u32 = 1 << TRANSIENT_REGISTRY_BITS;

/// An opaque 64-bit handle to a buffer, texture, argument buffer or acceleration structure.
///
/// A handle is valid only as long as the generation embedded in it matches the generation
/// currently stored in the slot it names (see [`crate::registry`]); once a transient registry is
/// reset, or a persistent slot is freed and reused, stale handles from a previous generation
/// silently (and safely) fail validation rather than aliasing a different resource.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceHandle(u64);

impl ResourceHandle {
    pub(crate) fn new(
        kind: ResourceKind,
        flags: ResourceFlags,
        transient_registry: u8,
        generation: u8,
        slot: u32,
    ) -> Self {
        assert!(slot <= MAX_SLOT_INDEX, "resource slot index overflow");
        assert!(
            (transient_registry as u64) <= TRANSIENT_REGISTRY_MASK,
            "transient registry index overflow"
        );

        let bits = ((kind as u64) << KIND_SHIFT)
            | ((flags.bits() as u64 & FLAGS_MASK) << FLAGS_SHIFT)
            | ((generation as u64) << GENERATION_SHIFT)
            | ((transient_registry as u64) << TRANSIENT_REGISTRY_SHIFT)
            | ((slot as u64) << SLOT_SHIFT);

        Self(bits)
    }

    /// The resource kind encoded in this handle.
    pub fn kind(self) -> ResourceKind {
        ResourceKind::from_bits(((self.0 >> KIND_SHIFT) & KIND_MASK) as u8)
    }

    /// The flags this resource was created with.
    pub fn flags(self) -> ResourceFlags {
        ResourceFlags::from_bits_truncate(((self.0 >> FLAGS_SHIFT) & FLAGS_MASK) as u16)
    }

    pub(crate) fn generation(self) -> u8 {
        ((self.0 >> GENERATION_SHIFT) & GENERATION_MASK) as u8
    }

    pub(crate) fn transient_registry(self) -> u8 {
        ((self.0 >> TRANSIENT_REGISTRY_SHIFT) & TRANSIENT_REGISTRY_MASK) as u8
    }

    pub(crate) fn slot(self) -> u32 {
        (self.0 & SLOT_MASK) as u32
    }

    /// Whether this handle names a persistent (cross-frame) resource.
    pub fn is_persistent(self) -> bool {
        self.flags().contains(ResourceFlags::PERSISTENT)
    }

    /// The raw 64-bit representation, stable for the lifetime of the resource it names.
    pub fn to_bits(self) -> u64 {
        self.0
    }
}

impl Debug for ResourceHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceHandle")
            .field("kind", &self.kind())
            .field("flags", &self.flags())
            .field("generation", &self.generation())
            .field("transient_registry", &self.transient_registry())
            .field("slot", &self.slot())
            .finish()
    }
}
