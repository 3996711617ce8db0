//! Per-kind resource descriptors (§3 Data Model: "Resource descriptor", "Resource state flags").
//!
//! Pixel format tables and memory allocation are backend concerns (out of scope); `PixelFormat`
//! and [`StorageClass`] here are opaque enough for merge-compatibility checks in the compiler
//! without pretending to model an actual format table.

use bitflags::bitflags;

/// An opaque pixel format identifier. Two textures are format-compatible for merge purposes iff
/// their formats compare equal; the mapping from this id to an actual GPU format lives in the
/// backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PixelFormat(pub u32);

/// Where a resource's backing memory lives, mirroring the private/shared split every modern GPU
/// API exposes (device-local vs. host-visible memory).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StorageClass {
    /// Device-local memory; fastest for GPU access, not CPU-mappable.
    Private,
    /// Host-visible memory; mappable, slower for the GPU to access.
    Shared,
}

bitflags! {
    /// What accesses a resource's descriptor permits. Every recorded access kind must be covered
    /// by the owning resource's `usage_hint`, or the recorder rejects it (§8 "Usage-hint
    /// coverage").
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct UsageHint: u32 {
        const SHADER_READ       = 1 << 0;
        const SHADER_WRITE      = 1 << 1;
        const VERTEX_BUFFER     = 1 << 2;
        const INDEX_BUFFER      = 1 << 3;
        const CONSTANT_BUFFER   = 1 << 4;
        const INDIRECT_BUFFER   = 1 << 5;
        const BLIT_SOURCE       = 1 << 6;
        const BLIT_DESTINATION  = 1 << 7;
        const RENDER_TARGET     = 1 << 8;
        const INPUT_ATTACHMENT  = 1 << 9;
        const MIP_GENERATION    = 1 << 10;
        const ARGUMENT_BUFFER   = 1 << 11;
        const ACCELERATION_STRUCTURE_BUILD = 1 << 12;
    }
}

bitflags! {
    /// Mutable state tracked alongside a resource. Transient resources never carry this across a
    /// frame reset; persistent resources keep it until explicitly cleared by the recorder/backend.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct ResourceStateFlags: u8 {
        /// Set once the resource's contents have been written at least once. Read-before-write of
        /// an uninitialised persistent resource is a validation warning, not a fatal error, since
        /// some workloads intentionally read garbage (e.g. a history buffer's first frame).
        const INITIALISED = 1 << 0;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferDescriptor {
    pub size: u64,
    pub storage_class: StorageClass,
    pub usage_hint: UsageHint,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TextureDescriptor {
    pub width: u32,
    pub height: u32,
    pub depth_or_array_layers: u32,
    pub mip_level_count: u32,
    pub sample_count: u32,
    pub format: PixelFormat,
    pub storage_class: StorageClass,
    pub usage_hint: UsageHint,
}

impl TextureDescriptor {
    /// Number of addressable `(slice, level)` sub-resources, used to size sub-range bitmasks
    /// (§4.3).
    pub fn subresource_count(&self) -> u32 {
        self.depth_or_array_layers * self.mip_level_count
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ArgumentBufferDescriptor {
    pub encoded_size: u64,
    pub storage_class: StorageClass,
    pub usage_hint: UsageHint,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AccelerationStructureDescriptor {
    pub size: u64,
    pub usage_hint: UsageHint,
}

/// The immutable, by-value description backing a resource handle. Set at allocation time and
/// never changed afterward (§3: "immutable after allocation").
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceDescriptor {
    Buffer(BufferDescriptor),
    Texture(TextureDescriptor),
    ArgumentBuffer(ArgumentBufferDescriptor),
    AccelerationStructure(AccelerationStructureDescriptor),
}

impl ResourceDescriptor {
    pub fn usage_hint(&self) -> UsageHint {
        match self {
            Self::Buffer(d) => d.usage_hint,
            Self::Texture(d) => d.usage_hint,
            Self::ArgumentBuffer(d) => d.usage_hint,
            Self::AccelerationStructure(d) => d.usage_hint,
        }
    }

    /// Where this resource's memory lives. Acceleration structures have no client-visible
    /// storage class (they are always device-local), hence `None`.
    pub fn storage_class(&self) -> Option<StorageClass> {
        match self {
            Self::Buffer(d) => Some(d.storage_class),
            Self::Texture(d) => Some(d.storage_class),
            Self::ArgumentBuffer(d) => Some(d.storage_class),
            Self::AccelerationStructure(_) => None,
        }
    }

    /// §3: `usage_hint` non-empty for persistent resources.
    pub fn validate_for_persistent(&self) -> Result<(), &'static str> {
        if self.usage_hint().is_empty() {
            return Err("persistent resources must declare a non-empty usage_hint");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn texture_subresource_count_multiplies_layers_and_levels() {
        let descriptor = TextureDescriptor {
            width: 256,
            height: 256,
            depth_or_array_layers: 6,
            mip_level_count: 4,
            sample_count: 1,
            format: PixelFormat(0),
            storage_class: StorageClass::Private,
            usage_hint: UsageHint::RENDER_TARGET,
        };

        assert_eq!(descriptor.subresource_count(), 24);
    }

    #[test]
    fn empty_usage_hint_fails_persistent_validation() {
        let descriptor = ResourceDescriptor::Buffer(BufferDescriptor {
            size: 64,
            storage_class: StorageClass::Private,
            usage_hint: UsageHint::empty(),
        });

        assert!(descriptor.validate_for_persistent().is_err());
    }

    #[test]
    fn non_empty_usage_hint_passes_persistent_validation() {
        let descriptor = ResourceDescriptor::Buffer(BufferDescriptor {
            size: 64,
            storage_class: StorageClass::Private,
            usage_hint: UsageHint::SHADER_READ,
        });

        assert!(descriptor.validate_for_persistent().is_ok());
    }
}
