//! Pass records (§4.5 Pass kinds and execution contract, §3 Data Model: "Pass record").

use crate::handle::ResourceHandle;
use smallvec::SmallVec;
use std::ops::Range;

/// What a pass does and how the compiler is allowed to treat it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PassKind {
    /// Runs serially, in submission order, on the compile thread.
    Cpu,
    /// Has a render-targets descriptor; emits a draw-encoder command stream.
    Draw,
    /// Emits a compute-encoder stream.
    Compute,
    /// Emits a copy/synchronise stream.
    Blit,
    /// Opaque; considered to have side effects unconditionally.
    External,
    /// Modifies acceleration structures; executes serially.
    AccelerationStructure,
}

impl PassKind {
    pub fn is_cpu(self) -> bool {
        self == Self::Cpu
    }
}

/// An inline, merge-compatibility-checkable summary of a draw pass's render targets, used by the
/// compiler's draw-pass merge grouping stage (§4.6(e)). Colour attachment formats/sample counts
/// are opaque resource-format ids; real compatibility semantics live in the backend, so here two
/// descriptors are mergeable iff their conflict-relevant fields match exactly.
#[derive(Clone, Debug, PartialEq)]
pub struct RenderTargetsDescriptor {
    pub color_attachments: SmallVec<[ResourceHandle; 4]>,
    pub depth_stencil_attachment: Option<ResourceHandle>,
    pub sample_count: u32,
    pub width: u32,
    pub height: u32,
}

impl RenderTargetsDescriptor {
    /// Whether `self` and `other` can share one render-target group: no attachment conflict and
    /// compatible sample counts/sizes (§4.6(e)).
    pub fn mergeable_with(&self, other: &Self) -> bool {
        if self.sample_count != other.sample_count {
            return false;
        }

        if self.width != other.width || self.height != other.height {
            return false;
        }

        let depth_conflicts = matches!(
            (self.depth_stencil_attachment, other.depth_stencil_attachment),
            (Some(a), Some(b)) if a != b
        );

        if depth_conflicts {
            return false;
        }

        let color_conflicts = self
            .color_attachments
            .iter()
            .zip(other.color_attachments.iter())
            .any(|(a, b)| a != b);

        !color_conflicts
    }
}

/// Metadata wrapper around a user pass (§3 Data Model: "Pass record").
pub struct PassRecord {
    pub kind: PassKind,
    pub name: String,
    pub declared_reads: SmallVec<[ResourceHandle; 8]>,
    pub declared_writes: SmallVec<[ResourceHandle; 8]>,
    pub render_targets: Option<RenderTargetsDescriptor>,
    /// Command range within this pass's own arena; rebased to frame-global offsets only during
    /// compiler stage (h).
    pub command_range: Range<u32>,
    pub draw_count: u32,
    pub active: bool,
    pub has_side_effects: bool,
    pub writes_window_texture: bool,
}

impl PassRecord {
    pub fn new(kind: PassKind, name: String) -> Self {
        Self {
            kind,
            name,
            declared_reads: SmallVec::new(),
            declared_writes: SmallVec::new(),
            render_targets: None,
            command_range: 0..0,
            draw_count: 0,
            active: false,
            has_side_effects: false,
            writes_window_texture: false,
        }
    }

    pub fn declare_read(&mut self, resource: ResourceHandle) {
        if !self.declared_reads.contains(&resource) {
            self.declared_reads.push(resource);
        }
    }

    pub fn declare_write(&mut self, resource: ResourceHandle) {
        if !self.declared_writes.contains(&resource) {
            self.declared_writes.push(resource);
        }
    }

    /// §3: `active ⇒ command range non-empty` except for cpu passes, which carry no GPU command
    /// range at all.
    pub fn satisfies_active_invariant(&self) -> bool {
        if !self.active {
            return true;
        }

        self.kind.is_cpu() || !self.command_range.is_empty()
    }
}
