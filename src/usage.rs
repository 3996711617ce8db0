//! Resource usage records and the per-resource usage list (§4.3).

use bitflags::bitflags;
use smallvec::SmallVec;
use std::ops::Range;

bitflags! {
    /// Shader stages a usage is visible to, used by the backend to scope synchronisation
    /// barriers as tightly as possible.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct ShaderStageMask: u8 {
        const VERTEX   = 1 << 0;
        const FRAGMENT = 1 << 1;
        const COMPUTE  = 1 << 2;
        const BLIT     = 1 << 3;
        const ACCELERATION_STRUCTURE_BUILD = 1 << 4;
    }
}

/// How a pass touches a resource over some command range.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AccessKind {
    Read,
    Write,
    ReadWrite,
    VertexBuffer,
    IndexBuffer,
    ConstantBuffer,
    IndirectBuffer,
    BlitSource,
    BlitDestination,
    ColorAttachment,
    DepthStencilAttachment,
    InputAttachment,
    UnusedRenderTarget,
    UnusedArgumentBuffer,
    MipGeneration,
    BlitSynchronisation,
}

impl AccessKind {
    /// Whether this access kind participates in render-target merge/promotion handling.
    pub fn is_render_target(self) -> bool {
        matches!(
            self,
            Self::ColorAttachment
                | Self::DepthStencilAttachment
                | Self::InputAttachment
                | Self::UnusedRenderTarget
        )
    }

    /// A render-target access that reads the existing attachment contents (programmable
    /// blending / framebuffer fetch).
    fn is_render_target_read(self) -> bool {
        matches!(self, Self::InputAttachment)
    }

    /// A render-target access that writes the attachment.
    fn is_render_target_write(self) -> bool {
        matches!(self, Self::ColorAttachment | Self::DepthStencilAttachment)
    }

    /// Whether this access writes the resource in any capacity, render-target or otherwise.
    pub fn is_write(self) -> bool {
        matches!(
            self,
            Self::Write
                | Self::ReadWrite
                | Self::BlitDestination
                | Self::ColorAttachment
                | Self::DepthStencilAttachment
                | Self::MipGeneration
        )
    }

    /// Required bits in a resource's `usage_hint` for this access to be legal (§8 "Usage-hint
    /// coverage").
    pub fn required_usage_hint(self) -> crate::resource::UsageHint {
        use crate::resource::UsageHint as H;

        match self {
            Self::Read => H::SHADER_READ,
            Self::Write => H::SHADER_WRITE,
            Self::ReadWrite => H::SHADER_READ | H::SHADER_WRITE,
            Self::VertexBuffer => H::VERTEX_BUFFER,
            Self::IndexBuffer => H::INDEX_BUFFER,
            Self::ConstantBuffer => H::CONSTANT_BUFFER,
            Self::IndirectBuffer => H::INDIRECT_BUFFER,
            Self::BlitSource => H::BLIT_SOURCE,
            Self::BlitDestination => H::BLIT_DESTINATION,
            Self::ColorAttachment | Self::DepthStencilAttachment | Self::UnusedRenderTarget => {
                H::RENDER_TARGET
            }
            Self::InputAttachment => H::RENDER_TARGET | H::INPUT_ATTACHMENT,
            Self::UnusedArgumentBuffer => H::ARGUMENT_BUFFER,
            Self::MipGeneration => H::MIP_GENERATION,
            Self::BlitSynchronisation => H::BLIT_SOURCE | H::BLIT_DESTINATION,
        }
    }
}

/// A bitmask over a texture's `(slice, level)` sub-resources. Inline storage covers textures with
/// up to 128 sub-resources (e.g. a 16-layer cube map with 8 mips); larger textures spill to the
/// heap, same trade-off `smallvec` makes everywhere else in this crate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TextureSubRangeMask {
    words: SmallVec<[u64; 2]>,
}

impl TextureSubRangeMask {
    pub fn empty() -> Self {
        Self {
            words: SmallVec::new(),
        }
    }

    pub fn full(subresource_count: u32) -> Self {
        let word_count = (subresource_count as usize).div_ceil(64);
        let mut words = SmallVec::from_elem(u64::MAX, word_count);

        let remainder = subresource_count as usize % 64;
        if remainder != 0 {
            if let Some(last) = words.last_mut() {
                *last &= (1u64 << remainder) - 1;
            }
        }

        Self { words }
    }

    pub fn single(index: u32) -> Self {
        let mut mask = Self::empty();
        mask.set(index);
        mask
    }

    fn ensure_words(&mut self, word_index: usize) {
        if self.words.len() <= word_index {
            self.words.resize(word_index + 1, 0);
        }
    }

    pub fn set(&mut self, index: u32) {
        let word = index as usize / 64;
        let bit = index as usize % 64;
        self.ensure_words(word);
        self.words[word] |= 1 << bit;
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    pub fn union(&self, other: &Self) -> Self {
        let len = self.words.len().max(other.words.len());
        let mut words = SmallVec::with_capacity(len);

        for i in 0..len {
            let a = self.words.get(i).copied().unwrap_or(0);
            let b = other.words.get(i).copied().unwrap_or(0);
            words.push(a | b);
        }

        Self { words }
    }

    /// `self` with every bit set in `other` cleared.
    pub fn subtract(&self, other: &Self) -> Self {
        let mut words = self.words.clone();

        for (i, word) in words.iter_mut().enumerate() {
            let b = other.words.get(i).copied().unwrap_or(0);
            *word &= !b;
        }

        Self { words }
    }

    pub fn intersects(&self, other: &Self) -> bool {
        self.words
            .iter()
            .zip(other.words.iter())
            .any(|(a, b)| a & b != 0)
    }
}

/// The portion of a resource a usage record touches.
#[derive(Clone, Debug, PartialEq)]
pub enum SubRange {
    /// The entire resource.
    Full,
    /// `[offset, offset + length)` within a buffer.
    Buffer { offset: u64, length: u64 },
    /// A bitmask of texture sub-resources.
    Texture(TextureSubRangeMask),
}

impl SubRange {
    pub fn overlaps(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Full, _) | (_, Self::Full) => true,
            (
                Self::Buffer { offset: a_off, length: a_len },
                Self::Buffer { offset: b_off, length: b_len },
            ) => *a_off < b_off + b_len && *b_off < a_off + a_len,
            (Self::Texture(a), Self::Texture(b)) => a.intersects(b),
            _ => false,
        }
    }

    pub fn union(&self, other: &Self) -> Self {
        match (self, other) {
            (Self::Full, _) | (_, Self::Full) => Self::Full,
            (
                Self::Buffer { offset: a_off, length: a_len },
                Self::Buffer { offset: b_off, length: b_len },
            ) => {
                let start = (*a_off).min(*b_off);
                let end = (a_off + a_len).max(b_off + b_len);
                Self::Buffer { offset: start, length: end - start }
            }
            (Self::Texture(a), Self::Texture(b)) => Self::Texture(a.union(b)),
            (a, _) => a.clone(),
        }
    }

    /// `self` with `other`'s extent removed, best-effort for buffer ranges (a buffer sub-range
    /// can only shrink monotonically from one edge without the caller choosing which hole stays;
    /// this crate only needs trimming for the input-attachment-promotion edge case, which always
    /// trims to an empty or contiguous remainder in practice).
    pub fn subtract(&self, other: &Self) -> Self {
        match (self, other) {
            (Self::Texture(a), Self::Texture(b)) => Self::Texture(a.subtract(b)),
            (Self::Buffer { offset, length }, Self::Buffer { offset: b_off, length: b_len }) => {
                if !self.overlaps(other) {
                    return self.clone();
                }

                let self_end = offset + length;
                let other_end = b_off + b_len;

                if *b_off <= *offset && other_end >= self_end {
                    Self::Buffer { offset: *offset, length: 0 }
                } else if *b_off <= *offset {
                    Self::Buffer { offset: other_end, length: self_end - other_end }
                } else {
                    Self::Buffer { offset: *offset, length: b_off - offset }
                }
            }
            (a, _) => a.clone(),
        }
    }
}

/// One `(pass, command-range, access-kind, stages, sub-range)` entry (§4.3).
#[derive(Clone, Debug, PartialEq)]
pub struct UsageRecord {
    pub pass_index: u32,
    pub command_range: Range<u32>,
    pub access: AccessKind,
    pub stages: ShaderStageMask,
    pub sub_range: SubRange,
    pub in_argument_buffer: bool,
    pub is_indirectly_bound: bool,
}

impl UsageRecord {
    fn command_ranges_overlap(&self, other: &Self) -> bool {
        self.command_range.start < other.command_range.end
            && other.command_range.start < self.command_range.end
    }
}

/// The append-only per-resource usage list, applying the merge rule from §4.3 as entries are
/// appended during recording.
#[derive(Default)]
pub struct UsageList {
    entries: Vec<UsageRecord>,
}

impl UsageList {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn entries(&self) -> &[UsageRecord] {
        &self.entries
    }

    /// Appends `incoming`, merging it into the last entry when the merge rule applies.
    ///
    /// `pass_draw_count` is the number of draw commands recorded so far in the owning pass; it
    /// decides whether a read/render-target-write pair promotes to an input attachment or stays
    /// as two separate, sub-range-trimmed usages.
    ///
    /// # Panics
    ///
    /// Two incompatible simultaneous writes to an overlapping sub-range within the same pass is a
    /// fatal programming error (§4.3).
    pub fn append(&mut self, incoming: UsageRecord, pass_draw_count: u32) {
        let Some(last) = self.entries.last() else {
            self.entries.push(incoming);
            return;
        };

        if last.pass_index != incoming.pass_index {
            self.entries.push(incoming);
            return;
        }

        let rt_chain = last.access.is_render_target() && incoming.access.is_render_target();
        let overlap = last.command_ranges_overlap(&incoming) || last.sub_range.overlaps(&incoming.sub_range);

        if !overlap && !rt_chain {
            self.entries.push(incoming);
            return;
        }

        if last.access.is_render_target() && incoming.access.is_render_target() {
            let merged = merge_render_targets(last, &incoming);
            *self.entries.last_mut().unwrap() = merged;
            return;
        }

        if let Some((read, write)) = read_render_target_write_pair(last, &incoming) {
            if pass_draw_count > 1 {
                let merged = promote_to_input_attachment(read, write);
                *self.entries.last_mut().unwrap() = merged;
            } else {
                let last_is_read = last.access == AccessKind::Read;
                let trimmed_read_sub_range = read.sub_range.subtract(&write.sub_range);

                if last_is_read {
                    self.entries.last_mut().unwrap().sub_range = trimmed_read_sub_range;
                    self.entries.push(incoming);
                } else {
                    let mut incoming = incoming;
                    incoming.sub_range = trimmed_read_sub_range;
                    self.entries.push(incoming);
                }
            }
            return;
        }

        if last.access == incoming.access {
            let mut merged = last.clone();
            merged.stages |= incoming.stages;
            merged.sub_range = merged.sub_range.union(&incoming.sub_range);
            merged.command_range = merge_ranges(&merged.command_range, &incoming.command_range);
            *self.entries.last_mut().unwrap() = merged;
            return;
        }

        if let Some(composed) = compose(last.access, incoming.access) {
            let mut merged = last.clone();
            merged.access = composed;
            merged.stages |= incoming.stages;
            merged.sub_range = merged.sub_range.union(&incoming.sub_range);
            merged.command_range = merge_ranges(&merged.command_range, &incoming.command_range);
            *self.entries.last_mut().unwrap() = merged;
            return;
        }

        if last.access.is_write() && incoming.access.is_write() {
            panic!(
                "conflicting simultaneous writes in pass {}: {:?} and {:?} overlap",
                incoming.pass_index, last.access, incoming.access
            );
        }

        self.entries.push(incoming);
    }
}

fn merge_ranges(a: &Range<u32>, b: &Range<u32>) -> Range<u32> {
    a.start.min(b.start)..a.end.max(b.end)
}

fn merge_render_targets(a: &UsageRecord, b: &UsageRecord) -> UsageRecord {
    let reads = a.access.is_render_target_read() || b.access.is_render_target_read();
    let writes = a.access.is_render_target_write() || b.access.is_render_target_write();

    let merged_access = if reads && writes {
        AccessKind::InputAttachment
    } else if writes {
        if a.access == AccessKind::DepthStencilAttachment || b.access == AccessKind::DepthStencilAttachment {
            AccessKind::DepthStencilAttachment
        } else {
            AccessKind::ColorAttachment
        }
    } else if reads {
        AccessKind::InputAttachment
    } else {
        AccessKind::UnusedRenderTarget
    };

    UsageRecord {
        pass_index: a.pass_index,
        command_range: merge_ranges(&a.command_range, &b.command_range),
        access: merged_access,
        stages: a.stages | b.stages,
        sub_range: a.sub_range.union(&b.sub_range),
        in_argument_buffer: a.in_argument_buffer || b.in_argument_buffer,
        is_indirectly_bound: a.is_indirectly_bound || b.is_indirectly_bound,
    }
}

/// If exactly one of `a`/`b` is a plain `Read` and the other a render-target write, returns
/// `(read, write)` in that order.
fn read_render_target_write_pair<'a>(
    a: &'a UsageRecord,
    b: &'a UsageRecord,
) -> Option<(&'a UsageRecord, &'a UsageRecord)> {
    if a.access == AccessKind::Read && b.access.is_render_target_write() {
        Some((a, b))
    } else if b.access == AccessKind::Read && a.access.is_render_target_write() {
        Some((b, a))
    } else {
        None
    }
}

fn promote_to_input_attachment(read: &UsageRecord, write: &UsageRecord) -> UsageRecord {
    UsageRecord {
        pass_index: read.pass_index,
        command_range: merge_ranges(&read.command_range, &write.command_range),
        access: AccessKind::InputAttachment,
        stages: read.stages | write.stages,
        sub_range: read.sub_range.union(&write.sub_range),
        in_argument_buffer: read.in_argument_buffer || write.in_argument_buffer,
        is_indirectly_bound: read.is_indirectly_bound || write.is_indirectly_bound,
    }
}

/// `read + write -> read-write`; the only composition rule the spec names explicitly.
fn compose(a: AccessKind, b: AccessKind) -> Option<AccessKind> {
    let is_pair = |x: AccessKind, y: AccessKind| {
        (a == x && b == y) || (a == y && b == x)
    };

    if is_pair(AccessKind::Read, AccessKind::Write) {
        Some(AccessKind::ReadWrite)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(pass: u32, range: Range<u32>, access: AccessKind, sub_range: SubRange) -> UsageRecord {
        UsageRecord {
            pass_index: pass,
            command_range: range,
            access,
            stages: ShaderStageMask::FRAGMENT,
            sub_range,
            in_argument_buffer: false,
            is_indirectly_bound: false,
        }
    }

    #[test]
    fn unrelated_usages_stay_separate() {
        let mut list = UsageList::new();
        list.append(record(0, 0..1, AccessKind::VertexBuffer, SubRange::Full), 0);
        list.append(record(1, 1..2, AccessKind::VertexBuffer, SubRange::Full), 0);

        assert_eq!(list.entries().len(), 2);
    }

    #[test]
    fn same_kind_overlapping_merges() {
        let mut list = UsageList::new();
        list.append(
            record(0, 0..2, AccessKind::Read, SubRange::Buffer { offset: 0, length: 16 }),
            0,
        );
        list.append(
            record(0, 1..3, AccessKind::Read, SubRange::Buffer { offset: 8, length: 16 }),
            0,
        );

        assert_eq!(list.entries().len(), 1);
        assert_eq!(
            list.entries()[0].sub_range,
            SubRange::Buffer { offset: 0, length: 24 }
        );
    }

    #[test]
    fn read_then_write_composes_to_read_write() {
        let mut list = UsageList::new();
        list.append(record(0, 0..2, AccessKind::Read, SubRange::Full), 0);
        list.append(record(0, 1..3, AccessKind::Write, SubRange::Full), 0);

        assert_eq!(list.entries().len(), 1);
        assert_eq!(list.entries()[0].access, AccessKind::ReadWrite);
    }

    #[test]
    fn render_target_chain_merges_into_single_entry() {
        let mut list = UsageList::new();
        list.append(
            record(0, 0..1, AccessKind::UnusedRenderTarget, SubRange::Full),
            0,
        );
        list.append(record(0, 1..2, AccessKind::ColorAttachment, SubRange::Full), 0);

        assert_eq!(list.entries().len(), 1);
        assert_eq!(list.entries()[0].access, AccessKind::ColorAttachment);
    }

    #[test]
    fn read_and_render_target_write_promotes_with_multiple_draws() {
        let mut list = UsageList::new();
        list.append(record(0, 0..1, AccessKind::Read, SubRange::Full), 2);
        list.append(record(0, 1..2, AccessKind::ColorAttachment, SubRange::Full), 2);

        assert_eq!(list.entries().len(), 1);
        assert_eq!(list.entries()[0].access, AccessKind::InputAttachment);
    }

    #[test]
    fn read_and_render_target_write_trims_with_single_draw() {
        let full = TextureSubRangeMask::full(4);
        let mut list = UsageList::new();
        list.append(record(0, 0..1, AccessKind::Read, SubRange::Texture(full.clone())), 1);
        list.append(
            record(0, 1..2, AccessKind::ColorAttachment, SubRange::Texture(TextureSubRangeMask::single(0))),
            1,
        );

        assert_eq!(list.entries().len(), 2);
        let SubRange::Texture(trimmed) = &list.entries()[0].sub_range else {
            panic!("expected texture sub-range");
        };
        assert!(!trimmed.intersects(&TextureSubRangeMask::single(0)));
    }

    #[test]
    #[should_panic(expected = "conflicting simultaneous writes")]
    fn conflicting_writes_are_fatal() {
        let mut list = UsageList::new();
        list.append(record(0, 0..2, AccessKind::Write, SubRange::Full), 0);
        list.append(record(0, 1..3, AccessKind::MipGeneration, SubRange::Full), 0);
    }

    #[test]
    fn texture_mask_union_and_subtract() {
        let a = TextureSubRangeMask::single(0);
        let b = TextureSubRangeMask::single(65);
        let union = a.union(&b);

        assert!(union.intersects(&a));
        assert!(union.intersects(&b));

        let subtracted = union.subtract(&a);
        assert!(!subtracted.intersects(&a));
        assert!(subtracted.intersects(&b));
    }
}
