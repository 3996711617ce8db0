//! Per-pass command recorder (§4.4).
//!
//! Command *records* (the [`Command`] tagged union values) live in a plain `Vec`, since several
//! variants (notably [`crate::command::ExternalCommand`]) own real destructors and the arena
//! promises never to run one. Only the large, POD *payloads* a command points at — `setBytes`
//! data, pipeline/sampler descriptor blobs, debug labels — are copied into the pass's arena via
//! [`CommandRecorder::copy_bytes`]. Non-POD objects a pass must keep alive (e.g. a retained
//! pipeline-state object) go through [`CommandRecorder::keep_alive`] instead, exactly the
//! "destructable objects tracked separately" escape hatch §4.1 calls for.

use crate::arena::ThreadArenaView;
use crate::command::{ArenaBytes, Command};
use crate::handle::{ResourceFlags, ResourceHandle};
use crate::pass::{PassKind, PassRecord};
use crate::resource::{ResourceDescriptor, ResourceStateFlags};
use crate::usage::{AccessKind, ShaderStageMask, SubRange, UsageList, UsageRecord};
use std::any::Any;
use std::collections::HashMap;
use std::ops::Range;

/// What a [`CommandRecorder`] needs to know about resources to validate usages, supplied by the
/// owning [`crate::graph::RenderGraph`].
pub trait ResourceInfoSource {
    fn descriptor(&self, handle: ResourceHandle) -> ResourceDescriptor;
    fn state_flags(&self, handle: ResourceHandle) -> ResourceStateFlags;
    fn mark_initialised(&mut self, handle: ResourceHandle);
    fn transient_registry_index(&self) -> u8;
}

/// One pass's recorder: an ordered command stream plus the resource-usage lists it produced.
pub struct CommandRecorder<'a> {
    arena: ThreadArenaView<'a>,
    pass: &'a mut PassRecord,
    pass_index: u32,
    info: &'a mut dyn ResourceInfoSource,
    commands: Vec<Command>,
    usages: HashMap<ResourceHandle, UsageList>,
    unmanaged_references: Vec<Box<dyn Any + Send>>,
}

impl<'a> CommandRecorder<'a> {
    pub fn new(
        arena: ThreadArenaView<'a>,
        pass: &'a mut PassRecord,
        pass_index: u32,
        info: &'a mut dyn ResourceInfoSource,
    ) -> Self {
        Self {
            arena,
            pass,
            pass_index,
            info,
            commands: Vec::new(),
            usages: HashMap::new(),
            unmanaged_references: Vec::new(),
        }
    }

    /// Appends a command, returning its index within this pass's stream.
    pub fn record(&mut self, command: Command) -> u32 {
        if matches!(command, Command::Render(crate::command::RenderCommand::DrawPrimitives { .. }))
            || matches!(
                command,
                Command::Render(crate::command::RenderCommand::DrawIndexedPrimitives { .. })
            )
        {
            self.pass.draw_count += 1;
        }

        let index = self.commands.len() as u32;
        self.commands.push(command);
        index
    }

    /// Copies `bytes` into the pass's arena for a `setBytes`-style command.
    pub fn copy_bytes(&mut self, bytes: &[u8]) -> ArenaBytes {
        let ptr = self.arena.copy_bytes(bytes);
        ArenaBytes::new(ptr, bytes.len())
    }

    /// Keeps `value` alive until this pass's records are disposed, for non-POD objects that
    /// cannot be stored raw in the arena (§4.4 `unmanaged_references`).
    pub fn keep_alive<T: Any + Send>(&mut self, value: T) {
        self.unmanaged_references.push(Box::new(value));
    }

    /// Validates and records a resource usage, updating the pass's declared read/write sets and
    /// appending into this pass's local per-resource usage list.
    ///
    /// # Panics
    ///
    /// Every precondition here is a programming error, not a runtime condition (§4.4): the
    /// resource must be declared (or implicitly allowed for a draw pass's render targets), the
    /// access must be covered by the resource's `usage_hint`, an immutable-once-initialised
    /// resource must not be rewritten, and a transient resource must belong to this frame's
    /// registry.
    pub fn add_resource_usage(
        &mut self,
        resource: ResourceHandle,
        access: AccessKind,
        stages: ShaderStageMask,
        sub_range: SubRange,
        first_cmd_index: u32,
    ) {
        self.validate_and_declare(resource, access);
        self.push_usage(resource, access, stages, sub_range, first_cmd_index, false);
    }

    /// Emits an indirect usage record (`is_indirectly_bound = true`) for a buffer an
    /// acceleration-structure or intersection-function-table descriptor references, without
    /// requiring it to be separately declared (§4.4).
    pub fn add_indirect_usage(
        &mut self,
        resource: ResourceHandle,
        access: AccessKind,
        stages: ShaderStageMask,
        sub_range: SubRange,
        first_cmd_index: u32,
    ) {
        self.push_usage(resource, access, stages, sub_range, first_cmd_index, true);
    }

    /// Walks an acceleration-structure descriptor's referenced buffers, recording the structure
    /// itself plus an indirect usage for each buffer supplied (§4.4).
    #[allow(clippy::too_many_arguments)]
    pub fn bind_acceleration_structure_descriptor(
        &mut self,
        structure: ResourceHandle,
        vertex_buffer: Option<ResourceHandle>,
        index_buffer: Option<ResourceHandle>,
        bounding_box_buffer: Option<ResourceHandle>,
        instance_descriptor_buffer: Option<ResourceHandle>,
        stages: ShaderStageMask,
        first_cmd_index: u32,
    ) {
        self.add_resource_usage(
            structure,
            AccessKind::Read,
            stages,
            SubRange::Full,
            first_cmd_index,
        );

        for buffer in [vertex_buffer, index_buffer, bounding_box_buffer, instance_descriptor_buffer]
            .into_iter()
            .flatten()
        {
            self.add_indirect_usage(buffer, AccessKind::Read, stages, SubRange::Full, first_cmd_index);
        }
    }

    fn validate_and_declare(&mut self, resource: ResourceHandle, access: AccessKind) {
        let declared = self.pass.declared_reads.contains(&resource)
            || self.pass.declared_writes.contains(&resource);
        let implicitly_allowed = self.pass.kind == PassKind::Draw && access.is_render_target();

        assert!(
            declared || implicitly_allowed,
            "resource {resource:?} used in pass \"{}\" without being declared",
            self.pass.name
        );

        if !resource.is_persistent() {
            assert_eq!(
                resource.transient_registry(),
                self.info.transient_registry_index(),
                "transient resource {resource:?} does not belong to this frame's registry"
            );
        }

        let descriptor = self.info.descriptor(resource);
        let required = access.required_usage_hint();
        assert!(
            descriptor.usage_hint().contains(required),
            "access {access:?} on resource {resource:?} is not permitted by its usage_hint"
        );

        if access.is_write() {
            if resource.flags().contains(ResourceFlags::IMMUTABLE_ONCE_INITIALISED) {
                let state = self.info.state_flags(resource);
                assert!(
                    !state.contains(ResourceStateFlags::INITIALISED),
                    "write to immutable-once-initialised resource {resource:?} after initialisation"
                );
            }

            self.info.mark_initialised(resource);
            self.pass.declare_write(resource);
        } else {
            self.pass.declare_read(resource);
        }
    }

    fn push_usage(
        &mut self,
        resource: ResourceHandle,
        access: AccessKind,
        stages: ShaderStageMask,
        sub_range: SubRange,
        first_cmd_index: u32,
        is_indirectly_bound: bool,
    ) {
        let command_range = usage_command_range(first_cmd_index, self.commands.len() as u32);

        let record = UsageRecord {
            pass_index: self.pass_index,
            command_range,
            access,
            stages,
            sub_range,
            in_argument_buffer: false,
            is_indirectly_bound,
        };

        self.usages.entry(resource).or_default().append(record, self.pass.draw_count);
    }

    /// Finalises this pass's recording: sets its command range and returns the command stream,
    /// per-resource local usage lists, and kept-alive objects for the compiler to fold in.
    pub fn finish(self) -> RecordedPass {
        self.pass.command_range = 0..self.commands.len() as u32;

        RecordedPass {
            commands: self.commands,
            usages: self.usages,
            unmanaged_references: self.unmanaged_references,
        }
    }
}

fn usage_command_range(first_cmd_index: u32, commands_so_far: u32) -> Range<u32> {
    let end = commands_so_far.max(first_cmd_index + 1);
    first_cmd_index..end
}

/// The output of one pass's recording, ready to be folded into the compiler's global state.
pub struct RecordedPass {
    pub commands: Vec<Command>,
    pub usages: HashMap<ResourceHandle, UsageList>,
    pub unmanaged_references: Vec<Box<dyn Any + Send>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::{ArenaTag, ArenaTagKind, TaggedArena};
    use crate::handle::{ResourceKind, MAX_TRANSIENT_REGISTRIES};
    use crate::resource::{BufferDescriptor, StorageClass, UsageHint};
    use crate::command::GeneralCommand;

    struct FakeInfo {
        descriptor: ResourceDescriptor,
        state: ResourceStateFlags,
        registry_index: u8,
    }

    impl ResourceInfoSource for FakeInfo {
        fn descriptor(&self, _handle: ResourceHandle) -> ResourceDescriptor {
            self.descriptor
        }

        fn state_flags(&self, _handle: ResourceHandle) -> ResourceStateFlags {
            self.state
        }

        fn mark_initialised(&mut self, _handle: ResourceHandle) {
            self.state |= ResourceStateFlags::INITIALISED;
        }

        fn transient_registry_index(&self) -> u8 {
            self.registry_index
        }
    }

    fn transient_handle(registry_index: u8) -> ResourceHandle {
        assert!((registry_index as u32) < MAX_TRANSIENT_REGISTRIES);
        ResourceHandle::new(ResourceKind::Buffer, ResourceFlags::empty(), registry_index, 0, 1)
    }

    #[test]
    fn records_declared_write_and_marks_initialised() {
        let arena = TaggedArena::new(4096);
        let tag = ArenaTag::new(ArenaTagKind::GraphExecution, 0);
        let mut pass = PassRecord::new(PassKind::Compute, "compute".into());
        let resource = transient_handle(0);
        pass.declare_write(resource);

        let mut info = FakeInfo {
            descriptor: ResourceDescriptor::Buffer(BufferDescriptor {
                size: 256,
                storage_class: StorageClass::Private,
                usage_hint: UsageHint::SHADER_WRITE,
            }),
            state: ResourceStateFlags::empty(),
            registry_index: 0,
        };

        {
            let mut recorder = CommandRecorder::new(arena.thread_view(tag), &mut pass, 0, &mut info);
            let cmd_index = recorder.record(Command::General(GeneralCommand::PopDebugGroup));
            recorder.add_resource_usage(
                resource,
                AccessKind::Write,
                ShaderStageMask::COMPUTE,
                SubRange::Full,
                cmd_index,
            );

            let recorded = recorder.finish();
            assert_eq!(recorded.commands.len(), 1);
            assert_eq!(recorded.usages.get(&resource).unwrap().entries().len(), 1);
        }

        assert!(info.state.contains(ResourceStateFlags::INITIALISED));
        arena.free(tag);
    }

    #[test]
    #[should_panic(expected = "without being declared")]
    fn undeclared_resource_use_is_fatal() {
        let arena = TaggedArena::new(4096);
        let tag = ArenaTag::new(ArenaTagKind::GraphExecution, 0);
        let mut pass = PassRecord::new(PassKind::Compute, "compute".into());
        let resource = transient_handle(0);

        let mut info = FakeInfo {
            descriptor: ResourceDescriptor::Buffer(BufferDescriptor {
                size: 256,
                storage_class: StorageClass::Private,
                usage_hint: UsageHint::SHADER_WRITE,
            }),
            state: ResourceStateFlags::empty(),
            registry_index: 0,
        };

        let mut recorder = CommandRecorder::new(arena.thread_view(tag), &mut pass, 0, &mut info);
        recorder.add_resource_usage(resource, AccessKind::Write, ShaderStageMask::COMPUTE, SubRange::Full, 0);
    }

    #[test]
    #[should_panic(expected = "usage_hint")]
    fn access_not_covered_by_usage_hint_is_fatal() {
        let arena = TaggedArena::new(4096);
        let tag = ArenaTag::new(ArenaTagKind::GraphExecution, 0);
        let mut pass = PassRecord::new(PassKind::Compute, "compute".into());
        let resource = transient_handle(0);
        pass.declare_write(resource);

        let mut info = FakeInfo {
            descriptor: ResourceDescriptor::Buffer(BufferDescriptor {
                size: 256,
                storage_class: StorageClass::Private,
                usage_hint: UsageHint::SHADER_READ,
            }),
            state: ResourceStateFlags::empty(),
            registry_index: 0,
        };

        let mut recorder = CommandRecorder::new(arena.thread_view(tag), &mut pass, 0, &mut info);
        recorder.add_resource_usage(resource, AccessKind::Write, ShaderStageMask::COMPUTE, SubRange::Full, 0);
    }

    #[test]
    fn keep_alive_accepts_arbitrary_objects() {
        let arena = TaggedArena::new(4096);
        let tag = ArenaTag::new(ArenaTagKind::GraphExecution, 0);
        let mut pass = PassRecord::new(PassKind::External, "ext".into());
        let mut info = FakeInfo {
            descriptor: ResourceDescriptor::Buffer(BufferDescriptor {
                size: 0,
                storage_class: StorageClass::Private,
                usage_hint: UsageHint::empty(),
            }),
            state: ResourceStateFlags::empty(),
            registry_index: 0,
        };

        let mut recorder = CommandRecorder::new(arena.thread_view(tag), &mut pass, 0, &mut info);
        recorder.keep_alive(vec![1, 2, 3]);
        let recorded = recorder.finish();

        assert_eq!(recorded.unmanaged_references.len(), 1);
        arena.free(tag);
    }
}
