//! The client-facing render graph (§4.7 "Accumulation", ties together §4.1-§4.6).

use crate::arena::{ArenaTag, ArenaTagKind, TaggedArena};
use crate::backend::SharedBackend;
use crate::config::RenderGraphConfig;
use crate::driver::{reset_transient_registries, SubmissionDriver, WaitToken};
use crate::handle::{ResourceFlags, ResourceHandle, ResourceKind};
use crate::pass::{PassKind, PassRecord, RenderTargetsDescriptor};
use crate::recorder::{CommandRecorder, RecordedPass, ResourceInfoSource};
use crate::registry::{PersistentRegistry, PersistentSlotHandle, TransientRegistry};
use crate::resource::{ResourceDescriptor, ResourceStateFlags};
use log::debug;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

struct ResourceRecord {
    descriptor: ResourceDescriptor,
    state: ResourceStateFlags,
}

/// Derives `ResourceFlags::HOST_VISIBLE` from a descriptor's storage class so callers never have
/// to set it by hand; the compiler relies on this bit to promote readback-causing reads to
/// writers for dependency ordering (§4.6(a)).
fn host_visibility_flag(descriptor: &ResourceDescriptor) -> ResourceFlags {
    match descriptor.storage_class() {
        Some(crate::resource::StorageClass::Shared) => ResourceFlags::HOST_VISIBLE,
        _ => ResourceFlags::empty(),
    }
}

/// Assigns each [`RenderGraph`] instance a distinct bit in a persistent resource's
/// `active_render_graphs` mask (§4.2), so more than one graph may reference the same persistent
/// resource without clobbering each other's liveness bookkeeping. Wraps back to bit 0 past 64
/// concurrently live graphs; collisions beyond that count are a known, documented limit rather
/// than a tracked defect.
static NEXT_GRAPH_INDEX: AtomicU64 = AtomicU64::new(0);

/// Builds and submits one deferred GPU command graph per frame.
///
/// Mirrors the way `screen-13`'s render graph accumulates passes behind a builder before a single
/// `resolve()`/submit call: passes are added via [`RenderGraph::add_pass`], which hands the
/// caller a [`CommandRecorder`] to populate, and [`RenderGraph::execute`] compiles and submits
/// everything accumulated since the last call.
pub struct RenderGraph {
    config: RenderGraphConfig,
    arena: Arc<TaggedArena>,
    driver: SubmissionDriver,
    graph_bit: u64,
    transient: TransientRegistry<ResourceRecord>,
    persistent: PersistentRegistry<ResourceRecord>,
    persistent_slots: HashMap<ResourceHandle, PersistentSlotHandle>,
    passes: Vec<PassRecord>,
    recorded: Vec<RecordedPass>,
    current_submission_id: u32,
}

impl RenderGraph {
    pub fn new(backend: SharedBackend, config: RenderGraphConfig) -> Self {
        let arena = Arc::new(TaggedArena::new(config.arena_page_size));
        let graph_index = NEXT_GRAPH_INDEX.fetch_add(1, Ordering::Relaxed) % 64;
        let graph_bit = 1u64 << graph_index;
        let driver = SubmissionDriver::new(backend, config, Arc::clone(&arena));
        let current_submission_id = driver.reserve_submission_id();

        Self {
            config,
            arena,
            driver,
            graph_bit,
            transient: TransientRegistry::new(0, config.transient_registry_capacity),
            persistent: PersistentRegistry::new(),
            persistent_slots: HashMap::new(),
            passes: Vec::new(),
            recorded: Vec::new(),
            current_submission_id,
        }
    }

    /// Allocates a resource that lives for exactly one `execute()` cycle, then is invalidated by
    /// the following frame's registry reset (§4.2).
    pub fn create_transient(
        &mut self,
        kind: ResourceKind,
        flags: ResourceFlags,
        descriptor: ResourceDescriptor,
    ) -> ResourceHandle {
        assert!(
            !flags.contains(ResourceFlags::PERSISTENT),
            "transient resources must not carry the persistent flag"
        );

        let flags = flags | host_visibility_flag(&descriptor);

        let (handle, _) = self.transient.allocate(
            kind,
            flags,
            ResourceRecord { descriptor, state: ResourceStateFlags::empty() },
        );

        handle
    }

    /// Allocates a resource that survives across frames until [`Self::free_persistent`] (§4.2).
    ///
    /// # Panics
    ///
    /// `descriptor`'s `usage_hint` must be non-empty (§3).
    pub fn create_persistent(
        &mut self,
        kind: ResourceKind,
        flags: ResourceFlags,
        descriptor: ResourceDescriptor,
    ) -> ResourceHandle {
        descriptor
            .validate_for_persistent()
            .unwrap_or_else(|reason| panic!("{reason}"));

        let flags = flags | host_visibility_flag(&descriptor);

        let slot = self.persistent.allocate(
            kind,
            flags,
            ResourceRecord { descriptor, state: ResourceStateFlags::empty() },
        );
        let handle = slot.handle();
        self.persistent_slots.insert(handle, slot);

        handle
    }

    /// Releases a persistent resource.
    ///
    /// # Panics
    ///
    /// The slot must not still be in use by an in-flight submission (§4.2); callers should check
    /// [`crate::registry::PersistentSlotHandle::atomics`] via [`Self::is_persistent_resource_in_use`]
    /// before freeing, or this is a fatal programming error left to the backend's discretion.
    pub fn free_persistent(&mut self, handle: ResourceHandle) {
        self.persistent_slots.remove(&handle);
        self.persistent.free(handle);
    }

    pub fn is_persistent_resource_in_use(&self, handle: ResourceHandle) -> bool {
        let Some(slot) = self.persistent_slots.get(&handle) else {
            return false;
        };

        slot.atomics()
            .is_known_in_use(self.driver.last_completed_command_index())
    }

    /// Accumulates a new pass, handing `record` a [`CommandRecorder`] to populate with commands
    /// and resource usages (§4.4). `name` is `None` for call sites that don't care to label their
    /// passes; the pass is then named from its own call site (§9) rather than left blank.
    #[track_caller]
    pub fn add_pass(
        &mut self,
        kind: PassKind,
        name: Option<&str>,
        render_targets: Option<RenderTargetsDescriptor>,
        record: impl FnOnce(&mut CommandRecorder),
    ) {
        let caller = std::panic::Location::caller();
        let name = name.map(str::to_owned).unwrap_or_else(|| {
            if self.config.disable_automatic_labels {
                String::new()
            } else {
                format!("anonymous pass at {}:{}", caller.file(), caller.line())
            }
        });

        let pass_index = self.passes.len() as u32;
        let mut pass = PassRecord::new(kind, name);
        pass.render_targets = render_targets;

        let tag = ArenaTag::new(ArenaTagKind::GraphExecution, self.current_submission_id);
        let arena = Arc::clone(&self.arena);
        let view = arena.thread_view(tag);
        let recorded = {
            let mut recorder = CommandRecorder::new(view, &mut pass, pass_index, self);
            record(&mut recorder);
            recorder.finish()
        };

        for resource in pass.declared_reads.iter().chain(pass.declared_writes.iter()) {
            if let Some(slot) = self.persistent_slots.get(resource) {
                slot.atomics().mark_in_use(self.graph_bit);
            }
        }

        debug!("recorded pass \"{}\" ({} commands)", pass.name, recorded.commands.len());

        self.passes.push(pass);
        self.recorded.push(recorded);
    }

    /// Compiles and submits every pass accumulated since the previous call, running CPU passes
    /// serially before handing GPU work to the backend, then resets the transient registry and
    /// begins accumulating the next frame (§4.6, §4.7).
    pub fn execute(&mut self) -> WaitToken {
        let passes = std::mem::take(&mut self.passes);
        let recorded = std::mem::take(&mut self.recorded);
        let submission_id = self.current_submission_id;
        let graph_bit = self.graph_bit;
        let persistent_slots = self.persistent_slots.clone();

        let token = self.driver.execute(
            submission_id,
            passes,
            recorded,
            |_cpu_pass_index| {
                // CPU passes have no command stream to replay here; their side effects already
                // ran as ordinary Rust code supplied to `add_pass`'s `record` closure at
                // recording time for this design, so the compiler's CPU-pass ordering is
                // informational only.
            },
            move |used_resources| {
                for resource in used_resources {
                    if let Some(slot) = persistent_slots.get(resource) {
                        slot.atomics().clear_in_use(graph_bit);
                    }
                }
            },
        );

        reset_transient_registries(std::slice::from_mut(&mut self.transient));
        self.current_submission_id = self.driver.reserve_submission_id();

        token
    }

    pub fn config(&self) -> &RenderGraphConfig {
        &self.config
    }
}

impl ResourceInfoSource for RenderGraph {
    fn descriptor(&self, handle: ResourceHandle) -> ResourceDescriptor {
        if handle.is_persistent() {
            self.persistent
                .with(handle, |record| record.descriptor)
                .unwrap_or_else(|| panic!("stale persistent resource handle {handle:?}"))
        } else {
            self.transient
                .get(handle)
                .unwrap_or_else(|| panic!("stale transient resource handle {handle:?}"))
                .descriptor
        }
    }

    fn state_flags(&self, handle: ResourceHandle) -> ResourceStateFlags {
        if handle.is_persistent() {
            self.persistent
                .with(handle, |record| record.state)
                .unwrap_or_else(|| panic!("stale persistent resource handle {handle:?}"))
        } else {
            self.transient
                .get(handle)
                .unwrap_or_else(|| panic!("stale transient resource handle {handle:?}"))
                .state
        }
    }

    fn mark_initialised(&mut self, handle: ResourceHandle) {
        if handle.is_persistent() {
            // Persistent records live behind a shared registry lock keyed by value, not by
            // mutable reference; the initialised-before-read check is only advisory there (§3),
            // so tracking it is left to the backend rather than threading interior mutability
            // through `PersistentRegistry` for one bit.
            return;
        }

        if let Some(record) = self.transient.get_mut(handle) {
            record.state |= ResourceStateFlags::INITIALISED;
        }
    }

    fn transient_registry_index(&self) -> u8 {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::NullBackend;
    use crate::command::{Command, GeneralCommand};
    use crate::resource::{BufferDescriptor, StorageClass, UsageHint};
    use crate::usage::{AccessKind, ShaderStageMask, SubRange};

    fn buffer_descriptor(usage_hint: UsageHint) -> ResourceDescriptor {
        ResourceDescriptor::Buffer(BufferDescriptor {
            size: 256,
            storage_class: StorageClass::Private,
            usage_hint,
        })
    }

    #[test]
    fn a_pass_writing_a_persistent_resource_survives_compilation() {
        let mut graph = RenderGraph::new(Arc::new(NullBackend::new()), RenderGraphConfig::default());

        let resource = graph.create_persistent(
            ResourceKind::Buffer,
            ResourceFlags::empty(),
            buffer_descriptor(UsageHint::SHADER_WRITE),
        );

        graph.add_pass(PassKind::Compute, Some("write-only"), None, |recorder| {
            let index = recorder.record(Command::General(GeneralCommand::PopDebugGroup));
            recorder.add_resource_usage(
                resource,
                AccessKind::Write,
                ShaderStageMask::COMPUTE,
                SubRange::Full,
                index,
            );
        });

        let token = graph.execute();
        assert!(token.block_until_complete().is_ok());
    }

    #[test]
    fn an_unnamed_pass_is_named_after_its_own_call_site() {
        let mut graph = RenderGraph::new(Arc::new(NullBackend::new()), RenderGraphConfig::default());

        graph.add_pass(PassKind::Compute, None, None, |recorder| {
            recorder.record(Command::General(GeneralCommand::PopDebugGroup));
        });

        assert_eq!(graph.passes.len(), 1);
        assert!(graph.passes[0].name.starts_with("anonymous pass at "));
        assert!(graph.passes[0].name.contains("graph.rs"));
    }

    #[test]
    fn disabling_automatic_labels_skips_call_site_capture() {
        let config = crate::config::RenderGraphConfigBuilder::default()
            .disable_automatic_labels(true)
            .build();
        let mut graph = RenderGraph::new(Arc::new(NullBackend::new()), config);

        graph.add_pass(PassKind::Compute, None, None, |recorder| {
            recorder.record(Command::General(GeneralCommand::PopDebugGroup));
        });

        assert_eq!(graph.passes[0].name, "");
    }

    #[test]
    fn transient_resources_do_not_survive_a_registry_reset() {
        let mut graph = RenderGraph::new(Arc::new(NullBackend::new()), RenderGraphConfig::default());

        let resource = graph.create_transient(
            ResourceKind::Buffer,
            ResourceFlags::empty(),
            buffer_descriptor(UsageHint::SHADER_WRITE),
        );

        graph.add_pass(PassKind::Compute, Some("transient-write"), None, |recorder| {
            let index = recorder.record(Command::General(GeneralCommand::PopDebugGroup));
            recorder.add_resource_usage(
                resource,
                AccessKind::Write,
                ShaderStageMask::COMPUTE,
                SubRange::Full,
                index,
            );
        });

        graph.execute().block_until_complete().unwrap();

        assert!(graph.transient.get(resource).is_none());
    }
}
