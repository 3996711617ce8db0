//! The backend driver boundary (§6 "Backend interface (consumer contract)").
//!
//! Everything on the far side of this trait — Metal/Vulkan command encoding, transient memory
//! aliasing, barrier placement — is out of scope for this crate; `Backend` exists only to pin down
//! what a compiled submission hands across that boundary.

use crate::command::Command;
use crate::compiler::CompiledGraph;
use crate::error::RenderGraphError;
use crate::handle::ResourceHandle;
use crate::pass::{PassKind, RenderTargetsDescriptor};
use smallvec::SmallVec;
use std::ops::Range;
use std::sync::Arc;

/// One active pass, with everything the backend needs to encode and synchronise it.
pub struct BackendPass {
    pub kind: PassKind,
    pub name: String,
    pub render_target_group: u32,
    pub render_targets: Option<RenderTargetsDescriptor>,
    pub declared_reads: SmallVec<[ResourceHandle; 8]>,
    pub declared_writes: SmallVec<[ResourceHandle; 8]>,
    pub command_range: Range<u32>,
    pub commands: Vec<Command>,
}

/// A fully compiled submission, ready to be handed to a [`Backend`].
pub struct BackendSubmission {
    pub graph: CompiledGraph,
    pub passes: Vec<BackendPass>,
    /// Command index on the single global submission stream to wait on before this submission's
    /// work may begin (§9 Open Question 3: one global stream, so one index rather than per-queue).
    pub queue_wait_index: u64,
}

/// The range of queue command indices a completed submission occupied, passed to the completion
/// callback so the driver can advance persistent-slot wait indices.
#[derive(Clone, Copy, Debug)]
pub struct CompletedCommandRange {
    pub start: u64,
    pub end: u64,
}

/// What the backend is responsible for (§6): allocating transient resources, inserting barriers
/// from the usage timeline, serialising submission in pass order, and invoking the completion
/// callback exactly once.
pub trait Backend: Send + Sync {
    /// Submits `submission`, blocking only long enough to enqueue it; the completion callback
    /// fires later, off this call, when the backend is done with it.
    fn submit(
        &self,
        submission: BackendSubmission,
        on_completed: Box<dyn FnOnce(Result<CompletedCommandRange, RenderGraphError>) + Send>,
    );
}

/// A `Backend` that immediately "completes" every submission, useful for testing the compiler and
/// driver without a real GPU backend present.
pub struct NullBackend {
    next_command_index: std::sync::atomic::AtomicU64,
}

impl NullBackend {
    pub fn new() -> Self {
        Self {
            next_command_index: std::sync::atomic::AtomicU64::new(1),
        }
    }
}

impl Default for NullBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for NullBackend {
    fn submit(
        &self,
        submission: BackendSubmission,
        on_completed: Box<dyn FnOnce(Result<CompletedCommandRange, RenderGraphError>) + Send>,
    ) {
        let start = self
            .next_command_index
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        drop(submission);
        on_completed(Ok(CompletedCommandRange { start, end: start }));
    }
}

/// Shared ownership wrapper used throughout the driver; backends are typically long-lived and
/// shared across every graph bound to one device.
pub type SharedBackend = Arc<dyn Backend>;
