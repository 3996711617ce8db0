//! Submission driver (§4.7).
//!
//! Admission control and the frame state machine are implemented with a plain
//! [`crate::sync::Condvar`]-guarded counter rather than an async runtime: `execute()` blocks the
//! calling thread the way every synchronous `screen-13` driver call does, matching the concurrency
//! style of the rest of this crate's teacher material rather than introducing an async stack the
//! corpus never reaches for.

use crate::arena::{ArenaTag, ArenaTagKind, TaggedArena};
use crate::backend::{Backend, BackendPass, BackendSubmission, CompletedCommandRange};
use crate::compiler::{compile, CompiledGraph};
use crate::config::RenderGraphConfig;
use crate::error::RenderGraphError;
use crate::handle::ResourceHandle;
use crate::pass::PassRecord;
use crate::recorder::RecordedPass;
use crate::registry::TransientRegistry;
use crate::sync::{lock, wait, Condvar, Mutex};
use log::{debug, warn};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// The lifecycle stage of one `execute()` call (§4.7 "State machine of a frame").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameState {
    Accumulating,
    Compiling,
    CpuPasses,
    Submitted,
    Completed,
    Reset,
}

/// Resolves once a submission reaches [`FrameState::Completed`]. Polling only, per §5
/// ("a wait-token exposes completion polling only by awaiting it") — there is no async runtime in
/// this crate, so "awaiting" here means blocking on [`WaitToken::block_until_complete`].
pub struct WaitToken {
    state: Arc<Mutex<FrameState>>,
    condvar: Arc<Condvar>,
    result: Arc<Mutex<Option<Result<(), RenderGraphError>>>>,
}

impl WaitToken {
    pub fn poll(&self) -> FrameState {
        *lock(&self.state)
    }

    pub fn block_until_complete(&self) -> Result<(), RenderGraphError> {
        let mut guard = lock(&self.state);
        while *guard != FrameState::Completed && *guard != FrameState::Reset {
            guard = wait(&self.condvar, guard);
        }
        drop(guard);

        lock(&self.result).clone().unwrap_or(Ok(()))
    }
}

struct InFlightSlot {
    state: Arc<Mutex<FrameState>>,
    condvar: Arc<Condvar>,
    result: Arc<Mutex<Option<Result<(), RenderGraphError>>>>,
}

/// Serialises one graph's submissions to a [`Backend`], enforcing the configured in-flight frame
/// quota and running the arena/registry teardown on completion (§4.7).
pub struct SubmissionDriver {
    backend: Arc<dyn Backend>,
    config: RenderGraphConfig,
    arena: Arc<TaggedArena>,
    submission_slot: Mutex<()>,
    admission: Arc<Mutex<u32>>,
    admission_condvar: Arc<Condvar>,
    next_submission_id: AtomicU32,
    last_completed_command_index: Arc<AtomicU64>,
}

impl SubmissionDriver {
    pub fn new(backend: Arc<dyn Backend>, config: RenderGraphConfig, arena: Arc<TaggedArena>) -> Self {
        Self {
            backend,
            config,
            arena,
            submission_slot: Mutex::new(()),
            admission: Arc::new(Mutex::new(0)),
            admission_condvar: Arc::new(Condvar::new()),
            next_submission_id: AtomicU32::new(0),
            last_completed_command_index: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn last_completed_command_index(&self) -> u64 {
        self.last_completed_command_index.load(Ordering::Relaxed)
    }

    /// Reserves the submission id a frame's passes will record into, so the caller can tag its
    /// `graph-execution`/`usage-nodes` arena allocations before `execute()` runs (§4.1, §4.7).
    pub fn reserve_submission_id(&self) -> u32 {
        self.next_submission_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Compiles and submits one frame's recorded passes, invoking CPU passes serially before
    /// handing the GPU work to the backend. Blocks if the in-flight frame quota is already
    /// saturated. `submission_id` must be one previously returned by
    /// [`Self::reserve_submission_id`].
    pub fn execute(
        &self,
        submission_id: u32,
        passes: Vec<PassRecord>,
        recorded: Vec<RecordedPass>,
        mut run_cpu_pass: impl FnMut(u32),
        on_resources_released: impl FnOnce(&std::collections::HashSet<ResourceHandle>) + Send + 'static,
    ) -> WaitToken {
        self.wait_for_admission();

        let _submission_guard = lock(&self.submission_slot);

        if passes.is_empty() {
            self.release_admission();
            return self.resolved_token(Err(RenderGraphError::EmptyRenderGraph));
        }

        debug!("compiling submission {submission_id} ({} passes)", passes.len());

        let compiled = compile(&passes, &recorded);
        let passes_for_backend = build_backend_passes(&passes, recorded, &compiled);

        for &cpu_index in &compiled.cpu_passes {
            run_cpu_pass(cpu_index);
        }

        let state = Arc::new(Mutex::new(FrameState::Submitted));
        let condvar = Arc::new(Condvar::new());
        let result = Arc::new(Mutex::new(None));

        let slot = InFlightSlot {
            state: Arc::clone(&state),
            condvar: Arc::clone(&condvar),
            result: Arc::clone(&result),
        };

        let usage_tag = ArenaTag::new(ArenaTagKind::UsageNodes, submission_id);
        let execution_tag = ArenaTag::new(ArenaTagKind::GraphExecution, submission_id);
        let arena = Arc::clone(&self.arena);
        let last_completed_command_index = Arc::clone(&self.last_completed_command_index);
        let admission = Arc::clone(&self.admission);
        let admission_condvar = Arc::clone(&self.admission_condvar);
        let used_resources = compiled.used_resources.clone();

        let submission = BackendSubmission {
            graph: compiled,
            passes: passes_for_backend,
            queue_wait_index: self.last_completed_command_index(),
        };

        self.backend.submit(
            submission,
            Box::new(move |outcome| {
                on_submission_completed(
                    outcome,
                    &slot,
                    &arena,
                    usage_tag,
                    execution_tag,
                    &last_completed_command_index,
                    &admission,
                    &admission_condvar,
                );
                on_resources_released(&used_resources);
            }),
        );

        WaitToken { state, condvar, result }
    }

    fn wait_for_admission(&self) {
        let mut in_flight = lock(&self.admission);
        while *in_flight >= self.config.max_in_flight_frames {
            in_flight = wait(&self.admission_condvar, in_flight);
        }
        *in_flight += 1;
    }

    fn release_admission(&self) {
        let mut in_flight = lock(&self.admission);
        *in_flight = in_flight.saturating_sub(1);
        self.admission_condvar.notify_one();
    }

    fn resolved_token(&self, result: Result<(), RenderGraphError>) -> WaitToken {
        WaitToken {
            state: Arc::new(Mutex::new(FrameState::Completed)),
            condvar: Arc::new(Condvar::new()),
            result: Arc::new(Mutex::new(Some(result))),
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn on_submission_completed(
    outcome: Result<CompletedCommandRange, RenderGraphError>,
    slot: &InFlightSlot,
    arena: &TaggedArena,
    usage_tag: ArenaTag,
    execution_tag: ArenaTag,
    last_completed: &AtomicU64,
    admission: &Mutex<u32>,
    admission_condvar: &Condvar,
) {
    match &outcome {
        Ok(range) => last_completed.store(range.end, Ordering::Relaxed),
        Err(err) => warn!("backend submission failed: {err}"),
    }

    arena.free(usage_tag);
    arena.free(execution_tag);

    {
        let mut in_flight = lock(admission);
        *in_flight = in_flight.saturating_sub(1);
    }
    admission_condvar.notify_one();

    *lock(&slot.result) = Some(outcome.map(|_| ()).map_err(|e| e));
    *lock(&slot.state) = FrameState::Completed;
    slot.condvar.notify_all();
}

fn build_backend_passes(
    passes: &[PassRecord],
    recorded: Vec<RecordedPass>,
    compiled: &CompiledGraph,
) -> Vec<BackendPass> {
    let mut recorded: Vec<Option<RecordedPass>> = recorded.into_iter().map(Some).collect();

    compiled
        .active_passes
        .iter()
        .map(|active| {
            let original_index = active.original_index as usize;
            let record = &passes[original_index];
            let owned = recorded[original_index].take().expect("pass recorded exactly once");

            BackendPass {
                kind: record.kind,
                name: record.name.clone(),
                render_target_group: active.render_target_group,
                render_targets: record.render_targets.clone(),
                declared_reads: record.declared_reads.clone(),
                declared_writes: record.declared_writes.clone(),
                command_range: record.command_range.clone(),
                commands: owned.commands,
            }
        })
        .collect()
}

/// Resets a frame's transient registries after completion (§4.7), returning them ready for the
/// next accumulation phase.
pub fn reset_transient_registries<T>(registries: &mut [TransientRegistry<T>]) {
    for registry in registries {
        registry.reset();
    }
}
