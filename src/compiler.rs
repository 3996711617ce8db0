//! The compile pipeline: cull, order, and finalise one frame's passes (§4.6).

use crate::dependency::{DependencyKind, DependencyTable};
use crate::handle::{ResourceFlags, ResourceHandle};
use crate::pass::{PassKind, PassRecord};
use crate::recorder::RecordedPass;
use crate::usage::UsageList;
use log::{debug, trace};
use std::collections::{HashMap, HashSet};

/// Resources flagged this way always make their writing pass side-effecting (§4.6(c)).
const SIDE_EFFECT_FLAGS: ResourceFlags = ResourceFlags::PERSISTENT
    .union(ResourceFlags::WINDOW_HANDLE)
    .union(ResourceFlags::HISTORY_BUFFER)
    .union(ResourceFlags::EXTERNAL_OWNERSHIP);

/// The finalised result of compiling one frame (§4.6 "Output").
pub struct CompiledGraph {
    /// Indices, in submission order, of passes to invoke serially on the compile thread before
    /// any GPU work is dispatched.
    pub cpu_passes: Vec<u32>,
    /// Surviving passes in final GPU submission order, renumbered `0..N`.
    pub active_passes: Vec<ActivePass>,
    /// The dependency table projected onto `active_passes`' renumbered indices.
    pub active_dependency_table: DependencyTable,
    /// Every resource referenced by any active pass.
    pub used_resources: HashSet<ResourceHandle>,
    /// Per-resource, frame-global usage lists, command ranges rebased to the pass's position in
    /// the active pass list.
    pub resource_usages: HashMap<ResourceHandle, UsageList>,
}

/// A single pass as it appears in the compiled, renumbered active list.
pub struct ActivePass {
    pub original_index: u32,
    pub kind: PassKind,
    pub name: String,
    pub render_target_group: u32,
}

struct PassContext<'a> {
    record: &'a PassRecord,
    recorded: &'a RecordedPass,
}

/// Compiles one frame's recorded passes into a [`CompiledGraph`] (§4.6 stages a-i).
///
/// `passes` and `recorded` are parallel, submission-ordered slices: `recorded[i]` is the output
/// of recording `passes[i]`.
pub fn compile(passes: &[PassRecord], recorded: &[RecordedPass]) -> CompiledGraph {
    assert_eq!(passes.len(), recorded.len());

    let pass_count = passes.len();
    let contexts: Vec<PassContext> = passes
        .iter()
        .zip(recorded.iter())
        .map(|(record, recorded)| PassContext { record, recorded })
        .collect();

    // (b) Dependency table construction.
    let dependency_table = build_dependency_table(&contexts);

    // (c) Side-effect marking.
    let has_side_effects: Vec<bool> = contexts.iter().map(has_side_effects_fn).collect();

    // (d) Activity flood-fill.
    let active = flood_fill_activity(&dependency_table, &has_side_effects, pass_count);

    if log::log_enabled!(log::Level::Trace) {
        let culled: Vec<&str> = (0..pass_count)
            .filter(|&i| !active[i])
            .map(|i| contexts[i].record.name.as_str())
            .collect();
        if !culled.is_empty() {
            trace!("compiler: culled {} unreachable pass(es): {culled:?}", culled.len());
        }
    }

    // (e) Draw-pass merge grouping.
    let render_target_groups = group_render_targets(&contexts);

    // (f) Dependency-respecting reorder.
    let order = reorder(&dependency_table, &has_side_effects, &active, &render_target_groups, pass_count);

    // (g) CPU-pass extraction.
    let mut cpu_passes = Vec::new();
    let mut gpu_order = Vec::new();
    for &index in &order {
        if contexts[index].record.kind.is_cpu() {
            cpu_passes.push(index as u32);
        } else {
            gpu_order.push(index);
        }
    }
    cpu_passes.sort_unstable();

    // (h) Index reassignment and usage merging.
    let mut old_to_new = vec![None; pass_count];
    for (new_index, &old_index) in gpu_order.iter().enumerate() {
        old_to_new[old_index] = Some(new_index);
    }

    let mut active_passes = Vec::with_capacity(gpu_order.len());
    let mut used_resources = HashSet::new();
    let mut resource_usages: HashMap<ResourceHandle, UsageList> = HashMap::new();

    for &old_index in &gpu_order {
        let context = &contexts[old_index];

        active_passes.push(ActivePass {
            original_index: old_index as u32,
            kind: context.record.kind,
            name: context.record.name.clone(),
            render_target_group: render_target_groups[old_index],
        });

        for (&resource, local_list) in &context.recorded.usages {
            used_resources.insert(resource);
            let global_list = resource_usages.entry(resource).or_default();

            for entry in local_list.entries() {
                global_list.append(entry.clone(), context.record.draw_count);
            }
        }
    }

    // (i) Active-pass dependency table.
    let active_dependency_table = dependency_table.project(&old_to_new);

    debug!(
        "compiler: {} cpu pass(es), {} active gpu pass(es) in final order: {:?}",
        cpu_passes.len(),
        active_passes.len(),
        active_passes.iter().map(|p| p.name.as_str()).collect::<Vec<_>>()
    );

    CompiledGraph {
        cpu_passes,
        active_passes,
        active_dependency_table,
        used_resources,
        resource_usages,
    }
}

fn has_side_effects_fn(context: &PassContext) -> bool {
    if context.record.has_side_effects {
        return true;
    }

    if context.record.kind == PassKind::External {
        return true;
    }

    if context.record.kind.is_cpu() && context.record.declared_reads.is_empty() && context.record.declared_writes.is_empty() {
        return true;
    }

    context
        .record
        .declared_writes
        .iter()
        .any(|handle| !(handle.flags() & SIDE_EFFECT_FLAGS).is_empty())
}

/// A pass's reads that touch host-visible memory. Reading a host-visible resource implies a CPU
/// readback, which forces a GPU→CPU flush; any later access to the same resource must be ordered
/// strictly after that flush the same way a real reader is ordered after a real write, so such a
/// read is also treated as a writer of the resource (§4.6(a)).
fn host_visible_reads(context: &PassContext) -> HashSet<ResourceHandle> {
    context
        .record
        .declared_reads
        .iter()
        .filter(|r| r.flags().contains(ResourceFlags::HOST_VISIBLE))
        .copied()
        .collect()
}

fn build_dependency_table(contexts: &[PassContext]) -> DependencyTable {
    let pass_count = contexts.len();
    let mut table = DependencyTable::new(pass_count);
    let host_visible_reads: Vec<HashSet<ResourceHandle>> = contexts.iter().map(host_visible_reads).collect();

    for j in 0..pass_count {
        for i in 0..j {
            let reads_j = &contexts[j].record.declared_reads;
            let writes_i = &contexts[i].record.declared_writes;
            let writes_j = &contexts[j].record.declared_writes;

            // A real read-after-write, or any access at all of a resource the earlier pass's
            // readback implicitly flushed — both are Execution relationships (§3 "Dependency
            // entry"): the earlier pass must stay active and run strictly before this one.
            let execution = reads_j.iter().any(|r| writes_i.contains(r))
                || reads_j.iter().any(|r| host_visible_reads[i].contains(r))
                || writes_j.iter().any(|r| host_visible_reads[i].contains(r));

            if execution {
                table.set(j, i, DependencyKind::Execution);
                continue;
            }

            let write_after_write = writes_j.iter().any(|r| writes_i.contains(r));
            if write_after_write {
                table.set(j, i, DependencyKind::Ordering);
            }
        }
    }

    table
}

fn flood_fill_activity(table: &DependencyTable, has_side_effects: &[bool], pass_count: usize) -> Vec<bool> {
    let mut active = vec![false; pass_count];
    let mut stack: Vec<usize> = (0..pass_count).filter(|&i| has_side_effects[i]).collect();

    for &seed in &stack {
        active[seed] = true;
    }

    while let Some(index) = stack.pop() {
        for (src, kind) in table.predecessors(index) {
            if kind == DependencyKind::Execution && !active[src] {
                active[src] = true;
                stack.push(src);
            }
        }
    }

    active
}

fn group_render_targets(contexts: &[PassContext]) -> Vec<u32> {
    let mut groups = vec![0u32; contexts.len()];
    let mut open_groups: Vec<(u32, &crate::pass::RenderTargetsDescriptor)> = Vec::new();
    let mut next_group = 0u32;

    for (index, context) in contexts.iter().enumerate() {
        let Some(descriptor) = context.record.render_targets.as_ref() else {
            groups[index] = next_group;
            next_group += 1;
            continue;
        };

        if let Some(&(group, _)) = open_groups.iter().find(|(_, open)| open.mergeable_with(descriptor)) {
            groups[index] = group;
        } else {
            let group = next_group;
            next_group += 1;
            groups[index] = group;
            open_groups.push((group, descriptor));
        }
    }

    groups
}

/// Reverse post-order walk seeded at side-effecting passes, highest index first, deferring
/// same-render-target-group predecessors of a draw pass until after its other predecessors
/// (§4.6(f)).
fn reorder(
    table: &DependencyTable,
    has_side_effects: &[bool],
    active: &[bool],
    render_target_groups: &[u32],
    pass_count: usize,
) -> Vec<usize> {
    let mut visited = vec![false; pass_count];
    let mut order = Vec::with_capacity(pass_count);

    let mut seeds: Vec<usize> = (0..pass_count).filter(|&i| has_side_effects[i] && active[i]).collect();
    seeds.sort_unstable_by(|a, b| b.cmp(a));

    for seed in seeds {
        visit(seed, table, active, render_target_groups, &mut visited, &mut order);
    }

    order
}

fn visit(
    index: usize,
    table: &DependencyTable,
    active: &[bool],
    render_target_groups: &[u32],
    visited: &mut [bool],
    order: &mut Vec<usize>,
) {
    if visited[index] {
        return;
    }
    visited[index] = true;

    let mut predecessors: Vec<(usize, DependencyKind)> = table
        .predecessors(index)
        .filter(|&(src, _)| active[src])
        .collect();

    let own_group = render_target_groups[index];
    predecessors.sort_by_key(|&(src, _)| render_target_groups[src] == own_group);

    for (src, _) in predecessors {
        visit(src, table, active, render_target_groups, visited, order);
    }

    order.push(index);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;
    use crate::handle::ResourceKind;
    use crate::usage::{AccessKind, ShaderStageMask, SubRange, UsageRecord};
    use std::collections::HashMap as StdHashMap;

    fn handle(slot: u32, flags: ResourceFlags) -> ResourceHandle {
        ResourceHandle::new(ResourceKind::Buffer, flags, 0, 0, slot)
    }

    fn simple_recorded(resource_usages: Vec<(ResourceHandle, AccessKind)>, draw_count: u32) -> RecordedPass {
        let mut usages: StdHashMap<ResourceHandle, UsageList> = StdHashMap::new();

        for (resource, access) in resource_usages {
            usages.entry(resource).or_default().append(
                UsageRecord {
                    pass_index: 0,
                    command_range: 0..1,
                    access,
                    stages: ShaderStageMask::COMPUTE,
                    sub_range: SubRange::Full,
                    in_argument_buffer: false,
                    is_indirectly_bound: false,
                },
                draw_count,
            );
        }

        RecordedPass {
            commands: vec![Command::General(crate::command::GeneralCommand::PopDebugGroup)],
            usages,
            unmanaged_references: Vec::new(),
        }
    }

    #[test]
    fn culls_a_pass_whose_output_is_never_consumed() {
        let resource_a = handle(1, ResourceFlags::empty());
        let resource_b = handle(2, ResourceFlags::PERSISTENT);

        let mut unconsumed = PassRecord::new(PassKind::Compute, "unconsumed".into());
        unconsumed.declare_write(resource_a);

        let mut side_effecting = PassRecord::new(PassKind::Compute, "side-effecting".into());
        side_effecting.declare_write(resource_b);

        let passes = vec![unconsumed, side_effecting];
        let recorded = vec![
            simple_recorded(vec![(resource_a, AccessKind::Write)], 0),
            simple_recorded(vec![(resource_b, AccessKind::Write)], 0),
        ];

        let compiled = compile(&passes, &recorded);

        assert_eq!(compiled.active_passes.len(), 1);
        assert_eq!(compiled.active_passes[0].name, "side-effecting");
    }

    #[test]
    fn execution_edge_keeps_writer_active_across_a_read() {
        let resource = handle(1, ResourceFlags::PERSISTENT);

        let mut writer = PassRecord::new(PassKind::Compute, "writer".into());
        writer.declare_write(resource);

        let mut reader = PassRecord::new(PassKind::Compute, "reader".into());
        reader.declare_read(resource);
        reader.has_side_effects = true;

        let passes = vec![writer, reader];
        let recorded = vec![
            simple_recorded(vec![(resource, AccessKind::Write)], 0),
            simple_recorded(vec![(resource, AccessKind::Read)], 0),
        ];

        let compiled = compile(&passes, &recorded);

        assert_eq!(compiled.active_passes.len(), 2);
        assert_eq!(compiled.active_dependency_table.get(1, 0), DependencyKind::Execution);
    }

    #[test]
    fn cpu_passes_are_extracted_and_ordered_separately() {
        let resource = handle(1, ResourceFlags::PERSISTENT);

        let mut cpu_first = PassRecord::new(PassKind::Cpu, "cpu-1".into());
        cpu_first.has_side_effects = true;

        let mut draw = PassRecord::new(PassKind::Draw, "draw-1".into());
        draw.declare_write(resource);

        let mut cpu_second = PassRecord::new(PassKind::Cpu, "cpu-2".into());
        cpu_second.has_side_effects = true;

        let passes = vec![cpu_first, draw, cpu_second];
        let recorded = vec![
            simple_recorded(vec![], 0),
            simple_recorded(vec![(resource, AccessKind::Write)], 1),
            simple_recorded(vec![], 0),
        ];

        let compiled = compile(&passes, &recorded);

        assert_eq!(compiled.cpu_passes, vec![0, 2]);
        assert_eq!(compiled.active_passes.len(), 1);
        assert_eq!(compiled.active_passes[0].name, "draw-1");
    }

    #[test]
    fn compatible_draw_passes_share_a_render_target_group() {
        use crate::pass::RenderTargetsDescriptor;

        let target = handle(1, ResourceFlags::PERSISTENT);
        let targets = RenderTargetsDescriptor {
            color_attachments: smallvec::smallvec![target],
            depth_stencil_attachment: None,
            sample_count: 1,
            width: 1920,
            height: 1080,
        };

        let make_draw = |name: &str| {
            let mut pass = PassRecord::new(PassKind::Draw, name.into());
            pass.render_targets = Some(targets.clone());
            pass.declare_write(target);
            pass.has_side_effects = true;
            pass
        };

        let passes = vec![make_draw("p1"), make_draw("p2"), make_draw("p3")];
        let recorded = vec![
            simple_recorded(vec![(target, AccessKind::Write)], 1),
            simple_recorded(vec![(target, AccessKind::Write)], 1),
            simple_recorded(vec![(target, AccessKind::Write)], 1),
        ];

        let compiled = compile(&passes, &recorded);

        assert_eq!(compiled.active_passes.len(), 3);
        let group = compiled.active_passes[0].render_target_group;
        assert!(compiled.active_passes.iter().all(|p| p.render_target_group == group));
    }

    #[test]
    fn reading_a_host_visible_resource_keeps_the_reader_alive_and_orders_later_access() {
        let resource = handle(1, ResourceFlags::PERSISTENT | ResourceFlags::HOST_VISIBLE);

        let mut writer = PassRecord::new(PassKind::Compute, "writer".into());
        writer.declare_write(resource);

        // No `has_side_effects`: the readback's own declares carry no side-effect-flagged write,
        // so it only survives culling through the promoted-writer dependency itself.
        let mut readback = PassRecord::new(PassKind::Compute, "readback".into());
        readback.declare_read(resource);

        let mut later_writer = PassRecord::new(PassKind::Compute, "later-writer".into());
        later_writer.declare_write(resource);
        later_writer.has_side_effects = true;

        let passes = vec![writer, readback, later_writer];
        let recorded = vec![
            simple_recorded(vec![(resource, AccessKind::Write)], 0),
            simple_recorded(vec![(resource, AccessKind::Read)], 0),
            simple_recorded(vec![(resource, AccessKind::Write)], 0),
        ];

        let compiled = compile(&passes, &recorded);

        assert_eq!(compiled.active_passes.len(), 3, "the readback must not be culled");
        let readback_index = compiled
            .active_passes
            .iter()
            .position(|p| p.name == "readback")
            .unwrap();
        let later_writer_index = compiled
            .active_passes
            .iter()
            .position(|p| p.name == "later-writer")
            .unwrap();
        assert_eq!(
            compiled.active_dependency_table.get(later_writer_index, readback_index),
            DependencyKind::Execution
        );
    }

    #[test]
    fn write_after_write_sets_ordering_not_execution() {
        let resource = handle(1, ResourceFlags::PERSISTENT);

        let mut first = PassRecord::new(PassKind::Compute, "first".into());
        first.declare_write(resource);

        let mut second = PassRecord::new(PassKind::Compute, "second".into());
        second.declare_write(resource);
        second.has_side_effects = true;

        let passes = vec![first, second];
        let recorded = vec![
            simple_recorded(vec![(resource, AccessKind::Write)], 0),
            simple_recorded(vec![(resource, AccessKind::Write)], 0),
        ];

        let compiled = compile(&passes, &recorded);

        assert_eq!(compiled.active_dependency_table.get(1, 0), DependencyKind::Ordering);
    }

    /// Throws random graphs at `compile()` and checks structural invariants that must hold no
    /// matter how the reads/writes happen to line up, the same way the teacher's buffer access
    /// tracker is fuzzed with a seeded `SmallRng` rather than a handful of hand-picked cases.
    #[test]
    fn compile_holds_its_invariants_over_random_graphs() {
        use rand::{rngs::SmallRng, Rng, SeedableRng};

        // So a failure can be re-run with `RUST_LOG=trace` and show the compiler's stage
        // diagnostics; harmless no-op when a logger is already installed or none is requested.
        let _ = env_logger::builder().is_test(true).try_init();

        const FUZZ_COUNT: usize = 500;
        const MAX_PASSES: usize = 12;
        const RESOURCE_POOL: usize = 4;

        let resources: Vec<ResourceHandle> = (0..RESOURCE_POOL)
            .map(|slot| handle(slot as u32, ResourceFlags::PERSISTENT))
            .collect();

        let mut rng = SmallRng::seed_from_u64(1234);

        for _ in 0..FUZZ_COUNT {
            let pass_count = rng.gen_range(1..=MAX_PASSES);
            let mut passes = Vec::with_capacity(pass_count);
            let mut recorded = Vec::with_capacity(pass_count);

            for i in 0..pass_count {
                let mut pass = PassRecord::new(PassKind::Compute, format!("pass-{i}"));
                let mut accesses = Vec::new();

                for &resource in &resources {
                    match rng.gen_range(0..3) {
                        0 => {}
                        1 => {
                            pass.declare_read(resource);
                            accesses.push((resource, AccessKind::Read));
                        }
                        _ => {
                            pass.declare_write(resource);
                            accesses.push((resource, AccessKind::Write));
                        }
                    }
                }

                pass.has_side_effects = rng.gen_bool(0.2);

                passes.push(pass);
                recorded.push(simple_recorded(accesses, 0));
            }

            let compiled = compile(&passes, &recorded);

            assert!(compiled.active_passes.len() <= pass_count);
            assert_eq!(
                compiled.active_dependency_table.pass_count(),
                compiled.active_passes.len()
            );

            let original_indices: HashSet<u32> =
                compiled.active_passes.iter().map(|p| p.original_index).collect();
            assert_eq!(
                original_indices.len(),
                compiled.active_passes.len(),
                "every surviving pass must appear exactly once"
            );

            for resource in compiled.used_resources.iter() {
                assert!(resources.contains(resource));
            }
        }
    }
}
