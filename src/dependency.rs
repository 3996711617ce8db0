//! The pass dependency table (§4.6(b), §3 Data Model: "Dependency entry").

/// What one pass's relationship to an earlier pass requires of the compiler's reordering.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DependencyKind {
    /// No constraint between the two passes.
    None,
    /// A write-after-write relationship: order must be preserved, but the compiler may still
    /// interleave independent work between them.
    Ordering,
    /// A read-after-write (or CPU-visible-readback) relationship: the earlier pass must be active
    /// whenever the later one is, and must be scheduled strictly before it.
    Execution,
}

/// A triangular `(dst, src)` matrix over pass indices, storing only cells where `src < dst` — a
/// cell with `src >= dst` is undefined, matching the half of the relation the compiler actually
/// populates (§3: "cell undefined for `src >= dst`").
#[derive(Debug, Default)]
pub struct DependencyTable {
    pass_count: usize,
    cells: Vec<DependencyKind>,
}

impl DependencyTable {
    pub fn new(pass_count: usize) -> Self {
        Self {
            pass_count,
            cells: vec![DependencyKind::None; triangular_size(pass_count)],
        }
    }

    pub fn pass_count(&self) -> usize {
        self.pass_count
    }

    pub fn get(&self, dst: usize, src: usize) -> DependencyKind {
        debug_assert!(src < dst, "dependency cell undefined for src >= dst");
        self.cells[triangular_index(dst, src).expect("src < dst")]
    }

    /// Sets `dep(dst, src)`, but only ever strengthens it: `execution` is never downgraded to
    /// `ordering` by a later call, matching §4.6(b)'s "if dep ≠ execution, set ordering".
    pub fn set(&mut self, dst: usize, src: usize, kind: DependencyKind) {
        debug_assert!(src < dst, "dependency cell undefined for src >= dst");
        let index = triangular_index(dst, src).expect("src < dst");

        match (self.cells[index], kind) {
            (DependencyKind::Execution, DependencyKind::Ordering) => {}
            _ => self.cells[index] = kind,
        }
    }

    /// All `src` indices with a non-`None` dependency to `dst`, most useful for the activity
    /// flood-fill and reorder stages which only ever walk predecessors.
    pub fn predecessors(&self, dst: usize) -> impl Iterator<Item = (usize, DependencyKind)> + '_ {
        (0..dst).filter_map(move |src| {
            let kind = self.get(dst, src);
            (kind != DependencyKind::None).then_some((src, kind))
        })
    }

    /// Projects this table onto a renumbered, possibly smaller set of active indices (§4.6(i)).
    /// `old_to_new` maps an original index to its new index, or `None` if the pass was culled.
    pub fn project(&self, old_to_new: &[Option<usize>]) -> DependencyTable {
        let new_count = old_to_new.iter().filter(|x| x.is_some()).count();
        let mut projected = DependencyTable::new(new_count);

        for dst in 0..self.pass_count {
            let Some(new_dst) = old_to_new[dst] else { continue };

            for (src, kind) in self.predecessors(dst) {
                let Some(new_src) = old_to_new[src] else { continue };

                if new_src < new_dst {
                    projected.set(new_dst, new_src, kind);
                }
            }
        }

        projected
    }
}

fn triangular_size(pass_count: usize) -> usize {
    pass_count.saturating_sub(1) * pass_count / 2
}

fn triangular_index(dst: usize, src: usize) -> Option<usize> {
    if src >= dst {
        return None;
    }

    Some(triangular_size(dst) + src)
}
