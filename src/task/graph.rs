//! The process-wide task graph: every declared task plus the edges induced
//! by matching computes to requires.
//!
//! Compilation resolves each new-generation require to its unique producer,
//! enforces the one-producer-per-datum invariant, topologically sorts the
//! tasks, and assigns phases: each Reduction or communicating task closes
//! its phase and becomes that phase's synchronization task. The compiled
//! graph is the input to the per-process
//! [`DetailedTasks`](crate::task::detailed::DetailedTasks) compiler and is
//! rebuilt whenever the graph shape changes (regrid).

use crate::sched_error::SchedError;
use crate::task::{AccessScope, Dependency, Generation, Task, TaskKind, VarLabel};
use hashbrown::HashMap;
use std::collections::BTreeSet;
use std::sync::Arc;

/// A require resolved against the graph's writers.
#[derive(Clone, Debug)]
pub(crate) struct ResolvedRequire {
    pub dep: Dependency,
    /// Producing task indices. Empty for old-generation requires (the value
    /// predates this graph instance). Per-patch requires have exactly one;
    /// global requires may draw from several contributors.
    pub producers: Vec<usize>,
}

/// Declarative set of tasks, in declaration order.
#[derive(Default)]
pub struct TaskGraph {
    tasks: Vec<Arc<Task>>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_task(&mut self, task: Task) {
        self.tasks.push(Arc::new(task));
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Resolve dependencies, sort, and assign phases.
    pub fn compile(&self) -> Result<CompiledTaskGraph, SchedError> {
        let n = self.tasks.len();

        // Writer chains per per-patch label: the unique computer followed by
        // modifiers in declaration order. Global labels keep every writer.
        let mut per_patch_chain: HashMap<VarLabel, Vec<usize>> = HashMap::new();
        let mut global_writers: HashMap<VarLabel, Vec<usize>> = HashMap::new();
        for (ti, task) in self.tasks.iter().enumerate() {
            for dep in task.computes_list() {
                match dep.scope {
                    AccessScope::PerPatch => {
                        let chain = per_patch_chain.entry(dep.label.clone()).or_default();
                        if let Some(&first) = chain.first() {
                            return Err(SchedError::MultipleProducers {
                                label: dep.label.name().to_owned(),
                                first: self.tasks[first].name().to_owned(),
                                second: task.name().to_owned(),
                            });
                        }
                        chain.push(ti);
                    }
                    AccessScope::Global => {
                        global_writers.entry(dep.label.clone()).or_default().push(ti);
                    }
                }
            }
        }
        for (ti, task) in self.tasks.iter().enumerate() {
            for dep in task.modifies_list() {
                let chain = per_patch_chain.get_mut(&dep.label).ok_or_else(|| {
                    SchedError::UnresolvedRequirement {
                        task: task.name().to_owned(),
                        label: dep.label.name().to_owned(),
                    }
                })?;
                chain.push(ti);
            }
        }

        // Resolve requires. Readers see the final value of a writer chain;
        // a chain member's own accesses resolve to its predecessor.
        let mut resolved: Vec<Vec<ResolvedRequire>> = Vec::with_capacity(n);
        for (ti, task) in self.tasks.iter().enumerate() {
            let mut reqs = Vec::new();
            for dep in task.requires_list() {
                let producers = match dep.generation {
                    Generation::Old => Vec::new(),
                    Generation::New => match dep.scope {
                        AccessScope::PerPatch => {
                            let chain = per_patch_chain.get(&dep.label).ok_or_else(|| {
                                SchedError::UnresolvedRequirement {
                                    task: task.name().to_owned(),
                                    label: dep.label.name().to_owned(),
                                }
                            })?;
                            vec![writer_for_reader(chain, ti)]
                        }
                        AccessScope::Global => {
                            let writers: Vec<usize> = global_writers
                                .get(&dep.label)
                                .map(|w| w.iter().copied().filter(|&w| w != ti).collect())
                                .unwrap_or_default();
                            if writers.is_empty() && task.kind() != TaskKind::Reduction {
                                return Err(SchedError::UnresolvedRequirement {
                                    task: task.name().to_owned(),
                                    label: dep.label.name().to_owned(),
                                });
                            }
                            writers
                        }
                    },
                };
                reqs.push(ResolvedRequire {
                    dep: dep.clone(),
                    producers,
                });
            }
            // A modifier depends on the chain predecessor it updates.
            for dep in task.modifies_list() {
                let chain = &per_patch_chain[&dep.label];
                reqs.push(ResolvedRequire {
                    dep: dep.clone(),
                    producers: vec![writer_for_reader(chain, ti)],
                });
            }
            resolved.push(reqs);
        }

        // Task-level successor lists, deduplicated.
        let mut successors: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); n];
        for (ti, reqs) in resolved.iter().enumerate() {
            for r in reqs {
                for &p in &r.producers {
                    if p != ti {
                        successors[p].insert(ti);
                    }
                }
            }
        }

        // Deterministic Kahn sort: among ready tasks, lowest declaration
        // index first.
        let mut indegree = vec![0usize; n];
        for succs in &successors {
            for &s in succs {
                indegree[s] += 1;
            }
        }
        let mut ready: BTreeSet<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
        let mut sorted = Vec::with_capacity(n);
        while let Some(&ti) = ready.iter().next() {
            ready.remove(&ti);
            sorted.push(ti);
            for &s in &successors[ti] {
                indegree[s] -= 1;
                if indegree[s] == 0 {
                    ready.insert(s);
                }
            }
        }
        if sorted.len() != n {
            return Err(SchedError::CycleInGraph);
        }

        // Phase assignment: walk sorted order; each synchronization task
        // (Reduction or anything that communicates) closes its phase.
        let mut phase = vec![0usize; n];
        let mut sorted_pos = vec![0usize; n];
        let mut currphase = 0usize;
        for (pos, &ti) in sorted.iter().enumerate() {
            sorted_pos[ti] = pos;
            phase[ti] = currphase;
            let t = &self.tasks[ti];
            if t.kind() == TaskKind::Reduction || t.uses_comm() {
                currphase += 1;
            }
        }
        let num_phases = currphase + 1;

        log::debug!(
            "compiled task graph: {} tasks, {} phases",
            n,
            num_phases
        );

        Ok(CompiledTaskGraph {
            tasks: self.tasks.clone(),
            resolved,
            sorted,
            sorted_pos,
            phase,
            num_phases,
        })
    }
}

/// The writer a reader at declaration index `reader` resolves to: chain
/// members read their predecessor, everyone else reads the final writer.
fn writer_for_reader(chain: &[usize], reader: usize) -> usize {
    match chain.iter().position(|&w| w == reader) {
        Some(0) => chain[0], // the computer requiring its own output is a self-loop; caller filters
        Some(i) => chain[i - 1],
        None => *chain.last().expect("writer chain never empty"),
    }
}

/// Output of [`TaskGraph::compile`]: tasks plus resolved edges, a
/// deterministic topological order, and phase assignments.
pub struct CompiledTaskGraph {
    pub(crate) tasks: Vec<Arc<Task>>,
    pub(crate) resolved: Vec<Vec<ResolvedRequire>>,
    pub(crate) sorted: Vec<usize>,
    pub(crate) sorted_pos: Vec<usize>,
    pub(crate) phase: Vec<usize>,
    pub(crate) num_phases: usize,
}

impl CompiledTaskGraph {
    #[inline]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    #[inline]
    pub fn num_phases(&self) -> usize {
        self.num_phases
    }

    pub fn task(&self, idx: usize) -> &Arc<Task> {
        &self.tasks[idx]
    }

    /// Phase of the task at `idx`.
    pub fn phase_of(&self, idx: usize) -> usize {
        self.phase[idx]
    }

    /// Position of the task in the deterministic topological order.
    pub fn sorted_order_of(&self, idx: usize) -> usize {
        self.sorted_pos[idx]
    }

    /// Task indices in topological order.
    pub fn sorted(&self) -> &[usize] {
        &self.sorted
    }
}
