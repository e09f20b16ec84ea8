//! Per-process instantiation of the task graph: detailed tasks, realized
//! dependency edges, and the two ready queues.
//!
//! Every rank compiles the same global (task × patch) product so that
//! message tags come out identical everywhere, then keeps the instances its
//! own rank owns. Detailed tasks live in an arena addressed by
//! [`DetailedTaskId`] indices; the queues hold ids, never references, and
//! the arena is the sole owner (the execution loop only borrows).
//!
//! Edges are realized three ways:
//! - both sides local: an ordering edge (internal dependency count),
//! - producer remote: a receive plan, deduplicated per
//!   `(label, patch, material, generation, source rank)`; all requires of
//!   the same datum from the same source are one logical message,
//! - consumer remote: a send plan on the local producer, posted at its
//!   completion.

use crate::balance::LoadBalancer;
use crate::grid::{MaterialId, PatchId, PatchTopology, ProcessGroup};
use crate::invariants::{inv_assert, inv_assert_eq};
use crate::sched_error::SchedError;
use crate::task::graph::CompiledTaskGraph;
use crate::task::queue::{self, QueuePolicy, ReadyEntry};
use crate::task::{AccessScope, Generation, Ghost, Task, TaskKind, VarKey};
use hashbrown::HashMap;
use rand::rngs::SmallRng;
use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::sync::Arc;

/// Stable arena index of a detailed task.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DetailedTaskId(pub u32);

impl DetailedTaskId {
    #[inline]
    pub(crate) fn idx(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for DetailedTaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DetailedTaskId").field(&self.0).finish()
    }
}

/// First point-to-point tag; tags below are free for callers.
const BASE_TAG: u16 = 0x0100;
/// Tags at and above this are reserved for the collective protocol.
pub(crate) const COLLECTIVE_TAG_BASE: u16 = 0xFF00;

/// One inbound logical message and the local tasks waiting on it.
#[derive(Clone, Debug)]
pub(crate) struct RecvPlan {
    pub key: VarKey,
    pub src: usize,
    pub tag: u16,
    pub consumers: Vec<DetailedTaskId>,
}

/// One outbound message a local producer posts at completion.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct SendPlan {
    pub key: VarKey,
    pub dst: usize,
    pub tag: u16,
}

/// A task instantiated against concrete local patches/materials.
pub(crate) struct DetailedTask {
    task: usize,
    patches: Vec<PatchId>,
    materials: Vec<MaterialId>,
    phase: usize,
    static_order: usize,
    successors: Vec<DetailedTaskId>,
    num_local_preds: usize,
    recv_plans: Vec<usize>,
    send_plans: Vec<SendPlan>,
    l2_children: usize,

    // Live state, reset per execute.
    internal_deps_left: usize,
    external_deps_left: usize,
    initiated: bool,
    done: bool,
}

impl DetailedTask {
    fn new(
        task: usize,
        patches: Vec<PatchId>,
        materials: Vec<MaterialId>,
        phase: usize,
        static_order: usize,
    ) -> Self {
        Self {
            task,
            patches,
            materials,
            phase,
            static_order,
            successors: Vec::new(),
            num_local_preds: 0,
            recv_plans: Vec::new(),
            send_plans: Vec::new(),
            l2_children: 0,
            internal_deps_left: 0,
            external_deps_left: 0,
            initiated: false,
            done: false,
        }
    }
}

/// Both endpoints of one logical remote message, as seen by this rank.
#[derive(Default)]
struct MsgEnds {
    producer_local: Option<DetailedTaskId>,
    consumers: Vec<DetailedTaskId>,
}

/// Identifies one global task instance during compilation.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
enum InstKey {
    Patch(PatchId),
    Rank(usize),
}

#[derive(Copy, Clone)]
struct InstInfo {
    owner: usize,
    local: Option<DetailedTaskId>,
}

/// The per-process detailed task graph plus its ready queues.
pub struct DetailedTasks {
    tasks: Vec<Arc<Task>>,
    dtasks: Vec<DetailedTask>,
    recv_plans: Vec<RecvPlan>,
    num_phases: usize,
    phase_counts: Vec<usize>,
    total_instances: usize,

    internal_ready: VecDeque<DetailedTaskId>,
    external_ready: Vec<ReadyEntry>,
    arrival_seq: u64,
}

impl DetailedTasks {
    /// Instantiate `graph` against the concrete patch partition.
    ///
    /// Re-invoked whenever the partition changes (regrid) or the graph
    /// shape does.
    pub fn compile(
        graph: &CompiledTaskGraph,
        topo: &PatchTopology,
        materials: &[MaterialId],
        lb: &dyn LoadBalancer,
        world: ProcessGroup,
    ) -> Result<Self, SchedError> {
        let me = world.rank;
        let mut dtasks: Vec<DetailedTask> = Vec::new();
        let mut inst: HashMap<(usize, InstKey), InstInfo> = HashMap::new();
        let mut order: Vec<(usize, InstKey)> = Vec::new();
        let mut static_order = 0usize;

        // Pass 1: enumerate every global instance in deterministic order
        // (topological task order, then patch/rank order).
        for &ti in graph.sorted() {
            let task = graph.task(ti);
            match task.kind() {
                TaskKind::Normal => {
                    for &p in topo.patches() {
                        let owner = lb.owner(p);
                        let local = (owner == me).then(|| {
                            let id = DetailedTaskId(dtasks.len() as u32);
                            dtasks.push(DetailedTask::new(
                                ti,
                                vec![p],
                                materials.to_vec(),
                                graph.phase_of(ti),
                                static_order,
                            ));
                            id
                        });
                        inst.insert((ti, InstKey::Patch(p)), InstInfo { owner, local });
                        order.push((ti, InstKey::Patch(p)));
                        static_order += 1;
                    }
                }
                TaskKind::Reduction | TaskKind::OncePerProc => {
                    for rank in 0..world.size {
                        let local = (rank == me).then(|| {
                            let id = DetailedTaskId(dtasks.len() as u32);
                            dtasks.push(DetailedTask::new(
                                ti,
                                lb.rank_patches(topo, rank),
                                materials.to_vec(),
                                graph.phase_of(ti),
                                static_order,
                            ));
                            id
                        });
                        inst.insert((ti, InstKey::Rank(rank)), InstInfo { owner: rank, local });
                        order.push((ti, InstKey::Rank(rank)));
                        static_order += 1;
                    }
                }
            }
        }

        // Pass 2: walk every instance's requires and realize edges. Remote
        // edges are collected globally first so the tag assignment is
        // identical on every rank.
        let mut local_preds: Vec<BTreeSet<DetailedTaskId>> =
            (0..dtasks.len()).map(|_| BTreeSet::new()).collect();
        let mut succ_sets: Vec<BTreeSet<DetailedTaskId>> =
            (0..dtasks.len()).map(|_| BTreeSet::new()).collect();
        let mut messages: std::collections::BTreeMap<(VarKey, usize, usize), MsgEnds> =
            std::collections::BTreeMap::new();

        for &(ti, ikey) in &order {
            let info = inst[&(ti, ikey)];
            let task = graph.task(ti);
            let consumer_patches: Vec<PatchId> = match ikey {
                InstKey::Patch(p) => vec![p],
                InstKey::Rank(r) => lb.rank_patches(topo, r),
            };
            for req in &graph.resolved[ti] {
                if req.dep.generation == Generation::Old {
                    continue;
                }
                match req.dep.scope {
                    AccessScope::PerPatch => {
                        let pt = req.producers[0];
                        if pt == ti {
                            continue;
                        }
                        // Ghost requirements pull in neighbor patches; only
                        // patch-instanced tasks expand them.
                        let mut targets = consumer_patches.clone();
                        if req.dep.ghost != Ghost::None {
                            if let InstKey::Patch(p) = ikey {
                                targets.extend(topo.neighbors(p).iter().copied());
                            }
                        }
                        for q in targets {
                            let producer = inst.get(&(pt, InstKey::Patch(q))).ok_or_else(|| {
                                SchedError::Assertion(format!(
                                    "no instance of task `{}` on patch {q}",
                                    graph.task(pt).name()
                                ))
                            })?;
                            for &m in materials {
                                let key = VarKey {
                                    label: req.dep.label.clone(),
                                    patch: Some(q),
                                    material: m,
                                    generation: req.dep.generation,
                                };
                                wire_edge(
                                    me,
                                    producer,
                                    &info,
                                    key,
                                    &mut local_preds,
                                    &mut succ_sets,
                                    &mut messages,
                                );
                            }
                        }
                    }
                    AccessScope::Global => {
                        // Global values never cross ranks point-to-point;
                        // the collective protocol moves them. Edges only from
                        // same-rank contributors.
                        for &pt in &req.producers {
                            let producer_insts: Vec<InstInfo> = match graph.task(pt).kind() {
                                TaskKind::Normal => topo
                                    .patches()
                                    .iter()
                                    .filter(|&&q| lb.owner(q) == info.owner)
                                    .map(|&q| inst[&(pt, InstKey::Patch(q))])
                                    .collect(),
                                _ => vec![inst[&(pt, InstKey::Rank(info.owner))]],
                            };
                            for producer in producer_insts {
                                if let (Some(c), Some(p)) = (info.local, producer.local) {
                                    if p != c {
                                        local_preds[c.idx()].insert(p);
                                        succ_sets[p.idx()].insert(c);
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }

        // Pass 3: deterministic tag assignment over the globally sorted
        // remote-message set, then keep this rank's plans.
        let nmsgs = messages.len();
        if nmsgs > (COLLECTIVE_TAG_BASE - BASE_TAG) as usize {
            return Err(SchedError::TagSpaceExhausted(nmsgs));
        }
        let mut recv_plans: Vec<RecvPlan> = Vec::new();
        for (i, ((key, src, dst), ends)) in messages.into_iter().enumerate() {
            let tag = BASE_TAG + i as u16;
            if dst == me {
                debug_assert!(!ends.consumers.is_empty());
                let plan_idx = recv_plans.len();
                for &c in &ends.consumers {
                    dtasks[c.idx()].recv_plans.push(plan_idx);
                }
                recv_plans.push(RecvPlan {
                    key,
                    src,
                    tag,
                    consumers: ends.consumers,
                });
            } else if src == me {
                let id = ends.producer_local.ok_or_else(|| {
                    SchedError::Assertion(format!(
                        "no local producer for outbound message `{}` on patch {:?}",
                        key.label, key.patch
                    ))
                })?;
                dtasks[id.idx()].send_plans.push(SendPlan { key, dst, tag });
            }
        }

        for (i, dt) in dtasks.iter_mut().enumerate() {
            dt.num_local_preds = local_preds[i].len();
            dt.successors = succ_sets[i].iter().copied().collect();
        }
        let l2: Vec<usize> = (0..dtasks.len())
            .map(|i| {
                dtasks[i]
                    .successors
                    .iter()
                    .map(|s| dtasks[s.idx()].successors.len())
                    .sum()
            })
            .collect();
        for (dt, l2c) in dtasks.iter_mut().zip(l2) {
            dt.l2_children = l2c;
        }

        let num_phases = graph.num_phases();
        let mut phase_counts = vec![0usize; num_phases];
        for dt in &dtasks {
            phase_counts[dt.phase] += 1;
        }

        log::debug!(
            "rank-{me} detailed graph: {} local of {} total instances, {} inbound messages",
            dtasks.len(),
            order.len(),
            recv_plans.len()
        );

        Ok(Self {
            tasks: graph.tasks.clone(),
            dtasks,
            recv_plans,
            num_phases,
            phase_counts,
            total_instances: order.len(),
            internal_ready: VecDeque::new(),
            external_ready: Vec::new(),
            arrival_seq: 0,
        })
    }

    /// Number of detailed tasks this rank executes.
    #[inline]
    pub fn num_local_tasks(&self) -> usize {
        self.dtasks.len()
    }

    /// Number of instances across all ranks.
    #[inline]
    pub fn num_tasks(&self) -> usize {
        self.total_instances
    }

    #[inline]
    pub fn num_phases(&self) -> usize {
        self.num_phases
    }

    #[inline]
    pub(crate) fn phase_counts(&self) -> &[usize] {
        &self.phase_counts
    }

    pub(crate) fn task(&self, id: DetailedTaskId) -> &Arc<Task> {
        &self.tasks[self.dtasks[id.idx()].task]
    }

    pub(crate) fn name_of(&self, id: DetailedTaskId) -> String {
        let dt = &self.dtasks[id.idx()];
        match self.tasks[dt.task].kind() {
            TaskKind::Normal => format!(
                "{}@patch{}",
                self.tasks[dt.task].name(),
                dt.patches.first().map(|p| p.get()).unwrap_or(0)
            ),
            _ => self.tasks[dt.task].name().to_owned(),
        }
    }

    pub(crate) fn phase_of(&self, id: DetailedTaskId) -> usize {
        self.dtasks[id.idx()].phase
    }

    pub(crate) fn static_order(&self, id: DetailedTaskId) -> usize {
        self.dtasks[id.idx()].static_order
    }

    pub(crate) fn patches(&self, id: DetailedTaskId) -> &[PatchId] {
        &self.dtasks[id.idx()].patches
    }

    pub(crate) fn materials(&self, id: DetailedTaskId) -> &[MaterialId] {
        &self.dtasks[id.idx()].materials
    }

    pub(crate) fn send_plans(&self, id: DetailedTaskId) -> &[SendPlan] {
        &self.dtasks[id.idx()].send_plans
    }

    pub(crate) fn recv_plan_ids(&self, id: DetailedTaskId) -> &[usize] {
        &self.dtasks[id.idx()].recv_plans
    }

    pub(crate) fn recv_plan(&self, idx: usize) -> &RecvPlan {
        &self.recv_plans[idx]
    }

    pub(crate) fn num_recv_plans(&self) -> usize {
        self.recv_plans.len()
    }

    pub(crate) fn external_dep_count(&self, id: DetailedTaskId) -> usize {
        self.dtasks[id.idx()].external_deps_left
    }

    pub(crate) fn is_done(&self, id: DetailedTaskId) -> bool {
        self.dtasks[id.idx()].done
    }

    /// Reset live counters and seed the internal-ready queue. Called once
    /// at the top of every execute.
    pub(crate) fn reset_dependency_counts(&mut self) {
        self.internal_ready.clear();
        self.external_ready.clear();
        self.arrival_seq = 0;
        for dt in &mut self.dtasks {
            dt.internal_deps_left = dt.num_local_preds;
            dt.external_deps_left = dt.recv_plans.len();
            dt.initiated = false;
            dt.done = false;
        }
        for i in 0..self.dtasks.len() {
            if self.dtasks[i].internal_deps_left == 0 {
                self.internal_ready.push_back(DetailedTaskId(i as u32));
            }
        }
    }

    #[inline]
    pub(crate) fn num_internal_ready(&self) -> usize {
        self.internal_ready.len()
    }

    #[inline]
    pub(crate) fn num_external_ready(&self) -> usize {
        self.external_ready.len()
    }

    pub(crate) fn pop_internal_ready(&mut self) -> Option<DetailedTaskId> {
        self.internal_ready.pop_front()
    }

    /// Mark a task's receives posted; promotes straight to external-ready
    /// when nothing is (or remains) outstanding.
    pub(crate) fn mark_initiated(&mut self, id: DetailedTaskId) {
        let dt = &mut self.dtasks[id.idx()];
        inv_assert!(!dt.initiated, "task initiated twice");
        inv_assert_eq!(dt.internal_deps_left, 0);
        dt.initiated = true;
        if dt.external_deps_left == 0 {
            self.push_external(id);
        }
    }

    /// Like [`mark_initiated`](Self::mark_initiated) but without queueing:
    /// used for phase synchronization tasks, which the loop runs directly.
    /// Such tasks have no remote requires by construction.
    pub(crate) fn mark_initiated_direct(&mut self, id: DetailedTaskId) {
        let dt = &mut self.dtasks[id.idx()];
        inv_assert!(!dt.initiated, "task initiated twice");
        dt.initiated = true;
    }

    /// A logical message arrived: decrement every waiting consumer, and
    /// promote the ones that were already initiated.
    pub(crate) fn message_arrived(&mut self, plan_idx: usize) {
        let consumers = self.recv_plans[plan_idx].consumers.clone();
        for c in consumers {
            let dt = &mut self.dtasks[c.idx()];
            inv_assert!(dt.external_deps_left > 0, "external count underflow");
            dt.external_deps_left -= 1;
            if dt.external_deps_left == 0 && dt.initiated && !dt.done {
                self.push_external(c);
            }
        }
    }

    fn push_external(&mut self, id: DetailedTaskId) {
        let dt = &self.dtasks[id.idx()];
        let entry = ReadyEntry {
            id,
            seq: self.arrival_seq,
            static_order: dt.static_order,
            children: dt.successors.len(),
            l2_children: dt.l2_children,
            messages: dt.send_plans.len(),
            patch: dt.patches.first().copied(),
        };
        self.arrival_seq += 1;
        self.external_ready.push(entry);
    }

    /// Pop the highest-priority external-ready task per the policy.
    pub(crate) fn pop_external_ready(
        &mut self,
        policy: QueuePolicy,
        rng: &mut SmallRng,
    ) -> Option<DetailedTaskId> {
        if self.external_ready.is_empty() {
            return None;
        }
        let i = queue::select(policy, rng, &self.external_ready);
        Some(self.external_ready.swap_remove(i).id)
    }

    /// Record completion and promote successors whose local predecessors
    /// are now all satisfied.
    pub(crate) fn task_completed(&mut self, id: DetailedTaskId) {
        let dt = &mut self.dtasks[id.idx()];
        inv_assert!(!dt.done, "task completed twice");
        dt.done = true;
        let succs = dt.successors.clone();
        for s in succs {
            let sdt = &mut self.dtasks[s.idx()];
            inv_assert!(sdt.internal_deps_left > 0, "internal count underflow");
            sdt.internal_deps_left -= 1;
            if sdt.internal_deps_left == 0 {
                self.internal_ready.push_back(s);
            }
        }
    }

    /// All local detailed-task ids, in static order.
    pub(crate) fn ids(&self) -> impl Iterator<Item = DetailedTaskId> + '_ {
        (0..self.dtasks.len() as u32).map(DetailedTaskId)
    }
}

fn wire_edge(
    me: usize,
    producer: &InstInfo,
    consumer: &InstInfo,
    key: VarKey,
    local_preds: &mut [BTreeSet<DetailedTaskId>],
    succ_sets: &mut [BTreeSet<DetailedTaskId>],
    messages: &mut std::collections::BTreeMap<(VarKey, usize, usize), MsgEnds>,
) {
    if producer.owner == consumer.owner {
        if let (Some(p), Some(c)) = (producer.local, consumer.local) {
            if p != c {
                local_preds[c.idx()].insert(p);
                succ_sets[p.idx()].insert(c);
            }
        }
        return;
    }
    let entry = messages
        .entry((key, producer.owner, consumer.owner))
        .or_default();
    if producer.owner == me {
        entry.producer_local = producer.local;
    }
    if consumer.owner == me {
        let c = consumer.local.expect("consumer owned by this rank");
        if !entry.consumers.contains(&c) {
            entry.consumers.push(c);
        }
    }
}
