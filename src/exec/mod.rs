//! The execution loop: drains the ready queues, overlaps communication with
//! computation, coordinates phase synchronization tasks, and drives the
//! cooperative abort/restart protocol.
//!
//! One OS thread per process drives the loop; the only suspension point is
//! the blocking `WaitOnce` poll, taken when both queues are empty and the
//! current phase cannot yet synchronize. Per-execute state (counters, phase
//! bookkeeping, diagnostics) is reset at the top of every call, so nested
//! sub-schedulers re-enter cleanly.

pub mod stats;

use crate::balance::LoadBalancer;
use crate::comm::engine::{CommMode, MessageEngine};
use crate::comm::{Communicator, collective};
use crate::grid::{MaterialId, PatchTopology, ProcessGroup};
use crate::sched_error::SchedError;
use crate::task::detailed::{COLLECTIVE_TAG_BASE, DetailedTaskId, DetailedTasks};
use crate::task::graph::TaskGraph;
use crate::task::queue::QueuePolicy;
use crate::task::{AccessScope, TaskKind};
use crate::warehouse::{DataWarehouse, bytes_to_scalars, scalars_to_bytes};
use bytes::Bytes;
use rand::SeedableRng;
use rand::rngs::SmallRng;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use stats::{ExecStats, TraceEntry};

/// Dynamic task scheduler: executes compiled detailed task graphs against a
/// pair of data-warehouse generations.
pub struct Scheduler<C: Communicator> {
    world: ProcessGroup,
    comm: Arc<C>,
    lb: Arc<dyn LoadBalancer>,
    policy: QueuePolicy,
    rng_seed: u64,
    graphs: Vec<DetailedTasks>,
    old_dw: Option<Arc<dyn DataWarehouse>>,
    new_dw: Option<Arc<dyn DataWarehouse>>,
    restartable: bool,
    collect_stats: bool,
}

impl<C: Communicator> Scheduler<C> {
    pub fn new(comm: Arc<C>, lb: Arc<dyn LoadBalancer>) -> Self {
        let world = ProcessGroup::new(comm.rank(), comm.size());
        Self {
            world,
            comm,
            lb,
            policy: QueuePolicy::default(),
            rng_seed: 0,
            graphs: Vec::new(),
            old_dw: None,
            new_dw: None,
            restartable: false,
            collect_stats: false,
        }
    }

    #[inline]
    pub fn world(&self) -> ProcessGroup {
        self.world
    }

    pub fn set_queue_policy(&mut self, policy: QueuePolicy) {
        self.policy = policy;
    }

    /// Select the ready-queue policy from its configuration string.
    /// Unrecognized names fail before any execution begins.
    pub fn set_queue_policy_str(&mut self, name: &str) -> Result<(), SchedError> {
        self.policy = QueuePolicy::from_str(name)?;
        Ok(())
    }

    #[inline]
    pub fn queue_policy(&self) -> QueuePolicy {
        self.policy
    }

    /// Seed for the randomized queue policies; fixed so runs replay.
    pub fn set_rng_seed(&mut self, seed: u64) {
        self.rng_seed = seed;
    }

    /// Whether a raised abort flag should be turned into a cooperative
    /// restart at the end of the final graph's execution.
    pub fn set_restartable(&mut self, restartable: bool) {
        self.restartable = restartable;
    }

    /// Enable the queue-length histogram and the execution-order trace.
    pub fn set_collect_stats(&mut self, collect: bool) {
        self.collect_stats = collect;
    }

    pub fn attach_warehouses(
        &mut self,
        old_dw: Arc<dyn DataWarehouse>,
        new_dw: Arc<dyn DataWarehouse>,
    ) {
        self.old_dw = Some(old_dw);
        self.new_dw = Some(new_dw);
    }

    /// Compile `graph` against the current partition and register it.
    /// Returns the graph index to pass to [`execute`](Self::execute).
    /// Call again after a regrid to rebuild against the new partition.
    pub fn compile_graph(
        &mut self,
        graph: &TaskGraph,
        topo: &PatchTopology,
        materials: &[MaterialId],
    ) -> Result<usize, SchedError> {
        let compiled = graph.compile()?;
        let dts =
            DetailedTasks::compile(&compiled, topo, materials, self.lb.as_ref(), self.world)?;
        self.graphs.push(dts);
        Ok(self.graphs.len() - 1)
    }

    /// Drop all compiled graphs (regrid path).
    pub fn clear_graphs(&mut self) {
        self.graphs.clear();
    }

    #[inline]
    pub fn num_graphs(&self) -> usize {
        self.graphs.len()
    }

    /// An independently-stateful nested scheduler sharing this one's
    /// process group, communicator, and load balancer. Sub-schedulers are
    /// drained to completion before control returns to the parent, and they
    /// never drive the restart protocol themselves.
    pub fn create_sub_scheduler(&self) -> Scheduler<C> {
        Scheduler {
            world: self.world,
            comm: Arc::clone(&self.comm),
            lb: Arc::clone(&self.lb),
            policy: self.policy,
            rng_seed: self.rng_seed,
            graphs: Vec::new(),
            old_dw: None,
            new_dw: None,
            restartable: false,
            collect_stats: self.collect_stats,
        }
    }

    /// Run one detailed task graph to completion (or fatal error).
    ///
    /// Returns the per-call diagnostics. On return every posted receive has
    /// completed and every send has drained; if any rank raised the abort
    /// flag and this scheduler is restartable, the restart decision has
    /// been propagated to all ranks' warehouses.
    pub fn execute(&mut self, graph_index: usize, iteration: usize) -> Result<ExecStats, SchedError> {
        let world = self.world;
        let policy = self.policy;
        let collect = self.collect_stats;
        let restartable = self.restartable;
        let num_graphs = self.graphs.len();
        let comm = Arc::clone(&self.comm);
        let old_dw = Arc::clone(self.old_dw.as_ref().ok_or(SchedError::MissingWarehouse)?);
        let new_dw = Arc::clone(self.new_dw.as_ref().ok_or(SchedError::MissingWarehouse)?);
        let dts = self
            .graphs
            .get_mut(graph_index)
            .ok_or(SchedError::NoSuchGraph(graph_index))?;

        let mut rng = SmallRng::seed_from_u64(self.rng_seed.wrapping_add(iteration as u64));
        let mut stats = ExecStats::default();
        let ntasks = dts.num_local_tasks();
        stats.local_tasks = ntasks;

        dts.reset_dependency_counts();
        let mut engine = MessageEngine::new(comm.as_ref(), dts.num_recv_plans());

        let phase_tasks: Vec<usize> = dts.phase_counts().to_vec();
        let num_phases = dts.num_phases();
        let mut phase_done = vec![0usize; num_phases];
        let mut phase_sync: Vec<Option<DetailedTaskId>> = vec![None; num_phases];
        let mut currphase = 0usize;
        let mut collective_tag = COLLECTIVE_TAG_BASE;

        let mut num_done = 0usize;
        let mut abort = false;
        let mut abort_point = usize::MAX;

        log::debug!(
            "rank-{} executing graph {graph_index}: {} tasks ({ntasks} local), phases {:?}",
            world.rank,
            dts.num_tasks(),
            phase_tasks
        );

        while num_done < ntasks {
            // 1. Drain internal-ready: park phase sync tasks, post receives
            //    for everything else.
            while let Some(id) = dts.pop_internal_ready() {
                let task = dts.task(id);
                if task.kind() == TaskKind::Reduction || task.uses_comm() {
                    let phase = dts.phase_of(id);
                    if phase_sync[phase].is_some() {
                        return Err(SchedError::Assertion(format!(
                            "two synchronization tasks registered for phase {phase}"
                        )));
                    }
                    log::trace!(
                        "rank-{} sync task `{}` parked for phase {phase}, ext deps {}",
                        world.rank,
                        dts.name_of(id),
                        dts.external_dep_count(id)
                    );
                    phase_sync[phase] = Some(id);
                } else {
                    let t0 = Instant::now();
                    engine.initiate_task(dts, id);
                    dts.mark_initiated(id);
                    stats.total_recv += t0.elapsed();
                    log::trace!(
                        "rank-{} task `{}` initiated, ext deps {}",
                        world.rank,
                        dts.name_of(id),
                        dts.external_dep_count(id)
                    );
                }
            }

            let mut ran_this_iteration = false;

            // 2. Run one task whose communication is complete.
            if dts.num_external_ready() > 0 {
                if collect {
                    stats.record_queue_length(dts.num_external_ready());
                }
                let id = dts
                    .pop_external_ready(policy, &mut rng)
                    .expect("queue checked non-empty");
                if dts.external_dep_count(id) != 0 {
                    return Err(SchedError::Assertion(format!(
                        "task `{}` popped with {} external dependencies outstanding",
                        dts.name_of(id),
                        dts.external_dep_count(id)
                    )));
                }
                run_task(
                    dts, &mut engine, id, &world, old_dw.as_ref(), new_dw.as_ref(),
                    abort, abort_point, &mut stats,
                )?;
                num_done += 1;
                phase_done[dts.phase_of(id)] += 1;
                record_trace(&mut stats, dts, id, num_done, collect);
                check_abort(dts, id, new_dw.as_ref(), &mut abort, &mut abort_point, world.rank);
                ran_this_iteration = true;
            }

            // 3. Run the phase's synchronization task once every other task
            //    of the phase has completed.
            if let Some(id) = phase_sync[currphase] {
                if phase_done[currphase] == phase_tasks[currphase] - 1 {
                    if collect {
                        stats.record_queue_length(dts.num_external_ready());
                    }
                    debug_assert_eq!(dts.phase_of(id), currphase);
                    let task = Arc::clone(dts.task(id));
                    match task.kind() {
                        TaskKind::Reduction => {
                            let t0 = Instant::now();
                            run_reduction(
                                dts, id, comm.as_ref(), new_dw.as_ref(), &mut collective_tag,
                            )?;
                            dts.mark_initiated_direct(id);
                            dts.task_completed(id);
                            stats.total_reduce += t0.elapsed();
                        }
                        TaskKind::OncePerProc | TaskKind::Normal => {
                            // Parked normal-kind tasks got here through
                            // uses_comm; they are per-process collectives.
                            engine.initiate_task(dts, id);
                            dts.mark_initiated_direct(id);
                            if dts.external_dep_count(id) != 0 {
                                return Err(SchedError::Assertion(format!(
                                    "per-process task `{}` has remote requires",
                                    dts.name_of(id)
                                )));
                            }
                            run_task(
                                dts, &mut engine, id, &world, old_dw.as_ref(), new_dw.as_ref(),
                                abort, abort_point, &mut stats,
                            )?;
                        }
                    }
                    phase_sync[currphase] = None;
                    num_done += 1;
                    phase_done[currphase] += 1;
                    record_trace(&mut stats, dts, id, num_done, collect);
                    check_abort(dts, id, new_dw.as_ref(), &mut abort, &mut abort_point, world.rank);
                    ran_this_iteration = true;
                }
            }

            // 4. Nothing completed this iteration: advance the phase, poll,
            //    or block.
            if !ran_this_iteration && num_done < ntasks {
                if phase_tasks[currphase] == phase_done[currphase] {
                    currphase += 1;
                    debug_assert!(currphase < num_phases, "phase counter ran past last phase");
                } else if dts.num_internal_ready() > 0
                    || dts.num_external_ready() > 0
                    || (phase_sync[currphase].is_some()
                        && phase_done[currphase] == phase_tasks[currphase] - 1)
                {
                    let t0 = Instant::now();
                    engine.process_recvs(dts, new_dw.as_ref(), CommMode::Test)?;
                    stats.total_recv += t0.elapsed();
                } else {
                    let t0 = Instant::now();
                    engine.process_recvs(dts, new_dw.as_ref(), CommMode::WaitOnce)?;
                    stats.total_wait += t0.elapsed();
                }
            }
        }

        // Terminal: drain sends fully, then verify quiescence.
        let t0 = Instant::now();
        engine.drain_sends();
        stats.total_send += t0.elapsed();
        if engine.outstanding_sends() != 0 || engine.outstanding_recvs() != 0 {
            return Err(SchedError::Assertion(format!(
                "execute finished with {} sends / {} receives in flight",
                engine.outstanding_sends(),
                engine.outstanding_recvs()
            )));
        }

        // Cooperative restart: OR the flag across ranks, on the last graph
        // of a restartable sequence only.
        if restartable && graph_index == num_graphs - 1 {
            let mine = new_dw.timestep_restarted() || new_dw.timestep_aborted();
            let (gather, bcast) = next_collective_tags(&mut collective_tag)?;
            let net = collective::allreduce_or(comm.as_ref(), mine, gather, bcast);
            if net {
                new_dw.restart_timestep();
                old_dw.restart_timestep();
            }
        }

        log::debug!(
            "rank-{} finished graph {graph_index}: {num_done} tasks, avg queue length {:.2}",
            world.rank,
            stats.avg_queue_length()
        );
        Ok(stats)
    }
}

/// Run one detailed task's callback and post its outbound messages.
///
/// After an abort, callbacks of normal tasks past the abort point are
/// skipped; placeholder values stand in for their computes so the message
/// protocol still drains. Everything the aborted timestep produced is
/// discarded by the restart.
#[allow(clippy::too_many_arguments)]
fn run_task<C: Communicator>(
    dts: &mut DetailedTasks,
    engine: &mut MessageEngine<'_, C>,
    id: DetailedTaskId,
    world: &ProcessGroup,
    old_dw: &dyn DataWarehouse,
    new_dw: &dyn DataWarehouse,
    abort: bool,
    abort_point: usize,
    stats: &mut ExecStats,
) -> Result<(), SchedError> {
    let task = Arc::clone(dts.task(id));
    let skip = abort && task.kind() == TaskKind::Normal && dts.static_order(id) > abort_point;
    if skip {
        log::trace!("rank-{} skipping `{}` past abort point", world.rank, dts.name_of(id));
        fill_placeholder_computes(dts, id, new_dw)?;
    } else if let Some(action) = task.action() {
        let t0 = Instant::now();
        action(world, dts.patches(id), dts.materials(id), old_dw, new_dw)?;
        stats.total_task += t0.elapsed();
    }
    let t0 = Instant::now();
    engine.post_sends(dts, id, new_dw)?;
    stats.total_send += t0.elapsed();
    dts.task_completed(id);
    Ok(())
}

/// Stand-in values for a skipped task's computes, so sends and downstream
/// lookups find the keys present.
fn fill_placeholder_computes(
    dts: &DetailedTasks,
    id: DetailedTaskId,
    new_dw: &dyn DataWarehouse,
) -> Result<(), SchedError> {
    let task = Arc::clone(dts.task(id));
    for dep in task.computes_list().iter().chain(task.modifies_list()) {
        for &m in dts.materials(id) {
            match dep.scope {
                AccessScope::PerPatch => {
                    for &p in dts.patches(id) {
                        if !new_dw.exists(&dep.label, Some(p), m) {
                            new_dw.put(&dep.label, p, m, Bytes::new())?;
                        }
                    }
                }
                AccessScope::Global => {
                    if !new_dw.exists(&dep.label, None, m) {
                        new_dw.put_global(&dep.label, m, Bytes::new())?;
                    }
                }
            }
        }
    }
    Ok(())
}

/// Collective combine of the reduction task's variable across ranks.
fn run_reduction<C: Communicator>(
    dts: &DetailedTasks,
    id: DetailedTaskId,
    comm: &C,
    new_dw: &dyn DataWarehouse,
    collective_tag: &mut u16,
) -> Result<(), SchedError> {
    let task = Arc::clone(dts.task(id));
    let op = task.reduction_op().ok_or_else(|| {
        SchedError::Assertion(format!("reduction task `{}` has no reduction op", task.name()))
    })?;
    for dep in task.computes_list() {
        debug_assert_eq!(dep.scope, AccessScope::Global);
        for &m in dts.materials(id) {
            let local = new_dw
                .get_global(&dep.label, m)
                .map(|b| bytes_to_scalars(&b))
                .unwrap_or_default();
            let (gather, bcast) = next_collective_tags(collective_tag)?;
            log::trace!(
                "rank-{} reducing `{}` material {m} ({} values)",
                comm.rank(),
                dep.label,
                local.len()
            );
            let result = collective::reduce_scalars(comm, op, &local, gather, bcast);
            new_dw.put_global(&dep.label, m, scalars_to_bytes(&result))?;
        }
    }
    Ok(())
}

/// Allocate the next gather/broadcast tag pair from the reserved range.
/// The counter advances identically on every rank because reductions run in
/// phase order everywhere.
fn next_collective_tags(counter: &mut u16) -> Result<(u16, u16), SchedError> {
    let gather = *counter;
    let bcast = counter.checked_add(1).ok_or_else(|| {
        SchedError::Assertion("collective tag space exhausted".into())
    })?;
    *counter = bcast.checked_add(1).ok_or_else(|| {
        SchedError::Assertion("collective tag space exhausted".into())
    })?;
    Ok((gather, bcast))
}

fn record_trace(
    stats: &mut ExecStats,
    dts: &DetailedTasks,
    id: DetailedTaskId,
    scheduled_order: usize,
    collect: bool,
) {
    if collect {
        stats.trace.push(TraceEntry {
            name: dts.name_of(id),
            static_order: dts.static_order(id),
            scheduled_order,
        });
    }
}

fn check_abort(
    dts: &DetailedTasks,
    id: DetailedTaskId,
    new_dw: &dyn DataWarehouse,
    abort: &mut bool,
    abort_point: &mut usize,
    rank: usize,
) {
    if !*abort && new_dw.timestep_aborted() {
        *abort = true;
        *abort_point = dts.static_order(id);
        log::debug!(
            "rank-{rank} aborting timestep after task `{}` (static order {})",
            dts.name_of(id),
            abort_point
        );
    }
}
