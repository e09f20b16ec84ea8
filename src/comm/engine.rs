//! The message engine: translates the remote edges of initiated tasks into
//! posted receives, posts the matching sends when producers complete, and
//! drives completion in the two polling modes.
//!
//! Receives are deduplicated per logical message: however many local tasks
//! require the same `(label, patch, material, generation, source)` datum,
//! exactly one receive is posted, and its completion decrements every
//! waiting consumer. The engine lives for one `execute` call and must end
//! it quiescent: no posted receives, no in-flight sends.

use crate::comm::{Communicator, Wait};
use crate::invariants::inv_assert;
use crate::sched_error::SchedError;
use crate::task::detailed::{DetailedTaskId, DetailedTasks};
use crate::warehouse::DataWarehouse;
use bytes::Bytes;

/// How to drive completion when the loop has nothing else to do.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum CommMode {
    /// Non-blocking poll; used whenever other ready work exists.
    Test,
    /// Block until at least one receive completes; the execution loop's
    /// only suspension point.
    WaitOnce,
}

pub(crate) struct MessageEngine<'a, C: Communicator> {
    comm: &'a C,
    /// Posted-but-incomplete receives, by plan index.
    posted: Vec<(usize, C::RecvHandle)>,
    /// Per-plan lifecycle flags; a plan is posted at most once.
    recv_posted: Vec<bool>,
    recv_completed: Vec<bool>,
    sends: Vec<C::SendHandle>,
}

impl<'a, C: Communicator> MessageEngine<'a, C> {
    pub fn new(comm: &'a C, num_plans: usize) -> Self {
        Self {
            comm,
            posted: Vec::new(),
            recv_posted: vec![false; num_plans],
            recv_completed: vec![false; num_plans],
            sends: Vec::new(),
        }
    }

    /// Post the receives of an internally-ready task. Plans another
    /// consumer already posted (or that already completed) are skipped.
    pub fn initiate_task(&mut self, dts: &DetailedTasks, id: DetailedTaskId) {
        for &plan_idx in dts.recv_plan_ids(id) {
            if self.recv_posted[plan_idx] {
                continue;
            }
            let plan = dts.recv_plan(plan_idx);
            log::trace!(
                "rank-{} posting recv `{}` patch {:?} from rank {} (tag {:#06x})",
                self.comm.rank(),
                plan.key.label,
                plan.key.patch,
                plan.src,
                plan.tag
            );
            let handle = self.comm.irecv(plan.src, plan.tag);
            self.recv_posted[plan_idx] = true;
            self.posted.push((plan_idx, handle));
        }
    }

    /// Post the outbound messages a completed producer triggers.
    pub fn post_sends(
        &mut self,
        dts: &DetailedTasks,
        id: DetailedTaskId,
        new_dw: &dyn DataWarehouse,
    ) -> Result<(), SchedError> {
        for plan in dts.send_plans(id) {
            let patch = plan.key.patch.ok_or_else(|| {
                SchedError::Assertion("global variables never move point-to-point".into())
            })?;
            let data = new_dw.get(&plan.key.label, patch, plan.key.material)?;
            log::trace!(
                "rank-{} sending `{}` patch {} to rank {} ({} bytes, tag {:#06x})",
                self.comm.rank(),
                plan.key.label,
                patch,
                plan.dst,
                data.len(),
                plan.tag
            );
            self.sends.push(self.comm.isend(plan.dst, plan.tag, &data));
        }
        Ok(())
    }

    /// Drive receive completion. Returns how many logical messages landed.
    pub fn process_recvs(
        &mut self,
        dts: &mut DetailedTasks,
        new_dw: &dyn DataWarehouse,
        mode: CommMode,
    ) -> Result<usize, SchedError> {
        // Completed sends are reaped opportunistically on every poll.
        self.sends.retain_mut(|s| s.test().is_none());
        loop {
            let mut arrived = 0usize;
            let mut failed: Option<SchedError> = None;
            let mut still_posted = Vec::with_capacity(self.posted.len());
            for (plan_idx, mut handle) in self.posted.drain(..) {
                match handle.test() {
                    None => still_posted.push((plan_idx, handle)),
                    Some(payload) => {
                        let plan = dts.recv_plan(plan_idx);
                        inv_assert!(!self.recv_completed[plan_idx], "message delivered twice");
                        let patch = plan.key.patch.expect("p2p messages are per-patch");
                        if let Err(e) =
                            new_dw.put(&plan.key.label, patch, plan.key.material, Bytes::from(payload))
                        {
                            failed.get_or_insert(e);
                            continue;
                        }
                        self.recv_completed[plan_idx] = true;
                        dts.message_arrived(plan_idx);
                        arrived += 1;
                    }
                }
            }
            self.posted = still_posted;
            if let Some(e) = failed {
                return Err(e);
            }
            match mode {
                CommMode::Test => return Ok(arrived),
                CommMode::WaitOnce => {
                    if arrived > 0 {
                        return Ok(arrived);
                    }
                    if self.posted.is_empty() {
                        // Nothing to wait on: the graph can make no further
                        // progress. A malformed graph or a dead remote rank
                        // would hang here forever; surface the bug instead.
                        return Err(SchedError::Assertion(
                            "blocked waiting for receives but none are posted".into(),
                        ));
                    }
                    std::thread::yield_now();
                }
            }
        }
    }

    /// Block until every outstanding send has been accepted by the
    /// transport. Called at the end of execute; never exit with in-flight
    /// sends.
    pub fn drain_sends(&mut self) {
        while let Some(mut s) = self.sends.pop() {
            if s.test().is_none() {
                s.wait();
            }
        }
    }

    pub fn outstanding_recvs(&self) -> usize {
        self.posted.len()
    }

    pub fn outstanding_sends(&self) -> usize {
        self.sends.len()
    }
}
