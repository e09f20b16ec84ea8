//! Shared helpers for the integration tests.
#![allow(dead_code)]

use patch_sched::prelude::*;
use std::sync::Arc;
use std::thread;

pub fn lbl(s: &str) -> VarLabel {
    VarLabel::new(s)
}

pub fn pid(i: u32) -> PatchId {
    PatchId::new(i).unwrap()
}

pub fn m0() -> MaterialId {
    MaterialId(0)
}

/// A task whose body does nothing; dependency wiring is what's under test.
pub fn noop(name: &str) -> Task {
    Task::new(name, |_, _, _, _, _| Ok(()))
}

/// Single-rank scheduler over a line of `npatches` patches.
pub fn solo_scheduler(npatches: u32) -> (Scheduler<NoComm>, PatchTopology) {
    let topo = PatchTopology::line(npatches);
    let lb = Arc::new(BlockLoadBalancer::new(&topo, 1));
    (Scheduler::new(Arc::new(NoComm), lb), topo)
}

/// Fresh warehouse pair attached to `sched`; returns the new-generation
/// handle for assertions.
pub fn attach_fresh_warehouses<C: Communicator>(
    sched: &mut Scheduler<C>,
) -> (Arc<InMemoryWarehouse>, Arc<InMemoryWarehouse>) {
    let old = Arc::new(InMemoryWarehouse::new());
    let new = Arc::new(InMemoryWarehouse::new());
    sched.attach_warehouses(old.clone(), new.clone());
    (old, new)
}

/// Run one closure per rank, each on its own thread with its own
/// communicator, and collect the per-rank results in rank order.
pub fn run_ranks<T, F>(size: usize, f: F) -> Vec<T>
where
    T: Send + 'static,
    F: Fn(ThreadComm) -> T + Send + Sync + Clone + 'static,
{
    let handles: Vec<_> = ThreadComm::world(size)
        .into_iter()
        .map(|c| {
            let f = f.clone();
            thread::spawn(move || f(c))
        })
        .collect();
    handles
        .into_iter()
        .map(|h| h.join().expect("rank thread panicked"))
        .collect()
}

/// Position of the first trace entry whose name starts with `prefix`.
pub fn trace_pos(trace: &[TraceEntry], prefix: &str) -> usize {
    trace
        .iter()
        .position(|e| e.name.starts_with(prefix))
        .unwrap_or_else(|| panic!("`{prefix}` missing from trace {trace:?}"))
}
