//! # patch-sched
//!
//! patch-sched is the task scheduling and execution core of a parallel,
//! patch-based scientific simulation framework: it turns a declarative
//! graph of computational tasks (each reading/writing named grid variables
//! on specific patches and materials) into a dependency-respecting,
//! communication-overlapped execution across distributed processes.
//!
//! ## Features
//! - Task descriptors with explicit requires/computes/modifies contracts
//!   against a versioned data warehouse (old/new generations)
//! - Per-process detailed task graphs with local ordering edges and
//!   tag-matched point-to-point messages for cross-rank edges
//! - Two-stage readiness (internal: receives may be posted; external:
//!   eligible to run) with pluggable ready-queue policies
//! - Phase-grouped reduction and once-per-process collective tasks
//! - A cooperative abort/restart protocol for simulation-level failures
//! - Pluggable communication backends (serial, in-process threads, MPI)
//!
//! ## Determinism
//!
//! All randomized decisions use `SmallRng` seeds drawn from configuration
//! so runs are reproducible, message tags are assigned from a globally
//! sorted edge enumeration, and every priority tie breaks on the
//! compile-time static order. The execution-order trace emitted by
//! [`Scheduler::execute`](exec::Scheduler::execute) replays a run.
//!
//! ## Usage
//!
//! Declare tasks, compile them against a patch partition, attach the two
//! warehouse generations, and execute:
//!
//! ```rust
//! use std::sync::Arc;
//! use patch_sched::prelude::*;
//!
//! # fn main() -> Result<(), patch_sched::sched_error::SchedError> {
//! let topo = PatchTopology::line(4);
//! let comm = Arc::new(NoComm);
//! let lb = Arc::new(BlockLoadBalancer::new(&topo, 1));
//! let mut sched = Scheduler::new(comm, lb);
//!
//! let u = VarLabel::new("u");
//! let mut graph = TaskGraph::new();
//! graph.add_task(
//!     Task::new("advance", |_, patches, matls, _old, new| {
//!         for &p in patches {
//!             for &m in matls {
//!                 new.put_scalars(&VarLabel::new("u"), p, m, &[1.0])?;
//!             }
//!         }
//!         Ok(())
//!     })
//!     .requires(Dependency::per_patch(u.clone(), Generation::Old))
//!     .computes(Dependency::per_patch(u.clone(), Generation::New)),
//! );
//!
//! let idx = sched.compile_graph(&graph, &topo, &[MaterialId(0)])?;
//! sched.attach_warehouses(
//!     Arc::new(InMemoryWarehouse::new()),
//!     Arc::new(InMemoryWarehouse::new()),
//! );
//! sched.execute(idx, 0)?;
//! # Ok(())
//! # }
//! ```

pub mod balance;
pub mod comm;
pub mod exec;
pub mod grid;
pub(crate) mod invariants;
pub mod sched_error;
pub mod task;
pub mod warehouse;

/// A convenient prelude to import the most-used traits & types:
pub mod prelude {
    pub use crate::balance::{BlockLoadBalancer, LoadBalancer, RoundRobinLoadBalancer};
    pub use crate::comm::collective::{allreduce_or, reduce_scalars};
    #[cfg(feature = "mpi-support")]
    pub use crate::comm::MpiComm;
    pub use crate::comm::{Communicator, NoComm, ThreadComm, Wait};
    pub use crate::exec::Scheduler;
    pub use crate::exec::stats::{ExecStats, TraceEntry};
    pub use crate::grid::{MaterialId, PatchId, PatchTopology, ProcessGroup};
    pub use crate::sched_error::SchedError;
    pub use crate::task::graph::TaskGraph;
    pub use crate::task::queue::QueuePolicy;
    pub use crate::task::{
        Dependency, Generation, Ghost, ReductionOp, Task, TaskKind, VarKey, VarLabel,
    };
    pub use crate::warehouse::{DataWarehouse, InMemoryWarehouse};
}
