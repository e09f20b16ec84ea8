//! SchedError: Unified error type for patch-sched public APIs
//!
//! This error type is used throughout the patch-sched library to provide
//! robust, non-panicking error handling for all public APIs. The taxonomy
//! follows three classes: setup errors (raised before any task runs),
//! communication errors (fatal transport failures), and assertion errors
//! (graph-construction bugs surfaced at runtime).

use crate::grid::{MaterialId, PatchId};
use thiserror::Error;

/// Unified error type for patch-sched operations.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SchedError {
    /// Attempted to construct a PatchId with a zero value (invalid).
    #[error("PatchId must be non-zero (0 is reserved as invalid/sentinel)")]
    InvalidPatchId,
    /// An unrecognized ready-queue policy string was supplied via configuration.
    #[error("Unknown task ready queue algorithm: {0}")]
    UnknownQueuePolicy(String),
    /// A task requires a new-generation variable no task in the graph computes.
    #[error("task `{task}` requires `{label}` from NewDW but no task computes it")]
    UnresolvedRequirement { task: String, label: String },
    /// Two tasks compute the same per-patch datum, violating the
    /// one-producer-per-datum invariant.
    #[error("tasks `{first}` and `{second}` both compute `{label}`")]
    MultipleProducers {
        label: String,
        first: String,
        second: String,
    },
    /// The task graph contains a dependency cycle; expected a DAG.
    #[error("cycle detected in task graph (expected DAG)")]
    CycleInGraph,
    /// A graph or execute call referenced a graph index that was never compiled.
    #[error("no compiled task graph at index {0}")]
    NoSuchGraph(usize),
    /// execute() was called before the scheduler was given data warehouses.
    #[error("scheduler has no data warehouses attached")]
    MissingWarehouse,
    /// A variable lookup failed in the data warehouse.
    #[error("variable `{label}` not found in warehouse for patch {patch:?} material {material}")]
    VarNotFound {
        label: String,
        patch: Option<PatchId>,
        material: MaterialId,
    },
    /// A send/receive/collective primitive failed.
    #[error("communication failure with rank {peer} during {op}: {detail}")]
    Comm {
        op: &'static str,
        peer: usize,
        detail: String,
    },
    /// The deterministic tag assignment ran out of u16 tag space.
    #[error("message tag space exhausted ({0} remote messages in one graph)")]
    TagSpaceExhausted(usize),
    /// Programming-error class: a scheduling invariant was violated at runtime.
    /// Indicates a bug in graph construction, never a recoverable condition.
    #[error("scheduler assertion failed: {0}")]
    Assertion(String),
    /// A task body reported a failure that is not a cooperative abort.
    #[error("task `{task}` failed: {detail}")]
    TaskFailed { task: String, detail: String },
}
