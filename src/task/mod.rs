//! Task descriptors: the static declaration of one computational unit.
//!
//! A [`Task`] names a callback plus the variable accesses it performs:
//! which labels it requires (and from which data-warehouse generation, with
//! what ghost requirement) and which it computes or modifies. Tasks are
//! declared once during problem setup, handed to a
//! [`TaskGraph`](crate::task::graph::TaskGraph), and are immutable afterwards.
//!
//! The callback never sees the scheduler; it receives the process group, its
//! concrete patch/material subsets, and the old/new data warehouses, exactly
//! the contract a numerical component programs against.

pub mod detailed;
pub mod graph;
pub mod queue;

use crate::grid::{MaterialId, PatchId, ProcessGroup};
use crate::sched_error::SchedError;
use crate::warehouse::DataWarehouse;
use std::fmt;
use std::sync::Arc;

/// Interned variable name. Cheap to clone and compare; equality is by
/// string contents so two independently-created labels with the same name
/// refer to the same variable.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarLabel(Arc<str>);

impl VarLabel {
    pub fn new(name: &str) -> Self {
        VarLabel(Arc::from(name))
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for VarLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("VarLabel").field(&self.name()).finish()
    }
}

impl fmt::Display for VarLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which data-warehouse generation an access targets.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
pub enum Generation {
    /// The previous timestep's warehouse; values are assumed to exist and
    /// never create in-graph dependency edges.
    Old,
    /// The warehouse being filled this timestep; a `New` require must
    /// resolve to exactly one in-graph producer.
    New,
}

/// Ghost requirement on a require. Any non-`None` ghost expands the
/// requirement across the requiring patch's neighbors.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
pub enum Ghost {
    None,
    AroundCells(u32),
    AroundNodes(u32),
}

impl Ghost {
    #[inline]
    pub fn layers(self) -> u32 {
        match self {
            Ghost::None => 0,
            Ghost::AroundCells(n) | Ghost::AroundNodes(n) => n,
        }
    }
}

/// Whether an access is per-patch (one datum per patch of the detailed
/// task) or global (one datum per rank, as reduction variables are).
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
pub enum AccessScope {
    PerPatch,
    Global,
}

/// One declared variable access of a task.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Dependency {
    pub label: VarLabel,
    pub generation: Generation,
    pub ghost: Ghost,
    pub scope: AccessScope,
}

impl Dependency {
    /// Per-patch access with no ghost requirement.
    pub fn per_patch(label: VarLabel, generation: Generation) -> Self {
        Self {
            label,
            generation,
            ghost: Ghost::None,
            scope: AccessScope::PerPatch,
        }
    }

    /// Global (per-rank, patch-less) access, as reduction variables use.
    pub fn global(label: VarLabel, generation: Generation) -> Self {
        Self {
            label,
            generation,
            ghost: Ghost::None,
            scope: AccessScope::Global,
        }
    }

    pub fn with_ghost(mut self, ghost: Ghost) -> Self {
        self.ghost = ghost;
        self
    }
}

/// The concrete datum tuple dependencies resolve to. Message tags and the
/// single-producer check key on this.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarKey {
    pub label: VarLabel,
    /// `None` for global (reduction) variables.
    pub patch: Option<PatchId>,
    pub material: MaterialId,
    pub generation: Generation,
}

/// Task type tag.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
pub enum TaskKind {
    /// Ordinary per-patch computation.
    Normal,
    /// Collective combine of per-rank partial values; one instance per rank,
    /// acts as its phase's synchronization task.
    Reduction,
    /// Exactly one instance per process over the rank's whole patch set;
    /// requires process-level communication, so it also synchronizes its phase.
    OncePerProc,
}

/// The elementwise combine applied by the reduction protocol.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
pub enum ReductionOp {
    Sum,
    Min,
    Max,
}

impl ReductionOp {
    /// The op's identity element; ranks with no local contribution
    /// contribute this.
    pub fn identity<T: num_traits::Float>(self) -> T {
        match self {
            ReductionOp::Sum => T::zero(),
            ReductionOp::Min => T::infinity(),
            ReductionOp::Max => T::neg_infinity(),
        }
    }

    pub fn combine<T: num_traits::Float>(self, a: T, b: T) -> T {
        match self {
            ReductionOp::Sum => a + b,
            ReductionOp::Min => a.min(b),
            ReductionOp::Max => a.max(b),
        }
    }
}

/// Task callback signature: `(process group, patches, materials, old DW, new DW)`.
pub type ActionFn = dyn Fn(
        &ProcessGroup,
        &[PatchId],
        &[MaterialId],
        &dyn DataWarehouse,
        &dyn DataWarehouse,
    ) -> Result<(), SchedError>
    + Send
    + Sync;

/// Static declaration of one computational unit.
pub struct Task {
    name: String,
    kind: TaskKind,
    requires: Vec<Dependency>,
    computes: Vec<Dependency>,
    modifies: Vec<Dependency>,
    reduction_op: Option<ReductionOp>,
    uses_comm: bool,
    action: Option<Box<ActionFn>>,
}

impl Task {
    /// A normal per-patch task with the given callback.
    pub fn new<F>(name: &str, action: F) -> Self
    where
        F: Fn(
                &ProcessGroup,
                &[PatchId],
                &[MaterialId],
                &dyn DataWarehouse,
                &dyn DataWarehouse,
            ) -> Result<(), SchedError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.to_owned(),
            kind: TaskKind::Normal,
            requires: Vec::new(),
            computes: Vec::new(),
            modifies: Vec::new(),
            reduction_op: None,
            uses_comm: false,
            action: Some(Box::new(action)),
        }
    }

    /// A reduction task combining per-rank partial values of `label` with
    /// `op`. It has no callback; the collective protocol is its body.
    pub fn reduction(name: &str, label: VarLabel, op: ReductionOp) -> Self {
        Self {
            name: name.to_owned(),
            kind: TaskKind::Reduction,
            requires: vec![Dependency::global(label.clone(), Generation::New)],
            computes: vec![Dependency::global(label, Generation::New)],
            modifies: Vec::new(),
            reduction_op: Some(op),
            uses_comm: true,
            action: None,
        }
    }

    /// A once-per-process task. Runs one instance per rank over the rank's
    /// whole patch set and synchronizes its phase.
    pub fn once_per_proc<F>(name: &str, action: F) -> Self
    where
        F: Fn(
                &ProcessGroup,
                &[PatchId],
                &[MaterialId],
                &dyn DataWarehouse,
                &dyn DataWarehouse,
            ) -> Result<(), SchedError>
            + Send
            + Sync
            + 'static,
    {
        let mut t = Self::new(name, action);
        t.kind = TaskKind::OncePerProc;
        t.uses_comm = true;
        t
    }

    pub fn requires(mut self, dep: Dependency) -> Self {
        self.requires.push(dep);
        self
    }

    /// Declare a computed (produced) variable. Computes always target the
    /// new generation.
    pub fn computes(mut self, dep: Dependency) -> Self {
        debug_assert_eq!(dep.generation, Generation::New, "computes target NewDW");
        self.computes.push(dep);
        self
    }

    /// Declare an in-place update of an already-computed variable. The task
    /// depends on the previous writer and becomes the writer for downstream
    /// requires.
    pub fn modifies(mut self, dep: Dependency) -> Self {
        debug_assert_eq!(dep.generation, Generation::New, "modifies target NewDW");
        self.modifies.push(dep);
        self
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    #[inline]
    pub fn uses_comm(&self) -> bool {
        self.uses_comm
    }

    #[inline]
    pub fn reduction_op(&self) -> Option<ReductionOp> {
        self.reduction_op
    }

    #[inline]
    pub fn requires_list(&self) -> &[Dependency] {
        &self.requires
    }

    #[inline]
    pub fn computes_list(&self) -> &[Dependency] {
        &self.computes
    }

    #[inline]
    pub fn modifies_list(&self) -> &[Dependency] {
        &self.modifies
    }

    pub(crate) fn action(&self) -> Option<&ActionFn> {
        self.action.as_deref()
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("requires", &self.requires)
            .field("computes", &self.computes)
            .field("modifies", &self.modifies)
            .finish_non_exhaustive()
    }
}
