//! `PatchId` and `MaterialId`: strong, zero-cost handles for grid patches and
//! materials, plus the minimal patch-adjacency view the scheduler needs.
//!
//! The grid itself (geometry, cell data, refinement levels) lives outside
//! this crate. The scheduling core only needs to know which patches exist,
//! which patches neighbor which (to expand ghost requirements), and which
//! rank owns each patch (supplied by a [`LoadBalancer`](crate::balance::LoadBalancer)).
//!
//! `PatchId` wraps a nonzero `u32` so 0 stays reserved as an invalid or
//! sentinel value; `MaterialId` is a plain index because material 0 is a
//! perfectly valid material.

use crate::sched_error::SchedError;
use std::collections::HashMap;
use std::{fmt, num::NonZeroU32};

/// Opaque handle for a grid patch.
///
/// # Memory layout
/// `repr(transparent)` around `NonZeroU32`, so `Option<PatchId>` is also
/// four bytes and the id can cross FFI or wire boundaries as a `u32`.
#[derive(
    Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct PatchId(NonZeroU32);

impl PatchId {
    /// Creates a new `PatchId` from a raw `u32` value.
    ///
    /// # Errors
    /// Returns `Err(InvalidPatchId)` if `raw == 0`; 0 is reserved as the
    /// invalid/sentinel value.
    #[inline]
    pub fn new(raw: u32) -> Result<Self, SchedError> {
        NonZeroU32::new(raw)
            .map(PatchId)
            .ok_or(SchedError::InvalidPatchId)
    }

    /// Returns the inner `u32` value of this `PatchId`.
    #[inline]
    pub const fn get(self) -> u32 {
        self.0.get()
    }
}

impl fmt::Debug for PatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PatchId").field(&self.get()).finish()
    }
}

impl fmt::Display for PatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.get())
    }
}

/// Material index within a patch. Material 0 is valid (single-material
/// problems use exactly it).
#[derive(
    Copy,
    Clone,
    Default,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    serde::Serialize,
    serde::Deserialize,
)]
#[repr(transparent)]
pub struct MaterialId(pub u32);

impl fmt::Debug for MaterialId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("MaterialId").field(&self.0).finish()
    }
}

impl fmt::Display for MaterialId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The process group the scheduler runs in: this process's rank and the
/// total number of ranks. A plain value type so task callbacks can copy it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ProcessGroup {
    pub rank: usize,
    pub size: usize,
}

impl ProcessGroup {
    pub fn new(rank: usize, size: usize) -> Self {
        Self { rank, size }
    }

    /// Single-process group, for serial runs and unit tests.
    pub fn solo() -> Self {
        Self { rank: 0, size: 1 }
    }
}

/// The patch-adjacency view of the grid: the global patch list plus each
/// patch's neighbors. Neighbor lists drive ghost-requirement expansion and
/// nothing else; real geometry stays with the grid collaborator.
#[derive(Clone, Debug, Default)]
pub struct PatchTopology {
    patches: Vec<PatchId>,
    neighbors: HashMap<PatchId, Vec<PatchId>>,
}

impl PatchTopology {
    pub fn new() -> Self {
        Self::default()
    }

    /// A 1-D line of `n` patches with ids `1..=n`, each adjacent to its
    /// immediate neighbors. The standard topology for tests and examples.
    pub fn line(n: u32) -> Self {
        let mut topo = Self::new();
        for i in 1..=n {
            topo.add_patch(PatchId::new(i).expect("nonzero"));
        }
        for i in 1..=n {
            let p = PatchId::new(i).expect("nonzero");
            if i > 1 {
                topo.add_neighbor(p, PatchId::new(i - 1).expect("nonzero"));
            }
            if i < n {
                topo.add_neighbor(p, PatchId::new(i + 1).expect("nonzero"));
            }
        }
        topo
    }

    pub fn add_patch(&mut self, p: PatchId) {
        if !self.neighbors.contains_key(&p) {
            self.patches.push(p);
            self.neighbors.insert(p, Vec::new());
        }
    }

    /// Record `q` as a neighbor of `p`. One-directional; callers add both
    /// directions when the adjacency is symmetric.
    pub fn add_neighbor(&mut self, p: PatchId, q: PatchId) {
        self.add_patch(p);
        self.add_patch(q);
        let list = self.neighbors.get_mut(&p).expect("patch just added");
        if !list.contains(&q) {
            list.push(q);
        }
    }

    /// All patches, in insertion order.
    #[inline]
    pub fn patches(&self) -> &[PatchId] {
        &self.patches
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.patches.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }

    /// Neighbors of `p`, empty if `p` is unknown or isolated.
    pub fn neighbors(&self, p: PatchId) -> &[PatchId] {
        self.neighbors.get(&p).map(Vec::as_slice).unwrap_or(&[])
    }
}
