//! Patch→rank ownership, consumed from the load-balancer collaborator.
//!
//! The detailed-graph compiler classifies every dependency edge as local or
//! remote by asking which rank owns each side's patch. Real frameworks plug
//! in a cost-model balancer; the implementations here cover contiguous-block
//! and round-robin assignment, which is all the scheduling core itself needs.

use crate::grid::{PatchId, PatchTopology};
use std::collections::HashMap;

/// Ownership map contract.
pub trait LoadBalancer: Send + Sync {
    /// Rank that owns `patch`.
    fn owner(&self, patch: PatchId) -> usize;

    /// All patches of `topo` owned by `rank`, in topology order.
    fn rank_patches(&self, topo: &PatchTopology, rank: usize) -> Vec<PatchId> {
        topo.patches()
            .iter()
            .copied()
            .filter(|&p| self.owner(p) == rank)
            .collect()
    }
}

/// Contiguous blocks of the topology's patch order, one block per rank.
/// Ranks at the front absorb the remainder when the division is uneven.
pub struct BlockLoadBalancer {
    owners: HashMap<PatchId, usize>,
}

impl BlockLoadBalancer {
    pub fn new(topo: &PatchTopology, nranks: usize) -> Self {
        assert!(nranks > 0, "need at least one rank");
        let n = topo.len();
        let base = n / nranks;
        let extra = n % nranks;
        let mut owners = HashMap::with_capacity(n);
        let mut idx = 0usize;
        for rank in 0..nranks {
            let count = base + usize::from(rank < extra);
            for _ in 0..count {
                owners.insert(topo.patches()[idx], rank);
                idx += 1;
            }
        }
        Self { owners }
    }
}

impl LoadBalancer for BlockLoadBalancer {
    fn owner(&self, patch: PatchId) -> usize {
        *self
            .owners
            .get(&patch)
            .expect("patch not covered by load balancer")
    }
}

/// Round-robin assignment over the topology's patch order. Useful in tests
/// to force remote edges between adjacent patches.
pub struct RoundRobinLoadBalancer {
    owners: HashMap<PatchId, usize>,
}

impl RoundRobinLoadBalancer {
    pub fn new(topo: &PatchTopology, nranks: usize) -> Self {
        assert!(nranks > 0, "need at least one rank");
        let owners = topo
            .patches()
            .iter()
            .enumerate()
            .map(|(i, &p)| (p, i % nranks))
            .collect();
        Self { owners }
    }
}

impl LoadBalancer for RoundRobinLoadBalancer {
    fn owner(&self, patch: PatchId) -> usize {
        *self
            .owners
            .get(&patch)
            .expect("patch not covered by load balancer")
    }
}
