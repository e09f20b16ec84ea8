//! Ready-queue prioritization policies.
//!
//! All external-ready tasks are safe to run in any order; the policy only
//! shapes communication/computation overlap. The policy set is closed, so it
//! is a plain enum with a pure selection function over the current ready
//! set, re-evaluated at every pop, with the static order as the final
//! deterministic tie-break. Randomized policies draw from a seeded
//! `SmallRng` so runs are reproducible.

use crate::grid::PatchId;
use crate::sched_error::SchedError;
use crate::task::detailed::DetailedTaskId;
use itertools::Itertools;
use rand::Rng;
use rand::rngs::SmallRng;
use std::cmp::Reverse;
use std::str::FromStr;

/// Which external-ready task runs next.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize,
)]
pub enum QueuePolicy {
    /// Arrival order.
    Fcfs,
    /// Uniform draw over the ready set.
    Random,
    /// Most recent arrival first.
    Stack,
    /// Most direct successors first.
    MostChildren,
    LeastChildren,
    /// Most successors-of-successors first.
    MostL2Children,
    LeastL2Children,
    /// Most outgoing remote messages triggered by completion first.
    #[default]
    MostMessages,
    LeastMessages,
    /// Grouped by owning patch, ascending patch id.
    PatchOrder,
    /// Grouped by owning patch, random patch each pop.
    PatchOrderRandom,
}

impl FromStr for QueuePolicy {
    type Err = SchedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Case-sensitive, exactly the names the configuration surface
        // recognizes. MostAllChildren/LeastAllChildren are accepted
        // spellings for the direct-children policies.
        Ok(match s {
            "FCFS" => QueuePolicy::Fcfs,
            "Random" => QueuePolicy::Random,
            "Stack" => QueuePolicy::Stack,
            "MostChildren" | "MostAllChildren" => QueuePolicy::MostChildren,
            "LeastChildren" | "LeastAllChildren" => QueuePolicy::LeastChildren,
            "MostL2Children" => QueuePolicy::MostL2Children,
            "LeastL2Children" => QueuePolicy::LeastL2Children,
            "MostMessages" => QueuePolicy::MostMessages,
            "LeastMessages" => QueuePolicy::LeastMessages,
            "PatchOrder" => QueuePolicy::PatchOrder,
            "PatchOrderRandom" => QueuePolicy::PatchOrderRandom,
            other => return Err(SchedError::UnknownQueuePolicy(other.to_owned())),
        })
    }
}

/// Scheduling metadata for one external-ready candidate.
#[derive(Clone, Debug)]
pub(crate) struct ReadyEntry {
    pub id: DetailedTaskId,
    /// Monotone arrival counter within one execute call.
    pub seq: u64,
    pub static_order: usize,
    pub children: usize,
    pub l2_children: usize,
    pub messages: usize,
    pub patch: Option<PatchId>,
}

impl ReadyEntry {
    fn patch_key(&self) -> u32 {
        self.patch.map(PatchId::get).unwrap_or(0)
    }
}

/// Pick the next task from the ready set; returns an index into `ready`.
///
/// `ready` must be non-empty. Every policy is a total order or a random
/// draw over the whole set, so no permanently-ready task is skipped forever.
pub(crate) fn select(policy: QueuePolicy, rng: &mut SmallRng, ready: &[ReadyEntry]) -> usize {
    debug_assert!(!ready.is_empty());
    let by_key = |key: fn(&ReadyEntry) -> (usize, usize)| -> usize {
        ready
            .iter()
            .enumerate()
            .min_by_key(|(_, e)| key(e))
            .map(|(i, _)| i)
            .expect("non-empty ready set")
    };
    match policy {
        QueuePolicy::Fcfs => ready
            .iter()
            .enumerate()
            .min_by_key(|(_, e)| e.seq)
            .map(|(i, _)| i)
            .expect("non-empty ready set"),
        QueuePolicy::Stack => ready
            .iter()
            .enumerate()
            .max_by_key(|(_, e)| e.seq)
            .map(|(i, _)| i)
            .expect("non-empty ready set"),
        QueuePolicy::Random => rng.gen_range(0..ready.len()),
        QueuePolicy::MostChildren => ready
            .iter()
            .enumerate()
            .min_by_key(|(_, e)| (Reverse(e.children), e.static_order))
            .map(|(i, _)| i)
            .expect("non-empty ready set"),
        QueuePolicy::LeastChildren => by_key(|e| (e.children, e.static_order)),
        QueuePolicy::MostL2Children => ready
            .iter()
            .enumerate()
            .min_by_key(|(_, e)| (Reverse(e.l2_children), e.static_order))
            .map(|(i, _)| i)
            .expect("non-empty ready set"),
        QueuePolicy::LeastL2Children => by_key(|e| (e.l2_children, e.static_order)),
        QueuePolicy::MostMessages => ready
            .iter()
            .enumerate()
            .min_by_key(|(_, e)| (Reverse(e.messages), e.static_order))
            .map(|(i, _)| i)
            .expect("non-empty ready set"),
        QueuePolicy::LeastMessages => by_key(|e| (e.messages, e.static_order)),
        QueuePolicy::PatchOrder => ready
            .iter()
            .enumerate()
            .min_by_key(|(_, e)| (e.patch_key(), e.static_order))
            .map(|(i, _)| i)
            .expect("non-empty ready set"),
        QueuePolicy::PatchOrderRandom => {
            let patches: Vec<u32> = ready
                .iter()
                .map(|e| e.patch_key())
                .sorted_unstable()
                .dedup()
                .collect();
            let target = patches[rng.gen_range(0..patches.len())];
            ready
                .iter()
                .enumerate()
                .filter(|(_, e)| e.patch_key() == target)
                .min_by_key(|(_, e)| e.static_order)
                .map(|(i, _)| i)
                .expect("chosen patch has at least one ready task")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn entry(id: u32, seq: u64, so: usize, children: usize, messages: usize) -> ReadyEntry {
        ReadyEntry {
            id: DetailedTaskId(id),
            seq,
            static_order: so,
            children,
            l2_children: children * 2,
            messages,
            patch: PatchId::new(id + 1).ok(),
        }
    }

    #[test]
    fn parse_recognizes_every_policy() {
        for (s, p) in [
            ("FCFS", QueuePolicy::Fcfs),
            ("Random", QueuePolicy::Random),
            ("Stack", QueuePolicy::Stack),
            ("MostChildren", QueuePolicy::MostChildren),
            ("LeastChildren", QueuePolicy::LeastChildren),
            ("MostAllChildren", QueuePolicy::MostChildren),
            ("LeastAllChildren", QueuePolicy::LeastChildren),
            ("MostL2Children", QueuePolicy::MostL2Children),
            ("LeastL2Children", QueuePolicy::LeastL2Children),
            ("MostMessages", QueuePolicy::MostMessages),
            ("LeastMessages", QueuePolicy::LeastMessages),
            ("PatchOrder", QueuePolicy::PatchOrder),
            ("PatchOrderRandom", QueuePolicy::PatchOrderRandom),
        ] {
            assert_eq!(s.parse::<QueuePolicy>().unwrap(), p);
        }
    }

    #[test]
    fn parse_is_case_sensitive_and_rejects_unknown() {
        assert!(matches!(
            "fcfs".parse::<QueuePolicy>(),
            Err(SchedError::UnknownQueuePolicy(_))
        ));
        let err = "Fastest".parse::<QueuePolicy>().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Unknown task ready queue algorithm: Fastest"
        );
    }

    #[test]
    fn fcfs_and_stack_are_opposites() {
        let mut rng = SmallRng::seed_from_u64(0);
        let ready = vec![entry(0, 10, 0, 0, 0), entry(1, 20, 1, 0, 0)];
        assert_eq!(select(QueuePolicy::Fcfs, &mut rng, &ready), 0);
        assert_eq!(select(QueuePolicy::Stack, &mut rng, &ready), 1);
    }

    #[test]
    fn message_and_child_counts_order_pops() {
        let mut rng = SmallRng::seed_from_u64(0);
        let ready = vec![entry(0, 1, 0, 3, 1), entry(1, 2, 1, 1, 4)];
        assert_eq!(select(QueuePolicy::MostChildren, &mut rng, &ready), 0);
        assert_eq!(select(QueuePolicy::LeastChildren, &mut rng, &ready), 1);
        assert_eq!(select(QueuePolicy::MostMessages, &mut rng, &ready), 1);
        assert_eq!(select(QueuePolicy::LeastMessages, &mut rng, &ready), 0);
    }

    #[test]
    fn ties_fall_back_to_static_order() {
        let mut rng = SmallRng::seed_from_u64(0);
        let ready = vec![entry(0, 1, 5, 2, 2), entry(1, 2, 3, 2, 2)];
        assert_eq!(select(QueuePolicy::MostChildren, &mut rng, &ready), 1);
        assert_eq!(select(QueuePolicy::LeastMessages, &mut rng, &ready), 1);
    }

    #[test]
    fn random_policies_are_reproducible_per_seed() {
        let ready: Vec<_> = (0..8).map(|i| entry(i, i as u64, i as usize, 0, 0)).collect();
        let picks: Vec<usize> = (0..4)
            .map(|_| {
                let mut rng = SmallRng::seed_from_u64(42);
                select(QueuePolicy::Random, &mut rng, &ready)
            })
            .collect();
        assert!(picks.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn policy_serde_roundtrip() {
        let p = QueuePolicy::LeastL2Children;
        let s = serde_json::to_string(&p).unwrap();
        assert_eq!(serde_json::from_str::<QueuePolicy>(&s).unwrap(), p);
        let bytes = bincode::serialize(&QueuePolicy::default()).unwrap();
        assert_eq!(
            bincode::deserialize::<QueuePolicy>(&bytes).unwrap(),
            QueuePolicy::MostMessages
        );
    }

    #[test]
    fn patch_order_prefers_lowest_patch() {
        let mut rng = SmallRng::seed_from_u64(0);
        let mut ready = vec![entry(4, 1, 0, 0, 0), entry(0, 2, 1, 0, 0)];
        assert_eq!(select(QueuePolicy::PatchOrder, &mut rng, &ready), 1);
        ready.reverse();
        assert_eq!(select(QueuePolicy::PatchOrder, &mut rng, &ready), 0);
    }
}
