//! Cross-rank execution over the in-process mailbox communicator: the
//! producer/consumer/reduction pipeline from the scheduler's contract, run
//! with one thread per rank.

mod util;

use patch_sched::prelude::*;
use serial_test::serial;
use std::sync::Arc;
use util::*;

/// produce computes x everywhere; blend needs its neighbors' x (one ghost
/// layer), computes y and contributes y to the global sum; sum_y reduces.
fn pipeline_graph() -> TaskGraph {
    let mut tg = TaskGraph::new();
    tg.add_task(
        Task::new("produce", |_, patches, matls, _, new| {
            for &p in patches {
                for &m in matls {
                    new.put_scalars(&VarLabel::new("x"), p, m, &[f64::from(p.get())])?;
                }
            }
            Ok(())
        })
        .computes(Dependency::per_patch(lbl("x"), Generation::New)),
    );
    tg.add_task(
        Task::new("blend", |_, patches, matls, _, new| {
            let x = VarLabel::new("x");
            for &p in patches {
                for &m in matls {
                    // own value plus the neighbor values the ghost require
                    // guaranteed are present
                    let mut acc = new.get_scalars(&x, p, m)?[0];
                    for q in [p.get().checked_sub(1), p.get().checked_add(1)] {
                        if let Some(q) = q.and_then(|q| PatchId::new(q).ok()) {
                            if new.exists(&x, Some(q), m) {
                                acc += new.get_scalars(&x, q, m)?[0];
                            }
                        }
                    }
                    new.put_scalars(&VarLabel::new("y"), p, m, &[acc])?;
                    new.put_global(
                        &VarLabel::new("ysum"),
                        m,
                        patch_sched::warehouse::scalars_to_bytes(&[acc]),
                    )?;
                }
            }
            Ok(())
        })
        .requires(
            Dependency::per_patch(lbl("x"), Generation::New).with_ghost(Ghost::AroundCells(1)),
        )
        .computes(Dependency::per_patch(lbl("y"), Generation::New))
        .computes(Dependency::global(lbl("ysum"), Generation::New)),
    );
    tg.add_task(Task::reduction("sum_y", lbl("ysum"), ReductionOp::Sum));
    tg
}

fn run_pipeline_rank(comm: ThreadComm) -> (Vec<TraceEntry>, Vec<f64>) {
    let topo = PatchTopology::line(2);
    let lb = Arc::new(BlockLoadBalancer::new(&topo, 2));
    let mut sched = Scheduler::new(Arc::new(comm), lb);
    sched.set_collect_stats(true);
    let idx = sched
        .compile_graph(&pipeline_graph(), &topo, &[m0()])
        .unwrap();
    let (_old, new) = attach_fresh_warehouses(&mut sched);
    let stats = sched.execute(idx, 0).unwrap();
    let reduced = patch_sched::warehouse::bytes_to_scalars(
        &new.get_global(&lbl("ysum"), m0()).unwrap(),
    );
    (stats.trace, reduced)
}

#[test]
#[serial]
fn producer_consumer_reduction_across_two_ranks() {
    let results = run_ranks(2, run_pipeline_rank);

    // x@1 = 1, x@2 = 2; y@1 = 1+2 = 3, y@2 = 2+1 = 3; global sum = 6.
    for (rank, (trace, reduced)) in results.into_iter().enumerate() {
        assert_eq!(reduced, vec![6.0], "rank {rank} saw a partial reduction");

        // 3 local tasks per rank: produce@own, blend@own, the reduction.
        assert_eq!(trace.len(), 3);
        let own = rank as u32 + 1;
        let produce = trace_pos(&trace, &format!("produce@patch{own}"));
        let blend = trace_pos(&trace, &format!("blend@patch{own}"));
        let reduce = trace_pos(&trace, "sum_y");
        assert!(produce < blend, "consumer ran before its remote input");
        assert!(blend < reduce, "reduction ran before its contributors");
    }
}

#[test]
#[serial]
fn remote_values_arrive_before_the_consumer_reads() {
    // The blend bodies assert the ghost values exist; a dropped or
    // double-posted message would either panic there or deadlock.
    let results = run_ranks(2, |comm| {
        let topo = PatchTopology::line(2);
        let lb = Arc::new(BlockLoadBalancer::new(&topo, 2));
        let mut sched = Scheduler::new(Arc::new(comm), lb);
        let mut tg = TaskGraph::new();
        tg.add_task(
            Task::new("produce", |_, patches, matls, _, new| {
                for &p in patches {
                    for &m in matls {
                        new.put_scalars(&VarLabel::new("x"), p, m, &[10.0 * f64::from(p.get())])?;
                    }
                }
                Ok(())
            })
            .computes(Dependency::per_patch(lbl("x"), Generation::New)),
        );
        tg.add_task(
            Task::new("probe", |world, patches, matls, _, new| {
                let x = VarLabel::new("x");
                for &p in patches {
                    for &m in matls {
                        let other = if p.get() == 1 { 2 } else { 1 };
                        let remote =
                            new.get_scalars(&x, PatchId::new(other).unwrap(), m)?;
                        assert_eq!(remote, vec![10.0 * f64::from(other)], "rank {}", world.rank);
                    }
                }
                Ok(())
            })
            .requires(
                Dependency::per_patch(lbl("x"), Generation::New)
                    .with_ghost(Ghost::AroundCells(1)),
            )
            .computes(Dependency::per_patch(lbl("done"), Generation::New)),
        );
        let idx = sched.compile_graph(&tg, &topo, &[m0()]).unwrap();
        attach_fresh_warehouses(&mut sched);
        sched.execute(idx, 0).unwrap().local_tasks
    });
    assert_eq!(results, vec![2, 2]);
}

#[test]
#[serial]
fn four_rank_round_robin_pipeline() {
    // Round-robin ownership forces every neighbor exchange across ranks.
    let results = run_ranks(4, |comm| {
        let topo = PatchTopology::line(8);
        let lb = Arc::new(RoundRobinLoadBalancer::new(&topo, 4));
        let mut sched = Scheduler::new(Arc::new(comm), lb);
        let idx = sched
            .compile_graph(&pipeline_graph(), &topo, &[m0()])
            .unwrap();
        let (_old, new) = attach_fresh_warehouses(&mut sched);
        sched.execute(idx, 0).unwrap();
        patch_sched::warehouse::bytes_to_scalars(
            &new.get_global(&lbl("ysum"), m0()).unwrap(),
        )
    });
    // Every rank must agree on the reduced value.
    let first = results[0].clone();
    assert!(!first.is_empty());
    for r in &results {
        assert_eq!(*r, first);
    }
}
