//! The cooperative abort/restart protocol: one rank's instability flag must
//! drain cleanly everywhere and leave every rank seeing the restart.

mod util;

use patch_sched::prelude::*;
use serial_test::serial;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use util::*;

/// compute fills u (and flags an abort on patch 2's rank); finish reads the
/// ghost-exchanged u. Counters record which callbacks actually ran.
fn abort_graph(computes: Arc<AtomicUsize>, finishes: Arc<AtomicUsize>) -> TaskGraph {
    let mut tg = TaskGraph::new();
    tg.add_task(
        Task::new("compute", move |_, patches, matls, _, new| {
            computes.fetch_add(1, Ordering::SeqCst);
            for &p in patches {
                for &m in matls {
                    new.put_scalars(&VarLabel::new("u"), p, m, &[f64::from(p.get())])?;
                    if p.get() == 2 {
                        // the stability check tripped
                        new.abort_timestep();
                    }
                }
            }
            Ok(())
        })
        .computes(Dependency::per_patch(lbl("u"), Generation::New)),
    );
    tg.add_task(
        Task::new("finish", move |_, _, _, _, _| {
            finishes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .requires(
            Dependency::per_patch(lbl("u"), Generation::New).with_ghost(Ghost::AroundCells(1)),
        )
        .computes(Dependency::per_patch(lbl("v"), Generation::New)),
    );
    tg
}

#[test]
#[serial]
fn abort_on_one_rank_restarts_every_rank() {
    let computes = Arc::new(AtomicUsize::new(0));
    let finishes = Arc::new(AtomicUsize::new(0));
    let (c, f) = (computes.clone(), finishes.clone());

    let results = run_ranks(2, move |comm| {
        let topo = PatchTopology::line(2);
        let lb = Arc::new(BlockLoadBalancer::new(&topo, 2));
        let mut sched = Scheduler::new(Arc::new(comm), lb);
        sched.set_restartable(true);
        let idx = sched
            .compile_graph(&abort_graph(c.clone(), f.clone()), &topo, &[m0()])
            .unwrap();
        let (old, new) = attach_fresh_warehouses(&mut sched);
        let stats = sched.execute(idx, 0).unwrap();
        (
            stats.local_tasks,
            new.timestep_restarted(),
            old.timestep_restarted(),
        )
    });

    // Both ranks drained all their tasks and both observed the restart
    // even though only rank 1's warehouse raised the abort.
    for (rank, (local, new_restarted, old_restarted)) in results.into_iter().enumerate() {
        assert_eq!(local, 2, "rank {rank} left tasks behind");
        assert!(new_restarted, "rank {rank} missed the restart flag");
        assert!(old_restarted, "rank {rank} old generation missed the restart");
    }

    // Every compute ran; rank 1's finish follows its own abort point and is
    // skipped, rank 0 never aborted so its finish runs.
    assert_eq!(computes.load(Ordering::SeqCst), 2);
    assert_eq!(finishes.load(Ordering::SeqCst), 1);
}

#[test]
#[serial]
fn without_restartable_the_flag_stays_local() {
    let computes = Arc::new(AtomicUsize::new(0));
    let finishes = Arc::new(AtomicUsize::new(0));
    let (c, f) = (computes.clone(), finishes.clone());

    let results = run_ranks(2, move |comm| {
        let rank = comm.rank();
        let topo = PatchTopology::line(2);
        let lb = Arc::new(BlockLoadBalancer::new(&topo, 2));
        let mut sched = Scheduler::new(Arc::new(comm), lb);
        let idx = sched
            .compile_graph(&abort_graph(c.clone(), f.clone()), &topo, &[m0()])
            .unwrap();
        let (_old, new) = attach_fresh_warehouses(&mut sched);
        sched.execute(idx, 0).unwrap();
        (rank, new.timestep_restarted())
    });

    for (rank, restarted) in results {
        assert!(!restarted, "rank {rank} restarted without the protocol");
    }
}

#[test]
fn serial_abort_still_drains() {
    // Single rank: the abort point is recorded, downstream callbacks are
    // skipped, and execute still reaches the terminal condition.
    let computes = Arc::new(AtomicUsize::new(0));
    let finishes = Arc::new(AtomicUsize::new(0));

    let topo = PatchTopology::line(2);
    let lb = Arc::new(BlockLoadBalancer::new(&topo, 1));
    let mut sched = Scheduler::new(Arc::new(NoComm), lb);
    sched.set_restartable(true);
    let idx = sched
        .compile_graph(
            &abort_graph(computes.clone(), finishes.clone()),
            &topo,
            &[m0()],
        )
        .unwrap();
    let (_old, new) = attach_fresh_warehouses(&mut sched);
    let stats = sched.execute(idx, 0).unwrap();

    assert_eq!(stats.local_tasks, 4);
    assert!(new.timestep_aborted());
    assert!(new.timestep_restarted());
    assert_eq!(computes.load(Ordering::SeqCst), 2);
    // compute@2 aborted at static order 1; both finish instances sort after
    // it and are skipped.
    assert_eq!(finishes.load(Ordering::SeqCst), 0);
}
