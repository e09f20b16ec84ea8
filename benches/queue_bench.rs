//! Ready-queue policy overhead: one execute of a wide fan-in graph per
//! policy, serial rank, no-op task bodies.

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use patch_sched::prelude::*;
use std::sync::Arc;

const POLICIES: [QueuePolicy; 11] = [
    QueuePolicy::Fcfs,
    QueuePolicy::Random,
    QueuePolicy::Stack,
    QueuePolicy::MostChildren,
    QueuePolicy::LeastChildren,
    QueuePolicy::MostL2Children,
    QueuePolicy::LeastL2Children,
    QueuePolicy::MostMessages,
    QueuePolicy::LeastMessages,
    QueuePolicy::PatchOrder,
    QueuePolicy::PatchOrderRandom,
];

/// `width` independent producers funneled into one sink, so the external
/// queue actually fills up and the policy scan has something to rank.
fn fan_in_graph(width: usize) -> TaskGraph {
    let mut tg = TaskGraph::new();
    let mut sink = Task::new("sink", |_, _, _, _, _| Ok(()));
    for i in 0..width {
        let label = VarLabel::new(&format!("v{i}"));
        tg.add_task(
            Task::new(&format!("src{i}"), |_, _, _, _, _| Ok(()))
                .computes(Dependency::per_patch(label.clone(), Generation::New)),
        );
        sink = sink.requires(Dependency::per_patch(label, Generation::New));
    }
    tg.add_task(sink);
    tg
}

fn bench_policies(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_policy");
    for &policy in &POLICIES {
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{policy:?}")),
            &policy,
            |b, &policy| {
                let topo = PatchTopology::line(8);
                let lb = Arc::new(BlockLoadBalancer::new(&topo, 1));
                let mut sched = Scheduler::new(Arc::new(NoComm), lb);
                sched.set_queue_policy(policy);
                let idx = sched
                    .compile_graph(&fan_in_graph(32), &topo, &[MaterialId(0)])
                    .unwrap();
                sched.attach_warehouses(
                    Arc::new(InMemoryWarehouse::new()),
                    Arc::new(InMemoryWarehouse::new()),
                );
                let mut iteration = 0;
                b.iter(|| {
                    iteration += 1;
                    sched.execute(idx, iteration).unwrap()
                });
            },
        );
    }
    group.finish();
}

fn bench_compile(c: &mut Criterion) {
    c.bench_function("compile_detailed_graph", |b| {
        let topo = PatchTopology::line(16);
        let lb = Arc::new(BlockLoadBalancer::new(&topo, 1));
        let graph = fan_in_graph(16);
        b.iter(|| {
            let mut sched = Scheduler::new(Arc::new(NoComm), Arc::clone(&lb));
            sched.compile_graph(&graph, &topo, &[MaterialId(0)]).unwrap()
        });
    });
}

criterion_group!(benches, bench_policies, bench_compile);
criterion_main!(benches);
