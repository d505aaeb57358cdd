use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use pipewright::dag::{Edge, TaskGraph};
use pipewright::models::Task;

/// task0 -> task1 -> ... : maximum depth, no parallelism
fn linear_chain(count: usize) -> (Vec<Task>, Vec<Edge>) {
    let tasks = (0..count).map(|i| Task::no_op(format!("task{}", i))).collect();
    let edges = (1..count)
        .map(|i| Edge::new(format!("task{}", i - 1), format!("task{}", i)))
        .collect();
    (tasks, edges)
}

/// Repeated fan-out of four branches converging on one join
fn diamonds(layers: usize) -> (Vec<Task>, Vec<Edge>) {
    let mut tasks = vec![Task::no_op("join0")];
    let mut edges = Vec::new();

    for layer in 0..layers {
        let join = format!("join{}", layer);
        let next = format!("join{}", layer + 1);
        for branch in 0..4 {
            let id = format!("branch{}_{}", layer, branch);
            tasks.push(Task::no_op(id.clone()));
            edges.push(Edge::new(join.clone(), id.clone()));
            edges.push(Edge::new(id, next.clone()));
        }
        tasks.push(Task::no_op(next));
    }
    (tasks, edges)
}

/// root -> N parallel tasks -> final
fn wide(width: usize) -> (Vec<Task>, Vec<Edge>) {
    let mut tasks = vec![Task::no_op("root")];
    let mut edges = Vec::new();
    for i in 0..width {
        let id = format!("parallel{}", i);
        tasks.push(Task::no_op(id.clone()));
        edges.push(Edge::new("root", id.clone()));
        edges.push(Edge::new(id, "final"));
    }
    tasks.push(Task::no_op("final"));
    (tasks, edges)
}

fn bench_graph_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("graph_build");

    for size in [10, 100, 1000] {
        let (tasks, edges) = linear_chain(size);
        group.bench_with_input(BenchmarkId::new("linear", size), &size, |b, _| {
            b.iter(|| TaskGraph::build("bench", black_box(tasks.clone()), black_box(&edges)).unwrap());
        });
    }

    for layers in [10, 100] {
        let (tasks, edges) = diamonds(layers);
        group.bench_with_input(BenchmarkId::new("diamonds", layers), &layers, |b, _| {
            b.iter(|| TaskGraph::build("bench", black_box(tasks.clone()), black_box(&edges)).unwrap());
        });
    }

    group.finish();
}

fn bench_cycle_rejection(c: &mut Criterion) {
    let mut group = c.benchmark_group("cycle_rejection");

    for size in [10, 100, 500] {
        let (tasks, mut edges) = linear_chain(size);
        edges.push(Edge::new(format!("task{}", size - 1), "task0"));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| TaskGraph::build("bench", black_box(tasks.clone()), black_box(&edges)).unwrap_err());
        });
    }

    group.finish();
}

fn bench_parallel_levels(c: &mut Criterion) {
    let mut group = c.benchmark_group("parallel_levels");

    for width in [10, 100, 500] {
        let (tasks, edges) = wide(width);
        let graph = TaskGraph::build("bench", tasks, &edges).unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(width), &width, |b, _| {
            b.iter(|| black_box(&graph).parallel_levels());
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_graph_build,
    bench_cycle_rejection,
    bench_parallel_levels
);
criterion_main!(benches);
