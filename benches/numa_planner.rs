//! Benchmarks for the NUMA/hugepage placement planner (spec §4.4) and the
//! per-key mutex map it and the store share (spec §4.5).

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use nexa_machine_runtime::lockmap::LockMap;
use nexa_machine_runtime::numa::{NumaCellState, NumaHost, Planner};
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

const MIB: i64 = 1024 * 1024;

struct FakeHost {
    cells: Vec<NumaCellState>,
}

impl NumaHost for FakeHost {
    fn cells(&self) -> nexa_machine_runtime::RuntimeResult<Vec<NumaCellState>> {
        Ok(self.cells.clone())
    }

    fn pin_count(&self, _cpu_id: u32) -> u64 {
        0
    }
}

fn host_with_cells(cell_count: u32, cpus_per_cell: u32, free_hugepages: u64) -> FakeHost {
    let mut cells = Vec::with_capacity(cell_count as usize);
    let mut next_cpu = 0u32;
    for id in 0..cell_count {
        let cpu_ids = (next_cpu..next_cpu + cpus_per_cell).collect();
        next_cpu += cpus_per_cell;
        cells.push(NumaCellState { id, cpu_ids, free_hugepages });
    }
    FakeHost { cells }
}

fn bench_planner(c: &mut Criterion) {
    let mut group = c.benchmark_group("numa_planner");

    let single_cell = host_with_cells(1, 32, 4096);
    group.bench_function("single_cell_fits", |b| {
        b.iter(|| Planner::plan(&single_cell, MIB, &HashSet::new(), 256 * MIB, 8).unwrap())
    });

    let spanning = host_with_cells(8, 16, 512);
    group.bench_function("eight_cells_spanning_placement", |b| {
        b.iter(|| Planner::plan(&spanning, MIB, &HashSet::new(), 3000 * MIB, 64).unwrap())
    });

    let blocked: HashSet<u32> = (0..8).collect();
    group.bench_function("placement_with_blocked_cpus", |b| {
        b.iter(|| Planner::plan(&spanning, MIB, &blocked, 200 * MIB, 16).unwrap())
    });

    group.finish();
}

/// Mirrors the store's locking pattern: many operations on a small set of
/// hot keys, contended across threads.
fn bench_lockmap_contention(c: &mut Criterion) {
    let mut group = c.benchmark_group("lockmap");

    group.bench_function("uncontended_single_key", |b| {
        let map: LockMap<String> = LockMap::new();
        b.iter(|| {
            let _g = map.lock("m1".to_string());
        })
    });

    group.bench_function("eight_threads_sixteen_keys", |b| {
        b.iter_batched(
            || Arc::new(LockMap::<String>::new()),
            |map| {
                let handles: Vec<_> = (0..8)
                    .map(|t| {
                        let map = map.clone();
                        thread::spawn(move || {
                            for i in 0..200 {
                                let key = format!("m{}", (t * 7 + i) % 16);
                                let _g = map.lock(key);
                            }
                        })
                    })
                    .collect();
                for h in handles {
                    h.join().unwrap();
                }
            },
            BatchSize::SmallInput,
        )
    });

    group.finish();
}

criterion_group!(benches, bench_planner, bench_lockmap_contention);
criterion_main!(benches);
