use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use quasar::{ConcurrentMark, MarkingOptions, ObjectKind, RegionHeap, RegionOptions, TaskEntry};

const REGIONS: usize = 32;
const CHAIN: usize = 500;

fn setup(workers: usize) -> (Box<RegionHeap>, Box<ConcurrentMark>) {
    let heap = RegionHeap::new(RegionOptions::setup_sizes(
        16 * 1024 * 1024,
        None,
        Some(64),
        None,
    ));
    let opts = MarkingOptions {
        parallel_gc_threads: workers,
        conc_gc_threads: workers,
        ..Default::default()
    };
    let cm = ConcurrentMark::new(&heap, opts).unwrap();

    for r in 0..REGIONS {
        unsafe {
            (*heap.region_at(r)).set_kind(quasar::RegionKind::Old);
        }
        let mut prev = core::ptr::null_mut();
        for _ in 0..CHAIN {
            let obj = heap.alloc_obj(r, ObjectKind::Normal, 1, 2);
            unsafe {
                *(*obj).ref_slot(0) = prev;
            }
            prev = obj;
        }
        unsafe {
            (*heap.region_at(r))
                .target_obj_queue()
                .push(TaskEntry::from_obj(prev));
        }
    }
    heap.build_collection_set(&(0..REGIONS).collect::<Vec<_>>());

    (heap, cm)
}

pub fn bench_marking(c: &mut Criterion) {
    let mut group = c.benchmark_group("linear chain marking");
    group.sample_size(20);

    for workers in [1usize, 2, 4] {
        group.bench_function(BenchmarkId::new("workers", workers), |b| {
            b.iter_batched_ref(
                || setup(workers),
                |(_heap, cm)| {
                    cm.run_marking_cycle(None, None);
                },
                criterion::BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

criterion_group!(benches, bench_marking);
criterion_main!(benches);
