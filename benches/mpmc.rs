//! Benchmarks for the bounded MPMC ring.
//!
//! Covers the uncontended hot path, capacity sweeps, and a contended
//! producer/consumer comparison against crossbeam's `ArrayQueue` (the
//! closest off-the-shelf equivalent of the same Vyukov discipline).

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use crossbeam_queue::ArrayQueue;
use std::sync::Arc;
use std::thread;
use taskpool::MpmcRing;

const OPS_PER_ITER: u64 = 10_000;

/// Alternating push/pop on a single thread - the tightest loop.
fn bench_alternating(c: &mut Criterion) {
    let mut group = c.benchmark_group("mpmc_alternating");
    group.throughput(Throughput::Elements(OPS_PER_ITER));

    for cap in [8usize, 64, 1024] {
        group.bench_with_input(BenchmarkId::new("taskpool", cap), &cap, |b, &cap| {
            let ring: MpmcRing<u64> = MpmcRing::with_capacity(cap);
            b.iter(|| {
                for i in 0..OPS_PER_ITER {
                    ring.try_push(black_box(i)).unwrap();
                    black_box(ring.try_pop());
                }
            })
        });

        group.bench_with_input(BenchmarkId::new("crossbeam", cap), &cap, |b, &cap| {
            let queue: ArrayQueue<u64> = ArrayQueue::new(cap);
            b.iter(|| {
                for i in 0..OPS_PER_ITER {
                    queue.push(black_box(i)).unwrap();
                    black_box(queue.pop());
                }
            })
        });
    }

    group.finish();
}

/// Fill-then-drain cycles exercise the wraparound path.
fn bench_fill_drain(c: &mut Criterion) {
    let mut group = c.benchmark_group("mpmc_fill_drain");
    group.throughput(Throughput::Elements(OPS_PER_ITER));

    for cap in [64usize, 1024] {
        group.bench_with_input(BenchmarkId::new("taskpool", cap), &cap, |b, &cap| {
            let ring: MpmcRing<u64> = MpmcRing::with_capacity(cap);
            b.iter(|| {
                let mut pushed = 0u64;
                while pushed < OPS_PER_ITER {
                    while pushed < OPS_PER_ITER && ring.try_push(pushed).is_ok() {
                        pushed += 1;
                    }
                    while ring.try_pop().is_some() {}
                }
            })
        });
    }

    group.finish();
}

/// Contended throughput: N producers, N consumers hammering one ring.
fn bench_contended(c: &mut Criterion) {
    let mut group = c.benchmark_group("mpmc_contended");
    const PER_PRODUCER: u64 = 10_000;

    for threads in [2usize, 4] {
        let total = PER_PRODUCER * threads as u64;
        group.throughput(Throughput::Elements(total));

        group.bench_with_input(
            BenchmarkId::new("taskpool", threads),
            &threads,
            |b, &threads| {
                b.iter(|| {
                    let ring = Arc::new(MpmcRing::<u64>::with_capacity(1024));
                    let mut handles = Vec::new();
                    for _ in 0..threads {
                        let ring = Arc::clone(&ring);
                        handles.push(thread::spawn(move || {
                            for i in 0..PER_PRODUCER {
                                let mut v = i;
                                loop {
                                    match ring.try_push(v) {
                                        Ok(()) => break,
                                        Err(back) => {
                                            v = back;
                                            std::hint::spin_loop();
                                        }
                                    }
                                }
                            }
                        }));
                    }
                    for _ in 0..threads {
                        let ring = Arc::clone(&ring);
                        handles.push(thread::spawn(move || {
                            let mut popped = 0u64;
                            while popped < PER_PRODUCER {
                                if ring.try_pop().is_some() {
                                    popped += 1;
                                } else {
                                    std::hint::spin_loop();
                                }
                            }
                        }));
                    }
                    for h in handles {
                        h.join().unwrap();
                    }
                })
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_alternating, bench_fill_drain, bench_contended);
criterion_main!(benches);
