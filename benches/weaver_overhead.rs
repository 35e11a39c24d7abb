//! Hot-path overhead of woven sites
//!
//! Measures what a host pays per intercepted call:
//!
//! 1. inactive fast path: one flag load, then the body
//! 2. active fast path: flag load, probe fetch by slot, start/stop
//! 3. dynamic path: key resolution plus an FNV map lookup, then start/stop
//!
//! # Run Instructions
//!
//! ```bash
//! cargo bench --bench weaver_overhead
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use probeweave::clock::MonotonicClock;
use probeweave::config::EngineConfig;
use probeweave::registry::{Registry, TargetDescriptor};
use probeweave::weaver::Weaver;
use std::sync::Arc;

fn weaver() -> Weaver {
    let registry = Arc::new(Registry::new(&EngineConfig::default()));
    Weaver::new(registry, Arc::new(MonotonicClock::new()))
}

/// Baseline: the body without any site around it
fn bench_bare_call(c: &mut Criterion) {
    c.bench_function("bare_call", |b| {
        b.iter(|| black_box(black_box(21u64) * 2));
    });
}

fn bench_fast_path_inactive(c: &mut Criterion) {
    let weaver = weaver();
    let site = weaver
        .weave(TargetDescriptor::<()>::parse("Bench.Inactive"))
        .unwrap();
    weaver.registry().set_slot_active(site.slot(), false);

    c.bench_function("fast_path_inactive", |b| {
        b.iter(|| site.call(|| black_box(black_box(21u64) * 2)));
    });
}

fn bench_fast_path_active(c: &mut Criterion) {
    let weaver = weaver();
    let site = weaver
        .weave(TargetDescriptor::<()>::parse("Bench.Active"))
        .unwrap();
    let probe = weaver.registry().probe(site.slot()).unwrap();

    c.bench_function("fast_path_active", |b| {
        b.iter(|| site.call(|| black_box(black_box(21u64) * 2)));
        probe.record_measurement();
    });
}

/// Dynamic path with a growing number of distinct keys in the map
fn bench_dynamic_path(c: &mut Criterion) {
    let mut group = c.benchmark_group("dynamic_path_keys");

    for keys in [1usize, 16, 256] {
        group.bench_with_input(BenchmarkId::from_parameter(keys), &keys, |b, &keys| {
            let weaver = weaver();
            let site = weaver
                .weave(
                    TargetDescriptor::<usize>::parse("Bench.Dynamic")
                        .with_key(|id: &usize| Some(format!("Bench.Dynamic/{}", id))),
                )
                .unwrap();
            for id in 0..keys {
                site.invoke(&id, || ());
            }

            let mut i = 0usize;
            b.iter(|| {
                let id = i % keys;
                i += 1;
                site.invoke(&id, || black_box(id))
            });
        });
    }

    group.finish();
}

/// Closing a cycle on one probe (runs once per host frame, not per call)
fn bench_record_measurement(c: &mut Criterion) {
    let weaver = weaver();
    let site = weaver
        .weave(TargetDescriptor::<()>::parse("Bench.Record"))
        .unwrap();
    let probe = weaver.registry().probe(site.slot()).unwrap();

    c.bench_function("record_measurement", |b| {
        b.iter(|| {
            site.call(|| ());
            probe.record_measurement();
        });
    });
}

criterion_group!(
    benches,
    bench_bare_call,
    bench_fast_path_inactive,
    bench_fast_path_active,
    bench_dynamic_path,
    bench_record_measurement
);
criterion_main!(benches);
