//! Criterion benchmarks for the cycle engine.
//!
//! Run with:
//!   cargo bench
//!   cargo bench --features parallel
//!
//! Results are saved to target/criterion/

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use echobeats::coherence::CoherenceComputer;
use echobeats::config::EngineConfig;
use echobeats::engine::CognitiveEngine;
use echobeats::reservoir::{ReservoirConfig, ReservoirUnit};

fn drive(len: usize, t: usize) -> Vec<f64> {
    (0..len).map(|i| (0.37 * i as f64 + 0.2 * t as f64).sin()).collect()
}

/// One leaky update at varying reservoir sizes.
fn bench_reservoir_update(c: &mut Criterion) {
    let mut group = c.benchmark_group("reservoir_update");

    for units in [32, 64, 128, 256, 512].iter() {
        group.throughput(Throughput::Elements(*units as u64));
        group.bench_with_input(BenchmarkId::from_parameter(units), units, |b, &units| {
            let mut unit = ReservoirUnit::new(ReservoirConfig::default().with_units(units).with_seed(42))
                .expect("valid reservoir config");
            let input = drive(units, 0);
            b.iter(|| black_box(unit.update(&input)[0]));
        });
    }

    group.finish();
}

/// Full coherence matrix over n streams.
fn bench_coherence_matrix(c: &mut Criterion) {
    let mut group = c.benchmark_group("coherence_matrix");

    for streams in [3, 8, 16].iter() {
        let states: Vec<Vec<f64>> = (0..*streams).map(|s| drive(128, s)).collect();
        group.bench_with_input(BenchmarkId::from_parameter(streams), &states, |b, states| {
            b.iter(|| black_box(CoherenceComputer.matrix(states).aggregate()));
        });
    }

    group.finish();
}

/// A full simulated cycle (12 ticks) including three rendezvous.
fn bench_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("cycle");
    group.sample_size(20);

    for workers in [1, 2, 4].iter() {
        group.bench_with_input(BenchmarkId::new("workers", workers), workers, |b, &workers| {
            let cfg = EngineConfig::default()
                .with_workers(workers)
                .with_profiling(false)
                .map_reservoirs(|r| r.with_units(64));
            let mut engine = CognitiveEngine::new(cfg).expect("engine starts");
            b.iter(|| black_box(engine.run_steps(12).expect("cycle runs").len()));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_reservoir_update, bench_coherence_matrix, bench_cycle);
criterion_main!(benches);
