//! Benchmarks for the snapshot pipeline.

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};

use particle_stream::{
    pipeline::{
        DisplayProperties, DoubleBuffer, ObjectVector, ParticleData, Selection, SwapOptions,
    },
    snapshot::{ComponentRange, Snapshot, decode_frame, encode_frame},
};

fn galaxy(particles: usize) -> Snapshot {
    let positions = (0..particles * 3).map(|i| (i % 97) as f32 * 0.1).collect();
    let halo = particles / 2;
    Snapshot::new(0.0, positions)
        .with_component(ComponentRange::contiguous("halo", 0, halo))
        .with_component(ComponentRange::contiguous("disk", halo, particles - halo))
}

fn bench_resolve(c: &mut Criterion) {
    let mut group = c.benchmark_group("selection_resolve");
    let defaults = DisplayProperties::default();

    for particles in [10_000, 100_000, 1_000_000] {
        let snapshot = galaxy(particles);
        let selection = Selection::parse("halo,disk[0:999:3],0:4999").unwrap();

        group.bench_with_input(
            BenchmarkId::from_parameter(particles),
            &particles,
            |b, _| {
                b.iter(|| {
                    selection
                        .resolve(
                            black_box(snapshot.particle_count),
                            &snapshot.components,
                            &defaults,
                        )
                        .unwrap()
                });
            },
        );
    }

    group.finish();
}

fn bench_compaction(c: &mut Criterion) {
    let mut group = c.benchmark_group("compaction");
    let defaults = DisplayProperties::default();

    for particles in [100_000, 1_000_000] {
        let snapshot = galaxy(particles);
        let selection = Selection::parse("disk").unwrap();

        group.bench_with_input(
            BenchmarkId::from_parameter(particles),
            &particles,
            |b, _| {
                b.iter(|| {
                    let mut objects = selection
                        .resolve(particles, &snapshot.components, &defaults)
                        .unwrap();
                    ParticleData::compacted(0, black_box(snapshot.clone()), &mut objects)
                });
            },
        );
    }

    group.finish();
}

fn bench_swap(c: &mut Criterion) {
    let mut group = c.benchmark_group("swap_with_carryover");
    let defaults = DisplayProperties::default();
    let snapshot = galaxy(100_000);

    for objects in [2, 64, 1024] {
        let expression = (0..objects)
            .map(|i| format!("{}:{}", i * 10, i * 10 + 9))
            .collect::<Vec<_>>()
            .join(",");
        let resolved = Selection::parse(&expression)
            .unwrap()
            .resolve(snapshot.particle_count, &[], &defaults)
            .unwrap();
        let data = std::sync::Arc::new(ParticleData::whole(0, snapshot.clone()));
        let generation = ObjectVector {
            data,
            objects: resolved,
        };

        let buffer = DoubleBuffer::new();
        buffer.stage(generation.clone());
        buffer.swap(&SwapOptions::initial());

        group.bench_with_input(BenchmarkId::from_parameter(objects), &objects, |b, _| {
            b.iter(|| {
                buffer.stage(generation.clone());
                black_box(buffer.swap(&SwapOptions::playback()))
            });
        });
    }

    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_decode");

    for particles in [10_000, 100_000] {
        let snapshot = galaxy(particles);
        let record = encode_frame(&snapshot, false);

        group.bench_with_input(
            BenchmarkId::from_parameter(particles),
            &particles,
            |b, _| {
                b.iter(|| decode_frame(black_box(&record), false).unwrap());
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_resolve, bench_compaction, bench_swap, bench_decode);
criterion_main!(benches);
