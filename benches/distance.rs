use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use quickadc::{
    InstructionSet,
    distance::{dot, l2sq},
    multi::{dot_product_multi, square_distance_multi},
};
use rand::{Rng, SeedableRng};

fn generate_test_vectors(dim: usize, count: usize) -> Vec<Vec<f32>> {
    let mut rng = rand_xoshiro::Xoroshiro128PlusPlus::seed_from_u64(0x455A_5469676572);
    (0..count)
        .map(|_| {
            (&mut rng)
                .random_iter::<f32>()
                .take(dim)
                .collect::<Vec<_>>()
        })
        .collect()
}

fn widths() -> impl Iterator<Item = InstructionSet> {
    [
        InstructionSet::Scalar,
        InstructionSet::Width128,
        InstructionSet::Width256,
        InstructionSet::Width512,
    ]
    .into_iter()
    .filter(|w| w.is_supported())
}

pub fn primitive_benchmarks(c: &mut Criterion) {
    let vectors = generate_test_vectors(1024, 2);
    let (a, b) = (&vectors[0], &vectors[1]);
    let mut group = c.benchmark_group("f32");
    for width in widths() {
        group.bench_with_input(BenchmarkId::new("dot", width), &width, |bench, w| {
            bench.iter(|| std::hint::black_box(dot(a, b, *w)))
        });
        group.bench_with_input(BenchmarkId::new("l2", width), &width, |bench, w| {
            bench.iter(|| std::hint::black_box(l2sq(a, b, *w)))
        });
    }
    group.finish();
}

pub fn multi_benchmarks(c: &mut Criterion) {
    let vectors = generate_test_vectors(128, 33);
    let query = &vectors[0];
    let packed = vectors[1..].concat();
    let mut out = vec![0.0f32; 32];
    let width = InstructionSet::default();
    c.bench_function("multi/dot/32x128", |b| {
        b.iter(|| {
            dot_product_multi(query, &packed, &mut out, width);
            std::hint::black_box(&out);
        })
    });
    c.bench_function("multi/l2/32x128", |b| {
        b.iter(|| {
            square_distance_multi(query, &packed, &mut out, width);
            std::hint::black_box(&out);
        })
    });
    c.bench_function("single/dot/32x128", |b| {
        b.iter(|| {
            for (o, t) in out.iter_mut().zip(packed.chunks_exact(128)) {
                *o = dot(query, t, width);
            }
            std::hint::black_box(&out);
        })
    });
}

criterion_group!(benches, primitive_benchmarks, multi_benchmarks);
criterion_main!(benches);
