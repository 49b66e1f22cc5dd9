//! Shared fixtures for unit tests.

use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;

use crate::{
    VectorSimilarity,
    capability::InstructionSet,
    pq::{BATCH_SIZE, Codebooks},
};

/// Every requested width, including ones the host may not support.
pub const WIDTHS: [InstructionSet; 4] = [
    InstructionSet::Scalar,
    InstructionSet::Width128,
    InstructionSet::Width256,
    InstructionSet::Width512,
];

macro_rules! assert_float_near {
    ($expected:expr, $actual:expr, $epsilon:expr) => {{
        let expected: f32 = $expected;
        let actual: f32 = $actual;
        let tolerance = $epsilon * expected.abs().max(1.0);
        assert!(
            (expected - actual).abs() <= tolerance,
            "expected {} (tolerance={}) actual {}",
            expected,
            tolerance,
            actual
        );
    }};
    ($expected:expr, $actual:expr) => {
        assert_float_near!($expected, $actual, 1e-4f32)
    };
}
pub(crate) use assert_float_near;

pub fn test_rng() -> Xoshiro256PlusPlus {
    Xoshiro256PlusPlus::seed_from_u64(0x455A_5469676572)
}

pub fn random_vector(rng: &mut impl Rng, len: usize) -> Vec<f32> {
    (0..len).map(|_| rng.random_range(-1.0f32..=1.0)).collect()
}

/// Generate `subspaces` codebooks of `clusters` random centroids each.
pub fn random_codebooks(
    rng: &mut impl Rng,
    subspaces: usize,
    clusters: usize,
    sub_dim: usize,
) -> Codebooks {
    Codebooks::new(
        subspaces,
        clusters,
        sub_dim,
        random_vector(rng, subspaces * clusters * sub_dim),
    )
    .unwrap()
}

/// Generate a transposed batch of random codes.
pub fn random_shuffles(rng: &mut impl Rng, subspaces: usize, clusters: usize) -> Vec<u8> {
    (0..(subspaces * BATCH_SIZE))
        .map(|_| rng.random_range(0..clusters) as u8)
        .collect()
}

#[test]
fn similarity_score_normalization() {
    assert_eq!(VectorSimilarity::Dot.score(1.0), 1.0);
    assert_eq!(VectorSimilarity::Dot.score(-1.0), 0.0);
    assert_eq!(VectorSimilarity::Dot.score(2.0), 1.5);
    assert_eq!(VectorSimilarity::Euclidean.score(0.0), 1.0);
    assert_eq!(VectorSimilarity::Euclidean.score(3.0), 0.25);
    assert_eq!(VectorSimilarity::cosine_score(2.0, 4.0, 1.0), 1.0);
    assert_eq!(VectorSimilarity::cosine_score(0.0, 4.0, 1.0), 0.5);
}

#[test]
fn similarity_parse() {
    assert_eq!(
        "l2".parse::<VectorSimilarity>().unwrap(),
        VectorSimilarity::Euclidean
    );
    assert_eq!(
        "cosine".parse::<VectorSimilarity>().unwrap(),
        VectorSimilarity::Cosine
    );
    assert!("hamming".parse::<VectorSimilarity>().is_err());
    for s in VectorSimilarity::all() {
        assert_eq!(s.to_string().parse::<VectorSimilarity>().unwrap(), s);
    }
}
