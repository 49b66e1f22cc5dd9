use std::{
    io,
    time::{Duration, Instant},
};

use clap::Args;
use quickadc::{
    InstructionSet,
    distance::{dot, l2sq},
    input::VectorStore,
};
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;

use crate::{VectorInput, WIDTHS};

#[derive(Args)]
pub struct DistanceArgs {
    #[command(flatten)]
    input: VectorInput,
    /// Number of vector pairs to compare.
    #[arg(short, long, default_value_t = 10_000)]
    pairs: usize,
    /// Seed for random vectors.
    #[arg(long, default_value_t = 0x455A_5469676572)]
    seed: u64,
}

struct WidthResult {
    width: InstructionSet,
    dot: Vec<f32>,
    l2: Vec<f32>,
    dot_time: Duration,
    l2_time: Duration,
}

fn run(width: InstructionSet, pairs: &[(&[f32], &[f32])]) -> WidthResult {
    let start = Instant::now();
    let dot = pairs.iter().map(|(a, b)| dot(a, b, width)).collect();
    let dot_time = start.elapsed();
    let start = Instant::now();
    let l2 = pairs.iter().map(|(a, b)| l2sq(a, b, width)).collect();
    let l2_time = start.elapsed();
    WidthResult {
        width,
        dot,
        l2,
        dot_time,
        l2_time,
    }
}

fn max_relative_error(expected: &[f32], actual: &[f32]) -> f32 {
    expected
        .iter()
        .zip(actual)
        .map(|(e, a)| (e - a).abs() / e.abs().max(1.0))
        .fold(0.0, f32::max)
}

pub fn distance(args: DistanceArgs) -> io::Result<()> {
    let dim = args.input.dimensions.get();
    let store = args.input.open()?;
    let random = if store.is_none() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(args.seed);
        (0..(args.pairs * 2 * dim))
            .map(|_| rng.random_range(-1.0f32..=1.0))
            .collect::<Vec<_>>()
    } else {
        vec![]
    };
    let vectors = match store.as_ref() {
        Some(s) => s.iter().collect::<Vec<_>>(),
        None => random.chunks(dim).collect(),
    };
    if vectors.len() < 2 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "need at least two vectors",
        ));
    }
    let pairs = vectors
        .chunks_exact(2)
        .take(args.pairs)
        .map(|p| (p[0], p[1]))
        .collect::<Vec<_>>();

    let results = WIDTHS
        .into_iter()
        .filter(|w| w.is_supported())
        .map(|w| run(w, &pairs))
        .collect::<Vec<_>>();
    let reference = &results[0];
    println!("Pairs: {} dimensions: {dim}", pairs.len());
    println!(
        "{:>8} {:>12} {:>12} {:>12} {:>12}",
        "width", "dot ns", "dot err", "l2 ns", "l2 err"
    );
    for r in &results {
        println!(
            "{:>8} {:>12.1} {:>12.3e} {:>12.1} {:>12.3e}",
            r.width.to_string(),
            r.dot_time.as_nanos() as f64 / pairs.len() as f64,
            max_relative_error(&reference.dot, &r.dot),
            r.l2_time.as_nanos() as f64 / pairs.len() as f64,
            max_relative_error(&reference.l2, &r.l2),
        );
    }
    Ok(())
}
