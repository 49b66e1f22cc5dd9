use std::{
    io,
    time::{Duration, Instant},
};

use clap::Args;
use histogram::Histogram;
use indicatif::ParallelProgressIterator;
use quickadc::{
    AdcConfig, InstructionSet, QuantizationMode, VectorSimilarity,
    input::VectorStore,
    pq::{AdcScorer, BATCH_SIZE, Codebooks},
};
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use rayon::prelude::*;

use crate::VectorInput;

#[derive(Args)]
pub struct AdcArgs {
    #[command(flatten)]
    input: VectorInput,
    /// Number of codebooks. Must divide --dimensions.
    #[arg(short = 'm', long, default_value_t = 32)]
    subspaces: usize,
    /// Centroids per codebook.
    #[arg(short, long, default_value_t = 256)]
    clusters: usize,
    /// Number of documents to encode and score.
    #[arg(long, default_value_t = 8192)]
    docs: usize,
    /// Number of queries, each scored against every document.
    #[arg(short, long, default_value_t = 64)]
    queries: usize,
    #[arg(short, long, default_value_t = VectorSimilarity::Dot)]
    similarity: VectorSimilarity,
    /// Use the full achievable range instead of adapting to observed distances.
    #[arg(long)]
    full_range: bool,
    /// Candidates to score exactly before quantizing in adaptive mode.
    #[arg(long, default_value_t = 32)]
    invocation_threshold: usize,
    /// Widest instruction set to use.
    #[arg(long)]
    width: Option<InstructionSet>,
    /// Seed for random data.
    #[arg(long, default_value_t = 0x455A_5469676572)]
    seed: u64,
}

/// Take centroids from sub-vectors of randomly sampled input vectors, or uniform noise.
fn sample_codebooks(
    rng: &mut impl Rng,
    vectors: &[&[f32]],
    subspaces: usize,
    clusters: usize,
    dim: usize,
) -> io::Result<Codebooks> {
    let sub_dim = dim / subspaces;
    let mut centroids = Vec::with_capacity(subspaces * clusters * sub_dim);
    for m in 0..subspaces {
        for _ in 0..clusters {
            let v = vectors[rng.random_range(0..vectors.len())];
            centroids.extend_from_slice(&v[(m * sub_dim)..((m + 1) * sub_dim)]);
        }
    }
    Ok(Codebooks::new(subspaces, clusters, sub_dim, centroids)?)
}

#[derive(Default)]
struct QueryStats {
    errors: Vec<f32>,
    scored: usize,
    elapsed: Duration,
}

impl QueryStats {
    fn merge(mut self, other: Self) -> Self {
        self.errors.extend(other.errors);
        self.scored += other.scored;
        self.elapsed += other.elapsed;
        self
    }
}

fn score_query(
    codebooks: &Codebooks,
    query: &[f32],
    codes: &[Vec<u8>],
    batches: &[Vec<u8>],
    config: &AdcConfig,
) -> io::Result<QueryStats> {
    let mut scorer = AdcScorer::new(codebooks, query, config)?;
    let mut stats = QueryStats::default();
    let mut out = [0.0f32; BATCH_SIZE];
    let mut scores = Vec::with_capacity(batches.len() * BATCH_SIZE);
    let start = Instant::now();
    for batch in batches {
        scorer.score_batch(batch, &mut out)?;
        scores.extend_from_slice(&out);
    }
    stats.elapsed = start.elapsed();
    stats.scored = batches.len() * BATCH_SIZE;
    // only candidates scored after the switch carry quantization error.
    let exact_prefix = if scorer.uses_float_table() {
        codes.len()
    } else {
        scorer.invocations()
    };
    for (i, code) in codes.iter().enumerate().skip(exact_prefix) {
        stats.errors.push((scorer.score_code(code) - scores[i]).abs());
    }
    Ok(stats)
}

fn print_errors(errors: &[f32]) -> io::Result<()> {
    if errors.is_empty() {
        println!("No quantized candidates.");
        return Ok(());
    }
    let sum = errors.iter().map(|e| *e as f64).sum::<f64>();
    let max = errors.iter().copied().fold(0.0f32, f32::max);
    println!(
        "Quantized candidates: {} mean abs error: {:.3e} max abs error: {:.3e}",
        errors.len(),
        sum / errors.len() as f64,
        max
    );

    // error in millionths of a score.
    let mut histogram = Histogram::new(2, 20).map_err(io::Error::other)?;
    for e in errors {
        let ppm = ((*e as f64) * 1e6).min(((1u64 << 20) - 1) as f64) as u64;
        histogram.add(ppm, 1).map_err(io::Error::other)?;
    }
    use std::io::Write;
    let mut lock = std::io::stdout().lock();
    writeln!(lock, "Error distribution (ppm):")?;
    for b in histogram.into_iter().filter(|b| b.count() > 0) {
        writeln!(lock, "[{:7}..{:7}] {:9}", b.start(), b.end(), b.count())?;
    }
    Ok(())
}

pub fn adc(args: AdcArgs) -> io::Result<()> {
    let dim = args.input.dimensions.get();
    if args.subspaces == 0 || dim % args.subspaces != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} subspaces do not divide {dim} dimensions", args.subspaces),
        ));
    }
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(args.seed);
    let store = args.input.open()?;
    let random = if store.is_none() {
        (0..((args.docs + args.queries) * dim))
            .map(|_| rng.random_range(-1.0f32..=1.0))
            .collect::<Vec<_>>()
    } else {
        vec![]
    };
    let vectors = match store.as_ref() {
        Some(s) => s.iter().collect::<Vec<_>>(),
        None => random.chunks(dim).collect(),
    };
    if vectors.len() <= args.queries {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} vectors leave no documents for {} queries", vectors.len(), args.queries),
        ));
    }
    let (queries, docs) = vectors.split_at(args.queries);
    let docs = &docs[..args.docs.min(docs.len())];

    let config = AdcConfig {
        similarity: args.similarity,
        invocation_threshold: args.invocation_threshold,
        quantization: if args.full_range {
            QuantizationMode::FullRange
        } else {
            QuantizationMode::Adaptive
        },
        preferred_width: args.width,
    };
    let codebooks = sample_codebooks(&mut rng, docs, args.subspaces, args.clusters, dim)?;
    let width = config.width();
    println!(
        "Codebooks: {}x{}x{} similarity: {} width: {width}",
        codebooks.subspaces(),
        codebooks.clusters(),
        codebooks.sub_dim(),
        args.similarity
    );

    let codes = docs
        .par_iter()
        .progress_count(docs.len() as u64)
        .map(|d| codebooks.encode(d, width))
        .collect::<quickadc::Result<Vec<_>>>()?;
    let batches = codes
        .chunks(BATCH_SIZE)
        .map(|c| codebooks.pack_batch(c))
        .collect::<quickadc::Result<Vec<_>>>()?;

    let stats = queries
        .par_iter()
        .progress_count(queries.len() as u64)
        .map(|q| score_query(&codebooks, q, &codes, &batches, &config))
        .try_reduce(QueryStats::default, |a, b| Ok(a.merge(b)))?;

    println!(
        "Queries: {} documents: {} scored: {}",
        queries.len(),
        docs.len(),
        stats.scored
    );
    println!(
        "Throughput: {:.1} ns per candidate",
        stats.elapsed.as_nanos() as f64 / stats.scored.max(1) as f64
    );
    print_errors(&stats.errors)
}
