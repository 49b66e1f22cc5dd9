mod adc;
mod distance;

use std::{io, num::NonZero, path::PathBuf};

use clap::{Args, Parser, Subcommand};
use quickadc::{
    InstructionSet,
    input::{Bytes, DerefVectorStore},
};
use tracing_subscriber::filter::LevelFilter;

#[derive(Parser)]
#[command(version, about = "Tool for instrumenting quick ADC kernels", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log kernel selection and quantization decisions.
    #[arg(long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Print the vector instruction sets available on this host.
    Capability,
    /// Check that distance primitives agree across widths and time each width.
    Distance(distance::DistanceArgs),
    /// Measure error and throughput of the lookup engine against exact gathering.
    Adc(adc::AdcArgs),
}

/// Optional raw vector input shared by subcommands.
#[derive(Args)]
pub struct VectorInput {
    /// Little-endian f32 vectors written end to end. Random vectors are used if unset.
    #[arg(short = 'v', long)]
    input_vectors: Option<PathBuf>,
    /// Vector dimensions.
    #[arg(short, long, default_value_t = NonZero::new(128).unwrap())]
    dimensions: NonZero<usize>,
}

impl VectorInput {
    pub fn open(&self) -> io::Result<Option<DerefVectorStore<f32, Bytes>>> {
        self.input_vectors
            .as_ref()
            .map(|p| DerefVectorStore::new(Bytes::map(p)?, self.dimensions))
            .transpose()
    }
}

pub const WIDTHS: [InstructionSet; 4] = [
    InstructionSet::Scalar,
    InstructionSet::Width128,
    InstructionSet::Width256,
    InstructionSet::Width512,
];

fn capability() -> io::Result<()> {
    let probed = quickadc::probe();
    println!("Probed: {probed}");
    println!("Full 512-bit kernel set: {}", quickadc::check_compatibility());
    for width in WIDTHS {
        println!(
            "{:>8}: {} (runs as {})",
            width.to_string(),
            if width.is_supported() {
                "supported"
            } else {
                "unsupported"
            },
            width.clamp()
        );
    }
    Ok(())
}

fn main() -> io::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_max_level(if cli.verbose {
            LevelFilter::DEBUG
        } else {
            LevelFilter::INFO
        })
        .init();

    match cli.command {
        Command::Capability => capability(),
        Command::Distance(args) => distance::distance(args),
        Command::Adc(args) => adc::adc(args),
    }
}
