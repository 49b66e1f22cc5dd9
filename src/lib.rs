//! Quick ADC kernels for product-quantized vector search.
//!
//! This crate is the scoring core of a vector search engine. It provides raw `f32` distance
//! primitives that run at the widest vector width the host supports, and a lookup engine that
//! scores batches of 32 product-quantized (PQ) candidates against a query using precomputed
//! query-to-centroid tables, optionally compressed to 16-bit fixed point.
//!
//! A typical query flow:
//! 1. Build a [`pq::PartialSums`] table for the query against a set of [`pq::Codebooks`].
//! 2. Quantize it into [`pq::QuantizedPartials`] (or use a [`pq::FloatLookupTable`] for small
//!    codebooks).
//! 3. Score transposed batches of candidate codes with the functions in [`pq::lookup`], or let a
//!    [`pq::AdcScorer`] decide when to switch from exact gathering to quantized lookups.
//! 4. Rerank the best candidates against their raw vectors with [`multi`].

pub mod backend;
pub mod capability;
pub mod config;
pub mod distance;
mod error;
pub mod ffi;
pub mod input;
pub mod multi;
pub mod ops;
pub mod pq;
#[cfg(test)]
mod test;

use std::{fmt, io, str::FromStr};

use serde::{Deserialize, Serialize};

pub use capability::{InstructionSet, check_compatibility, probe};
pub use config::{AdcConfig, QuantizationMode};
pub use error::{Error, Result};

/// Functions used to compute the similarity between two vectors.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VectorSimilarity {
    /// Euclidean (l2) distance, squared.
    ///
    /// Scores are `1 / (1 + d)` so that closer vectors score higher.
    Euclidean,
    /// Dot product.
    ///
    /// Input vectors are expected to be l2 normalized; scores are `(1 + dot) / 2`.
    #[default]
    Dot,
    /// Cosine similarity.
    ///
    /// Product quantized cosine needs a second table of centroid magnitudes to normalize the
    /// reconstructed dot product. Scores are `(1 + cos) / 2`.
    Cosine,
}

impl VectorSimilarity {
    /// Return an iterator over all similarity functions.
    pub fn all() -> impl ExactSizeIterator<Item = VectorSimilarity> {
        [
            VectorSimilarity::Euclidean,
            VectorSimilarity::Dot,
            VectorSimilarity::Cosine,
        ]
        .into_iter()
    }

    /// Convert a raw dot product or squared l2 distance into a score where larger values are
    /// better matches.
    ///
    /// For `Cosine` the input is expected to already be divided by the vector magnitudes.
    #[inline]
    pub fn score(self, raw: f32) -> f32 {
        match self {
            Self::Dot | Self::Cosine => (1.0 + raw) / 2.0,
            Self::Euclidean => 1.0 / (1.0 + raw),
        }
    }

    /// Compute a cosine score from an unnormalized dot product, the squared magnitude of the
    /// document and the squared magnitude of the query.
    #[inline]
    pub fn cosine_score(dot: f32, magnitude_squared: f32, query_magnitude_squared: f32) -> f32 {
        Self::Cosine.score(dot / (magnitude_squared * query_magnitude_squared).sqrt())
    }

    /// Returns true if a larger partial value is a better match.
    ///
    /// This decides which extremum anchors each codebook when quantizing partial distances.
    pub fn larger_is_better(self) -> bool {
        self != Self::Euclidean
    }
}

impl FromStr for VectorSimilarity {
    type Err = io::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "euclidean" | "l2" => Ok(VectorSimilarity::Euclidean),
            "cosine" | "cos" => Ok(VectorSimilarity::Cosine),
            "dot" => Ok(VectorSimilarity::Dot),
            x => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unknown similarity function {x}"),
            )),
        }
    }
}

impl fmt::Display for VectorSimilarity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Euclidean => write!(f, "l2"),
            Self::Cosine => write!(f, "cos"),
            Self::Dot => write!(f, "dot"),
        }
    }
}
