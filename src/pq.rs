//! Product quantization tables and the Quick ADC lookup engine.
//!
//! A vector of `D` dimensions is split into `M` sub-vectors of `D' = D / M` dimensions, and each
//! sub-vector is replaced by the index of its nearest centroid in a per-subspace codebook of `C`
//! centroids. Scoring a query against a code is then a sum of `M` table lookups.
//!
//! Codes are scored in batches of [`BATCH_SIZE`] candidates laid out codebook-major: byte
//! `m * BATCH_SIZE + lane` holds the cluster index of candidate `lane` in codebook `m`.

mod codebooks;
pub mod gather;
pub mod lookup;
mod partial_sums;
mod quantization;
mod scorer;

pub use codebooks::{Codebooks, MagnitudeTable};
pub use lookup::FloatLookupTable;
pub use partial_sums::{PartialSums, calculate_partial_sums, calculate_partial_sums_best};
pub use quantization::{
    QUANTIZED_ROW_STRIDE, QuantizationParams, QuantizedPartials, dequantize, quantize,
    quantize_partials,
};
pub use scorer::AdcScorer;

/// Number of candidates scored by one lookup call.
pub const BATCH_SIZE: usize = 32;
/// Largest cluster count addressable by the quantized lookup engine.
pub const MAX_QUANTIZED_CLUSTERS: usize = 256;
/// Largest cluster count addressable by the float lookup engine.
pub const MAX_FLOAT_CLUSTERS: usize = 32;
