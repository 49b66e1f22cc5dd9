//! Per-query scorer configuration, loadable from JSON.

use std::{fs::File, io, path::Path};

use serde::{Deserialize, Serialize};

use crate::{VectorSimilarity, capability::InstructionSet};

/// How an [`crate::pq::AdcScorer`] chooses the quantization range of its table.
///
/// Ignored for codebooks small enough for exact float lookups.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuantizationMode {
    /// Span the full range between the best and worst achievable distances and quantize
    /// immediately. No candidate can saturate.
    FullRange,
    /// Score exactly until `invocation_threshold` candidates have been seen, then span the range
    /// between the best achievable and the worst observed distance. Candidates worse than any
    /// observed saturate and tie at the observed worst, so they never outrank a candidate inside
    /// the range. If no exactly scored candidate was worse than the best achievable distance the
    /// full range is used instead.
    #[default]
    Adaptive,
}

/// Configuration for scoring one query against product quantized codes.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdcConfig {
    /// Similarity used by [`crate::pq::AdcScorer`]. Backends score a dataset with the similarity
    /// stored alongside it instead.
    pub similarity: VectorSimilarity,
    /// Candidates to score exactly before switching to quantized lookups in adaptive mode.
    pub invocation_threshold: usize,
    pub quantization: QuantizationMode,
    /// Widest instruction set to use. Unset uses the best one the host supports.
    pub preferred_width: Option<InstructionSet>,
}

impl Default for AdcConfig {
    fn default() -> Self {
        Self {
            similarity: VectorSimilarity::Dot,
            invocation_threshold: 32,
            quantization: QuantizationMode::Adaptive,
            preferred_width: None,
        }
    }
}

impl AdcConfig {
    pub fn from_json(json: &[u8]) -> io::Result<Self> {
        Ok(serde_json::from_slice(json)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> io::Result<Self> {
        Ok(serde_json::from_reader(io::BufReader::new(File::open(
            path,
        )?))?)
    }

    pub fn to_json(&self) -> io::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Width to request from kernels, degraded to what the host supports.
    pub fn width(&self) -> InstructionSet {
        self.preferred_width
            .map(InstructionSet::clamp)
            .unwrap_or_default()
    }
}
