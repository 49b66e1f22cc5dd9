use tracing::debug;

use crate::{
    AdcConfig, QuantizationMode, Result, VectorSimilarity,
    capability::InstructionSet,
    pq::{
        BATCH_SIZE, Codebooks, MAX_FLOAT_CLUSTERS, PartialSums, QuantizationParams,
        QuantizedPartials,
        gather::{assemble_and_sum, assemble_batch, assemble_batch_cosine},
        lookup::{
            FloatLookupTable, check_shuffles, float_kernel, quantized_cosine_kernel,
            quantized_kernel,
        },
    },
};

/// Scores transposed batches of codes against a single query.
///
/// In [`QuantizationMode::Adaptive`] the scorer sums exact partials for the first batches and
/// tracks the worst distance it observes. Once `invocation_threshold` candidates have been
/// scored it quantizes the table between the best achievable and the worst observed distance
/// and scores every later batch with the quantized lookup engine. Search tends to converge on
/// good candidates quickly, so the observed range is usually much tighter than the full one.
///
/// In [`QuantizationMode::FullRange`] the table is quantized up front.
///
/// Codebooks of at most [`MAX_FLOAT_CLUSTERS`] clusters scored with `Dot` or `Euclidean` fit a
/// whole row in a single permute of unquantized partials, so they are always scored exactly with
/// the float lookup engine and the quantization mode does not apply.
pub struct AdcScorer<'a> {
    codebooks: &'a Codebooks,
    sums: PartialSums,
    float: Option<FloatLookupTable>,
    quantized: Option<QuantizedPartials>,
    similarity: VectorSimilarity,
    width: InstructionSet,
    invocation_threshold: usize,
    invocations: usize,
    worst_seen: f32,
}

impl<'a> AdcScorer<'a> {
    pub fn new(codebooks: &'a Codebooks, query: &[f32], config: &AdcConfig) -> Result<Self> {
        let width = config.width();
        let sums = PartialSums::new(codebooks, query, config.similarity, width)?;
        let float = if sums.clusters() <= MAX_FLOAT_CLUSTERS
            && config.similarity != VectorSimilarity::Cosine
        {
            Some(FloatLookupTable::new(&sums)?)
        } else {
            None
        };
        let quantized = match config.quantization {
            QuantizationMode::FullRange if float.is_none() => {
                Some(QuantizedPartials::full_range(&sums)?)
            }
            _ => None,
        };
        let worst_seen = sums.best_distance();
        Ok(Self {
            codebooks,
            sums,
            float,
            quantized,
            similarity: config.similarity,
            width,
            invocation_threshold: config.invocation_threshold,
            invocations: 0,
            worst_seen,
        })
    }

    pub fn similarity(&self) -> VectorSimilarity {
        self.similarity
    }

    pub fn partial_sums(&self) -> &PartialSums {
        &self.sums
    }

    /// Parameters of the quantized table, once one has been built.
    pub fn quantization_params(&self) -> Option<QuantizationParams> {
        self.quantized.as_ref().map(QuantizedPartials::params)
    }

    /// Returns true once batches are scored with quantized lookups.
    pub fn is_quantized(&self) -> bool {
        self.quantized.is_some()
    }

    /// Returns true if batches are scored exactly from a float lookup table.
    pub fn uses_float_table(&self) -> bool {
        self.float.is_some()
    }

    /// Number of candidates scored exactly so far.
    pub fn invocations(&self) -> usize {
        self.invocations
    }

    /// Score a single code exactly.
    pub fn score_code(&self, code: &[u8]) -> f32 {
        let dot = assemble_and_sum(self.sums.table(), self.sums.clusters(), code);
        match self.similarity {
            VectorSimilarity::Cosine => VectorSimilarity::cosine_score(
                dot,
                assemble_and_sum(
                    self.codebooks.magnitudes().partials(),
                    self.sums.clusters(),
                    code,
                ),
                self.sums.query_magnitude_squared(),
            ),
            s => s.score(dot),
        }
    }

    /// Score a transposed batch of [`BATCH_SIZE`] candidates into `out`.
    ///
    /// Padding lanes are scored like any other candidate and count toward the threshold.
    pub fn score_batch(&mut self, shuffles: &[u8], out: &mut [f32; BATCH_SIZE]) -> Result<()> {
        check_shuffles(shuffles, self.sums.subspaces(), self.sums.clusters())?;
        if let Some(table) = self.float.as_ref() {
            float_kernel(shuffles, table.as_slice(), self.similarity, out, self.width);
            return Ok(());
        }
        if let Some(quantized) = self.quantized.as_ref() {
            match self.similarity {
                VectorSimilarity::Cosine => {
                    let magnitudes = self.codebooks.magnitudes().quantized();
                    quantized_cosine_kernel(
                        shuffles,
                        quantized.as_slice(),
                        quantized.params(),
                        magnitudes.as_slice(),
                        magnitudes.params(),
                        self.sums.query_magnitude_squared(),
                        out,
                        self.width,
                    )
                }
                s => quantized_kernel(
                    shuffles,
                    quantized.as_slice(),
                    quantized.params(),
                    s,
                    out,
                    self.width,
                ),
            }
            return Ok(());
        }

        self.gather_batch(shuffles, out);
        self.invocations += BATCH_SIZE;
        if self.invocations >= self.invocation_threshold {
            let quantized = if self.observed_range_is_empty() {
                debug!(
                    invocations = self.invocations,
                    best = self.sums.best_distance(),
                    "no candidate scored below the best distance; quantizing the full range"
                );
                QuantizedPartials::full_range(&self.sums)?
            } else {
                debug!(
                    invocations = self.invocations,
                    best = self.sums.best_distance(),
                    worst = self.worst_seen,
                    "switching to quantized lookups"
                );
                QuantizedPartials::new(&self.sums, self.worst_seen)?
            };
            self.quantized = Some(quantized);
        }
        Ok(())
    }

    /// True if no exactly scored candidate was worse than the best achievable distance.
    fn observed_range_is_empty(&self) -> bool {
        let best = self.sums.best_distance();
        if self.similarity.larger_is_better() {
            self.worst_seen >= best
        } else {
            self.worst_seen <= best
        }
    }

    fn gather_batch(&mut self, shuffles: &[u8], out: &mut [f32; BATCH_SIZE]) {
        let clusters = self.sums.clusters();
        let larger_is_better = self.similarity.larger_is_better();
        let mut raw = [0.0f32; BATCH_SIZE];
        let mut mags = [0.0f32; BATCH_SIZE];
        if self.similarity == VectorSimilarity::Cosine {
            assemble_batch_cosine(
                self.sums.table(),
                self.codebooks.magnitudes().partials(),
                clusters,
                shuffles,
                &mut raw,
                &mut mags,
            );
        } else {
            assemble_batch(self.sums.table(), clusters, shuffles, &mut raw);
        }
        for (lane, r) in raw.iter().enumerate() {
            self.worst_seen = if larger_is_better {
                self.worst_seen.min(*r)
            } else {
                self.worst_seen.max(*r)
            };
            out[lane] = match self.similarity {
                VectorSimilarity::Cosine => VectorSimilarity::cosine_score(
                    *r,
                    mags[lane],
                    self.sums.query_magnitude_squared(),
                ),
                s => s.score(*r),
            };
        }
    }
}
