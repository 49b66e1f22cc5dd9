//! 16-bit fixed point compression of partial distance tables.
//!
//! Each partial value is stored as `q = clamp((v - anchor_m) / delta, 0, 65535)` where `anchor_m`
//! is the best value in codebook `m`. A sum of `M` quantized partials dequantizes as
//! `base + q * delta` with `base` the sum of the anchors. When `delta` is negative (larger values
//! are better) the division still yields non-negative offsets from the anchor.

use tracing::warn;

use crate::{
    Error, Result,
    error::ensure,
    pq::{MAX_QUANTIZED_CLUSTERS, PartialSums},
};

/// Row stride of a quantized table. Any cluster count up to 256 is addressable without reading
/// past a row; entries at or beyond the cluster count are zero.
pub const QUANTIZED_ROW_STRIDE: usize = MAX_QUANTIZED_CLUSTERS;

/// Scale and anchor used to map summed quantized values back to distances.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuantizationParams {
    /// Distance represented by one quantization step. Negative when larger values are better.
    pub delta: f32,
    /// Distance represented by a quantized sum of zero: the sum of per-codebook anchors.
    pub base: f32,
}

impl QuantizationParams {
    pub fn new(delta: f32, base: f32) -> Self {
        Self { delta, base }
    }

    /// Scale so that every sum between `best` and `worst` is representable.
    ///
    /// `best` and `worst` are sums of per-codebook extrema, so no in-range sum saturates.
    pub fn full_range(best: f32, worst: f32) -> Self {
        Self {
            delta: (worst - best) / u16::MAX as f32,
            base: best,
        }
    }

    /// Map a quantized sum, already widened to `f32`, back to a distance.
    #[inline]
    pub fn dequantize(&self, q: f32) -> f32 {
        self.base + q * self.delta
    }
}

/// Quantize `v` relative to `anchor`, rounding toward zero and clamping to `[0, 65535]`.
///
/// Returns 0 when `delta` is zero.
#[inline]
pub fn quantize(v: f32, anchor: f32, delta: f32) -> u16 {
    if delta == 0.0 {
        return 0;
    }
    // float to int casts truncate toward zero and saturate, mapping NaN to 0.
    ((v - anchor) / delta).clamp(0.0, u16::MAX as f32) as u16
}

/// Map a single quantized value back to a distance.
#[inline]
pub fn dequantize(q: u16, delta: f32, base: f32) -> f32 {
    base + q as f32 * delta
}

/// Quantize a table of `M` rows of partial values into `out`.
///
/// `bases` holds one anchor per row so `partials.len()` must be a multiple of `bases.len()`.
/// `out` holds the same number of rows, each at least as wide as a `partials` row; entries past
/// the end of a `partials` row are zeroed.
///
/// *Panics* if the shapes are inconsistent.
pub fn quantize_partials(delta: f32, partials: &[f32], bases: &[f32], out: &mut [u16]) {
    assert!(!bases.is_empty());
    assert_eq!(partials.len() % bases.len(), 0);
    assert_eq!(out.len() % bases.len(), 0);
    let in_stride = partials.len() / bases.len();
    let out_stride = out.len() / bases.len();
    assert!(out_stride >= in_stride);
    for ((row, base), out_row) in partials
        .chunks_exact(in_stride.max(1))
        .zip(bases.iter())
        .zip(out.chunks_exact_mut(out_stride.max(1)))
    {
        for (o, v) in out_row.iter_mut().zip(row.iter()) {
            *o = quantize(*v, *base, delta);
        }
        out_row[row.len()..].fill(0);
    }
}

/// A quantized partial distance table, `M` rows of [`QUANTIZED_ROW_STRIDE`] entries.
#[derive(Debug, Clone)]
pub struct QuantizedPartials {
    subspaces: usize,
    clusters: usize,
    table: Vec<u16>,
    params: QuantizationParams,
}

impl QuantizedPartials {
    /// Quantize `sums` given the worst distance a caller expects to score.
    ///
    /// The table is anchored at the best value of each codebook in `sums` and the scale is
    /// `(worst - best_distance) / 65535`. Sums worse than `worst` saturate and dequantize to
    /// `worst`. Fails with [`Error::IncompleteTable`] if any row of `sums` was never computed.
    pub fn new(sums: &PartialSums, worst: f32) -> Result<Self> {
        if let Some(codebook) = sums.first_missing() {
            return Err(Error::IncompleteTable { codebook });
        }
        let params = QuantizationParams::full_range(sums.best_distance(), worst);
        Ok(Self::from_anchored(
            sums.clusters(),
            sums.table(),
            sums.bests(),
            params,
        ))
    }

    /// Quantize `sums` so that no candidate can saturate.
    pub fn full_range(sums: &PartialSums) -> Result<Self> {
        Self::new(sums, sums.worst_distance())
    }

    pub(crate) fn from_anchored(
        clusters: usize,
        partials: &[f32],
        anchors: &[f32],
        params: QuantizationParams,
    ) -> Self {
        if params.delta == 0.0 || !params.delta.is_finite() {
            warn!(
                delta = params.delta,
                base = params.base,
                "degenerate quantization range; all candidates will score the same"
            );
        }
        let subspaces = anchors.len();
        let mut table = vec![0u16; subspaces * QUANTIZED_ROW_STRIDE];
        quantize_partials(params.delta, partials, anchors, &mut table);
        debug_assert_eq!(partials.len(), subspaces * clusters);
        Self {
            subspaces,
            clusters,
            table,
            params,
        }
    }

    /// Wrap an externally quantized table of `subspaces` rows of [`QUANTIZED_ROW_STRIDE`].
    pub fn from_raw(
        subspaces: usize,
        clusters: usize,
        table: Vec<u16>,
        params: QuantizationParams,
    ) -> Result<Self> {
        ensure((1..=MAX_QUANTIZED_CLUSTERS).contains(&clusters), || {
            format!("cluster count {clusters} not in [1, {MAX_QUANTIZED_CLUSTERS}]")
        })?;
        ensure(table.len() == subspaces * QUANTIZED_ROW_STRIDE, || {
            format!(
                "quantized table has {} entries, need {subspaces} rows of {QUANTIZED_ROW_STRIDE}",
                table.len()
            )
        })?;
        Ok(Self {
            subspaces,
            clusters,
            table,
            params,
        })
    }

    pub fn subspaces(&self) -> usize {
        self.subspaces
    }

    pub fn clusters(&self) -> usize {
        self.clusters
    }

    pub fn params(&self) -> QuantizationParams {
        self.params
    }

    pub fn row(&self, m: usize) -> &[u16] {
        &self.table[(m * QUANTIZED_ROW_STRIDE)..((m + 1) * QUANTIZED_ROW_STRIDE)]
    }

    pub fn as_slice(&self) -> &[u16] {
        &self.table
    }
}

#[cfg(test)]
mod test {
    use super::{QuantizationParams, QuantizedPartials, dequantize, quantize, quantize_partials};
    use crate::{
        Error, VectorSimilarity,
        capability::InstructionSet,
        pq::{Codebooks, PartialSums},
        test::{assert_float_near, random_codebooks, random_vector, test_rng},
    };

    #[test]
    fn quantize_clamps_and_truncates() {
        assert_eq!(quantize(1.0, 0.0, 0.0), 0);
        assert_eq!(quantize(2.9, 0.0, 1.0), 2);
        assert_eq!(quantize(-3.0, 0.0, 1.0), 0);
        assert_eq!(quantize(1e9, 0.0, 1.0), u16::MAX);
        // larger is better: values below the anchor map to positive offsets.
        assert_eq!(quantize(0.5, 1.0, -0.25), 2);
        assert_eq!(quantize(1.5, 1.0, -0.25), 0);
        assert_eq!(quantize(f32::NAN, 0.0, 1.0), 0);
    }

    #[test]
    fn round_trip_within_delta() {
        let mut rng = test_rng();
        let values = random_vector(&mut rng, 1000);
        let (best, worst) = (-1.0f32, 1.0f32);
        let params = QuantizationParams::full_range(best, worst);
        for v in values {
            let d = dequantize(quantize(v, best, params.delta), params.delta, params.base);
            assert!(
                (v - d).abs() <= params.delta.abs() * 1.01,
                "{v} dequantized to {d}"
            );
        }
        let params = QuantizationParams::full_range(1.0, -1.0);
        assert!(params.delta < 0.0);
        let d = params.dequantize(quantize(0.25, 1.0, params.delta) as f32);
        assert_float_near!(0.25, d, 1e-3);
    }

    #[test]
    fn padded_rows() {
        let partials = [1.0f32, 2.0, 3.0, 10.0, 20.0, 30.0];
        let bases = [1.0f32, 10.0];
        let mut out = [u16::MAX; 8];
        quantize_partials(1.0, &partials, &bases, &mut out);
        assert_eq!(out, [0, 1, 2, 0, 0, 10, 20, 0]);
    }

    #[test]
    fn full_range_never_saturates() {
        let mut rng = test_rng();
        let books = random_codebooks(&mut rng, 8, 64, 4);
        let query = random_vector(&mut rng, books.dimensions());
        for similarity in [VectorSimilarity::Dot, VectorSimilarity::Euclidean] {
            let sums = PartialSums::new(&books, &query, similarity, InstructionSet::default())
                .unwrap();
            let quantized = QuantizedPartials::full_range(&sums).unwrap();
            let total = (0..books.subspaces())
                .map(|m| quantized.row(m).iter().copied().max().unwrap() as u32)
                .sum::<u32>();
            assert!(total <= u16::MAX as u32 + books.subspaces() as u32);
            for m in 0..books.subspaces() {
                assert!(quantized.row(m)[books.clusters()..].iter().all(|q| *q == 0));
            }
        }
    }

    #[test]
    fn incomplete_table() {
        let books = Codebooks::new(2, 4, 1, vec![0.0; 8]).unwrap();
        let mut sums = PartialSums::empty(&books, VectorSimilarity::Dot);
        sums.fill_codebook(&books, &[1.0, 1.0], 0, InstructionSet::Scalar)
            .unwrap();
        assert_eq!(
            QuantizedPartials::full_range(&sums).unwrap_err(),
            Error::IncompleteTable { codebook: 1 }
        );
        sums.fill_codebook(&books, &[1.0, 1.0], 1, InstructionSet::Scalar)
            .unwrap();
        assert!(QuantizedPartials::full_range(&sums).is_ok());
    }

    #[test]
    fn from_raw_checks_layout() {
        let params = QuantizationParams::new(1.0, 0.0);
        assert!(QuantizedPartials::from_raw(2, 16, vec![0; 512], params).is_ok());
        assert!(QuantizedPartials::from_raw(2, 16, vec![0; 511], params).is_err());
        assert!(QuantizedPartials::from_raw(2, 300, vec![0; 512], params).is_err());
    }
}
