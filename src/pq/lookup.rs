//! Bulk scoring of transposed PQ batches with in-register table lookups.
//!
//! Quantized mode handles up to 256 clusters per codebook. Each codebook row is 256 `u16`
//! entries; every candidate's entry is read with four two-source permutes, each covering a 64
//! entry window addressed by the low 6 bits of the cluster index, and then a two level
//! [`selection::select_tree`] keyed on index bits 6 and 7 picks the right window. Lookups are
//! accumulated with saturating `u16` addition, widened to `f32`, dequantized and normalized.
//!
//! Float mode handles up to 32 clusters: a single two-source permute over a 32 entry `f32` row
//! reads each candidate's partial directly.
//!
//! AVX-512 kernels are used when the requested and supported width is 512 bits; otherwise the
//! portable kernels compute the same values.

mod portable;
pub mod selection;
#[cfg(target_arch = "x86_64")]
mod x86_64;

use crate::{
    Error, Result, VectorSimilarity,
    capability::InstructionSet,
    error::ensure,
    pq::{
        BATCH_SIZE, MAX_FLOAT_CLUSTERS, MAX_QUANTIZED_CLUSTERS, PartialSums, QUANTIZED_ROW_STRIDE,
        QuantizationParams, QuantizedPartials,
    },
};

/// A table of unquantized partials for codebooks of at most 32 clusters, `M` rows of
/// [`MAX_FLOAT_CLUSTERS`] entries.
#[derive(Debug, Clone)]
pub struct FloatLookupTable {
    subspaces: usize,
    clusters: usize,
    table: Vec<f32>,
}

impl FloatLookupTable {
    /// Copy a complete partial sums table into the padded float layout.
    pub fn new(sums: &PartialSums) -> Result<Self> {
        if let Some(codebook) = sums.first_missing() {
            return Err(Error::IncompleteTable { codebook });
        }
        check_float_clusters(sums.clusters())?;
        let mut table = vec![0.0f32; sums.subspaces() * MAX_FLOAT_CLUSTERS];
        for (m, row) in table.chunks_exact_mut(MAX_FLOAT_CLUSTERS).enumerate() {
            row[..sums.clusters()].copy_from_slice(sums.row(m));
        }
        Ok(Self {
            subspaces: sums.subspaces(),
            clusters: sums.clusters(),
            table,
        })
    }

    /// Wrap a table already laid out as `subspaces` rows of [`MAX_FLOAT_CLUSTERS`].
    pub fn from_raw(subspaces: usize, clusters: usize, table: Vec<f32>) -> Result<Self> {
        check_float_clusters(clusters)?;
        ensure(table.len() == subspaces * MAX_FLOAT_CLUSTERS, || {
            format!(
                "float table has {} entries, need {subspaces} rows of {MAX_FLOAT_CLUSTERS}",
                table.len()
            )
        })?;
        Ok(Self {
            subspaces,
            clusters,
            table,
        })
    }

    pub fn subspaces(&self) -> usize {
        self.subspaces
    }

    pub fn clusters(&self) -> usize {
        self.clusters
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.table
    }
}

fn check_float_clusters(clusters: usize) -> Result<()> {
    ensure((1..=MAX_FLOAT_CLUSTERS).contains(&clusters), || {
        format!("cluster count {clusters} not in [1, {MAX_FLOAT_CLUSTERS}] for float lookup")
    })
}

/// Fails unless `shuffles` holds `subspaces` rows of [`BATCH_SIZE`] indices all below `clusters`.
pub(crate) fn check_shuffles(shuffles: &[u8], subspaces: usize, clusters: usize) -> Result<()> {
    ensure(clusters <= MAX_QUANTIZED_CLUSTERS, || {
        format!("cluster count {clusters} exceeds {MAX_QUANTIZED_CLUSTERS}")
    })?;
    ensure(shuffles.len() == subspaces * BATCH_SIZE, || {
        format!(
            "batch has {} codes, need {subspaces} rows of {BATCH_SIZE}",
            shuffles.len()
        )
    })?;
    match shuffles.iter().position(|c| *c as usize >= clusters) {
        Some(i) => Err(Error::invalid(format!(
            "cluster index {} for candidate {} in codebook {} exceeds cluster count {clusters}",
            shuffles[i],
            i % BATCH_SIZE,
            i / BATCH_SIZE
        ))),
        None => Ok(()),
    }
}

#[cfg(target_arch = "x86_64")]
#[inline]
fn use_avx512(width: InstructionSet) -> bool {
    width.clamp() == InstructionSet::Width512
}

/// Score a batch against a float table.
///
/// `Cosine` is not supported since float tables carry no magnitudes.
pub fn bulk_shuffle(
    shuffles: &[u8],
    table: &FloatLookupTable,
    similarity: VectorSimilarity,
    out: &mut [f32; BATCH_SIZE],
    width: InstructionSet,
) -> Result<()> {
    if similarity == VectorSimilarity::Cosine {
        return Err(Error::Unsupported(
            "cosine scoring requires a quantized table with magnitudes",
        ));
    }
    check_shuffles(shuffles, table.subspaces(), table.clusters())?;
    float_kernel(shuffles, table.as_slice(), similarity, out, width);
    Ok(())
}

/// Unchecked float lookup. Callers validate shapes and cluster indices.
#[cfg_attr(not(target_arch = "x86_64"), allow(unused_variables))]
pub(crate) fn float_kernel(
    shuffles: &[u8],
    table: &[f32],
    similarity: VectorSimilarity,
    out: &mut [f32; BATCH_SIZE],
    width: InstructionSet,
) {
    debug_assert!(table.len() >= shuffles.len() / BATCH_SIZE * MAX_FLOAT_CLUSTERS);
    #[cfg(target_arch = "x86_64")]
    if use_avx512(width) {
        // SAFETY: avx512 support was probed and shapes were checked by the caller.
        unsafe { x86_64::bulk_float(shuffles, table, similarity, out) };
        return;
    }
    let sums = portable::float_sums(shuffles, table);
    for (o, s) in out.iter_mut().zip(sums) {
        *o = similarity.score(s);
    }
}

/// Score a batch against a quantized table.
///
/// `Cosine` requires magnitudes; use [`bulk_quantized_shuffle_cosine`].
pub fn bulk_quantized_shuffle(
    shuffles: &[u8],
    table: &QuantizedPartials,
    similarity: VectorSimilarity,
    out: &mut [f32; BATCH_SIZE],
    width: InstructionSet,
) -> Result<()> {
    if similarity == VectorSimilarity::Cosine {
        return Err(Error::Unsupported(
            "cosine scoring requires a magnitude table",
        ));
    }
    check_shuffles(shuffles, table.subspaces(), table.clusters())?;
    quantized_kernel(
        shuffles,
        table.as_slice(),
        table.params(),
        similarity,
        out,
        width,
    );
    Ok(())
}

/// Unchecked quantized lookup. Callers validate shapes and cluster indices.
#[cfg_attr(not(target_arch = "x86_64"), allow(unused_variables))]
pub(crate) fn quantized_kernel(
    shuffles: &[u8],
    table: &[u16],
    params: QuantizationParams,
    similarity: VectorSimilarity,
    out: &mut [f32; BATCH_SIZE],
    width: InstructionSet,
) {
    debug_assert!(table.len() >= shuffles.len() / BATCH_SIZE * QUANTIZED_ROW_STRIDE);
    #[cfg(target_arch = "x86_64")]
    if use_avx512(width) {
        // SAFETY: avx512 support was probed and shapes were checked by the caller.
        unsafe { x86_64::bulk_quantized(shuffles, table, params, similarity, out) };
        return;
    }
    let sums = portable::quantized_sums(shuffles, table);
    for (o, s) in out.iter_mut().zip(sums) {
        *o = similarity.score(params.dequantize(s as f32));
    }
}

/// Score a batch with cosine similarity.
///
/// `table` holds quantized dot product partials and `magnitudes` the quantized squared centroid
/// magnitudes of the same codebooks (see [`crate::pq::Codebooks::magnitudes`]). Both are
/// dequantized with their own parameters before computing `dot / sqrt(mag * query_mag)`.
pub fn bulk_quantized_shuffle_cosine(
    shuffles: &[u8],
    table: &QuantizedPartials,
    magnitudes: &QuantizedPartials,
    query_magnitude_squared: f32,
    out: &mut [f32; BATCH_SIZE],
    width: InstructionSet,
) -> Result<()> {
    ensure(
        table.subspaces() == magnitudes.subspaces() && table.clusters() == magnitudes.clusters(),
        || {
            format!(
                "partials are {}x{} but magnitudes are {}x{}",
                table.subspaces(),
                table.clusters(),
                magnitudes.subspaces(),
                magnitudes.clusters()
            )
        },
    )?;
    check_shuffles(shuffles, table.subspaces(), table.clusters())?;
    quantized_cosine_kernel(
        shuffles,
        table.as_slice(),
        table.params(),
        magnitudes.as_slice(),
        magnitudes.params(),
        query_magnitude_squared,
        out,
        width,
    );
    Ok(())
}

/// Unchecked quantized cosine lookup. Callers validate shapes and cluster indices.
#[allow(clippy::too_many_arguments)]
#[cfg_attr(not(target_arch = "x86_64"), allow(unused_variables))]
pub(crate) fn quantized_cosine_kernel(
    shuffles: &[u8],
    table: &[u16],
    params: QuantizationParams,
    magnitudes: &[u16],
    magnitude_params: QuantizationParams,
    query_magnitude_squared: f32,
    out: &mut [f32; BATCH_SIZE],
    width: InstructionSet,
) {
    #[cfg(target_arch = "x86_64")]
    if use_avx512(width) {
        // SAFETY: avx512 support was probed and shapes were checked by the caller.
        unsafe {
            x86_64::bulk_quantized_cosine(
                shuffles,
                table,
                params,
                magnitudes,
                magnitude_params,
                query_magnitude_squared,
                out,
            )
        };
        return;
    }
    let dots = portable::quantized_sums(shuffles, table);
    let mags = portable::quantized_sums(shuffles, magnitudes);
    for ((o, d), m) in out.iter_mut().zip(dots).zip(mags) {
        *o = VectorSimilarity::cosine_score(
            params.dequantize(d as f32),
            magnitude_params.dequantize(m as f32),
            query_magnitude_squared,
        );
    }
}
