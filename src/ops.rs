//! Flat, bounds checked entry points over caller owned buffers.
//!
//! Every function here takes plain slices plus the offsets, counts and strides a caller outside
//! of Rust would pass, validates that they describe memory inside the slices, and then runs the
//! same kernels as the typed API. Width dependent calls take a preferred width in bits that is
//! degraded to what the host supports.
//!
//! Lookup entry points score exactly [`BATCH_SIZE`] candidates per call. Quantized tables are
//! `codebook_count` rows of [`QUANTIZED_ROW_STRIDE`] entries; float tables are rows of
//! [`MAX_FLOAT_CLUSTERS`] entries.

use crate::{
    Error, Result, VectorSimilarity,
    capability::{self, InstructionSet},
    distance, multi,
    error::ensure,
    pq::{
        self, BATCH_SIZE, MAX_FLOAT_CLUSTERS, MAX_QUANTIZED_CLUSTERS, QUANTIZED_ROW_STRIDE,
        QuantizationParams,
        lookup::{check_shuffles, float_kernel, quantized_cosine_kernel, quantized_kernel},
    },
};

/// Returns true if the host supports the full 512-bit kernel set.
pub fn check_compatibility() -> bool {
    capability::check_compatibility()
}

fn range<'a, T>(buf: &'a [T], offset: usize, len: usize, what: &str) -> Result<&'a [T]> {
    offset
        .checked_add(len)
        .and_then(|end| buf.get(offset..end))
        .ok_or_else(|| {
            Error::invalid(format!(
                "{what}[{offset}..+{len}] out of bounds for length {}",
                buf.len()
            ))
        })
}

fn batch_out(results: &mut [f32]) -> Result<&mut [f32; BATCH_SIZE]> {
    let len = results.len();
    results
        .get_mut(..BATCH_SIZE)
        .and_then(|r| r.try_into().ok())
        .ok_or_else(|| {
            Error::invalid(format!("results hold {len} values, need {BATCH_SIZE}"))
        })
}

fn check_table_rows<T>(table: &[T], codebook_count: usize, stride: usize, what: &str) -> Result<()> {
    ensure(
        codebook_count
            .checked_mul(stride)
            .is_some_and(|n| table.len() >= n),
        || {
            format!(
                "{what} holds {} entries, need {codebook_count} rows of {stride}",
                table.len()
            )
        },
    )
}

/// Raw dot product of `a[aoffset..aoffset + length]` and `b[boffset..boffset + length]`.
pub fn dot_product(
    preferred_bits: usize,
    a: &[f32],
    aoffset: usize,
    b: &[f32],
    boffset: usize,
    length: usize,
) -> Result<f32> {
    Ok(distance::dot(
        range(a, aoffset, length, "a")?,
        range(b, boffset, length, "b")?,
        InstructionSet::from_bits(preferred_bits),
    ))
}

/// Raw squared l2 distance of `a[aoffset..aoffset + length]` and `b[boffset..boffset + length]`.
pub fn euclidean(
    preferred_bits: usize,
    a: &[f32],
    aoffset: usize,
    b: &[f32],
    boffset: usize,
    length: usize,
) -> Result<f32> {
    Ok(distance::l2sq(
        range(a, aoffset, length, "a")?,
        range(b, boffset, length, "b")?,
        InstructionSet::from_bits(preferred_bits),
    ))
}

struct PartialSumsArgs<'a> {
    codebook: &'a [f32],
    codebook_index: usize,
    sub_dim: usize,
    cluster_count: usize,
    query: &'a [f32],
    query_offset: usize,
}

impl PartialSumsArgs<'_> {
    fn check(&self, out: &[f32]) -> Result<()> {
        ensure(self.sub_dim > 0, || "sub_dim must be positive".into())?;
        ensure(
            (1..=MAX_QUANTIZED_CLUSTERS).contains(&self.cluster_count),
            || {
                format!(
                    "cluster count {} not in [1, {MAX_QUANTIZED_CLUSTERS}]",
                    self.cluster_count
                )
            },
        )?;
        range(self.codebook, 0, self.cluster_count * self.sub_dim, "codebook")?;
        range(self.query, self.query_offset, self.sub_dim, "query")?;
        range(
            out,
            self.codebook_index * self.cluster_count,
            self.cluster_count,
            "partial_sums",
        )?;
        Ok(())
    }

    fn run(&self, similarity: VectorSimilarity, out: &mut [f32]) -> Result<()> {
        self.check(out)?;
        pq::calculate_partial_sums(
            self.codebook,
            self.codebook_index,
            self.sub_dim,
            self.cluster_count,
            self.query,
            self.query_offset,
            similarity,
            out,
            InstructionSet::default(),
        );
        Ok(())
    }

    fn run_best(
        &self,
        similarity: VectorSimilarity,
        out: &mut [f32],
        out_best: &mut [f32],
    ) -> Result<()> {
        self.check(out)?;
        ensure(self.codebook_index < out_best.len(), || {
            format!(
                "best partials hold {} values, need index {}",
                out_best.len(),
                self.codebook_index
            )
        })?;
        pq::calculate_partial_sums_best(
            self.codebook,
            self.codebook_index,
            self.sub_dim,
            self.cluster_count,
            self.query,
            self.query_offset,
            similarity,
            out,
            out_best,
            InstructionSet::default(),
        );
        Ok(())
    }
}

/// Fill row `codebook_index` of `partial_sums` with the dot product of the query sub-vector at
/// `query_offset` against each of `cluster_count` centroids of `sub_dim` dimensions.
pub fn calculate_partial_sums_dot(
    codebook: &[f32],
    codebook_index: usize,
    sub_dim: usize,
    cluster_count: usize,
    query: &[f32],
    query_offset: usize,
    partial_sums: &mut [f32],
) -> Result<()> {
    PartialSumsArgs {
        codebook,
        codebook_index,
        sub_dim,
        cluster_count,
        query,
        query_offset,
    }
    .run(VectorSimilarity::Dot, partial_sums)
}

/// As [`calculate_partial_sums_dot`] with squared l2 distances.
pub fn calculate_partial_sums_euclidean(
    codebook: &[f32],
    codebook_index: usize,
    sub_dim: usize,
    cluster_count: usize,
    query: &[f32],
    query_offset: usize,
    partial_sums: &mut [f32],
) -> Result<()> {
    PartialSumsArgs {
        codebook,
        codebook_index,
        sub_dim,
        cluster_count,
        query,
        query_offset,
    }
    .run(VectorSimilarity::Euclidean, partial_sums)
}

/// As [`calculate_partial_sums_dot`], also writing the row maximum to
/// `partial_best[codebook_index]`.
#[allow(clippy::too_many_arguments)]
pub fn calculate_partial_sums_best_dot(
    codebook: &[f32],
    codebook_index: usize,
    sub_dim: usize,
    cluster_count: usize,
    query: &[f32],
    query_offset: usize,
    partial_sums: &mut [f32],
    partial_best: &mut [f32],
) -> Result<()> {
    PartialSumsArgs {
        codebook,
        codebook_index,
        sub_dim,
        cluster_count,
        query,
        query_offset,
    }
    .run_best(VectorSimilarity::Dot, partial_sums, partial_best)
}

/// As [`calculate_partial_sums_euclidean`], also writing the row minimum to
/// `partial_best[codebook_index]`.
#[allow(clippy::too_many_arguments)]
pub fn calculate_partial_sums_best_euclidean(
    codebook: &[f32],
    codebook_index: usize,
    sub_dim: usize,
    cluster_count: usize,
    query: &[f32],
    query_offset: usize,
    partial_sums: &mut [f32],
    partial_best: &mut [f32],
) -> Result<()> {
    PartialSumsArgs {
        codebook,
        codebook_index,
        sub_dim,
        cluster_count,
        query,
        query_offset,
    }
    .run_best(VectorSimilarity::Euclidean, partial_sums, partial_best)
}

fn bulk_shuffle(
    shuffles: &[u8],
    codebook_count: usize,
    partials: &[f32],
    similarity: VectorSimilarity,
    results: &mut [f32],
) -> Result<()> {
    check_shuffles(shuffles, codebook_count, MAX_FLOAT_CLUSTERS)?;
    check_table_rows(partials, codebook_count, MAX_FLOAT_CLUSTERS, "partials")?;
    float_kernel(
        shuffles,
        partials,
        similarity,
        batch_out(results)?,
        InstructionSet::default(),
    );
    Ok(())
}

/// Score 32 candidates against float partials laid out as rows of 32, writing normalized dot
/// product scores to `results`.
pub fn bulk_shuffle_dot(
    shuffles: &[u8],
    codebook_count: usize,
    partials: &[f32],
    results: &mut [f32],
) -> Result<()> {
    bulk_shuffle(shuffles, codebook_count, partials, VectorSimilarity::Dot, results)
}

/// Score 32 candidates against float partials laid out as rows of 32, writing normalized
/// Euclidean scores to `results`.
pub fn bulk_shuffle_euclidean(
    shuffles: &[u8],
    codebook_count: usize,
    partials: &[f32],
    results: &mut [f32],
) -> Result<()> {
    bulk_shuffle(
        shuffles,
        codebook_count,
        partials,
        VectorSimilarity::Euclidean,
        results,
    )
}

fn bulk_quantized_shuffle(
    shuffles: &[u8],
    codebook_count: usize,
    quantized_partials: &[u16],
    params: QuantizationParams,
    similarity: VectorSimilarity,
    results: &mut [f32],
) -> Result<()> {
    check_shuffles(shuffles, codebook_count, MAX_QUANTIZED_CLUSTERS)?;
    check_table_rows(
        quantized_partials,
        codebook_count,
        QUANTIZED_ROW_STRIDE,
        "quantized partials",
    )?;
    quantized_kernel(
        shuffles,
        quantized_partials,
        params,
        similarity,
        batch_out(results)?,
        InstructionSet::default(),
    );
    Ok(())
}

/// Score 32 candidates against quantized dot product partials, dequantizing sums as
/// `base + q * delta`.
pub fn bulk_quantized_shuffle_dot(
    shuffles: &[u8],
    codebook_count: usize,
    quantized_partials: &[u16],
    delta: f32,
    base: f32,
    results: &mut [f32],
) -> Result<()> {
    bulk_quantized_shuffle(
        shuffles,
        codebook_count,
        quantized_partials,
        QuantizationParams::new(delta, base),
        VectorSimilarity::Dot,
        results,
    )
}

/// Score 32 candidates against quantized squared l2 partials.
pub fn bulk_quantized_shuffle_euclidean(
    shuffles: &[u8],
    codebook_count: usize,
    quantized_partials: &[u16],
    delta: f32,
    base: f32,
    results: &mut [f32],
) -> Result<()> {
    bulk_quantized_shuffle(
        shuffles,
        codebook_count,
        quantized_partials,
        QuantizationParams::new(delta, base),
        VectorSimilarity::Euclidean,
        results,
    )
}

/// Score 32 candidates with cosine similarity from quantized dot product partials and quantized
/// centroid squared magnitudes, each with its own `delta` and `base`.
#[allow(clippy::too_many_arguments)]
pub fn bulk_quantized_shuffle_cosine(
    shuffles: &[u8],
    codebook_count: usize,
    quantized_partials: &[u16],
    delta: f32,
    base: f32,
    quantized_magnitudes: &[u16],
    magnitude_delta: f32,
    magnitude_base: f32,
    query_magnitude_squared: f32,
    results: &mut [f32],
) -> Result<()> {
    check_shuffles(shuffles, codebook_count, MAX_QUANTIZED_CLUSTERS)?;
    check_table_rows(
        quantized_partials,
        codebook_count,
        QUANTIZED_ROW_STRIDE,
        "quantized partials",
    )?;
    check_table_rows(
        quantized_magnitudes,
        codebook_count,
        QUANTIZED_ROW_STRIDE,
        "quantized magnitudes",
    )?;
    quantized_cosine_kernel(
        shuffles,
        quantized_partials,
        QuantizationParams::new(delta, base),
        quantized_magnitudes,
        QuantizationParams::new(magnitude_delta, magnitude_base),
        query_magnitude_squared,
        batch_out(results)?,
        InstructionSet::default(),
    );
    Ok(())
}

/// Sum `data[row_stride * i + code[i]]` for `i` in `0..code_length`.
pub fn assemble_and_sum(
    data: &[f32],
    row_stride: usize,
    code: &[u8],
    code_length: usize,
) -> Result<f32> {
    let code = range(code, 0, code_length, "code")?;
    if let Some((i, c)) = code.iter().enumerate().find(|(i, c)| {
        row_stride
            .checked_mul(*i)
            .and_then(|o| o.checked_add(**c as usize))
            .is_none_or(|o| o >= data.len())
    }) {
        return Err(Error::invalid(format!(
            "code[{i}] = {c} reads past table of {} entries with stride {row_stride}",
            data.len()
        )));
    }
    Ok(pq::gather::assemble_and_sum(data, row_stride, code))
}

fn multi_args<'a>(
    query: &'a [f32],
    packed: &'a [f32],
    query_length: usize,
    target_count: usize,
) -> Result<(&'a [f32], &'a [f32])> {
    let packed_len = query_length.checked_mul(target_count).ok_or_else(|| {
        Error::invalid(format!("{target_count} targets of {query_length} overflow"))
    })?;
    Ok((
        range(query, 0, query_length, "query")?,
        range(packed, 0, packed_len, "packed")?,
    ))
}

/// Write normalized dot product scores of `query` against `target_count` packed targets.
pub fn dot_product_multi(
    query: &[f32],
    packed: &[f32],
    query_length: usize,
    target_count: usize,
    results: &mut [f32],
) -> Result<()> {
    let (query, packed) = multi_args(query, packed, query_length, target_count)?;
    let len = results.len();
    let out = results.get_mut(..target_count).ok_or_else(|| {
        Error::invalid(format!("results hold {len} values, need {target_count}"))
    })?;
    multi::dot_product_multi(query, packed, out, InstructionSet::default());
    Ok(())
}

/// Write normalized squared l2 scores of `query` against `target_count` packed targets.
pub fn square_distance_multi(
    query: &[f32],
    packed: &[f32],
    query_length: usize,
    target_count: usize,
    results: &mut [f32],
) -> Result<()> {
    let (query, packed) = multi_args(query, packed, query_length, target_count)?;
    let len = results.len();
    let out = results.get_mut(..target_count).ok_or_else(|| {
        Error::invalid(format!("results hold {len} values, need {target_count}"))
    })?;
    multi::square_distance_multi(query, packed, out, InstructionSet::default());
    Ok(())
}
