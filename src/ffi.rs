//! `extern "C"` wrappers over [`crate::ops`].
//!
//! Functions that produce no value return a [`Status`] code, zero on success. Functions that
//! return a float return NaN when their arguments are rejected. Negative offsets or counts are
//! rejected rather than reinterpreted.

use std::{ffi::c_int, slice};

use tracing::debug;

use crate::{
    Error, Result, ops,
    pq::{BATCH_SIZE, MAX_FLOAT_CLUSTERS, MAX_QUANTIZED_CLUSTERS, QUANTIZED_ROW_STRIDE},
};

/// Result codes returned across the C ABI.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[repr(i32)]
pub enum Status {
    Ok = 0,
    InvalidArgument = 1,
    IncompleteTable = 2,
    Unsupported = 3,
}

impl From<&Error> for Status {
    fn from(value: &Error) -> Self {
        match value {
            Error::InvalidArgument(_) => Status::InvalidArgument,
            Error::IncompleteTable { .. } => Status::IncompleteTable,
            Error::Unsupported(_) => Status::Unsupported,
        }
    }
}

fn status(r: Result<()>) -> c_int {
    match r {
        Ok(()) => Status::Ok as c_int,
        Err(e) => {
            debug!(error = %e, "rejected ffi call");
            Status::from(&e) as c_int
        }
    }
}

fn value(r: Result<f32>) -> f32 {
    r.unwrap_or_else(|e| {
        debug!(error = %e, "rejected ffi call");
        f32::NAN
    })
}

fn count(n: c_int) -> Result<usize> {
    usize::try_from(n).map_err(|_| Error::invalid(format!("negative count {n}")))
}

/// Borrow `len` elements at `ptr`. A null pointer is only accepted for an empty slice.
unsafe fn borrow<'a, T>(ptr: *const T, len: usize) -> Result<&'a [T]> {
    if ptr.is_null() {
        return if len == 0 {
            Ok(&[])
        } else {
            Err(Error::invalid("null pointer"))
        };
    }
    Ok(unsafe { slice::from_raw_parts(ptr, len) })
}

unsafe fn borrow_mut<'a, T>(ptr: *mut T, len: usize) -> Result<&'a mut [T]> {
    if ptr.is_null() {
        return if len == 0 {
            Ok(&mut [])
        } else {
            Err(Error::invalid("null pointer"))
        };
    }
    Ok(unsafe { slice::from_raw_parts_mut(ptr, len) })
}

#[unsafe(no_mangle)]
pub extern "C" fn qadc_check_compatibility() -> bool {
    ops::check_compatibility()
}

unsafe fn primitive(
    f: fn(usize, &[f32], usize, &[f32], usize, usize) -> Result<f32>,
    preferred_size: c_int,
    a: *const f32,
    aoffset: c_int,
    b: *const f32,
    boffset: c_int,
    length: c_int,
) -> Result<f32> {
    let (aoffset, boffset, length) = (count(aoffset)?, count(boffset)?, count(length)?);
    let a = unsafe { borrow(a, aoffset + length)? };
    let b = unsafe { borrow(b, boffset + length)? };
    f(
        count(preferred_size).unwrap_or(0),
        a,
        aoffset,
        b,
        boffset,
        length,
    )
}

/// Raw dot product of `length` floats at `a + aoffset` and `b + boffset`.
///
/// # Safety
/// `a` and `b` must be valid for reads of `aoffset + length` and `boffset + length` floats.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn qadc_dot_product(
    preferred_size: c_int,
    a: *const f32,
    aoffset: c_int,
    b: *const f32,
    boffset: c_int,
    length: c_int,
) -> f32 {
    value(unsafe { primitive(ops::dot_product, preferred_size, a, aoffset, b, boffset, length) })
}

/// Raw squared l2 distance of `length` floats at `a + aoffset` and `b + boffset`.
///
/// # Safety
/// As [`qadc_dot_product`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn qadc_euclidean(
    preferred_size: c_int,
    a: *const f32,
    aoffset: c_int,
    b: *const f32,
    boffset: c_int,
    length: c_int,
) -> f32 {
    value(unsafe { primitive(ops::euclidean, preferred_size, a, aoffset, b, boffset, length) })
}

/// Argument counts and slice extents of a partial sums call.
///
/// Extents are computed with overflow checks and the cluster count is bounded before any of
/// the caller's pointers is turned into a slice.
struct PartialSumsShape {
    m: usize,
    size: usize,
    clusters: usize,
    query_offset: usize,
    codebook_len: usize,
    query_len: usize,
    out_len: usize,
}

impl PartialSumsShape {
    fn new(
        codebook_index: c_int,
        size: c_int,
        cluster_count: c_int,
        query_offset: c_int,
    ) -> Result<Self> {
        let (m, size, clusters, query_offset) = (
            count(codebook_index)?,
            count(size)?,
            count(cluster_count)?,
            count(query_offset)?,
        );
        if !(1..=MAX_QUANTIZED_CLUSTERS).contains(&clusters) {
            return Err(Error::invalid(format!(
                "cluster count {clusters} not in [1, {MAX_QUANTIZED_CLUSTERS}]"
            )));
        }
        let overflow = || Error::invalid("partial sums extent overflows");
        let codebook_len = clusters.checked_mul(size).ok_or_else(overflow)?;
        let query_len = query_offset.checked_add(size).ok_or_else(overflow)?;
        let out_len = m
            .checked_add(1)
            .and_then(|rows| rows.checked_mul(clusters))
            .ok_or_else(overflow)?;
        Ok(Self {
            m,
            size,
            clusters,
            query_offset,
            codebook_len,
            query_len,
            out_len,
        })
    }
}

type PartialSumsFn = fn(&[f32], usize, usize, usize, &[f32], usize, &mut [f32]) -> Result<()>;

#[allow(clippy::too_many_arguments)]
unsafe fn partial_sums(
    f: PartialSumsFn,
    codebook: *const f32,
    codebook_index: c_int,
    size: c_int,
    cluster_count: c_int,
    query: *const f32,
    query_offset: c_int,
    partial_sums: *mut f32,
) -> Result<()> {
    let shape = PartialSumsShape::new(codebook_index, size, cluster_count, query_offset)?;
    let codebook = unsafe { borrow(codebook, shape.codebook_len)? };
    let query = unsafe { borrow(query, shape.query_len)? };
    let out = unsafe { borrow_mut(partial_sums, shape.out_len)? };
    f(
        codebook,
        shape.m,
        shape.size,
        shape.clusters,
        query,
        shape.query_offset,
        out,
    )
}

/// Fill row `codebook_index` of `partial_sums` with dot products of the `size` dimensional query
/// sub-vector at `query + query_offset` against `cluster_count` centroids at `codebook`.
///
/// # Safety
/// `codebook` must hold `cluster_count * size` floats, `query` at least `query_offset + size`
/// and `partial_sums` at least `(codebook_index + 1) * cluster_count`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn qadc_calculate_partial_sums_dot(
    codebook: *const f32,
    codebook_index: c_int,
    size: c_int,
    cluster_count: c_int,
    query: *const f32,
    query_offset: c_int,
    partial_sums_out: *mut f32,
) -> c_int {
    status(unsafe {
        partial_sums(
            ops::calculate_partial_sums_dot,
            codebook,
            codebook_index,
            size,
            cluster_count,
            query,
            query_offset,
            partial_sums_out,
        )
    })
}

/// As [`qadc_calculate_partial_sums_dot`] with squared l2 distances.
///
/// # Safety
/// As [`qadc_calculate_partial_sums_dot`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn qadc_calculate_partial_sums_euclidean(
    codebook: *const f32,
    codebook_index: c_int,
    size: c_int,
    cluster_count: c_int,
    query: *const f32,
    query_offset: c_int,
    partial_sums_out: *mut f32,
) -> c_int {
    status(unsafe {
        partial_sums(
            ops::calculate_partial_sums_euclidean,
            codebook,
            codebook_index,
            size,
            cluster_count,
            query,
            query_offset,
            partial_sums_out,
        )
    })
}

type PartialSumsBestFn =
    fn(&[f32], usize, usize, usize, &[f32], usize, &mut [f32], &mut [f32]) -> Result<()>;

#[allow(clippy::too_many_arguments)]
unsafe fn partial_sums_best(
    f: PartialSumsBestFn,
    codebook: *const f32,
    codebook_index: c_int,
    size: c_int,
    cluster_count: c_int,
    query: *const f32,
    query_offset: c_int,
    partial_sums: *mut f32,
    partial_best: *mut f32,
) -> Result<()> {
    let shape = PartialSumsShape::new(codebook_index, size, cluster_count, query_offset)?;
    let codebook = unsafe { borrow(codebook, shape.codebook_len)? };
    let query = unsafe { borrow(query, shape.query_len)? };
    let out = unsafe { borrow_mut(partial_sums, shape.out_len)? };
    let best = unsafe { borrow_mut(partial_best, shape.m + 1)? };
    f(
        codebook,
        shape.m,
        shape.size,
        shape.clusters,
        query,
        shape.query_offset,
        out,
        best,
    )
}

/// As [`qadc_calculate_partial_sums_dot`], also writing the row maximum to
/// `partial_best[codebook_index]`.
///
/// # Safety
/// As [`qadc_calculate_partial_sums_dot`]; `partial_best` must hold `codebook_index + 1` floats.
#[allow(clippy::too_many_arguments)]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn qadc_calculate_partial_sums_best_dot(
    codebook: *const f32,
    codebook_index: c_int,
    size: c_int,
    cluster_count: c_int,
    query: *const f32,
    query_offset: c_int,
    partial_sums_out: *mut f32,
    partial_best: *mut f32,
) -> c_int {
    status(unsafe {
        partial_sums_best(
            ops::calculate_partial_sums_best_dot,
            codebook,
            codebook_index,
            size,
            cluster_count,
            query,
            query_offset,
            partial_sums_out,
            partial_best,
        )
    })
}

/// As [`qadc_calculate_partial_sums_euclidean`], also writing the row minimum to
/// `partial_best[codebook_index]`.
///
/// # Safety
/// As [`qadc_calculate_partial_sums_best_dot`].
#[allow(clippy::too_many_arguments)]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn qadc_calculate_partial_sums_best_euclidean(
    codebook: *const f32,
    codebook_index: c_int,
    size: c_int,
    cluster_count: c_int,
    query: *const f32,
    query_offset: c_int,
    partial_sums_out: *mut f32,
    partial_best: *mut f32,
) -> c_int {
    status(unsafe {
        partial_sums_best(
            ops::calculate_partial_sums_best_euclidean,
            codebook,
            codebook_index,
            size,
            cluster_count,
            query,
            query_offset,
            partial_sums_out,
            partial_best,
        )
    })
}

type BulkShuffleFn = fn(&[u8], usize, &[f32], &mut [f32]) -> Result<()>;

unsafe fn bulk_shuffle(
    f: BulkShuffleFn,
    shuffles: *const u8,
    codebook_count: c_int,
    partials: *const f32,
    results: *mut f32,
) -> Result<()> {
    let m = count(codebook_count)?;
    let shuffles = unsafe { borrow(shuffles, m * BATCH_SIZE)? };
    let partials = unsafe { borrow(partials, m * MAX_FLOAT_CLUSTERS)? };
    let results = unsafe { borrow_mut(results, BATCH_SIZE)? };
    f(shuffles, m, partials, results)
}

/// Score 32 candidates against `codebook_count` rows of 32 float partials.
///
/// # Safety
/// `shuffles` must hold `codebook_count * 32` bytes, `partials` `codebook_count * 32` floats and
/// `results` 32 floats.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn qadc_bulk_shuffle_dot(
    shuffles: *const u8,
    codebook_count: c_int,
    partials: *const f32,
    results: *mut f32,
) -> c_int {
    status(unsafe {
        bulk_shuffle(ops::bulk_shuffle_dot, shuffles, codebook_count, partials, results)
    })
}

/// As [`qadc_bulk_shuffle_dot`] with normalized Euclidean scores.
///
/// # Safety
/// As [`qadc_bulk_shuffle_dot`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn qadc_bulk_shuffle_euclidean(
    shuffles: *const u8,
    codebook_count: c_int,
    partials: *const f32,
    results: *mut f32,
) -> c_int {
    status(unsafe {
        bulk_shuffle(
            ops::bulk_shuffle_euclidean,
            shuffles,
            codebook_count,
            partials,
            results,
        )
    })
}

type BulkQuantizedFn = fn(&[u8], usize, &[u16], f32, f32, &mut [f32]) -> Result<()>;

unsafe fn bulk_quantized(
    f: BulkQuantizedFn,
    shuffles: *const u8,
    codebook_count: c_int,
    quantized_partials: *const u16,
    delta: f32,
    base: f32,
    results: *mut f32,
) -> Result<()> {
    let m = count(codebook_count)?;
    let shuffles = unsafe { borrow(shuffles, m * BATCH_SIZE)? };
    let table = unsafe { borrow(quantized_partials, m * QUANTIZED_ROW_STRIDE)? };
    let results = unsafe { borrow_mut(results, BATCH_SIZE)? };
    f(shuffles, m, table, delta, base, results)
}

/// Score 32 candidates against `codebook_count` rows of 256 quantized dot product partials.
///
/// # Safety
/// `shuffles` must hold `codebook_count * 32` bytes, `quantized_partials`
/// `codebook_count * 256` values and `results` 32 floats.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn qadc_bulk_quantized_shuffle_dot(
    shuffles: *const u8,
    codebook_count: c_int,
    quantized_partials: *const u16,
    delta: f32,
    base: f32,
    results: *mut f32,
) -> c_int {
    status(unsafe {
        bulk_quantized(
            ops::bulk_quantized_shuffle_dot,
            shuffles,
            codebook_count,
            quantized_partials,
            delta,
            base,
            results,
        )
    })
}

/// As [`qadc_bulk_quantized_shuffle_dot`] for squared l2 partials.
///
/// # Safety
/// As [`qadc_bulk_quantized_shuffle_dot`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn qadc_bulk_quantized_shuffle_euclidean(
    shuffles: *const u8,
    codebook_count: c_int,
    quantized_partials: *const u16,
    delta: f32,
    base: f32,
    results: *mut f32,
) -> c_int {
    status(unsafe {
        bulk_quantized(
            ops::bulk_quantized_shuffle_euclidean,
            shuffles,
            codebook_count,
            quantized_partials,
            delta,
            base,
            results,
        )
    })
}

/// Score 32 candidates with cosine similarity from quantized dot product partials and quantized
/// centroid squared magnitudes.
///
/// # Safety
/// As [`qadc_bulk_quantized_shuffle_dot`]; `quantized_magnitudes` must hold
/// `codebook_count * 256` values.
#[allow(clippy::too_many_arguments)]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn qadc_bulk_quantized_shuffle_cosine(
    shuffles: *const u8,
    codebook_count: c_int,
    quantized_partials: *const u16,
    delta: f32,
    base: f32,
    quantized_magnitudes: *const u16,
    magnitude_delta: f32,
    magnitude_base: f32,
    query_magnitude_squared: f32,
    results: *mut f32,
) -> c_int {
    status((|| {
        let m = count(codebook_count)?;
        let shuffles = unsafe { borrow(shuffles, m * BATCH_SIZE)? };
        let table = unsafe { borrow(quantized_partials, m * QUANTIZED_ROW_STRIDE)? };
        let mags = unsafe { borrow(quantized_magnitudes, m * QUANTIZED_ROW_STRIDE)? };
        let results = unsafe { borrow_mut(results, BATCH_SIZE)? };
        ops::bulk_quantized_shuffle_cosine(
            shuffles,
            m,
            table,
            delta,
            base,
            mags,
            magnitude_delta,
            magnitude_base,
            query_magnitude_squared,
            results,
        )
    })())
}

/// Sum `data[data_base * i + base_offsets[i]]` for `i` in `0..base_offsets_length`.
///
/// # Safety
/// `base_offsets` must hold `base_offsets_length` bytes and `data` every entry addressed by
/// them.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn qadc_assemble_and_sum(
    data: *const f32,
    data_base: c_int,
    base_offsets: *const u8,
    base_offsets_length: c_int,
) -> f32 {
    value((|| {
        let (stride, len) = (count(data_base)?, count(base_offsets_length)?);
        let codes = unsafe { borrow(base_offsets, len)? };
        let extent = codes
            .iter()
            .enumerate()
            .map(|(i, c)| stride * i + *c as usize + 1)
            .max()
            .unwrap_or(0);
        let data = unsafe { borrow(data, extent)? };
        ops::assemble_and_sum(data, stride, codes, len)
    })())
}

type MultiFn = fn(&[f32], &[f32], usize, usize, &mut [f32]) -> Result<()>;

unsafe fn multi(
    f: MultiFn,
    query: *const f32,
    packed: *const f32,
    query_length: c_int,
    target_count: c_int,
    results: *mut f32,
) -> Result<()> {
    let (len, n) = (count(query_length)?, count(target_count)?);
    let query = unsafe { borrow(query, len)? };
    let packed = unsafe { borrow(packed, len * n)? };
    let results = unsafe { borrow_mut(results, n)? };
    f(query, packed, len, n, results)
}

/// Write normalized dot product scores of `query` against `target_count` packed targets.
///
/// # Safety
/// `query` must hold `query_length` floats, `packed` `query_length * target_count` and
/// `results` `target_count`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn qadc_dot_product_multi(
    query: *const f32,
    packed: *const f32,
    query_length: c_int,
    target_count: c_int,
    results: *mut f32,
) -> c_int {
    status(unsafe {
        multi(
            ops::dot_product_multi,
            query,
            packed,
            query_length,
            target_count,
            results,
        )
    })
}

/// Write normalized squared l2 scores of `query` against `target_count` packed targets.
///
/// # Safety
/// As [`qadc_dot_product_multi`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn qadc_square_distance_multi(
    query: *const f32,
    packed: *const f32,
    query_length: c_int,
    target_count: c_int,
    results: *mut f32,
) -> c_int {
    status(unsafe {
        multi(
            ops::square_distance_multi,
            query,
            packed,
            query_length,
            target_count,
            results,
        )
    })
}

#[cfg(test)]
mod test {
    use std::ptr;

    use super::*;

    #[test]
    fn primitives() {
        let a = [9.0f32, 1.0, 2.0, 3.0];
        let b = [1.0f32, 1.0, 1.0];
        unsafe {
            assert_eq!(qadc_dot_product(512, a.as_ptr(), 1, b.as_ptr(), 0, 3), 6.0);
            assert_eq!(qadc_euclidean(128, a.as_ptr(), 1, b.as_ptr(), 0, 3), 5.0);
            assert!(qadc_dot_product(512, a.as_ptr(), -1, b.as_ptr(), 0, 3).is_nan());
            assert!(qadc_dot_product(512, ptr::null(), 0, b.as_ptr(), 0, 3).is_nan());
            assert_eq!(qadc_dot_product(512, ptr::null(), 0, ptr::null(), 0, 0), 0.0);
        }
    }

    #[test]
    fn partial_sums_status() {
        let book = [1.0f32, 0.0, 0.0, 1.0, -1.0, 0.0, 0.0, -1.0];
        let query = [1.0f32, 0.0, 1.0, 0.0];
        let mut table = [0.0f32; 8];
        let mut best = [0.0f32; 2];
        unsafe {
            for m in 0..2 {
                let rc = qadc_calculate_partial_sums_best_dot(
                    book.as_ptr(),
                    m,
                    2,
                    4,
                    query.as_ptr(),
                    m * 2,
                    table.as_mut_ptr(),
                    best.as_mut_ptr(),
                );
                assert_eq!(rc, Status::Ok as c_int);
            }
            assert_eq!(
                qadc_assemble_and_sum(table.as_ptr(), 4, [0u8, 0].as_ptr(), 2),
                2.0
            );
            let rc = qadc_calculate_partial_sums_euclidean(
                book.as_ptr(),
                0,
                2,
                -4,
                query.as_ptr(),
                0,
                table.as_mut_ptr(),
            );
            assert_eq!(rc, Status::InvalidArgument as c_int);
        }
        assert_eq!(table[..4], [1.0, 0.0, -1.0, 0.0]);
        assert_eq!(best, [1.0, 1.0]);
    }

    #[test]
    fn partial_sums_cluster_bound() {
        // buffers far shorter than the claimed extents; the call must fail before reading them.
        let book = [1.0f32; 4];
        let query = [1.0f32; 2];
        let mut table = [0.0f32; 4];
        let mut best = [0.0f32; 1];
        for clusters in [0, 300, c_int::MAX] {
            unsafe {
                let rc = qadc_calculate_partial_sums_dot(
                    book.as_ptr(),
                    0,
                    2,
                    clusters,
                    query.as_ptr(),
                    0,
                    table.as_mut_ptr(),
                );
                assert_eq!(rc, Status::InvalidArgument as c_int);
                let rc = qadc_calculate_partial_sums_best_euclidean(
                    book.as_ptr(),
                    c_int::MAX,
                    c_int::MAX,
                    clusters,
                    query.as_ptr(),
                    c_int::MAX,
                    table.as_mut_ptr(),
                    best.as_mut_ptr(),
                );
                assert_eq!(rc, Status::InvalidArgument as c_int);
            }
        }
        assert_eq!(table, [0.0; 4]);
        assert_eq!(best, [0.0]);
    }

    #[test]
    fn shuffle_status() {
        let partials = vec![0.25f32; 32];
        let mut shuffles = [3u8; BATCH_SIZE];
        let mut results = [0.0f32; BATCH_SIZE];
        unsafe {
            let rc = qadc_bulk_shuffle_dot(
                shuffles.as_ptr(),
                1,
                partials.as_ptr(),
                results.as_mut_ptr(),
            );
            assert_eq!(rc, Status::Ok as c_int);
            assert_eq!(results, [0.625; BATCH_SIZE]);
            shuffles[0] = 40;
            let rc = qadc_bulk_shuffle_euclidean(
                shuffles.as_ptr(),
                1,
                partials.as_ptr(),
                results.as_mut_ptr(),
            );
            assert_eq!(rc, Status::InvalidArgument as c_int);
        }

        let table = vec![2u16; QUANTIZED_ROW_STRIDE];
        unsafe {
            let rc = qadc_bulk_quantized_shuffle_euclidean(
                [200u8; BATCH_SIZE].as_ptr(),
                1,
                table.as_ptr(),
                0.5,
                1.0,
                results.as_mut_ptr(),
            );
            assert_eq!(rc, Status::Ok as c_int);
        }
        // raw = 1 + 2 * 0.5.
        assert_eq!(results, [1.0 / 3.0; BATCH_SIZE]);
    }

    #[test]
    fn multi_status() {
        let query = [1.0f32, 0.0];
        let packed = [1.0f32, 0.0, -1.0, 0.0];
        let mut results = [0.0f32; 2];
        unsafe {
            let rc = qadc_dot_product_multi(
                query.as_ptr(),
                packed.as_ptr(),
                2,
                2,
                results.as_mut_ptr(),
            );
            assert_eq!(rc, Status::Ok as c_int);
            assert_eq!(results, [1.0, 0.0]);
            let rc = qadc_square_distance_multi(
                query.as_ptr(),
                ptr::null(),
                2,
                2,
                results.as_mut_ptr(),
            );
            assert_eq!(rc, Status::InvalidArgument as c_int);
        }
    }
}
