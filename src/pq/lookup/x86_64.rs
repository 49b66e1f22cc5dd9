#![allow(unsafe_op_in_unsafe_fn)]

use std::arch::x86_64::{
    __m128i, __m256i, __m512, __m512i, __mmask32, _mm_loadu_si128, _mm256_loadu_si256,
    _mm512_add_ps, _mm512_adds_epu16, _mm512_castsi512_si256, _mm512_cvtepi32_ps,
    _mm512_cvtepu8_epi16, _mm512_cvtepu8_epi32, _mm512_cvtepu16_epi32, _mm512_div_ps,
    _mm512_extracti64x4_epi64, _mm512_loadu_epi16, _mm512_loadu_ps, _mm512_mask_blend_epi16,
    _mm512_mul_ps, _mm512_permutex2var_epi16, _mm512_permutex2var_ps, _mm512_set1_epi16,
    _mm512_set1_ps, _mm512_setzero_ps, _mm512_setzero_si512, _mm512_sqrt_ps, _mm512_storeu_ps,
    _mm512_test_epi16_mask,
};

use super::selection::{Blend, select_tree};
use crate::{
    VectorSimilarity,
    pq::{BATCH_SIZE, MAX_FLOAT_CLUSTERS, QUANTIZED_ROW_STRIDE, QuantizationParams},
};

/// 32 lanes of u16.
///
/// Only constructed inside avx512bw kernels.
#[derive(Clone, Copy)]
struct U16x32(__m512i);

impl Blend for U16x32 {
    type Mask = __mmask32;

    #[inline(always)]
    fn blend(mask: __mmask32, a: Self, b: Self) -> Self {
        // SAFETY: a U16x32 only exists inside code compiled with avx512bw.
        Self(unsafe { _mm512_mask_blend_epi16(mask, a.0, b.0) })
    }
}

/// Read one 64 entry window of a quantized row for every lane.
#[inline(always)]
unsafe fn window(row: *const i16, w: usize, codes: __m512i) -> U16x32 {
    U16x32(_mm512_permutex2var_epi16(
        _mm512_loadu_epi16(row.add(w * 64)),
        codes,
        _mm512_loadu_epi16(row.add(w * 64 + 32)),
    ))
}

#[inline(always)]
unsafe fn quantized_sums(shuffles: &[u8], table: &[u16]) -> __m512i {
    let bit6 = _mm512_set1_epi16(1 << 6);
    let bit7 = _mm512_set1_epi16(1 << 7);
    let mut acc = _mm512_setzero_si512();
    for m in 0..(shuffles.len() / BATCH_SIZE) {
        let codes = _mm512_cvtepu8_epi16(_mm256_loadu_si256(
            shuffles.as_ptr().add(m * BATCH_SIZE) as *const __m256i,
        ));
        let row = table.as_ptr().add(m * QUANTIZED_ROW_STRIDE) as *const i16;
        let windows = [
            window(row, 0, codes),
            window(row, 1, codes),
            window(row, 2, codes),
            window(row, 3, codes),
        ];
        let masks = [
            _mm512_test_epi16_mask(codes, bit6),
            _mm512_test_epi16_mask(codes, bit7),
        ];
        acc = _mm512_adds_epu16(acc, select_tree(windows, &masks).0);
    }
    acc
}

/// Widen 32 u16 lanes to two registers of 16 f32 lanes.
#[inline(always)]
unsafe fn widen(acc: __m512i) -> [__m512; 2] {
    [
        _mm512_cvtepi32_ps(_mm512_cvtepu16_epi32(_mm512_castsi512_si256(acc))),
        _mm512_cvtepi32_ps(_mm512_cvtepu16_epi32(_mm512_extracti64x4_epi64::<1>(acc))),
    ]
}

#[inline(always)]
unsafe fn dequantize(q: __m512, params: QuantizationParams) -> __m512 {
    _mm512_add_ps(
        _mm512_set1_ps(params.base),
        _mm512_mul_ps(q, _mm512_set1_ps(params.delta)),
    )
}

#[inline(always)]
unsafe fn normalize(similarity: VectorSimilarity, raw: __m512) -> __m512 {
    let one = _mm512_set1_ps(1.0);
    match similarity {
        VectorSimilarity::Dot | VectorSimilarity::Cosine => {
            _mm512_mul_ps(_mm512_add_ps(one, raw), _mm512_set1_ps(0.5))
        }
        VectorSimilarity::Euclidean => _mm512_div_ps(one, _mm512_add_ps(one, raw)),
    }
}

/// Score a batch against a quantized table.
///
/// # Safety
/// Requires avx512f and avx512bw. `shuffles` must hold `M` rows of [`BATCH_SIZE`] and `table`
/// at least `M` rows of [`QUANTIZED_ROW_STRIDE`].
#[target_feature(enable = "avx512f,avx512bw")]
pub unsafe fn bulk_quantized(
    shuffles: &[u8],
    table: &[u16],
    params: QuantizationParams,
    similarity: VectorSimilarity,
    out: &mut [f32; BATCH_SIZE],
) {
    let sums = widen(quantized_sums(shuffles, table));
    for (h, q) in sums.into_iter().enumerate() {
        _mm512_storeu_ps(
            out.as_mut_ptr().add(h * 16),
            normalize(similarity, dequantize(q, params)),
        );
    }
}

/// Score a batch with cosine similarity from quantized dot product and magnitude tables.
///
/// # Safety
/// Requires avx512f and avx512bw. `shuffles` must hold `M` rows of [`BATCH_SIZE`] and both
/// tables at least `M` rows of [`QUANTIZED_ROW_STRIDE`].
#[target_feature(enable = "avx512f,avx512bw")]
pub unsafe fn bulk_quantized_cosine(
    shuffles: &[u8],
    table: &[u16],
    params: QuantizationParams,
    magnitudes: &[u16],
    magnitude_params: QuantizationParams,
    query_magnitude_squared: f32,
    out: &mut [f32; BATCH_SIZE],
) {
    let dots = widen(quantized_sums(shuffles, table));
    let mags = widen(quantized_sums(shuffles, magnitudes));
    let query_mag = _mm512_set1_ps(query_magnitude_squared);
    for h in 0..2 {
        let dot = dequantize(dots[h], params);
        let mag = dequantize(mags[h], magnitude_params);
        let cos = _mm512_div_ps(dot, _mm512_sqrt_ps(_mm512_mul_ps(mag, query_mag)));
        _mm512_storeu_ps(
            out.as_mut_ptr().add(h * 16),
            normalize(VectorSimilarity::Cosine, cos),
        );
    }
}

/// Score a batch against a float table of at most 32 clusters.
///
/// # Safety
/// Requires avx512f. `shuffles` must hold `M` rows of [`BATCH_SIZE`] and `table` at least `M`
/// rows of [`MAX_FLOAT_CLUSTERS`].
#[target_feature(enable = "avx512f")]
pub unsafe fn bulk_float(
    shuffles: &[u8],
    table: &[f32],
    similarity: VectorSimilarity,
    out: &mut [f32; BATCH_SIZE],
) {
    let mut acc = [_mm512_setzero_ps(); 2];
    for m in 0..(shuffles.len() / BATCH_SIZE) {
        let row = table.as_ptr().add(m * MAX_FLOAT_CLUSTERS);
        let lo = _mm512_loadu_ps(row);
        let hi = _mm512_loadu_ps(row.add(16));
        for (h, a) in acc.iter_mut().enumerate() {
            let codes = _mm512_cvtepu8_epi32(_mm_loadu_si128(
                shuffles.as_ptr().add(m * BATCH_SIZE + h * 16) as *const __m128i,
            ));
            *a = _mm512_add_ps(*a, _mm512_permutex2var_ps(lo, codes, hi));
        }
    }
    for (h, a) in acc.into_iter().enumerate() {
        _mm512_storeu_ps(out.as_mut_ptr().add(h * 16), normalize(similarity, a));
    }
}
