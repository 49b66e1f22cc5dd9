#![allow(unsafe_op_in_unsafe_fn)]

use std::arch::x86_64::{
    __m128, __m256, __m512, _mm_add_ps, _mm_add_ss, _mm_cvtss_f32, _mm_loadu_ps, _mm_movehl_ps,
    _mm_mul_ps, _mm_setzero_ps, _mm_shuffle_ps, _mm_sub_ps, _mm256_castps256_ps128,
    _mm256_extractf128_ps, _mm256_fmadd_ps, _mm256_loadu_ps, _mm256_setzero_ps, _mm256_sub_ps,
    _mm512_fmadd_ps, _mm512_loadu_ps, _mm512_reduce_add_ps, _mm512_setzero_ps, _mm512_sub_ps,
};

use super::lanes::FloatLanes;

pub struct Sse;

impl FloatLanes for Sse {
    const LANES: usize = 4;
    type V = __m128;

    #[inline(always)]
    unsafe fn zero() -> __m128 {
        _mm_setzero_ps()
    }

    #[inline(always)]
    unsafe fn load(p: *const f32) -> __m128 {
        _mm_loadu_ps(p)
    }

    #[inline(always)]
    unsafe fn sub(a: __m128, b: __m128) -> __m128 {
        _mm_sub_ps(a, b)
    }

    #[inline(always)]
    unsafe fn mul_add(a: __m128, b: __m128, acc: __m128) -> __m128 {
        _mm_add_ps(acc, _mm_mul_ps(a, b))
    }

    #[inline(always)]
    unsafe fn reduce_sum(v: __m128) -> f32 {
        let s = _mm_add_ps(v, _mm_movehl_ps(v, v));
        _mm_cvtss_f32(_mm_add_ss(s, _mm_shuffle_ps::<0b01>(s, s)))
    }
}

pub struct Avx2;

impl FloatLanes for Avx2 {
    const LANES: usize = 8;
    type V = __m256;

    #[inline(always)]
    unsafe fn zero() -> __m256 {
        _mm256_setzero_ps()
    }

    #[inline(always)]
    unsafe fn load(p: *const f32) -> __m256 {
        _mm256_loadu_ps(p)
    }

    #[inline(always)]
    unsafe fn sub(a: __m256, b: __m256) -> __m256 {
        _mm256_sub_ps(a, b)
    }

    #[inline(always)]
    unsafe fn mul_add(a: __m256, b: __m256, acc: __m256) -> __m256 {
        _mm256_fmadd_ps(a, b, acc)
    }

    #[inline(always)]
    unsafe fn reduce_sum(v: __m256) -> f32 {
        Sse::reduce_sum(_mm_add_ps(
            _mm256_castps256_ps128(v),
            _mm256_extractf128_ps::<1>(v),
        ))
    }
}

pub struct Avx512;

impl FloatLanes for Avx512 {
    const LANES: usize = 16;
    type V = __m512;

    #[inline(always)]
    unsafe fn zero() -> __m512 {
        _mm512_setzero_ps()
    }

    #[inline(always)]
    unsafe fn load(p: *const f32) -> __m512 {
        _mm512_loadu_ps(p)
    }

    #[inline(always)]
    unsafe fn sub(a: __m512, b: __m512) -> __m512 {
        _mm512_sub_ps(a, b)
    }

    #[inline(always)]
    unsafe fn mul_add(a: __m512, b: __m512, acc: __m512) -> __m512 {
        _mm512_fmadd_ps(a, b, acc)
    }

    #[inline(always)]
    unsafe fn reduce_sum(v: __m512) -> f32 {
        _mm512_reduce_add_ps(v)
    }
}

lane_kernels!(w128, Sse, "sse3");
lane_kernels!(w256, Avx2, "avx2,fma");
lane_kernels!(
    w512,
    Avx512,
    "avx512f,avx512cd,avx512bw,avx512dq,avx512vl,avx2,fma"
);
