//! Lane-width generic distance kernels.
//!
//! Each kernel is written once against [`FloatLanes`] and instantiated per register width from a
//! `#[target_feature]` wrapper so that the intrinsics inline into feature-enabled code.

#![allow(unsafe_op_in_unsafe_fn)]

/// Number of targets that share each load of a query chunk in the multi-target kernels.
pub const MULTI_GROUP: usize = 8;

/// A vector register holding `LANES` f32 values.
///
/// All methods are unsafe: implementations may only be called when the features backing `V` are
/// available, and `load` reads `LANES` values through a raw pointer.
pub trait FloatLanes {
    const LANES: usize;
    type V: Copy;

    unsafe fn zero() -> Self::V;
    unsafe fn load(p: *const f32) -> Self::V;
    unsafe fn sub(a: Self::V, b: Self::V) -> Self::V;
    /// Returns `acc + a * b`.
    unsafe fn mul_add(a: Self::V, b: Self::V, acc: Self::V) -> Self::V;
    unsafe fn reduce_sum(v: Self::V) -> f32;
}

/// Two f32 lanes in plain registers.
pub struct Pair;

impl FloatLanes for Pair {
    const LANES: usize = 2;
    type V = [f32; 2];

    #[inline(always)]
    unsafe fn zero() -> Self::V {
        [0.0; 2]
    }

    #[inline(always)]
    unsafe fn load(p: *const f32) -> Self::V {
        [p.read_unaligned(), p.add(1).read_unaligned()]
    }

    #[inline(always)]
    unsafe fn sub(a: Self::V, b: Self::V) -> Self::V {
        [a[0] - b[0], a[1] - b[1]]
    }

    #[inline(always)]
    unsafe fn mul_add(a: Self::V, b: Self::V, acc: Self::V) -> Self::V {
        [acc[0] + a[0] * b[0], acc[1] + a[1] * b[1]]
    }

    #[inline(always)]
    unsafe fn reduce_sum(v: Self::V) -> f32 {
        v[0] + v[1]
    }
}

#[inline]
pub fn dot_scalar(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(a, b)| a * b).sum()
}

#[inline]
pub fn l2sq_scalar(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(a, b)| {
            let delta = a - b;
            delta * delta
        })
        .sum()
}

/// Per-element accumulation step shared by the single and multi-target kernels.
pub trait Metric {
    unsafe fn step<L: FloatLanes>(q: L::V, d: L::V, acc: L::V) -> L::V;
    fn remainder(a: &[f32], b: &[f32]) -> f32;
}

pub struct Dot;

impl Metric for Dot {
    #[inline(always)]
    unsafe fn step<L: FloatLanes>(q: L::V, d: L::V, acc: L::V) -> L::V {
        L::mul_add(q, d, acc)
    }

    #[inline(always)]
    fn remainder(a: &[f32], b: &[f32]) -> f32 {
        dot_scalar(a, b)
    }
}

pub struct SquaredL2;

impl Metric for SquaredL2 {
    #[inline(always)]
    unsafe fn step<L: FloatLanes>(q: L::V, d: L::V, acc: L::V) -> L::V {
        let diff = L::sub(q, d);
        L::mul_add(diff, diff, acc)
    }

    #[inline(always)]
    fn remainder(a: &[f32], b: &[f32]) -> f32 {
        l2sq_scalar(a, b)
    }
}

/// Compute metric `M` between two equal length slices.
///
/// # Safety
/// The features backing `L` must be available.
#[inline(always)]
pub unsafe fn single<L: FloatLanes, M: Metric>(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    let tail = a.len() - a.len() % L::LANES;
    let mut acc = L::zero();
    for i in (0..tail).step_by(L::LANES) {
        acc = M::step::<L>(L::load(a.as_ptr().add(i)), L::load(b.as_ptr().add(i)), acc);
    }
    L::reduce_sum(acc) + M::remainder(&a[tail..], &b[tail..])
}

/// Compute metric `M` between `query` and each `query.len()` sized target in `packed`.
///
/// Every lane chunk of the query is loaded once and applied to a group of up to
/// [`MULTI_GROUP`] targets before advancing.
///
/// # Safety
/// The features backing `L` must be available and `packed.len() == query.len() * out.len()`.
#[inline(always)]
pub unsafe fn multi<L: FloatLanes, M: Metric>(query: &[f32], packed: &[f32], out: &mut [f32]) {
    let dim = query.len();
    debug_assert_eq!(packed.len(), dim * out.len());
    let tail = dim - dim % L::LANES;
    for (g, group) in out.chunks_mut(MULTI_GROUP).enumerate() {
        let first = g * MULTI_GROUP * dim;
        let mut acc = [L::zero(); MULTI_GROUP];
        for i in (0..tail).step_by(L::LANES) {
            let q = L::load(query.as_ptr().add(i));
            for (t, a) in acc.iter_mut().take(group.len()).enumerate() {
                *a = M::step::<L>(q, L::load(packed.as_ptr().add(first + t * dim + i)), *a);
            }
        }
        for (t, o) in group.iter_mut().enumerate() {
            let target = &packed[(first + t * dim)..(first + (t + 1) * dim)];
            *o = L::reduce_sum(acc[t]) + M::remainder(&query[tail..], &target[tail..]);
        }
    }
}

#[cfg(test)]
mod test {
    use super::{Dot, Pair, SquaredL2, dot_scalar, l2sq_scalar, multi, single};

    #[test]
    fn pair_with_remainder() {
        let a = [1.0f32, 2.0, 3.0, 4.0, 5.0];
        let b = [5.0f32, 4.0, 3.0, 2.0, 1.0];
        assert_eq!(unsafe { single::<Pair, Dot>(&a, &b) }, dot_scalar(&a, &b));
        assert_eq!(unsafe { single::<Pair, SquaredL2>(&a, &b) }, l2sq_scalar(&a, &b));
    }

    #[test]
    fn multi_spans_groups() {
        let query = [1.0f32, -1.0, 0.5];
        let packed = (0..(3 * 11)).map(|i| i as f32 * 0.25).collect::<Vec<_>>();
        let mut dots = [0.0f32; 11];
        let mut l2s = [0.0f32; 11];
        unsafe {
            multi::<Pair, Dot>(&query, &packed, &mut dots);
            multi::<Pair, SquaredL2>(&query, &packed, &mut l2s);
        }
        for (t, target) in packed.chunks(3).enumerate() {
            assert_eq!(dots[t], dot_scalar(&query, target));
            assert_eq!(l2s[t], l2sq_scalar(&query, target));
        }
    }
}
