//! Raw `f32` dot product and squared Euclidean distance.
//!
//! Each primitive picks a lane width from the input length and the requested
//! [`InstructionSet`]:
//!
//! * length 2 uses a two lane path,
//! * lengths up to 7 use 128-bit registers,
//! * longer inputs use 512-bit registers when requested, supported and the input holds at least
//!   16 elements, otherwise 256-bit registers.
//!
//! Any width the host cannot execute degrades to the next narrower supported one. Vector lanes
//! cover `len - len % lanes` elements and a shared scalar loop finishes the remainder.

use std::borrow::Cow;

use crate::capability::InstructionSet;

/// Generate `#[target_feature]` entry points for a lane type and expose them as `KERNELS`.
macro_rules! lane_kernels {
    ($module:ident, $lanes:ty, $features:literal) => {
        pub mod $module {
            #![allow(unsafe_op_in_unsafe_fn)]

            use super::*;
            use crate::distance::{
                LaneKernels,
                lanes::{Dot, SquaredL2, multi, single},
            };

            #[target_feature(enable = $features)]
            unsafe fn dot(a: &[f32], b: &[f32]) -> f32 {
                single::<$lanes, Dot>(a, b)
            }

            #[target_feature(enable = $features)]
            unsafe fn l2sq(a: &[f32], b: &[f32]) -> f32 {
                single::<$lanes, SquaredL2>(a, b)
            }

            #[target_feature(enable = $features)]
            unsafe fn dot_multi(query: &[f32], packed: &[f32], out: &mut [f32]) {
                multi::<$lanes, Dot>(query, packed, out)
            }

            #[target_feature(enable = $features)]
            unsafe fn l2sq_multi(query: &[f32], packed: &[f32], out: &mut [f32]) {
                multi::<$lanes, SquaredL2>(query, packed, out)
            }

            pub static KERNELS: LaneKernels = LaneKernels {
                dot,
                l2sq,
                dot_multi,
                l2sq_multi,
            };
        }
    };
}

mod lanes;

#[cfg(target_arch = "aarch64")]
mod aarch64;
#[cfg(target_arch = "x86_64")]
mod x86_64;

pub(crate) use lanes::MULTI_GROUP;

/// Entry points for one lane width.
///
/// Calling any of these is only sound if the features of the width were probed on this host.
pub(crate) struct LaneKernels {
    pub dot: unsafe fn(&[f32], &[f32]) -> f32,
    pub l2sq: unsafe fn(&[f32], &[f32]) -> f32,
    pub dot_multi: unsafe fn(&[f32], &[f32], &mut [f32]),
    pub l2sq_multi: unsafe fn(&[f32], &[f32], &mut [f32]),
}

mod scalar {
    use super::LaneKernels;
    use super::lanes::{Dot, Metric, SquaredL2, dot_scalar, l2sq_scalar};

    fn multi<M: Metric>(query: &[f32], packed: &[f32], out: &mut [f32]) {
        if query.is_empty() {
            out.fill(0.0);
            return;
        }
        for (o, target) in out.iter_mut().zip(packed.chunks_exact(query.len())) {
            *o = M::remainder(query, target);
        }
    }

    pub static KERNELS: LaneKernels = LaneKernels {
        dot: dot_scalar,
        l2sq: l2sq_scalar,
        dot_multi: multi::<Dot>,
        l2sq_multi: multi::<SquaredL2>,
    };
}

mod pair {
    use super::LaneKernels;
    use super::lanes::{Dot, Pair, SquaredL2, multi, single};

    pub static KERNELS: LaneKernels = LaneKernels {
        dot: single::<Pair, Dot>,
        l2sq: single::<Pair, SquaredL2>,
        dot_multi: multi::<Pair, Dot>,
        l2sq_multi: multi::<Pair, SquaredL2>,
    };
}

/// Lane width chosen for a single call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum LanePath {
    Scalar,
    Pair,
    W128,
    W256,
    W512,
}

impl LanePath {
    /// Choose a path for inputs of `len` elements given a requested width.
    pub fn select(len: usize, width: InstructionSet) -> Self {
        let supported = width.clamp();
        if supported == InstructionSet::Scalar {
            return Self::Scalar;
        }
        let path = if len == 2 {
            Self::Pair
        } else if len <= 7 {
            Self::W128
        } else if supported == InstructionSet::Width512 && len >= 16 {
            Self::W512
        } else {
            Self::W256
        };
        path.degrade(supported)
    }

    fn degrade(self, supported: InstructionSet) -> Self {
        match self {
            Self::W512 if supported < InstructionSet::Width512 => Self::W256.degrade(supported),
            Self::W256 if supported < InstructionSet::Width256 => Self::W128.degrade(supported),
            Self::W128 if supported < InstructionSet::Width128 => Self::Scalar,
            p => p,
        }
    }

    pub fn kernels(self) -> &'static LaneKernels {
        match self {
            Self::Scalar => &scalar::KERNELS,
            Self::Pair => &pair::KERNELS,
            #[cfg(target_arch = "x86_64")]
            Self::W128 => &x86_64::w128::KERNELS,
            #[cfg(target_arch = "x86_64")]
            Self::W256 => &x86_64::w256::KERNELS,
            #[cfg(target_arch = "x86_64")]
            Self::W512 => &x86_64::w512::KERNELS,
            // probe() never reports more than 128 bits on aarch64.
            #[cfg(target_arch = "aarch64")]
            Self::W128 | Self::W256 | Self::W512 => &aarch64::w128::KERNELS,
            #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
            Self::W128 | Self::W256 | Self::W512 => &scalar::KERNELS,
        }
    }
}

/// Compute the dot product of `a` and `b`.
///
/// *Panics* if `a` and `b` are not the same length.
#[inline]
pub fn dot(a: &[f32], b: &[f32], width: InstructionSet) -> f32 {
    assert_eq!(a.len(), b.len());
    let kernels = LanePath::select(a.len(), width).kernels();
    // SAFETY: select() only returns paths whose features were probed.
    unsafe { (kernels.dot)(a, b) }
}

/// Compute the squared l2 distance between `a` and `b`.
///
/// *Panics* if `a` and `b` are not the same length.
#[inline]
pub fn l2sq(a: &[f32], b: &[f32], width: InstructionSet) -> f32 {
    assert_eq!(a.len(), b.len());
    let kernels = LanePath::select(a.len(), width).kernels();
    // SAFETY: select() only returns paths whose features were probed.
    unsafe { (kernels.l2sq)(a, b) }
}

/// Compute the l2 norm of `vector`.
pub fn l2_norm(vector: impl AsRef<[f32]>, width: InstructionSet) -> f32 {
    let v = vector.as_ref();
    dot(v, v, width).sqrt()
}

/// Normalize the contents of vector in l2 space.
///
/// May return the input vector if it is already normalized.
pub fn l2_normalize<'a>(vector: impl Into<Cow<'a, [f32]>>, width: InstructionSet) -> Cow<'a, [f32]> {
    let mut vector: Cow<'a, [f32]> = vector.into();
    let norm = l2_norm(&vector, width);
    if norm != 1.0 && norm != 0.0 {
        let norm_inv = norm.recip();
        for d in vector.to_mut().iter_mut() {
            *d *= norm_inv;
        }
    }
    vector
}
