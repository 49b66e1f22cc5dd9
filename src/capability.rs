//! Detect the widest vector instruction set available to this process.
//!
//! The probe runs once and is cached for the lifetime of the process. Every kernel in this crate
//! accepts a requested [`InstructionSet`] and degrades it to the probed one, so callers may ask
//! for `Width512` on any machine and still receive correct results.

use std::{fmt, io, str::FromStr, sync::OnceLock};

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Vector register width used by a kernel.
///
/// Ordered from narrowest to widest; a wider rung implies every narrower one is available.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum InstructionSet {
    /// Plain scalar loops, no vector registers.
    Scalar,
    /// SSE on x86_64, NEON on aarch64.
    Width128,
    /// AVX2 and FMA.
    Width256,
    /// AVX-512 with the F, CD, BW, DQ and VL extensions.
    Width512,
}

impl InstructionSet {
    /// Number of `f32` lanes in a register of this width.
    pub fn lanes_f32(self) -> usize {
        match self {
            Self::Scalar => 1,
            Self::Width128 => 4,
            Self::Width256 => 8,
            Self::Width512 => 16,
        }
    }

    /// Register width in bits, or zero for scalar.
    pub fn bits(self) -> usize {
        match self {
            Self::Scalar => 0,
            Self::Width128 => 128,
            Self::Width256 => 256,
            Self::Width512 => 512,
        }
    }

    /// Map a requested bit width onto the widest rung that does not exceed it.
    pub fn from_bits(bits: usize) -> Self {
        match bits {
            b if b >= 512 => Self::Width512,
            b if b >= 256 => Self::Width256,
            b if b >= 128 => Self::Width128,
            _ => Self::Scalar,
        }
    }

    /// Degrade this width to the best one supported by the host that is not wider.
    #[inline]
    pub fn clamp(self) -> Self {
        self.min(probe())
    }

    /// Return true if this width is supported by the host.
    pub fn is_supported(self) -> bool {
        self <= probe()
    }
}

impl Default for InstructionSet {
    fn default() -> Self {
        probe()
    }
}

impl FromStr for InstructionSet {
    type Err = io::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scalar" | "0" => Ok(Self::Scalar),
            "128" => Ok(Self::Width128),
            "256" => Ok(Self::Width256),
            "512" => Ok(Self::Width512),
            x => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unknown instruction set width {x}"),
            )),
        }
    }
}

impl fmt::Display for InstructionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scalar => write!(f, "scalar"),
            w => write!(f, "{}", w.bits()),
        }
    }
}

static PROBED: OnceLock<InstructionSet> = OnceLock::new();

/// Return the widest instruction set supported by this process.
///
/// Detection happens on first call; later calls return the cached value.
pub fn probe() -> InstructionSet {
    *PROBED.get_or_init(|| {
        let inst = detect();
        debug!(?inst, "probed vector instruction set");
        inst
    })
}

/// Returns true if the host supports the full 512-bit kernel set.
pub fn check_compatibility() -> bool {
    probe() == InstructionSet::Width512
}

#[cfg(target_arch = "x86_64")]
fn detect() -> InstructionSet {
    use std::arch::is_x86_feature_detected;

    if is_x86_feature_detected!("avx512f")
        && is_x86_feature_detected!("avx512cd")
        && is_x86_feature_detected!("avx512bw")
        && is_x86_feature_detected!("avx512dq")
        && is_x86_feature_detected!("avx512vl")
        && is_x86_feature_detected!("avx2")
        && is_x86_feature_detected!("fma")
    {
        InstructionSet::Width512
    } else if is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma") {
        InstructionSet::Width256
    } else if is_x86_feature_detected!("sse3") {
        InstructionSet::Width128
    } else {
        InstructionSet::Scalar
    }
}

#[cfg(target_arch = "aarch64")]
fn detect() -> InstructionSet {
    if std::arch::is_aarch64_feature_detected!("neon") {
        InstructionSet::Width128
    } else {
        InstructionSet::Scalar
    }
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn detect() -> InstructionSet {
    InstructionSet::Scalar
}

#[cfg(test)]
mod test {
    use super::{InstructionSet, check_compatibility, probe};

    #[test]
    fn probe_is_stable() {
        assert_eq!(probe(), probe());
        assert_eq!(check_compatibility(), probe() == InstructionSet::Width512);
    }

    #[test]
    fn clamp_never_widens() {
        for w in [
            InstructionSet::Scalar,
            InstructionSet::Width128,
            InstructionSet::Width256,
            InstructionSet::Width512,
        ] {
            assert!(w.clamp() <= w);
            assert!(w.clamp() <= probe());
            assert!(w.clamp().is_supported());
        }
        assert_eq!(InstructionSet::Scalar.clamp(), InstructionSet::Scalar);
    }

    #[test]
    fn from_bits() {
        assert_eq!(InstructionSet::from_bits(0), InstructionSet::Scalar);
        assert_eq!(InstructionSet::from_bits(64), InstructionSet::Scalar);
        assert_eq!(InstructionSet::from_bits(128), InstructionSet::Width128);
        assert_eq!(InstructionSet::from_bits(300), InstructionSet::Width256);
        assert_eq!(InstructionSet::from_bits(1024), InstructionSet::Width512);
    }

    #[test]
    fn parse() {
        assert_eq!(
            "512".parse::<InstructionSet>().unwrap(),
            InstructionSet::Width512
        );
        assert_eq!(
            "scalar".parse::<InstructionSet>().unwrap(),
            InstructionSet::Scalar
        );
        assert!("64".parse::<InstructionSet>().is_err());
        assert_eq!(InstructionSet::Width256.to_string(), "256");
    }
}
