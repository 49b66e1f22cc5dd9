//! Binary selection tree over per-lane candidates.
//!
//! A lookup into a 256 entry row is answered by first reading every lane from four 64 entry
//! windows and then choosing one window per lane using the two high bits of the lane's index.
//! [`select_tree`] performs that choice for any blendable value and any power of two number of
//! candidates, so the vector kernels and the portable kernel share one implementation.

/// A value that can be merged lane-wise from two sources under a mask.
pub trait Blend: Copy {
    type Mask: Copy;

    /// Returns `b` in lanes where `mask` is set and `a` elsewhere.
    fn blend(mask: Self::Mask, a: Self, b: Self) -> Self;
}

/// Select one of `N` candidates per lane.
///
/// `masks[i]` holds bit `i` of each lane's selector, so a lane whose selector is `k` receives
/// lane values from `candidates[k]`. Level `i` of the tree blends adjacent pairs under
/// `masks[i]`, halving the number of candidates.
///
/// `N` must equal `1 << masks.len()`.
#[inline(always)]
pub fn select_tree<B: Blend, const N: usize>(mut candidates: [B; N], masks: &[B::Mask]) -> B {
    debug_assert_eq!(1usize << masks.len(), N);
    let mut live = N;
    for mask in masks {
        live /= 2;
        for i in 0..live {
            candidates[i] = B::blend(*mask, candidates[2 * i], candidates[2 * i + 1]);
        }
    }
    candidates[0]
}

/// `L` lanes held in an array, with one mask bit per lane.
impl<T: Copy, const L: usize> Blend for [T; L] {
    type Mask = u64;

    #[inline(always)]
    fn blend(mask: u64, a: Self, b: Self) -> Self {
        debug_assert!(L <= 64);
        std::array::from_fn(|i| if mask & (1 << i) != 0 { b[i] } else { a[i] })
    }
}

/// A single lane.
#[derive(Clone, Copy, Debug, PartialEq)]
struct Lane<T>(T);

impl<T: Copy> Blend for Lane<T> {
    type Mask = bool;

    #[inline(always)]
    fn blend(mask: bool, a: Self, b: Self) -> Self {
        if mask { b } else { a }
    }
}

/// Choose `candidates[selector]` with the selection tree.
///
/// *Panics* if `selector >= N` or `N` is not a power of two.
pub fn select<T: Copy, const N: usize>(candidates: [T; N], selector: usize) -> T {
    assert!(N.is_power_of_two() && selector < N);
    let bits = N.trailing_zeros() as usize;
    let masks = (0..bits).map(|b| selector & (1 << b) != 0).collect::<Vec<_>>();
    select_tree(candidates.map(Lane), &masks).0
}

/// Build a lane mask from bit `bit` of each lane's selector.
#[inline(always)]
pub fn bit_mask<const L: usize>(selectors: &[u8; L], bit: u32) -> u64 {
    selectors
        .iter()
        .enumerate()
        .fold(0u64, |m, (i, s)| m | ((((*s >> bit) & 1) as u64) << i))
}

#[cfg(test)]
mod test {
    use super::{bit_mask, select, select_tree};

    #[test]
    fn select_every_index() {
        let candidates = [10, 11, 12, 13, 14, 15, 16, 17];
        for k in 0..8 {
            assert_eq!(select(candidates, k), 10 + k);
        }
        assert_eq!(select([7], 0), 7);
        assert_eq!(select(['a', 'b'], 1), 'b');
    }

    #[test]
    #[should_panic]
    fn select_out_of_range() {
        select([1, 2, 3, 4], 4);
    }

    #[test]
    fn lanes_select_independently() {
        let selectors: [u8; 8] = [0, 1, 2, 3, 3, 2, 1, 0];
        let candidates: [[u16; 8]; 4] = std::array::from_fn(|w| [w as u16 * 100; 8]);
        let masks = [bit_mask(&selectors, 0), bit_mask(&selectors, 1)];
        assert_eq!(
            select_tree(candidates, &masks),
            [0, 100, 200, 300, 300, 200, 100, 0]
        );
    }

    #[test]
    fn high_bits() {
        let selectors: [u8; 4] = [0x00, 0x40, 0x80, 0xC0];
        assert_eq!(bit_mask(&selectors, 6), 0b1010);
        assert_eq!(bit_mask(&selectors, 7), 0b1100);
    }
}
